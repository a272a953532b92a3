use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

/// Read at most `limit` bytes from the start of `path`.
/// Files shorter than `limit` are returned in full.
pub fn read_prefix(path: &Path, limit: usize) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut buf = Vec::with_capacity(limit);
    file.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Replace `path` with `bytes` via temp file + fsync + rename.
/// Readers never observe a half-written document.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create dir: {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.as_file().sync_all().ok();
    tmp.persist(path)
        .with_context(|| format!("rename temp file over {}", path.display()))?;

    // Durably record the rename.
    let _ = sync_dir(parent);
    Ok(())
}

/// Copy `src` to `dst`, creating destination directories. Overwrites `dst`.
/// The copy is staged beside `dst`, so a failed copy never leaves a truncated `dst`.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    ensure_parent(dst)?;
    copy_atomic(src, dst).with_context(|| format!("copy {} → {}", src.display(), dst.display()))
}

/// Move `src` to `dst`, creating destination directories.
/// Falls back to an atomic copy + remove when a plain rename is refused (e.g. across filesystems).
pub fn move_file(src: &Path, dst: &Path) -> Result<()> {
    ensure_parent(dst)?;
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::debug!(src = %src.display(), error = %rename_err, "rename refused, copying");
            copy_atomic(src, dst).map_err(|e| {
                e.context(format!("rename failed ({rename_err})"))
                    .context(format!("move {} → {}", src.display(), dst.display()))
            })?;
            fs::remove_file(src)
                .with_context(|| format!("remove staged file {}", src.display()))?;
            Ok(())
        }
    }
}

/// Temp file in `dst`'s directory, fsync, then rename over `dst`.
fn copy_atomic(src: &Path, dst: &Path) -> Result<u64> {
    let parent = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut input = File::open(src).with_context(|| format!("open {}", src.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    let n = io::copy(&mut input, tmp.as_file_mut())
        .with_context(|| format!("copy into {}", parent.display()))?;
    if let Ok(meta) = input.metadata() {
        // temp files start at 0600; keep the source's mode
        let _ = fs::set_permissions(tmp.path(), meta.permissions());
    }
    tmp.as_file().sync_all()?;
    tmp.persist(dst)
        .with_context(|| format!("rename temp file over {}", dst.display()))?;
    Ok(n)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    Ok(())
}

/// Cross-platform directory fsync helper.
#[cfg(unix)]
fn sync_dir(p: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let f = fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(p)?;
    f.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_p: &Path) -> std::io::Result<()> {
    // No reliable directory fsync outside unix; best-effort no-op.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_prefix_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("big.bin");
        fs::write(&p, vec![7u8; 10_000]).unwrap();

        assert_eq!(read_prefix(&p, 4096).unwrap().len(), 4096);

        let small = tmp.path().join("small.bin");
        fs::write(&small, b"abc").unwrap();
        assert_eq!(read_prefix(&small, 4096).unwrap(), b"abc");
    }

    #[test]
    fn write_atomic_creates_parents_and_replaces() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("nested/dir/doc.json");

        write_atomic(&p, b"{\"v\":1}").unwrap();
        write_atomic(&p, b"{\"v\":2}").unwrap();

        assert_eq!(fs::read_to_string(&p).unwrap(), "{\"v\":2}");
        // no stray temp files left next to the target
        assert_eq!(fs::read_dir(p.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn move_file_relocates_into_new_directories() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("staging/temp_1_a.php");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, "<?php echo 1;").unwrap();

        let dst = tmp.path().join("dest/app/a.php");
        move_file(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(dst).unwrap(), "<?php echo 1;");
    }

    #[test]
    fn failed_copy_leaves_no_destination() {
        let tmp = TempDir::new().unwrap();
        // a directory opens on unix but fails on read, like an I/O error mid-copy
        let src = tmp.path().join("not_a_file");
        fs::create_dir_all(&src).unwrap();
        let out = tmp.path().join("dest");
        fs::create_dir_all(&out).unwrap();

        assert!(copy_atomic(&src, &out.join("b.php")).is_err());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn copy_file_overwrites_whole_file() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.php");
        let dst = tmp.path().join("out/a.php");
        fs::write(&src, "<?php short").unwrap();
        fs::create_dir_all(dst.parent().unwrap()).unwrap();
        fs::write(&dst, "<?php a much longer previous body").unwrap();

        assert_eq!(copy_file(&src, &dst).unwrap(), 11);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "<?php short");
        assert_eq!(fs::read_dir(dst.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn move_file_missing_source_errors() {
        let tmp = TempDir::new().unwrap();
        let err = move_file(&tmp.path().join("gone"), &tmp.path().join("out/x")).unwrap_err();
        assert!(format!("{err:#}").contains("move"));
    }
}
