//! Filepath: src/infra/walk.rs
//! Deterministic tree walker for mirroring.
//! - Visits every file: .gitignore, hidden-file and other standard filters are off
//! - Extra exclude globs (early prune + late filter)
//! - Follows symlinks; broken links and loops surface as errors
//! - Any walk error is returned to the caller (no partial-tree recovery)
//!
//! Backed by ripgrep's `ignore` crate and `globset`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::{DirEntry, WalkBuilder};

/// Mirror walker with optional exclude globs.
/// Exclude globs match paths relative to the walked root and are applied in two places:
///   1) Early: prune directories during traversal (filter_entry).
///   2) Late: filter out files that still slipped through.
#[derive(Clone)]
pub struct FileWalker
{
    /// Compiled set of exclude patterns
    exclude: GlobSet,
}

impl FileWalker
{
    /// Build a walker with exclude patterns (e.g., ".git/**", "**/*.bak").
    pub fn new(excludes: &[String]) -> Result<Self>
    {
        let mut builder = GlobSetBuilder::new();

        for pattern in excludes
        {
            builder.add(
                Glob::new(pattern).with_context(|| format!("invalid exclude glob: {pattern}"))?,
            );
        }

        Ok(Self {
            exclude: builder.build()?,
        })
    }

    /// Internal: construct a configured WalkBuilder for `root`.
    fn build_walk(
        &self,
        root: &Path,
    ) -> WalkBuilder
    {
        let mut b = WalkBuilder::new(root);

        // A mirror copies everything; disable ignore files and hidden filtering.
        b.standard_filters(false);
        b.follow_links(true);
        b.sort_by_file_name(|a, b| a.cmp(b));

        let exclude = self
            .exclude
            .clone();
        let root_owned = root.to_path_buf();
        b.filter_entry(move |ent: &DirEntry| {
            let is_dir = ent
                .file_type()
                .is_some_and(|ft| ft.is_dir());
            if !is_dir
            {
                return true;
            }
            let rel = ent
                .path()
                .strip_prefix(&root_owned)
                .unwrap_or(ent.path());
            rel.as_os_str()
                .is_empty()
                || !exclude.is_match(rel)
        });

        b
    }

    /// Collect entries under `root` matching `keep`, failing on the first walk error.
    fn collect<F>(
        &self,
        root: &Path,
        keep: F,
    ) -> Result<Vec<PathBuf>>
    where
        F: Fn(&DirEntry) -> bool,
    {
        if !root.is_dir()
        {
            anyhow::bail!("not a directory: {}", root.display());
        }

        let mut out = Vec::new();

        for res in self
            .build_walk(root)
            .build()
        {
            let entry = res.with_context(|| format!("walk failed under {}", root.display()))?;

            // depth 0 is the root itself
            if entry.depth() == 0 || !keep(&entry)
            {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path());
            if self
                .exclude
                .is_match(rel)
            {
                continue;
            }

            out.push(entry.into_path());
        }

        // Deterministic order (stable CLI & tests)
        out.sort();

        Ok(out)
    }

    /// Every regular file under `root`, sorted.
    pub fn walk_files<P: AsRef<Path>>(
        &self,
        root: P,
    ) -> Result<Vec<PathBuf>>
    {
        self.collect(root.as_ref(), |e| {
            e.file_type()
                .is_some_and(|ft| ft.is_file())
        })
    }

    /// Every directory under `root` (excluding `root`), sorted parents-first.
    pub fn walk_dirs<P: AsRef<Path>>(
        &self,
        root: P,
    ) -> Result<Vec<PathBuf>>
    {
        self.collect(root.as_ref(), |e| {
            e.file_type()
                .is_some_and(|ft| ft.is_dir())
        })
    }
}

#[cfg(test)]
mod tests
{
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    /// Create a file with parent dirs as needed
    fn write_file(
        root: &Path,
        rel: &str,
        contents: &str,
    ) -> Result<()>
    {
        let path = root.join(rel);
        if let Some(parent) = path.parent()
        {
            std::fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    fn relative(
        root: &Path,
        files: Vec<PathBuf>,
    ) -> Vec<PathBuf>
    {
        files
            .into_iter()
            .map(|p| {
                p.strip_prefix(root)
                    .unwrap()
                    .to_path_buf()
            })
            .collect()
    }

    #[test]
    fn test_walks_everything_including_ignored_and_hidden() -> Result<()>
    {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        write_file(root, ".gitignore", "vendor/\n")?;
        write_file(root, ".htaccess", "deny from all")?;
        write_file(root, "vendor/lib.php", "<?php")?;
        write_file(root, "index.php", "<?php")?;

        let files = relative(root, FileWalker::new(&[])?.walk_files(root)?);

        assert_eq!(
            files,
            vec![
                PathBuf::from(".gitignore"),
                PathBuf::from(".htaccess"),
                PathBuf::from("index.php"),
                PathBuf::from("vendor/lib.php"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_exclude_globs_prune_and_filter() -> Result<()>
    {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        write_file(root, ".git/HEAD", "ref")?;
        write_file(root, "app/a.php", "<?php")?;
        write_file(root, "app/a.php.bak", "old")?;

        let walker = FileWalker::new(&[".git".to_string(), "**/*.bak".to_string()])?;
        let files = relative(root, walker.walk_files(root)?);

        assert_eq!(files, vec![PathBuf::from("app/a.php")]);
        Ok(())
    }

    #[test]
    fn test_walk_dirs_includes_empty_directories() -> Result<()>
    {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        fs::create_dir_all(root.join("cache/empty"))?;
        write_file(root, "lib/x.php", "<?php")?;

        let dirs = relative(root, FileWalker::new(&[])?.walk_dirs(root)?);

        assert_eq!(
            dirs,
            vec![
                PathBuf::from("cache"),
                PathBuf::from("cache/empty"),
                PathBuf::from("lib"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() -> Result<()>
    {
        let temp_dir = TempDir::new()?;
        let missing = temp_dir
            .path()
            .join("nope");

        assert!(
            FileWalker::new(&[])?
                .walk_files(&missing)
                .is_err()
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_symlink_is_fatal() -> Result<()>
    {
        use std::os::unix::fs::symlink;

        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write_file(root, "ok.php", "<?php")?;
        symlink(root.join("gone.php"), root.join("dangling.php"))?;

        assert!(
            FileWalker::new(&[])?
                .walk_files(root)
                .is_err()
        );
        Ok(())
    }
}
