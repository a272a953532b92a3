//! Shared test utilities for integration tests
//!
//! Source-tree fixtures, a quiet configuration rooted in a temp dir,
//! and a scripted in-memory decoding service.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use assert_fs::prelude::*;
use reqwest::Url;
use unshroud::cli::AppContext;
use unshroud::core::remote::{FormSubmission, Page, Remote, RemoteError};
use unshroud::infra::config::Config;

pub const LOGIN_HTML: &str = r#"<html><body>
  <form method="post" action="/login">
    <input type="hidden" name="_token" value="abc">
    <input type="email" name="email">
    <input type="password" name="password">
    <button type="submit">Sign in</button>
  </form></body></html>"#;

pub const DASHBOARD_HTML: &str = "<html><body><p>Dashboard</p></body></html>";

pub const DECODER_HTML: &str = r#"<html><body>
  <form method="post" enctype="multipart/form-data" action="/decoder/run">
    <input type="file" name="upload[]">
    <input type="submit" value="Decode" class="btn btn-primary">
  </form></body></html>"#;

pub const RESULTS_HTML: &str = r#"<html><body>
  <table class="table table-bordered">
    <tr><td>done</td><td><a href="/download?id=42">Download</a></td></tr>
  </table></body></html>"#;

/// Bytes that classify as encoded (header marker plus binary noise)
pub fn encoded_body() -> Vec<u8>
{
    let mut body = b"<?php //0046a\n".to_vec();
    body.extend([0u8, 1, 2, 3, 0x7f, 0x10, 0x11]);
    body
}

/// Source tree under `code/` with:
/// - `index.php` plain
/// - `a.php`, `lib/b.php` encoded
/// - `assets/app.css`, `assets/logo.bin` non-PHP
/// - `cache/empty/` an empty directory
pub fn make_source_tree() -> assert_fs::TempDir
{
    let tmp = assert_fs::TempDir::new().expect("tempdir");
    let code = tmp.child("code");

    code.child("index.php")
        .write_str("<?php\nfunction main() { return array(1, 2); }\n")
        .expect("write index");
    code.child("a.php")
        .write_binary(&encoded_body())
        .expect("write a");
    code.child("lib/b.php")
        .write_binary(&encoded_body())
        .expect("write b");
    code.child("assets/app.css")
        .write_str("body { margin: 0 }\n")
        .expect("write css");
    code.child("assets/logo.bin")
        .write_binary(&[0x89, 0x50, 0x4e, 0x47])
        .expect("write logo");
    code.child("cache/empty")
        .create_dir_all()
        .expect("mkdir");

    tmp
}

/// Configuration with every path inside `root` and no waiting
pub fn test_config(root: &Path) -> Config
{
    let mut cfg = Config::default();
    cfg.paths.source_dir = root.join("code");
    cfg.paths.dest_dir = root.join("source");
    cfg.paths.staging_dir = root.join("staging");
    cfg.paths.ledger_file = root.join("decode_progress.json");
    cfg.paths.report_file = root.join("missing_files_report.json");
    cfg.remote.login_url = "https://decoder.test/login".into();
    cfg.remote.decoder_url = "https://decoder.test/decoder".into();
    cfg.remote.username = "user@example.com".into();
    cfg.remote.password = "hunter2".into();
    cfg.tuning.max_retries = 1;
    cfg.tuning.delay_between_files_ms = 0;
    cfg.tuning.retry_backoff_ms = 0;
    cfg.tuning.poll_interval_ms = 0;
    cfg.tuning.results_timeout_secs = 0;
    cfg
}

pub fn quiet() -> AppContext
{
    AppContext {
        quiet: true,
        ..AppContext::default()
    }
}

/// What the service saw, shared with the test after the remote is moved
#[derive(Debug, Default)]
pub struct ServiceLog
{
    pub logins: usize,
    pub uploads: Vec<String>,
}

/// In-memory decoding service. Uploads whose file name is in `fail` time out;
/// downloads return `<?php // decoded NAME`, or the login page for names in `expired`.
pub struct ScriptedRemote
{
    fail: HashSet<String>,
    expired: HashSet<String>,
    pending: Option<String>,
    pub log: Rc<RefCell<ServiceLog>>,
}

impl ScriptedRemote
{
    pub fn new(fail: &[&str]) -> Self
    {
        Self {
            fail: fail
                .iter()
                .map(|s| s.to_string())
                .collect(),
            expired: HashSet::new(),
            pending: None,
            log: Rc::default(),
        }
    }

    /// Serve the login page instead of the decoded file for `names`
    pub fn session_expires_for(
        mut self,
        names: &[&str],
    ) -> Self
    {
        self.expired = names
            .iter()
            .map(|s| s.to_string())
            .collect();
        self
    }
}

fn file_name(p: &Path) -> String
{
    p.file_name()
        .map(|n| {
            n.to_string_lossy()
                .into_owned()
        })
        .unwrap_or_default()
}

impl Remote for ScriptedRemote
{
    fn fetch(
        &mut self,
        url: &Url,
        _timeout: Duration,
    ) -> Result<Page, RemoteError>
    {
        let html = match url.path()
        {
            "/login" => LOGIN_HTML,
            "/decoder" => DECODER_HTML,
            _ => DASHBOARD_HTML,
        };
        Ok(Page::new(url.clone(), html))
    }

    fn submit(
        &mut self,
        form: &FormSubmission,
        _timeout: Duration,
    ) -> Result<Page, RemoteError>
    {
        if form
            .action
            .path()
            == "/login"
        {
            self.log
                .borrow_mut()
                .logins += 1;
            return Ok(Page::new(form.action.clone(), DASHBOARD_HTML));
        }

        let name = form
            .files
            .first()
            .map(|(_, p)| file_name(p))
            .unwrap_or_default();
        self.log
            .borrow_mut()
            .uploads
            .push(name.clone());

        if self
            .fail
            .contains(&name)
        {
            return Err(RemoteError::Timeout {
                what: form
                    .action
                    .to_string(),
                after: Duration::ZERO,
            });
        }
        self.pending = Some(name);
        Ok(Page::new(form.action.clone(), RESULTS_HTML))
    }

    fn download(
        &mut self,
        _url: &Url,
        dest: &Path,
        _timeout: Duration,
    ) -> Result<u64, RemoteError>
    {
        let name = self
            .pending
            .take()
            .unwrap_or_default();
        let body = if self
            .expired
            .contains(&name)
        {
            format!("<!DOCTYPE html>\n{LOGIN_HTML}")
        }
        else
        {
            format!("<?php // decoded {name}\n")
        };
        std::fs::write(dest, &body)?;
        Ok(body.len() as u64)
    }
}
