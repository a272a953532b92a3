//! Decode session: one authenticated context against the remote decoder,
//! reused across files.
//!
//! Each file walks a fixed state machine:
//!
//! ```text
//! Idle → Navigated → Uploaded → Submitted → ResultsVisible → LinkResolved → Downloaded → Relocated
//! ```
//!
//! Any step may fail; the failure is captured with the last state reached and
//! returned as a [`FileOutcome`], never propagated. Only login problems are
//! session-fatal ([`SessionError`]).
//!
//! The remote UI is located through ordered matcher tables (first hit wins) so
//! selector drift is fixed by editing data, not control flow.

use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::core::inventory::FileRecord;
use crate::core::remote::{
    FormSubmission, Page, Remote, RemoteError, describe_element, enclosing_form,
};
use crate::infra::config::Config;
use crate::infra::io::{move_file, read_prefix};
use crate::infra::utils::Pause;

/// Element predicate used in the ordered lookup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    /// Plain CSS selector
    Css(&'static str),
    /// CSS selector whose text contains the needle, ignoring ASCII case
    TextContains(&'static str, &'static str),
    /// CSS selector whose attribute equals the value, ignoring ASCII case
    AttrEq(&'static str, &'static str, &'static str),
    /// CSS selector whose attribute contains the needle
    AttrContains(&'static str, &'static str, &'static str),
}

impl Matcher {
    fn css(&self) -> &'static str {
        match *self {
            Matcher::Css(c)
            | Matcher::TextContains(c, _)
            | Matcher::AttrEq(c, _, _)
            | Matcher::AttrContains(c, _, _) => c,
        }
    }

    fn accepts(&self, el: ElementRef<'_>) -> bool {
        match *self {
            Matcher::Css(_) => true,
            Matcher::TextContains(_, needle) => el
                .text()
                .collect::<String>()
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            Matcher::AttrEq(_, attr, value) => el
                .value()
                .attr(attr)
                .is_some_and(|v| v.eq_ignore_ascii_case(value)),
            Matcher::AttrContains(_, attr, needle) => {
                el.value().attr(attr).is_some_and(|v| v.contains(needle))
            }
        }
    }

    /// First element under `scope` satisfying this matcher.
    pub fn find_in<'a>(&self, scope: ElementRef<'a>) -> Option<ElementRef<'a>> {
        let selector = match Selector::parse(self.css()) {
            Ok(s) => s,
            Err(e) => {
                debug!(selector = self.css(), error = ?e, "unparseable selector skipped");
                return None;
            }
        };
        scope.select(&selector).find(|el| self.accepts(*el))
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Css(c) => write!(f, "{c}"),
            Matcher::TextContains(c, t) => write!(f, "{c} (text ~ {t:?})"),
            Matcher::AttrEq(c, a, v) => write!(f, "{c} ({a} = {v:?})"),
            Matcher::AttrContains(c, a, v) => write!(f, "{c} ({a} ∋ {v:?})"),
        }
    }
}

/// First hit across `table`, tried in order.
pub fn first_match<'a>(
    table: &[Matcher],
    scope: ElementRef<'a>,
) -> Option<(Matcher, ElementRef<'a>)> {
    table
        .iter()
        .find_map(|m| m.find_in(scope).map(|el| (*m, el)))
}

fn first_in_doc<'a>(table: &[Matcher], doc: &'a Html) -> Option<(Matcher, ElementRef<'a>)> {
    first_match(table, doc.root_element())
}

pub const USERNAME_FIELD: &[Matcher] = &[
    Matcher::Css(r#"input[name="email"]"#),
    Matcher::Css(r#"input[name="username"]"#),
    Matcher::Css(r#"input[name="user"]"#),
    Matcher::Css(r#"input[name="login"]"#),
    Matcher::Css(r#"input[type="email"]"#),
    Matcher::Css(r#"input[type="text"]"#),
];

pub const PASSWORD_FIELD: &[Matcher] = &[
    Matcher::Css(r#"input[name="password"]"#),
    Matcher::Css(r#"input[name="pass"]"#),
    Matcher::Css(r#"input[type="password"]"#),
];

pub const LOGIN_SUBMIT: &[Matcher] = &[
    Matcher::Css(r#"button[type="submit"]"#),
    Matcher::Css(r#"input[type="submit"]"#),
    Matcher::TextContains("button", "login"),
    Matcher::AttrEq("input", "value", "login"),
    Matcher::Css(".btn-primary"),
    Matcher::Css("button.btn"),
];

pub const FILE_INPUT: &[Matcher] = &[
    Matcher::Css(r#"form[enctype="multipart/form-data"] input[type="file"]"#),
    Matcher::Css(r#"input[type="file"]"#),
];

pub const DECODE_SUBMIT: &[Matcher] = &[
    Matcher::Css(r#"input[value="Decode"]"#),
    Matcher::Css(r#"input[name="submit"]"#),
    Matcher::Css(r#"form[enctype="multipart/form-data"] input[type="submit"]"#),
    Matcher::Css(r#"input.btn-primary[type="submit"]"#),
    Matcher::Css(r#"input[type="submit"]"#),
];

pub const RESULTS_TABLE: &[Matcher] = &[Matcher::Css("table.table-bordered")];

pub const DOWNLOAD_LINK: &[Matcher] =
    &[Matcher::AttrContains(r#"a[href*="download"]"#, "href", "download?id=")];

/// Per-file progress through the remote interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    Navigated,
    Uploaded,
    Submitted,
    ResultsVisible,
    LinkResolved,
    Downloaded,
    Relocated,
}

impl fmt::Display for DecodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a single file failed; scoped to that file.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decoder page not ready: {0}")]
    Navigation(#[source] RemoteError),

    #[error("no file input on decoder page")]
    NoFileInput,

    #[error("upload form unusable: {0}")]
    UploadForm(String),

    #[error("no submit control on decoder page")]
    NoSubmitControl,

    #[error("submitting upload failed: {0}")]
    Submit(#[source] RemoteError),

    #[error("results table did not appear within {0:?}")]
    ResultsTimeout(Duration),

    #[error("polling for results failed: {0}")]
    Poll(#[source] RemoteError),

    #[error("no download link in results table")]
    NoDownloadLink,

    #[error("download failed: {0}")]
    Download(#[source] RemoteError),

    #[error("downloaded file is empty")]
    EmptyDownload,

    #[error("response is not a file download: {0}")]
    NotADownload(String),

    #[error("staged file vanished: {0}")]
    StagedFileVanished(PathBuf),

    #[error("moving into destination failed: {0}")]
    Relocate(String),
}

/// A failed file: the last state it reached and the error that stopped it.
#[derive(Debug)]
pub struct DecodeFailure {
    pub state: DecodeState,
    pub error: DecodeError,
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (reached {})", self.error, self.state)
    }
}

/// Result of one file through the session.
#[derive(Debug)]
pub enum FileOutcome {
    /// Written to this destination path
    Decoded(PathBuf),
    Failed(DecodeFailure),
}

impl FileOutcome {
    pub fn is_decoded(&self) -> bool {
        matches!(self, FileOutcome::Decoded(_))
    }
}

/// Errors that end the whole session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("remote settings missing: {}", .0.join(", "))]
    MissingConfig(Vec<&'static str>),

    #[error("invalid {what} URL {url:?}: {reason}")]
    BadUrl {
        what: &'static str,
        url: String,
        reason: String,
    },

    #[error("HTTP client setup failed: {0}")]
    Client(#[source] RemoteError),

    #[error("login page unreachable: {0}")]
    LoginUnreachable(#[source] RemoteError),

    #[error("login form incomplete: {0}")]
    NoLoginForm(String),

    #[error("login submit failed: {0}")]
    LoginSubmit(#[source] RemoteError),

    #[error("credentials rejected (login form shown again)")]
    Rejected,
}

/// Anything that turns an encoded file into an outcome; the batch driver's view of a session.
pub trait Decoder {
    fn decode(&mut self, file: &FileRecord) -> FileOutcome;
}

/// Authenticated session over a [`Remote`].
pub struct DecodeSession<'a, R: Remote> {
    cfg: &'a Config,
    remote: R,
    decoder_url: Url,
}

fn parse_url(what: &'static str, raw: &str) -> Result<Url, SessionError> {
    Url::parse(raw.trim()).map_err(|e| SessionError::BadUrl {
        what,
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

impl<'a, R: Remote> DecodeSession<'a, R> {
    /// Log in once; the returned session reuses that context for every file.
    pub fn open(cfg: &'a Config, mut remote: R) -> Result<Self, SessionError> {
        let missing = cfg.remote.missing_fields();
        if !missing.is_empty() {
            return Err(SessionError::MissingConfig(missing));
        }
        let login_url = parse_url("login", &cfg.remote.login_url)?;
        let decoder_url = parse_url("decoder", &cfg.remote.decoder_url)?;
        let timeout = cfg.tuning.login_timeout();

        info!(url = %login_url, "logging in");
        let page = remote
            .fetch(&login_url, timeout)
            .map_err(SessionError::LoginUnreachable)?;

        let form = login_submission(&page, &cfg.remote.username, &cfg.remote.password)?;
        let landed = remote
            .submit(&form, timeout)
            .map_err(SessionError::LoginSubmit)?;

        if first_in_doc(PASSWORD_FIELD, &landed.document()).is_some() {
            return Err(SessionError::Rejected);
        }
        info!(url = %landed.url, "login successful");

        Ok(Self {
            cfg,
            remote,
            decoder_url,
        })
    }

    /// One pass through the state machine; `state` tracks the last step reached.
    fn attempt(&mut self, file: &FileRecord, state: &mut DecodeState) -> Result<PathBuf, DecodeError> {
        let key = file.key();
        let tuning = &self.cfg.tuning;

        // Navigated
        let page = self
            .remote
            .fetch(&self.decoder_url, tuning.page_timeout())
            .map_err(DecodeError::Navigation)?;
        advance(state, DecodeState::Navigated, &key);

        // Uploaded
        let (form, submit_label) = {
            let doc = page.document();
            let (hit, input) = first_in_doc(FILE_INPUT, &doc).ok_or(DecodeError::NoFileInput)?;
            let name = input
                .value()
                .attr("name")
                .filter(|n| !n.is_empty())
                .ok_or_else(|| DecodeError::UploadForm("file input has no name".into()))?;
            debug!(file = %key, matcher = %hit, input = name, "file input found");

            let mut form = FormSubmission::enclosing(&page, input)
                .map_err(|e| DecodeError::UploadForm(e.to_string()))?;
            form.attach(name, &file.full_path);

            // Prefer the control that submits the upload form itself
            let (hit, control) = enclosing_form(input)
                .and_then(|f| first_match(DECODE_SUBMIT, f))
                .or_else(|| first_in_doc(DECODE_SUBMIT, &doc))
                .ok_or(DecodeError::NoSubmitControl)?;
            form.activate(control);
            (form, format!("{hit} → {}", describe_element(control)))
        };
        advance(state, DecodeState::Uploaded, &key);

        // Submitted
        let started = Instant::now();
        debug!(file = %key, control = %submit_label, "submitting");
        let mut page = self
            .remote
            .submit(&form, tuning.results_timeout())
            .map_err(DecodeError::Submit)?;
        advance(state, DecodeState::Submitted, &key);

        // ResultsVisible: poll until the table renders or the deadline passes
        let deadline = started + tuning.results_timeout();
        while first_in_doc(RESULTS_TABLE, &page.document()).is_none() {
            let now = Instant::now();
            if now >= deadline {
                return Err(DecodeError::ResultsTimeout(tuning.results_timeout()));
            }
            Pause::for_duration(tuning.poll_interval().min(deadline - now));
            let url = page.url.clone();
            page = self
                .remote
                .fetch(&url, tuning.page_timeout())
                .map_err(DecodeError::Poll)?;
        }
        advance(state, DecodeState::ResultsVisible, &key);

        // LinkResolved
        let link = download_link(&page).ok_or(DecodeError::NoDownloadLink)?;
        debug!(file = %key, link = %link, "download link found");
        advance(state, DecodeState::LinkResolved, &key);

        // Downloaded
        let staged = staging_path(&self.cfg.paths.staging_dir, file);
        std::fs::create_dir_all(&self.cfg.paths.staging_dir)
            .map_err(|e| DecodeError::Download(RemoteError::Io(e)))?;
        let bytes = match self
            .remote
            .download(&link, &staged, tuning.download_timeout())
        {
            Ok(n) => n,
            Err(RemoteError::NotADownload { content_type, .. }) => {
                let _ = std::fs::remove_file(&staged);
                return Err(DecodeError::NotADownload(content_type));
            }
            Err(e) => {
                let _ = std::fs::remove_file(&staged);
                return Err(DecodeError::Download(e));
            }
        };
        if bytes == 0 {
            let _ = std::fs::remove_file(&staged);
            return Err(DecodeError::EmptyDownload);
        }
        if looks_like_html(&staged) {
            let _ = std::fs::remove_file(&staged);
            return Err(DecodeError::NotADownload("HTML page body".into()));
        }
        advance(state, DecodeState::Downloaded, &key);

        // Relocated
        if !staged.exists() {
            return Err(DecodeError::StagedFileVanished(staged));
        }
        let dest = file.dest_path(&self.cfg.paths.dest_dir);
        if let Err(e) = move_file(&staged, &dest) {
            let _ = std::fs::remove_file(&staged);
            return Err(DecodeError::Relocate(format!("{e:#}")));
        }
        advance(state, DecodeState::Relocated, &key);

        Ok(dest)
    }
}

impl<R: Remote> Decoder for DecodeSession<'_, R> {
    /// Up to `max_retries` attempts; each restarts from `Idle`.
    fn decode(&mut self, file: &FileRecord) -> FileOutcome {
        let key = file.key();
        let attempts = self.cfg.tuning.attempts();

        let mut attempt = 1;
        loop {
            let mut state = DecodeState::Idle;
            match self.attempt(file, &mut state) {
                Ok(dest) => return FileOutcome::Decoded(dest),
                Err(error) => {
                    let failure = DecodeFailure { state, error };
                    warn!(file = %key, attempt, attempts, "decode attempt failed: {failure}");
                    if attempt >= attempts {
                        return FileOutcome::Failed(failure);
                    }
                }
            }
            attempt += 1;
            Pause::for_duration(self.cfg.tuning.retry_backoff());
        }
    }
}

fn advance(state: &mut DecodeState, next: DecodeState, key: &str) {
    debug!(file = key, from = %state, to = %next, "decode state");
    *state = next;
}

/// The login form filled with credentials, ready to submit.
fn login_submission(page: &Page, username: &str, password: &str) -> Result<FormSubmission, SessionError> {
    let doc = page.document();

    let (_, pw) = first_in_doc(PASSWORD_FIELD, &doc)
        .ok_or_else(|| SessionError::NoLoginForm("no password field".into()))?;
    let form_el = enclosing_form(pw)
        .ok_or_else(|| SessionError::NoLoginForm("password field outside a form".into()))?;
    let (user_hit, user) = first_match(USERNAME_FIELD, form_el)
        .ok_or_else(|| SessionError::NoLoginForm("no username field".into()))?;

    let user_name = named(user, "username")?;
    let pw_name = named(pw, "password")?;
    debug!(username_field = %user_hit, "login fields found");

    let mut form = FormSubmission::from_form(page, form_el)
        .map_err(|e| SessionError::NoLoginForm(e.to_string()))?;
    form.set(user_name, username);
    form.set(pw_name, password);

    match first_match(LOGIN_SUBMIT, form_el) {
        Some((hit, control)) => {
            debug!(control = %hit, "login submit found");
            form.activate(control);
        }
        // Implicit submission, as pressing Enter in the password field would
        None => debug!("no login submit control; submitting form directly"),
    }
    Ok(form)
}

fn named<'a>(el: ElementRef<'a>, what: &str) -> Result<&'a str, SessionError> {
    el.value()
        .attr("name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| SessionError::NoLoginForm(format!("{what} field has no name")))
}

/// First `download?id=` anchor inside the results table, resolved to an absolute URL.
fn download_link(page: &Page) -> Option<Url> {
    let doc = page.document();
    let (_, table) = first_in_doc(RESULTS_TABLE, &doc)?;
    let (_, anchor) = first_match(DOWNLOAD_LINK, table)?;
    page.resolve(anchor.value().attr("href")?).ok()
}

/// A rendered page (login, error) served where a file was expected:
/// an HTML document with no PHP open tag in its first 4 KiB.
fn looks_like_html(staged: &Path) -> bool {
    let Ok(prefix) = read_prefix(staged, 4096) else {
        return false;
    };
    let text = String::from_utf8_lossy(&prefix);
    let head = text.trim_start_matches('\u{feff}').trim_start().to_ascii_lowercase();
    (head.starts_with("<!doctype html") || head.starts_with("<html")) && !head.contains("<?")
}

/// `staging/temp_<millis>_<fileName>`
fn staging_path(staging_dir: &Path, file: &FileRecord) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let mut name = std::ffi::OsString::from(format!("temp_{millis}_"));
    name.push(&file.file_name);
    staging_dir.join(name)
}
