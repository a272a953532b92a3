//! Remote service adapter: fetch pages, submit forms, download files.
//!
//! The decoding service has no API, only HTML forms and a results table. This
//! module treats it the way a browser would: pages are `{url, html}` snapshots,
//! forms are serialized from the DOM, and one cookie jar carries the
//! authenticated context across requests. `Remote` is the seam the decode
//! session drives; `HttpRemote` is the production implementation.

use reqwest::Url;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap, HeaderName};
use scraper::{ElementRef, Html, Selector};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("timed out after {after:?}: {what}")]
    Timeout { what: String, after: Duration },

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("invalid URL {url}: {reason}")]
    BadUrl { url: String, reason: String },

    #[error("{url} answered with a page ({content_type}), not a file")]
    NotADownload { url: String, content_type: String },

    #[error("no enclosing form for {0}")]
    NoForm(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A rendered page: final URL (after redirects) and its HTML.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: Url,
    pub html: String,
}

impl Page {
    pub fn new(url: Url, html: impl Into<String>) -> Self {
        Self {
            url,
            html: html.into(),
        }
    }

    pub fn document(&self) -> Html {
        Html::parse_document(&self.html)
    }

    /// Resolve an `href`/`action` relative to this page.
    pub fn resolve(&self, href: &str) -> Result<Url, RemoteError> {
        self.url.join(href).map_err(|e| RemoteError::BadUrl {
            url: href.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A form ready to send, serialized the way a browser submits it.
#[derive(Debug, Clone)]
pub struct FormSubmission {
    pub action: Url,
    pub method: Method,
    pub multipart: bool,
    pub fields: Vec<(String, String)>,
    pub files: Vec<(String, PathBuf)>,
}

impl FormSubmission {
    /// Serialize the form enclosing `control` on `page`.
    pub fn enclosing(page: &Page, control: ElementRef<'_>) -> Result<Self, RemoteError> {
        let form = enclosing_form(control)
            .ok_or_else(|| RemoteError::NoForm(describe_element(control)))?;
        Self::from_form(page, form)
    }

    /// Serialize `form`'s successful controls (no submit button yet).
    pub fn from_form(page: &Page, form: ElementRef<'_>) -> Result<Self, RemoteError> {
        let el = form.value();

        let action = match el.attr("action").map(str::trim) {
            Some(a) if !a.is_empty() => page.resolve(a)?,
            _ => page.url.clone(),
        };
        let method = match el.attr("method") {
            Some(m) if m.eq_ignore_ascii_case("post") => Method::Post,
            _ => Method::Get,
        };
        let multipart = el
            .attr("enctype")
            .is_some_and(|e| e.eq_ignore_ascii_case("multipart/form-data"));

        Ok(Self {
            action,
            method,
            multipart,
            fields: successful_controls(form),
            files: Vec::new(),
        })
    }

    /// Set `name` to `value`, replacing any prior value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.fields.retain(|(k, _)| k != name);
        self.fields.push((name.to_string(), value.to_string()));
    }

    /// Attach a local file to the file control `name`.
    pub fn attach(&mut self, name: &str, path: &Path) {
        self.files.retain(|(k, _)| k != name);
        self.files.push((name.to_string(), path.to_path_buf()));
    }

    /// Include the activated submit control's name/value, as a click would.
    pub fn activate(&mut self, control: ElementRef<'_>) {
        let el = control.value();
        if let Some(name) = el.attr("name").filter(|n| !n.is_empty()) {
            let value = el.attr("value").unwrap_or_default();
            self.set(name, value);
        }
    }
}

/// The adapter surface the decode session drives.
///
/// Every call carries its own timeout, so no interaction can hang indefinitely.
pub trait Remote {
    /// Load a page.
    fn fetch(&mut self, url: &Url, timeout: Duration) -> Result<Page, RemoteError>;

    /// Send a form and return the page it leads to.
    fn submit(&mut self, form: &FormSubmission, timeout: Duration) -> Result<Page, RemoteError>;

    /// Save the body at `url` to `dest`, returning the byte count.
    fn download(&mut self, url: &Url, dest: &Path, timeout: Duration) -> Result<u64, RemoteError> {
        let resp = self.client.get(url.clone()).timeout(timeout).send();
        let mut resp = checked(resp, url, timeout)?;
        if !is_file_download(resp.headers()) {
            return Err(RemoteError::NotADownload {
                url: resp.url().to_string(),
                content_type: header_str(resp.headers(), CONTENT_TYPE).unwrap_or("none").to_string(),
            });
        }

        // Partial transfers are dropped with the temp file
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut part = tempfile::Builder::new()
            .prefix(".part_")
            .tempfile_in(dir)?;
        let n = resp
            .copy_to(part.as_file_mut())
            .map_err(|e| transport_error(url, timeout, e))?;
        part.as_file().sync_all()?;
        part.persist(dest).map_err(|e| RemoteError::Io(e.error))?;
        Ok(n)
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// A response is a file when it is sent as an attachment or is not an HTML page.
fn is_file_download(headers: &HeaderMap) -> bool {
    let attachment = header_str(headers, CONTENT_DISPOSITION)
        .is_some_and(|d| d.trim_start().to_ascii_lowercase().starts_with("attachment"));
    if attachment {
        return true;
    }
    match header_str(headers, CONTENT_TYPE) {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            !(ct.starts_with("text/html") || ct.starts_with("application/xhtml"))
        }
        None => true,
    }
}

fn checked(
    resp: reqwest::Result<Response>,
    url: &Url,
    timeout: Duration,
) -> Result<Response, RemoteError> {
    let resp = resp.map_err(|e| transport_error(url, timeout, e))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(RemoteError::Status {
            status: status.as_u16(),
            url: resp.url().to_string(),
        });
    }
    Ok(resp)
}

fn transport_error(url: &Url, timeout: Duration, e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout {
            what: url.to_string(),
            after: timeout,
        }
    } else {
        RemoteError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

/// Nearest `<form>` ancestor of `el`.
pub fn enclosing_form(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "form")
}

/// Short `tag[name=..]` label for logs and errors.
pub fn describe_element(el: ElementRef<'_>) -> String {
    let v = el.value();
    match v.attr("name") {
        Some(n) => format!("{}[name={n}]", v.name()),
        None => v.name().to_string(),
    }
}

/// Name/value pairs a browser would send for `form`, excluding buttons and files.
fn successful_controls(form: ElementRef<'_>) -> Vec<(String, String)> {
    let Ok(controls) = Selector::parse("input, select, textarea") else {
        return Vec::new();
    };
    let Ok(options) = Selector::parse("option") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for ctl in form.select(&controls) {
        let el = ctl.value();
        let Some(name) = el.attr("name").filter(|n| !n.is_empty()) else {
            continue;
        };
        if el.attr("disabled").is_some() {
            continue;
        }

        match el.name() {
            "input" => {
                let kind = el.attr("type").unwrap_or("text").to_ascii_lowercase();
                match kind.as_str() {
                    "file" | "submit" | "button" | "reset" | "image" => {}
                    "checkbox" | "radio" => {
                        if el.attr("checked").is_some() {
                            out.push((name.to_string(), el.attr("value").unwrap_or("on").into()));
                        }
                    }
                    _ => out.push((name.to_string(), el.attr("value").unwrap_or_default().into())),
                }
            }
            "select" => {
                let opts: Vec<_> = ctl.select(&options).collect();
                let chosen = opts
                    .iter()
                    .find(|o| o.value().attr("selected").is_some())
                    .or_else(|| opts.first());
                if let Some(o) = chosen {
                    let value = match o.value().attr("value") {
                        Some(v) => v.to_string(),
                        None => o.text().collect::<String>().trim().to_string(),
                    };
                    out.push((name.to_string(), value));
                }
            }
            "textarea" => out.push((name.to_string(), ctl.text().collect())),
            _ => {}
        }
    }
    out
}
