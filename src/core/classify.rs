//! Encoded-vs-plain detection over a bounded file prefix.
//!
//! Two tiers: a strong signature match short-circuits to `Encoded`; otherwise a
//! binary-density heuristic decides. Classification is recomputed from the bytes
//! on every call and never cached, since source files may change between runs.

use aho_corasick::AhoCorasick;
use memchr::memchr;
use regex::bytes::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

use crate::infra::io::read_prefix;

/// Bytes inspected from the start of each file
pub const PREFIX_LEN: usize = 4096;

/// Share of non-printable bytes above which a NUL-bearing prefix counts as binary
pub const NON_PRINTABLE_THRESHOLD: f64 = 0.2;

/// Format markers, matched ASCII-case-insensitively
static CASELESS_MARKERS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(["ioncube"])
        .expect("static marker patterns")
});

/// Encoded-header literals, matched exactly
static HEADER_MARKERS: LazyLock<AhoCorasick> =
    LazyLock::new(|| AhoCorasick::new(["<?php //0", "HR+c"]).expect("static header patterns"));

static SOURCE_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i-u)\b(?:class|function|static|array|return|extends|implements)\b")
        .expect("static keyword regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Encoded,
    Plain,
}

impl Classification {
    pub fn is_encoded(self) -> bool {
        matches!(self, Classification::Encoded)
    }
}

/// What the classifier saw in a prefix; `verdict()` turns it into a decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    /// Strong signature found, if any (short-circuits the heuristic)
    pub signature: Option<String>,
    pub has_nul: bool,
    pub non_printable_ratio: f64,
    pub has_keywords: bool,
}

impl Evidence {
    pub fn gather(prefix: &[u8]) -> Self {
        let signature = CASELESS_MARKERS
            .find(prefix)
            .or_else(|| HEADER_MARKERS.find(prefix))
            .map(|m| String::from_utf8_lossy(&prefix[m.range()]).into_owned());

        Self {
            signature,
            has_nul: memchr(0, prefix).is_some(),
            non_printable_ratio: non_printable_ratio(prefix),
            has_keywords: SOURCE_KEYWORDS.is_match(prefix),
        }
    }

    pub fn verdict(&self) -> Classification {
        if self.signature.is_some() {
            return Classification::Encoded;
        }
        if self.has_nul && self.non_printable_ratio > NON_PRINTABLE_THRESHOLD && !self.has_keywords
        {
            Classification::Encoded
        } else {
            Classification::Plain
        }
    }
}

/// `1 - printable/total`, where printable is ASCII 0x20..0x7E plus tab, LF and CR.
pub fn non_printable_ratio(bytes: &[u8]) -> f64 {
    let printable = bytes
        .iter()
        .filter(|&&b| (32..127).contains(&b) || matches!(b, b'\t' | b'\n' | b'\r'))
        .count();
    1.0 - printable as f64 / bytes.len().max(1) as f64
}

/// Classify an in-memory prefix (callers pass at most `PREFIX_LEN` bytes).
pub fn classify_bytes(prefix: &[u8]) -> Classification {
    let prefix = &prefix[..prefix.len().min(PREFIX_LEN)];

    // Fast path: strong signatures need no density scan
    if CASELESS_MARKERS.is_match(prefix) || HEADER_MARKERS.is_match(prefix) {
        return Classification::Encoded;
    }

    Evidence::gather(prefix).verdict()
}

/// Read the prefix of `path` and classify it.
pub fn try_classify(path: &Path) -> std::io::Result<Classification> {
    read_prefix(path, PREFIX_LEN).map(|prefix| classify_bytes(&prefix))
}

/// Classify `path`; never fails.
///
/// An unreadable file is logged and treated as `Plain`, so it is copied rather than
/// blocking the batch. Callers that need to surface these use [`try_classify`].
pub fn classify(path: &Path) -> Classification {
    match try_classify(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "unreadable file, treating as plain");
            Classification::Plain
        }
    }
}
