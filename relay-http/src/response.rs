//! Redirect and stream response markers.
//!
//! The registered handler's response has already been erased to
//! `serde_json::Value` by the time it reaches the gateway (see
//! `relay_core::compose_handler`), so there is no Rust-level capability
//! to probe the way the original "does this value implement Redirect /
//! Stream" check would in a language with structural typing. Instead, a
//! handler opts in by returning one of these marker types; the gateway
//! recognizes it by a reserved tag field in the serialized JSON rather
//! than by downcasting.

use serde::{Deserialize, Serialize};

pub const REDIRECT_MARKER: &str = "__relay_redirect";
pub const STREAM_MARKER: &str = "__relay_stream";

#[derive(Debug, Clone, Serialize)]
pub struct Redirect {
    #[serde(rename = "__relay_redirect")]
    marker: bool,
    pub url: String,
    pub permanent: bool,
}

impl Redirect {
    pub fn temporary(url: impl Into<String>) -> Self {
        Self {
            marker: true,
            url: url.into(),
            permanent: false,
        }
    }

    pub fn permanent(url: impl Into<String>) -> Self {
        Self {
            marker: true,
            url: url.into(),
            permanent: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamResponse {
    #[serde(rename = "__relay_stream", default)]
    marker: bool,
    pub content_type: Option<String>,
    pub filename: Option<String>,
    /// `(start, end, total)`; `total` is `u64::MAX` to mean "unknown" (`*`).
    pub range: Option<(u64, u64, u64)>,
    pub bytes: Vec<u8>,
}

impl StreamResponse {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            marker: true,
            content_type: None,
            filename: None,
            range: None,
            bytes,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_range(mut self, start: u64, end: u64, total: Option<u64>) -> Self {
        self.range = Some((start, end, total.unwrap_or(u64::MAX)));
        self
    }
}

/// Sanitize a filename for `Content-Disposition`: keep alphanumerics,
/// `_`, `.`, `-`; spaces become `_`; everything else is dropped.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
                Some(c)
            } else if c == ' ' {
                Some('_')
            } else {
                None
            }
        })
        .collect()
}

pub fn content_range_header(range: (u64, u64, u64)) -> String {
    let (start, end, total) = range;
    if total == u64::MAX {
        format!("bytes {start}-{end}/*")
    } else {
        format!("bytes {start}-{end}/{total}")
    }
}
