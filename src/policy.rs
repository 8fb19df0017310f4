use http::{HeaderMap, Method, StatusCode, header};
use regex::Regex;
use tracing::warn;

use crate::counters::RejectReason;

const CACHE_CONTROL_DENYLIST: [&str; 4] = ["no-store", "no-cache", "proxy-revalidate", "private"];
const CONTENT_TYPE_ALLOWLIST: [&str; 2] = ["text/", "image/"];

/// The cacheability policy, compiled once at startup. Exception patterns
/// that fail to compile are logged and skipped rather than failing startup.
#[derive(Debug)]
pub struct CachePolicy {
    exceptions: Vec<Regex>,
    max_file_size: u64,
}

impl CachePolicy {
    pub fn new(patterns: &[String], max_file_size: u64) -> Self {
        let mut exceptions = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match Regex::new(pattern) {
                Ok(regex) => exceptions.push(regex),
                Err(err) => {
                    warn!(pattern, error = %err, "skipping invalid cache exception pattern");
                }
            }
        }
        Self {
            exceptions,
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// The head predicates, in normative order: exception, status, method,
    /// Cache-Control, Content-Type. The first failure is the only one
    /// reported. The body-size predicate runs separately once the
    /// decompressed length is known.
    pub fn check_head(
        &self,
        uri: &str,
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<(), RejectReason> {
        if self.is_exception(uri) {
            return Err(RejectReason::CacheException);
        }
        if status != StatusCode::OK {
            return Err(RejectReason::Status);
        }
        if method != Method::GET && method != Method::HEAD {
            return Err(RejectReason::Method);
        }
        let cache_control = header_str(headers, header::CACHE_CONTROL);
        if !cache_control_allows(cache_control) {
            return Err(RejectReason::CacheControl);
        }
        let content_type = header_str(headers, header::CONTENT_TYPE);
        if !content_type_allows(content_type) {
            return Err(RejectReason::ContentType);
        }
        Ok(())
    }

    /// The final predicate: decompressed body length against `MaxFileSize`.
    pub fn check_body_size(&self, decompressed_len: u64) -> Result<(), RejectReason> {
        if decompressed_len > self.max_file_size {
            return Err(RejectReason::FileSize);
        }
        Ok(())
    }

    pub fn is_exception(&self, uri: &str) -> bool {
        self.exceptions.iter().any(|regex| regex.is_match(uri))
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Substring match over the raw header value; a denylisted token anywhere in
/// the comma-separated directive list disqualifies the response.
pub fn cache_control_allows(value: &str) -> bool {
    !CACHE_CONTROL_DENYLIST
        .iter()
        .any(|token| value.contains(token))
}

pub fn content_type_allows(value: &str) -> bool {
    CONTENT_TYPE_ALLOWLIST
        .iter()
        .any(|prefix| value.starts_with(prefix))
}
