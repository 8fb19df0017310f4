use std::fmt::Write as _;

use http::Method;
use sha2::{Digest, Sha256};

pub const SHARD_BUCKETS: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Ignore,
    Sort,
    Preserve,
}

/// Identity of a request inside the cache: the canonical URI plus the
/// `(shard, digest)` pair derived from it. Callers never compute a shard
/// on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub uri: String,
    pub digest: String,
    pub shard: u8,
}

pub fn derive(
    method: &Method,
    host: &str,
    path: &str,
    raw_query: Option<&str>,
    mode: QueryMode,
) -> CacheKey {
    let uri = canonical_uri(method, host, path, raw_query, mode);
    let hash = Sha256::digest(uri.as_bytes());

    let mut digest = String::with_capacity(hash.len() * 2);
    for byte in &hash {
        let _ = write!(digest, "{byte:02x}");
    }

    let sum: u32 = hash.iter().map(|byte| u32::from(*byte)).sum();
    let shard = (sum % SHARD_BUCKETS) as u8;

    CacheKey { uri, digest, shard }
}

/// Builds `METHOD || HOST || PATH [|| "?" || normalised_query]`.
///
/// The `?` is omitted when normalisation leaves no parameters. Malformed
/// queries degrade to best-effort splitting on `&` then the first `=`.
pub fn canonical_uri(
    method: &Method,
    host: &str,
    path: &str,
    raw_query: Option<&str>,
    mode: QueryMode,
) -> String {
    let raw_query = raw_query.filter(|query| !query.is_empty());
    let normalised = match (raw_query, mode) {
        (None, _) | (Some(_), QueryMode::Ignore) => None,
        (Some(query), QueryMode::Sort) => {
            let mut pairs = split_query(query);
            // Stable sort: values for a repeated key keep arrival order.
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            join_query(&pairs)
        }
        (Some(query), QueryMode::Preserve) => join_query(&split_query(query)),
    };

    match normalised {
        Some(query) => format!("{method}{host}{path}?{query}"),
        None => format!("{method}{host}{path}"),
    }
}

/// Splits a raw query into key/value pairs, dropping parameters whose value
/// is empty (including bare keys without `=`).
fn split_query(raw: &str) -> Vec<(&str, &str)> {
    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| part.split_once('=').unwrap_or((part, "")))
        .filter(|(_, value)| !value.is_empty())
        .collect()
}

fn join_query(pairs: &[(&str, &str)]) -> Option<String> {
    if pairs.is_empty() {
        return None;
    }
    let mut joined = String::new();
    for (index, (key, value)) in pairs.iter().enumerate() {
        if index > 0 {
            joined.push('&');
        }
        joined.push_str(key);
        joined.push('=');
        joined.push_str(value);
    }
    Some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_to_bytes(hex: &str) -> Vec<u8> {
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("valid hex"))
            .collect()
    }

    #[test]
    fn sort_mode_orders_parameters_by_key() {
        let uri = canonical_uri(
            &Method::GET,
            "global",
            "/foo",
            Some("b=2&a=1"),
            QueryMode::Sort,
        );
        assert_eq!(uri, "GETglobal/foo?a=1&b=2");
    }

    #[test]
    fn sort_mode_is_order_independent() {
        let a = derive(
            &Method::GET,
            "global",
            "/foo",
            Some("b=2&a=1&c=3"),
            QueryMode::Sort,
        );
        let b = derive(
            &Method::GET,
            "global",
            "/foo",
            Some("c=3&a=1&b=2"),
            QueryMode::Sort,
        );
        assert_eq!(a.uri, b.uri);
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.shard, b.shard);
    }

    #[test]
    fn sort_mode_keeps_repeated_key_value_order() {
        let uri = canonical_uri(
            &Method::GET,
            "h",
            "/p",
            Some("k=2&a=0&k=1"),
            QueryMode::Sort,
        );
        assert_eq!(uri, "GETh/p?a=0&k=2&k=1");
    }

    #[test]
    fn ignore_mode_drops_query_entirely() {
        let uri = canonical_uri(
            &Method::GET,
            "global",
            "/foo",
            Some("a=1&b=2"),
            QueryMode::Ignore,
        );
        assert_eq!(uri, "GETglobal/foo");
    }

    #[test]
    fn empty_values_are_stripped_in_non_ignore_modes() {
        let preserve = canonical_uri(
            &Method::GET,
            "h",
            "/p",
            Some("a=&b=2&c"),
            QueryMode::Preserve,
        );
        assert_eq!(preserve, "GETh/p?b=2");

        let sort = canonical_uri(&Method::GET, "h", "/p", Some("a=&b=2&c"), QueryMode::Sort);
        assert_eq!(sort, "GETh/p?b=2");
    }

    #[test]
    fn query_of_only_empty_values_omits_question_mark() {
        let uri = canonical_uri(&Method::GET, "h", "/p", Some("a=&b="), QueryMode::Preserve);
        assert_eq!(uri, "GETh/p");
    }

    #[test]
    fn malformed_query_splits_best_effort() {
        let uri = canonical_uri(
            &Method::GET,
            "h",
            "/p",
            Some("&&a=1=2&b=3"),
            QueryMode::Preserve,
        );
        assert_eq!(uri, "GETh/p?a=1=2&b=3");
    }

    #[test]
    fn canonicalisation_is_idempotent() {
        let first = canonical_uri(
            &Method::GET,
            "h",
            "/p",
            Some("b=2&a=1"),
            QueryMode::Sort,
        );
        let (_, query) = first.split_once('?').expect("query present");
        let second = canonical_uri(&Method::GET, "h", "/p", Some(query), QueryMode::Sort);
        assert_eq!(first, second);
    }

    #[test]
    fn key_is_deterministic_across_calls() {
        let a = derive(&Method::GET, "h", "/p", None, QueryMode::Preserve);
        let b = derive(&Method::GET, "h", "/p", None, QueryMode::Preserve);
        assert_eq!(a, b);
        assert_eq!(a.digest.len(), 64);
        assert!(a.digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(a.digest.chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn shard_is_byte_sum_of_digest_modulo_255() {
        let key = derive(&Method::GET, "h", "/p", Some("x=1"), QueryMode::Preserve);
        let sum: u32 = hex_to_bytes(&key.digest)
            .iter()
            .map(|byte| u32::from(*byte))
            .sum();
        assert_eq!(u32::from(key.shard), sum % SHARD_BUCKETS);
        assert!(u32::from(key.shard) < SHARD_BUCKETS);
    }

    #[test]
    fn method_distinguishes_entries() {
        let get = derive(&Method::GET, "h", "/p", None, QueryMode::Preserve);
        let head = derive(&Method::HEAD, "h", "/p", None, QueryMode::Preserve);
        assert_ne!(get.digest, head.digest);
    }
}
