//! Implementation of entity tags and conditional request validation.

use blake3::Hasher;
use http::HeaderMap;
use http::header::IF_NONE_MATCH;

use crate::time::CacheTimeWindow;

/// The number of digest bytes kept in a generated entity tag.
const TAG_DIGEST_LEN: usize = 16;

/// A trait implemented on entity tag generators.
pub trait EntityTagGenerator: Send + Sync + 'static {
    /// Creates the entity tag of a freshly produced response.
    ///
    /// The returned tag may be bare or quoted; the cache quotes it before
    /// use.
    fn create(
        &self,
        key: &str,
        content_type: &str,
        body: &[u8],
        window: &CacheTimeWindow,
    ) -> String;
}

/// An entity tag generator hashing the stored representation.
///
/// The tag changes whenever the body, the content type or the cache key
/// changes, and is stable otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentHashEntityTag;

impl EntityTagGenerator for ContentHashEntityTag {
    fn create(
        &self,
        key: &str,
        content_type: &str,
        body: &[u8],
        _window: &CacheTimeWindow,
    ) -> String {
        let mut hasher = Hasher::new();
        hasher.update(key.as_bytes());
        hasher.update(&[0]);
        hasher.update(content_type.as_bytes());
        hasher.update(&[0]);
        hasher.update(body);
        let digest = hasher.finalize();
        hex::encode(&digest.as_bytes()[..TAG_DIGEST_LEN])
    }
}

/// Quotes an entity tag, dropping any quotes already inside it.
pub fn quote(tag: &str) -> String {
    format!("\"{}\"", tag.replace('"', ""))
}

/// Gets the validators a client sent in `If-None-Match` headers.
///
/// The weak prefix is dropped, so `W/"x"` and `"x"` are the same validator.
pub fn validators(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .map(|tag| tag.strip_prefix("W/").unwrap_or(tag))
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// Determines if any validator matches the stored entity tag.
pub fn matches(validators: &[String], etag: &str) -> bool {
    validators.iter().any(|v| v == etag)
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use std::time::SystemTime;

    use http::HeaderValue;

    use super::*;

    fn window() -> CacheTimeWindow {
        CacheTimeWindow {
            server_duration: Duration::from_secs(60),
            client_duration: Duration::from_secs(60),
            shared_duration: None,
            must_revalidate: false,
            absolute_expiration: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn content_hash_is_deterministic() {
        let generator = ContentHashEntityTag;
        let first = generator.create("k", "application/json", b"{}", &window());
        let second = generator.create("k", "application/json", b"{}", &window());
        assert_eq!(first, second);
        assert_eq!(first.len(), TAG_DIGEST_LEN * 2);

        let changed = generator.create("k", "application/json", b"[]", &window());
        assert_ne!(first, changed);
        let retyped = generator.create("k", "text/plain", b"{}", &window());
        assert_ne!(first, retyped);
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("abc"), "\"abc\"");
        assert_eq!(quote("\"abc\""), "\"abc\"");
    }

    #[test]
    fn parses_validators() {
        let mut headers = HeaderMap::new();
        headers.append(IF_NONE_MATCH, HeaderValue::from_static("\"a\", W/\"b\""));
        headers.append(IF_NONE_MATCH, HeaderValue::from_static("\"c\""));

        let validators = validators(&headers);
        assert_eq!(validators, ["\"a\"", "\"b\"", "\"c\""]);
        assert!(matches(&validators, "\"b\""));
        assert!(!matches(&validators, "\"d\""));
        assert!(!matches(&validators, "b"));
    }

    #[test]
    fn no_validators() {
        assert!(validators(&HeaderMap::new()).is_empty());
    }
}
