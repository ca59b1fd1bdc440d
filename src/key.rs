//! Implementation of cache key generation.
//!
//! A cache key has the form `{type}.{action}|{media type}`, followed by
//! `|{query}` when the query string takes part in the key. The base key of
//! an action is the `{type}.{action}` prefix shared by all of its keys.
//!
//! Separator characters inside a component are percent-encoded, so distinct
//! inputs never compose into the same key.
//!
//! Keys are built only from the action identity, the negotiated media type
//! and the raw query string; request headers never contribute.

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use percent_encoding::AsciiSet;
use percent_encoding::CONTROLS;
use percent_encoding::utf8_percent_encode;

/// The suffix of the key holding a stored response's content type.
const CONTENT_TYPE_SUFFIX: &str = "#content-type";

/// The suffix of the key holding a stored response's entity tag.
const ETAG_SUFFIX: &str = "#etag";

/// Characters encoded in the type and action names.
const NAME_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%').add(b'.').add(b'|').add(b'#');

/// Characters encoded in the media type.
const MEDIA_TYPE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%').add(b'|').add(b'#');

/// Characters encoded in the query string.
const QUERY_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%').add(b'#');

/// Identifies the action handling a request.
///
/// Hosts attach this to requests as an extension. Surrounding whitespace is
/// not part of either name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionDescriptor {
    /// The name of the type declaring the action.
    declaring_type: String,
    /// The name of the action.
    action: String,
}

impl ActionDescriptor {
    /// Constructs a new action descriptor.
    pub fn new(declaring_type: impl AsRef<str>, action: impl AsRef<str>) -> Self {
        Self {
            declaring_type: declaring_type.as_ref().trim().to_string(),
            action: action.as_ref().trim().to_string(),
        }
    }

    /// Gets the name of the type declaring the action.
    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    /// Gets the name of the action.
    pub fn action(&self) -> &str {
        &self.action
    }
}

/// A trait implemented on cache key generators.
pub trait CacheKeyGenerator: Send + Sync + 'static {
    /// Makes the cache key for a request.
    ///
    /// Returns an error when the request has no usable action identity; the
    /// request is then served without the cache.
    fn make_key(
        &self,
        action: Option<&ActionDescriptor>,
        media_type: &str,
        query: Option<&str>,
        exclude_query: bool,
    ) -> Result<String>;

    /// Makes the base key grouping every cache key of an action.
    fn make_base_key(&self, declaring_type: &str, action: &str) -> String;
}

/// The default cache key generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCacheKeyGenerator;

impl CacheKeyGenerator for DefaultCacheKeyGenerator {
    fn make_key(
        &self,
        action: Option<&ActionDescriptor>,
        media_type: &str,
        query: Option<&str>,
        exclude_query: bool,
    ) -> Result<String> {
        let action = action.context("request has no action identity")?;
        if action.declaring_type().is_empty() || action.action().is_empty() {
            bail!(
                "action identity `{declaring_type}.{name}` is incomplete",
                declaring_type = action.declaring_type(),
                name = action.action()
            );
        }

        let mut key = self.make_base_key(action.declaring_type(), action.action());
        key.push('|');
        key.extend(utf8_percent_encode(
            &media_type.trim().to_ascii_lowercase(),
            MEDIA_TYPE_ENCODE_SET,
        ));

        if !exclude_query {
            if let Some(query) = query
                .map(|q| q.strip_prefix('?').unwrap_or(q))
                .filter(|q| !q.is_empty())
            {
                key.push('|');
                key.extend(utf8_percent_encode(query, QUERY_ENCODE_SET));
            }
        }

        Ok(key)
    }

    fn make_base_key(&self, declaring_type: &str, action: &str) -> String {
        format!(
            "{declaring_type}.{action}",
            declaring_type = utf8_percent_encode(declaring_type.trim(), NAME_ENCODE_SET),
            action = utf8_percent_encode(action.trim(), NAME_ENCODE_SET)
        )
    }
}

/// Gets the key of the content type entry for a cache key.
pub fn content_type_key(key: &str) -> String {
    format!("{key}{CONTENT_TYPE_SUFFIX}")
}

/// Gets the key of the entity tag entry for a cache key.
pub fn etag_key(key: &str) -> String {
    format!("{key}{ETAG_SUFFIX}")
}
