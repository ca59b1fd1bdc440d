//! Configuration of the output cache.

use serde::Deserialize;
use serde::Serialize;

/// The default number of seconds a response is kept in storage.
const DEFAULT_SERVER_TIME_SPAN: u64 = 60;

/// The default number of seconds a client may reuse a response.
const DEFAULT_CLIENT_TIME_SPAN: u64 = 60;

/// Options for an output cache.
///
/// Time spans are expressed in whole seconds. The options deserialize with
/// defaults for any missing field, so hosts can embed them in their own
/// configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheOutputOptions {
    /// How long a stored response stays valid on the server.
    pub server_time_span: u64,
    /// The `max-age` sent to clients.
    pub client_time_span: u64,
    /// The `s-maxage` sent to clients, if any.
    pub shared_time_span: Option<u64>,
    /// Whether to send the `must-revalidate` directive.
    pub must_revalidate: bool,
    /// Whether the query string is ignored when computing cache keys.
    pub exclude_query_string: bool,
    /// Whether caching is restricted to unauthenticated requests.
    pub anonymous_only: bool,
    /// Whether to send the `private` directive.
    pub private: bool,
    /// Whether to send `no-cache` when no other directive applies.
    pub no_cache: bool,
}

impl Default for CacheOutputOptions {
    fn default() -> Self {
        Self {
            server_time_span: DEFAULT_SERVER_TIME_SPAN,
            client_time_span: DEFAULT_CLIENT_TIME_SPAN,
            shared_time_span: None,
            must_revalidate: false,
            exclude_query_string: false,
            anonymous_only: false,
            private: false,
            no_cache: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let options: CacheOutputOptions = serde_json::from_str(
            r#"{ "server-time-span": 300, "exclude-query-string": true }"#,
        )
        .unwrap();

        assert_eq!(options.server_time_span, 300);
        assert_eq!(options.client_time_span, DEFAULT_CLIENT_TIME_SPAN);
        assert!(options.exclude_query_string);
        assert!(!options.private);
        assert_eq!(options.shared_time_span, None);
    }
}
