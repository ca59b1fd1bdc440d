//! Implementation of the output cache.

use std::fmt;
use std::time::SystemTime;

use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use futures::executor::block_on;
use futures::future;
use http::HeaderMap;
use http::HeaderValue;
use http::Method;
use http::Response;
use http::StatusCode;
use http::Uri;
use http::header;
use http::header::CACHE_CONTROL;
use http::header::CONTENT_LENGTH;
use http::header::CONTENT_TYPE;
use http::header::ETAG;
use http::header::PRAGMA;
use tracing::debug;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::etag;
use crate::etag::ContentHashEntityTag;
use crate::etag::EntityTagGenerator;
use crate::key::ActionDescriptor;
use crate::key::CacheKeyGenerator;
use crate::key::DefaultCacheKeyGenerator;
use crate::key::content_type_key;
use crate::key::etag_key;
use crate::options::CacheOutputOptions;
use crate::storage::AsyncCacheStorage;
use crate::storage::BlockingStorage;
use crate::storage::CacheEntry;
use crate::storage::CacheStorage;
use crate::storage::CachedValue;
use crate::storage::FromCachedValue;
use crate::time::CacheTimeQuery;
use crate::time::CacheTimeWindow;
use crate::time::ShortTime;

/// The name of the `x-cache` custom header.
///
/// Value will be `HIT` if a response was served from the cache, `MISS` if
/// the handler produced it.
pub const X_CACHE: &str = "x-cache";

/// The media type assumed when a request carries no negotiated media type.
pub const DEFAULT_MEDIA_TYPE: &str = "application/json";

/// Represents a cache status.
///
/// Used in the custom header `x-cache`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// The response was served from the cache.
    Hit,
    /// The response was not served from the cache.
    Miss,
}

impl CacheStatus {
    /// Gets the header value of the status.
    fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The negotiated media type of a request's response.
///
/// Hosts attach this to requests as an extension after content negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedMediaType(pub String);

/// An abstraction of a request considered for caching.
pub trait CacheRequest {
    /// Gets the request's method.
    fn method(&self) -> &Method;

    /// Gets the request's URI.
    fn uri(&self) -> &Uri;

    /// Gets the request's headers.
    fn headers(&self) -> &HeaderMap;

    /// Gets the identity of the action handling the request.
    fn action(&self) -> Option<&ActionDescriptor>;

    /// Gets the media type selected for the response.
    fn media_type(&self) -> &str;

    /// Determines if the request is authenticated.
    fn is_authenticated(&self) -> bool {
        false
    }
}

/// Requests carry their action identity and negotiated media type as
/// extensions.
///
/// A request is considered authenticated when it has an `Authorization`
/// header.
impl<B> CacheRequest for http::Request<B> {
    fn method(&self) -> &Method {
        self.method()
    }

    fn uri(&self) -> &Uri {
        self.uri()
    }

    fn headers(&self) -> &HeaderMap {
        self.headers()
    }

    fn action(&self) -> Option<&ActionDescriptor> {
        self.extensions().get()
    }

    fn media_type(&self) -> &str {
        self.extensions()
            .get::<NegotiatedMediaType>()
            .map(|m| m.0.as_str())
            .unwrap_or(DEFAULT_MEDIA_TYPE)
    }

    fn is_authenticated(&self) -> bool {
        self.headers().contains_key(header::AUTHORIZATION)
    }
}

/// Represents the outcome of looking a request up before its handler runs.
#[derive(Debug)]
pub enum Lookup {
    /// The request is not eligible for caching.
    ///
    /// The handler should run and the cache should not be consulted again
    /// for the request.
    Bypass,
    /// No stored response exists.
    ///
    /// The handler should run and its response be passed to
    /// [`OutputCache::after_handler`].
    Miss,
    /// The client's validator matched the stored response.
    NotModified(Response<Bytes>),
    /// The stored response is replayed.
    Hit(Response<Bytes>),
}

impl Lookup {
    /// Gets the response produced by the cache, if any.
    pub fn into_response(self) -> Option<Response<Bytes>> {
        match self {
            Self::NotModified(response) | Self::Hit(response) => Some(response),
            Self::Bypass | Self::Miss => None,
        }
    }
}

/// An extension trait for [`Response`].
trait ResponseExt {
    /// Sets the entity tag of the response.
    fn set_entity_tag(&mut self, etag: &str) -> Result<()>;

    /// Sets the `cache-control` headers from the given window.
    fn apply_cache_headers(&mut self, window: &CacheTimeWindow, options: &CacheOutputOptions);

    /// Sets the cache status header of the response.
    fn set_cache_status(&mut self, status: CacheStatus);
}

impl<B> ResponseExt for Response<B> {
    fn set_entity_tag(&mut self, etag: &str) -> Result<()> {
        let value = HeaderValue::from_str(&etag::quote(etag))
            .with_context(|| format!("entity tag `{etag}` is not a valid header value"))?;
        self.headers_mut().insert(ETAG, value);
        Ok(())
    }

    fn apply_cache_headers(&mut self, window: &CacheTimeWindow, options: &CacheOutputOptions) {
        let headers = self.headers_mut();
        if !window.client_duration.is_zero() || window.must_revalidate || options.private {
            let mut directives = Vec::new();
            if options.private {
                directives.push("private".to_string());
            }

            directives.push(format!("max-age={}", window.client_duration.as_secs()));

            if let Some(shared) = window.shared_duration {
                directives.push(format!("s-maxage={}", shared.as_secs()));
            }

            if window.must_revalidate {
                directives.push("must-revalidate".to_string());
            }

            if let Ok(value) = HeaderValue::try_from(directives.join(", ")) {
                headers.insert(CACHE_CONTROL, value);
            }
        } else if options.no_cache {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        }
    }

    fn set_cache_status(&mut self, status: CacheStatus) {
        self.headers_mut()
            .insert(X_CACHE, HeaderValue::from_static(status.as_str()));
    }
}

/// Implements an HTTP output cache.
///
/// The cache wraps a handler with two hooks: [`before_handler`] may answer
/// the request from storage, and [`after_handler`] stores a successful
/// response for later requests.
///
/// [`before_handler`]: OutputCache::before_handler
/// [`after_handler`]: OutputCache::after_handler
pub struct OutputCache<S> {
    /// The cache storage.
    storage: S,
    /// The cache options.
    options: CacheOutputOptions,
    /// The policy deciding how long responses are cached.
    time_query: Box<dyn CacheTimeQuery>,
    /// The generator of cache keys.
    key_generator: Box<dyn CacheKeyGenerator>,
    /// The generator of entity tags.
    etag_generator: Box<dyn EntityTagGenerator>,
    /// The source of the current time.
    clock: Box<dyn Clock>,
}

impl<S> OutputCache<S> {
    /// Constructs a new output cache with the given storage.
    ///
    /// Uses the default options.
    pub fn new(storage: S) -> Self {
        Self::new_with_options(storage, CacheOutputOptions::default())
    }

    /// Constructs a new output cache with the given storage and options.
    ///
    /// Responses are cached for the time spans in the options.
    pub fn new_with_options(storage: S, options: CacheOutputOptions) -> Self {
        Self {
            storage,
            time_query: Box::new(ShortTime::from(&options)),
            options,
            key_generator: Box::new(DefaultCacheKeyGenerator),
            etag_generator: Box::new(ContentHashEntityTag),
            clock: Box::new(SystemClock),
        }
    }

    /// Sets the policy deciding how long responses are cached.
    ///
    /// This replaces the time spans from the options.
    pub fn with_time_query(mut self, time_query: impl CacheTimeQuery) -> Self {
        self.time_query = Box::new(time_query);
        self
    }

    /// Sets the generator of cache keys.
    pub fn with_key_generator(mut self, key_generator: impl CacheKeyGenerator) -> Self {
        self.key_generator = Box::new(key_generator);
        self
    }

    /// Sets the generator of entity tags.
    pub fn with_etag_generator(mut self, etag_generator: impl EntityTagGenerator) -> Self {
        self.etag_generator = Box::new(etag_generator);
        self
    }

    /// Sets the source of the current time.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Gets the storage used by the cache.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Gets the options of the cache.
    pub fn options(&self) -> &CacheOutputOptions {
        &self.options
    }

    /// Determines if a request may be served from or stored in the cache.
    fn is_caching_allowed(&self, request: &impl CacheRequest) -> bool {
        *request.method() == Method::GET
            && !(self.options.anonymous_only && request.is_authenticated())
    }

    /// Evaluates the time policy at the current instant.
    ///
    /// Returns `None` if the policy cannot be evaluated.
    fn evaluate(&self) -> Option<(SystemTime, CacheTimeWindow)> {
        let now = self.clock.now();
        match self.time_query.evaluate(now) {
            Ok(window) => Some((now, window)),
            Err(e) => {
                debug!(
                    error = format!("{e:?}"),
                    "failed to evaluate cache time policy: caching is disabled for this request"
                );
                None
            }
        }
    }

    /// Applies cache headers from a freshly evaluated time policy.
    fn apply_cache_headers<B>(&self, response: &mut Response<B>) {
        if let Some((_, window)) = self.evaluate() {
            response.apply_cache_headers(&window, &self.options);
        }
    }

    /// Makes the cache key of a request.
    fn cache_key(&self, request: &impl CacheRequest) -> Result<String> {
        self.key_generator.make_key(
            request.action(),
            request.media_type(),
            request.uri().query(),
            self.options.exclude_query_string,
        )
    }
}

impl<S> OutputCache<S>
where
    S: AsyncCacheStorage,
{
    /// Looks a request up before its handler runs.
    ///
    /// Storage failures are treated as a miss.
    pub async fn before_handler(&self, request: &impl CacheRequest) -> Lookup {
        if !self.is_caching_allowed(request) || self.evaluate().is_none() {
            return Lookup::Bypass;
        }

        let key = match self.cache_key(request) {
            Ok(key) => key,
            Err(e) => {
                debug!(
                    method = request.method().as_str(),
                    path = request.uri().path(),
                    error = format!("{e:?}"),
                    "failed to make cache key: bypassing the cache"
                );
                return Lookup::Bypass;
            }
        };

        match self.lookup(request, &key).await {
            Ok(lookup) => lookup,
            Err(e) => {
                debug!(
                    method = request.method().as_str(),
                    path = request.uri().path(),
                    key,
                    error = format!("{e:?}"),
                    "failed to get response from storage; treating as not cached"
                );
                Lookup::Miss
            }
        }
    }

    /// Stores a handler's response for later requests.
    ///
    /// The response is given an entity tag when stored and cache headers
    /// whenever it is eligible for caching. Storage failures leave the
    /// response otherwise untouched.
    pub async fn after_handler(&self, request: &impl CacheRequest, response: &mut Response<Bytes>) {
        if !response.status().is_success() {
            debug!(
                method = request.method().as_str(),
                path = request.uri().path(),
                status = response.status().as_u16(),
                "response is not cacheable"
            );
            return;
        }

        if !self.is_caching_allowed(request) {
            return;
        }

        let Some((now, window)) = self.evaluate() else {
            return;
        };

        if window.absolute_expiration > now {
            match self.cache_key(request) {
                Ok(key) if !key.trim().is_empty() => {
                    if let Err(e) = self.store(request, &key, response, &window).await {
                        debug!(
                            method = request.method().as_str(),
                            path = request.uri().path(),
                            key,
                            error = format!("{e:?}"),
                            "failed to put response into cache storage"
                        );
                    }
                }
                Ok(_) => {
                    debug!(
                        method = request.method().as_str(),
                        path = request.uri().path(),
                        "cache key is blank: not storing response"
                    );
                }
                Err(e) => {
                    debug!(
                        method = request.method().as_str(),
                        path = request.uri().path(),
                        error = format!("{e:?}"),
                        "failed to make cache key: not storing response"
                    );
                }
            }
        } else {
            debug!(
                method = request.method().as_str(),
                path = request.uri().path(),
                "cache time window has already elapsed: not storing response"
            );
        }

        response.set_cache_status(CacheStatus::Miss);
        self.apply_cache_headers(response);
    }

    /// Serves a request through the cache.
    ///
    /// If a stored response exists, it is returned without running the
    /// handler. Otherwise the handler runs and its response is stored, if it
    /// is cacheable. Handler errors are returned as-is.
    pub async fn serve<R, F, Fut, E>(&self, request: &R, handler: F) -> Result<Response<Bytes>, E>
    where
        R: CacheRequest,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Response<Bytes>, E>>,
    {
        match self.before_handler(request).await {
            Lookup::NotModified(response) | Lookup::Hit(response) => Ok(response),
            Lookup::Bypass => handler().await,
            Lookup::Miss => {
                let mut response = handler().await?;
                self.after_handler(request, &mut response).await;
                Ok(response)
            }
        }
    }

    /// Removes every stored response of an action.
    pub async fn invalidate_action(&self, declaring_type: &str, action: &str) -> Result<()> {
        let base_key = self.key_generator.make_base_key(declaring_type, action);
        self.storage
            .remove_group(&base_key)
            .await
            .with_context(|| format!("failed to invalidate cached responses of `{base_key}`"))?;

        debug!(base_key, "invalidated cached responses");
        Ok(())
    }

    /// Gets a typed value from storage.
    ///
    /// A value of the wrong kind is treated as not present.
    async fn get<T: FromCachedValue>(&self, key: &str) -> Result<Option<T>> {
        Ok(match self.storage.get(key).await? {
            Some(value) => {
                let value = T::from_cached_value(value);
                if value.is_none() {
                    debug!(key, "stored value has an unexpected type: treating as not present");
                }
                value
            }
            None => None,
        })
    }

    /// Looks up the stored response for a key.
    async fn lookup(&self, request: &impl CacheRequest, key: &str) -> Result<Lookup> {
        if !self.storage.contains(key).await? {
            debug!(
                method = request.method().as_str(),
                path = request.uri().path(),
                key,
                "cache miss"
            );
            return Ok(Lookup::Miss);
        }

        let validators = etag::validators(request.headers());
        if !validators.is_empty() {
            if let Some(tag) = self.get::<String>(&etag_key(key)).await? {
                if etag::matches(&validators, &tag) {
                    debug!(
                        method = request.method().as_str(),
                        path = request.uri().path(),
                        key,
                        etag = tag,
                        "entity tag matched: responding with not modified"
                    );

                    let mut response = Response::new(Bytes::new());
                    *response.status_mut() = StatusCode::NOT_MODIFIED;
                    response.set_entity_tag(&tag)?;
                    response.set_cache_status(CacheStatus::Hit);
                    self.apply_cache_headers(&mut response);
                    return Ok(Lookup::NotModified(response));
                }
            }
        }

        let Some(body) = self.get::<Bytes>(key).await? else {
            debug!(
                method = request.method().as_str(),
                path = request.uri().path(),
                key,
                "stored response disappeared: treating as not cached"
            );
            return Ok(Lookup::Miss);
        };

        let content_type = match self.get::<HeaderValue>(&content_type_key(key)).await? {
            Some(content_type) => content_type,
            None => HeaderValue::from_str(request.media_type()).with_context(|| {
                format!(
                    "media type `{media_type}` is not a valid header value",
                    media_type = request.media_type()
                )
            })?,
        };

        let mut response = Response::new(body);
        response.headers_mut().insert(CONTENT_TYPE, content_type);
        if let Some(tag) = self.get::<String>(&etag_key(key)).await? {
            response.set_entity_tag(&tag)?;
        }

        response.set_cache_status(CacheStatus::Hit);
        self.apply_cache_headers(&mut response);

        debug!(
            method = request.method().as_str(),
            path = request.uri().path(),
            key,
            "cache hit: responding with body from storage"
        );
        Ok(Lookup::Hit(response))
    }

    /// Stores a fresh response under the given key.
    ///
    /// The body entry is written last so that a present body implies its
    /// content type and entity tag entries were written. The response gets
    /// its entity tag and loses its `Content-Length` only once the entries
    /// are stored.
    async fn store(
        &self,
        request: &impl CacheRequest,
        key: &str,
        response: &mut Response<Bytes>,
        window: &CacheTimeWindow,
    ) -> Result<()> {
        if self.storage.contains(key).await? {
            debug!(
                method = request.method().as_str(),
                path = request.uri().path(),
                key,
                "response was already stored by another request"
            );
            return Ok(());
        }

        let action = request
            .action()
            .context("request has no action identity")?;
        let base_key = self
            .key_generator
            .make_base_key(action.declaring_type(), action.action());

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(request.media_type())
            .to_string();

        let tag = etag::quote(&self.etag_generator.create(
            key,
            &content_type,
            response.body(),
            window,
        ));
        let etag_value = HeaderValue::from_str(&tag)
            .with_context(|| format!("entity tag `{tag}` is not a valid header value"))?;

        let expires_at = window.absolute_expiration;
        self.storage
            .add_group(vec![
                CacheEntry::new(base_key.clone(), CachedValue::Empty, expires_at, None),
                CacheEntry::new(
                    content_type_key(key),
                    CachedValue::ContentType(content_type),
                    expires_at,
                    Some(base_key.clone()),
                ),
                CacheEntry::new(
                    etag_key(key),
                    CachedValue::Text(tag.clone()),
                    expires_at,
                    Some(base_key.clone()),
                ),
                CacheEntry::new(
                    key,
                    CachedValue::Bytes(response.body().clone()),
                    expires_at,
                    Some(base_key),
                ),
            ])
            .await?;

        // The response only advertises a stored entity tag
        response.headers_mut().insert(ETAG, etag_value);
        response.headers_mut().remove(CONTENT_LENGTH);

        debug!(
            method = request.method().as_str(),
            path = request.uri().path(),
            key,
            etag = tag,
            "response stored in cache"
        );
        Ok(())
    }
}

/// The blocking interface of the cache.
///
/// These methods run the same logic as their async counterparts; blocking
/// storage answers immediately, so no executor is needed beyond the calling
/// thread.
impl<S> OutputCache<BlockingStorage<S>>
where
    S: CacheStorage,
{
    /// Constructs a new output cache over blocking storage.
    pub fn new_blocking(storage: S) -> Self {
        Self::new(BlockingStorage::new(storage))
    }

    /// Constructs a new output cache over blocking storage with the given
    /// options.
    pub fn new_blocking_with_options(storage: S, options: CacheOutputOptions) -> Self {
        Self::new_with_options(BlockingStorage::new(storage), options)
    }

    /// Looks a request up before its handler runs, blocking the caller.
    pub fn before_handler_blocking(&self, request: &impl CacheRequest) -> Lookup {
        block_on(self.before_handler(request))
    }

    /// Stores a handler's response for later requests, blocking the caller.
    pub fn after_handler_blocking(
        &self,
        request: &impl CacheRequest,
        response: &mut Response<Bytes>,
    ) {
        block_on(self.after_handler(request, response))
    }

    /// Serves a request through the cache, blocking the caller.
    pub fn serve_blocking<R, F, E>(&self, request: &R, handler: F) -> Result<Response<Bytes>, E>
    where
        R: CacheRequest,
        F: FnOnce() -> Result<Response<Bytes>, E>,
    {
        block_on(self.serve(request, || future::ready(handler())))
    }

    /// Removes every stored response of an action, blocking the caller.
    pub fn invalidate_action_blocking(&self, declaring_type: &str, action: &str) -> Result<()> {
        block_on(self.invalidate_action(declaring_type, action))
    }
}
