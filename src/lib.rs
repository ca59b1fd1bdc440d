//! An implementation of a server-side HTTP output cache.
//!
//! The cache wraps a request handler with two hooks. Before the handler
//! runs, a stored response for the request is replayed, or a `304 Not
//! Modified` is returned when the client's `If-None-Match` validator matches
//! the stored entity tag. After the handler runs, a successful response is
//! stored under a key derived from the handling action, the negotiated media
//! type and (optionally) the query string.
//!
//! Stored responses of one action form a group under the action's base key
//! and can be invalidated together.
//!
//! The cache logic is written once against [`storage::AsyncCacheStorage`];
//! blocking storage is supported through [`storage::BlockingStorage`] and the
//! `*_blocking` methods of [`OutputCache`].
//!
//! ```
//! use bytes::Bytes;
//! use http_output_cache::ActionDescriptor;
//! use http_output_cache::OutputCache;
//! use http_output_cache::http::Request;
//! use http_output_cache::http::Response;
//! use http_output_cache::storage::MemoryCacheStorage;
//!
//! let cache = OutputCache::new_blocking(MemoryCacheStorage::new());
//! let request = Request::get("/widgets")
//!     .extension(ActionDescriptor::new("Widgets", "Get"))
//!     .body(())
//!     .unwrap();
//!
//! let response = cache
//!     .serve_blocking(&request, || {
//!         Ok::<_, std::convert::Infallible>(Response::new(Bytes::from_static(b"[]")))
//!     })
//!     .unwrap();
//! assert_eq!(response.body(), "[]");
//! ```
//!
//! By default, this crate uses `tokio` as its async runtime for file
//! storage.
//!
//! Enable the `smol` feature for using the `smol` runtime instead.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

mod cache;
mod clock;
pub mod etag;
mod key;
mod options;
pub(crate) mod runtime;
pub mod storage;
pub mod time;

pub use cache::*;
pub use clock::*;
pub use key::*;
pub use options::*;
// Re-export the http crate.
pub use http;
