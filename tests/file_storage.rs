//! Tests of the output cache over file storage.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;

use bytes::Bytes;
use http_output_cache::ActionDescriptor;
use http_output_cache::ManualClock;
use http_output_cache::OutputCache;
use http_output_cache::X_CACHE;
use http_output_cache::http::Request;
use http_output_cache::http::Response;
use http_output_cache::http::StatusCode;
use http_output_cache::http::header;
use http_output_cache::storage::FileCacheStorage;
use tempfile::tempdir;

fn start() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000)
}

fn request() -> Request<()> {
    Request::get("/reports?year=2024")
        .extension(ActionDescriptor::new("Reports", "List"))
        .body(())
        .unwrap()
}

async fn serve(
    cache: &OutputCache<FileCacheStorage>,
    calls: &AtomicUsize,
    body: &'static str,
) -> Response<Bytes> {
    cache
        .serve(&request(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(
                Response::builder()
                    .header(header::CONTENT_TYPE, "text/csv")
                    .body(Bytes::from_static(body.as_bytes()))
                    .unwrap(),
            )
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn responses_persist_across_caches() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(start());
    let calls = AtomicUsize::new(0);

    let first = {
        let cache = OutputCache::new(FileCacheStorage::new(dir.path()).with_clock(clock.clone()))
            .with_clock(clock.clone());
        serve(&cache, &calls, "a,b\n1,2\n").await
    };
    assert_eq!(first.headers().get(X_CACHE).unwrap(), "MISS");

    // A new cache over the same directory sees the stored response
    let cache = OutputCache::new(FileCacheStorage::new(dir.path()).with_clock(clock.clone()))
        .with_clock(clock.clone());
    let second = serve(&cache, &calls, "changed").await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.body(), "a,b\n1,2\n");
    assert_eq!(second.headers().get(X_CACHE).unwrap(), "HIT");
    assert_eq!(second.headers().get(header::CONTENT_TYPE).unwrap(), "text/csv");
    assert_eq!(
        second.headers().get(header::ETAG),
        first.headers().get(header::ETAG)
    );
}

#[tokio::test]
async fn invalidation_and_expiration() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(start());
    let cache = OutputCache::new(FileCacheStorage::new(dir.path()).with_clock(clock.clone()))
        .with_clock(clock.clone());
    let calls = AtomicUsize::new(0);

    serve(&cache, &calls, "one").await;
    cache.invalidate_action("Reports", "List").await.unwrap();
    let response = serve(&cache, &calls, "two").await;
    assert_eq!(response.body(), "two");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    clock.advance(Duration::from_secs(60));
    let response = serve(&cache, &calls, "three").await;
    assert_eq!(response.body(), "three");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_share_storage() {
    let dir = tempdir().unwrap();
    let cache = Arc::new(OutputCache::new(FileCacheStorage::new(dir.path())));
    let calls = Arc::new(AtomicUsize::new(0));

    serve(&cache, &calls, "warm").await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move { serve(&cache, &calls, "cold").await })
        })
        .collect();

    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(response.body(), "warm");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
