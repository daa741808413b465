//! Download pool end-to-end: dedup, stats, concurrency, reference
//! refresh, and the chunked transfer wired in as the pool's download
//! function.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::DateTime;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tgrab::download::{ChunkedDownloader, DownloadFn, DownloadPool, RefreshFn};
use tgrab::error::Error;
use tgrab::media::{MediaDescriptor, MediaKind};

fn photo(peer_id: i64, message_id: i32, file_id: i64, size: i64) -> MediaDescriptor {
    MediaDescriptor {
        kind: MediaKind::Photo,
        file_id,
        access_hash: 42,
        file_reference: vec![1, 2, 3],
        thumb_size: "x".to_string(),
        declared_size: size,
        mime_type: "image/jpeg".to_string(),
        file_name: format!("photo_{file_id}.jpg"),
        message_id,
        peer_id,
        message_date: DateTime::UNIX_EPOCH,
    }
}

/// A download function backed by the real chunked engine over an
/// in-memory blob, the way the client wires it in production.
fn chunked_backend(reads: Arc<AtomicUsize>) -> DownloadFn {
    Arc::new(move |descriptor, dest, cancel| {
        let reads = Arc::clone(&reads);
        Box::pin(async move {
            let total = descriptor.declared_size;
            let fetch = move |offset: i64, limit: i32| {
                let reads = Arc::clone(&reads);
                async move {
                    reads.fetch_add(1, Ordering::SeqCst);
                    let len = (i64::from(limit)).min(total - offset).max(0) as usize;
                    Ok(vec![0xAB; len])
                }
            };
            ChunkedDownloader::new()
                .with_max_workers(2)
                .download(&cancel, fetch, total, &dest)
                .await
        })
    })
}

#[tokio::test]
async fn photo_downloads_once_then_skips() {
    let dir = TempDir::new().unwrap();
    let reads = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(DownloadPool::new(
        dir.path(),
        4,
        chunked_backend(Arc::clone(&reads)),
    ));
    let cancel = CancellationToken::new();

    pool.download_batch(&cancel, vec![photo(999, 42, 7001, 180 * 1024)])
        .await;

    let dest = dir.path().join("chat_999").join("photo_7001.jpg");
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 180 * 1024);

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.downloaded_bytes, 180 * 1024);

    // Second run over the same message: the file exists, no reads happen.
    let reads_before = reads.load(Ordering::SeqCst);
    pool.download_batch(&cancel, vec![photo(999, 42, 7001, 180 * 1024)])
        .await;

    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(reads.load(Ordering::SeqCst), reads_before);
}

#[tokio::test]
async fn redundant_submissions_only_increment_skipped() {
    let dir = TempDir::new().unwrap();
    let reads = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(DownloadPool::new(
        dir.path(),
        2,
        chunked_backend(Arc::clone(&reads)),
    ));
    let cancel = CancellationToken::new();

    pool.download_batch(&cancel, vec![photo(5, 1, 11, 4096)]).await;
    let reads_before = reads.load(Ordering::SeqCst);

    for _ in 0..3 {
        pool.download_batch(&cancel, vec![photo(5, 1, 11, 4096)]).await;
    }

    let stats = pool.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.skipped, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(reads.load(Ordering::SeqCst), reads_before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_respects_the_semaphore() {
    let dir = TempDir::new().unwrap();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let download: DownloadFn = {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        Arc::new(move |_descriptor, dest, _cancel| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            Box::pin(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
                std::fs::write(&dest, b"done").unwrap();
                Ok(())
            })
        })
    };

    let pool = Arc::new(DownloadPool::new(dir.path(), 2, download));
    let batch: Vec<_> = (0..10).map(|i| photo(1, i, i64::from(i), 16)).collect();
    pool.download_batch(&CancellationToken::new(), batch).await;

    let stats = pool.stats();
    assert_eq!(stats.completed, 10);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expired_reference_is_refreshed_once() {
    let dir = TempDir::new().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let download: DownloadFn = {
        let attempts = Arc::clone(&attempts);
        Arc::new(move |descriptor, dest, _cancel| {
            let attempts = Arc::clone(&attempts);
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if descriptor.file_reference == vec![0xDE, 0xAD] {
                    return Err(Error::ReferenceExpired);
                }
                std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
                std::fs::write(&dest, b"fresh").unwrap();
                Ok(())
            })
        })
    };

    let refresh: RefreshFn = Arc::new(|descriptor| {
        Box::pin(async move {
            Ok(Some(MediaDescriptor {
                file_reference: vec![1],
                ..descriptor
            }))
        })
    });

    let pool = Arc::new(DownloadPool::new(dir.path(), 1, download).with_refresh(refresh));

    let mut stale = photo(9, 1, 77, 16);
    stale.file_reference = vec![0xDE, 0xAD];
    pool.download_batch(&CancellationToken::new(), vec![stale]).await;

    let stats = pool.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(dir.path().join("chat_9").join("photo_77.jpg").exists());
}

#[tokio::test]
async fn refresh_that_finds_nothing_fails_the_file() {
    let dir = TempDir::new().unwrap();

    let download: DownloadFn =
        Arc::new(|_descriptor, _dest, _cancel| Box::pin(async { Err(Error::ReferenceExpired) }));
    let refresh: RefreshFn = Arc::new(|_descriptor| Box::pin(async { Ok(None) }));

    let pool = Arc::new(DownloadPool::new(dir.path(), 1, download).with_refresh(refresh));
    pool.download_batch(&CancellationToken::new(), vec![photo(9, 1, 77, 16)])
        .await;

    let stats = pool.stats();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_mid_download_counts_as_failed_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let reads = Arc::new(AtomicUsize::new(0));
    let download: DownloadFn = {
        let reads = Arc::clone(&reads);
        Arc::new(move |descriptor, dest, cancel| {
            let reads = Arc::clone(&reads);
            Box::pin(async move {
                let total = descriptor.declared_size;
                let fetch = move |offset: i64, limit: i32| {
                    let reads = Arc::clone(&reads);
                    async move {
                        reads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        let len = (i64::from(limit)).min(total - offset).max(0) as usize;
                        Ok(vec![0u8; len])
                    }
                };
                ChunkedDownloader::new()
                    .with_chunk_size(128 * 1024)
                    .with_max_workers(2)
                    .download(&cancel, fetch, total, &dest)
                    .await
            })
        })
    };

    let pool = Arc::new(DownloadPool::new(dir.path(), 1, download));

    let canceller = {
        let cancel = cancel.clone();
        let reads = Arc::clone(&reads);
        tokio::spawn(async move {
            // Let a few chunks start before pulling the plug.
            while reads.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        })
    };

    pool.download_batch(&cancel, vec![photo(3, 1, 500, 4 * 1024 * 1024)])
        .await;
    canceller.await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);

    let chat_dir = dir.path().join("chat_3");
    assert!(!chat_dir.join("photo_500.jpg").exists());
    assert!(!chat_dir.join("photo_500.jpg.tmp").exists());
}

#[tokio::test]
async fn nameless_media_falls_back_to_mime_derived_name() {
    let dir = TempDir::new().unwrap();

    let dests = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
    let download: DownloadFn = {
        let dests = Arc::clone(&dests);
        Arc::new(move |_descriptor, dest, _cancel| {
            let dests = Arc::clone(&dests);
            Box::pin(async move {
                std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
                std::fs::write(&dest, b"x").unwrap();
                dests.lock().unwrap().push(dest);
                Ok(())
            })
        })
    };

    let pool = Arc::new(DownloadPool::new(dir.path(), 1, download));
    let mut descriptor = photo(4, 12, 900, 16);
    descriptor.file_name = String::new();
    pool.download_batch(&CancellationToken::new(), vec![descriptor])
        .await;

    let dests = dests.lock().unwrap();
    assert_eq!(dests.len(), 1);
    assert_eq!(
        dests[0],
        dir.path().join("chat_4").join("file_12_900.jpg"),
    );
}
