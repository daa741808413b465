//! Backward history pagination.
//!
//! Pages are requested oldest-ward via `offset_id`; each page's media is
//! handed to the pool and drained before the next request, so a single
//! conversation never has more than one page in flight.

use std::future::Future;
use std::sync::Arc;

use grammers_tl_types as tl;
use tokio_util::sync::CancellationToken;

use crate::download::DownloadPool;
use crate::error::{Error, Result};
use crate::media;

pub struct HistoryWalker {
    batch_size: i32,
}

impl HistoryWalker {
    pub fn new(batch_size: i32) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Walk the full history of `peer_id`, newest to oldest. `fetch_page`
    /// returns one page of messages older than the given offset id
    /// (0 = start from the head). Returns the number of messages seen.
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        pool: &Arc<DownloadPool>,
        peer_id: i64,
        mut fetch_page: F,
    ) -> Result<u64>
    where
        F: FnMut(i32) -> Fut,
        Fut: Future<Output = Result<Vec<tl::enums::Message>>>,
    {
        let mut offset_id = 0i32;
        let mut processed = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            let page = fetch_page(offset_id).await?;
            if page.is_empty() {
                break;
            }

            let oldest = page.iter().filter_map(media::message_id).min().unwrap_or(0);
            if offset_id != 0 && oldest >= offset_id {
                // Ids must strictly decrease across pages; a stuck offset
                // would loop forever.
                log::warn!("history page did not advance (offset {offset_id}, oldest {oldest})");
                break;
            }

            processed += page.len() as u64;
            let batch: Vec<_> = page
                .iter()
                .filter_map(|m| media::extract_from_raw(m, peer_id))
                .collect();
            if !batch.is_empty() {
                log::info!(
                    "history page: {} messages, {} with media",
                    page.len(),
                    batch.len(),
                );
                pool.download_batch(cancel, batch).await;
            }

            if (page.len() as i32) < self.batch_size {
                break;
            }
            offset_id = oldest;
        }

        log::info!("history walk finished: {processed} messages seen");
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadFn;
    use std::sync::Mutex;

    fn empty_message(id: i32) -> tl::enums::Message {
        tl::enums::Message::Empty(tl::types::MessageEmpty { id, peer_id: None })
    }

    fn page(from: i32, count: i32) -> Vec<tl::enums::Message> {
        (0..count).map(|i| empty_message(from - i)).collect()
    }

    fn noop_pool() -> Arc<DownloadPool> {
        let download: DownloadFn = Arc::new(|_, _, _| Box::pin(async { Ok(()) }));
        Arc::new(DownloadPool::new("/tmp/unused", 1, download))
    }

    #[tokio::test]
    async fn stops_after_a_short_page() {
        // Pages of 100, 100, 37: the short page ends the walk with no
        // fourth request.
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let pages = Arc::new(Mutex::new(vec![page(1000, 100), page(900, 100), page(800, 37)]));

        let walker = HistoryWalker::new(100);
        let cancel = CancellationToken::new();
        let seen = {
            let offsets = Arc::clone(&offsets);
            let pages = Arc::clone(&pages);
            walker
                .run(&cancel, &noop_pool(), 1, move |offset_id| {
                    offsets.lock().unwrap().push(offset_id);
                    let mut pages = pages.lock().unwrap();
                    let next = if pages.is_empty() { Vec::new() } else { pages.remove(0) };
                    async move { Ok(next) }
                })
                .await
                .unwrap()
        };

        assert_eq!(seen, 237);
        assert_eq!(*offsets.lock().unwrap(), vec![0, 901, 801]);
    }

    #[tokio::test]
    async fn empty_history_terminates_immediately() {
        let walker = HistoryWalker::new(100);
        let cancel = CancellationToken::new();
        let seen = walker
            .run(&cancel, &noop_pool(), 1, |_| async { Ok(Vec::new()) })
            .await
            .unwrap();
        assert_eq!(seen, 0);
    }

    #[tokio::test]
    async fn full_last_page_probes_once_more() {
        let pages = Arc::new(Mutex::new(vec![page(100, 100)]));
        let calls = Arc::new(Mutex::new(0));

        let walker = HistoryWalker::new(100);
        let cancel = CancellationToken::new();
        let seen = {
            let pages = Arc::clone(&pages);
            let calls = Arc::clone(&calls);
            walker
                .run(&cancel, &noop_pool(), 1, move |_| {
                    *calls.lock().unwrap() += 1;
                    let mut pages = pages.lock().unwrap();
                    let next = if pages.is_empty() { Vec::new() } else { pages.remove(0) };
                    async move { Ok(next) }
                })
                .await
                .unwrap()
        };

        assert_eq!(seen, 100);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn non_advancing_offset_breaks_the_loop() {
        let walker = HistoryWalker::new(2);
        let cancel = CancellationToken::new();
        // Server keeps returning the same full page.
        let seen = walker
            .run(&cancel, &noop_pool(), 1, |_| async { Ok(page(10, 2)) })
            .await
            .unwrap();
        assert_eq!(seen, 4);
    }

    #[tokio::test]
    async fn cancellation_stops_the_walk() {
        let walker = HistoryWalker::new(100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = walker
            .run(&cancel, &noop_pool(), 1, |_| async { Ok(page(100, 100)) })
            .await;
        assert!(matches!(result, Err(Error::Canceled)));
    }
}
