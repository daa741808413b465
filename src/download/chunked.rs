//! Byte-range-parallel file download with atomic publish.
//!
//! Chunks fan out over a bounded job channel into worker tasks that write
//! at their exact offsets in a pre-allocated temp file; the destination
//! only ever appears via rename after the last byte is flushed. The
//! single-shot path used for small files is this same engine with one
//! worker.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::ensure_dir;

/// Server-mandated cap on a single `upload.getFile` read.
pub const MAX_FETCH_LIMIT: i32 = 512 * 1024;
/// Both offset and limit must be multiples of this.
pub const FETCH_ALIGNMENT: i64 = 1024;

const DEFAULT_CHUNK_SIZE: i64 = 512 * 1024;
const DEFAULT_MAX_WORKERS: usize = 4;
const JOB_QUEUE_MULTIPLIER: usize = 2;
const CHUNK_RETRIES: u32 = 3;
const CHUNK_RETRY_DELAY: Duration = Duration::from_secs(1);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const RENAME_RETRIES: u32 = 5;
const RENAME_RETRY_DELAY: Duration = Duration::from_millis(500);

pub type ProgressCallback = Arc<dyn Fn(i64, i64) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct ChunkJob {
    offset: i64,
    /// Payload length; the wire request rounds this up to the alignment.
    len: i64,
}

#[derive(Clone)]
pub struct ChunkedDownloader {
    chunk_size: i64,
    max_workers: usize,
    progress: Option<ProgressCallback>,
}

impl ChunkedDownloader {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            progress: None,
        }
    }

    /// Set the chunk size in bytes, aligned down and clamped to the
    /// server cap so every request stays valid.
    pub fn with_chunk_size(mut self, bytes: i64) -> Self {
        let aligned = (bytes / FETCH_ALIGNMENT) * FETCH_ALIGNMENT;
        self.chunk_size = aligned.clamp(FETCH_ALIGNMENT, i64::from(MAX_FETCH_LIMIT));
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Download `total_size` bytes via `fetch(offset, limit)` calls into
    /// `dest`. On any failure (including cancellation) the temp file is
    /// removed and `dest` is left untouched.
    pub async fn download<F, Fut>(
        &self,
        cancel: &CancellationToken,
        fetch: F,
        total_size: i64,
        dest: &Path,
    ) -> Result<()>
    where
        F: Fn(i64, i32) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        reject_traversal(dest)?;
        if let Some(parent) = dest.parent() {
            ensure_dir(parent).await?;
        }

        let tmp = temp_path(dest);
        let file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Error::fs("create", &tmp, e))?;
        if total_size > 0 {
            if let Err(e) = file.set_len(total_size as u64).await {
                log::warn!("pre-allocation of {} bytes failed: {e}", total_size);
            }
        }
        drop(file);

        log::debug!(
            "chunked download: {} bytes in {} chunks, {} workers -> {}",
            total_size,
            chunk_count(total_size, self.chunk_size),
            self.max_workers,
            dest.display(),
        );

        match self.run_chunks(cancel, fetch, total_size, &tmp).await {
            Ok(()) => publish(&tmp, dest).await,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(err)
            }
        }
    }

    /// Sequential fallback for media with no declared size: read aligned
    /// chunks forward until the server returns a short one.
    pub async fn download_unsized<F, Fut>(
        &self,
        cancel: &CancellationToken,
        fetch: F,
        dest: &Path,
    ) -> Result<()>
    where
        F: Fn(i64, i32) -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        reject_traversal(dest)?;
        if let Some(parent) = dest.parent() {
            ensure_dir(parent).await?;
        }

        let tmp = temp_path(dest);
        let result = async {
            let mut file = tokio::fs::File::create(&tmp)
                .await
                .map_err(|e| Error::fs("create", &tmp, e))?;

            let limit = request_limit(self.chunk_size);
            let mut offset = 0i64;
            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Canceled);
                }
                let bytes = fetch(offset, limit).await?;
                file.write_all(&bytes)
                    .await
                    .map_err(|e| Error::fs("write", &tmp, e))?;
                offset += bytes.len() as i64;
                if bytes.len() < limit as usize {
                    break;
                }
            }

            file.sync_all().await.map_err(|e| Error::fs("sync", &tmp, e))?;
            if let Some(progress) = &self.progress {
                progress(offset, offset);
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => publish(&tmp, dest).await,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(err)
            }
        }
    }

    async fn run_chunks<F, Fut>(
        &self,
        cancel: &CancellationToken,
        fetch: F,
        total_size: i64,
        tmp: &Path,
    ) -> Result<()>
    where
        F: Fn(i64, i32) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let token = cancel.child_token();
        let done = Arc::new(Mutex::new(0i64));

        let ticker = self.progress.clone().map(|progress| {
            let token = token.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = interval.tick() => {
                            let current = *done.lock().expect("progress lock");
                            progress(current, total_size);
                        }
                    }
                }
            })
        });

        let (tx, rx) = mpsc::channel::<ChunkJob>(self.max_workers * JOB_QUEUE_MULTIPLIER);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        for _ in 0..self.max_workers {
            workers.spawn(chunk_worker(
                token.clone(),
                fetch.clone(),
                tmp.to_path_buf(),
                Arc::clone(&rx),
                Arc::clone(&done),
            ));
        }
        drop(rx);

        let producer = {
            let token = token.clone();
            let chunk_size = self.chunk_size;
            tokio::spawn(async move {
                let mut offset = 0i64;
                while offset < total_size {
                    let job = ChunkJob {
                        offset,
                        len: chunk_size.min(total_size - offset),
                    };
                    tokio::select! {
                        _ = token.cancelled() => return,
                        sent = tx.send(job) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    offset += job.len;
                }
            })
        };

        let mut first_err: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            let worker_result = match joined {
                Ok(result) => result,
                Err(join_err) => Err(Error::Transport(format!("chunk worker died: {join_err}"))),
            };
            if let Err(err) = worker_result {
                if first_err.is_none() {
                    // Short-circuit the remaining chunks.
                    token.cancel();
                    first_err = Some(err);
                }
            }
        }
        let _ = producer.await;
        token.cancel();
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }

        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(tmp)
            .await
            .map_err(|e| Error::fs("open", tmp, e))?;
        file.sync_all().await.map_err(|e| Error::fs("sync", tmp, e))?;

        if let Some(progress) = &self.progress {
            progress(total_size, total_size);
        }
        Ok(())
    }
}

impl Default for ChunkedDownloader {
    fn default() -> Self {
        Self::new()
    }
}

async fn chunk_worker<F, Fut>(
    token: CancellationToken,
    fetch: F,
    tmp: PathBuf,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ChunkJob>>>,
    done: Arc<Mutex<i64>>,
) -> Result<()>
where
    F: Fn(i64, i32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
{
    let mut file: Option<tokio::fs::File> = None;

    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Canceled),
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            }
        };

        let mut bytes = fetch_chunk(&token, &fetch, job).await?;
        let expected = job.len as usize;
        if bytes.len() < expected {
            return Err(Error::Transport(format!(
                "short chunk at offset {}: got {} of {} bytes",
                job.offset,
                bytes.len(),
                expected,
            )));
        }
        // The request limit is aligned upward; drop the overshoot.
        bytes.truncate(expected);

        let handle = match file.as_mut() {
            Some(handle) => handle,
            None => {
                let opened = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&tmp)
                    .await
                    .map_err(|e| Error::fs("open", &tmp, e))?;
                file.insert(opened)
            }
        };
        handle
            .seek(SeekFrom::Start(job.offset as u64))
            .await
            .map_err(|e| Error::fs("seek", &tmp, e))?;
        handle
            .write_all(&bytes)
            .await
            .map_err(|e| Error::fs("write", &tmp, e))?;

        *done.lock().expect("progress lock") += expected as i64;
    }

    Ok(())
}

async fn fetch_chunk<F, Fut>(
    token: &CancellationToken,
    fetch: &F,
    job: ChunkJob,
) -> Result<Vec<u8>>
where
    F: Fn(i64, i32) -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
{
    debug_assert_eq!(job.offset % FETCH_ALIGNMENT, 0);
    let limit = request_limit(job.len);

    let mut last_err = None;
    for attempt in 1..=CHUNK_RETRIES {
        match fetch(job.offset, limit).await {
            Ok(bytes) => return Ok(bytes),
            Err(Error::Canceled) => return Err(Error::Canceled),
            Err(err) => {
                log::warn!(
                    "chunk at offset {} failed (attempt {attempt}/{CHUNK_RETRIES}): {err}",
                    job.offset,
                );
                last_err = Some(err);
                let delay = CHUNK_RETRY_DELAY * attempt;
                tokio::select! {
                    _ = token.cancelled() => return Err(Error::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    Err(last_err.expect("chunk retries recorded an error"))
}

/// `i64::div_ceil` is still unstable (`int_roundings`); inline the same
/// formula for non-negative operands.
fn div_ceil_i64(lhs: i64, rhs: i64) -> i64 {
    (lhs + rhs - 1) / rhs
}

/// Wire limit for a payload of `len` bytes: aligned up, capped.
fn request_limit(len: i64) -> i32 {
    let aligned = div_ceil_i64(len, FETCH_ALIGNMENT) * FETCH_ALIGNMENT;
    aligned.min(i64::from(MAX_FETCH_LIMIT)) as i32
}

fn chunk_count(total_size: i64, chunk_size: i64) -> i64 {
    div_ceil_i64(total_size, chunk_size.max(1))
}

fn temp_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

fn reject_traversal(path: &Path) -> Result<()> {
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::PathSafety(path.to_path_buf()));
    }
    Ok(())
}

/// Rename with retries; a briefly-held handle on some platforms can race
/// the first attempt.
async fn publish(tmp: &Path, dest: &Path) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=RENAME_RETRIES {
        match tokio::fs::rename(tmp, dest).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                log::warn!("rename to {} failed (attempt {attempt}): {err}", dest.display());
                last_err = Some(err);
                if attempt < RENAME_RETRIES {
                    tokio::time::sleep(RENAME_RETRY_DELAY).await;
                }
            }
        }
    }
    let _ = tokio::fs::remove_file(tmp).await;
    Err(Error::fs(
        "rename",
        dest,
        last_err.expect("rename retries recorded an error"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_limit_is_aligned_and_capped() {
        assert_eq!(request_limit(1), 1024);
        assert_eq!(request_limit(1024), 1024);
        assert_eq!(request_limit(1025), 2048);
        assert_eq!(request_limit(180 * 1024), 180 * 1024);
        assert_eq!(request_limit(512 * 1024), MAX_FETCH_LIMIT);
        assert_eq!(request_limit(10 * 1024 * 1024), MAX_FETCH_LIMIT);
    }

    #[test]
    fn chunk_size_is_clamped_to_valid_requests() {
        assert_eq!(ChunkedDownloader::new().with_chunk_size(1000).chunk_size, 1024);
        assert_eq!(
            ChunkedDownloader::new().with_chunk_size(300 * 1024 + 7).chunk_size,
            300 * 1024
        );
        assert_eq!(
            ChunkedDownloader::new().with_chunk_size(4 * 1024 * 1024).chunk_size,
            i64::from(MAX_FETCH_LIMIT)
        );
    }

    #[test]
    fn traversal_paths_are_rejected() {
        assert!(reject_traversal(Path::new("downloads/chat_1/a.jpg")).is_ok());
        assert!(matches!(
            reject_traversal(Path::new("downloads/../etc/passwd")),
            Err(Error::PathSafety(_))
        ));
    }

    #[test]
    fn temp_path_appends_suffix() {
        assert_eq!(
            temp_path(Path::new("downloads/a.tar.gz")),
            Path::new("downloads/a.tar.gz.tmp")
        );
    }

    #[test]
    fn chunk_counts() {
        assert_eq!(chunk_count(0, 512), 0);
        assert_eq!(chunk_count(512, 512), 1);
        assert_eq!(chunk_count(513, 512), 2);
        assert_eq!(chunk_count(5 * 1024 * 1024, 512 * 1024), 10);
    }
}
