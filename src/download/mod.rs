//! Concurrency-bounded download fan-out with dedup and stats.
//!
//! The pool owns the destination layout (`<root>/chat_<peer>/<name>`),
//! the filename sanitizer, and the path-safety check. The actual byte
//! transfer is an injected function so the history walker, the live
//! follower, and the tests all drive the same machinery.

pub mod chunked;

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use chunked::{ChunkedDownloader, ProgressCallback, FETCH_ALIGNMENT, MAX_FETCH_LIMIT};

use crate::error::{Error, Result};
use crate::media::MediaDescriptor;

pub type DownloadFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Transfers one file to the given destination path.
pub type DownloadFn =
    Arc<dyn Fn(MediaDescriptor, PathBuf, CancellationToken) -> DownloadFuture + Send + Sync>;

pub type RefreshFuture = Pin<Box<dyn Future<Output = Result<Option<MediaDescriptor>>> + Send>>;

/// Re-fetches the owning message to renew an expired file reference.
pub type RefreshFn = Arc<dyn Fn(MediaDescriptor) -> RefreshFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total_bytes: i64,
    pub downloaded_bytes: i64,
}

pub struct DownloadPool {
    root: PathBuf,
    semaphore: Arc<Semaphore>,
    stats: Mutex<DownloadStats>,
    download: DownloadFn,
    refresh: Option<RefreshFn>,
}

impl DownloadPool {
    pub fn new(root: impl Into<PathBuf>, max_concurrent: usize, download: DownloadFn) -> Self {
        Self {
            root: root.into(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            stats: Mutex::new(DownloadStats::default()),
            download,
            refresh: None,
        }
    }

    pub fn with_refresh(mut self, refresh: RefreshFn) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// Submit a whole history batch and wait for it to drain.
    pub async fn download_batch(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        batch: Vec<MediaDescriptor>,
    ) {
        {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.total += batch.len() as u64;
            stats.total_bytes += batch.iter().map(|d| d.declared_size).sum::<i64>();
        }

        let mut tasks = JoinSet::new();
        for descriptor in batch {
            let pool = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => None,
                    permit = Arc::clone(&pool.semaphore).acquire_owned() => permit.ok(),
                };
                match permit {
                    Some(_permit) => pool.download_one(&cancel, descriptor).await,
                    None => pool.record_failure(&descriptor.file_name, &Error::Canceled),
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Submit a single live-follower file without blocking the caller.
    /// The task runs in a detached scope with its own root token, so an
    /// in-flight download survives the dispatcher unwinding.
    pub fn submit_detached(self: &Arc<Self>, descriptor: MediaDescriptor) {
        {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.total += 1;
            stats.total_bytes += descriptor.declared_size;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let _permit = Arc::clone(&pool.semaphore).acquire_owned().await.ok();
            pool.download_one(&cancel, descriptor).await;
        });
    }

    async fn download_one(&self, cancel: &CancellationToken, descriptor: MediaDescriptor) {
        let dest = match self.dest_path(&descriptor) {
            Ok(dest) => dest,
            Err(err) => {
                self.record_failure(&descriptor.file_name, &err);
                return;
            }
        };

        if dest.exists() {
            log::debug!("already downloaded, skipping: {}", dest.display());
            self.stats.lock().expect("stats lock").skipped += 1;
            return;
        }

        log::info!(
            "downloading {} ({} bytes)",
            dest.display(),
            descriptor.declared_size,
        );

        let size = descriptor.declared_size;
        let name = descriptor.file_name.clone();
        match self.transfer(cancel, descriptor, &dest).await {
            Ok(()) => {
                log::info!("download complete: {}", dest.display());
                let mut stats = self.stats.lock().expect("stats lock");
                stats.completed += 1;
                stats.downloaded_bytes += size;
            }
            Err(err) => self.record_failure(&name, &err),
        }
    }

    async fn transfer(
        &self,
        cancel: &CancellationToken,
        descriptor: MediaDescriptor,
        dest: &Path,
    ) -> Result<()> {
        let first = (self.download)(descriptor.clone(), dest.to_path_buf(), cancel.clone()).await;
        let Err(Error::ReferenceExpired) = &first else {
            return first;
        };
        let Some(refresh) = &self.refresh else {
            return first;
        };

        log::info!(
            "file reference expired for message {}, re-fetching",
            descriptor.message_id,
        );
        match refresh(descriptor).await? {
            Some(fresh) => (self.download)(fresh, dest.to_path_buf(), cancel.clone()).await,
            None => Err(Error::ReferenceExpired),
        }
    }

    fn record_failure(&self, name: &str, err: &Error) {
        log::error!("download failed for {name}: {err}");
        self.stats.lock().expect("stats lock").failed += 1;
    }

    pub fn stats(&self) -> DownloadStats {
        *self.stats.lock().expect("stats lock")
    }

    pub fn log_summary(&self) {
        const MIB: f64 = 1024.0 * 1024.0;
        let stats = self.stats();
        log::info!("download summary:");
        log::info!("  total:      {}", stats.total);
        log::info!("  completed:  {}", stats.completed);
        log::info!("  failed:     {}", stats.failed);
        log::info!("  skipped:    {}", stats.skipped);
        log::info!("  total size: {:.2} MiB", stats.total_bytes as f64 / MIB);
        log::info!(
            "  downloaded: {:.2} MiB",
            stats.downloaded_bytes as f64 / MIB
        );
    }

    /// `<root>/chat_<peer_id>/<sanitized-name>`, refused if it escapes
    /// the download root.
    fn dest_path(&self, descriptor: &MediaDescriptor) -> Result<PathBuf> {
        let name = if descriptor.file_name.is_empty() {
            format!(
                "file_{}_{}{}",
                descriptor.message_id,
                descriptor.file_id,
                extension_for_mime(&descriptor.mime_type),
            )
        } else {
            descriptor.file_name.clone()
        };
        let name = sanitize_file_name(&name);

        let path = self
            .root
            .join(format!("chat_{}", descriptor.peer_id))
            .join(name);
        if !is_safe_path(&path, &self.root) {
            return Err(Error::PathSafety(path));
        }
        Ok(path)
    }
}

/// Create the directory (and parents) with owner-group-only permissions.
pub(crate) async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::fs("mkdir", path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o750)).await;
    }
    Ok(())
}

/// Strip path separators and other characters that are unsafe in file
/// names. Idempotent: sanitizing twice yields the same name.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = name.replace("..", "_");
    for ch in ['/', '\\', ':', '*', '?', '"', '<', '>', '|'] {
        out = out.replace(ch, "_");
    }
    if out.is_empty() || out == "." {
        return "unnamed_file".to_string();
    }
    out
}

/// Lexical containment check: the normalized absolute destination must
/// live under the normalized absolute root.
pub fn is_safe_path(path: &Path, root: &Path) -> bool {
    let path = lexical_absolute(path);
    let root = lexical_absolute(root);
    path.starts_with(&root)
}

fn lexical_absolute(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Extension (with dot) for well-known mime types; empty otherwise.
pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "video/mp4" => ".mp4",
        "video/avi" => ".avi",
        "video/mov" => ".mov",
        "video/webm" => ".webm",
        "audio/mp3" => ".mp3",
        "audio/ogg" => ".ogg",
        "application/pdf" => ".pdf",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizer_replaces_dangerous_characters() {
        assert_eq!(sanitize_file_name("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_/_/etc/passwd".replace('/', "_"));
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
    }

    #[test]
    fn sanitizer_rejects_degenerate_names() {
        assert_eq!(sanitize_file_name(""), "unnamed_file");
        assert_eq!(sanitize_file_name("."), "unnamed_file");
        // ".." collapses to "_" before the degenerate check.
        assert_eq!(sanitize_file_name(".."), "_");
    }

    #[test]
    fn sanitizer_is_idempotent() {
        for name in ["../../x", "a:b*c", "", ".", "..", "ok.bin", "папка/файл"] {
            let once = sanitize_file_name(name);
            assert_eq!(sanitize_file_name(&once), once, "not idempotent for {name:?}");
        }
    }

    #[test]
    fn safe_path_requires_root_prefix() {
        assert!(is_safe_path(
            Path::new("/data/downloads/chat_1/a.jpg"),
            Path::new("/data/downloads"),
        ));
        assert!(!is_safe_path(
            Path::new("/data/downloads/../secrets"),
            Path::new("/data/downloads"),
        ));
        assert!(!is_safe_path(
            Path::new("/elsewhere/file"),
            Path::new("/data/downloads"),
        ));
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        assert!(is_safe_path(
            Path::new("downloads/chat_9/x.bin"),
            Path::new("downloads"),
        ));
        assert!(!is_safe_path(
            Path::new("downloads/../outside"),
            Path::new("downloads"),
        ));
    }

    #[test]
    fn known_mime_types_map_to_extensions() {
        assert_eq!(extension_for_mime("image/jpeg"), ".jpg");
        assert_eq!(extension_for_mime("application/pdf"), ".pdf");
        assert_eq!(extension_for_mime("application/x-unknown"), "");
    }
}
