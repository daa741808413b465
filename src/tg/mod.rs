//! Telegram client facade.
//!
//! Assembles the sender pool over the stored session, runs the auth flow,
//! and funnels every raw RPC through the pacing middleware: the
//! flood-waiter wraps (rate-limit acquire → transport), so a flood-wait
//! retry re-takes a rate-limit token.

pub mod history;
pub mod updates;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use grammers_client::types::Peer;
use grammers_client::{Client, SignInError};
use grammers_mtsender::SenderPool;
use grammers_session::defs::PeerRef;
use grammers_session::storages::SqliteSession;
use grammers_session::updates::UpdatesLike;
use grammers_tl_types as tl;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DownloadConfig};
use crate::download::{ChunkedDownloader, DownloadFn, RefreshFn};
use crate::error::{Error, Result};
use crate::media::{self, MediaDescriptor};
use crate::middleware::{FloodWaiter, RateLimiter};
use crate::prompt::UserInteraction;
use crate::retry::Retrier;
use crate::session::SessionStore;

/// Files above this size use the parallel chunked path (when enabled);
/// smaller ones go through the same engine with a single worker.
const CHUNKED_THRESHOLD: i64 = 1024 * 1024;

/// A dialog entry offered for interactive selection.
#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub id: i64,
    pub title: String,
    pub kind: &'static str,
}

/// The resolved conversation this run downloads from.
#[derive(Debug, Clone)]
pub struct TargetPeer {
    pub id: i64,
    pub title: String,
    pub input: tl::enums::InputPeer,
}

pub struct TgClient {
    pub client: Client,
    #[allow(dead_code)]
    session: Arc<SqliteSession>,
    phone: String,
    api_hash: String,
    limiter: RateLimiter,
    flood: FloodWaiter,
    retrier: Retrier,
    cancel: CancellationToken,
    pool_handle: tokio::task::JoinHandle<()>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<UpdatesLike>>>,
}

impl TgClient {
    /// Connect the transport over the stored session. Authorization is
    /// checked separately via [`TgClient::ensure_authorized`].
    pub fn connect(
        config: &Config,
        store: &SessionStore,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if store.has_valid_session(&config.api.phone) {
            log::info!("existing session found, attempting automatic login");
        } else {
            log::info!("no session file found, first login required");
        }
        let session = store.open(&config.api.phone)?;

        let pool = SenderPool::new(Arc::clone(&session), config.api.id);
        let client = Client::new(&pool);
        let SenderPool {
            runner, updates, ..
        } = pool;

        let runner_cancel = cancel.clone();
        let pool_handle = tokio::spawn(async move {
            tokio::select! {
                _ = runner_cancel.cancelled() => {}
                _ = runner.run() => {}
            }
        });

        Ok(Self {
            client,
            session,
            phone: config.api.phone.clone(),
            api_hash: config.api.hash.clone(),
            limiter: RateLimiter::new(
                config.rate_limit.requests_per_second,
                config.rate_limit.burst_size,
            ),
            flood: FloodWaiter::new(),
            retrier: Retrier::new(&config.retry),
            cancel,
            pool_handle,
            updates_rx: Mutex::new(Some(updates)),
        })
    }

    /// Take the update receiver for the live follower. Yields once.
    pub fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<UpdatesLike>> {
        self.updates_rx.lock().expect("updates lock").take()
    }

    /// Sign in if the session is not yet authorized, prompting for the
    /// login code and, when 2FA is enabled, the password.
    pub async fn ensure_authorized(&self, prompts: &dyn UserInteraction) -> Result<()> {
        let authorized = self
            .client
            .is_authorized()
            .await
            .map_err(Error::from_invocation)?;
        if authorized {
            log::info!("logged in with the existing session");
            return Ok(());
        }

        log::info!("not authorized, starting login flow");
        let token = self
            .client
            .request_login_code(&self.phone, &self.api_hash)
            .await
            .map_err(|e| Error::Auth(format!("request login code for {}: {e}", self.phone)))?;

        let code = prompts.ask_code(&self.phone)?;
        match self.client.sign_in(&token, &code).await {
            Ok(user) => {
                log::info!("signed in as {}", user.first_name().unwrap_or_default());
            }
            Err(SignInError::PasswordRequired(password_token)) => {
                let hint = password_token.hint().unwrap_or_default().to_string();
                let password = prompts.ask_password(&hint)?;
                let user = self
                    .client
                    .check_password(password_token, password.as_bytes().to_vec())
                    .await
                    .map_err(|e| Error::Auth(format!("2FA password check: {e}")))?;
                log::info!(
                    "signed in with 2FA as {}",
                    user.first_name().unwrap_or_default()
                );
            }
            Err(e) => return Err(Error::Auth(format!("sign in: {e}"))),
        }
        Ok(())
    }

    /// Cheap connectivity probe.
    pub async fn probe(&self) -> Result<()> {
        let tl::enums::Config::Config(config) = self.invoke(&tl::functions::help::GetConfig {}).await?;
        log::debug!(
            "connected to dc {} ({} dc options)",
            config.this_dc,
            config.dc_options.len(),
        );
        Ok(())
    }

    /// Invoke a raw RPC through the pacing chain.
    pub async fn invoke<R>(&self, request: &R) -> Result<R::Return>
    where
        R: tl::RemoteCall,
    {
        self.flood
            .run(&self.cancel, || async move {
                self.limiter.acquire(&self.cancel).await?;
                self.client
                    .invoke(request)
                    .await
                    .map_err(Error::from_invocation)
            })
            .await
    }

    /// First `limit` dialogs, for the interactive chooser.
    pub async fn list_chats(&self, limit: usize) -> Result<Vec<ChatInfo>> {
        let mut dialogs = self.client.iter_dialogs();
        let mut chats = Vec::new();
        while chats.len() < limit {
            self.limiter.acquire(&self.cancel).await?;
            let Some(dialog) = dialogs.next().await.map_err(Error::from_invocation)? else {
                break;
            };
            let peer = dialog.peer();
            chats.push(ChatInfo {
                id: peer.id().bare_id(),
                title: chat_title(peer),
                kind: chat_kind(peer),
            });
        }
        Ok(chats)
    }

    /// Find the target conversation among the dialogs and capture the
    /// input peer used for history and file requests.
    pub async fn resolve_target(&self, target_id: i64) -> Result<TargetPeer> {
        let mut dialogs = self.client.iter_dialogs();
        loop {
            self.limiter.acquire(&self.cancel).await?;
            let Some(dialog) = dialogs.next().await.map_err(Error::from_invocation)? else {
                break;
            };
            let peer = dialog.peer();
            if peer.id().bare_id() == target_id {
                return Ok(TargetPeer {
                    id: target_id,
                    title: chat_title(peer),
                    input: PeerRef::from(peer).into(),
                });
            }
        }
        Err(Error::Config(format!(
            "chat {target_id} not found among your dialogs"
        )))
    }

    /// One page of history, newest first, older than `offset_id`
    /// (0 = from the most recent message).
    pub async fn fetch_history_page(
        &self,
        peer: &TargetPeer,
        offset_id: i32,
        limit: i32,
    ) -> Result<Vec<tl::enums::Message>> {
        let request = tl::functions::messages::GetHistory {
            peer: peer.input.clone(),
            offset_id,
            offset_date: 0,
            add_offset: 0,
            limit,
            max_id: 0,
            min_id: 0,
            hash: 0,
        };
        Ok(messages_from(self.invoke(&request).await?))
    }

    /// Newest message id in the conversation, if any.
    pub async fn latest_message_id(&self, peer: &TargetPeer) -> Result<Option<i32>> {
        let page = self.fetch_history_page(peer, 0, 1).await?;
        Ok(page.first().and_then(media::message_id))
    }

    /// One aligned byte-range read. Offsets and limits are rejected
    /// client-side before the server would.
    pub async fn fetch_file_chunk(
        &self,
        location: &tl::enums::InputFileLocation,
        offset: i64,
        limit: i32,
    ) -> Result<Vec<u8>> {
        if offset % crate::download::FETCH_ALIGNMENT != 0
            || i64::from(limit) % crate::download::FETCH_ALIGNMENT != 0
            || limit > crate::download::MAX_FETCH_LIMIT
        {
            return Err(Error::Rpc {
                name: "LIMIT_INVALID".to_string(),
                code: 400,
            });
        }

        let request = tl::functions::upload::GetFile {
            precise: true,
            cdn_supported: false,
            location: location.clone(),
            offset,
            limit,
        };
        match self.invoke(&request).await? {
            tl::enums::upload::File::File(file) => Ok(file.bytes),
            tl::enums::upload::File::CdnRedirect(_) => {
                Err(Error::Transport("unexpected CDN redirect".to_string()))
            }
        }
    }

    /// Re-fetch the message owning a media object and re-extract its
    /// descriptor (fresh file reference).
    pub async fn refetch_media(
        &self,
        peer_input: tl::enums::InputPeer,
        message_id: i32,
        peer_id: i64,
    ) -> Result<Option<MediaDescriptor>> {
        let request = tl::functions::messages::GetHistory {
            peer: peer_input,
            offset_id: message_id + 1,
            offset_date: 0,
            add_offset: 0,
            limit: 1,
            max_id: 0,
            min_id: 0,
            hash: 0,
        };
        let messages = messages_from(self.invoke(&request).await?);
        Ok(messages
            .into_iter()
            .filter(|m| media::message_id(m) == Some(message_id))
            .find_map(|m| media::extract_from_raw(&m, peer_id)))
    }

    /// Build the pool's transfer function: chunked for large files when
    /// enabled, the single-worker path otherwise, retried on transient
    /// transport failures.
    pub fn make_download_fn(self: &Arc<Self>, config: &DownloadConfig) -> DownloadFn {
        let client = Arc::clone(self);
        let use_chunked = config.use_chunked;
        let chunk_size = config.chunk_size_bytes();
        let max_workers = config.max_workers;

        Arc::new(move |descriptor, dest, cancel| {
            let client = Arc::clone(&client);
            Box::pin(async move {
                client
                    .download_file(descriptor, dest, cancel, use_chunked, chunk_size, max_workers)
                    .await
            })
        })
    }

    /// Build the pool's reference-refresh hook for the target peer.
    pub fn make_refresh_fn(self: &Arc<Self>, peer: &TargetPeer) -> RefreshFn {
        let client = Arc::clone(self);
        let input = peer.input.clone();
        Arc::new(move |descriptor| {
            let client = Arc::clone(&client);
            let input = input.clone();
            Box::pin(async move {
                client
                    .refetch_media(input, descriptor.message_id, descriptor.peer_id)
                    .await
            })
        })
    }

    async fn download_file(
        self: Arc<Self>,
        descriptor: MediaDescriptor,
        dest: PathBuf,
        cancel: CancellationToken,
        use_chunked: bool,
        chunk_size: i64,
        max_workers: usize,
    ) -> Result<()> {
        let location = descriptor.input_location();
        let fetch = {
            let client = Arc::clone(&self);
            move |offset, limit| {
                let client = Arc::clone(&client);
                let location = location.clone();
                async move { client.fetch_file_chunk(&location, offset, limit).await }
            }
        };

        let workers = if use_chunked && descriptor.declared_size > CHUNKED_THRESHOLD {
            max_workers
        } else {
            1
        };
        let label = descriptor.file_name.clone();
        let downloader = ChunkedDownloader::new()
            .with_chunk_size(chunk_size)
            .with_max_workers(workers)
            .with_progress(Arc::new(move |done, total| {
                if total > 0 {
                    log::info!(
                        "{label}: {:.1}% ({done}/{total} bytes)",
                        done as f64 * 100.0 / total as f64,
                    );
                }
            }));

        let size = descriptor.declared_size;
        self.retrier
            .run(&cancel, || {
                let downloader = downloader.clone();
                let fetch = fetch.clone();
                let dest = dest.clone();
                let cancel = cancel.clone();
                async move {
                    if size > 0 {
                        downloader.download(&cancel, fetch, size, &dest).await
                    } else {
                        downloader.download_unsized(&cancel, fetch, &dest).await
                    }
                }
            })
            .await
    }
}

impl Drop for TgClient {
    fn drop(&mut self) {
        self.client.disconnect();
        self.pool_handle.abort();
    }
}

fn messages_from(result: tl::enums::messages::Messages) -> Vec<tl::enums::Message> {
    use tl::enums::messages::Messages;
    match result {
        Messages::Messages(m) => m.messages,
        Messages::Slice(m) => m.messages,
        Messages::ChannelMessages(m) => m.messages,
        Messages::NotModified(_) => Vec::new(),
    }
}

fn chat_kind(peer: &Peer) -> &'static str {
    match peer {
        Peer::User(_) => "user",
        Peer::Group(_) => "group",
        Peer::Channel(c) => {
            if c.raw.megagroup {
                "supergroup"
            } else {
                "channel"
            }
        }
    }
}

fn chat_title(peer: &Peer) -> String {
    match peer {
        Peer::User(u) => u
            .first_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("User {}", u.bare_id())),
        Peer::Group(g) => g
            .title()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("Group {}", g.id().bare_id())),
        Peer::Channel(c) => c.title().to_string(),
    }
}
