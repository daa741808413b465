//! Live follower: server-pushed messages for the target conversation.
//!
//! Messages for other peers are dropped silently; under heavy traffic in
//! unrelated chats even a log line per message would be amplification.

use std::sync::{Arc, Mutex};

use grammers_client::{Update, UpdatesConfiguration};
use tokio_util::sync::CancellationToken;

use crate::download::DownloadPool;
use crate::error::{Error, Result};
use crate::media::{self, MediaDescriptor};

use super::{TargetPeer, TgClient};

/// How many recent messages a manual gap check fetches.
const MANUAL_CHECK_WINDOW: i32 = 20;

pub struct UpdateDispatcher {
    target_chat_id: i64,
    pool: Arc<DownloadPool>,
    last_seen_id: Mutex<i32>,
}

impl UpdateDispatcher {
    pub fn new(target_chat_id: i64, pool: Arc<DownloadPool>) -> Self {
        Self {
            target_chat_id,
            pool,
            last_seen_id: Mutex::new(0),
        }
    }

    /// Drive the update stream until cancellation. New chat and channel
    /// messages arrive already normalized to one message shape.
    pub async fn run(&self, client: &Arc<TgClient>, cancel: &CancellationToken) -> Result<()> {
        let updates_rx = client
            .take_updates()
            .ok_or_else(|| Error::Config("updates receiver already taken".to_string()))?;
        let mut stream = client.client.stream_updates(
            updates_rx,
            UpdatesConfiguration {
                catch_up: false,
                ..Default::default()
            },
        );

        log::info!("live follower started for chat {}", self.target_chat_id);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                update = stream.next() => match update {
                    Ok(Update::NewMessage(message)) => {
                        let peer_id = message.peer_id().bare_id();
                        let descriptor = media::extract_from_raw(&(*message).raw, peer_id);
                        let preview = media::preview_from_raw(&(*message).raw);
                        self.handle_message(peer_id, message.id(), descriptor, &preview);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("update stream error: {e}");
                        return Err(Error::Transport(e.to_string()));
                    }
                }
            }
        }
    }

    /// Route one incoming message. Non-target peers are discarded
    /// without logging; media goes to the pool as a detached job so the
    /// dispatcher never blocks on I/O.
    pub fn handle_message(
        &self,
        peer_id: i64,
        message_id: i32,
        descriptor: Option<MediaDescriptor>,
        preview: &str,
    ) {
        if peer_id != self.target_chat_id {
            return;
        }

        match descriptor {
            Some(descriptor) => {
                log::info!(
                    "new media message {message_id}: {} ({} bytes)",
                    descriptor.file_name,
                    descriptor.declared_size,
                );
                self.pool.submit_detached(descriptor);
            }
            None => {
                log::info!("new message {message_id} without media: {preview}");
            }
        }
        self.note_seen(message_id);
    }

    /// Poll for messages the push channel may have missed. Fetches the
    /// newest id, and on a gap submits media from up to
    /// [`MANUAL_CHECK_WINDOW`] recent messages.
    pub async fn manual_check(&self, client: &TgClient, peer: &TargetPeer) -> Result<()> {
        let Some(latest) = client.latest_message_id(peer).await? else {
            return Ok(());
        };

        let last_seen = *self.last_seen_id.lock().expect("last seen lock");
        if last_seen == 0 {
            log::info!("manual check: initialized cursor at message {latest}");
            self.note_seen(latest);
            return Ok(());
        }
        if latest <= last_seen {
            log::debug!("manual check: no new messages (cursor {last_seen})");
            return Ok(());
        }

        log::info!("manual check: new messages {last_seen} -> {latest}");
        if latest - last_seen > MANUAL_CHECK_WINDOW {
            log::warn!(
                "manual check: gap of {} exceeds the {MANUAL_CHECK_WINDOW}-message window, \
                 older messages will be missed",
                latest - last_seen,
            );
        }

        let page = client.fetch_history_page(peer, 0, MANUAL_CHECK_WINDOW).await?;
        let mut submitted = 0usize;
        for message in &page {
            let Some(id) = media::message_id(message) else {
                continue;
            };
            if id <= last_seen {
                continue;
            }
            if let Some(descriptor) = media::extract_from_raw(message, peer.id) {
                self.pool.submit_detached(descriptor);
                submitted += 1;
            }
        }
        if submitted > 0 {
            log::info!("manual check: submitted {submitted} media downloads");
        }
        self.note_seen(latest);
        Ok(())
    }

    pub fn last_seen_id(&self) -> i32 {
        *self.last_seen_id.lock().expect("last seen lock")
    }

    fn note_seen(&self, message_id: i32) {
        let mut last_seen = self.last_seen_id.lock().expect("last seen lock");
        if message_id > *last_seen {
            *last_seen = message_id;
        }
    }
}
