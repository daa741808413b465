//! Run orchestration: connect, resolve the target chat, pick a mode,
//! and drive the backfill and/or the live follower.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::download::DownloadPool;
use crate::error::Error;
use crate::prompt::UserInteraction;
use crate::session::SessionStore;
use crate::shutdown::ShutdownController;
use crate::tg::history::HistoryWalker;
use crate::tg::updates::UpdateDispatcher;
use crate::tg::{TargetPeer, TgClient};

const DIALOG_CHOOSER_LIMIT: usize = 100;
const MANUAL_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    History,
    Live,
    Both,
}

impl RunMode {
    fn from_choice(choice: &str) -> Option<Self> {
        match choice.trim() {
            "1" => Some(RunMode::History),
            "2" => Some(RunMode::Live),
            "3" => Some(RunMode::Both),
            _ => None,
        }
    }
}

pub struct App {
    config: Config,
    client: Arc<TgClient>,
    shutdown: ShutdownController,
}

impl App {
    /// Connect and authorize; prompts are used for the login code and
    /// the 2FA password.
    pub async fn new(
        config: Config,
        shutdown: ShutdownController,
        prompts: &dyn UserInteraction,
    ) -> Result<Self> {
        let store = SessionStore::new(&config.session.dir);
        let client = Arc::new(TgClient::connect(&config, &store, shutdown.child_token())?);
        client.ensure_authorized(prompts).await?;
        client.probe().await?;
        log::info!("connected to Telegram");

        Ok(Self {
            config,
            client,
            shutdown,
        })
    }

    pub async fn run(&self, prompts: &dyn UserInteraction) -> Result<()> {
        let target = self.select_chat(prompts).await?;
        log::info!("target chat: {} ({})", target.title, target.id);
        let mode = select_mode(prompts);

        let pool = Arc::new(
            DownloadPool::new(
                &self.config.download.path,
                self.config.download.max_concurrent,
                self.client.make_download_fn(&self.config.download),
            )
            .with_refresh(self.client.make_refresh_fn(&target)),
        );

        let cancel = self.shutdown.child_token();
        let outcome = match mode {
            RunMode::History => self.run_history(&pool, &target, &cancel).await,
            RunMode::Live => self.run_live(&pool, &target, &cancel).await,
            RunMode::Both => {
                let history = self.run_history(&pool, &target, &cancel).await;
                match history {
                    Ok(()) => {
                        log::info!("history complete, switching to live monitoring");
                        self.run_live(&pool, &target, &cancel).await
                    }
                    err => err,
                }
            }
        };

        pool.log_summary();
        match outcome {
            Ok(()) => Ok(()),
            Err(Error::Canceled) => {
                log::info!("run canceled");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn run_history(
        &self,
        pool: &Arc<DownloadPool>,
        target: &TargetPeer,
        cancel: &CancellationToken,
    ) -> crate::error::Result<()> {
        log::info!("downloading media history of \"{}\"", target.title);

        let batch_size = self.config.download.batch_size;
        let walker = HistoryWalker::new(batch_size);
        let client = Arc::clone(&self.client);
        let peer = target.clone();

        walker
            .run(cancel, pool, target.id, move |offset_id| {
                let client = Arc::clone(&client);
                let peer = peer.clone();
                async move { client.fetch_history_page(&peer, offset_id, batch_size).await }
            })
            .await?;
        Ok(())
    }

    async fn run_live(
        &self,
        pool: &Arc<DownloadPool>,
        target: &TargetPeer,
        cancel: &CancellationToken,
    ) -> crate::error::Result<()> {
        let dispatcher = Arc::new(UpdateDispatcher::new(target.id, Arc::clone(pool)));

        // Seed the cursor so the first gap check has a baseline.
        dispatcher.manual_check(&self.client, target).await?;

        // Periodic gap probe for environments with unreliable push
        // delivery; the stream remains the primary signal.
        let live = cancel.child_token();
        let checker = {
            let dispatcher = Arc::clone(&dispatcher);
            let client = Arc::clone(&self.client);
            let target = target.clone();
            let live = live.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MANUAL_CHECK_INTERVAL);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = live.cancelled() => return,
                        _ = interval.tick() => {
                            if let Err(e) = dispatcher.manual_check(&client, &target).await {
                                log::warn!("manual check failed: {e}");
                            }
                        }
                    }
                }
            })
        };

        log::info!("monitoring new messages (press Ctrl+C to stop)");
        let result = dispatcher.run(&self.client, cancel).await;
        live.cancel();
        let _ = checker.await;
        result
    }

    async fn select_chat(&self, prompts: &dyn UserInteraction) -> Result<TargetPeer> {
        if self.config.chat.target_id != 0 {
            log::info!("using configured chat id {}", self.config.chat.target_id);
            return Ok(self.client.resolve_target(self.config.chat.target_id).await?);
        }

        let chats = self.client.list_chats(DIALOG_CHOOSER_LIMIT).await?;
        if chats.is_empty() {
            anyhow::bail!("no chats found on this account");
        }

        println!("\nAvailable chats:");
        for (index, chat) in chats.iter().enumerate() {
            println!("{}. {} ({}) - ID: {}", index + 1, chat.title, chat.kind, chat.id);
        }

        let choice = prompts.ask_choice("\nSelect a chat (number): ")?;
        let index: usize = choice
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid selection: {choice:?}"))?;
        let chat = chats
            .get(index.checked_sub(1).unwrap_or(usize::MAX))
            .ok_or_else(|| anyhow::anyhow!("selection {index} out of range"))?;

        log::info!("selected chat: {} ({})", chat.title, chat.id);
        Ok(self.client.resolve_target(chat.id).await?)
    }
}

fn select_mode(prompts: &dyn UserInteraction) -> RunMode {
    println!("\nSelect a mode:");
    println!("1. Download media history");
    println!("2. Monitor new messages");
    println!("3. Download history, then monitor");

    match prompts
        .ask_choice("\nMode (1-3): ")
        .ok()
        .and_then(|choice| RunMode::from_choice(&choice))
    {
        Some(mode) => mode,
        None => {
            log::warn!("invalid mode selection, defaulting to history + monitor");
            RunMode::Both
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::ScriptedPrompts;

    #[test]
    fn mode_parsing() {
        assert_eq!(RunMode::from_choice("1"), Some(RunMode::History));
        assert_eq!(RunMode::from_choice(" 2 "), Some(RunMode::Live));
        assert_eq!(RunMode::from_choice("3"), Some(RunMode::Both));
        assert_eq!(RunMode::from_choice("4"), None);
        assert_eq!(RunMode::from_choice(""), None);
    }

    #[test]
    fn invalid_mode_defaults_to_both() {
        let prompts = ScriptedPrompts::new(["banana"]);
        assert_eq!(select_mode(&prompts), RunMode::Both);

        let prompts = ScriptedPrompts::new(["2"]);
        assert_eq!(select_mode(&prompts), RunMode::Live);
    }
}
