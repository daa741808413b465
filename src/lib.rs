//! Telegram chat media downloader (pure Rust, no TDLib).
//!
//! Downloads photo and document attachments from one conversation, as a
//! bounded history backfill and/or a live follower of new messages, with
//! client-side rate limiting, flood-wait handling, and chunked parallel
//! file transfers.

pub mod app;
pub mod config;
pub mod download;
pub mod error;
pub mod media;
pub mod middleware;
pub mod prompt;
pub mod retry;
pub mod session;
pub mod shutdown;
pub mod tg;
