//! Error kinds for the download pipeline.
//!
//! Server errors arriving as `grammers_mtsender::InvocationError` are
//! classified once, here, into explicit kinds; the retrier and the flood
//! waiter match on kinds instead of scraping rendered messages.

use std::path::PathBuf;

use grammers_mtsender::InvocationError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// RPC error names that indicate a transient server condition or a DC
/// migration the sender will resolve on the next attempt.
const RETRYABLE_RPC_NAMES: &[&str] = &[
    "INTERNAL_SERVER_ERROR",
    "NETWORK_MIGRATE",
    "PHONE_MIGRATE",
    "FILE_MIGRATE",
    "USER_MIGRATE",
    "STATS_MIGRATE",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("auth error: {0}")]
    Auth(String),

    /// Transient transport failure (network I/O, timeout, DC migration,
    /// internal server error). Always worth a retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server asked us to back off for this many seconds.
    #[error("flood wait of {seconds}s")]
    FloodWait { seconds: u32 },

    #[error("flood wait of {seconds}s exceeds the {cap_secs}s cap")]
    FloodWaitTooLong { seconds: u32, cap_secs: u64 },

    /// The file reference for a media object went stale; re-fetching the
    /// owning message yields a fresh one.
    #[error("file reference expired")]
    ReferenceExpired,

    /// Any other server-side rejection. Terminal for the operation.
    #[error("rpc error {code}: {name}")]
    Rpc { name: String, code: i32 },

    #[error("{op} {}: {source}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsafe path: {}", .0.display())]
    PathSafety(PathBuf),

    #[error("operation canceled")]
    Canceled,

    #[error("operation failed after {attempts} retries: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Classify a grammers invocation error into one of our kinds.
    pub fn from_invocation(err: InvocationError) -> Self {
        match err {
            InvocationError::Rpc(rpc) => {
                if rpc.code == 420 {
                    return Error::FloodWait {
                        seconds: rpc.value.unwrap_or(0),
                    };
                }
                if rpc.name == "FILE_REFERENCE_EXPIRED" {
                    return Error::ReferenceExpired;
                }
                if RETRYABLE_RPC_NAMES.contains(&rpc.name.as_str()) {
                    return Error::Transport(format!("rpc {}: {}", rpc.code, rpc.name));
                }
                if rpc.name == "AUTH_KEY_UNREGISTERED"
                    || rpc.name == "SESSION_EXPIRED"
                    || rpc.name == "SESSION_REVOKED"
                {
                    return Error::Auth(format!("rpc {}: {}", rpc.code, rpc.name));
                }
                Error::Rpc {
                    name: rpc.name,
                    code: rpc.code,
                }
            }
            other => Error::Transport(other.to_string()),
        }
    }

    pub fn fs(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            op,
            path: path.into(),
            source,
        }
    }

    /// Whether the retrier should re-attempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Whether the error ends the whole run rather than a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Canceled | Error::Config(_))
    }
}
