//! Server configuration.
//!
//! Every flag can also be set through the environment, so the binary runs
//! unchanged under a process supervisor or in a container.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::error::ValidationError;
use crate::request::{RequestPolicy, DEFAULT_MAX_PHONE_LEN, DEFAULT_MIN_PHONE_LEN};
use crate::storage::persistent::PersistentConfig;

/// Log filter used when neither `--log` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "contactlink=info,tower_http=info";

/// Command line and environment configuration of `contactlink-server`.
#[derive(Parser, Debug, Clone)]
#[command(name = "contactlink-server", version, about = "Identity reconciliation HTTP server")]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, env = "CONTACTLINK_ADDR", default_value = "127.0.0.1:8000")]
    pub addr: SocketAddr,

    /// Database directory. Contacts are kept in memory only when unset.
    #[arg(long, env = "CONTACTLINK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Skip fsync after each commit.
    #[arg(long, env = "CONTACTLINK_NO_SYNC", default_value_t = false)]
    pub no_sync: bool,

    /// WAL size (bytes) that triggers automatic compaction.
    #[arg(long, env = "CONTACTLINK_MAX_WAL_BYTES", default_value_t = PersistentConfig::DEFAULT_MAX_WAL_SIZE)]
    pub max_wal_bytes: u64,

    /// Shortest accepted phone number.
    #[arg(long, env = "CONTACTLINK_MIN_PHONE_LEN", default_value_t = DEFAULT_MIN_PHONE_LEN)]
    pub min_phone_len: usize,

    /// Longest accepted phone number.
    #[arg(long, env = "CONTACTLINK_MAX_PHONE_LEN", default_value_t = DEFAULT_MAX_PHONE_LEN)]
    pub max_phone_len: usize,

    /// Log filter directives (tracing `EnvFilter` syntax).
    #[arg(long, env = "RUST_LOG")]
    pub log: Option<String>,
}

impl ServerConfig {
    /// Request policy for the HTTP layer.
    ///
    /// # Errors
    /// `InvalidConfig` if the phone length bounds are inconsistent.
    pub fn request_policy(&self) -> Result<RequestPolicy, ValidationError> {
        RequestPolicy {
            min_phone_len: self.min_phone_len,
            max_phone_len: self.max_phone_len,
            ..RequestPolicy::default()
        }
        .validate()
    }

    /// Storage configuration for `--data-dir`.
    ///
    /// # Errors
    /// `InvalidConfig` if the WAL limit is too small.
    pub fn persistent_config(&self) -> Result<PersistentConfig, ValidationError> {
        PersistentConfig {
            max_wal_size: self.max_wal_bytes,
            sync_on_write: !self.no_sync,
        }
        .validate()
    }

    /// Log filter directives.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}
