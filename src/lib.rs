//! Chain notification engine for Dash.
//!
//! This library watches a block-producing, reorg-prone chain through a
//! pluggable [`ChainBackend`] and dispatches three kinds of events to any
//! number of concurrent subscribers:
//!
//! - **Block epochs**: one notification per block that joins the best chain,
//!   delivered to each subscriber in strictly increasing height with no gaps
//! - **Transaction confirmations**: fired once a registered transaction
//!   reaches its requested confirmation depth, with reorg-aware retraction
//!   and replay
//! - **Outpoint spends**: fired when a watched output is consumed by a
//!   transaction seen in the mempool or in a block
//!
//! The engine reconciles its last-known best block with the backend's tip on
//! every update, synthesizes notifications for missed blocks, and rolls
//! confirmation state back through reorgs up to a fixed safety depth.
//!
//! # Quick Start
//!
//! ```no_run
//! use dash_notify::{ChainNotifier, NotifierConfig};
//! # use dash_notify::chain::ChainBackend;
//! # async fn example<B: ChainBackend + 'static>(backend: B) -> dash_notify::Result<()> {
//! let config = NotifierConfig::mainnet();
//! let mut notifier = ChainNotifier::new(config, backend)?;
//! notifier.start().await?;
//!
//! // Subscribe to every new best-chain block.
//! let mut epochs = notifier.register_block_epoch_ntfn(None).await?;
//! while let Some(epoch) = epochs.recv().await {
//!     println!("block {} connected: {}", epoch.height, epoch.hash);
//! }
//!
//! notifier.stop().await;
//! # Ok(())
//! # }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod chain;
pub mod config;
pub mod error;
pub mod logging;
pub mod notifier;
pub mod queue;
pub mod types;

// Re-export main types for convenience
pub use chain::{BlockMeta, ChainBackend, ChainEvent, RelevantTx};
pub use config::{NotifierConfig, DEFAULT_EPOCH_QUEUE_SIZE, REORG_SAFETY_DEPTH};
pub use error::{BackendError, DispatchError, LoggingError, NotifyError, Result};
pub use logging::{init_console_logging, init_logging, LogFileConfig, LoggingConfig, LoggingGuard};
pub use tracing::level_filters::LevelFilter;
pub use notifier::ChainNotifier;
pub use queue::ConcurrentQueue;
pub use types::{
    BlockEpoch, BlockEpochEvent, ConfirmationEvent, SpendDetail, SpendEvent, TxConfirmation,
};

// Re-export commonly used dashcore types
pub use dashcore::{Block, BlockHash, Network, OutPoint, Transaction, Txid};

// Re-export hash trait
pub use dashcore::hashes::Hash;

/// Current version of the dash-notify library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
