//! Configuration for the chain notifier.

use dashcore::Network;

/// Assumed maximum depth of a chain reorganization. Confirmations buried
/// deeper than this are treated as final and pruned from tracking.
pub const REORG_SAFETY_DEPTH: u32 = 100;

/// Default chunk size hint for per-subscriber epoch queues.
pub const DEFAULT_EPOCH_QUEUE_SIZE: usize = 20;

/// Configuration for a [`crate::ChainNotifier`].
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Network the backend is connected to.
    pub network: Network,

    /// Maximum reorg depth the notifier is prepared to handle.
    pub reorg_safety_depth: u32,

    /// Chunk size hint for per-subscriber epoch queues.
    pub epoch_queue_size: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            network: Network::Dash,
            reorg_safety_depth: REORG_SAFETY_DEPTH,
            epoch_queue_size: DEFAULT_EPOCH_QUEUE_SIZE,
        }
    }
}

impl NotifierConfig {
    /// Create a mainnet configuration with default settings.
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Create a testnet configuration with default settings.
    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            ..Self::default()
        }
    }

    /// Create a regtest configuration with default settings.
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            ..Self::default()
        }
    }

    /// Override the reorg safety depth.
    pub fn with_reorg_safety_depth(mut self, depth: u32) -> Self {
        self.reorg_safety_depth = depth;
        self
    }

    /// Override the epoch queue chunk size.
    pub fn with_epoch_queue_size(mut self, size: usize) -> Self {
        self.epoch_queue_size = size;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.reorg_safety_depth == 0 {
            return Err("reorg_safety_depth must be > 0".to_string());
        }

        if self.epoch_queue_size == 0 {
            return Err("epoch_queue_size must be > 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NotifierConfig::mainnet();
        assert_eq!(config.network, Network::Dash);
        assert_eq!(config.reorg_safety_depth, 100);
        assert_eq!(config.epoch_queue_size, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = NotifierConfig::regtest()
            .with_reorg_safety_depth(6)
            .with_epoch_queue_size(4);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.reorg_safety_depth, 6);
        assert_eq!(config.epoch_queue_size, 4);
    }

    #[test]
    fn test_validation_rejects_zero_depth() {
        let config = NotifierConfig::mainnet().with_reorg_safety_depth(0);
        assert!(config.validate().is_err());

        let config = NotifierConfig::mainnet().with_epoch_queue_size(0);
        assert!(config.validate().is_err());
    }
}
