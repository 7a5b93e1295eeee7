//! The notification dispatcher: a single-task event loop that serializes
//! registrations, cancellations, and backend chain events.
//!
//! The dispatcher owns all three registries; every mutation arrives by
//! message, which removes the need for locks around them. Backend RPC calls
//! suspend the loop, which is acceptable because its throughput target is
//! block rate, not message rate.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::chain::ancestor::common_ancestor_height;
use crate::chain::{ChainBackend, ChainEvent, RelevantTx};
use crate::error::{BackendError, DispatchError, NotifyError, Result};
use crate::notifier::conf::{ConfNtfn, TxConfNotifier};
use crate::notifier::epoch::{EpochNtfn, EpochRegistry};
use crate::notifier::spend::{SpendNtfn, SpendRegistry};
use crate::types::{BlockEpoch, CancelRequest, TxConfirmation};
use dashcore::{OutPoint, Txid};

/// Registration messages marshalled from the public API onto the dispatcher.
pub(crate) enum Registration {
    Spend {
        outpoint: OutPoint,
        ntfn: SpendNtfn,
    },
    Conf {
        txid: Txid,
        num_confirmations: u32,
        height_hint: u32,
        ntfn: ConfNtfn,
    },
    Epoch(EpochNtfn),
    /// A spend of a watched outpoint found by the historical rescan,
    /// replayed through the registration channel.
    HistoricalSpend(RelevantTx),
}

/// A registration paired with its rendezvous ack: the sender is released
/// once the dispatcher has applied the registration, so `Register*` calls
/// return with the registration active.
pub(crate) struct RegistrationMsg {
    pub(crate) registration: Registration,
    pub(crate) done: oneshot::Sender<()>,
}

pub(crate) struct NotificationDispatcher<B> {
    backend: Arc<B>,

    /// The notifier's committed best block; the cursor every reconcile
    /// starts from.
    best_block: BlockEpoch,

    /// Atomically published copy of `best_block` for outside readers.
    published_best: Arc<RwLock<Option<BlockEpoch>>>,

    reorg_safety_depth: u32,

    conf_notifier: TxConfNotifier,
    spend_registry: SpendRegistry,
    epoch_registry: EpochRegistry,

    registrations: mpsc::Receiver<RegistrationMsg>,
    cancellations: mpsc::Receiver<CancelRequest>,
    chain_events: mpsc::UnboundedReceiver<ChainEvent>,
    shutdown: CancellationToken,
}

impl<B: ChainBackend> NotificationDispatcher<B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<B>,
        best_block: BlockEpoch,
        published_best: Arc<RwLock<Option<BlockEpoch>>>,
        reorg_safety_depth: u32,
        registrations: mpsc::Receiver<RegistrationMsg>,
        cancellations: mpsc::Receiver<CancelRequest>,
        chain_events: mpsc::UnboundedReceiver<ChainEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backend,
            best_block,
            published_best,
            reorg_safety_depth,
            conf_notifier: TxConfNotifier::new(best_block.height as u32, reorg_safety_depth),
            spend_registry: SpendRegistry::new(),
            epoch_registry: EpochRegistry::new(),
            registrations,
            cancellations,
            chain_events,
            shutdown,
        }
    }

    /// Run until the shutdown token fires, then tear everything down.
    pub(crate) async fn run(mut self) {
        tracing::debug!(
            "Notification dispatcher running from height {}",
            self.best_block.height
        );

        loop {
            tokio::select! {
                Some(cancel) = self.cancellations.recv() => {
                    self.handle_cancel(cancel).await;
                }
                Some(msg) = self.registrations.recv() => {
                    self.handle_registration(msg.registration).await;
                    let _ = msg.done.send(());
                }
                Some(event) = self.chain_events.recv() => {
                    self.handle_chain_event(event).await;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.tear_down().await;
    }

    async fn handle_cancel(&mut self, cancel: CancelRequest) {
        match cancel {
            CancelRequest::Spend {
                outpoint,
                spend_id,
            } => self.spend_registry.cancel(outpoint, spend_id),
            CancelRequest::Epoch {
                epoch_id,
            } => self.epoch_registry.cancel(epoch_id).await,
        }
    }

    async fn handle_registration(&mut self, registration: Registration) {
        match registration {
            Registration::Spend {
                outpoint,
                ntfn,
            } => {
                self.spend_registry.register(outpoint, ntfn);
                if let Err(e) = self.backend.notify_spent(&[outpoint]).await {
                    tracing::error!("Unable to watch outpoint {}: {}", outpoint, e);
                }
            }
            Registration::Conf {
                txid,
                num_confirmations,
                height_hint,
                ntfn,
            } => {
                tracing::info!(
                    "New confirmation subscription: txid={}, num_confs={}",
                    txid,
                    num_confirmations
                );
                let already_confirmed =
                    match self.historical_conf_details(&txid, height_hint).await {
                        Ok(conf) => conf,
                        Err(e) => {
                            tracing::error!(
                                "Historical confirmation lookup failed for {}: {}",
                                txid,
                                e
                            );
                            None
                        }
                    };
                self.conf_notifier.register(ntfn, already_confirmed);
            }
            Registration::Epoch(ntfn) => {
                let epoch_id = ntfn.epoch_id;
                let client_best = ntfn.best_block;
                self.epoch_registry.insert(ntfn);

                if let Some(client_best) = client_best {
                    if let Err(e) = self.catch_up_client(epoch_id, client_best).await {
                        tracing::error!(
                            "Unable to catch up epoch client {}: {}",
                            epoch_id,
                            e
                        );
                    }
                }
            }
            Registration::HistoricalSpend(relevant) => {
                self.spend_registry.dispatch(&relevant, self.best_block.height);
            }
        }
    }

    async fn handle_chain_event(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::BlockConnected {
                height,
                hash,
            } => {
                if self.needs_reconcile(height, &hash).await {
                    tracing::info!(
                        "Backend tip diverged (cursor at {}, connected {}), attempting to catch up",
                        self.best_block.height,
                        height
                    );
                    if let Err(e) = self.catch_up_on_missed_blocks(height).await {
                        if matches!(
                            e,
                            NotifyError::Dispatch(DispatchError::ReorgTooDeep { .. })
                        ) {
                            // The tip can no longer be reconciled; continuing
                            // would feed subscribers an inconsistent chain.
                            tracing::error!("{}; shutting down notifier", e);
                            self.shutdown.cancel();
                        } else {
                            tracing::error!("Unable to catch up on missed blocks: {}", e);
                        }
                        return;
                    }
                }

                if let Err(e) = self.handle_block_connected(height, hash).await {
                    tracing::error!(
                        "Unable to handle connected block at height {}: {}",
                        height,
                        e
                    );
                }
            }
            ChainEvent::BlockDisconnected {
                height,
                hash,
            } => {
                if height != self.best_block.height {
                    tracing::warn!(
                        "Received blocks out of order: current height={}, disconnected height={}",
                        self.best_block.height,
                        height
                    );
                    return;
                }

                if let Err(e) = self.handle_block_disconnected(height, hash).await {
                    tracing::error!(
                        "Unable to handle disconnected block at height {}: {}",
                        height,
                        e
                    );
                }
            }
            ChainEvent::RelevantTx(relevant) => {
                self.spend_registry.dispatch(&relevant, self.best_block.height);
            }
        }
    }

    /// Whether a connected block can be applied directly on top of the
    /// cursor. A height gap always reconciles; at the expected height the
    /// block must also descend from the cursor, or the tip was replaced at
    /// equal height.
    async fn needs_reconcile(&self, height: i32, hash: &dashcore::BlockHash) -> bool {
        if height != self.best_block.height + 1 {
            return true;
        }
        match self.backend.block_header(hash).await {
            Ok(header) => header.prev_blockhash != self.best_block.hash,
            Err(e) => {
                tracing::warn!("Unable to fetch header for connected block {}: {}", hash, e);
                true
            }
        }
    }

    /// Apply a chain update for a new best block: advance the confirmation
    /// machine, fan out the epoch, and publish the new cursor.
    async fn handle_block_connected(
        &mut self,
        height: i32,
        hash: dashcore::BlockHash,
    ) -> Result<()> {
        let block = self.backend.block(&hash).await?;

        tracing::info!("New block: height={}, hash={}", height, hash);

        if let Err(e) = self.conf_notifier.connect_tip(hash, height as u32, &block.txdata) {
            // The reconcile path handles gaps; an ordering error here is
            // logged and dropped rather than killing the loop.
            tracing::error!("Unable to connect tip: {}", e);
        }

        self.epoch_registry.notify_all(BlockEpoch {
            height,
            hash,
        });

        self.best_block = BlockEpoch {
            height,
            hash,
        };
        self.publish_best().await;
        Ok(())
    }

    async fn handle_block_disconnected(
        &mut self,
        height: i32,
        hash: dashcore::BlockHash,
    ) -> Result<()> {
        let prev_hash = self.backend.block_hash(height - 1).await?;

        tracing::info!("Block disconnected from main chain: height={}, hash={}", height, hash);

        if let Err(e) = self.conf_notifier.disconnect_tip(height as u32) {
            tracing::error!("Unable to disconnect tip: {}", e);
        }

        // No epoch notification on disconnect; subscribers only observe
        // connects, and the replay on the new branch restores them.
        self.best_block = BlockEpoch {
            height: height - 1,
            hash: prev_hash,
        };
        self.publish_best().await;
        Ok(())
    }

    /// Reconcile the notifier's cursor with the backend after a gap.
    ///
    /// If the stored hash still lies on the best chain, the intermediate
    /// heights are simply replayed. If it does not, the cursor is rolled
    /// back to the common ancestor (disconnecting each height from the
    /// confirmation machine) before replaying the new branch.
    async fn catch_up_on_missed_blocks(&mut self, new_height: i32) -> Result<()> {
        let mut start_height = self.best_block.height + 1;
        let hash_at_best = self.backend.block_hash(self.best_block.height).await?;

        if hash_at_best != self.best_block.hash {
            let ancestor = common_ancestor_height(
                self.backend.as_ref(),
                self.best_block.hash,
                hash_at_best,
                self.reorg_safety_depth,
            )
            .await?;

            tracing::info!(
                "Chain reorganization: rolling back from height {} to common ancestor {}",
                self.best_block.height,
                ancestor
            );

            for height in ((ancestor + 1)..=self.best_block.height).rev() {
                if let Err(e) = self.conf_notifier.disconnect_tip(height as u32) {
                    tracing::error!("Unable to disconnect tip at height {}: {}", height, e);
                }
            }

            let ancestor_hash = self.backend.block_hash(ancestor).await?;
            self.best_block = BlockEpoch {
                height: ancestor,
                hash: ancestor_hash,
            };
            self.publish_best().await;
            start_height = ancestor + 1;
        }

        for height in start_height..new_height {
            let hash = self.backend.block_hash(height).await?;
            self.handle_block_connected(height, hash).await?;
        }

        Ok(())
    }

    /// Synthesize epoch notifications for a newly registered client that is
    /// behind the notifier's tip. Only the registering client receives them.
    async fn catch_up_client(&mut self, epoch_id: u64, client_best: BlockEpoch) -> Result<()> {
        let mut start_height = client_best.height + 1;
        let hash_at_height = self.backend.block_hash(client_best.height).await?;

        if hash_at_height != client_best.hash {
            let ancestor = common_ancestor_height(
                self.backend.as_ref(),
                client_best.hash,
                hash_at_height,
                self.reorg_safety_depth,
            )
            .await?;
            start_height = ancestor + 1;
        }

        for height in start_height..=self.best_block.height {
            let hash = self.backend.block_hash(height).await?;
            self.epoch_registry.notify_one(
                epoch_id,
                BlockEpoch {
                    height,
                    hash,
                },
            );
        }

        Ok(())
    }

    /// Look up whether a transaction is already included in the best chain.
    ///
    /// Tries the backend's transaction index first and falls back to
    /// scanning candidate blocks from the height hint. A transaction that
    /// cannot be found is simply not yet confirmed.
    async fn historical_conf_details(
        &self,
        txid: &Txid,
        height_hint: u32,
    ) -> Result<Option<TxConfirmation>> {
        match self.conf_details_from_tx_index(txid).await {
            Ok(Some(conf)) => return Ok(Some(conf)),
            Ok(None) => {}
            Err(NotifyError::Backend(BackendError::NoTxIndex)) => {
                tracing::debug!(
                    "Transaction index unavailable, falling back to manual scan for {}",
                    txid
                );
            }
            Err(e) => return Err(e),
        }

        self.conf_details_manually(txid, height_hint).await
    }

    async fn conf_details_from_tx_index(&self, txid: &Txid) -> Result<Option<TxConfirmation>> {
        let Some(block_hash) = self.backend.raw_transaction_block_hash(txid).await? else {
            return Ok(None);
        };

        let height = self.backend.block_header_height(&block_hash).await?;
        let block = self.backend.block(&block_hash).await?;

        for (tx_index, tx) in block.txdata.iter().enumerate() {
            if tx.txid() == *txid {
                return Ok(Some(TxConfirmation {
                    block_hash,
                    block_height: height as u32,
                    tx_index: tx_index as u32,
                }));
            }
        }

        // The index pointed at a block that does not contain the
        // transaction; treat the index as inconsistent.
        Err(NotifyError::Backend(BackendError::NotFound(format!(
            "unable to locate tx {} in block {}",
            txid, block_hash
        ))))
    }

    async fn conf_details_manually(
        &self,
        txid: &Txid,
        height_hint: u32,
    ) -> Result<Option<TxConfirmation>> {
        for height in height_hint as i32..=self.best_block.height {
            let block_hash = self.backend.block_hash(height).await?;
            let block = self.backend.block(&block_hash).await?;

            for (tx_index, tx) in block.txdata.iter().enumerate() {
                if tx.txid() == *txid {
                    return Ok(Some(TxConfirmation {
                        block_hash,
                        block_height: height as u32,
                        tx_index: tx_index as u32,
                    }));
                }
            }
        }

        Ok(None)
    }

    async fn publish_best(&self) {
        *self.published_best.write().await = Some(self.best_block);
    }

    async fn tear_down(mut self) {
        tracing::debug!("Notification dispatcher shutting down");
        self.conf_notifier.tear_down();
        self.spend_registry.tear_down();
        self.epoch_registry.tear_down().await;
    }
}
