//! High-level chain notifier API.
//!
//! Module structure:
//!
//! - `conf.rs` - confirmation tracking state machine
//! - `spend.rs` - outpoint spend registry
//! - `epoch.rs` - block epoch registry and per-subscriber relays
//! - `dispatcher.rs` - the single-task event loop tying it all together
//!
//! `ChainNotifier` itself only marshals registrations and cancellations onto
//! the dispatcher; all registry state lives on the dispatcher task.

pub(crate) mod conf;
pub(crate) mod dispatcher;
pub(crate) mod epoch;
pub(crate) mod spend;


use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashcore::{OutPoint, Txid};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chain::{BlockMeta, ChainBackend, RelevantTx};
use crate::config::NotifierConfig;
use crate::error::{BackendError, NotifyError, Result};
use crate::queue::ConcurrentQueue;
use crate::types::{BlockEpoch, BlockEpochEvent, CancelRequest, ConfirmationEvent, SpendEvent};

use conf::ConfNtfn;
use dispatcher::{NotificationDispatcher, Registration, RegistrationMsg};
use epoch::{epoch_relay, EpochNtfn};
use spend::SpendNtfn;

/// The chain notifier. Multiple concurrent clients are supported; all
/// notifications are delivered through per-client channels that never block
/// the dispatcher.
pub struct ChainNotifier<B: ChainBackend> {
    config: NotifierConfig,
    backend: Arc<B>,

    started: AtomicBool,
    stopped: AtomicBool,

    spend_client_counter: AtomicU64,
    epoch_client_counter: AtomicU64,

    registration_tx: mpsc::Sender<RegistrationMsg>,
    registration_rx: Option<mpsc::Receiver<RegistrationMsg>>,
    cancel_tx: mpsc::Sender<CancelRequest>,
    cancel_rx: Option<mpsc::Receiver<CancelRequest>>,

    published_best: Arc<RwLock<Option<BlockEpoch>>>,
    shutdown: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl<B: ChainBackend + 'static> ChainNotifier<B> {
    /// Create a new notifier over the given backend. The backend is assumed
    /// to be connected and willing to accept requests; no RPC happens until
    /// [`start`](Self::start).
    pub fn new(config: NotifierConfig, backend: B) -> Result<Self> {
        config.validate().map_err(NotifyError::Config)?;

        // Small bounds so registrants rendezvous with the dispatcher rather
        // than racing ahead of it.
        let (registration_tx, registration_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            backend: Arc::new(backend),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            spend_client_counter: AtomicU64::new(0),
            epoch_client_counter: AtomicU64::new(0),
            registration_tx,
            registration_rx: Some(registration_rx),
            cancel_tx,
            cancel_rx: Some(cancel_rx),
            published_best: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
            dispatcher: None,
        })
    }

    /// Subscribe to the backend's block stream and launch the dispatcher at
    /// the backend's current best block. Calling `start` twice is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.backend.notify_blocks().await?;

        let (hash, height) = self.backend.best_block().await?;
        self.start_dispatcher(BlockEpoch {
            height,
            hash,
        })
        .await
    }

    /// Launch the dispatcher at a caller-chosen tip instead of the backend's
    /// reported best block. This exists to seed deterministic reorg
    /// scenarios in tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn start_from(&mut self, best_block: BlockEpoch) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.backend.notify_blocks().await?;
        self.start_dispatcher(best_block).await
    }

    async fn start_dispatcher(&mut self, best_block: BlockEpoch) -> Result<()> {
        let chain_events = self.backend.take_event_receiver().ok_or_else(|| {
            NotifyError::Config("chain backend event stream already taken".to_string())
        })?;
        let registrations = self
            .registration_rx
            .take()
            .ok_or_else(|| NotifyError::Config("notifier already started".to_string()))?;
        let cancellations = self
            .cancel_rx
            .take()
            .ok_or_else(|| NotifyError::Config("notifier already started".to_string()))?;

        *self.published_best.write().await = Some(best_block);

        let dispatcher = NotificationDispatcher::new(
            self.backend.clone(),
            best_block,
            self.published_best.clone(),
            self.config.reorg_safety_depth,
            registrations,
            cancellations,
            chain_events,
            self.shutdown.clone(),
        );
        self.dispatcher = Some(tokio::spawn(dispatcher.run()));

        tracing::info!("Chain notifier started: height={}, hash={}", best_block.height, best_block.hash);
        Ok(())
    }

    /// Stop the notifier, closing every outstanding registration's channels
    /// with no final value. Calling `stop` twice is a no-op.
    pub async fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("Chain notifier stopping");
        self.shutdown.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
    }

    /// Shared handle to the chain backend.
    pub fn backend(&self) -> Arc<B> {
        self.backend.clone()
    }

    /// The notifier's current committed best block, if started.
    pub async fn best_block(&self) -> Option<BlockEpoch> {
        *self.published_best.read().await
    }

    /// The notifier's current committed tip height, if started.
    pub async fn best_height(&self) -> Option<i32> {
        self.best_block().await.map(|epoch| epoch.height)
    }

    /// Register an intent to be notified once the target outpoint is spent
    /// by a transaction on-chain or in the mempool.
    ///
    /// If the output has already left the UTXO set, the chain is rescanned
    /// from the earliest block that can contain the spend and the
    /// notification is dispatched from the rescan.
    pub async fn register_spend_ntfn(
        &self,
        outpoint: OutPoint,
        height_hint: u32,
        include_mempool: bool,
    ) -> Result<SpendEvent> {
        let spend_id = self.spend_client_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = mpsc::channel(1);

        self.send_registration(Registration::Spend {
            outpoint,
            ntfn: SpendNtfn {
                spend_id,
                sender,
            },
        })
        .await?;

        // If the output is gone from the UTXO set the spend already
        // happened; find it in a block and replay it through the dispatcher.
        let tx_out = self.backend.tx_out(&outpoint, include_mempool).await?;
        if tx_out.is_none() {
            self.rescan_spent_outpoint(outpoint, height_hint).await?;
        }

        Ok(SpendEvent {
            spend: receiver,
            outpoint,
            spend_id,
            cancel_tx: self.cancel_tx.clone(),
            shutdown: self.shutdown.clone(),
        })
    }

    /// Register an intent to be notified once `txid` reaches `num_confs`
    /// confirmations on the best chain.
    pub async fn register_confirmations_ntfn(
        &self,
        txid: Txid,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<ConfirmationEvent> {
        if num_confs == 0 {
            return Err(NotifyError::Config(
                "number of confirmations must be at least 1".to_string(),
            ));
        }

        let (ntfn, event) = ConfNtfn::new(txid, num_confs);
        self.send_registration(Registration::Conf {
            txid,
            num_confirmations: num_confs,
            height_hint,
            ntfn,
        })
        .await?;

        Ok(event)
    }

    /// Register an intent to be notified of each new block connected to the
    /// best chain.
    ///
    /// When `best_block` carries the client's current view of the chain, the
    /// dispatcher synthesizes notifications for every block between the
    /// common ancestor of that view and the notifier's tip, so the client
    /// observes a gap-free sequence.
    pub async fn register_block_epoch_ntfn(
        &self,
        best_block: Option<BlockEpoch>,
    ) -> Result<BlockEpochEvent> {
        let epoch_id = self.epoch_client_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut queue = ConcurrentQueue::new(self.config.epoch_queue_size);
        queue.start();
        let Some(queue_out) = queue.take_output() else {
            return Err(NotifyError::Config("epoch queue output unavailable".to_string()));
        };

        let (epoch_tx, epoch_rx) = mpsc::channel(self.config.epoch_queue_size);
        let cancel = CancellationToken::new();

        // Proxy queued epochs to the client channel so delivery stays in
        // order without the dispatcher ever blocking on this client.
        let relay = tokio::spawn(epoch_relay(
            queue_out,
            epoch_tx,
            cancel.clone(),
            self.shutdown.clone(),
        ));

        self.send_registration(Registration::Epoch(EpochNtfn {
            epoch_id,
            best_block,
            queue,
            cancel,
            relay,
        }))
        .await?;

        Ok(BlockEpochEvent {
            epochs: epoch_rx,
            epoch_id,
            cancel_tx: self.cancel_tx.clone(),
            shutdown: self.shutdown.clone(),
        })
    }

    /// Marshal a registration onto the dispatcher and rendezvous with it:
    /// this returns once the dispatcher has applied the registration, or
    /// fails once the notifier is shutting down.
    async fn send_registration(&self, registration: Registration) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(NotifyError::Shutdown);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let msg = RegistrationMsg {
            registration,
            done: done_tx,
        };

        tokio::select! {
            res = self.registration_tx.send(msg) => {
                if res.is_err() {
                    return Err(NotifyError::Shutdown);
                }
            }
            _ = self.shutdown.cancelled() => return Err(NotifyError::Shutdown),
        }

        tokio::select! {
            res = done_rx => res.map_err(|_| NotifyError::Shutdown),
            _ = self.shutdown.cancelled() => Err(NotifyError::Shutdown),
        }
    }

    /// Scan the chain for the transaction spending `outpoint`, starting at
    /// the earliest height the spend can be in, and replay the first match
    /// into the dispatcher as a historical spend.
    async fn rescan_spent_outpoint(&self, outpoint: OutPoint, height_hint: u32) -> Result<()> {
        // Prefer the transaction index for the funding height; a missing
        // index or an unconfirmed funding transaction falls back to the hint.
        let index_height = match self.backend.raw_transaction_block_hash(&outpoint.txid).await {
            Ok(Some(block_hash)) => Some(self.backend.block_header_height(&block_hash).await?),
            Ok(None) => None,
            Err(BackendError::NoTxIndex) => None,
            Err(e) => return Err(e.into()),
        };

        let (_, best_height) = self.backend.best_block().await?;
        let start_height = match index_height {
            Some(height) => height.min(height_hint as i32),
            None => height_hint as i32,
        };

        tracing::debug!(
            "Rescanning heights {}..={} for spend of outpoint {}",
            start_height,
            best_height,
            outpoint
        );

        for height in start_height..=best_height {
            let block_hash = self.backend.block_hash(height).await?;
            let block = self.backend.block(&block_hash).await?;

            for tx in &block.txdata {
                for input in &tx.input {
                    if input.previous_output == outpoint {
                        let relevant = RelevantTx {
                            tx: tx.clone(),
                            block: Some(BlockMeta {
                                hash: block_hash,
                                height,
                                time: block.header.time,
                            }),
                        };
                        self.send_registration(Registration::HistoricalSpend(relevant)).await?;
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}
