//! Registry of block epoch subscribers.
//!
//! Each registration owns an unbounded queue and a relay task that forwards
//! queued epochs to the subscriber's channel, so the dispatcher never blocks
//! on a slow subscriber.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::ConcurrentQueue;
use crate::types::BlockEpoch;

/// Forward queued epochs to the subscriber's channel, yielding to the
/// per-client cancel signal and to notifier shutdown. Dropping the sender on
/// exit is what closes the subscriber's channel.
pub(crate) async fn epoch_relay(
    mut queue_out: mpsc::Receiver<BlockEpoch>,
    epoch_tx: mpsc::Sender<BlockEpoch>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            item = queue_out.recv() => {
                let Some(epoch) = item else { return };
                tokio::select! {
                    res = epoch_tx.send(epoch) => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                    _ = shutdown.cancelled() => return,
                }
            }
            _ = cancel.cancelled() => return,
            _ = shutdown.cancelled() => return,
        }
    }
}

/// A block epoch registration held by the dispatcher.
#[derive(Debug)]
pub(crate) struct EpochNtfn {
    pub(crate) epoch_id: u64,

    /// The client's view of the best block at registration time, used for
    /// catch-up. `None` skips catch-up.
    pub(crate) best_block: Option<BlockEpoch>,

    /// Fan-out queue; the relay task consumes its output.
    pub(crate) queue: ConcurrentQueue<BlockEpoch>,

    /// Cancel signal for the relay task.
    pub(crate) cancel: CancellationToken,

    /// The relay task forwarding queue output to the subscriber channel.
    pub(crate) relay: JoinHandle<()>,
}

/// Maps epoch ids to their registrations.
#[derive(Debug, Default)]
pub(crate) struct EpochRegistry {
    clients: HashMap<u64, EpochNtfn>,
}

impl EpochRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, ntfn: EpochNtfn) {
        tracing::info!("New block epoch subscription: epoch_id={}", ntfn.epoch_id);
        self.clients.insert(ntfn.epoch_id, ntfn);
    }

    /// Enqueue an epoch to every subscriber. Sends never block; the queues
    /// are unbounded.
    pub(crate) fn notify_all(&self, epoch: BlockEpoch) {
        for client in self.clients.values() {
            client.queue.send(epoch);
        }
    }

    /// Enqueue an epoch to a single subscriber (used for client catch-up).
    pub(crate) fn notify_one(&self, epoch_id: u64, epoch: BlockEpoch) {
        if let Some(client) = self.clients.get(&epoch_id) {
            client.queue.send(epoch);
        }
    }

    /// Cancel one registration: stop its queue, signal the relay, and wait
    /// for it to exit. The subscriber channel closes when the relay drops
    /// its sender. Unknown ids are a no-op.
    pub(crate) async fn cancel(&mut self, epoch_id: u64) {
        let Some(mut client) = self.clients.remove(&epoch_id) else {
            return;
        };
        tracing::info!("Cancelling epoch notification, epoch_id={}", epoch_id);

        client.queue.stop().await;
        client.cancel.cancel();
        let _ = client.relay.await;
    }

    /// Cancel every registration.
    pub(crate) async fn tear_down(&mut self) {
        let ids: Vec<u64> = self.clients.keys().copied().collect();
        for epoch_id in ids {
            self.cancel(epoch_id).await;
        }
    }
}
