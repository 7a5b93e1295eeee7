//! Registry of pending outpoint spend subscribers.

use std::collections::HashMap;

use dashcore::OutPoint;
use tokio::sync::mpsc;

use crate::chain::RelevantTx;
use crate::types::SpendDetail;

/// A single spend subscriber. The buffered sender holds at most the one
/// [`SpendDetail`] ever produced for it; dropping the sender closes the
/// subscriber's channel.
#[derive(Debug)]
pub(crate) struct SpendNtfn {
    pub(crate) spend_id: u64,
    pub(crate) sender: mpsc::Sender<SpendDetail>,
}

/// Maps each watched outpoint to its pending spend subscribers. Entries are
/// drained wholesale when a spend of the outpoint is detected.
#[derive(Debug, Default)]
pub(crate) struct SpendRegistry {
    by_outpoint: HashMap<OutPoint, HashMap<u64, SpendNtfn>>,
}

impl SpendRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber for an outpoint.
    pub(crate) fn register(&mut self, outpoint: OutPoint, ntfn: SpendNtfn) {
        tracing::info!("New spend subscription: utxo={}, spend_id={}", outpoint, ntfn.spend_id);
        self.by_outpoint.entry(outpoint).or_default().insert(ntfn.spend_id, ntfn);
    }

    /// Match a relevant transaction against the registry.
    ///
    /// Every input spending a watched outpoint produces one [`SpendDetail`]
    /// per subscriber of that outpoint; the subscribers' channels close right
    /// after and the outpoint is dropped from the registry.
    pub(crate) fn dispatch(&mut self, relevant: &RelevantTx, best_height: i32) {
        let spender_txid = relevant.tx.txid();

        for (input_index, input) in relevant.tx.input.iter().enumerate() {
            let outpoint = input.previous_output;
            let Some(subscribers) = self.by_outpoint.remove(&outpoint) else { continue };

            let spending_height = match &relevant.block {
                Some(meta) => meta.height,
                None => best_height + 1,
            };

            let detail = SpendDetail {
                spent_outpoint: outpoint,
                spender_tx_hash: spender_txid,
                spending_tx: relevant.tx.clone(),
                spender_input_index: input_index as u32,
                spending_height,
            };

            for (_, subscriber) in subscribers {
                tracing::info!("Dispatching spend notification for outpoint={}", outpoint);
                // The channel holds one slot and this is its only send.
                let _ = subscriber.sender.try_send(detail.clone());
            }
        }
    }

    /// Remove a single subscriber, closing its channel. Unknown ids are a
    /// no-op, making cancellation race-free against a concurrent dispatch.
    pub(crate) fn cancel(&mut self, outpoint: OutPoint, spend_id: u64) {
        let Some(subscribers) = self.by_outpoint.get_mut(&outpoint) else {
            return;
        };
        if subscribers.remove(&spend_id).is_some() {
            tracing::info!(
                "Cancelling spend notification for out_point={}, spend_id={}",
                outpoint,
                spend_id
            );
        }
        if subscribers.is_empty() {
            self.by_outpoint.remove(&outpoint);
        }
    }

    /// Close every subscriber channel.
    pub(crate) fn tear_down(&mut self) {
        self.by_outpoint.clear();
    }

    #[cfg(test)]
    pub(crate) fn watched_count(&self) -> usize {
        self.by_outpoint.len()
    }
}
