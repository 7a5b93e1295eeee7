//! Confirmation tracking state machine.
//!
//! `TxConfNotifier` owns every active confirmation registration and advances
//! them as the best chain moves:
//!
//! - `connect_tip` transitions registrations whose transaction appears in the
//!   new block from *unseen* to *seen*, fires the ones whose confirmation
//!   depth is reached, and ticks the rest
//! - `disconnect_tip` rolls registrations first seen in the disconnected
//!   block back to *unseen*, retracting a fired-but-undelivered confirmation
//! - confirmations buried deeper than the reorg safety depth are treated as
//!   final and dropped from tracking

use std::collections::{BTreeMap, HashMap, HashSet};

use dashcore::{BlockHash, Transaction, Txid};
use tokio::sync::mpsc;

use crate::error::{DispatchError, DispatchResult};
use crate::types::{confirmation_channel, ConfirmationEvent, ConfirmedSender, TxConfirmation};

/// A single confirmation registration tracked by the notifier.
#[derive(Debug)]
pub(crate) struct ConfNtfn {
    txid: Txid,

    num_confirmations: u32,

    /// Position of the transaction on the best chain, or `None` while the
    /// transaction has not been seen in a block.
    details: Option<TxConfirmation>,

    /// Whether the confirmation has been handed to the subscriber's cell.
    dispatched: bool,

    confirmed: ConfirmedSender,

    /// Taken once the registration fires; no further ticks are emitted.
    updates: Option<mpsc::UnboundedSender<u32>>,

    _negative_conf: mpsc::UnboundedSender<i32>,
}

impl ConfNtfn {
    /// Create a registration together with its subscriber handle.
    pub(crate) fn new(txid: Txid, num_confirmations: u32) -> (Self, ConfirmationEvent) {
        let (confirmed_tx, confirmed_rx) = confirmation_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (negative_tx, negative_rx) = mpsc::unbounded_channel();

        let ntfn = Self {
            txid,
            num_confirmations,
            details: None,
            dispatched: false,
            confirmed: confirmed_tx,
            updates: Some(updates_tx),
            _negative_conf: negative_tx,
        };

        let event = ConfirmationEvent {
            confirmed: confirmed_rx,
            updates: updates_rx,
            negative_conf: negative_rx,
        };

        (ntfn, event)
    }
}

/// The confirmation-tracking state machine.
///
/// All mutation happens on the dispatcher task; the struct itself is not
/// shared.
pub(crate) struct TxConfNotifier {
    /// The notifier's committed tip height.
    current_height: u32,

    /// Confirmations older than this many blocks are final.
    reorg_safety_depth: u32,

    next_conf_id: u64,

    /// All live registrations, keyed by id.
    ntfns: HashMap<u64, ConfNtfn>,

    /// Registration ids per watched txid.
    ids_by_txid: HashMap<Txid, Vec<u64>>,

    /// Pending (seen, not yet deep enough) registrations keyed by the height
    /// at which they reach their confirmation depth.
    ids_by_confirm_height: BTreeMap<u32, Vec<u64>>,

    /// Txids first seen per height, for retraction on reorg and for pruning.
    txids_by_initial_height: BTreeMap<u32, HashSet<Txid>>,
}

impl TxConfNotifier {
    pub(crate) fn new(start_height: u32, reorg_safety_depth: u32) -> Self {
        Self {
            current_height: start_height,
            reorg_safety_depth,
            next_conf_id: 0,
            ntfns: HashMap::new(),
            ids_by_txid: HashMap::new(),
            ids_by_confirm_height: BTreeMap::new(),
            txids_by_initial_height: BTreeMap::new(),
        }
    }

    pub(crate) fn current_height(&self) -> u32 {
        self.current_height
    }

    /// Register a confirmation intent.
    ///
    /// `already_confirmed` carries the transaction's position when a
    /// historical lookup found it on the best chain. Registrations whose
    /// confirmation already satisfies the requested depth fire immediately;
    /// ones buried past the safety depth fire without being tracked, since
    /// no handled reorg can invalidate them.
    pub(crate) fn register(
        &mut self,
        mut ntfn: ConfNtfn,
        already_confirmed: Option<TxConfirmation>,
    ) {
        let conf_id = self.next_conf_id;
        self.next_conf_id += 1;

        let Some(details) = already_confirmed else {
            tracing::debug!(
                "Tracking unseen confirmation intent: txid={}, num_confs={}",
                ntfn.txid,
                ntfn.num_confirmations
            );
            self.ids_by_txid.entry(ntfn.txid).or_default().push(conf_id);
            self.ntfns.insert(conf_id, ntfn);
            return;
        };

        // Beyond reorg reach: fire and forget.
        if self.current_height >= self.reorg_safety_depth
            && details.block_height <= self.current_height - self.reorg_safety_depth
        {
            tracing::debug!(
                "Confirmation of {} at height {} is final, dispatching untracked",
                ntfn.txid,
                details.block_height
            );
            ntfn.confirmed.send(details);
            return;
        }

        ntfn.details = Some(details);
        let target = details.block_height + ntfn.num_confirmations - 1;
        let txid = ntfn.txid;

        self.ids_by_txid.entry(txid).or_default().push(conf_id);
        self.txids_by_initial_height
            .entry(details.block_height)
            .or_default()
            .insert(txid);

        if target <= self.current_height {
            ntfn.confirmed.send(details);
            ntfn.dispatched = true;
            ntfn.updates = None;
        } else {
            if let Some(updates) = &ntfn.updates {
                let _ = updates.send(target - self.current_height);
            }
            self.ids_by_confirm_height.entry(target).or_default().push(conf_id);
        }

        self.ntfns.insert(conf_id, ntfn);
    }

    /// Apply a new best-chain block at `height == current_height + 1`.
    ///
    /// Transactions are processed in block order so `tx_index` matches their
    /// position. Fires within the same transition happen in ascending
    /// initial height, then registration order.
    pub(crate) fn connect_tip(
        &mut self,
        block_hash: BlockHash,
        height: u32,
        txns: &[Transaction],
    ) -> DispatchResult<()> {
        if height != self.current_height + 1 {
            return Err(DispatchError::OutOfOrderConnect {
                expected: self.current_height + 1,
                got: height,
            });
        }
        self.current_height = height;

        // Transition unseen registrations whose transaction is in this block.
        for (tx_index, tx) in txns.iter().enumerate() {
            let txid = tx.txid();
            let Some(ids) = self.ids_by_txid.get(&txid) else { continue };

            for id in ids.clone() {
                let Some(ntfn) = self.ntfns.get_mut(&id) else { continue };
                if ntfn.details.is_some() {
                    continue;
                }

                let details = TxConfirmation {
                    block_hash,
                    block_height: height,
                    tx_index: tx_index as u32,
                };
                ntfn.details = Some(details);
                let target = details.block_height + ntfn.num_confirmations - 1;

                tracing::debug!(
                    "Transaction {} included at height {} (index {}), confirms at {}",
                    txid,
                    height,
                    tx_index,
                    target
                );

                self.ids_by_confirm_height.entry(target).or_default().push(id);
                self.txids_by_initial_height.entry(height).or_default().insert(txid);
            }
        }

        // Fire everything that reaches its depth at this height.
        if let Some(mut due) = self.ids_by_confirm_height.remove(&height) {
            due.sort_by_key(|id| {
                let initial = self.ntfns[id]
                    .details
                    .map(|d| d.block_height)
                    .unwrap_or(u32::MAX);
                (initial, *id)
            });

            for id in due {
                let txid = {
                    let Some(ntfn) = self.ntfns.get_mut(&id) else { continue };
                    let Some(details) = ntfn.details else { continue };
                    tracing::info!(
                        "Dispatching confirmation for txid={} at height={}",
                        ntfn.txid,
                        details.block_height
                    );
                    ntfn.confirmed.send(details);
                    ntfn.dispatched = true;
                    ntfn.updates = None;
                    ntfn.txid
                };

                // A registration whose txid index was already pruned is
                // final the moment it dispatches; nothing can retract it.
                let indexed = self
                    .ids_by_txid
                    .get(&txid)
                    .map_or(false, |ids| ids.contains(&id));
                if !indexed {
                    self.ntfns.remove(&id);
                }
            }
        }

        // Tick every registration still waiting on depth.
        for (&target, ids) in self.ids_by_confirm_height.range(height + 1..) {
            let remaining = target - height;
            for id in ids {
                if let Some(updates) = self.ntfns.get(id).and_then(|n| n.updates.as_ref()) {
                    let _ = updates.send(remaining);
                }
            }
        }

        self.prune_mature();
        Ok(())
    }

    /// Roll back the tip at `height == current_height`.
    ///
    /// Registrations first seen in the disconnected block return to the
    /// unseen state; a fired-but-undelivered confirmation is retracted. No
    /// subscriber-visible value is emitted.
    pub(crate) fn disconnect_tip(&mut self, height: u32) -> DispatchResult<()> {
        if height != self.current_height {
            return Err(DispatchError::OutOfOrderDisconnect {
                expected: self.current_height,
                got: height,
            });
        }
        self.current_height = height - 1;

        let Some(txids) = self.txids_by_initial_height.remove(&height) else {
            return Ok(());
        };

        enum Rollback {
            Requeued(u32),
            Retracted,
            Complete,
        }

        for txid in txids {
            let ids = match self.ids_by_txid.get(&txid) {
                Some(ids) => ids.clone(),
                None => continue,
            };

            for id in ids {
                let outcome = {
                    let Some(ntfn) = self.ntfns.get_mut(&id) else { continue };
                    let Some(details) = ntfn.details else { continue };
                    if details.block_height != height {
                        continue;
                    }

                    if ntfn.dispatched {
                        if ntfn.confirmed.retract() {
                            ntfn.dispatched = false;
                            ntfn.details = None;
                            Rollback::Retracted
                        } else {
                            // The subscriber consumed the confirmation before
                            // the rollback; the registration is complete.
                            Rollback::Complete
                        }
                    } else {
                        let target = details.block_height + ntfn.num_confirmations - 1;
                        ntfn.details = None;
                        Rollback::Requeued(target)
                    }
                };

                match outcome {
                    Rollback::Requeued(target) => {
                        if let Some(pending) = self.ids_by_confirm_height.get_mut(&target) {
                            pending.retain(|&p| p != id);
                            if pending.is_empty() {
                                self.ids_by_confirm_height.remove(&target);
                            }
                        }
                        tracing::debug!(
                            "Rolled confirmation intent for {} back to unseen (height {})",
                            txid,
                            height
                        );
                    }
                    Rollback::Retracted => {
                        tracing::debug!(
                            "Retracted undelivered confirmation of {} at height {}",
                            txid,
                            height
                        );
                    }
                    Rollback::Complete => {
                        self.ntfns.remove(&id);
                        if let Some(ids) = self.ids_by_txid.get_mut(&txid) {
                            ids.retain(|&p| p != id);
                            if ids.is_empty() {
                                self.ids_by_txid.remove(&txid);
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Close every outstanding registration with no final value.
    pub(crate) fn tear_down(&mut self) {
        tracing::debug!("Tearing down {} confirmation registrations", self.ntfns.len());
        self.ntfns.clear();
        self.ids_by_txid.clear();
        self.ids_by_confirm_height.clear();
        self.txids_by_initial_height.clear();
    }

    /// Drop tracking state for confirmations buried beyond the safety depth.
    /// Their registrations can no longer be invalidated by a handled reorg.
    fn prune_mature(&mut self) {
        if self.current_height < self.reorg_safety_depth {
            return;
        }
        let mature_height = self.current_height - self.reorg_safety_depth;

        let stale_heights: Vec<u32> = self
            .txids_by_initial_height
            .range(..=mature_height)
            .map(|(&h, _)| h)
            .collect();

        for height in stale_heights {
            let Some(txids) = self.txids_by_initial_height.remove(&height) else { continue };
            for txid in txids {
                let Some(ids) = self.ids_by_txid.remove(&txid) else { continue };
                let mut kept = Vec::new();
                for id in ids {
                    let (unseen, dispatched) = match self.ntfns.get(&id) {
                        Some(ntfn) => (ntfn.details.is_none(), ntfn.dispatched),
                        None => continue,
                    };
                    if unseen {
                        // Still waiting for inclusion; keep it indexed.
                        kept.push(id);
                    } else if dispatched {
                        // Delivered and final.
                        self.ntfns.remove(&id);
                    }
                    // Seen but pending a deeper target: stays reachable via
                    // ids_by_confirm_height and fires there.
                }
                if !kept.is_empty() {
                    self.ids_by_txid.insert(txid, kept);
                }
            }
            tracing::trace!("Pruned confirmation index at mature height {}", height);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_count(&self) -> usize {
        self.ntfns.len()
    }

    #[cfg(test)]
    pub(crate) fn is_seen(&self, txid: &Txid) -> bool {
        self.ids_by_txid
            .get(txid)
            .map(|ids| ids.iter().any(|id| self.ntfns[id].details.is_some()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{dummy_tx, spending_tx};
    use dashcore::hashes::Hash;

    fn hash(tag: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        BlockHash::from_byte_array(bytes)
    }

    #[test]
    fn test_connect_requires_next_height() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let err = notifier.connect_tip(hash(1), 105, &[]).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::OutOfOrderConnect {
                expected: 101,
                got: 105
            }
        ));
    }

    #[test]
    fn test_disconnect_requires_current_height() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let err = notifier.disconnect_tip(99).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::OutOfOrderDisconnect {
                expected: 100,
                got: 99
            }
        ));
    }

    #[tokio::test]
    async fn test_single_conf_fires_on_inclusion() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 1);
        notifier.register(ntfn, None);

        notifier.connect_tip(hash(1), 101, &[dummy_tx(9), tx]).unwrap();

        let conf = event.confirmed.recv().await.expect("must fire");
        assert_eq!(conf.block_height, 101);
        assert_eq!(conf.tx_index, 1);
        assert_eq!(conf.block_hash, hash(1));
    }

    #[tokio::test]
    async fn test_multi_conf_ticks_then_fires() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 3);
        notifier.register(ntfn, None);

        notifier.connect_tip(hash(1), 101, &[tx]).unwrap();
        assert_eq!(event.updates.recv().await, Some(2));

        notifier.connect_tip(hash(2), 102, &[]).unwrap();
        assert_eq!(event.updates.recv().await, Some(1));

        notifier.connect_tip(hash(3), 103, &[]).unwrap();
        let conf = event.confirmed.recv().await.expect("must fire at depth 3");
        assert_eq!(conf.block_height, 101);

        // Updates stream closes once the registration fires.
        assert_eq!(event.updates.recv().await, None);
    }

    #[tokio::test]
    async fn test_already_confirmed_at_depth_fires_immediately() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 2);

        let details = TxConfirmation {
            block_hash: hash(7),
            block_height: 99,
            tx_index: 4,
        };
        notifier.register(ntfn, Some(details));

        assert_eq!(event.confirmed.recv().await, Some(details));
        assert_eq!(notifier.tracked_count(), 1, "still tracked for retraction");
    }

    #[tokio::test]
    async fn test_already_confirmed_pending_gets_initial_tick() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 5);

        let details = TxConfirmation {
            block_hash: hash(7),
            block_height: 99,
            tx_index: 0,
        };
        // Target height 103, three confirmations to go.
        notifier.register(ntfn, Some(details));
        assert_eq!(event.updates.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_already_confirmed_past_safety_depth_untracked() {
        let mut notifier = TxConfNotifier::new(500, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 1);

        let details = TxConfirmation {
            block_hash: hash(7),
            block_height: 300,
            tx_index: 0,
        };
        notifier.register(ntfn, Some(details));

        assert_eq!(event.confirmed.recv().await, Some(details));
        assert_eq!(notifier.tracked_count(), 0, "final confirmations are not tracked");
    }

    #[tokio::test]
    async fn test_reorg_rollback_refires_on_new_fork() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 3);
        notifier.register(ntfn, None);

        // Fork A: seen at 101.
        notifier.connect_tip(hash(1), 101, &[dummy_tx(2), dummy_tx(3), tx.clone()]).unwrap();
        notifier.connect_tip(hash(2), 102, &[]).unwrap();

        // Reorg back below the inclusion height.
        notifier.disconnect_tip(102).unwrap();
        notifier.disconnect_tip(101).unwrap();
        assert!(!notifier.is_seen(&tx.txid()));

        // Fork B: re-included at 103, index 0.
        notifier.connect_tip(hash(11), 101, &[]).unwrap();
        notifier.connect_tip(hash(12), 102, &[]).unwrap();
        notifier.connect_tip(hash(13), 103, &[tx]).unwrap();
        notifier.connect_tip(hash(14), 104, &[]).unwrap();

        // Depth 3 reached at 105.
        notifier.connect_tip(hash(15), 105, &[]).unwrap();

        let conf = event.confirmed.recv().await.expect("must fire exactly once");
        assert_eq!(conf.block_height, 103);
        assert_eq!(conf.tx_index, 0);
        assert_eq!(conf.block_hash, hash(13));
        assert_eq!(event.confirmed.recv().await, None);
    }

    #[tokio::test]
    async fn test_undelivered_confirmation_is_retracted() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 1);
        notifier.register(ntfn, None);

        notifier.connect_tip(hash(1), 101, &[tx.clone()]).unwrap();
        // Subscriber has not read the confirmation yet.
        notifier.disconnect_tip(101).unwrap();

        // Re-included on the replacement block.
        notifier.connect_tip(hash(2), 101, &[tx]).unwrap();

        let conf = event.confirmed.recv().await.expect("must fire");
        assert_eq!(conf.block_hash, hash(2));
        assert_eq!(event.confirmed.recv().await, None, "at most one value");
    }

    #[tokio::test]
    async fn test_consumed_confirmation_completes_registration() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 1);
        notifier.register(ntfn, None);

        notifier.connect_tip(hash(1), 101, &[tx.clone()]).unwrap();
        let conf = event.confirmed.recv().await.expect("must fire");
        assert_eq!(conf.block_hash, hash(1));

        // The rollback arrives after delivery: the registration is done and
        // must not refire on the replacement fork.
        notifier.disconnect_tip(101).unwrap();
        notifier.connect_tip(hash(2), 101, &[tx]).unwrap();

        assert_eq!(event.confirmed.recv().await, None);
        assert_eq!(notifier.tracked_count(), 0);
    }

    #[test]
    fn test_connect_then_disconnect_restores_state() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, _event) = ConfNtfn::new(tx.txid(), 3);
        notifier.register(ntfn, None);

        notifier.connect_tip(hash(1), 101, &[tx.clone()]).unwrap();
        assert!(notifier.is_seen(&tx.txid()));

        notifier.disconnect_tip(101).unwrap();
        assert_eq!(notifier.current_height(), 100);
        assert!(!notifier.is_seen(&tx.txid()));
        assert_eq!(notifier.tracked_count(), 1);
        assert!(notifier.ids_by_confirm_height.is_empty());
        assert!(notifier.txids_by_initial_height.is_empty());
    }

    #[tokio::test]
    async fn test_safety_depth_prunes_delivered_registrations() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 1);
        notifier.register(ntfn, None);

        notifier.connect_tip(hash(1), 101, &[tx]).unwrap();
        assert_eq!(event.confirmed.recv().await.unwrap().block_height, 101);

        // Advance the tip by the full safety depth.
        for offset in 0..100u32 {
            let height = 102 + offset;
            notifier.connect_tip(hash((offset % 200) as u8 + 20), height, &[]).unwrap();
        }

        assert_eq!(notifier.tracked_count(), 0, "delivered registration is pruned");
    }

    #[tokio::test]
    async fn test_spent_output_tx_does_not_match_other_registrations() {
        // A spending transaction must only transition registrations for its
        // own txid, not for the txids it spends.
        let mut notifier = TxConfNotifier::new(100, 100);
        let funding = dummy_tx(1);
        let spender = spending_tx(dashcore::OutPoint {
            txid: funding.txid(),
            vout: 0,
        });

        let (ntfn, mut event) = ConfNtfn::new(funding.txid(), 1);
        notifier.register(ntfn, None);

        notifier.connect_tip(hash(1), 101, &[spender]).unwrap();
        assert!(!notifier.is_seen(&funding.txid()));

        notifier.connect_tip(hash(2), 102, &[funding]).unwrap();
        let conf = event.confirmed.recv().await.expect("fires for its own txid");
        assert_eq!(conf.block_height, 102);
    }

    #[tokio::test]
    async fn test_tear_down_closes_channels() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx = dummy_tx(1);
        let (ntfn, mut event) = ConfNtfn::new(tx.txid(), 2);
        notifier.register(ntfn, None);

        notifier.tear_down();

        assert_eq!(event.confirmed.recv().await, None);
        assert_eq!(event.updates.recv().await, None);
        assert_eq!(event.negative_conf.recv().await, None);
    }

    #[tokio::test]
    async fn test_fire_order_by_initial_height_then_registration() {
        let mut notifier = TxConfNotifier::new(100, 100);
        let tx_a = dummy_tx(1);
        let tx_b = dummy_tx(2);

        // B registered first but seen later; A seen earlier must fire first.
        let (ntfn_b, mut event_b) = ConfNtfn::new(tx_b.txid(), 2);
        notifier.register(ntfn_b, None);
        let (ntfn_a, mut event_a) = ConfNtfn::new(tx_a.txid(), 3);
        notifier.register(ntfn_a, None);

        notifier.connect_tip(hash(1), 101, &[tx_a]).unwrap();
        notifier.connect_tip(hash(2), 102, &[tx_b]).unwrap();
        // Both reach depth at 103.
        notifier.connect_tip(hash(3), 103, &[]).unwrap();

        let conf_a = event_a.confirmed.recv().await.unwrap();
        let conf_b = event_b.confirmed.recv().await.unwrap();
        assert_eq!(conf_a.block_height, 101);
        assert_eq!(conf_b.block_height, 102);
    }
}
