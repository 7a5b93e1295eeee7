//! Deterministic test fixtures: a mock chain backend and transaction
//! builders.

mod backend;

pub use backend::MockChainBackend;

use dashcore::blockdata::witness::Witness;
use dashcore::{OutPoint, ScriptBuf, Transaction, TxIn, TxOut};

/// Build a unique standalone transaction. `tag` varies the txid.
pub fn dummy_tx(tag: u32) -> Transaction {
    Transaction {
        version: 2,
        lock_time: tag,
        input: vec![],
        output: vec![TxOut {
            value: 50_000 + tag as u64,
            script_pubkey: ScriptBuf::new(),
        }],
        special_transaction_payload: None,
    }
}

/// Build a transaction spending the given outpoint.
pub fn spending_tx(outpoint: OutPoint) -> Transaction {
    Transaction {
        version: 2,
        lock_time: 0,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: 0xFFFFFFFF,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: 40_000,
            script_pubkey: ScriptBuf::new(),
        }],
        special_transaction_payload: None,
    }
}
