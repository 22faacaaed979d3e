//! Transactions: ordered, single-use batches of steps.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::id::{ActionId, SliceId};
use crate::value::Value;

/// One state-changing instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action_id: ActionId,
    pub source_slice_id: SliceId,
    pub target_slice_id: SliceId,
    pub params: Vec<Value>,
}

/// Debug information stamped on a transaction when it is dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TxMetadata {
    pub store_name: Option<String>,
    pub dispatcher: Option<String>,
    pub debug_info: Option<String>,
}

/// An ordered list of steps applied atomically by one dispatch.
///
/// A transaction can be applied once. The snapshot that applies it marks it
/// destroyed, and any later attempt fails with
/// [`StoreError::TransactionDestroyed`].
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    steps: Vec<Step>,
    destroyed: AtomicBool,
    metadata: TxMetadata,
}

#[derive(Serialize, Deserialize)]
struct EncodedTransaction {
    id: u64,
    steps: Vec<Step>,
}

impl Transaction {
    pub(crate) fn new(id: u64, steps: Vec<Step>) -> Self {
        Self {
            id,
            steps,
            destroyed: AtomicBool::new(false),
            metadata: TxMetadata::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_at(&self, index: usize) -> Result<&Step> {
        self.steps.get(index).ok_or(StoreError::IndexOutOfRange {
            index,
            len: self.steps.len(),
        })
    }

    /// Append `other`'s steps after this transaction's steps.
    ///
    /// Both must still be unapplied. The result keeps this transaction's id.
    pub fn append(mut self, other: Transaction) -> Result<Transaction> {
        if self.is_destroyed() {
            return Err(StoreError::TransactionDestroyed(self.id));
        }
        if other.is_destroyed() {
            return Err(StoreError::TransactionDestroyed(other.id));
        }
        self.steps.extend(other.steps);
        Ok(self)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Mark as applied. Fails if it already was.
    pub(crate) fn consume(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::TransactionDestroyed(self.id));
        }
        Ok(())
    }

    pub fn metadata(&self) -> &TxMetadata {
        &self.metadata
    }

    pub(crate) fn stamp(&mut self, store_name: &str, dispatcher: Option<String>, debug_info: Option<String>) {
        self.metadata.store_name = Some(store_name.to_string());
        self.metadata.dispatcher = dispatcher;
        self.metadata.debug_info = debug_info;
    }

    /// Encode the steps as MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoded = EncodedTransaction {
            id: self.id,
            steps: self.steps.clone(),
        };
        Ok(rmp_serde::to_vec_named(&encoded)?)
    }

    /// Decode a transaction produced by [`Transaction::encode`]. The result
    /// has not been applied yet, whatever the state of the original.
    pub fn decode(bytes: &[u8]) -> Result<Transaction> {
        let encoded: EncodedTransaction = rmp_serde::from_slice(bytes)?;
        Ok(Transaction::new(encoded.id, encoded.steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: &str, slice: &str, param: i64) -> Step {
        Step {
            action_id: ActionId::from(action),
            source_slice_id: SliceId::from(slice),
            target_slice_id: SliceId::from(slice),
            params: vec![Value::Int(param)],
        }
    }

    #[test]
    fn consume_is_single_use() {
        let tx = Transaction::new(0, vec![step("a_x[sl_a$]", "sl_a$", 1)]);
        assert!(tx.consume().is_ok());
        assert!(tx.is_destroyed());
        assert!(matches!(
            tx.consume(),
            Err(StoreError::TransactionDestroyed(0))
        ));
    }

    #[test]
    fn append_preserves_order() {
        let first = Transaction::new(0, vec![step("a_x[sl_a$]", "sl_a$", 1)]);
        let second = Transaction::new(1, vec![step("a_y[sl_b$]", "sl_b$", 2)]);

        let combined = first.append(second).unwrap();
        assert_eq!(combined.len(), 2);
        assert_eq!(combined.step_at(0).unwrap().target_slice_id.as_str(), "sl_a$");
        assert_eq!(combined.step_at(1).unwrap().target_slice_id.as_str(), "sl_b$");
    }

    #[test]
    fn append_rejects_applied_transactions() {
        let first = Transaction::new(0, vec![]);
        let second = Transaction::new(1, vec![]);
        second.consume().unwrap();
        assert!(first.append(second).is_err());
    }

    #[test]
    fn step_at_out_of_range() {
        let tx = Transaction::new(0, vec![step("a_x[sl_a$]", "sl_a$", 1)]);
        assert!(matches!(
            tx.step_at(3),
            Err(StoreError::IndexOutOfRange { index: 3, len: 1 })
        ));
    }

    #[test]
    fn decoded_transaction_is_fresh() {
        let tx = Transaction::new(7, vec![step("a_x[sl_a$]", "sl_a$", 42)]);
        tx.consume().unwrap();

        let bytes = tx.encode().unwrap();
        let replay = Transaction::decode(&bytes).unwrap();

        assert_eq!(replay.id(), 7);
        assert_eq!(replay.steps(), tx.steps());
        assert!(!replay.is_destroyed());
    }
}
