//! # Transaction Tracking
//!
//! Allocation of transaction ids, tracking of active snapshots, and the
//! durability watermark live here, decoupled from the transactions
//! themselves.
//!
//! ## Id Allocation
//!
//! Transaction ids are 64-bit, strictly increasing, allocated from a global
//! atomic counter. They define commit order and journal replay order. Id 0
//! is reserved ("no transaction").
//!
//! ## Active-Snapshot Slots
//!
//! A fixed slot array holds the snapshot id of every open transaction:
//!
//! - Value 0: slot free
//! - Value > 0: snapshot id of an open transaction
//!
//! Slot registration takes a short mutex; reads (the watermark scan) are
//! lock-free. The watermark — the oldest snapshot any open transaction can
//! still observe — gates the background flush and scratch/journal
//! reclamation: content needed by a snapshot at or above the watermark is
//! never overwritten or reclaimed.
//!
//! ## Durability Waiters
//!
//! `mark_durable` publishes the highest durably committed transaction id and
//! wakes waiters. `wait_for_durable` blocks with an optional timeout and
//! fails with `StorageError::Timeout` carrying the last-known durable id —
//! it never hangs indefinitely by default.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use eyre::Result;
use parking_lot::{Condvar, Mutex};

use crate::errors::StorageError;

pub type TxnId = u64;

pub const MAX_ACTIVE_TRANSACTIONS: usize = 64;

pub struct TransactionTracker {
    next_id: AtomicU64,
    active_slots: [AtomicU64; MAX_ACTIVE_TRANSACTIONS],
    slot_lock: Mutex<()>,
    durable: Mutex<TxnId>,
    durable_cv: Condvar,
}

impl TransactionTracker {
    pub fn new(last_committed: TxnId) -> Self {
        const INIT: AtomicU64 = AtomicU64::new(0);
        Self {
            next_id: AtomicU64::new(last_committed + 1),
            active_slots: [INIT; MAX_ACTIVE_TRANSACTIONS],
            slot_lock: Mutex::new(()),
            durable: Mutex::new(last_committed),
            durable_cv: Condvar::new(),
        }
    }

    pub fn allocate_id(&self) -> TxnId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register an open transaction observing `snapshot`. Returns the slot
    /// index to release on disposal.
    pub fn register(&self, snapshot: TxnId) -> Result<usize> {
        let _guard = self.slot_lock.lock();
        for (idx, slot) in self.active_slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == 0 {
                slot.store(snapshot, Ordering::SeqCst);
                return Ok(idx);
            }
        }
        Err(eyre::Report::new(StorageError::TooManyTransactions {
            max: MAX_ACTIVE_TRANSACTIONS,
        }))
    }

    pub fn release(&self, slot_idx: usize) {
        self.active_slots[slot_idx].store(0, Ordering::SeqCst);
    }

    /// Oldest snapshot any open transaction observes, or the next id when
    /// nothing is open. Content older than this is reclaimable.
    pub fn watermark(&self) -> TxnId {
        let mut min = self.next_id.load(Ordering::SeqCst);
        for slot in &self.active_slots {
            let ts = slot.load(Ordering::Relaxed);
            if ts != 0 && ts < min {
                min = ts;
            }
        }
        min
    }

    pub fn mark_durable(&self, txn_id: TxnId) {
        let mut durable = self.durable.lock();
        if txn_id > *durable {
            *durable = txn_id;
            self.durable_cv.notify_all();
        }
    }

    pub fn last_durable(&self) -> TxnId {
        *self.durable.lock()
    }

    /// Block until `txn_id` is durable, or until `timeout` elapses. The
    /// timeout error carries the last id known durable.
    pub fn wait_for_durable(&self, txn_id: TxnId, timeout: Duration) -> Result<()> {
        let mut durable = self.durable.lock();
        while *durable < txn_id {
            if self
                .durable_cv
                .wait_for(&mut durable, timeout)
                .timed_out()
            {
                if *durable >= txn_id {
                    return Ok(());
                }
                return Err(eyre::Report::new(StorageError::Timeout {
                    last_durable: *durable,
                }));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_strictly_increase() {
        let tracker = TransactionTracker::new(0);
        let a = tracker.allocate_id();
        let b = tracker.allocate_id();
        let c = tracker.allocate_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn watermark_tracks_oldest_active() {
        // Snapshots are committed ids, so they sit below next_id.
        let tracker = TransactionTracker::new(6);
        let s1 = tracker.register(5).unwrap();
        let s2 = tracker.register(3).unwrap();
        assert_eq!(tracker.watermark(), 3);

        tracker.release(s2);
        assert_eq!(tracker.watermark(), 5);

        tracker.release(s1);
        assert_eq!(tracker.watermark(), tracker.next_id.load(Ordering::SeqCst));
    }

    #[test]
    fn register_fails_when_full() {
        let tracker = TransactionTracker::new(0);
        let slots: Vec<_> = (0..MAX_ACTIVE_TRANSACTIONS)
            .map(|i| tracker.register(i as u64 + 1).unwrap())
            .collect();

        let err = tracker.register(99).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::TooManyTransactions { .. })
        ));

        for s in slots {
            tracker.release(s);
        }
    }

    #[test]
    fn wait_for_durable_returns_immediately_when_satisfied() {
        let tracker = TransactionTracker::new(0);
        tracker.mark_durable(10);
        tracker
            .wait_for_durable(7, Duration::from_millis(10))
            .unwrap();
    }

    #[test]
    fn wait_for_durable_times_out_with_last_known() {
        let tracker = TransactionTracker::new(0);
        tracker.mark_durable(4);

        let err = tracker
            .wait_for_durable(9, Duration::from_millis(20))
            .unwrap_err();
        match err.downcast_ref::<StorageError>() {
            Some(StorageError::Timeout { last_durable }) => assert_eq!(*last_durable, 4),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn wait_for_durable_wakes_on_mark() {
        let tracker = Arc::new(TransactionTracker::new(0));
        let waiter = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.wait_for_durable(3, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(10));
        tracker.mark_durable(3);
        waiter.join().unwrap().unwrap();
    }
}
