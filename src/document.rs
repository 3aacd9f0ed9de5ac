//! CRDT document engine: one collaboratively edited text body.
//!
//! Wraps a Yrs [`Doc`] with a single root text named `"content"`. All remote
//! peers send v1 binary updates; merging them is commutative and idempotent,
//! which is the correctness backbone of the whole subsystem — every other
//! component assumes that applying the same set of updates in any order, any
//! number of times, converges to the same text.
//!
//! Every applied change (local or remote) is reported to registered
//! observers together with an origin tag, so callers can suppress echoing an
//! update back to the connection that produced it.

use std::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::error::RealtimeError;

/// Root text name inside every document.
const TEXT_ROOT: &str = "content";

/// Origin tag for changes made through the local editing helpers.
pub const ORIGIN_LOCAL: &str = "local";

type ObserverFn = Box<dyn Fn(&[u8], &str) + Send + Sync>;

/// A single collaboratively edited text document.
pub struct CollabDocument {
    doc: Doc,
    observers: RwLock<Vec<ObserverFn>>,
}

impl CollabDocument {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Apply a binary update received from a remote peer.
    ///
    /// Fails with [`RealtimeError::InvalidUpdate`] if the payload is
    /// malformed; the document is left untouched in that case. On success,
    /// observers are notified with the applied delta and `origin`.
    pub fn apply_update(&self, update: &[u8], origin: &str) -> Result<(), RealtimeError> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| RealtimeError::InvalidUpdate(e.to_string()))?;

        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };

        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| RealtimeError::InvalidUpdate(e.to_string()))?;
        }

        let delta = {
            let txn = self.doc.transact();
            txn.encode_diff_v1(&before)
        };
        if !delta.is_empty() {
            self.notify(&delta, origin);
        }
        Ok(())
    }

    /// Insert text locally; returns the binary update representing the change.
    pub fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.insert(&mut txn, index, chunk);
        }
        let delta = {
            let txn = self.doc.transact();
            txn.encode_diff_v1(&before)
        };
        if !delta.is_empty() {
            self.notify(&delta, ORIGIN_LOCAL);
        }
        delta
    }

    /// Remove a range locally; returns the binary update representing the change.
    pub fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.remove_range(&mut txn, index, len);
        }
        let delta = {
            let txn = self.doc.transact();
            txn.encode_diff_v1(&before)
        };
        if !delta.is_empty() {
            self.notify(&delta, ORIGIN_LOCAL);
        }
        delta
    }

    /// Encode the full document state as a v1 update.
    ///
    /// Applying the result to a fresh document reproduces the exact text.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the current state vector (for late-joiner diff requests).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the changes a peer with the given state vector is missing.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, RealtimeError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| RealtimeError::InvalidUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Render the document as plain text.
    pub fn to_text(&self) -> String {
        let txn = self.doc.transact();
        match txn.get_text(TEXT_ROOT) {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }

    /// Seed the document from plain text (record-store interop).
    ///
    /// Intended for freshly created documents; appends at position 0.
    pub fn load_from_text(&self, source: &str) {
        if source.is_empty() {
            return;
        }
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_ROOT);
        text.insert(&mut txn, 0, source);
    }

    /// Document text length in characters.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        match txn.get_text(TEXT_ROOT) {
            Some(text) => text.len(&txn),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an observer invoked with `(delta_bytes, origin_tag)` on
    /// every applied change.
    pub fn observe<F>(&self, callback: F)
    where
        F: Fn(&[u8], &str) + Send + Sync + 'static,
    {
        self.observers.write().unwrap().push(Box::new(callback));
    }

    fn notify(&self, delta: &[u8], origin: &str) {
        let observers = self.observers.read().unwrap();
        for observer in observers.iter() {
            observer(delta, origin);
        }
    }
}

impl Default for CollabDocument {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_load_and_render_text() {
        let doc = CollabDocument::new();
        doc.load_from_text("Hello");
        assert_eq!(doc.to_text(), "Hello");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_empty_document() {
        let doc = CollabDocument::new();
        assert_eq!(doc.to_text(), "");
        assert!(doc.is_empty());
    }

    #[test]
    fn test_insert_produces_applicable_update() {
        let doc_a = CollabDocument::new();
        let update = doc_a.insert(0, "Hello");

        let doc_b = CollabDocument::new();
        doc_b.apply_update(&update, "peer-a").unwrap();
        assert_eq!(doc_b.to_text(), "Hello");
    }

    #[test]
    fn test_remove_range() {
        let doc_a = CollabDocument::new();
        doc_a.load_from_text("Hello world");
        let update = doc_a.remove(5, 6);
        assert_eq!(doc_a.to_text(), "Hello");

        let doc_b = CollabDocument::new();
        doc_b.apply_update(&doc_a.encode_state(), "seed").unwrap();
        assert_eq!(doc_b.to_text(), "Hello");
        assert!(!update.is_empty());
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = CollabDocument::new();
        doc.load_from_text("safe");
        let err = doc.apply_update(&[0xFF, 0xFE, 0x01], "peer").unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidUpdate(_)));
        // Document untouched
        assert_eq!(doc.to_text(), "safe");
    }

    #[test]
    fn test_convergence_any_order() {
        // Two concurrent edits from independent replicas, applied in both
        // orders, must converge to identical text.
        let alice = CollabDocument::new();
        let bob = CollabDocument::new();
        let update_a = alice.insert(0, "alpha ");
        let update_b = bob.insert(0, "beta ");

        let merged_ab = CollabDocument::new();
        merged_ab.apply_update(&update_a, "a").unwrap();
        merged_ab.apply_update(&update_b, "b").unwrap();

        let merged_ba = CollabDocument::new();
        merged_ba.apply_update(&update_b, "b").unwrap();
        merged_ba.apply_update(&update_a, "a").unwrap();

        assert_eq!(merged_ab.to_text(), merged_ba.to_text());
    }

    #[test]
    fn test_idempotent_apply() {
        let source = CollabDocument::new();
        let update = source.insert(0, "once");

        let doc = CollabDocument::new();
        doc.apply_update(&update, "peer").unwrap();
        doc.apply_update(&update, "peer").unwrap();
        doc.apply_update(&update, "peer").unwrap();
        assert_eq!(doc.to_text(), "once");
    }

    #[test]
    fn test_full_state_round_trip() {
        let doc = CollabDocument::new();
        doc.load_from_text("The quick brown fox");
        doc.insert(19, " jumps");

        let state = doc.encode_state();
        let restored = CollabDocument::new();
        restored.apply_update(&state, "restore").unwrap();
        assert_eq!(restored.to_text(), doc.to_text());
    }

    #[test]
    fn test_diff_since_covers_missing_changes() {
        let doc = CollabDocument::new();
        doc.load_from_text("base");
        let base_state = doc.encode_state();
        let sv = doc.state_vector();
        doc.insert(4, " extended");

        let diff = doc.diff_since(&sv).unwrap();
        assert!(!diff.is_empty());

        // A peer holding the base state needs only the diff to catch up
        let peer = CollabDocument::new();
        peer.apply_update(&base_state, "seed").unwrap();
        peer.apply_update(&diff, "diff").unwrap();
        assert_eq!(peer.to_text(), "base extended");
    }

    #[test]
    fn test_observer_receives_delta_and_origin() {
        let doc = CollabDocument::new();
        let seen: Arc<Mutex<Vec<(usize, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        doc.observe(move |delta, origin| {
            seen_clone.lock().unwrap().push((delta.len(), origin.to_string()));
        });

        doc.insert(0, "hi");
        let remote = CollabDocument::new();
        let update = remote.insert(0, "yo");
        doc.apply_update(&update, "client-42").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, ORIGIN_LOCAL);
        assert_eq!(seen[1].1, "client-42");
        assert!(seen.iter().all(|(len, _)| *len > 0));
    }

    #[test]
    fn test_observer_not_fired_for_noop_reapply() {
        let doc = CollabDocument::new();
        let source = CollabDocument::new();
        let update = source.insert(0, "x");

        doc.apply_update(&update, "peer").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        doc.observe(move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Re-applying an already-known update produces no delta
        doc.apply_update(&update, "peer").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unicode_text() {
        let doc = CollabDocument::new();
        doc.load_from_text("héllo wörld");
        let restored = CollabDocument::new();
        restored.apply_update(&doc.encode_state(), "seed").unwrap();
        assert_eq!(restored.to_text(), "héllo wörld");
    }
}
