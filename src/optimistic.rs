use crate::entry::CacheEntry;
use crate::error::Error;
use crate::store::CacheStore;
use crate::traits::Endpoints;
use crate::types::{CacheKey, Patch};
use std::{fmt::Debug, sync::Arc};
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordState {
    Applied,
    Committed,
    RolledBack,
}

/// Undo information for one optimistic patch.
///
/// While the record is unsettled the patched entry is pinned: it cannot be evicted even if nobody is subscribed to it.
/// A record must end up either committed or rolled back; if one is dropped unsettled its entry gets unpinned and the
/// patch stays in place.
pub struct MutationRecord<E: Endpoints> {
    affected_keys: Vec<CacheKey>,
    undo:          Option<Box<dyn FnOnce() + Send>>,
    state:         RecordState,
    store:         Arc<CacheStore<E>>,
    entry:         Arc<CacheEntry<E>>,
}

impl<E: Endpoints> MutationRecord<E> {
    pub fn affected_keys(&self) -> &[CacheKey] {
        &self.affected_keys
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn is_settled(&self) -> bool {
        self.state != RecordState::Applied
    }

    fn settle(&mut self, outcome: RecordState) -> bool {
        if self.is_settled() {
            return false;
        }
        self.state = outcome;
        self.unpin();
        true
    }

    fn unpin(&self) {
        let mut state = self.entry.lock();
        self.store.release_pin(&self.entry, &mut state);
    }
}

impl<E: Endpoints> Drop for MutationRecord<E> {
    fn drop(&mut self) {
        if !self.is_settled() {
            warn!(keys = ?self.affected_keys, "optimistic patch dropped without commit or rollback, keeping it");
            self.unpin();
        }
    }
}

impl<E: Endpoints> Debug for MutationRecord<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationRecord")
            .field("affected_keys", &self.affected_keys)
            .field("state", &self.state)
            .finish()
    }
}

/// Applies speculative patches and knows how to take them back.
pub struct OptimisticPatchManager<E: Endpoints> {
    store: Arc<CacheStore<E>>,
}

impl<E: Endpoints> OptimisticPatchManager<E> {
    pub(crate) fn new(store: Arc<CacheStore<E>>) -> Self {
        Self { store }
    }

    /// Patch the data cached for `query`.
    ///
    /// An entry with no data yet is left as is, but it is still created and pinned so that the rollback has something
    /// to restore.
    pub fn apply(&self, query: &E::Query, patch: &Patch<E::Data>) -> Result<MutationRecord<E>, Error> {
        let (entry, previous) = self.store.with_live_entry(query, |entry, state| {
            state.pins += 1;
            state.touch();
            state.cancel_eviction();

            let previous = state.data.clone();
            if let Some(data) = state.data.as_mut() {
                patch.apply(data);
                entry.publish(state);
                trace!(key = %entry.key(), "optimistic patch applied");
            }
            else {
                trace!(key = %entry.key(), "nothing to patch");
            }
            (Arc::clone(entry), previous)
        })?;

        let undo: Box<dyn FnOnce() + Send> = {
            let store = Arc::clone(&self.store);
            let entry = Arc::clone(&entry);
            Box::new(move || store.restore(&entry, previous))
        };

        Ok(MutationRecord {
            affected_keys: vec![entry.key().clone()],
            undo: Some(undo),
            state: RecordState::Applied,
            store: Arc::clone(&self.store),
            entry,
        })
    }

    /// Keep the patch. Idempotent.
    pub fn commit(&self, record: &mut MutationRecord<E>) {
        if record.settle(RecordState::Committed) {
            record.undo = None;
            debug!(keys = ?record.affected_keys, "optimistic patch committed");
        }
    }

    /// Restore the data as it was before the patch. Idempotent.
    pub fn rollback(&self, record: &mut MutationRecord<E>) {
        if record.is_settled() {
            return;
        }
        // Restore before unpinning, the entry must not be evicted in between.
        if let Some(undo) = record.undo.take() {
            undo();
        }
        record.settle(RecordState::RolledBack);
        debug!(keys = ?record.affected_keys, "optimistic patch rolled back");
    }
}
