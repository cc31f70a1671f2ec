use crate::error::Error;
use crate::optimistic::{MutationRecord, OptimisticPatchManager};
use crate::store::CacheStore;
use crate::traits::Endpoints;
use crate::types::{CacheKey, Effect, Patch};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    fmt::{self, Display},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, trace, warn};

/// Where a single mutation invocation is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationPhase {
    Idle,
    OptimisticallyApplied,
    Dispatched,
    Committed,
    RolledBack,
}

impl MutationPhase {
    pub fn can_advance_to(self, next: MutationPhase) -> bool {
        use MutationPhase::*;
        matches!(
            (self, next),
            (Idle, OptimisticallyApplied)
                | (Idle, Dispatched)
                | (OptimisticallyApplied, Dispatched)
                | (OptimisticallyApplied, RolledBack)
                | (Dispatched, Committed)
                | (Dispatched, RolledBack)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, MutationPhase::Committed | MutationPhase::RolledBack)
    }
}

impl Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
struct Invocation {
    id:    u64,
    phase: MutationPhase,
}

impl Invocation {
    // An invalid transition leaves the phase unchanged.
    fn advance(&mut self, next: MutationPhase) -> bool {
        if !self.phase.can_advance_to(next) {
            error!(mutation = self.id, from = %self.phase, to = %next, "invalid mutation phase transition");
            return false;
        }
        trace!(mutation = self.id, from = %self.phase, to = %next, "mutation phase");
        self.phase = next;
        true
    }
}

/// Runs mutations: optimistic patches, the transport call, then either commit and invalidation or rollback.
///
/// Mutations patching the same cache entry are serialized through per-key lanes. A lane is taken before the first patch
/// is applied and released only after the mutation has settled, including the invalidation it causes.
pub struct MutationExecutor<E: Endpoints> {
    store:   Arc<CacheStore<E>>,
    patches: Arc<OptimisticPatchManager<E>>,
    lanes:   Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
    next_id: AtomicU64,
}

impl<E: Endpoints> MutationExecutor<E> {
    pub(crate) fn new(store: Arc<CacheStore<E>>, patches: Arc<OptimisticPatchManager<E>>) -> Self {
        Self {
            store,
            patches,
            lanes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn execute(&self, mutation: &E::Mutation) -> Result<E::Data, Error> {
        self.store.check_open()?;

        let endpoints = Arc::clone(self.store.endpoints());
        let mut invocation = Invocation {
            id:    self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            phase: MutationPhase::Idle,
        };
        debug!(mutation = invocation.id, ?mutation, "mutation started");

        let effects = endpoints.on_mutation_start(mutation);
        let mut patches: Vec<(&E::Query, &Patch<E::Data>)> = Vec::new();
        let mut lane_keys = BTreeSet::new();
        for effect in effects.iter() {
            match effect {
                Effect::Patch { query, patch } => {
                    lane_keys.insert(endpoints.cache_key(query)?);
                    patches.push((query, patch));
                }
                Effect::Log(message) => info!(mutation = invocation.id, "{message}"),
                Effect::None => (),
            }
        }

        let lanes = self.acquire_lanes(lane_keys).await;
        let outcome = self.run(&endpoints, mutation, &mut invocation, patches).await;
        drop(lanes);
        self.prune_lanes();

        outcome
    }

    async fn run(
        &self,
        endpoints: &E,
        mutation: &E::Mutation,
        invocation: &mut Invocation,
        patches: Vec<(&E::Query, &Patch<E::Data>)>,
    ) -> Result<E::Data, Error> {
        let mut records = Vec::with_capacity(patches.len());
        for (query, patch) in patches {
            match self.patches.apply(query, patch) {
                Ok(record) => records.push(record),
                Err(err) => {
                    self.rollback_all(&mut records);
                    return Err(err);
                }
            }
        }
        if !records.is_empty() {
            invocation.advance(MutationPhase::OptimisticallyApplied);
        }

        let request = match endpoints.mutation_request(mutation) {
            Ok(request) => request,
            Err(err) => {
                self.rollback_all(&mut records);
                if !records.is_empty() {
                    invocation.advance(MutationPhase::RolledBack);
                }
                return Err(err);
            }
        };

        invocation.advance(MutationPhase::Dispatched);
        debug!(mutation = invocation.id, %request, "mutation dispatched");

        let outcome = match self.store.transport().request(&request).await {
            Ok(raw) => endpoints.decode_mutation(mutation, raw),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(data) => {
                // Invalidate while still pinned: refetches of patched entries are deferred until the commit below
                // releases them, so each of those entries is fetched once.
                let tags = endpoints.invalidates_tags(mutation);
                let keys = self.store.tags().keys_for_tags(tags.iter());
                let refetching = self.store.invalidate(keys);

                for record in records.iter_mut() {
                    self.patches.commit(record);
                }
                invocation.advance(MutationPhase::Committed);
                debug!(mutation = invocation.id, ?tags, refetching = refetching.len(), "mutation committed");
                Ok(data)
            }
            Err(err) => {
                self.rollback_all(&mut records);
                invocation.advance(MutationPhase::RolledBack);
                warn!(mutation = invocation.id, error = %err, "mutation failed, rolled back");
                Err(err)
            }
        }
    }

    fn rollback_all(&self, records: &mut [MutationRecord<E>]) {
        // Newest first, so that stacked patches on one key unwind to the oldest snapshot.
        for record in records.iter_mut().rev() {
            self.patches.rollback(record);
        }
    }

    // Keys come sorted out of the BTreeSet which rules out lock-order inversion between two mutations.
    async fn acquire_lanes(&self, keys: BTreeSet<CacheKey>) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lane = Arc::clone(self.lanes.lock().entry(key.clone()).or_default());
            trace!(%key, "waiting for mutation lane");
            guards.push(lane.lock_owned().await);
        }
        guards
    }

    fn prune_lanes(&self) {
        self.lanes.lock().retain(|_, lane| Arc::strong_count(lane) > 1);
    }

    #[cfg(test)]
    pub(crate) fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}
