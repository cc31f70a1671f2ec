use crate::entry::{CacheEntry, EntryState, InFlight, Outcome};
use crate::error::Error;
use crate::tags::TagIndex;
use crate::traits::{Endpoints, Transport};
use crate::types::{CacheKey, QueryState, QueryStatus, RequestId, ResolvedOptions};
use moka::{ops::compute::Op, sync::Cache};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, trace, warn};

enum Lookup<D> {
    Ready(Outcome<D>),
    Wait(watch::Receiver<Option<Outcome<D>>>),
    // The request in flight was sent before the entry got invalidated.
    Outdated(watch::Receiver<Option<Outcome<D>>>),
}

// Owns the sending side of a fetch. If the fetch task goes away without a result, e.g. because decoding panicked,
// the entry is settled as rejected instead of being left pending forever.
struct FetchGuard<E: Endpoints> {
    store: Arc<CacheStore<E>>,
    entry: Arc<CacheEntry<E>>,
    id:    RequestId,
    tx:    Option<watch::Sender<Option<Outcome<E::Data>>>>,
}

impl<E: Endpoints> FetchGuard<E> {
    fn finish(mut self, outcome: Outcome<E::Data>) {
        self.store.complete_fetch(&self.entry, self.id, &outcome);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl<E: Endpoints> Drop for FetchGuard<E> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let err = Error::network("fetch ended without a result");
            self.store.abandon_fetch(&self.entry, self.id, &err);
            tx.send_replace(Some(Err(err)));
        }
    }
}

/// The keyed map of query entries and the state machine driving them.
///
/// Every state change happens in a short critical section under the entry's own lock; the only suspension points are
/// the transport calls, which run in spawned tasks so that dropping a caller never cancels a fetch.
pub struct CacheStore<E: Endpoints> {
    endpoints:    Arc<E>,
    transport:    Arc<dyn Transport>,
    entries:      Cache<CacheKey, Arc<CacheEntry<E>>>,
    tags:         TagIndex<E::Tag>,
    defaults:     ResolvedOptions,
    runtime:      Handle,
    next_request: AtomicU64,
    closed:       AtomicBool,
}

impl<E: Endpoints> CacheStore<E> {
    pub(crate) fn new(
        endpoints: Arc<E>,
        transport: Arc<dyn Transport>,
        defaults: ResolvedOptions,
        runtime: Handle,
    ) -> Self {
        Self {
            endpoints,
            transport,
            entries: Cache::builder().name(std::any::type_name::<E>()).build(),
            tags: TagIndex::new(),
            defaults,
            runtime,
            next_request: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoints(&self) -> &Arc<E> {
        &self.endpoints
    }

    pub fn tags(&self) -> &TagIndex<E::Tag> {
        &self.tags
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        }
        else {
            Ok(())
        }
    }

    fn options_for(&self, query: &E::Query) -> ResolvedOptions {
        self.endpoints.query_options(query).resolve(&self.defaults)
    }

    /// Run `f` under the lock of the live entry for `query`, creating the entry if there is none.
    pub(crate) fn with_live_entry<R>(
        &self,
        query: &E::Query,
        f: impl FnOnce(&Arc<CacheEntry<E>>, &mut EntryState<E>) -> R,
    ) -> Result<R, Error> {
        self.check_open()?;
        let key = self.endpoints.cache_key(query)?;

        loop {
            let entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| {
                    trace!(%key, "new cache entry");
                    Arc::new(CacheEntry::new(key.clone(), query.clone(), self.options_for(query)))
                })
                .into_value();

            let mut state = entry.lock();
            if state.evicted {
                // Lost a race against eviction; the map no longer holds this entry by the time we get its lock.
                continue;
            }
            return Ok(f(&entry, &mut state));
        }
    }

    pub(crate) fn entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry<E>>> {
        self.entries.get(key)
    }

    pub(crate) fn all_entries(&self) -> Vec<Arc<CacheEntry<E>>> {
        self.entries.iter().map(|(_, entry)| entry).collect()
    }

    /// Resolve `query` from the cache, fetching it if the entry is missing, uninitialized or invalidated.
    ///
    /// Concurrent calls for the same key share a single transport request and get the same outcome.
    pub async fn ensure(self: &Arc<Self>, query: &E::Query) -> Result<E::Data, Error> {
        let mut outdated_joined = false;
        loop {
            let lookup = self.with_live_entry(query, |entry, state| {
                self.touch_unused(entry, state);
                if state.is_fresh() {
                    if let Some(outcome) = settled_outcome(state) {
                        trace!(key = %entry.key(), "cache hit");
                        return Lookup::Ready(outcome);
                    }
                }
                if let Some(in_flight) = state.in_flight.as_ref().filter(|_| state.stale && !outdated_joined) {
                    trace!(key = %entry.key(), request = %in_flight.id, "waiting out a pre-invalidation request");
                    return Lookup::Outdated(in_flight.outcome.clone());
                }
                Lookup::Wait(self.join_or_fetch(entry, state))
            })?;

            match lookup {
                Lookup::Ready(outcome) => return outcome,
                Lookup::Wait(receiver) => return wait_outcome(receiver).await,
                Lookup::Outdated(receiver) => {
                    // Its result predates the invalidation; look again once it has settled.
                    let _ = wait_outcome(receiver).await;
                    outdated_joined = true;
                }
            }
        }
    }

    /// Fetch `query` regardless of what the cache holds, joining a request already in flight.
    pub async fn refetch(self: &Arc<Self>, query: &E::Query) -> Result<E::Data, Error> {
        let receiver = self.with_live_entry(query, |entry, state| {
            self.touch_unused(entry, state);
            self.join_or_fetch(entry, state)
        })?;
        wait_outcome(receiver).await
    }

    // An entry read without being subscribed to must still leave the cache eventually.
    fn touch_unused(self: &Arc<Self>, entry: &Arc<CacheEntry<E>>, state: &mut EntryState<E>) {
        state.touch();
        if state.is_unused() && state.eviction.is_none() {
            self.schedule_eviction(entry, state);
        }
    }

    pub(crate) async fn refetch_entry(self: &Arc<Self>, entry: &Arc<CacheEntry<E>>) -> Result<E::Data, Error> {
        self.check_open()?;
        let receiver = {
            let mut state = entry.lock();
            if state.evicted {
                return Err(Error::Closed);
            }
            state.touch();
            self.join_or_fetch(entry, &mut state)
        };
        wait_outcome(receiver).await
    }

    pub(crate) fn join_or_fetch(
        self: &Arc<Self>,
        entry: &Arc<CacheEntry<E>>,
        state: &mut EntryState<E>,
    ) -> watch::Receiver<Option<Outcome<E::Data>>> {
        if let Some(in_flight) = state.in_flight.as_ref() {
            trace!(key = %entry.key(), request = %in_flight.id, "joining in-flight request");
            return in_flight.outcome.clone();
        }
        self.start_fetch(entry, state)
    }

    // The caller must have checked that nothing is in flight for the entry.
    pub(crate) fn start_fetch(
        self: &Arc<Self>,
        entry: &Arc<CacheEntry<E>>,
        state: &mut EntryState<E>,
    ) -> watch::Receiver<Option<Outcome<E::Data>>> {
        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = watch::channel(None);

        state.status = QueryStatus::Pending;
        state.stale = false;
        state.refetch_queued = false;
        state.in_flight = Some(InFlight {
            id,
            outcome: rx.clone(),
        });
        entry.publish(state);

        debug!(key = %entry.key(), request = %id, refetch = state.data.is_some(), "fetch started");

        let guard = FetchGuard {
            store: Arc::clone(self),
            entry: Arc::clone(entry),
            id,
            tx: Some(tx),
        };
        self.runtime.spawn(async move {
            let outcome = guard.store.fetch(guard.entry.query()).await;
            guard.finish(outcome);
        });

        rx
    }

    async fn fetch(&self, query: &E::Query) -> Outcome<E::Data> {
        let request = self.endpoints.query_request(query)?;
        let raw = self.transport.request(&request).await?;
        self.endpoints.decode_query(query, raw)
    }

    fn complete_fetch(self: &Arc<Self>, entry: &Arc<CacheEntry<E>>, id: RequestId, outcome: &Outcome<E::Data>) {
        let mut state = entry.lock();

        if state.evicted {
            debug!(key = %entry.key(), request = %id, "entry evicted while fetching, result discarded");
            return;
        }
        if state.in_flight.as_ref().map(|f| f.id) != Some(id) {
            debug!(key = %entry.key(), request = %id, "superseded request, result discarded");
            return;
        }

        state.in_flight = None;

        if let (Ok(data), true) = (outcome, state.pins > 0) {
            // Optimistic patches sit on top of the cached data. Keep them, fetch again once the last one settles.
            debug!(key = %entry.key(), request = %id, pins = state.pins, "fulfilled while patched, result deferred");
            state.status = QueryStatus::Fulfilled;
            state.error = None;
            state.refetch_queued = true;
            let tags = self.endpoints.provides_tags(entry.query(), Some(data));
            self.tags.record(entry.key(), tags.iter().cloned());
            state.tags = tags.into_iter().collect();
            entry.publish(&state);
            return;
        }

        let tags = match outcome {
            Ok(data) => {
                state.status = QueryStatus::Fulfilled;
                state.data = Some(data.clone());
                state.error = None;
                state.fulfilled_at = Some(Instant::now());
                debug!(key = %entry.key(), request = %id, "fulfilled");
                self.endpoints.provides_tags(entry.query(), Some(data))
            }
            Err(err) => {
                // Previous data, if any, stays available next to the error.
                state.status = QueryStatus::Rejected;
                state.error = Some(err.clone());
                warn!(key = %entry.key(), request = %id, error = %err, "rejected");
                self.endpoints.provides_tags(entry.query(), None)
            }
        };
        self.tags.record(entry.key(), tags.iter().cloned());
        state.tags = tags.into_iter().collect();

        // start_fetch() clears the stale flag, so a set one means an invalidation arrived while the request was out.
        if state.refetch_queued || state.stale {
            state.refetch_queued = false;
            if state.subscribers > 0 {
                debug!(key = %entry.key(), "issuing refetch queued during request {id}");
                // start_fetch() publishes the state.
                drop(self.start_fetch(entry, &mut state));
                return;
            }
            state.stale = true;
        }
        entry.publish(&state);
    }

    fn abandon_fetch(&self, entry: &CacheEntry<E>, id: RequestId, err: &Error) {
        let mut state = entry.lock();
        if state.evicted || state.in_flight.as_ref().map(|f| f.id) != Some(id) {
            return;
        }
        state.in_flight = None;
        state.status = QueryStatus::Rejected;
        state.error = Some(err.clone());
        warn!(key = %entry.key(), request = %id, "fetch abandoned");
        entry.publish(&state);
    }

    /// Refetch subscribed entries among `keys`; mark the others stale. Returns the keys that are being refetched.
    pub fn invalidate(self: &Arc<Self>, keys: impl IntoIterator<Item = CacheKey>) -> Vec<CacheKey> {
        let mut refetching = Vec::new();

        for key in keys {
            let Some(entry) = self.entry(&key)
            else {
                continue;
            };
            let mut state = entry.lock();
            if state.evicted {
                continue;
            }

            if state.pins > 0 && state.in_flight.is_none() {
                trace!(%key, pins = state.pins, "invalidated while patched, refetch deferred");
                state.refetch_queued = true;
                if state.subscribers > 0 {
                    refetching.push(key);
                }
            }
            else if state.subscribers > 0 {
                if state.in_flight.is_some() {
                    trace!(%key, "invalidated while in flight, refetch queued");
                    state.refetch_queued = true;
                }
                else {
                    drop(self.start_fetch(&entry, &mut state));
                }
                refetching.push(key);
            }
            else {
                trace!(%key, "invalidated without subscribers, marked stale");
                state.stale = true;
                entry.publish(&state);
            }
        }

        refetching
    }

    /// Transform an entry's data in place. Status is left untouched. Returns `false` if there was no data to update.
    pub fn write(&self, key: &CacheKey, updater: impl FnOnce(&mut E::Data)) -> bool {
        let Some(entry) = self.entry(key)
        else {
            return false;
        };
        let mut state = entry.lock();
        if state.evicted {
            return false;
        }
        let Some(data) = state.data.as_mut()
        else {
            return false;
        };
        updater(data);
        entry.publish(&state);
        true
    }

    pub(crate) fn restore(&self, entry: &CacheEntry<E>, data: Option<E::Data>) {
        let mut state = entry.lock();
        if state.evicted {
            return;
        }
        state.data = data;
        entry.publish(&state);
    }

    /// Drop one optimistic pin from the entry. Once the last pin is gone a refetch deferred by it gets issued and, if
    /// nobody is subscribed, the eviction countdown starts.
    pub(crate) fn release_pin(self: &Arc<Self>, entry: &Arc<CacheEntry<E>>, state: &mut EntryState<E>) {
        state.pins = state.pins.saturating_sub(1);
        if state.evicted {
            return;
        }
        if state.pins == 0 && state.refetch_queued && state.in_flight.is_none() {
            state.refetch_queued = false;
            if state.subscribers > 0 {
                debug!(key = %entry.key(), "issuing refetch deferred by optimistic patches");
                drop(self.start_fetch(entry, state));
            }
            else {
                state.stale = true;
                entry.publish(state);
            }
        }
        if state.is_unused() {
            self.schedule_eviction(entry, state);
        }
    }

    /// Start the countdown after which an unused entry leaves the cache. Any earlier timer of the entry is cancelled.
    pub(crate) fn schedule_eviction(self: &Arc<Self>, entry: &Arc<CacheEntry<E>>, state: &mut EntryState<E>) {
        state.cancel_eviction();
        let generation = state.eviction_gen;
        let window = state.options.keep_unused_for;
        trace!(key = %entry.key(), ?window, "eviction scheduled");

        let store = Arc::clone(self);
        let entry = Arc::clone(entry);
        state.eviction = Some(self.runtime.spawn(async move {
            tokio::time::sleep(window).await;
            store.evict(&entry, generation);
        }));
    }

    /// Drop the entry from the cache unless it has been re-used or re-scheduled since `generation` was issued.
    pub(crate) fn evict(&self, entry: &Arc<CacheEntry<E>>, generation: u64) -> bool {
        let mut state = entry.lock();
        if state.evicted || state.eviction_gen != generation || !state.is_unused() {
            return false;
        }

        state.evicted = true;
        state.eviction = None;
        self.tags.remove(entry.key());

        // Still under the entry lock: whoever grabbed this entry from the map meanwhile will see the flag and retry.
        let _ = self
            .entries
            .entry(entry.key().clone())
            .and_compute_with(|current| match current {
                Some(current) if Arc::ptr_eq(current.value(), entry) => Op::Remove,
                _ => Op::Nop,
            });
        debug!(key = %entry.key(), "evicted");
        true
    }

    pub fn snapshot(&self, key: &CacheKey) -> Option<QueryState<E::Data>> {
        self.entry(key).map(|entry| entry.lock().snapshot())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries. Flushes moka's pending maintenance first so that the count is exact.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().next().is_none()
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for entry in self.all_entries() {
            let mut state = entry.lock();
            state.cancel_eviction();
            state.evicted = true;
        }
        self.entries.invalidate_all();
        self.tags.clear();
        debug!(cache = std::any::type_name::<E>(), "closed");
    }
}

fn settled_outcome<E: Endpoints>(state: &EntryState<E>) -> Option<Outcome<E::Data>> {
    match state.status {
        QueryStatus::Fulfilled => state.data.clone().map(Ok),
        QueryStatus::Rejected => state.error.clone().map(Err),
        _ => None,
    }
}

async fn wait_outcome<D: Clone>(mut receiver: watch::Receiver<Option<Outcome<D>>>) -> Outcome<D> {
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.as_ref().cloned().unwrap_or(Err(Error::Closed)),
        // The fetch task is gone without reporting back: the runtime is shutting down.
        Err(_) => Err(Error::Closed),
    }
}
