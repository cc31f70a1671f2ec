use crate::error::Error;
use crate::traits::Endpoints;
use crate::types::{CacheKey, QueryState, QueryStatus, RequestId, ResolvedOptions};
use parking_lot::{Mutex, MutexGuard};
use std::{collections::HashSet, fmt::Debug, time::Instant};
use tokio::{sync::watch, task::JoinHandle};

pub(crate) type Outcome<D> = Result<D, Error>;

// The receiving side of an in-flight fetch. Every request joining the fetch clones the receiver.
pub(crate) struct InFlight<D> {
    pub(crate) id:      RequestId,
    pub(crate) outcome: watch::Receiver<Option<Outcome<D>>>,
}

pub(crate) struct EntryState<E: Endpoints> {
    pub(crate) status:       QueryStatus,
    pub(crate) data:         Option<E::Data>,
    pub(crate) error:        Option<Error>,
    pub(crate) tags:         HashSet<E::Tag>,
    pub(crate) last_access:  Instant,
    pub(crate) fulfilled_at: Option<Instant>,
    pub(crate) subscribers:  usize,
    pub(crate) in_flight:    Option<InFlight<E::Data>>,
    pub(crate) stale:        bool,
    // Invalidated while a fetch was in flight: fetch once more when it settles.
    pub(crate) refetch_queued: bool,
    // Number of unsettled mutation records referencing the entry.
    pub(crate) pins:         usize,
    pub(crate) options:      ResolvedOptions,
    pub(crate) eviction:     Option<JoinHandle<()>>,
    // Bumped on every (re)scheduling or cancellation so that a timer which already fired can tell it's outdated.
    pub(crate) eviction_gen: u64,
    pub(crate) evicted:      bool,
}

impl<E: Endpoints> EntryState<E> {
    fn new(options: ResolvedOptions) -> Self {
        Self {
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            tags: HashSet::new(),
            last_access: Instant::now(),
            fulfilled_at: None,
            subscribers: 0,
            in_flight: None,
            stale: false,
            refetch_queued: false,
            pins: 0,
            options,
            eviction: None,
            eviction_gen: 0,
            evicted: false,
        }
    }

    pub(crate) fn snapshot(&self) -> QueryState<E::Data> {
        QueryState {
            status:       self.status,
            data:         self.data.clone(),
            error:        self.error.clone(),
            stale:        self.stale,
            request_id:   self.in_flight.as_ref().map(|f| f.id),
            fulfilled_at: self.fulfilled_at,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub(crate) fn cancel_eviction(&mut self) {
        self.eviction_gen += 1;
        if let Some(timer) = self.eviction.take() {
            timer.abort();
        }
    }

    /// Nobody is looking at the entry and no mutation depends on it.
    pub(crate) fn is_unused(&self) -> bool {
        self.subscribers == 0 && self.pins == 0
    }

    /// Has data that no one asked to be replaced.
    pub(crate) fn is_fresh(&self) -> bool {
        !self.stale && matches!(self.status, QueryStatus::Fulfilled | QueryStatus::Rejected)
    }
}

/// One query's slot in the cache.
pub struct CacheEntry<E: Endpoints> {
    key:      CacheKey,
    query:    E::Query,
    state:    Mutex<EntryState<E>>,
    notifier: watch::Sender<QueryState<E::Data>>,
}

impl<E: Endpoints> CacheEntry<E> {
    pub(crate) fn new(key: CacheKey, query: E::Query, options: ResolvedOptions) -> Self {
        let (notifier, _) = watch::channel(QueryState::uninitialized());
        Self {
            key,
            query,
            state: Mutex::new(EntryState::new(options)),
            notifier,
        }
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn query(&self) -> &E::Query {
        &self.query
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState<E>> {
        self.state.lock()
    }

    // Must be called with the state lock held so that subscribers observe changes in the order they were made.
    pub(crate) fn publish(&self, state: &EntryState<E>) {
        self.notifier.send_replace(state.snapshot());
    }

    pub(crate) fn watch(&self) -> watch::Receiver<QueryState<E::Data>> {
        self.notifier.subscribe()
    }
}

impl<E: Endpoints> Debug for CacheEntry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("status", &state.status)
            .field("data", &state.data)
            .field("error", &state.error)
            .field("tags", &state.tags)
            .field("subscribers", &state.subscribers)
            .field("pins", &state.pins)
            .field("stale", &state.stale)
            .finish()
    }
}
