use crate::cache::QueryCache;
use crate::entry::CacheEntry;
use crate::error::Error;
use crate::store::CacheStore;
use crate::traits::Endpoints;
use crate::types::{CacheKey, PlatformSignal, QueryState, QueryStatus};
use fieldx_plus::{child_build, fx_plus, Child};
use std::{fmt::Debug, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, trace};

/// Keeps subscriber counts, eviction timers, and reacts to platform signals.
pub struct SubscriptionManager<E: Endpoints> {
    store: Arc<CacheStore<E>>,
}

impl<E: Endpoints> SubscriptionManager<E> {
    pub(crate) fn new(store: Arc<CacheStore<E>>) -> Self {
        Self { store }
    }

    /// Register interest in `query`. A fetch is started if the entry has no usable data and nothing is in flight.
    pub fn subscribe(
        &self,
        query: &E::Query,
    ) -> Result<(Arc<CacheEntry<E>>, watch::Receiver<QueryState<E::Data>>), Error> {
        self.store.with_live_entry(query, |entry, state| {
            state.subscribers += 1;
            state.touch();
            state.cancel_eviction();
            trace!(key = %entry.key(), subscribers = state.subscribers, "subscribed");

            if !state.is_fresh() && state.in_flight.is_none() {
                drop(self.store.start_fetch(entry, state));
            }
            (Arc::clone(entry), entry.watch())
        })
    }

    pub fn unsubscribe(&self, entry: &Arc<CacheEntry<E>>) {
        let mut state = entry.lock();
        if state.evicted {
            return;
        }
        state.subscribers = state.subscribers.saturating_sub(1);
        trace!(key = %entry.key(), subscribers = state.subscribers, "unsubscribed");
        if state.is_unused() {
            self.store.schedule_eviction(entry, &mut state);
        }
    }

    /// Invalidate every subscribed entry which opted into refetching on `signal`. Returns the keys being refetched.
    pub fn on_signal(&self, signal: PlatformSignal) -> Vec<CacheKey> {
        let keys: Vec<CacheKey> = self
            .store
            .all_entries()
            .into_iter()
            .filter(|entry| {
                let state = entry.lock();
                !state.evicted && state.subscribers > 0 && state.options.refetches_on(signal)
            })
            .map(|entry| entry.key().clone())
            .collect();

        debug!(?signal, entries = keys.len(), "platform signal");
        self.store.invalidate(keys)
    }

    /// Feed signals from a platform event stream until it ends.
    pub fn listen<S>(self: &Arc<Self>, mut signals: S) -> JoinHandle<()>
    where
        S: Stream<Item = PlatformSignal> + Send + Unpin + 'static,
    {
        let manager = Arc::clone(self);
        self.store.runtime().spawn(async move {
            while let Some(signal) = signals.next().await {
                if manager.store.check_open().is_err() {
                    break;
                }
                manager.on_signal(signal);
            }
            debug!("platform signal stream ended");
        })
    }
}

/// A live interest in one query. The entry stays in the cache for as long as the handle exists.
///
/// Dropping the handle unsubscribes.
#[fx_plus(child(QueryCache<E>, rc_strong), sync, default(off))]
pub struct Subscription<E>
where
    E: Endpoints,
{
    entry:    Arc<CacheEntry<E>>,
    receiver: watch::Receiver<QueryState<E::Data>>,
}

impl<E> Subscription<E>
where
    E: Endpoints,
{
    pub(crate) fn new(
        parent: &QueryCache<E>,
        entry: Arc<CacheEntry<E>>,
        receiver: watch::Receiver<QueryState<E::Data>>,
    ) -> Self {
        child_build!(
            parent,
            Subscription<E> {
                entry:    entry,
                receiver: receiver,
            }
        )
        .unwrap()
    }

    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    pub fn query(&self) -> &E::Query {
        self.entry.query()
    }

    pub fn state(&self) -> QueryState<E::Data> {
        self.receiver.borrow().clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.receiver.borrow().status
    }

    pub fn data(&self) -> Option<E::Data> {
        self.receiver.borrow().data.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.receiver.borrow().error.clone()
    }

    /// Wait for the next state change. Intermediate states may be skipped if several changes happen before the call
    /// gets to look at them.
    pub async fn changed(&mut self) -> Result<QueryState<E::Data>, Error> {
        self.receiver.changed().await.map_err(|_| Error::Closed)?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// Wait until the entry is either fulfilled or rejected.
    pub async fn settled(&mut self) -> Result<QueryState<E::Data>, Error> {
        let state = self
            .receiver
            .wait_for(QueryState::is_settled)
            .await
            .map_err(|_| Error::Closed)?;
        Ok(state.clone())
    }

    /// Force a refetch, sharing the request with any already in flight.
    pub async fn refetch(&self) -> Result<E::Data, Error> {
        self.parent().store().refetch_entry(&self.entry).await
    }

    pub fn unsubscribe(self) {}
}

impl<E> Drop for Subscription<E>
where
    E: Endpoints,
{
    fn drop(&mut self) {
        self.parent().subscriptions().unsubscribe(&self.entry);
    }
}

impl<E> Debug for Subscription<E>
where
    E: Endpoints,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", self.entry.key())
            .field("status", &self.receiver.borrow().status)
            .finish()
    }
}
