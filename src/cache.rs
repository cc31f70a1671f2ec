use crate::mutation::MutationExecutor;
use crate::optimistic::OptimisticPatchManager;
use crate::prelude::*;
use crate::store::CacheStore;
use crate::subscription::SubscriptionManager;
use crate::types::ResolvedOptions;
use fieldx_plus::fx_plus;
use std::{sync::Arc, time::Duration};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_stream::Stream;
use tracing::debug;

/// The query cache engine.
///
/// ```ignore
/// let cache = QueryCache::builder()
///     .endpoints(TodoApi::new())
///     .transport(Arc::new(HttpTransport::new(base_url)))
///     .keep_unused_for(Duration::from_secs(30))
///     .refetch_on_focus(true)
///     .build()?;
///
/// let mut todos = cache.subscribe(TodoQuery::List)?;
/// let state = todos.settled().await?;
///
/// // Patches the list right away, then either keeps the patch and refetches everything tagged `Todos`, or undoes it.
/// cache.invoke_mutation(TodoMutation::Delete(3)).await?;
/// ```
///
/// Must be built and used within a Tokio runtime: fetches and eviction timers are spawned onto the runtime which was
/// current when the cache was first used.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`QueryCache`].", "", "See [`QueryCache::builder()`] method."),
        method_doc("Implement builder pattern for [`QueryCache`]."),
    )
)]
pub struct QueryCache<E>
where
    E: Endpoints,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    endpoints: Arc<E>,

    #[fieldx(vis(pub(crate)), builder(vis(pub), required), get(clone))]
    transport: Arc<dyn Transport>,

    /// How long an entry nobody subscribes to is kept. Can be overridden per query with
    /// [`QueryOptions::keep_unused_for`].
    #[fieldx(get(copy), default(Duration::from_secs(60)))]
    keep_unused_for: Duration,

    /// Refetch subscribed queries when [`PlatformSignal::FocusRegained`] arrives.
    #[fieldx(get(copy), default(false))]
    refetch_on_focus: bool,

    /// Refetch subscribed queries when [`PlatformSignal::ConnectivityRestored`] arrives.
    #[fieldx(get(copy), default(false))]
    refetch_on_reconnect: bool,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    store: Arc<CacheStore<E>>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    subscriptions: Arc<SubscriptionManager<E>>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    patches: Arc<OptimisticPatchManager<E>>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    executor: Arc<MutationExecutor<E>>,

    #[fieldx(private, clearer, lock, set, builder(off))]
    signal_listener: JoinHandle<()>,
}

impl<E> QueryCache<E>
where
    E: Endpoints,
{
    fn build_store(&self) -> Arc<CacheStore<E>> {
        Arc::new(CacheStore::new(
            self.endpoints(),
            self.transport(),
            ResolvedOptions {
                keep_unused_for:      self.keep_unused_for(),
                refetch_on_focus:     self.refetch_on_focus(),
                refetch_on_reconnect: self.refetch_on_reconnect(),
            },
            Handle::current(),
        ))
    }

    fn build_subscriptions(&self) -> Arc<SubscriptionManager<E>> {
        Arc::new(SubscriptionManager::new(self.store()))
    }

    fn build_patches(&self) -> Arc<OptimisticPatchManager<E>> {
        Arc::new(OptimisticPatchManager::new(self.store()))
    }

    fn build_executor(&self) -> Arc<MutationExecutor<E>> {
        Arc::new(MutationExecutor::new(self.store(), self.patches()))
    }

    /// Subscribe to a query. The returned handle reports every state change of the cache entry and keeps it from being
    /// evicted until dropped.
    pub fn subscribe(&self, query: E::Query) -> Result<Subscription<E>, Error> {
        let (entry, receiver) = self.subscriptions().subscribe(&query)?;
        Ok(Subscription::new(self, entry, receiver))
    }

    /// Get the data of a query without subscribing to it: from the cache if it's there, from the transport otherwise.
    pub async fn query(&self, query: E::Query) -> Result<E::Data, Error> {
        self.store().ensure(&query).await
    }

    /// Run a mutation. Resolves to the decoded response or to the error after all optimistic patches were undone.
    pub async fn invoke_mutation(&self, mutation: E::Mutation) -> Result<E::Data, Error> {
        self.executor().execute(&mutation).await
    }

    /// Modify cached data directly. Returns `false` if the query has no data in the cache.
    pub fn update_query_data(&self, query: E::Query, updater: impl FnOnce(&mut E::Data)) -> Result<bool, Error> {
        let key = self.endpoints().cache_key(&query)?;
        Ok(self.store().write(&key, updater))
    }

    /// Invalidate every entry providing any of `tags`. Subscribed entries are refetched right away and their keys are
    /// returned; the rest are refetched upon the next use.
    pub fn invalidate_tags(&self, tags: impl IntoIterator<Item = E::Tag>) -> Vec<CacheKey> {
        let store = self.store();
        let tags: Vec<E::Tag> = tags.into_iter().collect();
        let keys = store.tags().keys_for_tags(tags.iter());
        debug!(?tags, entries = keys.len(), "invalidating tags");
        store.invalidate(keys)
    }

    /// A snapshot of the entry of `query`, if there is one.
    pub fn state(&self, query: E::Query) -> Result<Option<QueryState<E::Data>>, Error> {
        let key = self.endpoints().cache_key(&query)?;
        Ok(self.store().snapshot(&key))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.store().contains(key)
    }

    pub fn len(&self) -> usize {
        self.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store().is_empty()
    }

    /// Deliver a platform signal. Returns the keys being refetched because of it.
    pub fn signal(&self, signal: PlatformSignal) -> Vec<CacheKey> {
        self.subscriptions().on_signal(signal)
    }

    /// Consume platform signals from a stream in a background task. Replaces a listener started earlier.
    pub fn listen_platform_signals<S>(&self, signals: S)
    where
        S: Stream<Item = PlatformSignal> + Send + Unpin + 'static,
    {
        if let Some(previous) = self.clear_signal_listener() {
            previous.abort();
        }
        self.set_signal_listener(self.subscriptions().listen(signals));
    }

    /// Tear the cache down. Every entry is dropped, pending eviction timers are cancelled, and further calls fail with
    /// [`Error::Closed`]. Fetches already in flight run to completion but their results are discarded.
    pub fn close(&self) {
        if let Some(listener) = self.clear_signal_listener() {
            listener.abort();
        }
        self.store().close();
    }
}
