use crate::error::Error;
use crate::traits::Endpoints;
use serde::Serialize;
use std::{
    borrow::Cow,
    fmt::{self, Debug, Display},
    sync::Arc,
    time::{Duration, Instant},
};

/// Identifies a query endpoint together with the serialized argument it was called with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    endpoint: &'static str,
    argument: String,
}

impl CacheKey {
    pub fn new(endpoint: &'static str, argument: impl Into<String>) -> Self {
        Self {
            endpoint,
            argument: argument.into(),
        }
    }

    /// Build a key from any serializable argument. Serialization must be deterministic for the key to be stable, so
    /// avoid arguments containing hash maps.
    pub fn from_argument<A: Serialize + ?Sized>(endpoint: &'static str, argument: &A) -> Result<Self, Error> {
        Ok(Self::new(endpoint, serde_json::to_string(argument)?))
    }

    pub fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    pub fn argument(&self) -> &str {
        &self.argument
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.argument == "null" || self.argument.is_empty() {
            write!(f, "{}", self.endpoint)
        }
        else {
            write!(f, "{}({})", self.endpoint, self.argument)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

/// What a subscriber sees of a cache entry.
///
/// A refetch keeps the previous `data` around while `status` is [`QueryStatus::Pending`], see
/// [`is_refetching()`](Self::is_refetching).
#[derive(Clone, Debug)]
pub struct QueryState<D> {
    pub status:       QueryStatus,
    pub data:         Option<D>,
    pub error:        Option<Error>,
    /// Invalidated while nobody was subscribed; will be refetched on the next subscription.
    pub stale:        bool,
    pub request_id:   Option<RequestId>,
    pub fulfilled_at: Option<Instant>,
}

impl<D> QueryState<D> {
    pub(crate) fn uninitialized() -> Self {
        Self {
            status:       QueryStatus::Uninitialized,
            data:         None,
            error:        None,
            stale:        false,
            request_id:   None,
            fulfilled_at: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Pending && self.data.is_none()
    }

    pub fn is_refetching(&self) -> bool {
        self.status == QueryStatus::Pending && self.data.is_some()
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, QueryStatus::Fulfilled | QueryStatus::Rejected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        })
    }
}

/// What the [`Transport`](crate::traits::Transport) is asked to do.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDescriptor {
    pub resource: String,
    pub verb:     Verb,
    pub body:     Option<serde_json::Value>,
}

impl RequestDescriptor {
    pub fn new(verb: Verb, resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            verb,
            body: None,
        }
    }

    pub fn get(resource: impl Into<String>) -> Self {
        Self::new(Verb::Get, resource)
    }

    pub fn post(resource: impl Into<String>) -> Self {
        Self::new(Verb::Post, resource)
    }

    pub fn put(resource: impl Into<String>) -> Self {
        Self::new(Verb::Put, resource)
    }

    pub fn patch(resource: impl Into<String>) -> Self {
        Self::new(Verb::Patch, resource)
    }

    pub fn delete(resource: impl Into<String>) -> Self {
        Self::new(Verb::Delete, resource)
    }

    pub fn with_body<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, Error> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }
}

impl Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.resource)
    }
}

/// Events delivered by the hosting platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlatformSignal {
    FocusRegained,
    ConnectivityRestored,
}

/// Per-query overrides of the cache-wide defaults. `None` means "use the default".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub keep_unused_for:      Option<Duration>,
    pub refetch_on_focus:     Option<bool>,
    pub refetch_on_reconnect: Option<bool>,
}

impl QueryOptions {
    pub fn keep_unused_for(mut self, window: Duration) -> Self {
        self.keep_unused_for = Some(window);
        self
    }

    pub fn refetch_on_focus(mut self, on: bool) -> Self {
        self.refetch_on_focus = Some(on);
        self
    }

    pub fn refetch_on_reconnect(mut self, on: bool) -> Self {
        self.refetch_on_reconnect = Some(on);
        self
    }

    pub(crate) fn resolve(&self, defaults: &ResolvedOptions) -> ResolvedOptions {
        ResolvedOptions {
            keep_unused_for:      self.keep_unused_for.unwrap_or(defaults.keep_unused_for),
            refetch_on_focus:     self.refetch_on_focus.unwrap_or(defaults.refetch_on_focus),
            refetch_on_reconnect: self.refetch_on_reconnect.unwrap_or(defaults.refetch_on_reconnect),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub(crate) keep_unused_for:      Duration,
    pub(crate) refetch_on_focus:     bool,
    pub(crate) refetch_on_reconnect: bool,
}

impl ResolvedOptions {
    pub(crate) fn refetches_on(&self, signal: PlatformSignal) -> bool {
        match signal {
            PlatformSignal::FocusRegained => self.refetch_on_focus,
            PlatformSignal::ConnectivityRestored => self.refetch_on_reconnect,
        }
    }
}

/// In-place transformation of cached data.
pub struct Patch<D>(Arc<dyn Fn(&mut D) + Send + Sync>);

impl<D> Patch<D> {
    pub fn new(f: impl Fn(&mut D) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn apply(&self, data: &mut D) {
        (self.0)(data)
    }
}

impl<D> Clone for Patch<D> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<D> Debug for Patch<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Patch(..)")
    }
}

/// Side effect declared by a mutation when it starts. Interpreted by the
/// [`MutationExecutor`](crate::mutation::MutationExecutor).
pub enum Effect<E: Endpoints> {
    /// Speculatively patch the cached data of a query. Rolled back if the mutation fails.
    Patch { query: E::Query, patch: Patch<E::Data> },
    Log(Cow<'static, str>),
    None,
}

impl<E: Endpoints> Effect<E> {
    pub fn patch(query: E::Query, f: impl Fn(&mut E::Data) + Send + Sync + 'static) -> Self {
        Self::Patch {
            query,
            patch: Patch::new(f),
        }
    }

    pub fn log(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Log(msg.into())
    }
}

impl<E: Endpoints> Debug for Effect<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patch { query, .. } => f.debug_struct("Effect::Patch").field("query", query).finish(),
            Self::Log(msg) => f.debug_tuple("Effect::Log").field(msg).finish(),
            Self::None => f.write_str("Effect::None"),
        }
    }
}
