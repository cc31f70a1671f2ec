//! # rq-cache
//!
//! Client-side cache of remote query results with tag-based invalidation and optimistic mutations.
//!
//! Think of it as the data layer sitting between an application's views and its HTTP API.
//!
//! # The Basics
//!
//! The `rq-cache` crate is designed for the following use case:
//!
//! - A remote API read through a set of known queries ("list todos", "get todo by id") and modified through a set of
//!   known mutations ("add todo", "delete todo").
//! - Several parts of an application looking at the same data at the same time.
//! - Mutations whose effect on cached data is known well enough to show it before the server confirms it.
//!
//! The cache operates on the following principles:
//!
//! - Every query result is stored under a [`CacheKey`](types::CacheKey) made of the endpoint name and the serialized
//!   query argument.
//! - Identical requests in flight at the same time are merged into one transport call.
//! - Cached entries provide _tags_; mutations invalidate tags. A successful mutation refetches every subscribed entry
//!   providing any of the tags it invalidates. Unsubscribed ones are only marked stale.
//! - A mutation may declare optimistic patches. They are applied before the request is sent and undone if it fails.
//! - An entry nobody subscribes to is evicted after a configurable window.
//! - Fully async, built on Tokio. The entry map is a [moka](https://crates.io/crates/moka) cache.
//!
//! # Endpoints
//!
//! The primary component the user provides is an implementation of the [`Endpoints`] trait. Through its associated
//! types it defines the closed set of queries, mutations and tags, and the data type they produce. Its methods turn
//! queries and mutations into [`RequestDescriptor`](types::RequestDescriptor)s, decode responses, and map mutations
//! to the tags they invalidate. Because queries and mutations are enums, forgetting to decide what a new mutation
//! invalidates is a compile error.
//!
//! The other component is the [`Transport`], which performs the actual requests.
//!
//! # Lifecycle of an entry
//!
//! `Uninitialized → Pending → Fulfilled | Rejected`, and back to `Pending` on every refetch. While refetching, the
//! previous data stays visible. A rejected entry keeps its error until a refetch succeeds.

pub mod cache;
pub(crate) mod entry;
pub mod error;
pub mod mutation;
pub mod optimistic;
pub mod store;
pub mod subscription;
pub mod tags;
pub mod test;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::QueryCache;
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use traits::{Endpoints, Transport};

pub mod prelude {
    pub use crate::cache::QueryCache;
    pub use crate::error::Error;
    pub use crate::subscription::Subscription;
    pub use crate::traits::{Endpoints, Transport};
    pub use crate::types::*;
}
