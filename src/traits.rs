use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

use crate::error::Error;
use crate::types::CacheKey;
use crate::types::Effect;
use crate::types::QueryOptions;
use crate::types::RequestDescriptor;

/// The network boundary. Implementations perform the actual request and classify failures into
/// [`Error::Network`] or [`Error::Server`]. Authentication and base URLs are the implementor's business.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request(&self, request: &RequestDescriptor) -> Result<serde_json::Value, Error>;
}

/// The closed registry of queries and mutations an application talks to.
///
/// Queries and mutations are enums so that every endpoint is known at compile time. The `match` statements in
/// [`provides_tags()`](Endpoints::provides_tags) and [`invalidates_tags()`](Endpoints::invalidates_tags) are what
/// ties mutations to the cached data they affect.
pub trait Endpoints: Sized + Send + Sync + 'static {
    /// The tag type. To tag individual records use an enum with data-carrying variants.
    type Tag: Debug + Clone + Eq + Hash + Send + Sync + 'static;
    /// Cached and returned data. Its `Clone` implementation is used to snapshot data before optimistic patches, so it
    /// must be a deep copy.
    type Data: Debug + Clone + Send + Sync + 'static;
    type Query: Debug + Clone + Serialize + Send + Sync + 'static;
    type Mutation: Debug + Clone + Send + Sync + 'static;

    fn query_name(&self, query: &Self::Query) -> &'static str;
    fn query_request(&self, query: &Self::Query) -> Result<RequestDescriptor, Error>;
    fn decode_query(&self, query: &Self::Query, raw: serde_json::Value) -> Result<Self::Data, Error>;

    /// Tags provided by a query entry. `data` is `None` when the fetch failed.
    fn provides_tags(&self, query: &Self::Query, data: Option<&Self::Data>) -> Vec<Self::Tag>;

    fn mutation_request(&self, mutation: &Self::Mutation) -> Result<RequestDescriptor, Error>;
    fn decode_mutation(&self, mutation: &Self::Mutation, raw: serde_json::Value) -> Result<Self::Data, Error>;
    fn invalidates_tags(&self, mutation: &Self::Mutation) -> Vec<Self::Tag>;

    /// Effects to apply when a mutation starts, before it is dispatched to the transport.
    fn on_mutation_start(&self, _mutation: &Self::Mutation) -> Vec<Effect<Self>> {
        Vec::new()
    }

    fn query_options(&self, _query: &Self::Query) -> QueryOptions {
        QueryOptions::default()
    }

    // The default key is the endpoint name plus the JSON form of the whole query value.
    fn cache_key(&self, query: &Self::Query) -> Result<CacheKey, Error> {
        CacheKey::from_argument(self.query_name(query), query)
    }
}
