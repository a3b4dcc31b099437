//! Batched object-graph prefetching.
//!
//! A [`Prefetcher`] collects requests of the form "load these relations of
//! this object" into a pending pass, groups identical fetches by target type
//! and column set, and flushes them through a [`CommandPipeline`] in bounded
//! batches. Results land in the session [`ObjectCache`], which also records
//! confirmed absences and per-collection membership.

pub mod adapters;
pub mod cache;
pub mod config;
pub mod error;
pub mod key;
pub mod prefetch;
pub mod schema;

#[cfg(feature = "memory")]
pub use crate::adapters::memory::MemoryAdapter;
pub use crate::adapters::{
    CommandPipeline, ExecutionMode, PlanCompiler, RowMaterializer, ShapeMaterializer,
};
pub use crate::cache::{
    CachedEntry, CollectionCursor, CollectionState, EntityState, LifetimeToken, ObjectCache,
    SessionCache,
};
pub use crate::config::PrefetchConfig;
pub use crate::error::Error;
pub use crate::key::{Key, KeyKind, KeyValue, TypeCertainty};
pub use crate::prefetch::{PassStatus, PrefetchHandle, Prefetcher, RelationDescriptor};
pub use crate::schema::{RelationId, Schema, SchemaBuilder, TypeId};
