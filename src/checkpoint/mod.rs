//! Persisted progress markers and the gated processing built on them.
//!
//! - [`CheckpointStore`]: get/set of JSON values under `<prefix>:<key>`
//! - [`RedisCheckpointStore`] / [`MemoryCheckpointStore`]: store adapters
//! - [`CheckpointBuilder`] / [`CheckpointPipeline`]: predicate-gated job
//!   handling that only reprocesses data the stored checkpoint says is
//!   still relevant

pub mod pipeline;
pub mod redis;
pub mod store;

pub use self::redis::{RedisCheckpointOptions, RedisCheckpointStore};
pub use pipeline::{
    checkpoint_handler, CheckpointBuilder, CheckpointConfig, CheckpointHandler,
    CheckpointOutcome, CheckpointPipeline, Decision, KeyFactory, Predicate,
};
pub use store::{namespaced_key, CheckpointStore, MemoryCheckpointStore, DEFAULT_CHECKPOINT_PREFIX};
