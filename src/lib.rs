//! # relq
//!
//! Durable multi-producer/multi-consumer work queue over a shared
//! transactional datastore.
//!
//! Producers [`enqueue`](engine::Engine::enqueue) items; consumers
//! [`acquire`](engine::Engine::acquire) the oldest eligible one, then either
//! [`dequeue`](engine::Engine::dequeue) it on success or
//! [`release`](engine::Engine::release) it back to the queue. An item is held
//! by at most one acquirer at a time, and an administrative sweep reclaims
//! items whose acquirer never returned. State lives in PostgreSQL
//! ([`db::Db`]) or in process memory ([`store::MemoryStore`]).

pub mod audit;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;

pub use engine::Engine;
pub use error::{Error, Result};
