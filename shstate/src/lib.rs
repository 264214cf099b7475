//! Transparent cross-process synchronization of a typed record (`shstate`)
//! over a memory-mapped file.
//!
//! # Overview
//! Each participating process holds its own copy of a user-defined record
//! and constructs a [`StateSync`](crate::sync::StateSync) engine over it. The
//! engines meet at a fixed-size region file derived from the record's type
//! identity; mutations made in any process become visible to the others
//! within one auto-publish interval plus one detection interval, and
//! subscribers receive change notifications.
//!
//! Key components:
//! - [`SyncConfig`](crate::core::SyncConfig): region size, path overrides
//!   and worker intervals. Use
//!   [`SyncConfig::builder()`](crate::core::SyncConfig::builder) to
//!   construct.
//! - [`StateSync`](crate::sync::StateSync): the per-process engine;
//!   explicit [`publish`](crate::sync::StateSync::publish),
//!   digest-suppressed auto-publish,
//!   [`on_change`](crate::sync::StateSync::on_change) subscriptions,
//!   idempotent [`close`](crate::sync::StateSync::close).
//! - [`Region`](crate::core::Region): the mapped file, its version header
//!   and the companion advisory-lock file.
//! - [`ShstateError`](crate::errors::ShstateError): error type for the
//!   crate.
//!
//! # Concurrency Model and Safety
//!
//! - **Publishes are serialized across processes** by an OS advisory lock
//!   on a companion `.lock` file, held for the duration of every publish.
//!   Payload bytes are written before the version counter, and the counter
//!   is stored with release ordering.
//! - **Reads take no lock.** The poller acquire-loads the version counter
//!   and only then copies the payload out, so a new version implies the
//!   matching payload bytes. A payload torn by a concurrent publish fails
//!   to decode and is retried on the next version bump; the caller's
//!   record is never overwritten with garbage.
//! - **Within a process**, the record mutex is held only while a snapshot
//!   is encoded or a decoded one is applied, never across the file lock,
//!   the mapping write, or callback execution. Callbacks are dispatched
//!   off the detection worker, each invocation on its own thread with its
//!   own clone of the snapshot, so a slow callback blocks neither
//!   detection nor the other callbacks; a panicking callback is caught
//!   and logged.
//! - **Self-publish filtering:** publishing advances the engine's local
//!   version, so its own subscriber treats the new version as already seen
//!   and never feeds it back.
//!
//! **User responsibilities:** peers that want to share state must name the
//! same record type (the type identifier is the coordination key), and the
//! engine must be closed or dropped before the record is discarded. The
//! caller may mutate the record freely; a publish in flight captures
//! whatever snapshot the record mutex hands it, and that snapshot is what
//! every peer consistently observes.

pub mod codec;
pub mod core;
pub mod errors;
mod publisher;
mod subscriber;
pub mod sync;

pub use crate::core::{SyncConfig, SyncConfigBuilder, DEFAULT_REGION_SIZE};
pub use crate::errors::ShstateError;
pub use crate::sync::{EngineState, StateSync};

#[cfg(test)]
mod tests;
