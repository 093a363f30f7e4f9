//! Switchyard - task execution backend for a multi-tenant messaging/flow
//! platform.
//!
//! Switchyard consumes work arriving for many organizations over shared
//! infrastructure (Postgres and a Redis keyspace used as a queue) and
//! executes it: primarily flow sessions, the scripted state machines that
//! drive conversations with contacts.
//!
//! # Core Concepts
//!
//! - **Task**: a tagged unit of asynchronous work ([`task::Task`]). Tasks
//!   live on fair, priority-aware multi-owner queues so no single org can
//!   monopolize throughput.
//!
//! - **Foreman**: the supervisor of a worker pool draining one queue
//!   ([`runtime::Foreman`]), dispatching tasks by type through an explicit
//!   [`runtime::HandlerRegistry`].
//!
//! - **Contact event loop**: per-contact serial processing. Events for a
//!   contact queue on that contact's own list; a lease lock guarantees one
//!   worker drains it at a time, across the whole fleet.
//!
//! - **Flow starts**: declarative "start this flow for this population"
//!   orders, fanned out into batches of at most 100 contacts so huge starts
//!   can't starve other orgs.
//!
//! - **Engine bridge**: the flow engine itself is opaque. It consumes a
//!   session plus a trigger or resume and returns a sprint of events
//!   ([`engine::FlowEngine`]); everything it wants persisted flows through
//!   the commit hooks in [`hooks`].
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Architecture
//!
//! The composition root (the `switchyard` binary, or a test harness) builds
//! a [`runtime::Runtime`] carrying every shared resource, registers the
//! handlers from [`tasks::default_registry`], and starts one foreman per
//! queue. There is no init-time side-effect registration; all wiring is
//! explicit.

/// Short-TTL per-org cache of configuration assets (channels, flows,
/// groups, fields, triggers, locations) feeding the engine and handlers.
pub mod assets;

/// Process-level configuration, read once at init.
pub mod config;

/// Bridge to the opaque flow engine: triggers, resumes, sprints and sprint
/// events.
pub mod engine;

/// The task error taxonomy switched on at the worker boundary.
pub mod error;

/// Scene-scoped pre-/post-commit hooks applied to sprint events.
pub mod hooks;

/// Distributed lease lock over the shared KV store.
pub mod lock;

/// Persistence models: orgs, contacts, channels, flows, triggers, messages,
/// sessions, runs and starts.
pub mod models;

/// Fair, priority-aware task queue and per-contact event spool traits.
pub mod queue;

/// Start/resume orchestration between the engine, the database and the
/// hooks.
pub mod runner;

/// Runtime wiring, handler registry and the foreman worker pools.
pub mod runtime;

/// Contact-query searcher interface (the search index is external).
pub mod search;

/// Shared KV store backends.
pub mod store;

/// Task envelope and type tags.
pub mod task;

/// Task handlers by dispatch path.
pub mod tasks;

/// Tracing spans and timing helpers.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics instrumentation.
pub mod metrics;

pub use config::Config;
pub use error::{TaskError, TaskResult};
pub use queue::{ContactSpool, CourierSpool, QueueName, TaskQueue};
pub use runtime::{Foreman, HandlerRegistry, Runtime, RuntimeBuilder, ShutdownToken};
pub use task::{Task, TaskPriority, TaskType};
