//! Infrastructure layer: persistence, artifact production, idempotency,
//! application services, worker engine, configuration.

/// Configuration loading and representation.
pub mod config;

/// Idempotency broker resolving submissions to canonical reports.
pub mod idempotency;

/// Embedded schema migrations.
pub mod migrations;

/// Artifact producer (pure content synthesis).
pub mod producer;

/// Report application service (create/read/list/artifact).
pub mod service;

/// Report store trait and its PostgreSQL / in-memory implementations.
pub mod store;

/// Worker engine: claim, execute, converge, recover.
pub mod worker;
