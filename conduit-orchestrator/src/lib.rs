//! Conduit Orchestrator
//!
//! Accepts pipeline execution requests, picks a capable and healthy CI/CD
//! provider for each, dispatches under priority and concurrency limits, and
//! tracks every execution through its stages to a terminal state.
//!
//! This crate contains:
//! - Orchestrator: the caller-facing facade wiring every component together
//! - Queue, scheduler and tracker: the dispatch and tracking pipeline
//! - Provider: the adapter contract, registry and health monitor
//! - Store: execution persistence (in-memory and Postgres)

pub mod config;
pub mod db;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod scheduler;
pub mod statistics;
pub mod store;
pub mod template;
pub mod tracker;

pub use config::Config;
pub use error::{OrchestratorError, ProviderError, StoreError};
pub use orchestrator::{Orchestrator, Recovery};
