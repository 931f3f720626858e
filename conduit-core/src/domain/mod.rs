//! Core domain types
//!
//! This module contains the core domain structures used across Conduit.
//! These types represent the fundamental business entities and are shared
//! between the orchestrator (which persists and dispatches them) and the
//! provider adapters (which report progress on them).

pub mod execution;
pub mod provider;
pub mod stage;
pub mod template;
