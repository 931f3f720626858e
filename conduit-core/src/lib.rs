//! Conduit Core
//!
//! Core types and abstractions for the Conduit pipeline orchestrator.
//!
//! This crate contains:
//! - Domain types: Core business entities (Execution, Stage, Provider, Template)
//! - DTOs: Data transfer objects exchanged with callers and provider adapters

pub mod domain;
pub mod dto;
