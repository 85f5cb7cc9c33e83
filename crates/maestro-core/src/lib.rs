//! Core error definitions for the Maestro orchestrator.
//!
//! Every Maestro crate reports failures through the types in this crate so
//! that the transport layer sitting on top of the engines only has to map a
//! single enum.
//!
//! # Main types
//!
//! - [`MaestroError`]: Unified error enum for the task and workflow engines.
//! - [`MaestroResult`]: Convenience alias for `Result<T, MaestroError>`.
//! - [`ValidationError`]: Structural problems found in a workflow graph.

/// Error taxonomy.
pub mod error;

pub use error::{MaestroError, MaestroResult, ValidationError};
