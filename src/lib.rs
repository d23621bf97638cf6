//! Kapellmeister agent: keeps the Docker containers on one host in line with
//! the desired state published by a management server.
//!
//! Each pass fetches the desired containers, snapshots what is running,
//! compares environments and image digests, and recreates, starts or removes
//! containers until the host matches. Decisions are made by the pure
//! [`reconcile::reconcile`]; side effects go through the
//! [`runtime::ContainerRuntime`] seam.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod management;
pub mod models;
pub mod reconcile;
pub mod registry;
pub mod runtime;
pub mod testing;

pub use agent::{Agent, PassOutcome, PassReport};
pub use config::Config;
pub use error::{ActionError, ConfigError, FetchError, PassError, RuntimeError};
