//! Micro - CRD-driven Kubernetes operator for replicated micro workloads
//!
//! The operator watches Micro custom resources and converges a managed
//! Deployment of workload instances toward the declared replica count,
//! republishing the observed pod names into the resource status.
//!
//! # Architecture
//!
//! - The reconciliation engine is invoked once per queued Micro and is
//!   idempotent: it re-fetches fresh cluster state on every invocation.
//! - A process-local deployment tracker remembers the last observed
//!   Deployment per workload identity so a Deployment deleted out-of-band
//!   can be recreated.
//! - Cascade deletion relies solely on owner references: the engine sets
//!   the Micro as controller of its Deployment and never deletes directly.
//!
//! # Modules
//!
//! - [`crd`] - The Micro Custom Resource Definition
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`tracker`] - Tracking store for last-observed Deployments
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod tracker;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key used to select the pods backing a Micro deployment
pub const POD_NAME_LABEL: &str = "name";

/// Field manager name used for server-side apply patches
pub const FIELD_MANAGER: &str = "micro-controller";
