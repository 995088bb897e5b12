//! camfleet - lifecycle orchestrator for camera, recorder and agent workloads
//!
//! camfleet keeps a database's view of which workloads should exist in step
//! with what is actually running on a Kubernetes cluster. Each workload row
//! is rendered into Deployments, Services, Jobs or CronJobs, applied
//! idempotently, watched for status drift, and torn down through a staged
//! deletion that respects exclusive access to physical camera devices.
//!
//! # Modules
//!
//! - [`spec`] - Workload row → cluster objects (names, labels, placement, protocols)
//! - [`workload`] - Typed Deployment / Service / Job / CronJob manifests
//! - [`apply`] - Idempotent create-or-replace and best-effort delete
//! - [`status`] - Runtime status derived from pods, synced back on read
//! - [`device_lock`] - Exclusive leases on `(node, device_path)`
//! - [`deletion`] - Background multi-stage deletion
//! - [`sweeper`] - Orphan cleanup and drift repair
//! - [`orchestrator`] - The shared context the REST layer calls
//! - [`cluster`] - Cluster client trait, kube-rs and in-memory implementations
//! - [`store`] - Workload row persistence trait and in-memory store
//! - [`config`] - CLI / environment configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod apply;
pub mod cluster;
pub mod config;
pub mod deletion;
pub mod device_lock;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod spec;
pub mod status;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod workload;

pub use error::Error;
pub use orchestrator::{CreateRequest, Orchestrator};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
