//! bookdl core library
//!
//! Locates books across several mirror and partner sources and retrieves them
//! reliably from origins that rate-limit, time out, gate downloads behind
//! countdown pages, or serve HTML interstitials instead of files.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`cancel`] - per-job cancellation tokens with cancellable sleeps
//! - [`catalog`] - book records, catalog trait, source preference ordering
//! - [`queue`] - in-memory job registry and status state machine
//! - [`transfer`] - resilient streaming fetch with retry and verification
//! - [`resolver`] - turning candidate links into fetchable URLs
//! - [`failover`] - trying candidates in order and persisting the artifact
//! - [`worker`] - the per-job runner the coordinator executes
//! - [`coordinator`] - bounded-concurrency supervisor and worker pool
//! - [`service`] - the caller-facing API
//! - [`config`] - TOML settings
//! - [`redact`] - masking secrets in logged links
//! - [`user_agent`] - User-Agent strings for transfers and page fetches

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod failover;
pub mod queue;
pub mod redact;
pub mod resolver;
pub mod service;
pub mod transfer;
pub mod user_agent;
pub mod worker;

// Re-export commonly used types
pub use cancel::{CancellationToken, Cancelled};
pub use catalog::{BookRecord, Catalog, CatalogError, SearchFilters, SourceKind, SourcePreference, StaticCatalog};
pub use config::{ConfigError, Settings};
pub use coordinator::{CoordinatorError, CoordinatorHandle, CoordinatorStats, WorkerCoordinator, WorkerPool};
pub use failover::{ArtifactStore, FailedAttempt, FailoverProtocol, FailoverReport};
pub use queue::{Job, JobOutcome, JobQueue, JobStatus, QueueError};
pub use resolver::{ResolveError, ResolveStep, Resolver, ResolverRegistry};
pub use service::{DownloadService, ServiceError};
pub use transfer::{HttpClient, RetryPolicy, TransferEngine, TransferError};
pub use worker::{DownloadWorker, JobRunner};
