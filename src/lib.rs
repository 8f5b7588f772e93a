//! Lanewatch - CI Lane Poller with Persistent Result Cache
//!
//! Polls the build lanes of a Jenkins-style CI server, interprets per-build
//! metadata and test failure reports, and keeps finished payloads in a
//! budgeted, LZ4-compressed key/value cache so steady-state polling touches
//! the network only for builds still in flight.
//!
//! # Architecture
//!
//! ```text
//! Lane table ──▶ Lane::load ──▶ FetchOrchestrator ──▶ CacheContext
//!                    │               │    cache-first     │
//!                    ▼               ▼                    ▼
//!              BuildRecord      Transport          SizeAccountedStore
//!              (interpret)      (HTTP / mock)      + EvictionQueue
//! ```
//!
//! Finished builds never change, so their payloads are cached permanently
//! under a byte budget; when the budget runs out, whole builds are evicted
//! oldest-first, and never in favor of data older than what is already held.
//!
//! # Modules
//!
//! - [`build`] - Build records and the failure-report interpreter
//! - [`cache`] - Size-accounted store, compression, eviction, deletion index
//! - [`config`] - Poller configuration
//! - [`error`] - Error types
//! - [`fetch`] - Cache-first fetch orchestration over a transport seam
//! - [`jenkins`] - Server URL builders and payload schemas
//! - [`lane`] - Lane polling state machine and the built-in lane tables
//! - [`signal`] - Change notification for consumers of poller state

pub mod build;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod jenkins;
pub mod lane;
pub mod signal;

// Re-export commonly used types
pub use build::{BuildRecord, Failure, FailureKind, StandardBuild, Status};
pub use cache::{CacheContext, FileBackend, KvBackend, MemoryBackend};
pub use config::{LaneVisibility, PollerConfig};
pub use error::{Error, Result};
pub use fetch::{FetchOrchestrator, HttpTransport, MockTransport, Transport};
pub use lane::{make_lanes, Lane};
pub use signal::ChangeSignal;
