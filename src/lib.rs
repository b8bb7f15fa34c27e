//! # Trigger Replication
//!
//! Routing and apply engine for trigger-based change capture.
//!
//! ## Architecture
//!
//! Database triggers write every captured row into a `data` staging table
//! under a monotonically increasing id. This crate turns those rows into
//! per-node outgoing batches and applies incoming batches on the target side:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────────┐
//! │                          trigger-replication                               │
//! │                                                                            │
//! │  ┌────────────┐   ┌────────────────┐   ┌──────────┐   ┌─────────────────┐  │
//! │  │ GapTracker │──►│ GapAwareReader │──►│  Router  │──►│ outgoing_batch  │  │
//! │  │ (data_gap) │   │ (gap filtered) │   │ (+ meta) │   │ + data_event    │  │
//! │  └────────────┘   └────────────────┘   └──────────┘   └─────────────────┘  │
//! │        ▲                                     │                             │
//! │        └──────── reconcile(observed ids) ◄───┘                             │
//! │                                                                            │
//! │  incoming batch ──► ConflictAwareWriter ──► TargetPlatform (SQLite)        │
//! │                     (detect → resolve → fallback)                          │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Gaps
//!
//! Ids are allocated before the capturing transaction commits, so a reader
//! can see id 12 before id 11 exists. The gap table records ranges not yet
//! routed; each pass reads only inside those ranges and folds what it routed
//! back in. A gap that stays empty long enough is skipped.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use trigger_replication::{EngineConfig, RoutingEngine};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::default();
//!     let (_tx, rx) = watch::channel(config.clone());
//!
//!     let mut engine = RoutingEngine::open(config, rx).await.expect("Failed to open store");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gap;
pub mod metrics;
pub mod model;
pub mod payload;
pub mod reader;
pub mod resilience;
pub mod router;
pub mod store;
pub mod topology;
pub mod writer;

// Re-exports for convenience
pub use config::{ChannelConfig, EngineConfig, EngineSettings, RouterConfig, RouterType};
pub use coordinator::{EngineState, HealthCheck, PassReport, RoutingEngine};
pub use error::{ReplicationError, Result};
pub use gap::{GapTracker, ReconcileReport};
pub use model::{ChangeRow, DataId, EventType, Gap, GapStatus, OutgoingBatch, SchemaSnapshot};
pub use reader::GapAwareReader;
pub use router::{MetadataRouter, Router, RouterContext};
pub use store::{ChangeStore, InMemoryStore, SqliteStore};
pub use writer::{ConflictAwareWriter, SqlitePlatform, TargetPlatform, WriterStats};
