//! symmetric-sync
//!
//! Multi-node database replication over PostgreSQL. Triggers capture row
//! changes into `sym_data`; each node routes them into per-target batches,
//! ships them as CSV-protocol payloads and applies what others send it.
//!
//! # Crates
//!
//! - `sync_core` - model, store traits, row codec, topology files
//! - `symmetric_sync_protocol` - batch payload reader and writer
//! - `staging` - staged payloads on disk or in memory
//! - `symmetric_sync_engine` - routing, extraction, loading, acks and cluster locks
//! - `symmetric_sync_postgresql` - PostgreSQL store, target writer and lookups
//!
//! # CLI Usage
//!
//! ```bash
//! # Create the runtime tables and seed the topology
//! symmetric-sync init --topology topology.yaml --node-id corp-000 --database-url postgresql://...
//!
//! # Run every job on its interval until Ctrl-C
//! symmetric-sync run --node-id corp-000 --database-url postgresql://... --transport-dir /shared/sync
//! ```

pub mod config;
pub mod jobs;
pub mod node;

pub use config::{AppConfig, JobSchedule};
pub use jobs::JobRunner;
pub use node::{engine_builder, find_identity, load_transforms, NodeOpts, NodeRuntime};
