//! Replication engine for symmetric-sync.
//!
//! The services follow a batch through its life on both nodes:
//!
//! ```text
//! source node                                   target node
//! ───────────                                   ───────────
//! RouterService      change rows → batches
//! DataExtractorService  batches → payload ──▶  DataLoaderService  payload → database
//! AcknowledgeService    acks → batch status ◀── acks
//! ```
//!
//! [`SyncEngine`] wires them to one [`Store`](sync_core::Store) and runs each
//! job under its cluster lock.

pub mod ack;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod data;
pub mod engine;
pub mod extract;
pub mod load;
pub mod outgoing;
pub mod params;
pub mod route;
pub mod transform;
pub mod transport;
pub mod writer;

pub use ack::{decode_acks, encode_acks, AcknowledgeService};
pub use cluster::ClusterService;
pub use config::ConfigurationService;
pub use data::DataService;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use extract::{DataExtractorService, ExtractOutcome, ExtractedPayload, InitialLoadSource};
pub use load::DataLoaderService;
pub use outgoing::OutgoingBatchService;
pub use params::EngineParameters;
pub use route::{RouterLookup, RouterService, ScriptInput, ScriptedRouter, StaticRouterLookup};
pub use transform::{TransformPoint, TransformRule, TransformSet};
pub use transport::{
    DirectoryTransport, LoopbackNetwork, LoopbackTransport, SimulatedFault, SyncEndpoint,
    Transport, TransportResponse,
};
pub use writer::{
    ConflictSettings, DatabaseWriter, ExistingInsertPolicy, MemoryDatabase, MissingDeletePolicy,
    MissingUpdatePolicy, SyncTriggerControl, TargetDatabase, TargetTransaction, WriterStatistics,
};
