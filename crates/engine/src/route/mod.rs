//! Routing: turning captured change rows into outgoing batches.
//!
//! # Overview
//!
//! A routing pass walks every enabled channel of the local node:
//!
//! 1. [`DataGapDetector`] lists the id ranges that may hold unrouted rows
//! 2. [`DataGapRouteReader`] streams those rows on a background task, keeping
//!    source transactions together
//! 3. a [`DataRouter`] picks the target nodes of each row
//! 4. rows are appended to per-node batches that close according to the
//!    channel's [`BatchAlgorithm`], and are committed together with their
//!    data events
//!
//! [`RouterService`] drives the pass under the cluster `ROUTE` lock.

pub mod batch_algorithm;
pub mod column_match;
pub mod context;
pub mod data_router;
pub mod gap;
pub mod reader;
pub mod service;

pub use batch_algorithm::BatchAlgorithm;
pub use column_match::{ColumnMatchExpression, ColumnValues};
pub use context::{ChannelRouterContext, ConfigChanges, RoutingStats};
pub use data_router::{
    DataMetaData, DataRouter, LookupTableSettings, RouterLookup, ScriptInput, ScriptedRouter,
    StaticRouterLookup,
};
pub use gap::DataGapDetector;
pub use reader::{DataGapRouteReader, ReadSummary, ReaderSettings};
pub use service::RouterService;
