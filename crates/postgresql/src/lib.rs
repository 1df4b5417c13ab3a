//! PostgreSQL backend for symmetric-sync.
//!
//! - [`PgStore`] keeps the runtime tables (`sym_*`) and implements every
//!   persistence trait the engine uses.
//! - [`PgDatabase`] applies loaded batches to the target tables, turning
//!   capture off for the loading session.
//! - [`PgInitialLoadSource`] and [`PgRouterLookup`] run the source-side
//!   queries behind reloads and sub-select or lookup-table routers.

pub mod client;
pub mod lookup;
pub mod schema;
pub mod store;
pub mod writer;

pub use client::{new_postgresql_client, sql_error};
pub use lookup::{PgInitialLoadSource, PgRouterLookup};
pub use schema::{create_runtime_tables, drop_runtime_tables};
pub use store::PgStore;
pub use writer::{PgDatabase, PgTransaction};
