//! Staging area for symmetric-sync batch payloads.
//!
//! Extracted batches are staged before they are handed to a transport, so a
//! failed send can be retried from the same bytes without querying the
//! change log again. Received batches are staged before they are applied, so
//! a crash mid-apply still has the full payload available.
//!
//! ## Storage Backends
//!
//! - `FilesystemStagingArea` - one file per batch under a root directory
//! - `MemoryStagingArea` - in-process map, for tests and single-process setups
//!
//! A resource moves through [`ResourceState`]: it is `Create` while being
//! written, `Ready` once complete, and `Done` after the batch was
//! acknowledged. `Done` resources are removed by [`StagingArea::purge_done`].

mod filesystem;
mod memory;
mod resource;
pub mod store;

#[cfg(test)]
mod tests;

pub use filesystem::FilesystemStagingArea;
pub use memory::MemoryStagingArea;
pub use resource::{ResourceState, StagedResource, StagedResourceId, StagingCategory};
pub use store::StagingArea;
