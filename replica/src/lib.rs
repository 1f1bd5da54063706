//! Replica classification and selection.
//!
//! A logical object may have several physical replicas spread over a tree of storage resources.
//! [`classify()`] sorts a replica list into buckets by resource liveness, resource class and
//! up-to-date status. The selectors in [`select`] build on that to answer which replica to open,
//! which replica to copy from and to for a replicate or move, and which replicas a trim may delete.
//!
//! Resource state and replica records come from collaborators described by the
//! [`ResourceStatus`] and [`Catalog`] traits.

pub mod classify;
pub mod error;
pub mod record;
pub mod resource;
pub mod select;

#[cfg(test)]
mod testutils;

pub use classify::{ReplicaSetPartition, classify};
pub use error::{Error, Result};
pub use record::{Hierarchy, ReplicaCondition, ReplicaRecord};
pub use resource::{Catalog, ResourceClass, ResourceInfo, ResourceMap, ResourceStatus};
pub use select::{
    DEF_MIN_COPY_CNT, Destination, ReplicaSelector, TransferPlan, TransferTarget, TrimPlan,
    select_for_open, select_for_transfer, select_for_trim,
};
