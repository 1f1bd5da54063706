//! Partitioning of a replica set by resource liveness, class and up-to-date status.

use crate::record::ReplicaRecord;
use crate::resource::{ResourceClass, ResourceStatus};

/// Replica set split into candidate buckets.
///
/// Each bucket is ordered by preference: an exact match of the requested hierarchy first, then
/// replicas on local resources, then input order. Archive buckets list bundle copies after true
/// archive copies. Stale copies on down resources are not kept; only their replica numbers are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSetPartition {
    pub current_cache: Vec<ReplicaRecord>,
    pub current_archive: Vec<ReplicaRecord>,
    pub stale_cache: Vec<ReplicaRecord>,
    pub stale_archive: Vec<ReplicaRecord>,
    pub down_current: Vec<ReplicaRecord>,
    pub discarded_down_old: Vec<i32>,
}

impl ReplicaSetPartition {
    /// Number of records kept in the five candidate buckets.
    pub fn len(&self) -> usize {
        self.current_cache.len()
            + self.current_archive.len()
            + self.stale_cache.len()
            + self.stale_archive.len()
            + self.down_current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up-to-date copies on live resources, cache before archive.
    pub fn live_current(&self) -> impl Iterator<Item = &ReplicaRecord> {
        self.current_cache.iter().chain(&self.current_archive)
    }

    /// Stale copies on live resources, cache before archive.
    pub fn live_stale(&self) -> impl Iterator<Item = &ReplicaRecord> {
        self.stale_cache.iter().chain(&self.stale_archive)
    }
}

#[derive(Default)]
struct Bucket {
    entries: Vec<(u8, ReplicaRecord)>,
}

impl Bucket {
    const EXACT: u8 = 0;
    const LOCAL: u8 = 1;
    const OTHER: u8 = 2;

    fn push(&mut self, rank: u8, record: ReplicaRecord) {
        self.entries.push((rank, record));
    }

    fn into_sorted(mut self) -> Vec<ReplicaRecord> {
        // stable, so input order survives within a rank
        self.entries.sort_by_key(|(rank, _)| *rank);
        self.entries.into_iter().map(|(_, record)| record).collect()
    }
}

/// Sort `records` into a [`ReplicaSetPartition`].
///
/// A record on a down resource goes to `down_current` (or is discarded when stale) regardless of
/// anything else. A record whose hierarchy equals `target_hierarchy` goes to the front of
/// `current_cache` even when stale. Everything else is filed by the leaf resource's class crossed
/// with its up-to-date status, where plain resources count as cache.
pub fn classify<R: ResourceStatus + ?Sized>(
    records: Vec<ReplicaRecord>,
    target_hierarchy: Option<&str>,
    resources: &R,
) -> ReplicaSetPartition {
    let mut current_cache = Bucket::default();
    let mut current_archive = Bucket::default();
    let mut current_bundle = Bucket::default();
    let mut stale_cache = Bucket::default();
    let mut stale_archive = Bucket::default();
    let mut stale_bundle = Bucket::default();
    let mut down_current = Vec::new();
    let mut discarded_down_old = Vec::new();
    for record in records {
        let leaf = record.resc_hier.leaf();
        if !resources.is_up(leaf) {
            if record.is_current() {
                down_current.push(record);
            } else {
                tracing::debug!(
                    "discarding stale replica {} of {} on down resource {}",
                    record.repl_num,
                    record.obj_path,
                    record.resc_hier
                );
                discarded_down_old.push(record.repl_num);
            }
            continue;
        }
        if target_hierarchy.is_some_and(|hier| hier == record.resc_hier.as_str()) {
            current_cache.push(Bucket::EXACT, record);
            continue;
        }
        let rank = if resources.is_local(leaf) {
            Bucket::LOCAL
        } else {
            Bucket::OTHER
        };
        let bucket = match (resources.class_of(leaf), record.is_current()) {
            (ResourceClass::Archive, true) => &mut current_archive,
            (ResourceClass::Archive, false) => &mut stale_archive,
            (ResourceClass::Bundle, true) => &mut current_bundle,
            (ResourceClass::Bundle, false) => &mut stale_bundle,
            (ResourceClass::Cache | ResourceClass::Plain, true) => &mut current_cache,
            (ResourceClass::Cache | ResourceClass::Plain, false) => &mut stale_cache,
        };
        bucket.push(rank, record);
    }
    let mut partition = ReplicaSetPartition {
        current_cache: current_cache.into_sorted(),
        current_archive: current_archive.into_sorted(),
        stale_cache: stale_cache.into_sorted(),
        stale_archive: stale_archive.into_sorted(),
        down_current,
        discarded_down_old,
    };
    partition
        .current_archive
        .extend(current_bundle.into_sorted());
    partition.stale_archive.extend(stale_bundle.into_sorted());
    partition
}
