//! Replica selection for open, replicate/move and trim.
//!
//! All selectors are pure functions over a replica list owned by the caller. None of them retries:
//! an error names the reason and the caller decides whether to try a different resource.

use crate::classify::{ReplicaSetPartition, classify};
use crate::error::{Error, Result};
use crate::record::{Hierarchy, ReplicaCondition, ReplicaRecord};
use crate::resource::{Catalog, ResourceStatus};

/// Number of current copies a trim keeps unless the caller asks for a positive minimum.
pub const DEF_MIN_COPY_CNT: usize = 2;

fn obj_path_of(records: &[ReplicaRecord]) -> Option<String> {
    records.first().map(|record| record.obj_path.clone())
}

/// First usable copy of a partition: live current copies, then current copies on down resources,
/// then stale copies when no current copy exists at all.
fn first_usable(partition: ReplicaSetPartition, obj_path: &str) -> Result<ReplicaRecord> {
    let ReplicaSetPartition {
        current_cache,
        current_archive,
        stale_cache,
        stale_archive,
        down_current,
        discarded_down_old,
    } = partition;
    if let Some(record) = current_cache
        .into_iter()
        .chain(current_archive)
        .chain(down_current)
        .next()
    {
        return Ok(record);
    }
    if let Some(record) = stale_cache.into_iter().chain(stale_archive).next() {
        tracing::debug!(
            "no current copy of {obj_path}, using stale replica {}",
            record.repl_num
        );
        return Ok(record);
    }
    if discarded_down_old.is_empty() {
        Err(Error::NoReplicas)
    } else {
        Err(Error::AllResourcesDown {
            obj_path: obj_path.to_string(),
        })
    }
}

/// Pick the replica to open.
///
/// With a hierarchy, only the replica stored there qualifies; when none is stored there a write
/// fails with [`Error::HierarchyMismatch`] while a read settles for the best other copy. Without a
/// hierarchy the best copy is chosen in `current-cache`, `current-archive`, `down-current` order.
pub fn select_for_open<R: ResourceStatus + ?Sized>(
    mut records: Vec<ReplicaRecord>,
    hierarchy: Option<&str>,
    write_intent: bool,
    resources: &R,
) -> Result<ReplicaRecord> {
    let Some(obj_path) = obj_path_of(&records) else {
        return Err(Error::NoReplicas);
    };
    if let Some(hierarchy) = hierarchy {
        if let Some(pos) = records
            .iter()
            .position(|record| record.resc_hier.as_str() == hierarchy)
        {
            let record = records.swap_remove(pos);
            if !resources.is_up(record.resc_hier.leaf()) {
                return Err(Error::AllResourcesDown { obj_path });
            }
            return Ok(record);
        }
        if write_intent {
            return Err(Error::HierarchyMismatch {
                obj_path,
                hierarchy: hierarchy.to_string(),
            });
        }
        tracing::debug!("no replica of {obj_path} on {hierarchy}, any good copy serves a read");
    }
    first_usable(classify(records, None, resources), &obj_path)
}

/// Where a replicate or move should put its copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Hierarchy(Hierarchy),
    /// Leaf resource name, resolved through [`ResourceStatus::hierarchy_of`]
    Resource(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// Stale copy at the destination that gets overwritten
    Overwrite(ReplicaRecord),
    /// No copy exists at the destination yet
    Create { hierarchy: Hierarchy },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub source: ReplicaRecord,
    pub target: TransferTarget,
}

impl TransferPlan {
    pub fn destination(&self) -> &Hierarchy {
        match &self.target {
            TransferTarget::Overwrite(record) => &record.resc_hier,
            TransferTarget::Create { hierarchy } => hierarchy,
        }
    }
}

/// Pick source and target for a replicate or move.
///
/// A destination already holding a current copy short-circuits with [`Error::AlreadyReplicated`],
/// even when it is down. Otherwise the destination must be live. Replicas matching `source_hint` form the source pool (all other
/// replicas when the hint is empty). The best current copy in the pool is the source; stale copies
/// are only used when the pool has no current copy at all.
pub fn select_for_transfer<R: ResourceStatus + ?Sized>(
    records: Vec<ReplicaRecord>,
    source_hint: &ReplicaCondition,
    destination: &Destination,
    resources: &R,
) -> Result<TransferPlan> {
    let Some(obj_path) = obj_path_of(&records) else {
        return Err(Error::NoReplicas);
    };
    let dest_hierarchy = match destination {
        Destination::Hierarchy(hierarchy) => hierarchy.clone(),
        Destination::Resource(name) => {
            resources
                .hierarchy_of(name)
                .ok_or_else(|| Error::UnknownResource { name: name.clone() })?
        }
    };
    let (at_destination, others): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|record| record.resc_hier == dest_hierarchy);
    if let Some(current) = at_destination.iter().find(|record| record.is_current()) {
        return Err(Error::AlreadyReplicated {
            obj_path,
            repl_num: current.repl_num,
            hierarchy: dest_hierarchy.to_string(),
        });
    }
    if !resources.is_up(dest_hierarchy.leaf()) {
        tracing::error!("destination {dest_hierarchy} for {obj_path} is down");
        return Err(Error::AllResourcesDown { obj_path });
    }
    let target = match at_destination.into_iter().next() {
        Some(stale) => TransferTarget::Overwrite(stale),
        None => TransferTarget::Create {
            hierarchy: dest_hierarchy,
        },
    };
    let pool = if source_hint.is_empty() {
        others
    } else {
        let matched: Vec<_> = others
            .into_iter()
            .filter(|record| source_hint.matches(record))
            .collect();
        if matched.is_empty() {
            return Err(Error::NoMatchingReplica {
                obj_path,
                condition: source_hint.to_string(),
            });
        }
        matched
    };
    let partition = classify(pool, None, resources);
    if partition.live_current().next().is_none() && !partition.down_current.is_empty() {
        // the only up-to-date data is unreachable, a stale source would spread old content
        return Err(Error::AllResourcesDown { obj_path });
    }
    let source = first_usable(partition, &obj_path)?;
    Ok(TransferPlan { source, target })
}

/// Replicas chosen for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimPlan {
    pub obj_path: String,
    /// Stale copies first, then current copies with cache ahead of archive
    pub to_trim: Vec<ReplicaRecord>,
    pub min_copies: usize,
    /// Current copies on live resources before the trim
    pub current_copies: usize,
}

impl TrimPlan {
    pub fn is_noop(&self) -> bool {
        self.to_trim.is_empty()
    }

    /// For callers that asked for a deletion and treat a no-op as a failure.
    pub fn require_progress(self) -> Result<Self> {
        if self.is_noop() {
            return Err(Error::MinimumCopyViolation {
                obj_path: self.obj_path,
                min_copies: self.min_copies,
                current: self.current_copies,
            });
        }
        Ok(self)
    }
}

/// Pick replicas that can be deleted without dropping below `min_copies` current copies.
///
/// A non-positive `min_copies` means [`DEF_MIN_COPY_CNT`]. An empty condition matches every
/// replica, a condition that matches nothing trims nothing. Replicas on down resources are never
/// trimmed and never counted as retained.
pub fn select_for_trim<R: ResourceStatus + ?Sized>(
    records: Vec<ReplicaRecord>,
    condition: &ReplicaCondition,
    min_copies: i32,
    resources: &R,
) -> TrimPlan {
    let obj_path = obj_path_of(&records).unwrap_or_default();
    let min_copies = usize::try_from(min_copies)
        .ok()
        .filter(|&min| min > 0)
        .unwrap_or(DEF_MIN_COPY_CNT);
    let ReplicaSetPartition {
        current_cache,
        current_archive,
        stale_cache,
        stale_archive,
        ..
    } = classify(records, None, resources);
    let is_match = |record: &ReplicaRecord| condition.is_empty() || condition.matches(record);
    let (matched_cur, unmatched_cur): (Vec<_>, Vec<_>) = current_cache
        .into_iter()
        .chain(current_archive)
        .partition(is_match);
    let (matched_old, unmatched_old): (Vec<_>, Vec<_>) = stale_cache
        .into_iter()
        .chain(stale_archive)
        .partition(is_match);
    let current_copies = matched_cur.len() + unmatched_cur.len();
    let mut plan = TrimPlan {
        obj_path,
        to_trim: Vec::new(),
        min_copies,
        current_copies,
    };
    if matched_cur.is_empty() && matched_old.is_empty() {
        tracing::debug!(
            "nothing of {} matches {condition}, trimming nothing",
            plan.obj_path
        );
        return plan;
    }
    let surplus = current_copies as i64 - min_copies as i64;
    if surplus >= 0 {
        let to_trim = (surplus as usize).min(matched_cur.len());
        plan.to_trim = matched_old;
        plan.to_trim.extend(matched_cur.into_iter().take(to_trim));
    } else {
        // not enough current copies; stale copies count toward the floor too
        let stale_surplus = (matched_old.len() + unmatched_old.len()) as i64 + surplus;
        if stale_surplus > 0 {
            let to_trim = (stale_surplus as usize).min(matched_old.len());
            plan.to_trim = matched_old.into_iter().take(to_trim).collect();
        }
    }
    if plan.is_noop() {
        tracing::info!(
            "trim of {} is a no-op: {} current copies, minimum {}",
            plan.obj_path,
            current_copies,
            min_copies
        );
    }
    plan
}

/// Selection entry points that fetch the replica list from a catalog first.
#[derive(Debug)]
pub struct ReplicaSelector<'a, C: ?Sized, R: ?Sized> {
    catalog: &'a C,
    resources: &'a R,
}

impl<'a, C: Catalog + ?Sized, R: ResourceStatus + ?Sized> ReplicaSelector<'a, C, R> {
    pub fn new(catalog: &'a C, resources: &'a R) -> Self {
        Self { catalog, resources }
    }

    fn fetch(
        &self,
        obj_path: &str,
        condition: &ReplicaCondition,
    ) -> anyhow::Result<Vec<ReplicaRecord>> {
        use anyhow::Context;
        self.catalog
            .replicas_of(obj_path, condition)
            .with_context(|| format!("failed to look up replicas of {obj_path}"))
    }

    pub fn open(
        &self,
        obj_path: &str,
        hierarchy: Option<&str>,
        write_intent: bool,
    ) -> anyhow::Result<ReplicaRecord> {
        let records = self.fetch(obj_path, &ReplicaCondition::default())?;
        Ok(select_for_open(
            records,
            hierarchy,
            write_intent,
            self.resources,
        )?)
    }

    pub fn transfer(
        &self,
        obj_path: &str,
        source_hint: &ReplicaCondition,
        destination: &Destination,
    ) -> anyhow::Result<TransferPlan> {
        let records = self.fetch(obj_path, &ReplicaCondition::default())?;
        Ok(select_for_transfer(
            records,
            source_hint,
            destination,
            self.resources,
        )?)
    }

    pub fn trim(
        &self,
        obj_path: &str,
        condition: &ReplicaCondition,
        min_copies: i32,
    ) -> anyhow::Result<TrimPlan> {
        let records = self.fetch(obj_path, &ReplicaCondition::default())?;
        Ok(select_for_trim(
            records,
            condition,
            min_copies,
            self.resources,
        ))
    }
}
