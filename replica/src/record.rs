use serde::{Deserialize, Serialize};

/// Separator between resource names in a hierarchy string.
pub const HIERARCHY_DELIMITER: char = ';';

/// Ordered path of resource names from a composite root to the leaf that stores the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hierarchy(String);

impl Hierarchy {
    pub fn new(hierarchy: impl Into<String>) -> Self {
        Self(hierarchy.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(HIERARCHY_DELIMITER)
    }

    pub fn root(&self) -> &str {
        self.segments().next().unwrap_or_default()
    }

    /// The resource that actually holds the bytes.
    pub fn leaf(&self) -> &str {
        self.0
            .rsplit(HIERARCHY_DELIMITER)
            .next()
            .unwrap_or_default()
    }

    /// Whether `name` is one whole resource of this hierarchy (never a partial name).
    pub fn contains_resource(&self, name: &str) -> bool {
        self.segments().any(|segment| segment == name)
    }
}

impl std::fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Hierarchy {
    fn from(hierarchy: &str) -> Self {
        Self::new(hierarchy)
    }
}

/// One physical copy of a logical data object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub data_id: i64,
    pub coll_id: i64,
    pub obj_path: String,
    /// Unique among the replicas of one object
    pub repl_num: i32,
    pub resc_hier: Hierarchy,
    pub phy_path: String,
    pub size: i64,
    /// Empty when no checksum has been computed
    pub checksum: String,
    /// Positive means up to date ("current"), zero or negative means stale
    pub repl_status: i32,
    pub owner: String,
    pub create_time: std::time::SystemTime,
    pub modify_time: std::time::SystemTime,
    pub mode: String,
}

impl ReplicaRecord {
    pub fn is_current(&self) -> bool {
        self.repl_status > 0
    }
}

/// Caller supplied filter that picks out particular replicas.
///
/// A record matches if it satisfies any of the set conditions. An empty condition is "no
/// condition", which callers treat as matching everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCondition {
    pub replica_number: Option<i32>,
    pub hierarchy: Option<Hierarchy>,
    pub resource_name: Option<String>,
}

impl ReplicaCondition {
    pub fn by_replica_number(repl_num: i32) -> Self {
        Self {
            replica_number: Some(repl_num),
            ..Default::default()
        }
    }

    pub fn by_hierarchy(hierarchy: impl Into<Hierarchy>) -> Self {
        Self {
            hierarchy: Some(hierarchy.into()),
            ..Default::default()
        }
    }

    pub fn by_resource(name: impl Into<String>) -> Self {
        Self {
            resource_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.replica_number.is_none() && self.hierarchy.is_none() && self.resource_name.is_none()
    }

    pub fn matches(&self, record: &ReplicaRecord) -> bool {
        self.replica_number == Some(record.repl_num)
            || self.hierarchy.as_ref() == Some(&record.resc_hier)
            || self
                .resource_name
                .as_deref()
                .is_some_and(|name| record.resc_hier.contains_resource(name))
    }
}

impl std::fmt::Display for ReplicaCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(repl_num) = self.replica_number {
            parts.push(format!("replica {repl_num}"));
        }
        if let Some(hierarchy) = &self.hierarchy {
            parts.push(format!("hierarchy {hierarchy}"));
        }
        if let Some(name) = &self.resource_name {
            parts.push(format!("resource {name}"));
        }
        if parts.is_empty() {
            f.write_str("no condition")
        } else {
            f.write_str(&parts.join(" or "))
        }
    }
}
