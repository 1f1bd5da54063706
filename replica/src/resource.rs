use crate::record::{HIERARCHY_DELIMITER, Hierarchy, ReplicaCondition, ReplicaRecord};

/// Role of a storage resource in a composite tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ResourceClass {
    #[default]
    Plain,
    Cache,
    Archive,
    Bundle,
}

/// Read-only view of the resource tree.
///
/// Liveness and class are asked about the leaf resource of a replica's hierarchy.
pub trait ResourceStatus {
    fn is_up(&self, leaf: &str) -> bool;
    fn class_of(&self, leaf: &str) -> ResourceClass;
    /// Full hierarchy from the root down to `leaf`, `None` for an unknown resource
    fn hierarchy_of(&self, leaf: &str) -> Option<Hierarchy>;
    /// Whether the resource is served by the host this code runs on
    fn is_local(&self, _leaf: &str) -> bool {
        false
    }
}

/// Source of candidate replica records for an object.
pub trait Catalog {
    fn replicas_of(
        &self,
        obj_path: &str,
        condition: &ReplicaCondition,
    ) -> anyhow::Result<Vec<ReplicaRecord>>;
}

#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub up: bool,
    pub class: ResourceClass,
    pub local: bool,
    pub parent: Option<String>,
    pub children: Vec<String>,
}

/// In-memory resource tree.
#[derive(Debug, Clone, Default)]
pub struct ResourceMap {
    resources: std::collections::HashMap<String, ResourceInfo>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource under `parent`. The parent must already be present.
    pub fn add(
        &mut self,
        name: &str,
        parent: Option<&str>,
        class: ResourceClass,
        up: bool,
    ) -> anyhow::Result<()> {
        if self.resources.contains_key(name) {
            anyhow::bail!("resource {name} is already defined");
        }
        if let Some(parent) = parent {
            let Some(parent_info) = self.resources.get_mut(parent) else {
                anyhow::bail!("parent resource {parent} of {name} is not defined");
            };
            parent_info.children.push(name.to_string());
        }
        self.resources.insert(
            name.to_string(),
            ResourceInfo {
                up,
                class,
                local: false,
                parent: parent.map(str::to_string),
                children: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn set_up(&mut self, name: &str, up: bool) {
        if let Some(info) = self.resources.get_mut(name) {
            info.up = up;
        }
    }

    pub fn set_local(&mut self, name: &str, local: bool) {
        if let Some(info) = self.resources.get_mut(name) {
            info.local = local;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResourceInfo> {
        self.resources.get(name)
    }
}

impl ResourceStatus for ResourceMap {
    fn is_up(&self, leaf: &str) -> bool {
        self.resources.get(leaf).is_some_and(|info| info.up)
    }

    fn class_of(&self, leaf: &str) -> ResourceClass {
        self.resources
            .get(leaf)
            .map(|info| info.class)
            .unwrap_or_default()
    }

    fn hierarchy_of(&self, leaf: &str) -> Option<Hierarchy> {
        let mut path = vec![leaf];
        let mut current = self.resources.get(leaf)?;
        while let Some(parent) = current.parent.as_deref() {
            // a cycle would mean a broken map, stop rather than loop
            if path.len() > self.resources.len() {
                tracing::error!("resource map has a parent cycle through {leaf}");
                return None;
            }
            path.push(parent);
            current = self.resources.get(parent)?;
        }
        path.reverse();
        Some(Hierarchy::new(
            path.join(&HIERARCHY_DELIMITER.to_string()),
        ))
    }

    fn is_local(&self, leaf: &str) -> bool {
        self.resources.get(leaf).is_some_and(|info| info.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_walks_up_to_root() -> anyhow::Result<()> {
        let mut map = ResourceMap::new();
        map.add("compound", None, ResourceClass::Plain, true)?;
        map.add("cache1", Some("compound"), ResourceClass::Cache, true)?;
        map.add("archive1", Some("compound"), ResourceClass::Archive, false)?;
        assert_eq!(
            map.hierarchy_of("archive1"),
            Some(Hierarchy::new("compound;archive1"))
        );
        assert_eq!(map.hierarchy_of("compound"), Some(Hierarchy::new("compound")));
        assert_eq!(map.hierarchy_of("missing"), None);
        assert_eq!(map.get("compound").map(|info| info.children.len()), Some(2));
        assert!(!map.is_up("archive1"));
        assert!(!map.is_up("missing"));
        assert_eq!(map.class_of("cache1"), ResourceClass::Cache);
        assert_eq!(map.class_of("missing"), ResourceClass::Plain);
        Ok(())
    }

    #[test]
    fn rejects_unknown_parent_and_duplicates() -> anyhow::Result<()> {
        let mut map = ResourceMap::new();
        assert!(map.add("leaf", Some("nowhere"), ResourceClass::Cache, true).is_err());
        map.add("leaf", None, ResourceClass::Cache, true)?;
        assert!(map.add("leaf", None, ResourceClass::Cache, true).is_err());
        Ok(())
    }

    #[test]
    fn class_names_parse() {
        assert_eq!("archive".parse::<ResourceClass>().ok(), Some(ResourceClass::Archive));
        assert_eq!("Bundle".parse::<ResourceClass>().ok(), Some(ResourceClass::Bundle));
        assert_eq!(ResourceClass::Cache.to_string(), "cache");
    }
}
