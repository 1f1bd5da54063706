use crate::record::{Hierarchy, ReplicaRecord};
use crate::resource::{ResourceClass, ResourceMap};

pub fn record(repl_num: i32, hierarchy: &str, repl_status: i32) -> ReplicaRecord {
    ReplicaRecord {
        data_id: 10_001,
        coll_id: 10_000,
        obj_path: "/tempZone/home/rods/file.dat".to_string(),
        repl_num,
        resc_hier: Hierarchy::new(hierarchy),
        phy_path: format!("/var/lib/vault/{repl_num}/file.dat"),
        size: 1024,
        checksum: String::new(),
        repl_status,
        owner: "rods".to_string(),
        create_time: std::time::UNIX_EPOCH,
        modify_time: std::time::UNIX_EPOCH,
        mode: "0".to_string(),
    }
}

/// cache1/archive1/bundle1/plain1 are live roots, down1 is a dead cache, compound holds
/// cache2 and archive2.
pub fn resources() -> ResourceMap {
    let mut map = ResourceMap::new();
    let entries: [(&str, Option<&str>, ResourceClass, bool); 8] = [
        ("cache1", None, ResourceClass::Cache, true),
        ("archive1", None, ResourceClass::Archive, true),
        ("bundle1", None, ResourceClass::Bundle, true),
        ("plain1", None, ResourceClass::Plain, true),
        ("down1", None, ResourceClass::Cache, false),
        ("compound", None, ResourceClass::Plain, true),
        ("cache2", Some("compound"), ResourceClass::Cache, true),
        ("archive2", Some("compound"), ResourceClass::Archive, true),
    ];
    for (name, parent, class, up) in entries {
        if let Err(err) = map.add(name, parent, class, up) {
            panic!("bad test resource map: {err:#}");
        }
    }
    map
}
