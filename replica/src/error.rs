#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no replica of {obj_path} matches resource hierarchy {hierarchy}")]
    HierarchyMismatch { obj_path: String, hierarchy: String },
    #[error("every usable replica of {obj_path} is on a resource that is down")]
    AllResourcesDown { obj_path: String },
    #[error("replica {repl_num} of {obj_path} on {hierarchy} is already up to date")]
    AlreadyReplicated {
        obj_path: String,
        repl_num: i32,
        hierarchy: String,
    },
    #[error(
        "trimming {obj_path} would leave fewer than {min_copies} copies ({current} current copies)"
    )]
    MinimumCopyViolation {
        obj_path: String,
        min_copies: usize,
        current: usize,
    },
    #[error("no replica of {obj_path} matches {condition}")]
    NoMatchingReplica { obj_path: String, condition: String },
    #[error("no replicas given")]
    NoReplicas,
    #[error("unknown resource {name}")]
    UnknownResource { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;
