use std::path::PathBuf;

use crate::request::Request;

/// PVT spelling used by targets that are not partitioned by PVT.
///
/// A target carrying this PVT acts as a cross-cutting barrier: it depends on
/// (or is depended on by) every PVT-scoped target of the related kit.
pub const ALL_PVT: &str = "ALL";

/// An atomic unit of schedulable work, produced by a kit.
///
/// The identity string `"<kit_name>::<pvt>"` (or `"<kit_name>::ALL"`) is the
/// primary key for a target everywhere: in the dependency graph, in the
/// status file, and in executor submissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KitTarget {
    kit_name: String,
    pvt: Option<String>,
}

impl KitTarget {
    /// Creates a target for `kit_name`, scoped to `pvt` when given.
    ///
    /// A PVT of `"ALL"` normalizes to the unscoped form so the two spellings
    /// cannot yield distinct identities.
    pub fn new(kit_name: impl Into<String>, pvt: Option<String>) -> Self {
        let pvt = pvt.filter(|p| p != ALL_PVT);
        Self {
            kit_name: kit_name.into(),
            pvt,
        }
    }

    /// Creates a target scoped to a single PVT.
    pub fn for_pvt(kit_name: impl Into<String>, pvt: impl Into<String>) -> Self {
        Self::new(kit_name, Some(pvt.into()))
    }

    /// Creates the unscoped (`ALL`) target of a kit.
    pub fn all(kit_name: impl Into<String>) -> Self {
        Self::new(kit_name, None)
    }

    /// Name of the kit this target belongs to.
    pub fn kit_name(&self) -> &str {
        &self.kit_name
    }

    /// The target's PVT match key; `"ALL"` for unscoped targets.
    pub fn pvt(&self) -> &str {
        self.pvt.as_deref().unwrap_or(ALL_PVT)
    }

    /// The target's unique identity string.
    pub fn id(&self) -> String {
        format!("{}::{}", self.kit_name, self.pvt())
    }
}

/// A named producer of work units.
///
/// Concrete kits live outside this crate; the engine consumes them through
/// this capability set only. Dependencies are declared at kit granularity;
/// target-level edges are derived by the engine using the PVT match rule.
pub trait Kit: Send + Sync {
    /// Unique kit name. Also the namespace of the kit's target identities.
    fn name(&self) -> &str;

    /// Absolute output directory for this kit under the request's root.
    ///
    /// Per-target logs are written here as `<target_id>.log`, and full-run
    /// cleanup wipes this directory.
    fn output_path(&self, request: &Request) -> PathBuf;

    /// The targets this kit contributes for the given request.
    ///
    /// The usual expansion is one target per PVT; kits whose work is not
    /// PVT-partitioned return a single `ALL` target.
    fn targets(&self, request: &Request) -> Vec<KitTarget>;

    /// Names of kits whose targets must complete before this kit's.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// The argv to execute for one of this kit's targets.
    fn command(&self, target: &KitTarget, request: &Request) -> Vec<String>;
}
