use std::collections::BTreeMap;
use std::path::PathBuf;

/// Configuration for a single repack run.
///
/// Built once by the driver and treated as read-only for the rest of the
/// run. Kits receive a shared reference when expanding targets and when
/// constructing commands.
#[derive(Debug, Clone)]
pub struct Request {
    /// Name of the library being characterized.
    pub library_name: String,

    /// PVT identifiers to expand PVT-scoped kits over.
    ///
    /// The engine never interprets these; they are opaque match keys.
    pub pvts: Vec<String>,

    /// Corner identifiers, forwarded to kits verbatim.
    pub corners: Vec<String>,

    /// Cell names, forwarded to kits verbatim.
    pub cells: Vec<String>,

    /// Absolute path under which kits place their output directories.
    pub output_root: PathBuf,

    /// Free-form key/value options for kit-specific tuning.
    pub options: BTreeMap<String, String>,
}
