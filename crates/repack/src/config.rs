use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;

use repack_core::Request;

/// One kit declaration from the run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KitSpec {
    pub name: String,
    /// Names of kits this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Argv template; tokens may use `{library}`, `{pvt}`, `{target}`,
    /// `{output_root}`.
    pub command: Vec<String>,
    /// One target per PVT when true; a single ALL target otherwise.
    #[serde(default = "default_true")]
    pub pvt_scoped: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub library: String,
    pub pvts: Vec<String>,
    #[serde(default)]
    pub corners: Vec<String>,
    #[serde(default)]
    pub cells: Vec<String>,
    pub output_root: PathBuf,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Status file path; defaults to `<output_root>/repack_status.csv`.
    #[serde(default)]
    pub status_file: Option<PathBuf>,
    /// Extra submission flags for the batch executor (queue, resources, …).
    #[serde(default)]
    pub site_flags: Vec<String>,
    pub kits: Vec<KitSpec>,
}

impl RunConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read run config {}", path.display()))?;
        let config: RunConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse run config {}", path.display()))?;
        if config.pvts.is_empty() {
            anyhow::bail!("run config lists no PVTs");
        }
        if config.kits.is_empty() {
            anyhow::bail!("run config lists no kits");
        }
        Ok(config)
    }

    pub fn request(&self) -> anyhow::Result<Request> {
        let output_root = std::path::absolute(&self.output_root)
            .with_context(|| format!("resolve output root {}", self.output_root.display()))?;
        Ok(Request {
            library_name: self.library.clone(),
            pvts: self.pvts.clone(),
            corners: self.corners.clone(),
            cells: self.cells.clone(),
            output_root,
            options: self.options.clone(),
        })
    }
}
