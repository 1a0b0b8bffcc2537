use std::path::PathBuf;

use repack_core::{Kit, KitTarget, Request};

use crate::config::KitSpec;

/// A kit defined entirely by the run configuration: its command is an argv
/// template expanded per target.
pub struct ShellKit {
    spec: KitSpec,
}

impl ShellKit {
    pub fn new(spec: KitSpec) -> Self {
        Self { spec }
    }
}

fn expand(token: &str, target: &KitTarget, request: &Request) -> String {
    token
        .replace("{library}", &request.library_name)
        .replace("{pvt}", target.pvt())
        .replace("{target}", &target.id())
        .replace("{output_root}", &request.output_root.to_string_lossy())
}

impl Kit for ShellKit {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn output_path(&self, request: &Request) -> PathBuf {
        request.output_root.join(&self.spec.name)
    }

    fn targets(&self, request: &Request) -> Vec<KitTarget> {
        if self.spec.pvt_scoped {
            request
                .pvts
                .iter()
                .map(|pvt| KitTarget::for_pvt(&self.spec.name, pvt))
                .collect()
        } else {
            vec![KitTarget::all(&self.spec.name)]
        }
    }

    fn dependencies(&self) -> Vec<String> {
        self.spec.dependencies.clone()
    }

    fn command(&self, target: &KitTarget, request: &Request) -> Vec<String> {
        self.spec
            .command
            .iter()
            .map(|token| expand(token, target, request))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn request() -> Request {
        Request {
            library_name: "demo_lib".to_string(),
            pvts: vec!["ss_100c".to_string()],
            corners: Vec::new(),
            cells: Vec::new(),
            output_root: PathBuf::from("/tmp/out"),
            options: BTreeMap::new(),
        }
    }

    #[test]
    fn expands_command_template_per_target() {
        let kit = ShellKit::new(KitSpec {
            name: "Liberate".to_string(),
            dependencies: Vec::new(),
            command: vec![
                "char_lib".to_string(),
                "--lib".to_string(),
                "{library}".to_string(),
                "--pvt".to_string(),
                "{pvt}".to_string(),
                "--out".to_string(),
                "{output_root}/{target}".to_string(),
            ],
            pvt_scoped: true,
        });

        let request = request();
        let targets = kit.targets(&request);
        assert_eq!(targets.len(), 1);
        assert_eq!(
            kit.command(&targets[0], &request),
            vec![
                "char_lib",
                "--lib",
                "demo_lib",
                "--pvt",
                "ss_100c",
                "--out",
                "/tmp/out/Liberate::ss_100c",
            ]
        );
    }

    #[test]
    fn unscoped_kit_expands_to_one_target() {
        let kit = ShellKit::new(KitSpec {
            name: "Merge".to_string(),
            dependencies: Vec::new(),
            command: vec!["merge_lib".to_string(), "{target}".to_string()],
            pvt_scoped: false,
        });

        let targets = kit.targets(&request());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id(), "Merge::ALL");
    }
}
