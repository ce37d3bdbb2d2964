// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rook as packaged for SUSE Enterprise Storage. Nothing is built locally:
//! the manifests come from the package installed on the leader.

use serde_json::json;
use tracing::info;

use super::{recursive_replace, BuiltArtifact, PreparedArtifact, StorageSource};
use crate::config::SesTarget;
use crate::execute::Exec;
use crate::kubernetes::OrchestrationPlane;
use crate::workspace::Workspace;

/// Adds the target's repositories and installs the Rook packages.
pub const REPOSITORIES_PLAYBOOK: &str = "playbook_rook_ses.yml";

/// Where the package installs its manifests on the nodes.
const PACKAGED_MANIFESTS: &str = "/usr/share/k8s-yaml/rook";

#[derive(Debug)]
pub struct Vendor {
    target: SesTarget,
    user: String,
}

impl Vendor {
    pub fn new(target: SesTarget, user: &str) -> Self {
        Self { target, user: user.to_owned() }
    }
}

impl StorageSource for Vendor {
    fn name(&self) -> &'static str {
        "vendor"
    }

    fn build(&self, workspace: &Workspace) -> anyhow::Result<BuiltArtifact> {
        info!("Vendor Rook needs no build");
        Ok(BuiltArtifact::new(workspace.working_dir().join("rook/ceph"), None))
    }

    fn preinstall(
        &self,
        plane: &OrchestrationPlane,
        built: BuiltArtifact,
    ) -> anyhow::Result<PreparedArtifact> {
        plane.hardware().run_playbook(
            REPOSITORIES_PLAYBOOK,
            &[],
            Some(json!({ "ses_repositories": self.target.repositories })),
        )?;

        let workspace = plane.workspace();
        let leader = plane.leader();
        info!(leader = %leader.name(), "Copying packaged manifests");
        workspace.execute(
            Exec::new("rsync")
                .args(["-avr", "-e"])
                .arg(format!(
                    "ssh -i {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
                    workspace.private_key()
                ))
                .arg(format!("{}@{}:{PACKAGED_MANIFESTS}", self.user, leader.ssh_ip()))
                .arg(workspace.working_dir().as_str())
                .quiet(),
        )?;

        let changed = recursive_replace(built.manifests(), &self.target.yaml_substitutions)?;
        info!(changed, "Applied manifest substitutions");
        Ok(PreparedArtifact::new(built.manifests))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::fake::FakeProvider;
    use crate::hardware::Hardware;
    use crate::kubernetes::tests::{script_ready_cluster, test_config, RecordingBootstrapper};
    use crate::workspace::tests::scripted_workspace;
    use camino::Utf8Path;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn preinstall_fetches_from_the_leader_and_substitutes() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, runner) = scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        script_ready_cluster(&runner);
        runner.on_stdout("ansible-playbook", r#"{"stats": {}}"#);

        let config = test_config();
        let hardware = Hardware::with_provider(
            &config,
            Arc::new(ws),
            Box::new(FakeProvider::default()),
        )
        .unwrap();
        hardware.boot_nodes(1, 1, 0).unwrap();
        let plane = OrchestrationPlane::bootstrap(
            &config,
            Arc::new(hardware),
            Box::new(Arc::new(RecordingBootstrapper::default())),
        )
        .unwrap();

        // Stands in for what rsync would have copied.
        let ceph = plane.workspace().working_dir().join("rook/ceph");
        std::fs::create_dir_all(&ceph).unwrap();
        std::fs::write(ceph.join("operator.yaml"), "image: registry.suse.com/ses/7/rook/ceph\n")
            .unwrap();

        let target = SesTarget {
            repositories: BTreeMap::from([(
                "ses".to_owned(),
                "http://download.example/ses7".to_owned(),
            )]),
            yaml_substitutions: BTreeMap::from([(
                "registry.suse.com".to_owned(),
                "registry.example".to_owned(),
            )]),
        };
        let vendor = Vendor::new(target, "sles");
        let built = vendor.build(plane.workspace()).unwrap();
        let prepared = vendor.preinstall(&plane, built).unwrap();

        assert_eq!(prepared.manifests(), ceph.as_path());
        assert_eq!(runner.count("playbook_rook_ses.yml"), 1);
        assert_eq!(runner.count("http://download.example/ses7"), 1);
        assert_eq!(
            runner.count(&format!(
                "sles@{}:/usr/share/k8s-yaml/rook",
                plane.leader().ssh_ip()
            )),
            1
        );
        assert_eq!(
            std::fs::read_to_string(ceph.join("operator.yaml")).unwrap(),
            "image: registry.example/ses/7/rook/ceph\n"
        );
    }
}
