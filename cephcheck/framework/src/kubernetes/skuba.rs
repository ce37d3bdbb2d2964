// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SUSE CaaS Platform clusters driven by the `skuba` CLI from the harness
//! host. `skuba` reaches the nodes through the workspace's SSH agent.

use camino::Utf8PathBuf;
use tracing::info;

use super::{Bootstrapper, ClusterAccess, OrchestrationPlane};
use crate::config::KubernetesConfig;
use crate::execute::Exec;
use crate::hardware::{Hardware, Node, NodeRole};

pub const PACKAGES_PLAYBOOK: &str = "playbook_caasp.yml";

#[derive(Debug)]
pub struct Skuba {
    kubectl: Utf8PathBuf,
    user: String,
}

impl Skuba {
    pub fn new(config: &KubernetesConfig, user: &str) -> Self {
        Self {
            kubectl: config.kubectl.clone().unwrap_or_else(|| "kubectl".into()),
            user: user.to_owned(),
        }
    }

    fn cluster_dir(hardware: &Hardware) -> Utf8PathBuf {
        hardware.workspace().working_dir().join("cluster")
    }

    /// `skuba node <verb>` with the options every node command shares.
    fn node_command(&self, verb: &str, node: &Node) -> Exec {
        Exec::new("skuba")
            .args(["node", verb])
            .args(match (verb, node.role()) {
                ("join", NodeRole::Worker) => vec!["--role", "worker"],
                ("join", NodeRole::Master) => vec!["--role", "master"],
                _ => vec![],
            })
            .args(["--user", self.user.as_str(), "--sudo", "--target"])
            .arg(node.ssh_ip().to_string())
            .arg(node.name())
            .capture()
    }
}

impl Bootstrapper for Skuba {
    fn name(&self) -> &'static str {
        "skuba"
    }

    fn install_packages(&self, hardware: &Hardware) -> anyhow::Result<()> {
        hardware.run_playbook(PACKAGES_PLAYBOOK, &[], None)?;
        Ok(())
    }

    fn bootstrap(
        &self,
        hardware: &Hardware,
        leader: &Node,
    ) -> anyhow::Result<ClusterAccess> {
        let workspace = hardware.workspace();
        let cluster = Self::cluster_dir(hardware);
        let kubeconfig = cluster.join("admin.conf");

        if kubeconfig.exists() {
            info!(%cluster, "Cluster definition already bootstrapped");
        } else {
            if !cluster.exists() {
                workspace.execute(
                    Exec::new("skuba")
                        .args(["cluster", "init", "--control-plane"])
                        .arg(leader.ssh_ip().to_string())
                        .arg(cluster.as_str())
                        .capture(),
                )?;
            }
            info!(leader = %leader.name(), "skuba node bootstrap; this may take a while");
            workspace.execute(self.node_command("bootstrap", leader).chdir(&cluster))?;
        }

        Ok(ClusterAccess { kubeconfig, kubectl: self.kubectl.clone() })
    }

    fn finalize(&self, plane: &OrchestrationPlane) -> anyhow::Result<()> {
        plane.untaint_master()
    }

    fn join(&self, plane: &OrchestrationPlane, node: &Node) -> anyhow::Result<()> {
        let cluster = Self::cluster_dir(plane.hardware());
        plane
            .workspace()
            .execute(self.node_command("join", node).chdir(&cluster))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::fake::FakeProvider;
    use crate::kubernetes::tests::{script_ready_cluster, test_config};
    use crate::workspace::tests::scripted_workspace;
    use camino::Utf8Path;
    use std::sync::Arc;

    #[test]
    fn skuba_runs_in_the_cluster_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, runner) = scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        script_ready_cluster(&runner);
        runner.on_failure("systemctl is-active --quiet kubelet", 1, "");
        runner.on_stdout("ansible-playbook", r#"{"stats": {}}"#);

        let seen_dirs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = seen_dirs.clone();
        runner.on("skuba node", move |exec| {
            record
                .lock()
                .unwrap()
                .push(exec.working_dir().map(Utf8Path::to_owned));
            crate::execute::ExecOutput::ok("")
        });

        let mut config = test_config();
        config.node_image_user = "sles".into();
        let hardware = Hardware::with_provider(
            &config,
            Arc::new(ws),
            Box::new(FakeProvider::default()),
        )
        .unwrap();
        hardware.boot_nodes(1, 1, 0).unwrap();

        let skuba = Skuba::new(&config.kubernetes, &config.node_image_user);
        let plane =
            OrchestrationPlane::bootstrap(&config, Arc::new(hardware), Box::new(skuba))
                .unwrap();
        let leader = plane.leader().clone();
        let worker = plane.hardware().workers()[0].clone();
        plane.join(&worker).unwrap();

        let cluster = plane.workspace().working_dir().join("cluster");
        assert_eq!(plane.kubeconfig(), cluster.join("admin.conf").as_path());
        assert_eq!(
            runner.count(&format!("skuba cluster init --control-plane {}", leader.ssh_ip())),
            1
        );
        assert_eq!(
            runner.count(&format!(
                "skuba node bootstrap --user sles --sudo --target {} {}",
                leader.ssh_ip(),
                leader.name()
            )),
            1
        );
        assert_eq!(
            runner.count(&format!(
                "skuba node join --role worker --user sles --sudo --target {} {}",
                worker.ssh_ip(),
                worker.name()
            )),
            1
        );
        assert_eq!(runner.count("playbook_caasp.yml"), 1);
        let dirs = seen_dirs.lock().unwrap();
        assert_eq!(dirs.len(), 2);
        assert!(dirs.iter().all(|d| d.as_deref() == Some(cluster.as_path())));
    }
}
