// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upstream Kubernetes installed with kubeadm and networked with flannel.

use anyhow::Context;
use regex::Regex;
use serde_json::json;
use tracing::info;

use super::{Bootstrapper, ClusterAccess, OrchestrationPlane};
use crate::artifacts::Downloader;
use crate::config::KubernetesConfig;
use crate::hardware::{Hardware, Node};

pub const PACKAGES_PLAYBOOK: &str = "kubeadm-packages.yml";

const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
const PUBLIC_IP_ANNOTATION: &str = "flannel.alpha.coreos.com/public-ip-overwrite";

#[derive(Debug)]
pub struct Kubeadm {
    config: KubernetesConfig,
}

impl Kubeadm {
    pub fn new(config: &KubernetesConfig) -> Self {
        Self { config: config.clone() }
    }

    /// Points flannel at the address the other nodes reach this one on.
    fn annotate_public_ip(
        &self,
        plane: &OrchestrationPlane,
        node: &Node,
    ) -> anyhow::Result<()> {
        plane.kubectl([
            "annotate".to_owned(),
            "node".to_owned(),
            node.name().to_owned(),
            format!("{PUBLIC_IP_ANNOTATION}={}", node.ssh_ip()),
            "--overwrite".to_owned(),
        ])?;
        Ok(())
    }

    fn kubectl_path(&self, hardware: &Hardware) -> anyhow::Result<camino::Utf8PathBuf> {
        if let Some(path) = &self.config.kubectl {
            return Ok(path.clone());
        }
        let path = hardware.workspace().bin_dir()?.join("kubectl");
        info!(version = %self.config.version, %path, "Downloading kubectl");
        Downloader::default().fetch_to_file(
            &self.config.kubectl_url(),
            &path,
            None,
            true,
        )?;
        Ok(path)
    }
}

/// Rewrites the API server address in a kubeconfig to `host`, keeping the
/// port.
fn retarget_kubeconfig(kubeconfig: &str, host: &str) -> anyhow::Result<String> {
    let server = Regex::new(r"(?m)^(\s*server:\s*https://)[^:/\s]+")?;
    anyhow::ensure!(server.is_match(kubeconfig), "kubeconfig has no server entry");
    Ok(server.replace_all(kubeconfig, format!("${{1}}{host}")).into_owned())
}

/// Pulls the join command out of `kubeadm token create` output, which may
/// carry warnings ahead of it.
fn parse_join_command(output: &str) -> anyhow::Result<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("kubeadm join"))
        .map(str::to_owned)
        .context("no join command in kubeadm output")
}

impl Bootstrapper for Kubeadm {
    fn name(&self) -> &'static str {
        "kubeadm"
    }

    fn install_packages(&self, hardware: &Hardware) -> anyhow::Result<()> {
        hardware.run_playbook(
            PACKAGES_PLAYBOOK,
            &[],
            Some(json!({ "kubernetes_version": self.config.version })),
        )?;
        Ok(())
    }

    fn bootstrap(
        &self,
        hardware: &Hardware,
        leader: &Node,
    ) -> anyhow::Result<ClusterAccess> {
        let initialized =
            leader.execute_unchecked(&leader.as_root(&format!("test -f {ADMIN_CONF}")))?;
        if initialized.success() {
            info!("Control plane already initialized");
        } else {
            info!(cidr = %self.config.pod_network_cidr, "Running kubeadm init");
            leader.execute(&leader.as_root(&format!(
                "kubeadm init --pod-network-cidr={} --apiserver-cert-extra-sans={}",
                self.config.pod_network_cidr,
                leader.ssh_ip()
            )))?;
        }

        let admin = leader.execute(&leader.as_root(&format!("cat {ADMIN_CONF}")))?;
        let kubeconfig = hardware.workspace().working_dir().join("kubeconfig");
        let contents = retarget_kubeconfig(&admin.stdout, &leader.ssh_ip().to_string())?;
        std::fs::write(&kubeconfig, contents)
            .with_context(|| format!("writing {kubeconfig}"))?;

        Ok(ClusterAccess { kubeconfig, kubectl: self.kubectl_path(hardware)? })
    }

    fn finalize(&self, plane: &OrchestrationPlane) -> anyhow::Result<()> {
        plane.untaint_master()?;
        self.annotate_public_ip(plane, plane.leader())?;
        plane.kubectl_apply(&self.config.cni_manifest)?;
        Ok(())
    }

    fn join(&self, plane: &OrchestrationPlane, node: &Node) -> anyhow::Result<()> {
        let leader = plane.leader();
        let token = leader
            .execute(&leader.as_root("kubeadm token create --print-join-command"))?;
        let join = parse_join_command(&token.stdout)?;
        node.execute(&node.as_root(&join))
            .with_context(|| format!("joining {}", node.name()))?;
        self.annotate_public_ip(plane, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::ExecOutput;
    use crate::hardware::fake::FakeProvider;
    use crate::kubernetes::tests::{script_ready_cluster, test_config};
    use crate::kubernetes::JoinOutcome;
    use crate::workspace::tests::scripted_workspace;
    use camino::Utf8Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const ADMIN: &str = "apiVersion: v1\nclusters:\n- cluster:\n    \
        certificate-authority-data: AAAA\n    server: https://192.168.0.4:6443\n  \
        name: kubernetes\n";

    #[test]
    fn kubeconfig_points_at_the_reachable_address() {
        let out = retarget_kubeconfig(ADMIN, "203.0.113.7").unwrap();
        assert!(out.contains("    server: https://203.0.113.7:6443\n"));
        assert!(out.contains("certificate-authority-data: AAAA"));
        assert!(retarget_kubeconfig("apiVersion: v1\n", "x").is_err());
    }

    #[test]
    fn join_command_skips_warnings() {
        let out = "W0101 12:00:00 warning\nkubeadm join 10.0.0.1:6443 --token a.b \
                   --discovery-token-ca-cert-hash sha256:ff\n";
        assert_eq!(
            parse_join_command(out).unwrap(),
            "kubeadm join 10.0.0.1:6443 --token a.b --discovery-token-ca-cert-hash sha256:ff"
        );
        assert!(parse_join_command("").is_err());
    }

    fn kubeadm_plane(
        dir: &tempfile::TempDir,
    ) -> (Arc<crate::testing::ScriptedRunner>, OrchestrationPlane) {
        let (ws, runner) = scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        script_ready_cluster(&runner);
        runner.on_failure("test -f /etc/kubernetes/", 1, "");
        runner.on_stdout("cat /etc/kubernetes/admin.conf", ADMIN);
        runner.on_stdout(
            "kubeadm token create",
            "kubeadm join 10.0.0.1:6443 --token a.b\n",
        );
        runner.on_stdout("ansible-playbook", r#"{"stats": {}}"#);

        let mut config = test_config();
        config.kubernetes.kubectl = Some("/usr/bin/kubectl".into());
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
            Box::new(Kubeadm::new(&config.kubernetes)),
        )
        .unwrap();
        (runner, plane)
    }

    #[test]
    fn bootstrap_and_join_drive_kubeadm() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, plane) = kubeadm_plane(&dir);

        let kubeconfig = std::fs::read_to_string(plane.kubeconfig()).unwrap();
        let leader_ip = plane.leader().ssh_ip().to_string();
        assert!(kubeconfig.contains(&format!("server: https://{leader_ip}:6443")));
        assert_eq!(plane.access().kubectl, "/usr/bin/kubectl");
        assert_eq!(runner.count("kubeadm init --pod-network-cidr=10.244.0.0/16"), 1);
        assert_eq!(runner.count("kube-flannel.yml"), 1);
        assert_eq!(runner.count("kubeadm-packages.yml"), 1);

        let worker = plane.hardware().workers()[0].clone();
        assert_eq!(plane.join(&worker).unwrap(), JoinOutcome::Joined);
        assert_eq!(runner.count("kubeadm join 10.0.0.1:6443 --token a.b"), 1);
        assert_eq!(
            runner.count(&format!(
                "{PUBLIC_IP_ANNOTATION}={} --overwrite",
                worker.ssh_ip()
            )),
            1
        );
    }

    #[test]
    fn second_join_leaves_the_node_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, plane) = kubeadm_plane(&dir);
        let leader = plane.leader().name().to_owned();
        let worker = plane.hardware().workers()[0].clone();

        // The kubelet runs, and the node is listed, only once a join ran.
        let joined = Arc::new(AtomicBool::new(false));
        let flag = joined.clone();
        runner.on("kubeadm join", move |_| {
            flag.store(true, Ordering::SeqCst);
            ExecOutput::ok("")
        });
        let flag = joined.clone();
        runner.on("systemctl is-active --quiet kubelet", move |_| {
            if flag.load(Ordering::SeqCst) {
                ExecOutput::ok("")
            } else {
                ExecOutput::failed(3, "")
            }
        });
        let flag = joined.clone();
        let (first, second) = (leader.clone(), worker.name().to_owned());
        runner.on("get nodes -o", move |_| {
            let mut names = format!("{first}\n");
            if flag.load(Ordering::SeqCst) {
                names.push_str(&format!("{second}\n"));
            }
            ExecOutput::ok(names)
        });

        assert_eq!(plane.members().unwrap(), [leader.clone()]);
        assert_eq!(plane.join(&worker).unwrap(), JoinOutcome::Joined);
        let members = plane.members().unwrap();
        assert_eq!(members, [leader, worker.name().to_owned()]);

        assert_eq!(plane.join(&worker).unwrap(), JoinOutcome::AlreadyMember);
        assert_eq!(runner.count("kubeadm token create"), 1);
        assert_eq!(runner.count("kubeadm join"), 1);
        assert_eq!(plane.members().unwrap(), members);
    }
}
