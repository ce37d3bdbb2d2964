// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Kubernetes control plane running on a run's nodes.
//!
//! An [`OrchestrationPlane`] only exists once its first leader has been
//! bootstrapped, so every handle to one can issue `kubectl` calls. How the
//! plane is installed and how nodes join it is up to the [`Bootstrapper`]
//! picked for the configured distribution.

use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use thiserror::Error;
use tracing::{error, info, info_span, instrument, warn};

use crate::config::{Distro, HarnessConfig, Timeouts};
use crate::execute::{Exec, ExecOutput};
use crate::hardware::{Hardware, Node};
use crate::poll::{wait_for_decoded, wait_for_result, Equals, RegexCount};
use crate::workspace::Workspace;

pub mod kubeadm;
pub mod skuba;

/// The namespace Rook and its Ceph daemons live in.
pub const ROOK_NAMESPACE: &str = "rook-ceph";

/// Succeeds on nodes that already run a configured kubelet.
const KUBELET_ACTIVE: &str =
    "test -f /etc/kubernetes/kubelet.conf && systemctl is-active --quiet kubelet";

/// What a harness needs to talk to a bootstrapped plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterAccess {
    pub kubeconfig: Utf8PathBuf,
    pub kubectl: Utf8PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// The node's kubelet was already running; nothing was done.
    AlreadyMember,
}

#[derive(Debug, Error)]
pub enum PlaneError {
    #[error("failed to join nodes: {}", .nodes.iter().map(|(n, e)| format!("{n}: {e:#}")).collect::<Vec<_>>().join("; "))]
    JoinFailed { nodes: Vec<(String, anyhow::Error)> },
}

/// A way of installing Kubernetes on the nodes and joining them to it.
pub trait Bootstrapper: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Installs the packages every node needs. Must be safe to repeat.
    fn install_packages(&self, hardware: &Hardware) -> anyhow::Result<()>;

    /// Initializes the control plane on `leader`.
    fn bootstrap(
        &self,
        hardware: &Hardware,
        leader: &Node,
    ) -> anyhow::Result<ClusterAccess>;

    /// Runs once the leader is initialized, before anything joins.
    fn finalize(&self, plane: &OrchestrationPlane) -> anyhow::Result<()>;

    /// Joins a node that is not yet a member.
    fn join(&self, plane: &OrchestrationPlane, node: &Node) -> anyhow::Result<()>;
}

/// Selects the bootstrapper for the configured distribution.
pub fn bootstrapper_for(config: &HarnessConfig) -> Box<dyn Bootstrapper> {
    match config.distro {
        Distro::OpensuseK8s => Box::new(kubeadm::Kubeadm::new(&config.kubernetes)),
        Distro::SlesCaasp => Box::new(skuba::Skuba::new(
            &config.kubernetes,
            &config.node_image_user,
        )),
    }
}

pub struct OrchestrationPlane {
    hardware: Arc<Hardware>,
    bootstrapper: Box<dyn Bootstrapper>,
    access: ClusterAccess,
    leader: Arc<Node>,
    timeouts: Timeouts,

    /// Joins hold this shared; listing and removing members hold it
    /// exclusively.
    membership: RwLock<()>,
}

impl fmt::Debug for OrchestrationPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationPlane")
            .field("bootstrapper", &self.bootstrapper.name())
            .field("leader", &self.leader.name())
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

impl OrchestrationPlane {
    /// Installs packages on every node, initializes the control plane on
    /// the first leader and waits for that leader to report Ready.
    #[instrument(skip_all, fields(bootstrapper = bootstrapper.name()))]
    pub fn bootstrap(
        config: &HarnessConfig,
        hardware: Arc<Hardware>,
        bootstrapper: Box<dyn Bootstrapper>,
    ) -> anyhow::Result<Self> {
        bootstrapper
            .install_packages(&hardware)
            .context("installing Kubernetes packages")?;

        let leader = hardware.first_master()?;
        info!(leader = %leader.name(), "Bootstrapping control plane");
        let access = bootstrapper
            .bootstrap(&hardware, &leader)
            .with_context(|| format!("bootstrapping {}", leader.name()))?;

        let plane = Self {
            hardware,
            bootstrapper,
            access,
            leader,
            timeouts: config.timeouts,
            membership: RwLock::new(()),
        };
        plane.bootstrapper.finalize(&plane)?;
        plane.wait_for_node_ready(plane.leader.name())?;
        info!("Control plane ready");
        Ok(plane)
    }

    pub fn hardware(&self) -> &Arc<Hardware> {
        &self.hardware
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        self.hardware.workspace()
    }

    pub fn access(&self) -> &ClusterAccess {
        &self.access
    }

    pub fn kubeconfig(&self) -> &Utf8Path {
        &self.access.kubeconfig
    }

    pub fn leader(&self) -> &Arc<Node> {
        &self.leader
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Installs packages again, for nodes added after bootstrap.
    pub fn install_packages(&self) -> anyhow::Result<()> {
        self.bootstrapper.install_packages(&self.hardware)
    }

    fn kubectl_exec<I, S>(&self, args: I) -> Exec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Exec::new(self.access.kubectl.as_str())
            .arg("--kubeconfig")
            .arg(self.access.kubeconfig.as_str())
            .args(args)
            .capture()
    }

    /// Runs kubectl against the plane, failing on a non-zero exit.
    pub fn kubectl<I, S>(&self, args: I) -> anyhow::Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let exec = self.kubectl_exec(args);
        let command = exec.command_line();
        self.workspace()
            .execute(exec)
            .with_context(|| format!("running {command}"))
    }

    /// Runs kubectl and returns its output whatever its exit status.
    pub fn kubectl_unchecked<I, S>(&self, args: I) -> anyhow::Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.workspace().execute(self.kubectl_exec(args).check(false))?)
    }

    /// Applies a manifest from a path or URL.
    pub fn kubectl_apply(&self, manifest: &str) -> anyhow::Result<ExecOutput> {
        self.kubectl(["apply", "-f", manifest])
    }

    /// Allows workloads on leaders.
    pub fn untaint_master(&self) -> anyhow::Result<()> {
        // Fails on nodes that were never tainted.
        self.kubectl_unchecked(["taint", "nodes", "--all", "node-role.kubernetes.io/master-"])?;
        Ok(())
    }

    pub fn execute_in_pod(
        &self,
        command: &str,
        pod: &str,
        namespace: &str,
    ) -> anyhow::Result<ExecOutput> {
        self.kubectl(["-n", namespace, "exec", "-t", pod, "--", "bash", "-c", command])
    }

    /// Runs `command` in the first pod carrying `app=label`.
    pub fn execute_in_pod_by_label(
        &self,
        command: &str,
        label: &str,
        namespace: &str,
    ) -> anyhow::Result<ExecOutput> {
        let pods = self.get_pods_by_app_label(label, namespace)?;
        let pod = pods
            .first()
            .with_context(|| format!("no pod labelled app={label} in {namespace}"))?;
        self.execute_in_pod(command, pod, namespace)
    }

    fn names_by_app_label(
        &self,
        kind: &str,
        label: &str,
        namespace: &str,
    ) -> anyhow::Result<Vec<String>> {
        let out = self.kubectl([
            "-n",
            namespace,
            "get",
            kind,
            "-l",
            &format!("app={label}"),
            "--output",
            "custom-columns=name:metadata.name",
            "--no-headers",
        ])?;
        Ok(lines(&out.stdout))
    }

    pub fn get_pods_by_app_label(
        &self,
        label: &str,
        namespace: &str,
    ) -> anyhow::Result<Vec<String>> {
        self.names_by_app_label("pod", label, namespace)
    }

    pub fn get_services_by_app_label(
        &self,
        label: &str,
        namespace: &str,
    ) -> anyhow::Result<Vec<String>> {
        self.names_by_app_label("svc", label, namespace)
    }

    /// Waits until at least `count` pods labelled `app=label` are Running.
    pub fn wait_for_pods_by_app_label(
        &self,
        label: &str,
        count: usize,
        namespace: &str,
    ) -> anyhow::Result<String> {
        let selector = format!("app={label}");
        let running = RegexCount::at_least(Regex::new(r".*Running")?, count);
        let listing = wait_for_decoded(
            self.timeouts.pods,
            &format!("{count} running pods with {selector}"),
            || self.kubectl(["-n", namespace, "get", "pod", "-l", &selector, "--no-headers"]),
            |out| out.stdout,
            &running,
        )?;
        Ok(listing)
    }

    pub fn wait_for_service(&self, service: &str, namespace: &str) -> anyhow::Result<()> {
        wait_for_result(
            self.timeouts.service,
            &format!("service {service}"),
            || {
                let out = self.kubectl_unchecked(["-n", namespace, "get", "service", service])?;
                Ok(out.success())
            },
            &Equals(true),
        )?;
        Ok(())
    }

    /// Waits until the node registered as `name` reports Ready.
    pub fn wait_for_node_ready(&self, name: &str) -> anyhow::Result<()> {
        let ready = RegexCount::any(Regex::new(r"\bReady\b")?);
        wait_for_decoded(
            self.timeouts.control_plane,
            &format!("node {name} to be Ready"),
            || self.kubectl_unchecked(["get", "node", name, "--no-headers"]),
            |out| out.stdout,
            &ready,
        )?;
        Ok(())
    }

    /// Whether the node's kubelet is already configured and running.
    pub fn is_member(&self, node: &Node) -> anyhow::Result<bool> {
        Ok(node.execute_unchecked(&node.as_root(KUBELET_ACTIVE))?.success())
    }

    /// Joins a node to the plane unless it already is a member.
    pub fn join(&self, node: &Node) -> anyhow::Result<JoinOutcome> {
        let _span = info_span!("join", node = %node.name()).entered();
        let _membership = self.membership.read().unwrap();

        if self.is_member(node)? {
            info!("Kubelet already active; skipping join");
            return Ok(JoinOutcome::AlreadyMember);
        }

        self.bootstrapper.join(self, node)?;
        self.wait_for_node_ready(node.name())?;
        info!("Node joined");
        Ok(JoinOutcome::Joined)
    }

    /// Joins nodes concurrently, one thread per node.
    pub fn join_all(&self, nodes: &[Arc<Node>]) -> anyhow::Result<Vec<JoinOutcome>> {
        let results: Vec<(String, anyhow::Result<JoinOutcome>)> = std::thread::scope(|s| {
            let handles: Vec<_> = nodes
                .iter()
                .map(|node| (node.name().to_owned(), s.spawn(|| self.join(node))))
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("join worker panicked")));
                    (name, result)
                })
                .collect()
        });

        let mut outcomes = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(node = %name, error = ?e, "Join failed");
                    failed.push((name, e));
                }
            }
        }
        if !failed.is_empty() {
            return Err(PlaneError::JoinFailed { nodes: failed }.into());
        }
        Ok(outcomes)
    }

    /// The names of the nodes registered with the plane.
    pub fn members(&self) -> anyhow::Result<Vec<String>> {
        let _membership = self.membership.write().unwrap();
        let out = self.kubectl([
            "get",
            "nodes",
            "-o",
            "custom-columns=name:metadata.name",
            "--no-headers",
        ])?;
        Ok(lines(&out.stdout))
    }

    /// Drains a node and deletes it from the plane.
    pub fn remove_member(&self, name: &str) -> anyhow::Result<()> {
        let _membership = self.membership.write().unwrap();
        let drained = self.kubectl_unchecked([
            "drain",
            name,
            "--ignore-daemonsets",
            "--delete-local-data",
            "--force",
        ])?;
        if !drained.success() {
            warn!(node = %name, stderr = %drained.stderr, "Drain failed; deleting anyway");
        }
        self.kubectl(["delete", "node", name])?;
        Ok(())
    }

    /// Writes cluster state and pod logs under `dest/kubernetes`. Failures
    /// are logged and skipped.
    pub fn gather_logs(&self, dest: &Utf8Path) -> anyhow::Result<()> {
        let dir = dest.join("kubernetes");
        let pod_dir = dir.join("pod_logs");
        std::fs::create_dir_all(&pod_dir)
            .with_context(|| format!("creating {pod_dir}"))?;
        info!(%dir, "Gathering Kubernetes logs");

        self.save_output(dir.join("get_all.txt"), &["get", "all", "--all-namespaces"]);
        for kind in [
            "configmaps",
            "endpoints",
            "events",
            "limitranges",
            "namespaces",
            "nodes",
            "persistentvolumes",
            "persistentvolumeclaims",
            "pods",
            "podtemplates",
            "replicationcontrollers",
            "resourcequotas",
            "services",
            "serviceaccounts",
        ] {
            self.save_output(
                dir.join(format!("{kind}.json")),
                &["get", kind, "--all-namespaces", "-o", "json"],
            );
        }

        let pods = self.kubectl_unchecked([
            "get",
            "pods",
            "--all-namespaces",
            "-o",
            "custom-columns=ns:metadata.namespace,name:metadata.name",
            "--no-headers",
        ])?;
        for line in pods.stdout.lines() {
            let Some((namespace, pod)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let pod = pod.trim();
            self.save_output(
                pod_dir.join(format!("{pod}.txt")),
                &["-n", namespace, "logs", pod, "--all-containers"],
            );
            self.save_output(
                pod_dir.join(format!("describe_{pod}.txt")),
                &["-n", namespace, "describe", "pod", pod],
            );
        }
        Ok(())
    }

    fn save_output(&self, file: Utf8PathBuf, args: &[&str]) {
        match self.kubectl_unchecked(args.iter().copied()) {
            Ok(out) if out.success() => {
                if let Err(e) = std::fs::write(&file, out.stdout) {
                    warn!(%file, error = %e, "Unable to write log file");
                }
            }
            Ok(out) => warn!(?args, stderr = %out.stderr, "Unable to gather"),
            Err(e) => warn!(?args, error = %e, "Unable to gather"),
        }
    }
}

fn lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::execute::ExecOutput;
    use crate::hardware::fake::FakeProvider;
    use crate::poll::PollPolicy;
    use crate::testing::ScriptedRunner;
    use crate::workspace::tests::scripted_workspace;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records what it is asked to do; joins always succeed.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingBootstrapper {
        pub installs: AtomicUsize,
        pub joins: AtomicUsize,
    }

    impl Bootstrapper for Arc<RecordingBootstrapper> {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn install_packages(&self, _hardware: &Hardware) -> anyhow::Result<()> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn bootstrap(
            &self,
            hardware: &Hardware,
            _leader: &Node,
        ) -> anyhow::Result<ClusterAccess> {
            Ok(ClusterAccess {
                kubeconfig: hardware.workspace().working_dir().join("kubeconfig"),
                kubectl: "kubectl".into(),
            })
        }

        fn finalize(&self, _plane: &OrchestrationPlane) -> anyhow::Result<()> {
            Ok(())
        }

        fn join(&self, _plane: &OrchestrationPlane, _node: &Node) -> anyhow::Result<()> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn test_config() -> HarnessConfig {
        HarnessConfig {
            worker_initial_data_disks: 0,
            timeouts: Timeouts::uniform(PollPolicy::new(3, Duration::ZERO)),
            ..Default::default()
        }
    }

    /// Every node reports Ready and has an active kubelet unless a test
    /// overrides it.
    pub(crate) fn script_ready_cluster(runner: &ScriptedRunner) {
        runner.on_stdout("get node ", "node   Ready   <none>   1m   v1.17.4");
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        plane: OrchestrationPlane,
        runner: Arc<ScriptedRunner>,
        bootstrapper: Arc<RecordingBootstrapper>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (ws, runner) = scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        script_ready_cluster(&runner);
        let config = test_config();
        let hardware = Hardware::with_provider(
            &config,
            Arc::new(ws),
            Box::new(FakeProvider::default()),
        )
        .unwrap();
        hardware.boot_nodes(1, 2, 0).unwrap();

        let bootstrapper = Arc::new(RecordingBootstrapper::default());
        let plane = OrchestrationPlane::bootstrap(
            &config,
            Arc::new(hardware),
            Box::new(bootstrapper.clone()),
        )
        .unwrap();
        Fixture { _dir: dir, plane, runner, bootstrapper }
    }

    #[test]
    fn bootstrap_installs_once_and_waits_for_the_leader() {
        let f = fixture();
        assert_eq!(f.bootstrapper.installs.load(Ordering::SeqCst), 1);
        let leader = f.plane.leader().name().to_owned();
        assert!(leader.ends_with("-master-0"));
        assert_eq!(f.runner.count(&format!("get node {leader} --no-headers")), 1);
    }

    #[test]
    fn bootstrap_times_out_when_the_leader_never_gets_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, runner) = scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        runner.on_stdout("get node ", "node   NotReady   <none>   1m   v1.17.4");
        let config = test_config();
        let hardware = Hardware::with_provider(
            &config,
            Arc::new(ws),
            Box::new(FakeProvider::default()),
        )
        .unwrap();
        hardware.boot_nodes(1, 0, 0).unwrap();

        let err = OrchestrationPlane::bootstrap(
            &config,
            Arc::new(hardware),
            Box::new(Arc::new(RecordingBootstrapper::default())),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("to be Ready"));
    }

    #[test]
    fn join_skips_nodes_with_an_active_kubelet() {
        let f = fixture();
        let worker = f.plane.hardware().workers()[0].clone();

        let checks = AtomicUsize::new(0);
        let checks = Arc::new(checks);
        let seen = checks.clone();
        f.runner.on("systemctl is-active --quiet kubelet", move |_| {
            // Inactive until the first join has happened.
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                ExecOutput::failed(1, "")
            } else {
                ExecOutput::ok("")
            }
        });

        assert_eq!(f.plane.join(&worker).unwrap(), JoinOutcome::Joined);
        assert_eq!(f.plane.join(&worker).unwrap(), JoinOutcome::AlreadyMember);
        assert_eq!(f.bootstrapper.joins.load(Ordering::SeqCst), 1);
        assert_eq!(checks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn join_all_aggregates_failures() {
        let f = fixture();
        f.runner.on_failure("systemctl is-active --quiet kubelet", 1, "");
        let workers = f.plane.hardware().workers();
        let failing = workers[1].name().to_owned();
        f.runner.on_stdout(&format!("get node {failing} "), "x   NotReady");

        let err = f.plane.join_all(&workers).unwrap_err();
        match err.downcast_ref::<PlaneError>() {
            Some(PlaneError::JoinFailed { nodes }) => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].0, failing);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(f.bootstrapper.joins.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pod_waits_count_running_pods() {
        let f = fixture();
        f.runner.on_stdout(
            "get pod -l app=rook-ceph-mds",
            "mds-a   1/1   Running   0   1m\nmds-b   0/1   Pending   0   1m\n",
        );
        assert!(f.plane.wait_for_pods_by_app_label("rook-ceph-mds", 1, ROOK_NAMESPACE).is_ok());
        let err = f
            .plane
            .wait_for_pods_by_app_label("rook-ceph-mds", 2, ROOK_NAMESPACE)
            .unwrap_err();
        assert!(format!("{err:#}").contains("2 running pods"));
    }

    #[test]
    fn pod_commands_target_the_first_labelled_pod() {
        let f = fixture();
        f.runner.on_stdout(
            "get pod -l app=rook-ceph-tools --output",
            "rook-ceph-tools-1\nrook-ceph-tools-2\n",
        );
        f.plane
            .execute_in_pod_by_label("ceph health", "rook-ceph-tools", ROOK_NAMESPACE)
            .unwrap();
        assert_eq!(
            f.runner.count("-n rook-ceph exec -t rook-ceph-tools-1 -- bash -c ceph health"),
            1
        );
    }

    #[test]
    fn logs_are_gathered_per_pod() {
        let f = fixture();
        f.runner.on_stdout(
            "custom-columns=ns:metadata.namespace",
            "kube-system   coredns-1\nrook-ceph   rook-ceph-operator-2\n",
        );
        let out = tempfile::tempdir().unwrap();
        let dest = Utf8Path::from_path(out.path()).unwrap();
        f.plane.gather_logs(dest).unwrap();

        assert!(dest.join("kubernetes/get_all.txt").exists());
        assert!(dest.join("kubernetes/pods.json").exists());
        assert!(dest.join("kubernetes/pod_logs/rook-ceph-operator-2.txt").exists());
        assert_eq!(f.runner.count("-n kube-system describe pod coredns-1"), 1);
    }
}
