// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rook/Ceph on top of an [`OrchestrationPlane`].
//!
//! Getting the storage cluster up happens in three steps, each of which
//! consumes the previous step's output:
//!
//! 1. [`StorageSource::build`] produces a [`BuiltArtifact`]. It only needs the
//!    workspace, so it can run on a [`BuildHandle`] worker while hardware is
//!    still booting.
//! 2. [`StorageSource::preinstall`] turns it into a [`PreparedArtifact`] once
//!    the plane exists (images uploaded, manifests rewritten).
//! 3. [`StorageCluster::install`] applies the manifests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::{Receiver, TryRecvError};
use regex::Regex;
use tracing::{info, info_span, instrument, warn};

use crate::config::{Distro, HarnessConfig, Timeouts};
use crate::execute::ExecOutput;
use crate::kubernetes::{OrchestrationPlane, ROOK_NAMESPACE};
use crate::poll::{wait_for_decoded, RegexCount};
use crate::workspace::Workspace;

pub mod upstream;
pub mod vendor;

const TOOLBOX_LABEL: &str = "rook-ceph-tools";
const FILESYSTEM: &str = "myfs";

/// A container image built during this run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltImage {
    /// The reference manifests should use, e.g. `rook/ceph:v1.3.1-cephcheck`.
    pub reference: String,
    /// `docker save` output, gzipped.
    pub archive: Utf8PathBuf,
}

/// The output of a storage build: where the manifests will be and, when built
/// from source, the operator image.
#[derive(Clone, Debug)]
pub struct BuiltArtifact {
    manifests: Utf8PathBuf,
    image: Option<BuiltImage>,
}

impl BuiltArtifact {
    pub(crate) fn new(manifests: Utf8PathBuf, image: Option<BuiltImage>) -> Self {
        Self { manifests, image }
    }

    pub fn manifests(&self) -> &Utf8Path {
        &self.manifests
    }

    pub fn image(&self) -> Option<&BuiltImage> {
        self.image.as_ref()
    }
}

/// Manifests that are ready to apply to the plane.
#[derive(Clone, Debug)]
pub struct PreparedArtifact {
    manifests: Utf8PathBuf,
}

impl PreparedArtifact {
    pub(crate) fn new(manifests: Utf8PathBuf) -> Self {
        Self { manifests }
    }

    pub fn manifests(&self) -> &Utf8Path {
        &self.manifests
    }
}

/// Where Rook's manifests and images come from.
pub trait StorageSource: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Fetches and, if configured, compiles Rook. Must not touch nodes.
    fn build(&self, workspace: &Workspace) -> anyhow::Result<BuiltArtifact>;

    /// Makes the built artifact usable on the plane's nodes.
    fn preinstall(
        &self,
        plane: &OrchestrationPlane,
        built: BuiltArtifact,
    ) -> anyhow::Result<PreparedArtifact>;
}

/// Upstream Rook for openSUSE clusters, the vendor packaging for SLES.
pub fn source_for(config: &HarnessConfig) -> anyhow::Result<Arc<dyn StorageSource>> {
    Ok(match config.distro {
        Distro::OpensuseK8s => Arc::new(upstream::Upstream::new(&config.upstream_rook)),
        Distro::SlesCaasp => Arc::new(vendor::Vendor::new(
            config.ses.selected()?.clone(),
            &config.node_image_user,
        )),
    })
}

enum BuildState {
    Running {
        rx: Receiver<anyhow::Result<BuiltArtifact>>,
        thread: JoinHandle<()>,
    },
    Deferred {
        source: Arc<dyn StorageSource>,
        workspace: Arc<Workspace>,
    },
    Finished(BuiltArtifact),
    Failed,
}

/// A storage build that is either running on its own thread or deferred until
/// its result is needed.
pub struct BuildHandle {
    state: BuildState,
}

impl fmt::Debug for BuildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            BuildState::Running { .. } => "running",
            BuildState::Deferred { .. } => "deferred",
            BuildState::Finished(_) => "finished",
            BuildState::Failed => "failed",
        };
        f.debug_struct("BuildHandle").field("state", &state).finish()
    }
}

impl BuildHandle {
    /// Starts `source`'s build on a dedicated thread.
    pub fn spawn(
        source: Arc<dyn StorageSource>,
        workspace: Arc<Workspace>,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name("storage-build".to_owned())
            .spawn(move || {
                let _span = info_span!("storage_build", source = source.name()).entered();
                info!("Starting storage build");
                let result = source.build(&workspace);
                match &result {
                    Ok(built) => info!(manifests = %built.manifests(), "Storage build finished"),
                    Err(e) => warn!(error = ?e, "Storage build failed"),
                }
                // The receiver is gone only if the run was abandoned.
                let _ = tx.send(result);
            })
            .context("spawning storage build thread")?;
        Ok(Self { state: BuildState::Running { rx, thread } })
    }

    /// Records the build to be run on the caller's thread by [`Self::wait`].
    pub fn deferred(source: Arc<dyn StorageSource>, workspace: Arc<Workspace>) -> Self {
        Self { state: BuildState::Deferred { source, workspace } }
    }

    /// Spawns the build if `threaded`, defers it otherwise.
    pub fn start(
        threaded: bool,
        source: Arc<dyn StorageSource>,
        workspace: Arc<Workspace>,
    ) -> anyhow::Result<Self> {
        if threaded {
            Self::spawn(source, workspace)
        } else {
            Ok(Self::deferred(source, workspace))
        }
    }

    /// Reports a build that has already failed without waiting for one that
    /// is still running.
    pub fn check(&mut self) -> anyhow::Result<()> {
        let BuildState::Running { rx, .. } = &self.state else {
            return match self.state {
                BuildState::Failed => bail!("storage build already failed"),
                _ => Ok(()),
            };
        };

        let received = match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => {
                Err(anyhow::anyhow!("storage build exited without a result"))
            }
        };
        let finished = std::mem::replace(&mut self.state, BuildState::Failed);
        if let BuildState::Running { thread, .. } = finished {
            let _ = thread.join();
        }
        match received {
            Ok(built) => {
                self.state = BuildState::Finished(built);
                Ok(())
            }
            Err(e) => Err(e.context("storage build failed")),
        }
    }

    /// Blocks until the build is done and returns its artifact.
    pub fn wait(mut self) -> anyhow::Result<BuiltArtifact> {
        match std::mem::replace(&mut self.state, BuildState::Failed) {
            BuildState::Running { rx, thread } => {
                info!("Waiting for storage build");
                let result = rx
                    .recv()
                    .context("storage build exited without a result")?;
                if thread.join().is_err() {
                    bail!("storage build thread panicked");
                }
                result.context("storage build failed")
            }
            BuildState::Deferred { source, workspace } => {
                let _span = info_span!("storage_build", source = source.name()).entered();
                source.build(&workspace).context("storage build failed")
            }
            BuildState::Finished(built) => Ok(built),
            BuildState::Failed => bail!("storage build already failed"),
        }
    }
}

impl Drop for BuildHandle {
    /// A running build holds the workspace, so an abandoned handle joins it
    /// before the workspace can be torn down.
    fn drop(&mut self) {
        if let BuildState::Running { thread, .. } =
            std::mem::replace(&mut self.state, BuildState::Failed)
        {
            info!("Waiting for the abandoned storage build to stop");
            if thread.join().is_err() {
                warn!("storage build thread panicked");
            }
        }
    }
}

/// A Rook operator installed on the plane.
#[derive(Debug)]
pub struct StorageCluster {
    plane: Arc<OrchestrationPlane>,
    manifests: Utf8PathBuf,
    timeouts: Timeouts,
    toolbox_pod: Mutex<Option<String>>,
}

impl StorageCluster {
    /// Applies the operator and cluster manifests and waits for an OSD
    /// prepare job to complete on every worker.
    #[instrument(skip_all, fields(manifests = %prepared.manifests()))]
    pub fn install(
        plane: Arc<OrchestrationPlane>,
        prepared: PreparedArtifact,
    ) -> anyhow::Result<Self> {
        let timeouts = *plane.timeouts();
        let cluster = Self {
            plane,
            manifests: prepared.manifests,
            timeouts,
            toolbox_pod: Mutex::new(None),
        };
        cluster.install_operator()?;
        Ok(cluster)
    }

    fn install_operator(&self) -> anyhow::Result<()> {
        let crds = self.manifests.join("crds.yaml");
        if crds.exists() {
            self.apply("crds.yaml")?;
        }
        self.apply("common.yaml")?;
        self.apply("operator.yaml")?;

        info!("Waiting for the operator");
        self.plane.wait_for_pods_by_app_label("rook-ceph-operator", 1, ROOK_NAMESPACE)?;

        self.apply("cluster.yaml")?;
        self.apply("toolbox.yaml")?;
        self.apply("csi/rbd/storageclass.yaml")?;

        let workers = self.plane.hardware().workers().len();
        info!(workers, "Waiting for OSD prepare jobs; this may take a while");
        self.wait_for_pod_listing(
            self.timeouts.osd_prepare,
            r".*rook-ceph-osd-prepare.*Completed",
            workers,
        )?;

        info!("Waiting for the Ceph toolbox");
        self.plane.wait_for_pods_by_app_label(TOOLBOX_LABEL, 1, ROOK_NAMESPACE)?;
        Ok(())
    }

    pub fn plane(&self) -> &Arc<OrchestrationPlane> {
        &self.plane
    }

    pub fn manifests(&self) -> &Utf8Path {
        &self.manifests
    }

    fn apply(&self, manifest: &str) -> anyhow::Result<()> {
        let path = self.manifests.join(manifest);
        self.plane.kubectl_apply(path.as_str())?;
        Ok(())
    }

    fn wait_for_pod_listing(
        &self,
        policy: crate::poll::PollPolicy,
        pattern: &str,
        count: usize,
    ) -> anyhow::Result<String> {
        let matcher = RegexCount::at_least(Regex::new(pattern)?, count);
        Ok(wait_for_decoded(
            policy,
            &format!("{count} pods matching {pattern}"),
            || self.plane.kubectl(["--namespace", ROOK_NAMESPACE, "get", "pods"]),
            |out| out.stdout,
            &matcher,
        )?)
    }

    /// Polls `ceph health` until the cluster reports `HEALTH_OK`.
    #[instrument(skip_all)]
    pub fn wait_for_health(&self) -> anyhow::Result<String> {
        let ok = RegexCount::any(Regex::new("HEALTH_OK")?);
        let status = wait_for_decoded(
            self.timeouts.health,
            "ceph to report HEALTH_OK",
            || self.execute_in_ceph_toolbox("ceph health"),
            |out| out.stdout,
            &ok,
        )?;
        info!(status = %status.trim(), "Ceph is healthy");
        Ok(status)
    }

    /// Runs a command in the toolbox pod, found on first use.
    pub fn execute_in_ceph_toolbox(&self, command: &str) -> anyhow::Result<ExecOutput> {
        let pod = {
            let mut cached = self.toolbox_pod.lock().unwrap();
            match &*cached {
                Some(pod) => pod.clone(),
                None => {
                    let pods = self.plane.get_pods_by_app_label(TOOLBOX_LABEL, ROOK_NAMESPACE)?;
                    let pod = pods
                        .into_iter()
                        .next()
                        .context("the Ceph toolbox pod is not running")?;
                    *cached = Some(pod.clone());
                    pod
                }
            }
        };
        self.plane.execute_in_pod(command, &pod, ROOK_NAMESPACE)
    }

    pub fn get_number_of_osds(&self) -> anyhow::Result<usize> {
        let osds = self.plane.get_pods_by_app_label("rook-ceph-osd", ROOK_NAMESPACE)?;
        info!(count = osds.len(), "Counted OSD pods");
        Ok(osds.len())
    }

    /// Creates the replicated pool the RBD storage class provisions from.
    pub fn deploy_rbd(&self) -> anyhow::Result<()> {
        self.apply("pool.yaml")?;
        let pool = RegexCount::any(Regex::new(r"(?m)^replicapool$")?);
        wait_for_decoded(
            self.timeouts.pods,
            "the RBD pool",
            || self.execute_in_ceph_toolbox("ceph osd pool ls"),
            |out| out.stdout,
            &pool,
        )?;
        Ok(())
    }

    /// Creates the `myfs` filesystem and waits for it to go active.
    pub fn deploy_filesystem(&self) -> anyhow::Result<()> {
        self.apply("filesystem.yaml")?;

        info!("Waiting for 2 MDS daemons");
        self.wait_for_pod_listing(
            self.timeouts.mds,
            &format!(r".*rook-ceph-mds-{FILESYSTEM}.*Running"),
            2,
        )?;

        info!("Waiting for {FILESYSTEM} to be active");
        let active = RegexCount::any(Regex::new(r".*active")?);
        wait_for_decoded(
            self.timeouts.mds,
            &format!("filesystem {FILESYSTEM} to be active"),
            || self.execute_in_ceph_toolbox(&format!("ceph fs status {FILESYSTEM}")),
            |out| out.stdout,
            &active,
        )?;
        Ok(())
    }
}

/// Replaces every occurrence of each key with its value in the text files
/// under `dir`. The original of each changed file is kept next to it with a
/// `.back` suffix. Returns the number of files changed.
pub fn recursive_replace(
    dir: &Utf8Path,
    replacements: &BTreeMap<String, String>,
) -> anyhow::Result<usize> {
    let mut changed = 0;
    for entry in dir.read_dir_utf8().with_context(|| format!("reading {dir}"))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            changed += recursive_replace(path, replacements)?;
            continue;
        }
        if path.extension() == Some("back") {
            continue;
        }

        let Ok(original) = std::fs::read_to_string(path) else {
            continue;
        };
        let updated = replacements
            .iter()
            .fold(original.clone(), |text, (from, to)| text.replace(from.as_str(), to));
        if updated == original {
            continue;
        }

        let backup = Utf8PathBuf::from(format!("{path}.back"));
        std::fs::rename(path, &backup)
            .with_context(|| format!("backing up {path}"))?;
        std::fs::write(path, updated).with_context(|| format!("rewriting {path}"))?;
        changed += 1;
    }
    Ok(changed)
}
