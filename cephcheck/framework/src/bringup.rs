// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The staged bring-up of a complete test environment.
//!
//! [`BringUp::run`] walks the [`Stage`]s in order. The storage build is
//! started before any hardware exists and is only waited for once the
//! plane's nodes have joined. Whatever was created is owned by the returned
//! [`Environment`] (or, on failure, by the one dropped inside `run`), whose
//! drop gathers logs and tears everything down in reverse order.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::config::HarnessConfig;
use crate::hardware::provider::Provider;
use crate::hardware::Hardware;
use crate::kubernetes::{bootstrapper_for, Bootstrapper, OrchestrationPlane};
use crate::storage::{source_for, BuildHandle, StorageCluster, StorageSource};
use crate::workspace::Workspace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    HardwareReady,
    PlaneBootstrapped,
    NodesJoined,
    ArtifactReady,
    OperatorInstalled,
    Healthy,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::HardwareReady,
        Stage::PlaneBootstrapped,
        Stage::NodesJoined,
        Stage::ArtifactReady,
        Stage::OperatorInstalled,
        Stage::Healthy,
    ];

    /// The stage a run starting from `current` may move to next.
    pub fn after(current: Option<Stage>) -> Option<Stage> {
        match current {
            None => Some(Stage::HardwareReady),
            Some(stage) => {
                let index = Self::ALL.iter().position(|s| *s == stage)?;
                Self::ALL.get(index + 1).copied()
            }
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::HardwareReady => "hardware ready",
            Stage::PlaneBootstrapped => "plane bootstrapped",
            Stage::NodesJoined => "nodes joined",
            Stage::ArtifactReady => "artifact ready",
            Stage::OperatorInstalled => "operator installed",
            Stage::Healthy => "healthy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(
        "cannot move from {} to {to}",
        .from.map_or_else(|| "the start".to_owned(), |s| s.to_string())
    )]
    OutOfOrder { from: Option<Stage>, to: Stage },

    #[error("interrupted before reaching {0}")]
    Interrupted(Stage),
}

/// Records which stages have been reached, and when.
#[derive(Debug)]
pub struct Progress {
    started: Instant,
    reached: Vec<(Stage, Duration)>,
}

impl Default for Progress {
    fn default() -> Self {
        Self { started: Instant::now(), reached: Vec::new() }
    }
}

impl Progress {
    pub fn current(&self) -> Option<Stage> {
        self.reached.last().map(|(stage, _)| *stage)
    }

    /// Moves to `to`, which must be the immediate successor of the current
    /// stage.
    pub fn advance(&mut self, to: Stage) -> Result<(), StageError> {
        let from = self.current();
        if Stage::after(from) != Some(to) {
            return Err(StageError::OutOfOrder { from, to });
        }
        let elapsed = self.started.elapsed();
        info!(stage = %to, elapsed = ?elapsed, "Reached stage");
        self.reached.push((to, elapsed));
        Ok(())
    }

    pub fn reached(&self) -> impl Iterator<Item = Stage> + '_ {
        self.reached.iter().map(|(stage, _)| *stage)
    }

    /// Each reached stage with the time since the run started.
    pub fn timings(&self) -> &[(Stage, Duration)] {
        &self.reached
    }
}

/// Everything a bring-up created. Dropping it gathers logs (if configured)
/// and then releases the storage cluster, the plane, the hardware and the
/// workspace in that order.
pub struct Environment {
    gather_logs_dir: Option<camino::Utf8PathBuf>,
    progress: Progress,

    // Fields drop in declaration order.
    storage: Option<StorageCluster>,
    plane: Option<Arc<OrchestrationPlane>>,
    hardware: Option<Arc<Hardware>>,
    workspace: Arc<Workspace>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("workspace", &self.workspace.name())
            .field("stage", &self.progress.current())
            .finish_non_exhaustive()
    }
}

impl Environment {
    fn new(config: &HarnessConfig, workspace: Arc<Workspace>) -> Self {
        Self {
            gather_logs_dir: config.gather_logs_dir.clone(),
            progress: Progress::default(),
            storage: None,
            plane: None,
            hardware: None,
            workspace,
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn hardware(&self) -> anyhow::Result<&Arc<Hardware>> {
        self.hardware.as_ref().context("hardware was never brought up")
    }

    pub fn plane(&self) -> anyhow::Result<&Arc<OrchestrationPlane>> {
        self.plane.as_ref().context("the orchestration plane was never bootstrapped")
    }

    pub fn storage(&self) -> anyhow::Result<&StorageCluster> {
        self.storage.as_ref().context("the storage cluster was never installed")
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let _span = info_span!("teardown", workspace = %self.workspace.name()).entered();
        if let (Some(dir), Some(plane)) = (&self.gather_logs_dir, &self.plane) {
            if let Err(e) = plane.gather_logs(dir) {
                warn!(error = ?e, "Gathering logs failed");
            }
        }
        info!(stage = ?self.progress.current(), "Tearing down environment");
    }
}

/// Drives one bring-up. Backends default to the ones the configuration
/// selects; each can be replaced before [`BringUp::run`].
pub struct BringUp<'a> {
    config: &'a HarnessConfig,
    workspace: Option<Arc<Workspace>>,
    provider: Option<Box<dyn Provider>>,
    bootstrapper: Option<Box<dyn Bootstrapper>>,
    source: Option<Arc<dyn StorageSource>>,
    interrupted: Arc<AtomicBool>,
}

impl<'a> BringUp<'a> {
    pub fn new(config: &'a HarnessConfig) -> Self {
        Self {
            config,
            workspace: None,
            provider: None,
            bootstrapper: None,
            source: None,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn workspace(mut self, workspace: Arc<Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn provider(mut self, provider: Box<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn bootstrapper(mut self, bootstrapper: Box<dyn Bootstrapper>) -> Self {
        self.bootstrapper = Some(bootstrapper);
        self
    }

    pub fn source(mut self, source: Arc<dyn StorageSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// A flag that, once set, stops the run at the next stage boundary.
    pub fn interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    pub fn run(self) -> anyhow::Result<Environment> {
        let BringUp { config, workspace, provider, bootstrapper, source, interrupted } = self;
        let checkpoint = |next: Stage| -> Result<(), StageError> {
            if interrupted.load(Ordering::SeqCst) {
                warn!(%next, "Interrupted");
                return Err(StageError::Interrupted(next));
            }
            Ok(())
        };

        let workspace = match workspace {
            Some(ws) => ws,
            None => Arc::new(Workspace::new(config)?),
        };
        let _span = info_span!("bring_up", workspace = %workspace.name()).entered();
        let mut env = Environment::new(config, workspace.clone());

        let source = match source {
            Some(source) => source,
            None => source_for(config)?,
        };
        let mut build = BuildHandle::start(config.use_threads, source.clone(), workspace.clone())?;

        checkpoint(Stage::HardwareReady)?;
        let hardware = {
            let _span = info_span!("stage", stage = %Stage::HardwareReady).entered();
            let hardware = Arc::new(match provider {
                Some(provider) => Hardware::with_provider(config, workspace.clone(), provider)?,
                None => Hardware::new(config, workspace.clone())?,
            });
            env.hardware = Some(hardware.clone());
            hardware.boot_nodes(config.masters, config.workers, 0)?;
            hardware.prepare_nodes(&[])?;
            hardware
        };
        env.progress.advance(Stage::HardwareReady)?;
        build.check()?;

        checkpoint(Stage::PlaneBootstrapped)?;
        let bootstrapper = match bootstrapper {
            Some(bootstrapper) => bootstrapper,
            None => bootstrapper_for(config),
        };
        let plane = Arc::new(OrchestrationPlane::bootstrap(config, hardware.clone(), bootstrapper)?);
        env.plane = Some(plane.clone());
        env.progress.advance(Stage::PlaneBootstrapped)?;
        build.check()?;

        checkpoint(Stage::NodesJoined)?;
        let followers: Vec<_> = hardware
            .nodes()
            .into_iter()
            .filter(|n| n.name() != plane.leader().name())
            .collect();
        plane.join_all(&followers)?;
        env.progress.advance(Stage::NodesJoined)?;

        checkpoint(Stage::ArtifactReady)?;
        let built = build.wait()?;
        let prepared = source.preinstall(&plane, built).context("preparing storage artifact")?;
        env.progress.advance(Stage::ArtifactReady)?;

        checkpoint(Stage::OperatorInstalled)?;
        env.storage = Some(StorageCluster::install(plane.clone(), prepared)?);
        env.progress.advance(Stage::OperatorInstalled)?;

        checkpoint(Stage::Healthy)?;
        env.storage()?.wait_for_health()?;
        env.progress.advance(Stage::Healthy)?;

        Ok(env)
    }
}
