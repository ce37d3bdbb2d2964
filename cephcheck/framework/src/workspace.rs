// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-run scratch state.
//!
//! A [`Workspace`] owns the run's name, its scratch directory, the SSH
//! keypair every node trusts and an `ssh-agent` holding the private key.
//! Every external command the harness runs goes through
//! [`Workspace::execute`] so that it can reach nodes through the agent.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::execute::{
    run_checked, CommandError, CommandRunner, Exec, ExecOutput, HostRunner,
};
use crate::keys::SshKeyPair;

const PRIVATE_KEY_FILE: &str = "private.key";
const AGENT_SOCKET_FILE: &str = "ssh-agent.sock";

#[derive(Debug)]
struct AgentSession {
    socket: Utf8PathBuf,
    pid: u32,
}

#[derive(Debug)]
pub struct Workspace {
    name: String,
    working_dir: Utf8PathBuf,
    public_key: String,
    private_key: Utf8PathBuf,
    agent: Option<AgentSession>,
    remove_on_teardown: bool,
    runner: Arc<dyn CommandRunner>,
    torn_down: bool,
}

impl Workspace {
    pub fn new(config: &HarnessConfig) -> anyhow::Result<Self> {
        Self::with_runner(config, Arc::new(HostRunner))
    }

    /// Creates a workspace whose external commands run on `runner`.
    pub fn with_runner(
        config: &HarnessConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> anyhow::Result<Self> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}{}", config.cluster_prefix, &suffix[..8]);
        let working_dir = config.workspace_dir.join(&name);

        std::fs::create_dir_all(&config.workspace_dir).with_context(|| {
            format!("creating workspace parent {}", config.workspace_dir)
        })?;
        std::fs::create_dir(&working_dir)
            .with_context(|| format!("creating workspace {working_dir}"))?;

        // From here on, dropping `workspace` cleans up whatever exists.
        let mut workspace = Self {
            name,
            working_dir,
            public_key: String::new(),
            private_key: Utf8PathBuf::new(),
            agent: None,
            remove_on_teardown: config.remove_workspace,
            runner,
            torn_down: false,
        };

        let keys = SshKeyPair::generate()?;
        let private_key = workspace.working_dir.join(PRIVATE_KEY_FILE);
        keys.write_private(&private_key, &workspace.name)?;
        workspace.public_key = keys.public_openssh(&workspace.name);
        workspace.private_key = private_key;

        workspace.start_agent()?;
        info!(
            workspace = %workspace.name,
            dir = %workspace.working_dir,
            "Workspace created"
        );

        Ok(workspace)
    }

    fn start_agent(&mut self) -> anyhow::Result<()> {
        let socket = self.working_dir.join(AGENT_SOCKET_FILE);
        let out = run_checked(
            self.runner.as_ref(),
            &Exec::new("ssh-agent").arg("-a").arg(socket.as_str()).capture().quiet(),
        )
        .context("starting ssh-agent")?;

        let pid = parse_agent_pid(&out.stdout)?;
        self.agent = Some(AgentSession { socket, pid });
        info!(pid, "Started ssh-agent");

        self.execute(Exec::new("ssh-add").arg(self.private_key.as_str()))
            .context("loading the workspace key into ssh-agent")?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn working_dir(&self) -> &Utf8Path {
        &self.working_dir
    }

    /// The public key in `authorized_keys` format.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn private_key(&self) -> &Utf8Path {
        &self.private_key
    }

    /// The name the public key is registered under with providers.
    pub fn keypair_name(&self) -> String {
        format!("{}_key", self.name)
    }

    /// A subdirectory of the workspace, created on first use.
    pub fn subdir(&self, name: &str) -> anyhow::Result<Utf8PathBuf> {
        let dir = self.working_dir.join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating workspace directory {dir}"))?;
        Ok(dir)
    }

    pub fn bin_dir(&self) -> anyhow::Result<Utf8PathBuf> {
        self.subdir("bin")
    }

    pub fn build_dir(&self) -> anyhow::Result<Utf8PathBuf> {
        self.subdir("build")
    }

    pub fn tmp_dir(&self) -> anyhow::Result<Utf8PathBuf> {
        self.subdir("tmp")
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// The environment that lets a child process use the agent.
    pub fn agent_env(&self) -> Vec<(&'static str, String)> {
        match &self.agent {
            Some(agent) => vec![
                ("SSH_AUTH_SOCK", agent.socket.to_string()),
                ("SSH_AGENT_PID", agent.pid.to_string()),
            ],
            None => Vec::new(),
        }
    }

    /// Runs an external command with the agent's socket and pid in its
    /// environment.
    pub fn execute(&self, exec: Exec) -> Result<ExecOutput, CommandError> {
        let exec = self
            .agent_env()
            .into_iter()
            .fold(exec, |exec, (key, value)| exec.env(key, value));
        run_checked(self.runner.as_ref(), &exec)
    }

    /// Kills the agent and, if configured, removes the scratch directory.
    /// Runs at most once; later calls do nothing.
    pub fn teardown(&mut self) -> anyhow::Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        if self.agent.is_some() {
            let killed = self.execute(Exec::new("ssh-agent").arg("-k").quiet());
            self.agent = None;
            if let Err(e) = killed {
                warn!(error = %e, "Failed to stop ssh-agent");
            }
        }

        if self.remove_on_teardown {
            info!(dir = %self.working_dir, "Removing workspace");
            make_writable(&self.working_dir)?;
            std::fs::remove_dir_all(&self.working_dir).with_context(|| {
                format!("removing workspace {}", self.working_dir)
            })?;
        } else {
            info!(dir = %self.working_dir, "Keeping workspace");
        }

        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!(workspace = %self.name, error = ?e, "Workspace teardown failed");
        }
    }
}

/// Extracts the pid from `ssh-agent`'s Bourne shell output, e.g.
/// `SSH_AGENT_PID=1234; export SSH_AGENT_PID;`.
fn parse_agent_pid(output: &str) -> anyhow::Result<u32> {
    for statement in output.split([';', '\n']) {
        if let Some(pid) = statement.trim().strip_prefix("SSH_AGENT_PID=") {
            return pid
                .trim()
                .parse()
                .with_context(|| format!("invalid ssh-agent pid {pid:?}"));
        }
    }

    bail!("ssh-agent did not report a pid in {output:?}")
}

/// Adds owner write (and search, for directories) permission to everything
/// under `root` so it can be deleted.
fn make_writable(root: &Utf8Path) -> anyhow::Result<()> {
    let meta = match std::fs::symlink_metadata(root) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("inspecting {root}")),
    };
    if meta.file_type().is_symlink() {
        return Ok(());
    }

    let mut perms = meta.permissions();
    let extra = if meta.is_dir() { 0o700 } else { 0o200 };
    perms.set_mode(perms.mode() | extra);
    std::fs::set_permissions(root, perms)
        .with_context(|| format!("making {root} writable"))?;

    if meta.is_dir() {
        for entry in root.read_dir_utf8()? {
            make_writable(entry?.path())?;
        }
    }

    Ok(())
}
