// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SSH command channel to a node.

use std::net::IpAddr;
use std::sync::OnceLock;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::execute::{Exec, ExecOutput};
use crate::poll::{wait_for_result, Equals, PollPolicy};
use crate::workspace::Workspace;

#[derive(Debug)]
pub struct RemoteShell {
    host: IpAddr,
    user: String,
    key: Utf8PathBuf,
    established: OnceLock<()>,
}

impl RemoteShell {
    pub fn new(host: IpAddr, user: &str, key: &Utf8Path) -> Self {
        Self {
            host,
            user: user.to_owned(),
            key: key.to_owned(),
            established: OnceLock::new(),
        }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// The `ssh` options every connection uses. Nodes are recreated with new
    /// host keys on every run, so host keys are never checked or recorded.
    pub fn ssh_options(&self) -> Vec<String> {
        [
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "ConnectTimeout=10",
            "-i",
            self.key.as_str(),
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn ssh(&self, command: &str) -> Exec {
        Exec::new("ssh")
            .args(self.ssh_options())
            .arg(self.destination())
            .arg(command)
    }

    /// Attempts a trivial command on the node, returning whether it ran.
    pub fn probe(&self, workspace: &Workspace) -> anyhow::Result<bool> {
        let out = workspace
            .execute(self.ssh("true").check(false).quiet())
            .context("running ssh")?;
        Ok(out.success())
    }

    /// Polls until the node accepts SSH connections.
    pub fn wait_ready(
        &self,
        workspace: &Workspace,
        policy: PollPolicy,
    ) -> anyhow::Result<()> {
        if self.established.get().is_some() {
            return Ok(());
        }

        info!(host = %self.host, user = %self.user, "Waiting for ssh");
        wait_for_result(
            policy,
            &format!("ssh on {}", self.destination()),
            || self.probe(workspace),
            &Equals(true),
        )?;
        let _ = self.established.set(());
        Ok(())
    }

    fn ensure_established(&self, workspace: &Workspace) -> anyhow::Result<()> {
        if self.established.get().is_some() {
            return Ok(());
        }

        anyhow::ensure!(
            self.probe(workspace)?,
            "cannot reach {} over ssh",
            self.destination()
        );
        debug!(host = %self.host, "ssh channel established");
        let _ = self.established.set(());
        Ok(())
    }

    /// Runs `command` through the node's login shell, failing if it exits
    /// non-zero.
    pub fn run(
        &self,
        workspace: &Workspace,
        command: &str,
    ) -> anyhow::Result<ExecOutput> {
        self.ensure_established(workspace)?;
        let out = workspace
            .execute(self.ssh(command).capture())
            .with_context(|| format!("running `{command}` on {}", self.host))?;
        Ok(out)
    }

    /// Runs `command` and returns its output whatever its exit status.
    pub fn run_unchecked(
        &self,
        workspace: &Workspace,
        command: &str,
    ) -> anyhow::Result<ExecOutput> {
        self.ensure_established(workspace)?;
        let out = workspace
            .execute(self.ssh(command).capture().check(false))
            .with_context(|| format!("running `{command}` on {}", self.host))?;
        Ok(out)
    }
}
