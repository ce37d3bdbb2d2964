// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use cephcheck_framework::config::{Distro, ProviderKind};
use cephcheck_framework::HarnessConfig;
use clap::{Args, Parser, Subcommand};
use tracing::info;

const DEFAULT_CONFIG: &str = "cephcheck.toml";

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bring up a cluster and run the post-bring-up checks against it.
    Run(RunOptions),

    /// List the checks a run would execute.
    List(ListOptions),

    /// Delete OpenStack resources leaked by earlier runs.
    Sweep(SweepOptions),
}

/// Runtime configuration options for the runner.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// The harness configuration file. A missing file is only an error if
    /// it was named explicitly.
    #[clap(long, value_parser)]
    pub config: Option<Utf8PathBuf>,

    /// Suppress emission of terminal control codes in the runner's log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,

    /// Also write logs to this file.
    #[clap(long, value_parser)]
    pub log_file: Option<Utf8PathBuf>,
}

/// Settings that take precedence over the configuration file.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Where to provision nodes: openstack, libvirt or aws_ec2.
    #[clap(long)]
    pub provider: Option<ProviderKind>,

    /// The node OS and Kubernetes flavor: opensuse_k8s or sles_caasp.
    #[clap(long)]
    pub distro: Option<Distro>,

    #[clap(long)]
    pub masters: Option<usize>,

    #[clap(long)]
    pub workers: Option<usize>,

    /// Leave the workspace directory behind for inspection.
    #[clap(long)]
    pub keep_workspace: bool,

    /// Leave the provisioned nodes running.
    #[clap(long)]
    pub keep_cluster: bool,

    /// Write cluster state and pod logs here before teardown.
    #[clap(long, value_parser)]
    pub gather_logs_dir: Option<Utf8PathBuf>,
}

impl Overrides {
    pub fn apply(&self, config: &mut HarnessConfig) {
        if let Some(provider) = self.provider {
            config.provider = provider;
        }
        if let Some(distro) = self.distro {
            config.distro = distro;
        }
        if let Some(masters) = self.masters {
            config.masters = masters;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.keep_workspace {
            config.remove_workspace = false;
        }
        if self.keep_cluster {
            config.tear_down_cluster = false;
        }
        if let Some(dir) = &self.gather_logs_dir {
            config.gather_logs_dir = Some(dir.clone());
        }
    }
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct RunOptions {
    #[clap(flatten)]
    pub overrides: Overrides,

    /// Stop once the cluster is healthy without running any checks.
    #[clap(long)]
    pub bring_up_only: bool,

    /// Only run checks whose names contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub include_filter: Vec<String>,

    /// Only run checks whose names do not contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub exclude_filter: Vec<String>,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct ListOptions {
    /// Only list checks whose names contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub include_filter: Vec<String>,

    /// Only list checks whose names do not contain this string.
    /// Can be specified multiple times.
    #[clap(long, value_parser)]
    pub exclude_filter: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SweepOptions {
    /// A glob matched against resource names.
    #[clap(long, default_value = "cephcheck*")]
    pub search: String,

    /// Only list what would be deleted.
    #[clap(long)]
    pub dry_run: bool,

    /// Delete without asking for confirmation.
    #[clap(long, short = 'y')]
    pub yes: bool,
}

impl ProcessArgs {
    /// Reads the configuration file (if any) and applies `overrides`.
    pub fn load_config(&self, overrides: &Overrides) -> anyhow::Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::from_toml_path(path)?,
            None if Utf8Path::new(DEFAULT_CONFIG).exists() => {
                HarnessConfig::from_toml_path(Utf8Path::new(DEFAULT_CONFIG))?
            }
            None => {
                info!("No {DEFAULT_CONFIG} found, using defaults");
                HarnessConfig::default()
            }
        };
        overrides.apply(&mut config);
        config.validate().context("validating configuration")?;
        Ok(config)
    }
}

/// A copy of `config` that is safe to log.
pub fn masked(config: &HarnessConfig) -> HarnessConfig {
    let mut masked = config.clone();
    if masked.openstack.password.is_some() {
        masked.openstack.password = Some("********".into());
    }
    masked
}
