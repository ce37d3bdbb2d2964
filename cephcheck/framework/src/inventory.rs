// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ansible inventory generation and playbook invocation.
//!
//! The inventory is a directory:
//!
//! ```text
//! inventory/
//!   group_vars/all/common.yml   workspace-wide variables
//!   nodes.yml                   hosts, grouped by tag
//! ```
//!
//! Playbooks run with the JSON stdout callback so the per-host `stats`
//! summary can be read back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::execute::Exec;
use crate::workspace::Workspace;

/// One host as it appears in the inventory.
#[derive(Clone, Debug)]
pub struct InventoryHost {
    pub name: String,
    pub tags: Vec<String>,
    pub vars: BTreeMap<String, Value>,
}

#[derive(Debug)]
pub struct Inventory {
    dir: Utf8PathBuf,
    generation: AtomicU64,
}

impl Inventory {
    pub fn new(dir: Utf8PathBuf) -> Self {
        Self { dir, generation: AtomicU64::new(0) }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// How many times the inventory has been written.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Replaces the inventory on disk with one describing `hosts`.
    pub fn regenerate<'a, I>(
        &self,
        common: &BTreeMap<String, Value>,
        hosts: I,
    ) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = &'a InventoryHost>,
    {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)
                .with_context(|| format!("removing old inventory {}", self.dir))?;
        }

        let group_vars = self.dir.join("group_vars").join("all");
        std::fs::create_dir_all(&group_vars)
            .with_context(|| format!("creating {group_vars}"))?;

        std::fs::write(
            group_vars.join("common.yml"),
            serde_yaml::to_string(common)?,
        )
        .context("writing inventory common.yml")?;

        std::fs::write(
            self.dir.join("nodes.yml"),
            serde_yaml::to_string(&render_hosts(hosts))?,
        )
        .context("writing inventory nodes.yml")?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(dir = %self.dir, generation, "Regenerated inventory");
        Ok(())
    }
}

fn render_hosts<'a>(hosts: impl IntoIterator<Item = &'a InventoryHost>) -> Value {
    let mut untagged = Mapping::new();
    let mut groups: BTreeMap<&str, Mapping> = BTreeMap::new();

    for host in hosts {
        let vars: Mapping = host
            .vars
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect();

        if host.tags.is_empty() {
            untagged.insert(host.name.as_str().into(), vars.into());
            continue;
        }

        for tag in &host.tags {
            groups
                .entry(tag.as_str())
                .or_default()
                .insert(host.name.as_str().into(), vars.clone().into());
        }
    }

    let children: Mapping = groups
        .into_iter()
        .map(|(tag, hosts)| {
            let mut group = Mapping::new();
            group.insert("hosts".into(), hosts.into());
            (Value::from(tag), Value::from(group))
        })
        .collect();

    let mut all = Mapping::new();
    all.insert("hosts".into(), untagged.into());
    all.insert("children".into(), children.into());

    let mut root = Mapping::new();
    root.insert("all".into(), all.into());
    root.into()
}

#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error(
        "playbook {playbook} failed on hosts {failed:?} \
         (unreachable: {unreachable:?})"
    )]
    HostsFailed { playbook: String, failed: Vec<String>, unreachable: Vec<String> },

    #[error("playbook {playbook} exited with {code:?}: {stderr}")]
    Aborted { playbook: String, code: Option<i32>, stderr: String },
}

/// The per-host outcome of a playbook run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaybookSummary {
    pub ok: Vec<String>,
    pub failed: Vec<String>,
    pub unreachable: Vec<String>,
}

#[derive(Deserialize)]
struct CallbackOutput {
    #[serde(default)]
    stats: BTreeMap<String, HostStats>,
}

#[derive(Deserialize)]
struct HostStats {
    #[serde(default)]
    failures: u64,
    #[serde(default)]
    unreachable: u64,
}

/// Reads the `stats` section of the JSON callback's output.
pub fn parse_summary(stdout: &str) -> anyhow::Result<PlaybookSummary> {
    let start = stdout
        .find('{')
        .context("playbook output contains no JSON document")?;
    let output: CallbackOutput = serde_json::from_str(&stdout[start..])
        .context("parsing playbook JSON output")?;

    let mut summary = PlaybookSummary::default();
    for (host, stats) in output.stats {
        if stats.unreachable > 0 {
            summary.unreachable.push(host);
        } else if stats.failures > 0 {
            summary.failed.push(host);
        } else {
            summary.ok.push(host);
        }
    }

    Ok(summary)
}

/// A request to run one playbook.
#[derive(Clone, Debug)]
pub struct PlaybookRun<'a> {
    pub playbook: &'a Utf8Path,
    pub inventory: &'a Utf8Path,
    pub limit: Vec<String>,
    pub extra_vars: Option<serde_json::Value>,
    pub raw_extra_vars: Option<&'a str>,
}

impl<'a> PlaybookRun<'a> {
    pub fn new(playbook: &'a Utf8Path, inventory: &'a Utf8Path) -> Self {
        Self {
            playbook,
            inventory,
            limit: Vec::new(),
            extra_vars: None,
            raw_extra_vars: None,
        }
    }

    fn exec(&self) -> Exec {
        let mut exec = Exec::new("ansible-playbook")
            .arg("-i")
            .arg(self.inventory.as_str());
        if !self.limit.is_empty() {
            exec = exec.arg("--limit").arg(self.limit.join(":"));
        }
        if let Some(vars) = &self.extra_vars {
            exec = exec.arg("--extra-vars").arg(vars.to_string());
        }
        if let Some(raw) = self.raw_extra_vars {
            exec = exec.arg("--extra-vars").arg(raw);
        }

        exec.arg(self.playbook.as_str())
            .env("ANSIBLE_STDOUT_CALLBACK", "json")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .capture()
            .check(false)
            .quiet()
    }

    /// Runs the playbook. Any failed or unreachable host fails the whole
    /// run.
    pub fn run(&self, workspace: &Workspace) -> anyhow::Result<PlaybookSummary> {
        let playbook = self.playbook.to_string();
        info!(%playbook, limit = ?self.limit, "Running playbook");

        let out = workspace.execute(self.exec())?;
        let summary = if out.stdout.trim().is_empty() {
            PlaybookSummary::default()
        } else {
            match parse_summary(&out.stdout) {
                Ok(summary) => summary,
                Err(e) if out.success() => {
                    warn!(%playbook, error = %e, "Could not read playbook summary");
                    PlaybookSummary::default()
                }
                Err(_) => {
                    return Err(PlaybookError::Aborted {
                        playbook,
                        code: out.code,
                        stderr: out.stderr,
                    }
                    .into())
                }
            }
        };

        if !summary.failed.is_empty() || !summary.unreachable.is_empty() {
            return Err(PlaybookError::HostsFailed {
                playbook,
                failed: summary.failed,
                unreachable: summary.unreachable,
            }
            .into());
        }

        if !out.success() {
            return Err(PlaybookError::Aborted {
                playbook,
                code: out.code,
                stderr: out.stderr,
            }
            .into());
        }

        info!(%playbook, hosts = summary.ok.len(), "Playbook succeeded");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::ExecOutput;
    use crate::workspace::tests::scripted_workspace;

    fn host(name: &str, tags: &[&str]) -> InventoryHost {
        let mut vars = BTreeMap::new();
        vars.insert("ansible_host".to_owned(), Value::from("10.0.0.1"));
        InventoryHost {
            name: name.to_owned(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            vars,
        }
    }

    #[test]
    fn hosts_are_grouped_by_tag() {
        let hosts = [
            host("m0", &["master", "first_master"]),
            host("w0", &["worker"]),
            host("loose", &[]),
        ];
        let doc = render_hosts(&hosts);

        let all = &doc["all"];
        assert!(all["hosts"]["loose"].is_mapping());
        assert_eq!(all["children"]["master"]["hosts"]["m0"]["ansible_host"], "10.0.0.1");
        assert!(all["children"]["first_master"]["hosts"]["m0"].is_mapping());
        assert!(all["children"]["worker"]["hosts"]["w0"].is_mapping());
        assert!(all["children"]["worker"]["hosts"].get("m0").is_none());
    }

    #[test]
    fn regeneration_rewrites_files_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("inventory");
        let inventory = Inventory::new(root.clone());
        let mut common = BTreeMap::new();
        common.insert("workspace".to_owned(), Value::from("ws"));

        inventory.regenerate(&common, &[host("a", &["worker"])]).unwrap();
        inventory.regenerate(&common, &[host("b", &["worker"])]).unwrap();
        assert_eq!(inventory.generation(), 2);

        let nodes = std::fs::read_to_string(root.join("nodes.yml")).unwrap();
        assert!(nodes.contains("b:"));
        assert!(!nodes.contains("a:"));
        let common =
            std::fs::read_to_string(root.join("group_vars/all/common.yml"))
                .unwrap();
        assert!(common.contains("workspace: ws"));
    }

    #[test]
    fn summary_separates_failed_and_unreachable_hosts() {
        let out = r#"[WARNING]: noise before the document
        {"plays": [], "stats": {
            "m0": {"ok": 10, "failures": 0, "unreachable": 0},
            "w0": {"ok": 3, "failures": 1, "unreachable": 0},
            "w1": {"ok": 0, "failures": 0, "unreachable": 1}
        }}"#;
        let summary = parse_summary(out).unwrap();
        assert_eq!(summary.ok, vec!["m0"]);
        assert_eq!(summary.failed, vec!["w0"]);
        assert_eq!(summary.unreachable, vec!["w1"]);
        assert!(parse_summary("PLAY RECAP").is_err());
    }

    #[test]
    fn any_failed_host_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, runner) =
            scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        runner.on("ansible-playbook", |_| ExecOutput {
            code: Some(2),
            stdout: r#"{"stats": {"a": {"failures": 0}, "b": {"failures": 2}}}"#
                .to_owned(),
            stderr: String::new(),
        });

        let playbook = Utf8PathBuf::from("assets/ansible/playbook_node_base.yml");
        let inventory = Utf8PathBuf::from("inventory");
        let mut run = PlaybookRun::new(&playbook, &inventory);
        run.limit = vec!["a".into(), "b".into()];
        run.extra_vars = Some(serde_json::json!({"k8s_version": "v1.17.4"}));

        let err = run.run(&ws).unwrap_err();
        match err.downcast_ref::<PlaybookError>() {
            Some(PlaybookError::HostsFailed { failed, unreachable, .. }) => {
                assert_eq!(failed, &vec!["b".to_owned()]);
                assert!(unreachable.is_empty());
            }
            other => panic!("unexpected error {other:?}"),
        }

        let call = runner
            .invocations()
            .into_iter()
            .find(|c| c.starts_with("ansible-playbook"))
            .unwrap();
        assert!(call.contains("--limit a:b"));
        assert!(call.contains(r#"--extra-vars {"k8s_version":"v1.17.4"}"#));
        assert!(call.ends_with("playbook_node_base.yml"));
    }

    #[test]
    fn clean_runs_return_the_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, runner) =
            scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        runner.on_stdout(
            "ansible-playbook",
            r#"{"stats": {"a": {"ok": 4, "failures": 0, "unreachable": 0}}}"#,
        );

        let playbook = Utf8PathBuf::from("site.yml");
        let inventory = Utf8PathBuf::from("inventory");
        let summary = PlaybookRun::new(&playbook, &inventory).run(&ws).unwrap();
        assert_eq!(summary.ok, vec!["a"]);
    }
}
