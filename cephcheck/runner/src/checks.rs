// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks run against a cluster once it is healthy. They share the cluster
//! and run in order; the later ones grow it.

use anyhow::Context;
use camino::Utf8Path;
use cephcheck_framework::hardware::{Hardware, NodeRole, DEFAULT_DISK_SIZE_GB};
use cephcheck_framework::kubernetes::ROOK_NAMESPACE;
use cephcheck_framework::poll::{wait_for_result, Equals};
use cephcheck_framework::storage::StorageCluster;
use cephcheck_framework::Environment;
use serde::Deserialize as _;
use tracing::info;

/// How a check ended.
#[derive(Debug)]
pub enum CheckOutcome {
    Passed,
    Failed(Option<String>),
    Skipped(Option<String>),
}

/// A named check over some context `C`.
pub struct Check<C> {
    pub name: &'static str,
    pub body: fn(&C) -> anyhow::Result<CheckOutcome>,
}

impl<C> Check<C> {
    pub fn run(&self, ctx: &C) -> CheckOutcome {
        match (self.body)(ctx) {
            Ok(outcome) => outcome,
            Err(e) => CheckOutcome::Failed(Some(format!("{e:#}"))),
        }
    }
}

pub const ALL: &[Check<Environment>] = &[
    Check { name: "storage::osd_count_matches_disks", body: osd_count_matches_disks },
    Check { name: "cluster::mon_count_matches_manifest", body: mon_count_matches_manifest },
    Check { name: "cluster::core_services_published", body: core_services_published },
    Check { name: "storage::added_disk_becomes_osd", body: added_disk_becomes_osd },
    Check { name: "cluster::added_worker_joins", body: added_worker_joins },
    Check { name: "storage::filesystem_deploys", body: filesystem_deploys },
];

const CORE_SERVICES: &[&str] = &[
    "csi-cephfsplugin-metrics",
    "csi-rbdplugin-metrics",
    "rook-ceph-mgr",
    "rook-ceph-mgr-dashboard",
];

/// Rook creates one OSD per attached data disk on a worker.
fn attached_worker_disks(hardware: &Hardware) -> usize {
    hardware
        .workers()
        .iter()
        .map(|w| w.disks().iter().filter(|d| w.device_name(d).is_some()).count())
        .sum()
}

fn wait_for_osds(storage: &StorageCluster, expected: usize) -> anyhow::Result<()> {
    let policy = storage.plane().timeouts().osd_prepare;
    wait_for_result(
        policy,
        &format!("{expected} OSD pods"),
        || storage.get_number_of_osds(),
        &Equals(expected),
    )?;
    Ok(())
}

fn osd_count_matches_disks(env: &Environment) -> anyhow::Result<CheckOutcome> {
    let expected = attached_worker_disks(env.hardware()?);
    if expected == 0 {
        return Ok(CheckOutcome::Skipped(Some("no data disks attached".into())));
    }
    wait_for_osds(env.storage()?, expected)?;
    Ok(CheckOutcome::Passed)
}

/// Reads `spec.mon.count` from the CephCluster in a manifest.
fn configured_mons(manifest: &str) -> anyhow::Result<usize> {
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value["kind"].as_str() != Some("CephCluster") {
            continue;
        }
        let count = &value["spec"]["mon"]["count"];
        // Quoted counts appear in some manifests.
        let count = count
            .as_u64()
            .or_else(|| count.as_str().and_then(|s| s.parse().ok()))
            .context("CephCluster has no spec.mon.count")?;
        return Ok(usize::try_from(count)?);
    }
    anyhow::bail!("no CephCluster in manifest")
}

fn read_manifest(dir: &Utf8Path, name: &str) -> anyhow::Result<String> {
    let path = dir.join(name);
    std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))
}

fn mon_count_matches_manifest(env: &Environment) -> anyhow::Result<CheckOutcome> {
    let storage = env.storage()?;
    let expected = configured_mons(&read_manifest(storage.manifests(), "cluster.yaml")?)?;
    info!(expected, "Counting monitors");

    let plane = storage.plane();
    let services = plane.get_services_by_app_label("rook-ceph-mon", ROOK_NAMESPACE)?;
    if services.len() != expected {
        return Ok(CheckOutcome::Failed(Some(format!(
            "expected {expected} mon services but found {}",
            services.len()
        ))));
    }
    let pods = plane.get_pods_by_app_label("rook-ceph-mon", ROOK_NAMESPACE)?;
    if pods.len() != expected {
        return Ok(CheckOutcome::Failed(Some(format!(
            "expected {expected} mon pods but found {}",
            pods.len()
        ))));
    }
    Ok(CheckOutcome::Passed)
}

fn core_services_published(env: &Environment) -> anyhow::Result<CheckOutcome> {
    let plane = env.plane()?;
    for service in CORE_SERVICES {
        plane.wait_for_service(service, ROOK_NAMESPACE)?;
    }
    Ok(CheckOutcome::Passed)
}

fn added_disk_becomes_osd(env: &Environment) -> anyhow::Result<CheckOutcome> {
    let hardware = env.hardware()?;
    let storage = env.storage()?;
    let Some(worker) = hardware.workers().into_iter().next() else {
        return Ok(CheckOutcome::Skipped(Some("no workers".into())));
    };

    let before = storage.get_number_of_osds()?;
    let disk = worker.disk_create(DEFAULT_DISK_SIZE_GB)?;
    worker.disk_attach(&disk)?;
    wait_for_osds(storage, before + 1)?;
    Ok(CheckOutcome::Passed)
}

fn added_worker_joins(env: &Environment) -> anyhow::Result<CheckOutcome> {
    let hardware = env.hardware()?;
    let plane = env.plane()?;
    let storage = env.storage()?;

    let offset = hardware.workers().len();
    let added = hardware.boot_nodes(0, 1, offset)?;
    for node in &added {
        if node.role() == NodeRole::Worker && node.disks().is_empty() {
            let disk = node.disk_create(DEFAULT_DISK_SIZE_GB)?;
            node.disk_attach(&disk)?;
        }
    }
    hardware.prepare_nodes(&added)?;
    plane.install_packages()?;
    for node in &added {
        plane.join(node)?;
    }

    let members = plane.members()?;
    if let Some(missing) = added.iter().find(|n| !members.iter().any(|m| m == n.name())) {
        return Ok(CheckOutcome::Failed(Some(format!(
            "{} is not a cluster member",
            missing.name()
        ))));
    }

    wait_for_osds(storage, attached_worker_disks(hardware))?;
    Ok(CheckOutcome::Passed)
}

fn filesystem_deploys(env: &Environment) -> anyhow::Result<CheckOutcome> {
    let storage = env.storage()?;
    storage.deploy_rbd()?;
    storage.deploy_filesystem()?;
    Ok(CheckOutcome::Passed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mon_count_comes_from_the_ceph_cluster_document() {
        let manifest = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: unrelated
---
apiVersion: ceph.rook.io/v1
kind: CephCluster
metadata:
  name: rook-ceph
spec:
  mon:
    count: 3
    allowMultiplePerNode: false
";
        assert_eq!(configured_mons(manifest).unwrap(), 3);
    }

    #[test]
    fn quoted_mon_count_is_accepted() {
        let manifest = "kind: CephCluster\nspec:\n  mon:\n    count: \"5\"\n";
        assert_eq!(configured_mons(manifest).unwrap(), 5);
    }

    #[test]
    fn manifest_without_a_cluster_is_an_error() {
        assert!(configured_mons("kind: Namespace\n").is_err());
        assert!(configured_mons("kind: CephCluster\nspec: {}\n").is_err());
    }

    #[test]
    fn check_names_are_unique() {
        let mut names: Vec<_> = ALL.iter().map(|c| c.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL.len());
    }

    #[test]
    fn errors_become_failures() {
        let check: Check<()> = Check { name: "t", body: |_| anyhow::bail!("no toolbox") };
        match check.run(&()) {
            CheckOutcome::Failed(Some(msg)) => assert_eq!(msg, "no toolbox"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
