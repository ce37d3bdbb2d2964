// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioned infrastructure for one run.
//!
//! [`Hardware`] owns the run's nodes and the resources they share (network,
//! security group, keypair registration). It talks to the infrastructure
//! through a [`Provider`] selected once from the configuration, so nothing
//! above this module knows which backend is in use.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::Value;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use crate::config::{HarnessConfig, ProviderKind};
use crate::execute::Exec;
use crate::inventory::{Inventory, InventoryHost, PlaybookRun, PlaybookSummary};
use crate::poll::{wait_for_result, PollPolicy};
use crate::workspace::Workspace;

pub mod aws;
pub mod libvirt;
mod node;
pub mod openstack;
pub mod provider;

#[cfg(test)]
pub(crate) mod fake;

pub use node::{Node, DEFAULT_DISK_SIZE_GB};
use node::{create_node, NodeSettings};
pub use provider::{
    Capabilities, Connection, ListFilter, Provider, ProviderError, Resource,
    ResourceKind, ResourceSpec, ResourceState,
};

/// Carried by every leader.
pub const TAG_MASTER: &str = "master";
/// Carried by the one leader that initializes the control plane.
pub const TAG_FIRST_MASTER: &str = "first_master";
pub const TAG_WORKER: &str = "worker";

/// The baseline playbook every node is prepared with.
pub const NODE_BASE_PLAYBOOK: &str = "playbook_node_base.yml";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Master,
    Worker,
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("a node named {0} already exists")]
    NodeExists(String),

    #[error("no node named {0}")]
    NodeNotFound(String),

    #[error("failed to boot nodes: {}", .nodes.iter().map(|(n, e)| format!("{n}: {e:#}")).collect::<Vec<_>>().join("; "))]
    BootFailed { nodes: Vec<(String, anyhow::Error)> },

    #[error("failed to destroy: {}", .failures.join("; "))]
    DestroyFailed { failures: Vec<String> },
}

/// What [`wait_until_state`] waits for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expectation {
    State(ResourceState),
    AnyOf(Vec<ResourceState>),
    /// Listed, in any state.
    Exists,
    /// No longer listed.
    Absent,
}

impl Expectation {
    fn accepts(&self, found: Option<&Resource>) -> bool {
        match (self, found) {
            (Expectation::Absent, found) => found.is_none(),
            (_, None) => false,
            (Expectation::Exists, Some(_)) => true,
            (Expectation::State(state), Some(r)) => r.state == *state,
            (Expectation::AnyOf(states), Some(r)) => states.contains(&r.state),
        }
    }
}

/// Polls `conn`'s list call until `resource` meets `expectation`. Returns
/// the resource as last listed, or `None` once it is absent.
pub fn wait_until_state(
    conn: &mut dyn Connection,
    resource: &Resource,
    expectation: &Expectation,
    policy: PollPolicy,
) -> anyhow::Result<Option<Resource>> {
    let filter = if resource.id.is_empty() {
        ListFilter::Name(resource.name.clone())
    } else {
        ListFilter::Id(resource.id.clone())
    };

    let found = wait_for_result(
        policy,
        &format!("{resource} to be {expectation:?}"),
        || {
            let listed = conn.list(resource.kind, &filter)?;
            Ok(listed.into_iter().find(|r| filter.accepts(r)))
        },
        &|found: &Option<Resource>| expectation.accepts(found.as_ref()),
    )?;

    Ok(found)
}

/// Selects the backend named by the configuration.
pub fn provider_for(
    config: &HarnessConfig,
    workspace: &Arc<Workspace>,
) -> anyhow::Result<Box<dyn Provider>> {
    Ok(match config.provider {
        ProviderKind::Openstack => {
            Box::new(openstack::OpenStackProvider::new(config, workspace)?)
        }
        ProviderKind::Libvirt => {
            Box::new(libvirt::LibvirtProvider::new(config, workspace.clone())?)
        }
        ProviderKind::AwsEc2 => {
            Box::new(aws::AwsProvider::new(config, workspace.clone())?)
        }
    })
}

/// Names, roles and tags for a batch of nodes.
pub fn plan_nodes(
    workspace: &str,
    masters: usize,
    workers: usize,
    offset: usize,
) -> Vec<(String, NodeRole, Vec<String>)> {
    let mut plan = Vec::with_capacity(masters + workers);
    for i in 0..masters {
        let mut tags = vec![TAG_MASTER.to_owned()];
        if i == 0 && offset == 0 {
            tags.push(TAG_FIRST_MASTER.to_owned());
        }
        plan.push((format!("{workspace}-master-{}", i + offset), NodeRole::Master, tags));
    }
    for i in 0..workers {
        plan.push((
            format!("{workspace}-worker-{}", i + offset),
            NodeRole::Worker,
            vec![TAG_WORKER.to_owned()],
        ));
    }
    plan
}

pub struct Hardware {
    workspace: Arc<Workspace>,
    provider: Box<dyn Provider>,
    node_settings: NodeSettings,
    playbook_dir: Utf8PathBuf,
    extra_vars: Option<String>,
    tear_down: bool,

    /// Shared resources in creation order.
    shared: Mutex<Vec<Resource>>,

    /// Guards both the node map and the inventory derived from it.
    registry: Mutex<BTreeMap<String, Arc<Node>>>,
    inventory: Inventory,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware")
            .field("provider", &self.provider)
            .field("nodes", &self.registry.lock().unwrap().keys())
            .finish_non_exhaustive()
    }
}

impl Hardware {
    /// Connects to the configured backend and creates the run's shared
    /// resources.
    pub fn new(config: &HarnessConfig, workspace: Arc<Workspace>) -> anyhow::Result<Self> {
        let provider = provider_for(config, &workspace)?;
        Self::with_provider(config, workspace, provider)
    }

    pub fn with_provider(
        config: &HarnessConfig,
        workspace: Arc<Workspace>,
        provider: Box<dyn Provider>,
    ) -> anyhow::Result<Self> {
        let _span = info_span!("hardware", provider = ?provider.kind()).entered();
        let inventory = Inventory::new(workspace.working_dir().join("inventory"));
        let node_settings = NodeSettings {
            user: config.node_image_user.clone(),
            initial_data_disks: config.worker_initial_data_disks,
            node_state: config.timeouts.node_state,
            ssh_ready: config.timeouts.ssh_ready,
            capabilities: provider.capabilities(),
        };

        let specs = provider.shared_resources();
        let mut conn = provider.connect()?;

        // Constructed before anything is created so that a failure below
        // tears down whatever was created so far.
        let hardware = Self {
            workspace,
            provider,
            node_settings,
            playbook_dir: config.playbook_dir.clone(),
            extra_vars: config.ansible_extra_vars.clone(),
            tear_down: config.tear_down_cluster,
            shared: Mutex::new(Vec::new()),
            registry: Mutex::new(BTreeMap::new()),
            inventory,
            destroyed: AtomicBool::new(false),
        };

        for spec in specs {
            let resource = conn
                .create(&spec)
                .with_context(|| format!("creating shared {}", spec.kind()))?;
            info!(%resource, "Created shared resource");
            hardware.shared.lock().unwrap().push(resource);
        }

        let registry = hardware.registry.lock().unwrap();
        hardware.write_inventory(&registry)?;
        drop(registry);
        Ok(hardware)
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Opens a new provider API handle for the caller's exclusive use.
    pub fn get_connection(&self) -> anyhow::Result<Box<dyn Connection>> {
        self.provider.connect()
    }

    pub fn inventory_dir(&self) -> &Utf8Path {
        self.inventory.dir()
    }

    /// How many times the inventory has been regenerated.
    pub fn inventory_generation(&self) -> u64 {
        self.inventory.generation()
    }

    fn write_inventory(&self, nodes: &BTreeMap<String, Arc<Node>>) -> anyhow::Result<()> {
        let hosts: Vec<InventoryHost> =
            nodes.values().map(|n| n.inventory_host()).collect();
        let mut common = BTreeMap::new();
        common.insert("workspace_name".to_owned(), Value::from(self.workspace.name()));
        common.insert(
            "workspace_dir".to_owned(),
            Value::from(self.workspace.working_dir().as_str()),
        );
        common.insert("public_key".to_owned(), Value::from(self.workspace.public_key()));
        self.inventory.regenerate(&common, &hosts)
    }

    /// Provisions one node and waits until it is reachable. The node is not
    /// registered; see [`Hardware::node_add`].
    pub fn node_create(
        &self,
        name: &str,
        role: NodeRole,
        tags: Vec<String>,
    ) -> anyhow::Result<Arc<Node>> {
        if self.registry.lock().unwrap().contains_key(name) {
            return Err(HardwareError::NodeExists(name.to_owned()).into());
        }

        let conn = self.provider.connect()?;
        let node = create_node(
            conn,
            self.workspace.clone(),
            self.node_settings.clone(),
            name,
            role,
            tags,
        )?;
        Ok(Arc::new(node))
    }

    /// Registers a node and regenerates the inventory.
    pub fn node_add(&self, node: Arc<Node>) -> anyhow::Result<()> {
        // Addresses get recycled between runs; a stale host key would
        // otherwise break the first connection.
        if let Err(e) = self.workspace.execute(
            Exec::new("ssh-keygen")
                .arg("-R")
                .arg(node.ssh_ip().to_string())
                .check(false)
                .quiet(),
        ) {
            debug!(node = %node.name(), error = ?e, "Could not clear the old host key");
        }

        let mut registry = self.registry.lock().unwrap();
        if registry.contains_key(node.name()) {
            return Err(HardwareError::NodeExists(node.name().to_owned()).into());
        }

        info!(node = %node.name(), address = %node.ssh_ip(), "Adding node");
        registry.insert(node.name().to_owned(), node.clone());
        if let Err(e) = self.write_inventory(&registry) {
            registry.remove(node.name());
            return Err(e);
        }
        Ok(())
    }

    /// Deregisters a node, regenerates the inventory and destroys the node.
    pub fn node_remove(&self, name: &str) -> anyhow::Result<()> {
        let node = {
            let mut registry = self.registry.lock().unwrap();
            let node = registry
                .remove(name)
                .ok_or_else(|| HardwareError::NodeNotFound(name.to_owned()))?;
            self.write_inventory(&registry)?;
            node
        };

        info!(node = %name, "Removing node");
        node.destroy()
    }

    /// Creates and registers a batch of nodes concurrently, one thread and
    /// one provider handle per node.
    pub fn boot_nodes(
        &self,
        masters: usize,
        workers: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<Arc<Node>>> {
        let plan = plan_nodes(self.workspace.name(), masters, workers, offset);
        let _span = info_span!("boot_nodes", masters, workers, offset).entered();
        info!(count = plan.len(), "Booting nodes");

        let results: Vec<(String, anyhow::Result<Arc<Node>>)> =
            std::thread::scope(|s| {
                let handles: Vec<_> = plan
                    .into_iter()
                    .map(|(name, role, tags)| {
                        let handle = s.spawn({
                            let name = name.clone();
                            move || -> anyhow::Result<Arc<Node>> {
                                let node = self.node_create(&name, role, tags)?;
                                if let Err(e) = self.node_add(node.clone()) {
                                    // Nothing else holds the node yet.
                                    if let Err(destroy) = node.destroy() {
                                        warn!(
                                            node = %name,
                                            error = ?destroy,
                                            "Releasing unregistered node failed"
                                        );
                                    }
                                    return Err(e);
                                }
                                Ok(node)
                            }
                        });
                        (name, handle)
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|(name, handle)| {
                        let result = handle.join().unwrap_or_else(|_| {
                            Err(anyhow::anyhow!("node worker panicked"))
                        });
                        (name, result)
                    })
                    .collect()
            });

        let mut booted = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(node) => booted.push(node),
                Err(e) => {
                    error!(node = %name, error = ?e, "Node failed to boot");
                    failed.push((name, e));
                }
            }
        }

        if !failed.is_empty() {
            return Err(HardwareError::BootFailed { nodes: failed }.into());
        }

        Ok(booted)
    }

    /// Runs a playbook from the configured playbook directory against all
    /// nodes, or only `limit` if it is non-empty.
    pub fn run_playbook(
        &self,
        playbook: &str,
        limit: &[Arc<Node>],
        extra_vars: Option<serde_json::Value>,
    ) -> anyhow::Result<PlaybookSummary> {
        let path = self.playbook_dir.join(playbook);
        let mut run = PlaybookRun::new(&path, self.inventory.dir());
        run.limit = limit.iter().map(|n| n.name().to_owned()).collect();
        run.extra_vars = extra_vars;
        run.raw_extra_vars = self.extra_vars.as_deref();

        // The inventory must not change under a running playbook.
        let _registry = self.registry.lock().unwrap();
        run.run(&self.workspace)
    }

    /// Brings nodes to the baseline OS state.
    pub fn prepare_nodes(&self, limit: &[Arc<Node>]) -> anyhow::Result<()> {
        let _span = info_span!("prepare_nodes").entered();
        self.run_playbook(NODE_BASE_PLAYBOOK, limit, None)?;
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.registry.lock().unwrap().get(name).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.registry.lock().unwrap().values().cloned().collect()
    }

    pub fn masters(&self) -> Vec<Arc<Node>> {
        self.nodes().into_iter().filter(|n| n.role() == NodeRole::Master).collect()
    }

    pub fn workers(&self) -> Vec<Arc<Node>> {
        self.nodes().into_iter().filter(|n| n.role() == NodeRole::Worker).collect()
    }

    /// The leader that initializes the control plane.
    pub fn first_master(&self) -> anyhow::Result<Arc<Node>> {
        self.nodes()
            .into_iter()
            .find(|n| n.has_tag(TAG_FIRST_MASTER))
            .context("no node is tagged first_master")
    }

    pub fn shared_resources(&self) -> Vec<Resource> {
        self.shared.lock().unwrap().clone()
    }

    /// Tears down every node and shared resource, or with `skip` only logs
    /// what would be left behind. Only the first call has any effect.
    pub fn destroy(&self, skip: bool) -> anyhow::Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _span = info_span!("destroy_hardware").entered();

        if skip {
            for node in self.nodes() {
                warn!(node = %node.name(), address = %node.ssh_ip(), "Leaving node in place");
            }
            for resource in self.shared_resources() {
                warn!(%resource, "Leaving shared resource in place");
            }
            return Ok(());
        }

        let mut failures = Vec::new();
        let names: Vec<String> =
            self.registry.lock().unwrap().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.node_remove(&name) {
                failures.push(format!("{e:#}"));
            }
        }

        let shared: Vec<Resource> = std::mem::take(&mut *self.shared.lock().unwrap());
        if !shared.is_empty() {
            match self.provider.connect() {
                Ok(mut conn) => {
                    for resource in shared.iter().rev() {
                        match conn.delete(resource) {
                            Ok(()) => info!(%resource, "Deleted shared resource"),
                            Err(e) if provider::is_not_found(&e) => {}
                            Err(e) => failures.push(format!("{resource}: {e:#}")),
                        }
                    }
                }
                Err(e) => failures.push(format!("connecting for teardown: {e:#}")),
            }
        }

        if !failures.is_empty() {
            return Err(HardwareError::DestroyFailed { failures }.into());
        }

        info!("Hardware destroyed");
        Ok(())
    }
}

impl Drop for Hardware {
    fn drop(&mut self) {
        if let Err(e) = self.destroy(!self.tear_down) {
            error!(error = ?e, "Hardware teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeProvider, FakeState};
    use super::*;
    use crate::testing::ScriptedRunner;
    use crate::workspace::tests::scripted_workspace;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        hardware: Hardware,
        state: Arc<FakeState>,
        runner: Arc<ScriptedRunner>,
    }

    fn config() -> HarnessConfig {
        HarnessConfig {
            worker_initial_data_disks: 0,
            timeouts: crate::config::Timeouts::uniform(PollPolicy::new(
                5,
                Duration::ZERO,
            )),
            ..Default::default()
        }
    }

    fn fixture_with(config: HarnessConfig, provider: FakeProvider) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (ws, runner) = scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        let state = provider.state();
        let hardware =
            Hardware::with_provider(&config, Arc::new(ws), Box::new(provider))
                .unwrap();
        Fixture { _dir: dir, hardware, state, runner }
    }

    fn fixture() -> Fixture {
        fixture_with(config(), FakeProvider::default())
    }

    #[test]
    fn boot_names_roles_and_tags() {
        let f = fixture();
        let nodes = f.hardware.boot_nodes(1, 2, 0).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(f.hardware.nodes().len(), 3);

        let ws = f.hardware.workspace().name().to_owned();
        let count = |tag: &str| nodes.iter().filter(|n| n.has_tag(tag)).count();
        assert_eq!(count(TAG_FIRST_MASTER), 1);
        assert_eq!(count(TAG_MASTER), 1);
        assert_eq!(count(TAG_WORKER), 2);

        let first = f.hardware.first_master().unwrap();
        assert_eq!(first.name(), format!("{ws}-master-0"));
        assert!(first.has_tag(TAG_MASTER));
        assert!(f.hardware.node(&format!("{ws}-worker-1")).is_some());

        // Every boot used its own connection, plus one for construction.
        assert_eq!(f.state.connections(), 4);
    }

    #[test]
    fn later_batches_use_the_offset_and_no_first_master() {
        let f = fixture();
        f.hardware.boot_nodes(1, 1, 0).unwrap();
        let added = f.hardware.boot_nodes(0, 1, 1).unwrap();
        let ws = f.hardware.workspace().name();
        assert_eq!(added[0].name(), format!("{ws}-worker-1"));
        assert_eq!(
            f.hardware.nodes().iter().filter(|n| n.has_tag(TAG_FIRST_MASTER)).count(),
            1
        );
    }

    #[test]
    fn add_then_remove_restores_the_registry() {
        let f = fixture();
        f.hardware.boot_nodes(1, 1, 0).unwrap();
        let before: Vec<String> =
            f.hardware.nodes().iter().map(|n| n.name().to_owned()).collect();
        let generation = f.hardware.inventory_generation();

        let node = f
            .hardware
            .node_create("extra", NodeRole::Worker, vec![TAG_WORKER.into()])
            .unwrap();
        f.hardware.node_add(node).unwrap();
        f.hardware.node_remove("extra").unwrap();

        let after: Vec<String> =
            f.hardware.nodes().iter().map(|n| n.name().to_owned()).collect();
        assert_eq!(before, after);
        assert_eq!(f.hardware.inventory_generation(), generation + 2);
        assert_eq!(f.runner.count("ssh-keygen -R"), 3);
    }

    #[test]
    fn nodes_that_cannot_be_registered_are_released() {
        let f = fixture();
        let live = f.state.live();
        let generation = f.hardware.inventory_generation();

        // A file where the inventory directory should be makes every
        // regeneration fail.
        let inventory = f.hardware.inventory_dir().to_owned();
        std::fs::remove_dir_all(&inventory).unwrap();
        std::fs::write(&inventory, "").unwrap();

        let err = f.hardware.boot_nodes(0, 1, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HardwareError>(),
            Some(HardwareError::BootFailed { .. })
        ));
        assert!(f.hardware.nodes().is_empty());
        assert_eq!(f.hardware.inventory_generation(), generation);
        assert_eq!(f.state.live(), live);
    }

    #[test]
    fn stale_host_key_cleanup_is_best_effort() {
        let f = fixture();
        f.runner.on_failure("ssh-keygen -R", 255, "known_hosts is read-only");
        let node = f.hardware.node_create("k", NodeRole::Master, vec![]).unwrap();
        f.hardware.node_add(node).unwrap();
        assert_eq!(f.runner.count("ssh-keygen -R"), 1);
        assert!(f.hardware.node("k").is_some());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let f = fixture();
        let node = f.hardware.node_create("dup", NodeRole::Master, vec![]).unwrap();
        f.hardware.node_add(node).unwrap();

        let err = f.hardware.node_create("dup", NodeRole::Master, vec![]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HardwareError>(),
            Some(HardwareError::NodeExists(_))
        ));

        // A server of that name at the provider also counts.
        f.state.insert_server("ghost");
        assert!(f.hardware.node_create("ghost", NodeRole::Master, vec![]).is_err());
    }

    #[test]
    fn destroy_with_skip_deletes_nothing() {
        let f = fixture();
        f.hardware.boot_nodes(1, 2, 0).unwrap();
        f.hardware.destroy(true).unwrap();
        assert_eq!(f.state.deletes(), 0);

        // The first destroy wins; dropping does not tear down afterwards.
        drop(f.hardware);
        assert_eq!(f.state.deletes(), 0);
    }

    #[test]
    fn destroy_deletes_each_node_and_shared_resource_once() {
        let f = fixture();
        f.hardware.boot_nodes(1, 2, 0).unwrap();
        assert_eq!(f.hardware.shared_resources().len(), 2);

        f.hardware.destroy(false).unwrap();
        assert_eq!(f.state.deletes(), 3 + 2);
        assert!(f.hardware.nodes().is_empty());
        assert_eq!(f.state.live(), 0);

        drop(f.hardware);
        assert_eq!(f.state.deletes(), 5);
    }

    #[test]
    fn dropping_hardware_honors_the_teardown_setting() {
        let f = fixture_with(
            HarnessConfig { tear_down_cluster: false, ..config() },
            FakeProvider::default(),
        );
        f.hardware.boot_nodes(1, 0, 0).unwrap();
        let state = f.state.clone();
        drop(f.hardware);
        assert_eq!(state.deletes(), 0);
    }

    #[test]
    fn failed_shared_resource_creation_releases_earlier_ones() {
        let provider = FakeProvider::default();
        provider.state().fail_creates_of(ResourceKind::Keypair);
        let dir = tempfile::tempdir().unwrap();
        let (ws, _runner) = scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        let state = provider.state();

        let err =
            Hardware::with_provider(&config(), Arc::new(ws), Box::new(provider))
                .unwrap_err();
        assert!(format!("{err:#}").contains("keypair"));
        // The security group created first was deleted again.
        assert_eq!(state.deletes(), 1);
        assert_eq!(state.live(), 0);
    }

    #[test]
    fn failed_boots_are_aggregated_and_partial_nodes_released() {
        let provider = FakeProvider::default();
        let dir = tempfile::tempdir().unwrap();
        let (ws, runner) = scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        let state = provider.state();
        let ws_name = ws.name().to_owned();
        let hardware =
            Hardware::with_provider(&config(), Arc::new(ws), Box::new(provider))
                .unwrap();

        // Worker 1 never answers over ssh.
        let unreachable = super::fake::address_for(&format!("{ws_name}-worker-1"));
        runner.on_failure(&format!("@{unreachable} true"), 255, "timeout");

        let err = hardware.boot_nodes(1, 2, 0).unwrap_err();
        match err.downcast_ref::<HardwareError>() {
            Some(HardwareError::BootFailed { nodes }) => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].0, format!("{ws_name}-worker-1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(hardware.nodes().len(), 2);
        // The unreachable server was deleted by its provisioning guard.
        assert_eq!(state.deletes(), 1);
    }

    #[test]
    fn floating_ip_falls_back_to_a_spare_address() {
        let provider = FakeProvider::with_capabilities(Capabilities {
            floating_ips: true,
            synchronous_attach: false,
        });
        let state = provider.state();
        let f = fixture_with(config(), provider);

        state.insert_spare_floating_ip("172.24.4.50");
        state.fail_creates_of(ResourceKind::FloatingIp);
        let node = f.hardware.node_create("n", NodeRole::Master, vec![]).unwrap();
        assert_eq!(node.ssh_ip().to_string(), "172.24.4.50");

        // Without a spare, allocation failure is fatal.
        assert!(f.hardware.node_create("m", NodeRole::Master, vec![]).is_err());
    }

    #[test]
    fn reused_floating_ips_are_released_not_deleted() {
        let provider = FakeProvider::with_capabilities(Capabilities {
            floating_ips: true,
            synchronous_attach: false,
        });
        let state = provider.state();
        let f = fixture_with(config(), provider);
        let spare = state.insert_spare_floating_ip("172.24.4.50");
        state.fail_creates_of(ResourceKind::FloatingIp);

        // Provisioning fails after the spare was taken over.
        f.runner.on_failure("@172.24.4.50 true", 255, "timeout");
        assert!(f.hardware.node_create("n", NodeRole::Master, vec![]).is_err());
        assert_eq!(state.floating_ips(), [spare.clone()]);

        // A node that does come up hands the spare back on destroy.
        f.runner.on_stdout("@172.24.4.50 true", "");
        let node = f.hardware.node_create("n", NodeRole::Master, vec![]).unwrap();
        assert_eq!(state.floating_ips()[0].state, ResourceState::InUse);
        node.destroy().unwrap();
        assert_eq!(state.floating_ips(), [spare]);
        assert_eq!(state.live(), 1 + f.hardware.shared_resources().len());
    }

    #[test]
    fn worker_disks_are_created_attached_and_destroyed() {
        let f = fixture_with(
            HarnessConfig { worker_initial_data_disks: 2, ..config() },
            FakeProvider::default(),
        );
        let node = f.hardware.node_create("w", NodeRole::Worker, vec![]).unwrap();
        let disks = node.disks();
        assert_eq!(disks.len(), 2);
        for disk in &disks {
            assert!(disk.starts_with("w-volume-"));
            assert_eq!(disk.len(), "w-volume-".len() + 5);
            assert!(node.device_name(disk).unwrap().starts_with("/dev/vd"));
        }

        let extra = node.disk_create(DEFAULT_DISK_SIZE_GB).unwrap();
        assert_eq!(node.device_name(&extra), None);
        let device = node.disk_attach(&extra).unwrap();
        assert_eq!(node.disk_attach(&extra).unwrap(), device);
        node.disk_detach(&extra).unwrap();
        assert_eq!(node.device_name(&extra), None);

        node.destroy().unwrap();
        // Server plus three volumes, and a second destroy is a no-op.
        assert_eq!(f.state.deletes(), 4);
        node.destroy().unwrap();
        assert_eq!(f.state.deletes(), 4);
    }

    #[test]
    fn destroy_tolerates_resources_already_gone() {
        let f = fixture_with(
            HarnessConfig { worker_initial_data_disks: 1, ..config() },
            FakeProvider::default(),
        );
        let node = f.hardware.node_create("w", NodeRole::Worker, vec![]).unwrap();
        f.state.forget_volumes();
        node.destroy().unwrap();
    }

    #[test]
    fn state_waits_cover_every_expectation() {
        let f = fixture();
        let node = f.hardware.node_create("s", NodeRole::Master, vec![]).unwrap();
        let timeout = Duration::from_millis(50);
        let interval = Duration::from_millis(10);

        let found = node
            .wait_until_state(&Expectation::State(ResourceState::Running), timeout, interval)
            .unwrap();
        assert_eq!(found.unwrap().name, "s");
        node.wait_until_state(
            &Expectation::AnyOf(vec![ResourceState::Stopped, ResourceState::Running]),
            timeout,
            interval,
        )
        .unwrap();
        node.wait_until_state(&Expectation::Exists, timeout, interval).unwrap();
        assert!(node
            .wait_until_state(&Expectation::Absent, timeout, interval)
            .is_err());

        node.destroy().unwrap();
        assert!(node
            .wait_until_state(&Expectation::Absent, timeout, interval)
            .unwrap()
            .is_none());
        assert!(node
            .wait_until_state(&Expectation::Exists, timeout, interval)
            .is_err());
    }

    #[test]
    fn prepare_nodes_limits_the_playbook() {
        let f = fixture();
        let nodes = f.hardware.boot_nodes(1, 2, 0).unwrap();
        f.hardware.prepare_nodes(&nodes[1..2]).unwrap();

        let call = f
            .runner
            .invocations()
            .into_iter()
            .find(|c| c.starts_with("ansible-playbook"))
            .unwrap();
        assert!(call.contains(&format!("--limit {}", nodes[1].name())));
        assert!(call.ends_with(NODE_BASE_PLAYBOOK));
    }
}
