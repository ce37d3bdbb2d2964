// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nodes: provisioned compute instances and their volumes.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use rand::distributions::Uniform;
use rand::Rng;
use serde_yaml::Value;
use tracing::{debug, info, info_span, warn};

use super::provider::{
    is_not_found, Capabilities, Connection, ListFilter, Resource, ResourceKind,
    ResourceSpec, ResourceState,
};
use super::{wait_until_state, Expectation, NodeRole};
use crate::execute::ExecOutput;
use crate::inventory::InventoryHost;
use crate::poll::PollPolicy;
use crate::remote::RemoteShell;
use crate::workspace::Workspace;

/// Size of the data volumes created for new workers.
pub const DEFAULT_DISK_SIZE_GB: u32 = 10;

/// Serializes floating-address reuse so two nodes never claim the same
/// spare address.
static ADDRESS_REUSE_LOCK: Mutex<()> = Mutex::new(());

/// Per-run settings every node is created with.
#[derive(Clone, Debug)]
pub(crate) struct NodeSettings {
    pub user: String,
    pub initial_data_disks: usize,
    pub node_state: PollPolicy,
    pub ssh_ready: PollPolicy,
    pub capabilities: Capabilities,
}

#[derive(Debug)]
struct Disk {
    volume: Resource,
    device: Option<String>,
}

struct NodeInner {
    conn: Box<dyn Connection>,
    disks: BTreeMap<String, Disk>,
    destroyed: bool,
}

pub struct Node {
    name: String,
    role: NodeRole,
    tags: Vec<String>,
    server: Resource,
    floating_ip: Option<Resource>,
    /// The floating address was a spare this run did not allocate.
    floating_ip_reused: bool,
    shell: RemoteShell,
    workspace: Arc<Workspace>,
    settings: NodeSettings,
    inner: Mutex<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("tags", &self.tags)
            .field("address", &self.shell.host())
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// The address the harness reaches the node at.
    pub fn ssh_ip(&self) -> IpAddr {
        self.shell.host()
    }

    pub fn user(&self) -> &str {
        self.shell.user()
    }

    pub fn server(&self) -> &Resource {
        &self.server
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn inventory_host(&self) -> InventoryHost {
        let mut vars = BTreeMap::new();
        let mut set = |key: &str, value: Value| {
            vars.insert(key.to_owned(), value);
        };
        set("ansible_host", self.ssh_ip().to_string().into());
        set("ansible_user", self.user().into());
        set(
            "ansible_ssh_private_key_file",
            self.workspace.private_key().as_str().into(),
        );
        set("ansible_host_key_checking", false.into());
        set("ansible_ssh_host_key_checking", false.into());
        set("ansible_scp_extra_args", "-o StrictHostKeyChecking=no".into());
        set("ansible_ssh_extra_args", "-o StrictHostKeyChecking=no".into());
        set("ansible_python_interpreter", "/usr/bin/python3".into());
        let become_root = self.user() != "root";
        set("ansible_become", become_root.into());
        if become_root {
            set("ansible_become_method", "sudo".into());
            set("ansible_become_user", "root".into());
        }

        InventoryHost { name: self.name.clone(), tags: self.tags.clone(), vars }
    }

    /// Wraps `command` so it runs as root on this node.
    pub fn as_root(&self, command: &str) -> String {
        if self.user() == "root" {
            command.to_owned()
        } else {
            format!("sudo sh -c {}", shell_quote(command))
        }
    }

    /// Runs a command on the node over SSH, failing on a non-zero exit.
    pub fn execute(&self, command: &str) -> anyhow::Result<ExecOutput> {
        self.shell.run(&self.workspace, command)
    }

    pub fn execute_unchecked(&self, command: &str) -> anyhow::Result<ExecOutput> {
        self.shell.run_unchecked(&self.workspace, command)
    }

    /// Polls the provider until this node's server matches `expectation`.
    pub fn wait_until_state(
        &self,
        expectation: &Expectation,
        timeout: Duration,
        interval: Duration,
    ) -> anyhow::Result<Option<Resource>> {
        let mut inner = self.inner.lock().unwrap();
        wait_until_state(
            inner.conn.as_mut(),
            &self.server,
            expectation,
            PollPolicy::from_timeout(timeout, interval),
        )
    }

    /// Creates a volume for this node and returns its name.
    pub fn disk_create(&self, capacity_gb: u32) -> anyhow::Result<String> {
        let name = disk_name(&self.name);

        let mut inner = self.inner.lock().unwrap();
        let volume = inner
            .conn
            .create(&ResourceSpec::Volume { name: name.clone(), size_gb: capacity_gb })
            .with_context(|| format!("creating volume {name}"))?;
        inner
            .disks
            .insert(name.clone(), Disk { volume: volume.clone(), device: None });

        wait_until_state(
            inner.conn.as_mut(),
            &volume,
            &Expectation::State(ResourceState::Available),
            self.settings.node_state,
        )?;

        info!(node = %self.name, disk = %name, capacity_gb, "Created disk");
        Ok(name)
    }

    /// Attaches a disk created by [`Node::disk_create`] and returns its
    /// device path. Attaching an attached disk returns its current device.
    pub fn disk_attach(&self, name: &str) -> anyhow::Result<String> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let disk = inner
            .disks
            .get_mut(name)
            .with_context(|| format!("node {} has no disk {name}", self.name))?;
        if let Some(device) = &disk.device {
            return Ok(device.clone());
        }

        let device = inner.conn.attach_volume(&self.server, &disk.volume)?;
        if !self.settings.capabilities.synchronous_attach {
            wait_until_state(
                inner.conn.as_mut(),
                &disk.volume,
                &Expectation::State(ResourceState::InUse),
                self.settings.node_state,
            )?;
        }

        info!(node = %self.name, disk = %name, %device, "Attached disk");
        disk.device = Some(device.clone());
        Ok(device)
    }

    pub fn disk_detach(&self, name: &str) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let disk = inner
            .disks
            .get_mut(name)
            .with_context(|| format!("node {} has no disk {name}", self.name))?;
        if disk.device.is_none() {
            return Ok(());
        }

        inner.conn.detach_volume(&self.server, &disk.volume)?;
        if !self.settings.capabilities.synchronous_attach {
            wait_until_state(
                inner.conn.as_mut(),
                &disk.volume,
                &Expectation::State(ResourceState::Available),
                self.settings.node_state,
            )?;
        }

        info!(node = %self.name, disk = %name, "Detached disk");
        disk.device = None;
        Ok(())
    }

    /// The guest device a disk is attached as, if it is attached.
    pub fn device_name(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.disks.get(name).and_then(|d| d.device.clone())
    }

    pub fn disks(&self) -> Vec<String> {
        self.inner.lock().unwrap().disks.keys().cloned().collect()
    }

    /// Releases every provider resource the node holds. Resources that are
    /// already gone are skipped, and destroying twice is a no-op.
    pub fn destroy(&self) -> anyhow::Result<()> {
        let _span = info_span!("destroy_node", node = %self.name).entered();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.destroyed {
            return Ok(());
        }

        let mut failures = Vec::new();
        let conn = inner.conn.as_mut();
        let (reused, owned_ip) = match &self.floating_ip {
            Some(ip) if self.floating_ip_reused => (Some(ip), None),
            other => (None, other.as_ref()),
        };
        if let Some(address) = reused {
            release_tolerant(conn, address, &mut failures);
        }
        delete_tolerant(conn, &self.server, &mut failures);

        let dependents: Vec<&Resource> =
            inner.disks.values().map(|d| &d.volume).chain(owned_ip).collect();
        // Volumes and the run's network cannot be released while the
        // server still holds them.
        if let Err(e) = wait_until_state(
            conn,
            &self.server,
            &Expectation::Absent,
            self.settings.node_state,
        ) {
            warn!(error = %e, "Server is still listed after deletion");
        }
        for resource in dependents {
            delete_tolerant(conn, resource, &mut failures);
        }

        if !failures.is_empty() {
            bail!("failed to destroy node {}: {}", self.name, failures.join("; "));
        }

        inner.destroyed = true;
        info!("Node destroyed");
        Ok(())
    }
}

fn delete_tolerant(
    conn: &mut dyn Connection,
    resource: &Resource,
    failures: &mut Vec<String>,
) {
    match conn.delete(resource) {
        Ok(()) => debug!(%resource, "Deleted"),
        Err(e) if is_not_found(&e) => debug!(%resource, "Already gone"),
        Err(e) => {
            warn!(%resource, error = %e, "Delete failed");
            failures.push(format!("{resource}: {e:#}"));
        }
    }
}

/// Hands a reused floating address back to the pool.
fn release_tolerant(
    conn: &mut dyn Connection,
    address: &Resource,
    failures: &mut Vec<String>,
) {
    match conn.disassociate_address(address) {
        Ok(()) => debug!(%address, "Released"),
        Err(e) if is_not_found(&e) => debug!(%address, "Already gone"),
        Err(e) => {
            warn!(%address, error = %e, "Release failed");
            failures.push(format!("{address}: {e:#}"));
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Resources created for a node that is not yet fully provisioned. Unless
/// disarmed, dropping the guard deletes them.
struct Provisioning<'a> {
    conn: &'a mut dyn Connection,
    created: Vec<Resource>,
    /// Spare addresses taken over rather than created. These are released,
    /// never deleted.
    reused: Vec<Resource>,
    node: String,
    node_state: PollPolicy,
}

impl Provisioning<'_> {
    fn create(&mut self, spec: &ResourceSpec) -> anyhow::Result<Resource> {
        let resource = self.conn.create(spec)?;
        self.created.push(resource.clone());
        Ok(resource)
    }

    fn wait(
        &mut self,
        resource: &Resource,
        expectation: &Expectation,
    ) -> anyhow::Result<Option<Resource>> {
        wait_until_state(self.conn, resource, expectation, self.node_state)
    }

    fn disarm(mut self) {
        self.created.clear();
        self.reused.clear();
    }
}

impl Drop for Provisioning<'_> {
    fn drop(&mut self) {
        if self.created.is_empty() && self.reused.is_empty() {
            return;
        }

        warn!(node = %self.node, "Provisioning failed; releasing created resources");
        let mut failures = Vec::new();
        for address in &self.reused {
            release_tolerant(self.conn, address, &mut failures);
        }
        let (servers, others): (Vec<_>, Vec<_>) = self
            .created
            .iter()
            .partition(|r| r.kind == ResourceKind::Server);
        for server in &servers {
            delete_tolerant(self.conn, server, &mut failures);
        }
        if !others.is_empty() {
            for server in &servers {
                let _ = wait_until_state(
                    self.conn,
                    server,
                    &Expectation::Absent,
                    self.node_state,
                );
            }
        }
        for resource in others.iter().rev() {
            delete_tolerant(self.conn, resource, &mut failures);
        }
        if !failures.is_empty() {
            warn!(node = %self.node, ?failures, "Leaked resources");
        }
    }
}

fn disk_name(node: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Uniform::new_inclusive(b'a', b'z'))
        .take(5)
        .map(char::from)
        .collect();
    format!("{node}-volume-{suffix}")
}

/// Allocates a floating address, falling back to a spare one that is
/// already allocated but not associated with anything.
fn allocate_address(provisioning: &mut Provisioning<'_>) -> anyhow::Result<Resource> {
    match provisioning.create(&ResourceSpec::FloatingIp) {
        Ok(address) => Ok(address),
        Err(e) => {
            warn!(error = %e, "Floating IP allocation failed; looking for a spare");
            let spare = provisioning
                .conn
                .list(ResourceKind::FloatingIp, &ListFilter::All)?
                .into_iter()
                .find(|r| r.state == ResourceState::Available);
            match spare {
                Some(address) => {
                    info!(address = %address.name, "Reusing floating IP");
                    provisioning.reused.push(address.clone());
                    Ok(address)
                }
                None => Err(e.context("no spare floating IP to fall back on")),
            }
        }
    }
}

/// Provisions a node: creates its server, waits for it to run, gives it an
/// address, creates and attaches its initial disks and waits for SSH.
pub(crate) fn create_node(
    mut conn: Box<dyn Connection>,
    workspace: Arc<Workspace>,
    settings: NodeSettings,
    name: &str,
    role: NodeRole,
    tags: Vec<String>,
) -> anyhow::Result<Node> {
    let _span = info_span!("node_create", node = %name, ?role).entered();

    if !conn
        .list(ResourceKind::Server, &ListFilter::Name(name.to_owned()))?
        .is_empty()
    {
        return Err(super::HardwareError::NodeExists(name.to_owned()).into());
    }

    let mut provisioning = Provisioning {
        conn: conn.as_mut(),
        created: Vec::new(),
        reused: Vec::new(),
        node: name.to_owned(),
        node_state: settings.node_state,
    };

    let server = provisioning.create(&ResourceSpec::Server {
        name: name.to_owned(),
        role,
        public_key: workspace.public_key().to_owned(),
    })?;
    info!(id = %server.id, "Server created");

    let server = provisioning
        .wait(&server, &Expectation::State(ResourceState::Running))?
        .context("server vanished while booting")?;

    let (address, floating_ip, floating_ip_reused) = if settings.capabilities.floating_ips {
        let _reuse = ADDRESS_REUSE_LOCK.lock().unwrap();
        let floating = allocate_address(&mut provisioning)?;
        let reused = provisioning.reused.iter().any(|r| r.id == floating.id);
        provisioning.conn.associate_address(&server, &floating)?;
        let ip = *floating
            .addresses
            .first()
            .context("floating IP has no address")?;
        (ip, Some(floating), reused)
    } else {
        let ip = *server
            .addresses
            .first()
            .with_context(|| format!("server {name} reports no address"))?;
        (ip, None, false)
    };
    info!(%address, "Node address assigned");

    let mut disks = BTreeMap::new();
    if role == NodeRole::Worker {
        for _ in 0..settings.initial_data_disks {
            let disk_name = disk_name(name);
            let volume = provisioning.create(&ResourceSpec::Volume {
                name: disk_name.clone(),
                size_gb: DEFAULT_DISK_SIZE_GB,
            })?;
            provisioning
                .wait(&volume, &Expectation::State(ResourceState::Available))?;
            let device = provisioning.conn.attach_volume(&server, &volume)?;
            if !settings.capabilities.synchronous_attach {
                provisioning
                    .wait(&volume, &Expectation::State(ResourceState::InUse))?;
            }
            info!(disk = %disk_name, %device, "Initial disk attached");
            disks.insert(disk_name, Disk { volume, device: Some(device) });
        }
    }

    let shell = RemoteShell::new(address, &settings.user, workspace.private_key());
    shell.wait_ready(&workspace, settings.ssh_ready)?;

    provisioning.disarm();
    Ok(Node {
        name: name.to_owned(),
        role,
        tags,
        server,
        floating_ip,
        floating_ip_reused,
        shell,
        workspace,
        settings,
        inner: Mutex::new(NodeInner { conn, disks, destroyed: false }),
    })
}
