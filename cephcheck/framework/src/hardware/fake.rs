// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory provider that records what it is asked to do.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;

use super::provider::{
    Capabilities, Connection, ListFilter, Provider, ProviderError, Resource,
    ResourceKind, ResourceSpec, ResourceState,
};
use crate::config::ProviderKind;

/// The address the fake gives a server of this name.
pub(crate) fn address_for(name: &str) -> IpAddr {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let h = hasher.finish();
    IpAddr::V4(Ipv4Addr::new(10, (h >> 16) as u8, (h >> 8) as u8, (h as u8).max(1)))
}

#[derive(Debug, Default)]
struct Inventory {
    resources: BTreeMap<String, Resource>,
    attachments: BTreeMap<String, Vec<String>>,
    next_id: usize,
}

/// State shared by every connection of one [`FakeProvider`].
#[derive(Debug, Default)]
pub(crate) struct FakeState {
    inner: Mutex<Inventory>,
    failing: Mutex<BTreeSet<ResourceKind>>,
    connections: AtomicUsize,
    deletes: AtomicUsize,
}

impl FakeState {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Delete calls received, whether or not the resource existed.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.inner.lock().unwrap().resources.len()
    }

    pub fn fail_creates_of(&self, kind: ResourceKind) {
        self.failing.lock().unwrap().insert(kind);
    }

    fn insert(&self, resource: Resource) -> Resource {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let resource = Resource { id: format!("fake-{}", inner.next_id), ..resource };
        inner.resources.insert(resource.id.clone(), resource.clone());
        resource
    }

    pub fn insert_server(&self, name: &str) -> Resource {
        self.insert(
            Resource::new(ResourceKind::Server, "", name, ResourceState::Running)
                .with_addresses(vec![address_for(name)]),
        )
    }

    pub fn insert_spare_floating_ip(&self, address: &str) -> Resource {
        let ip: IpAddr = address.parse().unwrap();
        self.insert(
            Resource::new(
                ResourceKind::FloatingIp,
                "",
                address,
                ResourceState::Available,
            )
            .with_addresses(vec![ip]),
        )
    }

    pub fn floating_ips(&self) -> Vec<Resource> {
        self.inner
            .lock()
            .unwrap()
            .resources
            .values()
            .filter(|r| r.kind == ResourceKind::FloatingIp)
            .cloned()
            .collect()
    }

    pub fn forget_volumes(&self) {
        self.inner
            .lock()
            .unwrap()
            .resources
            .retain(|_, r| r.kind != ResourceKind::Volume);
    }
}

#[derive(Debug)]
pub(crate) struct FakeProvider {
    state: Arc<FakeState>,
    capabilities: Capabilities,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::with_capabilities(Capabilities::default())
    }
}

impl FakeProvider {
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self { state: Arc::new(FakeState::default()), capabilities }
    }

    pub fn state(&self) -> Arc<FakeState> {
        self.state.clone()
    }
}

impl Provider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Openstack
    }

    fn connect(&self) -> anyhow::Result<Box<dyn Connection>> {
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection { state: self.state.clone() }))
    }

    fn shared_resources(&self) -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::shared(ResourceKind::SecurityGroup, "fake-sg"),
            ResourceSpec::shared(ResourceKind::Keypair, "fake-key"),
        ]
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

struct FakeConnection {
    state: Arc<FakeState>,
}

impl FakeConnection {
    fn set_state(&self, id: &str, state: ResourceState) -> anyhow::Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        match inner.resources.get_mut(id) {
            Some(r) => {
                r.state = state;
                Ok(())
            }
            None => Err(ProviderError::NotFound {
                kind: ResourceKind::Volume,
                what: id.to_owned(),
            }
            .into()),
        }
    }
}

impl Connection for FakeConnection {
    fn create(&mut self, spec: &ResourceSpec) -> anyhow::Result<Resource> {
        if self.state.failing.lock().unwrap().contains(&spec.kind()) {
            bail!("quota exceeded creating {}", spec.kind());
        }

        let resource = match spec {
            ResourceSpec::Server { name, .. } => {
                return Ok(self.state.insert_server(name));
            }
            ResourceSpec::Volume { name, .. } => Resource::new(
                ResourceKind::Volume,
                "",
                name.clone(),
                ResourceState::Available,
            ),
            ResourceSpec::FloatingIp => {
                let n = self.state.inner.lock().unwrap().next_id;
                let ip = IpAddr::V4(Ipv4Addr::new(172, 24, 5, (n % 250 + 1) as u8));
                Resource::new(
                    ResourceKind::FloatingIp,
                    "",
                    ip.to_string(),
                    ResourceState::Available,
                )
                .with_addresses(vec![ip])
            }
            ResourceSpec::Shared { kind, name } => {
                Resource::new(*kind, "", name.clone(), ResourceState::Available)
            }
        };

        Ok(self.state.insert(resource))
    }

    fn list(
        &mut self,
        kind: ResourceKind,
        filter: &ListFilter,
    ) -> anyhow::Result<Vec<Resource>> {
        let inner = self.state.inner.lock().unwrap();
        Ok(inner
            .resources
            .values()
            .filter(|r| r.kind == kind && filter.accepts(r))
            .cloned()
            .collect())
    }

    fn delete(&mut self, resource: &Resource) -> anyhow::Result<()> {
        self.state.deletes.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.state.inner.lock().unwrap();
        match inner.resources.remove(&resource.id) {
            Some(_) => {
                inner.attachments.remove(&resource.id);
                Ok(())
            }
            None => Err(ProviderError::NotFound {
                kind: resource.kind,
                what: resource.name.clone(),
            }
            .into()),
        }
    }

    fn attach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<String> {
        let letter = {
            let mut inner = self.state.inner.lock().unwrap();
            let attached = inner.attachments.entry(server.id.clone()).or_default();
            attached.push(volume.id.clone());
            (b'a' + attached.len() as u8) as char
        };
        self.set_state(&volume.id, ResourceState::InUse)?;
        Ok(format!("/dev/vd{letter}"))
    }

    fn detach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<()> {
        if let Some(attached) =
            self.state.inner.lock().unwrap().attachments.get_mut(&server.id)
        {
            attached.retain(|id| *id != volume.id);
        }
        self.set_state(&volume.id, ResourceState::Available)
    }

    fn associate_address(
        &mut self,
        _server: &Resource,
        address: &Resource,
    ) -> anyhow::Result<()> {
        self.set_state(&address.id, ResourceState::InUse)
    }

    fn disassociate_address(&mut self, address: &Resource) -> anyhow::Result<()> {
        self.set_state(&address.id, ResourceState::Available)
    }
}
