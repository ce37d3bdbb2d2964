// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interface every infrastructure backend implements.
//!
//! A [`Provider`] is shared by the whole run and is only a factory for
//! [`Connection`]s. Connections are `Send` but never shared: every unit of
//! work that talks to a backend concurrently with another obtains its own.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use crate::config::ProviderKind;
use crate::hardware::NodeRole;

/// The kinds of resource a backend manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Server,
    Volume,
    FloatingIp,
    SecurityGroup,
    Keypair,
    Network,
    Subnet,
    Router,
    Gateway,
    RouteTable,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Server => "server",
            ResourceKind::Volume => "volume",
            ResourceKind::FloatingIp => "floating IP",
            ResourceKind::SecurityGroup => "security group",
            ResourceKind::Keypair => "keypair",
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Router => "router",
            ResourceKind::Gateway => "gateway",
            ResourceKind::RouteTable => "route table",
        };
        f.write_str(s)
    }
}

/// A backend resource's state, normalized across providers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Building,
    Running,
    /// Created and not in use, e.g. a detached volume or an unassociated
    /// floating address.
    Available,
    InUse,
    Stopped,
    Deleting,
    Error,
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub id: String,
    pub name: String,
    pub state: ResourceState,
    pub addresses: Vec<IpAddr>,
}

impl Resource {
    pub fn new(
        kind: ResourceKind,
        id: impl Into<String>,
        name: impl Into<String>,
        state: ResourceState,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
            state,
            addresses: Vec::new(),
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.addresses = addresses;
        self
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.name, self.id)
    }
}

/// What to create.
#[derive(Clone, Debug)]
pub enum ResourceSpec {
    Server { name: String, role: NodeRole, public_key: String },
    Volume { name: String, size_gb: u32 },
    FloatingIp,
    /// A resource shared by every node of a run. The backend knows how
    /// each shared kind is wired to the others.
    Shared { kind: ResourceKind, name: String },
}

impl ResourceSpec {
    pub fn shared(kind: ResourceKind, name: impl Into<String>) -> Self {
        ResourceSpec::Shared { kind, name: name.into() }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Server { .. } => ResourceKind::Server,
            ResourceSpec::Volume { .. } => ResourceKind::Volume,
            ResourceSpec::FloatingIp => ResourceKind::FloatingIp,
            ResourceSpec::Shared { kind, .. } => *kind,
        }
    }
}

/// Narrows a list call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListFilter {
    All,
    Name(String),
    Id(String),
}

impl ListFilter {
    pub fn accepts(&self, resource: &Resource) -> bool {
        match self {
            ListFilter::All => true,
            ListFilter::Name(name) => resource.name == *name,
            ListFilter::Id(id) => resource.id == *id,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{kind} {what} not found")]
    NotFound { kind: ResourceKind, what: String },

    #[error("{method} {url} returned {status}: {body}")]
    Api { method: String, url: String, status: u16, body: String },

    #[error("{provider} does not support {operation}")]
    Unsupported { provider: &'static str, operation: &'static str },
}

/// Whether `error` (or anything in its chain) reports a missing resource.
pub fn is_not_found(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ProviderError>(),
            Some(ProviderError::NotFound { .. })
        )
    })
}

/// Backend-specific behavior the generic node code has to respect.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    /// Nodes are reached through an associated floating address rather
    /// than the server's own address.
    pub floating_ips: bool,

    /// Attaching a volume completes before the attach call returns.
    pub synchronous_attach: bool,
}

/// A handle to a backend's API. Not safe to share between threads.
pub trait Connection: Send {
    fn create(&mut self, spec: &ResourceSpec) -> anyhow::Result<Resource>;

    fn list(
        &mut self,
        kind: ResourceKind,
        filter: &ListFilter,
    ) -> anyhow::Result<Vec<Resource>>;

    /// Deletes a resource. Fails with [`ProviderError::NotFound`] if it is
    /// already gone.
    fn delete(&mut self, resource: &Resource) -> anyhow::Result<()>;

    /// Attaches `volume` to `server`, returning the guest device path.
    fn attach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<String>;

    fn detach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<()>;

    fn associate_address(
        &mut self,
        server: &Resource,
        address: &Resource,
    ) -> anyhow::Result<()>;

    /// Detaches `address` from its server. The address stays allocated.
    fn disassociate_address(&mut self, address: &Resource) -> anyhow::Result<()>;
}

pub trait Provider: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProviderKind;

    /// Opens a new, unshared API handle.
    fn connect(&self) -> anyhow::Result<Box<dyn Connection>>;

    /// The run-wide resources to create before any node, in creation order.
    fn shared_resources(&self) -> Vec<ResourceSpec>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}
