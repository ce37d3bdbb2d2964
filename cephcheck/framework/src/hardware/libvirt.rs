// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local virtual machines managed through `virsh`.
//!
//! Each run gets a transient NAT network carved out of the configured
//! range. Nodes boot from qcow2 overlays on a shared base image and receive
//! the workspace key through a cloud-init seed image. Data disks are qcow2
//! files in the workspace, attached as the next free `vdX` device.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use super::provider::{
    Capabilities, Connection, ListFilter, Provider, ProviderError, Resource,
    ResourceKind, ResourceSpec, ResourceState,
};
use crate::artifacts::Downloader;
use crate::config::{HarnessConfig, ProviderKind};
use crate::execute::{CommandError, Exec, ExecOutput};
use crate::workspace::Workspace;

/// `virsh define` is not safe to run concurrently against one daemon.
static DEFINE_LOCK: Mutex<()> = Mutex::new(());

const VCPUS: u32 = 2;
const ROOT_DISK_SIZE: &str = "10G";

/// An IPv4 network in CIDR notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Subnet {
    base: u32,
    prefix: u8,
}

impl Ipv4Subnet {
    pub fn parse(cidr: &str) -> anyhow::Result<Self> {
        let (addr, prefix) = cidr
            .split_once('/')
            .with_context(|| format!("{cidr} is not in CIDR notation"))?;
        let addr: Ipv4Addr =
            addr.parse().with_context(|| format!("bad address in {cidr}"))?;
        let prefix: u8 =
            prefix.parse().with_context(|| format!("bad prefix in {cidr}"))?;
        if prefix > 30 {
            bail!("{cidr} is too small to hold a network");
        }
        let mask = Self::mask_bits(prefix);
        Ok(Self { base: u32::from(addr) & mask, prefix })
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    fn size(&self) -> u32 {
        1u32 << (32 - self.prefix)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(Self::mask_bits(self.prefix))
    }

    /// The `n`th address of the network, counting from its base.
    pub fn nth(&self, n: u32) -> Ipv4Addr {
        Ipv4Addr::from(self.base + n)
    }

    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base + self.size() - 1)
    }

    /// Splits the network into subnets of the given prefix length.
    pub fn subnets(&self, prefix: u8) -> anyhow::Result<Vec<Ipv4Subnet>> {
        if prefix < self.prefix || prefix > 30 {
            bail!("cannot split /{} into /{prefix} networks", self.prefix);
        }
        let step = 1u32 << (32 - prefix);
        let count = 1u32 << (prefix - self.prefix);
        Ok((0..count).map(|i| Ipv4Subnet { base: self.base + i * step, prefix }).collect())
    }
}

impl std::fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

#[derive(Debug)]
struct Volume {
    resource: Resource,
    attached: Option<(String, String)>,
}

#[derive(Debug)]
struct Shared {
    workspace: Arc<Workspace>,
    uri: String,
    image: Utf8PathBuf,
    memory_kib: u64,
    network_range: Ipv4Subnet,
    network_subnet: u8,
    network: String,
    public_key: String,
    /// Data disks are plain files; their attachment is tracked here.
    volumes: Mutex<BTreeMap<String, Volume>>,
}

#[derive(Debug)]
pub struct LibvirtProvider {
    shared: Arc<Shared>,
}

impl LibvirtProvider {
    pub fn new(config: &HarnessConfig, workspace: Arc<Workspace>) -> anyhow::Result<Self> {
        let settings = &config.libvirt;
        if settings.image.is_empty() {
            bail!("no base image configured (libvirt.image)");
        }

        let image = if settings.image.starts_with("http://")
            || settings.image.starts_with("https://")
        {
            let file = settings
                .image
                .rsplit('/')
                .next()
                .filter(|f| !f.is_empty())
                .unwrap_or("base-image.qcow2");
            let dest = workspace.working_dir().join(file);
            info!(image = %settings.image, %dest, "Downloading base image");
            Downloader::default().fetch_to_file(&settings.image, &dest, None, false)?;
            dest
        } else {
            Utf8PathBuf::from(&settings.image)
        };

        let shared = Shared {
            uri: settings.connection.clone(),
            image,
            memory_kib: u64::from(settings.vm_memory) * 1024 * 1024,
            network_range: Ipv4Subnet::parse(&settings.network_range)?,
            network_subnet: settings.network_subnet,
            network: workspace.name().to_owned(),
            public_key: workspace.public_key().to_owned(),
            volumes: Mutex::new(BTreeMap::new()),
            workspace,
        };
        Ok(Self { shared: Arc::new(shared) })
    }
}

impl Provider for LibvirtProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Libvirt
    }

    fn connect(&self) -> anyhow::Result<Box<dyn Connection>> {
        Ok(Box::new(LibvirtConnection { shared: self.shared.clone() }))
    }

    fn shared_resources(&self) -> Vec<ResourceSpec> {
        vec![ResourceSpec::shared(ResourceKind::Network, &self.shared.network)]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { floating_ips: false, synchronous_attach: true }
    }
}

struct LibvirtConnection {
    shared: Arc<Shared>,
}

impl LibvirtConnection {
    fn virsh(&self) -> Exec {
        Exec::new("virsh").arg("-c").arg(&self.shared.uri)
    }

    fn run(&self, exec: Exec) -> Result<ExecOutput, CommandError> {
        self.shared.workspace.execute(exec.capture().quiet())
    }

    fn file(&self, name: &str) -> Utf8PathBuf {
        self.shared.workspace.working_dir().join(name)
    }

    fn create_network(&self, name: &str) -> anyhow::Result<Resource> {
        let shared = &self.shared;
        for subnet in shared.network_range.subnets(shared.network_subnet)? {
            let xml = network_xml(name, &subnet);
            let path = self.file(&format!("{name}-network.xml"));
            std::fs::write(&path, xml)?;

            match self.run(self.virsh().arg("net-create").arg(path.as_str())) {
                Ok(_) => {
                    info!(%subnet, network = %name, "Created network");
                    return Ok(Resource::new(
                        ResourceKind::Network,
                        name,
                        name,
                        ResourceState::Available,
                    ));
                }
                Err(CommandError::Failed { stderr, .. })
                    if stderr.contains("already in use") =>
                {
                    debug!(%subnet, "Network range in use; trying the next one");
                }
                Err(e) => return Err(e.into()),
            }
        }
        bail!("no free /{} network left in {}", shared.network_subnet, shared.network_range)
    }

    fn create_server(&self, name: &str) -> anyhow::Result<Resource> {
        let shared = &self.shared;
        let overlay = self.file(&format!("{name}-snapshot.qcow2"));
        let seed = self.file(&format!("{name}-cloud-init-seed.img"));
        let _ = std::fs::remove_file(&overlay);
        let _ = std::fs::remove_file(&seed);

        self.run(
            Exec::new("qemu-img")
                .args(["create", "-f", "qcow2", "-F", "qcow2", "-o"])
                .arg(format!("backing_file={}", shared.image))
                .arg(overlay.as_str())
                .arg(ROOT_DISK_SIZE),
        )?;
        self.create_seed(name, &seed)?;

        let xml = domain_xml(name, shared.memory_kib, &overlay, &seed, &shared.network);
        let path = self.file(&format!("{name}-domain.xml"));
        std::fs::write(&path, xml)?;
        {
            let _define = DEFINE_LOCK.lock().unwrap();
            self.run(self.virsh().arg("define").arg(path.as_str()))
                .with_context(|| format!("defining domain {name}"))?;
        }
        self.run(self.virsh().arg("start").arg(name))?;

        Ok(Resource::new(ResourceKind::Server, name, name, ResourceState::Building))
    }

    fn create_seed(&self, name: &str, seed: &Utf8Path) -> anyhow::Result<()> {
        let dir = self.file(&format!("{name}-cloud-init"));
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join("user-data"),
            format!(
                "#cloud-config\ndebug: True\nssh_authorized_keys:\n  - {}\n",
                self.shared.public_key
            ),
        )?;
        std::fs::write(
            dir.join("meta-data"),
            format!(
                "---\ninstance-id: {}\nlocal-hostname: {name}\n",
                uuid::Uuid::new_v4()
            ),
        )?;

        self.run(
            Exec::new("mkisofs")
                .arg("-output")
                .arg(seed.as_str())
                .args(["-volid", "cidata", "-joliet", "-rock"])
                .arg(dir.as_str()),
        )
        .context("building the cloud-init seed image")?;
        Ok(())
    }

    fn domains(&self) -> anyhow::Result<Vec<String>> {
        let out = self.run(self.virsh().args(["list", "--all", "--name"]))?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn describe_domain(&self, name: &str) -> anyhow::Result<Resource> {
        let state = self.run(self.virsh().arg("domstate").arg(name))?;
        let addresses = match self
            .run(self.virsh().arg("domifaddr").arg(name).args(["--source", "lease"]))
        {
            Ok(out) => parse_domifaddr(&out.stdout),
            Err(_) => Vec::new(),
        };

        let state = match state.stdout.trim() {
            // A running guest is only usable once it holds a lease.
            "running" if addresses.is_empty() => ResourceState::Building,
            "running" => ResourceState::Running,
            "shut off" | "paused" => ResourceState::Stopped,
            "crashed" => ResourceState::Error,
            "in shutdown" => ResourceState::Deleting,
            other => ResourceState::Other(other.to_owned()),
        };
        Ok(Resource::new(ResourceKind::Server, name, name, state).with_addresses(addresses))
    }

    fn networks(&self) -> anyhow::Result<Vec<String>> {
        let out = self.run(self.virsh().args(["net-list", "--all", "--name"]))?;
        Ok(out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_owned).collect())
    }

    fn next_device(&self, domain: &str) -> anyhow::Result<String> {
        let out = self.run(self.virsh().arg("domblklist").arg(domain).arg("--details"))?;
        next_virtio_device(&out.stdout)
            .with_context(|| format!("no free virtio device letter on {domain}"))
    }
}

impl Connection for LibvirtConnection {
    fn create(&mut self, spec: &ResourceSpec) -> anyhow::Result<Resource> {
        match spec {
            ResourceSpec::Server { name, .. } => self.create_server(name),
            ResourceSpec::Volume { name, size_gb } => {
                let path = self.file(&format!("{name}.qcow2"));
                self.run(
                    Exec::new("qemu-img")
                        .args(["create", "-f", "qcow2"])
                        .arg(path.as_str())
                        .arg(format!("{size_gb}G")),
                )?;
                let resource = Resource::new(
                    ResourceKind::Volume,
                    path.as_str(),
                    name.clone(),
                    ResourceState::Available,
                );
                self.shared.volumes.lock().unwrap().insert(
                    resource.id.clone(),
                    Volume { resource: resource.clone(), attached: None },
                );
                Ok(resource)
            }
            ResourceSpec::Shared { kind: ResourceKind::Network, name } => {
                self.create_network(name)
            }
            ResourceSpec::FloatingIp => Err(ProviderError::Unsupported {
                provider: "libvirt",
                operation: "floating IPs",
            }
            .into()),
            ResourceSpec::Shared { .. } => Err(ProviderError::Unsupported {
                provider: "libvirt",
                operation: "shared resources other than networks",
            }
            .into()),
        }
    }

    fn list(
        &mut self,
        kind: ResourceKind,
        filter: &ListFilter,
    ) -> anyhow::Result<Vec<Resource>> {
        let mut found = Vec::new();
        match kind {
            ResourceKind::Server => {
                for name in self.domains()? {
                    let candidate =
                        Resource::new(kind, &name, &name, ResourceState::Other(String::new()));
                    if filter.accepts(&candidate) {
                        found.push(self.describe_domain(&name)?);
                    }
                }
            }
            ResourceKind::Network => {
                for name in self.networks()? {
                    let net = Resource::new(kind, &name, &name, ResourceState::Available);
                    if filter.accepts(&net) {
                        found.push(net);
                    }
                }
            }
            ResourceKind::Volume => {
                let volumes = self.shared.volumes.lock().unwrap();
                for volume in volumes.values() {
                    if !Utf8Path::new(&volume.resource.id).exists() {
                        continue;
                    }
                    let mut resource = volume.resource.clone();
                    if volume.attached.is_some() {
                        resource.state = ResourceState::InUse;
                    }
                    if filter.accepts(&resource) {
                        found.push(resource);
                    }
                }
            }
            _ => {}
        }
        Ok(found)
    }

    fn delete(&mut self, resource: &Resource) -> anyhow::Result<()> {
        let not_found = || -> anyhow::Error {
            ProviderError::NotFound { kind: resource.kind, what: resource.name.clone() }
                .into()
        };

        match resource.kind {
            ResourceKind::Server => {
                if !self.domains()?.contains(&resource.id) {
                    return Err(not_found());
                }
                // Fails harmlessly when the domain is not running.
                let _ = self.run(self.virsh().arg("destroy").arg(&resource.id).check(false));
                self.run(self.virsh().arg("undefine").arg(&resource.id))?;
                for suffix in ["snapshot.qcow2", "cloud-init-seed.img", "domain.xml"] {
                    let _ = std::fs::remove_file(self.file(&format!("{}-{suffix}", resource.id)));
                }
                let _ = std::fs::remove_dir_all(self.file(&format!("{}-cloud-init", resource.id)));
                self.shared
                    .volumes
                    .lock()
                    .unwrap()
                    .values_mut()
                    .filter(|v| matches!(&v.attached, Some((d, _)) if *d == resource.id))
                    .for_each(|v| v.attached = None);
            }
            ResourceKind::Volume => {
                self.shared.volumes.lock().unwrap().remove(&resource.id);
                match std::fs::remove_file(&resource.id) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(not_found())
                    }
                    Err(e) => return Err(e).with_context(|| format!("removing {}", resource.id)),
                }
            }
            ResourceKind::Network => {
                if !self.networks()?.contains(&resource.id) {
                    return Err(not_found());
                }
                self.run(self.virsh().arg("net-destroy").arg(&resource.id))?;
            }
            _ => return Err(not_found()),
        }
        info!(%resource, "Deleted");
        Ok(())
    }

    fn attach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<String> {
        let target = self.next_device(&server.id)?;
        self.run(
            self.virsh()
                .arg("attach-disk")
                .arg(&server.id)
                .arg(&volume.id)
                .arg(&target)
                .args(["--driver", "qemu", "--subdriver", "qcow2", "--cache", "writeback"])
                .args(["--targetbus", "virtio", "--live"]),
        )
        .with_context(|| format!("attaching {volume} to {server}"))?;

        if let Some(v) = self.shared.volumes.lock().unwrap().get_mut(&volume.id) {
            v.attached = Some((server.id.clone(), target.clone()));
        }
        Ok(format!("/dev/{target}"))
    }

    fn detach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<()> {
        let target = self
            .shared
            .volumes
            .lock()
            .unwrap()
            .get(&volume.id)
            .and_then(|v| v.attached.as_ref())
            .map(|(_, target)| target.clone())
            .ok_or_else(|| ProviderError::NotFound {
                kind: ResourceKind::Volume,
                what: format!("attachment of {}", volume.name),
            })?;

        self.run(self.virsh().arg("detach-disk").arg(&server.id).arg(&target).arg("--live"))?;
        if let Some(v) = self.shared.volumes.lock().unwrap().get_mut(&volume.id) {
            v.attached = None;
        }
        Ok(())
    }

    fn associate_address(
        &mut self,
        _server: &Resource,
        _address: &Resource,
    ) -> anyhow::Result<()> {
        Err(ProviderError::Unsupported { provider: "libvirt", operation: "floating IPs" }
            .into())
    }

    fn disassociate_address(&mut self, _address: &Resource) -> anyhow::Result<()> {
        Err(ProviderError::Unsupported { provider: "libvirt", operation: "floating IPs" }
            .into())
    }
}

fn network_xml(name: &str, subnet: &Ipv4Subnet) -> String {
    format!(
        r#"<network>
  <name>{name}</name>
  <forward mode="nat"/>
  <ip address="{host}" netmask="{netmask}">
    <dhcp>
      <range start="{start}" end="{end}"/>
    </dhcp>
  </ip>
</network>
"#,
        host = subnet.nth(1),
        netmask = subnet.netmask(),
        start = subnet.nth(2),
        end = Ipv4Addr::from(u32::from(subnet.last()) - 1),
    )
}

fn domain_xml(
    name: &str,
    memory_kib: u64,
    overlay: &Utf8Path,
    seed: &Utf8Path,
    network: &str,
) -> String {
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <currentMemory unit='KiB'>{memory_kib}</currentMemory>
  <vcpu placement='static'>{VCPUS}</vcpu>
  <cpu mode='host-passthrough'/>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
  </features>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>restart</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='writeback'/>
      <source file='{overlay}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <memballoon model='virtio'/>
  </devices>
</domain>
"#
    )
}

/// IPv4 addresses from `virsh domifaddr` output.
fn parse_domifaddr(output: &str) -> Vec<IpAddr> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [_, _, "ipv4", addr, ..] => addr.split('/').next()?.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

/// The first `vdX` target not listed in `virsh domblklist --details`.
fn next_virtio_device(output: &str) -> Option<String> {
    let used: Vec<&str> = output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .filter(|target| target.starts_with("vd"))
        .collect();
    ('a'..='z').map(|c| format!("vd{c}")).find(|dev| !used.contains(&dev.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::tests::scripted_workspace;

    #[test]
    fn ranges_split_into_subnets() {
        let range = Ipv4Subnet::parse("192.168.124.7/22").unwrap();
        assert_eq!(range.to_string(), "192.168.124.0/22");

        let subnets = range.subnets(24).unwrap();
        assert_eq!(subnets.len(), 4);
        assert_eq!(subnets[3].to_string(), "192.168.127.0/24");
        assert_eq!(subnets[0].netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(subnets[0].last(), Ipv4Addr::new(192, 168, 124, 255));

        assert!(range.subnets(20).is_err());
        assert!(Ipv4Subnet::parse("10.0.0.0").is_err());
    }

    #[test]
    fn network_xml_reserves_gateway_and_broadcast() {
        let subnet = Ipv4Subnet::parse("192.168.125.0/24").unwrap();
        let xml = network_xml("ws", &subnet);
        assert!(xml.contains(r#"<ip address="192.168.125.1" netmask="255.255.255.0">"#));
        assert!(xml.contains(r#"start="192.168.125.2" end="192.168.125.254""#));
    }

    #[test]
    fn lease_addresses_are_parsed() {
        let output = " Name       MAC address          Protocol     Address\n\
            -------------------------------------------------------------\n \
            vnet0      52:54:00:6d:1a:0b    ipv4         192.168.124.17/24\n \
            vnet0      52:54:00:6d:1a:0b    ipv6         fe80::1/64\n";
        assert_eq!(
            parse_domifaddr(output),
            vec!["192.168.124.17".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn next_device_skips_used_virtio_targets() {
        let output = " Type   Device   Target   Source\n\
            ------------------------------------------------\n \
            file   disk     vda      /ws/n-snapshot.qcow2\n \
            file   cdrom    sda      /ws/n-seed.img\n \
            file   disk     vdb      /ws/n-volume-abcde.qcow2\n";
        assert_eq!(next_virtio_device(output).as_deref(), Some("vdc"));
    }

    #[test]
    fn busy_subnets_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, runner) =
            scripted_workspace(Utf8Path::from_path(dir.path()).unwrap());
        let ws = Arc::new(ws);
        let shared = Shared {
            workspace: ws.clone(),
            uri: "qemu:///system".into(),
            image: "/images/base.qcow2".into(),
            memory_kib: 1024,
            network_range: Ipv4Subnet::parse("10.10.0.0/23").unwrap(),
            network_subnet: 24,
            network: ws.name().to_owned(),
            public_key: ws.public_key().to_owned(),
            volumes: Mutex::new(BTreeMap::new()),
        };
        let mut attempts = 0;
        runner.on("net-create", move |_| {
            attempts += 1;
            if attempts == 1 {
                ExecOutput::failed(1, "error: Network is already in use by interface virbr1")
            } else {
                ExecOutput::ok("")
            }
        });

        let mut conn = LibvirtConnection { shared: Arc::new(shared) };
        let net = conn
            .create(&ResourceSpec::shared(ResourceKind::Network, ws.name()))
            .unwrap();
        assert_eq!(net.id, ws.name());
        assert_eq!(runner.count("net-create"), 2);

        let xml = std::fs::read_to_string(
            ws.working_dir().join(format!("{}-network.xml", ws.name())),
        )
        .unwrap();
        assert!(xml.contains("10.10.1.1"));
    }
}
