// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OpenStack over its REST APIs: Keystone v3 password authentication, then
//! Nova, Neutron, Cinder and Glance endpoints from the token's catalog.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use reqwest::blocking::Client;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::provider::{
    Capabilities, Connection, ListFilter, Provider, ProviderError, Resource,
    ResourceKind, ResourceSpec, ResourceState,
};
use crate::config::{HarnessConfig, OpenStackAuth, ProviderKind};
use crate::workspace::Workspace;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// The service endpoints a token grants access to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Endpoints {
    compute: String,
    network: String,
    volume: String,
    image: String,
}

/// Names and IDs every resource of one run is created with.
#[derive(Debug)]
struct Plan {
    network: String,
    subnet: String,
    router: String,
    security_group: String,
    keypair: String,
    public_key: String,
    internal_cidr: String,
    image_id: String,
    flavor_id: String,
    external_network_id: String,
}

#[derive(Debug)]
pub struct OpenStackProvider {
    auth: OpenStackAuth,
    plan: Arc<Plan>,
}

impl OpenStackProvider {
    /// Authenticates and resolves the configured image, flavor and external
    /// network, failing early if any of them is missing.
    pub fn new(
        config: &HarnessConfig,
        workspace: &Arc<Workspace>,
    ) -> anyhow::Result<Self> {
        let settings = &config.openstack;
        if settings.node_image.is_empty() {
            bail!("no node image configured (openstack.node_image)");
        }

        let auth = settings.resolve_auth()?;
        let conn = OpenStackConnection::open(&auth)?;

        let external_network_id = conn
            .find_one(ResourceKind::Network, &settings.external_network)?
            .with_context(|| {
                format!(
                    "external network {} not found; check openstack.external_network",
                    settings.external_network
                )
            })?
            .id;
        let image_id = conn.find_image(&settings.node_image)?.with_context(|| {
            format!(
                "node image {} not found; check openstack.node_image",
                settings.node_image
            )
        })?;
        let flavor_id = conn.find_flavor(&settings.node_size)?.with_context(|| {
            format!(
                "node flavor {} not found; check openstack.node_size",
                settings.node_size
            )
        })?;

        let name = workspace.name();
        let plan = Plan {
            network: format!("{name}-net"),
            subnet: format!("{name}-subnet"),
            router: format!("{name}-router"),
            security_group: format!("{name}-sg"),
            keypair: workspace.keypair_name(),
            public_key: workspace.public_key().to_owned(),
            internal_cidr: settings.internal_cidr.clone(),
            image_id,
            flavor_id,
            external_network_id,
        };
        info!(?plan, "Resolved OpenStack resources");

        Ok(Self { auth, plan: Arc::new(plan) })
    }
}

impl Provider for OpenStackProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Openstack
    }

    fn connect(&self) -> anyhow::Result<Box<dyn Connection>> {
        let mut conn = OpenStackConnection::open(&self.auth)?;
        conn.plan = Some(self.plan.clone());
        Ok(Box::new(conn))
    }

    fn shared_resources(&self) -> Vec<ResourceSpec> {
        let plan = &self.plan;
        vec![
            ResourceSpec::shared(ResourceKind::Keypair, &plan.keypair),
            ResourceSpec::shared(ResourceKind::SecurityGroup, &plan.security_group),
            ResourceSpec::shared(ResourceKind::Network, &plan.network),
            ResourceSpec::shared(ResourceKind::Subnet, &plan.subnet),
            ResourceSpec::shared(ResourceKind::Router, &plan.router),
        ]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { floating_ips: true, synchronous_attach: false }
    }
}

/// An authenticated API session. Connections opened without a run's plan
/// can list and delete but not create.
pub struct OpenStackConnection {
    client: Client,
    token: String,
    endpoints: Endpoints,
    plan: Option<Arc<Plan>>,
}

impl OpenStackConnection {
    pub fn open(auth: &OpenStackAuth) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!auth.verify_tls)
            .build()
            .context("building HTTP client")?;

        let url = format!("{}/auth/tokens", keystone_v3(&auth.auth_url));
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": auth.username,
                            "domain": { "name": auth.user_domain_name },
                            "password": auth.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": auth.project_name,
                        "domain": { "id": auth.project_domain_id },
                    }
                }
            }
        });

        let response = client
            .post(&url)
            .json(&body)
            .send()
            .with_context(|| format!("authenticating at {url}"))?;
        let status = response.status();
        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let text = response.text()?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                method: "POST".into(),
                url,
                status: status.as_u16(),
                body: text,
            }
            .into());
        }

        let token = token.context("Keystone returned no X-Subject-Token")?;
        let catalog: Value =
            serde_json::from_str(&text).context("parsing Keystone token")?;
        let endpoints = parse_catalog(&catalog, auth.region_name.as_deref())?;
        debug!(?endpoints, "Authenticated");

        Ok(Self { client, token, endpoints, plan: None })
    }

    fn plan(&self) -> anyhow::Result<&Plan> {
        self.plan
            .as_deref()
            .context("connection was opened without a provisioning plan")
    }

    fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> anyhow::Result<Value> {
        let mut request = self
            .client
            .request(method.clone(), url)
            .header("X-Auth-Token", &self.token)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response =
            request.send().with_context(|| format!("{method} {url}"))?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(ProviderError::Api {
                method: method.to_string(),
                url: url.to_owned(),
                status: status.as_u16(),
                body: text,
            }
            .into());
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .with_context(|| format!("parsing response of {method} {url}"))
    }

    fn collection(&self, kind: ResourceKind) -> anyhow::Result<(String, &'static str)> {
        let e = &self.endpoints;
        Ok(match kind {
            ResourceKind::Server => (format!("{}/servers/detail", e.compute), "servers"),
            ResourceKind::Volume => (format!("{}/volumes/detail", e.volume), "volumes"),
            ResourceKind::Keypair => (format!("{}/os-keypairs", e.compute), "keypairs"),
            ResourceKind::FloatingIp => {
                (format!("{}/v2.0/floatingips", e.network), "floatingips")
            }
            ResourceKind::SecurityGroup => {
                (format!("{}/v2.0/security-groups", e.network), "security_groups")
            }
            ResourceKind::Network => (format!("{}/v2.0/networks", e.network), "networks"),
            ResourceKind::Subnet => (format!("{}/v2.0/subnets", e.network), "subnets"),
            ResourceKind::Router => (format!("{}/v2.0/routers", e.network), "routers"),
            ResourceKind::Gateway | ResourceKind::RouteTable => {
                return Err(ProviderError::Unsupported {
                    provider: "openstack",
                    operation: "internet gateways and route tables",
                }
                .into())
            }
        })
    }

    fn item_url(&self, resource: &Resource) -> anyhow::Result<String> {
        let e = &self.endpoints;
        let id = &resource.id;
        Ok(match resource.kind {
            ResourceKind::Server => format!("{}/servers/{id}", e.compute),
            ResourceKind::Volume => format!("{}/volumes/{id}", e.volume),
            ResourceKind::Keypair => format!("{}/os-keypairs/{id}", e.compute),
            _ => {
                let (collection, _) = self.collection(resource.kind)?;
                format!("{collection}/{id}")
            }
        })
    }

    /// Finds a resource whose name or ID is `what`.
    fn find_one(&self, kind: ResourceKind, what: &str) -> anyhow::Result<Option<Resource>> {
        let all = self.list_all(kind, None)?;
        Ok(all
            .iter()
            .find(|r| r.name == what)
            .or_else(|| all.iter().find(|r| r.id == what))
            .cloned())
    }

    fn find_image(&self, what: &str) -> anyhow::Result<Option<String>> {
        let listing = self.call(
            Method::GET,
            &format!("{}/v2/images?limit=1000", self.endpoints.image),
            None,
        )?;
        Ok(find_named(&listing["images"], what))
    }

    fn find_flavor(&self, what: &str) -> anyhow::Result<Option<String>> {
        let listing = self.call(
            Method::GET,
            &format!("{}/flavors/detail", self.endpoints.compute),
            None,
        )?;
        Ok(find_named(&listing["flavors"], what))
    }

    fn list_all(
        &self,
        kind: ResourceKind,
        name: Option<&str>,
    ) -> anyhow::Result<Vec<Resource>> {
        let (url, key) = self.collection(kind)?;
        let url = match name {
            // Keypairs cannot be filtered server side.
            Some(name) if kind != ResourceKind::Keypair => {
                format!("{url}?name={name}")
            }
            _ => url,
        };
        let listing = self.call(Method::GET, &url, None)?;
        let items = listing[key]
            .as_array()
            .with_context(|| format!("{url} returned no {key} list"))?;
        items.iter().map(|item| parse_resource(kind, item)).collect()
    }

    fn not_found(resource: &Resource, error: anyhow::Error) -> anyhow::Error {
        match error.downcast_ref::<ProviderError>() {
            Some(ProviderError::Api { status: 404, .. }) => ProviderError::NotFound {
                kind: resource.kind,
                what: resource.name.clone(),
            }
            .into(),
            _ => error,
        }
    }

    fn server_port(&self, server: &Resource) -> anyhow::Result<String> {
        let ports = self.call(
            Method::GET,
            &format!("{}/v2.0/ports?device_id={}", self.endpoints.network, server.id),
            None,
        )?;
        ports["ports"][0]["id"]
            .as_str()
            .map(str::to_owned)
            .with_context(|| format!("{server} has no network port"))
    }

    fn detach_router_interfaces(&self, router: &Resource) -> anyhow::Result<()> {
        let network = &self.endpoints.network;
        let ports = self.call(
            Method::GET,
            &format!("{network}/v2.0/ports?device_id={}", router.id),
            None,
        )?;
        for port in ports["ports"].as_array().into_iter().flatten() {
            let owner = port["device_owner"].as_str().unwrap_or_default();
            if !owner.starts_with("network:router_interface") {
                continue;
            }
            self.call(
                Method::PUT,
                &format!("{network}/v2.0/routers/{}/remove_router_interface", router.id),
                Some(json!({ "port_id": port["id"] })),
            )?;
        }
        Ok(())
    }

    fn create_shared(&self, kind: ResourceKind, name: &str) -> anyhow::Result<Resource> {
        let plan = self.plan()?;
        let network = &self.endpoints.network;
        let created = match kind {
            ResourceKind::Keypair => {
                let created = self.call(
                    Method::POST,
                    &format!("{}/os-keypairs", self.endpoints.compute),
                    Some(json!({
                        "keypair": { "name": name, "public_key": plan.public_key }
                    })),
                )?;
                return parse_resource(kind, &created);
            }
            ResourceKind::SecurityGroup => {
                let created = self.call(
                    Method::POST,
                    &format!("{network}/v2.0/security-groups"),
                    Some(json!({
                        "security_group": {
                            "name": name,
                            "description": "Permissive firewall for cephcheck",
                        }
                    })),
                )?;
                let group = parse_resource(kind, &created["security_group"])?;
                for protocol in ["tcp", "udp"] {
                    self.call(
                        Method::POST,
                        &format!("{network}/v2.0/security-group-rules"),
                        Some(json!({
                            "security_group_rule": {
                                "direction": "ingress",
                                "ethertype": "IPv4",
                                "port_range_min": 1,
                                "port_range_max": 65535,
                                "protocol": protocol,
                                "security_group_id": group.id,
                            }
                        })),
                    )?;
                }
                return Ok(group);
            }
            ResourceKind::Network => self.call(
                Method::POST,
                &format!("{network}/v2.0/networks"),
                Some(json!({ "network": { "name": name } })),
            )?["network"]
                .take(),
            ResourceKind::Subnet => {
                let net = self
                    .find_one(ResourceKind::Network, &plan.network)?
                    .with_context(|| format!("network {} not found", plan.network))?;
                self.call(
                    Method::POST,
                    &format!("{network}/v2.0/subnets"),
                    Some(json!({
                        "subnet": {
                            "name": name,
                            "network_id": net.id,
                            "ip_version": 4,
                            "cidr": plan.internal_cidr,
                        }
                    })),
                )?["subnet"]
                    .take()
            }
            ResourceKind::Router => {
                let subnet = self
                    .find_one(ResourceKind::Subnet, &plan.subnet)?
                    .with_context(|| format!("subnet {} not found", plan.subnet))?;
                let router = self.call(
                    Method::POST,
                    &format!("{network}/v2.0/routers"),
                    Some(json!({
                        "router": {
                            "name": name,
                            "external_gateway_info": {
                                "network_id": plan.external_network_id,
                            },
                        }
                    })),
                )?["router"]
                    .take();
                let router = parse_resource(kind, &router)?;
                self.call(
                    Method::PUT,
                    &format!("{network}/v2.0/routers/{}/add_router_interface", router.id),
                    Some(json!({ "subnet_id": subnet.id })),
                )?;
                return Ok(router);
            }
            other => {
                return Err(ProviderError::Unsupported {
                    provider: "openstack",
                    operation: match other {
                        ResourceKind::Gateway => "internet gateways",
                        ResourceKind::RouteTable => "route tables",
                        _ => "creating this kind as a shared resource",
                    },
                }
                .into())
            }
        };
        parse_resource(kind, &created)
    }
}

impl Connection for OpenStackConnection {
    fn create(&mut self, spec: &ResourceSpec) -> anyhow::Result<Resource> {
        match spec {
            ResourceSpec::Server { name, .. } => {
                let plan = self.plan()?;
                let network = self
                    .find_one(ResourceKind::Network, &plan.network)?
                    .with_context(|| format!("network {} not found", plan.network))?;
                let created = self.call(
                    Method::POST,
                    &format!("{}/servers", self.endpoints.compute),
                    Some(json!({
                        "server": {
                            "name": name,
                            "imageRef": plan.image_id,
                            "flavorRef": plan.flavor_id,
                            "key_name": plan.keypair,
                            "networks": [{ "uuid": network.id }],
                            "security_groups": [{ "name": plan.security_group }],
                        }
                    })),
                )?;
                let id = created["server"]["id"]
                    .as_str()
                    .context("server create returned no id")?;
                Ok(Resource::new(ResourceKind::Server, id, name.clone(), ResourceState::Building))
            }
            ResourceSpec::Volume { name, size_gb } => {
                let created = self.call(
                    Method::POST,
                    &format!("{}/volumes", self.endpoints.volume),
                    Some(json!({ "volume": { "name": name, "size": size_gb } })),
                )?;
                parse_resource(ResourceKind::Volume, &created["volume"])
            }
            ResourceSpec::FloatingIp => {
                let plan = self.plan()?;
                let created = self.call(
                    Method::POST,
                    &format!("{}/v2.0/floatingips", self.endpoints.network),
                    Some(json!({
                        "floatingip": { "floating_network_id": plan.external_network_id }
                    })),
                )?;
                parse_resource(ResourceKind::FloatingIp, &created["floatingip"])
            }
            ResourceSpec::Shared { kind, name } => self.create_shared(*kind, name),
        }
    }

    fn list(
        &mut self,
        kind: ResourceKind,
        filter: &ListFilter,
    ) -> anyhow::Result<Vec<Resource>> {
        let name = match filter {
            ListFilter::Name(name) => Some(name.as_str()),
            _ => None,
        };
        let mut all = self.list_all(kind, name)?;
        all.retain(|r| filter.accepts(r));
        Ok(all)
    }

    fn delete(&mut self, resource: &Resource) -> anyhow::Result<()> {
        if resource.kind == ResourceKind::Router {
            self.detach_router_interfaces(resource)
                .map_err(|e| Self::not_found(resource, e))?;
        }
        let url = self.item_url(resource)?;
        self.call(Method::DELETE, &url, None)
            .map_err(|e| Self::not_found(resource, e))?;
        info!(%resource, "Deleted");
        Ok(())
    }

    fn attach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<String> {
        let attached = self.call(
            Method::POST,
            &format!("{}/servers/{}/os-volume_attachments", self.endpoints.compute, server.id),
            Some(json!({ "volumeAttachment": { "volumeId": volume.id } })),
        )?;
        attached["volumeAttachment"]["device"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("attaching {volume} reported no device"))
    }

    fn detach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<()> {
        self.call(
            Method::DELETE,
            &format!(
                "{}/servers/{}/os-volume_attachments/{}",
                self.endpoints.compute, server.id, volume.id
            ),
            None,
        )
        .map_err(|e| Self::not_found(volume, e))?;
        Ok(())
    }

    fn associate_address(
        &mut self,
        server: &Resource,
        address: &Resource,
    ) -> anyhow::Result<()> {
        let port = self.server_port(server)?;
        self.call(
            Method::PUT,
            &format!("{}/v2.0/floatingips/{}", self.endpoints.network, address.id),
            Some(json!({ "floatingip": { "port_id": port } })),
        )?;
        Ok(())
    }

    fn disassociate_address(&mut self, address: &Resource) -> anyhow::Result<()> {
        self.call(
            Method::PUT,
            &format!("{}/v2.0/floatingips/{}", self.endpoints.network, address.id),
            Some(json!({ "floatingip": { "port_id": null } })),
        )?;
        Ok(())
    }
}

/// Appends the Keystone API version unless the URL already carries it.
fn keystone_v3(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    if base.ends_with("/v3") {
        base.to_owned()
    } else {
        format!("{base}/v3")
    }
}

fn parse_catalog(token: &Value, region: Option<&str>) -> anyhow::Result<Endpoints> {
    let catalog = token["token"]["catalog"]
        .as_array()
        .context("token carries no service catalog")?;

    let find = |types: &[&str]| -> anyhow::Result<String> {
        for service in catalog {
            let ty = service["type"].as_str().unwrap_or_default();
            if !types.contains(&ty) {
                continue;
            }
            let endpoint = service["endpoints"].as_array().into_iter().flatten().find(|e| {
                e["interface"] == "public"
                    && region.map_or(true, |r| {
                        e["region_id"] == r || e["region"] == r
                    })
            });
            if let Some(url) = endpoint.and_then(|e| e["url"].as_str()) {
                return Ok(url.trim_end_matches('/').to_owned());
            }
        }
        bail!("no public {} endpoint in the service catalog", types[0])
    };

    Ok(Endpoints {
        compute: find(&["compute"])?,
        network: find(&["network"])?,
        volume: find(&["volumev3", "block-storage", "volumev2"])?,
        image: find(&["image"])?,
    })
}

fn find_named(items: &Value, what: &str) -> Option<String> {
    let items = items.as_array()?;
    items
        .iter()
        .find(|i| i["name"] == what)
        .or_else(|| items.iter().find(|i| i["id"] == what))
        .and_then(|i| i["id"].as_str())
        .map(str::to_owned)
}

fn normalize_state(kind: ResourceKind, item: &Value) -> ResourceState {
    match kind {
        ResourceKind::Server => match item["status"].as_str().unwrap_or_default() {
            "ACTIVE" => ResourceState::Running,
            "BUILD" | "REBUILD" => ResourceState::Building,
            "SHUTOFF" | "SUSPENDED" | "PAUSED" => ResourceState::Stopped,
            "DELETED" | "SOFT_DELETED" => ResourceState::Deleting,
            "ERROR" => ResourceState::Error,
            other => ResourceState::Other(other.to_owned()),
        },
        ResourceKind::Volume => match item["status"].as_str().unwrap_or_default() {
            "available" => ResourceState::Available,
            "in-use" => ResourceState::InUse,
            "creating" | "attaching" | "detaching" | "reserved" => ResourceState::Building,
            "deleting" => ResourceState::Deleting,
            s if s.starts_with("error") => ResourceState::Error,
            other => ResourceState::Other(other.to_owned()),
        },
        ResourceKind::FloatingIp => {
            if item["port_id"].is_null() {
                ResourceState::Available
            } else {
                ResourceState::InUse
            }
        }
        _ => match item["status"].as_str() {
            None | Some("ACTIVE") => ResourceState::Available,
            Some("ERROR") => ResourceState::Error,
            Some(other) => ResourceState::Other(other.to_owned()),
        },
    }
}

fn parse_resource(kind: ResourceKind, item: &Value) -> anyhow::Result<Resource> {
    // Keypair listings wrap every entry; keypairs are identified by name.
    let item = if kind == ResourceKind::Keypair && item.get("keypair").is_some() {
        &item["keypair"]
    } else {
        item
    };

    let text = |key: &str| item[key].as_str().unwrap_or_default().to_owned();
    let (id, name) = match kind {
        ResourceKind::Keypair => (text("name"), text("name")),
        ResourceKind::FloatingIp => (text("id"), text("floating_ip_address")),
        _ => (text("id"), text("name")),
    };
    if id.is_empty() {
        bail!("{kind} without an id in {item}");
    }

    let addresses: Vec<IpAddr> = match kind {
        ResourceKind::Server => item["addresses"]
            .as_object()
            .into_iter()
            .flat_map(|networks| networks.values())
            .flat_map(|addrs| addrs.as_array().into_iter().flatten())
            .filter(|a| a["version"] == 4)
            .filter_map(|a| a["addr"].as_str()?.parse().ok())
            .collect(),
        ResourceKind::FloatingIp => name.parse().into_iter().collect(),
        _ => Vec::new(),
    };

    Ok(Resource::new(kind, id, name, normalize_state(kind, item)).with_addresses(addresses))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystone_urls_gain_a_version_once() {
        assert_eq!(keystone_v3("https://cloud:5000"), "https://cloud:5000/v3");
        assert_eq!(keystone_v3("https://cloud:5000/v3/"), "https://cloud:5000/v3");
    }

    #[test]
    fn catalog_picks_public_endpoints_in_the_region() {
        let token = json!({
            "token": { "catalog": [
                { "type": "compute", "endpoints": [
                    { "interface": "internal", "region_id": "r1", "url": "http://internal" },
                    { "interface": "public", "region_id": "r2", "url": "http://nova-r2" },
                    { "interface": "public", "region_id": "r1", "url": "http://nova/" },
                ]},
                { "type": "network", "endpoints": [
                    { "interface": "public", "region_id": "r1", "url": "http://neutron" },
                ]},
                { "type": "volumev3", "endpoints": [
                    { "interface": "public", "region_id": "r1", "url": "http://cinder" },
                ]},
                { "type": "image", "endpoints": [
                    { "interface": "public", "region_id": "r1", "url": "http://glance" },
                ]},
            ]}
        });

        let endpoints = parse_catalog(&token, Some("r1")).unwrap();
        assert_eq!(endpoints.compute, "http://nova");
        assert_eq!(endpoints.volume, "http://cinder");

        let mut partial = token.clone();
        partial["token"]["catalog"].as_array_mut().unwrap().pop();
        assert!(parse_catalog(&partial, Some("r1")).is_err());
    }

    #[test]
    fn servers_parse_with_state_and_ipv4_addresses() {
        let server = json!({
            "id": "abc",
            "name": "ws-master-0",
            "status": "ACTIVE",
            "addresses": { "ws-net": [
                { "version": 6, "addr": "fe80::1" },
                { "version": 4, "addr": "192.168.100.5" },
            ]}
        });
        let parsed = parse_resource(ResourceKind::Server, &server).unwrap();
        assert_eq!(parsed.state, ResourceState::Running);
        assert_eq!(parsed.addresses, vec!["192.168.100.5".parse::<IpAddr>().unwrap()]);

        let building = json!({ "id": "x", "name": "n", "status": "BUILD" });
        assert_eq!(
            parse_resource(ResourceKind::Server, &building).unwrap().state,
            ResourceState::Building
        );
    }

    #[test]
    fn floating_ips_are_available_until_associated() {
        let free = json!({ "id": "f1", "floating_ip_address": "172.24.4.9", "port_id": null });
        let parsed = parse_resource(ResourceKind::FloatingIp, &free).unwrap();
        assert_eq!(parsed.state, ResourceState::Available);
        assert_eq!(parsed.name, "172.24.4.9");
        assert_eq!(parsed.addresses.len(), 1);

        let used = json!({ "id": "f2", "floating_ip_address": "172.24.4.10", "port_id": "p" });
        assert_eq!(
            parse_resource(ResourceKind::FloatingIp, &used).unwrap().state,
            ResourceState::InUse
        );
    }

    #[test]
    fn keypairs_are_unwrapped_and_keyed_by_name() {
        let listed = json!({ "keypair": { "name": "ws_key", "fingerprint": "aa" } });
        let parsed = parse_resource(ResourceKind::Keypair, &listed).unwrap();
        assert_eq!(parsed.id, "ws_key");
        assert_eq!(parsed.state, ResourceState::Available);
    }

    #[test]
    fn volume_states_normalize() {
        let volume = |status: &str| json!({ "id": "v", "name": "n", "status": status });
        let state = |status| parse_resource(ResourceKind::Volume, &volume(status)).unwrap().state;
        assert_eq!(state("available"), ResourceState::Available);
        assert_eq!(state("in-use"), ResourceState::InUse);
        assert_eq!(state("error_deleting"), ResourceState::Error);
    }

    #[test]
    fn named_lookup_prefers_names_over_ids() {
        let items = json!([
            { "id": "m1.small", "name": "tiny" },
            { "id": "42", "name": "m1.small" },
        ]);
        assert_eq!(find_named(&items, "m1.small").as_deref(), Some("42"));
        assert_eq!(find_named(&items, "tiny").as_deref(), Some("m1.small"));
        assert_eq!(find_named(&items, "huge"), None);
    }
}
