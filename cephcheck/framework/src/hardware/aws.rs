// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Amazon EC2 through the `aws ec2` command line client.
//!
//! Every run gets its own VPC with an internet gateway, a default route, a
//! subnet that maps public addresses on launch, a permissive security group
//! and the workspace key imported as a key pair. Resources are tagged with
//! a `Name` and looked up by that tag.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::Value;
use tracing::info;

use super::provider::{
    Connection, ListFilter, Provider, ProviderError, Resource, ResourceKind,
    ResourceSpec, ResourceState,
};
use crate::config::{AwsConfig, HarnessConfig, ProviderKind};
use crate::execute::{CommandError, Exec};
use crate::workspace::Workspace;

/// Device names EC2 recommends for EBS data volumes.
const DATA_DEVICES: std::ops::RangeInclusive<char> = 'f'..='p';

/// How a resource kind is described and identified by the EC2 API.
struct Describe {
    command: &'static str,
    list_key: &'static str,
    id_key: &'static str,
    id_filter: &'static str,
    name_filter: &'static str,
}

fn describe_for(kind: ResourceKind) -> anyhow::Result<Describe> {
    let d = |command, list_key, id_key, id_filter, name_filter| Describe {
        command,
        list_key,
        id_key,
        id_filter,
        name_filter,
    };
    Ok(match kind {
        ResourceKind::Server => {
            d("describe-instances", "Instances", "InstanceId", "instance-id", "tag:Name")
        }
        ResourceKind::Volume => {
            d("describe-volumes", "Volumes", "VolumeId", "volume-id", "tag:Name")
        }
        ResourceKind::SecurityGroup => d(
            "describe-security-groups",
            "SecurityGroups",
            "GroupId",
            "group-id",
            "group-name",
        ),
        ResourceKind::Keypair => {
            d("describe-key-pairs", "KeyPairs", "KeyName", "key-name", "key-name")
        }
        ResourceKind::Network => d("describe-vpcs", "Vpcs", "VpcId", "vpc-id", "tag:Name"),
        ResourceKind::Subnet => {
            d("describe-subnets", "Subnets", "SubnetId", "subnet-id", "tag:Name")
        }
        ResourceKind::Gateway => d(
            "describe-internet-gateways",
            "InternetGateways",
            "InternetGatewayId",
            "internet-gateway-id",
            "tag:Name",
        ),
        ResourceKind::RouteTable => d(
            "describe-route-tables",
            "RouteTables",
            "RouteTableId",
            "route-table-id",
            "tag:Name",
        ),
        ResourceKind::FloatingIp | ResourceKind::Router => {
            return Err(ProviderError::Unsupported {
                provider: "aws",
                operation: "floating IPs and routers",
            }
            .into())
        }
    })
}

#[derive(Debug)]
struct Plan {
    vpc: String,
    gateway: String,
    route_table: String,
    subnet: String,
    security_group: String,
    keypair: String,
    public_key: String,
    cidr: String,
    image: String,
    instance_type: String,
}

#[derive(Debug)]
pub struct AwsProvider {
    workspace: Arc<Workspace>,
    settings: AwsConfig,
    plan: Arc<Plan>,
}

impl AwsProvider {
    pub fn new(config: &HarnessConfig, workspace: Arc<Workspace>) -> anyhow::Result<Self> {
        let settings = config.aws.clone();
        if settings.ami_image_id.is_empty() {
            bail!("no AMI configured (aws.ami_image_id)");
        }

        let name = workspace.name();
        let plan = Plan {
            vpc: format!("{name}-vpc"),
            gateway: format!("{name}-gateway"),
            route_table: format!("{name}-routetable"),
            subnet: format!("{name}-subnet"),
            security_group: format!("{name}-sg"),
            keypair: workspace.keypair_name(),
            public_key: workspace.public_key().to_owned(),
            cidr: settings.vpc_cidr.clone(),
            image: settings.ami_image_id.clone(),
            instance_type: settings.node_size.clone(),
        };
        Ok(Self { workspace, settings, plan: Arc::new(plan) })
    }
}

impl Provider for AwsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AwsEc2
    }

    fn connect(&self) -> anyhow::Result<Box<dyn Connection>> {
        Ok(Box::new(AwsConnection {
            workspace: self.workspace.clone(),
            region: self.settings.region.clone(),
            profile: self.settings.profile.clone(),
            plan: self.plan.clone(),
        }))
    }

    fn shared_resources(&self) -> Vec<ResourceSpec> {
        let plan = &self.plan;
        vec![
            ResourceSpec::shared(ResourceKind::Network, &plan.vpc),
            ResourceSpec::shared(ResourceKind::Gateway, &plan.gateway),
            ResourceSpec::shared(ResourceKind::RouteTable, &plan.route_table),
            ResourceSpec::shared(ResourceKind::Subnet, &plan.subnet),
            ResourceSpec::shared(ResourceKind::SecurityGroup, &plan.security_group),
            ResourceSpec::shared(ResourceKind::Keypair, &plan.keypair),
        ]
    }
}

struct AwsConnection {
    workspace: Arc<Workspace>,
    region: Option<String>,
    profile: Option<String>,
    plan: Arc<Plan>,
}

impl AwsConnection {
    fn ec2(&self, command: &str) -> Exec {
        let mut exec = Exec::new("aws").arg("ec2").arg(command).args(["--output", "json"]);
        if let Some(region) = &self.region {
            exec = exec.arg("--region").arg(region);
        }
        if let Some(profile) = &self.profile {
            exec = exec.arg("--profile").arg(profile);
        }
        exec
    }

    /// Runs an EC2 call and parses its JSON reply. Calls that answer with
    /// nothing yield `Null`.
    fn call(&self, exec: Exec) -> anyhow::Result<Value> {
        let out = self.workspace.execute(exec.capture().quiet()).map_err(classify)?;
        if out.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&out.stdout).context("parsing aws output")
    }

    fn id_of(&self, kind: ResourceKind, name: &str) -> anyhow::Result<String> {
        let found = self.describe(kind, &ListFilter::Name(name.to_owned()))?;
        found
            .into_iter()
            .next()
            .map(|r| r.id)
            .with_context(|| format!("{kind} {name} not found"))
    }

    fn describe(&self, kind: ResourceKind, filter: &ListFilter) -> anyhow::Result<Vec<Resource>> {
        let d = describe_for(kind)?;
        let mut exec = self.ec2(d.command);
        match filter {
            ListFilter::All => {}
            ListFilter::Name(name) => {
                exec = exec.arg("--filters").arg(format!("Name={},Values={name}", d.name_filter));
            }
            ListFilter::Id(id) => {
                exec = exec.arg("--filters").arg(format!("Name={},Values={id}", d.id_filter));
            }
        }

        let reply = self.call(exec)?;
        let items: Vec<&Value> = if kind == ResourceKind::Server {
            reply["Reservations"]
                .as_array()
                .into_iter()
                .flatten()
                .flat_map(|r| r["Instances"].as_array().into_iter().flatten())
                .collect()
        } else {
            reply[d.list_key].as_array().into_iter().flatten().collect()
        };

        let mut found = Vec::new();
        for item in items {
            let resource = parse_item(kind, &d, item)?;
            // Terminated instances stay listed for a while.
            if resource.state == ResourceState::Other("terminated".into()) {
                continue;
            }
            if filter.accepts(&resource) {
                found.push(resource);
            }
        }
        Ok(found)
    }

    fn create_shared(&self, kind: ResourceKind, name: &str) -> anyhow::Result<Resource> {
        let plan = &self.plan;
        let id = match kind {
            ResourceKind::Network => {
                let reply = self.call(
                    self.ec2("create-vpc")
                        .arg("--cidr-block")
                        .arg(&plan.cidr)
                        .arg("--tag-specifications")
                        .arg(tag_spec("vpc", name)),
                )?;
                text(&reply["Vpc"], "VpcId")?
            }
            ResourceKind::Gateway => {
                let vpc = self.id_of(ResourceKind::Network, &plan.vpc)?;
                let reply = self.call(
                    self.ec2("create-internet-gateway")
                        .arg("--tag-specifications")
                        .arg(tag_spec("internet-gateway", name)),
                )?;
                let id = text(&reply["InternetGateway"], "InternetGatewayId")?;
                self.call(
                    self.ec2("attach-internet-gateway")
                        .arg("--internet-gateway-id")
                        .arg(&id)
                        .arg("--vpc-id")
                        .arg(&vpc),
                )?;
                id
            }
            ResourceKind::RouteTable => {
                let vpc = self.id_of(ResourceKind::Network, &plan.vpc)?;
                let gateway = self.id_of(ResourceKind::Gateway, &plan.gateway)?;
                let reply = self.call(
                    self.ec2("create-route-table")
                        .arg("--vpc-id")
                        .arg(&vpc)
                        .arg("--tag-specifications")
                        .arg(tag_spec("route-table", name)),
                )?;
                let id = text(&reply["RouteTable"], "RouteTableId")?;
                self.call(
                    self.ec2("create-route")
                        .arg("--route-table-id")
                        .arg(&id)
                        .args(["--destination-cidr-block", "0.0.0.0/0"])
                        .arg("--gateway-id")
                        .arg(&gateway),
                )?;
                id
            }
            ResourceKind::Subnet => {
                let vpc = self.id_of(ResourceKind::Network, &plan.vpc)?;
                let table = self.id_of(ResourceKind::RouteTable, &plan.route_table)?;
                let reply = self.call(
                    self.ec2("create-subnet")
                        .arg("--vpc-id")
                        .arg(&vpc)
                        .arg("--cidr-block")
                        .arg(&plan.cidr)
                        .arg("--tag-specifications")
                        .arg(tag_spec("subnet", name)),
                )?;
                let id = text(&reply["Subnet"], "SubnetId")?;
                self.call(
                    self.ec2("modify-subnet-attribute")
                        .arg("--subnet-id")
                        .arg(&id)
                        .arg("--map-public-ip-on-launch"),
                )?;
                self.call(
                    self.ec2("associate-route-table")
                        .arg("--route-table-id")
                        .arg(&table)
                        .arg("--subnet-id")
                        .arg(&id),
                )?;
                id
            }
            ResourceKind::SecurityGroup => {
                let vpc = self.id_of(ResourceKind::Network, &plan.vpc)?;
                let reply = self.call(
                    self.ec2("create-security-group")
                        .arg("--group-name")
                        .arg(name)
                        .args(["--description", "Permissive security group for cephcheck"])
                        .arg("--vpc-id")
                        .arg(&vpc)
                        .arg("--tag-specifications")
                        .arg(tag_spec("security-group", name)),
                )?;
                let id = text(&reply, "GroupId")?;
                self.call(
                    self.ec2("authorize-security-group-ingress")
                        .arg("--group-id")
                        .arg(&id)
                        .arg("--ip-permissions")
                        .arg("IpProtocol=-1,IpRanges=[{CidrIp=0.0.0.0/0}]"),
                )?;
                id
            }
            ResourceKind::Keypair => {
                let key_file = self.workspace.tmp_dir()?.join("aws-public.key");
                std::fs::write(&key_file, &plan.public_key)?;
                let reply = self.call(
                    self.ec2("import-key-pair")
                        .arg("--key-name")
                        .arg(name)
                        .arg("--public-key-material")
                        .arg(format!("fileb://{key_file}")),
                )?;
                text(&reply, "KeyName")?
            }
            ResourceKind::Server
            | ResourceKind::Volume
            | ResourceKind::FloatingIp
            | ResourceKind::Router => {
                return Err(ProviderError::Unsupported {
                    provider: "aws",
                    operation: "creating this kind as a shared resource",
                }
                .into())
            }
        };

        info!(%kind, %name, %id, "Created");
        Ok(Resource::new(kind, id, name, ResourceState::Available))
    }

    fn availability_zone(&self) -> anyhow::Result<String> {
        let reply = self.call(
            self.ec2("describe-subnets")
                .arg("--filters")
                .arg(format!("Name=tag:Name,Values={}", self.plan.subnet)),
        )?;
        text(&reply["Subnets"][0], "AvailabilityZone")
    }

    fn detach_gateway(&self, gateway: &Resource) -> anyhow::Result<()> {
        let reply = self.call(
            self.ec2("describe-internet-gateways")
                .arg("--internet-gateway-ids")
                .arg(&gateway.id),
        )?;
        let attachments = reply["InternetGateways"][0]["Attachments"].clone();
        for attachment in attachments.as_array().into_iter().flatten() {
            let vpc = text(attachment, "VpcId")?;
            self.call(
                self.ec2("detach-internet-gateway")
                    .arg("--internet-gateway-id")
                    .arg(&gateway.id)
                    .arg("--vpc-id")
                    .arg(&vpc),
            )?;
        }
        Ok(())
    }
}

impl Connection for AwsConnection {
    fn create(&mut self, spec: &ResourceSpec) -> anyhow::Result<Resource> {
        match spec {
            ResourceSpec::Server { name, .. } => {
                let plan = &self.plan;
                let subnet = self.id_of(ResourceKind::Subnet, &plan.subnet)?;
                let group = self.id_of(ResourceKind::SecurityGroup, &plan.security_group)?;
                let reply = self.call(
                    self.ec2("run-instances")
                        .arg("--image-id")
                        .arg(&plan.image)
                        .arg("--instance-type")
                        .arg(&plan.instance_type)
                        .args(["--count", "1"])
                        .arg("--key-name")
                        .arg(&plan.keypair)
                        .arg("--security-group-ids")
                        .arg(&group)
                        .arg("--subnet-id")
                        .arg(&subnet)
                        .arg("--tag-specifications")
                        .arg(tag_spec("instance", name)),
                )?;
                let id = text(&reply["Instances"][0], "InstanceId")?;
                Ok(Resource::new(ResourceKind::Server, id, name.clone(), ResourceState::Building))
            }
            ResourceSpec::Volume { name, size_gb } => {
                let zone = self.availability_zone()?;
                let reply = self.call(
                    self.ec2("create-volume")
                        .arg("--size")
                        .arg(size_gb.to_string())
                        .arg("--availability-zone")
                        .arg(&zone)
                        .args(["--volume-type", "gp2"])
                        .arg("--tag-specifications")
                        .arg(tag_spec("volume", name)),
                )?;
                let d = describe_for(ResourceKind::Volume)?;
                let mut volume = parse_item(ResourceKind::Volume, &d, &reply)?;
                volume.name = name.clone();
                Ok(volume)
            }
            ResourceSpec::FloatingIp => Err(ProviderError::Unsupported {
                provider: "aws",
                operation: "floating IPs",
            }
            .into()),
            ResourceSpec::Shared { kind, name } => self.create_shared(*kind, name),
        }
    }

    fn list(
        &mut self,
        kind: ResourceKind,
        filter: &ListFilter,
    ) -> anyhow::Result<Vec<Resource>> {
        self.describe(kind, filter)
    }

    fn delete(&mut self, resource: &Resource) -> anyhow::Result<()> {
        let id = resource.id.as_str();
        let exec = match resource.kind {
            ResourceKind::Server => self.ec2("terminate-instances").arg("--instance-ids").arg(id),
            ResourceKind::Volume => self.ec2("delete-volume").arg("--volume-id").arg(id),
            ResourceKind::SecurityGroup => {
                self.ec2("delete-security-group").arg("--group-id").arg(id)
            }
            ResourceKind::Keypair => self.ec2("delete-key-pair").arg("--key-name").arg(id),
            ResourceKind::Subnet => self.ec2("delete-subnet").arg("--subnet-id").arg(id),
            ResourceKind::RouteTable => {
                self.ec2("delete-route-table").arg("--route-table-id").arg(id)
            }
            ResourceKind::Gateway => {
                self.detach_gateway(resource).map_err(|e| not_found_as(resource, e))?;
                self.ec2("delete-internet-gateway").arg("--internet-gateway-id").arg(id)
            }
            ResourceKind::Network => self.ec2("delete-vpc").arg("--vpc-id").arg(id),
            ResourceKind::FloatingIp | ResourceKind::Router => {
                return Err(ProviderError::NotFound {
                    kind: resource.kind,
                    what: resource.name.clone(),
                }
                .into())
            }
        };

        self.call(exec).map_err(|e| not_found_as(resource, e))?;
        info!(%resource, "Deleted");
        Ok(())
    }

    fn attach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<String> {
        let reply = self.call(
            self.ec2("describe-instances").arg("--instance-ids").arg(&server.id),
        )?;
        let used: Vec<String> = reply["Reservations"][0]["Instances"][0]["BlockDeviceMappings"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|m| m["DeviceName"].as_str().map(str::to_owned))
            .collect();
        let device = next_data_device(&used)
            .with_context(|| format!("no free device name on {server}"))?;

        self.call(
            self.ec2("attach-volume")
                .arg("--volume-id")
                .arg(&volume.id)
                .arg("--instance-id")
                .arg(&server.id)
                .arg("--device")
                .arg(&device),
        )?;
        Ok(device)
    }

    fn detach_volume(
        &mut self,
        server: &Resource,
        volume: &Resource,
    ) -> anyhow::Result<()> {
        self.call(
            self.ec2("detach-volume")
                .arg("--volume-id")
                .arg(&volume.id)
                .arg("--instance-id")
                .arg(&server.id),
        )
        .map_err(|e| not_found_as(volume, e))?;
        Ok(())
    }

    fn associate_address(
        &mut self,
        _server: &Resource,
        _address: &Resource,
    ) -> anyhow::Result<()> {
        Err(ProviderError::Unsupported { provider: "aws", operation: "floating IPs" }.into())
    }

    fn disassociate_address(&mut self, _address: &Resource) -> anyhow::Result<()> {
        Err(ProviderError::Unsupported { provider: "aws", operation: "floating IPs" }.into())
    }
}

fn tag_spec(resource_type: &str, name: &str) -> String {
    format!("ResourceType={resource_type},Tags=[{{Key=Name,Value={name}}}]")
}

fn text(value: &Value, key: &str) -> anyhow::Result<String> {
    value[key]
        .as_str()
        .map(str::to_owned)
        .with_context(|| format!("aws reply carries no {key}"))
}

/// Turns the client's `*.NotFound` failures into [`ProviderError::NotFound`].
fn classify(error: CommandError) -> anyhow::Error {
    match &error {
        CommandError::Failed { stderr, .. } if stderr.contains(".NotFound") => {
            let what = stderr.lines().last().unwrap_or_default().to_owned();
            ProviderError::NotFound { kind: ResourceKind::Server, what }.into()
        }
        _ => error.into(),
    }
}

fn not_found_as(resource: &Resource, error: anyhow::Error) -> anyhow::Error {
    if super::provider::is_not_found(&error) {
        ProviderError::NotFound { kind: resource.kind, what: resource.name.clone() }.into()
    } else {
        error
    }
}

fn name_tag(item: &Value) -> Option<String> {
    item["Tags"]
        .as_array()?
        .iter()
        .find(|t| t["Key"] == "Name")
        .and_then(|t| t["Value"].as_str())
        .map(str::to_owned)
}

fn parse_item(kind: ResourceKind, d: &Describe, item: &Value) -> anyhow::Result<Resource> {
    let id = text(item, d.id_key)?;
    let name = match kind {
        ResourceKind::Keypair => id.clone(),
        ResourceKind::SecurityGroup => item["GroupName"].as_str().unwrap_or_default().to_owned(),
        _ => name_tag(item).unwrap_or_default(),
    };

    let mut addresses: Vec<IpAddr> = Vec::new();
    let state = match kind {
        ResourceKind::Server => {
            addresses = item["PublicIpAddress"].as_str().and_then(|a| a.parse().ok()).into_iter().collect();
            match item["State"]["Name"].as_str().unwrap_or_default() {
                // The node is reached on its public address.
                "running" if addresses.is_empty() => ResourceState::Building,
                "running" => ResourceState::Running,
                "pending" => ResourceState::Building,
                "stopping" | "stopped" => ResourceState::Stopped,
                "shutting-down" => ResourceState::Deleting,
                other => ResourceState::Other(other.to_owned()),
            }
        }
        ResourceKind::Volume => match item["State"].as_str().unwrap_or_default() {
            "available" => ResourceState::Available,
            "in-use" => ResourceState::InUse,
            "creating" => ResourceState::Building,
            "deleting" | "deleted" => ResourceState::Deleting,
            "error" => ResourceState::Error,
            other => ResourceState::Other(other.to_owned()),
        },
        _ => match item["State"].as_str() {
            None | Some("available") => ResourceState::Available,
            Some("pending") => ResourceState::Building,
            Some(other) => ResourceState::Other(other.to_owned()),
        },
    };

    Ok(Resource::new(kind, id, name, state).with_addresses(addresses))
}

/// The first `/dev/sdX` data device name not in `used`.
fn next_data_device(used: &[String]) -> Option<String> {
    DATA_DEVICES.map(|c| format!("/dev/sd{c}")).find(|dev| {
        let xvd = dev.replace("/dev/sd", "/dev/xvd");
        !used.iter().any(|u| *u == *dev || *u == xvd)
    })
}
