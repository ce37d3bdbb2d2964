// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Harness configuration.
//!
//! A [`HarnessConfig`] is built once per run, from a TOML file plus
//! command-line overrides, and passed by reference into every component's
//! constructor.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::poll::PollPolicy;

/// The infrastructure backend nodes are provisioned on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    #[serde(alias = "OPENSTACK")]
    Openstack,
    #[serde(alias = "LIBVIRT")]
    Libvirt,
    #[serde(alias = "aws", alias = "AWS_EC2")]
    AwsEc2,
}

impl FromStr for ProviderKind {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openstack" => Ok(ProviderKind::Openstack),
            "libvirt" => Ok(ProviderKind::Libvirt),
            "aws_ec2" | "aws" => Ok(ProviderKind::AwsEc2),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unrecognized provider {s}"),
            )),
        }
    }
}

/// The operating system and Kubernetes distribution on the nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum Distro {
    /// openSUSE with upstream Kubernetes installed through kubeadm.
    #[default]
    #[serde(rename = "opensuse_k8s", alias = "openSUSE_k8s")]
    OpensuseK8s,

    /// SLES with CaaS Platform, bootstrapped through skuba.
    #[serde(rename = "sles_caasp", alias = "SLES_CaaSP")]
    SlesCaasp,
}

impl FromStr for Distro {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "opensuse_k8s" => Ok(Distro::OpensuseK8s),
            "sles_caasp" => Ok(Distro::SlesCaasp),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unrecognized distro {s}"),
            )),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Prepended to every resource name to keep runs in shared projects
    /// apart.
    pub cluster_prefix: String,

    /// The parent of every run's scratch directory.
    pub workspace_dir: Utf8PathBuf,

    pub masters: usize,
    pub workers: usize,

    /// Data volumes attached to each worker when it is created.
    pub worker_initial_data_disks: usize,

    /// The login user baked into the node image. Must be root or a
    /// passwordless sudoer.
    pub node_image_user: String,

    /// Build the storage artifact on a worker thread while hardware boots.
    pub use_threads: bool,

    pub remove_workspace: bool,
    pub tear_down_cluster: bool,

    /// Where to write cluster state and pod logs before teardown.
    pub gather_logs_dir: Option<Utf8PathBuf>,

    pub provider: ProviderKind,
    pub distro: Distro,

    /// The directory holding the playbooks the harness runs.
    pub playbook_dir: Utf8PathBuf,

    /// Passed verbatim to every `ansible-playbook` invocation.
    pub ansible_extra_vars: Option<String>,

    pub openstack: OpenStackConfig,
    pub libvirt: LibvirtConfig,
    pub aws: AwsConfig,
    pub kubernetes: KubernetesConfig,
    pub upstream_rook: UpstreamRookConfig,
    pub ses: SesConfig,
    pub timeouts: Timeouts,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "cephcheck".into());
        Self {
            cluster_prefix: format!("{user}-cephcheck-"),
            workspace_dir: "/tmp/cephcheck".into(),
            masters: 1,
            workers: 2,
            worker_initial_data_disks: 1,
            node_image_user: "opensuse".into(),
            use_threads: true,
            remove_workspace: true,
            tear_down_cluster: true,
            gather_logs_dir: None,
            provider: ProviderKind::default(),
            distro: Distro::default(),
            playbook_dir: "assets/ansible".into(),
            ansible_extra_vars: None,
            openstack: OpenStackConfig::default(),
            libvirt: LibvirtConfig::default(),
            aws: AwsConfig::default(),
            kubernetes: KubernetesConfig::default(),
            upstream_rook: UpstreamRookConfig::default(),
            ses: SesConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl HarnessConfig {
    pub fn from_toml_path(path: &Utf8Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("parsing config file {path}"))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::de::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.masters >= 1, "at least one master is required");
        anyhow::ensure!(
            !self.node_image_user.is_empty(),
            "node_image_user must not be empty"
        );
        Ok(())
    }

    /// Whether commands on nodes need `sudo` to act as root.
    pub fn needs_sudo(&self) -> bool {
        self.node_image_user != "root"
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OpenStackConfig {
    /// The image name or ID nodes boot from.
    pub node_image: String,

    /// The flavor name or ID nodes are created with.
    pub node_size: String,

    /// The network floating addresses are allocated from.
    pub external_network: String,

    /// The CIDR of the private network created for each run.
    pub internal_cidr: String,

    pub verify_tls: bool,

    pub auth_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub project_name: Option<String>,
    pub user_domain_name: Option<String>,
    pub project_domain_id: Option<String>,
    pub region_name: Option<String>,
}

impl Default for OpenStackConfig {
    fn default() -> Self {
        Self {
            node_image: String::new(),
            node_size: "m1.medium".into(),
            external_network: "floating".into(),
            internal_cidr: "192.168.100.0/24".into(),
            verify_tls: true,
            auth_url: None,
            username: None,
            password: None,
            project_name: None,
            user_domain_name: None,
            project_domain_id: None,
            region_name: None,
        }
    }
}

/// Keystone credentials with every field resolved.
#[derive(Clone)]
pub struct OpenStackAuth {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain_name: String,
    pub project_domain_id: String,
    pub region_name: Option<String>,
    pub verify_tls: bool,
}

impl std::fmt::Debug for OpenStackAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenStackAuth")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project_name", &self.project_name)
            .field("region_name", &self.region_name)
            .finish_non_exhaustive()
    }
}

impl OpenStackConfig {
    /// Fills unset credential fields from the `OS_*` environment variables
    /// an openrc file exports.
    pub fn resolve_auth(&self) -> anyhow::Result<OpenStackAuth> {
        self.resolve_auth_with(|key| std::env::var(key).ok())
    }

    fn resolve_auth_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<OpenStackAuth> {
        let pick = |value: &Option<String>, key: &str| {
            value.clone().or_else(|| env(key)).filter(|v| !v.is_empty())
        };

        Ok(OpenStackAuth {
            auth_url: pick(&self.auth_url, "OS_AUTH_URL")
                .context("no OpenStack auth URL configured (OS_AUTH_URL)")?,
            username: pick(&self.username, "OS_USERNAME")
                .context("no OpenStack username configured (OS_USERNAME)")?,
            password: pick(&self.password, "OS_PASSWORD")
                .context("no OpenStack password configured (OS_PASSWORD)")?,
            project_name: pick(&self.project_name, "OS_PROJECT_NAME")
                .unwrap_or_else(|| "default".into()),
            user_domain_name: pick(&self.user_domain_name, "OS_USER_DOMAIN_NAME")
                .unwrap_or_else(|| "default".into()),
            project_domain_id: pick(&self.project_domain_id, "OS_PROJECT_DOMAIN_ID")
                .unwrap_or_else(|| "default".into()),
            region_name: pick(&self.region_name, "OS_REGION_NAME"),
            verify_tls: self.verify_tls,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub connection: String,

    /// The address range per-run networks are carved from.
    pub network_range: String,

    /// The prefix length of each per-run network.
    pub network_subnet: u8,

    /// A local path or URL of the qcow2 base image.
    pub image: String,

    /// Guest memory in GiB.
    pub vm_memory: u32,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            connection: "qemu:///system".into(),
            network_range: "192.168.124.0/22".into(),
            network_subnet: 24,
            image: String::new(),
            vm_memory: 8,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
    pub ami_image_id: String,
    pub node_size: String,
    pub vpc_cidr: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: None,
            profile: None,
            ami_image_id: String::new(),
            node_size: "t2.xlarge".into(),
            vpc_cidr: "192.168.100.0/24".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub version: String,

    /// A preinstalled kubectl. When unset, kubectl is downloaded into the
    /// workspace.
    pub kubectl: Option<Utf8PathBuf>,

    pub pod_network_cidr: String,
    pub cni_manifest: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            version: "v1.17.4".into(),
            kubectl: None,
            pod_network_cidr: "10.244.0.0/16".into(),
            cni_manifest: "https://raw.githubusercontent.com/coreos/flannel/\
                           2140ac876ef134e0ed5af15c65e414cf26827915/\
                           Documentation/kube-flannel.yml"
                .into(),
        }
    }
}

impl KubernetesConfig {
    pub fn kubectl_url(&self) -> String {
        format!(
            "https://storage.googleapis.com/kubernetes-release/release/{}/\
             bin/linux/amd64/kubectl",
            self.version
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamRookConfig {
    /// Build the operator image from source instead of using the published
    /// one.
    pub build_rook_from_git: bool,
    pub version: String,
    pub repo: String,
    pub go_version_url: String,
}

impl Default for UpstreamRookConfig {
    fn default() -> Self {
        Self {
            build_rook_from_git: false,
            version: "v1.3.1".into(),
            repo: "https://github.com/rook/rook.git".into(),
            go_version_url: "https://golang.org/VERSION?m=text".into(),
        }
    }
}

/// Settings for vendor (SES) builds of Rook.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SesConfig {
    pub target: String,
    pub targets: BTreeMap<String, SesTarget>,
}

impl Default for SesConfig {
    fn default() -> Self {
        Self { target: "ses7".into(), targets: BTreeMap::new() }
    }
}

impl SesConfig {
    pub fn selected(&self) -> anyhow::Result<&SesTarget> {
        self.targets.get(&self.target).with_context(|| {
            format!("no [ses.targets.{}] section configured", self.target)
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SesTarget {
    /// Package repositories added to every node, by name.
    pub repositories: BTreeMap<String, String>,

    /// Strings replaced in the vendor manifests, original to replacement.
    pub yaml_substitutions: BTreeMap<String, String>,
}

/// Attempt budgets for every wait the harness performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub node_state: PollPolicy,
    pub ssh_ready: PollPolicy,
    pub control_plane: PollPolicy,
    pub pods: PollPolicy,
    pub service: PollPolicy,
    pub osd_prepare: PollPolicy,
    pub mds: PollPolicy,
    pub health: PollPolicy,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            node_state: PollPolicy::from_secs(40, 3),
            ssh_ready: PollPolicy::from_secs(60, 3),
            control_plane: PollPolicy::from_secs(60, 5),
            pods: PollPolicy::from_secs(120, 5),
            service: PollPolicy::from_secs(60, 10),
            osd_prepare: PollPolicy::from_secs(90, 10),
            mds: PollPolicy::from_secs(20, 5),
            health: PollPolicy::from_secs(60, 10),
        }
    }
}

impl Timeouts {
    /// Uses `policy` for every wait.
    pub fn uniform(policy: PollPolicy) -> Self {
        Self {
            node_state: policy,
            ssh_ready: policy,
            control_plane: policy,
            pods: policy,
            service: policy,
            osd_prepare: policy,
            mds: policy,
            health: policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_file_uses_defaults() {
        let config = HarnessConfig::from_toml_str("").unwrap();
        assert_eq!(config.masters, 1);
        assert_eq!(config.workers, 2);
        assert_eq!(config.worker_initial_data_disks, 1);
        assert!(config.cluster_prefix.ends_with("-cephcheck-"));
        assert_eq!(config.provider, ProviderKind::Openstack);
        assert_eq!(config.timeouts.health, PollPolicy::from_secs(60, 10));
        assert!(config.needs_sudo());
    }

    #[test]
    fn sections_and_policies_parse() {
        let config = HarnessConfig::from_toml_str(
            r#"
            provider = "libvirt"
            distro = "SLES_CaaSP"
            workers = 3
            node_image_user = "root"

            [libvirt]
            image = "/var/lib/images/leap.qcow2"

            [timeouts.health]
            attempts = 5
            interval_secs = 0.5

            [ses]
            target = "ses7"
            [ses.targets.ses7.repositories]
            products = "http://example.test/products"
            [ses.targets.ses7.yaml_substitutions]
            "rook/ceph:master" = "registry.example.test/rook/ceph:1.4"
            "#,
        )
        .unwrap();

        assert_eq!(config.provider, ProviderKind::Libvirt);
        assert_eq!(config.distro, Distro::SlesCaasp);
        assert_eq!(config.workers, 3);
        assert!(!config.needs_sudo());
        assert_eq!(config.libvirt.connection, "qemu:///system");
        assert_eq!(
            config.timeouts.health,
            PollPolicy::new(5, Duration::from_millis(500))
        );
        assert_eq!(config.timeouts.pods, PollPolicy::from_secs(120, 5));
        let target = config.ses.selected().unwrap();
        assert_eq!(target.repositories.len(), 1);
        assert_eq!(target.yaml_substitutions.len(), 1);
    }

    #[test]
    fn unknown_keys_and_zero_masters_are_rejected() {
        assert!(HarnessConfig::from_toml_str("mastrs = 2").is_err());
        assert!(HarnessConfig::from_toml_str("masters = 0").is_err());
    }

    #[test]
    fn provider_and_distro_names() {
        assert_eq!("AWS".parse::<ProviderKind>().unwrap(), ProviderKind::AwsEc2);
        assert_eq!(
            "OpenStack".parse::<ProviderKind>().unwrap(),
            ProviderKind::Openstack
        );
        assert_eq!("openSUSE_k8s".parse::<Distro>().unwrap(), Distro::OpensuseK8s);
        assert!("vmware".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn openstack_credentials_fall_back_to_environment() {
        let config = OpenStackConfig {
            username: Some("alice".into()),
            ..Default::default()
        };
        let env = |key: &str| match key {
            "OS_AUTH_URL" => Some("https://keystone.test/v3".to_owned()),
            "OS_USERNAME" => Some("ignored".to_owned()),
            "OS_PASSWORD" => Some("hunter2".to_owned()),
            _ => None,
        };

        let auth = config.resolve_auth_with(env).unwrap();
        assert_eq!(auth.auth_url, "https://keystone.test/v3");
        assert_eq!(auth.username, "alice");
        assert_eq!(auth.password, "hunter2");
        assert_eq!(auth.project_domain_id, "default");
        assert!(!format!("{auth:?}").contains("hunter2"));

        assert!(OpenStackConfig::default().resolve_auth_with(|_| None).is_err());
    }

    #[test]
    fn example_config_parses() {
        let config = HarnessConfig::from_toml_str(include_str!(
            "../../../cephcheck.example.toml"
        ))
        .unwrap();
        assert_eq!(config.cluster_prefix, "ci-cephcheck-");
        assert_eq!(config.timeouts.health, PollPolicy::from_secs(60, 10));
        assert_eq!(config.ses.selected().unwrap().yaml_substitutions.len(), 1);
        assert_eq!(config.timeouts.pods, Timeouts::default().pods);
    }
}
