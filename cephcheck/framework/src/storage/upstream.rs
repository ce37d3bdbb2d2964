// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rook from its upstream git repository, optionally built from source.

use std::collections::BTreeMap;

use anyhow::Context;
use camino::Utf8Path;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{recursive_replace, BuiltArtifact, BuiltImage, PreparedArtifact, StorageSource};
use crate::artifacts::Downloader;
use crate::config::UpstreamRookConfig;
use crate::execute::Exec;
use crate::kubernetes::OrchestrationPlane;
use crate::workspace::Workspace;

/// Copies the saved operator image to every node and loads it.
pub const IMAGE_UPLOAD_PLAYBOOK: &str = "playbook_rook_upstream.yml";

const IMAGE_ARCHIVE: &str = "rook-ceph.tar.gz";
const MANIFEST_DIR: &str = "cluster/examples/kubernetes/ceph";

#[derive(Debug)]
pub struct Upstream {
    config: UpstreamRookConfig,
}

impl Upstream {
    pub fn new(config: &UpstreamRookConfig) -> Self {
        Self { config: config.clone() }
    }

    pub fn image_reference(&self) -> String {
        format!("rook/ceph:{}-cephcheck", self.config.version)
    }

    fn clone_repo(&self, workspace: &Workspace, dest: &Utf8Path) -> anyhow::Result<()> {
        if dest.join(".git").exists() {
            info!(%dest, "Rook already cloned");
            return Ok(());
        }
        info!(version = %self.config.version, repo = %self.config.repo, "Cloning Rook");
        workspace.execute(
            Exec::new("git")
                .args(["clone", "-b", self.config.version.as_str(), self.config.repo.as_str()])
                .arg(dest.as_str())
                .quiet(),
        )?;
        Ok(())
    }

    /// Unpacks the current Go release into the workspace's `bin/go`.
    fn fetch_go(&self, workspace: &Workspace) -> anyhow::Result<()> {
        let bin = workspace.bin_dir()?;
        if bin.join("go/bin/go").exists() {
            return Ok(());
        }
        let downloader = Downloader::default();
        let listing = downloader.fetch_text(&self.config.go_version_url)?;
        let version = go_release(&listing)?;
        info!(%version, "Fetching Go toolchain");
        downloader.fetch_and_unpack(
            &format!("https://dl.google.com/go/{version}.linux-amd64.tar.gz"),
            &bin,
        )
    }
}

/// The release name is the first line of the version listing, e.g.
/// `go1.14.2`.
fn go_release(listing: &str) -> anyhow::Result<&str> {
    listing
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("go"))
        .context("no Go release in version listing")
}

#[derive(Deserialize)]
struct Deployment {
    spec: Option<PodTemplate>,
}

#[derive(Deserialize)]
struct PodTemplate {
    template: Option<PodSpecWrapper>,
}

#[derive(Deserialize)]
struct PodSpecWrapper {
    spec: Option<PodSpec>,
}

#[derive(Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Deserialize)]
struct Container {
    image: Option<String>,
}

/// The image of the first container of the first pod template in a
/// multi-document manifest.
pub fn operator_image(manifest: &str) -> anyhow::Result<String> {
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let Ok(deployment) = Deployment::deserialize(document) else {
            continue;
        };
        let image = deployment
            .spec
            .and_then(|s| s.template)
            .and_then(|t| t.spec)
            .and_then(|s| s.containers.into_iter().next())
            .and_then(|c| c.image);
        if let Some(image) = image {
            return Ok(image);
        }
    }
    anyhow::bail!("no container image in operator manifest")
}

impl StorageSource for Upstream {
    fn name(&self) -> &'static str {
        "upstream"
    }

    fn build(&self, workspace: &Workspace) -> anyhow::Result<BuiltArtifact> {
        let build_dir = workspace.build_dir()?.join("rook");
        self.clone_repo(workspace, &build_dir)?;
        let manifests = build_dir.join(MANIFEST_DIR);
        if !self.config.build_rook_from_git {
            return Ok(BuiltArtifact::new(manifests, None));
        }

        self.fetch_go(workspace)?;
        let bin = workspace.bin_dir()?;
        let tmp = workspace.tmp_dir()?;
        let path = std::env::var("PATH").unwrap_or_default();

        info!("Compiling Rook");
        workspace.execute(
            Exec::new("make")
                .args(["--directory", build_dir.as_str(), "-j"])
                .args(["BUILD_REGISTRY=rook-build", "IMAGES=ceph"])
                .env("PATH", format!("{bin}/go/bin:{path}"))
                .env("TMPDIR", tmp.as_str())
                .env("GOCACHE", tmp.as_str())
                .env("GOPATH", workspace.build_dir()?.as_str())
                .quiet(),
        )?;

        let reference = self.image_reference();
        info!(%reference, "Tagging image");
        workspace.execute(Exec::new("docker").args(["tag", "rook-build/ceph-amd64", reference.as_str()]))?;

        let archive = build_dir.join(IMAGE_ARCHIVE);
        info!(%archive, "Saving image");
        workspace.execute(Exec::shell(format!("docker save {reference} | gzip > {archive}")))?;

        Ok(BuiltArtifact::new(manifests, Some(BuiltImage { reference, archive })))
    }

    fn preinstall(
        &self,
        plane: &OrchestrationPlane,
        built: BuiltArtifact,
    ) -> anyhow::Result<PreparedArtifact> {
        let Some(image) = &built.image else {
            return Ok(PreparedArtifact::new(built.manifests));
        };

        info!(archive = %image.archive, "Uploading operator image to every node");
        plane.hardware().run_playbook(
            IMAGE_UPLOAD_PLAYBOOK,
            &[],
            Some(json!({ "rook_image_archive": image.archive })),
        )?;

        let operator = built.manifests.join("operator.yaml");
        let manifest = std::fs::read_to_string(&operator)
            .with_context(|| format!("reading {operator}"))?;
        let published = operator_image(&manifest)?;
        info!(from = %published, to = %image.reference, "Pointing manifests at the built image");
        let replacements = BTreeMap::from([(published, image.reference.clone())]);
        recursive_replace(&built.manifests, &replacements)?;

        Ok(PreparedArtifact::new(built.manifests))
    }
}
