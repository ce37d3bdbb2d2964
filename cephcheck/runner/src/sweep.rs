// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deletes OpenStack resources that interrupted or kept runs left behind.

use std::io::{BufRead, Write};

use anyhow::Context;
use cephcheck_framework::hardware::openstack::OpenStackConnection;
use cephcheck_framework::hardware::provider::is_not_found;
use cephcheck_framework::hardware::{
    wait_until_state, Connection, Expectation, ListFilter, Resource, ResourceKind,
};
use cephcheck_framework::HarnessConfig;
use globset::{Glob, GlobMatcher};
use tracing::{info, warn};

use crate::config::SweepOptions;

/// Deletion order: nothing is deleted before what depends on it.
const SWEEP_ORDER: [ResourceKind; 7] = [
    ResourceKind::Server,
    ResourceKind::Volume,
    ResourceKind::Router,
    ResourceKind::Subnet,
    ResourceKind::Network,
    ResourceKind::SecurityGroup,
    ResourceKind::Keypair,
];

/// The resources whose names match, in deletion order.
fn select(found: Vec<Resource>, matcher: &GlobMatcher) -> Vec<Resource> {
    let mut selected: Vec<_> =
        found.into_iter().filter(|r| matcher.is_match(&r.name)).collect();
    selected.sort_by_key(|r| SWEEP_ORDER.iter().position(|k| *k == r.kind));
    selected
}

fn confirmed(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn ask(count: usize) -> anyhow::Result<bool> {
    print!("Delete {count} resource(s)? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(confirmed(&answer))
}

pub fn sweep(config: &HarnessConfig, opts: &SweepOptions) -> anyhow::Result<()> {
    let matcher = Glob::new(&opts.search)
        .with_context(|| format!("parsing search pattern {}", opts.search))?
        .compile_matcher();
    let auth = config.openstack.resolve_auth()?;
    let mut conn = OpenStackConnection::open(&auth)?;

    let mut found = Vec::new();
    for kind in SWEEP_ORDER {
        found.extend(conn.list(kind, &ListFilter::All)?);
    }
    let doomed = select(found, &matcher);

    if doomed.is_empty() {
        println!("Nothing matches {}", opts.search);
        return Ok(());
    }
    for resource in &doomed {
        println!("    {} {} ({})", resource.kind, resource.name, resource.id);
    }
    if opts.dry_run {
        println!("\n{} resource(s) would be deleted", doomed.len());
        return Ok(());
    }
    if !opts.yes && !ask(doomed.len())? {
        println!("Aborted");
        return Ok(());
    }

    let mut failures = 0;
    let mut servers = Vec::new();
    for resource in &doomed {
        // Volumes stay attached until their server is gone.
        if resource.kind != ResourceKind::Server && !servers.is_empty() {
            for server in servers.drain(..) {
                if let Err(e) = wait_until_state(
                    &mut conn,
                    &server,
                    &Expectation::Absent,
                    config.timeouts.node_state,
                ) {
                    warn!(resource = %server, error = ?e, "Server did not go away");
                }
            }
        }

        match conn.delete(resource) {
            Ok(()) => {
                if resource.kind == ResourceKind::Server {
                    servers.push(resource.clone());
                }
            }
            Err(e) if is_not_found(&e) => info!(%resource, "Already gone"),
            Err(e) => {
                warn!(%resource, error = ?e, "Delete failed");
                failures += 1;
            }
        }
    }

    anyhow::ensure!(failures == 0, "{failures} resource(s) could not be deleted");
    println!("Deleted {} resource(s)", doomed.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cephcheck_framework::hardware::ResourceState;

    fn resource(kind: ResourceKind, name: &str) -> Resource {
        Resource::new(kind, format!("id-{name}"), name, ResourceState::Available)
    }

    #[test]
    fn matching_resources_come_back_in_deletion_order() {
        let matcher = Glob::new("cephcheck*").unwrap().compile_matcher();
        let found = vec![
            resource(ResourceKind::Keypair, "cephcheck-ab12c-key"),
            resource(ResourceKind::Network, "cephcheck-ab12c-net"),
            resource(ResourceKind::Server, "someone-else"),
            resource(ResourceKind::Volume, "cephcheck-ab12c-worker-0-volume-qwert"),
            resource(ResourceKind::Server, "cephcheck-ab12c-worker-0"),
            resource(ResourceKind::Router, "cephcheck-ab12c-router"),
        ];

        let kinds: Vec<_> = select(found, &matcher).iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [
                ResourceKind::Server,
                ResourceKind::Volume,
                ResourceKind::Router,
                ResourceKind::Network,
                ResourceKind::Keypair,
            ]
        );
    }

    #[test]
    fn glob_is_anchored() {
        let matcher = Glob::new("cephcheck*").unwrap().compile_matcher();
        let found = vec![resource(ResourceKind::Server, "alice-cephcheck-xyz12-master-0")];
        assert!(select(found, &matcher).is_empty());
    }

    #[test]
    fn only_yes_confirms() {
        assert!(confirmed("y\n"));
        assert!(confirmed("YES"));
        assert!(!confirmed("\n"));
        assert!(!confirmed("no"));
    }
}
