// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cephcheck framework: provisioning nodes, bootstrapping Kubernetes on
//! them and installing Rook/Ceph on top, for end-to-end storage tests.

pub mod artifacts;
pub mod bringup;
pub mod config;
pub mod execute;
pub mod hardware;
pub mod inventory;
pub mod keys;
pub mod kubernetes;
pub mod poll;
pub mod remote;
pub mod storage;
#[cfg(test)]
mod testing;
pub mod workspace;

pub use bringup::{BringUp, Environment, Stage};
pub use config::HarnessConfig;
