//! A Cluster API infrastructure provider for bare-metal devices.
//!
//! [`controller::machine`] turns `MetalMachine`s into devices, [`controller::cluster`] provides
//! the control plane endpoint of each `MetalCluster` through one of the [`vip`] strategies.

pub mod cli;
pub mod controller;
pub mod crd;
pub mod device;
pub mod logging;
pub mod namespace;
pub mod preflight;
pub mod provisioner;
pub mod scope;
pub mod status;
pub mod vip;

#[cfg(test)]
mod testing;
