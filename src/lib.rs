//! # Ducker
//! A single-host container runtime. Images are stacks of content-addressed
//! layers composed with an overlay mount, containers are processes isolated
//! in fresh UTS/PID/mount/network namespaces with cgroup limits, and a
//! bridge driver wires each container into a virtual network with NAT for
//! egress and port publishing.

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod cgroups;
pub mod commands;
pub mod container;
pub mod image;
pub mod logger;
pub mod network;
pub mod store;
pub mod utils;
pub mod volume;
