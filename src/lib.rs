//! A [Container Runtime Interface](https://kubernetes.io/docs/concepts/architecture/cri/)
//! implementation backed by the host service manager.
//!
//! Containers run as transient `.service` units and pods as transient `.scope`
//! units, both created over the message bus. Image root filesystems are
//! imported through `systemd-importd` and managed by `systemd-machined`.
//! Kubelet drives the runtime over gRPC on a local Unix socket.

pub mod api;
pub mod bus;
pub mod cni;
pub mod config;
pub mod containers;
pub mod cri;
pub mod error;
pub mod images;
pub mod locks;
pub mod logging;
pub mod machined;
pub mod metrics;
pub mod notify;
pub mod pods;
pub mod rootfs;
pub mod runtime;
pub mod state;
pub mod store;
pub mod streaming;
pub mod systemd;
