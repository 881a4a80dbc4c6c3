//! Generated Container Runtime Interface types.
//!
//! The protobuf definition is a trimmed subset of the upstream CRI v1 API;
//! field numbers match upstream so the wire format stays Kubelet-compatible.

pub mod v1 {
    tonic::include_proto!("runtime.v1");
}
