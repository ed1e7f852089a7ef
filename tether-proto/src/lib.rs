//! Tether protocol - protobuf types for the control plane.

/// Generated protobuf types.
pub mod controlplane {
    tonic::include_proto!("controlplane.v1");
}

pub mod envelope;

pub use controlplane::*;
