pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
#[cfg(feature = "fake")]
pub mod fake;
pub mod helpers;
pub mod model;
pub mod permissions;
pub mod provider_id;
pub mod tagging;

pub const PROVIDER_NAME: &str = "aws";

/// Tag placed on instances by the node bootstrap, carrying the kubernetes node name
pub const NODE_NAME_TAG: &str = "OscK8sNodeName";
