use std::{borrow::Cow, fmt::Display};

use thiserror::Error;

use crate::tagging::TaggingError;

/// Error codes reported by the remote API. API implementations produce them,
/// reconcilers only ever look at [`ApiError::kind`].
pub mod codes {
    pub const LOAD_BALANCER_NOT_FOUND: &str = "LoadBalancerNotFound";
    pub const POLICY_NOT_FOUND: &str = "PolicyNotFound";
    pub const DUPLICATE_POLICY_NAME: &str = "DuplicatePolicyName";
    pub const VOLUME_NOT_FOUND: &str = "InvalidVolume.NotFound";
    pub const VOLUME_IN_USE: &str = "VolumeInUse";
    pub const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";
    pub const GROUP_NOT_FOUND: &str = "InvalidGroup.NotFound";
    pub const GROUP_DUPLICATE: &str = "InvalidGroup.Duplicate";
    pub const GROUP_IN_USE: &str = "InvalidGroup.InUse";
    pub const PERMISSION_DUPLICATE: &str = "InvalidPermission.Duplicate";
    pub const DEPENDENCY_VIOLATION: &str = "DependencyViolation";
    pub const ROUTE_TABLE_NOT_FOUND: &str = "InvalidRouteTableID.NotFound";
}

/// A failure reported by the remote API, carrying its native error code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    NotFound(ResourceKind),
    DuplicateGroup,
    DuplicatePermission,
    DuplicatePolicy,
    DependencyViolation,
    GroupInUse,
    VolumeInUse,
    Other,
}

impl RemoteErrorKind {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteErrorKind::NotFound(_))
    }

    /// The security group can't be deleted yet because something still references it
    pub fn is_group_busy(&self) -> bool {
        matches!(
            self,
            RemoteErrorKind::DependencyViolation | RemoteErrorKind::GroupInUse
        )
    }
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The only place where remote error codes are interpreted
    pub fn kind(&self) -> RemoteErrorKind {
        match self.code.as_str() {
            codes::LOAD_BALANCER_NOT_FOUND => RemoteErrorKind::NotFound(ResourceKind::LoadBalancer),
            codes::POLICY_NOT_FOUND => RemoteErrorKind::NotFound(ResourceKind::Policy),
            codes::VOLUME_NOT_FOUND => RemoteErrorKind::NotFound(ResourceKind::Volume),
            codes::INSTANCE_NOT_FOUND => RemoteErrorKind::NotFound(ResourceKind::Instance),
            codes::GROUP_NOT_FOUND => RemoteErrorKind::NotFound(ResourceKind::SecurityGroup),
            codes::ROUTE_TABLE_NOT_FOUND => RemoteErrorKind::NotFound(ResourceKind::RouteTable),
            codes::GROUP_DUPLICATE => RemoteErrorKind::DuplicateGroup,
            codes::PERMISSION_DUPLICATE => RemoteErrorKind::DuplicatePermission,
            codes::DUPLICATE_POLICY_NAME => RemoteErrorKind::DuplicatePolicy,
            codes::DEPENDENCY_VIOLATION => RemoteErrorKind::DependencyViolation,
            codes::GROUP_IN_USE => RemoteErrorKind::GroupInUse,
            codes::VOLUME_IN_USE => RemoteErrorKind::VolumeInUse,
            _ => RemoteErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Instance,
    Node,
    Volume,
    LoadBalancer,
    Policy,
    SecurityGroup,
    Subnet,
    RouteTable,
    Vpc,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResourceKind::Instance => "Instance",
            ResourceKind::Node => "Node",
            ResourceKind::Volume => "Volume",
            ResourceKind::LoadBalancer => "Load balancer",
            ResourceKind::Policy => "Load balancer policy",
            ResourceKind::SecurityGroup => "Security group",
            ResourceKind::Subnet => "Subnet",
            ResourceKind::RouteTable => "Route table",
            ResourceKind::Vpc => "VPC",
        })
    }
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{} '{}' couldn't be found!", .kind, .id)]
    NotFound { kind: ResourceKind, id: String },
    #[error("Found {} resources of kind '{}' matching '{}', expected at most one!", .count, .kind, .id)]
    Ambiguous {
        kind: ResourceKind,
        id: String,
        count: usize,
    },
    #[error("Invalid configuration! {}", .0)]
    Validation(Cow<'static, str>),
    #[error("Couldn't {}! Reason: {}", .operation, .source)]
    Remote {
        operation: Cow<'static, str>,
        source: ApiError,
    },
    #[error("Timed out {}!", .0)]
    Timeout(Cow<'static, str>),
    #[error("Node informer hasn't synced yet!")]
    NodeNotSynced,
    #[error("Too many volumes attached to node '{}'!", .0)]
    DevicesExhausted(String),
    #[error(
        "Volume '{}' is still attached to instance '{}' (node '{}') at '{}'!",
        .volume_id,
        .instance_id,
        .node_name.as_deref().unwrap_or("---"),
        .device
    )]
    DanglingVolume {
        volume_id: String,
        instance_id: String,
        node_name: Option<String>,
        device: String,
    },
    #[error("Volume '{}' is in use and can't be modified!", .0)]
    VolumeInUse(String),
    #[error("Volume '{}' disappeared after creation, check that the encryption key exists and is usable!", .0)]
    VolumeDisappeared(String),
    #[error("Volume '{}' is attached unexpectedly! {}", .volume_id, .details)]
    AttachmentMismatch { volume_id: String, details: String },
    #[error("Couldn't manage cluster tags! Reason: {}", .0)]
    Tagging(#[from] TaggingError),
}

impl CloudError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Validation(message.into())
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            CloudError::Remote { source, .. } => Some(source),
            CloudError::Tagging(TaggingError::Create { source, .. }) => Some(source),
            _ => None,
        }
    }

    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        self.api_error().map(ApiError::kind)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
            || self.remote_kind().is_some_and(|kind| kind.is_not_found())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CloudError::Timeout(_))
    }
}

/// Attaches operation context to remote API results
pub trait RemoteContext<T> {
    fn remote(self, operation: impl Into<Cow<'static, str>>) -> Result<T, CloudError>;
    fn remote_with<F, S>(self, operation: F) -> Result<T, CloudError>
    where
        F: FnOnce() -> S,
        S: Into<Cow<'static, str>>;
}

impl<T> RemoteContext<T> for Result<T, ApiError> {
    fn remote(self, operation: impl Into<Cow<'static, str>>) -> Result<T, CloudError> {
        self.map_err(|source| CloudError::Remote {
            operation: operation.into(),
            source,
        })
    }

    fn remote_with<F, S>(self, operation: F) -> Result<T, CloudError>
    where
        F: FnOnce() -> S,
        S: Into<Cow<'static, str>>,
    {
        self.map_err(|source| CloudError::Remote {
            operation: operation().into(),
            source,
        })
    }
}
