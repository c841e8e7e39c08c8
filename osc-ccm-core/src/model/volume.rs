use std::fmt::Display;

use super::{Filterable, Tags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeState {
    #[default]
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::InUse => "in-use",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
            VolumeState::Error => "error",
        }
    }
}

impl Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentState {
    #[default]
    Attaching,
    Attached,
    Detaching,
    Detached,
}

impl AttachmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentState::Attaching => "attaching",
            AttachmentState::Attached => "attached",
            AttachmentState::Detaching => "detaching",
            AttachmentState::Detached => "detached",
        }
    }
}

impl Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VolumeAttachment {
    pub instance_id: String,
    pub device: String,
    pub state: AttachmentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Volume {
    pub id: String,
    pub size_gib: i64,
    pub availability_zone: String,
    pub volume_type: String,
    pub iops: Option<i64>,
    pub state: VolumeState,
    pub attachments: Vec<VolumeAttachment>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateVolumeRequest {
    pub availability_zone: String,
    pub size_gib: i64,
    pub volume_type: String,
    pub iops: Option<i64>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
}

impl Filterable for Volume {
    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn attribute_values(&self, name: &str) -> Vec<String> {
        match name {
            "volume-id" => vec![self.id.to_owned()],
            "availability-zone" => vec![self.availability_zone.to_owned()],
            "status" => vec![self.state.as_str().to_owned()],
            _ => Vec::new(),
        }
    }
}
