use std::{fmt::Display, str::FromStr};

use super::{Filterable, Tags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InstanceState {
    #[default]
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    /// Every state but `terminated`
    pub const ALIVE: [InstanceState; 5] = [
        InstanceState::Pending,
        InstanceState::Running,
        InstanceState::ShuttingDown,
        InstanceState::Stopping,
        InstanceState::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceState::Pending),
            "running" => Ok(InstanceState::Running),
            "shutting-down" => Ok(InstanceState::ShuttingDown),
            "terminated" => Ok(InstanceState::Terminated),
            "stopping" => Ok(InstanceState::Stopping),
            "stopped" => Ok(InstanceState::Stopped),
            other => Err(format!("'{other}' is not a valid instance state!")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockDeviceMapping {
    /// Device name as reported by the API, e.g. `/dev/xvdba`
    pub device_name: String,
    pub volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupIdentifier {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instance {
    pub id: String,
    pub instance_type: String,
    pub state: InstanceState,
    pub availability_zone: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub private_dns_name: String,
    pub private_ip: Option<String>,
    pub public_dns_name: Option<String>,
    pub public_ip: Option<String>,
    pub source_dest_check: bool,
    pub block_devices: Vec<BlockDeviceMapping>,
    pub security_groups: Vec<GroupIdentifier>,
    pub tags: Tags,
}

impl Instance {
    /// Kubernetes node name of the instance
    pub fn node_name(&self) -> &str {
        &self.private_dns_name
    }
}

impl Filterable for Instance {
    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn attribute_values(&self, name: &str) -> Vec<String> {
        match name {
            "instance-id" => vec![self.id.to_owned()],
            "instance-state-name" => vec![self.state.as_str().to_owned()],
            "private-dns-name" => vec![self.private_dns_name.to_owned()],
            "vpc-id" => vec![self.vpc_id.to_owned()],
            "subnet-id" => vec![self.subnet_id.to_owned()],
            "availability-zone" => vec![self.availability_zone.to_owned()],
            _ => Vec::new(),
        }
    }
}
