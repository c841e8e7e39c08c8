use crate::permissions::IpPermission;

use super::{Filterable, Tags};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub description: String,
    pub vpc_id: String,
    pub owner_id: String,
    pub ingress: Vec<IpPermission>,
    pub tags: Tags,
}

/// What an ingress authorize/revoke call operates on
#[derive(Debug, Clone, PartialEq)]
pub enum IngressRequest {
    Permissions(Vec<IpPermission>),
    /// Public-cloud mode: the rule is expressed as a named peer group
    SourceGroup { name: String, owner_id: String },
}

impl Filterable for SecurityGroup {
    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn attribute_values(&self, name: &str) -> Vec<String> {
        match name {
            "group-id" => vec![self.id.to_owned()],
            "group-name" => vec![self.name.to_owned()],
            "vpc-id" => vec![self.vpc_id.to_owned()],
            "ip-permission.group-id" => self
                .ingress
                .iter()
                .flat_map(|permission| permission.user_id_group_pairs.iter())
                .filter_map(|pair| pair.group_id.to_owned())
                .collect(),
            "ip-permission.group-name" => self
                .ingress
                .iter()
                .flat_map(|permission| permission.user_id_group_pairs.iter())
                .filter_map(|pair| pair.group_name.to_owned())
                .collect(),
            _ => Vec::new(),
        }
    }
}
