use std::env::{var, VarError};

use anyhow::anyhow;
use derive_builder::Builder;
use thiserror::Error;

/// Global settings of the cloud provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Builder)]
#[builder(default, setter(into))]
pub struct CloudConfig {
    /// Availability zone of the control plane, read from metadata when unset
    #[builder(setter(into, strip_option))]
    pub zone: Option<String>,
    #[builder(setter(into, strip_option))]
    pub vpc: Option<String>,
    #[builder(setter(into, strip_option))]
    pub subnet_id: Option<String>,
    #[builder(setter(into, strip_option))]
    pub route_table_id: Option<String>,
    /// Set when the control plane runs in a different account than the nodes
    #[builder(setter(into, strip_option))]
    pub role_arn: Option<String>,
    /// Legacy `KubernetesCluster` tag value
    #[builder(setter(into, strip_option))]
    pub kubernetes_cluster_tag: Option<String>,
    #[builder(setter(into, strip_option))]
    pub kubernetes_cluster_id: Option<String>,
    /// Pre-existing security group shared by every load balancer, never modified
    #[builder(setter(into, strip_option))]
    pub elb_security_group: Option<String>,
    pub disable_security_group_ingress: bool,
    pub disable_strict_zone_check: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Env var unavailable: {}", .0)]
    VarUnset(VarError),
    #[error("'{}' is not a valid boolean value for {}!", .value, .name)]
    InvalidBool { name: &'static str, value: String },
}

impl CloudConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            zone: optional_var("OSC_CCM_ZONE")?,
            vpc: optional_var("OSC_CCM_VPC")?,
            subnet_id: optional_var("OSC_CCM_SUBNET_ID")?,
            route_table_id: optional_var("OSC_CCM_ROUTE_TABLE_ID")?,
            role_arn: optional_var("OSC_CCM_ROLE_ARN")?,
            kubernetes_cluster_tag: optional_var("OSC_CCM_KUBERNETES_CLUSTER_TAG")?,
            kubernetes_cluster_id: optional_var("OSC_CCM_KUBERNETES_CLUSTER_ID")?,
            elb_security_group: optional_var("OSC_CCM_ELB_SECURITY_GROUP")?,
            disable_security_group_ingress: bool_var("OSC_CCM_DISABLE_SECURITY_GROUP_INGRESS")?,
            disable_strict_zone_check: bool_var("OSC_CCM_DISABLE_STRICT_ZONE_CHECK")?,
        })
    }

    pub fn validated(self) -> anyhow::Result<Self> {
        if let Some(zone) = &self.zone {
            if zone.len() < 2 {
                return Err(anyhow!("Zone '{zone}' is too short to derive a region from!"));
            }
        }

        if let (Some(tag), Some(id)) = (&self.kubernetes_cluster_tag, &self.kubernetes_cluster_id) {
            if tag != id {
                return Err(anyhow!(
                    "Legacy cluster tag '{tag}' and cluster id '{id}' must match when both are set!"
                ));
            }
        }

        Ok(self)
    }

    /// Whether the control plane lives outside of the nodes' account
    pub fn is_cross_account(&self) -> bool {
        self.vpc.is_some()
            && (self.subnet_id.is_some() || self.role_arn.is_some())
            && (self.kubernetes_cluster_tag.is_some() || self.kubernetes_cluster_id.is_some())
    }

    pub fn is_global_security_group(&self, group_id: &str) -> bool {
        self.elb_security_group.as_deref() == Some(group_id)
    }
}

fn optional_var(name: &'static str) -> Result<Option<String>, ConfigError> {
    match var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(error) => Err(ConfigError::VarUnset(error)),
    }
}

fn bool_var(name: &'static str) -> Result<bool, ConfigError> {
    match optional_var(name)? {
        None => Ok(false),
        Some(value) => parse_bool(&value).ok_or(ConfigError::InvalidBool { name, value }),
    }
}

/// Accepts the spellings understood by the annotation and config parsers
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_bool, CloudConfigBuilder};

    #[test]
    fn cross_account_requires_vpc_subnet_or_role_and_a_cluster_tag() {
        let config = CloudConfigBuilder::default()
            .vpc("vpc-1")
            .subnet_id("subnet-1")
            .kubernetes_cluster_id("cluster")
            .build()
            .unwrap();

        assert!(config.is_cross_account());

        let config = CloudConfigBuilder::default()
            .vpc("vpc-1")
            .kubernetes_cluster_id("cluster")
            .build()
            .unwrap();

        assert!(!config.is_cross_account());
    }

    #[test]
    fn validation_rejects_a_truncated_zone() {
        let config = CloudConfigBuilder::default().zone("a").build().unwrap();

        assert!(config.validated().is_err());
    }

    #[test]
    fn validation_rejects_conflicting_cluster_ids() {
        let config = CloudConfigBuilder::default()
            .kubernetes_cluster_tag("one")
            .kubernetes_cluster_id("two")
            .build()
            .unwrap();

        assert!(config.validated().is_err());
    }

    #[test]
    fn bools_accept_the_usual_spellings() {
        assert_eq!(Some(true), parse_bool("True"));
        assert_eq!(Some(false), parse_bool("0"));
        assert_eq!(None, parse_bool("yes"));
    }
}
