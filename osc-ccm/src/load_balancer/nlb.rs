use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use osc_ccm_core::{
    error::{CloudError, RemoteContext, ResourceKind},
    model::{Filter, Instance, Listener, SecurityGroup},
    permissions::{IpPermission, IpPermissionSet, IpRange},
};

use crate::cloud::Cloud;

use super::{
    annotations::{self, BACKEND_PROTOCOL, SSL_CERT, SSL_NEGOTIATION_POLICY},
    classic::health_check_target,
    instance_groups::find_security_group_for_instance,
    spec::LoadBalancerSpec,
};

/// Description prefix of the rules opening health check ports to the VPC, the load balancer name is appended
pub const HEALTH_CHECK_RULE_DESCRIPTION: &str = "kubernetes.io/rule/nlb/health";
/// Description prefix of the rules opening traffic ports to the clients, the load balancer name is appended
pub const CLIENT_RULE_DESCRIPTION: &str = "kubernetes.io/rule/nlb/client";
pub const MTU_DISCOVERY_RULE_DESCRIPTION: &str = "kubernetes.io/rule/nlb/mtu";

const TCP: &str = "TCP";
const TLS: &str = "TLS";
const HTTP: &str = "HTTP";

/// How one service port is exposed by a network load balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NlbPortMapping {
    pub frontend_port: i64,
    pub frontend_protocol: String,
    pub traffic_port: i64,
    pub traffic_protocol: String,
    pub health_check_port: i64,
    pub health_check_path: String,
    pub health_check_protocol: String,
    pub ssl_certificate_id: Option<String>,
    pub ssl_policy: Option<String>,
}

fn listener_protocol(protocol: &str) -> String {
    match protocol {
        TLS => "ssl".to_owned(),
        protocol => protocol.to_lowercase(),
    }
}

impl NlbPortMapping {
    /// The listener backing this mapping on the load balancer
    pub fn listener(&self) -> Listener {
        Listener {
            protocol: listener_protocol(&self.frontend_protocol),
            load_balancer_port: self.frontend_port,
            instance_protocol: listener_protocol(&self.traffic_protocol),
            instance_port: self.traffic_port,
            ssl_certificate_id: self.ssl_certificate_id.to_owned(),
        }
    }

    pub fn health_check_target(&self) -> String {
        health_check_target(
            &self.health_check_protocol,
            self.health_check_port,
            &self.health_check_path,
        )
    }
}

/// Port mappings of every service port with a node port. Health checks hit the traffic port
/// over TCP unless the service declares an HTTP health check, which then applies to every port.
pub fn build_port_mappings(spec: &LoadBalancerSpec) -> Vec<NlbPortMapping> {
    let ssl_ports = annotations::ssl_ports(&spec.annotations);
    let certificate = spec.annotation(SSL_CERT);

    spec.ports
        .iter()
        .filter(|port| port.node_port != 0)
        .map(|port| {
            let protocol = port.protocol.to_uppercase();
            let mut mapping = NlbPortMapping {
                frontend_port: port.port,
                frontend_protocol: protocol.to_owned(),
                traffic_port: port.node_port,
                traffic_protocol: protocol,
                health_check_port: port.node_port,
                health_check_path: String::new(),
                health_check_protocol: TCP.to_owned(),
                ssl_certificate_id: None,
                ssl_policy: None,
            };

            if let Some(certificate) = certificate
                .filter(|_| annotations::is_ssl_port(&ssl_ports, port.port, port.name.as_deref()))
            {
                mapping.frontend_protocol = TLS.to_owned();
                mapping.ssl_certificate_id = Some(certificate.to_owned());
                mapping.ssl_policy = spec.annotation(SSL_NEGOTIATION_POLICY).map(str::to_owned);

                if spec.annotation(BACKEND_PROTOCOL) == Some("ssl") {
                    mapping.traffic_protocol = TLS.to_owned();
                }
            }

            if let Some((path, health_check_port)) = &spec.health_check_path_port {
                mapping.health_check_port = *health_check_port;
                mapping.health_check_path = path.to_owned();
                mapping.health_check_protocol = HTTP.to_owned();
            }

            mapping
        })
        .collect()
}

/// Permissions allowing `protocol` on every port from every cidr, described with `description`
fn described_permissions(
    description: &str,
    protocol: &str,
    ports: &BTreeSet<i64>,
    cidrs: &[String],
) -> IpPermissionSet {
    ports
        .iter()
        .flat_map(|port| {
            cidrs.iter().map(move |cidr| {
                IpPermission::new(protocol, *port, *port)
                    .with_ip_ranges([IpRange::described(cidr, description)])
            })
        })
        .collect()
}

/// ICMP fragmentation rules for every source currently allowed by a client rule
fn mtu_permissions(permissions: &IpPermissionSet) -> IpPermissionSet {
    permissions
        .iter()
        .flat_map(|permission| permission.ip_ranges.iter())
        .filter(|range| {
            range
                .description
                .as_deref()
                .map_or(false, |description| description.contains(CLIENT_RULE_DESCRIPTION))
        })
        .map(|range| {
            IpPermission::icmp_fragmentation()
                .with_ip_ranges([IpRange::described(&range.cidr_ip, MTU_DISCOVERY_RULE_DESCRIPTION)])
        })
        .collect()
}

impl Cloud {
    pub async fn vpc_cidr_blocks(&self) -> Result<Vec<String>, CloudError> {
        let mut vpcs = self
            .compute
            .read_vpcs(&[Filter::single("vpc-id", &self.vpc_id)])
            .await
            .remote_with(|| format!("describe VPC '{}'", self.vpc_id))?;

        match vpcs.len() {
            0 => Err(CloudError::not_found(ResourceKind::Vpc, &self.vpc_id)),
            1 => Ok(vpcs.pop().map(|vpc| vpc.cidr_blocks).unwrap_or_default()),
            count => Err(CloudError::Ambiguous {
                kind: ResourceKind::Vpc,
                id: self.vpc_id.to_owned(),
                count,
            }),
        }
    }

    /// Internal load balancers are reached from the VPC, others from the source ranges
    pub async fn nlb_client_cidrs(&self, spec: &LoadBalancerSpec) -> Result<Vec<String>, CloudError> {
        match spec.internal {
            true => self.vpc_cidr_blocks().await,
            false => Ok(spec.source_ranges.to_owned()),
        }
    }

    /// Opens the traffic and health check ports of `port_mappings` on the groups of `instances`.
    /// Rules are scoped by their description, so only the ones of `load_balancer_name` are touched.
    /// Cluster groups outside of `instances` lose every rule of the load balancer.
    pub async fn update_instance_security_groups_for_nlb(
        &self,
        load_balancer_name: &str,
        instances: &BTreeMap<String, Instance>,
        client_cidrs: &[String],
        port_mappings: &[NlbPortMapping],
    ) -> Result<(), CloudError> {
        if self.config.disable_security_group_ingress {
            return Ok(());
        }

        let mut groups = self.get_tagged_security_groups().await?;

        let mut desired_groups = BTreeSet::new();
        for instance in instances.values() {
            match find_security_group_for_instance(instance, &groups)? {
                Some(group) => {
                    desired_groups.insert(group.id);
                }
                None => warn!("Ignoring instance '{}' without security group.", instance.id),
            }
        }

        for group_id in &desired_groups {
            if groups.contains_key(group_id) {
                continue;
            }

            let group = self
                .find_security_group(group_id)
                .await?
                .ok_or_else(|| CloudError::not_found(ResourceKind::SecurityGroup, group_id))?;
            groups.insert(group_id.to_owned(), group);
        }

        let client_ports = port_mappings
            .iter()
            .map(|mapping| mapping.traffic_port)
            .collect::<BTreeSet<_>>();
        let health_check_ports = port_mappings
            .iter()
            .map(|mapping| mapping.health_check_port)
            .collect::<BTreeSet<_>>();

        let client_description = format!("{CLIENT_RULE_DESCRIPTION}={load_balancer_name}");
        let health_description = format!("{HEALTH_CHECK_RULE_DESCRIPTION}={load_balancer_name}");
        let vpc_cidrs = self.vpc_cidr_blocks().await?;

        for (group_id, group) in groups {
            let (health, client) = match desired_groups.contains(&group_id) {
                true => (
                    described_permissions(&health_description, "tcp", &health_check_ports, &vpc_cidrs),
                    described_permissions(&client_description, "tcp", &client_ports, client_cidrs),
                ),
                false => (IpPermissionSet::new(), IpPermissionSet::new()),
            };

            self.reconcile_group_for_nlb(&group, [(health_description.as_str(), health), (client_description.as_str(), client)])
                .await?;
        }

        Ok(())
    }

    async fn reconcile_group_for_nlb(
        &self,
        group: &SecurityGroup,
        rules: [(&str, IpPermissionSet); 2],
    ) -> Result<(), CloudError> {
        let initial = group.ingress.iter().cloned().collect::<IpPermissionSet>().ungroup();
        let mut current = initial.clone();

        for (description, desired) in rules {
            self.reconcile_described_rules(&group.id, &mut current, description, &desired)
                .await?;
        }

        if current != initial {
            let desired = mtu_permissions(&current);
            self.reconcile_described_rules(&group.id, &mut current, MTU_DISCOVERY_RULE_DESCRIPTION, &desired)
                .await?;
        }

        Ok(())
    }

    /// Converges the rules of `current` described with `description` to `desired`,
    /// keeping `current` in line with what was applied
    async fn reconcile_described_rules(
        &self,
        group_id: &str,
        current: &mut IpPermissionSet,
        description: &str,
        desired: &IpPermissionSet,
    ) -> Result<(), CloudError> {
        let grant = desired.difference(current);
        let mut revoke = current.difference(desired);
        revoke.delete_if(|permission| !permission.has_description(description));

        if !revoke.is_empty() {
            let revoke = revoke.list();
            info!("Revoking {} '{description}' rules of security group '{group_id}'.", revoke.len());
            if !self
                .remove_security_group_ingress(group_id, &revoke, false)
                .await?
            {
                warn!("Revoking ingress on '{group_id}' wasn't needed, concurrent change?");
            }
            current.delete(revoke.iter());
        }

        if !grant.is_empty() {
            let grant = grant.list();
            info!("Granting {} '{description}' rules on security group '{group_id}'.", grant.len());
            if !self
                .add_security_group_ingress(group_id, &grant, false)
                .await?
            {
                warn!("Allowing ingress on '{group_id}' wasn't needed, concurrent change?");
            }
            for permission in grant {
                current.insert(permission);
            }
        }

        debug!("Rules '{description}' of security group '{group_id}' are up to date.");
        Ok(())
    }
}
