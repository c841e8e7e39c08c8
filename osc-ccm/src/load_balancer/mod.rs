//! Convergence of `LoadBalancer` services. Every entry point recomputes the desired state
//! from the service and diffs it against the remote load balancer, nothing is persisted.

use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use log::{debug, info, warn};
use osc_ccm_core::{
    backoff::{BackoffError, Deadline},
    error::{CloudError, RemoteContext, ResourceKind},
    model::{Filter, Instance, LoadBalancerDescription},
};

use crate::{cloud::Cloud, security_groups::DEFAULT_SOURCE_GROUP_NAME};

use self::{
    annotations::{Annotations, BACKEND_PROTOCOL, EXTRA_SECURITY_GROUPS, SECURITY_GROUPS, SSL_NEGOTIATION_POLICY},
    classic::{expected_health_check, health_check_target},
    name::load_balancer_name,
    nlb::build_port_mappings,
    spec::LoadBalancerSpec,
};

pub mod annotations;
pub mod classic;
pub mod instance_groups;
pub mod name;
pub mod nlb;
pub mod spec;
pub mod subnets;

/// Group deletion fails until the asynchronous load balancer teardown completes
const SECURITY_GROUP_DELETE_DEADLINE: Deadline =
    Deadline::new(Duration::from_secs(10), Duration::from_secs(600));

pub fn load_balancer_status(load_balancer: &LoadBalancerDescription) -> LoadBalancerStatus {
    LoadBalancerStatus {
        ingress: Some(vec![LoadBalancerIngress {
            hostname: Some(load_balancer.dns_name.to_owned()),
            ..Default::default()
        }]),
    }
}

fn service_annotations(service: &Service) -> Annotations {
    service.metadata.annotations.to_owned().unwrap_or_default()
}

/// HTTP on the declared health check port, otherwise TCP (SSL for encrypted backends)
/// on the node port of the first listener
fn classic_health_check_target(spec: &LoadBalancerSpec) -> Result<String, CloudError> {
    if let Some((path, port)) = &spec.health_check_path_port {
        return Ok(health_check_target("HTTP", *port, path));
    }

    let protocol = match spec.annotation(BACKEND_PROTOCOL) {
        Some("https") | Some("ssl") => "SSL",
        _ => "TCP",
    };
    let port = spec.first_instance_port().ok_or_else(|| {
        CloudError::validation(format!(
            "Service '{}' has no port with a node port!",
            spec.service_name
        ))
    })?;

    Ok(health_check_target(protocol, port, ""))
}

impl Cloud {
    pub fn get_load_balancer_name(&self, service: &Service) -> String {
        load_balancer_name(service)
    }

    /// Status of the load balancer of `service` and whether it exists
    pub async fn get_load_balancer(
        &self,
        service: &Service,
    ) -> Result<(Option<LoadBalancerStatus>, bool), CloudError> {
        let name = load_balancer_name(service);

        Ok(match self.describe_load_balancer(&name).await? {
            Some(load_balancer) => (Some(load_balancer_status(&load_balancer)), true),
            None => (None, false),
        })
    }

    /// Creates or converges the load balancer of `service` so it forwards to the instances of `nodes`.
    /// Everything derived from the service is validated before the first mutating call.
    pub async fn ensure_load_balancer(
        &self,
        service: &Service,
        nodes: &[Node],
    ) -> Result<LoadBalancerStatus, CloudError> {
        let spec = LoadBalancerSpec::from_service(service)?;
        info!(
            "Ensuring load balancer '{}' for service '{}' ({} nodes).",
            spec.name,
            spec.service_name,
            nodes.len()
        );

        if spec.nlb {
            let instances = self.find_instances_for_load_balancer(nodes).await?;
            return self.ensure_network_load_balancer(&spec, &instances).await;
        }

        let target = classic_health_check_target(&spec)?;
        expected_health_check(target.to_owned(), &spec.annotations)?;

        let instances = self.find_instances_for_load_balancer(nodes).await?;

        let subnets = self.find_elb_subnets(spec.internal).await?;
        if subnets.is_empty() {
            warn!("Couldn't find any subnet for load balancer '{}'!", spec.name);
        }

        let public_cloud = subnets.is_empty() || self.vpc_id.is_empty();
        let security_groups = match public_cloud {
            true => vec![DEFAULT_SOURCE_GROUP_NAME.to_owned()],
            false => self.build_elb_security_group_list(&spec).await?,
        };

        if !public_cloud {
            if let Some(group_id) = security_groups.first() {
                self.set_security_group_ingress(group_id, &spec.ingress_permissions())
                    .await?;
            }
        }

        let load_balancer = self
            .ensure_load_balancer_resource(&spec, &spec.listeners, &subnets, &security_groups)
            .await?;

        self.ensure_ssl_negotiation(&spec.annotations, &load_balancer)
            .await?;
        self.ensure_health_check(&load_balancer, target, &spec.annotations)
            .await?;
        self.update_instance_security_groups_for_load_balancer(&load_balancer, &instances, &security_groups)
            .await?;
        self.ensure_instances(&load_balancer.name, &load_balancer.instances, &instances)
            .await?;

        Ok(load_balancer_status(&load_balancer))
    }

    async fn ensure_network_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
        instances: &BTreeMap<String, Instance>,
    ) -> Result<LoadBalancerStatus, CloudError> {
        let mappings = build_port_mappings(spec);
        let target = mappings
            .first()
            .map(|mapping| mapping.health_check_target())
            .ok_or_else(|| {
                CloudError::validation(format!(
                    "Service '{}' has no port with a node port!",
                    spec.service_name
                ))
            })?;
        expected_health_check(target.to_owned(), &spec.annotations)?;

        let listeners = mappings
            .iter()
            .map(|mapping| mapping.listener())
            .collect::<Vec<_>>();
        let subnets = self.find_elb_subnets(spec.internal).await?;
        let client_cidrs = self.nlb_client_cidrs(spec).await?;

        let load_balancer = self
            .ensure_load_balancer_resource(spec, &listeners, &subnets, &[])
            .await?;

        self.ensure_ssl_negotiation(&spec.annotations, &load_balancer)
            .await?;
        self.ensure_health_check(&load_balancer, target, &spec.annotations)
            .await?;
        self.ensure_instances(&load_balancer.name, &load_balancer.instances, instances)
            .await?;
        self.update_instance_security_groups_for_nlb(&load_balancer.name, instances, &client_cidrs, &mappings)
            .await?;

        Ok(load_balancer_status(&load_balancer))
    }

    /// Moves the load balancer of `service` to the instances of `nodes`. The load balancer must exist.
    pub async fn update_load_balancer(&self, service: &Service, nodes: &[Node]) -> Result<(), CloudError> {
        let annotations = service_annotations(service);
        if annotations::is_nlb(&annotations) {
            self.ensure_load_balancer(service, nodes).await?;
            return Ok(());
        }

        let name = load_balancer_name(service);
        let instances = self.find_instances_for_load_balancer(nodes).await?;
        let load_balancer = self
            .describe_load_balancer(&name)
            .await?
            .ok_or_else(|| CloudError::not_found(ResourceKind::LoadBalancer, &name))?;

        self.ensure_ssl_negotiation(&annotations, &load_balancer)
            .await?;
        self.ensure_instances(&name, &load_balancer.instances, &instances)
            .await?;

        let security_groups = match load_balancer.security_groups.is_empty() && self.vpc_id.is_empty() {
            true => vec![DEFAULT_SOURCE_GROUP_NAME.to_owned()],
            false => Vec::new(),
        };

        self.update_instance_security_groups_for_load_balancer(&load_balancer, &instances, &security_groups)
            .await
    }

    /// Tears down the load balancer of `service`, the ingress it was granted on the instances,
    /// and the cluster-owned groups it used. A missing load balancer is not an error.
    pub async fn ensure_load_balancer_deleted(&self, service: &Service) -> Result<(), CloudError> {
        let name = load_balancer_name(service);

        let Some(load_balancer) = self.describe_load_balancer(&name).await? else {
            info!("Load balancer '{name}' is already gone.");
            return Ok(());
        };

        if let Err(error) = self
            .ensure_instances(&name, &load_balancer.instances, &BTreeMap::new())
            .await
        {
            warn!("Couldn't deregister instances from load balancer '{name}'! Reason: {error}");
        }

        if annotations::is_nlb(&service_annotations(service)) {
            self.update_instance_security_groups_for_nlb(&name, &BTreeMap::new(), &[], &[])
                .await?;
            return self.delete_load_balancer(&name).await;
        }

        let security_groups = match load_balancer.security_groups.is_empty() && self.vpc_id.is_empty() {
            true => vec![DEFAULT_SOURCE_GROUP_NAME.to_owned()],
            false => load_balancer.security_groups.to_owned(),
        };

        self.update_instance_security_groups_for_load_balancer(&load_balancer, &BTreeMap::new(), &security_groups)
            .await?;
        self.delete_load_balancer(&name).await?;
        self.delete_load_balancer_security_groups(&name, &load_balancer.security_groups)
            .await
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<(), CloudError> {
        info!("Deleting load balancer '{name}'.");
        self.load_balancing
            .delete_load_balancer(name)
            .await
            .remote_with(|| format!("delete load balancer '{name}'"))
    }

    /// Deletes the cluster-tagged groups among `group_ids`, waiting for them to be released
    async fn delete_load_balancer_security_groups(
        &self,
        name: &str,
        group_ids: &[String],
    ) -> Result<(), CloudError> {
        let candidates = group_ids
            .iter()
            .filter(|group_id| !group_id.is_empty())
            .filter(|group_id| {
                let global = self.config.is_global_security_group(group_id);
                if global {
                    debug!("Keeping global security group '{group_id}' of load balancer '{name}'.");
                }
                !global
            })
            .cloned()
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            return Ok(());
        }

        let groups = self
            .compute
            .read_security_groups(&[Filter::new("group-id", candidates)])
            .await
            .remote_with(|| format!("describe security groups of load balancer '{name}'"))?;

        let pending = groups
            .into_iter()
            .filter(|group| {
                let owned = self.tagging.has_cluster_tag(&group.tags);
                if !owned {
                    info!("Ignoring security group '{}' of load balancer '{name}' not tagged for this cluster.", group.id);
                }
                owned
            })
            .map(|group| group.id)
            .collect::<Vec<_>>();
        let pending = tokio::sync::Mutex::new(pending);
        let pending_groups = &pending;

        let result = SECURITY_GROUP_DELETE_DEADLINE
            .poll(|| async move {
                let mut pending = pending_groups.lock().await;
                let mut remaining = Vec::new();

                for group_id in pending.drain(..) {
                    info!("Deleting security group '{group_id}' of load balancer '{name}'.");
                    match self.compute.delete_security_group(&group_id).await {
                        Ok(()) => {}
                        Err(error) if error.kind().is_group_busy() => {
                            debug!("Security group '{group_id}' is still in use, retrying.");
                            remaining.push(group_id);
                        }
                        Err(error) => {
                            return Err(error).remote_with(|| format!("delete security group '{group_id}'"));
                        }
                    }
                }

                let done = remaining.is_empty();
                *pending = remaining;
                Ok(done.then_some(()))
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(BackoffError::Aborted(error)) => Err(error),
            Err(BackoffError::Timeout) => {
                let remaining = pending.lock().await.join(", ");
                Err(CloudError::Timeout(
                    format!("deleting security groups [{remaining}] of load balancer '{name}'").into(),
                ))
            }
        }
    }

    /// The group opened to the clients comes first: the global group, or our own
    /// per-load-balancer group, unless the service names its groups explicitly
    async fn build_elb_security_group_list(&self, spec: &LoadBalancerSpec) -> Result<Vec<String>, CloudError> {
        let mut groups = annotations::security_groups(&spec.annotations, SECURITY_GROUPS);

        if groups.is_empty() {
            let group_id = match &self.config.elb_security_group {
                Some(group_id) => group_id.to_owned(),
                None => {
                    let group_name = format!("k8s-elb-{}", spec.name);
                    let description = format!(
                        "Security group for Kubernetes ELB {} ({})",
                        spec.name, spec.service_name
                    );
                    self.ensure_security_group(
                        &group_name,
                        &description,
                        &annotations::additional_tags(&spec.annotations),
                    )
                    .await?
                }
            };
            groups.push(group_id);
        }

        groups.extend(annotations::security_groups(&spec.annotations, EXTRA_SECURITY_GROUPS));
        Ok(groups)
    }

    async fn ensure_ssl_negotiation(
        &self,
        annotations: &Annotations,
        load_balancer: &LoadBalancerDescription,
    ) -> Result<(), CloudError> {
        let Some(policy) = annotations::get(annotations, SSL_NEGOTIATION_POLICY) else {
            return Ok(());
        };

        self.ensure_ssl_negotiation_policy(load_balancer, policy)
            .await?;
        self.set_ssl_negotiation_policy(load_balancer, policy).await
    }
}
