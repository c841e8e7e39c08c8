use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use osc_ccm_core::{
    error::{CloudError, RemoteContext, RemoteErrorKind, ResourceKind},
    model::{
        BackendServerDescription, CreateLoadBalancerRequestBuilder, HealthCheck, Instance,
        Listener, ListenerDescription, LoadBalancerDescription, PolicyAttribute,
        PolicyDescription, Tags,
    },
    tagging::ResourceLifecycle,
};

use crate::{cloud::Cloud, security_groups::DEFAULT_SOURCE_GROUP_NAME};

use super::{
    annotations::{
        self, Annotations, HEALTHCHECK_HEALTHY_THRESHOLD, HEALTHCHECK_INTERVAL,
        HEALTHCHECK_TIMEOUT, HEALTHCHECK_UNHEALTHY_THRESHOLD,
    },
    spec::LoadBalancerSpec,
};

pub const PROXY_PROTOCOL_POLICY_NAME: &str = "k8s-proxyprotocol-enabled";
const PROXY_PROTOCOL_POLICY_TYPE: &str = "ProxyProtocolPolicyType";
const SSL_NEGOTIATION_POLICY_TYPE: &str = "SSLNegotiationPolicyType";
const SSL_NEGOTIATION_POLICY_ATTRIBUTE: &str = "Reference-Security-Policy";

/// Tag naming the `namespace/name` of the service a load balancer was created for
pub const SERVICE_NAME_TAG: &str = "kubernetes.io/service-name";

pub const DEFAULT_HEALTHY_THRESHOLD: i64 = 2;
pub const DEFAULT_UNHEALTHY_THRESHOLD: i64 = 6;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: i64 = 5;
pub const DEFAULT_HEALTH_CHECK_INTERVAL: i64 = 10;

pub fn ssl_negotiation_policy_name(policy: &str) -> String {
    format!("k8s-SSLNegotiationPolicy-{policy}")
}

/// `PROTOCOL:port[path]`
pub fn health_check_target(protocol: &str, port: i64, path: &str) -> String {
    format!("{protocol}:{port}{path}")
}

/// Listener changes needed to go from the observed listeners to the desired ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerChanges {
    pub additions: Vec<Listener>,
    pub removed_ports: Vec<i64>,
    /// Node ports of the removed listeners, whose backend policies have to be cleared
    pub removed_instance_ports: BTreeSet<i64>,
}

impl ListenerChanges {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removed_ports.is_empty()
    }
}

pub fn sync_listeners(desired: &[Listener], actual: &[ListenerDescription]) -> ListenerChanges {
    let mut found = vec![false; desired.len()];
    let mut changes = ListenerChanges::default();

    for description in actual {
        let actual_listener = &description.listener;
        match desired
            .iter()
            .position(|listener| listener.is_equivalent(actual_listener))
        {
            Some(index) => found[index] = true,
            None => {
                changes.removed_ports.push(actual_listener.load_balancer_port);
                changes
                    .removed_instance_ports
                    .insert(actual_listener.instance_port);
            }
        }
    }

    changes.additions = desired
        .iter()
        .zip(found)
        .filter(|(_, found)| !found)
        .map(|(listener, _)| listener.to_owned())
        .collect();

    changes
}

/// The health check to apply for `target`, thresholds and timings overridable by annotation
pub fn expected_health_check(target: String, annotations: &Annotations) -> Result<HealthCheck, CloudError> {
    let value = |key: &str, default: i64| -> Result<i64, CloudError> {
        Ok(annotations::parse_i64(annotations, key)?.unwrap_or(default))
    };

    Ok(HealthCheck {
        target,
        healthy_threshold: value(HEALTHCHECK_HEALTHY_THRESHOLD, DEFAULT_HEALTHY_THRESHOLD)?,
        unhealthy_threshold: value(HEALTHCHECK_UNHEALTHY_THRESHOLD, DEFAULT_UNHEALTHY_THRESHOLD)?,
        timeout: value(HEALTHCHECK_TIMEOUT, DEFAULT_HEALTH_CHECK_TIMEOUT)?,
        interval: value(HEALTHCHECK_INTERVAL, DEFAULT_HEALTH_CHECK_INTERVAL)?,
    })
}

fn proxy_protocol_enabled(backend: &BackendServerDescription) -> bool {
    backend
        .policy_names
        .iter()
        .any(|policy| policy == PROXY_PROTOCOL_POLICY_NAME)
}

fn differences<'a>(
    expected: &'a BTreeSet<&'a str>,
    actual: &'a BTreeSet<&'a str>,
) -> (Vec<&'a str>, Vec<&'a str>) {
    (
        expected.difference(actual).copied().collect(),
        actual.difference(expected).copied().collect(),
    )
}

impl Cloud {
    /// The load balancer called `name`, `None` when it doesn't exist
    pub async fn describe_load_balancer(
        &self,
        name: &str,
    ) -> Result<Option<LoadBalancerDescription>, CloudError> {
        let mut load_balancers = match self
            .load_balancing
            .describe_load_balancers(&[name.to_owned()])
            .await
        {
            Ok(load_balancers) => load_balancers,
            Err(error) if error.kind() == RemoteErrorKind::NotFound(ResourceKind::LoadBalancer) => {
                return Ok(None)
            }
            Err(error) => return Err(error).remote_with(|| format!("describe load balancer '{name}'")),
        };

        if load_balancers.len() > 1 {
            warn!("Found {} load balancers named '{name}'!", load_balancers.len());
        }

        Ok(load_balancers.pop())
    }

    async fn require_load_balancer(&self, name: &str) -> Result<LoadBalancerDescription, CloudError> {
        self.describe_load_balancer(name)
            .await?
            .ok_or_else(|| CloudError::not_found(ResourceKind::LoadBalancer, name))
    }

    /// Creates the load balancer, or converges an existing one towards `listeners`,
    /// the proxy protocol setting, the additional tags and the attributes of `spec`.
    /// Subnet and security group drift is only reported.
    pub async fn ensure_load_balancer_resource(
        &self,
        spec: &LoadBalancerSpec,
        listeners: &[Listener],
        subnet_ids: &[String],
        security_group_ids: &[String],
    ) -> Result<LoadBalancerDescription, CloudError> {
        let name = spec.name.as_str();
        let mut dirty = false;

        let existing = match self.describe_load_balancer(name).await? {
            None => {
                self.create_load_balancer(spec, listeners, subnet_ids, security_group_ids)
                    .await?;
                dirty = true;
                None
            }
            Some(load_balancer) => {
                dirty |= self.report_topology_drift(&load_balancer, subnet_ids, security_group_ids);

                let changes = sync_listeners(listeners, &load_balancer.listener_descriptions);
                dirty |= self
                    .apply_listener_changes(&load_balancer, spec.proxy_protocol, &changes)
                    .await?;

                dirty |= self
                    .sync_proxy_protocol(&load_balancer, spec.proxy_protocol, listeners)
                    .await?;

                dirty |= self
                    .sync_additional_tags(&load_balancer, &annotations::additional_tags(&spec.annotations))
                    .await?;

                Some(load_balancer)
            }
        };

        let attributes = self
            .load_balancing
            .describe_load_balancer_attributes(name)
            .await
            .remote_with(|| format!("describe attributes of load balancer '{name}'"))?;

        if attributes != spec.attributes {
            info!("Updating attributes of load balancer '{name}'.");
            debug!("Attributes of load balancer '{name}': {attributes:?} -> {:?}", spec.attributes);
            self.load_balancing
                .modify_load_balancer_attributes(name, &spec.attributes)
                .await
                .remote_with(|| format!("modify attributes of load balancer '{name}'"))?;
            dirty = true;
        }

        match existing {
            Some(load_balancer) if !dirty => Ok(load_balancer),
            _ => self.require_load_balancer(name).await,
        }
    }

    async fn create_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
        listeners: &[Listener],
        subnet_ids: &[String],
        security_group_ids: &[String],
    ) -> Result<(), CloudError> {
        let name = spec.name.as_str();

        let mut tags = annotations::additional_tags(&spec.annotations);
        tags.insert(SERVICE_NAME_TAG.to_owned(), spec.service_name.to_owned());
        let tags = self.tagging.build_tags(ResourceLifecycle::Owned, &tags);

        let mut request = CreateLoadBalancerRequestBuilder::default();
        request
            .name(name)
            .listeners(listeners.to_vec())
            .subnets(subnet_ids.to_vec())
            .tags(tags);

        if spec.internal {
            request.scheme(Some("internal".to_owned()));
        }

        if subnet_ids.is_empty() {
            request.availability_zones(vec![self.self_instance.availability_zone.to_owned()]);
        }

        if !subnet_ids.is_empty() && !security_group_ids.is_empty() {
            request.security_groups(security_group_ids.to_vec());
        }

        let request = request
            .build()
            .map_err(|error| CloudError::validation(format!("Couldn't build load balancer '{name}'! Reason: {error}")))?;

        info!("Creating load balancer '{name}' for service '{}'.", spec.service_name);
        let dns_name = self
            .load_balancing
            .create_load_balancer(&request)
            .await
            .remote_with(|| format!("create load balancer '{name}'"))?;
        debug!("Load balancer '{name}' created with DNS name '{dns_name}'.");

        if spec.proxy_protocol {
            self.create_proxy_protocol_policy(name, false).await?;

            for listener in listeners {
                debug!("Enabling the proxy protocol on port {} of load balancer '{name}'.", listener.instance_port);
                self.set_backend_policies(name, listener.instance_port, &[PROXY_PROTOCOL_POLICY_NAME.to_owned()])
                    .await?;
            }
        }

        Ok(())
    }

    fn report_topology_drift(
        &self,
        load_balancer: &LoadBalancerDescription,
        subnet_ids: &[String],
        security_group_ids: &[String],
    ) -> bool {
        let name = &load_balancer.name;

        let expected = subnet_ids.iter().map(String::as_str).collect::<BTreeSet<_>>();
        let actual = load_balancer.subnets.iter().map(String::as_str).collect::<BTreeSet<_>>();
        let (additions, removals) = differences(&expected, &actual);

        if !additions.is_empty() {
            warn!("Subnets {additions:?} can't be attached to existing load balancer '{name}', manual intervention needed!");
        }
        if !removals.is_empty() {
            warn!("Subnets {removals:?} can't be detached from existing load balancer '{name}', manual intervention needed!");
        }

        let public_cloud = [DEFAULT_SOURCE_GROUP_NAME.to_owned()];
        let actual_groups = match subnet_ids.is_empty() || self.vpc_id.is_empty() {
            true => public_cloud.as_slice(),
            false => load_balancer.security_groups.as_slice(),
        };

        let expected = security_group_ids.iter().map(String::as_str).collect::<BTreeSet<_>>();
        let actual = actual_groups.iter().map(String::as_str).collect::<BTreeSet<_>>();
        if expected != actual {
            warn!(
                "Security groups of load balancer '{name}' are {actual:?} instead of {expected:?}, they can't be changed on an existing load balancer!"
            );
        }

        !additions.is_empty() || !removals.is_empty()
    }

    async fn apply_listener_changes(
        &self,
        load_balancer: &LoadBalancerDescription,
        proxy_protocol: bool,
        changes: &ListenerChanges,
    ) -> Result<bool, CloudError> {
        let name = load_balancer.name.as_str();

        if !changes.removed_ports.is_empty() {
            if proxy_protocol {
                for backend in load_balancer
                    .backend_server_descriptions
                    .iter()
                    .filter(|backend| changes.removed_instance_ports.contains(&backend.instance_port))
                {
                    self.set_backend_policies(name, backend.instance_port, &[]).await?;
                }
            }

            info!("Deleting listeners {:?} of load balancer '{name}'.", changes.removed_ports);
            self.load_balancing
                .delete_load_balancer_listeners(name, &changes.removed_ports)
                .await
                .remote_with(|| format!("delete listeners of load balancer '{name}'"))?;
        }

        if !changes.additions.is_empty() {
            info!(
                "Creating listeners on ports {:?} of load balancer '{name}'.",
                changes
                    .additions
                    .iter()
                    .map(|listener| listener.load_balancer_port)
                    .collect::<Vec<_>>()
            );
            self.load_balancing
                .create_load_balancer_listeners(name, &changes.additions)
                .await
                .remote_with(|| format!("create listeners of load balancer '{name}'"))?;
        }

        Ok(!changes.is_empty())
    }

    async fn sync_proxy_protocol(
        &self,
        load_balancer: &LoadBalancerDescription,
        proxy_protocol: bool,
        listeners: &[Listener],
    ) -> Result<bool, CloudError> {
        let name = load_balancer.name.as_str();

        if proxy_protocol && !self.has_policy(name, PROXY_PROTOCOL_POLICY_NAME).await? {
            self.create_proxy_protocol_policy(name, true).await?;
        }

        let mut backends = load_balancer
            .backend_server_descriptions
            .iter()
            .map(|backend| (backend.instance_port, proxy_protocol_enabled(backend)))
            .collect::<BTreeMap<_, _>>();

        let policies = match proxy_protocol {
            true => vec![PROXY_PROTOCOL_POLICY_NAME.to_owned()],
            false => Vec::new(),
        };

        let mut changed = false;
        for listener in listeners {
            let update = match backends.get(&listener.instance_port) {
                None => proxy_protocol,
                Some(enabled) => *enabled != proxy_protocol,
            };

            if update {
                debug!(
                    "Setting the proxy protocol to {proxy_protocol} on port {} of load balancer '{name}'.",
                    listener.instance_port
                );
                self.set_backend_policies(name, listener.instance_port, &policies).await?;
                backends.insert(listener.instance_port, proxy_protocol);
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Only tags that are missing or carry another value are sent
    async fn sync_additional_tags(
        &self,
        load_balancer: &LoadBalancerDescription,
        requested: &Tags,
    ) -> Result<bool, CloudError> {
        let missing = requested
            .iter()
            .filter(|(key, value)| load_balancer.tags.get(*key) != Some(*value))
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect::<Tags>();

        if missing.is_empty() {
            return Ok(false);
        }

        let name = load_balancer.name.as_str();
        info!("Adding tags {:?} to load balancer '{name}'.", missing.keys().collect::<Vec<_>>());
        self.load_balancing
            .add_tags(name, &missing)
            .await
            .remote_with(|| format!("add tags to load balancer '{name}'"))?;

        Ok(true)
    }

    async fn has_policy(&self, name: &str, policy_name: &str) -> Result<bool, CloudError> {
        match self
            .load_balancing
            .describe_load_balancer_policies(name, &[policy_name.to_owned()])
            .await
        {
            Ok(policies) => Ok(!policies.is_empty()),
            Err(error) if error.kind() == RemoteErrorKind::NotFound(ResourceKind::Policy) => Ok(false),
            Err(error) => {
                Err(error).remote_with(|| format!("describe policy '{policy_name}' of load balancer '{name}'"))
            }
        }
    }

    /// With `update`, a policy that already exists is not an error
    pub async fn create_proxy_protocol_policy(&self, name: &str, update: bool) -> Result<(), CloudError> {
        let policy = PolicyDescription {
            name: PROXY_PROTOCOL_POLICY_NAME.to_owned(),
            type_name: PROXY_PROTOCOL_POLICY_TYPE.to_owned(),
            attributes: vec![PolicyAttribute {
                name: "ProxyProtocol".to_owned(),
                value: "true".to_owned(),
            }],
        };

        info!("Creating proxy protocol policy on load balancer '{name}'.");
        match self.load_balancing.create_load_balancer_policy(name, &policy).await {
            Ok(()) => Ok(()),
            Err(error) if update && error.kind() == RemoteErrorKind::DuplicatePolicy => {
                debug!("Proxy protocol policy already exists on load balancer '{name}'.");
                Ok(())
            }
            Err(error) => Err(error).remote_with(|| format!("create proxy protocol policy of load balancer '{name}'")),
        }
    }

    pub async fn set_backend_policies(
        &self,
        name: &str,
        instance_port: i64,
        policy_names: &[String],
    ) -> Result<(), CloudError> {
        match policy_names.is_empty() {
            true => info!("Removing policies from backend port {instance_port} of load balancer '{name}'."),
            false => info!("Adding policies {policy_names:?} to backend port {instance_port} of load balancer '{name}'."),
        }

        self.load_balancing
            .set_load_balancer_policies_for_backend_server(name, instance_port, policy_names)
            .await
            .remote_with(|| format!("set policies of backend port {instance_port} of load balancer '{name}'"))
    }

    /// Creates the SSL negotiation policy referencing the predefined `policy` unless it exists
    pub async fn ensure_ssl_negotiation_policy(
        &self,
        load_balancer: &LoadBalancerDescription,
        policy: &str,
    ) -> Result<(), CloudError> {
        let name = load_balancer.name.as_str();
        let policy_name = ssl_negotiation_policy_name(policy);

        if self.has_policy(name, &policy_name).await? {
            return Ok(());
        }

        info!("Creating SSL negotiation policy '{policy_name}' on load balancer '{name}'.");
        self.load_balancing
            .create_load_balancer_policy(
                name,
                &PolicyDescription {
                    name: policy_name.to_owned(),
                    type_name: SSL_NEGOTIATION_POLICY_TYPE.to_owned(),
                    attributes: vec![PolicyAttribute {
                        name: SSL_NEGOTIATION_POLICY_ATTRIBUTE.to_owned(),
                        value: policy.to_owned(),
                    }],
                },
            )
            .await
            .remote_with(|| format!("create SSL negotiation policy '{policy_name}' of load balancer '{name}'"))
    }

    /// Binds the SSL negotiation policy to every TLS listener not using it yet
    pub async fn set_ssl_negotiation_policy(
        &self,
        load_balancer: &LoadBalancerDescription,
        policy: &str,
    ) -> Result<(), CloudError> {
        let name = load_balancer.name.as_str();
        let policy_name = ssl_negotiation_policy_name(policy);

        for description in load_balancer
            .listener_descriptions
            .iter()
            .filter(|description| description.listener.is_tls())
            .filter(|description| !description.policy_names.contains(&policy_name))
        {
            let port = description.listener.load_balancer_port;
            info!("Setting SSL negotiation policy '{policy_name}' on port {port} of load balancer '{name}'.");
            self.load_balancing
                .set_load_balancer_policies_of_listener(name, port, &[policy_name.to_owned()])
                .await
                .remote_with(|| format!("set SSL negotiation policy on port {port} of load balancer '{name}'"))?;
        }

        Ok(())
    }

    /// Applies the expected health check, unless every field already matches
    pub async fn ensure_health_check(
        &self,
        load_balancer: &LoadBalancerDescription,
        target: String,
        annotations: &Annotations,
    ) -> Result<(), CloudError> {
        let name = load_balancer.name.as_str();
        let expected = expected_health_check(target, annotations)?;

        if expected == load_balancer.health_check {
            return Ok(());
        }

        info!("Configuring health check '{}' of load balancer '{name}'.", expected.target);
        self.load_balancing
            .configure_health_check(name, &expected)
            .await
            .remote_with(|| format!("configure the health check of load balancer '{name}'"))
    }

    /// Makes sure exactly `instances` are registered with the load balancer
    pub async fn ensure_instances(
        &self,
        name: &str,
        registered: &[String],
        instances: &BTreeMap<String, Instance>,
    ) -> Result<(), CloudError> {
        let expected = instances.keys().map(String::as_str).collect::<BTreeSet<_>>();
        let actual = registered.iter().map(String::as_str).collect::<BTreeSet<_>>();
        let (additions, removals) = differences(&expected, &actual);

        if !additions.is_empty() {
            let additions = additions.into_iter().map(str::to_owned).collect::<Vec<_>>();
            info!("Registering instances {additions:?} with load balancer '{name}'.");
            self.load_balancing
                .register_instances(name, &additions)
                .await
                .remote_with(|| format!("register instances with load balancer '{name}'"))?;
        }

        if !removals.is_empty() {
            let removals = removals.into_iter().map(str::to_owned).collect::<Vec<_>>();
            info!("Deregistering instances {removals:?} from load balancer '{name}'.");
            self.load_balancing
                .deregister_instances(name, &removals)
                .await
                .remote_with(|| format!("deregister instances from load balancer '{name}'"))?;
        }

        Ok(())
    }
}
