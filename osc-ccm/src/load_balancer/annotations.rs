use std::collections::{BTreeMap, BTreeSet};

use osc_ccm_core::{
    config::parse_bool,
    error::CloudError,
    helpers::split_comma_list,
    model::{AccessLog, LoadBalancerAttributes, Tags},
};

pub type Annotations = BTreeMap<String, String>;

macro_rules! annotation {
    ($name:ident, $suffix:literal) => {
        pub const $name: &str = concat!("service.beta.kubernetes.io/aws-load-balancer-", $suffix);
    };
}

annotation!(TYPE, "type");
annotation!(INTERNAL, "internal");
annotation!(PROXY_PROTOCOL, "proxy-protocol");
annotation!(ACCESS_LOG_EMIT_INTERVAL, "access-log-emit-interval");
annotation!(ACCESS_LOG_ENABLED, "access-log-enabled");
annotation!(ACCESS_LOG_S3_BUCKET_NAME, "access-log-s3-bucket-name");
annotation!(ACCESS_LOG_S3_BUCKET_PREFIX, "access-log-s3-bucket-prefix");
annotation!(CONNECTION_DRAINING_ENABLED, "connection-draining-enabled");
annotation!(CONNECTION_DRAINING_TIMEOUT, "connection-draining-timeout");
annotation!(CONNECTION_IDLE_TIMEOUT, "connection-idle-timeout");
annotation!(EXTRA_SECURITY_GROUPS, "extra-security-groups");
annotation!(SECURITY_GROUPS, "security-groups");
annotation!(SSL_CERT, "ssl-cert");
annotation!(SSL_PORTS, "ssl-ports");
annotation!(SSL_NEGOTIATION_POLICY, "ssl-negotiation-policy");
annotation!(BACKEND_PROTOCOL, "backend-protocol");
annotation!(ADDITIONAL_RESOURCE_TAGS, "additional-resource-tags");
annotation!(HEALTHCHECK_HEALTHY_THRESHOLD, "healthcheck-healthy-threshold");
annotation!(HEALTHCHECK_UNHEALTHY_THRESHOLD, "healthcheck-unhealthy-threshold");
annotation!(HEALTHCHECK_TIMEOUT, "healthcheck-timeout");
annotation!(HEALTHCHECK_INTERVAL, "healthcheck-interval");

pub const LOAD_BALANCER_NAME: &str = "service.beta.kubernetes.io/osc-load-balancer-name";
pub const LOAD_BALANCER_NAME_LENGTH: &str = "service.beta.kubernetes.io/osc-load-balancer-name-length";
pub const SOURCE_RANGES: &str = "service.beta.kubernetes.io/load-balancer-source-ranges";

/// Value of [`TYPE`] selecting the network load balancer flavour
pub const NLB_TYPE: &str = "nlb";

fn invalid(key: &str, value: &str) -> CloudError {
    CloudError::validation(format!("Couldn't parse service annotation {key}={value}!"))
}

pub fn get<'a>(annotations: &'a Annotations, key: &str) -> Option<&'a str> {
    annotations
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

pub fn parse_i64(annotations: &Annotations, key: &str) -> Result<Option<i64>, CloudError> {
    get(annotations, key)
        .map(|value| value.trim().parse::<i64>().map_err(|_| invalid(key, value)))
        .transpose()
}

pub fn parse_flag(annotations: &Annotations, key: &str) -> Result<Option<bool>, CloudError> {
    get(annotations, key)
        .map(|value| parse_bool(value).ok_or_else(|| invalid(key, value)))
        .transpose()
}

pub fn is_nlb(annotations: &Annotations) -> bool {
    get(annotations, TYPE) == Some(NLB_TYPE)
}

/// `"false"` means external, any other non-empty value means internal
pub fn is_internal(annotations: &Annotations) -> bool {
    match get(annotations, INTERNAL) {
        None | Some("false") => false,
        Some(_) => true,
    }
}

/// Only `*`, enabling the proxy protocol on every backend, is supported
pub fn proxy_protocol(annotations: &Annotations) -> Result<bool, CloudError> {
    match get(annotations, PROXY_PROTOCOL) {
        None => Ok(false),
        Some("*") => Ok(true),
        Some(value) => Err(CloudError::validation(format!(
            "Annotation {PROXY_PROTOCOL}={value} detected, but the only supported value is '*'!"
        ))),
    }
}

/// `K1=V1,K2=,K3`, keys without a value get an empty one
pub fn additional_tags(annotations: &Annotations) -> Tags {
    let Some(list) = get(annotations, ADDITIONAL_RESOURCE_TAGS) else {
        return Tags::new();
    };

    split_comma_list(list)
        .filter_map(|entry| {
            let mut parts = entry.split('=');
            let key = parts.next().map(str::trim).filter(|key| !key.is_empty())?;
            let value = parts.next().map(str::trim).unwrap_or_default();

            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

pub fn security_groups(annotations: &Annotations, key: &str) -> Vec<String> {
    get(annotations, key)
        .map(|list| split_comma_list(list).map(str::to_owned).collect())
        .unwrap_or_default()
}

/// Service ports terminating TLS, by number or by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSets {
    pub numbers: BTreeSet<i64>,
    pub names: BTreeSet<String>,
}

impl PortSets {
    pub fn contains(&self, number: i64, name: Option<&str>) -> bool {
        self.numbers.contains(&number) || name.map_or(false, |name| self.names.contains(name))
    }
}

/// `None` means every port, which is also what `*` selects
pub fn ssl_ports(annotations: &Annotations) -> Option<PortSets> {
    let list = get(annotations, SSL_PORTS)?;

    let mut ports = PortSets::default();
    for entry in split_comma_list(list) {
        if entry == "*" {
            return None;
        }

        match entry.parse::<i64>() {
            Ok(number) => ports.numbers.insert(number),
            Err(_) => ports.names.insert(entry.to_owned()),
        };
    }

    Some(ports)
}

pub fn is_ssl_port(ssl_ports: &Option<PortSets>, number: i64, name: Option<&str>) -> bool {
    ssl_ports
        .as_ref()
        .map_or(true, |ports| ports.contains(number, name))
}

/// Desired attributes: draining off and a 60s idle timeout unless overridden.
/// Access logs are configured only when both the bucket name and prefix are set.
pub fn load_balancer_attributes(annotations: &Annotations) -> Result<LoadBalancerAttributes, CloudError> {
    let mut attributes = LoadBalancerAttributes::default();

    if let (Some(bucket_name), Some(bucket_prefix)) = (
        get(annotations, ACCESS_LOG_S3_BUCKET_NAME),
        get(annotations, ACCESS_LOG_S3_BUCKET_PREFIX),
    ) {
        attributes.access_log = Some(AccessLog {
            enabled: parse_flag(annotations, ACCESS_LOG_ENABLED)?.unwrap_or(false),
            emit_interval: parse_i64(annotations, ACCESS_LOG_EMIT_INTERVAL)?,
            s3_bucket_name: Some(bucket_name.to_owned()),
            s3_bucket_prefix: Some(bucket_prefix.to_owned()),
        });
    }

    if let Some(enabled) = parse_flag(annotations, CONNECTION_DRAINING_ENABLED)? {
        attributes.connection_draining.enabled = enabled;
    }

    attributes.connection_draining.timeout = parse_i64(annotations, CONNECTION_DRAINING_TIMEOUT)?;

    if let Some(idle_timeout) = parse_i64(annotations, CONNECTION_IDLE_TIMEOUT)? {
        attributes.idle_timeout = idle_timeout;
    }

    Ok(attributes)
}
