use std::str::FromStr;

use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use log::warn;
use osc_ccm_core::{
    error::CloudError,
    helpers::split_comma_list,
    model::{Listener, LoadBalancerAttributes},
    permissions::{IpPermission, IpPermissionSet, IpRange},
};

use crate::helpers::RequireMetadata;

use super::{
    annotations::{self, Annotations, PortSets, BACKEND_PROTOCOL, SOURCE_RANGES, SSL_CERT},
    name::load_balancer_name,
};

const DEFAULT_SOURCE_RANGE: &str = "0.0.0.0/0";
const HEALTH_CHECK_PATH: &str = "/healthz";

/// Frontend protocol terminating TLS in front of the given backend protocol
fn frontend_protocol(backend_protocol: &str) -> Option<&'static str> {
    match backend_protocol {
        "https" | "http" => Some("https"),
        "ssl" | "tcp" => Some("ssl"),
        _ => None,
    }
}

/// A service port that made it past validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePortMapping {
    pub name: Option<String>,
    pub protocol: String,
    pub port: i64,
    pub node_port: i64,
}

/// Everything a reconciliation derives from the service, computed before any remote call
#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancerSpec {
    pub name: String,
    /// `namespace/name`
    pub service_name: String,
    pub annotations: Annotations,
    /// Every declared port, including the ones without a node port
    pub ports: Vec<ServicePortMapping>,
    pub listeners: Vec<Listener>,
    pub source_ranges: Vec<String>,
    pub internal: bool,
    pub proxy_protocol: bool,
    pub nlb: bool,
    pub attributes: LoadBalancerAttributes,
    pub health_check_path_port: Option<(String, i64)>,
}

impl LoadBalancerSpec {
    pub fn from_service(service: &Service) -> Result<Self, CloudError> {
        let name = service.require_name()?;
        let namespace = service.require_namespace()?;
        let annotations = service.metadata.annotations.to_owned().unwrap_or_default();
        let spec = service
            .spec
            .as_ref()
            .ok_or_else(|| CloudError::validation(format!("Service '{namespace}/{name}' has no spec!")))?;

        if let Some(affinity) = spec
            .session_affinity
            .as_deref()
            .filter(|affinity| *affinity != "None")
        {
            return Err(CloudError::validation(format!(
                "Unsupported load balancer session affinity '{affinity}'!"
            )));
        }

        let service_ports = spec.ports.as_deref().unwrap_or_default();
        if service_ports.is_empty() {
            return Err(CloudError::validation("Requested load balancer with no ports!"));
        }

        let ssl_ports = annotations::ssl_ports(&annotations);
        let mut ports = Vec::with_capacity(service_ports.len());
        let mut listeners = Vec::with_capacity(service_ports.len());

        for service_port in service_ports {
            let port = ServicePortMapping::from_port(service_port)?;

            if port.node_port != 0 {
                listeners.push(build_listener(&port, &annotations, &ssl_ports)?);
            } else {
                warn!("Ignoring port {} of service '{namespace}/{name}' without a node port.", port.port);
            }

            ports.push(port);
        }

        if spec
            .load_balancer_ip
            .as_deref()
            .map_or(false, |ip| !ip.is_empty())
        {
            return Err(CloudError::validation("A load balancer IP can't be requested!"));
        }

        let source_ranges = source_ranges(service)?;
        let internal = annotations::is_internal(&annotations);
        let proxy_protocol = annotations::proxy_protocol(&annotations)?;
        let attributes = annotations::load_balancer_attributes(&annotations)?;

        let health_check_path_port = match (
            spec.external_traffic_policy.as_deref(),
            spec.health_check_node_port,
        ) {
            (Some("Local"), Some(port)) if port != 0 => {
                Some((HEALTH_CHECK_PATH.to_owned(), i64::from(port)))
            }
            _ => None,
        };

        Ok(Self {
            name: load_balancer_name(service),
            service_name: format!("{namespace}/{name}"),
            nlb: annotations::is_nlb(&annotations),
            annotations,
            ports,
            listeners,
            source_ranges,
            internal,
            proxy_protocol,
            attributes,
            health_check_path_port,
        })
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        annotations::get(&self.annotations, key)
    }

    /// Node port of the first listener, where plain TCP health checks are aimed
    pub fn first_instance_port(&self) -> Option<i64> {
        self.listeners.first().map(|listener| listener.instance_port)
    }

    /// Ingress of the load balancer's own group: every declared port from the source
    /// ranges, plus the ICMP fragmentation messages path MTU discovery relies on
    pub fn ingress_permissions(&self) -> IpPermissionSet {
        let ranges = self
            .source_ranges
            .iter()
            .map(IpRange::new)
            .collect::<Vec<_>>();

        self.ports
            .iter()
            .map(|port| {
                IpPermission::new(&port.protocol, port.port, port.port)
                    .with_ip_ranges(ranges.iter().cloned())
            })
            .chain([IpPermission::icmp_fragmentation().with_ip_ranges(ranges.iter().cloned())])
            .collect()
    }
}

impl ServicePortMapping {
    fn from_port(port: &ServicePort) -> Result<Self, CloudError> {
        let protocol = port.protocol.as_deref().unwrap_or("TCP");
        if protocol != "TCP" {
            return Err(CloudError::validation(format!(
                "Only TCP load balancers are supported, port {} uses {protocol}!",
                port.port
            )));
        }

        Ok(Self {
            name: port.name.as_ref().map(|name| name.to_lowercase()),
            protocol: protocol.to_lowercase(),
            port: i64::from(port.port),
            node_port: port.node_port.map(i64::from).unwrap_or_default(),
        })
    }
}

/// The listener forwarding `port` to its node port. With a certificate on an SSL port,
/// the frontend terminates TLS in front of the annotated backend protocol.
pub fn build_listener(
    port: &ServicePortMapping,
    annotations: &Annotations,
    ssl_ports: &Option<PortSets>,
) -> Result<Listener, CloudError> {
    let mut listener = Listener {
        protocol: port.protocol.to_owned(),
        load_balancer_port: port.port,
        instance_protocol: port.protocol.to_owned(),
        instance_port: port.node_port,
        ssl_certificate_id: None,
    };

    let backend_protocol = annotations::get(annotations, BACKEND_PROTOCOL).map(str::to_lowercase);

    match annotations::get(annotations, SSL_CERT) {
        Some(certificate)
            if annotations::is_ssl_port(ssl_ports, port.port, port.name.as_deref()) =>
        {
            match backend_protocol {
                None => {
                    listener.protocol = "ssl".to_owned();
                    listener.instance_protocol = "tcp".to_owned();
                }
                Some(backend_protocol) => {
                    listener.protocol = frontend_protocol(&backend_protocol)
                        .ok_or_else(|| {
                            CloudError::validation(format!(
                                "Invalid backend protocol '{backend_protocol}' for certificate '{certificate}' in {BACKEND_PROTOCOL}!"
                            ))
                        })?
                        .to_owned();
                    listener.instance_protocol = backend_protocol;
                }
            }

            listener.ssl_certificate_id = Some(certificate.to_owned());
        }
        _ if backend_protocol.as_deref() == Some("http") => {
            listener.protocol = "http".to_owned();
            listener.instance_protocol = "http".to_owned();
        }
        _ => {}
    }

    Ok(listener)
}

/// Source ranges of the spec, else of the annotation, else everything.
/// Every range is normalized to its network address.
pub fn source_ranges(service: &Service) -> Result<Vec<String>, CloudError> {
    let from_spec = service
        .spec
        .as_ref()
        .and_then(|spec| spec.load_balancer_source_ranges.to_owned())
        .unwrap_or_default();

    let raw = match from_spec.is_empty() {
        false => from_spec,
        true => service
            .annotation(SOURCE_RANGES)
            .map(|value| split_comma_list(value).map(str::to_owned).collect())
            .unwrap_or_default(),
    };

    if raw.is_empty() {
        return Ok(vec![DEFAULT_SOURCE_RANGE.to_owned()]);
    }

    raw.iter()
        .map(|range| {
            IpNet::from_str(range.trim())
                .map(|network| network.trunc().to_string())
                .map_err(|_| {
                    warn!("Service source range '{range}' is not a valid CIDR!");
                    CloudError::validation(format!("Invalid load balancer source range '{range}'!"))
                })
        })
        .collect()
}
