use derive_builder::Builder;

use super::Tags;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Listener {
    pub protocol: String,
    pub load_balancer_port: i64,
    pub instance_protocol: String,
    pub instance_port: i64,
    pub ssl_certificate_id: Option<String>,
}

impl Listener {
    pub fn tcp(load_balancer_port: i64, instance_port: i64) -> Self {
        Self {
            protocol: "tcp".to_owned(),
            load_balancer_port,
            instance_protocol: "tcp".to_owned(),
            instance_port,
            ssl_certificate_id: None,
        }
    }

    /// Structural equality, protocols and certificate ids compared case-insensitively
    pub fn is_equivalent(&self, other: &Listener) -> bool {
        self.protocol.eq_ignore_ascii_case(&other.protocol)
            && self
                .instance_protocol
                .eq_ignore_ascii_case(&other.instance_protocol)
            && self.instance_port == other.instance_port
            && self.load_balancer_port == other.load_balancer_port
            && match (&self.ssl_certificate_id, &other.ssl_certificate_id) {
                (Some(left), Some(right)) => left.eq_ignore_ascii_case(right),
                (None, None) => true,
                _ => false,
            }
    }

    pub fn is_tls(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("ssl") || self.protocol.eq_ignore_ascii_case("https")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListenerDescription {
    pub listener: Listener,
    pub policy_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendServerDescription {
    pub instance_port: i64,
    pub policy_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HealthCheck {
    /// `PROTOCOL:port[/path]`
    pub target: String,
    pub healthy_threshold: i64,
    pub unhealthy_threshold: i64,
    pub timeout: i64,
    pub interval: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionDraining {
    pub enabled: bool,
    pub timeout: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessLog {
    pub enabled: bool,
    pub emit_interval: Option<i64>,
    pub s3_bucket_name: Option<String>,
    pub s3_bucket_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerAttributes {
    pub connection_draining: ConnectionDraining,
    pub idle_timeout: i64,
    pub access_log: Option<AccessLog>,
}

impl Default for LoadBalancerAttributes {
    fn default() -> Self {
        Self {
            connection_draining: ConnectionDraining::default(),
            idle_timeout: 60,
            access_log: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyAttribute {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyDescription {
    pub name: String,
    pub type_name: String,
    pub attributes: Vec<PolicyAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadBalancerDescription {
    pub name: String,
    pub dns_name: String,
    pub scheme: Option<String>,
    pub listener_descriptions: Vec<ListenerDescription>,
    pub backend_server_descriptions: Vec<BackendServerDescription>,
    pub availability_zones: Vec<String>,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub instances: Vec<String>,
    pub health_check: HealthCheck,
    pub tags: Tags,
}

impl LoadBalancerDescription {
    /// Ports of the listeners terminating TLS
    pub fn tls_ports(&self) -> Vec<i64> {
        self.listener_descriptions
            .iter()
            .filter(|description| description.listener.is_tls())
            .map(|description| description.listener.load_balancer_port)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(setter(into))]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub listeners: Vec<Listener>,
    #[builder(default)]
    pub scheme: Option<String>,
    #[builder(default)]
    pub subnets: Vec<String>,
    #[builder(default)]
    pub availability_zones: Vec<String>,
    #[builder(default)]
    pub security_groups: Vec<String>,
    #[builder(default)]
    pub tags: Tags,
}

#[cfg(test)]
mod tests {
    use super::Listener;

    #[test]
    fn listeners_compare_protocols_case_insensitively() {
        let mut actual = Listener::tcp(80, 30080);
        let mut expected = Listener::tcp(80, 30080);
        actual.protocol = "TCP".to_owned();

        assert!(actual.is_equivalent(&expected));

        expected.ssl_certificate_id = Some("arn:cert".to_owned());
        assert!(!actual.is_equivalent(&expected));

        actual.ssl_certificate_id = Some("ARN:CERT".to_owned());
        assert!(actual.is_equivalent(&expected));

        expected.instance_port = 30081;
        assert!(!actual.is_equivalent(&expected));
    }
}
