use k8s_openapi::api::core::v1::NodeAddress;
use log::debug;
use osc_ccm_core::{
    api::Metadata,
    error::{CloudError, RemoteContext},
    model::Instance,
};

pub const INTERNAL_IP: &str = "InternalIP";
pub const EXTERNAL_IP: &str = "ExternalIP";
pub const HOSTNAME: &str = "Hostname";
pub const INTERNAL_DNS: &str = "InternalDNS";
pub const EXTERNAL_DNS: &str = "ExternalDNS";

fn address(type_: &str, address: &str) -> NodeAddress {
    NodeAddress {
        type_: type_.to_owned(),
        address: address.to_owned(),
    }
}

/// Addresses of another node, as reported by the instance record
pub fn extract_node_addresses(instance: &Instance) -> Vec<NodeAddress> {
    let mut addresses = Vec::new();

    if let Some(private_ip) = instance.private_ip.as_deref().filter(|ip| !ip.is_empty()) {
        addresses.push(address(INTERNAL_IP, private_ip));
    }

    if let Some(public_ip) = instance.public_ip.as_deref().filter(|ip| !ip.is_empty()) {
        addresses.push(address(EXTERNAL_IP, public_ip));
    }

    if !instance.private_dns_name.is_empty() {
        addresses.push(address(INTERNAL_DNS, &instance.private_dns_name));
        addresses.push(address(HOSTNAME, &instance.private_dns_name));
    }

    if let Some(public_dns) = instance
        .public_dns_name
        .as_deref()
        .filter(|dns| !dns.is_empty())
    {
        addresses.push(address(EXTERNAL_DNS, public_dns));
    }

    addresses
}

/// `local-hostname` may hold several whitespace separated names, the first one is the hostname
pub fn parse_local_hostname(value: &str) -> Option<(&str, Vec<&str>)> {
    let names = value.split_whitespace().collect::<Vec<_>>();
    names.first().map(|hostname| (*hostname, names.clone()))
}

/// Addresses of the node the provider runs on, read from instance metadata
pub async fn self_node_addresses(metadata: &dyn Metadata) -> Result<Vec<NodeAddress>, CloudError> {
    let mut addresses = Vec::new();

    let macs = metadata
        .interface_macs()
        .await
        .remote("list the network interfaces from metadata")?;
    for mac in macs {
        let path = format!("network/interfaces/macs/{mac}/local-ipv4s");
        let internal_ips = metadata
            .get_metadata(&path)
            .await
            .remote_with(|| format!("read '{path}' from metadata"))?;

        addresses.extend(
            internal_ips
                .lines()
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(|ip| address(INTERNAL_IP, ip)),
        );
    }

    match metadata.get_metadata("public-ipv4").await {
        Ok(ip) if !ip.is_empty() => addresses.push(address(EXTERNAL_IP, &ip)),
        _ => debug!("Couldn't determine the public IP from metadata."),
    }

    let local_hostname = metadata.get_metadata("local-hostname").await.unwrap_or_default();
    match parse_local_hostname(&local_hostname) {
        Some((hostname, internal_dns)) => {
            addresses.push(address(HOSTNAME, hostname));
            addresses.extend(internal_dns.into_iter().map(|dns| address(INTERNAL_DNS, dns)));
        }
        None => debug!("Couldn't determine the private DNS name from metadata."),
    }

    match metadata.get_metadata("public-hostname").await {
        Ok(dns) if !dns.is_empty() => addresses.push(address(EXTERNAL_DNS, &dns)),
        _ => debug!("Couldn't determine the public DNS name from metadata."),
    }

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use osc_ccm_core::{fake::FakeMetadata, model::Instance};

    use super::{extract_node_addresses, parse_local_hostname, self_node_addresses};

    fn pairs(addresses: Vec<k8s_openapi::api::core::v1::NodeAddress>) -> Vec<(String, String)> {
        addresses
            .into_iter()
            .map(|address| (address.type_, address.address))
            .collect()
    }

    #[test]
    fn instance_addresses_cover_ips_and_dns_names() {
        let instance = Instance {
            private_ip: Some("10.0.0.5".to_owned()),
            public_ip: Some("203.0.113.5".to_owned()),
            private_dns_name: "ip-10-0-0-5.eu-west-2.compute.internal".to_owned(),
            ..Default::default()
        };

        let addresses = pairs(extract_node_addresses(&instance));

        assert_eq!(4, addresses.len());
        assert!(addresses.contains(&("InternalIP".to_owned(), "10.0.0.5".to_owned())));
        assert!(addresses.contains(&("ExternalIP".to_owned(), "203.0.113.5".to_owned())));
        assert!(addresses.contains(&(
            "Hostname".to_owned(),
            "ip-10-0-0-5.eu-west-2.compute.internal".to_owned()
        )));
    }

    #[test]
    fn local_hostname_may_list_several_names() {
        let (hostname, dns) = parse_local_hostname("ip-10-0-0-5.internal ip-10-0-0-5.private").unwrap();

        assert_eq!("ip-10-0-0-5.internal", hostname);
        assert_eq!(vec!["ip-10-0-0-5.internal", "ip-10-0-0-5.private"], dns);
        assert!(parse_local_hostname("  ").is_none());
    }

    #[tokio::test]
    async fn self_addresses_are_read_from_metadata() {
        let metadata = FakeMetadata::default();
        metadata.set("network/interfaces/macs/", "aa:bb/\n").await;
        metadata
            .set("network/interfaces/macs/aa:bb/local-ipv4s", "10.0.0.1\n10.0.0.2\n")
            .await;
        metadata.set("local-hostname", "ip-10-0-0-1.internal").await;

        let addresses = pairs(self_node_addresses(&metadata).await.unwrap());

        assert_eq!(
            vec![
                ("InternalIP".to_owned(), "10.0.0.1".to_owned()),
                ("InternalIP".to_owned(), "10.0.0.2".to_owned()),
                ("Hostname".to_owned(), "ip-10-0-0-1.internal".to_owned()),
                ("InternalDNS".to_owned(), "ip-10-0-0-1.internal".to_owned()),
            ],
            addresses
        );
    }
}
