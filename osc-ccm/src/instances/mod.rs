//! Node identity resolution and the instance/zone capability surface

use k8s_openapi::api::core::v1::{Node, NodeAddress};
use log::{info, warn};
use osc_ccm_core::{
    error::{CloudError, ResourceKind},
    model::{Filter, Instance, InstanceState},
    provider_id::{format_provider_id, parse_instance_id},
};

use crate::cloud::Cloud;

pub mod addresses;
pub mod directory;

use addresses::{extract_node_addresses, self_node_addresses};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub failure_domain: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceMetadata {
    pub provider_id: String,
    pub instance_type: String,
    pub node_addresses: Vec<NodeAddress>,
}

impl Cloud {
    pub fn current_node_name(&self) -> &str {
        &self.self_instance.node_name
    }

    pub async fn node_addresses(&self, node_name: &str) -> Result<Vec<NodeAddress>, CloudError> {
        if self.is_self(node_name) {
            return self_node_addresses(self.metadata.as_ref()).await;
        }

        let instance = self.get_instance_by_node_name(node_name).await?;
        Ok(extract_node_addresses(&instance))
    }

    pub async fn node_addresses_by_provider_id(
        &self,
        provider_id: &str,
    ) -> Result<Vec<NodeAddress>, CloudError> {
        let instance = self.get_instance_by_id(&parse_instance_id(provider_id)?).await?;

        Ok(extract_node_addresses(&instance))
    }

    /// False once the instance is gone or terminated
    pub async fn instance_exists_by_provider_id(&self, provider_id: &str) -> Result<bool, CloudError> {
        let instance_id = parse_instance_id(provider_id)?;
        let instance = match self.get_instance_by_id(&instance_id).await {
            Ok(instance) => instance,
            Err(CloudError::NotFound { .. }) => return Ok(false),
            Err(error) => return Err(error),
        };

        if instance.state == InstanceState::Terminated {
            warn!("Instance '{instance_id}' is terminated.");
            return Ok(false);
        }

        Ok(true)
    }

    /// True when the instance is stopped, which makes detaching its volumes safe
    pub async fn instance_shutdown_by_provider_id(&self, provider_id: &str) -> Result<bool, CloudError> {
        let instance_id = parse_instance_id(provider_id)?;
        match self.get_instance_by_id(&instance_id).await {
            Ok(instance) => Ok(instance.state == InstanceState::Stopped),
            Err(CloudError::NotFound { .. }) => {
                warn!("Instance '{provider_id}' doesn't exist anymore.");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// `/<zone>/<instance-id>`
    pub async fn instance_id(&self, node_name: &str) -> Result<String, CloudError> {
        if node_name == self.self_instance.node_name {
            return Ok(format!(
                "/{}/{}",
                self.self_instance.availability_zone, self.self_instance.id
            ));
        }

        let instance = self.get_instance_by_node_name(node_name).await?;
        Ok(format!("/{}/{}", instance.availability_zone, instance.id))
    }

    pub async fn instance_type(&self, node_name: &str) -> Result<String, CloudError> {
        if node_name == self.self_instance.node_name {
            return Ok(self.self_instance.instance_type.to_owned());
        }

        Ok(self.get_instance_by_node_name(node_name).await?.instance_type)
    }

    pub async fn instance_type_by_provider_id(&self, provider_id: &str) -> Result<String, CloudError> {
        let instance = self.get_instance_by_id(&parse_instance_id(provider_id)?).await?;

        Ok(instance.instance_type)
    }

    pub fn get_zone(&self) -> Zone {
        self.zone_of(&self.self_instance.availability_zone)
    }

    pub async fn get_zone_by_provider_id(&self, provider_id: &str) -> Result<Zone, CloudError> {
        let instance = self.get_instance_by_id(&parse_instance_id(provider_id)?).await?;

        Ok(self.zone_of(&instance.availability_zone))
    }

    pub async fn get_zone_by_node_name(&self, node_name: &str) -> Result<Zone, CloudError> {
        let instance = self.get_instance_by_node_name(node_name).await?;

        Ok(self.zone_of(&instance.availability_zone))
    }

    fn zone_of(&self, availability_zone: &str) -> Zone {
        Zone {
            failure_domain: availability_zone.to_owned(),
            region: self.region.to_owned(),
        }
    }

    pub async fn instance_exists(&self, node: &Node) -> Result<bool, CloudError> {
        match self.instance_of_node(node).await {
            Ok(_) => Ok(true),
            Err(CloudError::NotFound { .. }) => {
                info!("No instance found for node '{}'.", node_name(node));
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn instance_shutdown(&self, node: &Node) -> Result<bool, CloudError> {
        let instance = self.instance_of_node(node).await?;

        Ok(instance.state == InstanceState::Stopped)
    }

    pub async fn instance_metadata(&self, node: &Node) -> Result<InstanceMetadata, CloudError> {
        let instance = self.instance_of_node(node).await?;

        if instance.availability_zone.is_empty() {
            return Err(CloudError::validation(format!(
                "Instance '{}' has no availability zone!",
                instance.id
            )));
        }

        Ok(InstanceMetadata {
            provider_id: format_provider_id(&instance.availability_zone, &instance.id),
            instance_type: instance.instance_type.to_owned(),
            node_addresses: extract_node_addresses(&instance),
        })
    }

    /// Live instance backing the node, by provider id when set, by private DNS name otherwise
    async fn instance_of_node(&self, node: &Node) -> Result<Instance, CloudError> {
        let name = node_name(node);
        let provider_id = node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.as_deref())
            .filter(|provider_id| !provider_id.is_empty());

        let mut instances = match provider_id {
            Some(provider_id) => {
                let instance_id = parse_instance_id(provider_id)?;
                self.get_instances_by_ids(&[instance_id])
                    .await?
                    .into_values()
                    .collect::<Vec<_>>()
            }
            None => {
                self.describe_instances(&[Filter::single("private-dns-name", name)])
                    .await?
            }
        };

        let instance = match instances.len() {
            0 => return Err(CloudError::not_found(ResourceKind::Instance, name)),
            1 => instances.pop(),
            count => {
                return Err(CloudError::Ambiguous {
                    kind: ResourceKind::Instance,
                    id: name.to_owned(),
                    count,
                })
            }
        };

        instance
            .filter(|instance| instance.state != InstanceState::Terminated)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Instance, name))
    }
}

fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Node, NodeSpec};
    use kube::api::ObjectMeta;
    use osc_ccm_core::model::InstanceState;

    use crate::test_support::{cluster_instance, FakeEnvironment};

    fn node(name: &str, provider_id: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: provider_id.map(str::to_owned),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[tokio::test]
    async fn instance_existence_follows_the_instance_state() {
        let env = FakeEnvironment::new().await;
        let mut terminated = cluster_instance("i-dead", "node-dead");
        terminated.state = InstanceState::Terminated;
        env.fake.compute.insert_instance(terminated).await;
        env.fake
            .compute
            .insert_instance(cluster_instance("i-live", "node-live"))
            .await;
        let cloud = env.cloud().await;

        assert!(cloud
            .instance_exists_by_provider_id("aws:///eu-west-2a/i-live")
            .await
            .unwrap());
        assert!(!cloud
            .instance_exists_by_provider_id("aws:///eu-west-2a/i-dead")
            .await
            .unwrap());
        assert!(!cloud
            .instance_exists_by_provider_id("aws:///eu-west-2a/i-gone")
            .await
            .unwrap());
        assert!(cloud.instance_exists_by_provider_id("gce://nope").await.is_err());
    }

    #[tokio::test]
    async fn stopped_instances_are_shut_down() {
        let env = FakeEnvironment::new().await;
        let mut stopped = cluster_instance("i-stopped", "node-stopped");
        stopped.state = InstanceState::Stopped;
        env.fake.compute.insert_instance(stopped).await;
        let cloud = env.cloud().await;

        assert!(cloud
            .instance_shutdown_by_provider_id("aws:///eu-west-2a/i-stopped")
            .await
            .unwrap());
        assert!(!cloud
            .instance_shutdown_by_provider_id("aws:///eu-west-2a/i-gone")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn zones_and_ids_are_reported_for_nodes() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        let cloud = env.cloud().await;

        assert_eq!("/eu-west-2a/i-a", cloud.instance_id("node-a").await.unwrap());
        assert_eq!(
            "/eu-west-2a/i-self",
            cloud.instance_id(cloud.current_node_name()).await.unwrap()
        );

        let zone = cloud.get_zone_by_node_name("node-a").await.unwrap();
        assert_eq!("eu-west-2a", zone.failure_domain);
        assert_eq!("eu-west-2", zone.region);
        assert_eq!(zone, cloud.get_zone());
    }

    #[tokio::test]
    async fn instance_metadata_carries_the_provider_id() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        let cloud = env.cloud().await;

        let metadata = cloud
            .instance_metadata(&node("node-a", Some("aws:///eu-west-2a/i-a")))
            .await
            .unwrap();

        assert_eq!("aws:///eu-west-2a/i-a", metadata.provider_id);
        assert!(!cloud.instance_exists(&node("node-z", None)).await.unwrap());
    }
}
