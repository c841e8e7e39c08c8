use std::collections::BTreeMap;

use log::debug;
use osc_ccm_core::{
    api::Compute,
    error::{CloudError, RemoteContext, ResourceKind},
    model::{Filter, Instance, InstanceState},
    provider_id::parse_instance_id,
    tagging::ResourceLifecycle,
    NODE_NAME_TAG,
};

use crate::cloud::Cloud;

/// Node names per describe call, the API caps the size of filter value lists
pub const FILTER_NODE_LIMIT: usize = 150;

pub async fn get_instances_by_ids(
    compute: &dyn Compute,
    instance_ids: &[String],
) -> Result<BTreeMap<String, Instance>, CloudError> {
    if instance_ids.is_empty() {
        return Ok(BTreeMap::new());
    }

    let instances = compute
        .read_instances(&[Filter::new("instance-id", instance_ids.iter().cloned())])
        .await
        .remote("describe instances")?;

    Ok(instances
        .into_iter()
        .filter(|instance| !instance.id.is_empty())
        .map(|instance| (instance.id.to_owned(), instance))
        .collect())
}

pub async fn get_instance_by_id(
    compute: &dyn Compute,
    instance_id: &str,
) -> Result<Instance, CloudError> {
    let mut instances = get_instances_by_ids(compute, &[instance_id.to_owned()]).await?;

    match instances.len() {
        0 => Err(CloudError::not_found(ResourceKind::Instance, instance_id)),
        1 => instances
            .remove(instance_id)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Instance, instance_id)),
        count => Err(CloudError::Ambiguous {
            kind: ResourceKind::Instance,
            id: instance_id.to_owned(),
            count,
        }),
    }
}

fn alive_states() -> impl Iterator<Item = &'static str> {
    InstanceState::ALIVE.iter().map(InstanceState::as_str)
}

impl Cloud {
    pub async fn get_instance_by_id(&self, instance_id: &str) -> Result<Instance, CloudError> {
        get_instance_by_id(self.compute.as_ref(), instance_id).await
    }

    pub async fn get_instances_by_ids(
        &self,
        instance_ids: &[String],
    ) -> Result<BTreeMap<String, Instance>, CloudError> {
        get_instances_by_ids(self.compute.as_ref(), instance_ids).await
    }

    /// Describes instances, keeping only the ones tagged for this cluster
    pub async fn describe_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>, CloudError> {
        let instances = self
            .compute
            .read_instances(filters)
            .await
            .remote("describe instances")?;

        Ok(instances
            .into_iter()
            .filter(|instance| self.tagging.has_cluster_tag(&instance.tags))
            .collect())
    }

    /// Looks up instances by private DNS name, in chunks of [`FILTER_NODE_LIMIT`]
    pub async fn get_instances_by_node_names(
        &self,
        node_names: &[String],
        states: &[InstanceState],
    ) -> Result<Vec<Instance>, CloudError> {
        let mut instances = Vec::new();

        for chunk in node_names.chunks(FILTER_NODE_LIMIT) {
            let mut filters = vec![Filter::new("private-dns-name", chunk.iter().cloned())];
            if !states.is_empty() {
                filters.push(Filter::new(
                    "instance-state-name",
                    states.iter().map(InstanceState::as_str),
                ));
            }

            instances.extend(self.describe_instances(&filters).await?);
        }

        if instances.is_empty() {
            debug!("No instances found for nodes {node_names:?}.");
        }

        Ok(instances)
    }

    /// Slow path, by node name tag. `None` when no live instance carries it.
    pub async fn find_instance_by_node_name(
        &self,
        node_name: &str,
    ) -> Result<Option<Instance>, CloudError> {
        let filters = [
            Filter::tag(NODE_NAME_TAG, [node_name]),
            Filter::new("instance-state-name", alive_states()),
            self.tagging
                .lifecycle_filter(&[ResourceLifecycle::Owned, ResourceLifecycle::Shared]),
        ];

        let mut instances = self.describe_instances(&filters).await?;
        match instances.len() {
            0 => Ok(None),
            1 => Ok(instances.pop()),
            count => Err(CloudError::Ambiguous {
                kind: ResourceKind::Instance,
                id: node_name.to_owned(),
                count,
            }),
        }
    }

    /// Fast path through the provider id of the cached node, falling back to tags
    pub async fn get_instance_by_node_name(&self, node_name: &str) -> Result<Instance, CloudError> {
        let instance = match self.node_name_to_instance_id(node_name) {
            Ok(instance_id) => Some(self.get_instance_by_id(&instance_id).await?),
            Err(error) => {
                debug!("Couldn't map node '{node_name}' to an instance id, falling back to tags! Reason: {error}");
                self.find_instance_by_node_name(node_name).await?
            }
        };

        instance.ok_or_else(|| CloudError::not_found(ResourceKind::Instance, node_name))
    }

    pub fn node_name_to_instance_id(&self, node_name: &str) -> Result<String, CloudError> {
        if node_name.is_empty() {
            return Err(CloudError::validation("No node name provided!"));
        }

        if !self.nodes.has_synced() {
            return Err(CloudError::NodeNotSynced);
        }

        let provider_id = self
            .nodes
            .provider_id(node_name)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Node, node_name))?;

        parse_instance_id(&provider_id)
    }

    /// The instance backing `node_name`, the self instance when empty
    pub async fn get_full_instance(&self, node_name: &str) -> Result<Instance, CloudError> {
        if node_name.is_empty() {
            return self.get_instance_by_id(&self.self_instance.id).await;
        }

        self.get_instance_by_node_name(node_name).await
    }
}

#[cfg(test)]
mod tests {
    use osc_ccm_core::{error::CloudError, model::InstanceState};

    use super::FILTER_NODE_LIMIT;
    use crate::test_support::{cluster_instance, FakeEnvironment};

    #[tokio::test]
    async fn instances_are_found_through_the_provider_id_first() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        let cloud = env.cloud().await;
        env.fake.clear_calls().await;

        let instance = cloud.get_instance_by_node_name("node-a").await.unwrap();

        assert_eq!("i-a", instance.id);
        assert_eq!(1, env.fake.compute.recorder.calls_to("read_instances").await.len());
    }

    #[tokio::test]
    async fn unknown_nodes_fall_back_to_the_node_name_tag() {
        let env = FakeEnvironment::new().await;
        env.fake
            .compute
            .insert_instance(cluster_instance("i-b", "node-b"))
            .await;
        let cloud = env.cloud().await;

        let instance = cloud.get_instance_by_node_name("node-b").await.unwrap();

        assert_eq!("i-b", instance.id);
    }

    #[tokio::test]
    async fn several_live_instances_for_one_node_are_ambiguous() {
        let env = FakeEnvironment::new().await;
        for id in ["i-b1", "i-b2"] {
            env.fake
                .compute
                .insert_instance(cluster_instance(id, "node-b"))
                .await;
        }
        let cloud = env.cloud().await;

        let error = cloud.get_instance_by_node_name("node-b").await.unwrap_err();

        assert!(matches!(error, CloudError::Ambiguous { count: 2, .. }));
    }

    #[tokio::test]
    async fn terminated_instances_are_not_found() {
        let env = FakeEnvironment::new().await;
        let mut instance = cluster_instance("i-b", "node-b");
        instance.state = InstanceState::Terminated;
        env.fake.compute.insert_instance(instance).await;
        let cloud = env.cloud().await;

        let error = cloud.get_instance_by_node_name("node-b").await.unwrap_err();

        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn node_name_lookups_are_chunked() {
        let env = FakeEnvironment::new().await;
        let cloud = env.cloud().await;
        env.fake.clear_calls().await;
        let names = (0..FILTER_NODE_LIMIT + 1)
            .map(|index| format!("node-{index}"))
            .collect::<Vec<_>>();

        cloud
            .get_instances_by_node_names(&names, &InstanceState::ALIVE)
            .await
            .unwrap();

        assert_eq!(2, env.fake.compute.recorder.calls_to("read_instances").await.len());
    }

    #[tokio::test]
    async fn unsynced_node_cache_is_reported() {
        let env = FakeEnvironment::new().await;
        env.nodes.set_synced(false);
        let cloud = env.cloud().await;

        assert!(matches!(
            cloud.node_name_to_instance_id("node-a"),
            Err(CloudError::NodeNotSynced)
        ));
    }
}
