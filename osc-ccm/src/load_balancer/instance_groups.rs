use std::collections::BTreeMap;

use itertools::Itertools;
use k8s_openapi::api::core::v1::Node;
use log::{debug, info, warn};
use osc_ccm_core::{
    error::{CloudError, RemoteContext, ResourceKind},
    model::{Filter, GroupIdentifier, Instance, LoadBalancerDescription, SecurityGroup},
    permissions::{IpPermission, UserIdGroupPair},
    provider_id::parse_instance_id,
    tagging::ResourceLifecycle,
};

use crate::{cloud::Cloud, security_groups::DEFAULT_SOURCE_GROUP_NAME};

/// Prefix of the tag marking the main node security group of a cluster, the cluster id is appended
pub const MAIN_SECURITY_GROUP_TAG_PREFIX: &str = "OscK8sMainSG/";

/// The group load balancer traffic should be opened on. A single cluster-tagged group wins,
/// otherwise a single untagged group is accepted. Several candidates of the same kind are an error.
pub fn find_security_group_for_instance(
    instance: &Instance,
    tagged_groups: &BTreeMap<String, SecurityGroup>,
) -> Result<Option<GroupIdentifier>, CloudError> {
    let (tagged, untagged): (Vec<_>, Vec<_>) = instance
        .security_groups
        .iter()
        .filter(|group| {
            if group.id.is_empty() {
                warn!("Ignoring security group without id for instance '{}': {group:?}", instance.id);
            }
            !group.id.is_empty()
        })
        .partition(|group| tagged_groups.contains_key(&group.id));

    match (tagged.as_slice(), untagged.as_slice()) {
        ([group], _) => Ok(Some((*group).to_owned())),
        ([], [group]) => Ok(Some((*group).to_owned())),
        ([], []) => {
            warn!("No security group found for instance '{}'!", instance.id);
            Ok(None)
        }
        ([], _) => Err(CloudError::validation(format!(
            "Multiple untagged security groups found for instance '{}', make sure the cluster security group is tagged!",
            instance.id
        ))),
        (_, _) => Err(CloudError::validation(format!(
            "Multiple tagged security groups found for instance '{}' ({}), make sure only the cluster security group is tagged!",
            instance.id,
            tagged
                .iter()
                .map(|group| format!("{}({})", group.id, group.name))
                .join(", ")
        ))),
    }
}

impl Cloud {
    fn main_security_group_tag(&self) -> String {
        format!(
            "{MAIN_SECURITY_GROUP_TAG_PREFIX}{}",
            self.tagging.cluster_id().unwrap_or_default()
        )
    }

    /// Node security groups of the cluster, by id
    pub async fn get_tagged_security_groups(&self) -> Result<BTreeMap<String, SecurityGroup>, CloudError> {
        let filters = [
            self.tagging
                .lifecycle_filter(&[ResourceLifecycle::Owned, ResourceLifecycle::Shared]),
            Filter::tag(&self.main_security_group_tag(), ["True"]),
        ];

        let groups = self
            .compute
            .read_security_groups(&filters)
            .await
            .remote("describe tagged security groups")?;

        Ok(groups
            .into_iter()
            .filter(|group| self.tagging.has_cluster_tag(&group.tags))
            .filter(|group| {
                if group.id.is_empty() {
                    warn!("Ignoring security group without id: {group:?}");
                }
                !group.id.is_empty()
            })
            .map(|group| (group.id.to_owned(), group))
            .collect())
    }

    /// Instances backing `nodes`, by id. Nodes that can't be mapped to an instance are skipped.
    pub async fn find_instances_for_load_balancer(
        &self,
        nodes: &[Node],
    ) -> Result<BTreeMap<String, Instance>, CloudError> {
        let mut instance_ids = Vec::new();

        for node in nodes {
            let node_name = node.metadata.name.as_deref().unwrap_or_default();
            let provider_id = node
                .spec
                .as_ref()
                .and_then(|spec| spec.provider_id.as_deref())
                .filter(|provider_id| !provider_id.is_empty());

            let instance_id = match provider_id {
                Some(provider_id) => parse_instance_id(provider_id),
                None => match self.find_instance_by_node_name(node_name).await {
                    Ok(Some(instance)) => Ok(instance.id),
                    Ok(None) => Err(CloudError::not_found(ResourceKind::Instance, node_name)),
                    Err(error) => Err(error),
                },
            };

            match instance_id {
                Ok(instance_id) => instance_ids.push(instance_id),
                Err(error) => warn!("Ignoring node '{node_name}' without a usable instance! Reason: {error}"),
            }
        }

        let instances = self.get_instances_by_ids(&instance_ids).await?;

        Ok(instances
            .into_iter()
            .filter(|(_, instance)| self.tagging.has_cluster_tag(&instance.tags))
            .collect())
    }

    /// Opens ingress from the load balancer group on the groups of `instances`,
    /// and closes it on every other cluster group still granting it
    pub async fn update_instance_security_groups_for_load_balancer(
        &self,
        load_balancer: &LoadBalancerDescription,
        instances: &BTreeMap<String, Instance>,
        security_group_ids: &[String],
    ) -> Result<(), CloudError> {
        if self.config.disable_security_group_ingress {
            return Ok(());
        }

        let candidates = match load_balancer.security_groups.is_empty() {
            false => load_balancer.security_groups.as_slice(),
            true => security_group_ids,
        };

        let mut non_empty = candidates.iter().filter(|group_id| !group_id.is_empty());
        let load_balancer_group = non_empty.next_back().ok_or_else(|| {
            CloudError::validation(format!(
                "Couldn't determine the security group of load balancer '{}'!",
                load_balancer.name
            ))
        })?;
        if non_empty.next().is_some() {
            warn!("Multiple security groups for load balancer '{}'!", load_balancer.name);
        }

        let public_cloud = load_balancer_group == DEFAULT_SOURCE_GROUP_NAME;
        let peer_filter = match public_cloud {
            true => Filter::single("ip-permission.group-name", load_balancer_group),
            false => Filter::single("ip-permission.group-id", load_balancer_group),
        };

        let actual_groups = self
            .compute
            .read_security_groups(&[peer_filter])
            .await
            .remote("describe security groups granting load balancer ingress")?
            .into_iter()
            .filter(|group| self.tagging.has_cluster_tag(&group.tags))
            .collect::<Vec<_>>();

        let tagged_groups = self.get_tagged_security_groups().await?;

        // true to open, false to close
        let mut changes = BTreeMap::<String, bool>::new();
        for instance in instances.values() {
            let Some(group) = find_security_group_for_instance(instance, &tagged_groups)? else {
                warn!("Ignoring instance '{}' without security group.", instance.id);
                continue;
            };

            changes.insert(group.id, true);
        }

        for group in actual_groups {
            if group.id.is_empty() {
                warn!("Ignoring security group without id: {group:?}");
                continue;
            }

            match changes.get(&group.id) {
                Some(true) => {
                    changes.remove(&group.id);
                }
                _ => {
                    changes.insert(group.id, false);
                }
            }
        }

        debug!("Instance security group changes for load balancer '{}': {changes:?}", load_balancer.name);

        let permissions = match public_cloud {
            true => Vec::new(),
            false => vec![IpPermission::all_traffic().with_group_pair(UserIdGroupPair::group(load_balancer_group))],
        };

        for (group_id, open) in changes {
            if open {
                info!("Allowing traffic from load balancer group '{load_balancer_group}' to instance group '{group_id}'.");
                if !self
                    .add_security_group_ingress(&group_id, &permissions, public_cloud)
                    .await?
                {
                    warn!("Allowing ingress on '{group_id}' wasn't needed, concurrent change?");
                }
            } else {
                info!("Removing traffic from load balancer group '{load_balancer_group}' to instance group '{group_id}'.");
                if !self
                    .remove_security_group_ingress(&group_id, &permissions, public_cloud)
                    .await?
                {
                    warn!("Revoking ingress on '{group_id}' wasn't needed, concurrent change?");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use osc_ccm_core::{
        model::{GroupIdentifier, LoadBalancerDescription, SecurityGroup, Tags},
        permissions::{IpPermission, UserIdGroupPair},
        tagging::CLUSTER_TAG_PREFIX,
    };

    use super::{find_security_group_for_instance, MAIN_SECURITY_GROUP_TAG_PREFIX};
    use crate::test_support::{cluster_instance, FakeEnvironment, CLUSTER_ID};

    fn group(id: &str) -> GroupIdentifier {
        GroupIdentifier {
            id: id.to_owned(),
            name: format!("{id}-name"),
        }
    }

    fn node_group(id: &str, ingress: Vec<IpPermission>) -> SecurityGroup {
        SecurityGroup {
            id: id.to_owned(),
            name: format!("{id}-name"),
            vpc_id: "vpc-1".to_owned(),
            ingress,
            tags: Tags::from([
                (format!("{CLUSTER_TAG_PREFIX}{CLUSTER_ID}"), "owned".to_owned()),
                (format!("{MAIN_SECURITY_GROUP_TAG_PREFIX}{CLUSTER_ID}"), "True".to_owned()),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn tagged_groups_are_preferred_over_untagged_ones() {
        let mut instance = cluster_instance("i-a", "node-a");
        instance.security_groups = vec![group("sg-untagged"), group("sg-node")];
        let tagged = BTreeMap::from([("sg-node".to_owned(), node_group("sg-node", Vec::new()))]);

        let found = find_security_group_for_instance(&instance, &tagged).unwrap();

        assert_eq!(Some("sg-node".to_owned()), found.map(|group| group.id));
    }

    #[test]
    fn several_candidates_are_ambiguous() {
        let mut instance = cluster_instance("i-a", "node-a");
        instance.security_groups = vec![group("sg-1"), group("sg-2")];

        assert!(find_security_group_for_instance(&instance, &BTreeMap::new()).is_err());

        instance.security_groups.clear();
        assert_eq!(None, find_security_group_for_instance(&instance, &BTreeMap::new()).unwrap());
    }

    #[tokio::test]
    async fn load_balancer_ingress_moves_to_the_current_instances() {
        let env = FakeEnvironment::new().await;
        let from_load_balancer =
            IpPermission::all_traffic().with_group_pair(UserIdGroupPair::group("sg-lb"));
        env.fake
            .compute
            .insert_security_group(node_group("sg-stale", vec![from_load_balancer.clone()]))
            .await;
        env.fake
            .compute
            .insert_security_group(node_group("sg-node", Vec::new()))
            .await;

        let mut instance = env.add_node("node-a", "i-a").await;
        instance.security_groups = vec![group("sg-node")];
        let cloud = env.cloud().await;

        let load_balancer = LoadBalancerDescription {
            name: "lb".to_owned(),
            security_groups: vec!["sg-lb".to_owned()],
            ..Default::default()
        };
        let instances = BTreeMap::from([(instance.id.to_owned(), instance)]);

        cloud
            .update_instance_security_groups_for_load_balancer(&load_balancer, &instances, &[])
            .await
            .unwrap();

        let node = env.fake.compute.security_group("sg-node").await.unwrap();
        let stale = env.fake.compute.security_group("sg-stale").await.unwrap();
        assert_eq!(vec![from_load_balancer], node.ingress);
        assert!(stale.ingress.is_empty());
    }

    #[tokio::test]
    async fn load_balancers_without_security_group_are_rejected() {
        let env = FakeEnvironment::new().await;
        let cloud = env.cloud().await;

        let result = cloud
            .update_instance_security_groups_for_load_balancer(
                &LoadBalancerDescription::default(),
                &BTreeMap::new(),
                &["".to_owned()],
            )
            .await;

        assert!(result.is_err());
    }
}
