//! Pod CIDR routes of the cluster route table

use log::{info, warn};
use osc_ccm_core::{
    error::{CloudError, RemoteContext, ResourceKind},
    model::{Filter, RouteState, RouteTable},
};

use crate::cloud::Cloud;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloudRoute {
    pub name: String,
    pub destination_cidr: String,
    /// Node the traffic is sent to, `None` for blackhole routes
    pub target_node: Option<String>,
    pub blackhole: bool,
}

impl Cloud {
    fn route_name(&self, destination_cidr: &str) -> String {
        format!(
            "{}-{destination_cidr}",
            self.tagging.cluster_id().unwrap_or_default()
        )
    }

    /// The configured route table, or the only one tagged for this cluster
    async fn find_route_table(&self) -> Result<RouteTable, CloudError> {
        let mut tables = match &self.config.route_table_id {
            Some(route_table_id) => self
                .compute
                .read_route_tables(&[Filter::single("route-table-id", route_table_id)])
                .await
                .remote_with(|| format!("describe route table '{route_table_id}'"))?,
            None => self
                .compute
                .read_route_tables(&[])
                .await
                .remote("describe route tables")?
                .into_iter()
                .filter(|table| self.tagging.has_cluster_tag(&table.tags))
                .collect(),
        };

        let cluster = self.tagging.cluster_id().unwrap_or_default();
        match tables.len() {
            0 => Err(CloudError::not_found(ResourceKind::RouteTable, cluster)),
            1 => tables
                .pop()
                .ok_or_else(|| CloudError::not_found(ResourceKind::RouteTable, cluster)),
            count => Err(CloudError::Ambiguous {
                kind: ResourceKind::RouteTable,
                id: cluster.to_owned(),
                count,
            }),
        }
    }

    /// Routes of the cluster table, either blackholed or targeting a known node
    pub async fn list_routes(&self) -> Result<Vec<CloudRoute>, CloudError> {
        let table = self.find_route_table().await?;

        let instance_ids = table
            .routes
            .iter()
            .filter_map(|route| route.instance_id.to_owned())
            .filter(|instance_id| !instance_id.is_empty())
            .collect::<Vec<_>>();
        let instances = self.get_instances_by_ids(&instance_ids).await?;

        let mut routes = Vec::new();
        for route in table.routes {
            if route.destination_cidr.is_empty() {
                continue;
            }

            let mut cloud_route = CloudRoute {
                name: self.route_name(&route.destination_cidr),
                destination_cidr: route.destination_cidr,
                ..Default::default()
            };

            if route.state == RouteState::Blackhole {
                cloud_route.blackhole = true;
                routes.push(cloud_route);
                continue;
            }

            let Some(instance_id) = route.instance_id.filter(|instance_id| !instance_id.is_empty()) else {
                continue;
            };

            match instances.get(&instance_id) {
                Some(instance) => {
                    cloud_route.target_node = Some(instance.node_name().to_owned());
                    routes.push(cloud_route);
                }
                None => warn!("Couldn't find instance '{instance_id}' among the instances being routed to!"),
            }
        }

        Ok(routes)
    }

    /// Routes `destination_cidr` to the instance of `target_node`, replacing a blackhole route.
    /// The instance has to accept traffic not addressed to itself, so its source/dest check is disabled first.
    pub async fn create_route(&self, target_node: &str, destination_cidr: &str) -> Result<(), CloudError> {
        let instance = self.get_instance_by_node_name(target_node).await?;

        self.compute
            .set_source_dest_check(&instance.id, false)
            .await
            .remote_with(|| format!("disable source/dest check of instance '{}'", instance.id))?;

        let table = self.find_route_table().await?;

        if table
            .routes
            .iter()
            .any(|route| route.destination_cidr == destination_cidr && route.state == RouteState::Blackhole)
        {
            info!("Deleting blackhole route '{destination_cidr}' of route table '{}'.", table.id);
            self.compute
                .delete_route(&table.id, destination_cidr)
                .await
                .remote_with(|| format!("delete blackhole route '{destination_cidr}'"))?;
        }

        info!("Routing '{destination_cidr}' to instance '{}' of node '{target_node}'.", instance.id);
        self.compute
            .create_route(&table.id, destination_cidr, &instance.id)
            .await
            .remote_with(|| format!("create route '{destination_cidr}'"))
    }

    pub async fn delete_route(&self, destination_cidr: &str) -> Result<(), CloudError> {
        let table = self.find_route_table().await?;

        info!("Deleting route '{destination_cidr}' of route table '{}'.", table.id);
        self.compute
            .delete_route(&table.id, destination_cidr)
            .await
            .remote_with(|| format!("delete route '{destination_cidr}'"))
    }
}

#[cfg(test)]
mod tests {
    use osc_ccm_core::{
        model::{Route, RouteState, RouteTable, Tags},
        tagging::CLUSTER_TAG_PREFIX,
    };

    use super::CloudRoute;
    use crate::test_support::{FakeEnvironment, CLUSTER_ID};

    fn cluster_table(id: &str, routes: Vec<Route>) -> RouteTable {
        RouteTable {
            id: id.to_owned(),
            vpc_id: "vpc-1".to_owned(),
            routes,
            tags: Tags::from([(format!("{CLUSTER_TAG_PREFIX}{CLUSTER_ID}"), "owned".to_owned())]),
            ..Default::default()
        }
    }

    fn route(destination_cidr: &str, instance_id: Option<&str>, state: RouteState) -> Route {
        Route {
            destination_cidr: destination_cidr.to_owned(),
            instance_id: instance_id.map(str::to_owned),
            state,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn routes_report_nodes_and_blackholes() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        env.fake
            .compute
            .insert_route_table(cluster_table(
                "rtb-1",
                vec![
                    route("10.0.0.0/16", None, RouteState::Active),
                    route("10.1.1.0/24", Some("i-a"), RouteState::Active),
                    route("10.1.2.0/24", Some("i-gone"), RouteState::Active),
                    route("10.1.3.0/24", None, RouteState::Blackhole),
                ],
            ))
            .await;
        let cloud = env.cloud().await;

        let routes = cloud.list_routes().await.unwrap();

        assert_eq!(
            vec![
                CloudRoute {
                    name: "alpha-10.1.1.0/24".to_owned(),
                    destination_cidr: "10.1.1.0/24".to_owned(),
                    target_node: Some("node-a".to_owned()),
                    blackhole: false,
                },
                CloudRoute {
                    name: "alpha-10.1.3.0/24".to_owned(),
                    destination_cidr: "10.1.3.0/24".to_owned(),
                    target_node: None,
                    blackhole: true,
                },
            ],
            routes
        );
    }

    #[tokio::test]
    async fn blackhole_routes_are_replaced() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-b", "i-b").await;
        env.fake
            .compute
            .insert_route_table(cluster_table(
                "rtb-1",
                vec![route("10.0.5.0/24", None, RouteState::Blackhole)],
            ))
            .await;
        let cloud = env.cloud().await;

        cloud.create_route("node-b", "10.0.5.0/24").await.unwrap();

        let operations = env
            .fake
            .compute
            .recorder
            .mutating_calls()
            .await
            .into_iter()
            .map(|call| call.operation)
            .collect::<Vec<_>>();
        assert_eq!(vec!["set_source_dest_check", "delete_route", "create_route"], operations);

        let table = env.fake.compute.route_table("rtb-1").await.unwrap();
        assert_eq!(vec![route("10.0.5.0/24", Some("i-b"), RouteState::Active)], table.routes);
        assert!(!env.fake.compute.state().await.instances["i-b"].source_dest_check);

        cloud.delete_route("10.0.5.0/24").await.unwrap();
        assert!(env.fake.compute.route_table("rtb-1").await.unwrap().routes.is_empty());
    }

    #[tokio::test]
    async fn several_cluster_route_tables_are_ambiguous() {
        let env = FakeEnvironment::new().await;
        env.fake.compute.insert_route_table(cluster_table("rtb-1", Vec::new())).await;
        env.fake.compute.insert_route_table(cluster_table("rtb-2", Vec::new())).await;
        let cloud = env.cloud().await;

        assert!(matches!(
            cloud.list_routes().await,
            Err(osc_ccm_core::error::CloudError::Ambiguous { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn missing_route_table_is_not_found() {
        let env = FakeEnvironment::new().await;
        let cloud = env.cloud().await;

        assert!(cloud.delete_route("10.0.5.0/24").await.unwrap_err().is_not_found());
    }
}
