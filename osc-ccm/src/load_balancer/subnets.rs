use std::collections::BTreeMap;

use log::{debug, warn};
use osc_ccm_core::{
    error::{CloudError, RemoteContext, ResourceKind},
    model::{Filter, RouteTable, Subnet},
};

use crate::cloud::Cloud;

/// Subnet role tag preferred for internal load balancers
pub const INTERNAL_ELB_ROLE_TAG: &str = "kubernetes.io/role/internal-elb";
/// Subnet role tag preferred for internet-facing load balancers
pub const PUBLIC_ELB_ROLE_TAG: &str = "kubernetes.io/role/elb";

/// A subnet is public when its route table, explicit or main, routes through an internet gateway
pub fn is_subnet_public(route_tables: &[RouteTable], subnet_id: &str) -> Result<bool, CloudError> {
    let associated = route_tables.iter().find(|table| {
        table
            .associations
            .iter()
            .any(|association| association.subnet_id.as_deref() == Some(subnet_id))
    });

    let table = match associated {
        Some(table) => table,
        None => route_tables
            .iter()
            .find(|table| table.associations.iter().any(|association| association.main))
            .map(|table| {
                debug!("Assuming implicit use of main route table '{}' for subnet '{subnet_id}'.", table.id);
                table
            })
            .ok_or_else(|| CloudError::not_found(ResourceKind::RouteTable, subnet_id))?,
    };

    Ok(table.routes.iter().any(|route| {
        route
            .gateway_id
            .as_deref()
            .map_or(false, |gateway| gateway.starts_with("igw"))
    }))
}

impl Cloud {
    /// Cluster-tagged subnets of our VPC. When none is tagged, falls back to the subnet of the
    /// instance the provider runs on.
    pub async fn find_subnets(&self) -> Result<Vec<Subnet>, CloudError> {
        if !self.vpc_id.is_empty() {
            let subnets = self
                .compute
                .read_subnets(&[Filter::single("vpc-id", &self.vpc_id)])
                .await
                .remote("describe subnets")?;

            let tagged = subnets
                .into_iter()
                .filter(|subnet| self.tagging.has_cluster_tag(&subnet.tags))
                .collect::<Vec<_>>();

            if !tagged.is_empty() {
                return Ok(tagged);
            }
        }

        if self.self_instance.subnet_id.is_empty() {
            return Ok(Vec::new());
        }

        warn!(
            "No tagged subnets found, falling back to the current subnet '{}' only! This will be treated as an error in the future.",
            self.self_instance.subnet_id
        );

        self.compute
            .read_subnets(&[Filter::single("subnet-id", &self.self_instance.subnet_id)])
            .await
            .remote("describe subnets")
    }

    /// One subnet per zone, sorted by zone. Internet-facing load balancers skip private subnets.
    /// A subnet carrying the role tag wins, remaining ties go to the lowest subnet id.
    pub async fn find_elb_subnets(&self, internal: bool) -> Result<Vec<String>, CloudError> {
        let subnets = self.find_subnets().await?;

        let route_tables = match self.vpc_id.is_empty() {
            true => Vec::new(),
            false => self
                .compute
                .read_route_tables(&[Filter::single("vpc-id", &self.vpc_id)])
                .await
                .remote("describe route tables")?,
        };

        let role_tag = match internal {
            true => INTERNAL_ELB_ROLE_TAG,
            false => PUBLIC_ELB_ROLE_TAG,
        };

        let mut by_zone = BTreeMap::<String, Subnet>::new();
        for subnet in subnets {
            if subnet.availability_zone.is_empty() || subnet.id.is_empty() {
                warn!("Ignoring subnet with an empty zone or id: {subnet:?}");
                continue;
            }

            let public = is_subnet_public(&route_tables, &subnet.id)?;
            if !internal && !public {
                debug!("Ignoring private subnet '{}' for an internet-facing load balancer.", subnet.id);
                continue;
            }

            let has_role = subnet.tags.contains_key(role_tag);
            let Some(existing) = by_zone.get(&subnet.availability_zone) else {
                if has_role || (public && !internal) {
                    by_zone.insert(subnet.availability_zone.to_owned(), subnet);
                }
                continue;
            };

            let existing_has_role = existing.tags.contains_key(role_tag);
            if existing_has_role != has_role {
                if has_role {
                    by_zone.insert(subnet.availability_zone.to_owned(), subnet);
                }
                continue;
            }

            let chosen = match existing.id > subnet.id {
                true => subnet.id.to_owned(),
                false => existing.id.to_owned(),
            };
            warn!(
                "Found multiple subnets in zone '{}', choosing '{chosen}' between '{}' and '{}'.",
                subnet.availability_zone, existing.id, subnet.id
            );

            if chosen == subnet.id {
                by_zone.insert(subnet.availability_zone.to_owned(), subnet);
            }
        }

        Ok(by_zone.into_values().map(|subnet| subnet.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use osc_ccm_core::{
        model::{Route, RouteTable, RouteTableAssociation, Subnet, Tags},
        tagging::CLUSTER_TAG_PREFIX,
    };

    use super::{is_subnet_public, INTERNAL_ELB_ROLE_TAG};
    use crate::test_support::{FakeEnvironment, CLUSTER_ID};

    fn cluster_subnet(id: &str, zone: &str, extra_tags: &[&str]) -> Subnet {
        let mut tags = Tags::from([(format!("{CLUSTER_TAG_PREFIX}{CLUSTER_ID}"), "shared".to_owned())]);
        tags.extend(extra_tags.iter().map(|tag| (tag.to_string(), "1".to_owned())));

        Subnet {
            id: id.to_owned(),
            vpc_id: "vpc-1".to_owned(),
            availability_zone: zone.to_owned(),
            tags,
        }
    }

    fn main_table_through(gateway: &str) -> RouteTable {
        RouteTable {
            id: "rtb-main".to_owned(),
            vpc_id: "vpc-1".to_owned(),
            routes: vec![Route {
                destination_cidr: "0.0.0.0/0".to_owned(),
                gateway_id: Some(gateway.to_owned()),
                ..Default::default()
            }],
            associations: vec![RouteTableAssociation {
                subnet_id: None,
                main: true,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn subnets_use_their_own_table_before_the_main_one() {
        let private = RouteTable {
            id: "rtb-private".to_owned(),
            associations: vec![RouteTableAssociation {
                subnet_id: Some("subnet-private".to_owned()),
                main: false,
            }],
            ..Default::default()
        };
        let tables = [main_table_through("igw-1"), private];

        assert!(is_subnet_public(&tables, "subnet-other").unwrap());
        assert!(!is_subnet_public(&tables, "subnet-private").unwrap());
        assert!(is_subnet_public(&[], "subnet-other").is_err());
    }

    #[tokio::test]
    async fn ties_are_broken_by_role_tag_then_by_id() {
        let env = FakeEnvironment::new().await;
        for subnet in [
            cluster_subnet("subnet-b", "eu-west-2a", &[]),
            cluster_subnet("subnet-a", "eu-west-2a", &[]),
            cluster_subnet("subnet-d", "eu-west-2b", &[]),
            cluster_subnet("subnet-e", "eu-west-2b", &[]),
            cluster_subnet("subnet-z", "eu-west-2b", &[INTERNAL_ELB_ROLE_TAG]),
        ] {
            env.fake.compute.insert_subnet(subnet).await;
        }
        env.fake.compute.insert_route_table(main_table_through("igw-1")).await;
        let cloud = env.cloud().await;

        assert_eq!(
            vec!["subnet-a".to_owned(), "subnet-d".to_owned()],
            cloud.find_elb_subnets(false).await.unwrap()
        );
        assert_eq!(vec!["subnet-z".to_owned()], cloud.find_elb_subnets(true).await.unwrap());
    }

    #[tokio::test]
    async fn private_subnets_are_skipped_for_internet_facing_load_balancers() {
        let env = FakeEnvironment::new().await;
        env.fake
            .compute
            .insert_subnet(cluster_subnet("subnet-a", "eu-west-2a", &[]))
            .await;
        env.fake.compute.insert_route_table(main_table_through("vgw-1")).await;
        let cloud = env.cloud().await;

        assert!(cloud.find_elb_subnets(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn untagged_vpcs_fall_back_to_the_current_subnet() {
        let env = FakeEnvironment::new().await;
        env.fake
            .compute
            .insert_subnet(Subnet {
                id: "subnet-1".to_owned(),
                vpc_id: "vpc-1".to_owned(),
                availability_zone: "eu-west-2a".to_owned(),
                tags: Tags::new(),
            })
            .await;
        let cloud = env.cloud().await;

        let subnets = cloud.find_subnets().await.unwrap();

        assert_eq!(1, subnets.len());
        assert_eq!("subnet-1", subnets[0].id);
    }
}
