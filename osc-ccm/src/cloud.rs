use std::sync::Arc;

use log::{info, warn};
use osc_ccm_core::{
    api::{Compute, LoadBalancing, Metadata},
    config::CloudConfig,
    error::{CloudError, RemoteContext},
    model::Tags,
    tagging::ClusterTagging,
};

use crate::{
    devices::DeviceManager, events::NodeEvents, instances::directory, nodes::NodeLister,
};

/// Node name of the placeholder used when the control plane runs outside of the nodes' account
pub const PLACEHOLDER_NODE_NAME: &str = "master-dummy";

const KNOWN_REGIONS: [&str; 5] = [
    "eu-west-2",
    "us-east-2",
    "us-west-1",
    "cloudgouv-eu-west-1",
    "ap-northeast-1",
];

/// External collaborators the provider is built from
pub struct CloudServices {
    pub compute: Arc<dyn Compute>,
    pub load_balancing: Arc<dyn LoadBalancing>,
    pub metadata: Arc<dyn Metadata>,
    pub nodes: Arc<dyn NodeLister>,
    pub events: Arc<dyn NodeEvents>,
}

/// The instance the provider runs on, never rebuilt after startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfInstance {
    pub id: String,
    pub node_name: String,
    pub availability_zone: String,
    pub instance_type: String,
    pub vpc_id: String,
    pub subnet_id: String,
}

impl SelfInstance {
    fn placeholder(config: &CloudConfig) -> Self {
        Self {
            node_name: PLACEHOLDER_NODE_NAME.to_owned(),
            vpc_id: config.vpc.to_owned().unwrap_or_default(),
            subnet_id: config.subnet_id.to_owned().unwrap_or_default(),
            ..Default::default()
        }
    }
}

pub struct Cloud {
    pub compute: Arc<dyn Compute>,
    pub load_balancing: Arc<dyn LoadBalancing>,
    pub metadata: Arc<dyn Metadata>,
    pub nodes: Arc<dyn NodeLister>,
    pub events: Arc<dyn NodeEvents>,
    pub config: CloudConfig,
    pub region: String,
    pub vpc_id: String,
    pub tagging: ClusterTagging,
    pub self_instance: SelfInstance,
    pub devices: DeviceManager,
}

impl Cloud {
    pub async fn new(config: CloudConfig, services: CloudServices) -> Result<Self, CloudError> {
        info!("Starting Outscale cloud provider.");

        let zone = match &config.zone {
            Some(zone) => zone.to_owned(),
            None => services
                .metadata
                .availability_zone()
                .await
                .remote("read the availability zone from metadata")?,
        };
        let region = zone_to_region(&zone)?;

        if config.disable_strict_zone_check {
            warn!("Strict zone checking is disabled, proceeding with zone '{zone}'.");
        } else if !is_region_valid(&region, services.metadata.as_ref()).await {
            return Err(CloudError::validation(format!(
                "'{zone}' is not a valid zone (unknown region)!"
            )));
        }

        let (self_instance, self_tags) = if config.is_cross_account() {
            info!("Control plane runs outside of the nodes' account, using a placeholder instance.");
            (SelfInstance::placeholder(&config), Tags::new())
        } else {
            build_self_instance(services.compute.as_ref(), services.metadata.as_ref()).await?
        };

        let vpc_id = match self_instance.vpc_id.is_empty() {
            false => self_instance.vpc_id.to_owned(),
            true => find_vpc_id(services.metadata.as_ref()).await?,
        };

        let tagging = if config.kubernetes_cluster_tag.is_some()
            || config.kubernetes_cluster_id.is_some()
        {
            ClusterTagging::init(
                config.kubernetes_cluster_tag.as_deref(),
                config.kubernetes_cluster_id.as_deref(),
            )?
        } else {
            ClusterTagging::init_from_tags(&self_tags)?
        };

        info!(
            "Provider running as '{}' in region '{region}', vpc '{vpc_id}'.",
            self_instance.node_name
        );

        Ok(Self {
            compute: services.compute,
            load_balancing: services.load_balancing,
            metadata: services.metadata,
            nodes: services.nodes,
            events: services.events,
            config,
            region,
            vpc_id,
            tagging,
            self_instance,
            devices: DeviceManager::new(),
        })
    }

    pub fn has_cluster_id(&self) -> bool {
        self.tagging.cluster_id().is_some()
    }

    pub fn is_self(&self, node_name: &str) -> bool {
        node_name.is_empty() || node_name == self.self_instance.node_name
    }
}

/// `eu-west-2a` is in `eu-west-2`
pub fn zone_to_region(zone: &str) -> Result<String, CloudError> {
    if zone.chars().count() <= 1 {
        return Err(CloudError::validation(format!("Invalid zone '{zone}'!")));
    }

    let mut chars = zone.chars();
    chars.next_back();

    Ok(chars.as_str().to_owned())
}

async fn is_region_valid(region: &str, metadata: &dyn Metadata) -> bool {
    if KNOWN_REGIONS.contains(&region) {
        return true;
    }

    match metadata.availability_zone().await {
        Ok(zone) => zone_to_region(&zone).map_or(false, |own_region| own_region == region),
        Err(error) => {
            warn!("Couldn't read the availability zone to validate region '{region}'! Reason: {error}");
            false
        }
    }
}

async fn build_self_instance(
    compute: &dyn Compute,
    metadata: &dyn Metadata,
) -> Result<(SelfInstance, Tags), CloudError> {
    let instance_id = metadata
        .instance_id()
        .await
        .remote("read the instance id from metadata")?;
    let instance = directory::get_instance_by_id(compute, &instance_id).await?;

    let self_instance = SelfInstance {
        id: instance.id.to_owned(),
        node_name: instance.node_name().to_owned(),
        availability_zone: instance.availability_zone.to_owned(),
        instance_type: instance.instance_type.to_owned(),
        vpc_id: instance.vpc_id.to_owned(),
        subnet_id: instance.subnet_id.to_owned(),
    };

    Ok((self_instance, instance.tags))
}

/// First vpc id exposed by the network interfaces of the instance
async fn find_vpc_id(metadata: &dyn Metadata) -> Result<String, CloudError> {
    let macs = metadata
        .interface_macs()
        .await
        .remote("list the network interfaces of the instance")?;

    for mac in macs {
        if let Ok(vpc_id) = metadata
            .get_metadata(&format!("network/interfaces/macs/{mac}/vpc-id"))
            .await
        {
            return Ok(vpc_id);
        }
    }

    Err(CloudError::validation("Couldn't find the VPC id in instance metadata!"))
}
