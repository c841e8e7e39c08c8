use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeSpec, Service, ServicePort, ServiceSpec, Taint};
use kube::api::ObjectMeta;
use osc_ccm_core::{
    config::CloudConfigBuilder,
    fake::FakeCloud,
    model::{Instance, InstanceState, Tags, Vpc},
    tagging::CLUSTER_TAG_PREFIX,
    NODE_NAME_TAG,
};

use crate::{
    cloud::{Cloud, CloudServices},
    events::{EventsError, NodeEvents},
    nodes::NodeLister,
};

pub const CLUSTER_ID: &str = "alpha";
pub const SELF_NODE_NAME: &str = "ip-10-0-0-1.eu-west-2.compute.internal";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A running instance of the test cluster, its node name doubles as private DNS name
pub fn cluster_instance(id: &str, node_name: &str) -> Instance {
    Instance {
        id: id.to_owned(),
        instance_type: "tinav5.c2r4p2".to_owned(),
        state: InstanceState::Running,
        availability_zone: "eu-west-2a".to_owned(),
        vpc_id: "vpc-1".to_owned(),
        subnet_id: "subnet-1".to_owned(),
        private_dns_name: node_name.to_owned(),
        private_ip: Some("10.0.0.10".to_owned()),
        source_dest_check: true,
        tags: Tags::from([
            (format!("{CLUSTER_TAG_PREFIX}{CLUSTER_ID}"), "owned".to_owned()),
            (NODE_NAME_TAG.to_owned(), node_name.to_owned()),
        ]),
        ..Default::default()
    }
}

/// `shop/web`, a load balancer service exposing `(port, node_port)` pairs over TCP
pub fn load_balancer_service(ports: &[(i32, i32)], annotations: &[(&str, &str)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("web".to_owned()),
            namespace: Some("shop".to_owned()),
            uid: Some("0b1c2d3e-4f5a-6b7c-8d9e-0f1a2b3c4d5e".to_owned()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_owned()),
            session_affinity: Some("None".to_owned()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port, node_port)| ServicePort {
                        port: *port,
                        node_port: Some(*node_port),
                        protocol: Some("TCP".to_owned()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

#[derive(Default)]
pub struct StaticNodes {
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    synced: AtomicBool,
}

impl StaticNodes {
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Release);
    }

    pub fn insert(&self, node: Node) {
        let name = node.metadata.name.to_owned().unwrap_or_default();
        self.nodes.lock().unwrap().insert(name, Arc::new(node));
    }
}

impl NodeLister for StaticNodes {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.lock().unwrap().get(name).cloned()
    }
}

#[derive(Default)]
pub struct RecordedEvents {
    pub taints: tokio::sync::Mutex<Vec<(String, Taint)>>,
    pub warnings: tokio::sync::Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl NodeEvents for RecordedEvents {
    async fn taint_node(&self, node_name: &str, taint: Taint) -> Result<(), EventsError> {
        self.taints.lock().await.push((node_name.to_owned(), taint));
        Ok(())
    }

    async fn warn(&self, node_name: &str, reason: &str, message: String) -> Result<(), EventsError> {
        self.warnings
            .lock()
            .await
            .push((node_name.to_owned(), reason.to_owned(), message));
        Ok(())
    }
}

/// Fakes seeded with the instance the provider runs on and its VPC
pub struct FakeEnvironment {
    pub fake: FakeCloud,
    pub nodes: Arc<StaticNodes>,
    pub events: Arc<RecordedEvents>,
}

impl FakeEnvironment {
    pub async fn new() -> Self {
        init_logging();

        let fake = FakeCloud::new();
        fake.metadata.set("instance-id", "i-self").await;
        fake.metadata
            .set("placement/availability-zone", "eu-west-2a")
            .await;
        fake.compute
            .insert_instance(cluster_instance("i-self", SELF_NODE_NAME))
            .await;
        fake.compute
            .insert_vpc(Vpc {
                id: "vpc-1".to_owned(),
                cidr_blocks: vec!["10.0.0.0/16".to_owned()],
                ..Default::default()
            })
            .await;

        let nodes = Arc::new(StaticNodes::default());
        nodes.set_synced(true);

        Self {
            fake,
            nodes,
            events: Arc::new(RecordedEvents::default()),
        }
    }

    pub fn services(&self) -> CloudServices {
        CloudServices {
            compute: self.fake.compute.clone(),
            load_balancing: self.fake.load_balancing.clone(),
            metadata: self.fake.metadata.clone(),
            nodes: self.nodes.clone(),
            events: self.events.clone(),
        }
    }

    pub async fn cloud(&self) -> Cloud {
        let config = CloudConfigBuilder::default()
            .zone("eu-west-2a")
            .kubernetes_cluster_id(CLUSTER_ID)
            .build()
            .unwrap();

        Cloud::new(config, self.services()).await.unwrap()
    }

    /// Registers a cluster instance and the node backed by it
    pub async fn add_node(&self, node_name: &str, instance_id: &str) -> Instance {
        let instance = cluster_instance(instance_id, node_name);
        self.fake.compute.insert_instance(instance.clone()).await;
        self.nodes.insert(Node {
            metadata: ObjectMeta {
                name: Some(node_name.to_owned()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(format!("aws:///eu-west-2a/{instance_id}")),
                ..Default::default()
            }),
            status: None,
        });

        instance
    }
}
