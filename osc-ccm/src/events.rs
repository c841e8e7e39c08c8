use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Taint};
use kube::{
    api::{Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Api, Client,
};
use log::info;
use serde_json::json;
use thiserror::Error;

pub const IMPAIRED_VOLUMES_TAINT: &str = "NodeWithImpairedVolumes";
pub const VOLUME_ATTACHMENT_STUCK: &str = "VolumeAttachmentStuck";

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("Couldn't taint node '{}'! Reason: {}", .node_name, .source)]
    Taint {
        node_name: String,
        source: kube::Error,
    },
    #[error("Couldn't publish an event for node '{}'! Reason: {}", .node_name, .source)]
    Publish {
        node_name: String,
        source: kube::Error,
    },
}

/// Surfaces node-level conditions to cluster operators
#[async_trait]
pub trait NodeEvents: Send + Sync {
    /// Adds the taint unless the node already carries one with the same key and effect
    async fn taint_node(&self, node_name: &str, taint: Taint) -> Result<(), EventsError>;

    async fn warn(&self, node_name: &str, reason: &str, message: String) -> Result<(), EventsError>;
}

pub fn impaired_volumes_taint() -> Taint {
    Taint {
        key: IMPAIRED_VOLUMES_TAINT.to_owned(),
        value: Some("true".to_owned()),
        effect: "NoSchedule".to_owned(),
        time_added: None,
    }
}

pub struct KubeNodeEvents {
    client: Client,
    reporter: Reporter,
}

impl KubeNodeEvents {
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_owned(),
                instance: None,
            },
        }
    }
}

fn node_reference(node_name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_owned()),
        kind: Some("Node".to_owned()),
        name: Some(node_name.to_owned()),
        ..Default::default()
    }
}

#[async_trait]
impl NodeEvents for KubeNodeEvents {
    async fn taint_node(&self, node_name: &str, taint: Taint) -> Result<(), EventsError> {
        let api = Api::<Node>::all(self.client.clone());
        let into_error = |source| EventsError::Taint {
            node_name: node_name.to_owned(),
            source,
        };

        let node = api.get(node_name).await.map_err(into_error)?;
        let mut taints = node
            .spec
            .and_then(|spec| spec.taints)
            .unwrap_or_default();

        if taints
            .iter()
            .any(|existing| existing.key == taint.key && existing.effect == taint.effect)
        {
            return Ok(());
        }

        taints.push(taint);
        api.patch(
            node_name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "spec": { "taints": taints } })),
        )
        .await
        .map_err(into_error)?;

        info!("Tainted node '{node_name}'.");
        Ok(())
    }

    async fn warn(&self, node_name: &str, reason: &str, message: String) -> Result<(), EventsError> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            node_reference(node_name),
        );

        recorder
            .publish(Event {
                type_: EventType::Warning,
                reason: reason.to_owned(),
                note: Some(message),
                action: "AttachVolume".to_owned(),
                secondary: None,
            })
            .await
            .map_err(|source| EventsError::Publish {
                node_name: node_name.to_owned(),
                source,
            })
    }
}
