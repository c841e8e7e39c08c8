//! Block volumes: creation, deletion, resize, attachment and the checks the attach/detach
//! controller runs against them

use std::collections::BTreeMap;

use log::{debug, warn};
use osc_ccm_core::{
    error::{CloudError, RemoteContext, RemoteErrorKind, ResourceKind},
    model::{Filter, Instance, Volume, VolumeState},
    provider_id::parse_volume_id,
};

use crate::cloud::{zone_to_region, Cloud};

pub mod disk;
pub mod options;
pub mod orchestrator;

pub use options::{VolumeOptions, VolumeOptionsBuilder, VolumeType};

pub const LABEL_ZONE: &str = "failure-domain.beta.kubernetes.io/zone";
pub const LABEL_REGION: &str = "failure-domain.beta.kubernetes.io/region";

/// Where a volume is attached, relative to the node that asked
#[derive(Debug, Clone)]
pub struct AttachmentInfo {
    pub volume: Volume,
    /// Instance holding the first attachment of the volume
    pub instance: Option<Instance>,
    pub attached_to_node: bool,
}

/// The volume itself is gone, as opposed to something it refers to
pub fn is_volume_gone(error: &CloudError) -> bool {
    match error {
        CloudError::NotFound { kind, .. } => *kind == ResourceKind::Volume,
        other => other.remote_kind() == Some(RemoteErrorKind::NotFound(ResourceKind::Volume)),
    }
}

impl Cloud {
    pub async fn describe_volume(&self, volume_id: &str) -> Result<Volume, CloudError> {
        let mut volumes = self
            .compute
            .read_volumes(&[Filter::single("volume-id", volume_id)])
            .await
            .remote_with(|| format!("describe volume '{volume_id}'"))?;

        match volumes.len() {
            0 => Err(CloudError::not_found(ResourceKind::Volume, volume_id)),
            1 => volumes
                .pop()
                .ok_or_else(|| CloudError::not_found(ResourceKind::Volume, volume_id)),
            count => Err(CloudError::Ambiguous {
                kind: ResourceKind::Volume,
                id: volume_id.to_owned(),
                count,
            }),
        }
    }

    /// Fails unless the volume is `available`. A volume attached somewhere is reported as
    /// dangling, with the node and device holding it.
    async fn check_if_available(&self, volume_id: &str) -> Result<Volume, CloudError> {
        let volume = self.describe_volume(volume_id).await?;
        if volume.state == VolumeState::Available {
            return Ok(volume);
        }

        let Some(attachment) = volume.attachments.first() else {
            debug!("Volume '{volume_id}' is '{}', not available.", volume.state);
            return Err(CloudError::VolumeInUse(volume_id.to_owned()));
        };

        let node_name = match self.get_instance_by_id(&attachment.instance_id).await {
            Ok(instance) => Some(instance.node_name().to_owned()),
            Err(error) => {
                warn!(
                    "Couldn't resolve instance '{}' holding volume '{volume_id}'! Reason: {error}",
                    attachment.instance_id
                );
                None
            }
        };

        Err(CloudError::DanglingVolume {
            volume_id: volume_id.to_owned(),
            instance_id: attachment.instance_id.to_owned(),
            node_name,
            device: attachment.device.to_owned(),
        })
    }

    /// Describes the volume and the instance it's attached to. `node_name` is
    /// compared to the instance's node name, empty means the node we run on.
    pub async fn check_if_attached_to_node(
        &self,
        volume_id: &str,
        node_name: &str,
    ) -> Result<AttachmentInfo, CloudError> {
        let volume = self.describe_volume(volume_id).await?;
        let node_name = match node_name.is_empty() {
            true => self.current_node_name(),
            false => node_name,
        };

        let Some(attachment) = volume.attachments.first() else {
            return Ok(AttachmentInfo {
                volume,
                instance: None,
                attached_to_node: false,
            });
        };

        let instance = self
            .get_instance_by_id(&attachment.instance_id)
            .await
            .inspect_err(|error| {
                warn!(
                    "Couldn't fetch instance '{}' holding volume '{volume_id}'! Reason: {error}",
                    attachment.instance_id
                )
            })?;

        Ok(AttachmentInfo {
            attached_to_node: instance.node_name() == node_name,
            instance: Some(instance),
            volume,
        })
    }

    /// Topology labels for a persistent volume
    pub async fn get_volume_labels(&self, volume_name: &str) -> Result<BTreeMap<String, String>, CloudError> {
        let volume_id = parse_volume_id(volume_name)?;
        let volume = self.describe_volume(&volume_id).await?;

        if volume.availability_zone.is_empty() {
            return Err(CloudError::validation(format!(
                "Volume '{volume_id}' has no availability zone!"
            )));
        }

        let region = zone_to_region(&volume.availability_zone)?;

        Ok(BTreeMap::from([
            (LABEL_ZONE.to_owned(), volume.availability_zone),
            (LABEL_REGION.to_owned(), region),
        ]))
    }

    /// Device the volume is attached at, as reported by the API
    pub async fn get_disk_path(&self, volume_name: &str) -> Result<String, CloudError> {
        let volume_id = parse_volume_id(volume_name)?;
        let volume = self.describe_volume(&volume_id).await?;

        if volume.state != VolumeState::InUse || volume.attachments.is_empty() {
            return Err(CloudError::validation(format!(
                "Volume '{volume_id}' isn't attached!"
            )));
        }

        match volume.attachments.as_slice() {
            [attachment] => Ok(attachment.device.to_owned()),
            attachments => Err(CloudError::AttachmentMismatch {
                volume_id,
                details: format!("Attached to {} instances.", attachments.len()),
            }),
        }
    }

    /// A volume that doesn't exist isn't attached
    pub async fn disk_is_attached(&self, volume_name: &str, node_name: &str) -> Result<bool, CloudError> {
        let volume_id = parse_volume_id(volume_name)?;

        match self.check_if_attached_to_node(&volume_id, node_name).await {
            Ok(info) => Ok(info.attached_to_node),
            Err(error) if is_volume_gone(&error) => {
                warn!("Volume '{volume_id}' doesn't exist, assuming it's not attached to '{node_name}'.");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// Attachment status of volumes per node, read from the block device maps of the
    /// nodes' instances. Volumes of nodes without an instance are reported detached.
    pub async fn disks_are_attached(
        &self,
        node_disks: &BTreeMap<String, Vec<String>>,
    ) -> Result<BTreeMap<String, BTreeMap<String, bool>>, CloudError> {
        let mut attached = node_disks
            .iter()
            .map(|(node_name, volume_names)| {
                let volumes = volume_names
                    .iter()
                    .map(|volume_name| (volume_name.to_owned(), false))
                    .collect::<BTreeMap<_, _>>();
                (node_name.to_owned(), volumes)
            })
            .collect::<BTreeMap<_, _>>();

        if node_disks.is_empty() {
            return Ok(attached);
        }

        let node_names = node_disks.keys().cloned().collect::<Vec<_>>();
        let instances = self.get_instances_by_node_names(&node_names, &[]).await?;
        if instances.is_empty() {
            debug!("No instances found for nodes {node_names:?}, assuming their volumes are detached.");
            return Ok(attached);
        }

        for instance in instances {
            let node_name = instance.node_name();
            let Some(volume_names) = node_disks.get(node_name) else {
                continue;
            };

            let mut by_volume_id = BTreeMap::new();
            for volume_name in volume_names {
                by_volume_id.insert(parse_volume_id(volume_name)?, volume_name);
            }

            let Some(node_volumes) = attached.get_mut(node_name) else {
                continue;
            };

            for mapping in &instance.block_devices {
                if let Some(volume_name) = by_volume_id.get(&mapping.volume_id) {
                    node_volumes.insert((*volume_name).to_owned(), true);
                }
            }
        }

        Ok(attached)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use osc_ccm_core::model::{
        AttachmentState, BlockDeviceMapping, Volume, VolumeAttachment, VolumeState,
    };

    use super::{LABEL_REGION, LABEL_ZONE};
    use crate::test_support::FakeEnvironment;

    pub fn available_volume(id: &str) -> Volume {
        Volume {
            id: id.to_owned(),
            size_gib: 10,
            availability_zone: "eu-west-2a".to_owned(),
            volume_type: "gp2".to_owned(),
            state: VolumeState::Available,
            ..Default::default()
        }
    }

    pub fn attached_volume(id: &str, instance_id: &str, device: &str) -> Volume {
        Volume {
            state: VolumeState::InUse,
            attachments: vec![VolumeAttachment {
                instance_id: instance_id.to_owned(),
                device: device.to_owned(),
                state: AttachmentState::Attached,
            }],
            ..available_volume(id)
        }
    }

    #[tokio::test]
    async fn volume_labels_carry_zone_and_region() {
        let env = FakeEnvironment::new().await;
        env.fake.compute.insert_volume(available_volume("vol-1")).await;
        let cloud = env.cloud().await;

        let labels = cloud.get_volume_labels("aws://eu-west-2a/vol-1").await.unwrap();

        assert_eq!(
            BTreeMap::from([
                (LABEL_ZONE.to_owned(), "eu-west-2a".to_owned()),
                (LABEL_REGION.to_owned(), "eu-west-2".to_owned()),
            ]),
            labels
        );
    }

    #[tokio::test]
    async fn disk_path_requires_a_single_attachment() {
        let env = FakeEnvironment::new().await;
        env.fake.compute.insert_volume(available_volume("vol-1")).await;
        env.fake
            .compute
            .insert_volume(attached_volume("vol-2", "i-a", "/dev/xvdbb"))
            .await;
        let cloud = env.cloud().await;

        assert!(cloud.get_disk_path("vol-1").await.is_err());
        assert_eq!("/dev/xvdbb", cloud.get_disk_path("vol-2").await.unwrap());
        assert!(cloud.get_disk_path("vol-missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn attachment_is_checked_against_the_node() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        env.add_node("node-b", "i-b").await;
        env.fake
            .compute
            .insert_volume(attached_volume("vol-1", "i-a", "/dev/xvdba"))
            .await;
        let cloud = env.cloud().await;

        assert!(cloud.disk_is_attached("vol-1", "node-a").await.unwrap());
        assert!(!cloud.disk_is_attached("vol-1", "node-b").await.unwrap());
        assert!(!cloud.disk_is_attached("vol-gone", "node-a").await.unwrap());
    }

    #[tokio::test]
    async fn disks_are_attached_reads_block_device_maps() {
        let env = FakeEnvironment::new().await;
        let mut instance = env.add_node("node-a", "i-a").await;
        instance.block_devices = vec![BlockDeviceMapping {
            device_name: "/dev/xvdba".to_owned(),
            volume_id: "vol-1".to_owned(),
        }];
        env.fake.compute.insert_instance(instance).await;
        let cloud = env.cloud().await;

        let node_disks = BTreeMap::from([
            (
                "node-a".to_owned(),
                vec!["aws://eu-west-2a/vol-1".to_owned(), "vol-2".to_owned()],
            ),
            ("node-gone".to_owned(), vec!["vol-3".to_owned()]),
        ]);

        let attached = cloud.disks_are_attached(&node_disks).await.unwrap();

        assert_eq!(
            BTreeMap::from([
                (
                    "node-a".to_owned(),
                    BTreeMap::from([
                        ("aws://eu-west-2a/vol-1".to_owned(), true),
                        ("vol-2".to_owned(), false),
                    ])
                ),
                (
                    "node-gone".to_owned(),
                    BTreeMap::from([("vol-3".to_owned(), false)])
                ),
            ]),
            attached
        );
    }
}
