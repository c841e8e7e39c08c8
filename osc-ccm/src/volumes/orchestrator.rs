use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, error, info, warn};
use osc_ccm_core::{
    backoff::{BackoffError, VOLUME_ATTACHMENT_BACKOFF},
    error::{CloudError, RemoteContext},
    model::{AttachmentState, Instance, VolumeAttachment},
    provider_id::parse_volume_id,
};

use super::is_volume_gone;
use crate::{
    cloud::Cloud,
    devices::{device_suffix, MountDevice},
    events::{impaired_volumes_taint, VOLUME_ATTACHMENT_STUCK},
};

/// Describe failures tolerated in a row while waiting for an attachment
pub const ATTACHMENT_CONSECUTIVE_ERROR_LIMIT: u32 = 10;

impl Cloud {
    /// Polls the volume until its attachment reaches `expected`. A volume without
    /// attachments counts as detached, and so does a deleted one.
    pub async fn wait_for_attachment_state(
        &self,
        volume_id: &str,
        expected: AttachmentState,
    ) -> Result<Option<VolumeAttachment>, CloudError> {
        let describe_errors = AtomicU32::new(0);

        let result = VOLUME_ATTACHMENT_BACKOFF
            .poll(|| {
                let describe_errors = &describe_errors;
                async move {
                    let volume = match self.describe_volume(volume_id).await {
                        Ok(volume) => volume,
                        Err(error) if is_volume_gone(&error) => {
                            if expected == AttachmentState::Detached {
                                warn!("Waiting for volume '{volume_id}' to be detached but it doesn't exist.");
                                return Ok(Some(None));
                            }

                            warn!("Waiting for volume '{volume_id}' to be {expected} but it doesn't exist!");
                            return Err(error);
                        }
                        Err(error) => {
                            let count = describe_errors.fetch_add(1, Ordering::SeqCst) + 1;
                            if count > ATTACHMENT_CONSECUTIVE_ERROR_LIMIT {
                                return Err(error);
                            }

                            warn!("Ignoring error while describing volume '{volume_id}', will retry! Reason: {error}");
                            return Ok(None);
                        }
                    };

                    describe_errors.store(0, Ordering::SeqCst);

                    if volume.attachments.len() > 1 {
                        warn!("Found multiple attachments for volume '{volume_id}': {:?}", volume.attachments);
                    }

                    let attachment = volume.attachments.into_iter().next();
                    let state = attachment
                        .as_ref()
                        .map(|attachment| attachment.state)
                        .unwrap_or(AttachmentState::Detached);

                    if state == expected {
                        return Ok(Some(attachment));
                    }

                    debug!("Waiting for volume '{volume_id}' state: actual={state}, desired={expected}");
                    Ok(None)
                }
            })
            .await;

        result.map_err(|error| match error {
            BackoffError::Aborted(error) => error,
            BackoffError::Timeout => CloudError::Timeout(
                format!("waiting for volume '{volume_id}' to be {expected}").into(),
            ),
        })
    }

    /// Marks the node unschedulable and tells operators why. Failures are only logged.
    async fn report_stuck_attachment(&self, node_name: &str, volume_id: &str) {
        let node_name = match node_name.is_empty() {
            true => self.current_node_name(),
            false => node_name,
        };

        if let Err(error) = self.events.taint_node(node_name, impaired_volumes_taint()).await {
            error!("{error}");
        }

        let message = format!("Volume '{volume_id}' is stuck in attaching state, node '{node_name}' needs a reboot.");
        if let Err(error) = self.events.warn(node_name, VOLUME_ATTACHMENT_STUCK, message).await {
            error!("{error}");
        }
    }

    /// Attaches the volume to the node's instance, the node we run on when `node_name` is
    /// empty. Returns the device the volume shows up as inside the instance.
    pub async fn attach_disk(&self, volume_name: &str, node_name: &str) -> Result<String, CloudError> {
        let volume_id = parse_volume_id(volume_name)?;
        let instance = self.get_full_instance(node_name).await?;

        let device = self
            .devices
            .get_mount_device(&instance, &volume_id, true)
            .await?
            .ok_or_else(|| CloudError::DevicesExhausted(instance.id.to_owned()))?;
        let device_path = device.path();

        if !device.already_attached {
            if let Err(error) = self.link_volume(&instance, &volume_id, &device).await {
                self.devices.end_attaching(&instance.id, &volume_id, &device.name).await;
                return Err(error);
            }
        }

        // After a timeout the device stays reserved, so that a retry picks the same one.
        let attachment = match self
            .wait_for_attachment_state(&volume_id, AttachmentState::Attached)
            .await
        {
            Ok(attachment) => attachment,
            Err(error) if error.is_timeout() => {
                self.report_stuck_attachment(node_name, &volume_id).await;
                return Err(error);
            }
            Err(error) => {
                self.devices.end_attaching(&instance.id, &volume_id, &device.name).await;
                return Err(error);
            }
        };

        let ended = self.devices.end_attaching(&instance.id, &volume_id, &device.name).await;
        if !ended && !device.already_attached {
            warn!("Attachment of volume '{volume_id}' to '{}' ended while not in progress.", instance.id);
        }

        let attachment = attachment.ok_or_else(|| CloudError::AttachmentMismatch {
            volume_id: volume_id.to_owned(),
            details: "No attachment reported after attaching.".to_owned(),
        })?;

        if attachment.device != device_path {
            return Err(CloudError::AttachmentMismatch {
                volume_id,
                details: format!("Requested device '{device_path}' but found '{}'.", attachment.device),
            });
        }

        if attachment.instance_id != instance.id {
            return Err(CloudError::AttachmentMismatch {
                volume_id,
                details: format!(
                    "Requested instance '{}' but found '{}'.",
                    instance.id, attachment.instance_id
                ),
            });
        }

        if !device.already_attached {
            self.devices.deprioritize(&instance.id, &device.name).await;
        }

        info!("Attached volume '{volume_id}' to instance '{}' at '{device_path}'.", instance.id);
        Ok(device_path)
    }

    async fn link_volume(&self, instance: &Instance, volume_id: &str, device: &MountDevice) -> Result<(), CloudError> {
        self.check_if_available(volume_id).await?;

        let device_path = device.path();
        self.compute
            .link_volume(volume_id, &instance.id, &device_path)
            .await
            .remote_with(|| format!("attach volume '{volume_id}' to instance '{}'", instance.id))?;

        info!("Attaching volume '{volume_id}' to instance '{}' at '{device_path}'.", instance.id);
        Ok(())
    }

    /// Detaches the volume from the node's instance. Returns the device it was attached at,
    /// `None` when there was nothing to detach (including a volume that no longer exists).
    pub async fn detach_disk(&self, volume_name: &str, node_name: &str) -> Result<Option<String>, CloudError> {
        let volume_id = parse_volume_id(volume_name)?;

        let info = match self.check_if_attached_to_node(&volume_id, node_name).await {
            Ok(info) => info,
            Err(error) if is_volume_gone(&error) => {
                warn!("Volume '{volume_id}' doesn't exist, assuming it's detached from '{node_name}'.");
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        let Some(instance) = info.instance else {
            return Ok(None);
        };

        if !info.attached_to_node {
            warn!(
                "Volume '{volume_id}' should be detached from '{node_name}' but is attached to '{}'.",
                instance.node_name()
            );
            return Ok(None);
        }

        let device = self
            .devices
            .get_mount_device(&instance, &volume_id, false)
            .await?;
        if device.is_none() {
            warn!("Detaching volume '{volume_id}' that has no known device on instance '{}'.", instance.id);
        }

        self.compute
            .unlink_volume(&volume_id, &instance.id)
            .await
            .remote_with(|| format!("detach volume '{volume_id}' from instance '{}'", instance.id))?;

        self.wait_for_attachment_state(&volume_id, AttachmentState::Detached)
            .await?;

        let device_name = match device {
            Some(device) => device.name,
            None => info
                .volume
                .attachments
                .first()
                .map(|attachment| device_suffix(&attachment.device).to_owned())
                .unwrap_or_default(),
        };

        if device_name.is_empty() {
            return Ok(None);
        }

        self.devices.deprioritize(&instance.id, &device_name).await;
        if !self.devices.end_attaching(&instance.id, &volume_id, &device_name).await {
            debug!("No attachment of volume '{volume_id}' was in flight on instance '{}'.", instance.id);
        }

        let device = MountDevice {
            name: device_name,
            already_attached: true,
        };
        info!("Detached volume '{volume_id}' from instance '{}'.", instance.id);

        Ok(Some(device.path()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use osc_ccm_core::{
        error::{codes, ApiError, CloudError},
        model::{AttachmentState, BlockDeviceMapping, VolumeState},
    };

    use crate::{
        events::{IMPAIRED_VOLUMES_TAINT, VOLUME_ATTACHMENT_STUCK},
        test_support::FakeEnvironment,
        volumes::tests::{attached_volume, available_volume},
    };
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn attach_picks_a_free_device() {
        let env = FakeEnvironment::new().await;
        let mut instance = env.add_node("node-a", "i-a").await;
        instance.block_devices = vec![BlockDeviceMapping {
            device_name: "/dev/xvda".to_owned(),
            volume_id: "vol-1".to_owned(),
        }];
        env.fake.compute.insert_instance(instance).await;
        env.fake.compute.insert_volume(available_volume("vol-2")).await;
        let cloud = env.cloud().await;

        let path = cloud.attach_disk("aws://eu-west-2a/vol-2", "node-a").await.unwrap();

        assert_eq!("/dev/xvdba", path);
        assert_eq!(1, env.fake.compute.recorder.calls_to("link_volume").await.len());
        assert!(cloud.devices.in_flight("i-a").await.is_empty());
        assert!(cloud.disk_is_attached("vol-2", "node-a").await.unwrap());

        let again = cloud.attach_disk("vol-2", "node-a").await.unwrap();
        assert_eq!("/dev/xvdba", again);
        assert_eq!(1, env.fake.compute.recorder.calls_to("link_volume").await.len());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_attachments_taint_the_node() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        env.fake.compute.insert_volume(available_volume("vol-1")).await;
        env.fake.compute.state().await.stuck_volumes.insert("vol-1".to_owned());
        let cloud = env.cloud().await;

        let error = cloud.attach_disk("vol-1", "node-a").await.unwrap_err();

        assert!(error.is_timeout(), "unexpected error: {error}");
        let taints = env.events.taints.lock().await;
        assert_eq!(1, taints.len());
        assert_eq!("node-a", taints[0].0);
        assert_eq!(IMPAIRED_VOLUMES_TAINT, taints[0].1.key);
        let warnings = env.events.warnings.lock().await;
        assert_eq!(1, warnings.len());
        assert_eq!(VOLUME_ATTACHMENT_STUCK, warnings[0].1);
        assert_eq!(Some(&"vol-1".to_owned()), cloud.devices.in_flight("i-a").await.get("ba"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_links_release_the_device() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        env.fake.compute.insert_volume(available_volume("vol-1")).await;
        env.fake
            .compute
            .recorder
            .fail_next("link_volume", ApiError::new("InvalidParameterValue", "bad device"))
            .await;
        let cloud = env.cloud().await;

        assert!(cloud.attach_disk("vol-1", "node-a").await.is_err());
        assert!(cloud.devices.in_flight("i-a").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn volumes_deleted_while_attaching_release_the_device() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        env.fake.compute.insert_volume(available_volume("vol-1")).await;
        env.fake.compute.state().await.stuck_volumes.insert("vol-1".to_owned());
        let cloud = env.cloud().await;

        let (result, ()) = tokio::join!(cloud.attach_disk("vol-1", "node-a"), async {
            sleep(Duration::from_secs(3)).await;
            env.fake.compute.state().await.volumes.remove("vol-1");
        });

        let error = result.unwrap_err();
        assert!(error.is_not_found(), "unexpected error: {error}");
        assert!(cloud.devices.in_flight("i-a").await.is_empty());
        assert!(env.events.taints.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_attachments_keep_the_device_preferred() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        env.fake.compute.insert_volume(available_volume("vol-1")).await;
        env.fake.compute.insert_volume(available_volume("vol-2")).await;
        env.fake.compute.state().await.stuck_volumes.insert("vol-1".to_owned());
        let cloud = env.cloud().await;

        let (result, ()) = tokio::join!(cloud.attach_disk("vol-1", "node-a"), async {
            sleep(Duration::from_secs(3)).await;
            env.fake.compute.state().await.volumes.remove("vol-1");
        });
        assert!(result.is_err());

        assert_eq!("/dev/xvdba", cloud.attach_disk("vol-2", "node-a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn volumes_attached_elsewhere_are_dangling() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        env.add_node("node-b", "i-b").await;
        env.fake
            .compute
            .insert_volume(attached_volume("vol-1", "i-b", "/dev/xvdbc"))
            .await;
        let cloud = env.cloud().await;

        let error = cloud.attach_disk("vol-1", "node-a").await.unwrap_err();

        assert!(matches!(error, CloudError::DanglingVolume { .. }), "unexpected error: {error}");
        assert!(env.fake.compute.recorder.calls_to("link_volume").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn detach_waits_for_the_volume_to_be_released() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        env.fake.compute.insert_volume(available_volume("vol-1")).await;
        let cloud = env.cloud().await;
        cloud.attach_disk("vol-1", "node-a").await.unwrap();

        assert_eq!(None, cloud.detach_disk("vol-1", "node-b").await.unwrap());

        let path = cloud.detach_disk("vol-1", "node-a").await.unwrap();

        assert_eq!(Some("/dev/xvdba".to_owned()), path);
        let volume = env.fake.compute.volume("vol-1").await.unwrap();
        assert_eq!(VolumeState::Available, volume.state);
        assert!(env.fake.compute.state().await.instances["i-a"].block_devices.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn detaching_a_missing_volume_succeeds() {
        let env = FakeEnvironment::new().await;
        env.add_node("node-a", "i-a").await;
        let cloud = env.cloud().await;

        assert_eq!(None, cloud.detach_disk("vol-gone", "node-a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_describe_errors_are_tolerated() {
        let env = FakeEnvironment::new().await;
        env.fake
            .compute
            .insert_volume(attached_volume("vol-1", "i-a", "/dev/xvdba"))
            .await;
        for _ in 0..3 {
            env.fake
                .compute
                .recorder
                .fail_next("read_volumes", ApiError::new("RequestLimitExceeded", "slow down"))
                .await;
        }
        let cloud = env.cloud().await;

        let attachment = cloud
            .wait_for_attachment_state("vol-1", AttachmentState::Attached)
            .await
            .unwrap();
        assert_eq!(Some(AttachmentState::Attached), attachment.map(|attachment| attachment.state));

        for _ in 0..11 {
            env.fake
                .compute
                .recorder
                .fail_next("read_volumes", ApiError::new("RequestLimitExceeded", "slow down"))
                .await;
        }
        let error = cloud
            .wait_for_attachment_state("vol-1", AttachmentState::Attached)
            .await
            .unwrap_err();
        assert!(!error.is_timeout());

        env.fake
            .compute
            .recorder
            .fail_next("read_volumes", ApiError::new(codes::VOLUME_NOT_FOUND, "gone"))
            .await;
        assert_eq!(
            None,
            cloud
                .wait_for_attachment_state("vol-1", AttachmentState::Detached)
                .await
                .unwrap()
        );
    }
}
