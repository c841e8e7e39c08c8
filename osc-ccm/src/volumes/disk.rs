use log::{info, warn};
use osc_ccm_core::{
    backoff::{BackoffError, VOLUME_CREATE_BACKOFF},
    error::{CloudError, RemoteContext, RemoteErrorKind, ResourceKind},
    model::VolumeState,
    provider_id::{format_volume_name, parse_volume_id},
    tagging::ResourceLifecycle,
};

use super::{is_volume_gone, options::VolumeOptions};
use crate::cloud::Cloud;

const GIB: u64 = 1024 * 1024 * 1024;

pub fn round_up_to_gib(size_bytes: i64) -> Result<i64, CloudError> {
    let size_bytes = u64::try_from(size_bytes)
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| CloudError::validation(format!("Invalid volume size {size_bytes} bytes!")))?;

    i64::try_from(size_bytes.div_ceil(GIB))
        .map_err(|_| CloudError::validation(format!("Invalid volume size {size_bytes} bytes!")))
}

impl Cloud {
    /// Creates a volume tagged for the cluster and waits for it to become available.
    /// Returns the volume name, `aws://<zone>/<volume-id>`.
    pub async fn create_disk(&self, options: &VolumeOptions) -> Result<String, CloudError> {
        let request = options.create_request(&self.self_instance.availability_zone)?;

        let volume = self
            .compute
            .create_volume(&request)
            .await
            .remote("create volume")?;
        let volume_id = volume.id;
        info!(
            "Created {}GiB '{}' volume '{volume_id}' in '{}'.",
            request.size_gib, request.volume_type, request.availability_zone
        );

        if let Err(error) = self
            .tagging
            .create_tags(
                self.compute.as_ref(),
                &volume_id,
                ResourceLifecycle::Owned,
                &options.tags,
            )
            .await
        {
            warn!("Couldn't tag volume '{volume_id}', deleting it!");
            if let Err(delete_error) = self.compute.delete_volume(&volume_id).await {
                warn!("Couldn't delete untagged volume '{volume_id}'! Reason: {delete_error}");
            }

            return Err(error.into());
        }

        let available = VOLUME_CREATE_BACKOFF
            .poll(|| async {
                let volume = self.describe_volume(&volume_id).await?;
                Ok::<_, CloudError>((volume.state == VolumeState::Available).then_some(()))
            })
            .await;

        match available {
            Ok(()) => Ok(format_volume_name(&request.availability_zone, &volume_id)),
            Err(BackoffError::Aborted(error)) if is_volume_gone(&error) => {
                Err(CloudError::VolumeDisappeared(volume_id))
            }
            Err(BackoffError::Aborted(error)) => Err(error),
            Err(BackoffError::Timeout) => Err(CloudError::Timeout(
                format!("waiting for volume '{volume_id}' to become available").into(),
            )),
        }
    }

    /// Deletes an available volume. `Ok(false)` when the volume doesn't exist.
    pub async fn delete_disk(&self, volume_name: &str) -> Result<bool, CloudError> {
        let volume_id = parse_volume_id(volume_name)?;

        match self.check_if_available(&volume_id).await {
            Ok(_) => (),
            Err(error) if is_volume_gone(&error) => {
                info!("Volume '{volume_id}' not found when deleting it, assuming it's deleted.");
                return Ok(false);
            }
            Err(error) => return Err(error),
        }

        match self.compute.delete_volume(&volume_id).await {
            Ok(()) => {
                info!("Deleted volume '{volume_id}'.");
                Ok(true)
            }
            Err(error) => match error.kind() {
                RemoteErrorKind::NotFound(ResourceKind::Volume) => Ok(false),
                RemoteErrorKind::VolumeInUse => Err(CloudError::VolumeInUse(volume_id)),
                _ => Err(error).remote_with(|| format!("delete volume '{volume_id}'")),
            },
        }
    }

    /// Grows an available volume to `new_size_bytes` rounded up to whole GiB and waits
    /// for the new size to be reported. Returns the size in GiB.
    pub async fn resize_disk(&self, volume_name: &str, new_size_bytes: i64) -> Result<i64, CloudError> {
        let volume_id = parse_volume_id(volume_name)?;
        let requested_gib = round_up_to_gib(new_size_bytes)?;

        let volume = self.describe_volume(&volume_id).await?;
        if volume.size_gib >= requested_gib {
            info!(
                "Volume '{volume_id}' is already {}GiB, no need to resize it to {requested_gib}GiB.",
                volume.size_gib
            );
            return Ok(requested_gib);
        }

        self.check_if_available(&volume_id).await?;

        self.compute
            .update_volume(&volume_id, requested_gib)
            .await
            .remote_with(|| format!("resize volume '{volume_id}' to {requested_gib}GiB"))?;

        VOLUME_CREATE_BACKOFF
            .poll(|| async {
                let volume = self.describe_volume(&volume_id).await?;
                Ok::<_, CloudError>((volume.size_gib >= requested_gib).then_some(()))
            })
            .await
            .map_err(|error| match error {
                BackoffError::Aborted(error) => error,
                BackoffError::Timeout => CloudError::Timeout(
                    format!("waiting for volume '{volume_id}' to grow to {requested_gib}GiB").into(),
                ),
            })?;

        info!("Resized volume '{volume_id}' to {requested_gib}GiB.");
        Ok(requested_gib)
    }
}
