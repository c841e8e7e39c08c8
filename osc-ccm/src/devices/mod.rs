//! Mount device bookkeeping for block volume attachments

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use log::{info, warn};
use osc_ccm_core::{error::CloudError, model::Instance};
use tokio::sync::Mutex;

pub mod allocator;

use allocator::DeviceAllocator;

const DEVICE_PREFIXES: [&str; 2] = ["/dev/xvd", "/dev/sd"];

/// A device picked for a volume, e.g. `ba` for `/dev/xvdba`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDevice {
    pub name: String,
    /// The volume already occupies the device, or is being attached to it
    pub already_attached: bool,
}

impl MountDevice {
    pub fn path(&self) -> String {
        format!("{}{}", DEVICE_PREFIXES[0], self.name)
    }
}

/// Strips the `/dev/xvd` or `/dev/sd` prefix of a reported device name
pub fn device_suffix(device_name: &str) -> &str {
    DEVICE_PREFIXES
        .iter()
        .find_map(|prefix| device_name.strip_prefix(prefix))
        .unwrap_or(device_name)
}

type InFlight = BTreeMap<String, BTreeMap<String, String>>;

/// In-flight attachments and per-node allocators. The two are guarded separately,
/// and neither lock is ever held across a remote call.
#[derive(Default)]
pub struct DeviceManager {
    attaching: Mutex<InFlight>,
    allocators: Mutex<HashMap<String, Arc<Mutex<DeviceAllocator>>>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn allocator(&self, instance_id: &str) -> Arc<Mutex<DeviceAllocator>> {
        self.allocators
            .lock()
            .await
            .entry(instance_id.to_owned())
            .or_default()
            .clone()
    }

    /// Finds the device `volume_id` occupies on the instance. When it has none and
    /// `assign` is set, reserves a free one until [`DeviceManager::end_attaching`].
    pub async fn get_mount_device(
        &self,
        instance: &Instance,
        volume_id: &str,
        assign: bool,
    ) -> Result<Option<MountDevice>, CloudError> {
        let mut attaching = self.attaching.lock().await;

        let mut existing = instance
            .block_devices
            .iter()
            .map(|mapping| {
                (
                    device_suffix(&mapping.device_name).to_owned(),
                    mapping.volume_id.to_owned(),
                )
            })
            .collect::<BTreeMap<_, _>>();

        if let Some(in_flight) = attaching.get(&instance.id) {
            existing.extend(in_flight.clone());
        }

        let occupied = existing
            .iter()
            .find(|(_, occupant)| occupant.as_str() == volume_id);
        if let Some((name, _)) = occupied {
            if assign {
                warn!(
                    "Volume '{volume_id}' is already assigned to device '{name}' of instance '{}', a concurrent attach is likely.",
                    instance.id
                );
            }

            return Ok(Some(MountDevice {
                name: name.to_owned(),
                already_attached: true,
            }));
        }

        if !assign {
            return Ok(None);
        }

        let allocator = self.allocator(&instance.id).await;
        let name = allocator
            .lock()
            .await
            .next_device(&existing)
            .ok_or_else(|| CloudError::DevicesExhausted(instance.id.to_owned()))?;

        attaching
            .entry(instance.id.to_owned())
            .or_default()
            .insert(name.to_owned(), volume_id.to_owned());
        info!(
            "Assigned device '{name}' of instance '{}' to volume '{volume_id}'.",
            instance.id
        );

        Ok(Some(MountDevice {
            name,
            already_attached: false,
        }))
    }

    /// Releases the reservation, unless the device has since been reserved for another volume.
    /// `false` when nothing was released.
    pub async fn end_attaching(&self, instance_id: &str, volume_id: &str, device: &str) -> bool {
        let mut attaching = self.attaching.lock().await;
        let Some(in_flight) = attaching.get_mut(instance_id) else {
            return false;
        };

        match in_flight.get(device) {
            Some(occupant) if occupant == volume_id => {
                in_flight.remove(device);
                if in_flight.is_empty() {
                    attaching.remove(instance_id);
                }

                true
            }
            Some(occupant) => {
                warn!(
                    "Device '{device}' of instance '{instance_id}' is held by volume '{occupant}', not by volume '{volume_id}'!"
                );
                false
            }
            None => false,
        }
    }

    /// Pushes a device that was just used or freed to the back of the node's preference order
    pub async fn deprioritize(&self, instance_id: &str, device: &str) {
        self.allocator(instance_id).await.lock().await.deprioritize(device);
    }

    pub async fn in_flight(&self, instance_id: &str) -> BTreeMap<String, String> {
        self.attaching
            .lock()
            .await
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc};

    use futures::future::join_all;
    use osc_ccm_core::model::{BlockDeviceMapping, Instance};

    use super::{device_suffix, DeviceManager};

    fn instance_with_root() -> Instance {
        Instance {
            id: "i-1".to_owned(),
            block_devices: vec![BlockDeviceMapping {
                device_name: "/dev/sda".to_owned(),
                volume_id: "vol-root".to_owned(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn device_prefixes_are_stripped() {
        assert_eq!("ba", device_suffix("/dev/xvdba"));
        assert_eq!("a", device_suffix("/dev/sda"));
        assert_eq!("ba", device_suffix("ba"));
    }

    #[tokio::test]
    async fn concurrent_assignments_get_distinct_devices() {
        let manager = Arc::new(DeviceManager::new());
        let instance = instance_with_root();

        let devices = join_all((0..20).map(|index| {
            let manager = manager.clone();
            let instance = instance.clone();
            async move {
                manager
                    .get_mount_device(&instance, &format!("vol-{index}"), true)
                    .await
                    .unwrap()
                    .unwrap()
                    .name
            }
        }))
        .await;

        assert_eq!(20, devices.iter().collect::<BTreeSet<_>>().len());
        assert!(!devices.contains(&"a".to_owned()));
    }

    #[tokio::test]
    async fn reentering_returns_the_reserved_device() {
        let manager = DeviceManager::new();
        let instance = instance_with_root();

        let first = manager.get_mount_device(&instance, "vol-1", true).await.unwrap().unwrap();
        let second = manager.get_mount_device(&instance, "vol-1", true).await.unwrap().unwrap();

        assert!(!first.already_attached);
        assert!(second.already_attached);
        assert_eq!(first.name, second.name);
        assert_eq!(
            None,
            manager.get_mount_device(&instance, "vol-2", false).await.unwrap()
        );
    }

    #[tokio::test]
    async fn mismatched_end_attaching_leaves_the_reservation() {
        let manager = DeviceManager::new();
        let instance = instance_with_root();
        let device = manager
            .get_mount_device(&instance, "vol-1", true)
            .await
            .unwrap()
            .unwrap();

        assert!(!manager.end_attaching("i-1", "vol-other", &device.name).await);
        assert_eq!(
            Some(&"vol-1".to_owned()),
            manager.in_flight("i-1").await.get(&device.name)
        );

        assert!(manager.end_attaching("i-1", "vol-1", &device.name).await);
        assert!(manager.in_flight("i-1").await.is_empty());
    }

    #[tokio::test]
    async fn ending_without_a_reservation_is_a_no_op() {
        let manager = DeviceManager::new();
        let instance = instance_with_root();

        assert!(!manager.end_attaching("i-1", "vol-1", "ba").await);

        let device = manager
            .get_mount_device(&instance, "vol-1", true)
            .await
            .unwrap()
            .unwrap();
        assert!(!manager.end_attaching("i-1", "vol-1", "zz").await);
        assert!(manager.end_attaching("i-1", "vol-1", &device.name).await);
        assert!(!manager.end_attaching("i-1", "vol-1", &device.name).await);
        assert!(manager.in_flight("i-1").await.is_empty());
    }

    #[tokio::test]
    async fn released_devices_can_be_reassigned() {
        let manager = DeviceManager::new();
        let instance = instance_with_root();
        let device = manager
            .get_mount_device(&instance, "vol-1", true)
            .await
            .unwrap()
            .unwrap();
        manager.end_attaching("i-1", "vol-1", &device.name).await;

        let reassigned = manager
            .get_mount_device(&instance, "vol-2", true)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(device.name, reassigned.name);
    }
}
