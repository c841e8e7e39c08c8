use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    api::Compute,
    error::{codes, ApiError},
    model::{
        AttachmentState, BlockDeviceMapping, CreateVolumeRequest, Filter, Filterable,
        IngressRequest, Instance, Route, RouteState, RouteTable, SecurityGroup, Subnet, Tags,
        Volume, VolumeAttachment, VolumeState, Vpc,
    },
    permissions::{IpPermission, IpPermissionSet, UserIdGroupPair},
};

use super::{not_found, Recorder};

#[derive(Debug, Default)]
pub struct ComputeState {
    pub instances: BTreeMap<String, Instance>,
    pub security_groups: BTreeMap<String, SecurityGroup>,
    pub subnets: BTreeMap<String, Subnet>,
    pub vpcs: BTreeMap<String, Vpc>,
    pub route_tables: BTreeMap<String, RouteTable>,
    pub volumes: BTreeMap<String, Volume>,
    /// Volumes whose attachments never leave the transitional states
    pub stuck_volumes: BTreeSet<String>,
    next_id: u64,
}

impl ComputeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }

    fn tags_mut(&mut self, resource_id: &str) -> Option<&mut Tags> {
        if let Some(instance) = self.instances.get_mut(resource_id) {
            return Some(&mut instance.tags);
        }
        if let Some(group) = self.security_groups.get_mut(resource_id) {
            return Some(&mut group.tags);
        }
        if let Some(subnet) = self.subnets.get_mut(resource_id) {
            return Some(&mut subnet.tags);
        }
        if let Some(vpc) = self.vpcs.get_mut(resource_id) {
            return Some(&mut vpc.tags);
        }
        if let Some(table) = self.route_tables.get_mut(resource_id) {
            return Some(&mut table.tags);
        }
        self.volumes.get_mut(resource_id).map(|volume| &mut volume.tags)
    }

    /// Moves attachments one step forward, the way the real API settles between reads
    fn settle_volumes(&mut self) {
        for volume in self.volumes.values_mut() {
            if self.stuck_volumes.contains(&volume.id) {
                continue;
            }

            if volume.state == VolumeState::Creating {
                volume.state = VolumeState::Available;
            }

            for attachment in volume.attachments.iter_mut() {
                if attachment.state == AttachmentState::Attaching {
                    attachment.state = AttachmentState::Attached;
                    if let Some(instance) = self.instances.get_mut(&attachment.instance_id) {
                        instance.block_devices.push(BlockDeviceMapping {
                            device_name: attachment.device.to_owned(),
                            volume_id: volume.id.to_owned(),
                        });
                    }
                }
            }

            let detached = volume
                .attachments
                .iter()
                .filter(|attachment| attachment.state == AttachmentState::Detaching)
                .map(|attachment| attachment.instance_id.to_owned())
                .collect::<Vec<_>>();

            for instance_id in detached {
                if let Some(instance) = self.instances.get_mut(&instance_id) {
                    instance
                        .block_devices
                        .retain(|mapping| mapping.volume_id != volume.id);
                }
            }

            volume
                .attachments
                .retain(|attachment| attachment.state != AttachmentState::Detaching);

            if volume.attachments.is_empty() && volume.state == VolumeState::InUse {
                volume.state = VolumeState::Available;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeCompute {
    pub recorder: Recorder,
    state: Mutex<ComputeState>,
}

impl FakeCompute {
    pub async fn state(&self) -> MutexGuard<'_, ComputeState> {
        self.state.lock().await
    }

    pub async fn insert_instance(&self, instance: Instance) {
        self.state().await.instances.insert(instance.id.to_owned(), instance);
    }

    pub async fn insert_security_group(&self, group: SecurityGroup) {
        self.state().await.security_groups.insert(group.id.to_owned(), group);
    }

    pub async fn insert_subnet(&self, subnet: Subnet) {
        self.state().await.subnets.insert(subnet.id.to_owned(), subnet);
    }

    pub async fn insert_vpc(&self, vpc: Vpc) {
        self.state().await.vpcs.insert(vpc.id.to_owned(), vpc);
    }

    pub async fn insert_route_table(&self, table: RouteTable) {
        self.state().await.route_tables.insert(table.id.to_owned(), table);
    }

    pub async fn insert_volume(&self, volume: Volume) {
        self.state().await.volumes.insert(volume.id.to_owned(), volume);
    }

    pub async fn security_group(&self, group_id: &str) -> Option<SecurityGroup> {
        self.state().await.security_groups.get(group_id).cloned()
    }

    pub async fn volume(&self, volume_id: &str) -> Option<Volume> {
        self.state().await.volumes.get(volume_id).cloned()
    }

    pub async fn route_table(&self, route_table_id: &str) -> Option<RouteTable> {
        self.state().await.route_tables.get(route_table_id).cloned()
    }
}

fn matching<'a, T: Filterable + Clone + 'a>(
    resources: impl IntoIterator<Item = &'a T>,
    filters: &[Filter],
) -> Vec<T> {
    resources
        .into_iter()
        .filter(|resource| resource.matches(filters))
        .cloned()
        .collect()
}

fn requested_permissions(request: &IngressRequest) -> IpPermissionSet {
    match request {
        IngressRequest::Permissions(permissions) => {
            permissions.iter().cloned().collect::<IpPermissionSet>().ungroup()
        }
        IngressRequest::SourceGroup { name, owner_id } => {
            let pair = UserIdGroupPair {
                group_id: None,
                group_name: Some(name.to_owned()),
                user_id: Some(owner_id.to_owned()),
            };

            [IpPermission::all_traffic().with_group_pair(pair)]
                .into_iter()
                .collect()
        }
    }
}

#[async_trait]
impl Compute for FakeCompute {
    async fn read_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>, ApiError> {
        self.recorder.record("read_instances", "").await?;
        let state = self.state().await;

        Ok(matching(state.instances.values(), filters))
    }

    async fn set_source_dest_check(&self, instance_id: &str, enabled: bool) -> Result<(), ApiError> {
        self.recorder.record("set_source_dest_check", instance_id).await?;
        let mut state = self.state().await;
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| not_found(codes::INSTANCE_NOT_FOUND, instance_id))?;

        instance.source_dest_check = enabled;
        Ok(())
    }

    async fn read_security_groups(&self, filters: &[Filter]) -> Result<Vec<SecurityGroup>, ApiError> {
        self.recorder.record("read_security_groups", "").await?;
        let state = self.state().await;

        Ok(matching(state.security_groups.values(), filters))
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: &str,
    ) -> Result<String, ApiError> {
        self.recorder.record("create_security_group", name).await?;
        let mut state = self.state().await;

        let exists = state
            .security_groups
            .values()
            .any(|group| group.name == name && group.vpc_id == vpc_id);
        if exists {
            return Err(ApiError::new(
                codes::GROUP_DUPLICATE,
                format!("The security group '{name}' already exists"),
            ));
        }

        let id = state.next_id("sg");
        state.security_groups.insert(
            id.to_owned(),
            SecurityGroup {
                id: id.to_owned(),
                name: name.to_owned(),
                description: description.to_owned(),
                vpc_id: vpc_id.to_owned(),
                ..Default::default()
            },
        );

        Ok(id)
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), ApiError> {
        self.recorder.record("delete_security_group", group_id).await?;
        self.state()
            .await
            .security_groups
            .remove(group_id)
            .map(|_| ())
            .ok_or_else(|| not_found(codes::GROUP_NOT_FOUND, group_id))
    }

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        request: &IngressRequest,
    ) -> Result<(), ApiError> {
        self.recorder
            .record("authorize_security_group_ingress", group_id)
            .await?;
        let mut state = self.state().await;
        let group = state
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found(codes::GROUP_NOT_FOUND, group_id))?;

        let mut existing = group.ingress.iter().cloned().collect::<IpPermissionSet>().ungroup();
        let requested = requested_permissions(request);
        if requested.difference(&existing).is_empty() {
            return Err(ApiError::new(
                codes::PERMISSION_DUPLICATE,
                "The specified rule already exists",
            ));
        }

        for permission in requested {
            existing.insert(permission);
        }
        group.ingress = existing.list();

        Ok(())
    }

    async fn revoke_security_group_ingress(
        &self,
        group_id: &str,
        request: &IngressRequest,
    ) -> Result<(), ApiError> {
        self.recorder
            .record("revoke_security_group_ingress", group_id)
            .await?;
        let mut state = self.state().await;
        let group = state
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found(codes::GROUP_NOT_FOUND, group_id))?;

        let mut existing = group.ingress.iter().cloned().collect::<IpPermissionSet>().ungroup();
        existing.delete(requested_permissions(request).iter());
        group.ingress = existing.list();

        Ok(())
    }

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<(), ApiError> {
        self.recorder.record("create_tags", resource_id).await?;
        let mut state = self.state().await;
        let resource_tags = state
            .tags_mut(resource_id)
            .ok_or_else(|| not_found("InvalidID.NotFound", resource_id))?;

        resource_tags.extend(tags.clone());
        Ok(())
    }

    async fn read_subnets(&self, filters: &[Filter]) -> Result<Vec<Subnet>, ApiError> {
        self.recorder.record("read_subnets", "").await?;
        let state = self.state().await;

        Ok(matching(state.subnets.values(), filters))
    }

    async fn read_vpcs(&self, filters: &[Filter]) -> Result<Vec<Vpc>, ApiError> {
        self.recorder.record("read_vpcs", "").await?;
        let state = self.state().await;

        Ok(matching(state.vpcs.values(), filters))
    }

    async fn read_route_tables(&self, filters: &[Filter]) -> Result<Vec<RouteTable>, ApiError> {
        self.recorder.record("read_route_tables", "").await?;
        let state = self.state().await;

        Ok(matching(state.route_tables.values(), filters))
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination_cidr: &str,
        instance_id: &str,
    ) -> Result<(), ApiError> {
        self.recorder.record("create_route", destination_cidr).await?;
        let mut state = self.state().await;
        let table = state
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found(codes::ROUTE_TABLE_NOT_FOUND, route_table_id))?;

        if table
            .routes
            .iter()
            .any(|route| route.destination_cidr == destination_cidr)
        {
            return Err(ApiError::new(
                "RouteAlreadyExists",
                format!("A route for '{destination_cidr}' already exists"),
            ));
        }

        table.routes.push(Route {
            destination_cidr: destination_cidr.to_owned(),
            instance_id: Some(instance_id.to_owned()),
            gateway_id: None,
            state: RouteState::Active,
        });

        Ok(())
    }

    async fn delete_route(&self, route_table_id: &str, destination_cidr: &str) -> Result<(), ApiError> {
        self.recorder.record("delete_route", destination_cidr).await?;
        let mut state = self.state().await;
        let table = state
            .route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found(codes::ROUTE_TABLE_NOT_FOUND, route_table_id))?;

        table
            .routes
            .retain(|route| route.destination_cidr != destination_cidr);

        Ok(())
    }

    async fn read_volumes(&self, filters: &[Filter]) -> Result<Vec<Volume>, ApiError> {
        self.recorder.record("read_volumes", "").await?;
        let mut state = self.state().await;
        state.settle_volumes();

        Ok(matching(state.volumes.values(), filters))
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, ApiError> {
        self.recorder
            .record("create_volume", &request.availability_zone)
            .await?;
        let mut state = self.state().await;

        let volume = Volume {
            id: state.next_id("vol"),
            size_gib: request.size_gib,
            availability_zone: request.availability_zone.to_owned(),
            volume_type: request.volume_type.to_owned(),
            iops: request.iops,
            state: VolumeState::Creating,
            attachments: Vec::new(),
            tags: Tags::new(),
        };
        state.volumes.insert(volume.id.to_owned(), volume.clone());

        Ok(volume)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), ApiError> {
        self.recorder.record("delete_volume", volume_id).await?;
        let mut state = self.state().await;
        let volume = state
            .volumes
            .get(volume_id)
            .ok_or_else(|| not_found(codes::VOLUME_NOT_FOUND, volume_id))?;

        if !volume.attachments.is_empty() {
            return Err(ApiError::new(
                codes::VOLUME_IN_USE,
                format!("Volume '{volume_id}' is attached"),
            ));
        }

        state.volumes.remove(volume_id);
        Ok(())
    }

    async fn update_volume(&self, volume_id: &str, size_gib: i64) -> Result<(), ApiError> {
        self.recorder.record("update_volume", volume_id).await?;
        let mut state = self.state().await;
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(codes::VOLUME_NOT_FOUND, volume_id))?;

        volume.size_gib = size_gib;
        Ok(())
    }

    async fn link_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment, ApiError> {
        self.recorder.record("link_volume", volume_id).await?;
        let mut state = self.state().await;

        if !state.instances.contains_key(instance_id) {
            return Err(not_found(codes::INSTANCE_NOT_FOUND, instance_id));
        }

        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(codes::VOLUME_NOT_FOUND, volume_id))?;

        if !volume.attachments.is_empty() {
            return Err(ApiError::new(
                codes::VOLUME_IN_USE,
                format!("Volume '{volume_id}' is already attached"),
            ));
        }

        let attachment = VolumeAttachment {
            instance_id: instance_id.to_owned(),
            device: device.to_owned(),
            state: AttachmentState::Attaching,
        };
        volume.attachments.push(attachment.clone());
        volume.state = VolumeState::InUse;

        Ok(attachment)
    }

    async fn unlink_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<VolumeAttachment, ApiError> {
        self.recorder.record("unlink_volume", volume_id).await?;
        let mut state = self.state().await;
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(codes::VOLUME_NOT_FOUND, volume_id))?;

        let attachment = volume
            .attachments
            .iter_mut()
            .find(|attachment| attachment.instance_id == instance_id)
            .ok_or_else(|| {
                ApiError::new(
                    "IncorrectState",
                    format!("Volume '{volume_id}' isn't attached to '{instance_id}'"),
                )
            })?;

        attachment.state = AttachmentState::Detaching;
        Ok(attachment.clone())
    }
}
