use async_trait::async_trait;

use crate::{
    error::ApiError,
    model::{
        CreateVolumeRequest, Filter, IngressRequest, Instance, RouteTable, SecurityGroup, Subnet,
        Tags, Volume, VolumeAttachment, Vpc,
    },
};

#[async_trait]
pub trait Compute: Send + Sync {
    async fn read_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>, ApiError>;

    async fn set_source_dest_check(&self, instance_id: &str, enabled: bool) -> Result<(), ApiError>;

    async fn read_security_groups(&self, filters: &[Filter]) -> Result<Vec<SecurityGroup>, ApiError>;

    /// Returns the id of the new group
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: &str,
    ) -> Result<String, ApiError>;

    async fn delete_security_group(&self, group_id: &str) -> Result<(), ApiError>;

    async fn authorize_security_group_ingress(
        &self,
        group_id: &str,
        request: &IngressRequest,
    ) -> Result<(), ApiError>;

    async fn revoke_security_group_ingress(
        &self,
        group_id: &str,
        request: &IngressRequest,
    ) -> Result<(), ApiError>;

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<(), ApiError>;

    async fn read_subnets(&self, filters: &[Filter]) -> Result<Vec<Subnet>, ApiError>;

    async fn read_vpcs(&self, filters: &[Filter]) -> Result<Vec<Vpc>, ApiError>;

    async fn read_route_tables(&self, filters: &[Filter]) -> Result<Vec<RouteTable>, ApiError>;

    async fn create_route(
        &self,
        route_table_id: &str,
        destination_cidr: &str,
        instance_id: &str,
    ) -> Result<(), ApiError>;

    async fn delete_route(&self, route_table_id: &str, destination_cidr: &str)
        -> Result<(), ApiError>;

    async fn read_volumes(&self, filters: &[Filter]) -> Result<Vec<Volume>, ApiError>;

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, ApiError>;

    async fn delete_volume(&self, volume_id: &str) -> Result<(), ApiError>;

    async fn update_volume(&self, volume_id: &str, size_gib: i64) -> Result<(), ApiError>;

    async fn link_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment, ApiError>;

    async fn unlink_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
    ) -> Result<VolumeAttachment, ApiError>;
}
