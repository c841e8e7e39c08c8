use async_trait::async_trait;

use crate::error::ApiError;

/// String-keyed instance metadata lookup, e.g. `instance-id` or `placement/availability-zone`
#[async_trait]
pub trait Metadata: Send + Sync {
    async fn get_metadata(&self, path: &str) -> Result<String, ApiError>;

    async fn instance_id(&self) -> Result<String, ApiError> {
        self.get_metadata("instance-id").await
    }

    async fn availability_zone(&self) -> Result<String, ApiError> {
        self.get_metadata("placement/availability-zone").await
    }

    /// Mac addresses of the network interfaces, without the trailing slashes
    async fn interface_macs(&self) -> Result<Vec<String>, ApiError> {
        Ok(self
            .get_metadata("network/interfaces/macs/")
            .await?
            .lines()
            .map(|line| line.trim().trim_end_matches('/').to_owned())
            .filter(|mac| !mac.is_empty())
            .collect())
    }
}
