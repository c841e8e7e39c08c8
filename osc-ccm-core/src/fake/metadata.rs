use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{api::Metadata, error::ApiError};

use super::not_found;

#[derive(Debug, Default)]
pub struct FakeMetadata {
    values: Mutex<BTreeMap<String, String>>,
}

impl FakeMetadata {
    pub async fn set(&self, path: impl Into<String>, value: impl Into<String>) {
        self.values.lock().await.insert(path.into(), value.into());
    }
}

#[async_trait]
impl Metadata for FakeMetadata {
    async fn get_metadata(&self, path: &str) -> Result<String, ApiError> {
        self.values
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| not_found("NotFound", path))
    }
}

#[cfg(test)]
mod tests {
    use super::FakeMetadata;
    use crate::api::Metadata;

    #[tokio::test]
    async fn interface_macs_are_read_one_per_line() {
        let metadata = FakeMetadata::default();
        metadata
            .set("network/interfaces/macs/", "0a:1b:2c:3d:4e:5f/\n0a:1b:2c:3d:4e:60/\n")
            .await;
        metadata.set("instance-id", "i-42").await;

        assert_eq!(
            vec!["0a:1b:2c:3d:4e:5f", "0a:1b:2c:3d:4e:60"],
            metadata.interface_macs().await.unwrap()
        );
        assert_eq!("i-42", metadata.instance_id().await.unwrap());
        assert!(metadata.availability_zone().await.is_err());
    }
}
