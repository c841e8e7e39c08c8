use kube::Resource;
use osc_ccm_core::error::CloudError;

pub trait RequireMetadata {
    fn require_name(&self) -> Result<&str, CloudError>;
    fn require_namespace(&self) -> Result<&str, CloudError>;
    fn require_uid(&self) -> Result<&str, CloudError>;
    fn annotation(&self, key: &str) -> Option<&str>;
}

impl<T: Resource> RequireMetadata for T {
    fn require_name(&self) -> Result<&str, CloudError> {
        Ok(self
            .meta()
            .name
            .as_ref()
            .ok_or_else(|| CloudError::validation("Object is missing its name!"))?
            .as_str())
    }

    fn require_namespace(&self) -> Result<&str, CloudError> {
        Ok(self
            .meta()
            .namespace
            .as_ref()
            .ok_or_else(|| CloudError::validation("Object is missing its namespace!"))?
            .as_str())
    }

    fn require_uid(&self) -> Result<&str, CloudError> {
        Ok(self
            .meta()
            .uid
            .as_ref()
            .ok_or_else(|| CloudError::validation("Object is missing its uid!"))?
            .as_str())
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }
}
