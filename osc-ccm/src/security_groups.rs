use std::time::Duration;

use log::{debug, error, info, warn};
use osc_ccm_core::{
    error::{CloudError, RemoteContext, RemoteErrorKind, ResourceKind},
    model::{Filter, IngressRequest, SecurityGroup, Tags},
    permissions::{IpPermission, IpPermissionSet},
    tagging::ResourceLifecycle,
};
use tokio::time::sleep;

use crate::cloud::Cloud;

/// Well-known peer group load balancers use when there is no VPC to put them in
pub const DEFAULT_SOURCE_GROUP_NAME: &str = "outscale-elb-sg";
pub const DEFAULT_SOURCE_GROUP_OWNER: &str = "outscale-elb";

const MAX_READ_THEN_CREATE_RETRIES: u32 = 30;

fn public_cloud_request() -> IngressRequest {
    IngressRequest::SourceGroup {
        name: DEFAULT_SOURCE_GROUP_NAME.to_owned(),
        owner_id: DEFAULT_SOURCE_GROUP_OWNER.to_owned(),
    }
}

fn has_user_id(permission: &IpPermission) -> bool {
    permission
        .user_id_group_pairs
        .iter()
        .any(|pair| pair.user_id.is_some())
}

impl Cloud {
    /// Looks a group up by id, without cluster filtering
    pub async fn find_security_group(&self, group_id: &str) -> Result<Option<SecurityGroup>, CloudError> {
        let mut groups = self
            .compute
            .read_security_groups(&[Filter::single("group-id", group_id)])
            .await
            .remote_with(|| format!("describe security group '{group_id}'"))?;

        match groups.len() {
            0 | 1 => Ok(groups.pop()),
            count => Err(CloudError::Ambiguous {
                kind: ResourceKind::SecurityGroup,
                id: group_id.to_owned(),
                count,
            }),
        }
    }

    async fn require_security_group(&self, group_id: &str) -> Result<SecurityGroup, CloudError> {
        self.find_security_group(group_id)
            .await?
            .ok_or_else(|| CloudError::not_found(ResourceKind::SecurityGroup, group_id))
    }

    /// Converges the ingress of the group to exactly `permissions`.
    /// Returns whether anything was changed.
    pub async fn set_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &IpPermissionSet,
    ) -> Result<bool, CloudError> {
        if self.config.is_global_security_group(group_id) {
            return Ok(false);
        }

        let group = self.require_security_group(group_id).await?;
        debug!("Existing ingress of security group '{group_id}': {:?}", group.ingress);

        // The API coalesces rules sharing a port, both sides have to be split before diffing
        let desired = permissions.ungroup();
        let actual = group.ingress.into_iter().collect::<IpPermissionSet>().ungroup();

        let add = desired.difference(&actual);
        let remove = actual.difference(&desired);

        if add.is_empty() && remove.is_empty() {
            return Ok(false);
        }

        if !add.is_empty() {
            info!("Adding {} ingress rules to security group '{group_id}'.", add.len());
            self.compute
                .authorize_security_group_ingress(group_id, &IngressRequest::Permissions(add.list()))
                .await
                .remote_with(|| format!("authorize ingress of security group '{group_id}'"))?;
        }

        if !remove.is_empty() {
            info!("Removing {} ingress rules from security group '{group_id}'.", remove.len());
            self.compute
                .revoke_security_group_ingress(group_id, &IngressRequest::Permissions(remove.list()))
                .await
                .remote_with(|| format!("revoke ingress of security group '{group_id}'"))?;
        }

        Ok(true)
    }

    /// Makes sure the group grants `permissions`, leaving other rules alone.
    /// In public cloud mode the grant is expressed through the well-known source group.
    pub async fn add_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &[IpPermission],
        public_cloud: bool,
    ) -> Result<bool, CloudError> {
        if self.config.is_global_security_group(group_id) {
            return Ok(false);
        }

        let group = self.require_security_group(group_id).await?;

        let changes = permissions
            .iter()
            .filter(|permission| {
                !group
                    .ingress
                    .iter()
                    .any(|existing| permission.is_covered_by(existing, has_user_id(permission)))
            })
            .cloned()
            .collect::<Vec<_>>();

        if changes.is_empty() && !public_cloud {
            return Ok(false);
        }

        info!(
            "Adding ingress to security group '{group_id}': {} rules (public cloud: {public_cloud}).",
            changes.len()
        );

        let request = match public_cloud {
            true => public_cloud_request(),
            false => IngressRequest::Permissions(changes),
        };

        match self
            .compute
            .authorize_security_group_ingress(group_id, &request)
            .await
        {
            Ok(()) => Ok(true),
            Err(error) if public_cloud && error.kind() == RemoteErrorKind::DuplicatePermission => {
                debug!("Ingress of security group '{group_id}' already exists, assuming another public load balancer uses it.");
                Ok(true)
            }
            Err(error) => {
                warn!("Couldn't authorize ingress of security group '{group_id}'! Reason: {error}");
                Err(error).remote_with(|| format!("authorize ingress of security group '{group_id}'"))
            }
        }
    }

    /// Makes sure the group no longer grants `permissions`. A missing group is not an error.
    pub async fn remove_security_group_ingress(
        &self,
        group_id: &str,
        permissions: &[IpPermission],
        public_cloud: bool,
    ) -> Result<bool, CloudError> {
        if self.config.is_global_security_group(group_id) {
            return Ok(false);
        }

        let Some(group) = self.find_security_group(group_id).await? else {
            warn!("Security group '{group_id}' not found.");
            return Ok(false);
        };

        let changes = permissions
            .iter()
            .filter(|permission| {
                group
                    .ingress
                    .iter()
                    .any(|existing| permission.is_covered_by(existing, has_user_id(permission)))
            })
            .cloned()
            .collect::<Vec<_>>();

        if changes.is_empty() && !public_cloud {
            return Ok(false);
        }

        info!(
            "Removing ingress from security group '{group_id}': {} rules.",
            changes.len()
        );

        let request = match public_cloud {
            true => public_cloud_request(),
            false => IngressRequest::Permissions(changes),
        };

        self.compute
            .revoke_security_group_ingress(group_id, &request)
            .await
            .remote_with(|| format!("revoke ingress of security group '{group_id}'"))?;

        Ok(true)
    }

    /// Finds or creates the group called `name` in our VPC, making sure it carries our tags
    pub async fn ensure_security_group(
        &self,
        name: &str,
        description: &str,
        additional_tags: &Tags,
    ) -> Result<String, CloudError> {
        let mut filters = vec![Filter::single("group-name", name)];
        if !self.vpc_id.is_empty() {
            filters.push(Filter::single("vpc-id", &self.vpc_id));
        }

        let mut attempt = 0;
        let group_id = loop {
            attempt += 1;

            let groups = self
                .compute
                .read_security_groups(&filters)
                .await
                .remote_with(|| format!("describe security group '{name}'"))?;

            if let Some(group) = groups.first() {
                if groups.len() > 1 {
                    warn!("Found {} security groups named '{name}'!", groups.len());
                }

                self.tagging
                    .read_repair_cluster_tags(
                        self.compute.as_ref(),
                        &group.id,
                        ResourceLifecycle::Owned,
                        &Tags::new(),
                        &group.tags,
                    )
                    .await?;

                return Ok(group.id.to_owned());
            }

            match self
                .compute
                .create_security_group(name, description, &self.vpc_id)
                .await
            {
                Ok(group_id) => break group_id,
                Err(error)
                    if error.kind() == RemoteErrorKind::DuplicateGroup
                        && attempt < MAX_READ_THEN_CREATE_RETRIES =>
                {
                    debug!("Security group '{name}' was created concurrently, retrying.");
                    sleep(Duration::from_secs(1)).await;
                }
                Err(error) => {
                    error!("Couldn't create security group '{name}'! Reason: {error}");
                    return Err(error).remote_with(|| format!("create security group '{name}'"));
                }
            }
        };

        if group_id.is_empty() {
            return Err(CloudError::validation(format!(
                "Security group '{name}' was created without an id!"
            )));
        }

        self.tagging
            .create_tags(
                self.compute.as_ref(),
                &group_id,
                ResourceLifecycle::Owned,
                additional_tags,
            )
            .await?;

        info!("Created security group '{name}' ({group_id}).");
        Ok(group_id)
    }
}
