use std::fmt::Display;

use itertools::Itertools;
use log::{error, info, warn};
use thiserror::Error;

use crate::{
    api::Compute,
    backoff::TAG_CREATE_BACKOFF,
    error::ApiError,
    model::{Filter, Tags},
};

/// Legacy cluster tag, its value is the cluster id
pub const LEGACY_CLUSTER_TAG: &str = "KubernetesCluster";
/// Prefix of the cluster tag, the cluster id is appended and the value is the lifecycle
pub const CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLifecycle {
    /// Created and deleted by this cluster
    Owned,
    /// Pre-existing, never deleted by this cluster
    Shared,
}

impl ResourceLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceLifecycle::Owned => "owned",
            ResourceLifecycle::Shared => "shared",
        }
    }
}

impl Display for ResourceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TaggingError {
    #[error("Found multiple cluster tags with prefix {} ({})!", CLUSTER_TAG_PREFIX, .0.join(", "))]
    MultipleClusterTags(Vec<String>),
    #[error("Legacy cluster tag '{}' doesn't match the cluster id '{}'!", .legacy, .cluster_id)]
    MismatchedClusterIds { legacy: String, cluster_id: String },
    #[error("Resource '{}' has a tag belonging to another cluster: {}={} (expected {})!", .resource_id, .key, .actual, .expected)]
    ConflictingTag {
        resource_id: String,
        key: String,
        actual: String,
        expected: String,
    },
    #[error("Resource '{}' belongs to another cluster ({})!", .resource_id, .tag_key)]
    ForeignCluster { resource_id: String, tag_key: String },
    #[error("Couldn't tag resource '{}'! Reason: {}", .resource_id, .source)]
    Create {
        resource_id: String,
        source: ApiError,
    },
}

/// Cluster ownership tagging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTagging {
    cluster_id: Option<String>,
    uses_legacy_tags: bool,
}

impl ClusterTagging {
    pub fn init(legacy_cluster_id: Option<&str>, cluster_id: Option<&str>) -> Result<Self, TaggingError> {
        let legacy_cluster_id = legacy_cluster_id.filter(|id| !id.is_empty());
        let cluster_id = cluster_id.filter(|id| !id.is_empty());

        let tagging = match (legacy_cluster_id, cluster_id) {
            (Some(legacy), Some(cluster_id)) if legacy != cluster_id => {
                return Err(TaggingError::MismatchedClusterIds {
                    legacy: legacy.to_owned(),
                    cluster_id: cluster_id.to_owned(),
                })
            }
            (Some(legacy), _) => Self {
                cluster_id: Some(legacy.to_owned()),
                uses_legacy_tags: true,
            },
            (None, cluster_id) => Self {
                cluster_id: cluster_id.map(str::to_owned),
                uses_legacy_tags: false,
            },
        };

        match &tagging.cluster_id {
            Some(cluster_id) => info!("Filtering cloud resources on cluster id '{cluster_id}'."),
            None => warn!("No cluster id found, cloud resources won't be filtered by cluster!"),
        }

        Ok(tagging)
    }

    /// Initializes from the tags of the instance the controller runs on
    pub fn init_from_tags(tags: &Tags) -> Result<Self, TaggingError> {
        let legacy_cluster_id = tags.get(LEGACY_CLUSTER_TAG).map(String::as_str);
        let cluster_ids = tags
            .keys()
            .filter_map(|key| key.strip_prefix(CLUSTER_TAG_PREFIX))
            .collect::<Vec<_>>();

        if cluster_ids.len() > 1 {
            return Err(TaggingError::MultipleClusterTags(
                cluster_ids.into_iter().map(str::to_owned).collect(),
            ));
        }

        if legacy_cluster_id.is_none() && cluster_ids.is_empty() {
            error!("Neither {LEGACY_CLUSTER_TAG} nor {CLUSTER_TAG_PREFIX}... tag was found, cluster isolation won't be enforced!");
        }

        Self::init(legacy_cluster_id, cluster_ids.first().copied())
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.cluster_id.as_deref()
    }

    pub fn uses_legacy_tags(&self) -> bool {
        self.uses_legacy_tags
    }

    pub fn cluster_tag_key(&self) -> String {
        format!("{CLUSTER_TAG_PREFIX}{}", self.cluster_id.as_deref().unwrap_or_default())
    }

    /// True when no cluster id is configured, or the tags mark the resource as ours
    pub fn has_cluster_tag(&self, tags: &Tags) -> bool {
        let Some(cluster_id) = &self.cluster_id else {
            return true;
        };

        tags.get(LEGACY_CLUSTER_TAG) == Some(cluster_id) || tags.contains_key(&self.cluster_tag_key())
    }

    /// Filter narrowing a describe call to resources carrying one of our cluster tags,
    /// results still have to go through [`ClusterTagging::has_cluster_tag`]
    pub fn cluster_filter(&self) -> Option<Filter> {
        self.cluster_id
            .as_ref()
            .map(|_| Filter::new("tag-key", [LEGACY_CLUSTER_TAG.to_owned(), self.cluster_tag_key()]))
    }

    pub fn add_cluster_filter(&self, mut filters: Vec<Filter>) -> Vec<Filter> {
        filters.extend(self.cluster_filter());
        filters
    }

    /// Filter matching resources tagged with our cluster tag in one of the lifecycles
    pub fn lifecycle_filter(&self, lifecycles: &[ResourceLifecycle]) -> Filter {
        Filter::tag(
            &self.cluster_tag_key(),
            lifecycles.iter().map(ResourceLifecycle::as_str),
        )
    }

    pub fn build_tags(&self, lifecycle: ResourceLifecycle, additional: &Tags) -> Tags {
        let mut tags = additional.clone();

        let Some(cluster_id) = &self.cluster_id else {
            return tags;
        };

        if self.uses_legacy_tags {
            tags.insert(LEGACY_CLUSTER_TAG.to_owned(), cluster_id.to_owned());
        }
        tags.insert(self.cluster_tag_key(), lifecycle.as_str().to_owned());

        tags
    }

    /// Tags `resource_id`, retrying with backoff since freshly created
    /// resources aren't always visible to the tagging API right away
    pub async fn create_tags(
        &self,
        compute: &dyn Compute,
        resource_id: &str,
        lifecycle: ResourceLifecycle,
        additional: &Tags,
    ) -> Result<(), TaggingError> {
        let tags = self.build_tags(lifecycle, additional);
        if tags.is_empty() {
            return Ok(());
        }

        TAG_CREATE_BACKOFF
            .retry(|| compute.create_tags(resource_id, &tags))
            .await
            .map_err(|source| TaggingError::Create {
                resource_id: resource_id.to_owned(),
                source,
            })
    }

    /// Adds the expected cluster tags missing from `observed`. A conflicting value,
    /// or a resource claimed only by another cluster, is an error.
    pub async fn read_repair_cluster_tags(
        &self,
        compute: &dyn Compute,
        resource_id: &str,
        lifecycle: ResourceLifecycle,
        additional: &Tags,
        observed: &Tags,
    ) -> Result<(), TaggingError> {
        let missing = self.missing_cluster_tags(resource_id, lifecycle, additional, observed)?;
        if missing.is_empty() {
            return Ok(());
        }

        warn!(
            "Resource '{resource_id}' was missing expected cluster tags ({}), adding them!",
            missing.keys().join(", ")
        );

        self.create_tags(compute, resource_id, lifecycle, &missing)
            .await
    }

    fn missing_cluster_tags(
        &self,
        resource_id: &str,
        lifecycle: ResourceLifecycle,
        additional: &Tags,
        observed: &Tags,
    ) -> Result<Tags, TaggingError> {
        if !self.has_cluster_tag(observed) {
            let foreign = observed.iter().find(|(key, _)| {
                key.starts_with(CLUSTER_TAG_PREFIX) || key.as_str() == LEGACY_CLUSTER_TAG
            });

            if let Some((key, _)) = foreign {
                return Err(TaggingError::ForeignCluster {
                    resource_id: resource_id.to_owned(),
                    tag_key: key.to_owned(),
                });
            }
        }

        let mut missing = Tags::new();
        for (key, expected) in self.build_tags(lifecycle, additional) {
            match observed.get(&key) {
                Some(actual) if actual == &expected => continue,
                Some(actual) if !actual.is_empty() => {
                    return Err(TaggingError::ConflictingTag {
                        resource_id: resource_id.to_owned(),
                        key,
                        actual: actual.to_owned(),
                        expected,
                    })
                }
                _ => {
                    missing.insert(key, expected);
                }
            }
        }

        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use crate::model::Tags;

    use super::{ClusterTagging, ResourceLifecycle, TaggingError, CLUSTER_TAG_PREFIX, LEGACY_CLUSTER_TAG};

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn tagging() -> ClusterTagging {
        ClusterTagging::init(None, Some("alpha")).unwrap()
    }

    #[test]
    fn tagging_without_cluster_id_accepts_everything() {
        let tagging = ClusterTagging::init(None, None).unwrap();

        assert!(tagging.has_cluster_tag(&Tags::new()));
        assert!(tagging.cluster_filter().is_none());
        assert!(tagging.build_tags(ResourceLifecycle::Owned, &Tags::new()).is_empty());
    }

    #[test]
    fn cluster_tag_is_recognized_in_both_formats() {
        let tagging = tagging();

        assert!(tagging.has_cluster_tag(&tags(&[("kubernetes.io/cluster/alpha", "shared")])));
        assert!(tagging.has_cluster_tag(&tags(&[(LEGACY_CLUSTER_TAG, "alpha")])));
        assert!(!tagging.has_cluster_tag(&tags(&[(LEGACY_CLUSTER_TAG, "beta")])));
        assert!(!tagging.has_cluster_tag(&tags(&[("kubernetes.io/cluster/beta", "owned")])));
    }

    #[test]
    fn legacy_tags_are_built_only_in_legacy_mode() {
        let legacy = ClusterTagging::init(Some("alpha"), None).unwrap();
        let built = legacy.build_tags(ResourceLifecycle::Owned, &tags(&[("extra", "1")]));

        assert_eq!(
            tags(&[
                ("extra", "1"),
                (LEGACY_CLUSTER_TAG, "alpha"),
                ("kubernetes.io/cluster/alpha", "owned"),
            ]),
            built
        );
        assert!(!tagging()
            .build_tags(ResourceLifecycle::Owned, &Tags::new())
            .contains_key(LEGACY_CLUSTER_TAG));
    }

    #[test]
    fn init_rejects_mismatched_ids() {
        assert!(matches!(
            ClusterTagging::init(Some("alpha"), Some("beta")),
            Err(TaggingError::MismatchedClusterIds { .. })
        ));
    }

    #[test]
    fn init_from_tags_rejects_multiple_cluster_tags() {
        let instance_tags = tags(&[
            ("kubernetes.io/cluster/alpha", "owned"),
            ("kubernetes.io/cluster/beta", "owned"),
        ]);

        assert!(matches!(
            ClusterTagging::init_from_tags(&instance_tags),
            Err(TaggingError::MultipleClusterTags(_))
        ));
    }

    #[test]
    fn init_from_tags_picks_up_the_cluster_id() {
        let tagging =
            ClusterTagging::init_from_tags(&tags(&[(&format!("{CLUSTER_TAG_PREFIX}alpha"), "owned")]))
                .unwrap();

        assert_eq!(Some("alpha"), tagging.cluster_id());
        assert!(!tagging.uses_legacy_tags());
    }

    #[test]
    fn missing_tags_are_computed_for_untagged_resources() {
        let missing = tagging()
            .missing_cluster_tags("sg-1", ResourceLifecycle::Owned, &Tags::new(), &Tags::new())
            .unwrap();

        assert_eq!(tags(&[("kubernetes.io/cluster/alpha", "owned")]), missing);
    }

    #[test]
    fn resources_of_another_cluster_are_rejected() {
        let observed = tags(&[("kubernetes.io/cluster/beta", "owned")]);
        let result = tagging().missing_cluster_tags(
            "sg-1",
            ResourceLifecycle::Owned,
            &Tags::new(),
            &observed,
        );

        assert!(matches!(result, Err(TaggingError::ForeignCluster { .. })));
    }

    #[test]
    fn conflicting_lifecycle_is_rejected() {
        let observed = tags(&[("kubernetes.io/cluster/alpha", "shared")]);
        let result = tagging().missing_cluster_tags(
            "sg-1",
            ResourceLifecycle::Owned,
            &Tags::new(),
            &observed,
        );

        assert!(matches!(result, Err(TaggingError::ConflictingTag { .. })));
    }
}
