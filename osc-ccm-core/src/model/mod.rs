use std::collections::BTreeMap;

pub mod instance;
pub mod load_balancer;
pub mod network;
pub mod security_group;
pub mod volume;

pub use instance::*;
pub use load_balancer::*;
pub use network::*;
pub use security_group::*;
pub use volume::*;

pub type Tags = BTreeMap<String, String>;

/// A describe-call filter, matching any of the `values` for the given `name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, [value.into()])
    }

    /// Matches resources carrying `key` with any of the `values`
    pub fn tag<I, S>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(format!("tag:{key}"), values)
    }

    /// Matches resources carrying any of the given tag keys, regardless of value
    pub fn tag_key(key: impl Into<String>) -> Self {
        Self::single("tag-key", key)
    }
}

/// Resolves filter names to the values a resource exposes for them
pub trait Filterable {
    fn tags(&self) -> &Tags;

    fn attribute_values(&self, name: &str) -> Vec<String>;

    fn filter_values(&self, name: &str) -> Vec<String> {
        if let Some(key) = name.strip_prefix("tag:") {
            return self.tags().get(key).cloned().into_iter().collect();
        }

        if name == "tag-key" {
            return self.tags().keys().cloned().collect();
        }

        self.attribute_values(name)
    }

    fn matches(&self, filters: &[Filter]) -> bool {
        filters.iter().all(|filter| {
            let values = self.filter_values(&filter.name);
            filter.values.iter().any(|wanted| values.contains(wanted))
        })
    }
}
