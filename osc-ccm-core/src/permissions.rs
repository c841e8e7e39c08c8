use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub struct IpRange {
    pub cidr_ip: String,
    pub description: Option<String>,
}

impl IpRange {
    pub fn new(cidr_ip: impl Into<String>) -> Self {
        Self {
            cidr_ip: cidr_ip.into(),
            description: None,
        }
    }

    pub fn described(cidr_ip: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            cidr_ip: cidr_ip.into(),
            description: Some(description.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub struct UserIdGroupPair {
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub user_id: Option<String>,
}

impl UserIdGroupPair {
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Default::default()
        }
    }

    fn matches(&self, other: &UserIdGroupPair, compare_user_ids: bool) -> bool {
        self.group_id == other.group_id && (!compare_user_ids || self.user_id == other.user_id)
    }
}

/// A single ingress rule of a security group
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct IpPermission {
    pub ip_protocol: String,
    pub from_port: Option<i64>,
    pub to_port: Option<i64>,
    pub ip_ranges: Vec<IpRange>,
    pub user_id_group_pairs: Vec<UserIdGroupPair>,
    pub service_ids: Vec<String>,
}

impl IpPermission {
    pub fn new(ip_protocol: impl Into<String>, from_port: i64, to_port: i64) -> Self {
        Self {
            ip_protocol: ip_protocol.into(),
            from_port: Some(from_port),
            to_port: Some(to_port),
            ..Default::default()
        }
    }

    /// Every protocol and port, as used for group-to-group rules
    pub fn all_traffic() -> Self {
        Self {
            ip_protocol: "-1".to_owned(),
            ..Default::default()
        }
    }

    /// ICMP types 3 and 4, required for path MTU discovery
    pub fn icmp_fragmentation() -> Self {
        Self::new("icmp", 3, 4)
    }

    pub fn with_ip_ranges(mut self, ranges: impl IntoIterator<Item = IpRange>) -> Self {
        self.ip_ranges.extend(ranges);
        self
    }

    pub fn with_group_pair(mut self, pair: UserIdGroupPair) -> Self {
        self.user_id_group_pairs.push(pair);
        self
    }

    /// Canonical key, independent of the order of the inner lists
    pub fn key(&self) -> String {
        let mut canonical = self.clone();
        canonical.ip_ranges.sort();
        canonical.user_id_group_pairs.sort();
        canonical.service_ids.sort();

        serde_json::to_string(&canonical).unwrap_or_else(|_| format!("{canonical:?}"))
    }

    /// Whether any source of this rule carries the given description
    pub fn has_description(&self, description: &str) -> bool {
        self.ip_ranges
            .iter()
            .any(|range| range.description.as_deref() == Some(description))
    }

    /// Whether `self` is already granted by `existing`: same protocol and ports,
    /// and every source of `self` is present in `existing`
    pub fn is_covered_by(&self, existing: &IpPermission, compare_user_ids: bool) -> bool {
        if self.from_port != existing.from_port
            || self.to_port != existing.to_port
            || self.ip_protocol != existing.ip_protocol
        {
            return false;
        }

        if self.ip_ranges.len() > existing.ip_ranges.len() {
            return false;
        }

        let ranges_covered = self.ip_ranges.iter().all(|range| {
            existing
                .ip_ranges
                .iter()
                .any(|existing_range| existing_range.cidr_ip == range.cidr_ip)
        });

        let pairs_covered = self.user_id_group_pairs.iter().all(|pair| {
            existing
                .user_id_group_pairs
                .iter()
                .any(|existing_pair| pair.matches(existing_pair, compare_user_ids))
        });

        ranges_covered && pairs_covered
    }
}

/// A set of permissions keyed by their canonical serialization
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpPermissionSet(BTreeMap<String, IpPermission>);

impl IpPermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: IpPermission) {
        self.0.insert(permission.key(), permission);
    }

    pub fn contains(&self, permission: &IpPermission) -> bool {
        self.0.contains_key(&permission.key())
    }

    pub fn list(&self) -> Vec<IpPermission> {
        self.0.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpPermission> {
        self.0.values()
    }

    /// Elements of `self` whose key is absent from `other`
    pub fn difference(&self, other: &IpPermissionSet) -> IpPermissionSet {
        Self(
            self.0
                .iter()
                .filter(|(key, _)| !other.0.contains_key(*key))
                .map(|(key, permission)| (key.to_owned(), permission.to_owned()))
                .collect(),
        )
    }

    pub fn delete_if<F: FnMut(&IpPermission) -> bool>(&mut self, mut predicate: F) {
        self.0.retain(|_, permission| !predicate(permission));
    }

    pub fn delete<'a>(&mut self, permissions: impl IntoIterator<Item = &'a IpPermission>) {
        for permission in permissions {
            self.0.remove(&permission.key());
        }
    }

    /// Splits every multi-source permission into one permission per source
    pub fn ungroup(&self) -> IpPermissionSet {
        self.0
            .values()
            .flat_map(split_ip_ranges)
            .flat_map(|permission| split_group_pairs(&permission))
            .flat_map(|permission| split_service_ids(&permission))
            .collect()
    }
}

fn split_ip_ranges(permission: &IpPermission) -> Vec<IpPermission> {
    if permission.ip_ranges.len() <= 1 {
        return vec![permission.to_owned()];
    }

    permission
        .ip_ranges
        .iter()
        .map(|range| IpPermission {
            ip_ranges: vec![range.to_owned()],
            ..permission.to_owned()
        })
        .collect()
}

fn split_group_pairs(permission: &IpPermission) -> Vec<IpPermission> {
    if permission.user_id_group_pairs.len() <= 1 {
        return vec![permission.to_owned()];
    }

    permission
        .user_id_group_pairs
        .iter()
        .map(|pair| IpPermission {
            user_id_group_pairs: vec![pair.to_owned()],
            ..permission.to_owned()
        })
        .collect()
}

fn split_service_ids(permission: &IpPermission) -> Vec<IpPermission> {
    if permission.service_ids.len() <= 1 {
        return vec![permission.to_owned()];
    }

    permission
        .service_ids
        .iter()
        .map(|service_id| IpPermission {
            service_ids: vec![service_id.to_owned()],
            ..permission.to_owned()
        })
        .collect()
}

impl FromIterator<IpPermission> for IpPermissionSet {
    fn from_iter<T: IntoIterator<Item = IpPermission>>(iter: T) -> Self {
        let mut set = Self::new();
        for permission in iter {
            set.insert(permission);
        }

        set
    }
}

impl IntoIterator for IpPermissionSet {
    type Item = IpPermission;
    type IntoIter = std::collections::btree_map::IntoValues<String, IpPermission>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}
