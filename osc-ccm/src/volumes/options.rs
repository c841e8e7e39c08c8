use std::{fmt::Display, str::FromStr};

use derive_builder::Builder;
use osc_ccm_core::{
    error::CloudError,
    model::{CreateVolumeRequest, Tags},
};

pub const MIN_TOTAL_IOPS: i64 = 100;
pub const MAX_TOTAL_IOPS: i64 = 20000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeType {
    Standard,
    #[default]
    Gp2,
    Io1,
    Sc1,
    St1,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeType::Standard => "standard",
            VolumeType::Gp2 => "gp2",
            VolumeType::Io1 => "io1",
            VolumeType::Sc1 => "sc1",
            VolumeType::St1 => "st1",
        }
    }
}

impl FromStr for VolumeType {
    type Err = CloudError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "" | "gp2" => Ok(VolumeType::Gp2),
            "standard" => Ok(VolumeType::Standard),
            "io1" => Ok(VolumeType::Io1),
            "sc1" => Ok(VolumeType::Sc1),
            "st1" => Ok(VolumeType::St1),
            _ => Err(CloudError::validation(format!("Invalid volume type '{value}'!"))),
        }
    }
}

impl Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a persistent volume claim asks for
#[derive(Debug, Clone, Default, PartialEq, Eq, Builder)]
#[builder(default, setter(into))]
pub struct VolumeOptions {
    pub capacity_gib: i64,
    /// Added to the cluster ownership tag
    pub tags: Tags,
    /// Empty means the default type
    pub volume_type: String,
    /// Empty means the zone of the control plane
    pub availability_zone: String,
    /// Only used by `io1`, the total is clamped to [`MIN_TOTAL_IOPS`]..=[`MAX_TOTAL_IOPS`]
    pub iops_per_gb: i64,
    pub encrypted: bool,
    /// Implies `encrypted`
    #[builder(setter(into, strip_option))]
    pub kms_key_id: Option<String>,
}

impl VolumeOptions {
    pub fn create_request(&self, default_zone: &str) -> Result<CreateVolumeRequest, CloudError> {
        if self.capacity_gib <= 0 {
            return Err(CloudError::validation(format!(
                "Invalid volume capacity {}GiB!",
                self.capacity_gib
            )));
        }

        let volume_type = self.volume_type.parse::<VolumeType>()?;
        let iops = match volume_type {
            VolumeType::Io1 => Some(
                self.capacity_gib
                    .saturating_mul(self.iops_per_gb)
                    .clamp(MIN_TOTAL_IOPS, MAX_TOTAL_IOPS),
            ),
            _ => None,
        };

        let availability_zone = match self.availability_zone.is_empty() {
            true => default_zone.to_owned(),
            false => self.availability_zone.to_owned(),
        };

        let kms_key_id = self.kms_key_id.to_owned().filter(|key| !key.is_empty());

        Ok(CreateVolumeRequest {
            availability_zone,
            size_gib: self.capacity_gib,
            volume_type: volume_type.to_string(),
            iops,
            encrypted: self.encrypted || kms_key_id.is_some(),
            kms_key_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{VolumeOptionsBuilder, VolumeType, MAX_TOTAL_IOPS, MIN_TOTAL_IOPS};

    #[test]
    fn io1_iops_are_clamped() {
        let request = |capacity_gib: i64, iops_per_gb: i64| {
            VolumeOptionsBuilder::default()
                .capacity_gib(capacity_gib)
                .volume_type("io1")
                .iops_per_gb(iops_per_gb)
                .build()
                .unwrap()
                .create_request("eu-west-2a")
                .unwrap()
        };

        assert_eq!(Some(MIN_TOTAL_IOPS), request(4, 10).iops);
        assert_eq!(Some(500), request(10, 50).iops);
        assert_eq!(Some(MAX_TOTAL_IOPS), request(1000, 50).iops);
    }

    #[test]
    fn defaults_are_gp2_in_the_given_zone() {
        let request = VolumeOptionsBuilder::default()
            .capacity_gib(10)
            .build()
            .unwrap()
            .create_request("eu-west-2b")
            .unwrap();

        assert_eq!("gp2", request.volume_type);
        assert_eq!("eu-west-2b", request.availability_zone);
        assert_eq!(None, request.iops);
        assert!(!request.encrypted);
    }

    #[test]
    fn kms_keys_imply_encryption() {
        let request = VolumeOptionsBuilder::default()
            .capacity_gib(10)
            .volume_type("st1")
            .availability_zone("eu-west-2c")
            .kms_key_id("key-1")
            .build()
            .unwrap()
            .create_request("eu-west-2a")
            .unwrap();

        assert!(request.encrypted);
        assert_eq!(Some("key-1".to_owned()), request.kms_key_id);
        assert_eq!("eu-west-2c", request.availability_zone);
    }

    #[test]
    fn unknown_types_and_empty_volumes_are_rejected() {
        assert!("gp3".parse::<VolumeType>().is_err());
        assert_eq!(VolumeType::Sc1, "SC1".parse().unwrap());

        let options = VolumeOptionsBuilder::default().build().unwrap();
        assert!(options.create_request("eu-west-2a").is_err());
    }
}
