use once_cell::sync::Lazy;
use regex::Regex;

use crate::{error::CloudError, PROVIDER_NAME};

static INSTANCE_ID_REGEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new("^i-[^/]*$").ok());
static VOLUME_ID_REGEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new("^vol-[^/]*$").ok());

/// Builds `aws:///<zone>/<instance-id>`
pub fn format_provider_id(availability_zone: &str, instance_id: &str) -> String {
    format!("{PROVIDER_NAME}:///{availability_zone}/{instance_id}")
}

/// Builds the volume name handed back to kubernetes, `aws://<zone>/<volume-id>`
pub fn format_volume_name(availability_zone: &str, volume_id: &str) -> String {
    format!("{PROVIDER_NAME}://{availability_zone}/{volume_id}")
}

/// Accepts `aws:///<zone>/<id>`, `aws:///<id>`, `aws://<zone>/<id>` and bare ids
pub fn parse_instance_id(provider_id: &str) -> Result<String, CloudError> {
    parse_resource_id(provider_id, INSTANCE_ID_REGEX.as_ref())
        .ok_or_else(|| CloudError::validation(format!("Invalid format for instance ({provider_id})!")))
}

/// Same formats as [`parse_instance_id`], for `vol-` ids
pub fn parse_volume_id(volume_name: &str) -> Result<String, CloudError> {
    parse_resource_id(volume_name, VOLUME_ID_REGEX.as_ref())
        .ok_or_else(|| CloudError::validation(format!("Invalid format for volume ({volume_name})!")))
}

fn parse_resource_id(value: &str, pattern: Option<&Regex>) -> Option<String> {
    let path = match value.strip_prefix(&format!("{PROVIDER_NAME}://")) {
        Some(rest) => rest.find('/').map(|index| &rest[index..]).unwrap_or_default(),
        None if value.contains("://") => return None,
        None => value,
    };

    let tokens = path.trim_matches('/').split('/').collect::<Vec<_>>();
    let id = match tokens.as_slice() {
        [id] => *id,
        [_zone, id] => *id,
        _ => return None,
    };

    let valid = pattern.is_some_and(|regex| regex.is_match(id));

    valid.then(|| id.to_owned())
}

#[cfg(test)]
mod tests {
    use super::{
        format_provider_id, format_volume_name, parse_instance_id, parse_volume_id,
        INSTANCE_ID_REGEX, VOLUME_ID_REGEX,
    };

    #[test]
    fn id_patterns_compile() {
        assert!(INSTANCE_ID_REGEX.is_some());
        assert!(VOLUME_ID_REGEX.is_some());
    }

    #[test]
    fn instance_ids_are_parsed_from_every_accepted_format() {
        for provider_id in [
            "aws:///eu-west-2a/i-0123abcd",
            "aws:///i-0123abcd",
            "aws://eu-west-2a/i-0123abcd",
            "i-0123abcd",
        ] {
            assert_eq!("i-0123abcd", parse_instance_id(provider_id).unwrap(), "{provider_id}");
        }
    }

    #[test]
    fn malformed_instance_ids_are_rejected() {
        for provider_id in [
            "",
            "aws:///",
            "aws:///eu-west-2a/vol-1234",
            "gce:///zone/i-0123abcd",
            "aws:///a/b/i-0123abcd",
        ] {
            assert!(parse_instance_id(provider_id).is_err(), "{provider_id}");
        }
    }

    #[test]
    fn provider_ids_round_trip() {
        let provider_id = format_provider_id("eu-west-2a", "i-42");

        assert_eq!("aws:///eu-west-2a/i-42", provider_id);
        assert_eq!("i-42", parse_instance_id(&provider_id).unwrap());
    }

    #[test]
    fn volume_names_round_trip() {
        let name = format_volume_name("eu-west-2a", "vol-42");

        assert_eq!("aws://eu-west-2a/vol-42", name);
        assert_eq!("vol-42", parse_volume_id(&name).unwrap());
        assert_eq!("vol-42", parse_volume_id("vol-42").unwrap());
        assert!(parse_volume_id("i-42").is_err());
    }
}
