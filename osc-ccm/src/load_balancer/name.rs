use k8s_openapi::api::core::v1::Service;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::helpers::RequireMetadata;

use super::annotations::{LOAD_BALANCER_NAME, LOAD_BALANCER_NAME_LENGTH};

/// Longest name the load balancing API accepts
pub const MAX_NAME_LENGTH: usize = 32;

const NAME_PATTERN: &str = "^[a-zA-Z0-9-]+$";
static NAME_REGEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(NAME_PATTERN).ok());

fn is_valid_name(name: &str) -> bool {
    NAME_REGEX
        .as_ref()
        .is_some_and(|regex| regex.is_match(name))
}

/// The service uid without dashes unless overridden by annotation,
/// cut to the requested length and trimmed of hyphens on both ends
pub fn load_balancer_name(service: &Service) -> String {
    let mut name = service
        .metadata
        .uid
        .as_deref()
        .unwrap_or_default()
        .replace('-', "");

    if let Some(custom) = service.annotation(LOAD_BALANCER_NAME) {
        match is_valid_name(custom) {
            true => name = custom.to_owned(),
            false => warn!(
                "Ignoring annotation {LOAD_BALANCER_NAME}='{custom}', the name has to match {NAME_PATTERN}!"
            ),
        }
    }

    let length = match service.annotation(LOAD_BALANCER_NAME_LENGTH) {
        None => MAX_NAME_LENGTH,
        Some(value) => match value.parse::<usize>() {
            Ok(length) if length <= MAX_NAME_LENGTH => length,
            _ => {
                warn!(
                    "Ignoring annotation {LOAD_BALANCER_NAME_LENGTH}='{value}', expected a number of at most {MAX_NAME_LENGTH}!"
                );
                MAX_NAME_LENGTH
            }
        },
    };

    let cut = name
        .char_indices()
        .nth(length)
        .map_or(name.len(), |(index, _)| index);

    name[..cut].trim_matches('-').to_owned()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Service;
    use kube::api::ObjectMeta;

    use super::{is_valid_name, load_balancer_name, NAME_REGEX};
    use crate::load_balancer::annotations::{LOAD_BALANCER_NAME, LOAD_BALANCER_NAME_LENGTH};

    #[test]
    fn name_pattern_accepts_only_alphanumerics_and_hyphens() {
        assert!(NAME_REGEX.is_some());
        assert!(is_valid_name("web-frontend-01"));
        assert!(!is_valid_name("web_frontend"));
        assert!(!is_valid_name(""));
    }

    fn service(annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_owned()),
                namespace: Some("default".to_owned()),
                uid: Some("6a2e9c1f-3d4b-4c5e-8f90-a1b2c3d4e5f6".to_owned()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn names_are_derived_from_the_uid() {
        assert_eq!("6a2e9c1f3d4b4c5e8f90a1b2c3d4e5f6", load_balancer_name(&service(&[])));
    }

    #[test]
    fn annotated_names_replace_the_uid_when_valid() {
        assert_eq!("front-web", load_balancer_name(&service(&[(LOAD_BALANCER_NAME, "front-web")])));
        assert_eq!(
            "6a2e9c1f3d4b4c5e8f90a1b2c3d4e5f6",
            load_balancer_name(&service(&[(LOAD_BALANCER_NAME, "front_web")]))
        );
    }

    #[test]
    fn names_are_cut_then_trimmed_of_hyphens() {
        assert_eq!(
            "front",
            load_balancer_name(&service(&[
                (LOAD_BALANCER_NAME, "-front-web"),
                (LOAD_BALANCER_NAME_LENGTH, "7"),
            ]))
        );
    }

    #[test]
    fn oversized_lengths_fall_back_to_the_maximum() {
        let name = load_balancer_name(&service(&[
            (LOAD_BALANCER_NAME, "a-very-long-load-balancer-name-exceeding-limits"),
            (LOAD_BALANCER_NAME_LENGTH, "64"),
        ]));

        assert_eq!("a-very-long-load-balancer-name-e", name);
    }
}
