//! Container image references for task instances.
//!
//! Registries reject `__` in repository names, so each dataset family rewrites
//! the double-underscore separator of an instance identifier before it is
//! substituted into the family's reference template. The mapping is a lookup
//! table keyed by [`DatasetFamily`] so every supported family is covered by
//! exactly one entry.

use serde::{Deserialize, Serialize};

use crate::error::ImageError;
use crate::task::TaskInstance;

/// Dataset families with a known image naming scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetFamily {
    SweBench,
    SweGym,
    SweSmith,
}

/// Naming rule for one dataset family.
#[derive(Debug, Clone, Copy)]
pub struct ImageNaming {
    pub family: DatasetFamily,
    /// Tag matched (case-insensitively, as a substring) against data source names.
    pub tag: &'static str,
    /// Replacement for each `__` in the instance identifier.
    pub separator: &'static str,
    /// Everything before the escaped identifier.
    pub prefix: &'static str,
    /// Everything after the escaped identifier.
    pub suffix: &'static str,
}

/// One entry per family. Checked in order when parsing a data source name,
/// so `swe-smith` precedes `swe-bench` (HF names look like `SWE-bench/SWE-smith`).
/// The reverse bench-then-smith order would map `SWE-bench/SWE-smith` to bench.
pub const IMAGE_NAMING: [ImageNaming; 3] = [
    ImageNaming {
        family: DatasetFamily::SweGym,
        tag: "swe-gym",
        separator: "_s_",
        prefix: "docker.io/xingyaoww/sweb.eval.x86_64.",
        suffix: ":latest",
    },
    ImageNaming {
        family: DatasetFamily::SweSmith,
        tag: "swe-smith",
        separator: "_1776_",
        prefix: "docker.io/jyangballin/swesmith.x86_64.",
        suffix: ":latest",
    },
    ImageNaming {
        family: DatasetFamily::SweBench,
        tag: "swe-bench",
        separator: "_1776_",
        prefix: "docker.io/swebench/sweb.eval.x86_64.",
        suffix: ":latest",
    },
];

impl DatasetFamily {
    /// All supported families.
    pub fn all() -> [DatasetFamily; 3] {
        [
            DatasetFamily::SweBench,
            DatasetFamily::SweGym,
            DatasetFamily::SweSmith,
        ]
    }

    /// The naming rule for this family.
    pub fn naming(&self) -> &'static ImageNaming {
        let index = match self {
            DatasetFamily::SweGym => 0,
            DatasetFamily::SweSmith => 1,
            DatasetFamily::SweBench => 2,
        };
        &IMAGE_NAMING[index]
    }

    /// Canonical name, as accepted on the command line.
    pub fn as_str(&self) -> &'static str {
        self.naming().tag
    }

    /// Builds the registry reference for an instance identifier.
    pub fn image_name(&self, instance_id: &str) -> String {
        let naming = self.naming();
        let mut escaped = instance_id.to_string();
        // `___` would leave a fresh `__` behind after a single pass.
        while escaped.contains("__") {
            escaped = escaped.replace("__", naming.separator);
        }
        format!("{}{}{}", naming.prefix, escaped, naming.suffix).to_lowercase()
    }
}

impl std::fmt::Display for DatasetFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatasetFamily {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        IMAGE_NAMING
            .iter()
            .find(|entry| lowered.contains(entry.tag))
            .map(|entry| entry.family)
            .ok_or_else(|| ImageError::UnsupportedDatasetFamily(s.to_string()))
    }
}

/// Resolves the image reference for an instance identifier and data source name.
pub fn resolve_image_name(instance_id: &str, data_source: &str) -> Result<String, ImageError> {
    let family: DatasetFamily = data_source.parse()?;
    Ok(family.image_name(instance_id))
}

/// Image for an instance: its explicit `image_name` verbatim, otherwise the
/// family mapping.
pub fn image_for_instance(instance: &TaskInstance, data_source: &str) -> Result<String, ImageError> {
    match instance.image_name.as_deref() {
        Some(image) if !image.is_empty() => Ok(image.to_string()),
        _ => resolve_image_name(&instance.instance_id, data_source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swe_gym_image() {
        assert_eq!(
            resolve_image_name("foo__bar", "swe-gym").unwrap(),
            "docker.io/xingyaoww/sweb.eval.x86_64.foo_s_bar:latest"
        );
    }

    #[test]
    fn test_swe_bench_image() {
        assert_eq!(
            resolve_image_name("foo__bar", "swe-bench").unwrap(),
            "docker.io/swebench/sweb.eval.x86_64.foo_1776_bar:latest"
        );
    }

    #[test]
    fn test_swe_smith_image() {
        assert_eq!(
            resolve_image_name("oauthlib__oauthlib.1fd52536.combine_file__09vlzwgc", "swe-smith")
                .unwrap(),
            "docker.io/jyangballin/swesmith.x86_64.oauthlib_1776_oauthlib.1fd52536.combine_file_1776_09vlzwgc:latest"
        );
    }

    #[test]
    fn test_image_is_lowercase_without_double_underscore() {
        let ids = [
            "Django__Django-11099",
            "a___b",
            "x____y__Z",
            "plain",
            "__leading",
            "trailing__",
        ];
        for family in DatasetFamily::all() {
            for id in ids {
                let image = family.image_name(id);
                assert_eq!(image, image.to_lowercase(), "{family} {id}");
                assert!(!image.contains("__"), "{family} {id} -> {image}");
                assert_eq!(image, family.image_name(id), "deterministic");
            }
        }
    }

    #[test]
    fn test_family_parsing() {
        assert_eq!("swe-bench".parse::<DatasetFamily>().unwrap(), DatasetFamily::SweBench);
        assert_eq!("SWE-Gym/SWE-Gym".parse::<DatasetFamily>().unwrap(), DatasetFamily::SweGym);
        assert_eq!("SWE-bench/SWE-smith".parse::<DatasetFamily>().unwrap(), DatasetFamily::SweSmith);
        for family in DatasetFamily::all() {
            assert_eq!(family.as_str().parse::<DatasetFamily>().unwrap(), family);
        }
    }

    #[test]
    fn test_unsupported_family() {
        let err = resolve_image_name("foo__bar", "unknown").unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedDatasetFamily(ref s) if s == "unknown"));
    }

    #[test]
    fn test_explicit_image_bypasses_resolver() {
        let mut instance = TaskInstance::new("foo__bar");
        instance.image_name = Some("registry.local/Custom__Image:v1".to_string());
        assert_eq!(
            image_for_instance(&instance, "unknown").unwrap(),
            "registry.local/Custom__Image:v1"
        );

        instance.image_name = None;
        assert_eq!(
            image_for_instance(&instance, "swe-gym").unwrap(),
            "docker.io/xingyaoww/sweb.eval.x86_64.foo_s_bar:latest"
        );
    }
}
