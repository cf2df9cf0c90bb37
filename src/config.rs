//! Ignore-field configuration: embedded defaults and the merge into
//! effective verification options.

use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::admission::ObjectRef;
use crate::error::ConfigError;
use crate::pattern::{optional_glob_match, FieldPattern};

const BUILTIN_CONFIG: &str = include_str!("../resources/default-config.yaml");
const ENVIRONMENT_CONFIG: &str = include_str!("../resources/kubectl-mutations.yaml");

static DEFAULTS: OnceCell<DefaultConfig> = OnceCell::new();

/// Matches objects by kind, namespace, name and apiVersion globs. Unset
/// fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl ObjectSelector {
    pub fn matches(&self, target: &ObjectRef) -> bool {
        optional_glob_match(self.kind.as_deref(), &target.kind)
            && optional_glob_match(self.namespace.as_deref(), &target.namespace)
            && optional_glob_match(self.name.as_deref(), &target.name)
            && optional_glob_match(self.api_version.as_deref(), &target.api_version)
    }
}

/// True if no selectors are given or any selector matches.
pub(crate) fn any_selector_matches(selectors: &[ObjectSelector], target: &ObjectRef) -> bool {
    selectors.is_empty() || selectors.iter().any(|s| s.matches(target))
}

/// Field patterns excluded from comparison for the selected objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreFieldRule {
    pub fields: Vec<FieldPattern>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectSelector>,
}

impl IgnoreFieldRule {
    pub fn applies_to(&self, target: &ObjectRef) -> bool {
        any_selector_matches(&self.objects, target)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IgnoreFieldDocument {
    #[serde(default)]
    ignore_fields: Vec<IgnoreFieldRule>,
}

/// Parse an ignore-field document (`ignoreFields: [...]`).
pub fn parse_ignore_rules(yaml: &str, asset: &str) -> Result<Vec<IgnoreFieldRule>, ConfigError> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: IgnoreFieldDocument =
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            asset: asset.to_owned(),
            source,
        })?;
    Ok(doc.ignore_fields)
}

/// The ignore rules in force for one verification call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveVerifyOptions {
    pub ignore_fields: Vec<IgnoreFieldRule>,
}

impl EffectiveVerifyOptions {
    /// All field patterns whose rule selects `target`.
    pub fn patterns_for(&self, target: &ObjectRef) -> Vec<&FieldPattern> {
        self.ignore_fields
            .iter()
            .filter(|rule| rule.applies_to(target))
            .flat_map(|rule| rule.fields.iter())
            .collect()
    }
}

/// Concatenate builtin, environment and user rules, in that order.
pub fn merged_options(
    builtin: &[IgnoreFieldRule],
    environment: &[IgnoreFieldRule],
    user: &[IgnoreFieldRule],
) -> EffectiveVerifyOptions {
    let ignore_fields = builtin
        .iter()
        .chain(environment)
        .chain(user)
        .cloned()
        .collect();
    EffectiveVerifyOptions { ignore_fields }
}

/// Process-wide default ignore rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultConfig {
    pub builtin: Vec<IgnoreFieldRule>,
    pub environment: Vec<IgnoreFieldRule>,
}

impl DefaultConfig {
    pub fn from_yaml(builtin: &str, environment: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            builtin: parse_ignore_rules(builtin, "builtin")?,
            environment: parse_ignore_rules(environment, "environment")?,
        })
    }

    /// Load the embedded baseline and either the embedded environment
    /// defaults or the file at `environment`.
    pub fn load(environment: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = environment else {
            return Self::from_yaml(BUILTIN_CONFIG, ENVIRONMENT_CONFIG);
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            builtin: parse_ignore_rules(BUILTIN_CONFIG, "builtin")?,
            environment: parse_ignore_rules(&text, &path.display().to_string())?,
        })
    }

    /// Startup step: load the defaults once and keep them for the life of
    /// the process. Later calls return the first result and ignore `environment`.
    pub fn init(environment: Option<&Path>) -> Result<&'static Self, ConfigError> {
        DEFAULTS.get_or_try_init(|| {
            let config = Self::load(environment)?;
            debug!(
                builtin_rules = config.builtin.len(),
                environment_rules = config.environment.len(),
                "loaded default ignore-field configuration"
            );
            Ok(config)
        })
    }

    pub fn merge(&self, user: &[IgnoreFieldRule]) -> EffectiveVerifyOptions {
        merged_options(&self.builtin, &self.environment, user)
    }
}
