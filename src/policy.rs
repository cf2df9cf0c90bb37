//! Per-rule verification policy: keys, allowed signers, ignore fields and
//! user bindings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::admission::ObjectRef;
use crate::bundle::DEFAULT_ANNOTATION_DOMAIN;
use crate::config::{any_selector_matches, IgnoreFieldRule, ObjectSelector};
use crate::error::ConfigError;
use crate::pattern::glob_match;

/// A public key and the signer it stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerKey {
    pub pem: String,
    #[serde(default)]
    pub name: String,
    /// Signer identity bound to this key; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl SignerKey {
    pub fn new(pem: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pem: pem.into(),
            name: name.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn identity(&self) -> &str {
        self.identity.as_deref().unwrap_or(&self.name)
    }
}

/// Users (globs over the username) acting on the selected objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBinding {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectSelector>,
    #[serde(default)]
    pub users: Vec<String>,
}

impl UserBinding {
    pub fn matches(&self, username: &str, target: &ObjectRef) -> bool {
        any_selector_matches(&self.objects, target)
            && self.users.iter().any(|u| glob_match(u, username))
    }
}

/// Why verification was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bypass {
    SkipUser,
    OutOfScope,
}

impl fmt::Display for Bypass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SkipUser => f.write_str("request by a skip user; verification skipped"),
            Self::OutOfScope => f.write_str("request by a user out of scope; verification skipped"),
        }
    }
}

/// One manifest-verification rule, already matched to the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub keys: Vec<SignerKey>,
    /// Allowed signer identities (globs). Empty allows any configured key.
    #[serde(default)]
    pub signers: Vec<String>,
    #[serde(default)]
    pub ignore_fields: Vec<IgnoreFieldRule>,
    #[serde(default)]
    pub skip_users: Vec<UserBinding>,
    #[serde(default)]
    pub in_scope_users: Vec<UserBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_domain: Option<String>,
}

impl VerifyRule {
    pub fn from_yaml(text: &str, source: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            asset: source.to_owned(),
            source: e,
        })
    }

    pub fn domain(&self) -> &str {
        self.annotation_domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_ANNOTATION_DOMAIN)
    }

    /// True if a signature by `identity` satisfies this rule.
    pub fn authorizes(&self, identity: &str) -> bool {
        let mut allowed = self.signers.iter().filter(|s| !s.is_empty()).peekable();
        if allowed.peek().is_none() {
            return true;
        }
        allowed.any(|pattern| glob_match(pattern, identity))
    }

    /// Whether the acting user is exempt from verification for `target`.
    pub fn bypass(&self, username: &str, target: &ObjectRef) -> Option<Bypass> {
        if self.skip_users.iter().any(|b| b.matches(username, target)) {
            return Some(Bypass::SkipUser);
        }
        if !self.in_scope_users.is_empty()
            && !self.in_scope_users.iter().any(|b| b.matches(username, target))
        {
            return Some(Bypass::OutOfScope);
        }
        None
    }
}
