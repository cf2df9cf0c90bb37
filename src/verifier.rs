//! Manifest verifier: combines bundle extraction, semantic diff and
//! signature validation into one outcome per rule.

use p256::ecdsa::VerifyingKey;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionRequest, Operation};
use crate::bundle;
use crate::config::DefaultConfig;
use crate::crypto;
use crate::diff::{self, DiffResult};
use crate::error::{ConfigError, ExtractionError, VerifyError};
use crate::policy::{SignerKey, VerifyRule};

pub const VERIFIED_MESSAGE: &str = "Signed by a valid signer";
pub const NO_SIGNATURE_MESSAGE: &str = "no signature found";

/// How far a verification got before it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Stage {
    Start,
    BundleExtracted,
    ManifestRecovered,
    DiffComputed,
    SignatureChecked,
}

/// Result of verifying one resource against one rule.
#[derive(Debug)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub diagnostic: String,
    /// Identity of the signer whose key validated the signature.
    pub signer: Option<String>,
    /// Remaining differences when the manifest does not match.
    pub diff: Option<DiffResult>,
    /// Set when the bundle or a manifest could not be processed.
    pub error: Option<VerifyError>,
    pub stage: Stage,
}

impl VerificationOutcome {
    fn pass(stage: Stage, diagnostic: impl Into<String>) -> Self {
        Self {
            verified: true,
            diagnostic: diagnostic.into(),
            signer: None,
            diff: None,
            error: None,
            stage,
        }
    }

    fn fail(stage: Stage, diagnostic: impl Into<String>) -> Self {
        Self {
            verified: false,
            ..Self::pass(stage, diagnostic)
        }
    }

    fn errored(stage: Stage, error: VerifyError) -> Self {
        Self {
            diagnostic: error.to_string(),
            error: Some(error),
            ..Self::fail(stage, "")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Pass,
    Fail,
    Error,
}

/// Per-rule summary for the admission response builder.
#[derive(Debug, Clone, Serialize)]
pub struct RuleReport {
    pub rule: String,
    pub status: RuleStatus,
    pub message: String,
}

impl RuleReport {
    pub fn from_result(rule: &VerifyRule, result: &Result<VerificationOutcome, VerifyError>) -> Self {
        let (status, message) = match result {
            Err(e) => (RuleStatus::Error, format!("failed to verify manifest: {e}")),
            Ok(outcome) if !outcome.verified => (RuleStatus::Fail, outcome.diagnostic.clone()),
            Ok(_) => (RuleStatus::Pass, "manifest verified".to_owned()),
        };
        Self {
            rule: rule.name.clone(),
            status,
            message,
        }
    }
}

/// Verifies admitted resources against manifest-signature rules.
pub struct ManifestVerifier<'a> {
    defaults: &'a DefaultConfig,
}

impl<'a> ManifestVerifier<'a> {
    pub fn new(defaults: &'a DefaultConfig) -> Self {
        Self { defaults }
    }

    /// Evaluate every rule independently.
    pub fn verify_rules(&self, request: &AdmissionRequest, rules: &[VerifyRule]) -> Vec<RuleReport> {
        rules
            .iter()
            .map(|rule| RuleReport::from_result(rule, &self.verify(request, rule)))
            .collect()
    }

    /// Verify the request's object against one rule.
    ///
    /// `Err` is reserved for misconfiguration (unusable keys, a rule without
    /// keys). Unsigned, malformed, altered or wrongly signed resources yield
    /// an unverified outcome.
    pub fn verify(
        &self,
        request: &AdmissionRequest,
        rule: &VerifyRule,
    ) -> Result<VerificationOutcome, VerifyError> {
        let target = request.object_ref();

        if request.operation == Operation::Delete {
            return Ok(VerificationOutcome::pass(
                Stage::Start,
                "delete request; verification skipped",
            ));
        }
        if let Some(bypass) = rule.bypass(&request.user_info.username, &target) {
            info!(rule = %rule.name, user = %request.user_info.username, ?bypass, "verification bypassed");
            return Ok(VerificationOutcome::pass(Stage::Start, bypass.to_string()));
        }

        let keys = parse_keys(rule)?;
        let Some(live) = request.object.as_ref() else {
            return Ok(VerificationOutcome::errored(
                Stage::Start,
                VerifyError::parse("live", "admission request carries no object"),
            ));
        };
        let domain = rule.domain();

        // Start -> BundleExtracted
        let signature_bundle = match bundle::extract(request.annotations(), domain) {
            Ok(b) => b,
            Err(ExtractionError::NoSignature) => {
                info!(kind = %target.kind, name = %target.name, "resource is not signed");
                return Ok(VerificationOutcome::fail(Stage::Start, NO_SIGNATURE_MESSAGE));
            }
            Err(e) => return Ok(VerificationOutcome::errored(Stage::Start, e.into())),
        };

        // BundleExtracted -> ManifestRecovered
        let recovered = match signature_bundle.recover() {
            Ok(r) => r,
            Err(e) => return Ok(VerificationOutcome::errored(Stage::BundleExtracted, e.into())),
        };
        let signed = match diff::parse_manifest(&recovered.manifest, "signed") {
            Ok(v) => v,
            Err(e) => return Ok(VerificationOutcome::errored(Stage::ManifestRecovered, e)),
        };

        // ManifestRecovered -> DiffComputed
        let options = self.defaults.merge(&rule.ignore_fields);
        if let Some(found) = diff::diff_values(live, &signed, &target, &options, domain) {
            warn!(
                kind = %target.kind,
                namespace = %target.namespace,
                name = %target.name,
                entries = found.len(),
                "manifest differs from signed content"
            );
            return Ok(VerificationOutcome {
                diff: Some(found.clone()),
                ..VerificationOutcome::fail(
                    Stage::DiffComputed,
                    format!("manifest differs from signed content:\n{found}"),
                )
            });
        }

        // DiffComputed -> SignatureChecked
        let mut unauthorized: Option<&str> = None;
        for (key, verifying_key) in &keys {
            let fingerprint = crypto::key_fingerprint(verifying_key);
            if !crypto::verify_with_key(verifying_key, &recovered.message, &signature_bundle.signature) {
                debug!(key = %key.name, %fingerprint, "key does not validate signature");
                continue;
            }
            let identity = key.identity();
            if !rule.authorizes(identity) {
                debug!(key = %key.name, identity, "signer not allowed by rule");
                unauthorized.get_or_insert(identity);
                continue;
            }
            info!(kind = %target.kind, name = %target.name, signer = identity, %fingerprint, "manifest verified");
            return Ok(VerificationOutcome {
                signer: Some(identity.to_owned()),
                ..VerificationOutcome::pass(
                    Stage::SignatureChecked,
                    format!("{VERIFIED_MESSAGE}: {identity}"),
                )
            });
        }

        let diagnostic = match unauthorized {
            Some(identity) => format!("signed by {identity}, which is not an allowed signer for this rule"),
            None => "failed to verify signature: no configured key validates the signature".to_owned(),
        };
        warn!(kind = %target.kind, name = %target.name, %diagnostic, "signature rejected");
        Ok(VerificationOutcome::fail(Stage::SignatureChecked, diagnostic))
    }
}

fn parse_keys(rule: &VerifyRule) -> Result<Vec<(&SignerKey, VerifyingKey)>, VerifyError> {
    if rule.keys.is_empty() {
        return Err(ConfigError::Rule(format!("rule `{}` has no verification key", rule.name)).into());
    }
    rule.keys
        .iter()
        .map(|key| -> Result<_, VerifyError> {
            let parsed = crypto::parse_public_key(&key.pem).map_err(|e| {
                warn!(rule = %rule.name, key = %key.name, error = %e, "unusable verification key");
                e
            })?;
            Ok((key, parsed))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{annotate, pack_message, DEFAULT_ANNOTATION_DOMAIN};
    use crate::error::CryptoError;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::{EncodePublicKey, LineEnding};
    use serde_json::{json, Value};

    const SIGNED: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app-config\ndata:\n  mode: strict\n";

    fn key(seed: u8, name: &str) -> (SigningKey, SignerKey) {
        let signing = SigningKey::from_slice(&[seed; 32]).unwrap();
        let pem = p256::PublicKey::from(signing.verifying_key())
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (signing, SignerKey::new(pem, name))
    }

    fn signed_request(signing: &SigningKey) -> AdmissionRequest {
        let packed = pack_message(SIGNED.as_bytes()).unwrap();
        let signature: p256::ecdsa::Signature =
            p256::ecdsa::signature::Signer::sign(signing, &packed.message);
        let mut object: Value = serde_yaml::from_str(SIGNED).unwrap();
        object["metadata"]["namespace"] = json!("prod");
        object["metadata"]["uid"] = json!("0b1c");
        annotate(
            &mut object,
            signature.to_der().as_bytes(),
            &packed.annotation,
            DEFAULT_ANNOTATION_DOMAIN,
        )
        .unwrap();
        AdmissionRequest::for_resource(object, "alice")
    }

    fn rule(keys: Vec<SignerKey>) -> VerifyRule {
        VerifyRule {
            name: "verify-cm".into(),
            keys,
            ..VerifyRule::default()
        }
    }

    fn defaults() -> DefaultConfig {
        DefaultConfig::load(None).unwrap()
    }

    #[test]
    fn signed_and_unchanged_passes() {
        let (signing, signer) = key(11, "release");
        let defaults = defaults();
        let outcome = ManifestVerifier::new(&defaults)
            .verify(&signed_request(&signing), &rule(vec![signer]))
            .unwrap();
        assert!(outcome.verified, "{}", outcome.diagnostic);
        assert_eq!(outcome.diagnostic, "Signed by a valid signer: release");
        assert_eq!(outcome.signer.as_deref(), Some("release"));
        assert_eq!(outcome.stage, Stage::SignatureChecked);
    }

    #[test]
    fn second_key_may_validate() {
        let (signing, signer) = key(11, "release");
        let (_, other) = key(12, "other");
        let defaults = defaults();
        let outcome = ManifestVerifier::new(&defaults)
            .verify(&signed_request(&signing), &rule(vec![other, signer]))
            .unwrap();
        assert_eq!(outcome.signer.as_deref(), Some("release"));
    }

    #[test]
    fn unauthorized_signer_fails() {
        let (signing, signer) = key(11, "intern");
        let defaults = defaults();
        let restricted = VerifyRule {
            signers: vec!["release".into()],
            ..rule(vec![signer])
        };
        let outcome = ManifestVerifier::new(&defaults)
            .verify(&signed_request(&signing), &restricted)
            .unwrap();
        assert!(!outcome.verified);
        assert!(outcome.diagnostic.contains("intern"), "{}", outcome.diagnostic);
    }

    #[test]
    fn namespace_scoped_ignore_uses_request_namespace() {
        let (signing, signer) = key(11, "release");
        let defaults = defaults();
        let mut request = signed_request(&signing);
        request.namespace = "team-a".into();
        let object = request.object.as_mut().unwrap();
        object["metadata"].as_object_mut().unwrap().remove("namespace");
        object["data"]["mode"] = json!("relaxed");

        assert!(!ManifestVerifier::new(&defaults)
            .verify(&request, &rule(vec![signer.clone()]))
            .unwrap()
            .verified);

        let scoped = VerifyRule {
            ignore_fields: vec![crate::config::IgnoreFieldRule {
                fields: vec!["data.mode".parse().unwrap()],
                objects: vec![crate::config::ObjectSelector {
                    namespace: Some("team-a".into()),
                    ..Default::default()
                }],
            }],
            ..rule(vec![signer])
        };
        let outcome = ManifestVerifier::new(&defaults).verify(&request, &scoped).unwrap();
        assert!(outcome.verified, "{}", outcome.diagnostic);
    }

    #[test]
    fn delete_requests_are_skipped() {
        let (signing, signer) = key(11, "release");
        let defaults = defaults();
        let mut request = signed_request(&signing);
        request.operation = Operation::Delete;
        request.object = None;
        let outcome = ManifestVerifier::new(&defaults)
            .verify(&request, &rule(vec![signer]))
            .unwrap();
        assert!(outcome.verified);
        assert_eq!(outcome.stage, Stage::Start);
    }

    #[test]
    fn rule_without_keys_is_misconfigured() {
        let (signing, _) = key(11, "release");
        let defaults = defaults();
        let err = ManifestVerifier::new(&defaults)
            .verify(&signed_request(&signing), &rule(vec![]))
            .unwrap_err();
        assert!(err.is_misconfiguration());
    }

    #[test]
    fn invalid_key_is_an_error_not_a_failure() {
        let (signing, _) = key(11, "release");
        let defaults = defaults();
        let err = ManifestVerifier::new(&defaults)
            .verify(&signed_request(&signing), &rule(vec![SignerKey::new("garbage", "bad")]))
            .unwrap_err();
        assert!(matches!(err, VerifyError::Crypto(CryptoError::InvalidKey(_))));
        assert!(err.is_misconfiguration());
    }

    #[test]
    fn malformed_bundle_carries_error() {
        let (signing, signer) = key(11, "release");
        let defaults = defaults();
        let mut request = signed_request(&signing);
        request.object.as_mut().unwrap()["metadata"]["annotations"]
            ["cosign.sigstore.dev/message"] = json!("bm90IGd6aXA=");
        let outcome = ManifestVerifier::new(&defaults)
            .verify(&request, &rule(vec![signer]))
            .unwrap();
        assert!(!outcome.verified);
        assert!(matches!(
            outcome.error,
            Some(VerifyError::Extraction(ExtractionError::Malformed(_)))
        ));
        assert_eq!(outcome.stage, Stage::BundleExtracted);
    }

    #[test]
    fn verify_rules_reports_each_rule() {
        let (signing, signer) = key(11, "release");
        let (_, stranger) = key(13, "stranger");
        let defaults = defaults();
        let rules = vec![
            rule(vec![signer]),
            VerifyRule {
                name: "wrong-key".into(),
                ..rule(vec![stranger])
            },
            VerifyRule {
                name: "broken".into(),
                ..rule(vec![])
            },
        ];
        let reports = ManifestVerifier::new(&defaults).verify_rules(&signed_request(&signing), &rules);
        let statuses: Vec<RuleStatus> = reports.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![RuleStatus::Pass, RuleStatus::Fail, RuleStatus::Error]);
        assert_eq!(reports[0].message, "manifest verified");
        assert!(reports[2].message.starts_with("failed to verify manifest: "));
    }
}
