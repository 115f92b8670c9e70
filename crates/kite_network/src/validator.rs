//! Trust policy: decides whether a signed query may make the claim it makes.
//!
//! A policy is a set of trust anchors (identity name → public key) and a set
//! of rules. The rule with the longest `name_prefix` covering the query name
//! applies; its signer constraint says which signers are allowed.
//!
//! ```toml
//! max_signature_age_ms = 60000
//!
//! [[anchor]]
//! identity = "/rv/mobile-1"
//! public_key = "8f2c…"
//!
//! [[rule]]
//! name_prefix = "/rv"
//! signer = "claimed-name"
//! marker = "kite"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SecurityError, ValidationError};
use crate::name::Name;
use crate::packet::Query;
use crate::security::{decode_public_key, verify_signature};
use crate::serde_helpers::option_duration_ms;

/// Checks inbound queries against a trust policy.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, query: &Query) -> Result<(), ValidationError>;
}

/// Which signers a rule admits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signer", rename_all = "kebab-case")]
pub enum SignerConstraint {
    /// Any trust anchor may sign.
    AnyAnchor,
    /// The signer identity must sit under `prefix`.
    UnderPrefix { prefix: Name },
    /// The query name is `<head>/<marker>/<tail>`, with `<head>` the rule
    /// prefix (minus a trailing `<marker>`); the signer must be exactly
    /// `<head>/<tail>`, the name the query claims.
    ClaimedName { marker: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRule {
    pub name_prefix: Name,
    #[serde(flatten)]
    pub constraint: SignerConstraint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAnchorConfig {
    pub identity: Name,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
}

/// On-disk form of a [`TrustPolicy`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustPolicyConfig {
    #[serde(default, rename = "anchor")]
    pub anchors: Vec<TrustAnchorConfig>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<TrustRule>,
    #[serde(
        default,
        rename = "max_signature_age_ms",
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_signature_age: Option<Duration>,
}

/// A loaded trust policy.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    anchors: HashMap<Name, VerifyingKey>,
    rules: Vec<TrustRule>,
    max_signature_age: Option<Duration>,
}

impl TrustPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a policy from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SecurityError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            SecurityError::Storage(format!("Cannot read trust policy {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self, SecurityError> {
        let config: TrustPolicyConfig = toml::from_str(data)
            .map_err(|e| SecurityError::Storage(format!("Invalid trust policy: {e}")))?;
        Self::from_config(config)
    }

    pub fn from_config(config: TrustPolicyConfig) -> Result<Self, SecurityError> {
        let mut policy = Self::new();
        for anchor in config.anchors {
            let key = decode_public_key(&anchor.public_key).map_err(|reason| {
                SecurityError::InvalidKey {
                    identity: anchor.identity.clone(),
                    reason,
                }
            })?;
            policy.anchors.insert(anchor.identity, key);
        }
        policy.rules = config.rules;
        policy.max_signature_age = config.max_signature_age;
        Ok(policy)
    }

    pub fn with_anchor(mut self, identity: Name, key: VerifyingKey) -> Self {
        self.anchors.insert(identity, key);
        self
    }

    pub fn with_rule(mut self, name_prefix: Name, constraint: SignerConstraint) -> Self {
        self.rules.push(TrustRule {
            name_prefix,
            constraint,
        });
        self
    }

    pub fn with_max_signature_age(mut self, age: Duration) -> Self {
        self.max_signature_age = Some(age);
        self
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Run every check synchronously.
    pub fn check(&self, query: &Query) -> Result<(), ValidationError> {
        let rule = self
            .rules
            .iter()
            .filter(|r| r.name_prefix.is_prefix_of(&query.name))
            .max_by_key(|r| r.name_prefix.len())
            .ok_or_else(|| ValidationError::NoMatchingRule(query.name.clone()))?;

        let signature = query.signature.as_ref().ok_or(ValidationError::Unsigned)?;
        let signer = &signature.key_locator;
        let key = self
            .anchors
            .get(signer)
            .ok_or_else(|| ValidationError::UnknownSigner(signer.clone()))?;

        if let Some(max_age) = self.max_signature_age {
            let age = Utc::now().signed_duration_since(signature.signed_at);
            if age.to_std().is_ok_and(|age| age > max_age) {
                return Err(ValidationError::Expired { max_age });
            }
        }

        let portion = query
            .signed_portion()
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        if !verify_signature(&portion, signature, key) {
            return Err(ValidationError::BadSignature);
        }

        match &rule.constraint {
            SignerConstraint::AnyAnchor => Ok(()),
            SignerConstraint::UnderPrefix { prefix } => {
                if prefix.is_prefix_of(signer) {
                    Ok(())
                } else {
                    Err(ValidationError::SignerMismatch {
                        signer: signer.clone(),
                        claimed: prefix.clone(),
                    })
                }
            }
            SignerConstraint::ClaimedName { marker } => {
                let Some(claimed) = claimed_name(&query.name, &rule.name_prefix, marker) else {
                    return Err(ValidationError::Malformed(format!(
                        "no '{marker}' component after {}",
                        rule.name_prefix
                    )));
                };
                if *signer == claimed {
                    Ok(())
                } else {
                    Err(ValidationError::SignerMismatch {
                        signer: signer.clone(),
                        claimed,
                    })
                }
            }
        }
    }
}

/// Strip the `marker` component that sits where `rule_prefix` ends.
///
/// The rule prefix is either the rendezvous prefix (`/rv`, marker right
/// after it) or the rendezvous prefix plus the marker (`/rv/kite`). Any
/// other position is refused, so `<head>` is always the rule's own head.
fn claimed_name(name: &Name, rule_prefix: &Name, marker: &str) -> Option<Name> {
    let at = match rule_prefix.components().last() {
        Some(last) if last.as_str() == marker => rule_prefix.len() - 1,
        _ => rule_prefix.len(),
    };
    if name.get(at) != Some(marker) || name.len() <= at + 1 {
        return None;
    }
    Some(name.prefix(at).join(&name.suffix_after(at + 1)))
}

#[async_trait]
impl Validator for TrustPolicy {
    async fn validate(&self, query: &Query) -> Result<(), ValidationError> {
        let result = self.check(query);
        if let Err(e) = &result {
            debug!("Trust policy rejected {}: {e}", query.name);
        }
        result
    }
}

/// Accepts every query. Only meant for tests and closed lab setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullValidator;

#[async_trait]
impl Validator for NullValidator {
    async fn validate(&self, _query: &Query) -> Result<(), ValidationError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::KeyChain;

    fn signed_query(keys: &KeyChain, name: &str, identity: &str) -> Query {
        let mut query = Query::new(Name::parse(name));
        query.sign(keys, &Name::parse(identity)).unwrap();
        query
    }

    fn kite_policy(keys: &KeyChain, anchor: &str) -> TrustPolicy {
        let id = Name::parse(anchor);
        TrustPolicy::new()
            .with_anchor(id.clone(), keys.public_key(&id).unwrap())
            .with_rule(
                Name::parse("/rv"),
                SignerConstraint::ClaimedName {
                    marker: "kite".to_string(),
                },
            )
    }

    #[test]
    fn test_claimed_name_accepts_matching_signer() {
        let mut keys = KeyChain::new();
        keys.create_identity(&Name::parse("/rv/mobile-1"));
        let policy = kite_policy(&keys, "/rv/mobile-1");

        let query = signed_query(&keys, "/rv/kite/mobile-1", "/rv/mobile-1");
        assert_eq!(policy.check(&query), Ok(()));
    }

    #[test]
    fn test_claimed_name_rejects_other_producer() {
        let mut keys = KeyChain::new();
        keys.create_identity(&Name::parse("/rv/mobile-1"));
        let policy = kite_policy(&keys, "/rv/mobile-1");

        let query = signed_query(&keys, "/rv/kite/mobile-2", "/rv/mobile-1");
        assert_eq!(
            policy.check(&query),
            Err(ValidationError::SignerMismatch {
                signer: Name::parse("/rv/mobile-1"),
                claimed: Name::parse("/rv/mobile-2"),
            })
        );
    }

    #[test]
    fn test_rule_prefix_may_include_marker() {
        let mut keys = KeyChain::new();
        let id = Name::parse("/rv/mobile-1");
        keys.create_identity(&id);
        let policy = TrustPolicy::new()
            .with_anchor(id.clone(), keys.public_key(&id).unwrap())
            .with_rule(
                Name::parse("/rv/kite"),
                SignerConstraint::ClaimedName {
                    marker: "kite".to_string(),
                },
            );

        let query = signed_query(&keys, "/rv/kite/mobile-1", "/rv/mobile-1");
        assert_eq!(policy.check(&query), Ok(()));

        let other = signed_query(&keys, "/rv/kite/mobile-2", "/rv/mobile-1");
        assert!(matches!(
            policy.check(&other),
            Err(ValidationError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn test_marker_only_counts_at_rule_boundary() {
        let mut keys = KeyChain::new();
        let id = Name::parse("/rv/q/y");
        keys.create_identity(&id);
        let policy = kite_policy(&keys, "/rv/q/y");

        // A marker deeper in the name does not move the split point.
        let deeper = signed_query(&keys, "/rv/q/kite/y", "/rv/q/y");
        assert!(matches!(
            policy.check(&deeper),
            Err(ValidationError::Malformed(_))
        ));

        let no_tail = signed_query(&keys, "/rv/kite", "/rv/q/y");
        assert!(matches!(
            policy.check(&no_tail),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_unsigned_and_unknown_signer() {
        let mut keys = KeyChain::new();
        keys.create_identity(&Name::parse("/rv/mobile-1"));
        keys.create_identity(&Name::parse("/rv/stranger"));
        let policy = kite_policy(&keys, "/rv/mobile-1");

        let unsigned = Query::new(Name::parse("/rv/kite/mobile-1"));
        assert_eq!(policy.check(&unsigned), Err(ValidationError::Unsigned));

        let stranger = signed_query(&keys, "/rv/kite/stranger", "/rv/stranger");
        assert_eq!(
            policy.check(&stranger),
            Err(ValidationError::UnknownSigner(Name::parse("/rv/stranger")))
        );
    }

    #[test]
    fn test_tampered_query_fails_signature() {
        let mut keys = KeyChain::new();
        keys.create_identity(&Name::parse("/rv/mobile-1"));
        let policy = kite_policy(&keys, "/rv/mobile-1");

        let mut query = signed_query(&keys, "/rv/kite/mobile-1", "/rv/mobile-1");
        query.app_parameters = Some(serde_json::json!({"injected": true}));
        assert_eq!(policy.check(&query), Err(ValidationError::BadSignature));
    }

    #[test]
    fn test_no_rule_covers_name() {
        let mut keys = KeyChain::new();
        keys.create_identity(&Name::parse("/rv/mobile-1"));
        let policy = kite_policy(&keys, "/rv/mobile-1");

        let query = signed_query(&keys, "/elsewhere/x", "/rv/mobile-1");
        assert!(matches!(
            policy.check(&query),
            Err(ValidationError::NoMatchingRule(_))
        ));
    }

    #[test]
    fn test_longest_rule_wins() {
        let mut keys = KeyChain::new();
        let ops = Name::parse("/ops/admin");
        keys.create_identity(&ops);
        let policy = TrustPolicy::new()
            .with_anchor(ops.clone(), keys.public_key(&ops).unwrap())
            .with_rule(Name::parse("/rv"), SignerConstraint::AnyAnchor)
            .with_rule(
                Name::parse("/rv/private"),
                SignerConstraint::UnderPrefix {
                    prefix: Name::parse("/rv"),
                },
            );

        let open = signed_query(&keys, "/rv/public/x", "/ops/admin");
        assert_eq!(policy.check(&open), Ok(()));

        let private = signed_query(&keys, "/rv/private/x", "/ops/admin");
        assert!(matches!(
            policy.check(&private),
            Err(ValidationError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn test_signature_age_limit() {
        let mut keys = KeyChain::new();
        keys.create_identity(&Name::parse("/rv/mobile-1"));
        let policy = kite_policy(&keys, "/rv/mobile-1")
            .with_max_signature_age(Duration::from_secs(60));

        let mut query = signed_query(&keys, "/rv/kite/mobile-1", "/rv/mobile-1");
        assert_eq!(policy.check(&query), Ok(()));

        if let Some(sig) = query.signature.as_mut() {
            sig.signed_at -= chrono::Duration::minutes(5);
        }
        assert_eq!(
            policy.check(&query),
            Err(ValidationError::Expired {
                max_age: Duration::from_secs(60)
            })
        );
    }

    #[test]
    fn test_load_from_toml() {
        let mut keys = KeyChain::new();
        let id = Name::parse("/rv/mobile-1");
        keys.create_identity(&id);
        let toml = format!(
            r#"
max_signature_age_ms = 30000

[[anchor]]
identity = "/rv/mobile-1"
public_key = "{}"

[[rule]]
name_prefix = "/rv"
signer = "claimed-name"
marker = "kite"
"#,
            keys.public_key_hex(&id).unwrap()
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.toml");
        std::fs::write(&path, toml).unwrap();

        let policy = TrustPolicy::load(&path).unwrap();
        assert_eq!(policy.anchor_count(), 1);
        assert_eq!(policy.rule_count(), 1);

        let query = signed_query(&keys, "/rv/kite/mobile-1", "/rv/mobile-1");
        assert_eq!(policy.check(&query), Ok(()));
    }

    #[test]
    fn test_load_rejects_bad_anchor_key() {
        let toml = r#"
[[anchor]]
identity = "/rv"
public_key = "zz"
"#;
        assert!(matches!(
            TrustPolicy::from_toml_str(toml),
            Err(SecurityError::InvalidKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_null_validator_accepts_everything() {
        let query = Query::new(Name::parse("/anything"));
        assert!(NullValidator.validate(&query).await.is_ok());
    }
}
