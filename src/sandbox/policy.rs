use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::PolicyConfig;

/// Integer key of a registered sandbox policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub i32);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the interception server answers a lookup of one service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Rule {
    /// Forward the lookup to the real namespace.
    Allow,
    /// Answer "not permitted" with no descriptor.
    DenyError,
    /// Answer with a descriptor whose peer is already closed.
    DenyDummyPort,
    /// Look up this other service in the real namespace instead.
    Substitute(String),
}

impl FromStr for Rule {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "allow" => Ok(Rule::Allow),
            "deny-error" => Ok(Rule::DenyError),
            "deny-dummy-port" => Ok(Rule::DenyDummyPort),
            other => match other.strip_prefix("substitute:") {
                Some(target) if !target.trim().is_empty() => {
                    Ok(Rule::Substitute(target.trim().to_string()))
                }
                _ => Err(PolicyError::UnknownRule(s.to_string())),
            },
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Allow => f.write_str("allow"),
            Rule::DenyError => f.write_str("deny-error"),
            Rule::DenyDummyPort => f.write_str("deny-dummy-port"),
            Rule::Substitute(target) => write!(f, "substitute:{}", target),
        }
    }
}

impl TryFrom<String> for Rule {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rule> for String {
    fn from(rule: Rule) -> Self {
        rule.to_string()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown rule '{0}' (expected allow, deny-error, deny-dummy-port or substitute:<name>)")]
    UnknownRule(String),

    #[error("default rule cannot be a substitution")]
    SubstituteDefault,
}

/// Rule set consulted for every lookup made by a sandboxed process.
///
/// Immutable once registered with the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    rules: BTreeMap<String, Rule>,
    default_rule: Rule,
}

impl SandboxPolicy {
    pub fn new(default_rule: Rule) -> Result<Self, PolicyError> {
        if matches!(default_rule, Rule::Substitute(_)) {
            return Err(PolicyError::SubstituteDefault);
        }
        Ok(Self {
            rules: BTreeMap::new(),
            default_rule,
        })
    }

    /// Policy that denies every lookup with an error.
    pub fn deny_all() -> Self {
        Self {
            rules: BTreeMap::new(),
            default_rule: Rule::DenyError,
        }
    }

    pub fn with_rule(mut self, service: impl Into<String>, rule: Rule) -> Self {
        self.rules.insert(service.into(), rule);
        self
    }

    pub fn rule_for(&self, service: &str) -> &Rule {
        self.rules.get(service).unwrap_or(&self.default_rule)
    }

    pub fn default_rule(&self) -> &Rule {
        &self.default_rule
    }

    pub fn rules(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Build a `SandboxPolicy` from its config section.
pub fn build_policy(config: &PolicyConfig) -> Result<SandboxPolicy, PolicyError> {
    let default_rule: Rule = config.default.parse()?;
    let mut policy = SandboxPolicy::new(default_rule)?;
    for (service, rule) in &config.rules {
        policy = policy.with_rule(service.clone(), rule.parse()?);
    }
    Ok(policy)
}
