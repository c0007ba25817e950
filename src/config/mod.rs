use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::Paths;
use crate::sandbox::broker::BrokerOptions;
use crate::sandbox::namespace::Namespace;
use crate::sandbox::policy::{build_policy, PolicyId, SandboxPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub broker: BrokerConfig,

    /// Named sandbox policies, keyed by the name used on the command line
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bundle identifier prefixing the broker's check-in name
    #[serde(default = "default_bundle_id")]
    pub bundle_id: String,

    /// Check-in reply deadline in milliseconds (default: 250)
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Directory backing the bootstrap namespace.
    /// Default: runtime dir (or state dir) + "/namespace"
    #[serde(default)]
    pub namespace_dir: Option<String>,

    /// Use the Linux abstract socket namespace instead of socket files
    #[serde(default)]
    pub abstract_namespace: bool,

    /// Descriptor children receive their bootstrap port at (default: 200)
    #[serde(default = "default_bootstrap_fd")]
    pub bootstrap_fd: i32,

    /// Optional second descriptor holding the same port
    #[serde(default)]
    pub secondary_fd: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Numeric policy id registered with the broker
    pub id: i32,

    /// Rule for services without an entry in `rules` (default: "deny-error")
    #[serde(default = "default_rule")]
    pub default: String,

    /// Service name -> "allow" | "deny-error" | "deny-dummy-port" | "substitute:<name>"
    #[serde(default)]
    pub rules: BTreeMap<String, String>,
}

fn default_bundle_id() -> String {
    "org.bootstrap-sandbox".to_string()
}
fn default_reply_timeout_ms() -> u64 {
    250
}
fn default_bootstrap_fd() -> i32 {
    200
}
fn default_rule() -> String {
    "deny-error".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bundle_id: default_bundle_id(),
            reply_timeout_ms: default_reply_timeout_ms(),
            namespace_dir: None,
            abstract_namespace: false,
            bootstrap_fd: default_bootstrap_fd(),
            secondary_fd: None,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            id: 0,
            default: default_rule(),
            rules: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from `path`, or from the default config file when `None`.
    ///
    /// The default file is created from a commented template on first run.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;

        let path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
            None => {
                let path = paths.config_file();
                if !path.exists() {
                    // Create default config file on first run
                    let config = Config {
                        paths,
                        ..Config::default()
                    };
                    config.save_with_template()?;
                    return Ok(config);
                }
                path
            }
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.paths = paths;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["broker", "bundle_id"] => Ok(self.broker.bundle_id.clone()),
            ["broker", "reply_timeout_ms"] => Ok(self.broker.reply_timeout_ms.to_string()),
            ["broker", "namespace_dir"] => Ok(self
                .broker
                .namespace_dir
                .clone()
                .unwrap_or_else(|| self.paths.namespace_dir().display().to_string())),
            ["broker", "abstract_namespace"] => Ok(self.broker.abstract_namespace.to_string()),
            ["broker", "bootstrap_fd"] => Ok(self.broker.bootstrap_fd.to_string()),
            ["broker", "secondary_fd"] => Ok(self
                .broker
                .secondary_fd
                .map(|fd| fd.to_string())
                .unwrap_or_else(|| "none".to_string())),
            ["policies", name, "id"] => Ok(self.policy(name)?.id.to_string()),
            ["policies", name, "default"] => Ok(self.policy(name)?.default.clone()),
            ["policies", name, "rules", service] => self
                .policy(name)?
                .rules
                .get(*service)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("No rule for {} in policy {}", service, name)),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["broker", "bundle_id"] => self.broker.bundle_id = value.to_string(),
            ["broker", "reply_timeout_ms"] => self.broker.reply_timeout_ms = value.parse()?,
            ["broker", "namespace_dir"] => self.broker.namespace_dir = Some(value.to_string()),
            ["broker", "abstract_namespace"] => self.broker.abstract_namespace = value.parse()?,
            ["broker", "bootstrap_fd"] => self.broker.bootstrap_fd = value.parse()?,
            ["broker", "secondary_fd"] => {
                self.broker.secondary_fd = match value {
                    "none" | "" => None,
                    fd => Some(fd.parse()?),
                }
            }
            ["policies", name, "id"] => self.policy_entry(name).id = value.parse()?,
            ["policies", name, "default"] => {
                value.parse::<crate::sandbox::policy::Rule>()?;
                self.policy_entry(name).default = value.to_string();
            }
            ["policies", name, "rules", service] => {
                value.parse::<crate::sandbox::policy::Rule>()?;
                self.policy_entry(name)
                    .rules
                    .insert(service.to_string(), value.to_string());
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }

    fn policy(&self, name: &str) -> Result<&PolicyConfig> {
        self.policies
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown policy: {}", name))
    }

    fn policy_entry(&mut self, name: &str) -> &mut PolicyConfig {
        self.policies.entry(name.to_string()).or_default()
    }

    /// Namespace the broker registers in and forwards allowed lookups to.
    pub fn namespace(&self) -> Result<Namespace> {
        if self.broker.abstract_namespace {
            #[cfg(target_os = "linux")]
            {
                let prefix = format!("bootstrap-sandbox-{}", unsafe { libc::getuid() });
                return Ok(Namespace::abstract_with_prefix(prefix));
            }
            #[cfg(not(target_os = "linux"))]
            anyhow::bail!("broker.abstract_namespace is only supported on Linux");
        }

        let dir = match &self.broker.namespace_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => self.paths.namespace_dir(),
        };
        Ok(Namespace::directory(dir))
    }

    /// Broker settings, rejecting values that would break every child.
    pub fn broker_options(&self) -> Result<BrokerOptions> {
        let broker = &self.broker;
        if broker.bundle_id.is_empty() {
            anyhow::bail!("broker.bundle_id must not be empty");
        }
        if broker.reply_timeout_ms == 0 {
            anyhow::bail!("broker.reply_timeout_ms must be greater than 0");
        }
        check_port_fd("broker.bootstrap_fd", broker.bootstrap_fd)?;
        if let Some(fd) = broker.secondary_fd {
            check_port_fd("broker.secondary_fd", fd)?;
        }

        Ok(BrokerOptions {
            bundle_id: broker.bundle_id.clone(),
            reply_timeout: Duration::from_millis(broker.reply_timeout_ms),
            bootstrap_fd: broker.bootstrap_fd,
            secondary_fd: broker.secondary_fd,
        })
    }

    pub fn policy_id(&self, name: &str) -> Result<PolicyId> {
        Ok(PolicyId(self.policy(name)?.id))
    }

    /// Build every configured policy. Fails on bad rules or duplicate ids.
    pub fn sandbox_policies(&self) -> Result<Vec<(String, PolicyId, SandboxPolicy)>> {
        let mut seen: BTreeMap<i32, &str> = BTreeMap::new();
        let mut policies = Vec::with_capacity(self.policies.len());

        for (name, policy_config) in &self.policies {
            if let Some(other) = seen.insert(policy_config.id, name) {
                anyhow::bail!(
                    "Policies {} and {} share id {}",
                    other,
                    name,
                    policy_config.id
                );
            }
            let policy = build_policy(policy_config)
                .with_context(|| format!("Invalid policy {}", name))?;
            policies.push((name.clone(), PolicyId(policy_config.id), policy));
        }

        Ok(policies)
    }
}

// 0-2 are the child's stdio.
fn check_port_fd(key: &str, fd: i32) -> Result<()> {
    if fd <= 2 {
        anyhow::bail!("{} must be above 2 (got {})", key, fd);
    }
    Ok(())
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# bootstrap-sandbox configuration
# Auto-created on first run. Edit as needed.

[broker]
bundle_id = "org.bootstrap-sandbox"
reply_timeout_ms = 250
bootstrap_fd = 200

# Bootstrap namespace location.
# Default: $XDG_RUNTIME_DIR/bootstrap-sandbox/namespace
# Override with BOOTSTRAP_SANDBOX_NAMESPACE_DIR=/path
# namespace_dir = "~/.local/state/bootstrap-sandbox/namespace"

# Linux only: use the abstract socket namespace instead of socket files
# abstract_namespace = false

# Also install the bootstrap port at a second descriptor
# secondary_fd = 201

# Policies are selected by name: bootstrap-sandbox run --policy renderer -- cmd
# Rules: allow | deny-error | deny-dummy-port | substitute:<service>
[policies.renderer]
id = 1
default = "deny-error"

[policies.renderer.rules]
# "org.example.fonts" = "allow"
# "org.example.clipboard" = "deny-dummy-port"
# "org.example.printing" = "substitute:org.example.print-proxy"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::Rule;

    #[test]
    fn template_parses_to_defaults() {
        let config = Config::parse(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.broker.bundle_id, "org.bootstrap-sandbox");
        assert_eq!(config.broker.reply_timeout_ms, 250);
        assert_eq!(config.broker.bootstrap_fd, 200);
        assert!(!config.broker.abstract_namespace);
        assert_eq!(config.policy_id("renderer").unwrap(), PolicyId(1));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.broker.reply_timeout_ms, 250);
        assert!(config.policies.is_empty());
        assert_eq!(
            config.broker_options().unwrap().reply_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn unusable_broker_settings_rejected() {
        for bad in [
            "bootstrap_fd = 1",
            "bootstrap_fd = -4",
            "secondary_fd = 0",
            "reply_timeout_ms = 0",
            "bundle_id = \"\"",
        ] {
            let config = Config::parse(&format!("[broker]\n{}\n", bad)).unwrap();
            assert!(config.broker_options().is_err(), "{} accepted", bad);
        }

        let config = Config::parse("[broker]\nbootstrap_fd = 3\nsecondary_fd = 240\n").unwrap();
        let options = config.broker_options().unwrap();
        assert_eq!(options.bootstrap_fd, 3);
        assert_eq!(options.secondary_fd, Some(240));
    }

    #[test]
    fn secondary_fd_key() {
        let mut config = Config::parse("").unwrap();
        assert_eq!(config.get_value("broker.secondary_fd").unwrap(), "none");

        config.set_value("broker.secondary_fd", "201").unwrap();
        assert_eq!(config.broker.secondary_fd, Some(201));
        assert_eq!(config.get_value("broker.secondary_fd").unwrap(), "201");

        config.set_value("broker.secondary_fd", "none").unwrap();
        assert_eq!(config.broker.secondary_fd, None);
        assert!(config.set_value("broker.secondary_fd", "two").is_err());
    }

    #[test]
    fn policies_are_built() {
        let config = Config::parse(
            r#"
            [policies.gpu]
            id = 3
            default = "deny-dummy-port"

            [policies.gpu.rules]
            "org.example.fonts" = "allow"
            "org.example.print" = "substitute:org.example.proxy"
            "#,
        )
        .unwrap();

        let policies = config.sandbox_policies().unwrap();
        assert_eq!(policies.len(), 1);
        let (name, id, policy) = &policies[0];
        assert_eq!(name, "gpu");
        assert_eq!(*id, PolicyId(3));
        assert_eq!(policy.rule_for("org.example.fonts"), &Rule::Allow);
        assert_eq!(
            policy.rule_for("org.example.print"),
            &Rule::Substitute("org.example.proxy".into())
        );
        assert_eq!(policy.rule_for("anything"), &Rule::DenyDummyPort);
    }

    #[test]
    fn duplicate_policy_ids_rejected() {
        let config = Config::parse(
            r#"
            [policies.a]
            id = 1
            [policies.b]
            id = 1
            "#,
        )
        .unwrap();
        let err = config.sandbox_policies().unwrap_err();
        assert!(err.to_string().contains("share id 1"), "{}", err);
    }

    #[test]
    fn bad_rule_rejected() {
        let config = Config::parse(
            r#"
            [policies.a]
            id = 1
            [policies.a.rules]
            "svc" = "maybe"
            "#,
        )
        .unwrap();
        assert!(config.sandbox_policies().is_err());
    }

    #[test]
    fn get_and_set_values() {
        let mut config = Config::parse("").unwrap();

        config.set_value("broker.reply_timeout_ms", "500").unwrap();
        config.set_value("policies.net.id", "9").unwrap();
        // Dotted service names can't be addressed as keys.
        config.set_value("policies.net.rules.org.example.dns", "allow").unwrap_err();
        config.set_value("policies.net.default", "deny-dummy-port").unwrap();

        assert_eq!(config.get_value("broker.reply_timeout_ms").unwrap(), "500");
        assert_eq!(config.get_value("policies.net.id").unwrap(), "9");
        assert_eq!(
            config.get_value("policies.net.default").unwrap(),
            "deny-dummy-port"
        );
        assert!(config.set_value("policies.net.default", "nope").is_err());
        assert!(config.get_value("broker.nope").is_err());
        assert!(config.get_value("policies.missing.id").is_err());
    }

    #[test]
    fn rules_are_set_per_service() {
        let mut config = Config::parse("").unwrap();
        config.set_value("policies.net.id", "2").unwrap();
        config.set_value("policies.net.rules.dns", "allow").unwrap();
        assert_eq!(config.get_value("policies.net.rules.dns").unwrap(), "allow");
    }

    #[test]
    fn explicit_namespace_dir() {
        let config = Config::parse(
            r#"
            [broker]
            namespace_dir = "/tmp/bsb-ns"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.namespace().unwrap().dir(),
            Some(std::path::Path::new("/tmp/bsb-ns"))
        );
    }
}
