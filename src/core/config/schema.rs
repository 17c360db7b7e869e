//! core::config::schema
//!
//! Repository configuration schema types.
//!
//! # Location
//!
//! Repo config lives at `.capstan/config.toml` under the repository root.
//!
//! # Validation
//!
//! Config values are validated after parsing: thresholds must be ordered
//! and in range, plugin names must satisfy the admission name rule, and
//! step names must be unique.
//!
//! # Example
//!
//! ```toml
//! tag_prefix = "v"
//!
//! [thresholds]
//! auto_approve_below = 0.3
//! require_approval_above = 0.3
//! block_above = 0.8
//!
//! [notes]
//! audience = "users"
//! tone = "concise"
//!
//! [[steps]]
//! name = "tag"
//! type = "tag"
//!
//! [[plugins]]
//! name = "announce"
//! hooks = ["post_publish"]
//! timeout_secs = 30
//! ```

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::core::types::RiskThresholds;
use crate::plugin::admission::validate_plugin_name;

/// Repository configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RepoConfig {
    /// Logical repository identity (e.g. `org/app`). Derived from the
    /// remote URL when unset.
    pub repo_id: Option<String>,

    /// Prefix for release tags (default `v`).
    pub tag_prefix: Option<String>,

    /// Risk thresholds.
    pub thresholds: Option<ThresholdsConfig>,

    /// Notes generation defaults.
    pub notes: Option<NotesConfig>,

    /// Multi-level approval policy.
    pub approval: Option<ApprovalConfig>,

    /// Publishing steps, in execution order.
    pub steps: Vec<StepConfig>,

    /// Configured plugins, in registration order.
    pub plugins: Vec<PluginConfig>,

    /// Plugin host tuning.
    pub plugin_host: Option<PluginHostConfig>,
}

impl RepoConfig {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(thresholds) = &self.thresholds {
            thresholds
                .to_thresholds()
                .validate()
                .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        }

        if let Some(notes) = &self.notes {
            notes.validate()?;
        }

        if let Some(approval) = &self.approval {
            approval.validate()?;
        }

        let mut step_names = std::collections::HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "step name cannot be empty".into(),
                ));
            }
            if !step_names.insert(step.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }

        let mut plugin_names = std::collections::HashSet::new();
        for plugin in &self.plugins {
            validate_plugin_name(&plugin.name)
                .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
            if !plugin_names.insert(plugin.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate plugin name '{}'",
                    plugin.name
                )));
            }
        }

        Ok(())
    }

    /// The tag prefix, defaulting to `v`.
    pub fn tag_prefix(&self) -> &str {
        self.tag_prefix.as_deref().unwrap_or("v")
    }

    /// The effective risk thresholds.
    pub fn risk_thresholds(&self) -> RiskThresholds {
        self.thresholds
            .as_ref()
            .map(ThresholdsConfig::to_thresholds)
            .unwrap_or_default()
    }
}

/// Risk threshold settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdsConfig {
    /// Auto-approval is permitted below this risk.
    pub auto_approve_below: f64,
    /// Human approval is required at or above this risk.
    pub require_approval_above: f64,
    /// The release is blocked at or above this risk.
    pub block_above: f64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        let t = RiskThresholds::default();
        Self {
            auto_approve_below: t.auto_approve_below,
            require_approval_above: t.require_approval_above,
            block_above: t.block_above,
        }
    }
}

impl ThresholdsConfig {
    /// Convert into the domain thresholds type.
    pub fn to_thresholds(&self) -> RiskThresholds {
        RiskThresholds {
            auto_approve_below: self.auto_approve_below,
            require_approval_above: self.require_approval_above,
            block_above: self.block_above,
        }
    }
}

/// Notes generation defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NotesConfig {
    /// Audience preset: `users`, `developers`, or `operators`.
    pub audience: String,
    /// Tone preset: `concise` or `detailed`.
    pub tone: String,
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            audience: "users".into(),
            tone: "concise".into(),
        }
    }
}

impl NotesConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        const AUDIENCES: [&str; 3] = ["users", "developers", "operators"];
        const TONES: [&str; 2] = ["concise", "detailed"];
        if !AUDIENCES.contains(&self.audience.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "invalid notes audience '{}', must be one of: {}",
                self.audience,
                AUDIENCES.join(", ")
            )));
        }
        if !TONES.contains(&self.tone.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "invalid notes tone '{}', must be one of: {}",
                self.tone,
                TONES.join(", ")
            )));
        }
        Ok(())
    }
}

/// Multi-level approval policy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ApprovalConfig {
    /// Whether grants must arrive in ascending level order.
    pub sequential: bool,
    /// The levels.
    pub levels: Vec<ApprovalLevelConfig>,
}

impl ApprovalConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for level in &self.levels {
            if !seen.insert(level.level) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate approval level {}",
                    level.level
                )));
            }
        }
        Ok(())
    }

    /// Convert into the domain policy, or `None` when no levels exist.
    pub fn to_policy(&self) -> Option<crate::core::run::ApprovalPolicy> {
        if self.levels.is_empty() {
            return None;
        }
        Some(crate::core::run::ApprovalPolicy {
            levels: self
                .levels
                .iter()
                .map(|l| crate::core::run::ApprovalLevel {
                    level: l.level,
                    name: l.name.clone(),
                    mandatory: l.mandatory,
                })
                .collect(),
            sequential: self.sequential,
        })
    }
}

/// One approval level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ApprovalLevelConfig {
    /// Numeric level.
    pub level: u32,
    /// Level name.
    pub name: String,
    /// Whether completion requires this level.
    #[serde(default = "default_true")]
    pub mandatory: bool,
}

/// One configured publishing step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Unique step name.
    pub name: String,
    /// Step type (`tag` or `plugin`).
    #[serde(rename = "type")]
    pub step_type: String,
    /// Plugin to dispatch to, for `plugin` steps.
    #[serde(default)]
    pub plugin: Option<String>,
    /// Hook to dispatch, for `plugin` steps.
    #[serde(default)]
    pub hook: Option<String>,
    /// Marks steps whose side effects cannot be rolled back.
    #[serde(rename = "unsafe", default)]
    pub unsafe_step: bool,
}

/// One configured plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PluginConfig {
    /// Plugin name; must satisfy `[A-Za-z0-9_-]{1,64}`.
    pub name: String,
    /// Explicit binary path. When unset, the host searches the allowed
    /// plugin directories for a binary named after the plugin.
    pub path: Option<String>,
    /// Hooks this plugin handles. Empty means unknown: the host loads the
    /// plugin to discover its hooks.
    pub hooks: Vec<String>,
    /// Per-call timeout in seconds (default 30, capped by the global
    /// dispatch deadline).
    pub timeout_secs: Option<u64>,
    /// Environment variables forwarded to the child beyond the essential
    /// set.
    pub env_allowlist: Vec<String>,
    /// Capability grants.
    pub capabilities: PluginCapabilities,
    /// Resource limits.
    pub limits: PluginLimits,
    /// Opaque plugin-specific settings, passed through `validate` and
    /// `execute`.
    pub settings: toml::Table,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: None,
            hooks: Vec::new(),
            timeout_secs: None,
            env_allowlist: Vec::new(),
            capabilities: PluginCapabilities::default(),
            limits: PluginLimits::default(),
            settings: toml::Table::new(),
        }
    }
}

/// Capability grants for a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PluginCapabilities {
    /// Permit the child to read the full parent environment.
    pub read_env: bool,
}

/// Best-effort resource limits for a plugin child process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PluginLimits {
    /// Address-space / data segment cap in megabytes.
    pub max_memory_mb: Option<u64>,
    /// CPU-seconds cap.
    pub max_cpu_seconds: Option<u64>,
    /// Open file descriptor cap.
    pub max_file_descriptors: Option<u64>,
    /// CPU share hint, mapped to nice priority.
    pub max_cpu_percent: Option<u32>,
}

/// Plugin host tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PluginHostConfig {
    /// Global deadline across one hook dispatch, in seconds.
    pub global_timeout_secs: u64,
    /// Maximum concurrent plugin executions.
    pub max_concurrency: usize,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        Self {
            global_timeout_secs: 120,
            max_concurrency: 10,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RepoConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
            tag_prefix = "release-"

            [thresholds]
            auto_approve_below = 0.2
            require_approval_above = 0.2
            block_above = 0.9

            [notes]
            audience = "developers"
            tone = "detailed"

            [approval]
            sequential = true

            [[approval.levels]]
            level = 1
            name = "engineering"

            [[steps]]
            name = "tag"
            type = "tag"

            [[steps]]
            name = "announce"
            type = "plugin"
            plugin = "slack"
            hook = "post_publish"

            [[plugins]]
            name = "slack"
            hooks = ["post_publish"]
            timeout_secs = 10

            [plugins.limits]
            max_memory_mb = 256

            [plugin_host]
            global_timeout_secs = 60
            max_concurrency = 4
        "#;
        let config: RepoConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tag_prefix(), "release-");
        assert_eq!(config.steps.len(), 2);
        assert_eq!(config.plugins[0].timeout_secs, Some(10));
        assert_eq!(config.plugins[0].limits.max_memory_mb, Some(256));
        assert_eq!(config.plugin_host.unwrap().max_concurrency, 4);
    }

    #[test]
    fn invalid_plugin_name_rejected_at_parse_time() {
        let toml = r#"
            [[plugins]]
            name = "../etc/passwd"
        "#;
        let config: RepoConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_step_names_rejected() {
        let toml = r#"
            [[steps]]
            name = "tag"
            type = "tag"

            [[steps]]
            name = "tag"
            type = "plugin"
        "#;
        let config: RepoConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        let toml = "definitely_not_a_field = true\n";
        assert!(toml::from_str::<RepoConfig>(toml).is_err());
    }

    #[test]
    fn invalid_audience_rejected() {
        let toml = r#"
            [notes]
            audience = "robots"
        "#;
        let config: RepoConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn approval_policy_conversion() {
        let config = ApprovalConfig {
            sequential: true,
            levels: vec![ApprovalLevelConfig {
                level: 1,
                name: "eng".into(),
                mandatory: true,
            }],
        };
        let policy = config.to_policy().unwrap();
        assert!(policy.sequential);
        assert_eq!(policy.mandatory_levels(), vec![1]);

        assert!(ApprovalConfig::default().to_policy().is_none());
    }
}
