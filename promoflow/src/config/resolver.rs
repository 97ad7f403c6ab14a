//! Configuration Resolver: turns a deployment configuration document into
//! validated, ordered environment descriptors.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::core::EnvironmentDescriptor;
use crate::errors::ConfigError;
use crate::pipeline::{default_gate_name, GatePolicy};

/// Name of the environment entry that hosts the canonical registry.
pub const TOOLS_ENVIRONMENT: &str = "tools";

/// Organization section of the configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrganizationSection {
    /// Organization identifier used to scope registry pulls.
    #[serde(default)]
    pub id: Option<String>,
}

/// One environment entry of the configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSection {
    /// Account identifier.
    #[serde(default)]
    pub account: Option<String>,
    /// Region identifier.
    #[serde(default)]
    pub region: Option<String>,
    /// Whether a manual approval gate follows this environment's stage.
    #[serde(default)]
    pub approval_required: bool,
    /// Explicit name for that gate.
    #[serde(default)]
    pub gate_name: Option<String>,
}

/// The raw configuration document, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    /// Application name; the repository name is derived from it.
    #[serde(default)]
    pub app_name: Option<String>,
    /// Organization scope.
    #[serde(default)]
    pub organization: Option<OrganizationSection>,
    /// Environment entries keyed by name, including `tools`.
    #[serde(default)]
    pub env: BTreeMap<String, EnvironmentSection>,
    /// Promotion order.
    #[serde(default)]
    pub stages: Vec<String>,
}

/// A place configuration documents are read from.
pub trait ConfigSource: Send + Sync {
    /// Loads the raw document.
    fn load(&self) -> Result<ConfigDocument, ConfigError>;
}

/// Reads a JSON document from a file.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    /// Creates a source for the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for JsonFileSource {
    fn load(&self) -> Result<ConfigDocument, ConfigError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ConfigError::Parse(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }
}

/// Reads a JSON document held in memory.
#[derive(Debug, Clone)]
pub struct JsonStrSource {
    content: String,
}

impl JsonStrSource {
    /// Creates a source over the given JSON text.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl ConfigSource for JsonStrSource {
    fn load(&self) -> Result<ConfigDocument, ConfigError> {
        serde_json::from_str(&self.content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

impl ConfigSource for ConfigDocument {
    fn load(&self) -> Result<ConfigDocument, ConfigError> {
        Ok(self.clone())
    }
}

/// Fully validated configuration, resolved once at startup and passed
/// explicitly to everything that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    /// Application name.
    pub app_name: String,
    /// Repository name (the application name lower-cased).
    pub repository: String,
    /// Organization id scoping registry pulls.
    pub organization_id: String,
    /// Home of the canonical registry.
    pub tools: EnvironmentDescriptor,
    /// Deployment targets in promotion order.
    pub environments: Vec<EnvironmentDescriptor>,
    /// Gates derived from `approvalRequired` entries.
    pub gate_policy: GatePolicy,
}

impl ResolvedConfig {
    /// Returns the ordered deployment targets.
    #[must_use]
    pub fn environments(&self) -> &[EnvironmentDescriptor] {
        &self.environments
    }

    /// Looks up a deployment target by name.
    #[must_use]
    pub fn environment(&self, name: &str) -> Option<&EnvironmentDescriptor> {
        self.environments.iter().find(|e| e.name == name)
    }
}

/// Resolves and validates configuration from a [`ConfigSource`].
#[derive(Debug, Clone)]
pub struct ConfigResolver<S> {
    source: S,
}

impl ConfigResolver<JsonFileSource> {
    /// Creates a resolver reading a JSON file.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(JsonFileSource::new(path))
    }
}

impl ConfigResolver<JsonStrSource> {
    /// Creates a resolver over JSON text.
    #[must_use]
    pub fn from_json_str(content: impl Into<String>) -> Self {
        Self::new(JsonStrSource::new(content))
    }
}

impl<S: ConfigSource> ConfigResolver<S> {
    /// Creates a resolver over an arbitrary source.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Loads and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any required field is absent or
    /// malformed, if a stage names an unknown environment, or if two stages
    /// target the same (account, region, name) tuple.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let document = self.source.load()?;

        let app_name = document
            .app_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingAppName)?
            .to_string();

        let organization_id = document
            .organization
            .as_ref()
            .and_then(|o| o.id.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingOrganization)?
            .to_string();

        let tools_section = document.env.get(TOOLS_ENVIRONMENT).ok_or_else(|| {
            ConfigError::MissingField {
                environment: TOOLS_ENVIRONMENT.to_string(),
                field: "account",
            }
        })?;
        let tools = descriptor(TOOLS_ENVIRONMENT, tools_section)?;

        if document.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }

        let mut environments = Vec::with_capacity(document.stages.len());
        let mut seen = HashSet::new();
        for name in &document.stages {
            let section = document
                .env
                .get(name)
                .filter(|_| name != TOOLS_ENVIRONMENT)
                .ok_or_else(|| ConfigError::UnknownEnvironment { name: name.clone() })?;
            let env = descriptor(name, section)?;

            if !seen.insert((env.account.clone(), env.region.clone(), env.name.clone())) {
                return Err(ConfigError::DuplicateTarget {
                    name: env.name,
                    account: env.account,
                    region: env.region,
                });
            }
            environments.push(env);
        }

        let names: Vec<&str> = environments.iter().map(|e| e.name.as_str()).collect();
        let mut gate_policy = GatePolicy::new();
        for (index, name) in names.iter().enumerate() {
            let section = &document.env[*name];
            if section.approval_required {
                let gate = section
                    .gate_name
                    .clone()
                    .unwrap_or_else(|| default_gate_name(&names, index));
                debug!(stage = %name, gate = %gate, "Approval gate configured");
                gate_policy = gate_policy.after_stage_named(*name, gate);
            }
        }

        info!(
            app = %app_name,
            stages = environments.len(),
            gates = gate_policy.len(),
            "Configuration resolved"
        );

        Ok(ResolvedConfig {
            repository: app_name.to_lowercase(),
            app_name,
            organization_id,
            tools,
            environments,
            gate_policy,
        })
    }
}

// A pattern that fails to compile matches nothing, so every value is
// reported as malformed instead of panicking.
fn account_pattern() -> Option<&'static regex::Regex> {
    static PATTERN: OnceLock<Option<regex::Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"^\d{12}$").ok()).as_ref()
}

fn region_pattern() -> Option<&'static regex::Regex> {
    static PATTERN: OnceLock<Option<regex::Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| regex::Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d+$").ok())
        .as_ref()
}

fn descriptor(name: &str, section: &EnvironmentSection) -> Result<EnvironmentDescriptor, ConfigError> {
    let account = section
        .account
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingField {
            environment: name.to_string(),
            field: "account",
        })?;
    if !account_pattern().is_some_and(|p| p.is_match(account)) {
        return Err(ConfigError::Malformed {
            environment: name.to_string(),
            field: "account",
            value: account.to_string(),
            reason: "expected exactly 12 digits".to_string(),
        });
    }

    let region = section
        .region
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingField {
            environment: name.to_string(),
            field: "region",
        })?;
    if !region_pattern().is_some_and(|p| p.is_match(region)) {
        return Err(ConfigError::Malformed {
            environment: name.to_string(),
            field: "region",
            value: region.to_string(),
            reason: "expected a region identifier such as 'us-east-1'".to_string(),
        });
    }

    Ok(EnvironmentDescriptor::new(name, account, region))
}
