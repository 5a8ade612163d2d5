// ABOUTME: Runtime template registry resolving runtime names to immutable templates
// ABOUTME: Loads the builtin catalog from config/templates.json or a caller-supplied catalog

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read templates file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse templates config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Duplicate template name: {0}")]
    Duplicate(String),
    #[error("Invalid port spec '{0}', expected <port>/<tcp|udp>")]
    InvalidPort(String),
}

type Result<T> = std::result::Result<T, TemplateError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

/// A container port exposed by a template, written as `3000/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec {
    pub port: u16,
    pub protocol: PortProtocol,
}

impl FromStr for PortSpec {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TemplateError::InvalidPort(s.to_string());
        let (port, protocol) = match s.split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (s, "tcp"),
        };

        let port = port.trim().parse::<u16>().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        let protocol = match protocol.trim().to_lowercase().as_str() {
            "tcp" => PortProtocol::Tcp,
            "udp" => PortProtocol::Udp,
            _ => return Err(invalid()),
        };

        Ok(Self { port, protocol })
    }
}

impl TryFrom<String> for PortSpec {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PortSpec> for String {
    fn from(spec: PortSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.port, proto)
    }
}

/// Immutable description of how to provision a sandbox for one runtime.
///
/// Required fields default to empty when absent from a catalog so that an
/// incomplete template still loads and is rejected when a sandbox is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeTemplate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_ref: String,
    #[serde(default)]
    pub default_cmd: Vec<String>,
    #[serde(default)]
    pub exposed_ports: BTreeSet<PortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub working_dir: String,
}

impl RuntimeTemplate {
    pub fn new(
        name: impl Into<String>,
        image_ref: impl Into<String>,
        working_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            image_ref: image_ref.into(),
            default_cmd: Vec::new(),
            exposed_ports: BTreeSet::new(),
            user: None,
            working_dir: working_dir.into(),
        }
    }

    pub fn with_default_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: PortSpec) -> Self {
        self.exposed_ports.insert(port);
        self
    }

    /// Check the fields a sandbox cannot be provisioned without.
    pub fn validate(&self) -> std::result::Result<(), SandboxError> {
        let invalid = |reason: &str| SandboxError::TemplateInvalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is required"));
        }
        if self.image_ref.trim().is_empty() {
            return Err(invalid("image_ref is required"));
        }
        if self.image_ref.chars().any(char::is_whitespace) {
            return Err(invalid("image_ref must not contain whitespace"));
        }
        if self.working_dir.trim().is_empty() {
            return Err(invalid("working_dir is required"));
        }
        if !self.working_dir.starts_with('/') {
            return Err(invalid("working_dir must be an absolute path"));
        }
        if self.default_cmd.iter().any(|arg| arg.is_empty()) {
            return Err(invalid("default_cmd must not contain empty arguments"));
        }
        if matches!(&self.user, Some(user) if user.trim().is_empty()) {
            return Err(invalid("user must not be blank when set"));
        }

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TemplatesConfig {
    version: String,
    templates: Vec<RuntimeTemplate>,
}

/// Read-only lookup table of runtime templates, built once at startup.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<RuntimeTemplate>>,
}

impl TemplateRegistry {
    /// Create a registry from the builtin catalog
    pub fn new() -> Result<Self> {
        Self::from_json(include_str!("../config/templates.json"))
    }

    /// Create a registry from a JSON catalog of the same shape as the builtin one
    pub fn from_json(config_json: &str) -> Result<Self> {
        let config: TemplatesConfig = serde_json::from_str(config_json)?;
        debug!(
            "Loaded templates config version {} with {} template(s)",
            config.version,
            config.templates.len()
        );
        Self::from_templates(config.templates)
    }

    /// Create a registry from a JSON catalog on disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading runtime templates from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_templates(templates: impl IntoIterator<Item = RuntimeTemplate>) -> Result<Self> {
        let mut map = HashMap::new();
        for template in templates {
            if map.contains_key(&template.name) {
                return Err(TemplateError::Duplicate(template.name));
            }
            map.insert(template.name.clone(), Arc::new(template));
        }
        Ok(Self { templates: map })
    }

    /// Resolve a runtime name to its template
    pub fn resolve(&self, name: &str) -> std::result::Result<Arc<RuntimeTemplate>, SandboxError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownTemplate(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&RuntimeTemplate> {
        self.templates.get(name).map(|t| t.as_ref())
    }

    /// List all templates sorted by name
    pub fn list(&self) -> Vec<&RuntimeTemplate> {
        let mut templates: Vec<_> = self.templates.values().map(|t| t.as_ref()).collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        templates
    }

    pub fn exists(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
