use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mobox_agent_events::Framework;
use mobox_error::MoboxError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const MANIFEST_FILE: &str = "agent.yaml";

/// Secrets an agent may ask to have forwarded from the server environment.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GOOGLE_API_KEY",
    "GEMINI_API_KEY",
    "MISTRAL_API_KEY",
    "COHERE_API_KEY",
    "HUGGINGFACE_API_KEY",
    "GROQ_API_KEY",
    "TAVILY_API_KEY",
];

fn default_framework() -> String {
    Framework::Claude.as_str().to_string()
}

fn default_command() -> Vec<String> {
    vec!["python".to_string(), "run_agent.py".to_string()]
}

fn default_timeout() -> u64 {
    600
}

fn default_idle_timeout() -> u64 {
    120
}

/// Contents of `<agents_dir>/<id>/agent.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub struct AgentManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_framework")]
    pub framework: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default = "default_command", alias = "entrypoint")]
    pub command: Vec<String>,
    #[serde(default)]
    pub env_vars: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

/// A loaded, validated agent.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub framework: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub env_vars: Vec<String>,
    #[serde(skip)]
    #[schemars(skip)]
    pub command: Vec<String>,
    #[serde(skip)]
    #[schemars(skip)]
    pub dir: PathBuf,
    pub timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl AgentInfo {
    pub fn framework(&self) -> Result<Framework, MoboxError> {
        self.framework
            .parse::<Framework>()
            .map_err(MoboxError::from)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Resolves requested secrets against the allow-list and `lookup`.
    pub fn resolve_env<F>(&self, lookup: F) -> Result<HashMap<String, String>, MoboxError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = HashMap::new();
        for var in &self.env_vars {
            if !ALLOWED_ENV_VARS.contains(&var.as_str()) {
                tracing::warn!(agent = %self.id, var = %var, "env var not in allow-list, skipping");
                continue;
            }
            match lookup(var) {
                Some(value) if !value.is_empty() => {
                    env.insert(var.clone(), value);
                }
                _ => tracing::warn!(agent = %self.id, var = %var, "env var not set on server"),
            }
        }
        if !self.env_vars.is_empty() && env.is_empty() {
            tracing::error!(agent = %self.id, required = ?self.env_vars, "no credentials resolved for agent");
            return Err(MoboxError::MissingCredentials {
                agent: self.id.clone(),
                required: self.env_vars.clone(),
            });
        }
        Ok(env)
    }

    fn from_manifest(id: &str, dir: PathBuf, manifest: AgentManifest) -> Result<Self, MoboxError> {
        let misconfigured = |message: String| MoboxError::AgentMisconfigured {
            agent: id.to_string(),
            message,
        };
        if manifest.command.is_empty() || manifest.command.iter().any(|part| part.is_empty()) {
            return Err(misconfigured("command must be a non-empty list".to_string()));
        }
        if manifest.framework.parse::<Framework>().is_err() {
            return Err(misconfigured(format!(
                "unsupported framework '{}'",
                manifest.framework
            )));
        }
        Ok(Self {
            id: id.to_string(),
            name: if manifest.name.is_empty() {
                id.to_string()
            } else {
                manifest.name
            },
            description: manifest.description,
            framework: manifest.framework,
            image: manifest.image,
            env_vars: manifest.env_vars,
            command: manifest.command,
            dir,
            timeout_secs: manifest.timeout,
            idle_timeout_secs: manifest.idle_timeout,
        })
    }
}

/// Directory of agent definitions, one subdirectory per agent.
#[derive(Debug, Clone)]
pub struct AgentCatalog {
    dir: PathBuf,
}

impl AgentCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn load(&self, agent_id: &str) -> Result<AgentInfo, MoboxError> {
        if agent_id.is_empty()
            || agent_id.contains(['/', '\\'])
            || agent_id.starts_with('.')
        {
            return Err(MoboxError::AgentNotFound {
                agent: agent_id.to_string(),
            });
        }
        let agent_dir = self.dir.join(agent_id);
        let raw = match tokio::fs::read_to_string(agent_dir.join(MANIFEST_FILE)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(MoboxError::AgentNotFound {
                    agent: agent_id.to_string(),
                })
            }
            Err(err) => {
                return Err(MoboxError::AgentMisconfigured {
                    agent: agent_id.to_string(),
                    message: err.to_string(),
                })
            }
        };
        let manifest: AgentManifest =
            serde_yaml::from_str(&raw).map_err(|err| MoboxError::AgentMisconfigured {
                agent: agent_id.to_string(),
                message: format!("invalid {MANIFEST_FILE}: {err}"),
            })?;
        AgentInfo::from_manifest(agent_id, agent_dir, manifest)
    }

    /// All loadable agents sorted by name. Broken manifests are logged and skipped.
    pub async fn list(&self) -> Result<Vec<AgentInfo>, MoboxError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(dir = %self.dir.display(), "agents directory does not exist");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(MoboxError::StreamError {
                    message: format!("failed to read agents directory: {err}"),
                })
            }
        };
        let mut agents = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if id.starts_with('.') {
                continue;
            }
            match self.load(&id).await {
                Ok(agent) => agents.push(agent),
                Err(MoboxError::AgentNotFound { .. }) => {}
                Err(err) => tracing::warn!(agent = %id, error = %err, "skipping agent"),
            }
        }
        agents.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(agents)
    }
}
