use secrecy::SecretString;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::Level;

/// API version used for the legacy realtime endpoint when none is configured.
pub const DEFAULT_REALTIME_API_VERSION: &str = "2024-10-01-preview";
/// API version used for the Voice Live endpoint when none is configured.
pub const DEFAULT_VOICE_LIVE_API_VERSION: &str = "2025-05-01-preview";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// The upstream realtime API a relay session connects to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// The Azure OpenAI `/openai/realtime` endpoint.
    Realtime,
    /// The Azure AI `/voice-live/realtime` endpoint.
    VoiceLive,
}

impl Backend {
    pub fn default_api_version(self) -> &'static str {
        match self {
            Backend::Realtime => DEFAULT_REALTIME_API_VERSION,
            Backend::VoiceLive => DEFAULT_VOICE_LIVE_API_VERSION,
        }
    }
}

/// Credential material for upstream authentication.
#[derive(Debug)]
pub enum Credential {
    /// A pre-shared key sent as the `api-key` header.
    ApiKey(SecretString),
    /// A Microsoft Entra service principal used to obtain bearer tokens.
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: SecretString,
    },
}

/// Session fields the server enforces on every relay session.
///
/// Any field that is set overrides whatever the client asks for in its
/// `session.update`; unset fields leave the client's value alone.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    /// The deployment or model name the upstream connection targets.
    pub model: Option<String>,
    pub system_message: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub disable_audio: Option<bool>,
    pub voice_choice: Option<String>,
    pub api_version: String,
    pub backend: Backend,
}

impl ServerConfig {
    /// A configuration that pins nothing but the backend.
    pub fn new(backend: Backend) -> Self {
        Self {
            model: None,
            system_message: None,
            temperature: None,
            max_tokens: None,
            disable_audio: None,
            voice_choice: None,
            api_version: backend.default_api_version().to_string(),
            backend,
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub relay_path: String,
    pub backend: Backend,
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    pub credential: Credential,
    pub voice_choice: Option<String>,
    pub system_message: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub disable_audio: Option<bool>,
    pub mcp_server_command: Option<Vec<String>>,
    pub client_visible_tools: HashSet<String>,
    pub log_level: Level,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &str) -> Result<String, ConfigError> {
    var(name).ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn parsed<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
        })
        .transpose()
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8765".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let relay_path = var("RELAY_PATH").unwrap_or_else(|| "/realtime".to_string());
        if !relay_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(
                "RELAY_PATH".to_string(),
                format!("'{}' must start with '/'", relay_path),
            ));
        }

        let backend_str = var("REALTIME_BACKEND").unwrap_or_else(|| "realtime".to_string());
        let backend = match backend_str.to_lowercase().as_str() {
            "realtime" | "openai" => Backend::Realtime,
            "voice-live" | "voice_live" | "voicelive" => Backend::VoiceLive,
            other => {
                return Err(ConfigError::InvalidValue(
                    "REALTIME_BACKEND".to_string(),
                    format!("'{}' is not a known backend", other),
                ));
            }
        };

        let voice_live = backend == Backend::VoiceLive;
        let endpoint = voice_live
            .then(|| var("AZURE_VOICE_LIVE_ENDPOINT"))
            .flatten()
            .map_or_else(|| required("AZURE_OPENAI_ENDPOINT"), Ok)?;
        let deployment = voice_live
            .then(|| var("AZURE_VOICE_LIVE_MODEL"))
            .flatten()
            .or_else(|| var("AZURE_OPENAI_REALTIME_DEPLOYMENT"))
            .unwrap_or_else(|| "gpt-4o-realtime-preview".to_string());
        let api_version = var("AZURE_OPENAI_API_VERSION")
            .unwrap_or_else(|| backend.default_api_version().to_string());

        let api_key = voice_live
            .then(|| var("AZURE_VOICE_LIVE_API_KEY"))
            .flatten()
            .or_else(|| var("AZURE_OPENAI_API_KEY"));
        let credential = match api_key {
            Some(key) => Credential::ApiKey(SecretString::from(key)),
            None => Credential::ClientSecret {
                tenant_id: required("AZURE_TENANT_ID")?,
                client_id: required("AZURE_CLIENT_ID")?,
                client_secret: SecretString::from(required("AZURE_CLIENT_SECRET").map_err(
                    |_| {
                        ConfigError::MissingVar(
                            "AZURE_OPENAI_API_KEY or AZURE_CLIENT_SECRET".to_string(),
                        )
                    },
                )?),
            },
        };

        let mcp_server_command = var("MCP_SERVER_COMMAND")
            .map(|cmd| cmd.split_whitespace().map(str::to_string).collect());
        let client_visible_tools = var("CLIENT_VISIBLE_TOOLS")
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            relay_path,
            backend,
            endpoint,
            deployment,
            api_version,
            credential,
            voice_choice: var("AZURE_OPENAI_REALTIME_VOICE_CHOICE"),
            system_message: var("SYSTEM_MESSAGE"),
            temperature: parsed("TEMPERATURE")?,
            max_tokens: parsed("MAX_RESPONSE_OUTPUT_TOKENS")?,
            disable_audio: parsed("DISABLE_AUDIO")?,
            mcp_server_command,
            client_visible_tools,
            log_level,
        })
    }

    /// The server-enforced session configuration derived from this config.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            model: Some(self.deployment.clone()),
            system_message: self.system_message.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            disable_audio: self.disable_audio,
            voice_choice: self.voice_choice.clone(),
            api_version: self.api_version.clone(),
            backend: self.backend,
        }
    }
}
