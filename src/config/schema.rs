use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level omnihub configuration, loaded from `omnihub.toml`.
///
/// The `[[instances]]` array is the tenant registry: one entry per
/// channel+agent pairing. The management layer that normally maintains this
/// registry lives outside this process; omnihub only reads it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Webhook ingress server settings (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Message trace persistence settings (`[tracing]`).
    #[serde(default)]
    pub tracing: TracingConfig,

    /// Tenant instances (`[[instances]]`).
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up an instance by name.
    pub fn instance(&self, name: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|i| i.name == name)
    }

    fn validate(&self) -> Result<()> {
        for instance in &self.instances {
            if instance.name.trim().is_empty() {
                anyhow::bail!("instance with empty name in config");
            }
            match instance.channel_type {
                ChannelKind::Whatsapp => {
                    if instance.evolution_url.is_none() || instance.evolution_key.is_none() {
                        anyhow::bail!(
                            "whatsapp instance '{}' requires evolution_url and evolution_key",
                            instance.name
                        );
                    }
                }
                ChannelKind::Discord => {
                    if instance.discord_bot_token.is_none() {
                        anyhow::bail!(
                            "discord instance '{}' requires discord_bot_token",
                            instance.name
                        );
                    }
                }
            }
        }
        let mut names: Vec<&str> = self.instances.iter().map(|i| i.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.instances.len() {
            anyhow::bail!("duplicate instance names in config");
        }
        Ok(())
    }
}

/// Webhook ingress server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Directory for per-bot IPC sockets. Defaults to the system temp dir.
    #[serde(default)]
    pub ipc_dir: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn ipc_dir(&self) -> PathBuf {
        self.ipc_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            ipc_dir: None,
        }
    }
}

fn default_gateway_host() -> String {
    "0.0.0.0".into()
}

fn default_gateway_port() -> u16 {
    8882
}

/// Message trace persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Disable to skip all trace writes; message processing is unaffected.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite database file holding traces and local user identities.
    #[serde(default = "default_trace_db_path")]
    pub db_path: PathBuf,
    /// Stage payloads larger than this are stored as a truncation marker.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Traces older than this many days are removed by the retention sweep.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_trace_db_path(),
            max_payload_bytes: default_max_payload_bytes(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_trace_db_path() -> PathBuf {
    PathBuf::from("omnihub.db")
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_retention_days() -> u32 {
    30
}

// ── Tenant instances ──────────────────────────────────────────────

/// Channel a tenant instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Whatsapp,
    Discord,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Whatsapp => "whatsapp",
            ChannelKind::Discord => "discord",
        }
    }
}

/// One configured channel+agent pairing with isolated credentials.
///
/// Treated as an immutable snapshot per message; the core never writes it
/// back. The cached agent-side user id lives in the local user table, not
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub channel_type: ChannelKind,

    // Evolution bridge (WhatsApp instances)
    pub evolution_url: Option<String>,
    pub evolution_key: Option<String>,
    /// Evolution-side instance name when it differs from `name`.
    pub whatsapp_instance: Option<String>,

    // Discord instances
    pub discord_bot_token: Option<String>,
    pub discord_client_id: Option<String>,
    pub discord_guild_id: Option<String>,
    pub discord_default_channel_id: Option<String>,

    /// Agent backend for this tenant.
    pub agent: AgentBackend,

    /// Split replies on blank lines before sending (WhatsApp pacing,
    /// Discord chunk-boundary preference).
    #[serde(default = "default_true")]
    pub enable_auto_split: bool,

    /// Country code prepended to short phone numbers during recipient
    /// normalization. Locale-dependent, so a config knob rather than a
    /// constant.
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            channel_type: ChannelKind::Whatsapp,
            evolution_url: None,
            evolution_key: None,
            whatsapp_instance: None,
            discord_bot_token: None,
            discord_client_id: None,
            discord_guild_id: None,
            discord_default_channel_id: None,
            agent: AgentBackend::default(),
            enable_auto_split: true,
            default_country_code: default_country_code(),
        }
    }
}

impl InstanceConfig {
    /// Evolution-side instance name used in bridge URL paths.
    pub fn evolution_instance(&self) -> &str {
        self.whatsapp_instance.as_deref().unwrap_or(&self.name)
    }
}

fn default_country_code() -> String {
    "55".into()
}

/// Agent backend selection for one tenant.
///
/// One variant per protocol family; adding a backend is a new variant with
/// its own normalization, not a string comparison at call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "instance_type", rename_all = "lowercase")]
pub enum AgentBackend {
    /// Automagik agents API: synchronous JSON REST.
    Automagik {
        api_url: String,
        api_key: String,
        #[serde(default = "default_agent_id")]
        agent_id: String,
        #[serde(default = "default_agent_timeout_secs")]
        timeout_secs: u64,
    },
    /// Hive agents API: same REST surface, optional chunked streaming.
    Hive {
        api_url: String,
        api_key: String,
        #[serde(default = "default_agent_id")]
        agent_id: String,
        #[serde(default = "default_agent_timeout_secs")]
        timeout_secs: u64,
        #[serde(default)]
        stream_mode: bool,
    },
    /// Leo workflow engine: SSE streaming protocol.
    Leo {
        api_url: String,
        workflow_id: String,
        bearer_token: String,
        subscription_key: String,
        #[serde(default = "default_leo_bpc")]
        bpc: String,
        #[serde(default = "default_leo_environment")]
        environment: String,
        #[serde(default = "default_leo_version")]
        version: String,
    },
}

impl Default for AgentBackend {
    fn default() -> Self {
        AgentBackend::Automagik {
            api_url: String::new(),
            api_key: String::new(),
            agent_id: default_agent_id(),
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

impl AgentBackend {
    /// Agent-call timeout. Leo's workflow engine sits in front of multi-step
    /// LLM generation, so it carries a longer fixed ceiling.
    pub fn timeout(&self) -> Duration {
        match self {
            AgentBackend::Automagik { timeout_secs, .. }
            | AgentBackend::Hive { timeout_secs, .. } => Duration::from_secs(*timeout_secs),
            AgentBackend::Leo { .. } => Duration::from_secs(120),
        }
    }

    /// Whether replies can be streamed progressively into a channel.
    pub fn supports_streaming(&self) -> bool {
        match self {
            AgentBackend::Automagik { .. } => false,
            AgentBackend::Hive { stream_mode, .. } => *stream_mode,
            AgentBackend::Leo { .. } => true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentBackend::Automagik { .. } => "automagik",
            AgentBackend::Hive { .. } => "hive",
            AgentBackend::Leo { .. } => "leo",
        }
    }
}

fn default_agent_id() -> String {
    "default".into()
}

fn default_agent_timeout_secs() -> u64 {
    60
}

fn default_leo_bpc() -> String {
    "20210511".into()
}

fn default_leo_environment() -> String {
    "DEV".into()
}

fn default_leo_version() -> String {
    String::new()
}
