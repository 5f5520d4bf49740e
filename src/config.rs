//! YAML configuration file and CLI merge
//!
//! Both subcommands read the same file; each only looks at its own section.
//! Values given on the command line (or via `SSHGATE_*` variables) win over
//! the file, which wins over built-in defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sshgate_agent::{AgentConfig, ReconnectConfig};
use sshgate_control::BrokerConfig;
use sshgate_relay::RelayConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelayFileSection,

    #[serde(default)]
    pub agent: AgentFileSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelayFileSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_bind: Option<SocketAddr>,

    /// Environment variable holding the shared secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,

    /// Direct shared secret (prefer using auth_token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_path: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_attempt_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_window_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentFileSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Relay control endpoint (host:port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_secs: Option<u64>,

    /// 0 = unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<usize>,
}

/// Relay settings collected from the command line
#[derive(Debug, Default, Clone)]
pub struct RelayOverrides {
    pub ssh_bind: Option<SocketAddr>,
    pub control_bind: Option<SocketAddr>,
    pub auth_token: Option<String>,
    pub no_direct_path: bool,
}

/// Agent settings collected from the command line
#[derive(Debug, Default, Clone)]
pub struct AgentOverrides {
    pub agent_id: Option<String>,
    pub relay: Option<String>,
    pub auth_token: Option<String>,
    pub backend_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub max_reconnect_attempts: Option<usize>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&contents).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    Ok(serde_yaml::from_str(contents)?)
}

/// Resolve a secret given directly or through an environment variable
fn resolve_token(direct: Option<String>, env_var: Option<&str>) -> Result<Option<String>> {
    if let Some(env_var) = env_var {
        let value = std::env::var(env_var)
            .with_context(|| format!("Environment variable {} not set", env_var))?;
        return Ok(Some(value));
    }
    Ok(direct)
}

/// Merge CLI overrides with the file's relay section
pub fn build_relay_config(cli: RelayOverrides, file: RelayFileSection) -> Result<RelayConfig> {
    let defaults = RelayConfig::default();
    let broker_defaults = BrokerConfig::default();

    let file_token = resolve_token(file.auth_token, file.auth_token_env.as_deref())?;
    let auth_token = cli.auth_token.or(file_token).unwrap_or_default();
    if auth_token.is_empty() {
        anyhow::bail!(
            "Auth token is required (use --auth-token, SSHGATE_AUTH_TOKEN, or config file)"
        );
    }

    let direct_path_enabled = !cli.no_direct_path && file.direct_path.unwrap_or(true);

    Ok(RelayConfig {
        ssh_bind: cli.ssh_bind.or(file.ssh_bind).unwrap_or(defaults.ssh_bind),
        control_bind: cli
            .control_bind
            .or(file.control_bind)
            .unwrap_or(defaults.control_bind),
        auth_token,
        broker: BrokerConfig {
            direct_path_enabled,
            direct_attempt_timeout: file
                .direct_attempt_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(broker_defaults.direct_attempt_timeout),
            liveness_window: file
                .liveness_window_secs
                .map(Duration::from_secs)
                .unwrap_or(broker_defaults.liveness_window),
            ..broker_defaults
        },
        ..defaults
    })
}

/// Merge CLI overrides with the file's agent section
pub fn build_agent_config(cli: AgentOverrides, file: AgentFileSection) -> Result<AgentConfig> {
    let defaults = AgentConfig::default();

    let file_token = resolve_token(file.auth_token, file.auth_token_env.as_deref())?;
    let auth_token = cli.auth_token.or(file_token).unwrap_or_default();
    if auth_token.is_empty() {
        anyhow::bail!(
            "Auth token is required (use --auth-token, SSHGATE_AUTH_TOKEN, or config file)"
        );
    }

    let relay_addr = cli.relay.or(file.relay).unwrap_or(defaults.relay_addr);
    validate_address(&relay_addr, "relay")?;

    let agent_id = cli.agent_id.or(file.id).unwrap_or_else(|| {
        let id = format!("agent-{}", uuid::Uuid::new_v4());
        info!("Auto-generated agent ID: {}", id);
        id
    });

    let max_attempts = match cli.max_reconnect_attempts.or(file.max_reconnect_attempts) {
        Some(0) => None,
        Some(n) => Some(n),
        None => defaults.reconnect.max_attempts,
    };

    Ok(AgentConfig {
        agent_id,
        relay_addr,
        auth_token,
        backend_host: cli
            .backend_host
            .or(file.backend_host)
            .unwrap_or(defaults.backend_host),
        ssh_port: cli.ssh_port.or(file.ssh_port).unwrap_or(defaults.ssh_port),
        heartbeat_interval: file
            .heartbeat_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval),
        reconnect: ReconnectConfig {
            max_attempts,
            ..defaults.reconnect
        },
        ..defaults
    })
}

/// Validate address format (should be host:port)
pub fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("relay.example.com:3000", "relay").is_ok());
        assert!(validate_address("localhost:3000", "relay").is_ok());
        assert!(validate_address("203.0.113.5:3000", "relay").is_ok());

        assert!(validate_address("relay.example.com", "relay").is_err());
        assert!(validate_address("relay.example.com:", "relay").is_err());
        assert!(validate_address("relay.example.com:abc", "relay").is_err());
        assert!(validate_address(":3000", "relay").is_err());
        assert!(validate_address("", "relay").is_err());
    }

    #[test]
    fn test_parse_full_file() {
        let file = parse_config(
            r#"
relay:
  ssh_bind: 0.0.0.0:2222
  control_bind: 0.0.0.0:3001
  auth_token: relay-secret
  direct_path: false
  direct_attempt_timeout_ms: 500
  liveness_window_secs: 60
agent:
  id: office
  relay: relay.example.com:3001
  auth_token: agent-secret
  backend_host: 10.0.0.5
  ssh_port: 2200
  heartbeat_secs: 5
  max_reconnect_attempts: 0
"#,
        )
        .unwrap();

        let relay = build_relay_config(RelayOverrides::default(), file.relay).unwrap();
        assert_eq!(relay.ssh_bind, "0.0.0.0:2222".parse().unwrap());
        assert_eq!(relay.control_bind, "0.0.0.0:3001".parse().unwrap());
        assert_eq!(relay.auth_token, "relay-secret");
        assert!(!relay.broker.direct_path_enabled);
        assert_eq!(relay.broker.direct_attempt_timeout, Duration::from_millis(500));
        assert_eq!(relay.broker.liveness_window, Duration::from_secs(60));

        let agent = build_agent_config(AgentOverrides::default(), file.agent).unwrap();
        assert_eq!(agent.agent_id, "office");
        assert_eq!(agent.relay_addr, "relay.example.com:3001");
        assert_eq!(agent.backend_addr(), "10.0.0.5:2200");
        assert_eq!(agent.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(agent.reconnect.max_attempts, None);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = parse_config("").unwrap();
        let cli = RelayOverrides {
            auth_token: Some("secret".to_string()),
            ..Default::default()
        };
        let relay = build_relay_config(cli, file.relay).unwrap();
        assert_eq!(relay.ssh_bind.port(), 22);
        assert_eq!(relay.control_bind.port(), 3000);
        assert!(relay.broker.direct_path_enabled);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = parse_config(
            r#"
agent:
  id: from-file
  relay: file.example.com:3000
  auth_token: file-secret
  ssh_port: 2200
"#,
        )
        .unwrap();
        let cli = AgentOverrides {
            agent_id: Some("from-cli".to_string()),
            auth_token: Some("cli-secret".to_string()),
            max_reconnect_attempts: Some(3),
            ..Default::default()
        };

        let agent = build_agent_config(cli, file.agent).unwrap();
        assert_eq!(agent.agent_id, "from-cli");
        assert_eq!(agent.auth_token, "cli-secret");
        assert_eq!(agent.relay_addr, "file.example.com:3000");
        assert_eq!(agent.ssh_port, 2200);
        assert_eq!(agent.reconnect.max_attempts, Some(3));
    }

    #[test]
    fn test_missing_token_is_an_error() {
        assert!(build_relay_config(RelayOverrides::default(), RelayFileSection::default()).is_err());
        assert!(build_agent_config(AgentOverrides::default(), AgentFileSection::default()).is_err());
    }

    #[test]
    fn test_no_direct_path_flag_wins() {
        let file = RelayFileSection {
            auth_token: Some("secret".to_string()),
            direct_path: Some(true),
            ..Default::default()
        };
        let cli = RelayOverrides {
            no_direct_path: true,
            ..Default::default()
        };
        let relay = build_relay_config(cli, file).unwrap();
        assert!(!relay.broker.direct_path_enabled);
    }

    #[test]
    fn test_agent_generates_id_and_keeps_default_backoff() {
        let cli = AgentOverrides {
            auth_token: Some("secret".to_string()),
            ..Default::default()
        };
        let agent = build_agent_config(cli, AgentFileSection::default()).unwrap();
        assert!(agent.agent_id.starts_with("agent-"));
        assert_eq!(agent.relay_addr, "localhost:3000");
        assert_eq!(agent.reconnect.max_attempts, Some(10));
    }
}
