/// Session configuration and debug target description

use debugprobe::ProtocolVariant;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, SessionError};

/// What is being debugged; immutable for the life of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugTarget {
    pub namespace: String,
    pub workload_name: String,
    pub resource_type: String,
    pub container_name: String,
    #[serde(default)]
    pub kubeconfig_path: Option<PathBuf>,
    /// Working directory inside the container
    pub work_dir: String,
}

impl DebugTarget {
    /// Name the editor uses for the attach session
    pub fn session_name(&self) -> String {
        format!("{}/{}", self.namespace, self.workload_name)
    }
}

/// How the debuggee is started and reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugProfile {
    pub language: String,
    pub remote_port: u16,
    /// Shell command that starts the debuggee inside the container
    pub command: String,
}

impl DebugProfile {
    pub fn variant(&self) -> Result<ProtocolVariant> {
        ProtocolVariant::for_language(&self.language).ok_or_else(|| {
            SessionError::Config(format!("no debug protocol for language {:?}", self.language))
        })
    }
}

/// Timeouts and switches for a session; every field has a default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub retry_budget_ms: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub interrupt_grace_ms: u64,
    pub detach_step_timeout_ms: u64,
    pub live_reload: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            probe_timeout_ms: 10_000,
            retry_budget_ms: 60_000,
            retry_initial_ms: 200,
            retry_max_ms: 2_000,
            interrupt_grace_ms: 3_000,
            detach_step_timeout_ms: 2_000,
            live_reload: true,
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SessionError::Config(e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    pub fn detach_step_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_step_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = SessionConfig::from_json(r#"{"probe_timeout_ms": 250, "live_reload": false}"#)
            .unwrap();
        assert_eq!(config.probe_timeout(), Duration::from_millis(250));
        assert!(!config.live_reload);
        assert_eq!(config.interrupt_grace(), Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let err = SessionConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_profile_variant() {
        let profile = DebugProfile {
            language: "java".into(),
            remote_port: 5005,
            command: "./gradlew bootRun".into(),
        };
        assert_eq!(profile.variant().unwrap(), ProtocolVariant::BinaryFramed);

        let unknown = DebugProfile { language: "cobol".into(), ..profile };
        assert!(matches!(unknown.variant(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_target_deserializes_camel_case() {
        let target: DebugTarget = serde_json::from_str(
            r#"{"namespace":"dev","workloadName":"api","resourceType":"deployment","containerName":"nocalhost-dev","workDir":"/home/nocalhost-dev"}"#,
        )
        .unwrap();
        assert_eq!(target.session_name(), "dev/api");
        assert_eq!(target.kubeconfig_path, None);
    }
}
