use {
    serde::{Deserialize, Serialize},
    std::time::Duration,
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not parse the connection configuration")]
    Json(#[source] serde_json::Error),
}

/// Settings of a single [`Connection`](crate::dbus::Connection).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Label used in log messages.
    pub name: String,
    /// Deadline of calls that do not specify one. `None` disables it.
    pub default_timeout_ms: Option<u64>,
    /// Whether `Connection::start` registers with the bus via `Hello`.
    pub send_hello: bool,
    /// How long `NameOwner::release` waits for the bus to confirm.
    pub release_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "bus".to_string(),
            default_timeout_ms: Some(25_000),
            send_hello: true,
            release_timeout_ms: 5_000,
        }
    }
}

impl ConnectionConfig {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(ConfigError::Json)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::ErrorFmt};

    #[test]
    fn partial() {
        let config = ConnectionConfig::from_json(r#"{ "name": "session", "send_hello": false }"#)
            .unwrap();
        assert_eq!(config.name, "session");
        assert!(!config.send_hello);
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(25)));
        assert_eq!(config.release_timeout_ms, 5_000);
    }

    #[test]
    fn no_deadline() {
        let config = ConnectionConfig::from_json(r#"{ "default_timeout_ms": null }"#).unwrap();
        assert_eq!(config.default_timeout(), None);
    }

    #[test]
    fn unknown_field() {
        let err = ConnectionConfig::from_json(r#"{ "timeout": 1 }"#).unwrap_err();
        let msg = ErrorFmt(err).to_string();
        assert!(msg.starts_with("Could not parse the connection configuration: "));
    }
}
