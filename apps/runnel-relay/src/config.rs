use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// SQLite URL (e.g. `sqlite:///var/lib/runnel/relay.db?mode=rwc`).
    /// Unset means the relay runs on in-memory state.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Shared bearer token the chat front-end must present. Unset disables
    /// the front-end gate (development only).
    #[serde(default)]
    pub api_token: Option<String>,
    /// Platform identity seeded as administrator.
    #[serde(default)]
    pub admin_user_id: Option<String>,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_machine_stale")]
    pub machine_stale_secs: u64,
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
            .unwrap_or_else(|_| {
                AppConfig {
                    bind_addr: default_bind_addr(),
                    database_url: None,
                    api_token: None,
                    admin_user_id: None,
                    dispatch_timeout_secs: default_dispatch_timeout(),
                    execution_timeout_secs: default_execution_timeout(),
                    machine_stale_secs: default_machine_stale(),
                    watchdog_interval_secs: default_watchdog_interval(),
                }
                .normalize()
            })
    }

    fn normalize(mut self) -> Self {
        self.database_url = Self::normalize_opt(self.database_url.take());
        self.api_token = Self::normalize_opt(self.api_token.take());
        self.admin_user_id = Self::normalize_opt(self.admin_user_id.take());
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_dispatch_timeout() -> u64 {
    900
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_machine_stale() -> u64 {
    300
}

fn default_watchdog_interval() -> u64 {
    30
}
