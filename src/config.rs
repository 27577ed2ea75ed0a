use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub telephony: TelephonyConfig,
    pub rooms: RoomsConfig,
    pub notify: NotifyConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelephonyConfig {
    /// Shared secret webhook signatures are computed with.
    pub webhook_secret: String,
    /// Bounded total wait for the episode record on admission.
    pub admit_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomsConfig {
    pub token_secret: String,
    pub token_ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// NATS server for the session notifier; absent disables publication.
    pub nats_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    pub alert_after_failures: u32,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "openair-studio".to_string(),
                http: HttpConfig {
                    bind: "127.0.0.1".to_string(),
                    port: 8080,
                },
            },
            telephony: TelephonyConfig {
                webhook_secret: "change-me".to_string(),
                admit_timeout_secs: 5,
            },
            rooms: RoomsConfig {
                token_secret: "change-me-too".to_string(),
                token_ttl_secs: 300,
            },
            notify: NotifyConfig {
                nats_url: Some("nats://localhost:4222".to_string()),
            },
            reconcile: ReconcileConfig {
                interval_secs: 5,
                alert_after_failures: 3,
            },
        }
    }
}
