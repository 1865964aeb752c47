//! Runtime-tunable knobs, generalized from a fixed builder struct into a typed,
//! refreshable cache so new knobs don't require touching every call site.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// One knob as it is read back after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ConfigValue {
    pub fn as_duration_secs(&self) -> Option<Duration> {
        match self {
            ConfigValue::Int(n) if *n >= 0 => Some(Duration::from_secs(*n as u64)),
            ConfigValue::Float(f) if *f >= 0.0 => Some(Duration::from_secs_f64(*f)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// A single tunable: default plus the string key it's looked up under.
struct Knob {
    default: ConfigValue,
}

/// Backs every tunable knob with a documented default and a `RwLock` so reads
/// never block writers (and vice versa) for long, mirroring the read-heavy/
/// write-rare access pattern of a typical runtime config builder.
pub struct SystemConfigCache {
    overrides: RwLock<HashMap<String, ConfigValue>>,
    defaults: HashMap<String, Knob>,
}

impl Default for SystemConfigCache {
    fn default() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert(
            "long.polling.timeout".to_string(),
            Knob { default: ConfigValue::Int(30) },
        );
        defaults.insert(
            "long.polling.max.wait".to_string(),
            Knob { default: ConfigValue::Int(60) },
        );
        defaults.insert(
            "max.subscriptions".to_string(),
            Knob { default: ConfigValue::Int(10_000) },
        );
        defaults.insert(
            "heartbeat.interval".to_string(),
            Knob { default: ConfigValue::Int(60) },
        );
        defaults.insert(
            "heartbeat.timeout".to_string(),
            Knob { default: ConfigValue::Int(300) },
        );
        Self {
            overrides: RwLock::new(HashMap::new()),
            defaults,
        }
    }
}

impl SystemConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-loads override rows at startup, replacing whatever was cached.
    pub async fn load_all(&self, rows: impl IntoIterator<Item = (String, ConfigValue)>) {
        let mut guard = self.overrides.write().await;
        guard.clear();
        guard.extend(rows);
    }

    pub async fn set(&self, key: impl Into<String>, value: ConfigValue) {
        self.overrides.write().await.insert(key.into(), value);
    }

    async fn get(&self, key: &str) -> ConfigValue {
        if let Some(v) = self.overrides.read().await.get(key) {
            return v.clone();
        }
        self.defaults
            .get(key)
            .map(|k| k.default.clone())
            .unwrap_or(ConfigValue::Int(0))
    }

    pub async fn poll_timeout(&self) -> Duration {
        self.get("long.polling.timeout")
            .await
            .as_duration_secs()
            .unwrap_or(Duration::from_secs(30))
    }

    pub async fn max_poll_wait(&self) -> Duration {
        self.get("long.polling.max.wait")
            .await
            .as_duration_secs()
            .unwrap_or(Duration::from_secs(60))
    }

    pub async fn heartbeat_timeout(&self) -> Duration {
        self.get("heartbeat.timeout")
            .await
            .as_duration_secs()
            .unwrap_or(Duration::from_secs(300))
    }

    pub async fn heartbeat_interval(&self) -> Duration {
        self.get("heartbeat.interval")
            .await
            .as_duration_secs()
            .unwrap_or(Duration::from_secs(60))
    }

    pub async fn max_subscriptions(&self) -> i64 {
        self.get("max.subscriptions").await.as_i64().unwrap_or(10_000)
    }
}
