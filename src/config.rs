//! Configuration types, built from `OUTREACH_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::leader::SchedulerMode;
use crate::variation::{LlmBackend, VariationConfig};

/// Funnel step scheduler settings.
#[derive(Debug, Clone)]
pub struct FunnelSchedulerConfig {
    /// Tick period.
    pub tick_interval: Duration,
    /// Maximum immediate sends and due enrollments examined per tick.
    pub batch_size: usize,
}

impl Default for FunnelSchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            batch_size: 50,
        }
    }
}

/// Transmission scheduler settings.
#[derive(Debug, Clone)]
pub struct TransmissionSchedulerConfig {
    pub tick_interval: Duration,
    /// Maximum dispatches per transmission per tick (only reached when the
    /// jitter gap is zero).
    pub batch_size: usize,
}

impl Default for TransmissionSchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            batch_size: 25,
        }
    }
}

/// Send attempt settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Outer limit on a send; for SMTP, the per-operation socket timeout.
    pub send_timeout: Duration,
    /// Attempts per funnel step, recipient or immediate send before it fails.
    pub max_attempts: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Scheduler lease settings.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub lease_name: String,
    pub lease_ttl: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_name: "outreach-schedulers".to_string(),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Directory for daily-rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// Read once at startup.
    pub scheduler_mode: SchedulerMode,
    pub funnel: FunnelSchedulerConfig,
    pub transmission: TransmissionSchedulerConfig,
    pub delivery: DeliveryConfig,
    pub leader: LeaderConfig,
    /// Copy variation; `None` when no LLM API key is configured.
    pub variation: Option<VariationConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/outreach.db"),
            log_dir: None,
            scheduler_mode: SchedulerMode::Leader,
            funnel: FunnelSchedulerConfig::default(),
            transmission: TransmissionSchedulerConfig::default(),
            delivery: DeliveryConfig::default(),
            leader: LeaderConfig::default(),
            variation: None,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset or empty keys take
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let db_path = get("OUTREACH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let log_dir = get("OUTREACH_LOG_DIR").map(PathBuf::from);

        let scheduler_mode = parse_or(&get, "OUTREACH_SCHEDULER_MODE", defaults.scheduler_mode)?;

        let funnel = FunnelSchedulerConfig {
            tick_interval: secs_or(&get, "OUTREACH_FUNNEL_TICK_SECS", defaults.funnel.tick_interval)?,
            batch_size: positive(
                "OUTREACH_FUNNEL_BATCH_SIZE",
                parse_or(&get, "OUTREACH_FUNNEL_BATCH_SIZE", defaults.funnel.batch_size)?,
            )?,
        };

        let transmission = TransmissionSchedulerConfig {
            tick_interval: secs_or(
                &get,
                "OUTREACH_TRANSMISSION_TICK_SECS",
                defaults.transmission.tick_interval,
            )?,
            batch_size: positive(
                "OUTREACH_TRANSMISSION_BATCH_SIZE",
                parse_or(
                    &get,
                    "OUTREACH_TRANSMISSION_BATCH_SIZE",
                    defaults.transmission.batch_size,
                )?,
            )?,
        };

        let delivery = DeliveryConfig {
            send_timeout: secs_or(&get, "OUTREACH_SEND_TIMEOUT_SECS", defaults.delivery.send_timeout)?,
            max_attempts: positive(
                "OUTREACH_MAX_ATTEMPTS",
                parse_or(&get, "OUTREACH_MAX_ATTEMPTS", defaults.delivery.max_attempts)?,
            )?,
        };

        let lease_ttl = secs_or(&get, "OUTREACH_LEASE_TTL_SECS", defaults.leader.lease_ttl)?;
        if lease_ttl < Duration::from_secs(3) {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_LEASE_TTL_SECS".into(),
                message: "must be at least 3 seconds".into(),
            });
        }
        let leader = LeaderConfig {
            lease_name: get("OUTREACH_LEASE_NAME").unwrap_or(defaults.leader.lease_name),
            lease_ttl,
        };

        let variation = match get("OUTREACH_LLM_API_KEY") {
            None => None,
            Some(key) => {
                let backend: LlmBackend = parse_or(&get, "OUTREACH_LLM_BACKEND", LlmBackend::Anthropic)?;
                let model = get("OUTREACH_LLM_MODEL").unwrap_or_else(|| default_model(backend).to_string());
                Some(VariationConfig {
                    backend,
                    api_key: SecretString::from(key),
                    model,
                    timeout: secs_or(&get, "OUTREACH_VARIATION_TIMEOUT_SECS", Duration::from_secs(20))?,
                })
            }
        };

        Ok(Self {
            db_path,
            log_dir,
            scheduler_mode,
            funnel,
            transmission,
            delivery,
            leader,
            variation,
        })
    }
}

fn default_model(backend: LlmBackend) -> &'static str {
    match backend {
        LlmBackend::Anthropic => "claude-3-5-haiku-latest",
        LlmBackend::OpenAi => "gpt-4o-mini",
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

/// Whole seconds, at least one.
fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs: u64 = positive(key, parse_or(get, key, default.as_secs())?)?;
    Ok(Duration::from_secs(secs))
}

fn positive<T>(key: &str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        })
    }
}
