use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use macpool_core::{
    mac::{MacError, MacRange},
    LEADER_ELECTION_ID,
};
use thiserror::Error;

use crate::{leadership::elector::ElectorConfig, server::TlsConfig, sweeper::SweeperConfig};

pub const RANGE_START_ENV: &str = "RANGE_START";
pub const RANGE_END_ENV: &str = "RANGE_END";
pub const WAIT_TIME_ENV: &str = "WAIT_TIME";
pub const SWEEP_INTERVAL_ENV: &str = "SWEEP_INTERVAL";
pub const WEBHOOK_BIND_ADDRESS_ENV: &str = "WEBHOOK_BIND_ADDRESS";
pub const HEALTH_PROBE_BIND_ADDRESS_ENV: &str = "HEALTH_PROBE_BIND_ADDRESS";
pub const TLS_CERT_PATH_ENV: &str = "TLS_CERT_PATH";
pub const TLS_KEY_PATH_ENV: &str = "TLS_KEY_PATH";
pub const LEADER_ELECTION_ENV: &str = "LEADER_ELECTION";
pub const LEADER_ELECTION_NAMESPACE_ENV: &str = "LEADER_ELECTION_NAMESPACE";
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
pub const LEASE_NAME_ENV: &str = "LEASE_NAME";
pub const LEASE_DURATION_ENV: &str = "LEASE_DURATION";
pub const POD_NAME_ENV: &str = "POD_NAME";

const DEFAULT_WAIT_TIME_SECS: u64 = 600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_WEBHOOK_PORT: u16 = 8443;
const DEFAULT_HEALTH_PROBE_PORT: u16 = 8000;
const DEFAULT_LEASE_DURATION_SECS: u64 = 15;
const LEASE_RETRY_DIVISOR: u32 = 5;
const LEASE_RENEW_NUMERATOR: u32 = 2;
const LEASE_RENEW_DENOMINATOR: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{} must be set!", .0)]
    Missing(&'static str),
    #[error("{} has an invalid value '{}'! {}", .key, .value, .reason)]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Invalid MAC address range! {}", .0)]
    Range(MacError),
    #[error("Sweep interval ({}s) must be shorter than the wait time ({}s)!", .interval, .wait_time)]
    SweepInterval { interval: u64, wait_time: u64 },
    #[error("{TLS_CERT_PATH_ENV} and {TLS_KEY_PATH_ENV} must be set together!")]
    IncompleteTls,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub range: MacRange,
    pub sweeper: SweeperConfig,
    pub webhook_bind_address: SocketAddr,
    pub health_probe_bind_address: SocketAddr,
    pub tls: Option<TlsConfig>,
    /// `None` when leader election is disabled
    pub election: Option<ElectorConfig>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup };

        let range = MacRange::parse(&env.required(RANGE_START_ENV)?, &env.required(RANGE_END_ENV)?)
            .map_err(ConfigError::Range)?;

        let wait_time = env.parsed(WAIT_TIME_ENV, DEFAULT_WAIT_TIME_SECS)?;
        let interval = env.parsed(SWEEP_INTERVAL_ENV, DEFAULT_SWEEP_INTERVAL_SECS)?;
        if interval == 0 || interval >= wait_time {
            return Err(ConfigError::SweepInterval { interval, wait_time });
        }

        let sweeper = SweeperConfig {
            wait_time: chrono::Duration::from_std(Duration::from_secs(wait_time)).map_err(|err| {
                ConfigError::Invalid {
                    key: WAIT_TIME_ENV,
                    value: wait_time.to_string(),
                    reason: err.to_string(),
                }
            })?,
            interval: Duration::from_secs(interval),
        };

        let tls = match (env.optional(TLS_CERT_PATH_ENV), env.optional(TLS_KEY_PATH_ENV)) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: PathBuf::from(cert_path),
                key_path: PathBuf::from(key_path),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        let election = match env.parsed(LEADER_ELECTION_ENV, true)? {
            true => Some(env.elector_config()?),
            false => None,
        };

        Ok(Self {
            range,
            sweeper,
            webhook_bind_address: env.parsed(
                WEBHOOK_BIND_ADDRESS_ENV,
                SocketAddr::from(([0, 0, 0, 0], DEFAULT_WEBHOOK_PORT)),
            )?,
            health_probe_bind_address: env.parsed(
                HEALTH_PROBE_BIND_ADDRESS_ENV,
                SocketAddr::from(([0, 0, 0, 0], DEFAULT_HEALTH_PROBE_PORT)),
            )?,
            tls,
            election,
        })
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn optional(&self, key: &'static str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        match self.optional(key) {
            Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
                key,
                reason: err.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn elector_config(&self) -> Result<ElectorConfig, ConfigError> {
        let namespace = self
            .optional(LEADER_ELECTION_NAMESPACE_ENV)
            .or_else(|| self.optional(POD_NAMESPACE_ENV))
            .ok_or(ConfigError::Missing(LEADER_ELECTION_NAMESPACE_ENV))?;
        let lease_duration = Duration::from_secs(
            self.parsed(LEASE_DURATION_ENV, DEFAULT_LEASE_DURATION_SECS)?,
        );

        Ok(ElectorConfig {
            namespace,
            lease_name: self
                .optional(LEASE_NAME_ENV)
                .unwrap_or_else(|| LEADER_ELECTION_ID.to_owned()),
            identity: self.required(POD_NAME_ENV)?,
            lease_duration,
            renew_deadline: lease_duration * LEASE_RENEW_NUMERATOR / LEASE_RENEW_DENOMINATOR,
            retry_period: lease_duration / LEASE_RETRY_DIVISOR,
        })
    }
}
