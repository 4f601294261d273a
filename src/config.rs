//! Environment-driven configuration and replica address derivation.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};

const DEFAULT_DELAY_MIN_MS: u64 = 500;
const DEFAULT_DELAY_MAX_MS: u64 = 1500;

/// Consistency guarantee selected for the whole process at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyMode {
    Sequential,
    Causal,
}

impl FromStr for ConsistencyMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SEQUENTIAL" => Ok(Self::Sequential),
            "CAUSAL" => Ok(Self::Causal),
            other => Err(anyhow!(
                "CONSISTENCY_TYPE must be SEQUENTIAL or CAUSAL, got {other:?}"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub num_replicas: usize,
    /// Starting port for peer-to-peer links; replica `i` listens on
    /// `base_port + i` (localhost) or `base_port` on host
    /// `base_name-i` (container).
    pub base_port: u16,
    /// Starting port for client RPC listeners, derived the same way.
    pub base_port_to_client: u16,
    pub base_name: String,
    pub container: bool,
    pub consistency: ConsistencyMode,
    /// Idle-shutdown period: the replica exits after this long with no
    /// inbound peer-link activity.
    pub timeout: Duration,
    /// Simulated delay interval in milliseconds, injected before each
    /// multicast to exercise the FIFO sequencer.
    pub delay_ms: (u64, u64),
    /// Scenario selector for the test driver.
    pub test: Option<String>,
}

impl Config {
    /// Loads the configuration from the process environment. A `.env`
    /// file is honoured when present; the environment always wins.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let num_replicas: usize = parse_required("NUM_REPLICAS")?;
        ensure!(num_replicas > 0, "NUM_REPLICAS must be positive");
        let timeout_secs: u64 = parse_required("TIMEOUT")?;
        ensure!(timeout_secs > 0, "TIMEOUT must be positive");

        let delay_min = parse_optional("SEND_DELAY_MIN_MS")?.unwrap_or(DEFAULT_DELAY_MIN_MS);
        let delay_max = parse_optional("SEND_DELAY_MAX_MS")?.unwrap_or(DEFAULT_DELAY_MAX_MS);
        ensure!(
            delay_min <= delay_max,
            "SEND_DELAY_MIN_MS must not exceed SEND_DELAY_MAX_MS"
        );

        Ok(Self {
            num_replicas,
            base_port: parse_required("BASE_PORT")?,
            base_port_to_client: parse_required("BASE_PORT_TO_CLIENT")?,
            base_name: env::var("BASE_NAME").unwrap_or_default(),
            container: env::var("CONTAINER").is_ok_and(|value| value == "YES"),
            consistency: required("CONSISTENCY_TYPE")?.parse()?,
            timeout: Duration::from_secs(timeout_secs),
            delay_ms: (delay_min, delay_max),
            test: env::var("TEST").ok(),
        })
    }

    /// Address on which replica `index` accepts peer-link connections.
    pub fn peer_addr(&self, index: usize) -> String {
        if self.container {
            format!("{}-{}:{}", self.base_name, index, self.base_port)
        } else {
            format!("127.0.0.1:{}", self.base_port + index as u16)
        }
    }

    /// Address on which replica `index` accepts client RPC connections.
    pub fn client_addr(&self, index: usize) -> String {
        if self.container {
            format!("{}-{}:{}", self.base_name, index, self.base_port_to_client)
        } else {
            format!("127.0.0.1:{}", self.base_port_to_client + index as u16)
        }
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("missing environment variable {name}"))
}

fn parse_required<T>(name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    required(name)?
        .parse()
        .with_context(|| format!("invalid value for {name}"))
}

fn parse_optional<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {name}")),
        Err(_) => Ok(None),
    }
}
