use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub lnd: LndConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub rebalance: RebalanceDefaults,
    #[serde(default)]
    pub fees: FeesConfig,
}

#[derive(Debug, Deserialize)]
pub struct LndConfig {
    /// LND REST endpoint, e.g. https://localhost:8080
    pub rest_url: String,
    /// Path to a macaroon allowed to read, invoice and pay
    pub macaroon_path: PathBuf,
    /// Path to LND's TLS certificate
    pub tls_cert_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// SQLite file keeping the rebalance history
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Defaults for each rebalance; command-line flags override them per run.
#[derive(Debug, Deserialize)]
pub struct RebalanceDefaults {
    /// Target local ratio (0.0 to 1.0)
    #[serde(default = "default_channel_ratio")]
    pub channel_ratio: f64,
    /// Flat mode: multiple of the reference fee a route may cost
    #[serde(default = "default_max_fee_factor")]
    pub max_fee_factor: f64,
    /// Use the economic fee limit instead of the flat one
    #[serde(default)]
    pub econ_fee: bool,
    #[serde(default)]
    pub econ_fee_factor: Option<f64>,
    /// Channels never used as first hop
    #[serde(default)]
    pub excluded: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FeesConfig {
    /// Base fee of a reference hop (msat)
    #[serde(default = "default_base_fee_msat")]
    pub default_base_fee_msat: u64,
    /// Proportional fee of a reference hop (fraction of the amount)
    #[serde(default = "default_fee_rate")]
    pub default_fee_rate: f64,
    /// Ceiling applied to fee rates in economic computations (ppm)
    #[serde(default = "default_max_fee_rate")]
    pub max_fee_rate: i64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("rebalance.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_channel_ratio() -> f64 {
    0.5
}
fn default_max_fee_factor() -> f64 {
    10.0
}
fn default_base_fee_msat() -> u64 {
    1000
}
fn default_fee_rate() -> f64 {
    0.001
}
fn default_max_fee_rate() -> i64 {
    1000
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RebalanceDefaults {
    fn default() -> Self {
        Self {
            channel_ratio: default_channel_ratio(),
            max_fee_factor: default_max_fee_factor(),
            econ_fee: false,
            econ_fee_factor: None,
            excluded: Vec::new(),
        }
    }
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            default_base_fee_msat: default_base_fee_msat(),
            default_fee_rate: default_fee_rate(),
            max_fee_rate: default_max_fee_rate(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let ratio = self.rebalance.channel_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            anyhow::bail!("channel_ratio ({}) must be between 0.0 and 1.0", ratio);
        }
        if self.rebalance.max_fee_factor <= 0.0 {
            anyhow::bail!(
                "max_fee_factor ({}) must be positive",
                self.rebalance.max_fee_factor
            );
        }
        if let Some(factor) = self.rebalance.econ_fee_factor {
            if factor < 0.0 {
                anyhow::bail!("econ_fee_factor ({}) must not be negative", factor);
            }
        }
        if self.fees.max_fee_rate <= 0 {
            anyhow::bail!("max_fee_rate ({}) must be positive", self.fees.max_fee_rate);
        }
        if self.fees.default_fee_rate < 0.0 {
            anyhow::bail!("default_fee_rate must not be negative");
        }
        if !self.lnd.tls_cert_path.exists() {
            anyhow::bail!(
                "TLS cert not found at: {}",
                self.lnd.tls_cert_path.display()
            );
        }
        if !self.lnd.macaroon_path.exists() {
            anyhow::bail!(
                "Macaroon not found at: {}",
                self.lnd.macaroon_path.display()
            );
        }
        Ok(())
    }

    /// Create a config with all defaults for testing purposes.
    /// Both credential paths point at `path` (must exist for validation).
    #[cfg(test)]
    pub fn test_default(path: std::path::PathBuf) -> Self {
        Self {
            lnd: LndConfig {
                rest_url: "https://localhost:8080".to_string(),
                macaroon_path: path.clone(),
                tls_cert_path: path,
            },
            general: GeneralConfig::default(),
            rebalance: RebalanceDefaults::default(),
            fees: FeesConfig::default(),
        }
    }
}
