//! gridmesh.toml configuration parser.

use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::TwinId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub grid: GridSection,
    pub network: NetworkSection,
    pub deploy: DeploySection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSection {
    /// Twin that owns and signs every deployment.
    pub twin_id: TwinId,
    /// Solution provider credited on created node contracts.
    pub solution_provider: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub wg_port_min: u16,
    pub wg_port_max: u16,
    /// Liveness probe timeout for access node candidates (e.g. "10s").
    pub probe_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySection {
    /// Delay between polls while waiting for workload results.
    pub poll_interval: String,
    /// Give up waiting for workload results after this long.
    pub wait_timeout: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            wg_port_min: 2000,
            wg_port_max: 7999,
            probe_timeout: "10s".to_string(),
        }
    }
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            poll_interval: "1s".to_string(),
            wait_timeout: "4m".to_string(),
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: GridConfig =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Reject values that would make the engine misbehave later.
    pub fn validate(&self) -> CoreResult<()> {
        if self.network.wg_port_min == 0 || self.network.wg_port_min > self.network.wg_port_max {
            return Err(CoreError::Config(format!(
                "invalid wireguard port range {}..={}",
                self.network.wg_port_min, self.network.wg_port_max
            )));
        }
        for (field, value) in [
            ("network.probe_timeout", &self.network.probe_timeout),
            ("deploy.poll_interval", &self.deploy.poll_interval),
            ("deploy.wait_timeout", &self.deploy.wait_timeout),
        ] {
            if parse_duration(value).is_none() {
                return Err(CoreError::Config(format!("{field}: invalid duration {value:?}")));
            }
        }
        Ok(())
    }

    pub fn wg_port_range(&self) -> RangeInclusive<u16> {
        self.network.wg_port_min..=self.network.wg_port_max
    }

    pub fn probe_timeout(&self) -> Duration {
        parse_duration(&self.network.probe_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.deploy.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        parse_duration(&self.deploy.wait_timeout).unwrap_or(Duration::from_secs(240))
    }
}

/// Parse "500ms", "10s", "4m", "1h" or a plain number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = GridConfig::from_toml_str("").unwrap();
        assert_eq!(config.wg_port_range(), 2000..=7999);
        assert_eq!(config.probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.wait_timeout(), Duration::from_secs(240));
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[grid]
twin_id = 42
solution_provider = 7

[network]
wg_port_min = 3000
wg_port_max = 3999
probe_timeout = "500ms"

[deploy]
poll_interval = "2s"
wait_timeout = "1h"
"#;
        let config = GridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.grid.twin_id, 42);
        assert_eq!(config.grid.solution_provider, Some(7));
        assert_eq!(config.probe_timeout(), Duration::from_millis(500));
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.wait_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let toml_str = "[network]\nwg_port_min = 5000\nwg_port_max = 4000\n";
        assert!(matches!(
            GridConfig::from_toml_str(toml_str),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let toml_str = "[deploy]\nwait_timeout = \"soon\"\n";
        assert!(GridConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = GridConfig::default();
        config.grid.twin_id = 9;
        let text = config.to_toml_string().unwrap();
        let back = GridConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.grid.twin_id, 9);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("x"), None);
    }
}
