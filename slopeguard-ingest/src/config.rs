//! Service configuration file
//!
//! Every section is optional; an empty file yields the defaults.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 8080
//!
//! [validator]
//! max_data_age_secs = 300
//!
//! [validator.ranges.piezometer]
//! water_level = [0, 250]
//!
//! [intake]
//! max_batch_size = 500
//!
//! [webhook]
//! secret = "shared-with-network-server"
//!
//! [mqtt]
//! enabled = false
//!
//! [bus]
//! backend = "memory"
//! ```

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use slopeguard_connectors::bus::BusConfig;
use slopeguard_connectors::http::IntakeConfig;
use slopeguard_connectors::lorawan::WebhookConfig;
use slopeguard_connectors::mqtt::MqttConfig;
use slopeguard_core::ValidatorConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.bind, self.port))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub server: ServerConfig,
    pub validator: ValidatorConfig,
    pub intake: IntakeConfig,
    pub webhook: WebhookConfig,
    pub mqtt: MqttConfig,
    pub bus: BusConfig,
}

impl IngestConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.intake.validate()?;

        let v = &self.validator;
        if v.max_data_age_secs == 0 {
            bail!("validator.max_data_age_secs must be positive");
        }
        if v.cache_sweep_interval_secs == 0 {
            bail!("validator.cache_sweep_interval_secs must be positive");
        }
        if !(0.0..=1.0).contains(&v.min_quality_score) {
            bail!("validator.min_quality_score must lie in [0, 1]");
        }
        if let Some(entry) = v.ranges.find_invalid_bound() {
            bail!("validator.ranges.{} has min above max or a non-finite bound", entry);
        }

        if self.webhook.max_body_bytes == 0 {
            bail!("webhook.max_body_bytes must be positive");
        }

        if self.mqtt.enabled {
            if self.mqtt.channel_capacity == 0 {
                bail!("mqtt.channel_capacity must be positive");
            }
            if self.mqtt.reconnect_interval_secs == 0 {
                bail!("mqtt.reconnect_interval_secs must be positive");
            }
            if self.mqtt.handler_queue_capacity == 0 {
                bail!("mqtt.handler_queue_capacity must be positive");
            }
        }

        if self.bus.topics.raw_readings.trim().is_empty() {
            bail!("bus.topics.raw_readings is empty");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slopeguard_connectors::bus::BusBackend;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_is_defaults() {
        let file = write("");
        let config = IngestConfig::load(file.path()).unwrap();
        assert_eq!(config, IngestConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.server.addr().unwrap().port(), 8080);
    }

    #[test]
    fn sections_override_defaults() {
        let file = write(
            r#"
            [server]
            port = 9100

            [validator]
            max_data_age_secs = 120

            [validator.ranges.piezometer]
            water_level = [0, 250]

            [intake]
            max_batch_size = 50

            [webhook]
            secret = "abc"

            [mqtt]
            enabled = false

            [bus]
            backend = "memory"
            "#,
        );

        let config = IngestConfig::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.validator.max_data_age_secs, 120);
        assert!(!config.validator.ranges.accepts("piezometer", "water_level", 300.0));
        // defaults survive next to an override
        assert!(!config.validator.ranges.accepts("tiltmeter", "tilt_x", 95.0));
        assert_eq!(config.intake.max_batch_size, 50);
        assert_eq!(config.intake.max_file_size, IntakeConfig::default().max_file_size);
        assert_eq!(config.webhook.secret.as_deref(), Some("abc"));
        assert!(!config.mqtt.enabled);
        assert_eq!(config.bus.backend, BusBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_limits() {
        let file = write("[intake]\nmax_file_size = 0\n");
        let config = IngestConfig::load(file.path()).unwrap();
        assert!(config.validate().is_err());

        let file = write("[validator.ranges.strain_gauge]\nstrain = [5.0, -5.0]\n");
        let config = IngestConfig::load(file.path()).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("strain_gauge.strain"), "{}", err);

        let file = write("[mqtt]\nhandler_queue_capacity = 0\n");
        let err = IngestConfig::load(file.path()).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("handler_queue_capacity"));

        let file = write("[validator]\nmin_quality_score = 1.5\n");
        assert!(IngestConfig::load(file.path()).unwrap().validate().is_err());
    }

    #[test]
    fn unreadable_or_invalid_file() {
        assert!(IngestConfig::load(Path::new("/nonexistent/slopeguard.toml")).is_err());

        let file = write("[server]\nport = \"eighty\"\n");
        let err = IngestConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("parsing config"));
    }

    #[test]
    fn bad_bind_address() {
        let server = ServerConfig {
            bind: "not an ip".into(),
            port: 1,
        };
        assert!(server.addr().is_err());
    }
}
