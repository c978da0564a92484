//! Network-server webhook envelopes and their mapping to readings

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use slopeguard_core::{Location, Measurement, SensorReading};

use super::decoder::{self, layout_for, DecodeError, DecodedPayload};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub dev_eui: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

impl DeviceInfo {
    /// Device name when set, otherwise the EUI
    pub fn display_id(&self) -> &str {
        self.device_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.dev_eui)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GatewayLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RxInfo {
    #[serde(default)]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub rssi: Option<f64>,
    #[serde(default)]
    pub snr: Option<f64>,
    #[serde(default)]
    pub location: Option<GatewayLocation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkEnvelope {
    pub device_info: DeviceInfo,
    #[serde(default)]
    pub f_port: Option<u8>,
    #[serde(default)]
    pub f_cnt: Option<u64>,
    /// Base64 application payload
    #[serde(default)]
    pub data: Option<String>,
    /// Payload already decoded by the network server codec
    #[serde(default)]
    pub object: Option<Map<String, Value>>,
    #[serde(default)]
    pub rx_info: Vec<RxInfo>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

/// Join, status and error notifications; only the device is required
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEnvelope {
    pub device_info: DeviceInfo,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl UplinkEnvelope {
    /// Strongest RSSI across receiving gateways (least negative)
    pub fn best_rssi(&self) -> Option<f64> {
        self.rx_info
            .iter()
            .filter_map(|rx| rx.rssi)
            .filter(|rssi| rssi.is_finite())
            .fold(None, |best, rssi| match best {
                Some(b) if b >= rssi => Some(b),
                _ => Some(rssi),
            })
    }

    pub fn first_gateway_location(&self) -> Option<Location> {
        self.rx_info
            .iter()
            .find_map(|rx| rx.location)
            .map(|loc| Location {
                latitude: loc.latitude,
                longitude: loc.longitude,
                elevation: loc.altitude,
            })
    }

    fn raw_bytes(&self) -> Result<Option<Vec<u8>>, DecodeError> {
        self.data
            .as_deref()
            .filter(|data| !data.is_empty())
            .map(|data| {
                STANDARD
                    .decode(data)
                    .map_err(|e| DecodeError::InvalidBase64(e.to_string()))
            })
            .transpose()
    }

    /// Decode the payload and enrich it with radio metadata
    pub fn into_reading(self, received_at: DateTime<Utc>) -> Result<SensorReading, DecodeError> {
        let raw = self.raw_bytes()?;

        let decoded = match (&self.object, &raw) {
            (Some(object), _) => from_object(object, self.f_port),
            (None, Some(bytes)) => {
                let port = self.f_port.ok_or(DecodeError::UnknownPort(0))?;
                decoder::decode(port, bytes)?
            }
            (None, None) => return Err(DecodeError::MissingPayload),
        };

        let sensor_id = decoded
            .sensor_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.device_info.display_id().to_string());

        let mut reading = SensorReading::new(
            sensor_id,
            decoded.sensor_type,
            self.time.unwrap_or(received_at),
            received_at,
        );
        reading.measurements = decoded.measurements;
        reading.battery_level = decoded.battery_level;
        reading.quality_flags.communication_error = decoded.communication_error;
        reading.signal_strength = self.best_rssi();
        reading.location = self.first_gateway_location();
        reading.sequence_number = self.f_cnt;
        reading.raw_data = raw;

        Ok(reading)
    }
}

/// Fields a network-server codec may emit in `object`
const OBJECT_MEASUREMENTS: &[(&str, &str)] = &[
    ("temperature", "°C"),
    ("humidity", "%"),
    ("pressure", "hPa"),
    ("tilt_x", "deg"),
    ("tilt_y", "deg"),
];

fn from_object(object: &Map<String, Value>, port: Option<u8>) -> DecodedPayload {
    let sensor_type = object
        .get("sensor_type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| port.and_then(layout_for).map(|l| l.sensor_type.to_string()))
        .unwrap_or_else(|| slopeguard_core::reading::UNKNOWN_SENSOR_TYPE.to_string());

    let measurements = OBJECT_MEASUREMENTS
        .iter()
        .filter_map(|(name, unit)| {
            let value = object.get(*name)?.as_f64()?;
            Some((name.to_string(), Measurement::new(value, *unit)))
        })
        .collect();

    DecodedPayload {
        sensor_id: object
            .get("sensor_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        sensor_type,
        measurements,
        battery_level: object.get("battery").and_then(Value::as_f64),
        communication_error: false,
    }
}
