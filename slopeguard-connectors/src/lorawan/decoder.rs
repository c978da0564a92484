//! Per-port binary payload decoding
//!
//! Each uplink `fPort` selects a fixed big-endian layout. Layouts are data,
//! not code: one generic [`decode`] walks the field table for the port.
//!
//! ```text
//! Port 1 "standard", 9 bytes
//! ┌────────┬────────┬────────┬────────┬─────┐
//! │ temp   │ humid  │ tilt_x │ tilt_y │ bat │
//! │ i16 BE │ u16 BE │ i16 BE │ i16 BE │ u8  │
//! │ /100 C │ /100 % │ /100 ° │ /100 ° │  %  │
//! └────────┴────────┴────────┴────────┴─────┘
//!  0        2        4        6        8
//!
//! Port 2 "device status", 4 bytes: status u8, battery u8, signal quality u8, error code u8
//! Port 3 "environmental", 8 bytes: temp i16 /100, humidity u16 /100,
//!                                  pressure u16 /10 hPa, rainfall u16 /100 mm
//! ```
//!
//! Short buffers and unknown ports produce a [`DecodeError`]; no offset is
//! ever read past the end of the buffer.

use std::collections::HashMap;

use thiserror::Error;

use slopeguard_core::Measurement;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Unknown fPort {0}")]
    UnknownPort(u8),

    #[error("Payload for port {port} is {len} bytes, layout needs {need}")]
    TooShort { port: u8, len: usize, need: usize },

    #[error("Payload is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("Uplink carries neither data nor a decoded object")]
    MissingPayload,
}

/// Width and signedness of one field, always big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    I16Be,
    U16Be,
    U8,
}

impl FieldKind {
    pub const fn width(&self) -> usize {
        match self {
            Self::I16Be | Self::U16Be => 2,
            Self::U8 => 1,
        }
    }

    fn read(&self, bytes: &[u8], offset: usize) -> Option<f64> {
        let raw = bytes.get(offset..offset + self.width())?;
        Some(match self {
            Self::I16Be => f64::from(i16::from_be_bytes([raw[0], raw[1]])),
            Self::U16Be => f64::from(u16::from_be_bytes([raw[0], raw[1]])),
            Self::U8 => f64::from(raw[0]),
        })
    }
}

/// Where a decoded value lands in the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget {
    Measurement,
    BatteryLevel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldLayout {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
    /// Raw value is divided by this
    pub scale: f64,
    pub unit: &'static str,
    pub target: FieldTarget,
}

impl FieldLayout {
    const fn measurement(
        name: &'static str,
        offset: usize,
        kind: FieldKind,
        scale: f64,
        unit: &'static str,
    ) -> Self {
        Self {
            name,
            offset,
            kind,
            scale,
            unit,
            target: FieldTarget::Measurement,
        }
    }

    const fn battery(name: &'static str, offset: usize) -> Self {
        Self {
            name,
            offset,
            kind: FieldKind::U8,
            scale: 1.0,
            unit: "%",
            target: FieldTarget::BatteryLevel,
        }
    }

    const fn end(&self) -> usize {
        self.offset + self.kind.width()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortLayout {
    pub port: u8,
    pub name: &'static str,
    pub sensor_type: &'static str,
    pub min_len: usize,
    pub fields: &'static [FieldLayout],
    /// Non-zero value in this field marks a communication error
    pub error_code_field: Option<&'static str>,
}

use FieldKind::{I16Be, U16Be, U8};

pub static PORT_LAYOUTS: &[PortLayout] = &[
    PortLayout {
        port: 1,
        name: "standard",
        sensor_type: "multi_sensor",
        min_len: 9,
        fields: &[
            FieldLayout::measurement("temperature", 0, I16Be, 100.0, "°C"),
            FieldLayout::measurement("humidity", 2, U16Be, 100.0, "%"),
            FieldLayout::measurement("tilt_x", 4, I16Be, 100.0, "deg"),
            FieldLayout::measurement("tilt_y", 6, I16Be, 100.0, "deg"),
            FieldLayout::battery("battery", 8),
        ],
        error_code_field: None,
    },
    PortLayout {
        port: 2,
        name: "device_status",
        sensor_type: "device_status",
        min_len: 4,
        fields: &[
            FieldLayout::measurement("status", 0, U8, 1.0, ""),
            FieldLayout::battery("battery", 1),
            FieldLayout::measurement("signal_quality", 2, U8, 1.0, ""),
            FieldLayout::measurement("error_code", 3, U8, 1.0, ""),
        ],
        error_code_field: Some("error_code"),
    },
    PortLayout {
        port: 3,
        name: "environmental",
        sensor_type: "environmental",
        min_len: 8,
        fields: &[
            FieldLayout::measurement("temperature", 0, I16Be, 100.0, "°C"),
            FieldLayout::measurement("humidity", 2, U16Be, 100.0, "%"),
            FieldLayout::measurement("pressure", 4, U16Be, 10.0, "hPa"),
            FieldLayout::measurement("rainfall", 6, U16Be, 100.0, "mm"),
        ],
        error_code_field: None,
    },
];

pub fn layout_for(port: u8) -> Option<&'static PortLayout> {
    PORT_LAYOUTS.iter().find(|layout| layout.port == port)
}

/// Decoded fields, before enrichment with radio metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPayload {
    pub sensor_id: Option<String>,
    pub sensor_type: String,
    pub measurements: HashMap<String, Measurement>,
    pub battery_level: Option<f64>,
    pub communication_error: bool,
}

/// Decode `bytes` with the layout registered for `port`
pub fn decode(port: u8, bytes: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let layout = layout_for(port).ok_or(DecodeError::UnknownPort(port))?;

    let need = layout
        .fields
        .iter()
        .map(FieldLayout::end)
        .max()
        .unwrap_or(0)
        .max(layout.min_len);
    if bytes.len() < need {
        return Err(DecodeError::TooShort {
            port,
            len: bytes.len(),
            need,
        });
    }

    let mut decoded = DecodedPayload {
        sensor_type: layout.sensor_type.to_string(),
        ..DecodedPayload::default()
    };

    for field in layout.fields {
        let raw = field.kind.read(bytes, field.offset).ok_or(DecodeError::TooShort {
            port,
            len: bytes.len(),
            need: field.end(),
        })?;
        let value = raw / field.scale;

        match field.target {
            FieldTarget::BatteryLevel => decoded.battery_level = Some(value),
            FieldTarget::Measurement => {
                decoded
                    .measurements
                    .insert(field.name.to_string(), Measurement::new(value, field.unit));
            }
        }

        if layout.error_code_field == Some(field.name) && raw != 0.0 {
            decoded.communication_error = true;
        }
    }

    Ok(decoded)
}
