use serde::{Serialize, Serializer};
use serde_json::{json, Map, Number};
use std::collections::BTreeMap;
use std::fmt;

/// Frame type of a regular data/info frame.
pub const FRAME_TYPE_INFO: u8 = 0;
/// Frame type the motes use to signal a boot. Boot frames never get a cached name.
pub const FRAME_TYPE_EVENT: u8 = 2;

/// Fixed-point decimal: `mantissa * 10^exponent`.
///
/// Equality is numeric, so `1234e-2 == 12340e-3`.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    mantissa: i64,
    exponent: i32,
}

impl Decimal {
    pub fn new(mantissa: i64, exponent: i32) -> Self {
        Self { mantissa, exponent }
    }

    pub fn mantissa(&self) -> i64 {
        self.mantissa
    }

    pub fn exponent(&self) -> i32 {
        self.exponent
    }

    /// Strip trailing zeros from the mantissa.
    pub fn normalized(self) -> Self {
        if self.mantissa == 0 {
            return Self::new(0, 0);
        }
        let (mut mantissa, mut exponent) = (self.mantissa, self.exponent);
        while mantissa % 10 == 0 {
            mantissa /= 10;
            exponent += 1;
        }
        Self::new(mantissa, exponent)
    }

    /// Nearest f64, parsed from the exact decimal text so the result is deterministic.
    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.normalized(), other.normalized());
        a.mantissa == b.mantissa && a.exponent == b.exponent
    }
}

impl Eq for Decimal {}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();

        if self.exponent >= 0 {
            if self.mantissa == 0 {
                return write!(f, "0");
            }
            let zeros = "0".repeat(self.exponent as usize);
            return write!(f, "{sign}{digits}{zeros}");
        }

        let frac = self.exponent.unsigned_abs() as usize;
        if digits.len() > frac {
            let (int_part, frac_part) = digits.split_at(digits.len() - frac);
            write!(f, "{sign}{int_part}.{frac_part}")
        } else {
            let pad = "0".repeat(frac - digits.len());
            write!(f, "{sign}0.{pad}{digits}")
        }
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

/// A single decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Decimal(Decimal),
    Float(f64),
    Int(i64),
    Byte(u8),
    Text(String),
    Array(Vec<Decimal>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Decimal(d) => Some(d.to_f64()),
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Byte(v) => Some(f64::from(*v)),
            Value::Text(_) | Value::Array(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Byte(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Decimal(d) => float_to_json(d.to_f64()),
            Value::Float(v) => float_to_json(*v),
            Value::Int(v) => json!(v),
            Value::Byte(v) => json!(v),
            Value::Text(s) => json!(s),
            Value::Array(values) => {
                serde_json::Value::Array(values.iter().map(|d| float_to_json(d.to_f64())).collect())
            }
        }
    }
}

fn float_to_json(value: f64) -> serde_json::Value {
    Number::from_f64(value)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// One telemetry record decoded from the wire.
///
/// `received_at` and `source_address` are left empty by the codecs and stamped by
/// the pipeline before publication.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub frame_type: u8,
    pub serial: u64,
    pub frame_sequence: u8,
    pub name: Option<String>,
    pub fields: BTreeMap<String, Value>,
    pub received_at: Option<i64>,
    pub source_address: Option<u64>,
}

impl DecodedFrame {
    pub fn new(frame_type: u8, serial: u64, frame_sequence: u8) -> Self {
        Self {
            frame_type,
            serial,
            frame_sequence,
            name: None,
            fields: BTreeMap::new(),
            received_at: None,
            source_address: None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Append to an array field, creating it if needed. Repeated array sensors
    /// in one frame extend the same field.
    pub fn extend_array(&mut self, field: &str, values: Vec<Decimal>) {
        match self.fields.get_mut(field) {
            Some(Value::Array(existing)) => existing.extend(values),
            _ => {
                self.fields.insert(field.to_string(), Value::Array(values));
            }
        }
    }

    pub fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
    }

    pub fn stamp(&mut self, received_at: i64, source_address: u64) {
        self.received_at = Some(received_at);
        self.source_address = Some(source_address);
    }

    /// Flat JSON record as published on the data exchange.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = Map::new();
        map.insert("type".to_string(), json!(self.frame_type));
        map.insert("serial".to_string(), json!(self.serial));
        map.insert("frame".to_string(), json!(self.frame_sequence));
        if let Some(name) = &self.name {
            map.insert("name".to_string(), json!(name));
        }
        if let Some(received) = self.received_at {
            map.insert("received".to_string(), json!(received));
        }
        if let Some(address) = self.source_address {
            map.insert("source_addr".to_string(), json!(address));
        }
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

impl Serialize for DecodedFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_display() {
        assert_eq!(Decimal::new(1234, -2).to_string(), "12.34");
        assert_eq!(Decimal::new(-1234, -2).to_string(), "-12.34");
        assert_eq!(Decimal::new(5, -3).to_string(), "0.005");
        assert_eq!(Decimal::new(-5, -1).to_string(), "-0.5");
        assert_eq!(Decimal::new(101325, 2).to_string(), "10132500");
        assert_eq!(Decimal::new(0, 3).to_string(), "0");
        assert_eq!(Decimal::new(42, 0).to_string(), "42");
    }

    #[test]
    fn test_decimal_numeric_equality() {
        assert_eq!(Decimal::new(1234, -2), Decimal::new(12340, -3));
        assert_eq!(Decimal::new(0, -4), Decimal::new(0, 2));
        assert_ne!(Decimal::new(1234, -2), Decimal::new(1234, -3));
    }

    #[test]
    fn test_decimal_to_f64() {
        assert_eq!(Decimal::new(1234, -2).to_f64(), 12.34);
        assert_eq!(Decimal::new(625, -4).to_f64(), 0.0625);
    }

    #[test]
    fn test_frame_json_layout() {
        let mut frame = DecodedFrame::new(FRAME_TYPE_INFO, 1234, 7);
        frame.name = Some("mote1".to_string());
        frame.insert("bat", Value::Byte(87));
        frame.insert("bme_tc", Value::Decimal(Decimal::new(2150, -2)));
        frame.extend_array("ds1820", vec![Decimal::new(1, 0)]);
        frame.extend_array("ds1820", vec![Decimal::new(2, 0)]);
        frame.stamp(1_500_000_000, 42);

        assert_eq!(
            frame.to_json(),
            json!({
                "type": 0,
                "serial": 1234,
                "frame": 7,
                "name": "mote1",
                "received": 1_500_000_000,
                "source_addr": 42,
                "bat": 87,
                "bme_tc": 21.5,
                "ds1820": [1.0, 2.0],
            })
        );
    }

    #[test]
    fn test_has_name() {
        let mut frame = DecodedFrame::new(FRAME_TYPE_INFO, 1, 0);
        assert!(!frame.has_name());
        frame.name = Some(String::new());
        assert!(!frame.has_name());
        frame.name = Some("x".into());
        assert!(frame.has_name());
    }
}
