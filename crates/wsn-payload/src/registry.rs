use crate::{DecodeError, Result};
use std::collections::HashMap;

/// Binary representation of a scalar in the legacy format (little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    F32,
    I16,
    U8,
    U32,
    /// The item carries its own type (CBOR). Has no fixed binary width.
    SelfDescribing,
}

impl WireType {
    pub fn width(&self) -> Option<usize> {
        match self {
            WireType::F32 | WireType::U32 => Some(4),
            WireType::I16 => Some(2),
            WireType::U8 => Some(1),
            WireType::SelfDescribing => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArityKind {
    /// Exactly one scalar value follows.
    Single,
    /// Length-prefixed byte string.
    FixedString,
    /// Count, then one absolute value followed by `count - 1` deltas.
    VariableArray,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    /// Decimal exponent: the decoded value is `raw * unit * 10^scale`.
    pub scale: i32,
    pub arity: ArityKind,
    pub wire: WireType,
    /// Weight of one raw step in units of `10^scale`. 1 unless the sensor counts in
    /// non-decimal fractions (DS18B20 reports 1/16 °C, i.e. 625e-4).
    pub unit: i64,
}

impl FieldSpec {
    pub fn single(name: &str, wire: WireType, scale: i32) -> Self {
        Self {
            name: name.to_string(),
            scale,
            arity: ArityKind::Single,
            wire,
            unit: 1,
        }
    }

    /// Scalar whose type comes from the encoding itself.
    pub fn scalar(name: &str, scale: i32) -> Self {
        Self::single(name, WireType::SelfDescribing, scale)
    }

    pub fn string(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scale: 0,
            arity: ArityKind::FixedString,
            wire: WireType::U8,
            unit: 1,
        }
    }

    pub fn array(name: &str, scale: i32) -> Self {
        Self {
            name: name.to_string(),
            scale,
            arity: ArityKind::VariableArray,
            wire: WireType::I16,
            unit: 1,
        }
    }

    pub fn with_unit(mut self, unit: i64) -> Self {
        self.unit = unit;
        self
    }
}

/// Static table from a protocol-specific sensor key to the fields that follow it.
#[derive(Debug, Clone, Default)]
pub struct SensorRegistry {
    sensors: HashMap<u64, Vec<FieldSpec>>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: u64, fields: Vec<FieldSpec>) -> Self {
        self.sensors.insert(key, fields);
        self
    }

    pub fn lookup(&self, key: u64) -> Result<&[FieldSpec]> {
        self.sensors
            .get(&key)
            .map(Vec::as_slice)
            .ok_or(DecodeError::UnknownSensor(key))
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Sensors understood by the Waspmote legacy binary format.
    pub fn waspmote() -> Self {
        use WireType::{F32, I16, U32, U8};

        let f = |name: &str| FieldSpec::single(name, F32, 0);

        Self::new()
            .with(15, vec![f("pa")])
            .with(33, vec![f("tcb")])
            .with(35, vec![f("humb")])
            .with(38, vec![f("lw")])
            .with(52, vec![FieldSpec::single("bat", U8, 0)])
            .with(53, vec![f("latitude"), f("longitude")])
            .with(54, vec![FieldSpec::single("rssi", I16, 0)])
            .with(55, vec![FieldSpec::string("mac")])
            .with(62, vec![f("in_temp")])
            .with(65, vec![FieldSpec::string("str")])
            .with(74, vec![f("bme_tc")])
            .with(76, vec![f("bme_hum")])
            .with(77, vec![f("bme_pres")])
            .with(85, vec![FieldSpec::single("tx_pwr", U8, 0)])
            .with(123, vec![FieldSpec::single("tst", U32, 0)])
            .with(200, vec![f("ctd_depth"), f("ctd_temp"), f("ctd_cond")])
            .with(201, vec![f("ds2_speed"), f("ds2_dir"), f("ds2_temp")])
            .with(202, vec![f("ds2_meridional"), f("ds2_zonal"), f("ds2_gust")])
            .with(203, vec![FieldSpec::array("ds1820", -4).with_unit(625)])
            .with(
                204,
                vec![
                    FieldSpec::single("mb_median", U32, 0),
                    FieldSpec::single("mb_sd", U32, 0),
                ],
            )
            .with(206, vec![f("volts")])
            .with(
                207,
                vec![
                    f("precip_abs"),
                    f("precip_dif"),
                    f("precip_int_h"),
                    FieldSpec::single("precip_type", U8, 0),
                    f("precip_int_min"),
                ],
            )
    }

    /// Sensors understood by the RIOT CBOR format. Keys 1-3 fill the frame header.
    pub fn riot() -> Self {
        Self::new()
            .with(0, vec![FieldSpec::scalar("tst", 0)])
            .with(1, vec![FieldSpec::scalar("serial", 0)])
            .with(2, vec![FieldSpec::scalar("name", 0)])
            .with(3, vec![FieldSpec::scalar("frame", 0)])
            .with(130, vec![FieldSpec::scalar("bme_tc", -2)])
            .with(131, vec![FieldSpec::scalar("bme_hum", -2)])
            .with(137, vec![FieldSpec::scalar("bme_pres", 2)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_sensor() {
        let registry = SensorRegistry::waspmote();
        let fields = registry.lookup(53).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "latitude");
        assert_eq!(fields[1].name, "longitude");
    }

    #[test]
    fn test_lookup_unknown_sensor() {
        let registry = SensorRegistry::waspmote();
        assert_eq!(registry.lookup(63), Err(DecodeError::UnknownSensor(63)));
    }

    #[test]
    fn test_ds18b20_counts_sixteenths() {
        let registry = SensorRegistry::waspmote();
        let field = &registry.lookup(203).unwrap()[0];
        assert_eq!(field.arity, ArityKind::VariableArray);
        assert_eq!((field.unit, field.scale), (625, -4));
    }

    #[test]
    fn test_riot_scales() {
        let registry = SensorRegistry::riot();
        assert_eq!(registry.lookup(130).unwrap()[0].scale, -2);
        assert_eq!(registry.lookup(137).unwrap()[0].scale, 2);
    }

    #[test]
    fn test_wire_widths() {
        assert_eq!(WireType::F32.width(), Some(4));
        assert_eq!(WireType::I16.width(), Some(2));
        assert_eq!(WireType::U8.width(), Some(1));
        assert_eq!(WireType::U32.width(), Some(4));
        assert_eq!(WireType::SelfDescribing.width(), None);
    }
}
