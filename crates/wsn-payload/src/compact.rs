//! RIOT frames: one CBOR array of alternating `key, value` items.
//!
//! Keys come from the sensor registry. Keys 1, 2 and 3 carry the serial number,
//! the device name and the frame sequence; everything else becomes a field.

use crate::registry::{ArityKind, FieldSpec, SensorRegistry};
use crate::value::{Decimal, DecodedFrame, Value, FRAME_TYPE_INFO};
use crate::{DecodeError, Result};
use minicbor::data::Type;
use minicbor::Decoder;
use tracing::debug;

const KEY_SERIAL: u64 = 1;
const KEY_NAME: u64 = 2;
const KEY_FRAME: u64 = 3;

fn cbor_error(err: minicbor::decode::Error) -> DecodeError {
    if err.is_end_of_input() {
        DecodeError::truncated(1, 0)
    } else {
        DecodeError::Malformed(err.to_string())
    }
}

/// Definite-length array reader that tracks how many items are left.
struct Items<'a, 'b> {
    dec: &'a mut Decoder<'b>,
    remaining: u64,
}

impl<'a, 'b> Items<'a, 'b> {
    fn open(dec: &'a mut Decoder<'b>) -> Result<Self> {
        match dec.array().map_err(cbor_error)? {
            Some(len) => Ok(Self {
                dec,
                remaining: len,
            }),
            None => Err(DecodeError::Malformed(
                "indefinite-length arrays are not supported".to_string(),
            )),
        }
    }

    fn is_done(&self) -> bool {
        self.remaining == 0
    }

    fn claim(&mut self) -> Result<()> {
        if self.remaining == 0 {
            return Err(DecodeError::Malformed(
                "array ended in the middle of a field".to_string(),
            ));
        }
        self.remaining -= 1;
        Ok(())
    }

    fn key(&mut self) -> Result<u64> {
        self.claim()?;
        match self.dec.datatype().map_err(cbor_error)? {
            Type::U8 | Type::U16 | Type::U32 | Type::U64 => self.dec.u64().map_err(cbor_error),
            other => Err(DecodeError::Malformed(format!(
                "sensor key must be an unsigned integer, got {other:?}"
            ))),
        }
    }

    fn int(&mut self) -> Result<i64> {
        self.claim()?;
        read_int(self.dec)
    }

    fn item(&mut self, field: &FieldSpec) -> Result<Value> {
        self.claim()?;
        read_scalar(self.dec, field)
    }

    fn text(&mut self) -> Result<String> {
        self.claim()?;
        read_text(self.dec)
    }

    /// Count followed by one absolute value and `count - 1` deltas. The count is
    /// either a plain integer item or the header of a nested array.
    fn delta_array(&mut self) -> Result<Vec<i64>> {
        let raw = match self.dec.datatype().map_err(cbor_error)? {
            Type::Array => {
                self.claim()?;
                let mut nested = Items::open(self.dec)?;
                let mut raw = Vec::new();
                while !nested.is_done() {
                    raw.push(nested.int()?);
                }
                raw
            }
            Type::ArrayIndef => {
                return Err(DecodeError::Malformed(
                    "indefinite-length arrays are not supported".to_string(),
                ))
            }
            _ => {
                let count = self.int()?;
                let count = u64::try_from(count).map_err(|_| {
                    DecodeError::Malformed(format!("negative array length {count}"))
                })?;
                if count > self.remaining {
                    return Err(DecodeError::Malformed(format!(
                        "array length {count} exceeds the {} items left",
                        self.remaining
                    )));
                }
                let mut raw = Vec::new();
                for _ in 0..count {
                    raw.push(self.int()?);
                }
                raw
            }
        };

        let mut values = Vec::with_capacity(raw.len());
        let mut sum = 0i64;
        for (i, v) in raw.into_iter().enumerate() {
            sum = if i == 0 {
                v
            } else {
                sum.checked_add(v)
                    .ok_or_else(|| DecodeError::Malformed("delta array overflows".to_string()))?
            };
            values.push(sum);
        }
        Ok(values)
    }
}

fn scaled_decimal(raw: i64, field: &FieldSpec) -> Result<Decimal> {
    raw.checked_mul(field.unit)
        .map(|units| Decimal::new(units, field.scale))
        .ok_or_else(|| DecodeError::Malformed(format!("field '{}' overflows", field.name)))
}

fn read_int(dec: &mut Decoder<'_>) -> Result<i64> {
    match dec.datatype().map_err(cbor_error)? {
        Type::U8 | Type::U16 | Type::U32 | Type::U64 | Type::I8 | Type::I16 | Type::I32
        | Type::I64 => dec.i64().map_err(cbor_error),
        other => Err(DecodeError::Malformed(format!(
            "expected an integer, got {other:?}"
        ))),
    }
}

fn read_text(dec: &mut Decoder<'_>) -> Result<String> {
    match dec.datatype().map_err(cbor_error)? {
        Type::String => Ok(dec.str().map_err(cbor_error)?.to_string()),
        Type::Bytes => Ok(String::from_utf8_lossy(dec.bytes().map_err(cbor_error)?).into_owned()),
        other => Err(DecodeError::Malformed(format!(
            "expected a string, got {other:?}"
        ))),
    }
}

fn read_scalar(dec: &mut Decoder<'_>, field: &FieldSpec) -> Result<Value> {
    match dec.datatype().map_err(cbor_error)? {
        kind @ (Type::F16 | Type::F32 | Type::F64) => {
            let raw = match kind {
                Type::F16 => f64::from(dec.f16().map_err(cbor_error)?),
                Type::F32 => f64::from(dec.f32().map_err(cbor_error)?),
                _ => dec.f64().map_err(cbor_error)?,
            };
            if field.scale == 0 && field.unit == 1 {
                Ok(Value::Float(raw))
            } else {
                Ok(Value::Float(
                    raw * field.unit as f64 * 10f64.powi(field.scale),
                ))
            }
        }
        Type::String | Type::Bytes => read_text(dec).map(Value::Text),
        _ => {
            let raw = read_int(dec)?;
            if field.scale == 0 && field.unit == 1 {
                Ok(Value::Int(raw))
            } else {
                scaled_decimal(raw, field).map(Value::Decimal)
            }
        }
    }
}

/// Decoder for RIOT CBOR frames.
#[derive(Debug, Clone)]
pub struct CompactCodec {
    registry: SensorRegistry,
}

impl CompactCodec {
    pub fn new(registry: SensorRegistry) -> Self {
        Self { registry }
    }

    /// Decode one frame. Each buffer holds exactly one frame, so the rest is always empty.
    pub fn decode<'a>(&self, data: &'a [u8]) -> Result<(DecodedFrame, &'a [u8])> {
        let mut dec = Decoder::new(data);
        let mut items = Items::open(&mut dec)?;

        let mut serial = None;
        let mut frame = DecodedFrame::new(FRAME_TYPE_INFO, 0, 0);

        while !items.is_done() {
            let key = items.key()?;
            let fields = self.registry.lookup(key)?;

            match key {
                KEY_SERIAL => {
                    let value = items.int()?;
                    serial = Some(u64::try_from(value).map_err(|_| {
                        DecodeError::Malformed(format!("negative serial number {value}"))
                    })?);
                }
                KEY_NAME => frame.name = Some(items.text()?),
                KEY_FRAME => {
                    let value = items.int()?;
                    frame.frame_sequence = u8::try_from(value).map_err(|_| {
                        DecodeError::Malformed(format!("frame sequence {value} out of range"))
                    })?;
                }
                _ => {
                    for field in fields {
                        match field.arity {
                            ArityKind::Single => {
                                let value = items.item(field)?;
                                frame.insert(field.name.as_str(), value);
                            }
                            ArityKind::FixedString => {
                                let value = items.text()?;
                                frame.insert(field.name.as_str(), Value::Text(value));
                            }
                            ArityKind::VariableArray => {
                                let values = items
                                    .delta_array()?
                                    .into_iter()
                                    .map(|raw| scaled_decimal(raw, field))
                                    .collect::<Result<Vec<_>>>()?;
                                frame.extend_array(&field.name, values);
                            }
                        }
                    }
                }
            }
        }

        frame.serial =
            serial.ok_or_else(|| DecodeError::Malformed("frame has no serial number".to_string()))?;

        let trailing = data.len() - dec.position();
        if trailing > 0 {
            debug!(trailing, "ignoring bytes after cbor frame");
        }

        debug!(
            serial = frame.serial,
            sequence = frame.frame_sequence,
            fields = frame.fields.len(),
            "decoded riot frame"
        );

        Ok((frame, &[]))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use minicbor::Encoder;
    use std::convert::Infallible;

    type EncodeResult = std::result::Result<(), minicbor::encode::Error<Infallible>>;

    pub(crate) fn encode(build: impl FnOnce(&mut Encoder<&mut Vec<u8>>) -> EncodeResult) -> Vec<u8> {
        let mut buf = Vec::new();
        build(&mut Encoder::new(&mut buf)).unwrap();
        buf
    }

    fn codec() -> CompactCodec {
        CompactCodec::new(SensorRegistry::riot())
    }

    #[test]
    fn test_decode_header_and_scaled_fields() {
        let bytes = encode(|e| {
            e.array(12)?
                .u8(1)?
                .u64(0xCAFE)?
                .u8(2)?
                .str("riot-1")?
                .u8(3)?
                .u8(9)?
                .u8(130)?
                .i64(2150)?
                .u8(131)?
                .i64(4512)?
                .u8(137)?
                .i64(1013)?;
            Ok(())
        });

        let (frame, rest) = codec().decode(&bytes).unwrap();

        assert!(rest.is_empty());
        assert_eq!(frame.frame_type, FRAME_TYPE_INFO);
        assert_eq!(frame.serial, 0xCAFE);
        assert_eq!(frame.name.as_deref(), Some("riot-1"));
        assert_eq!(frame.frame_sequence, 9);
        assert_eq!(frame.get("bme_tc"), Some(&Value::Decimal(Decimal::new(2150, -2))));
        assert_eq!(frame.get("bme_hum").and_then(Value::as_f64), Some(45.12));
        assert_eq!(frame.get("bme_pres").and_then(Value::as_f64), Some(101300.0));
    }

    #[test]
    fn test_unscaled_int_stays_int() {
        let bytes = encode(|e| {
            e.array(4)?.u8(1)?.u8(7)?.u8(0)?.u32(1_600_000_000)?;
            Ok(())
        });

        let (frame, _) = codec().decode(&bytes).unwrap();

        assert_eq!(frame.get("tst"), Some(&Value::Int(1_600_000_000)));
    }

    #[test]
    fn test_float_is_scaled() {
        let bytes = encode(|e| {
            e.array(4)?.u8(1)?.u8(7)?.u8(137)?.f64(10.0)?;
            Ok(())
        });

        let (frame, _) = codec().decode(&bytes).unwrap();

        assert_eq!(frame.get("bme_pres"), Some(&Value::Float(1000.0)));
    }

    #[test]
    fn test_delta_array_with_count_item() {
        let registry = SensorRegistry::riot().with(200, vec![FieldSpec::array("t", -1)]);
        let bytes = encode(|e| {
            e.array(7)?
                .u8(1)?
                .u8(7)?
                .u8(200)?
                .u8(3)?
                .i64(100)?
                .i64(5)?
                .i64(-20)?;
            Ok(())
        });

        let (frame, _) = CompactCodec::new(registry).decode(&bytes).unwrap();

        let expected = vec![
            Decimal::new(100, -1),
            Decimal::new(105, -1),
            Decimal::new(85, -1),
        ];
        assert_eq!(frame.get("t"), Some(&Value::Array(expected)));
    }

    #[test]
    fn test_delta_array_with_nested_array() {
        let registry = SensorRegistry::riot().with(200, vec![FieldSpec::array("t", 0)]);
        let bytes = encode(|e| {
            e.array(4)?.u8(1)?.u8(7)?.u8(200)?.array(2)?.i64(10)?.i64(3)?;
            Ok(())
        });

        let (frame, _) = CompactCodec::new(registry).decode(&bytes).unwrap();

        let expected = vec![Decimal::new(10, 0), Decimal::new(13, 0)];
        assert_eq!(frame.get("t"), Some(&Value::Array(expected)));
    }

    #[test]
    fn test_unknown_key() {
        let bytes = encode(|e| {
            e.array(4)?.u8(1)?.u8(7)?.u8(99)?.u8(0)?;
            Ok(())
        });

        assert_eq!(codec().decode(&bytes), Err(DecodeError::UnknownSensor(99)));
    }

    #[test]
    fn test_missing_serial_is_malformed() {
        let bytes = encode(|e| {
            e.array(2)?.u8(130)?.i64(1)?;
            Ok(())
        });

        assert!(matches!(
            codec().decode(&bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_wrong_item_type_is_malformed() {
        let bytes = encode(|e| {
            e.array(4)?.u8(1)?.u8(7)?.u8(130)?.bool(true)?;
            Ok(())
        });

        assert!(matches!(
            codec().decode(&bytes),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_end_of_input_is_truncation() {
        let bytes = encode(|e| {
            e.array(6)?
                .u8(1)?
                .u64(0xDEAD_BEEF)?
                .u8(2)?
                .str("name")?
                .u8(130)?
                .i64(1234)?;
            Ok(())
        });
        let codec = codec();

        assert!(codec.decode(&bytes).is_ok());
        for len in 0..bytes.len() {
            let result = codec.decode(&bytes[..len]);
            assert!(
                matches!(result, Err(DecodeError::TruncatedFrame { .. })),
                "prefix of {len} bytes gave {result:?}"
            );
        }
    }

    #[test]
    fn test_huge_delta_count_runs_out_of_input() {
        // The outer array claims enough items, so only the input length bounds the count.
        let registry = SensorRegistry::riot().with(200, vec![FieldSpec::array("t", 0)]);
        let bytes = encode(|e| {
            e.array(u64::MAX)?.u8(1)?.u8(7)?.u8(200)?.u64(1 << 62)?;
            Ok(())
        });

        let result = CompactCodec::new(registry).decode(&bytes);

        assert!(
            matches!(result, Err(DecodeError::TruncatedFrame { .. })),
            "got {result:?}"
        );
    }

    #[test]
    fn test_delta_count_beyond_array_is_malformed() {
        let registry = SensorRegistry::riot().with(200, vec![FieldSpec::array("t", 0)]);
        let bytes = encode(|e| {
            e.array(6)?.u8(1)?.u8(7)?.u8(200)?.u8(5)?.i64(1)?.i64(2)?;
            Ok(())
        });

        let result = CompactCodec::new(registry).decode(&bytes);

        assert!(matches!(result, Err(DecodeError::Malformed(_))), "got {result:?}");
    }

    #[test]
    fn test_delta_overflow_is_malformed() {
        let registry = SensorRegistry::riot().with(200, vec![FieldSpec::array("t", 0)]);
        let nested = encode(|e| {
            e.array(4)?.u8(1)?.u8(7)?.u8(200)?.array(2)?.i64(i64::MAX)?.i64(1)?;
            Ok(())
        });
        let counted = encode(|e| {
            e.array(6)?
                .u8(1)?
                .u8(7)?
                .u8(200)?
                .u8(2)?
                .i64(i64::MIN)?
                .i64(-1)?;
            Ok(())
        });
        let codec = CompactCodec::new(registry);

        for bytes in [nested, counted] {
            let result = codec.decode(&bytes);
            assert!(matches!(result, Err(DecodeError::Malformed(_))), "got {result:?}");
        }
    }

    #[test]
    fn test_unit_overflow_is_malformed() {
        let registry = SensorRegistry::riot()
            .with(200, vec![FieldSpec::array("t", -4).with_unit(625)])
            .with(201, vec![FieldSpec::scalar("w", 0).with_unit(1000)]);
        let array = encode(|e| {
            e.array(4)?.u8(1)?.u8(7)?.u8(200)?.array(1)?.i64(i64::MAX / 2)?;
            Ok(())
        });
        let scalar = encode(|e| {
            e.array(4)?.u8(1)?.u8(7)?.u8(201)?.i64(i64::MIN / 10)?;
            Ok(())
        });
        let codec = CompactCodec::new(registry);

        for bytes in [array, scalar] {
            let result = codec.decode(&bytes);
            assert!(matches!(result, Err(DecodeError::Malformed(_))), "got {result:?}");
        }
    }

    #[test]
    fn test_truncation_at_every_item_boundary() {
        let registry = SensorRegistry::riot().with(200, vec![FieldSpec::array("t", -1)]);
        let bytes = encode(|e| {
            e.array(10)?
                .u8(1)?
                .u64(u64::from(u32::MAX) + 1)?
                .u8(2)?
                .bytes(b"mote")?
                .u8(137)?
                .f32(1013.25)?
                .u8(200)?
                .array(3)?
                .i64(-300)?
                .i64(70_000)?
                .i64(-1)?
                .u8(3)?
                .u8(200)?;
            Ok(())
        });
        let codec = CompactCodec::new(registry);

        assert!(codec.decode(&bytes).is_ok());
        for len in 0..bytes.len() {
            let result = codec.decode(&bytes[..len]);
            assert!(
                matches!(result, Err(DecodeError::TruncatedFrame { .. })),
                "prefix of {len} bytes gave {result:?}"
            );
        }
    }

    #[test]
    fn test_odd_item_count_is_malformed() {
        let bytes = encode(|e| {
            e.array(3)?.u8(1)?.u8(7)?.u8(130)?;
            Ok(())
        });

        assert!(matches!(
            codec().decode(&bytes),
            Err(DecodeError::Malformed(_))
        ));
    }
}
