//! Waspmote binary frames.
//!
//! ```text
//! <=> | type:u8 | n:u8 | body[n] | rest...
//! body (plain)     = serial:u32be|u64be  name '#'  seq:u8  (sensor:u8 fields...)*
//! body (encrypted) = serial:u32be|u64be [name '#' (v1 only)]  AES-ECB(<=> plain frame)
//! ```
//!
//! Types 0-5 are v1 frames with a 32-bit serial, 6-11 are v2 frames with a 64-bit
//! serial (the frame type is rebased by 6), 96 is an encrypted v2 frame and 97-99
//! are encrypted v1 frames. Types with the high bit set are text frames.

use crate::cipher::FrameCipher;
use crate::registry::{ArityKind, FieldSpec, SensorRegistry, WireType};
use crate::value::{Decimal, DecodedFrame, Value};
use crate::{DecodeError, Result};
use tracing::{debug, warn};

pub const START_DELIMITER: &[u8; 3] = b"<=>";
pub const NAME_TERMINATOR: u8 = b'#';

const TEXT_FRAME_BIT: u8 = 0x80;
const V2_TYPE_OFFSET: u8 = 6;
const ENCRYPTED_V2: u8 = 96;
const ENCRYPTED_V1_FIRST: u8 = 97;
const ENCRYPTED_V1_LAST: u8 = 99;
const DELTA_ESCAPE: i8 = i8::MIN;

/// Frame layout generation, which decides the width of the serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// 32-bit serial.
    V1,
    /// 64-bit serial.
    V2,
}

impl Version {
    fn serial_width(&self) -> usize {
        match self {
            Version::V1 => 4,
            Version::V2 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameClass {
    Plain { version: Version, frame_type: u8 },
    Encrypted { version: Version },
}

fn classify(code: u8) -> Result<FrameClass> {
    if code & TEXT_FRAME_BIT != 0 {
        return Err(DecodeError::UnsupportedFrame(format!(
            "text frames are not supported (type {code})"
        )));
    }

    match code {
        0..=5 => Ok(FrameClass::Plain {
            version: Version::V1,
            frame_type: code,
        }),
        6..=11 => Ok(FrameClass::Plain {
            version: Version::V2,
            frame_type: code - V2_TYPE_OFFSET,
        }),
        ENCRYPTED_V2 => Ok(FrameClass::Encrypted {
            version: Version::V2,
        }),
        ENCRYPTED_V1_FIRST..=ENCRYPTED_V1_LAST => Ok(FrameClass::Encrypted {
            version: Version::V1,
        }),
        other => Err(DecodeError::UnsupportedFrame(format!(
            "frame type {other} is not supported"
        ))),
    }
}

/// Split `data` at the first start delimiter: `(garbage, frame)`.
///
/// When no delimiter is present the whole input is garbage and `frame` is empty.
/// A trailing partial delimiter is kept on the frame side so it can complete later.
pub fn search_frame(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(index) = data
        .windows(START_DELIMITER.len())
        .position(|w| w == START_DELIMITER)
    {
        return data.split_at(index);
    }

    for keep in (1..START_DELIMITER.len()).rev() {
        if data.len() >= keep && data[data.len() - keep..] == START_DELIMITER[..keep] {
            return data.split_at(data.len() - keep);
        }
    }

    (data, &[])
}

/// Bounds-checked cursor. Every short read is reported as a truncation.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(DecodeError::truncated(n, self.remaining()));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.array()?))
    }

    fn i16_le(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    fn u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn f32_le(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn serial(&mut self, version: Version) -> Result<u64> {
        match version {
            Version::V1 => Ok(u64::from(u32::from_be_bytes(self.array()?))),
            Version::V2 => Ok(u64::from_be_bytes(self.array()?)),
        }
    }

    /// Bytes up to the next `terminator`, which is consumed but not returned.
    fn until(&mut self, terminator: u8) -> Option<&'a [u8]> {
        let offset = self.rest().iter().position(|b| *b == terminator)?;
        let bytes = &self.buf[self.pos..self.pos + offset];
        self.pos += offset + 1;
        Some(bytes)
    }
}

fn decode_text(bytes: &[u8], what: &str) -> Result<String> {
    let trimmed = match bytes.iter().position(|b| *b == 0) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    };
    String::from_utf8(trimmed.to_vec())
        .map_err(|_| DecodeError::Malformed(format!("{what} is not valid UTF-8")))
}

fn read_name(reader: &mut Reader<'_>) -> Result<String> {
    let name = reader
        .until(NAME_TERMINATOR)
        .ok_or_else(|| DecodeError::Malformed("name terminator '#' not found".to_string()))?;
    decode_text(name, "device name")
}

fn scaled_decimal(raw: i64, field: &FieldSpec) -> Result<Decimal> {
    raw.checked_mul(field.unit)
        .map(|units| Decimal::new(units, field.scale))
        .ok_or_else(|| DecodeError::Malformed(format!("field '{}' overflows", field.name)))
}

fn scaled_int(raw: i64, field: &FieldSpec) -> Result<Value> {
    scaled_decimal(raw, field).map(Value::Decimal)
}

fn read_single(reader: &mut Reader<'_>, field: &FieldSpec) -> Result<Value> {
    let plain = field.scale == 0 && field.unit == 1;
    let value = match field.wire {
        WireType::F32 => {
            let raw = f64::from(reader.f32_le()?);
            if plain {
                Value::Float(raw)
            } else {
                Value::Float(raw * field.unit as f64 * 10f64.powi(field.scale))
            }
        }
        WireType::I16 => {
            let raw = i64::from(reader.i16_le()?);
            if plain {
                Value::Int(raw)
            } else {
                scaled_int(raw, field)?
            }
        }
        WireType::U8 => {
            let raw = reader.u8()?;
            if plain {
                Value::Byte(raw)
            } else {
                scaled_int(i64::from(raw), field)?
            }
        }
        WireType::U32 => {
            let raw = i64::from(reader.u32_le()?);
            if plain {
                Value::Int(raw)
            } else {
                scaled_int(raw, field)?
            }
        }
        WireType::SelfDescribing => {
            return Err(DecodeError::Malformed(format!(
                "field '{}' has no binary encoding",
                field.name
            )))
        }
    };
    Ok(value)
}

/// Delta-compressed i16 array: count, absolute first value, then i8 deltas.
/// A delta of -128 means the next value is an absolute i16.
fn read_delta_array(reader: &mut Reader<'_>) -> Result<Vec<i64>> {
    let count = usize::from(reader.u8()?);
    let mut values: Vec<i64> = Vec::with_capacity(count);

    for _ in 0..count {
        if let Some(last) = values.last().copied() {
            let delta = reader.i8()?;
            if delta != DELTA_ESCAPE {
                values.push(last + i64::from(delta));
                continue;
            }
        }
        values.push(i64::from(reader.i16_le()?));
    }

    Ok(values)
}

/// Decoder for the Waspmote binary formats, plain and encrypted.
#[derive(Debug, Clone)]
pub struct LegacyCodec {
    registry: SensorRegistry,
    cipher: Option<FrameCipher>,
    verify_name: bool,
}

impl LegacyCodec {
    pub fn new(registry: SensorRegistry) -> Self {
        Self {
            registry,
            cipher: None,
            verify_name: true,
        }
    }

    pub fn with_cipher(mut self, cipher: FrameCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Whether the cleartext name of an encrypted frame must match the decrypted one.
    pub fn with_name_verification(mut self, verify: bool) -> Self {
        self.verify_name = verify;
        self
    }

    /// Decode the first frame in `data`, skipping any garbage before the delimiter.
    pub fn decode<'a>(&self, data: &'a [u8]) -> Result<(DecodedFrame, &'a [u8])> {
        let (garbage, frame) = search_frame(data);
        if !garbage.is_empty() {
            warn!(
                garbage_bytes = garbage.len(),
                "discarding bytes before frame delimiter"
            );
        }
        if frame.is_empty() {
            return Err(DecodeError::Malformed(
                "frame start delimiter not found".to_string(),
            ));
        }
        if frame.len() < START_DELIMITER.len() {
            return Err(DecodeError::truncated(START_DELIMITER.len(), frame.len()));
        }

        self.decode_after_delimiter(&frame[START_DELIMITER.len()..])
    }

    /// The bytes after the first frame in `data`, once its header and body are complete.
    ///
    /// Used to step over a frame that failed to decode without losing the frames behind it.
    pub fn skip_frame<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        let (_, frame) = search_frame(data);
        let after = frame.get(START_DELIMITER.len()..)?;
        let length = usize::from(*after.get(1)?);
        after.get(2 + length..)
    }

    /// Decode a frame whose start delimiter has already been consumed.
    pub fn decode_after_delimiter<'a>(&self, data: &'a [u8]) -> Result<(DecodedFrame, &'a [u8])> {
        let mut reader = Reader::new(data);

        let class = classify(reader.u8()?)?;
        let length = usize::from(reader.u8()?);
        let body = reader.take(length)?;
        let rest = reader.rest();

        let frame = match class {
            FrameClass::Plain {
                version,
                frame_type,
            } => self
                .decode_plain(body, version, frame_type)
                .map_err(incomplete_body)?,
            FrameClass::Encrypted { version } => self
                .decode_encrypted(body, version)
                .map_err(incomplete_body)?,
        };

        debug!(
            serial = frame.serial,
            sequence = frame.frame_sequence,
            fields = frame.fields.len(),
            rest = rest.len(),
            "decoded waspmote frame"
        );

        Ok((frame, rest))
    }

    fn decode_plain(&self, body: &[u8], version: Version, frame_type: u8) -> Result<DecodedFrame> {
        let mut reader = Reader::new(body);

        let serial = reader.serial(version)?;
        let name = read_name(&mut reader)?;
        let sequence = reader.u8()?;

        let mut frame = DecodedFrame::new(frame_type, serial, sequence);
        frame.name = Some(name);

        while !reader.is_empty() {
            let sensor = reader.u8()?;
            for field in self.registry.lookup(u64::from(sensor))? {
                match field.arity {
                    ArityKind::Single => {
                        let value = read_single(&mut reader, field)?;
                        frame.insert(field.name.as_str(), value);
                    }
                    ArityKind::FixedString => {
                        let len = usize::from(reader.u8()?);
                        let text = decode_text(reader.take(len)?, &field.name)?;
                        frame.insert(field.name.as_str(), Value::Text(text));
                    }
                    ArityKind::VariableArray => {
                        let values = read_delta_array(&mut reader)?
                            .into_iter()
                            .map(|raw| scaled_decimal(raw, field))
                            .collect::<Result<Vec<_>>>()?;
                        frame.extend_array(&field.name, values);
                    }
                }
            }
        }

        Ok(frame)
    }

    fn decode_encrypted(&self, body: &[u8], version: Version) -> Result<DecodedFrame> {
        let mut reader = Reader::new(body);

        let serial = reader.serial(version)?;
        let outer_name = match version {
            Version::V1 => Some(read_name(&mut reader)?),
            Version::V2 => None,
        };

        let cipher = self.cipher.as_ref().ok_or(DecodeError::MissingKey)?;
        let plaintext = cipher.decrypt(reader.rest())?;

        let inner = plaintext
            .strip_prefix(START_DELIMITER.as_slice())
            .ok_or_else(|| {
                DecodeError::IntegrityError("decrypted data is not a frame (wrong key?)".to_string())
            })?;

        let mut inner_reader = Reader::new(inner);
        let inner_class = classify(inner_reader.u8().map_err(incomplete_plaintext)?)?;
        match inner_class {
            FrameClass::Plain {
                version: inner_version,
                ..
            } if inner_version == version => {}
            FrameClass::Plain { .. } => {
                return Err(DecodeError::IntegrityError(
                    "decrypted frame version differs from the envelope".to_string(),
                ))
            }
            FrameClass::Encrypted { .. } => {
                return Err(DecodeError::UnsupportedFrame(
                    "nested encrypted frame".to_string(),
                ))
            }
        }

        // Trailing bytes of the plaintext are block padding.
        let (frame, _padding) = self
            .decode_after_delimiter(inner)
            .map_err(incomplete_plaintext)?;

        if frame.serial != serial {
            return Err(DecodeError::IntegrityError(format!(
                "serial numbers do not match: {} != {}",
                serial, frame.serial
            )));
        }

        if let Some(outer_name) = outer_name {
            let inner_name = frame.name.as_deref().unwrap_or_default();
            if self.verify_name && inner_name != outer_name {
                return Err(DecodeError::IntegrityError(format!(
                    "names do not match: {outer_name} != {inner_name}"
                )));
            }
        }

        Ok(frame)
    }
}

/// The body length was honest, so running out of bytes inside it is not retryable.
fn incomplete_body(err: DecodeError) -> DecodeError {
    match err {
        DecodeError::TruncatedFrame { needed, available } => DecodeError::Malformed(format!(
            "field needs {needed} bytes, body has {available} left"
        )),
        other => other,
    }
}

/// The ciphertext was complete, so running out of plaintext is not retryable.
fn incomplete_plaintext(err: DecodeError) -> DecodeError {
    match err {
        DecodeError::TruncatedFrame { .. } => {
            DecodeError::Malformed("decrypted frame is incomplete".to_string())
        }
        other => other,
    }
}
