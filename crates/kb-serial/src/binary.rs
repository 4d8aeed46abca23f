//! A pluggable binary codec for [`Hash`](kb_common::Hash).
//!
//! The wire format a concrete [`HashSerializer`] produces is not specified
//! by spec.md ("the serialization format of `Hash` itself" is explicitly
//! out of scope) — only the contract is: map a `Hash` to/from a contiguous
//! byte sequence, support appending without resetting (so a header and a
//! body, or a `Hash` and a trailing schema attachment, can share one
//! buffer), and round-trip exactly (spec §8: `fullyEquals`).

use kb_common::{ErrorCode, Hash, HashValue, KaraboError, Result};

/// Encodes/decodes a [`Hash`] to/from bytes.
///
/// `save` is append-mode: it writes onto the end of `buf` without
/// truncating it, so callers can serialize header then body into one
/// contiguous buffer (spec §4.3) or append a schema attachment onto an
/// already-serialized `Hash` (spec §3, schema attachments).
pub trait HashSerializer: Send + Sync {
    fn save(&self, hash: &Hash, buf: &mut Vec<u8>) -> Result<()>;

    /// Decode one `Hash` starting at `buf`, returning it plus the number of
    /// bytes consumed so the caller can continue decoding a following blob
    /// from the same buffer.
    fn load(&self, buf: &[u8]) -> Result<(Hash, usize)>;

    fn save_one_shot(&self, hash: &Hash) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.save(hash, &mut buf)?;
        Ok(buf)
    }

    fn load_one_shot(&self, buf: &[u8]) -> Result<Hash> {
        let (hash, _consumed) = self.load(buf)?;
        Ok(hash)
    }

    /// Append a raw schema attachment onto `buf` without resetting it.
    /// Schema content itself is out of scope; this only needs to preserve
    /// the attach-without-reset contract described in spec §3.
    fn append_schema(&self, schema_bytes: &[u8], buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&(schema_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(schema_bytes);
        Ok(())
    }
}

const TAG_STRING: u8 = 0;
const TAG_INT64: u8 = 1;
const TAG_DOUBLE: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_VEC_STRING: u8 = 5;

/// The default, self-contained binary format: a length-prefixed,
/// tag-per-value encoding. Good enough to carry the header/body envelope
/// across the wire; any other pluggable serializer need only honor the
/// [`HashSerializer`] trait above.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryV1Serializer;

impl BinaryV1Serializer {
    pub fn new() -> Self {
        Self
    }

    fn write_str(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    fn read_str<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a str> {
        let len = Self::read_u32(buf, pos)? as usize;
        let end = *pos + len;
        if end > buf.len() {
            return Err(truncated());
        }
        let s = std::str::from_utf8(&buf[*pos..end])
            .map_err(|e| KaraboError::with_source(ErrorCode::IoError, "invalid utf8 in Hash string", e))?;
        *pos = end;
        Ok(s)
    }

    fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
        if *pos + 4 > buf.len() {
            return Err(truncated());
        }
        let v = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
        *pos += 4;
        Ok(v)
    }

    fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
        if *pos + 1 > buf.len() {
            return Err(truncated());
        }
        let v = buf[*pos];
        *pos += 1;
        Ok(v)
    }
}

fn truncated() -> KaraboError {
    KaraboError::new(ErrorCode::IoError, "truncated Hash buffer")
}

impl HashSerializer for BinaryV1Serializer {
    fn save(&self, hash: &Hash, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&(hash.len() as u32).to_le_bytes());
        for (key, value) in hash.iter() {
            Self::write_str(buf, key);
            match value {
                HashValue::String(s) => {
                    buf.push(TAG_STRING);
                    Self::write_str(buf, s);
                }
                HashValue::Int64(v) => {
                    buf.push(TAG_INT64);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                HashValue::Double(v) => {
                    buf.push(TAG_DOUBLE);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                HashValue::Bool(v) => {
                    buf.push(TAG_BOOL);
                    buf.push(if *v { 1 } else { 0 });
                }
                HashValue::Bytes(b) => {
                    buf.push(TAG_BYTES);
                    buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                    buf.extend_from_slice(b);
                }
                HashValue::VecString(vs) => {
                    buf.push(TAG_VEC_STRING);
                    buf.extend_from_slice(&(vs.len() as u32).to_le_bytes());
                    for s in vs {
                        Self::write_str(buf, s);
                    }
                }
            }
        }
        Ok(())
    }

    fn load(&self, buf: &[u8]) -> Result<(Hash, usize)> {
        let mut pos = 0usize;
        let count = Self::read_u32(buf, &mut pos)?;
        let mut hash = Hash::new();
        for _ in 0..count {
            let key = Self::read_str(buf, &mut pos)?.to_string();
            let tag = Self::read_u8(buf, &mut pos)?;
            match tag {
                TAG_STRING => {
                    let s = Self::read_str(buf, &mut pos)?.to_string();
                    hash.set(key, s);
                }
                TAG_INT64 => {
                    if pos + 8 > buf.len() {
                        return Err(truncated());
                    }
                    let v = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
                    pos += 8;
                    hash.set(key, v);
                }
                TAG_DOUBLE => {
                    if pos + 8 > buf.len() {
                        return Err(truncated());
                    }
                    let v = f64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
                    pos += 8;
                    hash.set(key, v);
                }
                TAG_BOOL => {
                    let v = Self::read_u8(buf, &mut pos)? != 0;
                    hash.set(key, v);
                }
                TAG_BYTES => {
                    let len = Self::read_u32(buf, &mut pos)? as usize;
                    let end = pos + len;
                    if end > buf.len() {
                        return Err(truncated());
                    }
                    hash.set(key, HashValue::Bytes(buf[pos..end].to_vec()));
                    pos = end;
                }
                TAG_VEC_STRING => {
                    let n = Self::read_u32(buf, &mut pos)?;
                    let mut vs = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        vs.push(Self::read_str(buf, &mut pos)?.to_string());
                    }
                    hash.set(key, HashValue::VecString(vs));
                }
                other => {
                    return Err(KaraboError::new(
                        ErrorCode::IoError,
                        format!("unknown Hash value tag {other}"),
                    ))
                }
            }
        }
        Ok((hash, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_header_then_body_in_one_buffer() {
        let ser = BinaryV1Serializer::new();
        let mut header = Hash::new();
        header.set("signalInstanceId", "alice").set("orderNumber", 3i64);
        let mut body = Hash::new();
        body.set("payload", HashValue::Bytes(vec![1, 2, 3])).set("ok", true);

        let mut buf = Vec::new();
        ser.save(&header, &mut buf).unwrap();
        let header_len = buf.len();
        ser.save(&body, &mut buf).unwrap();

        let (decoded_header, consumed) = ser.load(&buf).unwrap();
        assert_eq!(consumed, header_len);
        assert!(decoded_header.fully_equals(&header));

        let (decoded_body, _) = ser.load(&buf[consumed..]).unwrap();
        assert!(decoded_body.fully_equals(&body));
    }

    #[test]
    fn truncated_buffer_is_io_error() {
        let ser = BinaryV1Serializer::new();
        let err = ser.load(&[1, 0, 0]).unwrap_err();
        assert_eq!(err.code, ErrorCode::IoError);
    }

    #[test]
    fn append_schema_does_not_reset_buffer() {
        let ser = BinaryV1Serializer::new();
        let mut buf = vec![0xAA, 0xBB];
        ser.append_schema(b"schema-bytes", &mut buf).unwrap();
        assert_eq!(&buf[0..2], &[0xAA, 0xBB]);
    }
}
