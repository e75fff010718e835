use std::{collections::BTreeSet, fmt};

use super::PrefsError;

/// Kind of a stored preference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefType {
    String,
    StringSet,
    Int,
    Long,
    Float,
    Bool,
}

impl PrefType {
    fn tag(self) -> u32 {
        match self {
            PrefType::String => 0,
            PrefType::StringSet => 1,
            PrefType::Int => 2,
            PrefType::Long => 3,
            PrefType::Float => 4,
            PrefType::Bool => 5,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => PrefType::String,
            1 => PrefType::StringSet,
            2 => PrefType::Int,
            3 => PrefType::Long,
            4 => PrefType::Float,
            5 => PrefType::Bool,
            _ => return None,
        })
    }
}

impl fmt::Display for PrefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrefType::String => "string",
            PrefType::StringSet => "string-set",
            PrefType::Int => "int",
            PrefType::Long => "long",
            PrefType::Float => "float",
            PrefType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A typed preference value.
#[derive(Debug, Clone, PartialEq)]
pub enum PrefValue {
    String(String),
    StringSet(BTreeSet<String>),
    Int(i32),
    Long(i64),
    Float(f32),
    Bool(bool),
}

impl PrefValue {
    pub fn kind(&self) -> PrefType {
        match self {
            PrefValue::String(_) => PrefType::String,
            PrefValue::StringSet(_) => PrefType::StringSet,
            PrefValue::Int(_) => PrefType::Int,
            PrefValue::Long(_) => PrefType::Long,
            PrefValue::Float(_) => PrefType::Float,
            PrefValue::Bool(_) => PrefType::Bool,
        }
    }

    /// Serialize into the tagged binary form that gets encrypted at rest:
    /// a big-endian `u32` type tag followed by the payload. Fails only for
    /// strings too long for a `u32` length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, PrefsError> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.kind().tag().to_be_bytes());
        match self {
            PrefValue::String(s) => put_str(&mut out, s)?,
            PrefValue::StringSet(set) => {
                for item in set {
                    put_str(&mut out, item)?;
                }
            }
            PrefValue::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            PrefValue::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
            PrefValue::Float(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
            PrefValue::Bool(v) => out.push(u8::from(*v)),
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PrefsError> {
        let mut reader = Reader { buf: bytes };
        let tag = u32::from_be_bytes(reader.take_array()?);
        let kind =
            PrefType::from_tag(tag).ok_or_else(|| codec_err(format!("unknown type tag {tag}")))?;

        let value = match kind {
            PrefType::String => PrefValue::String(reader.take_str()?),
            PrefType::StringSet => {
                let mut set = BTreeSet::new();
                while !reader.is_empty() {
                    set.insert(reader.take_str()?);
                }
                PrefValue::StringSet(set)
            }
            PrefType::Int => PrefValue::Int(i32::from_be_bytes(reader.take_array()?)),
            PrefType::Long => PrefValue::Long(i64::from_be_bytes(reader.take_array()?)),
            PrefType::Float => {
                PrefValue::Float(f32::from_bits(u32::from_be_bytes(reader.take_array()?)))
            }
            PrefType::Bool => match reader.take_array::<1>()? {
                [0] => PrefValue::Bool(false),
                [1] => PrefValue::Bool(true),
                [other] => return Err(codec_err(format!("invalid bool byte {other}"))),
            },
        };

        if !reader.is_empty() {
            return Err(codec_err("trailing bytes after value"));
        }
        Ok(value)
    }
}

impl From<&str> for PrefValue {
    fn from(value: &str) -> Self {
        PrefValue::String(value.to_string())
    }
}

impl From<String> for PrefValue {
    fn from(value: String) -> Self {
        PrefValue::String(value)
    }
}

impl From<i32> for PrefValue {
    fn from(value: i32) -> Self {
        PrefValue::Int(value)
    }
}

impl From<i64> for PrefValue {
    fn from(value: i64) -> Self {
        PrefValue::Long(value)
    }
}

impl From<f32> for PrefValue {
    fn from(value: f32) -> Self {
        PrefValue::Float(value)
    }
}

impl From<bool> for PrefValue {
    fn from(value: bool) -> Self {
        PrefValue::Bool(value)
    }
}

impl From<BTreeSet<String>> for PrefValue {
    fn from(value: BTreeSet<String>) -> Self {
        PrefValue::StringSet(value)
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), PrefsError> {
    out.extend_from_slice(&frame_len(s.len())?.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn frame_len(len: usize) -> Result<u32, PrefsError> {
    u32::try_from(len).map_err(|_| codec_err(format!("string of {len} bytes is too long")))
}

fn codec_err(reason: impl Into<String>) -> PrefsError {
    PrefsError::Codec(reason.into())
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PrefsError> {
        if self.buf.len() < len {
            return Err(codec_err(format!(
                "truncated value: need {len} bytes, have {}",
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PrefsError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn take_str(&mut self) -> Result<String, PrefsError> {
        let len = u32::from_be_bytes(self.take_array()?) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| codec_err(e.to_string()))
    }
}
