// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EncodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
            }
        )
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// Invalid enum tag (type name, raw tag)
    InvalidTag((&'static str, u8)),

    /// A length field does not match the remaining input
    InvalidLength(&'static str),

    /// A string field holds invalid UTF-8 (field name)
    InvalidUtf8(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecodeError({self:?})")
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for DecodeError {}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("cannot fail");
        v
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;

    /// Deserializes from a byte slice.
    fn decode_from_slice(bytes: &[u8]) -> Result<Self, DecodeError>
    where
        Self: Sized,
    {
        let mut cursor = std::io::Cursor::new(bytes);
        Self::decode_from(&mut cursor)
    }
}

/// Reads a length-prefixed byte string.
pub(crate) fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>, DecodeError> {
    use varint_rs::VarintReader;

    let len = reader.read_u32_varint()? as usize;
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a length-prefixed byte string.
pub(crate) fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), EncodeError> {
    use varint_rs::VarintWriter;

    // NOTE: Truncation is okay, values are length-checked on construction
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}
