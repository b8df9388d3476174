//! Native buffers and the length-prefixed frame codec.
//!
//! A [`NativeBuffer`] carries serialized complex values (strings, records,
//! sequences) across the boundary. Conversions take the buffer by value, so
//! ownership moves with the bytes and the allocation is released exactly once.
//!
//! Framed payloads use big-endian scalars, an `i32` length prefix for byte
//! strings and sequences, and a one byte tag for optional values.

use crate::error::{BridgeError, Result};

/// Tag byte for an absent optional value
pub const OPTION_NONE: u8 = 0;

/// Tag byte for a present optional value
pub const OPTION_SOME: u8 = 1;

/// A length-tagged byte buffer owned by the native side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeBuffer {
    data: Vec<u8>,
}

impl NativeBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of existing bytes
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Exact payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is zero-length
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the payload
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Release the buffer, returning its bytes
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for NativeBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

/// Copy host bytes into a newly allocated native buffer
pub fn to_native_buffer(bytes: &[u8]) -> NativeBuffer {
    let mut data = Vec::with_capacity(bytes.len());
    data.extend_from_slice(bytes);
    NativeBuffer { data }
}

/// Hand a native buffer back to the host, releasing it
pub fn to_host_bytes(buffer: NativeBuffer) -> Vec<u8> {
    buffer.into_vec()
}

/// UTF-8 byte length of a host string
pub fn string_byte_length(value: &str) -> usize {
    value.len()
}

/// Encode a string as UTF-8 into an exactly sized native buffer
pub fn string_to_buffer(value: &str) -> NativeBuffer {
    let len = string_byte_length(value);
    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(value.as_bytes());
    NativeBuffer { data }
}

/// Decode a UTF-8 native buffer into a host string
pub fn buffer_to_string(buffer: NativeBuffer) -> Result<String> {
    String::from_utf8(buffer.into_vec())
        .map_err(|e| BridgeError::decode(format!("Buffer is not valid UTF-8: {}", e)))
}

/// Writer for framed payloads
#[derive(Debug, Default)]
pub struct FrameWriter {
    data: Vec<u8>,
}

impl FrameWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an unsigned byte
    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    /// Write a signed byte
    pub fn write_i8(&mut self, value: i8) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a big-endian `u16`
    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a big-endian `i16`
    pub fn write_i16(&mut self, value: i16) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a big-endian `u32`
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a big-endian `i32`
    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a big-endian `u64`
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a big-endian `i64`
    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a big-endian `f32`
    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a big-endian `f64`
    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a length-prefixed byte string
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<&mut Self> {
        self.write_len(value.len())?;
        self.data.extend_from_slice(value);
        Ok(self)
    }

    /// Write a length-prefixed UTF-8 string
    pub fn write_string(&mut self, value: &str) -> Result<&mut Self> {
        self.write_bytes(value.as_bytes())
    }

    /// Write a tagged optional value
    pub fn write_optional<T>(
        &mut self,
        value: Option<&T>,
        write: impl FnOnce(&mut Self, &T) -> Result<()>,
    ) -> Result<&mut Self> {
        match value {
            None => {
                self.write_u8(OPTION_NONE);
            }
            Some(inner) => {
                self.write_u8(OPTION_SOME);
                write(&mut *self, inner)?;
            }
        }
        Ok(self)
    }

    /// Write a count-prefixed sequence
    pub fn write_sequence<T>(
        &mut self,
        items: &[T],
        mut write: impl FnMut(&mut Self, &T) -> Result<()>,
    ) -> Result<&mut Self> {
        self.write_len(items.len())?;
        for item in items {
            write(&mut *self, item)?;
        }
        Ok(self)
    }

    /// Finish into a native buffer
    pub fn finish(self) -> NativeBuffer {
        NativeBuffer { data: self.data }
    }

    fn write_len(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len).map_err(|_| {
            BridgeError::encode(format!("Length {} does not fit a frame prefix", len))
        })?;
        self.write_i32(len);
        Ok(())
    }
}

/// Reader for framed payloads
#[derive(Debug)]
pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

macro_rules! read_scalar {
    ($name:ident, $ty:ty) => {
        #[doc = concat!("Read a big-endian `", stringify!($ty), "`")]
        pub fn $name(&mut self) -> Result<$ty> {
            let bytes = self.take(std::mem::size_of::<$ty>())?;
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(bytes);
            Ok(<$ty>::from_be_bytes(raw))
        }
    };
}

impl<'a> FrameReader<'a> {
    /// Read from a borrowed payload
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    read_scalar!(read_u8, u8);
    read_scalar!(read_i8, i8);
    read_scalar!(read_u16, u16);
    read_scalar!(read_i16, i16);
    read_scalar!(read_u32, u32);
    read_scalar!(read_i32, i32);
    read_scalar!(read_u64, u64);
    read_scalar!(read_i64, i64);
    read_scalar!(read_f32, f32);
    read_scalar!(read_f64, f64);

    /// Read a length-prefixed byte string
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String> {
        buffer_to_string(NativeBuffer::from_vec(self.read_bytes()?))
    }

    /// Read a tagged optional value
    pub fn read_optional<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.read_u8()? {
            OPTION_NONE => Ok(None),
            OPTION_SOME => read(&mut *self).map(Some),
            tag => Err(BridgeError::decode(format!("Unexpected optional tag {}", tag))),
        }
    }

    /// Read a count-prefixed sequence
    pub fn read_sequence<T>(
        &mut self,
        mut read: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let count = self.read_len()?;
        // Every element occupies at least one byte.
        if count > self.remaining() {
            return Err(BridgeError::decode(format!(
                "Sequence of {} elements exceeds {} remaining bytes",
                count,
                self.remaining()
            )));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(read(&mut *self)?);
        }
        Ok(items)
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Ensure the whole payload was consumed
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(BridgeError::decode(format!("{} trailing bytes after frame", n))),
        }
    }

    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_i32()?;
        usize::try_from(len)
            .map_err(|_| BridgeError::decode(format!("Negative length prefix {}", len)))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(BridgeError::decode(format!(
                "Frame truncated: needed {} bytes, {} remaining",
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}
