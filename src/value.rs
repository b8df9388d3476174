//! Values crossing the host boundary.
//!
//! The host only ever sees numbers, 64-bit bigints, strings, byte buffers
//! and opaque handles. Everything richer is serialized into a buffer by the
//! native library's own codec.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest integer a host number represents exactly (2^53 - 1)
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Fixed-width numeric kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    /// Unsigned 8-bit integer
    U8,
    /// Signed 8-bit integer
    I8,
    /// Unsigned 16-bit integer
    U16,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 32-bit integer
    U32,
    /// Signed 32-bit integer
    I32,
    /// Unsigned 64-bit integer
    U64,
    /// Signed 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl ScalarKind {
    /// Lowercase type name, as used in generated method names
    pub fn name(&self) -> &'static str {
        match self {
            ScalarKind::U8 => "u8",
            ScalarKind::I8 => "i8",
            ScalarKind::U16 => "u16",
            ScalarKind::I16 => "i16",
            ScalarKind::U32 => "u32",
            ScalarKind::I32 => "i32",
            ScalarKind::U64 => "u64",
            ScalarKind::I64 => "i64",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
        }
    }

    fn integer_range(&self) -> Option<(f64, f64)> {
        match self {
            ScalarKind::U8 => Some((0.0, u8::MAX as f64)),
            ScalarKind::I8 => Some((i8::MIN as f64, i8::MAX as f64)),
            ScalarKind::U16 => Some((0.0, u16::MAX as f64)),
            ScalarKind::I16 => Some((i16::MIN as f64, i16::MAX as f64)),
            ScalarKind::U32 => Some((0.0, u32::MAX as f64)),
            ScalarKind::I32 => Some((i32::MIN as f64, i32::MAX as f64)),
            ScalarKind::U64 => Some((0.0, MAX_SAFE_INTEGER)),
            ScalarKind::I64 => Some((-MAX_SAFE_INTEGER, MAX_SAFE_INTEGER)),
            ScalarKind::F32 | ScalarKind::F64 => None,
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fixed-width numeric value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    /// Unsigned 8-bit integer
    U8(u8),
    /// Signed 8-bit integer
    I8(i8),
    /// Unsigned 16-bit integer
    U16(u16),
    /// Signed 16-bit integer
    I16(i16),
    /// Unsigned 32-bit integer
    U32(u32),
    /// Signed 32-bit integer
    I32(i32),
    /// Unsigned 64-bit integer
    U64(u64),
    /// Signed 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
}

impl Scalar {
    /// The kind of this value
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::U8(_) => ScalarKind::U8,
            Scalar::I8(_) => ScalarKind::I8,
            Scalar::U16(_) => ScalarKind::U16,
            Scalar::I16(_) => ScalarKind::I16,
            Scalar::U32(_) => ScalarKind::U32,
            Scalar::I32(_) => ScalarKind::I32,
            Scalar::U64(_) => ScalarKind::U64,
            Scalar::I64(_) => ScalarKind::I64,
            Scalar::F32(_) => ScalarKind::F32,
            Scalar::F64(_) => ScalarKind::F64,
        }
    }

    /// Lower into a host value; 64-bit integers become bigints
    pub fn to_host(self) -> HostValue {
        match self {
            Scalar::U8(v) => HostValue::Number(v.into()),
            Scalar::I8(v) => HostValue::Number(v.into()),
            Scalar::U16(v) => HostValue::Number(v.into()),
            Scalar::I16(v) => HostValue::Number(v.into()),
            Scalar::U32(v) => HostValue::Number(v.into()),
            Scalar::I32(v) => HostValue::Number(v.into()),
            Scalar::U64(v) => HostValue::BigUint(v),
            Scalar::I64(v) => HostValue::BigInt(v),
            Scalar::F32(v) => HostValue::Number(v.into()),
            Scalar::F64(v) => HostValue::Number(v),
        }
    }

    /// Lift a host value into the requested kind, checking range and integrality
    pub fn from_host(kind: ScalarKind, value: &HostValue) -> Result<Scalar> {
        match (kind, value) {
            (ScalarKind::F64, HostValue::Number(n)) => Ok(Scalar::F64(*n)),
            (ScalarKind::F32, HostValue::Number(n)) => Ok(Scalar::F32(*n as f32)),
            (ScalarKind::U64, HostValue::BigUint(n)) => Ok(Scalar::U64(*n)),
            (ScalarKind::U64, HostValue::BigInt(n)) => u64::try_from(*n)
                .map(Scalar::U64)
                .map_err(|_| out_of_range(kind, value)),
            (ScalarKind::I64, HostValue::BigInt(n)) => Ok(Scalar::I64(*n)),
            (ScalarKind::I64, HostValue::BigUint(n)) => i64::try_from(*n)
                .map(Scalar::I64)
                .map_err(|_| out_of_range(kind, value)),
            (_, HostValue::Number(n)) => {
                let (min, max) = kind.integer_range().ok_or_else(|| wrong_kind(kind, value))?;
                if !n.is_finite() || n.fract() != 0.0 {
                    return Err(BridgeError::decode(format!(
                        "Expected an integral {} but got {}",
                        kind, n
                    )));
                }
                if *n < min || *n > max {
                    return Err(out_of_range(kind, value));
                }
                Ok(Self::from_integral(kind, *n))
            }
            _ => Err(wrong_kind(kind, value)),
        }
    }

    // `n` is integral and within range for `kind`.
    fn from_integral(kind: ScalarKind, n: f64) -> Scalar {
        match kind {
            ScalarKind::U8 => Scalar::U8(n as u8),
            ScalarKind::I8 => Scalar::I8(n as i8),
            ScalarKind::U16 => Scalar::U16(n as u16),
            ScalarKind::I16 => Scalar::I16(n as i16),
            ScalarKind::U32 => Scalar::U32(n as u32),
            ScalarKind::I32 => Scalar::I32(n as i32),
            ScalarKind::U64 => Scalar::U64(n as u64),
            ScalarKind::I64 => Scalar::I64(n as i64),
            ScalarKind::F32 => Scalar::F32(n as f32),
            ScalarKind::F64 => Scalar::F64(n),
        }
    }
}

fn wrong_kind(kind: ScalarKind, value: &HostValue) -> BridgeError {
    BridgeError::decode(format!("Expected {} but got {}", kind, value.type_name()))
}

fn out_of_range(kind: ScalarKind, value: &HostValue) -> BridgeError {
    BridgeError::decode(format!("Value {:?} is out of range for {}", value, kind))
}

/// A value as seen by the host runtime
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    /// Absent value
    Undefined,
    /// Host number (f64)
    Number(f64),
    /// Signed 64-bit bigint
    BigInt(i64),
    /// Unsigned 64-bit bigint
    BigUint(u64),
    /// UTF-8 string
    String(String),
    /// Byte buffer
    Bytes(Vec<u8>),
    /// Handle of a pending async operation
    Pending(u64),
}

impl HostValue {
    /// Host type name, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Number(_) => "number",
            HostValue::BigInt(_) | HostValue::BigUint(_) => "bigint",
            HostValue::String(_) => "string",
            HostValue::Bytes(_) => "buffer",
            HostValue::Pending(_) => "pending operation",
        }
    }

    /// Whether the value is absent
    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HostValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Interpret as an object handle id.
    ///
    /// Pending operation ids are a separate namespace and never qualify.
    pub fn as_id(&self) -> Option<u64> {
        match self {
            HostValue::BigUint(n) => Some(*n),
            HostValue::BigInt(n) => u64::try_from(*n).ok(),
            HostValue::Number(n)
                if n.is_finite() && n.fract() == 0.0 && *n >= 0.0 && *n <= MAX_SAFE_INTEGER =>
            {
                Some(*n as u64)
            }
            _ => None,
        }
    }
}

impl From<Scalar> for HostValue {
    fn from(scalar: Scalar) -> Self {
        scalar.to_host()
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(bytes: Vec<u8>) -> Self {
        HostValue::Bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_integral_numbers() {
        assert_eq!(
            Scalar::from_host(ScalarKind::U8, &HostValue::Number(255.0)).unwrap(),
            Scalar::U8(255)
        );
        assert_eq!(
            Scalar::from_host(ScalarKind::I16, &HostValue::Number(-300.0)).unwrap(),
            Scalar::I16(-300)
        );
        assert_eq!(
            Scalar::from_host(ScalarKind::U64, &HostValue::Number(42.0)).unwrap(),
            Scalar::U64(42)
        );
    }

    #[test]
    fn test_out_of_range() {
        for (kind, n) in [
            (ScalarKind::U8, 256.0),
            (ScalarKind::U8, -1.0),
            (ScalarKind::I8, 128.0),
            (ScalarKind::U32, 4_294_967_296.0),
        ] {
            let err = Scalar::from_host(kind, &HostValue::Number(n)).unwrap_err();
            assert_eq!(err.code, ErrorCode::DecodeError);
        }
        assert!(Scalar::from_host(ScalarKind::U64, &HostValue::BigInt(-1)).is_err());
        assert!(Scalar::from_host(ScalarKind::I64, &HostValue::BigUint(u64::MAX)).is_err());
    }

    #[test]
    fn test_fractional_rejected() {
        assert!(Scalar::from_host(ScalarKind::U32, &HostValue::Number(1.5)).is_err());
        assert!(Scalar::from_host(ScalarKind::I32, &HostValue::Number(f64::NAN)).is_err());
        assert_eq!(
            Scalar::from_host(ScalarKind::F64, &HostValue::Number(1.5)).unwrap(),
            Scalar::F64(1.5)
        );
    }

    #[test]
    fn test_wrong_host_type() {
        let err = Scalar::from_host(ScalarKind::U32, &HostValue::String("1".into())).unwrap_err();
        assert!(err.message.contains("string"));
        assert!(Scalar::from_host(ScalarKind::F32, &HostValue::BigInt(1)).is_err());
    }

    #[test]
    fn test_wide_integers_become_bigints() {
        assert_eq!(Scalar::U64(u64::MAX).to_host(), HostValue::BigUint(u64::MAX));
        assert_eq!(Scalar::I64(-5).to_host(), HostValue::BigInt(-5));
        assert_eq!(Scalar::U16(7).to_host(), HostValue::Number(7.0));
    }

    #[test]
    fn test_as_id() {
        assert_eq!(HostValue::Number(3.0).as_id(), Some(3));
        assert_eq!(HostValue::BigUint(9).as_id(), Some(9));
        assert_eq!(HostValue::Number(-1.0).as_id(), None);
        assert_eq!(HostValue::Number(1.5).as_id(), None);
        assert_eq!(HostValue::String("1".into()).as_id(), None);
        assert_eq!(HostValue::Pending(1).as_id(), None);
    }
}
