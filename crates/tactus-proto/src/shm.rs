//! Fixed shared-memory layout.
//!
//! A shared region carries one message at a time: a 12-byte header followed
//! by a contiguous array of 16-byte records. The layout is packed and
//! pointer-free, so it can be copied across a process boundary as raw bytes.
//!
//! ```text
//! offset 0   u64  current_time_us   (commit field, written last)
//! offset 8   u32  variable_count    (records valid in this message)
//! offset 12  [Record; capacity]     (16 bytes each)
//! ```
//!
//! `current_time_us` doubles as the commit marker: writers fill the record
//! array and count first and publish the time with release ordering, readers
//! acquire-load the time before touching the array. The capacity is agreed
//! when the region is created and never renegotiated; `variable_count` is
//! the number of records valid in the current message and never exceeds it.

use thiserror::Error;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    error::DecodeError,
    value::{Value, ValueKind, Variable},
};

/// Byte offset of the `current_time_us` commit field.
pub const TIME_OFFSET: usize = 0;

/// Byte offset of the `variable_count` field.
pub const COUNT_OFFSET: usize = 8;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Size of one variable record in bytes.
pub const RECORD_SIZE: usize = 16;

/// Total region size for a capacity agreed at creation time.
pub fn region_size(capacity: usize) -> usize {
    HEADER_SIZE + capacity * RECORD_SIZE
}

/// One fixed-size variable record.
///
/// The value field is an 8-byte little-endian image of the typed value;
/// unused trailing bytes are zero so identical messages stay byte-identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Record {
    /// Value reference.
    pub reference: U32,
    /// [`ValueKind`] tag byte.
    pub kind: u8,
    /// Zero padding up to the value field.
    pub pad: [u8; 3],
    /// Little-endian value image.
    pub value: [u8; 8],
}

/// A value that cannot be carried in a fixed record.
///
/// Strings need out-of-band storage the 8-byte value image does not have;
/// they are restricted to the network transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("string value of reference {reference} cannot be carried in a shared-memory record")]
pub struct UnrepresentableValue {
    /// The offending value reference.
    pub reference: u32,
}

impl Record {
    /// Build a record from a variable.
    pub fn from_variable(variable: &Variable) -> Result<Self, UnrepresentableValue> {
        let mut value = [0u8; 8];
        match &variable.value {
            Value::Real(v) => value.copy_from_slice(&v.to_le_bytes()),
            Value::Integer(v) => value[..4].copy_from_slice(&v.to_le_bytes()),
            Value::Boolean(v) => value[0] = u8::from(*v),
            Value::String(_) => {
                return Err(UnrepresentableValue { reference: variable.reference });
            },
        }

        Ok(Self {
            reference: U32::new(variable.reference),
            kind: variable.value.kind().tag(),
            pad: [0; 3],
            value,
        })
    }

    /// Recover the variable this record carries.
    pub fn to_variable(&self) -> Result<Variable, DecodeError> {
        let value = match ValueKind::from_tag(self.kind)? {
            ValueKind::Real => {
                Value::Real(f64::from_le_bytes(self.value))
            },
            ValueKind::Integer => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&self.value[..4]);
                Value::Integer(i32::from_le_bytes(raw))
            },
            ValueKind::Boolean => match self.value[0] {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(DecodeError::SchemaMismatch {
                        detail: format!("boolean record out of range: {other}"),
                    });
                },
            },
            ValueKind::String => {
                return Err(DecodeError::SchemaMismatch {
                    detail: "string record in shared memory".to_owned(),
                });
            },
        };

        Ok(Variable { reference: self.reference.get(), value })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_fixed() {
        assert_eq!(std::mem::size_of::<Record>(), RECORD_SIZE);
        assert_eq!(std::mem::align_of::<Record>(), 1);
        assert_eq!(region_size(4), 12 + 4 * 16);
    }

    #[test]
    fn record_roundtrip() {
        let variables = [
            Variable::new(0, Value::Real(-12.75)),
            Variable::new(1, Value::Integer(i32::MIN)),
            Variable::new(2, Value::Boolean(true)),
        ];

        for variable in &variables {
            let record = Record::from_variable(variable).unwrap();
            assert_eq!(record.to_variable().unwrap(), *variable);
        }
    }

    #[test]
    fn record_bytes_are_stable() {
        let record = Record::from_variable(&Variable::new(3, Value::Integer(1))).unwrap();
        let bytes = record.as_bytes();
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(bytes[..4], 3u32.to_le_bytes());
        assert_eq!(bytes[4], ValueKind::Integer.tag());
        // Unused value bytes stay zero.
        assert_eq!(&bytes[9..], &[0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn string_is_unrepresentable() {
        let variable = Variable::new(5, Value::String("x".to_owned()));
        assert_eq!(
            Record::from_variable(&variable),
            Err(UnrepresentableValue { reference: 5 })
        );
    }

    #[test]
    fn unknown_tag_in_record() {
        let record = Record { reference: U32::new(1), kind: 0xee, pad: [0; 3], value: [0; 8] };
        assert_eq!(record.to_variable(), Err(DecodeError::UnknownType { tag: 0xee }));
    }
}
