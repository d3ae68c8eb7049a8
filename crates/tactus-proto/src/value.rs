//! Variable values and their wire tags.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// The type of a simulation variable.
///
/// Tag values are fixed by the shared-memory record format and must never
/// be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ValueKind {
    /// 64-bit floating point.
    Real = 0,
    /// 32-bit signed integer.
    Integer = 1,
    /// Boolean.
    Boolean = 2,
    /// UTF-8 string (network transport only).
    String = 3,
}

impl ValueKind {
    /// Wire tag byte for this kind.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Parse a wire tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::Real),
            1 => Ok(Self::Integer),
            2 => Ok(Self::Boolean),
            3 => Ok(Self::String),
            _ => Err(DecodeError::UnknownType { tag }),
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Real => "real",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::String => "string",
        };
        f.write_str(name)
    }
}

/// A typed variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit floating point.
    Real(f64),
    /// 32-bit signed integer.
    Integer(i32),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 string (network transport only).
    String(String),
}

impl Value {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Real(_) => ValueKind::Real,
            Self::Integer(_) => ValueKind::Integer,
            Self::Boolean(_) => ValueKind::Boolean,
            Self::String(_) => ValueKind::String,
        }
    }

    /// The zero value for a kind, used to initialize cache slots.
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Real => Self::Real(0.0),
            ValueKind::Integer => Self::Integer(0),
            ValueKind::Boolean => Self::Boolean(false),
            ValueKind::String => Self::String(String::new()),
        }
    }
}

/// One exposed variable of a simulation unit: a stable numeric reference
/// paired with its current value.
///
/// References are unique within one unit's variable set, and the value kind
/// behind a reference never changes between steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Stable value reference within the owning unit.
    pub reference: u32,
    /// Current value.
    pub value: Value,
}

impl Variable {
    /// Create a variable.
    pub fn new(reference: u32, value: Value) -> Self {
        Self { reference, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip() {
        for kind in
            [ValueKind::Real, ValueKind::Integer, ValueKind::Boolean, ValueKind::String]
        {
            assert_eq!(ValueKind::from_tag(kind.tag()), Ok(kind));
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(ValueKind::from_tag(7), Err(DecodeError::UnknownType { tag: 7 }));
    }

    #[test]
    fn zero_values_match_kind() {
        for kind in
            [ValueKind::Real, ValueKind::Integer, ValueKind::Boolean, ValueKind::String]
        {
            assert_eq!(Value::zero(kind).kind(), kind);
        }
    }
}
