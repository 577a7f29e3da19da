//! Core type aliases and value types
//!
//! Defines the field-type lattice used by type inference, sort directions,
//! and the small numeric aliases shared by every compile pass.

use std::fmt;

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// VM register number. 0 means "no register".
pub type Reg = i32;

/// VM cursor number. Negative means "no cursor".
pub type Cursor = i32;

/// Bitmask of FROM-clause items, one bit per item.
pub type Bitmask = u64;

/// Number of bits in a [`Bitmask`]
pub const BMS: usize = 64;

/// All bits set
pub const ALLBITS: Bitmask = !0;

// ============================================================================
// Field Types
// ============================================================================

/// Declared or inferred type of a value.
///
/// The discriminants fit in the low nibble of a comparison opcode's P5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FieldType {
    #[default]
    Any = 0,
    Unsigned = 1,
    String = 2,
    Number = 3,
    Double = 4,
    Integer = 5,
    Boolean = 6,
    Varbinary = 7,
    Scalar = 8,
    Decimal = 9,
    Uuid = 10,
    Datetime = 11,
    Interval = 12,
    Map = 13,
    Array = 14,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Any => "any",
            FieldType::Unsigned => "unsigned",
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Double => "double",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Varbinary => "varbinary",
            FieldType::Scalar => "scalar",
            FieldType::Decimal => "decimal",
            FieldType::Uuid => "uuid",
            FieldType::Datetime => "datetime",
            FieldType::Interval => "interval",
            FieldType::Map => "map",
            FieldType::Array => "array",
        }
    }

    pub fn from_name(name: &str) -> Option<FieldType> {
        let ty = match name.to_ascii_lowercase().as_str() {
            "any" => FieldType::Any,
            "unsigned" => FieldType::Unsigned,
            "string" | "text" => FieldType::String,
            "number" => FieldType::Number,
            "double" => FieldType::Double,
            "integer" | "int" => FieldType::Integer,
            "boolean" | "bool" => FieldType::Boolean,
            "varbinary" => FieldType::Varbinary,
            "scalar" => FieldType::Scalar,
            "decimal" => FieldType::Decimal,
            "uuid" => FieldType::Uuid,
            "datetime" => FieldType::Datetime,
            "interval" => FieldType::Interval,
            "map" => FieldType::Map,
            "array" => FieldType::Array,
            _ => return None,
        };
        Some(ty)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Unsigned
                | FieldType::Integer
                | FieldType::Double
                | FieldType::Decimal
                | FieldType::Number
        )
    }

    /// Result type of a binary arithmetic operator.
    ///
    /// Numeric operands climb `integer < decimal < double < number`; any
    /// non-numeric mix yields `scalar`, except the datetime/interval algebra.
    pub fn result(lhs: FieldType, rhs: FieldType) -> FieldType {
        if lhs.is_numeric() || rhs.is_numeric() {
            if lhs == FieldType::Number || rhs == FieldType::Number {
                return FieldType::Number;
            }
            if lhs == FieldType::Double || rhs == FieldType::Double {
                return FieldType::Double;
            }
            if lhs == FieldType::Decimal || rhs == FieldType::Decimal {
                return FieldType::Decimal;
            }
            return FieldType::Integer;
        }
        match (lhs, rhs) {
            (FieldType::Datetime, FieldType::Datetime)
            | (FieldType::Interval, FieldType::Interval) => FieldType::Interval,
            (FieldType::Interval, FieldType::Datetime)
            | (FieldType::Datetime, FieldType::Interval) => FieldType::Datetime,
            _ => FieldType::Scalar,
        }
    }

    /// Does a column of type `self` accept every value of type `other`?
    pub fn contains(&self, other: FieldType) -> bool {
        if *self == other {
            return true;
        }
        match self {
            FieldType::Any => true,
            FieldType::Scalar => !matches!(
                other,
                FieldType::Any | FieldType::Map | FieldType::Array | FieldType::Interval
            ),
            FieldType::Number => other.is_numeric(),
            FieldType::Integer => other == FieldType::Unsigned,
            _ => false,
        }
    }

    /// Low-nibble encoding used in comparison P5 operands.
    pub fn code(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().to_ascii_uppercase())
    }
}

// ============================================================================
// Sort Order
// ============================================================================

/// Sort direction of an ORDER BY / index term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn is_desc(&self) -> bool {
        *self == SortOrder::Desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_result_numeric_lattice() {
        assert_eq!(
            FieldType::result(FieldType::Integer, FieldType::Unsigned),
            FieldType::Integer
        );
        assert_eq!(
            FieldType::result(FieldType::Integer, FieldType::Double),
            FieldType::Double
        );
        assert_eq!(
            FieldType::result(FieldType::Double, FieldType::Number),
            FieldType::Number
        );
        assert_eq!(
            FieldType::result(FieldType::String, FieldType::Integer),
            FieldType::Integer
        );
    }

    #[test]
    fn test_type_result_non_numeric() {
        assert_eq!(
            FieldType::result(FieldType::String, FieldType::Varbinary),
            FieldType::Scalar
        );
        assert_eq!(
            FieldType::result(FieldType::Datetime, FieldType::Interval),
            FieldType::Datetime
        );
    }

    #[test]
    fn test_type_contains() {
        assert!(FieldType::Scalar.contains(FieldType::String));
        assert!(FieldType::Number.contains(FieldType::Double));
        assert!(!FieldType::Integer.contains(FieldType::Double));
        assert!(!FieldType::Scalar.contains(FieldType::Map));
    }

    #[test]
    fn test_type_names_round_trip() {
        assert_eq!(FieldType::from_name("TEXT"), Some(FieldType::String));
        assert_eq!(FieldType::Integer.to_string(), "INTEGER");
        assert_eq!(FieldType::from_name("nope"), None);
    }
}
