//! Field and method descriptors
//!
//! Descriptors are the compact type strings attached to every field and
//! method: `I`, `J`, `Lpkg/Name;`, `[D` for fields and `(IJ)Lpkg/Name;` for
//! methods. The rewriter uses them to pick typed load/return opcodes and to
//! count local-variable slots, where 8-byte primitives take two slots.

use std::fmt;

use crate::opcode::Opcode;
use thiserror::Error;

/// Descriptor parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Descriptor ended in the middle of a type
    #[error("Truncated descriptor `{0}`")]
    Truncated(String),

    /// Unknown type character
    #[error("Invalid type character `{ch}` in descriptor `{descriptor}`")]
    InvalidChar {
        /// Offending character
        ch: char,
        /// Full descriptor
        descriptor: String,
    },

    /// Method descriptor without parentheses
    #[error("Malformed method descriptor `{0}`")]
    MalformedMethod(String),
}

/// Primitive kinds, used by UNBOX and to pick typed opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// `I`
    Int = 0,
    /// `J`
    Long = 1,
    /// `F`
    Float = 2,
    /// `D`
    Double = 3,
    /// `Z`
    Boolean = 4,
    /// `B`
    Byte = 5,
    /// `S`
    Short = 6,
    /// `C`
    Char = 7,
}

impl PrimitiveKind {
    /// Convert byte to kind
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Int),
            1 => Some(Self::Long),
            2 => Some(Self::Float),
            3 => Some(Self::Double),
            4 => Some(Self::Boolean),
            5 => Some(Self::Byte),
            6 => Some(Self::Short),
            7 => Some(Self::Char),
            _ => None,
        }
    }

    /// Convert kind to byte
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Number of local-variable slots a value of this kind occupies
    pub fn category(self) -> u16 {
        match self {
            Self::Long | Self::Double => 2,
            _ => 1,
        }
    }
}

/// A field type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Primitive type
    Primitive(PrimitiveKind),
    /// Class reference, e.g. `Lapp/Point;`
    Object(String),
    /// Array of a component type
    Array(Box<FieldType>),
}

impl FieldType {
    /// Parse a complete field descriptor
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut chars = descriptor.char_indices().peekable();
        let ty = Self::parse_one(descriptor, &mut chars)?;
        if chars.next().is_some() {
            return Err(DescriptorError::MalformedMethod(descriptor.to_string()));
        }
        Ok(ty)
    }

    fn parse_one(
        descriptor: &str,
        chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    ) -> Result<Self, DescriptorError> {
        let (start, ch) = chars
            .next()
            .ok_or_else(|| DescriptorError::Truncated(descriptor.to_string()))?;
        let kind = match ch {
            'I' => PrimitiveKind::Int,
            'J' => PrimitiveKind::Long,
            'F' => PrimitiveKind::Float,
            'D' => PrimitiveKind::Double,
            'Z' => PrimitiveKind::Boolean,
            'B' => PrimitiveKind::Byte,
            'S' => PrimitiveKind::Short,
            'C' => PrimitiveKind::Char,
            '[' => return Ok(Self::Array(Box::new(Self::parse_one(descriptor, chars)?))),
            'L' => {
                for (end, c) in chars.by_ref() {
                    if c == ';' {
                        return Ok(Self::Object(descriptor[start + 1..end].to_string()));
                    }
                }
                return Err(DescriptorError::Truncated(descriptor.to_string()));
            }
            other => {
                return Err(DescriptorError::InvalidChar {
                    ch: other,
                    descriptor: descriptor.to_string(),
                })
            }
        };
        Ok(Self::Primitive(kind))
    }

    /// Primitive kind, if this is a primitive type
    pub fn primitive(&self) -> Option<PrimitiveKind> {
        match self {
            Self::Primitive(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Whether values of this type are references
    pub fn is_reference(&self) -> bool {
        !matches!(self, Self::Primitive(_))
    }

    /// Number of local-variable slots this type occupies
    pub fn category(&self) -> u16 {
        self.primitive().map_or(1, PrimitiveKind::category)
    }

    /// Typed local load opcode for this type
    pub fn load_opcode(&self) -> Opcode {
        match self.primitive() {
            Some(PrimitiveKind::Long) => Opcode::LoadL,
            Some(PrimitiveKind::Float) => Opcode::LoadF,
            Some(PrimitiveKind::Double) => Opcode::LoadD,
            Some(_) => Opcode::LoadI,
            None => Opcode::LoadRef,
        }
    }

    /// Typed return opcode for this type
    pub fn return_opcode(&self) -> Opcode {
        match self.primitive() {
            Some(PrimitiveKind::Long) => Opcode::ReturnL,
            Some(PrimitiveKind::Float) => Opcode::ReturnF,
            Some(PrimitiveKind::Double) => Opcode::ReturnD,
            Some(_) => Opcode::ReturnI,
            None => Opcode::ReturnRef,
        }
    }

    /// Class name a CHECK_CAST should target for this reference type
    ///
    /// Arrays cast to their own descriptor.
    pub fn cast_target(&self) -> Option<String> {
        match self {
            Self::Primitive(_) => None,
            Self::Object(name) => Some(name.clone()),
            Self::Array(_) => Some(self.to_string()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(kind) => f.write_str(match kind {
                PrimitiveKind::Int => "I",
                PrimitiveKind::Long => "J",
                PrimitiveKind::Float => "F",
                PrimitiveKind::Double => "D",
                PrimitiveKind::Boolean => "Z",
                PrimitiveKind::Byte => "B",
                PrimitiveKind::Short => "S",
                PrimitiveKind::Char => "C",
            }),
            Self::Object(name) => write!(f, "L{};", name),
            Self::Array(component) => write!(f, "[{}", component),
        }
    }
}

/// A method return type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReturnType {
    /// `V`
    Void,
    /// Any field type
    Value(FieldType),
}

impl ReturnType {
    /// Typed return opcode
    pub fn return_opcode(&self) -> Opcode {
        match self {
            Self::Void => Opcode::ReturnVoid,
            Self::Value(ty) => ty.return_opcode(),
        }
    }
}

/// A parsed method descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Parameter types in declaration order
    pub params: Vec<FieldType>,
    /// Return type
    pub ret: ReturnType,
}

impl MethodDescriptor {
    /// Parse a method descriptor such as `(IJLapp/A;)V`
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let rest = descriptor
            .strip_prefix('(')
            .ok_or_else(|| DescriptorError::MalformedMethod(descriptor.to_string()))?;
        let close = rest
            .find(')')
            .ok_or_else(|| DescriptorError::MalformedMethod(descriptor.to_string()))?;

        let params_str = &rest[..close];
        let mut params = Vec::new();
        let mut chars = params_str.char_indices().peekable();
        while chars.peek().is_some() {
            params.push(FieldType::parse_one(params_str, &mut chars)?);
        }

        let ret = match &rest[close + 1..] {
            "V" => ReturnType::Void,
            "" => return Err(DescriptorError::Truncated(descriptor.to_string())),
            other => ReturnType::Value(FieldType::parse(other)?),
        };

        Ok(Self { params, ret })
    }

    /// Local-variable slots taken by the parameters (excluding the receiver)
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(FieldType::category).sum()
    }

    /// Number of parameters (each counts as one operand-stack value)
    pub fn param_count(&self) -> u16 {
        self.params.len() as u16
    }

    /// Whether the method returns a value
    pub fn returns_value(&self) -> bool {
        !matches!(self.ret, ReturnType::Void)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        f.write_str(")")?;
        match &self.ret {
            ReturnType::Void => f.write_str("V"),
            ReturnType::Value(ty) => write!(f, "{}", ty),
        }
    }
}
