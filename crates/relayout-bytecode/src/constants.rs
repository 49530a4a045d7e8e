//! Per-class constant pool.
//!
//! Instructions never embed names directly: `CONST_STR`, `NEW`, `CHECK_CAST`,
//! field and invoke opcodes all carry a u32 index into this pool. The pool is
//! append-only, so indices handed out before a rewrite stay valid after the
//! rewriter interns the names it needs for its own sequences.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use rustc_hash::FxHashMap;

/// `owner.name:descriptor` as named by a field or invoke instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    /// Class named at the use site, not necessarily the declaring one
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Str(String),
    /// Internal class name
    Class(String),
    Field(MemberRef),
    Method(MemberRef),
}

impl Constant {
    fn tag(&self) -> u8 {
        match self {
            Constant::Str(_) => 1,
            Constant::Class(_) => 2,
            Constant::Field(_) => 3,
            Constant::Method(_) => 4,
        }
    }
}

/// Entries plus a reverse index for interning. Equality ignores the index.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    index: FxHashMap<Constant, u32>,
}

impl PartialEq for ConstantPool {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for ConstantPool {}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Constant] {
        &self.entries
    }

    /// Index of `constant`, appending it if no equal entry exists
    pub fn intern(&mut self, constant: Constant) -> u32 {
        if let Some(&index) = self.index.get(&constant) {
            return index;
        }
        let index = self.entries.len() as u32;
        self.index.insert(constant.clone(), index);
        self.entries.push(constant);
        index
    }

    pub fn intern_str(&mut self, value: &str) -> u32 {
        self.intern(Constant::Str(value.to_string()))
    }

    pub fn intern_class(&mut self, name: &str) -> u32 {
        self.intern(Constant::Class(name.to_string()))
    }

    pub fn intern_field(&mut self, owner: &str, name: &str, descriptor: &str) -> u32 {
        self.intern(Constant::Field(MemberRef::new(owner, name, descriptor)))
    }

    pub fn intern_method(&mut self, owner: &str, name: &str, descriptor: &str) -> u32 {
        self.intern(Constant::Method(MemberRef::new(owner, name, descriptor)))
    }

    pub fn get(&self, index: u32) -> Option<&Constant> {
        self.entries.get(index as usize)
    }

    /// Typed lookups return `None` for a missing index or a different kind
    pub fn get_str(&self, index: u32) -> Option<&str> {
        match self.get(index)? {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_class(&self, index: u32) -> Option<&str> {
        match self.get(index)? {
            Constant::Class(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_field(&self, index: u32) -> Option<&MemberRef> {
        match self.get(index)? {
            Constant::Field(r) => Some(r),
            _ => None,
        }
    }

    pub fn get_method(&self, index: u32) -> Option<&MemberRef> {
        match self.get(index)? {
            Constant::Method(r) => Some(r),
            _ => None,
        }
    }

    /// u32 count, then per entry a tag byte and one string (`Str`, `Class`)
    /// or owner, name and descriptor (`Field`, `Method`)
    pub fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u32(self.entries.len() as u32);
        for entry in &self.entries {
            writer.emit_u8(entry.tag());
            match entry {
                Constant::Str(s) | Constant::Class(s) => writer.emit_string(s),
                Constant::Field(r) | Constant::Method(r) => {
                    writer.emit_string(&r.owner);
                    writer.emit_string(&r.name);
                    writer.emit_string(&r.descriptor);
                }
            }
        }
    }

    pub fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let mut pool = ConstantPool::new();
        let count = reader.read_u32()? as usize;
        pool.entries.reserve(count.min(reader.remaining()));

        for _ in 0..count {
            let offset = reader.position();
            let tag = reader.read_u8()?;
            let entry = match tag {
                1 => Constant::Str(reader.read_string()?),
                2 => Constant::Class(reader.read_string()?),
                3 | 4 => {
                    let member = MemberRef {
                        owner: reader.read_string()?,
                        name: reader.read_string()?,
                        descriptor: reader.read_string()?,
                    };
                    if tag == 3 {
                        Constant::Field(member)
                    } else {
                        Constant::Method(member)
                    }
                }
                _ => {
                    return Err(DecodeError::InvalidTag {
                        kind: "constant",
                        tag,
                        offset,
                    })
                }
            };
            // Duplicates written by other producers keep their own index.
            let index = pool.entries.len() as u32;
            pool.index.entry(entry.clone()).or_insert(index);
            pool.entries.push(entry);
        }

        Ok(pool)
    }
}
