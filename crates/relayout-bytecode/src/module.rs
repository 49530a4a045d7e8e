//! Class-file format.
//!
//! One file holds one class: name, super class, constant pool, then the
//! declared fields and methods. The host hands these bytes to the engine when
//! a type is first loaded and again for every new version of it.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! "RLYT" | version u32 | flags u32 | crc32 u32 | sha256 [32]   header
//! name | super? | pool | u32 + fields | u32 + methods          payload
//! ```
//!
//! Both checksums cover the payload only.

use crate::constants::ConstantPool;
use crate::decode::decode_instructions;
use crate::descriptor::MethodDescriptor;
use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::verify::{compute_max_locals, compute_max_stack, VerifyError};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"RLYT";

pub const VERSION: u32 = 1;

const HEADER_SIZE: usize = 48;

#[derive(Debug, Error)]
pub enum ClassFileError {
    #[error("malformed class file: {0}")]
    Malformed(#[from] DecodeError),

    #[error("not a class file (magic {0:?})")]
    InvalidMagic([u8; 4]),

    #[error("class-file version {0} is not supported, expected {VERSION}")]
    UnsupportedVersion(u32),

    #[error("crc32 is {actual:#010x}, header says {expected:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("sha-256 of the payload does not match the header")]
    DigestMismatch,

    #[error("{0} bytes left over after the method table")]
    TrailingBytes(usize),
}

/// Access flag bits shared by fields and methods
pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    /// Declared without code
    pub const ABSTRACT: u16 = 0x0400;
}

struct Header {
    version: u32,
    flags: u32,
    crc32: u32,
    sha256: [u8; 32],
}

impl Header {
    fn for_payload(flags: u32, payload: &[u8]) -> Self {
        Self {
            version: VERSION,
            flags,
            crc32: crc32fast::hash(payload),
            sha256: Sha256::digest(payload).into(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&self.sha256);
    }

    fn read(reader: &mut BytecodeReader<'_>) -> Result<Self, ClassFileError> {
        let magic: [u8; 4] = [
            reader.read_u8()?,
            reader.read_u8()?,
            reader.read_u8()?,
            reader.read_u8()?,
        ];
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }
        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ClassFileError::UnsupportedVersion(version));
        }
        let flags = reader.read_u32()?;
        let crc32 = reader.read_u32()?;
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&reader.read_bytes(32)?);
        Ok(Self {
            version,
            flags,
            crc32,
            sha256,
        })
    }

    fn check(&self, payload: &[u8]) -> Result<(), ClassFileError> {
        let actual = crc32fast::hash(payload);
        if actual != self.crc32 {
            return Err(ClassFileError::ChecksumMismatch {
                expected: self.crc32,
                actual,
            });
        }
        if Sha256::digest(payload).as_slice() != self.sha256 {
            return Err(ClassFileError::DigestMismatch);
        }
        Ok(())
    }
}

fn write_table<T>(w: &mut BytecodeWriter, items: &[T], write: impl Fn(&T, &mut BytecodeWriter)) {
    w.emit_u32(items.len() as u32);
    for item in items {
        write(item, w);
    }
}

fn read_table<T>(
    r: &mut BytecodeReader<'_>,
    read: impl Fn(&mut BytecodeReader<'_>) -> Result<T, DecodeError>,
) -> Result<Vec<T>, DecodeError> {
    let count = r.read_u32()? as usize;
    // a corrupt count must not turn into a huge allocation
    let mut items = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        items.push(read(r)?);
    }
    Ok(items)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    /// Field type descriptor such as `I` or `Lapp/Point;`
    pub descriptor: String,
    pub access: u16,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>, access: u16) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            access,
        }
    }

    pub fn is_static(&self) -> bool {
        self.access & access::STATIC != 0
    }

    fn write(&self, w: &mut BytecodeWriter) {
        w.emit_string(&self.name);
        w.emit_string(&self.descriptor);
        w.emit_u16(self.access);
    }

    fn read(r: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let name = r.read_string()?;
        let descriptor = r.read_string()?;
        let access = r.read_u16()?;
        Ok(Self::new(name, descriptor, access))
    }
}

/// A method and its code. `max_locals` counts the receiver and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub name: String,
    pub descriptor: String,
    pub access: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
}

impl MethodDef {
    /// Wrap `code` into a method, deriving `max_stack` and `max_locals` from it.
    pub fn assemble(
        name: impl Into<String>,
        descriptor: impl Into<String>,
        access: u16,
        code: Vec<u8>,
        pool: &ConstantPool,
    ) -> Result<Self, VerifyError> {
        let descriptor = descriptor.into();
        let signature = MethodDescriptor::parse(&descriptor)?;
        let instrs = decode_instructions(&code)?;
        let max_stack = compute_max_stack(&instrs, pool)?;
        let max_locals = compute_max_locals(&instrs, &signature, access & access::STATIC != 0);
        Ok(Self {
            name: name.into(),
            descriptor,
            access,
            max_stack,
            max_locals,
            code,
        })
    }

    pub fn is_static(&self) -> bool {
        self.access & access::STATIC != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access & access::ABSTRACT != 0
    }

    fn write(&self, w: &mut BytecodeWriter) {
        w.emit_string(&self.name);
        w.emit_string(&self.descriptor);
        for v in [self.access, self.max_stack, self.max_locals] {
            w.emit_u16(v);
        }
        w.emit_u32(self.code.len() as u32);
        w.emit_bytes(&self.code);
    }

    fn read(r: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let name = r.read_string()?;
        let descriptor = r.read_string()?;
        let access = r.read_u16()?;
        let max_stack = r.read_u16()?;
        let max_locals = r.read_u16()?;
        let len = r.read_u32()? as usize;
        Ok(Self {
            name,
            descriptor,
            access,
            max_stack,
            max_locals,
            code: r.read_bytes(len)?,
        })
    }
}

/// One class as carried by a class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// Slash-separated internal name, e.g. `app/Point`
    pub name: String,
    /// `None` only for a root class
    pub super_name: Option<String>,
    pub flags: u32,
    pub constants: ConstantPool,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>, super_name: Option<&str>) -> Self {
        Self {
            name: name.into(),
            super_name: super_name.map(str::to_string),
            flags: 0,
            constants: ConstantPool::default(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&MethodDef> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytecodeWriter::new();
        body.emit_string(&self.name);
        match &self.super_name {
            Some(parent) => {
                body.emit_u8(1);
                body.emit_string(parent);
            }
            None => body.emit_u8(0),
        }
        self.constants.encode(&mut body);
        write_table(&mut body, &self.fields, FieldDef::write);
        write_table(&mut body, &self.methods, MethodDef::write);
        let payload = body.into_bytes();

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        Header::for_payload(self.flags, &payload).write(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// Parse and integrity-check a class file. Method code is not verified here.
    pub fn decode(data: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = BytecodeReader::new(data);
        let header = Header::read(&mut r)?;
        header.check(&data[r.position()..])?;

        let name = r.read_string()?;
        let super_name = match r.read_u8()? {
            0 => None,
            _ => Some(r.read_string()?),
        };
        let constants = ConstantPool::decode(&mut r)?;
        let fields = read_table(&mut r, FieldDef::read)?;
        let methods = read_table(&mut r, MethodDef::read)?;

        if r.has_more() {
            return Err(ClassFileError::TrailingBytes(r.remaining()));
        }
        Ok(Self {
            name,
            super_name,
            flags: header.flags,
            constants,
            fields,
            methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    fn point() -> ClassDef {
        let mut class = ClassDef::new("app/Point", Some("app/Shape"));
        class.fields.push(FieldDef::new("x", "I", access::PUBLIC));
        class
            .fields
            .push(FieldDef::new("origin", "Lapp/Point;", access::STATIC));

        let x = class.constants.intern_field("app/Point", "x", "I");
        let mut w = BytecodeWriter::new();
        w.emit_load(Opcode::LoadRef, 0);
        w.emit_field(Opcode::GetField, x);
        w.emit_opcode(Opcode::ReturnI);
        let get_x = MethodDef::assemble("getX", "()I", access::PUBLIC, w.into_bytes(), &class.constants)
            .unwrap();
        class.methods.push(get_x);
        class
    }

    #[test]
    fn test_assemble_derives_limits() {
        let class = point();
        let m = class.find_method("getX", "()I").unwrap();
        assert_eq!((m.max_stack, m.max_locals), (1, 1));
        assert!(!m.is_static());
    }

    #[test]
    fn test_class_file_survives_encoding() {
        let mut class = point();
        class.flags = 0x20;
        let bytes = class.encode();
        assert_eq!(&bytes[..4], &MAGIC);

        let back = ClassDef::decode(&bytes).unwrap();
        assert_eq!(back, class);
        assert!(back.find_field("origin").unwrap().is_static());
        assert!(back.find_method("getX", "()J").is_none());

        let root = ClassDef::decode(&ClassDef::new("app/Root", None).encode()).unwrap();
        assert_eq!(root.super_name, None);
    }

    #[test]
    fn test_corruption_is_detected() {
        let clean = point().encode();

        let mut payload_flip = clean.clone();
        payload_flip[HEADER_SIZE + 2] ^= 0xFF;
        assert!(matches!(
            ClassDef::decode(&payload_flip),
            Err(ClassFileError::ChecksumMismatch { .. })
        ));

        // first byte of the stored sha-256
        let mut digest_flip = clean.clone();
        digest_flip[16] ^= 0x01;
        assert!(matches!(
            ClassDef::decode(&digest_flip),
            Err(ClassFileError::DigestMismatch)
        ));

        let mut extra = clean;
        extra.push(0);
        assert!(matches!(
            ClassDef::decode(&extra),
            Err(ClassFileError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_header_rejections() {
        let mut bytes = point().encode();
        bytes[0] = b'X';
        assert!(matches!(
            ClassDef::decode(&bytes),
            Err(ClassFileError::InvalidMagic([b'X', b'L', b'Y', b'T']))
        ));

        let mut bytes = point().encode();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            ClassDef::decode(&bytes),
            Err(ClassFileError::UnsupportedVersion(7))
        ));

        assert!(matches!(
            ClassDef::decode(b"RLYT\x01\x00"),
            Err(ClassFileError::Malformed(DecodeError::UnexpectedEnd(4)))
        ));
    }
}
