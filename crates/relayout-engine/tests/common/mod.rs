//! Shared helpers for engine integration tests

#![allow(dead_code)]

use relayout_bytecode::{access, BytecodeWriter, ClassDef, ConstantPool, FieldDef, MethodDef, Opcode};

/// Install a test subscriber once; `RUST_LOG` controls the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds class files for tests
pub struct ClassBuilder {
    def: ClassDef,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: Option<&str>) -> Self {
        Self {
            def: ClassDef::new(name, super_name),
        }
    }

    pub fn field(mut self, name: &str, descriptor: &str, flags: u16) -> Self {
        self.def.fields.push(FieldDef::new(name, descriptor, flags));
        self
    }

    /// Add a method whose code is written by `emit`
    pub fn method(
        mut self,
        name: &str,
        descriptor: &str,
        flags: u16,
        emit: impl FnOnce(&mut BytecodeWriter, &mut ConstantPool),
    ) -> Self {
        let mut w = BytecodeWriter::new();
        emit(&mut w, &mut self.def.constants);
        let method = MethodDef::assemble(name, descriptor, flags, w.into_bytes(), &self.def.constants)
            .unwrap_or_else(|e| panic!("{}{} does not assemble: {}", name, descriptor, e));
        self.def.methods.push(method);
        self
    }

    /// Add a method with raw, unchecked code
    pub fn raw_method(mut self, name: &str, descriptor: &str, flags: u16, code: Vec<u8>) -> Self {
        self.def.methods.push(MethodDef {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: flags,
            max_stack: 8,
            max_locals: 8,
            code,
        });
        self
    }

    /// `int name() { return value; }`
    pub fn returns_int(self, name: &str, value: i32) -> Self {
        self.method(name, "()I", access::PUBLIC, |w, _| {
            w.emit_const_i32(value);
            w.emit_opcode(Opcode::ReturnI);
        })
    }

    /// `int name() { return this.field; }`
    pub fn getter(self, name: &str, owner: &str, field: &str) -> Self {
        let owner = owner.to_string();
        let field = field.to_string();
        self.method(name, "()I", access::PUBLIC, move |w, pool| {
            let f = pool.intern_field(&owner, &field, "I");
            w.emit_load(Opcode::LoadRef, 0);
            w.emit_field(Opcode::GetField, f);
            w.emit_opcode(Opcode::ReturnI);
        })
    }

    /// `void name(int v) { this.field = v; }`
    pub fn setter(self, name: &str, owner: &str, field: &str) -> Self {
        let owner = owner.to_string();
        let field = field.to_string();
        self.method(name, "(I)V", access::PUBLIC, move |w, pool| {
            let f = pool.intern_field(&owner, &field, "I");
            w.emit_load(Opcode::LoadRef, 0);
            w.emit_load(Opcode::LoadI, 1);
            w.emit_field(Opcode::PutField, f);
            w.emit_opcode(Opcode::ReturnVoid);
        })
    }

    /// `int name(Owner o) { return o.method(); }`, static, so the call goes
    /// through a call site
    pub fn call_site(self, name: &str, owner: &str, method: &str) -> Self {
        let owner = owner.to_string();
        let method = method.to_string();
        let descriptor = format!("(L{};)I", owner);
        self.method(name, &descriptor, access::PUBLIC | access::STATIC, move |w, pool| {
            let m = pool.intern_method(&owner, &method, "()I");
            w.emit_load(Opcode::LoadRef, 0);
            w.emit_invoke_virtual(m);
            w.emit_opcode(Opcode::ReturnI);
        })
    }

    pub fn build(self) -> ClassDef {
        self.def
    }

    pub fn bytes(self) -> Vec<u8> {
        self.def.encode()
    }
}
