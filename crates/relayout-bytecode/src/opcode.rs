//! The typed stack-machine instruction set.
//!
//! The opcode decides the type of every value it pushes or pops. `long` and
//! `double` locals take two slots. Operands follow the opcode byte in
//! little-endian order and have a fixed width per opcode.

macro_rules! opcodes {
    ($($(#[$doc:meta])* $variant:ident = $byte:literal => $name:literal,)*) => {
        /// One instruction byte.
        ///
        /// Byte ranges group the instructions: constants and stack at `0x0_`,
        /// locals at `0x1_`, arithmetic at `0x2_`/`0x3_`, comparisons at
        /// `0x5_`, branches at `0x9_`, calls at `0xA_`, objects at `0xB_`,
        /// argument arrays at `0xC_` and `Throw` at `0xE0`.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($(#[$doc])* $variant = $byte,)*
        }

        impl Opcode {
            /// `None` for bytes outside the instruction set
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// Mnemonic used in disassembly and error messages
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00 => "NOP",
    Pop = 0x01 => "POP",
    Dup = 0x02 => "DUP",
    Swap = 0x03 => "SWAP",
    ConstNull = 0x04 => "CONST_NULL",
    /// i32 operand
    ConstI32 = 0x05 => "CONST_I32",
    /// i64 operand
    ConstI64 = 0x06 => "CONST_I64",
    ConstF32 = 0x07 => "CONST_F32",
    ConstF64 = 0x08 => "CONST_F64",
    /// u32 index of a UTF-8 pool entry
    ConstStr = 0x09 => "CONST_STR",

    /// int, short, char, byte and boolean locals; u16 slot
    LoadI = 0x10 => "LOAD_I",
    /// reads slots n and n+1
    LoadL = 0x11 => "LOAD_L",
    LoadF = 0x12 => "LOAD_F",
    /// reads slots n and n+1
    LoadD = 0x13 => "LOAD_D",
    LoadRef = 0x14 => "LOAD_REF",
    StoreI = 0x18 => "STORE_I",
    StoreL = 0x19 => "STORE_L",
    StoreF = 0x1A => "STORE_F",
    StoreD = 0x1B => "STORE_D",
    StoreRef = 0x1C => "STORE_REF",

    Iadd = 0x20 => "IADD",
    Isub = 0x21 => "ISUB",
    Imul = 0x22 => "IMUL",
    /// traps on a zero divisor
    Idiv = 0x23 => "IDIV",
    Irem = 0x24 => "IREM",
    Ineg = 0x25 => "INEG",
    Ladd = 0x28 => "LADD",
    Lsub = 0x29 => "LSUB",
    Lmul = 0x2A => "LMUL",
    Fadd = 0x30 => "FADD",
    Fmul = 0x31 => "FMUL",
    Dadd = 0x34 => "DADD",
    Dmul = 0x35 => "DMUL",
    I2L = 0x38 => "I2L",
    L2I = 0x39 => "L2I",
    I2F = 0x3A => "I2F",
    I2D = 0x3B => "I2D",

    /// Comparisons pop `b` then `a` and push an int 0 or 1
    Ieq = 0x50 => "IEQ",
    Ine = 0x51 => "INE",
    Ilt = 0x52 => "ILT",
    Ile = 0x53 => "ILE",
    Igt = 0x54 => "IGT",
    Ige = 0x55 => "IGE",
    /// pushes -1, 0 or 1
    Lcmp = 0x56 => "LCMP",

    /// Branch offsets are i32, relative to the branch's own first byte
    Jmp = 0x90 => "JMP",
    JmpIfFalse = 0x91 => "JMP_IF_FALSE",
    JmpIfTrue = 0x92 => "JMP_IF_TRUE",
    JmpIfNull = 0x93 => "JMP_IF_NULL",
    JmpIfNotNull = 0x94 => "JMP_IF_NOT_NULL",

    /// u32 method ref; resolved against the receiver's class chain
    InvokeVirtual = 0xA0 => "INVOKE_VIRTUAL",
    /// u32 method ref
    InvokeStatic = 0xA1 => "INVOKE_STATIC",
    /// u16 intrinsic id
    InvokeRuntime = 0xA2 => "INVOKE_RUNTIME",
    ReturnI = 0xA8 => "RETURN_I",
    ReturnL = 0xA9 => "RETURN_L",
    ReturnF = 0xAA => "RETURN_F",
    ReturnD = 0xAB => "RETURN_D",
    ReturnRef = 0xAC => "RETURN_REF",
    ReturnVoid = 0xAD => "RETURN_VOID",

    /// u32 class ref
    New = 0xB0 => "NEW",
    /// Field accesses take a u32 field ref
    GetField = 0xB1 => "GET_FIELD",
    PutField = 0xB2 => "PUT_FIELD",
    GetStatic = 0xB3 => "GET_STATIC",
    PutStatic = 0xB4 => "PUT_STATIC",
    /// u32 class ref; null passes
    CheckCast = 0xB5 => "CHECK_CAST",

    /// u16 count; the deepest value becomes element 0
    PackArgs = 0xC0 => "PACK_ARGS",
    ArrayLoad = 0xC1 => "ARRAY_LOAD",
    ArrayLen = 0xC2 => "ARRAY_LEN",
    /// u8 primitive kind
    Unbox = 0xC8 => "UNBOX",

    Throw = 0xE0 => "THROW",
}

impl Opcode {
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Operand bytes following the opcode
    pub fn operand_size(self) -> usize {
        use Opcode::*;
        match self {
            Unbox => 1,
            InvokeRuntime | PackArgs => 2,
            op if op.is_load() || op.is_store() => 2,
            ConstI32 | ConstF32 | ConstStr | New | CheckCast => 4,
            op if op.is_jump() || op.is_invoke() || op.is_field_access() => 4,
            ConstI64 | ConstF64 => 8,
            _ => 0,
        }
    }

    #[inline]
    pub fn instruction_size(self) -> usize {
        1 + self.operand_size()
    }

    pub fn is_load(self) -> bool {
        matches!(
            self,
            Self::LoadI | Self::LoadL | Self::LoadF | Self::LoadD | Self::LoadRef
        )
    }

    pub fn is_store(self) -> bool {
        matches!(
            self,
            Self::StoreI | Self::StoreL | Self::StoreF | Self::StoreD | Self::StoreRef
        )
    }

    pub fn is_jump(self) -> bool {
        (0x90..=0x94).contains(&self.to_u8())
    }

    pub fn is_conditional_jump(self) -> bool {
        self.is_jump() && self != Self::Jmp
    }

    /// Calls that name their target through the constant pool
    pub fn is_invoke(self) -> bool {
        matches!(self, Self::InvokeVirtual | Self::InvokeStatic)
    }

    pub fn is_field_access(self) -> bool {
        (0xB1..=0xB4).contains(&self.to_u8())
    }

    pub fn is_return(self) -> bool {
        (0xA8..=0xAD).contains(&self.to_u8())
    }

    /// Control never reaches the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Jmp | Self::Throw) || self.is_return()
    }
}
