//! Runtime intrinsic ids for `INVOKE_RUNTIME`
//!
//! Rewritten code reaches the redefinition engine only through these
//! intrinsics. Arguments are popped in push order (the first argument was
//! pushed first).

/// `(ref) -> str`: runtime type name of the receiver
pub const TYPE_NAME: u16 = 0x0001;
/// `(str, str) -> int`: 1 when both strings are equal
pub const STR_EQ: u16 = 0x0002;

/// `(receiver, name, desc) -> int`: 1 when a dispatch entry resolves
pub const DISPATCH_CONTAINS: u16 = 0x0010;
/// `(receiver, args, name, desc) -> value`: run the resolved dispatch entry
pub const DISPATCH_RUN: u16 = 0x0011;
/// `(args, owner, name, desc) -> value`: run a static dispatch entry
pub const DISPATCH_RUN_STATIC: u16 = 0x0012;

/// `(obj, slot) -> value`: read an added instance field
pub const FIELD_GET: u16 = 0x0020;
/// `(obj, value, slot) -> ()`: write an added instance field
pub const FIELD_SET: u16 = 0x0021;
/// `(slot) -> value`: read an added static field
pub const STATIC_FIELD_GET: u16 = 0x0022;
/// `(value, slot) -> ()`: write an added static field
pub const STATIC_FIELD_SET: u16 = 0x0023;

/// `(message) -> error`: build a no-such-method error to be thrown
pub const NO_SUCH_METHOD: u16 = 0x0030;

/// Operand stack effect of an intrinsic as `(pops, pushes)`
pub fn stack_effect(id: u16) -> Option<(u16, u16)> {
    let effect = match id {
        TYPE_NAME => (1, 1),
        STR_EQ => (2, 1),
        DISPATCH_CONTAINS => (3, 1),
        DISPATCH_RUN | DISPATCH_RUN_STATIC => (4, 1),
        FIELD_GET => (2, 1),
        FIELD_SET => (3, 0),
        STATIC_FIELD_GET => (1, 1),
        STATIC_FIELD_SET => (2, 0),
        NO_SUCH_METHOD => (1, 1),
        _ => return None,
    };
    Some(effect)
}

/// Name of an intrinsic, for diagnostics
pub fn name(id: u16) -> Option<&'static str> {
    let name = match id {
        TYPE_NAME => "TYPE_NAME",
        STR_EQ => "STR_EQ",
        DISPATCH_CONTAINS => "DISPATCH_CONTAINS",
        DISPATCH_RUN => "DISPATCH_RUN",
        DISPATCH_RUN_STATIC => "DISPATCH_RUN_STATIC",
        FIELD_GET => "FIELD_GET",
        FIELD_SET => "FIELD_SET",
        STATIC_FIELD_GET => "STATIC_FIELD_GET",
        STATIC_FIELD_SET => "STATIC_FIELD_SET",
        NO_SUCH_METHOD => "NO_SUCH_METHOD",
        _ => return None,
    };
    Some(name)
}
