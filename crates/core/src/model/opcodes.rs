//! Descriptive opcode encoding.
//!
//! Values follow the ECMA-335 numbering; two-byte opcodes carry their `0xFE` prefix in the high
//! byte. The table also lists opcodes the host runtime cannot execute so that listings and error
//! messages can still name them.

pub const NOP: u16 = 0x00;
pub const LDNULL: u16 = 0x14;
pub const LDC_I4: u16 = 0x20;
pub const LDC_I8: u16 = 0x21;
pub const LDC_R8: u16 = 0x23;
pub const DUP: u16 = 0x25;
pub const POP: u16 = 0x26;
pub const JMP: u16 = 0x27;
pub const CALL: u16 = 0x28;
pub const CALLI: u16 = 0x29;
pub const RET: u16 = 0x2A;
pub const BR: u16 = 0x38;
pub const BRFALSE: u16 = 0x39;
pub const BRTRUE: u16 = 0x3A;
pub const BEQ: u16 = 0x3B;
pub const BGE: u16 = 0x3C;
pub const BGT: u16 = 0x3D;
pub const BLE: u16 = 0x3E;
pub const BLT: u16 = 0x3F;
pub const BNE_UN: u16 = 0x40;
pub const SWITCH: u16 = 0x45;
pub const ADD: u16 = 0x58;
pub const SUB: u16 = 0x59;
pub const MUL: u16 = 0x5A;
pub const DIV: u16 = 0x5B;
pub const REM: u16 = 0x5D;
pub const AND: u16 = 0x5F;
pub const OR: u16 = 0x60;
pub const XOR: u16 = 0x61;
pub const NEG: u16 = 0x65;
pub const NOT: u16 = 0x66;
pub const CONV_I4: u16 = 0x69;
pub const CONV_I8: u16 = 0x6A;
pub const CONV_R8: u16 = 0x6C;
pub const CALLVIRT: u16 = 0x6F;
pub const LDSTR: u16 = 0x72;
pub const NEWOBJ: u16 = 0x73;
pub const CASTCLASS: u16 = 0x74;
pub const ISINST: u16 = 0x75;
pub const THROW: u16 = 0x7A;
pub const LDFLD: u16 = 0x7B;
pub const STFLD: u16 = 0x7D;
pub const LDSFLD: u16 = 0x7E;
pub const STSFLD: u16 = 0x80;
pub const BOX: u16 = 0x8C;
pub const UNBOX_ANY: u16 = 0xA5;
pub const LDTOKEN: u16 = 0xD0;
pub const ENDFINALLY: u16 = 0xDC;
pub const LEAVE: u16 = 0xDD;
pub const ARGLIST: u16 = 0xFE00;
pub const CEQ: u16 = 0xFE01;
pub const CGT: u16 = 0xFE02;
pub const CLT: u16 = 0xFE04;
pub const LDARG: u16 = 0xFE09;
pub const STARG: u16 = 0xFE0B;
pub const LDLOC: u16 = 0xFE0C;
pub const STLOC: u16 = 0xFE0E;
pub const LOCALLOC: u16 = 0xFE0F;
pub const ENDFILTER: u16 = 0xFE11;
pub const RETHROW: u16 = 0xFE1A;

const NAMES: &[(u16, &str)] = &[
    (NOP, "nop"),
    (LDNULL, "ldnull"),
    (LDC_I4, "ldc.i4"),
    (LDC_I8, "ldc.i8"),
    (LDC_R8, "ldc.r8"),
    (DUP, "dup"),
    (POP, "pop"),
    (JMP, "jmp"),
    (CALL, "call"),
    (CALLI, "calli"),
    (RET, "ret"),
    (BR, "br"),
    (BRFALSE, "brfalse"),
    (BRTRUE, "brtrue"),
    (BEQ, "beq"),
    (BGE, "bge"),
    (BGT, "bgt"),
    (BLE, "ble"),
    (BLT, "blt"),
    (BNE_UN, "bne.un"),
    (SWITCH, "switch"),
    (ADD, "add"),
    (SUB, "sub"),
    (MUL, "mul"),
    (DIV, "div"),
    (REM, "rem"),
    (AND, "and"),
    (OR, "or"),
    (XOR, "xor"),
    (NEG, "neg"),
    (NOT, "not"),
    (CONV_I4, "conv.i4"),
    (CONV_I8, "conv.i8"),
    (CONV_R8, "conv.r8"),
    (CALLVIRT, "callvirt"),
    (LDSTR, "ldstr"),
    (NEWOBJ, "newobj"),
    (CASTCLASS, "castclass"),
    (ISINST, "isinst"),
    (THROW, "throw"),
    (LDFLD, "ldfld"),
    (STFLD, "stfld"),
    (LDSFLD, "ldsfld"),
    (STSFLD, "stsfld"),
    (BOX, "box"),
    (UNBOX_ANY, "unbox.any"),
    (LDTOKEN, "ldtoken"),
    (ENDFINALLY, "endfinally"),
    (LEAVE, "leave"),
    (ARGLIST, "arglist"),
    (CEQ, "ceq"),
    (CGT, "cgt"),
    (CLT, "clt"),
    (LDARG, "ldarg"),
    (STARG, "starg"),
    (LDLOC, "ldloc"),
    (STLOC, "stloc"),
    (LOCALLOC, "localloc"),
    (ENDFILTER, "endfilter"),
    (RETHROW, "rethrow"),
];

/// Mnemonic for a descriptive opcode, if the value is a known opcode.
pub fn name(code: u16) -> Option<&'static str> {
    NAMES.iter().find(|(value, _)| *value == code).map(|(_, name)| *name)
}

/// Mnemonic or a hex placeholder for unknown values.
pub fn describe(code: u16) -> String {
    match name(code) {
        Some(name) => name.to_string(),
        None => format!("0x{code:04X}"),
    }
}
