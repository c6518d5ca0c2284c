//! Executable opcode set of the host runtime.

use std::fmt;

/// Shape of operand an executable opcode expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Int,
    Float,
    Str,
    Label,
    Labels,
    Method,
    Field,
    Type,
    Token,
    Local,
    Arg,
}

macro_rules! host_ops {
    ($($variant:ident = $value:expr, $mnemonic:expr, $kind:ident;)*) => {
        /// Host opcode. Each carries the numeric encoding it answers to.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HostOp {
            $($variant,)*
        }

        impl HostOp {
            pub const ALL: &'static [HostOp] = &[$(HostOp::$variant,)*];

            pub const fn encoding(self) -> u16 {
                match self {
                    $(HostOp::$variant => $value,)*
                }
            }

            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(HostOp::$variant => $mnemonic,)*
                }
            }

            pub const fn operand_kind(self) -> OperandKind {
                match self {
                    $(HostOp::$variant => OperandKind::$kind,)*
                }
            }
        }
    };
}

host_ops! {
    Nop = 0x00, "nop", None;
    LdNull = 0x14, "ldnull", None;
    LdcI4 = 0x20, "ldc.i4", Int;
    LdcI8 = 0x21, "ldc.i8", Int;
    LdcR8 = 0x23, "ldc.r8", Float;
    Dup = 0x25, "dup", None;
    Pop = 0x26, "pop", None;
    Call = 0x28, "call", Method;
    Ret = 0x2A, "ret", None;
    Br = 0x38, "br", Label;
    BrFalse = 0x39, "brfalse", Label;
    BrTrue = 0x3A, "brtrue", Label;
    Beq = 0x3B, "beq", Label;
    Bge = 0x3C, "bge", Label;
    Bgt = 0x3D, "bgt", Label;
    Ble = 0x3E, "ble", Label;
    Blt = 0x3F, "blt", Label;
    BneUn = 0x40, "bne.un", Label;
    Switch = 0x45, "switch", Labels;
    Add = 0x58, "add", None;
    Sub = 0x59, "sub", None;
    Mul = 0x5A, "mul", None;
    Div = 0x5B, "div", None;
    Rem = 0x5D, "rem", None;
    And = 0x5F, "and", None;
    Or = 0x60, "or", None;
    Xor = 0x61, "xor", None;
    Neg = 0x65, "neg", None;
    Not = 0x66, "not", None;
    ConvI4 = 0x69, "conv.i4", None;
    ConvI8 = 0x6A, "conv.i8", None;
    ConvR8 = 0x6C, "conv.r8", None;
    CallVirt = 0x6F, "callvirt", Method;
    LdStr = 0x72, "ldstr", Str;
    NewObj = 0x73, "newobj", Method;
    CastClass = 0x74, "castclass", Type;
    IsInst = 0x75, "isinst", Type;
    Throw = 0x7A, "throw", None;
    LdFld = 0x7B, "ldfld", Field;
    StFld = 0x7D, "stfld", Field;
    LdsFld = 0x7E, "ldsfld", Field;
    StsFld = 0x80, "stsfld", Field;
    Box = 0x8C, "box", Type;
    UnboxAny = 0xA5, "unbox.any", Type;
    LdToken = 0xD0, "ldtoken", Token;
    EndFinally = 0xDC, "endfinally", None;
    Leave = 0xDD, "leave", Label;
    Ceq = 0xFE01, "ceq", None;
    Cgt = 0xFE02, "cgt", None;
    Clt = 0xFE04, "clt", None;
    LdArg = 0xFE09, "ldarg", Arg;
    StArg = 0xFE0B, "starg", Arg;
    LdLoc = 0xFE0C, "ldloc", Local;
    StLoc = 0xFE0E, "stloc", Local;
    EndFilter = 0xFE11, "endfilter", None;
    Rethrow = 0xFE1A, "rethrow", None;
}

impl fmt::Display for HostOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
