//! Reverse lookup from descriptive opcode encodings to host opcodes.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::runtime::HostOp;

fn table() -> &'static HashMap<u16, HostOp> {
    static TABLE: OnceLock<HashMap<u16, HostOp>> = OnceLock::new();
    TABLE.get_or_init(|| HostOp::ALL.iter().map(|op| (op.encoding(), *op)).collect())
}

/// Host opcode equivalent to a descriptive opcode, if the host has one.
pub fn lookup(code: u16) -> Option<HostOp> {
    table().get(&code).copied()
}
