//! Programmatic construction of descriptive method bodies.
//!
//! Branch targets and region boundaries are written as symbolic labels and resolved to
//! instruction positions by [`BodyBuilder::build`]. A label marked after the last instruction
//! resolves to the end-of-body position.

use std::collections::HashMap;

use thiserror::Error;

use super::opcodes;
use super::{
    ExceptionRegion, HandlerKind, Instruction, LocalDef, MethodBody, MethodRef, Operand, TypeRef,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Label '{0}' is used but never marked")]
    UnknownLabel(String),
    #[error("Label '{0}' is marked twice")]
    DuplicateLabel(String),
}

#[derive(Debug, Clone)]
enum Fixup {
    Target(String),
    Switch(Vec<String>),
}

#[derive(Debug, Clone)]
struct PendingRegion {
    kind: HandlerKind,
    try_start: String,
    try_end: String,
    handler_start: String,
    handler_end: String,
    filter_start: Option<String>,
    catch_type: Option<TypeRef>,
}

#[derive(Debug, Default)]
pub struct BodyBuilder {
    instructions: Vec<Instruction>,
    locals: Vec<LocalDef>,
    labels: HashMap<String, usize>,
    duplicate: Option<String>,
    fixups: Vec<(usize, Fixup)>,
    regions: Vec<PendingRegion>,
}

impl BodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a local and return its index.
    pub fn local(&mut self, ty: TypeRef) -> u16 {
        self.locals.push(LocalDef { ty, pinned: false });
        (self.locals.len() - 1) as u16
    }

    /// Bind `label` to the position of the next emitted instruction.
    pub fn mark(&mut self, label: &str) -> &mut Self {
        if self.labels.insert(label.to_string(), self.instructions.len()).is_some() {
            self.duplicate.get_or_insert_with(|| label.to_string());
        }
        self
    }

    pub fn position(&self) -> usize {
        self.instructions.len()
    }

    pub fn op(&mut self, opcode: u16) -> &mut Self {
        self.instructions.push(Instruction::simple(opcode));
        self
    }

    pub fn op_with(&mut self, opcode: u16, operand: Operand) -> &mut Self {
        self.instructions.push(Instruction::new(opcode, operand));
        self
    }

    pub fn branch(&mut self, opcode: u16, label: &str) -> &mut Self {
        self.fixups.push((self.instructions.len(), Fixup::Target(label.to_string())));
        self.instructions.push(Instruction::new(opcode, Operand::Target(0)));
        self
    }

    pub fn switch(&mut self, labels: &[&str]) -> &mut Self {
        let labels = labels.iter().map(|l| l.to_string()).collect();
        self.fixups.push((self.instructions.len(), Fixup::Switch(labels)));
        self.instructions.push(Instruction::new(opcodes::SWITCH, Operand::Switch(Vec::new())));
        self
    }

    pub fn ldc(&mut self, value: i64) -> &mut Self {
        self.op_with(opcodes::LDC_I4, Operand::Int(value))
    }

    pub fn ldstr(&mut self, value: &str) -> &mut Self {
        self.op_with(opcodes::LDSTR, Operand::Str(value.to_string()))
    }

    pub fn ldarg(&mut self, index: u16) -> &mut Self {
        self.op_with(opcodes::LDARG, Operand::Arg(index))
    }

    pub fn ldloc(&mut self, index: u16) -> &mut Self {
        self.op_with(opcodes::LDLOC, Operand::Local(index))
    }

    pub fn stloc(&mut self, index: u16) -> &mut Self {
        self.op_with(opcodes::STLOC, Operand::Local(index))
    }

    pub fn call(&mut self, method: MethodRef) -> &mut Self {
        self.op_with(opcodes::CALL, Operand::Method(method))
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(opcodes::RET)
    }

    /// Add a protected region whose boundaries are given as labels.
    pub fn region(
        &mut self,
        kind: HandlerKind,
        try_start: &str,
        try_end: &str,
        handler_start: &str,
        handler_end: &str,
    ) -> &mut Self {
        self.regions.push(PendingRegion {
            kind,
            try_start: try_start.to_string(),
            try_end: try_end.to_string(),
            handler_start: handler_start.to_string(),
            handler_end: handler_end.to_string(),
            filter_start: None,
            catch_type: None,
        });
        self
    }

    pub fn catch_region(
        &mut self,
        catch_type: TypeRef,
        try_start: &str,
        try_end: &str,
        handler_start: &str,
        handler_end: &str,
    ) -> &mut Self {
        self.region(HandlerKind::Catch, try_start, try_end, handler_start, handler_end);
        if let Some(region) = self.regions.last_mut() {
            region.catch_type = Some(catch_type);
        }
        self
    }

    pub fn filter_region(
        &mut self,
        try_start: &str,
        filter_start: &str,
        handler_start: &str,
        handler_end: &str,
    ) -> &mut Self {
        self.region(HandlerKind::Filter, try_start, filter_start, handler_start, handler_end);
        if let Some(region) = self.regions.last_mut() {
            region.filter_start = Some(filter_start.to_string());
        }
        self
    }

    pub fn build(self) -> Result<MethodBody, BuildError> {
        if let Some(label) = self.duplicate {
            return Err(BuildError::DuplicateLabel(label));
        }
        let resolve = |label: &str| {
            self.labels.get(label).copied().ok_or_else(|| BuildError::UnknownLabel(label.into()))
        };

        let mut instructions = self.instructions.clone();
        for (position, fixup) in &self.fixups {
            instructions[*position].operand = match fixup {
                Fixup::Target(label) => Operand::Target(resolve(label)?),
                Fixup::Switch(labels) => Operand::Switch(
                    labels.iter().map(|l| resolve(l)).collect::<Result<Vec<_>, _>>()?,
                ),
            };
        }

        let mut regions = Vec::with_capacity(self.regions.len());
        for pending in &self.regions {
            regions.push(ExceptionRegion {
                try_start: resolve(&pending.try_start)?,
                try_end: resolve(&pending.try_end)?,
                handler_start: resolve(&pending.handler_start)?,
                handler_end: resolve(&pending.handler_end)?,
                kind: pending.kind,
                filter_start: pending.filter_start.as_deref().map(resolve).transpose()?,
                catch_type: pending.catch_type.clone(),
            });
        }

        Ok(MethodBody { locals: self.locals, instructions, regions })
    }
}
