//! Instruction translator: descriptive method bodies to the host's executable form.
//!
//! Translation runs three passes over the descriptive instruction positions:
//!
//! 1. Target discovery. Branch targets, switch-table entries and every exception-region
//!    boundary get exactly one [`Label`] per distinct position.
//! 2. Re-emission. Opcodes go through the reverse lookup table, branch operands become labels,
//!    symbolic operands are resolved against live modules only.
//! 3. Region reconstruction. Exception-block markers are anchored on the instructions at region
//!    boundaries. A scope whose last handler ends at the end of the body gets no end marker.

pub mod opcode_map;
pub mod resolve;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::model::{opcodes, ExceptionRegion, HandlerKind, MethodBody, Operand};
use crate::runtime::ops::OperandKind;
use crate::runtime::{
    Emitter, ExceptionBlock, ExecInstruction, ExecOperand, HostOp, Label, Runtime, Symbol,
};

pub use resolve::{ResolveError, SymbolResolver, VersionPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("Opcode {name} (0x{code:04X}) has no host equivalent")]
    UnsupportedOpcode { code: u16, name: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("Branch at {position} targets {target}, outside the body")]
    TargetOutOfRange { position: usize, target: usize },
    #[error("Exception region {index} is malformed: {reason}")]
    MalformedRegion { index: usize, reason: String },
    #[error("Instruction at {position} references undeclared local {index}")]
    LocalOutOfRange { position: usize, index: u16 },
    #[error("Operand of {op} at {position} does not fit the opcode")]
    OperandMismatch { position: usize, op: HostOp },
}

pub struct Translator<'a> {
    resolver: SymbolResolver<'a>,
}

impl<'a> Translator<'a> {
    pub fn new(runtime: &'a Runtime, policy: VersionPolicy) -> Self {
        Self { resolver: SymbolResolver::new(runtime, policy) }
    }

    pub fn translate(
        &self,
        body: &MethodBody,
        emitter: &mut Emitter,
    ) -> Result<Vec<ExecInstruction>, TranslateError> {
        let len = body.instructions.len();
        validate_regions(&body.regions, len)?;

        for local in &body.locals {
            let ty = self.resolver.resolve_type(&local.ty)?;
            emitter.declare_local(ty, local.pinned);
        }

        let labels = discover_targets(body, emitter)?;

        let mut out = Vec::with_capacity(len);
        for (position, instr) in body.instructions.iter().enumerate() {
            let op = opcode_map::lookup(instr.opcode).ok_or_else(|| {
                TranslateError::UnsupportedOpcode {
                    code: instr.opcode,
                    name: opcodes::describe(instr.opcode),
                }
            })?;
            let operand = self.operand(position, op, &instr.operand, &labels, emitter)?;
            let mut exec = ExecInstruction::new(op, operand);
            if let Some(label) = labels.get(&position) {
                exec.labels.push(*label);
            }
            out.push(exec);
        }

        self.place_exception_blocks(&body.regions, &mut out)?;
        Ok(out)
    }

    fn operand(
        &self,
        position: usize,
        op: HostOp,
        operand: &Operand,
        labels: &BTreeMap<usize, Label>,
        emitter: &Emitter,
    ) -> Result<ExecOperand, TranslateError> {
        let label = |target: usize| {
            labels.get(&target).copied().ok_or(TranslateError::TargetOutOfRange { position, target })
        };
        let translated = match (op.operand_kind(), operand) {
            (OperandKind::None, Operand::None) => ExecOperand::None,
            (OperandKind::Int, Operand::Int(v)) => ExecOperand::Int(*v),
            (OperandKind::Float, Operand::Float(v)) => ExecOperand::Float(*v),
            (OperandKind::Float, Operand::Int(v)) => ExecOperand::Float(*v as f64),
            (OperandKind::Str, Operand::Str(s)) => ExecOperand::Str(s.as_str().into()),
            (OperandKind::Label, Operand::Target(t)) => ExecOperand::Label(label(*t)?),
            (OperandKind::Labels, Operand::Switch(targets)) => ExecOperand::Labels(
                targets.iter().map(|t| label(*t)).collect::<Result<Vec<_>, _>>()?,
            ),
            (OperandKind::Method, Operand::Method(m)) => {
                ExecOperand::Method(self.resolver.resolve_method(m)?)
            }
            (OperandKind::Field, Operand::Field(f)) => {
                ExecOperand::Field(self.resolver.resolve_field(f)?)
            }
            (OperandKind::Type, Operand::Type(t)) => ExecOperand::Type(self.resolver.resolve_type(t)?),
            (OperandKind::Token, Operand::Type(t)) => {
                ExecOperand::Token(Symbol::Type(self.resolver.resolve_type(t)?))
            }
            (OperandKind::Token, Operand::Method(m)) => {
                ExecOperand::Token(Symbol::Method(self.resolver.resolve_method(m)?))
            }
            (OperandKind::Token, Operand::Field(f)) => {
                ExecOperand::Token(Symbol::Field(self.resolver.resolve_field(f)?))
            }
            (OperandKind::Token, Operand::Property(p)) => {
                ExecOperand::Token(Symbol::Property(self.resolver.resolve_property(p)?))
            }
            (OperandKind::Local, Operand::Local(index)) => {
                let slot = emitter.locals().get(usize::from(*index)).cloned();
                ExecOperand::Local(
                    slot.ok_or(TranslateError::LocalOutOfRange { position, index: *index })?,
                )
            }
            (OperandKind::Arg, Operand::Arg(index)) => ExecOperand::Arg(*index),
            _ => return Err(TranslateError::OperandMismatch { position, op }),
        };
        Ok(translated)
    }

    fn place_exception_blocks(
        &self,
        regions: &[ExceptionRegion],
        out: &mut [ExecInstruction],
    ) -> Result<(), TranslateError> {
        let len = out.len();

        // Clauses protecting the same try range form one scope.
        let mut scopes: BTreeMap<(usize, Reverse<usize>), Vec<&ExceptionRegion>> = BTreeMap::new();
        for region in regions {
            scopes.entry((region.try_start, Reverse(region.try_end))).or_default().push(region);
        }

        for ((try_start, _), mut clauses) in scopes {
            clauses.sort_by_key(|r| r.handler_start);
            out[try_start].blocks.push(ExceptionBlock::BeginException);

            let mut scope_end = 0;
            for clause in clauses {
                if let Some(filter_start) = clause.filter_start {
                    out[filter_start].blocks.push(ExceptionBlock::BeginFilter);
                }
                let catch_type = match (&clause.kind, &clause.catch_type) {
                    (HandlerKind::Catch, Some(ty)) => Some(self.resolver.resolve_type(ty)?),
                    _ => None,
                };
                out[clause.handler_start]
                    .blocks
                    .push(ExceptionBlock::BeginHandler { kind: clause.kind, catch_type });
                scope_end = scope_end.max(clause.handler_end);
            }

            if scope_end < len {
                out[scope_end].blocks.push(ExceptionBlock::EndException);
            }
        }
        Ok(())
    }
}

/// Assign one label per distinct branch target and region boundary inside the body.
fn discover_targets(
    body: &MethodBody,
    emitter: &mut Emitter,
) -> Result<BTreeMap<usize, Label>, TranslateError> {
    let len = body.instructions.len();
    let mut targets = BTreeSet::new();

    for (position, instr) in body.instructions.iter().enumerate() {
        let branch_targets: &[usize] = match &instr.operand {
            Operand::Target(t) => std::slice::from_ref(t),
            Operand::Switch(table) => table,
            _ => &[],
        };
        for &target in branch_targets {
            if target >= len {
                return Err(TranslateError::TargetOutOfRange { position, target });
            }
            targets.insert(target);
        }
    }

    for region in &body.regions {
        let boundaries = [
            Some(region.try_start),
            Some(region.try_end),
            Some(region.handler_start),
            Some(region.handler_end),
            region.filter_start,
        ];
        // A boundary at the end of the body has no instruction to carry its label.
        targets.extend(boundaries.into_iter().flatten().filter(|&p| p < len));
    }

    Ok(targets.into_iter().map(|position| (position, emitter.define_label())).collect())
}

fn validate_regions(regions: &[ExceptionRegion], len: usize) -> Result<(), TranslateError> {
    for (index, region) in regions.iter().enumerate() {
        let malformed = |reason: &str| TranslateError::MalformedRegion { index, reason: reason.into() };
        if region.try_start >= region.try_end || region.try_end > len {
            return Err(malformed("try range is empty or exceeds the body"));
        }
        if region.handler_start >= region.handler_end || region.handler_end > len {
            return Err(malformed("handler range is empty or exceeds the body"));
        }
        match region.kind {
            HandlerKind::Catch if region.catch_type.is_none() => {
                return Err(malformed("catch clause without a caught type"));
            }
            HandlerKind::Filter => match region.filter_start {
                Some(start) if start < region.handler_start => {}
                _ => return Err(malformed("filter clause needs a filter block before its handler")),
            },
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{BodyBuilder, Instruction, TypeRef};
    use crate::runtime::{corelib, CapturedConsole};

    fn runtime() -> Runtime {
        Runtime::with_console(Arc::new(CapturedConsole::new())).unwrap()
    }

    fn translate(rt: &Runtime, body: &MethodBody) -> Result<Vec<ExecInstruction>, TranslateError> {
        let mut emitter = Emitter::new();
        Translator::new(rt, VersionPolicy::Lax).translate(body, &mut emitter)
    }

    #[test]
    fn shared_positions_get_one_label() {
        let rt = runtime();
        let mut b = BodyBuilder::new();
        b.mark("try").ldc(1).branch(opcodes::BRTRUE, "handler").branch(opcodes::LEAVE, "out");
        b.mark("handler").op(opcodes::ENDFINALLY);
        b.mark("out").ret();
        b.region(HandlerKind::Finally, "try", "handler", "handler", "out");
        let body = b.build().unwrap();

        let out = translate(&rt, &body).unwrap();
        assert_eq!(out[3].labels.len(), 1);
        assert!(matches!(out[1].operand, ExecOperand::Label(l) if l == out[3].labels[0]));
    }

    #[test]
    fn unsupported_opcode_is_reported_by_name() {
        let rt = runtime();
        let body = MethodBody {
            instructions: vec![Instruction::simple(opcodes::ARGLIST), Instruction::simple(opcodes::RET)],
            ..MethodBody::default()
        };
        let err = translate(&rt, &body).unwrap_err();
        assert_eq!(err, TranslateError::UnsupportedOpcode { code: opcodes::ARGLIST, name: "arglist".into() });
    }

    #[test]
    fn catch_without_type_is_malformed() {
        let rt = runtime();
        let mut b = BodyBuilder::new();
        b.mark("a").op(opcodes::NOP).mark("h").op(opcodes::POP).mark("e").ret();
        b.region(HandlerKind::Catch, "a", "h", "h", "e");
        let err = translate(&rt, &b.build().unwrap()).unwrap_err();
        assert!(matches!(err, TranslateError::MalformedRegion { index: 0, .. }));
    }

    #[test]
    fn locals_are_declared_in_order() {
        let rt = runtime();
        let mut b = BodyBuilder::new();
        let first = b.local(TypeRef::named(corelib::STRING));
        let second = b.local(TypeRef::named("System.Int32"));
        b.ldc(3).stloc(second).ldstr("x").stloc(first).ret();
        let mut emitter = Emitter::new();
        let out = Translator::new(&rt, VersionPolicy::Lax)
            .translate(&b.build().unwrap(), &mut emitter)
            .unwrap();
        assert_eq!(emitter.locals().len(), 2);
        assert!(matches!(&out[1].operand, ExecOperand::Local(slot) if slot.index == 1));
        assert_eq!(emitter.locals()[0].ty.full_name(), corelib::STRING);
    }

    #[test]
    fn ldtoken_on_a_type_becomes_a_token() {
        let rt = runtime();
        let body = MethodBody {
            instructions: vec![
                Instruction::new(opcodes::LDTOKEN, Operand::Type(TypeRef::named(corelib::STRING))),
                Instruction::simple(opcodes::RET),
            ],
            ..MethodBody::default()
        };
        let out = translate(&rt, &body).unwrap();
        assert!(matches!(&out[0].operand, ExecOperand::Token(Symbol::Type(_))));
    }
}
