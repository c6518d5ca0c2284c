//! Executable instruction form and the assembler that turns it into a callable body.
//!
//! An [`Emitter`] hands out labels and locals for one body under construction. Instructions
//! carry the labels bound to their position and exception-block markers anchored on them; the
//! assembler resolves labels to positions and rebuilds the exception table from the markers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::ops::{HostOp, OperandKind};
use super::{FieldHandle, MethodHandle, PropertyHandle, TypeHandle};
use crate::model::HandlerKind;

/// Opaque marker bound to exactly one instruction position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);

impl Label {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct LocalSlot {
    pub index: u16,
    pub ty: TypeHandle,
    pub pinned: bool,
}

/// Any resolved symbol, as loaded by `ldtoken`.
#[derive(Debug, Clone)]
pub enum Symbol {
    Type(TypeHandle),
    Method(MethodHandle),
    Field(FieldHandle),
    Property(PropertyHandle),
}

impl Symbol {
    pub fn qualified_name(&self) -> String {
        match self {
            Symbol::Type(ty) => ty.display_name(),
            Symbol::Method(method) => method.identity().to_string(),
            Symbol::Field(field) => field.to_string(),
            Symbol::Property(property) => property.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExecOperand {
    None,
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Label(Label),
    Labels(Vec<Label>),
    Method(MethodHandle),
    Field(FieldHandle),
    Type(TypeHandle),
    Token(Symbol),
    Local(LocalSlot),
    Arg(u16),
}

impl ExecOperand {
    pub fn kind(&self) -> OperandKind {
        match self {
            ExecOperand::None => OperandKind::None,
            ExecOperand::Int(_) => OperandKind::Int,
            ExecOperand::Float(_) => OperandKind::Float,
            ExecOperand::Str(_) => OperandKind::Str,
            ExecOperand::Label(_) => OperandKind::Label,
            ExecOperand::Labels(_) => OperandKind::Labels,
            ExecOperand::Method(_) => OperandKind::Method,
            ExecOperand::Field(_) => OperandKind::Field,
            ExecOperand::Type(_) => OperandKind::Type,
            ExecOperand::Token(_) => OperandKind::Token,
            ExecOperand::Local(_) => OperandKind::Local,
            ExecOperand::Arg(_) => OperandKind::Arg,
        }
    }
}

impl fmt::Display for ExecOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecOperand::None => Ok(()),
            ExecOperand::Int(v) => write!(f, "{v}"),
            ExecOperand::Float(v) => write!(f, "{v:?}"),
            ExecOperand::Str(s) => write!(f, "{s:?}"),
            ExecOperand::Label(label) => write!(f, "{label}"),
            ExecOperand::Labels(labels) => {
                let labels: Vec<String> = labels.iter().map(Label::to_string).collect();
                write!(f, "({})", labels.join(", "))
            }
            ExecOperand::Method(method) => write!(f, "{}", method.identity()),
            ExecOperand::Field(field) => write!(f, "{field}"),
            ExecOperand::Type(ty) => write!(f, "{}", ty.display_name()),
            ExecOperand::Token(symbol) => write!(f, "{}", symbol.qualified_name()),
            ExecOperand::Local(slot) => write!(f, "V_{}", slot.index),
            ExecOperand::Arg(index) => write!(f, "A_{index}"),
        }
    }
}

/// Exception-scope marker anchored on an instruction.
#[derive(Debug, Clone)]
pub enum ExceptionBlock {
    BeginException,
    BeginFilter,
    BeginHandler { kind: HandlerKind, catch_type: Option<TypeHandle> },
    EndException,
}

impl ExceptionBlock {
    /// Markers sharing a position apply ends first, then handlers, then new scopes.
    fn phase(&self) -> u8 {
        match self {
            ExceptionBlock::EndException => 0,
            ExceptionBlock::BeginFilter | ExceptionBlock::BeginHandler { .. } => 1,
            ExceptionBlock::BeginException => 2,
        }
    }
}

impl fmt::Display for ExceptionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionBlock::BeginException => f.write_str("begin-try"),
            ExceptionBlock::BeginFilter => f.write_str("begin-filter"),
            ExceptionBlock::BeginHandler { kind, catch_type: Some(ty) } => {
                write!(f, "begin-{kind:?}({})", ty.display_name())
            }
            ExceptionBlock::BeginHandler { kind, catch_type: None } => write!(f, "begin-{kind:?}"),
            ExceptionBlock::EndException => f.write_str("end-try"),
        }
    }
}

/// One instruction in the host's executable form.
#[derive(Debug, Clone)]
pub struct ExecInstruction {
    pub op: HostOp,
    pub operand: ExecOperand,
    pub labels: Vec<Label>,
    pub blocks: Vec<ExceptionBlock>,
}

impl ExecInstruction {
    pub fn new(op: HostOp, operand: ExecOperand) -> Self {
        Self { op, operand, labels: Vec::new(), blocks: Vec::new() }
    }
}

impl fmt::Display for ExecInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            write!(f, "{{{block}}} ")?;
        }
        for label in &self.labels {
            write!(f, "{label}: ")?;
        }
        write!(f, "{}", self.op)?;
        if !matches!(self.operand, ExecOperand::None) {
            write!(f, " {}", self.operand)?;
        }
        Ok(())
    }
}

/// Allocates labels and locals for one body under construction.
#[derive(Debug, Default)]
pub struct Emitter {
    next_label: u32,
    locals: Vec<LocalSlot>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn declare_local(&mut self, ty: TypeHandle, pinned: bool) -> LocalSlot {
        let slot = LocalSlot { index: self.locals.len() as u16, ty, pinned };
        self.locals.push(slot.clone());
        slot
    }

    pub fn label_count(&self) -> u32 {
        self.next_label
    }

    pub fn locals(&self) -> &[LocalSlot] {
        &self.locals
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("Label L{0} is referenced but never bound")]
    UnboundLabel(u32),
    #[error("Label L{0} is bound to more than one instruction")]
    DuplicateLabel(u32),
    #[error("Label L{0} was not defined by this emitter")]
    ForeignLabel(u32),
    #[error("Unbalanced exception block at {position}: {reason}")]
    Unbalanced { position: usize, reason: String },
    #[error("Operand of {op} at {position} does not match the opcode")]
    OperandMismatch { position: usize, op: HostOp },
}

#[derive(Debug, Clone)]
pub enum CompiledOperand {
    None,
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Target(usize),
    Targets(Vec<usize>),
    Method(MethodHandle),
    Field(FieldHandle),
    Type(TypeHandle),
    Token(Symbol),
    Local(u16),
    Arg(u16),
}

#[derive(Debug, Clone)]
pub struct CompiledInstr {
    pub op: HostOp,
    pub operand: CompiledOperand,
}

/// One handler clause of the flattened exception table. Innermost clauses come first.
#[derive(Debug, Clone)]
pub struct CompiledRegion {
    pub try_start: usize,
    pub try_end: usize,
    pub handler_start: usize,
    pub handler_end: usize,
    pub kind: HandlerKind,
    pub filter_start: Option<usize>,
    pub catch_type: Option<TypeHandle>,
}

impl CompiledRegion {
    pub fn try_contains(&self, pc: usize) -> bool {
        pc >= self.try_start && pc < self.try_end
    }
}

/// A finished, label-resolved body ready for the interpreter.
#[derive(Debug, Clone)]
pub struct CompiledBody {
    pub name: String,
    pub code: Vec<CompiledInstr>,
    pub locals: Vec<TypeHandle>,
    pub regions: Vec<CompiledRegion>,
}

struct OpenClause {
    kind: HandlerKind,
    catch_type: Option<TypeHandle>,
    handler_start: usize,
    filter_start: Option<usize>,
}

struct OpenScope {
    try_start: usize,
    try_end: Option<usize>,
    current: Option<OpenClause>,
    pending_filter: Option<usize>,
    clauses: usize,
}

impl OpenScope {
    fn new(try_start: usize) -> Self {
        Self { try_start, try_end: None, current: None, pending_filter: None, clauses: 0 }
    }

    fn close_clause(&mut self, end: usize, regions: &mut Vec<CompiledRegion>) {
        if let Some(clause) = self.current.take() {
            regions.push(CompiledRegion {
                try_start: self.try_start,
                try_end: self.try_end.unwrap_or(clause.handler_start),
                handler_start: clause.handler_start,
                handler_end: end,
                kind: clause.kind,
                filter_start: clause.filter_start,
                catch_type: clause.catch_type,
            });
            self.clauses += 1;
        }
    }

    fn finish(mut self, end: usize, regions: &mut Vec<CompiledRegion>) -> Result<(), AssembleError> {
        self.close_clause(end, regions);
        if self.clauses == 0 {
            return Err(AssembleError::Unbalanced {
                position: end,
                reason: "exception block has no handler".into(),
            });
        }
        Ok(())
    }
}

fn build_exception_table(
    instructions: &[ExecInstruction],
) -> Result<Vec<CompiledRegion>, AssembleError> {
    let mut regions = Vec::new();
    let mut stack: Vec<OpenScope> = Vec::new();

    for (position, instr) in instructions.iter().enumerate() {
        let mut blocks: Vec<&ExceptionBlock> = instr.blocks.iter().collect();
        blocks.sort_by_key(|b| b.phase());
        for block in blocks {
            match block {
                ExceptionBlock::EndException => {
                    let scope = stack.pop().ok_or_else(|| AssembleError::Unbalanced {
                        position,
                        reason: "end of exception block without a matching begin".into(),
                    })?;
                    scope.finish(position, &mut regions)?;
                }
                ExceptionBlock::BeginFilter => {
                    let scope = stack.last_mut().ok_or_else(|| AssembleError::Unbalanced {
                        position,
                        reason: "filter outside an exception block".into(),
                    })?;
                    scope.close_clause(position, &mut regions);
                    scope.try_end.get_or_insert(position);
                    scope.pending_filter = Some(position);
                }
                ExceptionBlock::BeginHandler { kind, catch_type } => {
                    let scope = stack.last_mut().ok_or_else(|| AssembleError::Unbalanced {
                        position,
                        reason: "handler outside an exception block".into(),
                    })?;
                    let filter_start = if *kind == HandlerKind::Filter {
                        let start = scope.pending_filter.take().ok_or_else(|| {
                            AssembleError::Unbalanced {
                                position,
                                reason: "filter handler without a filter block".into(),
                            }
                        })?;
                        Some(start)
                    } else {
                        scope.close_clause(position, &mut regions);
                        None
                    };
                    scope.try_end.get_or_insert(position);
                    scope.current = Some(OpenClause {
                        kind: *kind,
                        catch_type: catch_type.clone(),
                        handler_start: position,
                        filter_start,
                    });
                }
                ExceptionBlock::BeginException => stack.push(OpenScope::new(position)),
            }
        }
    }

    // Scopes whose end marker would sit past the last instruction end with the body.
    let end = instructions.len();
    while let Some(scope) = stack.pop() {
        scope.finish(end, &mut regions)?;
    }
    Ok(regions)
}

/// Resolve labels and exception markers into a [`CompiledBody`].
pub fn assemble(
    name: &str,
    emitter: Emitter,
    instructions: Vec<ExecInstruction>,
) -> Result<CompiledBody, AssembleError> {
    let mut bound: HashMap<Label, usize> = HashMap::new();
    for (position, instr) in instructions.iter().enumerate() {
        for label in &instr.labels {
            if label.0 >= emitter.next_label {
                return Err(AssembleError::ForeignLabel(label.0));
            }
            if bound.insert(*label, position).is_some() {
                return Err(AssembleError::DuplicateLabel(label.0));
            }
        }
    }
    let target =
        |label: &Label| bound.get(label).copied().ok_or(AssembleError::UnboundLabel(label.0));

    let regions = build_exception_table(&instructions)?;

    let mut code = Vec::with_capacity(instructions.len());
    for (position, instr) in instructions.into_iter().enumerate() {
        let expected = instr.op.operand_kind();
        let actual = instr.operand.kind();
        if expected != actual {
            return Err(AssembleError::OperandMismatch { position, op: instr.op });
        }
        let operand = match instr.operand {
            ExecOperand::None => CompiledOperand::None,
            ExecOperand::Int(v) => CompiledOperand::Int(v),
            ExecOperand::Float(v) => CompiledOperand::Float(v),
            ExecOperand::Str(s) => CompiledOperand::Str(s),
            ExecOperand::Label(label) => CompiledOperand::Target(target(&label)?),
            ExecOperand::Labels(labels) => CompiledOperand::Targets(
                labels.iter().map(&target).collect::<Result<Vec<_>, _>>()?,
            ),
            ExecOperand::Method(method) => CompiledOperand::Method(method),
            ExecOperand::Field(field) => CompiledOperand::Field(field),
            ExecOperand::Type(ty) => CompiledOperand::Type(ty),
            ExecOperand::Token(symbol) => CompiledOperand::Token(symbol),
            ExecOperand::Local(slot) => CompiledOperand::Local(slot.index),
            ExecOperand::Arg(index) => CompiledOperand::Arg(index),
        };
        code.push(CompiledInstr { op: instr.op, operand });
    }

    Ok(CompiledBody {
        name: name.to_string(),
        code,
        locals: emitter.locals.into_iter().map(|slot| slot.ty).collect(),
        regions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(op: HostOp, operand: ExecOperand) -> ExecInstruction {
        ExecInstruction::new(op, operand)
    }

    #[test]
    fn labels_resolve_to_bound_positions() {
        let mut emitter = Emitter::new();
        let target = emitter.define_label();
        let mut code = vec![
            instr(HostOp::Br, ExecOperand::Label(target)),
            instr(HostOp::Nop, ExecOperand::None),
            instr(HostOp::Ret, ExecOperand::None),
        ];
        code[2].labels.push(target);
        let body = assemble("t", emitter, code).unwrap();
        assert!(matches!(body.code[0].operand, CompiledOperand::Target(2)));
    }

    #[test]
    fn unbound_and_duplicate_labels_are_rejected() {
        let mut emitter = Emitter::new();
        let label = emitter.define_label();
        let code = vec![instr(HostOp::Br, ExecOperand::Label(label))];
        assert_eq!(assemble("t", emitter, code).unwrap_err(), AssembleError::UnboundLabel(0));

        let mut emitter = Emitter::new();
        let label = emitter.define_label();
        let mut code = vec![instr(HostOp::Nop, ExecOperand::None), instr(HostOp::Ret, ExecOperand::None)];
        code[0].labels.push(label);
        code[1].labels.push(label);
        assert_eq!(assemble("t", emitter, code).unwrap_err(), AssembleError::DuplicateLabel(0));
    }

    #[test]
    fn operand_shape_is_checked() {
        let code = vec![instr(HostOp::Br, ExecOperand::Int(3))];
        let err = assemble("t", Emitter::new(), code).unwrap_err();
        assert_eq!(err, AssembleError::OperandMismatch { position: 0, op: HostOp::Br });
    }

    #[test]
    fn open_scope_is_closed_at_body_end() {
        let mut code = vec![
            instr(HostOp::Nop, ExecOperand::None),
            instr(HostOp::EndFinally, ExecOperand::None),
        ];
        code[0].blocks.push(ExceptionBlock::BeginException);
        code[1].blocks.push(ExceptionBlock::BeginHandler {
            kind: HandlerKind::Finally,
            catch_type: None,
        });
        let body = assemble("t", Emitter::new(), code).unwrap();
        assert_eq!(body.regions.len(), 1);
        let region = &body.regions[0];
        assert_eq!((region.try_start, region.try_end), (0, 1));
        assert_eq!((region.handler_start, region.handler_end), (1, 2));
    }

    #[test]
    fn handler_without_scope_is_unbalanced() {
        let mut code = vec![instr(HostOp::Nop, ExecOperand::None)];
        code[0].blocks.push(ExceptionBlock::EndException);
        assert!(matches!(
            assemble("t", Emitter::new(), code).unwrap_err(),
            AssembleError::Unbalanced { position: 0, .. }
        ));
    }
}
