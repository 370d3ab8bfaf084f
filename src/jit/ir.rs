//! The trace's SSA intermediate representation.
//!
//! Grounded in the original source's `SSAInstruction<N>`/`Operand`
//! (`examples/original_source/src/jit/SSAInstruction.hpp`): a flat,
//! append-only buffer of fixed-arity instructions, each producing exactly
//! one value identified by its own position (`SPEC_FULL.md` section 3).
//! The original splits `SSAInstruction<2>`/`SSAInstruction<3>` by a
//! const-generic operand count depending on compilation phase; this
//! implementation uses a single fixed two-operand shape throughout, since
//! every opcode in the closed set here needs at most two.

use crate::value::ValueType;
use std::fmt;

/// The closed IR opcode set (`SPEC_FULL.md` section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Less,
    Equal,
    Load,
    Store,
    Move,
    Literal,
    Loop,
    LoopStart,
    Jump,
    Phi,
    CheckType,
    CheckTrue,
    CheckFalse,
    Noop,
    Return,
}

impl IrOp {
    pub fn name(self) -> &'static str {
        use IrOp::*;
        match self {
            Add => "ADD",
            Subtract => "SUBTRACT",
            Multiply => "MULTIPLY",
            Divide => "DIVIDE",
            Less => "LESS",
            Equal => "EQUAL",
            Load => "LOAD",
            Store => "STORE",
            Move => "MOVE",
            Literal => "LITERAL",
            Loop => "LOOP",
            LoopStart => "LOOP_START",
            Jump => "JUMP",
            Phi => "PHI",
            CheckType => "CHECK_TYPE",
            CheckTrue => "CHECK_TRUE",
            CheckFalse => "CHECK_FALSE",
            Noop => "NOOP",
            Return => "RETURN",
        }
    }

    pub fn is_guard(self) -> bool {
        matches!(self, IrOp::CheckType | IrOp::CheckTrue | IrOp::CheckFalse)
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            IrOp::Add | IrOp::Subtract | IrOp::Multiply | IrOp::Divide
        )
    }

    pub fn is_compare(self) -> bool {
        matches!(self, IrOp::Less | IrOp::Equal)
    }

    /// True for instructions that have no result register (pure control /
    /// bookkeeping); these are skipped by the register allocator.
    pub fn produces_value(self) -> bool {
        !matches!(
            self,
            IrOp::Store | IrOp::Loop | IrOp::LoopStart | IrOp::Jump | IrOp::Noop | IrOp::Return
        ) && !self.is_guard()
    }
}

impl fmt::Display for IrOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A tagged IR operand (`SPEC_FULL.md` section 3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// Reference to an earlier IR position.
    IrRef(usize),
    /// Absolute index into the interpreter's value stack.
    StackRef(usize),
    /// Target IR index, used by `LOOP`/`JUMP` to name `LOOP_START`.
    JumpOffset(usize),
    /// Index into the owning trace's snapshot vector.
    ExitNumber(usize),
    LiteralFloat(f64),
    LiteralBool(bool),
    LiteralObject(*mut ()),
    LiteralNil,
    Unused,
}

impl Operand {
    pub fn as_ir_ref(self) -> Option<usize> {
        match self {
            Operand::IrRef(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_stack_ref(self) -> Option<usize> {
        match self {
            Operand::StackRef(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_literal(self) -> bool {
        matches!(
            self,
            Operand::LiteralFloat(_)
                | Operand::LiteralBool(_)
                | Operand::LiteralObject(_)
                | Operand::LiteralNil
        )
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::IrRef(r) => write!(f, "%{r}"),
            Operand::StackRef(s) => write!(f, "stack[{s}]"),
            Operand::JumpOffset(t) => write!(f, "->{t}"),
            Operand::ExitNumber(n) => write!(f, "exit#{n}"),
            Operand::LiteralFloat(v) => write!(f, "'{v}'"),
            Operand::LiteralBool(v) => write!(f, "'{v}'"),
            Operand::LiteralObject(p) => write!(f, "'{p:p}'"),
            Operand::LiteralNil => write!(f, "'nil'"),
            Operand::Unused => write!(f, "---"),
        }
    }
}

/// One SSA instruction: `(opcode, result type, operands)`.
///
/// Invariant (SPEC_FULL.md section 8, property 2): each position in an
/// `IrBuffer` is written exactly once — by construction, since the only
/// way to add an instruction is [`IrBuffer::emit`], which always appends.
#[derive(Debug, Clone, Copy)]
pub struct IrInstr {
    pub op: IrOp,
    pub ty: ValueType,
    pub operands: [Operand; 2],
}

impl IrInstr {
    pub fn new(op: IrOp, ty: ValueType, operands: [Operand; 2]) -> Self {
        IrInstr { op, ty, operands }
    }

    pub fn operand(&self, i: usize) -> Operand {
        self.operands[i]
    }

    /// IR refs this instruction directly consumes (used by live-range
    /// computation and by loop-invariant detection).
    pub fn ir_ref_operands(&self) -> impl Iterator<Item = usize> + '_ {
        self.operands.iter().filter_map(|op| op.as_ir_ref())
    }
}

impl fmt::Display for IrInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<10} {:<8}", self.op, self.ty)?;
        for operand in &self.operands {
            if matches!(operand, Operand::Unused) {
                break;
            }
            write!(f, " {operand}")?;
        }
        Ok(())
    }
}

/// The append-only SSA instruction sequence owned by a [`crate::jit::trace::Trace`].
#[derive(Debug, Clone, Default)]
pub struct IrBuffer {
    instrs: Vec<IrInstr>,
}

impl IrBuffer {
    pub fn new() -> Self {
        IrBuffer { instrs: Vec::new() }
    }

    /// Append an instruction, returning its IR reference (its own index).
    pub fn emit(&mut self, op: IrOp, ty: ValueType, operands: [Operand; 2]) -> usize {
        let ir_ref = self.instrs.len();
        self.instrs.push(IrInstr::new(op, ty, operands));
        ir_ref
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn get(&self, ir_ref: usize) -> &IrInstr {
        &self.instrs[ir_ref]
    }

    pub fn get_mut(&mut self, ir_ref: usize) -> &mut IrInstr {
        &mut self.instrs[ir_ref]
    }

    pub fn set_operand(&mut self, ir_ref: usize, i: usize, operand: Operand) {
        self.instrs[ir_ref].operands[i] = operand;
    }

    /// Replace an instruction's opcode in place, keeping its position (and
    /// so every existing reference to it) stable. Used by the optimiser to
    /// neutralise the original trailing `LOOP` once peeling has replaced
    /// it with a fresh one targeting `LOOP_START`.
    pub fn set_op(&mut self, ir_ref: usize, op: IrOp) {
        self.instrs[ir_ref].op = op;
    }

    pub fn type_of(&self, ir_ref: usize) -> ValueType {
        self.instrs[ir_ref].ty
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &IrInstr)> {
        self.instrs.iter().enumerate()
    }

    pub fn as_slice(&self) -> &[IrInstr] {
        &self.instrs
    }
}

impl fmt::Display for IrBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, instr) in self.iter() {
            writeln!(f, "{i:04} {instr}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_returns_dense_indices() {
        let mut buf = IrBuffer::new();
        let r0 = buf.emit(IrOp::Literal, ValueType::Float, [Operand::LiteralFloat(1.0), Operand::Unused]);
        let r1 = buf.emit(
            IrOp::Add,
            ValueType::Float,
            [Operand::IrRef(r0), Operand::IrRef(r0)],
        );
        assert_eq!(r0, 0);
        assert_eq!(r1, 1);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn display_formats_one_line_per_instruction() {
        let mut buf = IrBuffer::new();
        buf.emit(IrOp::Literal, ValueType::Float, [Operand::LiteralFloat(2.0), Operand::Unused]);
        let rendered = format!("{buf}");
        assert_eq!(rendered.lines().count(), 1);
        assert!(rendered.contains("LITERAL"));
    }
}
