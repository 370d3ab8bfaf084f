//! The fetch-decode-execute loop, instrumented with the two JIT hook
//! points named in `SPEC_FULL.md` section 4: a back-edge count/record
//! check on every `LOOP`, and a compiled-trace entry whenever that check
//! says one is installed. Everything else here is plain tree-free
//! bytecode interpretation — there is no separate compiler or parser in
//! this repository; test programs build a [`CodeObject`] directly with
//! its `emit_*` helpers, exactly as the JIT's own unit tests do.

use std::rc::Rc;

use log::trace as log_trace;

use crate::bytecode::{CodeObject, Ip, Opcode};
use crate::config::JitConfig;
use crate::jit::{Jit, LoopHeadAction};
use crate::value::{Value, ValueType};
use crate::vm::frame::ValueStack;

/// Runtime errors the harness itself can raise. Unrelated to `JitError`
/// (`SPEC_FULL.md` section 7): these describe faults in the interpreted
/// program, never in the JIT pipeline.
#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("invalid opcode byte 0x{0:02x} at ip {1:#06x}")]
    InvalidOpcode(u8, Ip),

    #[error("type error: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: ValueType,
    },

    #[error("call to undefined native function index {0}")]
    UndefinedNative(u8),
}

/// One registered native function, invoked by `CALL`. The harness only
/// needs `CALL` to exist as an opcode the recorder rejects (S4); its
/// runtime behaviour is deliberately trivial.
type NativeFn = fn(args: &[Value]) -> Value;

fn noop_native(_args: &[Value]) -> Value {
    Value::nil()
}

pub struct Interpreter {
    code: Rc<CodeObject>,
    stack: ValueStack,
    output: Vec<String>,
    natives: Vec<NativeFn>,
    jit: Option<Jit>,
}

impl Interpreter {
    /// JIT enabled with default thresholds (`SPEC_FULL.md` section 9).
    pub fn new(code: Rc<CodeObject>) -> Self {
        Self::with_config(code, Some(JitConfig::default()))
    }

    /// JIT forced off: pure interpretation, used as the other half of the
    /// semantic-equivalence property test (`SPEC_FULL.md` section 8).
    pub fn without_jit(code: Rc<CodeObject>) -> Self {
        Self::with_config(code, None)
    }

    pub fn with_config(code: Rc<CodeObject>, cfg: Option<JitConfig>) -> Self {
        Interpreter {
            code,
            stack: ValueStack::new(),
            output: Vec::new(),
            natives: vec![noop_native],
            jit: cfg.map(Jit::new),
        }
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn installed_trace_count(&self) -> usize {
        self.jit.as_ref().map_or(0, Jit::installed_len)
    }

    pub fn blacklisted_count(&self) -> usize {
        self.jit.as_ref().map_or(0, Jit::blacklisted_len)
    }

    /// Run the program to completion (`RETURN` or falling off the end of
    /// `code`).
    pub fn run(&mut self) -> Result<(), InterpretError> {
        let mut ip: Ip = 0;

        while ip < self.code.len() {
            if let Some(jit) = &mut self.jit {
                if jit.is_recording() {
                    jit.record_instruction(&self.code, &self.stack, ip);
                }
            }

            let byte = self.code.byte_at(ip);
            let op = Opcode::from_u8(byte).ok_or(InterpretError::InvalidOpcode(byte, ip))?;
            log_trace!("ip {:#06x}: {}", ip, op.name());

            match op {
                Opcode::Add => self.binary_arith(ip, |a, b| a + b)?,
                Opcode::Subtract => self.binary_arith(ip, |a, b| a - b)?,
                Opcode::Multiply => self.binary_arith(ip, |a, b| a * b)?,
                Opcode::Divide => self.binary_arith(ip, |a, b| a / b)?,
                Opcode::Less => self.binary_compare(ip, |a, b| a < b)?,
                Opcode::Equal => self.binary_compare(ip, |a, b| a == b)?,

                Opcode::GetLocal => {
                    let slot = self.code.byte_at(ip + 1) as usize;
                    let value = self.stack.slot(slot).clone();
                    self.stack.push(value);
                }
                Opcode::SetLocal => {
                    let slot = self.code.byte_at(ip + 1) as usize;
                    let value = self.stack.pop();
                    *self.stack.slot_mut(slot) = value;
                }
                Opcode::LoadConstant => {
                    let idx = self.code.byte_at(ip + 1) as usize;
                    self.stack.push(self.code.constants[idx].clone());
                }
                Opcode::Pop => {
                    self.stack.pop();
                }

                Opcode::ConditionalJump => {
                    let offset = self.code.u16_at(ip + 1);
                    let taken = self.stack.peek(0).is_truthy();
                    ip = if taken {
                        self.code.ip_after(ip)
                    } else {
                        self.code.ip_after(ip) + offset as usize
                    };
                    continue;
                }
                Opcode::Jump => {
                    let offset = self.code.u16_at(ip + 1);
                    ip = self.code.ip_after(ip) + offset as usize;
                    continue;
                }
                Opcode::Loop => {
                    let offset = self.code.u16_at(ip + 1);
                    let target = self.code.ip_after(ip) - offset as usize;
                    ip = self.take_back_edge(target);
                    continue;
                }

                Opcode::Print => {
                    let value = self.stack.pop();
                    self.output.push(value.to_string());
                }
                Opcode::Call => {
                    let argc = self.code.byte_at(ip + 1) as usize;
                    let native_index = argc; // the harness's one CALL form: operand selects the native
                    let native = *self
                        .natives
                        .get(native_index)
                        .ok_or(InterpretError::UndefinedNative(native_index as u8))?;
                    let result = native(&[]);
                    self.stack.push(result);
                }
                Opcode::Return => return Ok(()),
            }

            ip = self.code.ip_after(ip);
        }

        Ok(())
    }

    /// A back-edge was just taken to `target`: ask the JIT whether to
    /// keep interpreting from there or hand off to a compiled trace
    /// (`SPEC_FULL.md` section 4.1/4.6). With the JIT disabled this is
    /// just the jump.
    fn take_back_edge(&mut self, target: Ip) -> Ip {
        let Some(jit) = &mut self.jit else {
            return target;
        };

        match jit.handle_basic_block_head(&self.code, target, self.stack.len()) {
            LoopHeadAction::Interpret => target,
            LoopHeadAction::Enter => {
                let outcome = jit
                    .enter_trace(target, &mut self.stack)
                    .expect("LoopHeadAction::Enter implies a trace is installed at target");
                outcome.next_ip
            }
        }
    }

    fn binary_arith(&mut self, ip: Ip, f: impl Fn(f64, f64) -> f64) -> Result<(), InterpretError> {
        let b = self.pop_float(ip)?;
        let a = self.pop_float(ip)?;
        self.stack.push(Value::float(f(a, b)));
        Ok(())
    }

    fn binary_compare(&mut self, ip: Ip, f: impl Fn(f64, f64) -> bool) -> Result<(), InterpretError> {
        let b = self.pop_float(ip)?;
        let a = self.pop_float(ip)?;
        self.stack.push(Value::boolean(f(a, b)));
        Ok(())
    }

    fn pop_float(&mut self, _ip: Ip) -> Result<f64, InterpretError> {
        let value = self.stack.pop();
        value.as_float().ok_or(InterpretError::TypeMismatch {
            expected: "float",
            actual: value.tag(),
        })
    }
}
