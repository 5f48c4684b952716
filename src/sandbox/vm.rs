//! Bytecode interpreter for one invocation of a compiled unit.
//!
//! The interpreter keeps its call frames on the heap, so deep recursion in the
//! submitted program never recurses on the host stack. It polls the
//! interrupt flag every [`INTERRUPT_POLL_MASK`]` + 1` instructions and unwinds
//! with [`FaultKind::Interrupted`] once it is raised.
//!
//! Arrays live in a [`Heap`] owned by the interpreter and refer to each other
//! through handles. Nesting and cycles are released in one flat drop when the
//! interpreter goes away.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::capture::Capture;
use crate::compiled::{Builtin, CompiledUnit, EntryHandle, FuncId, Instr};
use crate::value::Value;

const INTERRUPT_POLL_MASK: u64 = 0x3ff;

/// Nesting depth past which values render as `[...]`
const MAX_RENDER_DEPTH: usize = 32;

/// Approximate bytes charged per array slot
const SLOT_BYTES: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArrayRef(usize);

#[derive(Debug, Clone)]
enum RtValue {
    Nil,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    Array(ArrayRef),
}

impl RtValue {
    fn type_name(&self) -> &'static str {
        match self {
            RtValue::Nil => "nil",
            RtValue::Bool(_) => "bool",
            RtValue::Int(_) => "int",
            RtValue::Str(_) => "string",
            RtValue::Array(_) => "array",
        }
    }
}

/// Every array allocated by one execution
#[derive(Debug, Default)]
struct Heap {
    arrays: Vec<Vec<RtValue>>,
}

impl Heap {
    fn alloc(&mut self, items: Vec<RtValue>) -> ArrayRef {
        self.arrays.push(items);
        ArrayRef(self.arrays.len() - 1)
    }

    fn get(&self, array: ArrayRef) -> &[RtValue] {
        &self.arrays[array.0]
    }

    fn get_mut(&mut self, array: ArrayRef) -> &mut Vec<RtValue> {
        &mut self.arrays[array.0]
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RenderStop {
    /// The byte limit was reached; the text so far is kept
    Full,
    Interrupted,
}

/// Writes values as text, at most `limit` bytes
///
/// Shared subarrays are walked again on every occurrence, so the limit is what
/// bounds the work.
struct Renderer<'h> {
    heap: &'h Heap,
    interrupt: &'h AtomicBool,
    out: String,
    limit: usize,
    steps: u64,
}

impl<'h> Renderer<'h> {
    fn new(heap: &'h Heap, interrupt: &'h AtomicBool, limit: usize) -> Self {
        Self {
            heap,
            interrupt,
            out: String::new(),
            limit,
            steps: 0,
        }
    }

    fn value(&mut self, value: &RtValue, depth: usize, nested: bool) -> Result<(), RenderStop> {
        self.steps = self.steps.wrapping_add(1);
        if self.steps & INTERRUPT_POLL_MASK == 0 && self.interrupt.load(Ordering::Acquire) {
            return Err(RenderStop::Interrupted);
        }

        match value {
            RtValue::Nil => self.text("nil"),
            RtValue::Bool(b) => self.text(if *b { "true" } else { "false" }),
            RtValue::Int(i) => self.text(&i.to_string()),
            RtValue::Str(s) if nested => self.text(&format!("{s:?}")),
            RtValue::Str(s) => self.text(s),
            RtValue::Array(_) if depth >= MAX_RENDER_DEPTH => self.text("[...]"),
            RtValue::Array(array) => {
                let heap = self.heap;
                self.text("[")?;
                for (i, item) in heap.get(*array).iter().enumerate() {
                    if i > 0 {
                        self.text(", ")?;
                    }
                    self.value(item, depth + 1, true)?;
                }
                self.text("]")
            }
        }
    }

    fn text(&mut self, s: &str) -> Result<(), RenderStop> {
        let room = self.limit.saturating_sub(self.out.len());
        if s.len() <= room {
            self.out.push_str(s);
            return Ok(());
        }
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.out.push_str(&s[..cut]);
        Err(RenderStop::Full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    TypeError,
    ArithmeticError,
    IndexError,
    Exception,
    AssertionError,
    StackOverflow,
    OutOfMemory,
    NoSuchFunction,
    Interrupted,
    InternalError,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::TypeError => "TypeError",
            FaultKind::ArithmeticError => "ArithmeticError",
            FaultKind::IndexError => "IndexError",
            FaultKind::Exception => "Exception",
            FaultKind::AssertionError => "AssertionError",
            FaultKind::StackOverflow => "StackOverflow",
            FaultKind::OutOfMemory => "OutOfMemory",
            FaultKind::NoSuchFunction => "NoSuchFunction",
            FaultKind::Interrupted => "Interrupted",
            FaultKind::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// A fault raised by the submitted program, with its call stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    pub trace: Vec<String>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for frame in &self.trace {
            write!(f, "\n    at {frame}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct VmLimits {
    pub max_call_depth: usize,
    /// Cumulative allocation budget in bytes
    pub memory_ceiling: Option<u64>,
}

struct Frame {
    func: FuncId,
    pc: usize,
    base: usize,
}

pub struct Vm<'a> {
    unit: &'a CompiledUnit,
    stdout: &'a Capture,
    stderr: &'a Capture,
    interrupt: &'a AtomicBool,
    limits: VmLimits,
    allocated: u64,
    steps: u64,
    heap: Heap,
    stack: Vec<RtValue>,
    frames: Vec<Frame>,
}

type VmResult<T> = Result<T, Fault>;

impl<'a> Vm<'a> {
    pub fn new(
        unit: &'a CompiledUnit,
        stdout: &'a Capture,
        stderr: &'a Capture,
        interrupt: &'a AtomicBool,
        limits: VmLimits,
    ) -> Self {
        Self {
            unit,
            stdout,
            stderr,
            interrupt,
            limits,
            allocated: 0,
            steps: 0,
            heap: Heap::default(),
            stack: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Runs `entry` to completion with the given arguments
    pub fn invoke(&mut self, entry: EntryHandle, arguments: &[Value]) -> VmResult<Value> {
        if arguments.len() != entry.arity as usize {
            return Err(Fault::new(
                FaultKind::NoSuchFunction,
                format!(
                    "entry point expects {} argument(s), got {}",
                    entry.arity,
                    arguments.len()
                ),
            ));
        }
        for argument in arguments {
            let value = self.import(argument)?;
            self.stack.push(value);
        }
        self.enter(entry.func, arguments.len())?;
        let result = self.run()?;
        self.export(&result, 0)
    }

    /// Converts a result into an owned value, charging what it copies
    fn export(&mut self, value: &RtValue, depth: usize) -> VmResult<Value> {
        self.tick()?;
        Ok(match value {
            RtValue::Nil => Value::Nil,
            RtValue::Bool(b) => Value::Bool(*b),
            RtValue::Int(i) => Value::Int(*i),
            RtValue::Str(s) => {
                self.charge(s.len() as u64)?;
                Value::Str(s.to_string())
            }
            RtValue::Array(_) if depth >= MAX_RENDER_DEPTH => Value::Str("[...]".to_string()),
            RtValue::Array(array) => {
                let len = self.heap.get(*array).len() as u64;
                self.charge(SLOT_BYTES * (len + 1))?;
                let items = self.heap.get(*array).to_vec();
                Value::Array(
                    items
                        .iter()
                        .map(|item| self.export(item, depth + 1))
                        .collect::<VmResult<_>>()?,
                )
            }
        })
    }

    fn import(&mut self, value: &Value) -> VmResult<RtValue> {
        Ok(match value {
            Value::Nil => RtValue::Nil,
            Value::Bool(b) => RtValue::Bool(*b),
            Value::Int(i) => RtValue::Int(*i),
            Value::Str(s) => self.string(s.clone())?,
            Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.import(item))
                    .collect::<VmResult<Vec<_>>>()?;
                self.array(items)?
            }
        })
    }

    fn fault(&self, kind: FaultKind, message: impl Into<String>) -> Fault {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let function = self.unit.function(frame.func);
                let line = function.line_at(frame.pc.saturating_sub(1));
                format!("{} ({}:{line})", function.name, function.unit)
            })
            .collect();
        Fault {
            kind,
            message: message.into(),
            trace,
        }
    }

    fn interrupted(&self) -> Fault {
        self.fault(FaultKind::Interrupted, "execution interrupted")
    }

    fn tick(&mut self) -> VmResult<()> {
        self.steps = self.steps.wrapping_add(1);
        if self.steps & INTERRUPT_POLL_MASK == 0 && self.interrupt.load(Ordering::Acquire) {
            return Err(self.interrupted());
        }
        Ok(())
    }

    fn out_of_memory(&self, ceiling: u64) -> Fault {
        self.fault(
            FaultKind::OutOfMemory,
            format!("allocation exceeds the memory ceiling of {ceiling} bytes"),
        )
    }

    fn charge(&mut self, bytes: u64) -> VmResult<()> {
        self.allocated = self.allocated.saturating_add(bytes);
        match self.limits.memory_ceiling {
            Some(ceiling) if self.allocated > ceiling => Err(self.out_of_memory(ceiling)),
            _ => Ok(()),
        }
    }

    /// Renders `values` joined by `separator`, stopping after `limit` bytes
    fn render(
        &self,
        values: &[RtValue],
        separator: &str,
        limit: usize,
    ) -> (String, Result<(), RenderStop>) {
        let mut renderer = Renderer::new(&self.heap, self.interrupt, limit);
        let status = values.iter().enumerate().try_for_each(|(i, value)| {
            if i > 0 {
                renderer.text(separator)?;
            }
            renderer.value(value, 0, false)
        });
        (renderer.out, status)
    }

    /// Renders `values` into a string that fits in what is left of the memory
    /// ceiling
    fn display(&self, values: &[RtValue], separator: &str) -> VmResult<String> {
        let room = match self.limits.memory_ceiling {
            Some(ceiling) => {
                usize::try_from(ceiling.saturating_sub(self.allocated)).unwrap_or(usize::MAX)
            }
            None => usize::MAX,
        };
        match self.render(values, separator, room) {
            (text, Ok(())) => Ok(text),
            (_, Err(RenderStop::Interrupted)) => Err(self.interrupted()),
            (_, Err(RenderStop::Full)) => {
                let ceiling = self.limits.memory_ceiling.unwrap_or(u64::MAX);
                Err(self.out_of_memory(ceiling))
            }
        }
    }

    fn string(&mut self, s: String) -> VmResult<RtValue> {
        self.charge(s.len() as u64)?;
        Ok(RtValue::Str(s.into()))
    }

    fn array(&mut self, items: Vec<RtValue>) -> VmResult<RtValue> {
        self.charge(SLOT_BYTES * (items.len() as u64 + 1))?;
        Ok(RtValue::Array(self.heap.alloc(items)))
    }

    fn enter(&mut self, func: FuncId, argc: usize) -> VmResult<()> {
        if self.frames.len() >= self.limits.max_call_depth {
            return Err(self.fault(
                FaultKind::StackOverflow,
                format!("call depth exceeds {}", self.limits.max_call_depth),
            ));
        }
        let function = self.unit.function(func);
        let base = self.stack.len() - argc;
        for _ in argc..function.locals as usize {
            self.stack.push(RtValue::Nil);
        }
        self.frames.push(Frame { func, pc: 0, base });
        Ok(())
    }

    fn pop(&mut self) -> VmResult<RtValue> {
        self.stack
            .pop()
            .ok_or_else(|| self.fault(FaultKind::InternalError, "operand stack underflow"))
    }

    fn peek_bool(&self) -> VmResult<bool> {
        match self.stack.last() {
            Some(RtValue::Bool(b)) => Ok(*b),
            Some(other) => Err(self.fault(
                FaultKind::TypeError,
                format!("expected bool, found {}", other.type_name()),
            )),
            None => Err(self.fault(FaultKind::InternalError, "operand stack underflow")),
        }
    }

    fn pop_bool(&mut self) -> VmResult<bool> {
        let b = self.peek_bool()?;
        self.stack.pop();
        Ok(b)
    }

    fn run(&mut self) -> VmResult<RtValue> {
        let unit = self.unit;
        loop {
            self.tick()?;

            let Some(frame) = self.frames.last_mut() else {
                return Err(Fault::new(FaultKind::InternalError, "no active frame"));
            };
            let function = unit.function(frame.func);
            let Some(&instr) = function.code.get(frame.pc) else {
                return Err(Fault::new(
                    FaultKind::InternalError,
                    format!("program counter out of bounds in '{}'", function.name),
                ));
            };
            frame.pc += 1;
            let base = frame.base;

            match instr {
                Instr::Int(v) => self.stack.push(RtValue::Int(v)),
                Instr::Str(idx) => {
                    let s = unit.string(idx).to_string();
                    let value = self.string(s)?;
                    self.stack.push(value);
                }
                Instr::Nil => self.stack.push(RtValue::Nil),
                Instr::True => self.stack.push(RtValue::Bool(true)),
                Instr::False => self.stack.push(RtValue::Bool(false)),
                Instr::Load(slot) => {
                    let value = self.stack[base + slot as usize].clone();
                    self.stack.push(value);
                }
                Instr::Store(slot) => {
                    let value = self.pop()?;
                    self.stack[base + slot as usize] = value;
                }
                Instr::Pop => {
                    self.pop()?;
                }
                Instr::Add => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let value = self.add(lhs, rhs)?;
                    self.stack.push(value);
                }
                Instr::Sub | Instr::Mul | Instr::Div | Instr::Rem => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let value = self.arithmetic(instr, lhs, rhs)?;
                    self.stack.push(value);
                }
                Instr::Neg => match self.pop()? {
                    RtValue::Int(v) => {
                        let negated = v.checked_neg().ok_or_else(|| {
                            self.fault(FaultKind::ArithmeticError, "integer overflow")
                        })?;
                        self.stack.push(RtValue::Int(negated));
                    }
                    other => {
                        return Err(self.fault(
                            FaultKind::TypeError,
                            format!("cannot negate {}", other.type_name()),
                        ));
                    }
                },
                Instr::Not => {
                    let b = self.pop_bool()?;
                    self.stack.push(RtValue::Bool(!b));
                }
                Instr::Eq | Instr::Ne => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let equal = equals(&lhs, &rhs);
                    self.stack
                        .push(RtValue::Bool(if instr == Instr::Eq { equal } else { !equal }));
                }
                Instr::Lt | Instr::Le | Instr::Gt | Instr::Ge => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let ordering = match (&lhs, &rhs) {
                        (RtValue::Int(a), RtValue::Int(b)) => a.cmp(b),
                        (RtValue::Str(a), RtValue::Str(b)) => a.cmp(b),
                        _ => {
                            return Err(self.fault(
                                FaultKind::TypeError,
                                format!(
                                    "cannot compare {} with {}",
                                    lhs.type_name(),
                                    rhs.type_name()
                                ),
                            ));
                        }
                    };
                    let result = match instr {
                        Instr::Lt => ordering.is_lt(),
                        Instr::Le => ordering.is_le(),
                        Instr::Gt => ordering.is_gt(),
                        _ => ordering.is_ge(),
                    };
                    self.stack.push(RtValue::Bool(result));
                }
                Instr::ExpectBool => {
                    self.peek_bool()?;
                }
                Instr::Jump(target) => self.jump(target),
                Instr::JumpIfFalse(target) => {
                    if !self.pop_bool()? {
                        self.jump(target);
                    }
                }
                Instr::JumpIfFalseKeep(target) => {
                    if self.peek_bool()? {
                        self.stack.pop();
                    } else {
                        self.jump(target);
                    }
                }
                Instr::JumpIfTrueKeep(target) => {
                    if self.peek_bool()? {
                        self.jump(target);
                    } else {
                        self.stack.pop();
                    }
                }
                Instr::Call { func, argc } => self.enter(func, argc as usize)?,
                Instr::CallBuiltin { builtin, argc } => {
                    let args = self.stack.split_off(self.stack.len() - argc as usize);
                    let value = self.builtin(builtin, args)?;
                    self.stack.push(value);
                }
                Instr::Return => {
                    let result = self.pop()?;
                    self.stack.truncate(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.stack.push(result);
                }
                Instr::MakeArray(count) => {
                    let items = self.stack.split_off(self.stack.len() - count as usize);
                    let value = self.array(items)?;
                    self.stack.push(value);
                }
                Instr::Index => {
                    let index = self.pop()?;
                    let target = self.pop()?;
                    let value = self.index(&target, &index)?;
                    self.stack.push(value);
                }
                Instr::StoreIndex => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let target = self.pop()?;
                    self.store_index(&target, &index, value)?;
                }
            }
        }
    }

    fn jump(&mut self, target: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = target as usize;
        }
    }

    fn add(&mut self, lhs: RtValue, rhs: RtValue) -> VmResult<RtValue> {
        match (&lhs, &rhs) {
            (RtValue::Int(a), RtValue::Int(b)) => a
                .checked_add(*b)
                .map(RtValue::Int)
                .ok_or_else(|| self.fault(FaultKind::ArithmeticError, "integer overflow")),
            (RtValue::Str(_), _) | (_, RtValue::Str(_)) => {
                let joined = self.display(&[lhs.clone(), rhs.clone()], "")?;
                self.string(joined)
            }
            _ => Err(self.fault(
                FaultKind::TypeError,
                format!("cannot add {} and {}", lhs.type_name(), rhs.type_name()),
            )),
        }
    }

    fn arithmetic(&self, instr: Instr, lhs: RtValue, rhs: RtValue) -> VmResult<RtValue> {
        let (RtValue::Int(a), RtValue::Int(b)) = (&lhs, &rhs) else {
            return Err(self.fault(
                FaultKind::TypeError,
                format!(
                    "arithmetic on {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                ),
            ));
        };
        let (a, b) = (*a, *b);
        if matches!(instr, Instr::Div | Instr::Rem) && b == 0 {
            return Err(self.fault(FaultKind::ArithmeticError, "division by zero"));
        }
        let result = match instr {
            Instr::Sub => a.checked_sub(b),
            Instr::Mul => a.checked_mul(b),
            Instr::Div => a.checked_div(b),
            _ => a.checked_rem(b),
        };
        result
            .map(RtValue::Int)
            .ok_or_else(|| self.fault(FaultKind::ArithmeticError, "integer overflow"))
    }

    fn checked_index(&self, index: &RtValue, len: usize) -> VmResult<usize> {
        let RtValue::Int(i) = index else {
            return Err(self.fault(
                FaultKind::TypeError,
                format!("index must be int, found {}", index.type_name()),
            ));
        };
        usize::try_from(*i)
            .ok()
            .filter(|&i| i < len)
            .ok_or_else(|| {
                self.fault(
                    FaultKind::IndexError,
                    format!("index {i} out of bounds for length {len}"),
                )
            })
    }

    fn index(&mut self, target: &RtValue, index: &RtValue) -> VmResult<RtValue> {
        match target {
            RtValue::Array(array) => {
                let len = self.heap.get(*array).len();
                let i = self.checked_index(index, len)?;
                Ok(self.heap.get(*array)[i].clone())
            }
            RtValue::Str(s) => {
                let len = s.chars().count();
                let i = self.checked_index(index, len)?;
                let c = s.chars().nth(i).map(String::from).unwrap_or_default();
                self.string(c)
            }
            other => Err(self.fault(
                FaultKind::TypeError,
                format!("cannot index {}", other.type_name()),
            )),
        }
    }

    fn store_index(&mut self, target: &RtValue, index: &RtValue, value: RtValue) -> VmResult<()> {
        let RtValue::Array(array) = target else {
            return Err(self.fault(
                FaultKind::TypeError,
                format!("cannot assign into {}", target.type_name()),
            ));
        };
        let len = self.heap.get(*array).len();
        let i = self.checked_index(index, len)?;
        self.heap.get_mut(*array)[i] = value;
        Ok(())
    }

    fn builtin(&mut self, builtin: Builtin, args: Vec<RtValue>) -> VmResult<RtValue> {
        match builtin {
            Builtin::Print | Builtin::Println | Builtin::Eprint | Builtin::Eprintln => {
                let stream = match builtin {
                    Builtin::Print | Builtin::Println => self.stdout,
                    _ => self.stderr,
                };
                // one line never holds more than the stream keeps
                let (mut line, status) = self.render(&args, " ", stream.limit());
                if status == Err(RenderStop::Interrupted) {
                    return Err(self.interrupted());
                }
                if matches!(builtin, Builtin::Println | Builtin::Eprintln) {
                    line.push('\n');
                }
                stream.write(&line);
                Ok(RtValue::Nil)
            }
            Builtin::Str => {
                let text = self.display(&args[..1], "")?;
                self.string(text)
            }
            Builtin::Len => match &args[0] {
                RtValue::Str(s) => Ok(RtValue::Int(s.chars().count() as i64)),
                RtValue::Array(array) => Ok(RtValue::Int(self.heap.get(*array).len() as i64)),
                other => Err(self.fault(
                    FaultKind::TypeError,
                    format!("len() of {}", other.type_name()),
                )),
            },
            Builtin::Push => {
                let RtValue::Array(array) = &args[0] else {
                    return Err(self.fault(
                        FaultKind::TypeError,
                        format!("push() onto {}", args[0].type_name()),
                    ));
                };
                self.charge(SLOT_BYTES)?;
                self.heap.get_mut(*array).push(args[1].clone());
                Ok(RtValue::Nil)
            }
            Builtin::Pop => {
                let RtValue::Array(array) = &args[0] else {
                    return Err(self.fault(
                        FaultKind::TypeError,
                        format!("pop() from {}", args[0].type_name()),
                    ));
                };
                let popped = self.heap.get_mut(*array).pop();
                popped.ok_or_else(|| self.fault(FaultKind::IndexError, "pop() from empty array"))
            }
            Builtin::Abs => match &args[0] {
                RtValue::Int(v) => v
                    .checked_abs()
                    .map(RtValue::Int)
                    .ok_or_else(|| self.fault(FaultKind::ArithmeticError, "integer overflow")),
                other => Err(self.fault(
                    FaultKind::TypeError,
                    format!("abs() of {}", other.type_name()),
                )),
            },
            Builtin::Min | Builtin::Max => match (&args[0], &args[1]) {
                (RtValue::Int(a), RtValue::Int(b)) => Ok(RtValue::Int(if builtin == Builtin::Min {
                    *a.min(b)
                } else {
                    *a.max(b)
                })),
                (a, b) => Err(self.fault(
                    FaultKind::TypeError,
                    format!("{builtin}() of {} and {}", a.type_name(), b.type_name()),
                )),
            },
            Builtin::Throw => {
                let message = self.display(&args[..1], "")?;
                Err(self.fault(FaultKind::Exception, message))
            }
            Builtin::Assert => {
                let RtValue::Bool(holds) = args[0] else {
                    return Err(self.fault(
                        FaultKind::TypeError,
                        format!("assert() of {}", args[0].type_name()),
                    ));
                };
                if holds {
                    return Ok(RtValue::Nil);
                }
                let message = match args.get(1) {
                    Some(message) => self.display(std::slice::from_ref(message), "")?,
                    None => "assertion failed".to_string(),
                };
                Err(self.fault(FaultKind::AssertionError, message))
            }
        }
    }
}

fn equals(lhs: &RtValue, rhs: &RtValue) -> bool {
    match (lhs, rhs) {
        (RtValue::Nil, RtValue::Nil) => true,
        (RtValue::Bool(a), RtValue::Bool(b)) => a == b,
        (RtValue::Int(a), RtValue::Int(b)) => a == b,
        (RtValue::Str(a), RtValue::Str(b)) => a == b,
        (RtValue::Array(a), RtValue::Array(b)) => a == b,
        _ => false,
    }
}
