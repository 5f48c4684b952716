//! In-memory artifact produced by one compilation pass.
//!
//! A [`CompiledUnit`] owns its [`SymbolSpace`]: the function table, the string
//! pool and the bytecode of every function from every source unit of one
//! submission. Nothing in here is global. The space is tagged with the owning
//! session and dropped with the last reference to the unit.

use std::collections::HashMap;
use std::fmt;

use crate::compiler::Diagnostic;
use crate::session::SessionId;

/// Index of a function inside its symbol space
pub type FuncId = u32;

/// Stack machine instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Int(i64),
    Str(u32),
    Nil,
    True,
    False,
    Load(u16),
    Store(u16),
    Pop,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Fails unless the top of the stack is a bool
    ExpectBool,
    Jump(u32),
    JumpIfFalse(u32),
    /// Short-circuit jumps: keep the operand when jumping, pop it otherwise
    JumpIfFalseKeep(u32),
    JumpIfTrueKeep(u32),
    Call { func: FuncId, argc: u8 },
    CallBuiltin { builtin: Builtin, argc: u8 },
    Return,
    MakeArray(u32),
    Index,
    StoreIndex,
}

/// Functions provided by the runtime, resolved at compile time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Print,
    Println,
    Eprint,
    Eprintln,
    Str,
    Len,
    Push,
    Pop,
    Abs,
    Min,
    Max,
    Throw,
    Assert,
}

impl Builtin {
    pub const ALL: [Builtin; 13] = [
        Builtin::Print,
        Builtin::Println,
        Builtin::Eprint,
        Builtin::Eprintln,
        Builtin::Str,
        Builtin::Len,
        Builtin::Push,
        Builtin::Pop,
        Builtin::Abs,
        Builtin::Min,
        Builtin::Max,
        Builtin::Throw,
        Builtin::Assert,
    ];

    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Println => "println",
            Builtin::Eprint => "eprint",
            Builtin::Eprintln => "eprintln",
            Builtin::Str => "str",
            Builtin::Len => "len",
            Builtin::Push => "push",
            Builtin::Pop => "pop",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Throw => "throw",
            Builtin::Assert => "assert",
        }
    }

    /// Accepted argument counts, inclusive
    pub fn arity(self) -> (usize, usize) {
        match self {
            Builtin::Print | Builtin::Println | Builtin::Eprint | Builtin::Eprintln => {
                (0, u8::MAX as usize)
            }
            Builtin::Str | Builtin::Len | Builtin::Pop | Builtin::Abs | Builtin::Throw => (1, 1),
            Builtin::Push | Builtin::Min | Builtin::Max => (2, 2),
            Builtin::Assert => (1, 2),
        }
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    /// Name of the source unit defining this function
    pub unit: String,
    pub arity: u16,
    /// Local slots including parameters
    pub locals: u16,
    pub code: Vec<Instr>,
    /// Source line of each instruction
    pub lines: Vec<u32>,
}

impl Function {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(0)
    }
}

/// Symbol table and constant pool of a single compilation
#[derive(Debug)]
pub struct SymbolSpace {
    owner: SessionId,
    functions: Vec<Function>,
    index: HashMap<String, FuncId>,
    strings: Vec<Box<str>>,
}

impl SymbolSpace {
    pub(crate) fn new(
        owner: SessionId,
        functions: Vec<Function>,
        index: HashMap<String, FuncId>,
        strings: Vec<Box<str>>,
    ) -> Self {
        Self {
            owner,
            functions,
            index,
            strings,
        }
    }
}

impl Drop for SymbolSpace {
    fn drop(&mut self) {
        log::debug!(
            "Released symbol space of session {} ({} functions)",
            self.owner,
            self.functions.len()
        );
    }
}

/// Invocation handle for a function of a compiled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle {
    pub(crate) func: FuncId,
    pub(crate) arity: u16,
}

#[derive(Debug)]
pub struct CompiledUnit {
    space: SymbolSpace,
    entry_unit: String,
    warnings: Vec<Diagnostic>,
}

impl CompiledUnit {
    pub(crate) fn new(space: SymbolSpace, entry_unit: String, warnings: Vec<Diagnostic>) -> Self {
        Self {
            space,
            entry_unit,
            warnings,
        }
    }

    pub fn session(&self) -> SessionId {
        self.space.owner
    }

    pub fn entry_unit(&self) -> &str {
        &self.entry_unit
    }

    /// Warnings emitted while compiling, in emission order
    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn lookup(&self, name: &str) -> Option<&Function> {
        self.space
            .index
            .get(name)
            .and_then(|&id| self.space.functions.get(id as usize))
    }

    /// Resolves a function of the entry unit by name and arity
    pub fn entry_point(&self, name: &str, arity: usize) -> Option<EntryHandle> {
        let func = *self.space.index.get(name)?;
        let function = self.space.functions.get(func as usize)?;
        (function.unit == self.entry_unit && function.arity as usize == arity).then_some(
            EntryHandle {
                func,
                arity: function.arity,
            },
        )
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.space.functions[id as usize]
    }

    pub fn function_count(&self) -> usize {
        self.space.functions.len()
    }

    pub fn string(&self, idx: u32) -> &str {
        &self.space.strings[idx as usize]
    }
}
