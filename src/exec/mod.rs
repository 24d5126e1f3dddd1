// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The stack-machine interpreter: instantiates a decoded [`Module`] and
//! executes its code.
//!
//! Execution is cooperative: a builtin can ask [`Interpreter::run`] to
//! return [`RunOutcome::Suspended`] instead of driving the call stack to
//! completion, and a later call to [`Interpreter::resume`] picks up exactly
//! where it left off. This lets a host multiplex many in-flight module
//! invocations without threads.
//!
//! Only function imports are supported; a module that imports a table,
//! memory, or global fails to link. A module may declare at most one
//! memory, matching the MVP restriction before multi-memory.

mod host;
mod labels;
mod memory;
mod reader;
mod table;
mod value;

pub use host::{Builtin, BuiltinContext, BuiltinOutcome};
pub use value::{FuncRef, Value};

use core::fmt;

use crate::Allocator;
use crate::Module;
use crate::core_compat::vec::Vec;
use crate::exec::labels::{Label, LabelKind, LabelTable, Resolver, resolve_forward};
use crate::exec::memory::LinearMemory;
use crate::exec::reader::ExprCursor;
use crate::exec::table::TableInstance;
use crate::types::{
    BulkOpcode, DataMode, ElementInit, ElementMode, ExportDescriptor, Expression, FunctionType,
    ImportDescriptor, Local, Name, Opcode, RefType,
};

/// Bounds on the arenas backing a single interpreter instance. Exceeding any
/// of these raises an [`ExhaustionError`] rather than growing without bound.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_value_stack: usize,
    pub max_call_frames: usize,
    /// Total open `block`/`loop`/`if` resolvers live at once, summed across
    /// every frame on the call stack.
    pub max_resolver_depth: usize,
    pub max_labels_per_function: usize,
    /// Params plus declared locals, in [`Value`] slots, for a single call
    /// frame.
    pub max_locals_bytes: usize,
    pub max_memory_pages: u32,
    /// Whether [`FuncRef::Builtin`] table entries may be dispatched by
    /// `call_indirect`. Off by default: a host must opt in before its
    /// directly-installed builtin references become callable from guest
    /// code, since doing so bypasses the module's own import-based call
    /// graph.
    pub allow_builtin_refs: bool,
}

impl Limits {
    pub const DEFAULT: Self = Self {
        max_value_stack: 4096,
        max_call_frames: 512,
        max_resolver_depth: 4096,
        max_labels_per_function: 4096,
        max_locals_bytes: 4096,
        max_memory_pages: 512, // 32 MiB
        allow_builtin_refs: false,
    };
}

impl Default for Limits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A bounded arena was exhausted. Distinct from [`Trap`], which reports a
/// guest-observable semantic fault; this reports an implementation-defined
/// capacity limit being hit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExhaustionError {
    ValueStack,
    CallFrameStack,
    ResolverStack,
    LabelTable,
    Locals,
}

impl fmt::Display for ExhaustionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueStack => write!(f, "value stack exhausted"),
            Self::CallFrameStack => write!(f, "call frame stack exhausted"),
            Self::ResolverStack => write!(f, "resolver stack exhausted"),
            Self::LabelTable => write!(f, "label table exhausted"),
            Self::Locals => write!(f, "locals exceed implementation cap"),
        }
    }
}

impl core::error::Error for ExhaustionError {}

/// A runtime fault, either raised directly by an instruction or propagated
/// from a builtin.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trap {
    Unreachable,
    IntegerDivideByZero,
    IntegerOverflow,
    InvalidConversionToInteger,
    StackTypeMismatch,
    NoMemory,
    NullMemoryAccess,
    OutOfBoundsMemoryAccess,
    MemoryCapExceeded,
    TableIndexOutOfBounds,
    NullFunctionReference,
    IndirectCallTypeMismatch,
    AllocationFailure,
    Exhausted(ExhaustionError),
    Host,
}

impl From<ExhaustionError> for Trap {
    fn from(err: ExhaustionError) -> Self {
        Trap::Exhausted(err)
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable instruction executed"),
            Self::IntegerDivideByZero => write!(f, "integer divide by zero"),
            Self::IntegerOverflow => write!(f, "integer overflow"),
            Self::InvalidConversionToInteger => write!(f, "invalid conversion to integer"),
            Self::StackTypeMismatch => write!(f, "value stack type mismatch"),
            Self::NoMemory => write!(f, "no memory instance"),
            Self::NullMemoryAccess => write!(f, "access through null memory address"),
            Self::OutOfBoundsMemoryAccess => write!(f, "out-of-bounds memory access"),
            Self::MemoryCapExceeded => write!(f, "memory exceeds implementation cap"),
            Self::TableIndexOutOfBounds => write!(f, "table index out of bounds"),
            Self::NullFunctionReference => write!(f, "call through null function reference"),
            Self::IndirectCallTypeMismatch => write!(f, "indirect call signature mismatch"),
            Self::AllocationFailure => write!(f, "allocation failure"),
            Self::Exhausted(err) => write!(f, "{err}"),
            Self::Host => write!(f, "trap raised by host function"),
        }
    }
}

impl core::error::Error for Trap {}

/// A module failed to link against the builtins supplied to
/// [`Interpreter::instantiate`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkError {
    /// The import at this index is not a function import; only function
    /// imports are supported.
    UnsupportedImportKind(u32),
    /// No builtin with a matching name was supplied for the function import
    /// at this index.
    UnresolvedFunctionImport(u32),
    /// The module declares more than one memory.
    MultipleMemories,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedImportKind(idx) => {
                write!(f, "import {idx} is not a function import")
            }
            Self::UnresolvedFunctionImport(idx) => {
                write!(f, "no builtin resolves function import {idx}")
            }
            Self::MultipleMemories => write!(f, "module declares more than one memory"),
        }
    }
}

impl core::error::Error for LinkError {}

/// The outcome of [`Interpreter::instantiate`] failing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstantiateError {
    Link(LinkError),
    Trap(Trap),
    Exhausted(ExhaustionError),
    AllocationFailure,
}

impl From<LinkError> for InstantiateError {
    fn from(err: LinkError) -> Self {
        Self::Link(err)
    }
}

impl From<Trap> for InstantiateError {
    fn from(err: Trap) -> Self {
        Self::Trap(err)
    }
}

impl From<ExhaustionError> for InstantiateError {
    fn from(err: ExhaustionError) -> Self {
        Self::Exhausted(err)
    }
}

impl fmt::Display for InstantiateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link(err) => write!(f, "{err}"),
            Self::Trap(err) => write!(f, "{err}"),
            Self::Exhausted(err) => write!(f, "{err}"),
            Self::AllocationFailure => write!(f, "allocation failure"),
        }
    }
}

impl core::error::Error for InstantiateError {}

/// The result of a completed (non-suspended) run: the callee's single
/// return value, if its signature declares one.
#[derive(Clone, Copy, Debug)]
pub enum RunOutcome {
    Completed(Option<Value>),
    Suspended,
}

// One activation of a module-defined function.
struct CallFrame {
    func_idx: u32,
    code_pos: usize,
    locals_base: usize,
    value_base: usize,
    resolver_base: usize,
    // 0 or 1: this implementation predates the multi-value proposal.
    arity: u8,
}

fn reserve_push<T, A: Allocator>(vec: &mut Vec<T, A>, value: T) -> Result<(), Trap> {
    vec.try_reserve(1).map_err(|_| Trap::AllocationFailure)?;
    vec.push(value);
    Ok(())
}

/// An instantiated module, ready to run.
pub struct Interpreter<'m, A: Allocator> {
    module: &'m Module<A>,
    builtins: Vec<Builtin<A>, A>,
    num_imported_funcs: u32,
    imported_func_builtin: Vec<u32, A>,

    memory: Option<LinearMemory<A>>,
    tables: Vec<TableInstance<A>, A>,
    globals: Vec<Value, A>,
    data_dropped: Vec<bool, A>,
    elem_dropped: Vec<bool, A>,
    label_tables: Vec<LabelTable>,

    values: Vec<Value, A>,
    locals: Vec<Value, A>,
    frames: Vec<CallFrame, A>,
    resolvers: Vec<Resolver, A>,

    limits: Limits,
    alloc: A,
    pub(crate) quitting: bool,
}

impl<'m, A: Allocator + Clone> Interpreter<'m, A> {
    /// Links `module` against `builtins`, allocates its memory and tables,
    /// runs active segment initializers, and (if the module declares a
    /// start function) queues it to run on the next call to
    /// [`Interpreter::run`].
    pub fn instantiate(
        module: &'m Module<A>,
        builtins: Vec<Builtin<A>, A>,
        limits: Limits,
        alloc: A,
    ) -> Result<Self, InstantiateError> {
        let mut imported_func_builtin = Vec::new_in(alloc.clone());
        imported_func_builtin
            .try_reserve_exact(module.importsec.len())
            .map_err(|_| InstantiateError::AllocationFailure)?;
        for (idx, import) in module.importsec.iter().enumerate() {
            let ImportDescriptor::Function(_) = import.descriptor else {
                return Err(LinkError::UnsupportedImportKind(idx as u32).into());
            };
            let pos = builtins
                .iter()
                .position(|b| b.name == name_str(&import.field))
                .ok_or(LinkError::UnresolvedFunctionImport(idx as u32))?;
            imported_func_builtin.push(pos as u32);
        }
        let num_imported_funcs = imported_func_builtin.len() as u32;

        if module.memsec.len() > 1 {
            return Err(LinkError::MultipleMemories.into());
        }
        let memory = match module.memsec.first() {
            Some(ty) => Some(LinearMemory::new(
                *ty,
                limits.max_memory_pages,
                alloc.clone(),
            )?),
            None => None,
        };

        let mut tables = Vec::new_in(alloc.clone());
        tables
            .try_reserve_exact(module.tablesec.len())
            .map_err(|_| InstantiateError::AllocationFailure)?;
        for ty in module.tablesec.iter() {
            tables.push(TableInstance::new(*ty, alloc.clone())?);
        }

        let mut globals = Vec::new_in(alloc.clone());
        globals
            .try_reserve_exact(module.globalsec.len())
            .map_err(|_| InstantiateError::AllocationFailure)?;
        for global in module.globalsec.iter() {
            globals.push(eval_const_expr(&global.init, &globals)?);
        }

        let mut elem_dropped = Vec::new_in(alloc.clone());
        elem_dropped.resize(module.elemsec.len(), false);
        for elem in module.elemsec.iter() {
            if let ElementMode::Active(active) = &elem.mode {
                let offset = as_u32(eval_const_expr(&active.offset, &globals)?)?;
                let values = elem_values(elem, &globals, &alloc)?;
                tables[*active.table as usize].init_from(
                    offset,
                    &values,
                    0,
                    values.len() as u32,
                )?;
            }
        }

        let mut data_dropped = Vec::new_in(alloc.clone());
        data_dropped.resize(module.datasec.len(), false);

        let mut interp = Self {
            module,
            builtins,
            num_imported_funcs,
            imported_func_builtin,
            memory,
            tables,
            globals,
            data_dropped,
            elem_dropped,
            label_tables: {
                let mut v = Vec::with_capacity(module.codesec.len());
                v.resize_with(module.codesec.len(), LabelTable::default);
                v
            },
            values: Vec::new_in(alloc.clone()),
            locals: Vec::new_in(alloc.clone()),
            frames: Vec::new_in(alloc.clone()),
            resolvers: Vec::new_in(alloc.clone()),
            limits,
            alloc,
            quitting: false,
        };

        for data in module.datasec.iter() {
            if let DataMode::Active(active) = &data.mode {
                let offset = as_u32(eval_const_expr(&active.offset, &interp.globals)?)?;
                interp
                    .memory_mut()?
                    .init_from(offset, &data.init, 0, data.init.len() as u32)?;
            }
        }

        if let Some(func_idx) = entry_function(module) {
            interp.push_call_frame(func_idx)?;
        }
        Ok(interp)
    }

    /// Resets all runtime state (value stack, call frames, resolvers) back
    /// to an idle state, re-queuing the start function if the module
    /// declares one. Memory, tables, and globals are left as they stand;
    /// this does not re-run instantiation.
    pub fn reset(&mut self) -> Result<(), Trap> {
        self.values.clear();
        self.locals.clear();
        self.frames.clear();
        self.resolvers.clear();
        self.quitting = false;
        if let Some(func_idx) = entry_function(self.module) {
            self.push_call_frame(func_idx)?;
        }
        Ok(())
    }

    /// Drives execution until the call stack empties, a builtin requests
    /// suspension, or a trap occurs.
    #[cfg_attr(feature = "std", tracing::instrument(skip_all))]
    pub fn run(&mut self) -> Result<RunOutcome, Trap> {
        loop {
            if self.quitting {
                crate::log!(debug, "run suspended");
                return Ok(RunOutcome::Suspended);
            }
            if self.frames.is_empty() {
                crate::log!(debug, "run completed");
                return Ok(RunOutcome::Completed(self.values.pop()));
            }
            self.step()?;
        }
    }

    /// Resumes a suspended run. Equivalent to calling [`Interpreter::run`]
    /// again; suspension is purely a return-to-host signal; all state needed
    /// to continue already lives in the interpreter.
    #[cfg_attr(feature = "std", tracing::instrument(skip_all))]
    pub fn resume(&mut self) -> Result<RunOutcome, Trap> {
        self.quitting = false;
        self.run()
    }

    pub(crate) fn memory(&self) -> Result<&LinearMemory<A>, Trap> {
        self.memory.as_ref().ok_or(Trap::NoMemory)
    }

    pub(crate) fn memory_mut(&mut self) -> Result<&mut LinearMemory<A>, Trap> {
        self.memory.as_mut().ok_or(Trap::NoMemory)
    }

    fn function_type(&self, func_idx: u32) -> &'m FunctionType<A> {
        if func_idx < self.num_imported_funcs {
            let ImportDescriptor::Function(tyidx) =
                self.module.importsec[func_idx as usize].descriptor
            else {
                unreachable!("import resolution guarantees a function import")
            };
            &self.module.typesec[*tyidx as usize]
        } else {
            let tyidx = self.module.funcsec[(func_idx - self.num_imported_funcs) as usize];
            &self.module.typesec[*tyidx as usize]
        }
    }

    fn push(&mut self, value: Value) -> Result<(), Trap> {
        if self.values.len() >= self.limits.max_value_stack {
            return Err(ExhaustionError::ValueStack.into());
        }
        reserve_push(&mut self.values, value)
    }

    fn pop(&mut self) -> Result<Value, Trap> {
        self.values.pop().ok_or(Trap::StackTypeMismatch)
    }

    fn pop_i32(&mut self) -> Result<i32, Trap> {
        self.pop()?.as_i32().ok_or(Trap::StackTypeMismatch)
    }

    fn pop_u32(&mut self) -> Result<u32, Trap> {
        self.pop_i32().map(|v| v as u32)
    }

    fn pop_i64(&mut self) -> Result<i64, Trap> {
        self.pop()?.as_i64().ok_or(Trap::StackTypeMismatch)
    }

    fn pop_f32(&mut self) -> Result<f32, Trap> {
        self.pop()?.as_f32().ok_or(Trap::StackTypeMismatch)
    }

    fn pop_f64(&mut self) -> Result<f64, Trap> {
        self.pop()?.as_f64().ok_or(Trap::StackTypeMismatch)
    }

    fn push_resolver(&mut self, label: usize) -> Result<(), Trap> {
        if self.resolvers.len() >= self.limits.max_resolver_depth {
            return Err(ExhaustionError::ResolverStack.into());
        }
        reserve_push(
            &mut self.resolvers,
            Resolver { label, stack_height: self.values.len() as u32 },
        )
    }

    fn push_call_frame(&mut self, func_idx: u32) -> Result<BuiltinOutcome, Trap> {
        if func_idx < self.num_imported_funcs {
            return self.call_builtin(func_idx);
        }
        if self.frames.len() >= self.limits.max_call_frames {
            return Err(ExhaustionError::CallFrameStack.into());
        }
        let local_idx = (func_idx - self.num_imported_funcs) as usize;
        let functype = self.function_type(func_idx);
        let nparams = functype.parameters.len();
        if self.values.len() < nparams {
            return Err(Trap::StackTypeMismatch);
        }
        let declared = self.module.codesec[local_idx].locals.len();
        if nparams + declared > self.limits.max_locals_bytes {
            return Err(ExhaustionError::Locals.into());
        }
        let locals_base = self.locals.len();
        let args_start = self.values.len() - nparams;
        for value in self.values.drain(args_start..) {
            reserve_push(&mut self.locals, value)?;
        }
        for local in self.module.codesec[local_idx].locals.iter() {
            reserve_push(&mut self.locals, value_of_local(*local))?;
        }
        let frame = CallFrame {
            func_idx,
            code_pos: 0,
            locals_base,
            value_base: self.values.len(),
            resolver_base: self.resolvers.len(),
            arity: functype.results.len() as u8,
        };
        reserve_push(&mut self.frames, frame)?;
        Ok(BuiltinOutcome::Done)
    }

    fn call_builtin(&mut self, func_idx: u32) -> Result<BuiltinOutcome, Trap> {
        let functype = self.function_type(func_idx);
        let nparams = functype.parameters.len();
        let has_result = !functype.results.is_empty();
        if self.values.len() < nparams {
            return Err(Trap::StackTypeMismatch);
        }
        let args_start = self.values.len() - nparams;
        // Copied out rather than drained: the call site rewinds `code_pos`
        // past the call on a non-`Done` outcome to re-dispatch the same
        // instruction on resume, so the operands must still be sitting on
        // the value stack for that re-dispatch to find them.
        let mut args = Vec::new_in(self.alloc.clone());
        args.try_reserve_exact(nparams)
            .map_err(|_| Trap::AllocationFailure)?;
        args.extend(self.values[args_start..].iter().copied());

        let builtin_idx = self.imported_func_builtin[func_idx as usize] as usize;
        let func = self.builtins[builtin_idx].func;
        let mut ctx = BuiltinContext {
            interp: self,
            args: &args,
            result: None,
        };
        let outcome = func(&mut ctx)?;
        let result = ctx.result;
        // A builtin that suspends or quits hasn't necessarily produced a
        // result yet; only a `Done` outcome is required to have left one.
        if matches!(outcome, BuiltinOutcome::Done) {
            self.values.truncate(args_start);
            if has_result {
                self.push(result.ok_or(Trap::StackTypeMismatch)?)?;
            }
        } else {
            self.quitting = true;
        }
        Ok(outcome)
    }

    fn pop_call_frame(&mut self) -> Result<(), Trap> {
        let frame = self.frames.pop().expect("pop_call_frame on empty stack");
        let result = if frame.arity > 0 {
            Some(self.pop()?)
        } else {
            None
        };
        self.values.truncate(frame.value_base);
        self.locals.truncate(frame.locals_base);
        self.resolvers.truncate(frame.resolver_base);
        if let Some(value) = result {
            self.push(value)?;
        }
        Ok(())
    }

    // Finds (lazily resolving if necessary) the label at resolver depth
    // `relative_depth` counting from the innermost currently-open construct.
    fn label_at_depth(&mut self, local_idx: usize, relative_depth: u32) -> Result<Label, Trap> {
        let frame = self.frames.last().expect("label lookup without a frame");
        let idx = self.resolvers.len() - frame.resolver_base - 1 - relative_depth as usize;
        let resolver = self.resolvers[frame.resolver_base + idx];
        let table = &mut self.label_tables[local_idx];
        let mut label = table.get(resolver.label);
        if label.end.is_none() {
            let code = &self.module.codesec[local_idx].code;
            let mut cursor = ExprCursor::new(code);
            resolve_forward(
                table,
                &mut cursor,
                resolver.label,
                self.limits.max_labels_per_function,
            )?;
            label = table.get(resolver.label);
        }
        Ok(label)
    }

    // Executes a single instruction of the topmost call frame.
    fn step(&mut self) -> Result<(), Trap> {
        let frame_idx = self.frames.len() - 1;
        let func_idx = self.frames[frame_idx].func_idx;
        let local_idx = (func_idx - self.num_imported_funcs) as usize;
        // Copied out (references are `Copy`) so the cursor's lifetime isn't
        // tied to `&mut self`, which would conflict with the `self.push()`/
        // `self.pop_*()` calls interleaved through the match below.
        let module: &'m Module<A> = self.module;
        let code = &module.codesec[local_idx].code;
        let mut cursor = ExprCursor::new(code);
        cursor.seek(self.frames[frame_idx].code_pos);

        let op_pos = cursor.pos();
        let op = cursor.read_opcode();
        crate::log!(trace, ?op, op_pos, frame_idx, "dispatch");
        macro_rules! binop {
            ($pop:ident, $variant:ident, $f:expr) => {{
                let b = self.$pop()?;
                let a = self.$pop()?;
                self.push(Value::$variant($f(a, b)))?;
            }};
        }
        macro_rules! binop_trap {
            ($pop:ident, $variant:ident, $f:expr) => {{
                let b = self.$pop()?;
                let a = self.$pop()?;
                self.push(Value::$variant($f(a, b)?))?;
            }};
        }
        macro_rules! unop {
            ($pop:ident, $variant:ident, $f:expr) => {{
                let a = self.$pop()?;
                self.push(Value::$variant($f(a)))?;
            }};
        }
        macro_rules! unop_trap {
            ($pop:ident, $variant:ident, $f:expr) => {{
                let a = self.$pop()?;
                self.push(Value::$variant($f(a)?))?;
            }};
        }
        macro_rules! cmp {
            ($pop:ident, $f:expr) => {{
                let b = self.$pop()?;
                let a = self.$pop()?;
                self.push(Value::I32($f(a, b) as i32))?;
            }};
        }
        macro_rules! cmp1 {
            ($pop:ident, $f:expr) => {{
                let a = self.$pop()?;
                self.push(Value::I32($f(a) as i32))?;
            }};
        }

        match op {
            Opcode::Unreachable => return Err(Trap::Unreachable),
            Opcode::Nop => {}
            Opcode::Block | Opcode::Loop => {
                let _block_type = cursor.read_block_type();
                let kind = if op == Opcode::Loop {
                    LabelKind::Loop
                } else {
                    LabelKind::Block
                };
                let label = self.label_tables[local_idx].find_or_insert(
                    op_pos,
                    kind,
                    self.limits.max_labels_per_function,
                )?;
                self.push_resolver(label)?;
            }
            Opcode::If => {
                let _block_type = cursor.read_block_type();
                let cond = self.pop_i32()?;
                let label = self.label_tables[local_idx].find_or_insert(
                    op_pos,
                    LabelKind::If,
                    self.limits.max_labels_per_function,
                )?;
                self.push_resolver(label)?;
                if cond == 0 {
                    let l = self.label_at_depth(local_idx, 0)?;
                    match l.els {
                        Some(pos) => cursor.seek(pos),
                        None => {
                            // No `else` arm: skip straight past the matching
                            // `end`, which this dispatch loop will therefore
                            // never itself execute, so pop the resolver here.
                            self.resolvers.pop();
                            cursor.seek(l.end.expect("resolved label has an end"));
                        }
                    }
                }
            }
            Opcode::Else => {
                // Reached by falling off the end of a taken `if` branch: the
                // matching `end` is skipped, so its resolver pop happens
                // here instead.
                let l = self.label_at_depth(local_idx, 0)?;
                self.resolvers.pop();
                cursor.seek(l.end.expect("resolved label has an end"));
            }
            Opcode::End => {
                let frame = &self.frames[frame_idx];
                if self.resolvers.len() == frame.resolver_base {
                    self.frames[frame_idx].code_pos = cursor.pos();
                    self.pop_call_frame()?;
                    return Ok(());
                }
                self.resolvers.pop();
            }
            Opcode::Br => {
                let depth = cursor.read_u32();
                self.branch(local_idx, depth, &mut cursor)?;
            }
            Opcode::BrIf => {
                let depth = cursor.read_u32();
                if self.pop_i32()? != 0 {
                    self.branch(local_idx, depth, &mut cursor)?;
                }
            }
            Opcode::BrTable => {
                let (labels, default) = cursor.read_br_table();
                let idx = self.pop_u32()?;
                let depth = if idx < labels.len() {
                    cursor.label_at(labels, idx)
                } else {
                    default
                };
                self.branch(local_idx, depth, &mut cursor)?;
            }
            Opcode::Return => {
                self.pop_call_frame()?;
                return Ok(());
            }
            Opcode::Call => {
                let callee = cursor.read_u32();
                self.frames[frame_idx].code_pos = cursor.pos();
                if self.push_call_frame(callee)? == BuiltinOutcome::Suspend {
                    // Re-dispatch this same call on resume.
                    self.frames[frame_idx].code_pos = op_pos;
                }
                return Ok(());
            }
            Opcode::CallIndirect => {
                let operands = cursor.read_call_indirect_operands();
                let elem_idx = self.pop_u32()?;
                let reference = self.tables[*operands.table as usize].get(elem_idx)?;
                let callee = match reference {
                    Value::FuncRef(FuncRef::Null) | Value::ExternRef(None) => {
                        return Err(Trap::NullFunctionReference);
                    }
                    Value::FuncRef(FuncRef::Index(idx)) => idx,
                    Value::FuncRef(FuncRef::Builtin(idx)) if self.limits.allow_builtin_refs => {
                        self.frames[frame_idx].code_pos = cursor.pos();
                        if self.invoke_builtin_ref(idx)? == BuiltinOutcome::Suspend {
                            self.frames[frame_idx].code_pos = op_pos;
                        }
                        return Ok(());
                    }
                    _ => return Err(Trap::IndirectCallTypeMismatch),
                };
                let expected = &self.module.typesec[*operands.ty as usize];
                let actual = self.function_type(callee);
                if !signatures_match(expected, actual) {
                    return Err(Trap::IndirectCallTypeMismatch);
                }
                self.frames[frame_idx].code_pos = cursor.pos();
                if self.push_call_frame(callee)? == BuiltinOutcome::Suspend {
                    self.frames[frame_idx].code_pos = op_pos;
                }
                return Ok(());
            }
            Opcode::Drop => {
                self.pop()?;
            }
            Opcode::Select => {
                let cond = self.pop_i32()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(if cond != 0 { a } else { b })?;
            }
            Opcode::SelectT => {
                let _types = cursor.read_select_t();
                let cond = self.pop_i32()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(if cond != 0 { a } else { b })?;
            }
            Opcode::LocalGet => {
                let idx = cursor.read_u32();
                let frame = &self.frames[frame_idx];
                let value = self.locals[frame.locals_base + idx as usize];
                self.push(value)?;
            }
            Opcode::LocalSet => {
                let idx = cursor.read_u32();
                let value = self.pop()?;
                let base = self.frames[frame_idx].locals_base;
                self.locals[base + idx as usize] = value;
            }
            Opcode::LocalTee => {
                let idx = cursor.read_u32();
                let value = self.pop()?;
                let base = self.frames[frame_idx].locals_base;
                self.locals[base + idx as usize] = value;
                self.push(value)?;
            }
            Opcode::GlobalGet => {
                let idx = cursor.read_u32();
                let value = self.globals[idx as usize];
                self.push(value)?;
            }
            Opcode::GlobalSet => {
                let idx = cursor.read_u32();
                let value = self.pop()?;
                self.globals[idx as usize] = value;
            }
            Opcode::TableGet => {
                let idx = cursor.read_u32();
                let elem_idx = self.pop_u32()?;
                let value = self.tables[idx as usize].get(elem_idx)?;
                self.push(value)?;
            }
            Opcode::TableSet => {
                let idx = cursor.read_u32();
                let value = self.pop()?;
                let elem_idx = self.pop_u32()?;
                self.tables[idx as usize].set(elem_idx, value)?;
            }
            Opcode::RefNull => {
                let reftype = cursor.read_ref_type();
                self.push(match reftype {
                    RefType::Func => Value::FuncRef(FuncRef::Null),
                    RefType::Extern => Value::ExternRef(None),
                })?;
            }
            Opcode::RefIsNull => {
                let value = self.pop()?;
                self.push(Value::I32(value.is_null_ref() as i32))?;
            }
            Opcode::RefFunc => {
                let idx = cursor.read_u32();
                self.push(Value::FuncRef(FuncRef::Index(idx)))?;
            }
            Opcode::I32Load => load!(self, cursor, pop_i32, I32, 4, |b: [u8; 4]| i32::from_le_bytes(b)),
            Opcode::I32Load8S => {
                load!(self, cursor, pop_i32, I32, 1, |b: [u8; 1]| b[0] as i8 as i32)
            }
            Opcode::I32Load8U => {
                load!(self, cursor, pop_i32, I32, 1, |b: [u8; 1]| b[0] as i32)
            }
            Opcode::I32Load16S => {
                load!(self, cursor, pop_i32, I32, 2, |b: [u8; 2]| i16::from_le_bytes(b) as i32)
            }
            Opcode::I32Load16U => {
                load!(self, cursor, pop_i32, I32, 2, |b: [u8; 2]| u16::from_le_bytes(b) as i32)
            }
            Opcode::I64Load => load!(self, cursor, pop_i32, I64, 8, |b: [u8; 8]| i64::from_le_bytes(b)),
            Opcode::I64Load8S => {
                load!(self, cursor, pop_i32, I64, 1, |b: [u8; 1]| b[0] as i8 as i64)
            }
            Opcode::I64Load8U => {
                load!(self, cursor, pop_i32, I64, 1, |b: [u8; 1]| b[0] as i64)
            }
            Opcode::I64Load16S => {
                load!(self, cursor, pop_i32, I64, 2, |b: [u8; 2]| i16::from_le_bytes(b) as i64)
            }
            Opcode::I64Load16U => {
                load!(self, cursor, pop_i32, I64, 2, |b: [u8; 2]| u16::from_le_bytes(b) as i64)
            }
            Opcode::I64Load32S => {
                load!(self, cursor, pop_i32, I64, 4, |b: [u8; 4]| i32::from_le_bytes(b) as i64)
            }
            Opcode::I64Load32U => {
                load!(self, cursor, pop_i32, I64, 4, |b: [u8; 4]| u32::from_le_bytes(b) as i64)
            }
            Opcode::F32Load => load!(self, cursor, pop_i32, F32, 4, |b: [u8; 4]| f32::from_le_bytes(b)),
            Opcode::F64Load => load!(self, cursor, pop_i32, F64, 8, |b: [u8; 8]| f64::from_le_bytes(b)),
            Opcode::I32Store => store!(self, cursor, pop_i32, 4, |v: i32| v.to_le_bytes()),
            Opcode::I32Store8 => store!(self, cursor, pop_i32, 1, |v: i32| (v as u8).to_le_bytes()),
            Opcode::I32Store16 => store!(self, cursor, pop_i32, 2, |v: i32| (v as u16).to_le_bytes()),
            Opcode::I64Store => store!(self, cursor, pop_i64, 8, |v: i64| v.to_le_bytes()),
            Opcode::I64Store8 => store!(self, cursor, pop_i64, 1, |v: i64| (v as u8).to_le_bytes()),
            Opcode::I64Store16 => store!(self, cursor, pop_i64, 2, |v: i64| (v as u16).to_le_bytes()),
            Opcode::I64Store32 => store!(self, cursor, pop_i64, 4, |v: i64| (v as u32).to_le_bytes()),
            Opcode::F32Store => store!(self, cursor, pop_f32, 4, |v: f32| v.to_le_bytes()),
            Opcode::F64Store => store!(self, cursor, pop_f64, 8, |v: f64| v.to_le_bytes()),
            Opcode::MemorySize => {
                self.push(Value::I32(self.memory()?.page_count() as i32))?;
            }
            Opcode::MemoryGrow => {
                let delta = self.pop_u32()?;
                let result = self.memory_mut()?.grow(delta).map(|n| n as i32).unwrap_or(-1);
                self.push(Value::I32(result))?;
            }
            Opcode::I32Const => self.push(Value::I32(cursor.read_i32()))?,
            Opcode::I64Const => self.push(Value::I64(cursor.read_i64()))?,
            Opcode::F32Const => self.push(Value::F32(cursor.read_f32()))?,
            Opcode::F64Const => self.push(Value::F64(cursor.read_f64()))?,

            Opcode::I32Eqz => cmp1!(pop_i32, |a: i32| a == 0),
            Opcode::I32Eq => cmp!(pop_i32, |a: i32, b: i32| a == b),
            Opcode::I32Ne => cmp!(pop_i32, |a: i32, b: i32| a != b),
            Opcode::I32LtS => cmp!(pop_i32, |a: i32, b: i32| a < b),
            Opcode::I32LtU => cmp!(pop_i32, |a: i32, b: i32| (a as u32) < (b as u32)),
            Opcode::I32GtS => cmp!(pop_i32, |a: i32, b: i32| a > b),
            Opcode::I32GtU => cmp!(pop_i32, |a: i32, b: i32| (a as u32) > (b as u32)),
            Opcode::I32LeS => cmp!(pop_i32, |a: i32, b: i32| a <= b),
            Opcode::I32LeU => cmp!(pop_i32, |a: i32, b: i32| (a as u32) <= (b as u32)),
            Opcode::I32GeS => cmp!(pop_i32, |a: i32, b: i32| a >= b),
            Opcode::I32GeU => cmp!(pop_i32, |a: i32, b: i32| (a as u32) >= (b as u32)),

            Opcode::I64Eqz => {
                let a = self.pop_i64()?;
                self.push(Value::I32((a == 0) as i32))?;
            }
            Opcode::I64Eq => cmp!(pop_i64, |a: i64, b: i64| a == b),
            Opcode::I64Ne => cmp!(pop_i64, |a: i64, b: i64| a != b),
            Opcode::I64LtS => cmp!(pop_i64, |a: i64, b: i64| a < b),
            Opcode::I64LtU => cmp!(pop_i64, |a: i64, b: i64| (a as u64) < (b as u64)),
            Opcode::I64GtS => cmp!(pop_i64, |a: i64, b: i64| a > b),
            Opcode::I64GtU => cmp!(pop_i64, |a: i64, b: i64| (a as u64) > (b as u64)),
            Opcode::I64LeS => cmp!(pop_i64, |a: i64, b: i64| a <= b),
            Opcode::I64LeU => cmp!(pop_i64, |a: i64, b: i64| (a as u64) <= (b as u64)),
            Opcode::I64GeS => cmp!(pop_i64, |a: i64, b: i64| a >= b),
            Opcode::I64GeU => cmp!(pop_i64, |a: i64, b: i64| (a as u64) >= (b as u64)),

            Opcode::F32Eq => cmp!(pop_f32, |a: f32, b: f32| a == b),
            Opcode::F32Ne => cmp!(pop_f32, |a: f32, b: f32| a != b),
            Opcode::F32Lt => cmp!(pop_f32, |a: f32, b: f32| a < b),
            Opcode::F32Gt => cmp!(pop_f32, |a: f32, b: f32| a > b),
            Opcode::F32Le => cmp!(pop_f32, |a: f32, b: f32| a <= b),
            Opcode::F32Ge => cmp!(pop_f32, |a: f32, b: f32| a >= b),
            Opcode::F64Eq => cmp!(pop_f64, |a: f64, b: f64| a == b),
            Opcode::F64Ne => cmp!(pop_f64, |a: f64, b: f64| a != b),
            Opcode::F64Lt => cmp!(pop_f64, |a: f64, b: f64| a < b),
            Opcode::F64Gt => cmp!(pop_f64, |a: f64, b: f64| a > b),
            Opcode::F64Le => cmp!(pop_f64, |a: f64, b: f64| a <= b),
            Opcode::F64Ge => cmp!(pop_f64, |a: f64, b: f64| a >= b),

            Opcode::I32Clz => unop!(pop_i32, I32, |a: i32| a.leading_zeros() as i32),
            Opcode::I32Ctz => unop!(pop_i32, I32, |a: i32| a.trailing_zeros() as i32),
            Opcode::I32Popcnt => unop!(pop_i32, I32, |a: i32| a.count_ones() as i32),
            Opcode::I32Add => binop!(pop_i32, I32, |a: i32, b: i32| a.wrapping_add(b)),
            Opcode::I32Sub => binop!(pop_i32, I32, |a: i32, b: i32| a.wrapping_sub(b)),
            Opcode::I32Mul => binop!(pop_i32, I32, |a: i32, b: i32| a.wrapping_mul(b)),
            Opcode::I32DivS => binop_trap!(pop_i32, I32, i32_div_s),
            Opcode::I32DivU => binop_trap!(pop_i32, I32, i32_div_u),
            Opcode::I32RemS => binop_trap!(pop_i32, I32, i32_rem_s),
            Opcode::I32RemU => binop_trap!(pop_i32, I32, i32_rem_u),
            Opcode::I32And => binop!(pop_i32, I32, |a: i32, b: i32| a & b),
            Opcode::I32Or => binop!(pop_i32, I32, |a: i32, b: i32| a | b),
            Opcode::I32Xor => binop!(pop_i32, I32, |a: i32, b: i32| a ^ b),
            Opcode::I32Shl => binop!(pop_i32, I32, |a: i32, b: i32| a.wrapping_shl(b as u32)),
            Opcode::I32ShrS => binop!(pop_i32, I32, |a: i32, b: i32| a.wrapping_shr(b as u32)),
            Opcode::I32ShrU => {
                binop!(pop_i32, I32, |a: i32, b: i32| (a as u32).wrapping_shr(b as u32) as i32)
            }
            Opcode::I32Rotl => binop!(pop_i32, I32, |a: i32, b: i32| a.rotate_left(b as u32)),
            Opcode::I32Rotr => binop!(pop_i32, I32, |a: i32, b: i32| a.rotate_right(b as u32)),

            Opcode::I64Clz => unop!(pop_i64, I64, |a: i64| a.leading_zeros() as i64),
            Opcode::I64Ctz => unop!(pop_i64, I64, |a: i64| a.trailing_zeros() as i64),
            Opcode::I64Popcnt => unop!(pop_i64, I64, |a: i64| a.count_ones() as i64),
            Opcode::I64Add => binop!(pop_i64, I64, |a: i64, b: i64| a.wrapping_add(b)),
            Opcode::I64Sub => binop!(pop_i64, I64, |a: i64, b: i64| a.wrapping_sub(b)),
            Opcode::I64Mul => binop!(pop_i64, I64, |a: i64, b: i64| a.wrapping_mul(b)),
            Opcode::I64DivS => binop_trap!(pop_i64, I64, i64_div_s),
            Opcode::I64DivU => binop_trap!(pop_i64, I64, i64_div_u),
            Opcode::I64RemS => binop_trap!(pop_i64, I64, i64_rem_s),
            Opcode::I64RemU => binop_trap!(pop_i64, I64, i64_rem_u),
            Opcode::I64And => binop!(pop_i64, I64, |a: i64, b: i64| a & b),
            Opcode::I64Or => binop!(pop_i64, I64, |a: i64, b: i64| a | b),
            Opcode::I64Xor => binop!(pop_i64, I64, |a: i64, b: i64| a ^ b),
            Opcode::I64Shl => binop!(pop_i64, I64, |a: i64, b: i64| a.wrapping_shl(b as u32)),
            Opcode::I64ShrS => binop!(pop_i64, I64, |a: i64, b: i64| a.wrapping_shr(b as u32)),
            Opcode::I64ShrU => {
                binop!(pop_i64, I64, |a: i64, b: i64| (a as u64).wrapping_shr(b as u32) as i64)
            }
            Opcode::I64Rotl => binop!(pop_i64, I64, |a: i64, b: i64| a.rotate_left(b as u32)),
            Opcode::I64Rotr => binop!(pop_i64, I64, |a: i64, b: i64| a.rotate_right(b as u32)),

            Opcode::F32Abs => unop!(pop_f32, F32, |a: f32| a.abs()),
            Opcode::F32Neg => unop!(pop_f32, F32, |a: f32| -a),
            Opcode::F32Ceil => unop!(pop_f32, F32, |a: f32| a.ceil()),
            Opcode::F32Floor => unop!(pop_f32, F32, |a: f32| a.floor()),
            Opcode::F32Trunc => unop!(pop_f32, F32, |a: f32| a.trunc()),
            Opcode::F32Nearest => unop!(pop_f32, F32, round_ties_even_f32),
            Opcode::F32Sqrt => unop!(pop_f32, F32, |a: f32| a.sqrt()),
            Opcode::F32Add => binop!(pop_f32, F32, |a: f32, b: f32| a + b),
            Opcode::F32Sub => binop!(pop_f32, F32, |a: f32, b: f32| a - b),
            Opcode::F32Mul => binop!(pop_f32, F32, |a: f32, b: f32| a * b),
            Opcode::F32Div => binop!(pop_f32, F32, |a: f32, b: f32| a / b),
            Opcode::F32Min => binop!(pop_f32, F32, wasm_min_f32),
            Opcode::F32Max => binop!(pop_f32, F32, wasm_max_f32),
            Opcode::F32Copysign => binop!(pop_f32, F32, |a: f32, b: f32| a.copysign(b)),

            Opcode::F64Abs => unop!(pop_f64, F64, |a: f64| a.abs()),
            Opcode::F64Neg => unop!(pop_f64, F64, |a: f64| -a),
            Opcode::F64Ceil => unop!(pop_f64, F64, |a: f64| a.ceil()),
            Opcode::F64Floor => unop!(pop_f64, F64, |a: f64| a.floor()),
            Opcode::F64Trunc => unop!(pop_f64, F64, |a: f64| a.trunc()),
            Opcode::F64Nearest => unop!(pop_f64, F64, round_ties_even_f64),
            Opcode::F64Sqrt => unop!(pop_f64, F64, |a: f64| a.sqrt()),
            Opcode::F64Add => binop!(pop_f64, F64, |a: f64, b: f64| a + b),
            Opcode::F64Sub => binop!(pop_f64, F64, |a: f64, b: f64| a - b),
            Opcode::F64Mul => binop!(pop_f64, F64, |a: f64, b: f64| a * b),
            Opcode::F64Div => binop!(pop_f64, F64, |a: f64, b: f64| a / b),
            Opcode::F64Min => binop!(pop_f64, F64, wasm_min_f64),
            Opcode::F64Max => binop!(pop_f64, F64, wasm_max_f64),
            Opcode::F64Copysign => binop!(pop_f64, F64, |a: f64, b: f64| a.copysign(b)),

            Opcode::I32WrapI64 => unop!(pop_i64, I32, |a: i64| a as i32),
            Opcode::I32TruncF32S => unop_trap!(pop_f32, I32, i32_trunc_f32_s),
            Opcode::I32TruncF32U => unop_trap!(pop_f32, I32, i32_trunc_f32_u),
            Opcode::I32TruncF64S => unop_trap!(pop_f64, I32, i32_trunc_f64_s),
            Opcode::I32TruncF64U => unop_trap!(pop_f64, I32, i32_trunc_f64_u),
            Opcode::I64ExtendI32S => unop!(pop_i32, I64, |a: i32| a as i64),
            Opcode::I64ExtendI32U => unop!(pop_i32, I64, |a: i32| (a as u32) as i64),
            Opcode::I64TruncF32S => unop_trap!(pop_f32, I64, i64_trunc_f32_s),
            Opcode::I64TruncF32U => unop_trap!(pop_f32, I64, i64_trunc_f32_u),
            Opcode::I64TruncF64S => unop_trap!(pop_f64, I64, i64_trunc_f64_s),
            Opcode::I64TruncF64U => unop_trap!(pop_f64, I64, i64_trunc_f64_u),
            Opcode::F32ConvertI32S => unop!(pop_i32, F32, |a: i32| a as f32),
            Opcode::F32ConvertI32U => unop!(pop_i32, F32, |a: i32| (a as u32) as f32),
            Opcode::F32ConvertI64S => unop!(pop_i64, F32, |a: i64| a as f32),
            Opcode::F32ConvertI64U => unop!(pop_i64, F32, |a: i64| (a as u64) as f32),
            Opcode::F32DemoteF64 => unop!(pop_f64, F32, |a: f64| a as f32),
            Opcode::F64ConvertI32S => unop!(pop_i32, F64, |a: i32| a as f64),
            Opcode::F64ConvertI32U => unop!(pop_i32, F64, |a: i32| (a as u32) as f64),
            Opcode::F64ConvertI64S => unop!(pop_i64, F64, |a: i64| a as f64),
            Opcode::F64ConvertI64U => unop!(pop_i64, F64, |a: i64| (a as u64) as f64),
            Opcode::F64PromoteF32 => unop!(pop_f32, F64, |a: f32| a as f64),
            Opcode::I32ReinterpretF32 => unop!(pop_f32, I32, |a: f32| f32::to_bits(a) as i32),
            Opcode::I64ReinterpretF64 => unop!(pop_f64, I64, |a: f64| f64::to_bits(a) as i64),
            Opcode::F32ReinterpretI32 => unop!(pop_i32, F32, |a: i32| f32::from_bits(a as u32)),
            Opcode::F64ReinterpretI64 => unop!(pop_i64, F64, |a: i64| f64::from_bits(a as u64)),
            Opcode::I32Extend8S => unop!(pop_i32, I32, |a: i32| (a as i8) as i32),
            Opcode::I32Extend16S => unop!(pop_i32, I32, |a: i32| (a as i16) as i32),
            Opcode::I64Extend8S => unop!(pop_i64, I64, |a: i64| (a as i8) as i64),
            Opcode::I64Extend16S => unop!(pop_i64, I64, |a: i64| (a as i16) as i64),
            Opcode::I64Extend32S => unop!(pop_i64, I64, |a: i64| (a as i32) as i64),

            Opcode::BulkPrefix => {
                self.step_bulk(&mut cursor)?;
            }
            Opcode::VectorPrefix => unreachable!("vector instructions are rejected at decode time"),
        }

        self.frames[frame_idx].code_pos = cursor.pos();
        Ok(())
    }

    // Dispatches a builtin referenced directly by a [`FuncRef::Builtin`]
    // table entry, bypassing the normal import-indexed call path.
    fn invoke_builtin_ref(&mut self, builtin_idx: u32) -> Result<BuiltinOutcome, Trap> {
        let func = self
            .builtins
            .get(builtin_idx as usize)
            .ok_or(Trap::IndirectCallTypeMismatch)?
            .func;
        let mut ctx = BuiltinContext {
            interp: self,
            args: &[],
            result: None,
        };
        let outcome = func(&mut ctx)?;
        let result = ctx.result;
        if matches!(outcome, BuiltinOutcome::Done) {
            if let Some(value) = result {
                self.push(value)?;
            }
        } else {
            self.quitting = true;
        }
        Ok(outcome)
    }

    // Implements `br`/`br_if`/`br_table`'s target resolution and stack
    // adjustment.
    fn branch(
        &mut self,
        local_idx: usize,
        relative_depth: u32,
        cursor: &mut ExprCursor<'_>,
    ) -> Result<(), Trap> {
        let label = self.label_at_depth(local_idx, relative_depth)?;
        let resolver = {
            let frame = self.frames.last().expect("branch without a frame");
            let idx = self.resolvers.len() - frame.resolver_base - 1 - relative_depth as usize;
            self.resolvers[frame.resolver_base + idx]
        };

        // A loop's branch target is its own header: re-entering it takes no
        // result value, only whatever the loop's (empty, in this MVP) input
        // arity requires, which is already satisfied by the values sitting
        // below `resolver.stack_height`.
        let keep = match label.kind {
            LabelKind::Loop => 0,
            LabelKind::Block | LabelKind::If => {
                usize::from(self.values.len() > resolver.stack_height as usize)
            }
        };
        let kept = (keep == 1).then(|| self.values[self.values.len() - 1]);
        self.values.truncate(resolver.stack_height as usize);
        if let Some(v) = kept {
            self.push(v)?;
        }

        self.resolvers.truncate(self.resolvers.len() - relative_depth as usize - 1);

        match label.kind {
            LabelKind::Loop => cursor.seek(label.opener),
            LabelKind::Block | LabelKind::If => {
                cursor.seek(label.end.expect("resolved label has an end"))
            }
        }
        Ok(())
    }

    fn step_bulk(&mut self, cursor: &mut ExprCursor<'_>) -> Result<(), Trap> {
        let op = cursor.read_bulk_opcode();
        match op {
            BulkOpcode::MemoryInit => {
                let idx = cursor.read_u32();
                let len = self.pop_u32()?;
                let src = self.pop_u32()?;
                let dst = self.pop_u32()?;
                let empty = [];
                let data: &[u8] = if self.data_dropped[idx as usize] {
                    &empty
                } else {
                    &self.module.datasec[idx as usize].init
                };
                self.memory_mut()?.init_from(dst, data, src, len)?;
            }
            BulkOpcode::DataDrop => {
                let idx = cursor.read_u32();
                self.data_dropped[idx as usize] = true;
            }
            BulkOpcode::MemoryCopy => {
                let len = self.pop_u32()?;
                let src = self.pop_u32()?;
                let dst = self.pop_u32()?;
                self.memory_mut()?.copy_within(dst, src, len)?;
            }
            BulkOpcode::MemoryFill => {
                let len = self.pop_u32()?;
                let value = self.pop_i32()? as u8;
                let dst = self.pop_u32()?;
                self.memory_mut()?.fill(dst, value, len)?;
            }
            BulkOpcode::TableInit => {
                let operands = cursor.read_table_init_operands();
                let len = self.pop_u32()?;
                let src = self.pop_u32()?;
                let dst = self.pop_u32()?;
                let values = if self.elem_dropped[*operands.elem as usize] {
                    Vec::new_in(self.alloc.clone())
                } else {
                    elem_values(
                        &self.module.elemsec[*operands.elem as usize],
                        &self.globals,
                        &self.alloc,
                    )?
                };
                self.tables[*operands.table as usize].init_from(dst, &values, src, len)?;
            }
            BulkOpcode::ElemDrop => {
                let idx = cursor.read_u32();
                self.elem_dropped[idx as usize] = true;
            }
            BulkOpcode::TableCopy => {
                let operands = cursor.read_table_copy_operands();
                let len = self.pop_u32()?;
                let src = self.pop_u32()?;
                let dst = self.pop_u32()?;
                if operands.src == operands.dst {
                    self.tables[*operands.dst as usize].copy_within(dst, src, len)?;
                } else {
                    let mut buf = Vec::new_in(self.alloc.clone());
                    buf.try_reserve_exact(len as usize)
                        .map_err(|_| Trap::AllocationFailure)?;
                    for i in 0..len {
                        buf.push(self.tables[*operands.src as usize].get(src + i)?);
                    }
                    for (i, value) in buf.into_iter().enumerate() {
                        self.tables[*operands.dst as usize].set(dst + i as u32, value)?;
                    }
                }
            }
            BulkOpcode::TableGrow => {
                let idx = cursor.read_u32();
                let delta = self.pop_u32()?;
                let init = self.pop()?;
                let result = self.tables[idx as usize]
                    .grow(delta, init)
                    .map(|n| n as i32)
                    .unwrap_or(-1);
                self.push(Value::I32(result))?;
            }
            BulkOpcode::TableFill => {
                let idx = cursor.read_u32();
                let len = self.pop_u32()?;
                let value = self.pop()?;
                let dst = self.pop_u32()?;
                self.tables[idx as usize].fill(dst, value, len)?;
            }
            BulkOpcode::TableSize => {
                let idx = cursor.read_u32();
                self.push(Value::I32(self.tables[idx as usize].len() as i32))?;
            }
            // Saturating (never-trapping) truncations: Rust's `as` cast
            // between float and integer types already saturates NaN to 0
            // and out-of-range values to the target's MIN/MAX.
            BulkOpcode::I32TruncSatF32S => {
                let a = self.pop_f32()?;
                self.push(Value::I32(a as i32))?;
            }
            BulkOpcode::I32TruncSatF32U => {
                let a = self.pop_f32()?;
                self.push(Value::I32(a as u32 as i32))?;
            }
            BulkOpcode::I32TruncSatF64S => {
                let a = self.pop_f64()?;
                self.push(Value::I32(a as i32))?;
            }
            BulkOpcode::I32TruncSatF64U => {
                let a = self.pop_f64()?;
                self.push(Value::I32(a as u32 as i32))?;
            }
            BulkOpcode::I64TruncSatF32S => {
                let a = self.pop_f32()?;
                self.push(Value::I64(a as i64))?;
            }
            BulkOpcode::I64TruncSatF32U => {
                let a = self.pop_f32()?;
                self.push(Value::I64(a as u64 as i64))?;
            }
            BulkOpcode::I64TruncSatF64S => {
                let a = self.pop_f64()?;
                self.push(Value::I64(a as i64))?;
            }
            BulkOpcode::I64TruncSatF64U => {
                let a = self.pop_f64()?;
                self.push(Value::I64(a as u64 as i64))?;
            }
        }
        Ok(())
    }
}

// load!/store! need both a MemArg read and a checked, le-bytes round trip;
// written as macros (not methods) since the element width and target Value
// variant vary per opcode.
macro_rules! load {
    ($self:ident, $cursor:ident, $pop:ident, $variant:ident, $width:literal, $from_bytes:expr) => {{
        let mem_arg = $cursor.read_mem_arg();
        let base = $self.$pop()?;
        let addr = effective_addr(base, mem_arg.offset)?;
        let mut buf = [0u8; $width];
        $self.memory()?.read(addr, &mut buf)?;
        $self.push(Value::$variant($from_bytes(buf)))?;
    }};
}
use load;

macro_rules! store {
    ($self:ident, $cursor:ident, $pop:ident, $width:literal, $to_bytes:expr) => {{
        let mem_arg = $cursor.read_mem_arg();
        let value = $self.$pop()?;
        let base = $self.pop_i32()?;
        let addr = effective_addr(base, mem_arg.offset)?;
        let buf: [u8; $width] = $to_bytes(value);
        $self.memory_mut()?.write(addr, &buf)?;
    }};
}
use store;

fn effective_addr(base: i32, offset: u32) -> Result<u32, Trap> {
    (base as u32)
        .checked_add(offset)
        .ok_or(Trap::OutOfBoundsMemoryAccess)
}

fn as_u32(value: Value) -> Result<u32, Trap> {
    value.as_i32().map(|v| v as u32).ok_or(Trap::StackTypeMismatch)
}

fn name_str<A: Allocator>(name: &Name<A>) -> &str {
    name
}

// All locals start at their type's zero/null default regardless of the
// declared `Local` payload, per the MVP's local-initialization rule.
fn value_of_local(local: Local) -> Value {
    match local {
        Local::I32(v) => Value::I32(v),
        Local::I64(v) => Value::I64(v),
        Local::F32(v) => Value::F32(v),
        Local::F64(v) => Value::F64(v),
        Local::FuncRef(_) => Value::FuncRef(FuncRef::Null),
        Local::ExternRef(v) => Value::ExternRef(v),
    }
}

// Locates the function to queue for the first `run()`: the `start` section
// if the module declares one, else an exported function named `_start` or
// `start` (checked in that order), else none.
fn entry_function<A: Allocator>(module: &Module<A>) -> Option<u32> {
    if let Some(start) = &module.startsec {
        return Some(*start.as_ref().as_ref());
    }
    for name in ["_start", "start"] {
        let found = module.exportsec.iter().find_map(|export| match export.descriptor {
            ExportDescriptor::Function(idx) if name_str(&export.field) == name => Some(*idx),
            _ => None,
        });
        if found.is_some() {
            return found;
        }
    }
    None
}

fn signatures_match<A: Allocator>(a: &FunctionType<A>, b: &FunctionType<A>) -> bool {
    a.parameters.len() == b.parameters.len()
        && a.results.len() == b.results.len()
        && a.parameters.iter().zip(b.parameters.iter()).all(|(x, y)| x == y)
        && a.results.iter().zip(b.results.iter()).all(|(x, y)| x == y)
}

// Evaluates a constant expression (the only kind legal in global
// initializers and segment offsets): a single instruction followed by
// `end`.
fn eval_const_expr<A: Allocator>(expr: &Expression<A>, globals: &[Value]) -> Result<Value, Trap> {
    let mut cursor = ExprCursor::new(expr);
    let op = cursor.read_opcode();
    let value = match op {
        Opcode::I32Const => Value::I32(cursor.read_i32()),
        Opcode::I64Const => Value::I64(cursor.read_i64()),
        Opcode::F32Const => Value::F32(cursor.read_f32()),
        Opcode::F64Const => Value::F64(cursor.read_f64()),
        Opcode::GlobalGet => {
            let idx = cursor.read_u32();
            *globals.get(idx as usize).ok_or(Trap::StackTypeMismatch)?
        }
        Opcode::RefNull => match cursor.read_ref_type() {
            RefType::Func => Value::FuncRef(FuncRef::Null),
            RefType::Extern => Value::ExternRef(None),
        },
        Opcode::RefFunc => Value::FuncRef(FuncRef::Index(cursor.read_u32())),
        _ => return Err(Trap::StackTypeMismatch),
    };
    Ok(value)
}

fn elem_values<A: Allocator + Clone>(
    elem: &crate::types::ElementSegment<A>,
    globals: &[Value],
    alloc: &A,
) -> Result<Vec<Value, A>, Trap> {
    let mut out = Vec::new_in(alloc.clone());
    match &elem.init {
        ElementInit::FunctionIndices(funcs) => {
            out.try_reserve_exact(funcs.len())
                .map_err(|_| Trap::AllocationFailure)?;
            for f in funcs.iter() {
                out.push(Value::FuncRef(FuncRef::Index(*f.as_ref())));
            }
        }
        ElementInit::Expressions(exprs) => {
            out.try_reserve_exact(exprs.len())
                .map_err(|_| Trap::AllocationFailure)?;
            for e in exprs.iter() {
                out.push(eval_const_expr(e, globals)?);
            }
        }
    }
    Ok(out)
}

fn i32_div_s(a: i32, b: i32) -> Result<i32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    a.checked_div(b).ok_or(Trap::IntegerOverflow)
}

fn i32_div_u(a: i32, b: i32) -> Result<i32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(((a as u32) / (b as u32)) as i32)
}

fn i32_rem_s(a: i32, b: i32) -> Result<i32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a.wrapping_rem(b))
}

fn i32_rem_u(a: i32, b: i32) -> Result<i32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(((a as u32) % (b as u32)) as i32)
}

fn i64_div_s(a: i64, b: i64) -> Result<i64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    a.checked_div(b).ok_or(Trap::IntegerOverflow)
}

fn i64_div_u(a: i64, b: i64) -> Result<i64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(((a as u64) / (b as u64)) as i64)
}

fn i64_rem_s(a: i64, b: i64) -> Result<i64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a.wrapping_rem(b))
}

fn i64_rem_u(a: i64, b: i64) -> Result<i64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(((a as u64) % (b as u64)) as i64)
}

fn wasm_min_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else {
        a.min(b)
    }
}

fn wasm_max_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else {
        a.max(b)
    }
}

fn wasm_min_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn wasm_max_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

fn round_ties_even_f32(a: f32) -> f32 {
    let r = a.round();
    if (a - a.trunc()).abs() == 0.5 && (r as i64) % 2 != 0 {
        r - a.signum()
    } else {
        r
    }
}

fn round_ties_even_f64(a: f64) -> f64 {
    let r = a.round();
    if (a - a.trunc()).abs() == 0.5 && (r as i64) % 2 != 0 {
        r - a.signum()
    } else {
        r
    }
}

fn i32_trunc_f32_s(a: f32) -> Result<i32, Trap> {
    if a.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    if a < -2147483648.0 || a >= 2147483648.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(a as i32)
}

fn i32_trunc_f32_u(a: f32) -> Result<i32, Trap> {
    if a.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    if a <= -1.0 || a >= 4294967296.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok((a as u32) as i32)
}

fn i32_trunc_f64_s(a: f64) -> Result<i32, Trap> {
    if a.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    if a < -2147483648.0 || a >= 2147483648.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(a as i32)
}

fn i32_trunc_f64_u(a: f64) -> Result<i32, Trap> {
    if a.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    if a <= -1.0 || a >= 4294967296.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok((a as u32) as i32)
}

fn i64_trunc_f32_s(a: f32) -> Result<i64, Trap> {
    if a.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    if a < -9223372036854775808.0 || a >= 9223372036854775808.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(a as i64)
}

fn i64_trunc_f32_u(a: f32) -> Result<i64, Trap> {
    if a.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    if a <= -1.0 || a >= 18446744073709551616.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok((a as u64) as i64)
}

fn i64_trunc_f64_s(a: f64) -> Result<i64, Trap> {
    if a.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    if a < -9223372036854775808.0 || a >= 9223372036854775808.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(a as i64)
}

fn i64_trunc_f64_u(a: f64) -> Result<i64, Trap> {
    if a.is_nan() {
        return Err(Trap::InvalidConversionToInteger);
    }
    if a <= -1.0 || a >= 18446744073709551616.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok((a as u64) as i64)
}
