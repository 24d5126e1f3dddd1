// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Host function dispatch: the interface through which an embedder supplies
//! builtin implementations for a module's imported functions.

use crate::Allocator;
use crate::exec::value::Value;
use crate::exec::{Interpreter, Trap};

/// What a builtin call did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuiltinOutcome {
    /// The builtin ran to completion; its result (if any) has been pushed.
    Done,
    /// The builtin wants to yield cooperatively; the interpreter should
    /// report [`crate::exec::RunOutcome::Suspended`] and leave itself
    /// re-enterable.
    Suspend,
    /// The builtin wants to stop the whole run early.
    Quit,
}

/// A registered host function: a name matched against import field names at
/// link time, and the function to invoke.
pub struct Builtin<A: Allocator> {
    pub name: &'static str,
    pub func: for<'a, 'm> fn(&mut BuiltinContext<'a, 'm, A>) -> Result<BuiltinOutcome, Trap>,
}

/// The view a builtin gets of the interpreter while it runs: its arguments
/// (the callee's locals, which are exactly the typed parameters for an
/// imported function), a place to leave a return value, and validated access
/// to linear memory.
pub struct BuiltinContext<'a, 'm, A: Allocator> {
    pub(crate) interp: &'a mut Interpreter<'m, A>,
    pub(crate) args: &'a [Value],
    pub(crate) result: Option<Value>,
}

impl<'a, 'm, A: Allocator + Clone> BuiltinContext<'a, 'm, A> {
    /// Fetches the i-th parameter of this call.
    pub fn arg(&self, i: usize) -> Option<Value> {
        self.args.get(i).copied()
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Leaves a return value for the call site.
    pub fn set_result(&mut self, value: Value) {
        self.result = Some(value);
    }

    /// A validated host-side slice of guest memory, or a trap on
    /// out-of-range access.
    pub fn mem_slice(&self, ptr: u32, len: u32) -> Result<&[u8], Trap> {
        self.interp.memory()?.slice(ptr, len)
    }

    pub fn mem_slice_mut(&mut self, ptr: u32, len: u32) -> Result<&mut [u8], Trap> {
        self.interp.memory_mut()?.slice_mut(ptr, len)
    }

    /// A validated host-side slice up to (excluding) the first NUL byte.
    pub fn mem_cstr(&self, ptr: u32) -> Result<&[u8], Trap> {
        self.interp.memory()?.cstr(ptr)
    }

    /// Sets the cooperative-cancellation flag observed at the next
    /// instruction dispatch.
    pub fn request_quit(&mut self) {
        self.interp.quitting = true;
    }
}
