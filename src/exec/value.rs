// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Runtime values manipulated by the stack machine.

use crate::types::ValType;

/// A function reference: null, an index into the module's function table, or
/// (as an explicit, non-standard extension point) a host builtin slot.
///
/// The builtin variant exists so that host code can populate a table entry
/// that dispatches to a builtin via `call_indirect`, mirroring the source's
/// use of a negative synthetic address. It is only reachable when
/// [`crate::exec::Limits::allow_builtin_refs`] is set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FuncRef {
    Null,
    Index(u32),
    Builtin(u32),
}

/// A runtime value, tagged by its WebAssembly type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    FuncRef(FuncRef),
    /// An opaque host reference; `None` is the null externref.
    ExternRef(Option<u32>),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::FuncRef(_) => ValType::FuncRef,
            Value::ExternRef(_) => ValType::ExternRef,
        }
    }

    pub fn default_for(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
            ValType::FuncRef => Value::FuncRef(FuncRef::Null),
            ValType::ExternRef => Value::ExternRef(None),
            ValType::Vec => unreachable!("vector valtype is rejected at decode time"),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null_ref(&self) -> bool {
        matches!(
            self,
            Value::FuncRef(FuncRef::Null) | Value::ExternRef(None)
        )
    }
}
