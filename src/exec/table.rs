// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Table instances: resizable vectors of reference values.

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::exec::Trap;
use crate::exec::value::{FuncRef, Value};
use crate::types::{RefType, TableType};

pub(crate) struct TableInstance<A: Allocator> {
    reftype: RefType,
    elems: Vec<Value, A>,
    max: Option<u32>,
}

impl<A: Allocator> TableInstance<A> {
    pub(crate) fn new(ty: TableType, alloc: A) -> Result<Self, Trap> {
        let null = match ty.reftype {
            RefType::Func => Value::FuncRef(FuncRef::Null),
            RefType::Extern => Value::ExternRef(None),
        };
        let mut elems = Vec::new_in(alloc);
        elems
            .try_reserve_exact(ty.limits.min as usize)
            .map_err(|_| Trap::AllocationFailure)?;
        elems.resize(ty.limits.min as usize, null);
        Ok(Self {
            reftype: ty.reftype,
            elems,
            max: ty.limits.max,
        })
    }

    pub(crate) fn reftype(&self) -> RefType {
        self.reftype
    }

    pub(crate) fn len(&self) -> u32 {
        self.elems.len() as u32
    }

    pub(crate) fn get(&self, idx: u32) -> Result<Value, Trap> {
        self.elems
            .get(idx as usize)
            .copied()
            .ok_or(Trap::TableIndexOutOfBounds)
    }

    pub(crate) fn set(&mut self, idx: u32, value: Value) -> Result<(), Trap> {
        let slot = self
            .elems
            .get_mut(idx as usize)
            .ok_or(Trap::TableIndexOutOfBounds)?;
        *slot = value;
        Ok(())
    }

    pub(crate) fn grow(&mut self, delta: u32, init: Value) -> Option<u32> {
        let current = self.len();
        let target = current.checked_add(delta)?;
        if let Some(max) = self.max
            && target > max
        {
            return None;
        }
        if self
            .elems
            .try_reserve_exact((delta as usize).saturating_sub(0))
            .is_err()
        {
            return None;
        }
        self.elems.resize(target as usize, init);
        Some(current)
    }

    pub(crate) fn fill(&mut self, idx: u32, value: Value, len: u32) -> Result<(), Trap> {
        let end = idx.checked_add(len).ok_or(Trap::TableIndexOutOfBounds)?;
        if (end as usize) > self.elems.len() {
            return Err(Trap::TableIndexOutOfBounds);
        }
        self.elems[(idx as usize)..(end as usize)].fill(value);
        Ok(())
    }

    pub(crate) fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let src_end = src.checked_add(len).ok_or(Trap::TableIndexOutOfBounds)?;
        let dst_end = dst.checked_add(len).ok_or(Trap::TableIndexOutOfBounds)?;
        if (src_end as usize) > self.elems.len() || (dst_end as usize) > self.elems.len() {
            return Err(Trap::TableIndexOutOfBounds);
        }
        self.elems
            .copy_within((src as usize)..(src_end as usize), dst as usize);
        Ok(())
    }

    pub(crate) fn init_from(&mut self, dst: u32, src_vals: &[Value], src: u32, len: u32) -> Result<(), Trap> {
        let dst_end = dst.checked_add(len).ok_or(Trap::TableIndexOutOfBounds)?;
        if (dst_end as usize) > self.elems.len() {
            return Err(Trap::TableIndexOutOfBounds);
        }
        let src_range = (src as usize)..((src as usize) + (len as usize));
        let src_slice = src_vals.get(src_range).ok_or(Trap::TableIndexOutOfBounds)?;
        self.elems[(dst as usize)..(dst_end as usize)].copy_from_slice(src_slice);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_compat::alloc::Global;
    use crate::types::Limits;

    fn table(min: u32, max: Option<u32>) -> TableInstance<Global> {
        let ty = TableType {
            reftype: RefType::Func,
            limits: Limits { min, max },
        };
        TableInstance::new(ty, Global).unwrap()
    }

    #[test]
    fn new_table_is_filled_with_null_refs() {
        let t = table(3, None);
        assert_eq!(t.len(), 3);
        assert_eq!(t.get(0).unwrap(), Value::FuncRef(FuncRef::Null));
        assert_eq!(t.get(2).unwrap(), Value::FuncRef(FuncRef::Null));
    }

    #[test]
    fn get_out_of_bounds_traps() {
        let t = table(1, None);
        assert_eq!(t.get(1), Err(Trap::TableIndexOutOfBounds));
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut t = table(2, None);
        t.set(1, Value::FuncRef(FuncRef::Index(7))).unwrap();
        assert_eq!(t.get(1).unwrap(), Value::FuncRef(FuncRef::Index(7)));
    }

    #[test]
    fn grow_respects_declared_max() {
        let mut t = table(1, Some(1));
        assert_eq!(t.grow(1, Value::FuncRef(FuncRef::Null)), None);
    }

    #[test]
    fn grow_extends_with_init_value() {
        let mut t = table(1, Some(4));
        let prior = t.grow(2, Value::FuncRef(FuncRef::Index(5))).unwrap();
        assert_eq!(prior, 1);
        assert_eq!(t.len(), 3);
        assert_eq!(t.get(1).unwrap(), Value::FuncRef(FuncRef::Index(5)));
        assert_eq!(t.get(2).unwrap(), Value::FuncRef(FuncRef::Index(5)));
    }

    #[test]
    fn copy_within_out_of_bounds_traps() {
        let mut t = table(2, None);
        assert_eq!(
            t.copy_within(0, 0, 3),
            Err(Trap::TableIndexOutOfBounds),
        );
    }

    #[test]
    fn fill_writes_range() {
        let mut t = table(4, None);
        t.fill(1, Value::FuncRef(FuncRef::Index(9)), 2).unwrap();
        assert_eq!(t.get(0).unwrap(), Value::FuncRef(FuncRef::Null));
        assert_eq!(t.get(1).unwrap(), Value::FuncRef(FuncRef::Index(9)));
        assert_eq!(t.get(2).unwrap(), Value::FuncRef(FuncRef::Index(9)));
        assert_eq!(t.get(3).unwrap(), Value::FuncRef(FuncRef::Null));
    }
}
