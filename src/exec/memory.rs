// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Linear memory: a contiguous byte arena grown in 64KiB pages.

use crate::core_compat::vec::Vec;
use crate::exec::Trap;
use crate::types::MemType;
use crate::Allocator;

/// Address zero is reserved as a null sentinel by this implementation, a
/// deliberate deviation from the WebAssembly standard (which permits address
/// 0) inherited from the source this crate is based on. See the design
/// notes on extension points.
const NULL_ADDRESS_RESERVED: u32 = 0;

pub(crate) struct LinearMemory<A: Allocator> {
    bytes: Vec<u8, A>,
    max_pages: Option<u32>,
    hard_cap_pages: u32,
}

impl<A: Allocator> LinearMemory<A> {
    pub(crate) fn new(ty: MemType, hard_cap_pages: u32, alloc: A) -> Result<Self, Trap> {
        let min_pages = ty.min_size_bytes() / MemType::PAGE_SIZE;
        if min_pages as u32 > hard_cap_pages {
            return Err(Trap::MemoryCapExceeded);
        }
        let mut bytes = Vec::new_in(alloc);
        bytes
            .try_reserve_exact(min_pages * MemType::PAGE_SIZE)
            .map_err(|_| Trap::AllocationFailure)?;
        bytes.resize(min_pages * MemType::PAGE_SIZE, 0);
        Ok(Self {
            bytes,
            max_pages: ty.max_size_bytes().map(|b| (b / MemType::PAGE_SIZE) as u32),
            hard_cap_pages,
        })
    }

    pub(crate) fn page_count(&self) -> u32 {
        (self.bytes.len() / MemType::PAGE_SIZE) as u32
    }

    /// `memory.grow`: either grows by exactly `delta` pages and returns the
    /// prior page count, or leaves memory unchanged and returns `None`.
    pub(crate) fn grow(&mut self, delta: u32) -> Option<u32> {
        let current = self.page_count();
        let target = current.checked_add(delta)?;
        if target > self.hard_cap_pages {
            return None;
        }
        if let Some(max) = self.max_pages
            && target > max
        {
            return None;
        }
        let new_len = (target as usize) * MemType::PAGE_SIZE;
        if self.bytes.try_reserve_exact(new_len - self.bytes.len()).is_err() {
            return None;
        }
        self.bytes.resize(new_len, 0);
        Some(current)
    }

    // Bounds-checks without the address-0 reservation below. Data-segment
    // initialization goes through this: it's a direct copy into the backing
    // bytes, not a guest-observable load/store, so address 0 is a plain,
    // usable offset for it just as it is upstream.
    fn bounds_checked_range(&self, addr: u32, size: u32) -> Result<core::ops::Range<usize>, Trap> {
        let end = addr.checked_add(size).ok_or(Trap::OutOfBoundsMemoryAccess)?;
        if (end as usize) > self.bytes.len() {
            return Err(Trap::OutOfBoundsMemoryAccess);
        }
        Ok((addr as usize)..(end as usize))
    }

    fn checked_range(&self, addr: u32, size: u32) -> Result<core::ops::Range<usize>, Trap> {
        if addr == NULL_ADDRESS_RESERVED {
            return Err(Trap::NullMemoryAccess);
        }
        self.bounds_checked_range(addr, size)
    }

    pub(crate) fn read(&self, addr: u32, out: &mut [u8]) -> Result<(), Trap> {
        let range = self.checked_range(addr, out.len() as u32)?;
        out.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    pub(crate) fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Trap> {
        let range = self.checked_range(addr, data.len() as u32)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn copy_within(&mut self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let src_range = self.checked_range(src, len)?;
        let dst_range = self.checked_range(dst, len)?;
        self.bytes.copy_within(src_range, dst_range.start);
        Ok(())
    }

    pub(crate) fn fill(&mut self, addr: u32, value: u8, len: u32) -> Result<(), Trap> {
        let range = self.checked_range(addr, len)?;
        self.bytes[range].fill(value);
        Ok(())
    }

    pub(crate) fn init_from(&mut self, dst: u32, data: &[u8], src: u32, len: u32) -> Result<(), Trap> {
        let range = self.bounds_checked_range(dst, len)?;
        let src_range = (src as usize)..((src as usize) + (len as usize));
        let src_slice = data
            .get(src_range)
            .ok_or(Trap::OutOfBoundsMemoryAccess)?;
        self.bytes[range].copy_from_slice(src_slice);
        Ok(())
    }

    /// A validated host-side slice into guest memory, or a trap on
    /// out-of-range access. Used by builtins via [`crate::exec::BuiltinContext`].
    pub(crate) fn slice(&self, addr: u32, len: u32) -> Result<&[u8], Trap> {
        let range = self.checked_range(addr, len)?;
        Ok(&self.bytes[range])
    }

    pub(crate) fn slice_mut(&mut self, addr: u32, len: u32) -> Result<&mut [u8], Trap> {
        let range = self.checked_range(addr, len)?;
        Ok(&mut self.bytes[range])
    }

    pub(crate) fn cstr(&self, addr: u32) -> Result<&[u8], Trap> {
        if addr == NULL_ADDRESS_RESERVED {
            return Err(Trap::NullMemoryAccess);
        }
        let start = addr as usize;
        let rest = self.bytes.get(start..).ok_or(Trap::OutOfBoundsMemoryAccess)?;
        let len = rest.iter().position(|&b| b == 0).ok_or(Trap::OutOfBoundsMemoryAccess)?;
        Ok(&rest[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_compat::alloc::Global;
    use crate::types::Limits;

    fn mem(min: u32, max: Option<u32>) -> LinearMemory<Global> {
        let ty = MemType::new(Limits { min, max });
        LinearMemory::new(ty, 512, Global).unwrap()
    }

    #[test]
    fn address_zero_is_reserved() {
        let m = mem(1, None);
        assert_eq!(m.read(0, &mut [0u8; 1]), Err(Trap::NullMemoryAccess));
        assert_eq!(m.cstr(0), Err(Trap::NullMemoryAccess));
    }

    #[test]
    fn init_from_is_not_null_guarded() {
        // Data-segment/`memory.init` initialization is a direct copy, not a
        // guest load/store, so it may target address 0 unlike `read`/`write`.
        let mut m = mem(1, None);
        m.init_from(0, &[1, 2, 3, 4], 0, 4).unwrap();
        // Address 0 can't be read back through the guarded `read` API, so
        // check the backing bytes directly (same module, private field).
        assert_eq!(&m.bytes[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds_access_traps() {
        let m = mem(1, None);
        let mut buf = [0u8; 4];
        assert_eq!(
            m.read(MemType::PAGE_SIZE as u32 - 2, &mut buf),
            Err(Trap::OutOfBoundsMemoryAccess),
        );
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut m = mem(1, None);
        m.write(4, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        m.read(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn copy_within_moves_bytes() {
        let mut m = mem(1, None);
        m.write(4, &[9, 9, 9, 9]).unwrap();
        m.copy_within(100, 4, 4).unwrap();
        let mut buf = [0u8; 4];
        m.read(100, &mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9, 9]);
    }

    #[test]
    fn grow_respects_declared_max() {
        let mut m = mem(1, Some(1));
        assert_eq!(m.grow(1), None);
        assert_eq!(m.page_count(), 1);
    }

    #[test]
    fn grow_respects_hard_cap() {
        let mut m = LinearMemory::new(MemType::new(Limits { min: 1, max: None }), 1, Global).unwrap();
        assert_eq!(m.grow(1), None);
    }

    #[test]
    fn grow_succeeds_within_limits() {
        let mut m = mem(1, Some(4));
        assert_eq!(m.grow(2), Some(1));
        assert_eq!(m.page_count(), 3);
    }

    #[test]
    fn cstr_finds_nul_terminator() {
        let mut m = mem(1, None);
        m.write(8, b"hi\0").unwrap();
        assert_eq!(m.cstr(8).unwrap(), b"hi");
    }
}
