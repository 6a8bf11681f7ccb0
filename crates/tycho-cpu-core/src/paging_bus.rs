//! Paging-aware linear memory accesses.
//!
//! Guest code addresses memory with *linear* addresses. [`PagingBus`] owns
//! the [`Mmu`] and a physical memory backend and performs the architectural
//! access semantics on top of them:
//!
//! - single-page accesses translate once and go straight to the backend (or
//!   through the TLB's cached host pointer when one is available);
//! - accesses that cross a page boundary translate **every** page before any
//!   byte moves, so a fault on a later page leaves both the destination
//!   buffer and guest memory untouched;
//! - bytes are assembled low-address-first into low buffer indices, which is
//!   the guest's little-endian order on any host;
//! - read-modify-write accesses go through [`PagingBus::write_intent`], which
//!   reads with write translation semantics so write protection faults
//!   before the read half of the operation.

use core::ptr;

use tycho_mmu::{AccessType, MemoryBus, Mmu, TranslateFault};

use crate::exception::Exception;

const PAGE_SIZE: u64 = 4096;

/// A paging-aware linear-memory bus backed by [`Mmu`].
pub struct PagingBus<B> {
    mmu: Mmu,
    phys: B,
    cpl: u8,
    // Scratch for multi-page accesses: (paddr, len, buffer offset) per page,
    // collected before any data is moved.
    chunks: Vec<(u64, usize, usize)>,
}

impl<B> PagingBus<B> {
    pub fn new(phys: B) -> Self {
        Self {
            mmu: Mmu::new(),
            phys,
            cpl: 0,
            chunks: Vec::new(),
        }
    }

    #[inline]
    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    #[inline]
    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    #[inline]
    pub fn inner(&self) -> &B {
        &self.phys
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.phys
    }

    #[inline]
    pub fn into_inner(self) -> B {
        self.phys
    }

    #[inline]
    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    /// Current privilege level used for permission checks. Only CPL 3 is
    /// "user"; 0..=2 are supervisor.
    #[inline]
    pub fn set_cpl(&mut self, cpl: u8) {
        debug_assert!(cpl <= 3);
        self.cpl = cpl;
    }

    /// INVLPG: invalidates the TLB slot indexed by `laddr`.
    ///
    /// Outside real mode the instruction is privileged; CPL != 0 raises
    /// #GP(0) and leaves the TLB alone. The caller resolves the effective
    /// address (segment base included) before calling.
    pub fn invlpg(&mut self, laddr: u64) -> Result<(), Exception> {
        if self.mmu.protected_mode() && self.cpl != 0 {
            tracing::trace!("INVLPG at CPL {}, raising #GP(0)", self.cpl);
            return Err(Exception::gp0());
        }
        self.mmu.invlpg(laddr);
        Ok(())
    }
}

impl<B: MemoryBus> PagingBus<B> {
    #[inline]
    fn translate(&mut self, laddr: u64, access: AccessType) -> Result<u64, Exception> {
        match self.mmu.translate(&mut self.phys, laddr, access, self.cpl) {
            Ok(paddr) => Ok(paddr),
            Err(TranslateFault::PageFault(pf)) => Err(Exception::PageFault {
                addr: pf.addr,
                error_code: pf.error_code,
            }),
            Err(TranslateFault::NonCanonical(_)) => Err(Exception::gp0()),
        }
    }

    fn read_u8_access(&mut self, laddr: u64, access: AccessType) -> Result<u8, Exception> {
        if let Some(page) = self.mmu.host_fast_path(laddr, access, self.cpl) {
            let off = (laddr & (PAGE_SIZE - 1)) as usize;
            // Safety: the pointer-permission bit guarantees the cached
            // pointer covers this whole page (MemoryBus::host_page contract).
            return Ok(unsafe { *page.as_ptr().add(off) });
        }
        let paddr = self.translate(laddr, access)?;
        Ok(self.phys.read_u8(paddr))
    }

    fn read_u16_access(&mut self, laddr: u64, access: AccessType) -> Result<u16, Exception> {
        let mut buf = [0u8; 2];
        self.read_bytes_access(laddr, &mut buf, access)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_access(&mut self, laddr: u64, access: AccessType) -> Result<u32, Exception> {
        let mut buf = [0u8; 4];
        self.read_bytes_access(laddr, &mut buf, access)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_access(&mut self, laddr: u64, access: AccessType) -> Result<u64, Exception> {
        let mut buf = [0u8; 8];
        self.read_bytes_access(laddr, &mut buf, access)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_bytes_access(
        &mut self,
        laddr: u64,
        dst: &mut [u8],
        access: AccessType,
    ) -> Result<(), Exception> {
        if dst.is_empty() {
            return Ok(());
        }

        let page_off = (laddr & (PAGE_SIZE - 1)) as usize;
        if page_off + dst.len() <= PAGE_SIZE as usize {
            if let Some(page) = self.mmu.host_fast_path(laddr, access, self.cpl) {
                // Safety: see read_u8_access.
                unsafe {
                    ptr::copy_nonoverlapping(
                        page.as_ptr().add(page_off),
                        dst.as_mut_ptr(),
                        dst.len(),
                    );
                }
                return Ok(());
            }
            let paddr = self.translate(laddr, access)?;
            self.phys.read_bytes(paddr, dst);
            return Ok(());
        }

        // Crosses a page boundary: translate every page up front so a fault
        // on a later page leaves `dst` untouched.
        self.chunks.clear();
        let mut offset = 0usize;
        while offset < dst.len() {
            let addr = laddr.wrapping_add(offset as u64);
            let paddr = self.translate(addr, access)?;
            let page_rem = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
            let chunk = page_rem.min(dst.len() - offset);
            self.chunks.push((paddr, chunk, offset));
            offset += chunk;
        }

        let phys = &mut self.phys;
        for &(paddr, len, off) in self.chunks.iter() {
            phys.read_bytes(paddr, &mut dst[off..off + len]);
        }
        Ok(())
    }

    fn write_bytes_access(
        &mut self,
        laddr: u64,
        src: &[u8],
        access: AccessType,
    ) -> Result<(), Exception> {
        if src.is_empty() {
            return Ok(());
        }

        let page_off = (laddr & (PAGE_SIZE - 1)) as usize;
        if page_off + src.len() <= PAGE_SIZE as usize {
            if let Some(page) = self.mmu.host_fast_path(laddr, access, self.cpl) {
                // Safety: a write-pointer permission bit is only cached for
                // pages whose host pointer was granted for writing.
                unsafe {
                    ptr::copy_nonoverlapping(src.as_ptr(), page.as_ptr().add(page_off), src.len());
                }
                return Ok(());
            }
            let paddr = self.translate(laddr, access)?;
            self.phys.write_bytes(paddr, src);
            return Ok(());
        }

        // Both (all) translations happen before guest memory changes.
        self.chunks.clear();
        let mut offset = 0usize;
        while offset < src.len() {
            let addr = laddr.wrapping_add(offset as u64);
            let paddr = self.translate(addr, access)?;
            let page_rem = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
            let chunk = page_rem.min(src.len() - offset);
            self.chunks.push((paddr, chunk, offset));
            offset += chunk;
        }

        let phys = &mut self.phys;
        for &(paddr, len, off) in self.chunks.iter() {
            phys.write_bytes(paddr, &src[off..off + len]);
        }
        Ok(())
    }

    pub fn read_u8(&mut self, laddr: u64) -> Result<u8, Exception> {
        self.read_u8_access(laddr, AccessType::Read)
    }

    pub fn read_u16(&mut self, laddr: u64) -> Result<u16, Exception> {
        self.read_u16_access(laddr, AccessType::Read)
    }

    pub fn read_u32(&mut self, laddr: u64) -> Result<u32, Exception> {
        self.read_u32_access(laddr, AccessType::Read)
    }

    pub fn read_u64(&mut self, laddr: u64) -> Result<u64, Exception> {
        self.read_u64_access(laddr, AccessType::Read)
    }

    pub fn write_u8(&mut self, laddr: u64, value: u8) -> Result<(), Exception> {
        self.write_bytes_access(laddr, &[value], AccessType::Write)
    }

    pub fn write_u16(&mut self, laddr: u64, value: u16) -> Result<(), Exception> {
        self.write_bytes_access(laddr, &value.to_le_bytes(), AccessType::Write)
    }

    pub fn write_u32(&mut self, laddr: u64, value: u32) -> Result<(), Exception> {
        self.write_bytes_access(laddr, &value.to_le_bytes(), AccessType::Write)
    }

    pub fn write_u64(&mut self, laddr: u64, value: u64) -> Result<(), Exception> {
        self.write_bytes_access(laddr, &value.to_le_bytes(), AccessType::Write)
    }

    pub fn read_bytes(&mut self, laddr: u64, dst: &mut [u8]) -> Result<(), Exception> {
        self.read_bytes_access(laddr, dst, AccessType::Read)
    }

    pub fn write_bytes(&mut self, laddr: u64, src: &[u8]) -> Result<(), Exception> {
        self.write_bytes_access(laddr, src, AccessType::Write)
    }

    /// Instruction fetch: a read that honors the NX bit.
    pub fn fetch_bytes(&mut self, laddr: u64, dst: &mut [u8]) -> Result<(), Exception> {
        self.read_bytes_access(laddr, dst, AccessType::Execute)
    }

    /// Adapter for read-modify-write instructions: reads translate with
    /// write semantics (setting accessed/dirty bits and faulting on
    /// write-protected pages up front), writes behave as usual.
    pub fn write_intent(&mut self) -> WriteIntent<'_, B> {
        WriteIntent { bus: self }
    }
}

/// See [`PagingBus::write_intent`].
pub struct WriteIntent<'a, B> {
    bus: &'a mut PagingBus<B>,
}

impl<B: MemoryBus> WriteIntent<'_, B> {
    pub fn read_u8(&mut self, laddr: u64) -> Result<u8, Exception> {
        self.bus.read_u8_access(laddr, AccessType::Write)
    }

    pub fn read_u16(&mut self, laddr: u64) -> Result<u16, Exception> {
        self.bus.read_u16_access(laddr, AccessType::Write)
    }

    pub fn read_u32(&mut self, laddr: u64) -> Result<u32, Exception> {
        self.bus.read_u32_access(laddr, AccessType::Write)
    }

    pub fn read_u64(&mut self, laddr: u64) -> Result<u64, Exception> {
        self.bus.read_u64_access(laddr, AccessType::Write)
    }

    pub fn read_bytes(&mut self, laddr: u64, dst: &mut [u8]) -> Result<(), Exception> {
        self.bus.read_bytes_access(laddr, dst, AccessType::Write)
    }

    pub fn write_u8(&mut self, laddr: u64, value: u8) -> Result<(), Exception> {
        self.bus.write_u8(laddr, value)
    }

    pub fn write_u16(&mut self, laddr: u64, value: u16) -> Result<(), Exception> {
        self.bus.write_u16(laddr, value)
    }

    pub fn write_u32(&mut self, laddr: u64, value: u32) -> Result<(), Exception> {
        self.bus.write_u32(laddr, value)
    }

    pub fn write_u64(&mut self, laddr: u64, value: u64) -> Result<(), Exception> {
        self.bus.write_u64(laddr, value)
    }

    pub fn write_bytes(&mut self, laddr: u64, src: &[u8]) -> Result<(), Exception> {
        self.bus.write_bytes(laddr, src)
    }
}
