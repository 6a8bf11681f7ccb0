//! x86/x86-64 paging unit: linear → physical translation with a software TLB.
//!
//! This crate implements the four translation modes of the IA-32/AMD64
//! memory-management architecture:
//!
//! - No paging (identity mapping, with a "flat" TLB kept for host pointers)
//! - 32-bit paging (4KB pages, plus 4MB pages when CR4.PSE is set)
//! - PAE paging (4KB / 2MB pages)
//! - 4-level long-mode paging (4KB / 2MB pages) with canonical checks
//!
//! Translations are cached in a direct-mapped [`Tlb`] whose entries carry a
//! permission bitmap, so the hot path is one frame compare and one bit probe.
//! A failed probe never faults from the cache: the engine rewalks the page
//! tables and lets the walk either widen the cached permissions (for example
//! the first write to a clean page, which must set the dirty bit) or raise
//! the fault with an up-to-date error code.
//!
//! Physical addresses are assumed to fit in 32 bits: a present walk entry
//! with address bits 51:32 set panics, since that is a configuration mismatch
//! between the guest and this engine rather than a guest error.

mod priv_check;
mod tlb;

#[cfg(test)]
mod test_util;
#[cfg(test)]
mod tests;

use core::ptr::NonNull;

use priv_check::PrivCheckTable;
pub use tlb::{
    Tlb, TlbEntry, TLB_GLOBAL_PAGE, TLB_NX_PAGE, TLB_READ_SYS_OK, TLB_READ_SYS_PTR_OK,
    TLB_READ_USER_OK, TLB_READ_USER_PTR_OK, TLB_SIZE, TLB_WRITE_SYS_OK, TLB_WRITE_SYS_PTR_OK,
    TLB_WRITE_USER_OK, TLB_WRITE_USER_PTR_OK,
};

/// Physical memory access used for page-table walks and data transfers.
///
/// Walk reads and accessed/dirty write-backs use the typed 4- and 8-byte
/// accessors; data moves use the bulk accessors. The default bulk
/// implementations fall back to byte-at-a-time access; backends are
/// encouraged to override them.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8;
    fn read_u16(&mut self, paddr: u64) -> u16;
    fn read_u32(&mut self, paddr: u64) -> u32;
    fn read_u64(&mut self, paddr: u64) -> u64;

    fn write_u8(&mut self, paddr: u64, value: u8);
    fn write_u16(&mut self, paddr: u64, value: u16);
    fn write_u32(&mut self, paddr: u64, value: u32);
    fn write_u64(&mut self, paddr: u64, value: u64);

    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u64));
        }
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u64), byte);
        }
    }

    /// Direct host pointer to the 4KiB physical page starting at `ppf`, or
    /// `None` to veto direct access (MMIO, ROM, unmapped, ...).
    ///
    /// A returned pointer must stay valid for the lifetime of the bus and
    /// cover the full page; when `access` is [`AccessType::Write`] the page
    /// must be writable through it. The engine caches the pointer in the TLB
    /// and may read or write through it without further calls.
    #[inline]
    fn host_page(&mut self, ppf: u64, access: AccessType) -> Option<NonNull<u8>> {
        let _ = (ppf, access);
        None
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        <T as MemoryBus>::read_u8(self, paddr)
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        <T as MemoryBus>::read_u16(self, paddr)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        <T as MemoryBus>::read_u32(self, paddr)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        <T as MemoryBus>::read_u64(self, paddr)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        <T as MemoryBus>::write_u8(self, paddr, value)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        <T as MemoryBus>::write_u16(self, paddr, value)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        <T as MemoryBus>::write_u32(self, paddr, value)
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        <T as MemoryBus>::write_u64(self, paddr, value)
    }

    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        <T as MemoryBus>::read_bytes(self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        <T as MemoryBus>::write_bytes(self, paddr, src)
    }

    #[inline]
    fn host_page(&mut self, ppf: u64, access: AccessType) -> Option<NonNull<u8>> {
        <T as MemoryBus>::host_page(self, ppf, access)
    }
}

/// Kind of memory access being translated.
///
/// Instruction fetches are reads for the permission matrix, but additionally
/// honor the NX bit. Read-modify-write accesses translate as [`Write`]
/// (`AccessType::Write`) so write protection faults before any byte moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }
}

/// A translation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateFault {
    /// #PF, with CR2 already latched and the error code computed.
    PageFault(PageFault),
    /// Non-canonical linear address in long mode; raises #GP(0), not #PF.
    NonCanonical(u64),
}

/// #PF details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address (the CR2 value).
    pub addr: u64,
    /// Architectural error code.
    pub error_code: u32,
}

// Page-fault error code bits.
const ERR_PROTECTION: u32 = 1 << 0;
const ERR_WRITE: u32 = 1 << 1;
const ERR_USER: u32 = 1 << 2;
const ERR_RESERVED: u32 = 1 << 3;
const ERR_FETCH: u32 = 1 << 4;

/// Why a walk stopped before producing a frame. Protection faults are decided
/// later, from the combined access bits; the decode itself only rejects
/// structural problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultKind {
    NotPresent,
    Protection,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PagingMode {
    Disabled,
    Legacy32,
    Pae,
    Long4,
}

#[derive(Debug, Clone, Copy)]
struct WalkEntry {
    addr: u64,
    value: u64,
}

impl WalkEntry {
    const NONE: WalkEntry = WalkEntry { addr: 0, value: 0 };
}

/// Result of a successful walk decode. `entries[..len]` are the traversed
/// paging-structure entries in walk order; the last one is the leaf. No
/// guest memory has been written yet when a `Walk` is produced.
struct Walk {
    ppf: u64,
    /// Bit 1 = combined R/W, bit 2 = combined U/S (most restrictive level
    /// wins), bit 31 = leaf G bit when CR4.PGE is on.
    combined: u32,
    /// Some level had NX set (only possible with EFER.NXE enabled).
    nx: bool,
    /// Entries are 8 bytes wide (PAE/long) rather than 4.
    wide: bool,
    len: usize,
    entries: [WalkEntry; 4],
}

/// TLB statistics, available when the `stats` feature is enabled.
#[cfg(feature = "stats")]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub walks: u64,
    pub flush_global: u64,
    pub flush_non_global: u64,
    pub invlpg: u64,
}

const CR0_PE: u64 = 1 << 0;
const CR0_WP: u64 = 1 << 16;
const CR0_PG: u64 = 1 << 31;

const CR4_PSE: u64 = 1 << 4;
const CR4_PAE: u64 = 1 << 5;
const CR4_PGE: u64 = 1 << 7;

const EFER_LMA: u64 = 1 << 10;
const EFER_NXE: u64 = 1 << 11;

const PTE_P: u64 = 1 << 0;
const PTE_A: u64 = 1 << 5;
const PTE_D: u64 = 1 << 6;
const PTE_PS: u64 = 1 << 7;
const PTE_G: u64 = 1 << 8;
const PTE_NX: u64 = 1 << 63;

// U/S (bit 2) and R/W (bit 1), the two bits combined across levels.
const PTE_PERM_MASK: u64 = 0x06;

// Bits 7 and 8 must be clear in PML4 and PDPT entries (no 1GiB pages, G
// ignored at non-leaf levels).
const PML4_PDPTE_RESERVED: u64 = 0x180;

// Bits 21:13 of a 4MB PDE are reserved.
const LEGACY_4M_RESERVED: u64 = 0x003f_e000;

// Physical address bits 51:32 of a walk entry. The engine emulates a 32-bit
// physical address space; seeing these set is a configuration mismatch.
const PHYS_HIGH_BITS: u64 = 0x000f_ffff_0000_0000;

const ADDR_MASK64: u64 = 0x000f_ffff_ffff_f000;
const CR3_MASK_PAE32: u64 = 0xffff_ffe0;

const PAGE_OFFSET_MASK: u64 = 0xfff;

#[inline]
fn lpf_of(laddr: u64) -> u64 {
    laddr & !PAGE_OFFSET_MASK
}

#[inline]
fn is_canonical_48(laddr: u64) -> bool {
    // Bits 63:47 must be a sign extension of bit 47.
    (((laddr as i64) << 16) >> 16) as u64 == laddr
}

/// The paging unit of one emulated CPU.
///
/// Holds the paging-relevant control state (CR0/CR2/CR3/CR4/EFER), the
/// privilege decision table, and the TLB. Register writes must go through the
/// `set_*` hooks so the architectural TLB flushes happen.
#[derive(Debug, Clone)]
pub struct Mmu {
    cr0: u64,
    cr2: u64,
    cr3: u64,
    cr4: u64,
    efer: u64,
    /// CR3 with the mode-specific base mask applied (PAE-without-long-mode
    /// PDPTs are 32-byte aligned, everything else 4KiB).
    cr3_masked: u64,
    mode: PagingMode,
    priv_check: PrivCheckTable,
    tlb: Tlb,
    #[cfg(feature = "stats")]
    stats: MmuStats,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        let mut mmu = Self {
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            efer: 0,
            cr3_masked: 0,
            mode: PagingMode::Disabled,
            priv_check: PrivCheckTable::new(),
            tlb: Tlb::new(),
            #[cfg(feature = "stats")]
            stats: MmuStats::default(),
        };
        mmu.update_cached_state();
        mmu
    }

    #[inline]
    fn update_cached_state(&mut self) {
        self.mode = if self.cr0 & CR0_PG == 0 {
            PagingMode::Disabled
        } else if self.cr4 & CR4_PAE == 0 {
            PagingMode::Legacy32
        } else if self.efer & EFER_LMA != 0 {
            PagingMode::Long4
        } else {
            PagingMode::Pae
        };

        self.cr3_masked = if self.cr4 & CR4_PAE != 0 && self.efer & EFER_LMA == 0 {
            self.cr3 & CR3_MASK_PAE32
        } else {
            self.cr3 & ADDR_MASK64
        };
    }

    #[inline]
    pub fn cr0(&self) -> u64 {
        self.cr0
    }

    #[inline]
    pub fn cr2(&self) -> u64 {
        self.cr2
    }

    #[inline]
    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    #[inline]
    pub fn cr4(&self) -> u64 {
        self.cr4
    }

    #[inline]
    pub fn efer(&self) -> u64 {
        self.efer
    }

    /// CR2 is architecturally written by the CPU on #PF delivery; the engine
    /// latches it on every fault. Guest `MOV CR2` goes through here.
    #[inline]
    pub fn set_cr2(&mut self, value: u64) {
        self.cr2 = value;
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    #[inline]
    pub fn protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    #[inline]
    fn nx_enabled(&self) -> bool {
        self.efer & EFER_NXE != 0
    }

    #[inline]
    fn wp_enabled(&self) -> bool {
        self.cr0 & CR0_WP != 0
    }

    #[inline]
    fn pse_enabled(&self) -> bool {
        self.cr4 & CR4_PSE != 0
    }

    #[inline]
    fn pge_enabled(&self) -> bool {
        self.cr4 & CR4_PGE != 0
    }

    /// CR0 write hook. Changes to PG, WP or PE flush the whole TLB, global
    /// entries included: the cached permission bits bake in the CR0.WP value.
    pub fn set_cr0(&mut self, value: u64) {
        let changed = (self.cr0 ^ value) & (CR0_PG | CR0_WP | CR0_PE);
        self.cr0 = value;
        if changed != 0 {
            tracing::trace!("CR0 write changed paging bits {changed:#x}, flushing TLB");
            self.flush_tlb(true);
        }
        self.update_cached_state();
    }

    /// CR3 write hook. Architecturally this flushes non-global entries even
    /// when the value does not change.
    pub fn set_cr3(&mut self, value: u64) {
        tracing::trace!("CR3 write {value:#x}, flushing non-global TLB entries");
        self.flush_tlb(false);
        self.cr3 = value;
        self.update_cached_state();
    }

    /// CR4 write hook. Changes to PSE, PAE or PGE flush the whole TLB and
    /// re-derive the masked CR3 base.
    pub fn set_cr4(&mut self, value: u64) {
        let changed = (self.cr4 ^ value) & (CR4_PSE | CR4_PAE | CR4_PGE);
        self.cr4 = value;
        if changed != 0 {
            tracing::trace!("CR4 write changed paging bits {changed:#x}, flushing TLB");
            self.flush_tlb(true);
        }
        self.update_cached_state();
    }

    /// EFER write hook. LMA cannot change without a CR0.PG toggle (which
    /// flushes), and no TLB entry carries NX state cached under the other
    /// NXE value, so no flush is needed here.
    pub fn set_efer(&mut self, value: u64) {
        self.efer = value;
        self.update_cached_state();
    }

    /// Invalidates the single TLB slot indexed by `laddr`. Privilege checks
    /// for the INVLPG instruction belong to the caller; this is the TLB
    /// side effect only.
    pub fn invlpg(&mut self, laddr: u64) {
        #[cfg(feature = "stats")]
        {
            self.stats.invlpg += 1;
        }
        self.tlb.invalidate_page(laddr);
    }

    /// Flushes the TLB; global entries survive unless `invalidate_global`.
    pub fn flush_tlb(&mut self, invalidate_global: bool) {
        #[cfg(feature = "stats")]
        {
            if invalidate_global {
                self.stats.flush_global += 1;
            } else {
                self.stats.flush_non_global += 1;
            }
        }
        self.tlb.flush(invalidate_global);
    }

    /// Read-only view of the TLB for tests and debuggers.
    #[inline]
    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    #[cfg(feature = "stats")]
    #[inline]
    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    #[cfg(feature = "stats")]
    #[inline]
    pub fn reset_stats(&mut self) {
        self.stats = MmuStats::default();
    }

    /// Translate a linear address to a physical address for an `access` at
    /// privilege level `cpl` (only CPL 3 is "user"; 0..=2 are supervisor).
    ///
    /// On success the TLB caches the translation, accessed/dirty bits have
    /// been written back, and the returned address is the full physical
    /// address (frame plus page offset). On failure CR2 is latched, the
    /// faulting page's TLB slot is invalidated, and the fault is returned
    /// for delivery.
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        laddr: u64,
        access: AccessType,
        cpl: u8,
    ) -> Result<u64, TranslateFault> {
        debug_assert!(cpl <= 3);

        let laddr = match self.mode {
            PagingMode::Disabled => {
                // Long mode cannot be active without paging, so the linear
                // address space is 32-bit here.
                return Ok(self.flat_translate(bus, laddr & 0xffff_ffff, access));
            }
            PagingMode::Legacy32 | PagingMode::Pae => laddr as u32 as u64,
            PagingMode::Long4 => {
                if !is_canonical_48(laddr) {
                    return Err(TranslateFault::NonCanonical(laddr));
                }
                laddr
            }
        };

        let poffset = laddr & PAGE_OFFSET_MASK;

        #[cfg(feature = "stats")]
        {
            self.stats.lookups += 1;
        }

        let entry = self.tlb.entry(laddr);
        if entry.lpf == lpf_of(laddr) {
            if cached_permission_ok(entry.access_bits, access, cpl) {
                let paddr = entry.ppf | poffset;
                #[cfg(feature = "stats")]
                {
                    self.stats.hits += 1;
                }
                return Ok(paddr);
            }
            // The cached permission bits reject this access. Rewalk rather
            // than faulting from the cache: the tables may allow it (first
            // write after a read install, dirty bit still to be set) and
            // only the walk can tell.
        }

        #[cfg(feature = "stats")]
        {
            self.stats.misses += 1;
            self.stats.walks += 1;
        }

        let walk = match self.mode {
            PagingMode::Disabled => unreachable!("handled above"),
            PagingMode::Legacy32 => self.walk_legacy32(bus, laddr),
            PagingMode::Pae => self.walk_pae(bus, laddr),
            PagingMode::Long4 => self.walk_long4(bus, laddr),
        };
        let walk = match walk {
            Ok(walk) => walk,
            Err(kind) => return Err(self.page_fault(kind, laddr, access, cpl)),
        };

        let is_user = cpl == 3;
        let is_write = access.is_write();

        let priv_index = ((self.wp_enabled() as usize) << 4)
            | ((is_user as usize) << 3)
            | ((walk.combined & PTE_PERM_MASK as u32) as usize)
            | (is_write as usize);

        let nx_violation = walk.nx && access.is_execute();
        if !self.priv_check.allows(priv_index) || nx_violation {
            return Err(self.page_fault(FaultKind::Protection, laddr, access, cpl));
        }

        // The access is architecturally committed: write back accessed (and
        // dirty) bits before any guest data moves.
        self.commit_accessed_dirty(bus, &walk, is_write);

        let mut access_bits = self.seed_access_bits(&walk, is_write);
        let host = bus.host_page(walk.ppf, access);
        if host.is_some() {
            // Every permitted access is also permitted via the pointer.
            access_bits |= (access_bits & 0xff00) >> 8;
        }

        let slot = self.tlb.entry_mut(laddr);
        slot.lpf = lpf_of(laddr);
        slot.ppf = walk.ppf;
        slot.access_bits = access_bits;
        slot.set_host_page(host);

        Ok(walk.ppf | poffset)
    }

    /// Non-faulting translation for debuggers and disassemblers.
    ///
    /// Consults the TLB first, then decodes the page tables without updating
    /// accessed/dirty bits, CR2, or the TLB. Permissions are not checked: the
    /// caller wants the mapping, not an access decision.
    pub fn lookup_phys(&self, bus: &mut impl MemoryBus, laddr: u64) -> Option<u64> {
        let laddr = match self.mode {
            PagingMode::Disabled => return Some(laddr & 0xffff_ffff),
            PagingMode::Legacy32 | PagingMode::Pae => laddr as u32 as u64,
            PagingMode::Long4 => laddr,
        };

        let poffset = laddr & PAGE_OFFSET_MASK;
        let entry = self.tlb.entry(laddr);
        if entry.lpf == lpf_of(laddr) {
            return Some(entry.ppf | poffset);
        }

        let walk = match self.mode {
            PagingMode::Disabled => unreachable!("handled above"),
            PagingMode::Legacy32 => self.walk_legacy32(bus, laddr),
            PagingMode::Pae => self.walk_pae(bus, laddr),
            PagingMode::Long4 => self.walk_long4(bus, laddr),
        };
        walk.ok().map(|walk| walk.ppf | poffset)
    }

    /// Cached host pointer to the page backing `laddr`, if the TLB can
    /// satisfy `access` at `cpl` through the direct-pointer fast path. The
    /// returned pointer addresses the start of the page; the caller adds the
    /// page offset.
    #[inline]
    pub fn host_fast_path(&self, laddr: u64, access: AccessType, cpl: u8) -> Option<NonNull<u8>> {
        let entry = self.tlb.entry(laddr);
        if entry.lpf != lpf_of(laddr) {
            return None;
        }
        let w = access.is_write() as u32;
        if entry.access_bits & (1 << ((w << 2) | cpl as u32)) == 0 {
            return None;
        }
        if access.is_execute() && entry.access_bits & TLB_NX_PAGE != 0 {
            return None;
        }
        entry.host_page()
    }

    /// Identity translation with paging disabled. A flat TLB entry is still
    /// maintained so later accesses can use a direct host pointer; if the
    /// memory collaborator vetoes the pointer the entry carries no access
    /// bits and every access goes through the bus.
    fn flat_translate(&mut self, bus: &mut impl MemoryBus, laddr: u64, access: AccessType) -> u64 {
        let lpf = lpf_of(laddr);
        if self.tlb.entry(laddr).lpf == lpf {
            return laddr;
        }

        let mut access_bits = 0;
        let mut host = bus.host_page(lpf, AccessType::Write);
        if host.is_some() {
            access_bits = TLB_READ_SYS_OK
                | TLB_READ_USER_OK
                | TLB_WRITE_SYS_OK
                | TLB_WRITE_USER_OK
                | TLB_READ_SYS_PTR_OK
                | TLB_READ_USER_PTR_OK
                | TLB_WRITE_SYS_PTR_OK
                | TLB_WRITE_USER_PTR_OK;
        } else if !access.is_write() {
            // Direct write vetoed; a read-only pointer still helps reads.
            host = bus.host_page(lpf, AccessType::Read);
            if host.is_some() {
                access_bits =
                    TLB_READ_SYS_OK | TLB_READ_USER_OK | TLB_READ_SYS_PTR_OK | TLB_READ_USER_PTR_OK;
            }
        }

        let slot = self.tlb.entry_mut(laddr);
        slot.lpf = lpf;
        slot.ppf = lpf;
        slot.access_bits = access_bits;
        slot.set_host_page(host);

        laddr
    }

    /// Builds the #PF error code, latches CR2, invalidates the faulting
    /// page's TLB slot and hands the fault back for delivery. The walker
    /// never resumes after this.
    fn page_fault(
        &mut self,
        kind: FaultKind,
        laddr: u64,
        access: AccessType,
        cpl: u8,
    ) -> TranslateFault {
        let mut error_code = match kind {
            FaultKind::NotPresent => 0,
            FaultKind::Protection => ERR_PROTECTION,
            FaultKind::Reserved => ERR_PROTECTION | ERR_RESERVED,
        };
        if access.is_write() {
            error_code |= ERR_WRITE;
        }
        if cpl == 3 {
            error_code |= ERR_USER;
        }
        if access.is_execute() && self.nx_enabled() {
            error_code |= ERR_FETCH;
        }

        self.cr2 = laddr;
        self.tlb.invalidate_page(laddr);
        tracing::debug!("page fault at {laddr:#x}, error code {error_code:#x}");

        TranslateFault::PageFault(PageFault {
            addr: laddr,
            error_code,
        })
    }

    /// Checks one 64-bit paging-structure entry: present, reserved bits, NX,
    /// and the emulated physical address width.
    #[inline]
    fn check_entry64(&self, entry: u64, reserved: u64, nx: &mut bool) -> Result<(), FaultKind> {
        if entry & PTE_P == 0 {
            return Err(FaultKind::NotPresent);
        }
        if entry & reserved != 0 {
            return Err(FaultKind::Reserved);
        }
        if entry & PTE_NX != 0 {
            if !self.nx_enabled() {
                // NX is a reserved bit while EFER.NXE is clear.
                return Err(FaultKind::Reserved);
            }
            *nx = true;
        }
        if entry & PHYS_HIGH_BITS != 0 {
            panic!(
                "paging-structure entry {entry:#018x} sets physical address bits 51:32; \
                 only a 32-bit physical address space is emulated"
            );
        }
        Ok(())
    }

    fn walk_legacy32(&self, bus: &mut impl MemoryBus, laddr: u64) -> Result<Walk, FaultKind> {
        let pde_addr = self.cr3_masked + ((laddr >> 22) & 0x3ff) * 4;
        let pde = bus.read_u32(pde_addr) as u64;
        if pde & PTE_P == 0 {
            return Err(FaultKind::NotPresent);
        }

        if pde & PTE_PS != 0 && self.pse_enabled() {
            if pde & LEGACY_4M_RESERVED != 0 {
                return Err(FaultKind::Reserved);
            }

            let mut combined = (pde & PTE_PERM_MASK) as u32;
            if self.pge_enabled() && pde & PTE_G != 0 {
                combined |= TLB_GLOBAL_PAGE;
            }
            return Ok(Walk {
                // The TLB caches 4KiB frames, so carve the matching 4KiB
                // slice out of the 4MB page.
                ppf: (pde & 0xffc0_0000) | (laddr & 0x003f_f000),
                combined,
                nx: false,
                wide: false,
                len: 1,
                entries: [
                    WalkEntry {
                        addr: pde_addr,
                        value: pde,
                    },
                    WalkEntry::NONE,
                    WalkEntry::NONE,
                    WalkEntry::NONE,
                ],
            });
        }

        // With CR4.PSE clear the PS bit is ignored and the entry is an
        // ordinary page-table pointer.
        let pte_addr = (pde & 0xffff_f000) + ((laddr >> 12) & 0x3ff) * 4;
        let pte = bus.read_u32(pte_addr) as u64;
        if pte & PTE_P == 0 {
            return Err(FaultKind::NotPresent);
        }

        let mut combined = ((pde & pte) & PTE_PERM_MASK) as u32;
        if self.pge_enabled() && pte & PTE_G != 0 {
            combined |= TLB_GLOBAL_PAGE;
        }
        Ok(Walk {
            ppf: pte & 0xffff_f000,
            combined,
            nx: false,
            wide: false,
            len: 2,
            entries: [
                WalkEntry {
                    addr: pde_addr,
                    value: pde,
                },
                WalkEntry {
                    addr: pte_addr,
                    value: pte,
                },
                WalkEntry::NONE,
                WalkEntry::NONE,
            ],
        })
    }

    fn walk_pae(&self, bus: &mut impl MemoryBus, laddr: u64) -> Result<Walk, FaultKind> {
        let mut nx = false;

        let pdpte_addr = self.cr3_masked + ((laddr >> 30) & 0x3) * 8;
        let pdpte = bus.read_u64(pdpte_addr);
        self.check_entry64(pdpte, PML4_PDPTE_RESERVED, &mut nx)?;

        let pde_addr = (pdpte & ADDR_MASK64) + ((laddr >> 21) & 0x1ff) * 8;
        let pde = bus.read_u64(pde_addr);
        self.check_entry64(pde, 0, &mut nx)?;

        // CR4.PSE is not consulted in PAE mode: PS always selects a 2MB page.
        if pde & PTE_PS != 0 {
            // The PDPT entry contributes no U/S or R/W in PAE paging.
            let mut combined = (pde & PTE_PERM_MASK) as u32;
            if self.pge_enabled() && pde & PTE_G != 0 {
                combined |= TLB_GLOBAL_PAGE;
            }
            return Ok(Walk {
                ppf: (pde & 0x000f_ffff_ffe0_0000) | (laddr & 0x001f_f000),
                combined,
                nx,
                wide: true,
                len: 2,
                entries: [
                    WalkEntry {
                        addr: pdpte_addr,
                        value: pdpte,
                    },
                    WalkEntry {
                        addr: pde_addr,
                        value: pde,
                    },
                    WalkEntry::NONE,
                    WalkEntry::NONE,
                ],
            });
        }

        let pte_addr = (pde & ADDR_MASK64) + ((laddr >> 12) & 0x1ff) * 8;
        let pte = bus.read_u64(pte_addr);
        self.check_entry64(pte, 0, &mut nx)?;

        let mut combined = ((pde & pte) & PTE_PERM_MASK) as u32;
        if self.pge_enabled() && pte & PTE_G != 0 {
            combined |= TLB_GLOBAL_PAGE;
        }
        Ok(Walk {
            ppf: pte & ADDR_MASK64,
            combined,
            nx,
            wide: true,
            len: 3,
            entries: [
                WalkEntry {
                    addr: pdpte_addr,
                    value: pdpte,
                },
                WalkEntry {
                    addr: pde_addr,
                    value: pde,
                },
                WalkEntry {
                    addr: pte_addr,
                    value: pte,
                },
                WalkEntry::NONE,
            ],
        })
    }

    fn walk_long4(&self, bus: &mut impl MemoryBus, laddr: u64) -> Result<Walk, FaultKind> {
        let mut nx = false;

        let pml4e_addr = self.cr3_masked + ((laddr >> 39) & 0x1ff) * 8;
        let pml4e = bus.read_u64(pml4e_addr);
        self.check_entry64(pml4e, PML4_PDPTE_RESERVED, &mut nx)?;

        let pdpte_addr = (pml4e & ADDR_MASK64) + ((laddr >> 30) & 0x1ff) * 8;
        let pdpte = bus.read_u64(pdpte_addr);
        // Bit 7 reserved here also rules out 1GiB pages.
        self.check_entry64(pdpte, PML4_PDPTE_RESERVED, &mut nx)?;

        let pde_addr = (pdpte & ADDR_MASK64) + ((laddr >> 21) & 0x1ff) * 8;
        let pde = bus.read_u64(pde_addr);
        self.check_entry64(pde, 0, &mut nx)?;

        // In long mode every level contributes to the combined access.
        let upper = pml4e & pdpte;

        if pde & PTE_PS != 0 {
            let mut combined = ((upper & pde) & PTE_PERM_MASK) as u32;
            if self.pge_enabled() && pde & PTE_G != 0 {
                combined |= TLB_GLOBAL_PAGE;
            }
            return Ok(Walk {
                ppf: (pde & 0x000f_ffff_ffe0_0000) | (laddr & 0x001f_f000),
                combined,
                nx,
                wide: true,
                len: 3,
                entries: [
                    WalkEntry {
                        addr: pml4e_addr,
                        value: pml4e,
                    },
                    WalkEntry {
                        addr: pdpte_addr,
                        value: pdpte,
                    },
                    WalkEntry {
                        addr: pde_addr,
                        value: pde,
                    },
                    WalkEntry::NONE,
                ],
            });
        }

        let pte_addr = (pde & ADDR_MASK64) + ((laddr >> 12) & 0x1ff) * 8;
        let pte = bus.read_u64(pte_addr);
        self.check_entry64(pte, 0, &mut nx)?;

        let mut combined = ((upper & pde & pte) & PTE_PERM_MASK) as u32;
        if self.pge_enabled() && pte & PTE_G != 0 {
            combined |= TLB_GLOBAL_PAGE;
        }
        Ok(Walk {
            ppf: pte & ADDR_MASK64,
            combined,
            nx,
            wide: true,
            len: 4,
            entries: [
                WalkEntry {
                    addr: pml4e_addr,
                    value: pml4e,
                },
                WalkEntry {
                    addr: pdpte_addr,
                    value: pdpte,
                },
                WalkEntry {
                    addr: pde_addr,
                    value: pde,
                },
                WalkEntry {
                    addr: pte_addr,
                    value: pte,
                },
            ],
        })
    }

    /// Writes back accessed bits for the traversed non-leaf entries and the
    /// accessed (and, for writes, dirty) bit of the leaf, in walk order.
    /// Runs after the permission decision and before the data transfer, so a
    /// faulting access leaves no A/D side effects.
    fn commit_accessed_dirty(&self, bus: &mut impl MemoryBus, walk: &Walk, is_write: bool) {
        let leaf = walk.len - 1;
        for (i, entry) in walk.entries[..walk.len].iter().enumerate() {
            let mut want = PTE_A;
            if i == leaf && is_write {
                want |= PTE_D;
            }
            if entry.value & want != want {
                let value = entry.value | want;
                if walk.wide {
                    bus.write_u64(entry.addr, value);
                } else {
                    bus.write_u32(entry.addr, value as u32);
                }
            }
        }
    }

    /// Derives the cached permission bitmap for a freshly walked page.
    ///
    /// Read permission for the page's privilege class is always cached.
    /// Write permission is cached only when this access is itself a write:
    /// caching it on a read install would let a later write hit the fast
    /// path without the leaf dirty bit ever being set. Supervisor writes to
    /// read-only pages only reach here with CR0.WP clear, where they are
    /// architecturally allowed.
    fn seed_access_bits(&self, walk: &Walk, is_write: bool) -> u32 {
        let user_page = walk.combined & 0x4 != 0;
        let writable_page = walk.combined & 0x2 != 0;

        let mut bits;
        if user_page {
            bits = TLB_READ_USER_OK | TLB_READ_SYS_OK;
            if is_write {
                if writable_page {
                    bits |= TLB_WRITE_USER_OK | TLB_WRITE_SYS_OK;
                } else {
                    bits |= TLB_WRITE_SYS_OK;
                }
            }
        } else {
            bits = TLB_READ_SYS_OK;
            if is_write {
                bits |= TLB_WRITE_SYS_OK;
            }
        }

        bits |= walk.combined & TLB_GLOBAL_PAGE;
        if walk.nx {
            bits |= TLB_NX_PAGE;
        }
        bits
    }
}

/// The single-probe permission test against a cached entry. Instruction
/// fetches test as reads but additionally require the NX veto bit clear.
#[inline]
fn cached_permission_ok(access_bits: u32, access: AccessType, cpl: u8) -> bool {
    let w = access.is_write() as u32;
    if access_bits & (0x100 << ((w << 2) | cpl as u32)) == 0 {
        return false;
    }
    !(access.is_execute() && access_bits & TLB_NX_PAGE != 0)
}
