// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Methods to construct 32-bit x86 page tables.
//!
//! With CR4.PSE set, a single page directory of 4MiB entries is enough to
//! identity map the full 32-bit address space, so the guest can start with
//! paging enabled without any second level tables.

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Number of bytes in a page for x86.
pub const X86_PAGE_SIZE: u64 = 4096;

/// Shift of a PSE large page.
pub const X86_LARGE_PAGE_SHIFT: u32 = 22;

/// Number of bytes in a PSE large page.
pub const X86_LARGE_PAGE_SIZE: u64 = 1 << X86_LARGE_PAGE_SHIFT;

/// Number of entries in a 32-bit page directory.
pub const PAGE_DIRECTORY_ENTRY_COUNT: usize = 1024;

/// A 32-bit page directory entry mapping a 4MiB page.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct PageDirectoryEntry {
    pub present: bool,
    pub read_write: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    pub available: u8,
    pub pat: bool,
    #[bits(9)]
    _reserved: u16,
    /// Bits 31:22 of the mapped physical address.
    #[bits(10)]
    pub large_page_number: u16,
}

impl PageDirectoryEntry {
    /// Returns a present, writable, user accessible entry mapping the 4MiB
    /// page at `address`.
    pub fn large_page_at(address: u32) -> Self {
        assert!(
            u64::from(address) % X86_LARGE_PAGE_SIZE == 0,
            "{address:#x} is not 4MiB aligned"
        );
        Self::new()
            .with_present(true)
            .with_read_write(true)
            .with_user(true)
            .with_large_page(true)
            .with_large_page_number((address >> X86_LARGE_PAGE_SHIFT) as u16)
    }

    /// The physical address mapped by this entry.
    pub fn address(&self) -> u32 {
        u32::from(self.large_page_number()) << X86_LARGE_PAGE_SHIFT
    }
}

/// A page directory sized and laid out to fill exactly one page.
#[repr(C)]
#[derive(Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PageDirectory {
    pub entries: [PageDirectoryEntry; PAGE_DIRECTORY_ENTRY_COUNT],
}

/// Builds a page directory identity mapping the bottom 4GiB with 4MiB pages.
pub fn build_identity_page_directory() -> PageDirectory {
    let mut entries = [PageDirectoryEntry::new(); PAGE_DIRECTORY_ENTRY_COUNT];
    for (index, entry) in entries.iter_mut().enumerate() {
        *entry = PageDirectoryEntry::large_page_at((index as u32) << X86_LARGE_PAGE_SHIFT);
    }
    PageDirectory { entries }
}
