// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Where everything the guest needs at boot ended up.

/// The kernel command line in guest memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub gpa: u64,
    /// Length without the terminating NUL.
    pub len: u64,
}

/// The boot module (initrd) in guest memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootModule {
    pub gpa: u64,
    pub size: u64,
}

/// Layout of the loaded guest image, filled in as loading progresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestImage {
    /// Lowest physical address of any loadable segment, as linked.
    pub link_paddr: u64,
    /// Lowest virtual address of any loadable segment, as linked.
    pub link_vaddr: u64,
    /// Where the lowest segment was actually placed.
    pub load_paddr: u64,
    /// `load_paddr - link_paddr`.
    pub relocation_offset: i64,
    /// Relocated entry point.
    pub entry: u64,
    pub alignment: u64,
    pub cmd_line: Option<CommandLine>,
    pub boot_module: Option<BootModule>,
    /// Guest address of the zero page.
    pub boot_info: u64,
    /// Guest address of the initial page directory.
    pub pd: u64,
}
