// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loading a guest from boot files to its first instruction.

use crate::elf;
use crate::image::GuestImage;
use crate::linux;
use crate::memory::GuestMemory;
use crate::memory::GuestRam;
use crate::platform::Platform;
use crate::reloc;
use crate::touch::PageBridge;
use crate::vp::initial_vp_state;
use crate::vp::InitialVpState;
use thiserror::Error;

/// Kernels are placed on a 4MiB boundary unless told otherwise, matching the
/// PSE page size.
pub const DEFAULT_ALIGNMENT: u64 = page_table::x86::X86_LARGE_PAGE_SIZE;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load guest kernel")]
    Kernel(#[source] elf::Error),
    #[error("failed to relocate guest kernel")]
    Relocate(#[source] reloc::Error),
    #[error("failed to load boot module")]
    BootModule(#[source] linux::Error),
    #[error("failed to build guest boot structures")]
    BootStructures(#[source] linux::Error),
}

/// What to boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub kernel: String,
    /// Relocation table for `kernel`.
    pub relocs: String,
    pub initrd: Option<String>,
    pub cmdline: String,
    pub alignment: u64,
    /// Offset between host physical and guest physical addresses of passed
    /// through PCI memory, used to place the framebuffer.
    pub pci_map_offset: u32,
}

impl BootConfig {
    /// A config for `kernel`, with its relocations in `<kernel>.relocs`.
    pub fn new(kernel: impl Into<String>, cmdline: impl Into<String>) -> Self {
        let kernel = kernel.into();
        Self {
            relocs: format!("{kernel}.relocs"),
            kernel,
            initrd: None,
            cmdline: cmdline.into(),
            alignment: DEFAULT_ALIGNMENT,
            pci_map_offset: 0,
        }
    }

    pub fn with_relocs(mut self, relocs: impl Into<String>) -> Self {
        self.relocs = relocs.into();
        self
    }

    pub fn with_initrd(mut self, initrd: impl Into<String>) -> Self {
        self.initrd = Some(initrd.into());
        self
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_pci_map_offset(mut self, offset: u32) -> Self {
        self.pci_map_offset = offset;
        self
    }
}

/// A guest ready to run.
#[derive(Debug)]
pub struct BootedGuest {
    pub image: GuestImage,
    pub vp: InitialVpState,
    /// The RAM map with everything the loader placed marked allocated.
    pub ram: GuestRam,
}

/// Loads the kernel, relocates it if needed, loads the boot module and builds
/// the boot structures, then returns the boot processor's initial state.
///
/// An empty boot module is skipped with a warning rather than failing the
/// boot.
pub fn boot_guest(
    platform: Platform<'_>,
    ram: GuestRam,
    config: &BootConfig,
) -> Result<BootedGuest, Error> {
    let Platform {
        cspace,
        guest_vspace,
        host_vspace,
        files,
        video,
        acpi,
    } = platform;
    let mut memory = GuestMemory::new(ram, PageBridge::new(cspace, guest_vspace, host_vspace));

    let mut image = elf::load_elf(&mut memory, files, &config.kernel, config.alignment)
        .map_err(Error::Kernel)?;
    if image.relocation_offset != 0 {
        reloc::relocate_kernel(&mut memory, &image, files, &config.relocs)
            .map_err(Error::Relocate)?;
    }

    if let Some(initrd) = &config.initrd {
        match linux::load_boot_module(&mut memory, files, initrd) {
            Ok(module) => image.boot_module = Some(module),
            Err(linux::Error::EmptyModule(name)) => {
                tracing::warn!(name = %name, "boot module is empty, booting without it");
            }
            Err(err) => return Err(Error::BootModule(err)),
        }
    }

    let screen_info = linux::screen_info(video, config.pci_map_offset);
    linux::make_boot_structures(&mut memory, &mut image, &config.cmdline, screen_info, acpi)
        .map_err(Error::BootStructures)?;

    let vp = initial_vp_state(&image);
    let ram = memory.into_ram();
    tracing::debug!(%ram, "guest ram after boot");
    Ok(BootedGuest { image, vp, ram })
}
