// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Boot structures for a 32-bit Linux guest entered through the protected
//! mode entry point.
//!
//! The guest starts with paging on, so besides the zero page and command line
//! it needs a page directory. That directory lives in a private page outside
//! of guest RAM so it never appears in the E820 map.

use crate::image::BootModule;
use crate::image::CommandLine;
use crate::image::GuestImage;
use crate::memory;
use crate::memory::GuestMemory;
use crate::memory::RamRegion;
use crate::memory::PAGE_SIZE;
use crate::platform::AcpiBuilder;
use crate::platform::FileProvider;
use crate::platform::OpenFile;
use crate::platform::VideoModeProvider;
use crate::touch::TouchError;
use loader_defs::linux as defs;
use std::ffi::CString;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// The E820 map covers the 32-bit physical address space.
const E820_LIMIT: u64 = memory::RAM_LIMIT;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to map a private page for the page directory")]
    PageDirectory(#[source] TouchError),
    #[error("failed to write the {what} to guest memory")]
    Write {
        what: &'static str,
        #[source]
        err: TouchError,
    },
    #[error("no room in guest ram for the {what}")]
    Allocate {
        what: &'static str,
        #[source]
        err: memory::Error,
    },
    #[error("kernel command line contains a NUL byte")]
    CommandLineNul,
    #[error("{what} {value:#x} does not fit in 32 bits")]
    AddressAbove4Gb { what: &'static str, value: u64 },
    #[error("boot module {0:?} not found")]
    ModuleNotFound(String),
    #[error("boot module {0:?} is empty")]
    EmptyModule(String),
    #[error("failed to build acpi tables")]
    Acpi(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum E820Type {
    Ram,
    Reserved,
}

impl E820Type {
    fn raw(self) -> u32 {
        match self {
            E820Type::Ram => defs::E820_RAM,
            E820Type::Reserved => defs::E820_RESERVED,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub typ: E820Type,
}

impl E820Entry {
    fn end(&self) -> u64 {
        self.addr + self.size
    }
}

impl From<E820Entry> for defs::e820entry {
    fn from(entry: E820Entry) -> Self {
        defs::e820entry {
            addr: entry.addr.into(),
            size: entry.size.into(),
            typ: entry.typ.raw().into(),
        }
    }
}

/// Builds an E820 map covering `0..4GiB`: every RAM region, merged where
/// adjacent, with the gaps between them and the space above them reserved.
///
/// `regions` come from a [`GuestRam`](crate::memory::GuestRam), so they are
/// sorted and end at or below 4GiB.
pub fn build_e820_map(regions: &[RamRegion]) -> Vec<E820Entry> {
    let mut map = Vec::new();
    let mut cur = E820Entry {
        addr: 0,
        size: 0,
        typ: E820Type::Reserved,
    };
    for region in regions {
        assert!(
            region.end() <= E820_LIMIT,
            "ram region {:#x}-{:#x} is above 4GiB",
            region.start,
            region.end()
        );
        if cur.typ != E820Type::Ram || cur.end() != region.start {
            if cur.size != 0 {
                map.push(cur);
            }
            if cur.end() < region.start {
                map.push(E820Entry {
                    addr: cur.end(),
                    size: region.start - cur.end(),
                    typ: E820Type::Reserved,
                });
            }
            cur = E820Entry {
                addr: region.start,
                size: 0,
                typ: E820Type::Ram,
            };
        }
        cur.size = region.end() - cur.addr;
    }
    if cur.size != 0 {
        map.push(cur);
    }
    if cur.end() < E820_LIMIT {
        map.push(E820Entry {
            addr: cur.end(),
            size: E820_LIMIT - cur.end(),
            typ: E820Type::Reserved,
        });
    }

    assert!(map.iter().all(|e| e.size != 0));
    assert!(
        map.len() <= defs::E820_MAX_ENTRIES,
        "{} e820 entries do not fit in the zero page",
        map.len()
    );
    map
}

fn u32_field(what: &'static str, value: u64) -> Result<u32> {
    value
        .try_into()
        .map_err(|_| Error::AddressAbove4Gb { what, value })
}

/// Builds the zero page for `image`.
pub fn build_boot_params(
    image: &GuestImage,
    e820: &[E820Entry],
    screen_info: defs::screen_info,
) -> Result<defs::boot_params> {
    let (cmd_line_ptr, cmdline_size) = match image.cmd_line {
        Some(cmd_line) => (
            u32_field("command line address", cmd_line.gpa)?,
            u32_field("command line length", cmd_line.len)?,
        ),
        None => (0, 0),
    };

    let mut p = defs::boot_params {
        screen_info,
        alt_mem_k: 0.into(),
        hdr: defs::setup_header {
            header: defs::HDRS_MAGIC.into(),
            boot_flag: defs::BOOT_FLAG_MAGIC.into(),
            version: defs::BOOT_PROTOCOL_2_02.into(),
            type_of_loader: defs::LOADER_TYPE_UNDEFINED,
            code32_start: u32_field("kernel load address", image.load_paddr)?.into(),
            kernel_alignment: u32_field("kernel alignment", image.alignment)?.into(),
            relocatable_kernel: 1,
            cmd_line_ptr: cmd_line_ptr.into(),
            cmdline_size: cmdline_size.into(),
            ..FromZeros::new_zeroed()
        },
        ..FromZeros::new_zeroed()
    };

    if let Some(module) = image.boot_module {
        // Initrds are only honored from protocol 2.04 on.
        p.hdr.version = defs::BOOT_PROTOCOL_2_04.into();
        p.hdr.ramdisk_image = u32_field("boot module address", module.gpa)?.into();
        p.hdr.ramdisk_size = u32_field("boot module size", module.size)?.into();
        p.hdr.root_dev = defs::ROOT_DEV_RAMDISK.into();
    }

    assert!(e820.len() <= defs::E820_MAX_ENTRIES);
    for (slot, entry) in p.e820_table.iter_mut().zip(e820) {
        *slot = (*entry).into();
    }
    p.e820_entries = e820.len() as u8;

    Ok(p)
}

/// Describes the host's VESA linear framebuffer, which the guest sees
/// `pci_map_offset` bytes above its host physical address.
#[cfg(feature = "vesa_framebuffer")]
pub fn vesa_screen_info(mode: &crate::platform::VbeModeInfo, pci_map_offset: u32) -> defs::screen_info {
    let fb_size = u64::from(mode.bytes_per_scanline) * u64::from(mode.y_resolution);
    defs::screen_info {
        orig_video_is_vga: defs::VIDEO_TYPE_VLFB,
        lfb_width: mode.x_resolution.into(),
        lfb_height: mode.y_resolution.into(),
        lfb_depth: u16::from(mode.bits_per_pixel).into(),
        lfb_base: mode.phys_base.wrapping_add(pci_map_offset).into(),
        lfb_size: ((memory::align_up(fb_size, 0x10000) >> 16) as u32).into(),
        lfb_linelength: mode.bytes_per_scanline.into(),
        red_size: mode.red_mask_size,
        red_pos: mode.red_field_position,
        green_size: mode.green_mask_size,
        green_pos: mode.green_field_position,
        blue_size: mode.blue_mask_size,
        blue_pos: mode.blue_field_position,
        rsvd_size: mode.rsvd_mask_size,
        rsvd_pos: mode.rsvd_field_position,
        vesapm_seg: mode.pm_seg.into(),
        vesapm_off: mode.pm_off.into(),
        vesa_attributes: mode.mode_attributes.into(),
        ..FromZeros::new_zeroed()
    }
}

/// The zero page `screen_info` for the host's display, if it is passed
/// through.
#[cfg(feature = "vesa_framebuffer")]
pub fn screen_info(video: Option<&dyn VideoModeProvider>, pci_map_offset: u32) -> defs::screen_info {
    match video {
        Some(video) => vesa_screen_info(&video.mode_info(), pci_map_offset),
        None => FromZeros::new_zeroed(),
    }
}

/// The zero page `screen_info` for the host's display, if it is passed
/// through.
#[cfg(not(feature = "vesa_framebuffer"))]
pub fn screen_info(_video: Option<&dyn VideoModeProvider>, _pci_map_offset: u32) -> defs::screen_info {
    FromZeros::new_zeroed()
}

/// Writes an identity mapping page directory into a private page and returns
/// its guest address.
pub fn make_page_directory(memory: &mut GuestMemory<'_>) -> Result<u64> {
    let bridge = memory.bridge();
    let gpa = bridge.new_private_page().map_err(Error::PageDirectory)?;
    assert_eq!(gpa % PAGE_SIZE, 0);
    let pd = page_table::x86::build_identity_page_directory();
    bridge
        .touch(gpa, PAGE_SIZE, |chunk| {
            assert_eq!(chunk.offset, 0);
            assert_eq!(chunk.data.len() as u64, PAGE_SIZE);
            chunk.data.copy_from_slice(pd.as_bytes());
            Ok(())
        })
        .map_err(|err| Error::Write {
            what: "page directory",
            err,
        })?;
    Ok(gpa)
}

/// Copies `cmdline` and its NUL terminator into guest RAM.
pub fn make_command_line(memory: &mut GuestMemory<'_>, cmdline: &str) -> Result<CommandLine> {
    let cmdline = CString::new(cmdline).map_err(|_| Error::CommandLineNul)?;
    let bytes = cmdline.as_bytes_with_nul();
    let gpa = memory
        .allocate(bytes.len() as u64)
        .map_err(|err| Error::Allocate {
            what: "command line",
            err,
        })?;
    memory.write_at(gpa, bytes).map_err(|err| Error::Write {
        what: "command line",
        err,
    })?;
    Ok(CommandLine {
        gpa,
        len: cmdline.as_bytes().len() as u64,
    })
}

/// Builds the zero page for `image` and copies it into guest RAM.
pub fn make_boot_params(
    memory: &mut GuestMemory<'_>,
    image: &GuestImage,
    screen_info: defs::screen_info,
) -> Result<u64> {
    let e820 = build_e820_map(memory.ram().regions());
    let params = build_boot_params(image, &e820, screen_info)?;
    let gpa = memory
        .allocate(size_of::<defs::boot_params>() as u64)
        .map_err(|err| Error::Allocate {
            what: "zero page",
            err,
        })?;
    memory
        .write_at(gpa, params.as_bytes())
        .map_err(|err| Error::Write {
            what: "zero page",
            err,
        })?;
    tracing::debug!(gpa, e820_entries = e820.len(), "wrote zero page");
    Ok(gpa)
}

/// Loads the boot module `name` at the start of the largest free RAM region.
pub fn load_boot_module(
    memory: &mut GuestMemory<'_>,
    files: &dyn FileProvider,
    name: &str,
) -> Result<BootModule> {
    let file = OpenFile::open(files, name).ok_or_else(|| Error::ModuleNotFound(name.to_owned()))?;
    let size = file.len();
    if size == 0 {
        return Err(Error::EmptyModule(name.to_owned()));
    }

    let gpa = match memory.ram().largest_free_region() {
        Some(region) if region.size >= size => region.start,
        _ => {
            return Err(Error::Allocate {
                what: "boot module",
                err: memory::Error::OutOfMemory { size },
            })
        }
    };
    memory
        .touch(gpa, size, |chunk| {
            file.read_at(chunk.offset, chunk.data)?;
            Ok(())
        })
        .map_err(|err| Error::Write {
            what: "boot module",
            err,
        })?;
    memory.mark_allocated(gpa, size);

    tracing::info!(name, gpa, size, "loaded boot module");
    tracing::debug!(ram = %memory.ram(), "guest ram after boot module");
    Ok(BootModule { gpa, size })
}

/// Builds the page directory, command line, zero page and ACPI tables, in
/// that order, and records where they went in `image`.
pub fn make_boot_structures(
    memory: &mut GuestMemory<'_>,
    image: &mut GuestImage,
    cmdline: &str,
    screen_info: defs::screen_info,
    acpi: &mut dyn AcpiBuilder,
) -> Result<()> {
    image.pd = make_page_directory(memory)?;
    image.cmd_line = Some(make_command_line(memory, cmdline)?);
    image.boot_info = make_boot_params(memory, image, screen_info)?;
    acpi.build(memory).map_err(Error::Acpi)?;
    tracing::info!(
        pd = image.pd,
        boot_info = image.boot_info,
        "built guest boot structures"
    );
    Ok(())
}
