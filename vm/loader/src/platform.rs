// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to the services the loader borrows from the hypervisor.
//!
//! The loader never owns guest memory directly. Every byte it writes goes
//! through a frame capability that is duplicated into a scratch slot and
//! mapped into the hypervisor's own address space for the duration of the
//! write. These traits describe the operations needed for that, along with
//! the boot file store and optional firmware collaborators.

use crate::memory::GuestMemory;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;

/// A capability pointer in the hypervisor's capability space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CPtr(pub u64);

/// The hypervisor's capability space.
pub trait CapSpace {
    /// Allocates an empty slot.
    fn alloc_slot(&mut self) -> anyhow::Result<CPtr>;

    /// Returns an empty slot to the allocator.
    fn free_slot(&mut self, slot: CPtr);

    /// Copies the capability in `src` into the empty slot `dest`.
    fn copy(&mut self, dest: CPtr, src: CPtr) -> anyhow::Result<()>;

    /// Deletes the capability in `slot`, leaving the slot empty.
    fn delete(&mut self, slot: CPtr) -> anyhow::Result<()>;

    /// Allocates a fresh zeroed 4KiB frame object.
    fn alloc_frame(&mut self) -> anyhow::Result<CPtr>;
}

/// The guest's physical address space.
pub trait GuestVspace {
    /// Returns the frame capability backing the page at `gpa`, if any.
    fn frame_cap(&self, gpa: u64) -> Option<CPtr>;

    /// Maps `frame` into the guest at an address outside of guest RAM and
    /// returns that address.
    fn map_reserved_frame(&mut self, frame: CPtr) -> anyhow::Result<u64>;
}

/// A frame mapped into the hypervisor's address space.
#[derive(Debug, PartialEq, Eq)]
pub struct HostMapping {
    vaddr: usize,
}

impl HostMapping {
    pub fn new(vaddr: usize) -> Self {
        Self { vaddr }
    }

    pub fn vaddr(&self) -> usize {
        self.vaddr
    }
}

/// The hypervisor's own address space.
pub trait HostVspace {
    /// Maps the frame referenced by `frame` read/write.
    fn map_frame(&mut self, frame: CPtr) -> anyhow::Result<HostMapping>;

    /// The bytes of a mapped frame.
    fn frame_mut(&mut self, mapping: &HostMapping) -> &mut [u8];

    /// Tears down a mapping returned by [`HostVspace::map_frame`].
    fn unmap_frame(&mut self, mapping: HostMapping);
}

/// An open file in a [`FileProvider`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u32);

/// Read-only store of named boot files.
pub trait FileProvider {
    fn open(&self, name: &str) -> Option<FileHandle>;
    fn size(&self, file: FileHandle) -> u64;
    /// Fills `buf` from `offset`. Reads past the end of the file fail.
    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn close(&self, file: FileHandle);
}

/// A file opened from a [`FileProvider`], closed on drop.
pub struct OpenFile<'a> {
    files: &'a dyn FileProvider,
    handle: FileHandle,
    len: u64,
    pos: u64,
}

impl<'a> OpenFile<'a> {
    pub fn open(files: &'a dyn FileProvider, name: &str) -> Option<Self> {
        let handle = files.open(name)?;
        let len = files.size(handle);
        Some(Self {
            files,
            handle,
            len,
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset.checked_add(buf.len() as u64);
        if end.map_or(true, |end| end > self.len) {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.files.read(self.handle, offset, buf)
    }
}

impl Read for OpenFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        self.read_at(self.pos, &mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for OpenFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        self.pos = new.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        Ok(self.pos)
    }
}

impl Drop for OpenFile<'_> {
    fn drop(&mut self) {
        self.files.close(self.handle);
    }
}

/// The VBE mode the host firmware left the display in.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VbeModeInfo {
    pub x_resolution: u16,
    pub y_resolution: u16,
    pub bits_per_pixel: u8,
    pub bytes_per_scanline: u16,
    /// Physical address of the linear framebuffer in host space.
    pub phys_base: u32,
    pub red_mask_size: u8,
    pub red_field_position: u8,
    pub green_mask_size: u8,
    pub green_field_position: u8,
    pub blue_mask_size: u8,
    pub blue_field_position: u8,
    pub rsvd_mask_size: u8,
    pub rsvd_field_position: u8,
    pub pm_seg: u16,
    pub pm_off: u16,
    pub mode_attributes: u16,
}

pub trait VideoModeProvider {
    fn mode_info(&self) -> VbeModeInfo;
}

/// Builds ACPI tables into guest memory.
pub trait AcpiBuilder {
    fn build(&mut self, memory: &mut GuestMemory<'_>) -> anyhow::Result<()>;
}

/// Everything the loader borrows from its host for one boot.
pub struct Platform<'a> {
    pub cspace: &'a mut dyn CapSpace,
    pub guest_vspace: &'a mut dyn GuestVspace,
    pub host_vspace: &'a mut dyn HostVspace,
    pub files: &'a dyn FileProvider,
    /// `None` when the host has no linear framebuffer to pass through.
    pub video: Option<&'a dyn VideoModeProvider>,
    pub acpi: &'a mut dyn AcpiBuilder,
}
