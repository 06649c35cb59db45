// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Page-granular access to guest physical memory through temporary host
//! mappings.
//!
//! Guest frames are never mapped into the host for longer than one callback.
//! Each [`PageBridge::touch`] takes a single scratch capability slot, and for
//! every page it visits duplicates the guest frame capability into that slot,
//! maps it, runs the callback on the covered bytes, then unmaps and deletes
//! the duplicate. The slot is returned when the touch ends, whether it
//! succeeds or not.

use crate::memory::PAGE_SIZE;
use crate::platform::CPtr;
use crate::platform::CapSpace;
use crate::platform::GuestVspace;
use crate::platform::HostMapping;
use crate::platform::HostVspace;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TouchError {
    #[error("{gpa:#x}+{len:#x} is not guest ram")]
    NotRam { gpa: u64, len: u64 },
    #[error("guest address {gpa:#x} is not backed by a frame")]
    NoFrame { gpa: u64 },
    #[error("failed to allocate a scratch capability slot")]
    AllocSlot(#[source] anyhow::Error),
    #[error("failed to duplicate the frame capability for {gpa:#x}")]
    CopyCap {
        gpa: u64,
        #[source]
        err: anyhow::Error,
    },
    #[error("failed to map the frame for {gpa:#x} into the host")]
    Map {
        gpa: u64,
        #[source]
        err: anyhow::Error,
    },
    #[error("failed to release the scratch frame for {gpa:#x}")]
    Release {
        gpa: u64,
        #[source]
        err: anyhow::Error,
    },
    #[error("touch callback failed at {gpa:#x}")]
    Callback {
        gpa: u64,
        #[source]
        err: anyhow::Error,
    },
    #[error("failed to allocate a private guest page")]
    PrivatePage(#[source] anyhow::Error),
}

/// The part of a touched range that falls within one guest page.
pub struct TouchChunk<'a> {
    /// Guest address of `data[0]`.
    pub gpa: u64,
    /// Offset of `data[0]` from the start of the touched range.
    pub offset: u64,
    pub data: &'a mut [u8],
}

/// Write access to guest memory via short-lived host mappings.
pub struct PageBridge<'a> {
    cspace: &'a mut dyn CapSpace,
    guest: &'a mut dyn GuestVspace,
    host: &'a mut dyn HostVspace,
}

impl<'a> PageBridge<'a> {
    pub fn new(
        cspace: &'a mut dyn CapSpace,
        guest: &'a mut dyn GuestVspace,
        host: &'a mut dyn HostVspace,
    ) -> Self {
        Self {
            cspace,
            guest,
            host,
        }
    }

    /// Calls `f` for each page-bounded chunk of `gpa..gpa + len`, in order.
    ///
    /// Chunks never cross a page boundary. The first chunk may start
    /// mid-page and the last may end mid-page. A zero length touches nothing.
    pub fn touch<F>(&mut self, gpa: u64, len: u64, mut f: F) -> Result<(), TouchError>
    where
        F: FnMut(TouchChunk<'_>) -> anyhow::Result<()>,
    {
        if len == 0 {
            return Ok(());
        }
        tracing::trace!(gpa, len, "touch");

        let mut scratch = ScratchFrame::new(&mut *self.cspace, &mut *self.host)?;
        let mut offset = 0;
        while offset < len {
            let chunk_gpa = gpa + offset;
            let page_offset = chunk_gpa % PAGE_SIZE;
            let chunk_len = (PAGE_SIZE - page_offset).min(len - offset);
            let page_gpa = chunk_gpa - page_offset;

            let frame = self
                .guest
                .frame_cap(page_gpa)
                .ok_or(TouchError::NoFrame { gpa: page_gpa })?;
            let page = scratch.map(page_gpa, frame)?;
            let data = &mut page[page_offset as usize..(page_offset + chunk_len) as usize];
            f(TouchChunk {
                gpa: chunk_gpa,
                offset,
                data,
            })
            .map_err(|err| TouchError::Callback {
                gpa: chunk_gpa,
                err,
            })?;
            scratch
                .release()
                .map_err(|err| TouchError::Release { gpa: page_gpa, err })?;

            offset += chunk_len;
        }
        Ok(())
    }

    pub fn write_at(&mut self, gpa: u64, data: &[u8]) -> Result<(), TouchError> {
        self.touch(gpa, data.len() as u64, |chunk| {
            let start = chunk.offset as usize;
            chunk
                .data
                .copy_from_slice(&data[start..start + chunk.data.len()]);
            Ok(())
        })
    }

    pub fn read_at(&mut self, gpa: u64, buf: &mut [u8]) -> Result<(), TouchError> {
        self.touch(gpa, buf.len() as u64, |chunk| {
            let start = chunk.offset as usize;
            buf[start..start + chunk.data.len()].copy_from_slice(chunk.data);
            Ok(())
        })
    }

    /// Allocates a zeroed frame and maps it into the guest outside of RAM.
    pub fn new_private_page(&mut self) -> Result<u64, TouchError> {
        let frame = self.cspace.alloc_frame().map_err(TouchError::PrivatePage)?;
        let gpa = self
            .guest
            .map_reserved_frame(frame)
            .map_err(TouchError::PrivatePage)?;
        tracing::debug!(gpa, "mapped private guest page");
        Ok(gpa)
    }
}

/// A scratch slot and, while a page is being touched, the host mapping of
/// the frame duplicated into it.
struct ScratchFrame<'a> {
    cspace: &'a mut dyn CapSpace,
    host: &'a mut dyn HostVspace,
    slot: CPtr,
    mapping: Option<HostMapping>,
}

impl<'a> ScratchFrame<'a> {
    fn new(cspace: &'a mut dyn CapSpace, host: &'a mut dyn HostVspace) -> Result<Self, TouchError> {
        let slot = cspace.alloc_slot().map_err(TouchError::AllocSlot)?;
        Ok(Self {
            cspace,
            host,
            slot,
            mapping: None,
        })
    }

    fn map(&mut self, gpa: u64, frame: CPtr) -> Result<&mut [u8], TouchError> {
        assert!(self.mapping.is_none());
        self.cspace
            .copy(self.slot, frame)
            .map_err(|err| TouchError::CopyCap { gpa, err })?;
        let mapping = match self.host.map_frame(self.slot) {
            Ok(mapping) => mapping,
            Err(err) => {
                if let Err(err) = self.cspace.delete(self.slot) {
                    tracing::error!(gpa, error = ?err, "failed to delete scratch capability");
                }
                return Err(TouchError::Map { gpa, err });
            }
        };
        let mapping = self.mapping.insert(mapping);
        Ok(self.host.frame_mut(mapping))
    }

    fn release(&mut self) -> anyhow::Result<()> {
        if let Some(mapping) = self.mapping.take() {
            self.host.unmap_frame(mapping);
            self.cspace.delete(self.slot)?;
        }
        Ok(())
    }
}

impl Drop for ScratchFrame<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::error!(error = ?err, "failed to release scratch frame");
        }
        self.cspace.free_slot(self.slot);
    }
}
