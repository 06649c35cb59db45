// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest RAM bookkeeping and write access to guest memory.

use crate::touch::PageBridge;
use crate::touch::TouchChunk;
use crate::touch::TouchError;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Size of a guest page.
pub const PAGE_SIZE: u64 = 4096;

/// Guest RAM must sit below 4GiB, where a 32-bit guest and its E820 map can
/// reach it.
pub const RAM_LIMIT: u64 = 1 << 32;

/// Rounds `value` up to a multiple of `alignment`, which must be a power of two.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    assert!(alignment.is_power_of_two(), "{alignment:#x} is not a power of two");
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no free guest ram region can hold {size:#x} bytes")]
    OutOfMemory { size: u64 },
    #[error("guest ram region {start:#x}-{end:#x} is empty, unsorted, overlaps its predecessor or ends above 4GiB")]
    InvalidRegion { start: u64, end: u64 },
}

/// A contiguous range of guest RAM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RamRegion {
    pub start: u64,
    pub size: u64,
    /// Whether something has been placed in this region.
    pub allocated: bool,
}

impl RamRegion {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    fn contains(&self, start: u64, size: u64) -> bool {
        self.start <= start && start + size <= self.end()
    }
}

/// The guest's RAM map, kept sorted and coalesced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestRam {
    regions: Vec<RamRegion>,
}

impl GuestRam {
    /// Creates a RAM map with every range free.
    ///
    /// Ranges must be non-empty, sorted, non-overlapping and below
    /// [`RAM_LIMIT`]. Adjacent ranges are merged.
    pub fn new(ranges: impl IntoIterator<Item = Range<u64>>) -> Result<Self, Error> {
        let mut regions: Vec<RamRegion> = Vec::new();
        for range in ranges {
            let prev_end = regions.last().map_or(0, |r| r.end());
            if range.start >= range.end || range.start < prev_end || range.end > RAM_LIMIT {
                return Err(Error::InvalidRegion {
                    start: range.start,
                    end: range.end,
                });
            }
            regions.push(RamRegion {
                start: range.start,
                size: range.end - range.start,
                allocated: false,
            });
        }
        let mut ram = Self { regions };
        ram.coalesce();
        Ok(ram)
    }

    pub fn regions(&self) -> &[RamRegion] {
        &self.regions
    }

    /// Returns true if every byte of `gpa..gpa + len` is guest RAM.
    pub fn contains(&self, gpa: u64, len: u64) -> bool {
        let Some(end) = gpa.checked_add(len) else {
            return false;
        };
        let mut cursor = gpa;
        for region in &self.regions {
            if cursor >= end {
                break;
            }
            if region.start <= cursor && cursor < region.end() {
                cursor = region.end();
            }
        }
        cursor >= end
    }

    /// The largest free region, preferring the lowest address on ties.
    pub fn largest_free_region(&self) -> Option<RamRegion> {
        self.regions
            .iter()
            .filter(|r| !r.allocated)
            .fold(None, |best: Option<&RamRegion>, r| match best {
                Some(best) if best.size >= r.size => Some(best),
                _ => Some(r),
            })
            .copied()
    }

    pub fn largest_free_region_start(&self) -> Option<u64> {
        self.largest_free_region().map(|r| r.start)
    }

    /// Reserves `size` bytes at the start of the first free region large
    /// enough to hold them.
    pub fn allocate(&mut self, size: u64) -> Result<u64, Error> {
        let start = self
            .regions
            .iter()
            .find(|r| !r.allocated && r.size >= size)
            .map(|r| r.start)
            .ok_or(Error::OutOfMemory { size })?;
        self.mark_allocated(start, size);
        Ok(start)
    }

    /// Marks `start..start + size` as allocated.
    ///
    /// Panics if the range is not entirely inside a single free region.
    #[track_caller]
    pub fn mark_allocated(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        let index = self
            .regions
            .iter()
            .position(|r| !r.allocated && r.contains(start, size))
            .unwrap_or_else(|| {
                panic!(
                    "{start:#x}-{:#x} is not inside a free guest ram region",
                    start.wrapping_add(size)
                )
            });

        let region = self.regions[index];
        let pieces = [
            RamRegion {
                start: region.start,
                size: start - region.start,
                allocated: false,
            },
            RamRegion {
                start,
                size,
                allocated: true,
            },
            RamRegion {
                start: start + size,
                size: region.end() - (start + size),
                allocated: false,
            },
        ];
        self.regions
            .splice(index..=index, pieces.into_iter().filter(|r| r.size != 0));
        self.coalesce();
    }

    fn coalesce(&mut self) {
        self.regions.dedup_by(|next, prev| {
            if prev.allocated == next.allocated && prev.end() == next.start {
                prev.size += next.size;
                true
            } else {
                false
            }
        });
    }
}

impl fmt::Display for GuestRam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for region in &self.regions {
            writeln!(
                f,
                "{:#x}-{:#x} {}",
                region.start,
                region.end(),
                if region.allocated { "allocated" } else { "free" }
            )?;
        }
        Ok(())
    }
}

/// Guest RAM plus the means to write into it.
pub struct GuestMemory<'a> {
    ram: GuestRam,
    bridge: PageBridge<'a>,
}

impl<'a> GuestMemory<'a> {
    pub fn new(ram: GuestRam, bridge: PageBridge<'a>) -> Self {
        Self { ram, bridge }
    }

    pub fn ram(&self) -> &GuestRam {
        &self.ram
    }

    pub fn into_ram(self) -> GuestRam {
        self.ram
    }

    pub fn bridge(&mut self) -> &mut PageBridge<'a> {
        &mut self.bridge
    }

    pub fn allocate(&mut self, size: u64) -> Result<u64, Error> {
        let gpa = self.ram.allocate(size)?;
        tracing::trace!(gpa, size, "allocated guest ram");
        Ok(gpa)
    }

    #[track_caller]
    pub fn mark_allocated(&mut self, start: u64, size: u64) {
        self.ram.mark_allocated(start, size)
    }

    /// Runs `f` over `gpa..gpa + len` one page-bounded chunk at a time.
    ///
    /// The whole range must be guest RAM.
    pub fn touch<F>(&mut self, gpa: u64, len: u64, f: F) -> Result<(), TouchError>
    where
        F: FnMut(TouchChunk<'_>) -> anyhow::Result<()>,
    {
        if !self.ram.contains(gpa, len) {
            return Err(TouchError::NotRam { gpa, len });
        }
        self.bridge.touch(gpa, len, f)
    }

    pub fn write_at(&mut self, gpa: u64, data: &[u8]) -> Result<(), TouchError> {
        if !self.ram.contains(gpa, data.len() as u64) {
            return Err(TouchError::NotRam {
                gpa,
                len: data.len() as u64,
            });
        }
        self.bridge.write_at(gpa, data)
    }

    pub fn read_at(&mut self, gpa: u64, buf: &mut [u8]) -> Result<(), TouchError> {
        if !self.ram.contains(gpa, buf.len() as u64) {
            return Err(TouchError::NotRam {
                gpa,
                len: buf.len() as u64,
            });
        }
        self.bridge.read_at(gpa, buf)
    }
}
