// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Patching absolute addresses in a kernel that was not loaded where it was
//! linked.
//!
//! The relocation table is the output of the Linux `relocs` tool for a 32-bit
//! kernel: a list of little endian 32-bit virtual addresses, each naming a
//! word in the image that holds an absolute address. The list is consumed
//! from the end of the file backwards and stops at the first zero word.

use crate::image::GuestImage;
use crate::memory::GuestMemory;
use crate::platform::FileProvider;
use crate::platform::OpenFile;
use crate::touch::TouchError;
use thiserror::Error;

/// How often progress is logged while patching.
const PROGRESS_INTERVAL: usize = 50000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kernel must be relocated but relocation table {0:?} was not found")]
    RelocationsNotFound(String),
    #[error("kernel must be relocated but has no relocations, was it built with CONFIG_RELOCATABLE?")]
    NotRelocatable,
    #[error("relocation table has no terminating zero entry")]
    TruncatedRelocations,
    #[error("relocation {vaddr:#x} is below the kernel link address {link_vaddr:#x}")]
    RelocationOutOfImage { vaddr: u32, link_vaddr: u64 },
    #[error("failed to read relocation table")]
    ReadTable(#[source] std::io::Error),
    #[error("failed to patch relocation at {gpa:#x}")]
    Patch {
        gpa: u64,
        #[source]
        err: TouchError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// What [`relocate_kernel`] did.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RelocationSummary {
    pub count: usize,
    /// The last table entry applied, which is the first entry in the file.
    pub last_vaddr: Option<u32>,
}

/// Table entries, read from the end of the file towards the start.
struct ReverseEntries<'f, 'a> {
    file: &'f OpenFile<'a>,
    /// File offset just past the next entry to read.
    cursor: u64,
    done: bool,
}

impl<'f, 'a> ReverseEntries<'f, 'a> {
    fn new(file: &'f OpenFile<'a>) -> Self {
        Self {
            file,
            cursor: file.len(),
            done: false,
        }
    }
}

impl Iterator for ReverseEntries<'_, '_> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cursor < 4 {
            self.done = true;
            return Some(Err(Error::TruncatedRelocations));
        }
        self.cursor -= 4;
        let mut word = [0; 4];
        if let Err(err) = self.file.read_at(self.cursor, &mut word) {
            self.done = true;
            return Some(Err(Error::ReadTable(err)));
        }
        match u32::from_le_bytes(word) {
            0 => {
                self.done = true;
                None
            }
            vaddr => Some(Ok(vaddr)),
        }
    }
}

/// Adds `delta` to every word named by the table in `file`.
pub(crate) fn apply_relocations(
    memory: &mut GuestMemory<'_>,
    file: &OpenFile<'_>,
    link_vaddr: u64,
    link_paddr: u64,
    delta: i64,
) -> Result<RelocationSummary> {
    let mut summary = RelocationSummary::default();
    for vaddr in ReverseEntries::new(file) {
        let vaddr = vaddr?;
        let image_offset = u64::from(vaddr)
            .checked_sub(link_vaddr)
            .ok_or(Error::RelocationOutOfImage { vaddr, link_vaddr })?;
        let gpa = link_paddr
            .wrapping_add(image_offset)
            .wrapping_add_signed(delta);

        let mut word = [0; 4];
        memory
            .read_at(gpa, &mut word)
            .map_err(|err| Error::Patch { gpa, err })?;
        // The guest is 32-bit, so the addition wraps at 4GiB.
        let patched = u32::from_le_bytes(word).wrapping_add(delta as u32);
        memory
            .write_at(gpa, &patched.to_le_bytes())
            .map_err(|err| Error::Patch { gpa, err })?;

        summary.count += 1;
        summary.last_vaddr = Some(vaddr);
        if summary.count % PROGRESS_INTERVAL == 0 {
            tracing::debug!(count = summary.count, "applying kernel relocations");
        }
    }
    Ok(summary)
}

/// Relocates a kernel that was loaded away from its link address.
///
/// Does nothing when the kernel was loaded where it was linked.
pub fn relocate_kernel(
    memory: &mut GuestMemory<'_>,
    image: &GuestImage,
    files: &dyn FileProvider,
    relocs: &str,
) -> Result<RelocationSummary> {
    if image.relocation_offset == 0 {
        return Ok(RelocationSummary::default());
    }
    tracing::info!(
        relocs,
        offset = image.relocation_offset,
        "relocating guest kernel"
    );

    let file =
        OpenFile::open(files, relocs).ok_or_else(|| Error::RelocationsNotFound(relocs.to_owned()))?;
    let summary = apply_relocations(
        memory,
        &file,
        image.link_vaddr,
        image.link_paddr,
        image.relocation_offset,
    )?;
    if summary.count == 0 {
        return Err(Error::NotRelocatable);
    }
    tracing::info!(
        count = summary.count,
        last_vaddr = summary.last_vaddr,
        "applied kernel relocations"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::apply_relocations;
    use super::relocate_kernel;
    use super::Error;
    use super::RelocationSummary;
    use crate::image::GuestImage;
    use crate::platform::OpenFile;
    use crate::sim::Sim;
    use crate::sim::SimFiles;
    use crate::test_helpers::relocation_table;

    const LINK_VADDR: u64 = 0xC010_0000;
    const LINK_PADDR: u64 = 0x10_0000;

    fn image(load_paddr: u64) -> GuestImage {
        GuestImage {
            link_paddr: LINK_PADDR,
            link_vaddr: LINK_VADDR,
            load_paddr,
            relocation_offset: load_paddr as i64 - LINK_PADDR as i64,
            ..Default::default()
        }
    }

    #[test]
    fn test_relocate() {
        crate::test_helpers::init_tracing();
        let files = SimFiles::new().with_file(
            "vmlinux.relocs",
            relocation_table(&[0xC010_0010, 0xC010_0ffe, 0xC010_2000]),
        );
        let mut sim = Sim::new([0..0x100_0000]).unwrap();
        let summary = {
            let mut memory = sim.memory();
            // The loaded copy of the kernel sits 1MiB above its link address.
            memory.write_at(0x20_0010, &0xC010_1234u32.to_le_bytes()).unwrap();
            memory.write_at(0x20_0ffe, &0xC010_0000u32.to_le_bytes()).unwrap();
            memory.write_at(0x20_2000, &0xFFFF_FFF0u32.to_le_bytes()).unwrap();
            relocate_kernel(&mut memory, &image(0x20_0000), &files, "vmlinux.relocs").unwrap()
        };
        assert_eq!(
            summary,
            RelocationSummary {
                count: 3,
                last_vaddr: Some(0xC010_2000),
            }
        );
        assert_eq!(sim.read_u32(0x20_0010), 0xC020_1234);
        // Straddles a page boundary.
        assert_eq!(sim.read_u32(0x20_0ffe), 0xC020_0000);
        assert_eq!(sim.read_u32(0x20_2000), 0x000F_FFF0);
        assert_eq!(files.open_count(), 0);
        assert_eq!(sim.live_slots(), 0);
    }

    #[test]
    fn test_relocate_down() {
        let files = SimFiles::new().with_file("relocs", relocation_table(&[0xC010_0004]));
        let mut sim = Sim::new([0..0x100_0000]).unwrap();
        {
            let mut memory = sim.memory();
            memory.write_at(0x8_0004, &0xC010_0100u32.to_le_bytes()).unwrap();
            relocate_kernel(&mut memory, &image(0x8_0000), &files, "relocs").unwrap();
        }
        assert_eq!(sim.read_u32(0x8_0004), 0xC008_0100);
    }

    #[test]
    fn test_no_offset_is_noop() {
        let files = SimFiles::new();
        let mut sim = Sim::new([0..0x100_0000]).unwrap();
        let mut memory = sim.memory();
        let summary = relocate_kernel(&mut memory, &image(LINK_PADDR), &files, "missing").unwrap();
        assert_eq!(summary, RelocationSummary::default());
    }

    #[test]
    fn test_zero_delta_leaves_words() {
        let files = SimFiles::new().with_file("relocs", relocation_table(&[0xC010_0000, 0xC010_0008]));
        let mut sim = Sim::new([0..0x100_0000]).unwrap();
        {
            let mut memory = sim.memory();
            memory.write_at(0x10_0000, &[0x11; 16]).unwrap();
            let file = OpenFile::open(&files, "relocs").unwrap();
            let summary = apply_relocations(&mut memory, &file, LINK_VADDR, LINK_PADDR, 0).unwrap();
            assert_eq!(summary.count, 2);
        }
        assert_eq!(sim.read(0x10_0000, 16), vec![0x11; 16]);
    }

    #[test]
    fn test_relocation_errors() {
        let files = SimFiles::new()
            .with_file("empty", relocation_table(&[]))
            .with_file("unterminated", 0xC010_0000u32.to_le_bytes().to_vec())
            .with_file("below", relocation_table(&[0xC000_0000]));
        let mut sim = Sim::new([0..0x100_0000]).unwrap();
        let mut memory = sim.memory();
        let image = image(0x20_0000);

        assert!(matches!(
            relocate_kernel(&mut memory, &image, &files, "missing").unwrap_err(),
            Error::RelocationsNotFound(name) if name == "missing"
        ));
        assert!(matches!(
            relocate_kernel(&mut memory, &image, &files, "empty").unwrap_err(),
            Error::NotRelocatable
        ));
        assert!(matches!(
            relocate_kernel(&mut memory, &image, &files, "unterminated").unwrap_err(),
            Error::TruncatedRelocations
        ));
        assert!(matches!(
            relocate_kernel(&mut memory, &image, &files, "below").unwrap_err(),
            Error::RelocationOutOfImage {
                vaddr: 0xC000_0000,
                ..
            }
        ));
        assert_eq!(files.open_count(), 0);
    }
}
