// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loading the guest kernel's ELF segments into guest RAM.

use crate::image::GuestImage;
use crate::memory::align_up;
use crate::memory::GuestMemory;
use crate::platform::FileProvider;
use crate::platform::OpenFile;
use crate::touch::TouchError;
use object::elf;
use object::read::elf::FileHeader;
use object::read::elf::ProgramHeader;
use object::FileKind;
use object::LittleEndian;
use object::ReadCache;
use object::ReadRef;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kernel image {0:?} not found")]
    ImageNotFound(String),
    #[error("failed to read file header")]
    ReadFileHeader(#[source] object::read::Error),
    #[error("kernel image is not an ELF file")]
    NotElf,
    #[error("unsupported ELF file byte order")]
    BigEndianElfOnLittle,
    #[error("ELF machine {0:#x} is not x86")]
    TargetMachineMismatch(u16),
    #[error("failed to parse ELF program header")]
    InvalidProgramHeader(#[source] object::read::Error),
    #[error("kernel image has no loadable segments")]
    NoLoadableSegments,
    #[error("segment at {paddr:#x} has file size {file_size:#x} larger than its memory size {mem_size:#x}")]
    FileSizeExceedsMemSize {
        paddr: u64,
        file_size: u64,
        mem_size: u64,
    },
    #[error("segment at {paddr:#x} extends past the end of the kernel image")]
    SegmentOutOfFile { paddr: u64 },
    #[error("kernel image needs {size:#x} bytes at {load_paddr:#x}, which does not fit in guest ram")]
    OutOfMemory { load_paddr: u64, size: u64 },
    #[error("kernel alignment {0:#x} is not a power of two")]
    InvalidAlignment(u64),
    #[error("adding load offset {offset:#x} to {addr:#x} overflowed")]
    LoadOffsetOverflow { addr: u64, offset: i64 },
    #[error("failed to copy segment to {gpa:#x}")]
    CopySegment {
        gpa: u64,
        #[source]
        err: TouchError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct LoadSegment {
    offset: u64,
    paddr: u64,
    vaddr: u64,
    file_size: u64,
    mem_size: u64,
}

#[derive(Debug)]
struct ParsedImage {
    entry: u64,
    segments: Vec<LoadSegment>,
}

impl ParsedImage {
    fn link_paddr(&self) -> u64 {
        self.segments.iter().map(|s| s.paddr).min().unwrap_or(0)
    }

    fn link_vaddr(&self) -> u64 {
        self.segments.iter().map(|s| s.vaddr).min().unwrap_or(0)
    }

    /// Bytes from the lowest segment start to the highest segment end.
    fn span(&self) -> u64 {
        let end = self
            .segments
            .iter()
            .map(|s| s.paddr + s.mem_size)
            .max()
            .unwrap_or(0);
        end - self.link_paddr()
    }
}

fn parse<'data, Elf: FileHeader<Endian = LittleEndian>, R: ReadRef<'data>>(
    data: R,
    file_len: u64,
) -> Result<ParsedImage> {
    let ehdr = Elf::parse(data).map_err(Error::ReadFileHeader)?;
    let endian = ehdr.endian().map_err(|_| Error::BigEndianElfOnLittle)?;

    let machine = ehdr.e_machine(endian);
    let expected = if ehdr.is_type_64() {
        elf::EM_X86_64
    } else {
        elf::EM_386
    };
    if machine != expected {
        tracing::error!(machine, "ELF file target machine mismatch, was the file built for x86?");
        return Err(Error::TargetMachineMismatch(machine));
    }

    let mut segments = Vec::new();
    for phdr in ehdr
        .program_headers(endian, data)
        .map_err(Error::InvalidProgramHeader)?
    {
        if phdr.p_type(endian) != elf::PT_LOAD {
            continue;
        }
        let segment = LoadSegment {
            offset: phdr.p_offset(endian).into(),
            paddr: phdr.p_paddr(endian).into(),
            vaddr: phdr.p_vaddr(endian).into(),
            file_size: phdr.p_filesz(endian).into(),
            mem_size: phdr.p_memsz(endian).into(),
        };
        if segment.file_size > segment.mem_size {
            return Err(Error::FileSizeExceedsMemSize {
                paddr: segment.paddr,
                file_size: segment.file_size,
                mem_size: segment.mem_size,
            });
        }
        if segment
            .offset
            .checked_add(segment.file_size)
            .map_or(true, |end| end > file_len)
            || segment.paddr.checked_add(segment.mem_size).is_none()
        {
            return Err(Error::SegmentOutOfFile {
                paddr: segment.paddr,
            });
        }
        segments.push(segment);
    }
    if segments.is_empty() {
        return Err(Error::NoLoadableSegments);
    }

    Ok(ParsedImage {
        entry: ehdr.e_entry(endian).into(),
        segments,
    })
}

fn relocate(addr: u64, offset: i64) -> Result<u64> {
    addr.checked_add_signed(offset)
        .ok_or(Error::LoadOffsetOverflow { addr, offset })
}

/// Copies the segment's file bytes to `gpa` and zero fills the rest of its
/// memory size.
fn copy_segment(
    memory: &mut GuestMemory<'_>,
    file: &OpenFile<'_>,
    segment: &LoadSegment,
    gpa: u64,
) -> Result<()> {
    assert!(segment.file_size <= segment.mem_size);
    memory
        .touch(gpa, segment.mem_size, |chunk| {
            let from_file = segment
                .file_size
                .saturating_sub(chunk.offset)
                .min(chunk.data.len() as u64) as usize;
            let (file_part, zero_part) = chunk.data.split_at_mut(from_file);
            // Past the end of the file bytes, only bss remains.
            if !file_part.is_empty() {
                file.read_at(segment.offset + chunk.offset, file_part)?;
            }
            zero_part.fill(0);
            Ok(())
        })
        .map_err(|err| Error::CopySegment { gpa, err })
}

/// Loads the ELF kernel `name` at the start of the largest free RAM region,
/// rounded up to `alignment`.
///
/// Every loadable segment keeps its position relative to the lowest one, so
/// the whole image moves by a single offset. The returned image has the
/// link, load and entry addresses filled in.
pub fn load_elf(
    memory: &mut GuestMemory<'_>,
    files: &dyn FileProvider,
    name: &str,
    alignment: u64,
) -> Result<GuestImage> {
    if !alignment.is_power_of_two() {
        return Err(Error::InvalidAlignment(alignment));
    }
    let mut file =
        OpenFile::open(files, name).ok_or_else(|| Error::ImageNotFound(name.to_owned()))?;
    let file_len = file.len();

    let image = {
        let reader = ReadCache::new(&mut file);
        match FileKind::parse(&reader).map_err(Error::ReadFileHeader)? {
            FileKind::Elf32 => parse::<elf::FileHeader32<LittleEndian>, _>(&reader, file_len)?,
            FileKind::Elf64 => parse::<elf::FileHeader64<LittleEndian>, _>(&reader, file_len)?,
            _ => return Err(Error::NotElf),
        }
    };

    let link_paddr = image.link_paddr();
    let span = image.span();
    let region = memory
        .ram()
        .largest_free_region()
        .ok_or(Error::OutOfMemory {
            load_paddr: 0,
            size: span,
        })?;
    let load_paddr = align_up(region.start, alignment);
    if load_paddr
        .checked_add(span)
        .map_or(true, |end| end > region.end())
    {
        return Err(Error::OutOfMemory {
            load_paddr,
            size: span,
        });
    }
    let offset = load_paddr.wrapping_sub(link_paddr) as i64;

    for segment in image.segments.iter().filter(|s| s.mem_size != 0) {
        let gpa = relocate(segment.paddr, offset)?;
        tracing::debug!(
            gpa,
            file_size = segment.file_size,
            mem_size = segment.mem_size,
            "loading kernel segment"
        );
        copy_segment(memory, &file, segment, gpa)?;
        memory.mark_allocated(gpa, segment.mem_size);
    }

    let entry = relocate(image.entry, offset)?;
    tracing::info!(
        name,
        link_paddr,
        load_paddr,
        offset,
        entry,
        "loaded guest kernel"
    );

    Ok(GuestImage {
        link_paddr,
        link_vaddr: image.link_vaddr(),
        load_paddr,
        relocation_offset: offset,
        entry,
        alignment,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::load_elf;
    use super::Error;
    use crate::memory::RamRegion;
    use crate::sim::Sim;
    use crate::sim::SimFiles;
    use crate::test_helpers::ElfBuilder;
    use crate::test_helpers::Segment;

    fn kernel_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_load_at_aligned_free_start() {
        crate::test_helpers::init_tracing();
        let text = kernel_bytes(0x1000);
        let kernel = ElfBuilder::new(0x100000)
            .segment(Segment::new(0x100000, 0xC010_0000, text.clone(), 0x2000))
            .build32();
        let files = SimFiles::new().with_file("kernel", kernel);

        let mut sim = Sim::new([0..0x1000_0000]).unwrap();
        {
            let mut memory = sim.memory();
            // Stale contents that the bss must overwrite.
            memory.write_at(0x201000, &[0xcc; 0x1000]).unwrap();
            memory.mark_allocated(0, 0x180000);

            let image = load_elf(&mut memory, &files, "kernel", 0x200000).unwrap();
            assert_eq!(image.link_paddr, 0x100000);
            assert_eq!(image.link_vaddr, 0xC010_0000);
            assert_eq!(image.load_paddr, 0x200000);
            assert_eq!(image.relocation_offset, 0x100000);
            assert_eq!(image.entry, 0x200000);
            assert_eq!(image.alignment, 0x200000);
            assert_eq!(
                memory.ram().regions()[2],
                RamRegion {
                    start: 0x200000,
                    size: 0x2000,
                    allocated: true
                }
            );
        }
        assert_eq!(sim.read(0x200000, 0x1000), text);
        assert_eq!(sim.read(0x201000, 0x1000), vec![0; 0x1000]);
        assert_eq!(files.open_count(), 0);
        assert_eq!(sim.live_slots(), 0);
    }

    #[test]
    fn test_load_without_relocation() {
        let kernel = ElfBuilder::new(0x400010)
            .segment(Segment::new(0x400000, 0xC040_0000, kernel_bytes(0x1234), 0x1234))
            .build32();
        let files = SimFiles::new().with_file("kernel", kernel);
        let mut sim = Sim::new([0x400000..0x800000]).unwrap();
        let mut memory = sim.memory();
        let image = load_elf(&mut memory, &files, "kernel", 0x400000).unwrap();
        assert_eq!(image.load_paddr, 0x400000);
        assert_eq!(image.relocation_offset, 0);
        assert_eq!(image.entry, 0x400010);
    }

    #[test]
    fn test_load_multiple_segments_64() {
        let text = kernel_bytes(0x1800);
        let data = kernel_bytes(0x200);
        let kernel = ElfBuilder::new(0x1000020)
            .segment(Segment::new(0x1000000, 0xFFFF_FFFF_8100_0000, text.clone(), 0x1800))
            .segment(Segment::new(0x1003000, 0xFFFF_FFFF_8100_3000, data.clone(), 0x1000))
            .segment(Segment::new(0x1005000, 0xFFFF_FFFF_8100_5000, Vec::new(), 0))
            .build64();
        let files = SimFiles::new().with_file("kernel", kernel);
        let mut sim = Sim::new([0x1000..0x9f000, 0x100000..0x800000]).unwrap();
        let image = {
            let mut memory = sim.memory();
            load_elf(&mut memory, &files, "kernel", 0x200000).unwrap()
        };
        assert_eq!(image.load_paddr, 0x200000);
        assert_eq!(image.relocation_offset, 0x200000 - 0x1000000);
        assert_eq!(image.entry, 0x200020);
        assert_eq!(sim.read(0x200000, 0x1800), text);
        assert_eq!(sim.read(0x203000, 0x200), data);
        assert_eq!(sim.read(0x203200, 0xe00), vec![0; 0xe00]);
    }

    #[test]
    fn test_missing_image() {
        let files = SimFiles::new();
        let mut sim = Sim::new([0..0x100000]).unwrap();
        let mut memory = sim.memory();
        let err = load_elf(&mut memory, &files, "kernel", 0x1000).unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(name) if name == "kernel"));
    }

    #[test]
    fn test_invalid_images() {
        let mut sim = Sim::new([0..0x100000]).unwrap();
        let mut memory = sim.memory();

        let mut wrong_machine = ElfBuilder::new(0)
            .segment(Segment::new(0, 0, vec![1; 16], 16))
            .build32();
        wrong_machine[18] = 0x28;

        let oversized_file = ElfBuilder::new(0)
            .segment(Segment::new(0, 0, vec![1; 32], 16))
            .build32();

        let files = SimFiles::new()
            .with_file("garbage", b"this is not an elf file".to_vec())
            .with_file("machine", wrong_machine)
            .with_file("filesz", oversized_file)
            .with_file("empty", ElfBuilder::new(0).build32());

        assert!(matches!(
            load_elf(&mut memory, &files, "garbage", 0x1000).unwrap_err(),
            Error::ReadFileHeader(_)
        ));
        assert!(matches!(
            load_elf(&mut memory, &files, "machine", 0x1000).unwrap_err(),
            Error::TargetMachineMismatch(0x28)
        ));
        assert!(matches!(
            load_elf(&mut memory, &files, "filesz", 0x1000).unwrap_err(),
            Error::FileSizeExceedsMemSize { .. }
        ));
        assert!(matches!(
            load_elf(&mut memory, &files, "empty", 0x1000).unwrap_err(),
            Error::NoLoadableSegments
        ));
        assert_eq!(files.open_count(), 0);
    }

    #[test]
    fn test_image_too_large() {
        let kernel = ElfBuilder::new(0x100000)
            .segment(Segment::new(0x100000, 0x100000, vec![0; 16], 0x100000))
            .build32();
        let files = SimFiles::new().with_file("kernel", kernel);
        let mut sim = Sim::new([0x1000..0x180000]).unwrap();
        let mut memory = sim.memory();

        // Rounding 0x1000 up to 2MiB pushes the image past the end of ram.
        let err = load_elf(&mut memory, &files, "kernel", 0x200000).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfMemory {
                load_paddr: 0x200000,
                size: 0x100000
            }
        ));

        let image = load_elf(&mut memory, &files, "kernel", 0x1000).unwrap();
        assert_eq!(image.load_paddr, 0x1000);

        // Only 0x7f000 bytes remain.
        let err = load_elf(&mut memory, &files, "kernel", 0x1000).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfMemory {
                load_paddr: 0x101000,
                size: 0x100000
            }
        ));
    }

    #[test]
    fn test_bss_past_end_of_file() {
        let text = kernel_bytes(0x2000);
        let data = vec![7; 0x1000];
        let kernel = ElfBuilder::new(0x100000)
            .segment(Segment::new(0x100000, 0xC010_0000, text.clone(), 0x3000))
            .segment(Segment::new(0x103000, 0xC010_3000, data.clone(), 0x5800))
            .build32();
        let files = SimFiles::new().with_file("kernel", kernel);
        let mut sim = Sim::new([0..0x1000_0000]).unwrap();
        {
            let mut memory = sim.memory();
            memory.write_at(0x200000, &[0xcc; 0x9000]).unwrap();
            memory.mark_allocated(0, 0x180000);
            let image = load_elf(&mut memory, &files, "kernel", 0x200000).unwrap();
            assert_eq!(image.load_paddr, 0x200000);
            assert_eq!(
                memory.ram().regions()[2],
                RamRegion {
                    start: 0x200000,
                    size: 0x8800,
                    allocated: true
                }
            );
        }
        assert_eq!(sim.read(0x200000, 0x2000), text);
        assert_eq!(sim.read(0x202000, 0x1000), vec![0; 0x1000]);
        assert_eq!(sim.read(0x203000, 0x1000), data);
        // Several pages of bss after the last file byte.
        assert_eq!(sim.read(0x204000, 0x4800), vec![0; 0x4800]);
        assert_eq!(sim.read(0x208800, 0x800), vec![0xcc; 0x800]);
        assert_eq!(files.open_count(), 0);
        assert_eq!(sim.live_slots(), 0);
    }

    #[test]
    fn test_invalid_alignment() {
        let kernel = ElfBuilder::new(0)
            .segment(Segment::new(0, 0, vec![1; 16], 16))
            .build32();
        let files = SimFiles::new().with_file("kernel", kernel);
        let mut sim = Sim::new([0..0x100000]).unwrap();
        let mut memory = sim.memory();
        for alignment in [0, 0x300000] {
            assert!(matches!(
                load_elf(&mut memory, &files, "kernel", alignment).unwrap_err(),
                Error::InvalidAlignment(a) if a == alignment
            ));
        }
        assert_eq!(files.open_count(), 0);
    }
}
