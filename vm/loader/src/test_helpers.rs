// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared test setup: tracing output and small ELF and relocation files.

use object::elf;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Initializes `tracing` for tests.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = if let Ok(var) = std::env::var("RUST_LOG") {
            var.parse().unwrap()
        } else {
            Targets::new().with_default(LevelFilter::DEBUG)
        };
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}

pub struct Segment {
    paddr: u64,
    vaddr: u64,
    data: Vec<u8>,
    mem_size: u64,
}

impl Segment {
    pub fn new(paddr: u64, vaddr: u64, data: Vec<u8>, mem_size: u64) -> Self {
        Self {
            paddr,
            vaddr,
            data,
            mem_size,
        }
    }
}

/// Builds minimal little endian x86 executables with only program headers.
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    fn data_offsets(&self, headers_len: usize) -> Vec<usize> {
        let mut offset = headers_len;
        self.segments
            .iter()
            .map(|s| {
                offset = offset.next_multiple_of(16);
                let this = offset;
                offset += s.data.len();
                this
            })
            .collect()
    }

    fn finish(&self, mut out: Vec<u8>, offsets: &[usize]) -> Vec<u8> {
        for (segment, &offset) in self.segments.iter().zip(offsets) {
            out.resize(offset, 0);
            out.extend_from_slice(&segment.data);
        }
        out
    }

    fn ident(class: u8) -> [u8; 16] {
        let mut ident = [0; 16];
        ident[..4].copy_from_slice(&elf::ELFMAG);
        ident[4] = class;
        ident[5] = elf::ELFDATA2LSB;
        ident[6] = elf::EV_CURRENT;
        ident
    }

    pub fn build32(&self) -> Vec<u8> {
        const EHDR: usize = 52;
        const PHDR: usize = 32;
        let offsets = self.data_offsets(EHDR + PHDR * self.segments.len());

        let mut out = Vec::new();
        out.extend_from_slice(&Self::ident(elf::ELFCLASS32));
        out.extend_from_slice(&elf::ET_EXEC.to_le_bytes());
        out.extend_from_slice(&elf::EM_386.to_le_bytes());
        out.extend_from_slice(&u32::from(elf::EV_CURRENT).to_le_bytes());
        out.extend_from_slice(&(self.entry as u32).to_le_bytes());
        out.extend_from_slice(&(EHDR as u32).to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]); // no section headers
        assert_eq!(out.len(), EHDR);

        for (segment, &offset) in self.segments.iter().zip(&offsets) {
            for word in [
                elf::PT_LOAD,
                offset as u32,
                segment.vaddr as u32,
                segment.paddr as u32,
                segment.data.len() as u32,
                segment.mem_size as u32,
                elf::PF_R | elf::PF_W | elf::PF_X,
                0x1000,
            ] {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        self.finish(out, &offsets)
    }

    pub fn build64(&self) -> Vec<u8> {
        const EHDR: usize = 64;
        const PHDR: usize = 56;
        let offsets = self.data_offsets(EHDR + PHDR * self.segments.len());

        let mut out = Vec::new();
        out.extend_from_slice(&Self::ident(elf::ELFCLASS64));
        out.extend_from_slice(&elf::ET_EXEC.to_le_bytes());
        out.extend_from_slice(&elf::EM_X86_64.to_le_bytes());
        out.extend_from_slice(&u32::from(elf::EV_CURRENT).to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(EHDR as u64).to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]);
        assert_eq!(out.len(), EHDR);

        for (segment, &offset) in self.segments.iter().zip(&offsets) {
            out.extend_from_slice(&elf::PT_LOAD.to_le_bytes());
            out.extend_from_slice(&(elf::PF_R | elf::PF_W | elf::PF_X).to_le_bytes());
            for word in [
                offset as u64,
                segment.vaddr,
                segment.paddr,
                segment.data.len() as u64,
                segment.mem_size,
                0x1000,
            ] {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        self.finish(out, &offsets)
    }
}

/// A relocation table that yields `vaddrs` in order when read from the end.
pub fn relocation_table(vaddrs: &[u32]) -> Vec<u8> {
    std::iter::once(0)
        .chain(vaddrs.iter().rev().copied())
        .flat_map(u32::to_le_bytes)
        .collect()
}
