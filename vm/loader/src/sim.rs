// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory platform for exercising the loader without a hypervisor.
//!
//! Guest frames are heap buffers created on first use, so large RAM maps cost
//! nothing until they are written. The capability space counts live scratch
//! slots and the host address space counts live mappings, which lets tests
//! check that every touch cleans up after itself.

use crate::memory::GuestMemory;
use crate::memory::GuestRam;
use crate::memory::PAGE_SIZE;
use crate::platform::AcpiBuilder;
use crate::platform::CPtr;
use crate::platform::CapSpace;
use crate::platform::FileHandle;
use crate::platform::FileProvider;
use crate::platform::GuestVspace;
use crate::platform::HostMapping;
use crate::platform::HostVspace;
use crate::platform::Platform;
use crate::platform::VbeModeInfo;
use crate::platform::VideoModeProvider;
use crate::touch::PageBridge;
use anyhow::Context;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::ops::Range;
use std::rc::Rc;

/// Capabilities at or above this value name guest RAM frames directly.
const RAM_CAP_BASE: u64 = 1 << 40;
/// Frame ids at or above this value are private frames rather than RAM.
const PRIVATE_FRAME_BASE: u64 = 1 << 52;
/// Where private pages are mapped in the guest.
const RESERVED_GPA_BASE: u64 = 0xF000_0000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct FrameId(u64);

#[derive(Default)]
struct SimState {
    ram: Vec<Range<u64>>,
    frames: HashMap<FrameId, Box<[u8]>>,
    /// Capabilities copied into slots.
    copies: HashMap<CPtr, FrameId>,
    /// Capabilities to frames from `alloc_frame`.
    private: HashMap<CPtr, FrameId>,
    reserved: BTreeMap<u64, CPtr>,
    next_slot: u64,
    next_private_frame: u64,
    live_slots: usize,
    peak_live_slots: usize,
}

impl SimState {
    fn is_ram(&self, gpa: u64) -> bool {
        self.ram.iter().any(|r| r.contains(&gpa))
    }

    fn resolve(&self, cap: CPtr) -> Option<FrameId> {
        if let Some(&frame) = self.copies.get(&cap).or_else(|| self.private.get(&cap)) {
            return Some(frame);
        }
        (cap.0 >= RAM_CAP_BASE).then(|| FrameId(cap.0 - RAM_CAP_BASE))
    }

    fn guest_frame(&self, gpa: u64) -> Option<FrameId> {
        let page = gpa - gpa % PAGE_SIZE;
        if self.is_ram(page) {
            Some(FrameId(page / PAGE_SIZE))
        } else {
            self.resolve(*self.reserved.get(&page)?)
        }
    }
}

pub struct SimCapSpace {
    state: Rc<RefCell<SimState>>,
}

impl CapSpace for SimCapSpace {
    fn alloc_slot(&mut self) -> anyhow::Result<CPtr> {
        let mut state = self.state.borrow_mut();
        state.next_slot += 1;
        state.live_slots += 1;
        state.peak_live_slots = state.peak_live_slots.max(state.live_slots);
        Ok(CPtr(state.next_slot))
    }

    fn free_slot(&mut self, slot: CPtr) {
        let mut state = self.state.borrow_mut();
        assert!(!state.copies.contains_key(&slot), "freeing occupied slot {slot:?}");
        state.live_slots = state
            .live_slots
            .checked_sub(1)
            .unwrap_or_else(|| panic!("freeing slot {slot:?} with none allocated"));
    }

    fn copy(&mut self, dest: CPtr, src: CPtr) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        let frame = state
            .resolve(src)
            .with_context(|| format!("{src:?} is not a frame capability"))?;
        anyhow::ensure!(!state.copies.contains_key(&dest), "{dest:?} is occupied");
        state.copies.insert(dest, frame);
        Ok(())
    }

    fn delete(&mut self, slot: CPtr) -> anyhow::Result<()> {
        self.state
            .borrow_mut()
            .copies
            .remove(&slot)
            .with_context(|| format!("{slot:?} is empty"))?;
        Ok(())
    }

    fn alloc_frame(&mut self) -> anyhow::Result<CPtr> {
        let mut state = self.state.borrow_mut();
        state.next_slot += 1;
        let cap = CPtr(state.next_slot);
        let frame = FrameId(PRIVATE_FRAME_BASE + state.next_private_frame);
        state.next_private_frame += 1;
        state.private.insert(cap, frame);
        Ok(cap)
    }
}

pub struct SimGuestVspace {
    state: Rc<RefCell<SimState>>,
}

impl GuestVspace for SimGuestVspace {
    fn frame_cap(&self, gpa: u64) -> Option<CPtr> {
        let state = self.state.borrow();
        if state.is_ram(gpa) {
            Some(CPtr(RAM_CAP_BASE + gpa / PAGE_SIZE))
        } else {
            state.reserved.get(&(gpa - gpa % PAGE_SIZE)).copied()
        }
    }

    fn map_reserved_frame(&mut self, frame: CPtr) -> anyhow::Result<u64> {
        let mut state = self.state.borrow_mut();
        anyhow::ensure!(state.private.contains_key(&frame), "{frame:?} is not a private frame");
        let gpa = RESERVED_GPA_BASE + state.reserved.len() as u64 * PAGE_SIZE;
        anyhow::ensure!(!state.is_ram(gpa), "reserved address {gpa:#x} overlaps ram");
        state.reserved.insert(gpa, frame);
        Ok(gpa)
    }
}

pub struct SimHostVspace {
    state: Rc<RefCell<SimState>>,
    mapped: HashMap<usize, (FrameId, Box<[u8]>)>,
    next_vaddr: usize,
}

impl HostVspace for SimHostVspace {
    fn map_frame(&mut self, frame: CPtr) -> anyhow::Result<HostMapping> {
        let mut state = self.state.borrow_mut();
        let id = state
            .resolve(frame)
            .with_context(|| format!("{frame:?} is not a frame capability"))?;
        anyhow::ensure!(
            !self.mapped.values().any(|(mapped, _)| *mapped == id),
            "{id:?} is already mapped"
        );
        let bytes = state
            .frames
            .remove(&id)
            .unwrap_or_else(|| vec![0; PAGE_SIZE as usize].into_boxed_slice());
        self.next_vaddr += PAGE_SIZE as usize;
        self.mapped.insert(self.next_vaddr, (id, bytes));
        Ok(HostMapping::new(self.next_vaddr))
    }

    fn frame_mut(&mut self, mapping: &HostMapping) -> &mut [u8] {
        match self.mapped.get_mut(&mapping.vaddr()) {
            Some((_, bytes)) => &mut bytes[..],
            None => panic!("{:#x} is not mapped", mapping.vaddr()),
        }
    }

    fn unmap_frame(&mut self, mapping: HostMapping) {
        let Some((id, bytes)) = self.mapped.remove(&mapping.vaddr()) else {
            panic!("{:#x} is not mapped", mapping.vaddr());
        };
        self.state.borrow_mut().frames.insert(id, bytes);
    }
}

/// A simulated hypervisor with a guest RAM map.
pub struct Sim {
    ram: GuestRam,
    state: Rc<RefCell<SimState>>,
    cspace: SimCapSpace,
    guest: SimGuestVspace,
    host: SimHostVspace,
}

impl Sim {
    pub fn new(ranges: impl IntoIterator<Item = Range<u64>>) -> Result<Self, crate::memory::Error> {
        let ram = GuestRam::new(ranges)?;
        let state = Rc::new(RefCell::new(SimState {
            ram: ram.regions().iter().map(|r| r.start..r.end()).collect(),
            ..Default::default()
        }));
        Ok(Self {
            ram,
            cspace: SimCapSpace {
                state: state.clone(),
            },
            guest: SimGuestVspace {
                state: state.clone(),
            },
            host: SimHostVspace {
                state: state.clone(),
                mapped: HashMap::new(),
                next_vaddr: 0,
            },
            state,
        })
    }

    pub fn ram(&self) -> &GuestRam {
        &self.ram
    }

    pub fn services(&mut self) -> (&mut dyn CapSpace, &mut dyn GuestVspace, &mut dyn HostVspace) {
        (&mut self.cspace, &mut self.guest, &mut self.host)
    }

    /// Guest memory over a fresh copy of the RAM map.
    pub fn memory(&mut self) -> GuestMemory<'_> {
        let ram = self.ram.clone();
        let (cspace, guest, host) = self.services();
        GuestMemory::new(ram, PageBridge::new(cspace, guest, host))
    }

    pub fn platform<'a>(
        &'a mut self,
        files: &'a dyn FileProvider,
        video: Option<&'a dyn VideoModeProvider>,
        acpi: &'a mut dyn AcpiBuilder,
    ) -> Platform<'a> {
        Platform {
            cspace: &mut self.cspace,
            guest_vspace: &mut self.guest,
            host_vspace: &mut self.host,
            files,
            video,
            acpi,
        }
    }

    /// Reads guest memory directly. Unwritten RAM reads as zero.
    pub fn read(&self, gpa: u64, len: usize) -> Vec<u8> {
        let state = self.state.borrow();
        let mut data = Vec::with_capacity(len);
        let mut cur = gpa;
        while data.len() < len {
            let offset = (cur % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - offset).min(len - data.len());
            let frame = state
                .guest_frame(cur)
                .unwrap_or_else(|| panic!("{cur:#x} is not guest memory"));
            match state.frames.get(&frame) {
                Some(bytes) => data.extend_from_slice(&bytes[offset..offset + n]),
                None => data.resize(data.len() + n, 0),
            }
            cur += n as u64;
        }
        data
    }

    pub fn read_u32(&self, gpa: u64) -> u32 {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.read(gpa, 4));
        u32::from_le_bytes(bytes)
    }

    pub fn live_slots(&self) -> usize {
        self.state.borrow().live_slots
    }

    pub fn peak_live_slots(&self) -> usize {
        self.state.borrow().peak_live_slots
    }

    /// Slots currently holding a copied capability.
    pub fn scratch_caps(&self) -> usize {
        self.state.borrow().copies.len()
    }

    pub fn host_mappings(&self) -> usize {
        self.host.mapped.len()
    }
}

/// Named in-memory files.
#[derive(Default)]
pub struct SimFiles {
    files: HashMap<String, Vec<u8>>,
    open: RefCell<HashMap<u32, String>>,
    next_handle: Cell<u32>,
}

impl SimFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: &str, data: Vec<u8>) -> Self {
        self.files.insert(name.to_owned(), data);
        self
    }

    pub fn open_count(&self) -> usize {
        self.open.borrow().len()
    }

    fn data(&self, file: FileHandle) -> &[u8] {
        let open = self.open.borrow();
        let name = open
            .get(&file.0)
            .unwrap_or_else(|| panic!("{file:?} is not open"));
        &self.files[name]
    }
}

impl FileProvider for SimFiles {
    fn open(&self, name: &str) -> Option<FileHandle> {
        self.files.get(name)?;
        let handle = self.next_handle.get() + 1;
        self.next_handle.set(handle);
        self.open.borrow_mut().insert(handle, name.to_owned());
        Some(FileHandle(handle))
    }

    fn size(&self, file: FileHandle) -> u64 {
        self.data(file).len() as u64
    }

    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data(file);
        let src = usize::try_from(offset)
            .ok()
            .and_then(|start| data.get(start..start.checked_add(buf.len())?))
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn close(&self, file: FileHandle) {
        let closed = self.open.borrow_mut().remove(&file.0);
        assert!(closed.is_some(), "{file:?} closed twice");
    }
}

/// A fixed video mode.
pub struct SimVideo(pub VbeModeInfo);

impl VideoModeProvider for SimVideo {
    fn mode_info(&self) -> VbeModeInfo {
        self.0
    }
}

/// Places a bare RSDP signature in guest RAM.
#[derive(Default)]
pub struct SimAcpi {
    pub rsdp: Option<u64>,
}

impl AcpiBuilder for SimAcpi {
    fn build(&mut self, memory: &mut GuestMemory<'_>) -> anyhow::Result<()> {
        let gpa = memory.allocate(36)?;
        memory.write_at(gpa, b"RSD PTR ")?;
        self.rsdp = Some(gpa);
        Ok(())
    }
}
