// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Initial register state for the boot processor.

use crate::image::GuestImage;

const X86_CR0_PE: u64 = 0x0000_0001; // protection enable
const X86_CR0_PG: u64 = 0x8000_0000; // paging
const X86_CR4_PSE: u64 = 0x0000_0010; // page size extensions

/// CR0 bits the guest owns after boot: protected mode with paging.
pub const INITIAL_CR0: u64 = X86_CR0_PE | X86_CR0_PG;
/// CR4 bits the guest owns after boot: 4MiB pages.
pub const INITIAL_CR4: u64 = X86_CR4_PSE;

/// A control register along with the guest/host mask and read shadow.
///
/// Guest reads of bits set in `mask` return the corresponding `shadow` bits
/// and writes to them trap to the hypervisor.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ControlRegister {
    pub value: u64,
    pub mask: u64,
    pub shadow: u64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
}

/// The state the boot processor starts in.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct InitialVpState {
    pub registers: GeneralRegisters,
    pub eip: u32,
    pub cr0: ControlRegister,
    pub cr3: u64,
    pub cr4: ControlRegister,
}

/// Returns the state for entering the kernel at its 32-bit entry point with
/// the zero page in `esi` and the identity page directory in CR3.
///
/// `image` must be fully loaded; all of its addresses are below 4GiB.
pub fn initial_vp_state(image: &GuestImage) -> InitialVpState {
    assert!(image.entry <= u32::MAX.into() && image.boot_info <= u32::MAX.into());
    let state = InitialVpState {
        registers: GeneralRegisters {
            esi: image.boot_info as u32,
            ..Default::default()
        },
        eip: image.entry as u32,
        cr0: ControlRegister {
            value: INITIAL_CR0,
            mask: INITIAL_CR0,
            shadow: INITIAL_CR0,
        },
        cr3: image.pd,
        cr4: ControlRegister {
            value: INITIAL_CR4,
            mask: INITIAL_CR4,
            shadow: INITIAL_CR4,
        },
    };
    tracing::debug!(
        eip = state.eip,
        esi = state.registers.esi,
        cr3 = state.cr3,
        "initial vp state"
    );
    state
}
