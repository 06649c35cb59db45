// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loads a 32-bit x86 Linux guest into memory owned by a capability-based
//! hypervisor and computes the state its boot processor starts in.
//!
//! The hypervisor never maps guest RAM wholesale. All writes go through
//! [`touch::PageBridge`], which maps one guest frame at a time. On top of that
//! the loader places the kernel's ELF segments, applies its relocations,
//! loads the initrd, and builds the page directory, command line and zero
//! page the kernel expects. [`boot::boot_guest`] runs the whole sequence.

#![forbid(unsafe_code)]

pub mod boot;
pub mod elf;
pub mod image;
pub mod linux;
pub mod memory;
pub mod platform;
pub mod reloc;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
#[cfg(test)]
mod test_helpers;
pub mod touch;
pub mod vp;
