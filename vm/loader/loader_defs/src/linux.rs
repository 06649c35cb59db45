// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Linux x86 boot protocol definitions.
//!
//! These structures are defined in the Linux kernel and can be found in the kernel docs under
//! [`The Linux/x86 Boot Protocol`](https://www.kernel.org/doc/html/latest/x86/boot.html).
//!
//! Every multi-byte field is stored little endian with an alignment of one, so
//! the structures have no implicit padding and can be written into guest
//! memory byte for byte.

#![expect(missing_docs)]

use core::mem::offset_of;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
    pub type u64_le = zerocopy::U64<zerocopy::LittleEndian>;
}
pub use self::packed_nums::*;

/// `HdrS`, the setup header signature.
pub const HDRS_MAGIC: u32 = 0x5372_6448;
/// The legacy boot sector signature stored in `boot_flag`.
pub const BOOT_FLAG_MAGIC: u16 = 0xAA55;
/// Boot loader type for a loader without an assigned id.
pub const LOADER_TYPE_UNDEFINED: u8 = 0xFF;
/// Boot protocol 2.02, the baseline that carries `cmd_line_ptr`.
pub const BOOT_PROTOCOL_2_02: u16 = 0x0202;
/// Boot protocol 2.04, required for the kernel to honor an initrd.
pub const BOOT_PROTOCOL_2_04: u16 = 0x0204;
/// Root device number of the first RAM disk.
pub const ROOT_DEV_RAMDISK: u16 = 0x0100;
/// `orig_video_is_vga` value for a VESA linear framebuffer.
pub const VIDEO_TYPE_VLFB: u8 = 0x23;

/// Number of entries in the zero page E820 table.
pub const E820_MAX_ENTRIES: usize = 128;

// TODO: zerocopy doesn't support const new methods, so define them as u32 for now. (https://github.com/microsoft/openvmm/issues/759)
pub const E820_RAM: u32 = 1;
pub const E820_RESERVED: u32 = 2;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct screen_info {
    pub orig_x: u8,
    pub orig_y: u8,
    pub ext_mem_k: u16_le,
    pub orig_video_page: u16_le,
    pub orig_video_mode: u8,
    pub orig_video_cols: u8,
    pub flags: u8,
    pub unused2: u8,
    pub orig_video_ega_bx: u16_le,
    pub unused3: u16_le,
    pub orig_video_lines: u8,
    pub orig_video_is_vga: u8,
    pub orig_video_points: u16_le,
    pub lfb_width: u16_le,
    pub lfb_height: u16_le,
    pub lfb_depth: u16_le,
    pub lfb_base: u32_le,
    /// Framebuffer size in 64KiB units.
    pub lfb_size: u32_le,
    pub cl_magic: u16_le,
    pub cl_offset: u16_le,
    pub lfb_linelength: u16_le,
    pub red_size: u8,
    pub red_pos: u8,
    pub green_size: u8,
    pub green_pos: u8,
    pub blue_size: u8,
    pub blue_pos: u8,
    pub rsvd_size: u8,
    pub rsvd_pos: u8,
    pub vesapm_seg: u16_le,
    pub vesapm_off: u16_le,
    pub pages: u16_le,
    pub vesa_attributes: u16_le,
    pub capabilities: u32_le,
    pub ext_lfb_base: u32_le,
    pub _reserved: [u8; 2],
}

const_assert_eq!(size_of::<screen_info>(), 0x40);
const_assert_eq!(offset_of!(screen_info, orig_video_is_vga), 0x0F);
const_assert_eq!(offset_of!(screen_info, lfb_width), 0x12);
const_assert_eq!(offset_of!(screen_info, lfb_base), 0x18);
const_assert_eq!(offset_of!(screen_info, lfb_linelength), 0x24);
const_assert_eq!(offset_of!(screen_info, vesapm_seg), 0x2E);
const_assert_eq!(offset_of!(screen_info, capabilities), 0x36);

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct setup_header {
    pub setup_sects: u8,
    pub root_flags: u16_le,
    pub syssize: u32_le,
    pub ram_size: u16_le,
    pub vid_mode: u16_le,
    pub root_dev: u16_le,
    pub boot_flag: u16_le,
    pub jump: u16_le,
    pub header: u32_le,
    pub version: u16_le,
    pub realmode_swtch: u32_le,
    pub start_sys_seg: u16_le,
    pub kernel_version: u16_le,
    pub type_of_loader: u8,
    pub loadflags: u8,
    pub setup_move_size: u16_le,
    pub code32_start: u32_le,
    pub ramdisk_image: u32_le,
    pub ramdisk_size: u32_le,
    pub bootsect_kludge: u32_le,
    pub heap_end_ptr: u16_le,
    pub ext_loader_ver: u8,
    pub ext_loader_type: u8,
    pub cmd_line_ptr: u32_le,
    pub initrd_addr_max: u32_le,
    pub kernel_alignment: u32_le,
    pub relocatable_kernel: u8,
    pub min_alignment: u8,
    pub xloadflags: u16_le,
    pub cmdline_size: u32_le,
    pub hardware_subarch: u32_le,
    pub hardware_subarch_data: u64_le,
    pub payload_offset: u32_le,
    pub payload_length: u32_le,
    pub setup_data: u64_le,
    pub pref_address: u64_le,
    pub init_size: u32_le,
    pub handover_offset: u32_le,
}

const_assert_eq!(size_of::<setup_header>(), 0x77);

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct e820entry {
    pub addr: u64_le,
    pub size: u64_le,
    pub typ: u32_le,
}

const_assert_eq!(size_of::<e820entry>(), 20);

/// The zero page handed to the kernel in `esi`.
///
/// Regions the loader never fills are kept as opaque byte arrays.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct boot_params {
    pub screen_info: screen_info,
    pub apm_bios_info: [u8; 20],
    pub _pad2: [u8; 4],
    pub tboot_addr: u64_le,
    pub ist_info: [u8; 16],
    pub acpi_rsdp_addr: u64_le,
    pub _pad3: [u8; 8],
    pub hd0_info: [u8; 16],
    pub hd1_info: [u8; 16],
    pub sys_desc_table: [u8; 16],
    pub olpc_ofw_header: [u8; 16],
    pub ext_ramdisk_image: u32_le,
    pub ext_ramdisk_size: u32_le,
    pub ext_cmd_line_ptr: u32_le,
    pub _pad4: [u8; 112],
    pub cc_blob_address: u32_le,
    pub edid_info: [u8; 128],
    pub efi_info: [u8; 32],
    pub alt_mem_k: u32_le,
    pub scratch: u32_le,
    pub e820_entries: u8,
    pub eddbuf_entries: u8,
    pub edd_mbr_sig_buf_entries: u8,
    pub kbd_status: u8,
    pub secure_boot: u8,
    pub _pad5: [u8; 2],
    pub sentinel: u8,
    pub _pad6: [u8; 1],
    pub hdr: setup_header,
    pub _pad7: [u8; 40],
    pub edd_mbr_sig_buffer: [u8; 64],
    pub e820_table: [e820entry; E820_MAX_ENTRIES],
    pub _pad8: [u8; 48],
    pub eddbuf: [u8; 492],
    pub _pad9: [u8; 276],
}

impl Default for boot_params {
    fn default() -> Self {
        FromZeros::new_zeroed()
    }
}

const_assert_eq!(size_of::<boot_params>(), 4096);
const_assert_eq!(offset_of!(boot_params, ext_ramdisk_image), 0x0C0);
const_assert_eq!(offset_of!(boot_params, alt_mem_k), 0x1E0);
const_assert_eq!(offset_of!(boot_params, e820_entries), 0x1E8);
const_assert_eq!(offset_of!(boot_params, hdr), 0x1F1);
const_assert_eq!(offset_of!(boot_params, edd_mbr_sig_buffer), 0x290);
const_assert_eq!(offset_of!(boot_params, e820_table), 0x2D0);
const_assert_eq!(offset_of!(boot_params, eddbuf), 0xD00);

const HDR: usize = offset_of!(boot_params, hdr);
const_assert_eq!(HDR + offset_of!(setup_header, root_dev), 0x1FC);
const_assert_eq!(HDR + offset_of!(setup_header, boot_flag), 0x1FE);
const_assert_eq!(HDR + offset_of!(setup_header, header), 0x202);
const_assert_eq!(HDR + offset_of!(setup_header, version), 0x206);
const_assert_eq!(HDR + offset_of!(setup_header, type_of_loader), 0x210);
const_assert_eq!(HDR + offset_of!(setup_header, code32_start), 0x214);
const_assert_eq!(HDR + offset_of!(setup_header, ramdisk_image), 0x218);
const_assert_eq!(HDR + offset_of!(setup_header, ramdisk_size), 0x21C);
const_assert_eq!(HDR + offset_of!(setup_header, cmd_line_ptr), 0x228);
const_assert_eq!(HDR + offset_of!(setup_header, kernel_alignment), 0x230);
const_assert_eq!(HDR + offset_of!(setup_header, relocatable_kernel), 0x234);
const_assert_eq!(HDR + offset_of!(setup_header, cmdline_size), 0x238);
const_assert_eq!(HDR + offset_of!(setup_header, handover_offset), 0x264);
