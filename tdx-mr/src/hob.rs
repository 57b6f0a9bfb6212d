// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TD Hand-Off Block as built by the VMM before the firmware runs.
//!
//! The layout follows QEMU's `hw/i386/tdvf-hob.c`: one PHIT header
//! followed by resource descriptors for a fixed low-memory map and the
//! rest of guest RAM. All fields are little-endian.

use scale::Encode;

use crate::error::{Error, Result};
use crate::num::write_le;
use crate::util::measure_sha384;

const EFI_HOB_TYPE_HANDOFF: u16 = 0x0001;
const EFI_HOB_TYPE_RESOURCE_DESCRIPTOR: u16 = 0x0003;
const EFI_HOB_HANDOFF_TABLE_VERSION: u32 = 0x0009;

const EFI_RESOURCE_SYSTEM_MEMORY: u32 = 0x00;
const EFI_RESOURCE_MEMORY_UNACCEPTED: u32 = 0x07;
// PRESENT | INITIALIZED | TESTED
const RESOURCE_ATTRIBUTES: u32 = 0x07;

const END_OF_HOB_LIST_OFFSET: usize = 48;

/// Guest memory at or above this size is split around the 32-bit PCI hole.
const MEMORY_SPLIT_THRESHOLD: u64 = 0xB000_0000;
const LOW_MEMORY_END: u64 = 0x8000_0000;
const HIGH_MEMORY_BASE: u64 = 0x1_0000_0000;

/// (resource type, start, length) of the memory below the first RAM window.
const FIXED_RESOURCES: [(u32, u64, u64); 7] = [
    (EFI_RESOURCE_MEMORY_UNACCEPTED, 0x0000_0000, 0x0080_0000),
    (EFI_RESOURCE_SYSTEM_MEMORY, 0x0080_0000, 0x0000_6000),
    (EFI_RESOURCE_MEMORY_UNACCEPTED, 0x0080_6000, 0x0000_3000),
    (EFI_RESOURCE_SYSTEM_MEMORY, 0x0080_9000, 0x0000_2000),
    (EFI_RESOURCE_SYSTEM_MEMORY, 0x0080_B000, 0x0000_2000),
    (EFI_RESOURCE_MEMORY_UNACCEPTED, 0x0080_D000, 0x0000_4000),
    (EFI_RESOURCE_SYSTEM_MEMORY, 0x0081_1000, 0x0000_F000),
];
const FIXED_RESOURCES_END: u64 = 0x0082_0000;

#[derive(Encode)]
struct HobHeader {
    hob_type: u16,
    hob_length: u16,
    reserved: u32,
}

/// EFI_HOB_HANDOFF_INFO_TABLE
#[derive(Encode)]
struct HandoffInfoTable {
    header: HobHeader,
    version: u32,
    boot_mode: u32,
    efi_memory_top: u64,
    efi_memory_bottom: u64,
    efi_free_memory_top: u64,
    efi_free_memory_bottom: u64,
    efi_end_of_hob_list: u64,
}

/// EFI_HOB_RESOURCE_DESCRIPTOR
#[derive(Encode)]
struct ResourceDescriptor {
    header: HobHeader,
    owner: [u8; 16],
    resource_type: u32,
    resource_attribute: u32,
    physical_start: u64,
    resource_length: u64,
}

impl HandoffInfoTable {
    const SIZE: u16 = 56;

    fn new() -> Self {
        Self {
            header: HobHeader {
                hob_type: EFI_HOB_TYPE_HANDOFF,
                hob_length: Self::SIZE,
                reserved: 0,
            },
            version: EFI_HOB_HANDOFF_TABLE_VERSION,
            boot_mode: 0,
            efi_memory_top: 0,
            efi_memory_bottom: 0,
            efi_free_memory_top: 0,
            efi_free_memory_bottom: 0,
            // Patched once the whole list is known.
            efi_end_of_hob_list: 0,
        }
    }
}

impl ResourceDescriptor {
    const SIZE: u16 = 48;

    fn memory(resource_type: u32, start: u64, length: u64) -> Self {
        Self {
            header: HobHeader {
                hob_type: EFI_HOB_TYPE_RESOURCE_DESCRIPTOR,
                hob_length: Self::SIZE,
                reserved: 0,
            },
            owner: [0; 16],
            resource_type,
            resource_attribute: RESOURCE_ATTRIBUTES,
            physical_start: start,
            resource_length: length,
        }
    }
}

/// Builds the TD HOB list for a guest with `memory_size` bytes of RAM
/// whose HOB is placed at `hob_base`.
pub fn build_td_hob(memory_size: u64, hob_base: u64) -> Result<Vec<u8>> {
    let mut remaining = memory_size
        .checked_sub(FIXED_RESOURCES_END)
        .ok_or(Error::MemoryTooSmall(memory_size))?;

    let mut td_hob = HandoffInfoTable::new().encode();
    let mut add_memory_resource_hob = |resource_type: u32, start: u64, length: u64| {
        td_hob.extend(ResourceDescriptor::memory(resource_type, start, length).encode());
    };

    for (resource_type, start, length) in FIXED_RESOURCES {
        add_memory_resource_hob(resource_type, start, length);
    }

    if memory_size >= MEMORY_SPLIT_THRESHOLD {
        let low = LOW_MEMORY_END - FIXED_RESOURCES_END;
        add_memory_resource_hob(EFI_RESOURCE_MEMORY_UNACCEPTED, FIXED_RESOURCES_END, low);
        remaining -= low;
        add_memory_resource_hob(EFI_RESOURCE_MEMORY_UNACCEPTED, HIGH_MEMORY_BASE, remaining);
    } else {
        add_memory_resource_hob(EFI_RESOURCE_MEMORY_UNACCEPTED, FIXED_RESOURCES_END, remaining);
    }

    let end_of_hob_list = hob_base + td_hob.len() as u64 + 8;
    write_le(&mut td_hob, END_OF_HOB_LIST_OFFSET, &end_of_hob_list, "end of HOB list")?;
    Ok(td_hob)
}

pub fn measure_td_hob(memory_size: u64, hob_base: u64) -> Result<Vec<u8>> {
    build_td_hob(memory_size, hob_base).map(|td_hob| measure_sha384(&td_hob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::num::read_le;
    use hex_literal::hex;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn record_sizes() {
        assert_eq!(HandoffInfoTable::new().encode().len(), HandoffInfoTable::SIZE as usize);
        assert_eq!(
            ResourceDescriptor::memory(0, 0, 0).encode().len(),
            ResourceDescriptor::SIZE as usize
        );
        let sum: u64 = FIXED_RESOURCES.iter().map(|(_, _, len)| len).sum();
        assert_eq!(sum, FIXED_RESOURCES_END);
    }

    #[test]
    fn small_guest_has_one_ram_window() {
        let td_hob = build_td_hob(2 * GIB, 0x809000).unwrap();
        assert_eq!(td_hob.len(), 56 + 8 * 48);
        let end: u64 = read_le(&td_hob, 48, "end of hob list").unwrap();
        assert_eq!(end, 0x809000 + 440 + 8);

        let last = &td_hob[td_hob.len() - 48..];
        assert_eq!(read_le::<u32>(last, 24, "type").unwrap(), EFI_RESOURCE_MEMORY_UNACCEPTED);
        assert_eq!(read_le::<u64>(last, 32, "start").unwrap(), 0x820000);
        assert_eq!(read_le::<u64>(last, 40, "length").unwrap(), 2 * GIB - 0x820000);

        assert_eq!(
            measure_sha384(&td_hob),
            hex!("0e35f1b315ba6c912cf791e5c79dd9d3a2b8704516aa27d4e5aa78fb09ede04aef2bbd02ac7a8734c48562b9c26ba35d")
        );
    }

    #[test]
    fn large_guest_is_split_around_pci_hole() {
        let td_hob = build_td_hob(4 * GIB, 0x809000).unwrap();
        assert_eq!(td_hob.len(), 56 + 9 * 48);

        let low = &td_hob[td_hob.len() - 96..td_hob.len() - 48];
        assert_eq!(read_le::<u64>(low, 32, "start").unwrap(), 0x820000);
        assert_eq!(read_le::<u64>(low, 40, "length").unwrap(), 0x7F7E_0000);

        let high = &td_hob[td_hob.len() - 48..];
        assert_eq!(read_le::<u64>(high, 32, "start").unwrap(), HIGH_MEMORY_BASE);
        assert_eq!(read_le::<u64>(high, 40, "length").unwrap(), 2 * GIB);

        assert_eq!(
            measure_td_hob(4 * GIB, 0x809000).unwrap(),
            hex!("02a008e63d55a77823c04a5513a5810d4e592dc41bf2596267c09eae5d4b4e3b329ae614973fb192297d8833d37a08fd")
        );
    }

    #[test]
    fn split_starts_at_threshold() {
        let below = build_td_hob(MEMORY_SPLIT_THRESHOLD - 0x1000, 0x809000).unwrap();
        assert_eq!(below.len(), 56 + 8 * 48);
        let last = &below[below.len() - 48..];
        assert_eq!(read_le::<u64>(last, 32, "start").unwrap(), 0x820000);
        assert_eq!(
            read_le::<u64>(last, 40, "length").unwrap(),
            0xB000_0000 - 0x1000 - 0x820000
        );

        let at = build_td_hob(MEMORY_SPLIT_THRESHOLD, 0x809000).unwrap();
        assert_eq!(at.len(), 56 + 9 * 48);
        let low = &at[at.len() - 96..at.len() - 48];
        assert_eq!(read_le::<u64>(low, 40, "length").unwrap(), 0x7F7E_0000);
        let high = &at[at.len() - 48..];
        assert_eq!(read_le::<u64>(high, 32, "start").unwrap(), HIGH_MEMORY_BASE);
        assert_eq!(read_le::<u64>(high, 40, "length").unwrap(), 0x3000_0000);
    }

    #[test]
    fn hob_base_only_moves_end_pointer() {
        let a = build_td_hob(2 * GIB, 0x809000).unwrap();
        let b = build_td_hob(2 * GIB, 0x900000).unwrap();
        assert_eq!(a[..48], b[..48]);
        assert_eq!(a[56..], b[56..]);
        assert_ne!(a[48..56], b[48..56]);
    }

    #[test]
    fn tiny_guest_is_rejected() {
        assert!(matches!(
            build_td_hob(0x10_0000, 0x809000),
            Err(Error::MemoryTooSmall(0x10_0000))
        ));
    }
}
