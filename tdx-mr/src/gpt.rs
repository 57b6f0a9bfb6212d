// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! EV_EFI_GPT_EVENT for the boot disk as enumerated by the firmware.
//!
//! The disk is never read: its header and single ESP entry are rebuilt
//! from a fixed layout. Changing any field of [`ESP_DISK`] changes RTMR1.

use scale::Encode;

use crate::efi::{encode_guid, EFI_SYSTEM_PARTITION_GUID};
use crate::error::{Error, Result};
use crate::util::{measure_sha384, utf16_encode};

const SECTOR_SIZE: u64 = 512;
const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: u32 = 92;
const GPT_HEADER_LBA: u64 = 1;
const PARTITION_ENTRY_LBA: u64 = 2;
const NUM_PARTITION_ENTRIES: u32 = 128;
const PARTITION_ENTRY_SIZE: u32 = 128;
const RESERVED_LBAS: u64 = 34;

/// Partitions reported in the measured event.
const MEASURED_PARTITIONS: u64 = 1;

#[derive(Encode)]
struct GptHeader {
    signature: [u8; 8],
    revision: u32,
    header_size: u32,
    header_crc32: u32,
    reserved: u32,
    my_lba: u64,
    alternate_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    partition_entry_lba: u64,
    number_of_partition_entries: u32,
    size_of_partition_entry: u32,
    partition_entry_array_crc32: u32,
}

#[derive(Encode)]
struct GptPartitionEntry {
    partition_type_guid: [u8; 16],
    unique_partition_guid: [u8; 16],
    starting_lba: u64,
    ending_lba: u64,
    attributes: u64,
    partition_name: [u8; 72],
}

/// A disk with a single partition, described by the values that end up
/// in its GPT header and partition entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub size_bytes: u64,
    pub disk_guid: &'static str,
    pub partition_type_guid: &'static str,
    pub partition_guid: &'static str,
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    /// Stored as UTF-16LE, truncated to 36 code units.
    pub partition_name: &'static str,
}

/// The 1 GiB ESP disk the measured guests boot from.
pub const ESP_DISK: DiskLayout = DiskLayout {
    size_bytes: 1024 * 1024 * 1024,
    disk_guid: "12345678-1234-5678-1234-567812345678",
    partition_type_guid: EFI_SYSTEM_PARTITION_GUID,
    partition_guid: "87654321-4321-8765-4321-876543218765",
    starting_lba: 2048,
    ending_lba: 1026047,
    // Platform required
    attributes: 0x1,
    partition_name: "ESP",
};

impl DiskLayout {
    fn sectors(&self) -> Result<u64> {
        let sectors = self.size_bytes / SECTOR_SIZE;
        if sectors < RESERVED_LBAS {
            return Err(Error::DiskTooSmall(self.size_bytes));
        }
        Ok(sectors)
    }

    fn partition_entry(&self) -> Result<GptPartitionEntry> {
        let mut partition_name = [0u8; 72];
        for (dst, src) in partition_name
            .iter_mut()
            .zip(utf16_encode(self.partition_name))
        {
            *dst = src;
        }
        Ok(GptPartitionEntry {
            partition_type_guid: encode_guid(self.partition_type_guid)?,
            unique_partition_guid: encode_guid(self.partition_guid)?,
            starting_lba: self.starting_lba,
            ending_lba: self.ending_lba,
            attributes: self.attributes,
            partition_name,
        })
    }

    fn header(&self, partition_entry_array_crc32: u32) -> Result<GptHeader> {
        let sectors = self.sectors()?;
        let mut header = GptHeader {
            signature: GPT_SIGNATURE,
            revision: GPT_REVISION,
            header_size: GPT_HEADER_SIZE,
            header_crc32: 0,
            reserved: 0,
            my_lba: GPT_HEADER_LBA,
            alternate_lba: sectors - 1,
            first_usable_lba: RESERVED_LBAS,
            last_usable_lba: sectors - RESERVED_LBAS,
            disk_guid: encode_guid(self.disk_guid)?,
            partition_entry_lba: PARTITION_ENTRY_LBA,
            number_of_partition_entries: NUM_PARTITION_ENTRIES,
            size_of_partition_entry: PARTITION_ENTRY_SIZE,
            partition_entry_array_crc32,
        };
        header.header_crc32 = crc32fast::hash(&header.encode());
        Ok(header)
    }

    /// Digest of `header || u64 partition count || partition entry`.
    pub fn measure(&self) -> Result<Vec<u8>> {
        let entry = self.partition_entry()?.encode();

        let mut partition_array =
            vec![0u8; (NUM_PARTITION_ENTRIES * PARTITION_ENTRY_SIZE) as usize];
        partition_array[..entry.len()].copy_from_slice(&entry);
        let header = self.header(crc32fast::hash(&partition_array))?;

        let mut event = header.encode();
        event.extend(MEASURED_PARTITIONS.to_le_bytes());
        event.extend(entry);
        Ok(measure_sha384(&event))
    }
}

pub fn measure_disk_guid() -> Result<Vec<u8>> {
    ESP_DISK.measure()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn record_sizes() {
        let entry = ESP_DISK.partition_entry().unwrap().encode();
        assert_eq!(entry.len(), PARTITION_ENTRY_SIZE as usize);
        assert_eq!(&entry[56..62], b"E\0S\0P\0");
        let header = ESP_DISK.header(0).unwrap().encode();
        assert_eq!(header.len(), GPT_HEADER_SIZE as usize);
        assert_eq!(&header[..8], b"EFI PART");
    }

    #[test]
    fn header_crc_covers_zeroed_crc_field() {
        let header = ESP_DISK.header(0x1234_5678).unwrap();
        let mut bytes = header.encode();
        bytes[16..20].fill(0);
        assert_eq!(header.header_crc32, crc32fast::hash(&bytes));
        assert_eq!(header.last_usable_lba, 2097152 - 34);
        assert_eq!(header.alternate_lba, 2097151);
    }

    #[test]
    fn esp_disk_event() {
        let first = measure_disk_guid().unwrap();
        assert_eq!(first, measure_disk_guid().unwrap());
        assert_eq!(
            first,
            hex!("00e80fc8005d51e9eb0f1371542671a2d130b66d12e1d87b0d8d503a7a56ee35c67271c5f4119ab1d6c595f322bad522")
        );
    }

    #[test]
    fn starting_lba_is_measured() {
        let moved = DiskLayout {
            starting_lba: 4096,
            ..ESP_DISK
        };
        let digest = moved.measure().unwrap();
        assert_ne!(digest, measure_disk_guid().unwrap());
        assert_eq!(
            digest,
            hex!("e6d031385228ab4b9a7472a32940d1d26c30507267543e3d3fc7468661b3616f340e5dc02a548c66b195174c82c7f14f")
        );
    }

    #[test]
    fn disk_smaller_than_reserved_area() {
        let tiny = DiskLayout {
            size_bytes: SECTOR_SIZE * RESERVED_LBAS - 1,
            ..ESP_DISK
        };
        assert!(matches!(tiny.measure(), Err(Error::DiskTooSmall(size)) if size == 17407));
        let minimal = DiskLayout {
            size_bytes: SECTOR_SIZE * RESERVED_LBAS,
            ..ESP_DISK
        };
        let header = minimal.header(0).unwrap();
        assert_eq!(header.last_usable_lba, 0);
        assert_eq!(header.alternate_lba, 33);
    }
}
