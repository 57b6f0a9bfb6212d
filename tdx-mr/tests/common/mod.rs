// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Deterministic inputs shared by the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use tdx_mr::efi::encode_guid;
use tdx_mr::{
    measure_sha384, AuthenticodeDigester, ConfigurationTable, MachineConfiguration,
    SectionExtractor, Tables, LINUX_SECTION,
};

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const FW_SIZE: usize = 0x3000;
pub const DESCRIPTOR_OFFSET: usize = 0x2000;
pub const CMDLINE: &str = "console=ttyS0 root=/dev/vda1";
pub const INITRD: &[u8] = b"initrd-bytes";
pub const KERNEL_OFFSET: usize = 64;

/// (data offset, raw size, memory address, memory size, type, attributes)
pub const SECTIONS: [(u32, u32, u64, u64, u32, u32); 4] = [
    (0, 0x1000, 0x800000, 0x1000, 1, 1),
    (0x1000, 0x1000, 0xFFFFF000, 0x1000, 0, 1),
    (0, 0, 0x809000, 0x2000, 2, 0),
    (0, 0, 0x80B000, 0x2000, 3, 2),
];

pub fn pattern(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + seed) % 256) as u8).collect()
}

/// 12 KiB image: CFV, BFV, TDVF metadata and the OVMF GUID table.
pub fn firmware() -> Vec<u8> {
    let mut fw = vec![0u8; FW_SIZE];
    fw[..0x1000].copy_from_slice(&pattern(0x1000, 1));
    fw[0x1000..0x2000].copy_from_slice(&pattern(0x1000, 2));

    let mut metadata = Vec::new();
    metadata.extend_from_slice(b"TDVF");
    metadata.extend(((16 + 32 * SECTIONS.len()) as u32).to_le_bytes());
    metadata.extend(1u32.to_le_bytes());
    metadata.extend((SECTIONS.len() as u32).to_le_bytes());
    for (data_offset, raw_size, address, size, sec_type, attributes) in SECTIONS {
        metadata.extend(data_offset.to_le_bytes());
        metadata.extend(raw_size.to_le_bytes());
        metadata.extend(address.to_le_bytes());
        metadata.extend(size.to_le_bytes());
        metadata.extend(sec_type.to_le_bytes());
        metadata.extend(attributes.to_le_bytes());
    }
    fw[DESCRIPTOR_OFFSET..DESCRIPTOR_OFFSET + metadata.len()].copy_from_slice(&metadata);

    let mut table = Vec::new();
    table.extend(((FW_SIZE - DESCRIPTOR_OFFSET) as u32).to_le_bytes());
    table.extend(22u16.to_le_bytes());
    table.extend(guid("e47a6535-984a-4798-865e-4685a7bf8ec2"));
    table.extend(40u16.to_le_bytes());
    table.extend(guid("96b582de-1fb2-45f7-baea-a366c55a082d"));
    let end = FW_SIZE - 32;
    fw[end - table.len()..end].copy_from_slice(&table);
    fw
}

fn guid(s: &str) -> [u8; 16] {
    encode_guid(s).expect("valid GUID")
}

/// Stand-in UKI whose kernel is everything after the first 64 bytes.
pub fn uki() -> Vec<u8> {
    pattern(128, 3)
}

pub struct StubPe;

impl AuthenticodeDigester for StubPe {
    fn authenticode_sha384(&self, pe: &[u8]) -> Result<Vec<u8>> {
        Ok(measure_sha384(&[b"authenticode".as_slice(), pe].concat()))
    }
}

impl SectionExtractor for StubPe {
    fn section<'a>(&self, pe: &'a [u8], name: &str) -> Result<Option<&'a [u8]>> {
        if name != LINUX_SECTION {
            return Ok(None);
        }
        Ok(pe.get(KERNEL_OFFSET..))
    }
}

pub struct StubAcpi;

impl tdx_mr::AcpiGenerator for StubAcpi {
    fn generate(&self, _memory_size: u64, _cpu_count: u32) -> Result<Tables> {
        Ok(Tables {
            tables: b"etc/acpi/tables".to_vec(),
            rsdp: b"etc/acpi/rsdp".to_vec(),
            loader: b"etc/table-loader".to_vec(),
        })
    }
}

pub struct FailingAcpi;

impl tdx_mr::AcpiGenerator for FailingAcpi {
    fn generate(&self, memory_size: u64, _cpu_count: u32) -> Result<Tables> {
        bail!("no ACPI tables for {memory_size} bytes")
    }
}

pub fn shape() -> MachineConfiguration {
    MachineConfiguration {
        td_hob_hash: None,
        acpi_loader_hash: Some(measure_sha384(b"etc/table-loader")),
        acpi_rsdp_hash: Some(measure_sha384(b"etc/acpi/rsdp")),
        acpi_tables_hash: Some(measure_sha384(b"etc/acpi/tables")),
        boot_order_hash: None,
        boot0001_hash: measure_sha384(b"Boot0001"),
        boot0002_hash: measure_sha384(b"Boot0002"),
        boot0000_hash: measure_sha384(b"Boot0000"),
        mrtd: None,
    }
}

pub fn configurations() -> ConfigurationTable {
    ConfigurationTable::new().with("c3-standard-4", shape())
}
