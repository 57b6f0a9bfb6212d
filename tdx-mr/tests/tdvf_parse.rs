// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TDVF metadata parsing through the public API.
//!
//! The ignored test runs against a real OVMF build:
//!
//! ```text
//! TDX_MR_TEST_FIRMWARE=/path/to/OVMF.fd \
//! TDX_MR_TEST_MRTD=<expected hex> \
//! cargo test --release -- --ignored
//! ```

mod common;

use anyhow::{Context, Result};
use common::*;
use tdx_mr::tdvf::{GuidTable, Tdvf, TDVF_SECTION_CFV, TDX_METADATA_OFFSET_GUID};
use tdx_mr::{ErrorKind, PageAddOrder};

#[test]
fn stub_firmware_sections() -> Result<()> {
    let fw = firmware();
    let tdvf = Tdvf::parse(&fw)?;
    let sections = tdvf.sections();
    assert_eq!(sections.len(), SECTIONS.len());
    for (section, expected) in sections.iter().zip(SECTIONS) {
        let (data_offset, raw_size, address, size, sec_type, attributes) = expected;
        assert_eq!(section.data_offset, data_offset);
        assert_eq!(section.raw_data_size, raw_size);
        assert_eq!(section.memory_address, address);
        assert_eq!(section.memory_data_size, size);
        assert_eq!(section.sec_type, sec_type);
        assert_eq!(section.attributes, attributes);
    }
    assert_eq!(sections[0].sec_type, TDVF_SECTION_CFV);
    assert_eq!(tdvf.cfv()?, &fw[..0x1000]);
    Ok(())
}

#[test]
fn guid_table_is_keyed_by_guid() -> Result<()> {
    let fw = firmware();
    let table = GuidTable::parse(&fw)?;
    let (guid, data) = table.iter().next().context("empty GUID table")?;
    assert_eq!(guid.to_string(), "e47a6535-984a-4798-865e-4685a7bf8ec2");
    assert_eq!(*guid, TDX_METADATA_OFFSET_GUID);
    assert_eq!(data, 0x1000u32.to_le_bytes());
    Ok(())
}

#[test]
fn truncated_firmware_is_a_parse_error() {
    let fw = firmware();
    for len in [0, 31, 49, 50, 0x100, FW_SIZE - 1] {
        let err = Tdvf::parse(&fw[..len]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse, "{len}: {err}");
    }
}

#[test]
fn corrupted_metadata_never_panics() {
    let fw = firmware();
    let metadata = DESCRIPTOR_OFFSET..DESCRIPTOR_OFFSET + 16 + 32 * SECTIONS.len();
    let table = FW_SIZE - 32 - 40..FW_SIZE - 32;
    for offset in metadata.chain(table) {
        for value in [0x00, 0x01, 0x7f, 0xff] {
            let mut fw = fw.clone();
            fw[offset] = value;
            let Ok(tdvf) = Tdvf::parse(&fw) else {
                continue;
            };
            let _ = tdvf.cfv_hash();
            let mapped: u64 = tdvf.sections().iter().map(|s| s.memory_data_size).sum();
            if mapped <= 64 << 20 {
                let _ = tdvf.mrtd(PageAddOrder::TwoPass);
                let _ = tdvf.mrtd(PageAddOrder::SinglePass);
            }
        }
    }
}

#[test]
#[ignore] // Needs a real firmware image, see the module docs.
fn real_firmware_measurements() -> Result<()> {
    let path = std::env::var("TDX_MR_TEST_FIRMWARE").context("TDX_MR_TEST_FIRMWARE not set")?;
    let fw = std::fs::read(&path).with_context(|| format!("failed to read {path}"))?;

    let tdvf = Tdvf::parse(&fw).context("failed to parse TDVF metadata")?;
    eprintln!("{} TDVF sections", tdvf.sections().len());
    eprintln!("CFV: {}", hex::encode(tdvf.cfv_hash()?));

    let two_pass = tdvf.mrtd(PageAddOrder::TwoPass)?;
    let single_pass = tdvf.mrtd(PageAddOrder::SinglePass)?;
    eprintln!("MRTD (two-pass): {}", hex::encode(&two_pass));
    eprintln!("MRTD (single-pass): {}", hex::encode(&single_pass));

    if let Ok(expected) = std::env::var("TDX_MR_TEST_MRTD") {
        let expected = expected.trim_start_matches("0x");
        assert!(
            hex::encode(&two_pass) == expected || hex::encode(&single_pass) == expected,
            "MRTD mismatch - TDVF parsing may have regressed"
        );
    }
    Ok(())
}
