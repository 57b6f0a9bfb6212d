// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use log::debug;
use scale::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

use crate::acpi::AcpiHashes;
use crate::config::MachineConfiguration;
use crate::efi::{
    measure_tdx_efi_variable, separator, Guid, EFI_GLOBAL_VARIABLE_GUID,
    IMAGE_SECURITY_DATABASE_GUID,
};
use crate::error::{Error, Result};
use crate::hob::measure_td_hob;
use crate::num::read_le;
use crate::util::measure_sha384;
use crate::RtmrLog;

const PAGE_SIZE: u64 = 0x1000;
const MR_EXTEND_GRANULARITY: usize = 0x100;

pub const ATTRIBUTE_MR_EXTEND: u32 = 0x00000001;
pub const ATTRIBUTE_PAGE_AUG: u32 = 0x00000002;

pub const TDVF_SECTION_BFV: u32 = 0x00;
pub const TDVF_SECTION_CFV: u32 = 0x01;
pub const TDVF_SECTION_TD_HOB: u32 = 0x02;
pub const TDVF_SECTION_TEMP_MEM: u32 = 0x03;

/// Where QEMU places the TD HOB when the firmware has no TD_HOB section.
pub const DEFAULT_TD_HOB_BASE: u64 = 0x809000;

/// OVMF table footer GUID.
pub const TABLE_FOOTER_GUID: Guid = Guid::from_bytes([
    0xde, 0x82, 0xb5, 0x96, 0xb2, 0x1f, 0xf7, 0x45, 0xba, 0xea, 0xa3, 0x66, 0xc5, 0x5a, 0x08, 0x2d,
]);
/// GUID of the table entry holding the TDVF metadata offset.
pub const TDX_METADATA_OFFSET_GUID: Guid = Guid::from_bytes([
    0x35, 0x65, 0x7a, 0xe4, 0x4a, 0x98, 0x98, 0x47, 0x86, 0x5e, 0x46, 0x85, 0xa7, 0xbf, 0x8e, 0xc2,
]);

const BYTES_AFTER_TABLE_FOOTER: usize = 32;
const GUID_ENTRY_TRAILER_SIZE: usize = 18;
const DESCRIPTOR_SIZE: usize = 16;
const SECTION_SIZE: usize = 32;

/// How the host sequences TDH.MEM.PAGE.ADD and TDH.MR.EXTEND while
/// building the initial TD memory image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageAddOrder {
    /// Every page of every section is added before any page is extended.
    #[default]
    TwoPass,
    /// Each page is added and then extended before moving to the next.
    SinglePass,
}

impl FromStr for PageAddOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "two-pass" => Ok(Self::TwoPass),
            "single-pass" => Ok(Self::SinglePass),
            other => Err(Error::UnknownMrtdVariant(other.to_string())),
        }
    }
}

impl fmt::Display for PageAddOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TwoPass => "two-pass",
            Self::SinglePass => "single-pass",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct TdvfSection {
    pub data_offset: u32,
    pub raw_data_size: u32,
    pub memory_address: u64,
    pub memory_data_size: u64,
    pub sec_type: u32,
    pub attributes: u32,
}

impl TdvfSection {
    fn validate(&self, index: usize) -> Result<()> {
        let invalid = |reason| Err(Error::InvalidSection { index, reason });
        if self.memory_address % PAGE_SIZE != 0 {
            return invalid("memory address not page aligned");
        }
        if self.memory_data_size % PAGE_SIZE != 0 {
            return invalid("memory data size not page aligned");
        }
        if self.memory_address.checked_add(self.memory_data_size).is_none() {
            return invalid("memory range exceeds the address space");
        }
        if self.memory_data_size < self.raw_data_size as u64 {
            return invalid("memory data size less than raw data size");
        }
        if self.attributes & ATTRIBUTE_MR_EXTEND != 0
            && (self.raw_data_size as u64) < self.memory_data_size
        {
            return invalid("raw data size less than memory data size");
        }
        Ok(())
    }

    fn pages(&self) -> u64 {
        self.memory_data_size / PAGE_SIZE
    }
}

#[derive(Debug, Clone, Decode, Encode)]
pub struct TdvfDescriptor {
    pub signature: [u8; 4],
    pub length: u32,
    pub version: u32,
    pub num_sections: u32,
}

/// Entries of the OVMF GUID table, keyed by GUID.
#[derive(Debug, Default)]
pub struct GuidTable<'a> {
    entries: BTreeMap<Guid, &'a [u8]>,
}

impl<'a> GuidTable<'a> {
    /// Walks the table that ends right before the 32-byte trailer.
    ///
    /// Every entry ends with `{u16 length, GUID}` where the length covers
    /// the whole entry; the footer entry's length covers the whole table.
    pub fn parse(fw: &'a [u8]) -> Result<Self> {
        if fw.len() < BYTES_AFTER_TABLE_FOOTER + GUID_ENTRY_TRAILER_SIZE {
            return Err(Error::FirmwareTooSmall(fw.len()));
        }
        let end = fw.len() - BYTES_AFTER_TABLE_FOOTER;
        let (footer_len, footer_guid) = Self::entry_trailer(fw, end)?;
        if footer_guid != TABLE_FOOTER_GUID {
            return Err(Error::InvalidFooterGuid);
        }
        if footer_len < GUID_ENTRY_TRAILER_SIZE || footer_len > end {
            return Err(Error::InvalidTableLength(footer_len));
        }

        let table_start = end - footer_len;
        let mut table = &fw[table_start..end - GUID_ENTRY_TRAILER_SIZE];
        let mut entries = BTreeMap::new();
        while !table.is_empty() {
            let entry_end = table.len();
            let invalid = |len| Error::InvalidEntryLength {
                offset: table_start + entry_end,
                len,
            };
            if entry_end < GUID_ENTRY_TRAILER_SIZE {
                return Err(invalid(entry_end));
            }
            let (len, guid) = Self::entry_trailer(table, entry_end)?;
            if len < GUID_ENTRY_TRAILER_SIZE || len > entry_end {
                return Err(invalid(len));
            }
            entries.insert(guid, &table[entry_end - len..entry_end - GUID_ENTRY_TRAILER_SIZE]);
            table = &table[..entry_end - len];
        }
        Ok(Self { entries })
    }

    fn entry_trailer(data: &[u8], end: usize) -> Result<(usize, Guid)> {
        let start = end - GUID_ENTRY_TRAILER_SIZE;
        let len = read_le::<u16>(data, start, "GUID table entry length")? as usize;
        let guid = read_le::<[u8; 16]>(data, start + 2, "GUID table entry GUID")?;
        Ok((len, Guid::from_bytes(guid)))
    }

    pub fn get(&self, guid: &Guid) -> Option<&'a [u8]> {
        self.entries.get(guid).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Guid, &'a [u8])> + '_ {
        self.entries.iter().map(|(guid, data)| (guid, *data))
    }
}

#[derive(Debug)]
pub struct Tdvf<'a> {
    fw: &'a [u8],
    sections: Vec<TdvfSection>,
}

impl<'a> Tdvf<'a> {
    /// Parses the TDVF metadata referenced from the OVMF GUID table.
    pub fn parse(fw: &'a [u8]) -> Result<Tdvf<'a>> {
        let table = GuidTable::parse(fw)?;
        let entry = table
            .get(&TDX_METADATA_OFFSET_GUID)
            .ok_or(Error::MissingTableEntry("TDX metadata offset"))?;
        let offset_from_end = read_le::<u32>(entry, 0, "TDX metadata offset")? as usize;
        if offset_from_end > fw.len() {
            return Err(Error::MetadataOffsetOutOfRange {
                offset: offset_from_end,
                size: fw.len(),
            });
        }
        let descriptor_offset = fw.len() - offset_from_end;

        let descriptor: TdvfDescriptor = read_le(fw, descriptor_offset, "TDVF descriptor")?;
        if &descriptor.signature != b"TDVF" {
            return Err(Error::InvalidSignature(descriptor.signature));
        }
        if descriptor.version != 1 {
            return Err(Error::UnsupportedVersion(descriptor.version));
        }

        let mut sections = Vec::new();
        for index in 0..descriptor.num_sections as usize {
            let offset = descriptor_offset + DESCRIPTOR_SIZE + SECTION_SIZE * index;
            let section: TdvfSection = read_le(fw, offset, "TDVF section")?;
            section.validate(index)?;
            sections.push(section);
        }
        debug!("parsed {} TDVF sections", sections.len());

        Ok(Tdvf { fw, sections })
    }

    pub fn sections(&self) -> &[TdvfSection] {
        &self.sections
    }

    /// Bytes of the configuration firmware volume, the first CFV section.
    pub fn cfv(&self) -> Result<&'a [u8]> {
        let section = self
            .sections
            .iter()
            .find(|s| s.sec_type == TDVF_SECTION_CFV)
            .ok_or(Error::MissingCfv)?;
        let start = section.data_offset as u64;
        let end = start + section.raw_data_size as u64;
        let fw = self.fw;
        fw.get(start as usize..end as usize)
            .ok_or(Error::CfvOutOfBounds {
                start,
                end,
                size: fw.len(),
            })
    }

    pub fn cfv_hash(&self) -> Result<Vec<u8>> {
        self.cfv().map(measure_sha384)
    }

    pub fn td_hob_base(&self) -> u64 {
        self.sections
            .iter()
            .find(|s| s.sec_type == TDVF_SECTION_TD_HOB)
            .map_or(DEFAULT_TD_HOB_BASE, |s| s.memory_address)
    }

    fn extend_data(&self, s: &TdvfSection) -> Result<Option<&'a [u8]>> {
        if s.attributes & ATTRIBUTE_MR_EXTEND == 0 {
            return Ok(None);
        }
        let start = s.data_offset as u64;
        let end = start + s.memory_data_size;
        let out_of_bounds = || Error::ExtendOutOfBounds {
            start,
            end,
            size: self.fw.len(),
        };
        let range = usize::try_from(end).map_err(|_| out_of_bounds())?;
        self.fw
            .get(start as usize..range)
            .map(Some)
            .ok_or_else(out_of_bounds)
    }

    /// Replays the TDX module's MRTD updates for every section.
    pub fn mrtd(&self, order: PageAddOrder) -> Result<Vec<u8>> {
        debug!("computing MRTD with {order} page order");
        let extend_data = self
            .sections
            .iter()
            .map(|s| self.extend_data(s))
            .collect::<Result<Vec<_>>>()?;
        let sections = || self.sections.iter().zip(extend_data.iter().copied());

        let mut h = Sha384::new();
        match order {
            PageAddOrder::TwoPass => {
                for (s, _) in sections() {
                    for page in 0..s.pages() {
                        mem_page_add(&mut h, s, page);
                    }
                }
                for (s, data) in sections() {
                    if let Some(data) = data {
                        for page in 0..s.pages() {
                            mr_extend(&mut h, s, data, page);
                        }
                    }
                }
            }
            PageAddOrder::SinglePass => {
                for (s, data) in sections() {
                    for page in 0..s.pages() {
                        mem_page_add(&mut h, s, page);
                        if let Some(data) = data {
                            mr_extend(&mut h, s, data, page);
                        }
                    }
                }
            }
        }
        Ok(h.finalize().to_vec())
    }

    /// Event digests extended into RTMR0 by the firmware, in boot order.
    pub fn rtmr0_log(
        &self,
        memory_size: u64,
        config: &MachineConfiguration,
        acpi: &AcpiHashes,
    ) -> Result<RtmrLog> {
        let td_hob_hash = match &config.td_hob_hash {
            Some(hash) => hash.clone(),
            None => {
                let base = self.td_hob_base();
                debug!("TD HOB base address: {base:#x}");
                measure_td_hob(memory_size, base)?
            }
        };

        Ok(vec![
            td_hob_hash,
            self.cfv_hash()?,
            measure_tdx_efi_variable(EFI_GLOBAL_VARIABLE_GUID, "SecureBoot")?,
            measure_tdx_efi_variable(EFI_GLOBAL_VARIABLE_GUID, "PK")?,
            measure_tdx_efi_variable(EFI_GLOBAL_VARIABLE_GUID, "KEK")?,
            measure_tdx_efi_variable(IMAGE_SECURITY_DATABASE_GUID, "db")?,
            measure_tdx_efi_variable(IMAGE_SECURITY_DATABASE_GUID, "dbx")?,
            separator(),
            acpi.loader.clone(),
            acpi.rsdp.clone(),
            acpi.tables.clone(),
            config.boot_order_hash(),
            config.boot0001_hash.clone(),
            config.boot0002_hash.clone(),
            config.boot0000_hash.clone(),
        ])
    }
}

fn mem_page_add(h: &mut Sha384, s: &TdvfSection, page: u64) {
    if s.attributes & ATTRIBUTE_PAGE_AUG == 0 {
        let mut buf = [0u8; 128];
        buf[..12].copy_from_slice(b"MEM.PAGE.ADD");
        let gpa = s.memory_address + page * PAGE_SIZE;
        buf[16..24].copy_from_slice(&gpa.to_le_bytes());
        h.update(buf);
    }
}

/// `data` holds the section's bytes and spans at least `memory_data_size`.
fn mr_extend(h: &mut Sha384, s: &TdvfSection, data: &[u8], page: u64) {
    let page_start = (page * PAGE_SIZE) as usize;
    let page_data = &data[page_start..page_start + PAGE_SIZE as usize];
    for (i, chunk) in page_data.chunks_exact(MR_EXTEND_GRANULARITY).enumerate() {
        let mut buf = [0u8; 128];
        buf[..9].copy_from_slice(b"MR.EXTEND");
        let gpa = s.memory_address + page * PAGE_SIZE + (i * MR_EXTEND_GRANULARITY) as u64;
        buf[16..24].copy_from_slice(&gpa.to_le_bytes());
        h.update(buf);
        h.update(chunk);
    }
}
