// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, bail, Context, Result};
use object::pe::ImageSectionHeader;
use object::read::pe::PeFile64;
use object::LittleEndian as LE;
use sha2::{Digest, Sha384};
use tdx_mr::{AuthenticodeDigester, SectionExtractor};

const CMDLINE_SECTION: &str = ".cmdline";
const INITRD_SECTION: &str = ".initrd";

/// PE collaborators backed by `object` and `authenticode`.
pub struct PeTools;

fn parse(pe: &[u8]) -> Result<PeFile64<'_>> {
    PeFile64::parse(pe).context("Failed to parse 64-bit PE image")
}

fn section_header<'a>(file: &PeFile64<'a>, name: &str) -> Option<&'a ImageSectionHeader> {
    file.section_table()
        .iter()
        .find(|header| header.raw_name() == name.as_bytes())
}

/// Section bytes as stored in the file, optionally cut to the virtual size.
fn section_data<'a>(pe: &'a [u8], name: &str, trim_to_virtual: bool) -> Result<Option<&'a [u8]>> {
    let file = parse(pe)?;
    let Some(header) = section_header(&file, name) else {
        return Ok(None);
    };
    let offset = header.pointer_to_raw_data.get(LE) as usize;
    let mut size = header.size_of_raw_data.get(LE) as usize;
    if trim_to_virtual {
        size = size.min(header.virtual_size.get(LE) as usize);
    }
    let data = pe
        .get(offset..offset + size)
        .with_context(|| format!("Section {name} lies outside the image"))?;
    Ok(Some(data))
}

impl AuthenticodeDigester for PeTools {
    fn authenticode_sha384(&self, pe: &[u8]) -> Result<Vec<u8>> {
        let file = parse(pe)?;
        let mut hasher = Sha384::new();
        authenticode::authenticode_digest(&file, &mut hasher)
            .map_err(|e| anyhow!("Failed to compute Authenticode digest: {e}"))?;
        Ok(hasher.finalize().to_vec())
    }
}

impl SectionExtractor for PeTools {
    fn section<'a>(&self, pe: &'a [u8], name: &str) -> Result<Option<&'a [u8]>> {
        section_data(pe, name, false)
    }
}

/// The parts of a unified kernel image the measurement needs.
pub struct Uki<'a> {
    pub image: &'a [u8],
    pub cmdline: String,
    pub initrd: &'a [u8],
}

impl<'a> Uki<'a> {
    pub fn parse(image: &'a [u8]) -> Result<Self> {
        let cmdline = match section_data(image, CMDLINE_SECTION, true)? {
            Some(data) => std::str::from_utf8(data)
                .context("UKI command line is not UTF-8")?
                .trim_end_matches('\0')
                .to_string(),
            None => bail!("UKI has no {CMDLINE_SECTION} section"),
        };
        let initrd = section_data(image, INITRD_SECTION, true)?.unwrap_or_default();
        tracing::debug!(
            "UKI: {} bytes, cmdline {cmdline:?}, initrd {} bytes",
            image.len(),
            initrd.len()
        );
        Ok(Self {
            image,
            cmdline,
            initrd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADERS_SIZE: usize = 0x200;

    /// PE32+ image with `(name, data, virtual_size)` sections.
    fn pe_image(sections: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut image = vec![0u8; 64];
        image[..2].copy_from_slice(b"MZ");
        image[0x3c..0x40].copy_from_slice(&64u32.to_le_bytes());

        image.extend(b"PE\0\0");
        image.extend(0x8664u16.to_le_bytes());
        image.extend((sections.len() as u16).to_le_bytes());
        image.extend([0u8; 12]);
        image.extend(240u16.to_le_bytes());
        image.extend(0x22u16.to_le_bytes());

        let mut optional = vec![0u8; 240];
        optional[..2].copy_from_slice(&0x20bu16.to_le_bytes());
        optional[108..112].copy_from_slice(&16u32.to_le_bytes());
        image.extend(optional);

        let mut offset = HEADERS_SIZE;
        for (name, data, virtual_size) in sections {
            let mut raw_name = [0u8; 8];
            raw_name[..name.len()].copy_from_slice(name.as_bytes());
            image.extend(raw_name);
            image.extend(virtual_size.to_le_bytes());
            image.extend(0x1000u32.to_le_bytes());
            image.extend((data.len() as u32).to_le_bytes());
            image.extend((offset as u32).to_le_bytes());
            image.extend([0u8; 16]);
            offset += data.len();
        }
        image.resize(HEADERS_SIZE, 0);
        for (_, data, _) in sections {
            image.extend_from_slice(data);
        }
        image
    }

    #[test]
    fn extracts_uki_sections() {
        let image = pe_image(&[
            (".linux", b"kernel-and-padding", 6),
            (".cmdline", b"console=ttyS0\0\0\0\0", 15),
            (".initrd", b"initrd\0\0", 6),
        ]);
        let uki = Uki::parse(&image).unwrap();
        assert_eq!(uki.cmdline, "console=ttyS0");
        assert_eq!(uki.initrd, b"initrd");
        let kernel = PeTools.section(&image, ".linux").unwrap();
        assert_eq!(kernel, Some(b"kernel-and-padding".as_slice()));
        assert_eq!(PeTools.section(&image, ".osrel").unwrap(), None);
    }

    #[test]
    fn initrd_is_optional() {
        let image = pe_image(&[(".cmdline", b"quiet", 5)]);
        let uki = Uki::parse(&image).unwrap();
        assert_eq!(uki.cmdline, "quiet");
        assert!(uki.initrd.is_empty());
    }

    #[test]
    fn cmdline_is_required() {
        let image = pe_image(&[(".linux", b"kernel", 6), (".initrd", b"initrd", 6)]);
        let err = Uki::parse(&image).err().unwrap();
        assert_eq!(err.to_string(), "UKI has no .cmdline section");
    }

    #[test]
    fn rejects_non_pe_input() {
        assert!(Uki::parse(b"not a PE image").is_err());
    }
}
