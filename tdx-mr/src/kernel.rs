// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use log::debug;

use crate::efi::{
    separator, EV_CALLING_EFI_APPLICATION, EV_EXIT_BOOT_SERVICES_INVOCATION,
    EV_EXIT_BOOT_SERVICES_SUCCEEDED,
};
use crate::error::{Error, Result};
use crate::gpt::measure_disk_guid;
use crate::util::{measure_cmdline, measure_sha384};
use crate::RtmrLog;

/// Name of the UKI section holding the kernel PE image.
pub const LINUX_SECTION: &str = ".linux";

/// Computes the Authenticode SHA-384 of a PE/COFF image.
pub trait AuthenticodeDigester {
    fn authenticode_sha384(&self, pe: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Looks up a named section of a PE/COFF image.
pub trait SectionExtractor {
    /// Returns the section's data as stored in the file, or `None` when
    /// the image has no such section.
    fn section<'a>(&self, pe: &'a [u8], name: &str) -> anyhow::Result<Option<&'a [u8]>>;
}

/// Authenticode digests of the UKI and of the kernel it embeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDigests {
    pub uki: Vec<u8>,
    pub kernel: Vec<u8>,
}

impl KernelDigests {
    pub fn compute(
        uki: &[u8],
        digester: &dyn AuthenticodeDigester,
        extractor: &dyn SectionExtractor,
    ) -> Result<Self> {
        let kernel = extractor
            .section(uki, LINUX_SECTION)
            .map_err(|e| Error::collaborator("PE section extractor", e))?
            .ok_or(Error::MissingSection(LINUX_SECTION))?;
        debug!("kernel section: {} bytes", kernel.len());

        let authenticode = |pe: &[u8]| {
            digester
                .authenticode_sha384(pe)
                .map_err(|e| Error::collaborator("Authenticode digester", e))
        };
        Ok(Self {
            uki: authenticode(uki)?,
            kernel: authenticode(kernel)?,
        })
    }
}

/// RTMR1: boot attempt, GPT and the two images loaded by the boot manager.
pub fn rtmr1_log(digests: &KernelDigests) -> Result<RtmrLog> {
    Ok(vec![
        measure_sha384(EV_CALLING_EFI_APPLICATION),
        separator(),
        measure_disk_guid()?,
        digests.uki.clone(),
        digests.kernel.clone(),
        measure_sha384(EV_EXIT_BOOT_SERVICES_INVOCATION),
        measure_sha384(EV_EXIT_BOOT_SERVICES_SUCCEEDED),
    ])
}

/// RTMR2: kernel command line and initrd as measured by the EFI stub.
pub fn rtmr2_log(cmdline: &str, initrd: &[u8]) -> RtmrLog {
    vec![measure_cmdline(cmdline), measure_sha384(initrd)]
}
