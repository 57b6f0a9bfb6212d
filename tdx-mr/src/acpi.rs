// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! ACPI blobs handed to the firmware through QEMU's fw_cfg interface.

use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

use crate::util::measure_sha384;

/// The `etc/acpi/tables`, `etc/acpi/rsdp` and `etc/table-loader` fw_cfg files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    #[serde(with = "hex_bytes")]
    pub tables: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub rsdp: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub loader: Vec<u8>,
}

impl Tables {
    pub fn hashes(&self) -> AcpiHashes {
        AcpiHashes {
            loader: measure_sha384(&self.loader),
            rsdp: measure_sha384(&self.rsdp),
            tables: measure_sha384(&self.tables),
        }
    }
}

/// Produces the ACPI blobs a VMM would build for a guest shape.
pub trait AcpiGenerator {
    fn generate(&self, memory_size: u64, cpu_count: u32) -> anyhow::Result<Tables>;
}

/// RTMR0 event digests of the three ACPI fw_cfg files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcpiHashes {
    pub loader: Vec<u8>,
    pub rsdp: Vec<u8>,
    pub tables: Vec<u8>,
}
