// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

pub use acpi::{AcpiGenerator, AcpiHashes, Tables};
pub use config::{
    resolve_key_provider, ConfigurationTable, MachineConfiguration, ReferenceMeasurement,
    DEFAULT_KEY_PROVIDER, REFERENCE_MEASUREMENTS,
};
pub use error::{Error, ErrorKind, Result};
pub use kernel::{AuthenticodeDigester, SectionExtractor, LINUX_SECTION};
pub use machine::{
    BatchMeasurements, ConfigurationMeasurements, Machine, Measurer, TdxMeasurementDetails,
};
pub use tdvf::PageAddOrder;
pub use util::{
    measure_cmdline, measure_log, measure_sha384, utf16_encode, utf16_encode_nul, MR_SIZE,
};

pub type RtmrLog = Vec<Vec<u8>>;
pub type RtmrLogs = [RtmrLog; 3];

pub mod acpi;
pub mod config;
pub mod efi;
mod error;
pub mod gpt;
pub mod hob;
pub mod identity;
pub mod kernel;
mod machine;
mod num;
pub mod tdvf;
mod util;

/// Contains all the measurement values for TDX.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TdxMeasurements {
    #[serde(with = "hex_bytes")]
    pub mrtd: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub rtmr0: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub rtmr1: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub rtmr2: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub mr_aggregated: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub mr_image: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub workload_id: Vec<u8>,
}

impl TdxMeasurements {
    /// Derives the aggregated, image and workload identifiers from the registers.
    pub fn new(
        mrtd: Vec<u8>,
        rtmr0: Vec<u8>,
        rtmr1: Vec<u8>,
        rtmr2: Vec<u8>,
        mr_key_provider: &[u8],
    ) -> Self {
        let mr_aggregated = identity::mr_aggregated(&mrtd, &rtmr0, &rtmr1, &rtmr2, mr_key_provider);
        let mr_image = identity::mr_image(&mrtd, &rtmr1, &rtmr2);
        let workload_id = identity::workload_id(&mrtd, &rtmr0, &rtmr1, &rtmr2);
        Self {
            mrtd,
            rtmr0,
            rtmr1,
            rtmr2,
            mr_aggregated,
            mr_image,
            workload_id,
        }
    }
}
