// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

use crate::acpi::{AcpiGenerator, AcpiHashes, Tables};
use crate::config::{
    ConfigurationTable, MachineConfiguration, DEFAULT_KEY_PROVIDER, KEY_PROVIDER_SIZE,
};
use crate::error::{Error, Result};
use crate::kernel::{self, AuthenticodeDigester, KernelDigests, SectionExtractor};
use crate::tdvf::{PageAddOrder, Tdvf};
use crate::util::{debug_print_log, measure_log, MR_SIZE};
use crate::{RtmrLog, RtmrLogs, TdxMeasurements};

/// Boot inputs of one measured guest.
#[derive(Clone, Copy, bon::Builder)]
pub struct Machine<'a> {
    pub firmware: &'a [u8],
    /// Unified kernel image booted by the firmware.
    pub kernel: &'a [u8],
    pub initrd: &'a [u8],
    pub kernel_cmdline: &'a str,
    pub memory_size: u64,
    #[builder(default = 1)]
    pub cpu_count: u32,
    pub configuration: &'a str,
    #[builder(default)]
    pub mrtd_variant: PageAddOrder,
    /// Known-good MRTD used instead of replaying the firmware sections.
    pub mrtd: Option<&'a [u8]>,
    #[builder(default = DEFAULT_KEY_PROVIDER)]
    pub mr_key_provider: [u8; KEY_PROVIDER_SIZE],
}

impl fmt::Debug for Machine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("firmware", &format_args!("{} bytes", self.firmware.len()))
            .field("kernel", &format_args!("{} bytes", self.kernel.len()))
            .field("initrd", &format_args!("{} bytes", self.initrd.len()))
            .field("kernel_cmdline", &self.kernel_cmdline)
            .field("memory_size", &self.memory_size)
            .field("cpu_count", &self.cpu_count)
            .field("configuration", &self.configuration)
            .field("mrtd_variant", &self.mrtd_variant)
            .field("mrtd", &self.mrtd.map(hex::encode))
            .field("mr_key_provider", &hex::encode(self.mr_key_provider))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TdxMeasurementDetails {
    pub measurements: TdxMeasurements,
    pub rtmr_logs: RtmrLogs,
    /// ACPI blobs, when they came from the generator.
    pub acpi_tables: Option<Tables>,
}

/// Per-configuration results of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationMeasurements {
    pub configuration: String,
    #[serde(flatten)]
    pub measurements: TdxMeasurements,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMeasurements {
    #[serde(with = "hex_bytes")]
    pub rtmr1: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub rtmr2: Vec<u8>,
    pub configurations: Vec<ConfigurationMeasurements>,
}

/// Measures machines against a fixed configuration table.
#[derive(bon::Builder)]
pub struct Measurer<'a> {
    configurations: &'a ConfigurationTable,
    authenticode: &'a dyn AuthenticodeDigester,
    sections: &'a dyn SectionExtractor,
    acpi: Option<&'a dyn AcpiGenerator>,
}

/// RTMR1 and RTMR2 only depend on the kernel, initrd and command line.
struct BootLogs {
    rtmr1_log: RtmrLog,
    rtmr2_log: RtmrLog,
    rtmr1: Vec<u8>,
    rtmr2: Vec<u8>,
}

struct Rtmr0 {
    log: RtmrLog,
    value: Vec<u8>,
    acpi_tables: Option<Tables>,
}

impl Measurer<'_> {
    pub fn measure(&self, machine: &Machine) -> Result<TdxMeasurements> {
        self.measure_with_logs(machine)
            .map(|details| details.measurements)
    }

    pub fn measure_with_logs(&self, machine: &Machine) -> Result<TdxMeasurementDetails> {
        debug!("measuring machine: {machine:#?}");
        let config = self.configurations.get(machine.configuration)?;
        let explicit_mrtd = Self::explicit_mrtd(machine)?;

        let tdvf = Tdvf::parse(machine.firmware)?;
        let mrtd = match explicit_mrtd.or(config.mrtd.as_deref()) {
            Some(mrtd) => mrtd.to_vec(),
            None => tdvf.mrtd(machine.mrtd_variant)?,
        };
        let rtmr0 = self.rtmr0(&tdvf, machine, machine.configuration, config)?;
        let boot = self.boot_logs(machine)?;

        Ok(TdxMeasurementDetails {
            measurements: TdxMeasurements::new(
                mrtd,
                rtmr0.value,
                boot.rtmr1,
                boot.rtmr2,
                &machine.mr_key_provider,
            ),
            rtmr_logs: [rtmr0.log, boot.rtmr1_log, boot.rtmr2_log],
            acpi_tables: rtmr0.acpi_tables,
        })
    }

    /// Measures `machine` once per configuration name. Its own
    /// `configuration` is ignored.
    pub fn measure_batch(
        &self,
        machine: &Machine,
        configurations: &[&str],
    ) -> Result<BatchMeasurements> {
        debug!("measuring machine: {machine:#?}");
        let configs = configurations
            .iter()
            .map(|name| self.configurations.get(name).map(|config| (*name, config)))
            .collect::<Result<Vec<_>>>()?;
        let explicit_mrtd = Self::explicit_mrtd(machine)?;

        let tdvf = Tdvf::parse(machine.firmware)?;
        let boot = self.boot_logs(machine)?;

        let mut computed_mrtd: Option<Vec<u8>> = None;
        let mut results = Vec::with_capacity(configs.len());
        for (name, config) in configs {
            info!("measuring configuration {name}");
            let mrtd = match explicit_mrtd.or(config.mrtd.as_deref()) {
                Some(mrtd) => mrtd.to_vec(),
                None => match &computed_mrtd {
                    Some(mrtd) => mrtd.clone(),
                    None => {
                        let mrtd = tdvf.mrtd(machine.mrtd_variant)?;
                        computed_mrtd = Some(mrtd.clone());
                        mrtd
                    }
                },
            };
            let rtmr0 = self.rtmr0(&tdvf, machine, name, config)?;
            results.push(ConfigurationMeasurements {
                configuration: name.to_string(),
                measurements: TdxMeasurements::new(
                    mrtd,
                    rtmr0.value,
                    boot.rtmr1.clone(),
                    boot.rtmr2.clone(),
                    &machine.mr_key_provider,
                ),
            });
        }

        Ok(BatchMeasurements {
            rtmr1: boot.rtmr1,
            rtmr2: boot.rtmr2,
            configurations: results,
        })
    }

    fn explicit_mrtd<'m>(machine: &Machine<'m>) -> Result<Option<&'m [u8]>> {
        match machine.mrtd {
            Some(mrtd) if mrtd.len() != MR_SIZE => Err(Error::InvalidDigest {
                field: "mrtd".into(),
                expected: MR_SIZE,
                actual: mrtd.len(),
            }),
            mrtd => Ok(mrtd),
        }
    }

    fn acpi_hashes(
        &self,
        machine: &Machine,
        name: &str,
        config: &MachineConfiguration,
    ) -> Result<(AcpiHashes, Option<Tables>)> {
        if let Some(hashes) = config.acpi_hashes() {
            return Ok((hashes, None));
        }
        let generator = self
            .acpi
            .ok_or_else(|| Error::MissingAcpi(name.to_string()))?;
        debug!("generating ACPI tables for {name}");
        let tables = generator
            .generate(machine.memory_size, machine.cpu_count)
            .map_err(|e| Error::collaborator("ACPI generator", e))?;
        Ok((tables.hashes(), Some(tables)))
    }

    fn rtmr0(
        &self,
        tdvf: &Tdvf,
        machine: &Machine,
        name: &str,
        config: &MachineConfiguration,
    ) -> Result<Rtmr0> {
        let (acpi, acpi_tables) = self.acpi_hashes(machine, name, config)?;
        let log = tdvf.rtmr0_log(machine.memory_size, config, &acpi)?;
        debug_print_log("RTMR0", &log);
        Ok(Rtmr0 {
            value: measure_log(&log),
            log,
            acpi_tables,
        })
    }

    fn boot_logs(&self, machine: &Machine) -> Result<BootLogs> {
        let digests = KernelDigests::compute(machine.kernel, self.authenticode, self.sections)?;
        let rtmr1_log = kernel::rtmr1_log(&digests)?;
        debug_print_log("RTMR1", &rtmr1_log);
        let rtmr2_log = kernel::rtmr2_log(machine.kernel_cmdline, machine.initrd);
        debug_print_log("RTMR2", &rtmr2_log);
        Ok(BootLogs {
            rtmr1: measure_log(&rtmr1_log),
            rtmr2: measure_log(&rtmr2_log),
            rtmr1_log,
            rtmr2_log,
        })
    }
}
