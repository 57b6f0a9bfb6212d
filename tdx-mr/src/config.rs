// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Per machine-shape RTMR0 inputs and other static measurement data.

use std::collections::BTreeMap;

use hex_literal::hex;
use serde::{Deserialize, Serialize};

use crate::acpi::AcpiHashes;
use crate::error::{Error, Result};
use crate::util::{measure_sha384, MR_SIZE};

/// BootOrder variable contents: Boot0001, Boot0002, Boot0000.
pub const DEFAULT_BOOT_ORDER: [u8; 6] = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00];

pub const KEY_PROVIDER_SIZE: usize = 32;
pub const DEFAULT_KEY_PROVIDER: [u8; KEY_PROVIDER_SIZE] = [0; KEY_PROVIDER_SIZE];

/// Key providers that can be given by name.
pub const KNOWN_KEY_PROVIDERS: &[(&str, [u8; KEY_PROVIDER_SIZE])] = &[
    (
        "sgx-v0",
        hex!("4888adb026ff91c1320c4f544a9f5d9e0561e13fc64947a10aa1556d0071b2cc"),
    ),
    (
        "none",
        hex!("3369c4d32b9f1320ebba5ce9892a283127b7e96e1d511d7f292e5d9ed2c10b8c"),
    ),
];

/// Resolves a key provider name, or decodes 32 bytes of hex.
pub fn resolve_key_provider(value: &str) -> Result<[u8; KEY_PROVIDER_SIZE]> {
    if let Some((_, measurement)) = KNOWN_KEY_PROVIDERS.iter().find(|(name, _)| *name == value) {
        return Ok(*measurement);
    }
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::InvalidKeyProvider(value.to_string()))
}

/// Firmware events of a known machine shape that cannot be derived
/// from the firmware image alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfiguration {
    /// Replaces the synthesized TD HOB digest.
    #[serde(default, with = "opt_hex", skip_serializing_if = "Option::is_none")]
    pub td_hob_hash: Option<Vec<u8>>,
    #[serde(default, with = "opt_hex", skip_serializing_if = "Option::is_none")]
    pub acpi_loader_hash: Option<Vec<u8>>,
    #[serde(default, with = "opt_hex", skip_serializing_if = "Option::is_none")]
    pub acpi_rsdp_hash: Option<Vec<u8>>,
    #[serde(default, with = "opt_hex", skip_serializing_if = "Option::is_none")]
    pub acpi_tables_hash: Option<Vec<u8>>,
    #[serde(default, with = "opt_hex", skip_serializing_if = "Option::is_none")]
    pub boot_order_hash: Option<Vec<u8>>,
    #[serde(with = "hex_digest")]
    pub boot0001_hash: Vec<u8>,
    #[serde(with = "hex_digest")]
    pub boot0002_hash: Vec<u8>,
    #[serde(with = "hex_digest")]
    pub boot0000_hash: Vec<u8>,
    /// Known-good MRTD for the firmware this shape boots.
    #[serde(default, with = "opt_hex", skip_serializing_if = "Option::is_none")]
    pub mrtd: Option<Vec<u8>>,
}

impl MachineConfiguration {
    fn digests(&self) -> [(&'static str, Option<&Vec<u8>>); 9] {
        [
            ("td_hob_hash", self.td_hob_hash.as_ref()),
            ("acpi_loader_hash", self.acpi_loader_hash.as_ref()),
            ("acpi_rsdp_hash", self.acpi_rsdp_hash.as_ref()),
            ("acpi_tables_hash", self.acpi_tables_hash.as_ref()),
            ("boot_order_hash", self.boot_order_hash.as_ref()),
            ("boot0001_hash", Some(&self.boot0001_hash)),
            ("boot0002_hash", Some(&self.boot0002_hash)),
            ("boot0000_hash", Some(&self.boot0000_hash)),
            ("mrtd", self.mrtd.as_ref()),
        ]
    }

    /// Checks digest sizes and that the ACPI hashes are all set or all unset.
    pub fn validate(&self, name: &str) -> Result<()> {
        for (field, digest) in self.digests() {
            if let Some(digest) = digest {
                if digest.len() != MR_SIZE {
                    return Err(Error::InvalidDigest {
                        field: format!("{name}.{field}"),
                        expected: MR_SIZE,
                        actual: digest.len(),
                    });
                }
            }
        }
        let acpi_set = [
            &self.acpi_loader_hash,
            &self.acpi_rsdp_hash,
            &self.acpi_tables_hash,
        ]
        .iter()
        .filter(|h| h.is_some())
        .count();
        if acpi_set != 0 && acpi_set != 3 {
            return Err(Error::IncompleteAcpi(name.to_string()));
        }
        Ok(())
    }

    pub fn acpi_hashes(&self) -> Option<AcpiHashes> {
        match (
            &self.acpi_loader_hash,
            &self.acpi_rsdp_hash,
            &self.acpi_tables_hash,
        ) {
            (Some(loader), Some(rsdp), Some(tables)) => Some(AcpiHashes {
                loader: loader.clone(),
                rsdp: rsdp.clone(),
                tables: tables.clone(),
            }),
            _ => None,
        }
    }

    pub fn boot_order_hash(&self) -> Vec<u8> {
        self.boot_order_hash
            .clone()
            .unwrap_or_else(|| measure_sha384(&DEFAULT_BOOT_ORDER))
    }
}

/// Machine configurations by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationTable {
    configurations: BTreeMap<String, MachineConfiguration>,
}

impl ConfigurationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, configuration: MachineConfiguration) {
        self.configurations.insert(name.into(), configuration);
    }

    pub fn with(mut self, name: impl Into<String>, configuration: MachineConfiguration) -> Self {
        self.insert(name, configuration);
        self
    }

    /// Looks up and validates a configuration.
    pub fn get(&self, name: &str) -> Result<&MachineConfiguration> {
        let configuration = self
            .configurations
            .get(name)
            .ok_or_else(|| Error::UnknownConfiguration(name.to_string()))?;
        configuration.validate(name)?;
        Ok(configuration)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.configurations.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }
}

/// A published (MRTD, RTMR0) pair for a cloud machine shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceMeasurement {
    pub configuration: &'static str,
    pub mrtd: [u8; MR_SIZE],
    pub rtmr0: [u8; MR_SIZE],
}

const GCP_OVMF_MRTD: [u8; MR_SIZE] = hex!("a5844e88897b70c318bef929ef4dfd6c7304c52c4bc9c3f39132f0fdccecf3eb5bab70110ee42a12509a31c037288694");

/// Extracted from Google Cloud C3 instances on 2025-10-14.
pub const REFERENCE_MEASUREMENTS: &[ReferenceMeasurement] = &[
    ReferenceMeasurement {
        configuration: "c3-standard-4",
        mrtd: GCP_OVMF_MRTD,
        rtmr0: hex!("d0f45aa9ba05adfd1a0742b8d885c4dc00050a2fd0eda64469c9e5d191008494ddd9a01c647517c5cdb0632816fbc435"),
    },
    ReferenceMeasurement {
        configuration: "c3-standard-8",
        mrtd: GCP_OVMF_MRTD,
        rtmr0: hex!("b5b994287455c2bbae601cd2f8d67ccbf64b9971a7473926f711d78e84ac1f4ec23b0661309a72826f15c325eb0c8991"),
    },
];

fn decode_hex<E: serde::de::Error>(s: &str) -> std::result::Result<Vec<u8>, E> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(E::custom)
}

pub(crate) mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::decode_hex(&s)
    }
}

pub(crate) mod opt_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        data: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match data {
            Some(data) => super::hex_digest::serialize(data, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| super::decode_hex(&s))
            .transpose()
    }
}
