// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! UEFI GUIDs and the EFI events measured by the firmware.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::util::{measure_sha384, utf16_encode};

pub const EFI_GLOBAL_VARIABLE_GUID: &str = "8BE4DF61-93CA-11D2-AA0D-00E098032B8C";
pub const IMAGE_SECURITY_DATABASE_GUID: &str = "D719B2CB-3D3A-4596-A3BC-DAD00E67656F";
pub const EFI_SYSTEM_PARTITION_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

pub const EV_CALLING_EFI_APPLICATION: &[u8] = b"Calling EFI Application from Boot Option";
pub const EV_EXIT_BOOT_SERVICES_INVOCATION: &[u8] = b"Exit Boot Services Invocation";
pub const EV_EXIT_BOOT_SERVICES_SUCCEEDED: &[u8] = b"Exit Boot Services Returned with Success";

/// A GUID in its binary (mixed-endian) UEFI layout.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid([u8; 16]);

impl Guid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn parse(guid_str: &str) -> Result<Self> {
        encode_guid(guid_str).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{}-{}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16]),
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

/// Encodes a GUID string into its binary representation.
///
/// The first three groups are stored little-endian, the last two in
/// the order they are written.
pub fn encode_guid(guid_str: &str) -> Result<[u8; 16]> {
    const GROUP_LENGTHS: [usize; 5] = [8, 4, 4, 4, 12];

    let invalid = || Error::InvalidGuid(guid_str.to_string());
    let atoms: Vec<&str> = guid_str.split('-').collect();
    if atoms.len() != GROUP_LENGTHS.len() {
        return Err(invalid());
    }

    let mut data = Vec::with_capacity(16);
    for (idx, (atom, expected_len)) in atoms.iter().zip(GROUP_LENGTHS).enumerate() {
        if atom.len() != expected_len {
            return Err(invalid());
        }
        let raw = hex::decode(atom).map_err(|_| invalid())?;
        if idx <= 2 {
            data.extend(raw.iter().rev());
        } else {
            data.extend_from_slice(&raw);
        }
    }

    data.try_into().map_err(|_| invalid())
}

/// Measures an EFI variable event whose variable data is not part of the digest.
pub fn measure_tdx_efi_variable(vendor_guid: &str, var_name: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.extend_from_slice(&encode_guid(vendor_guid)?);
    data.extend_from_slice(&(var_name.len() as u64).to_le_bytes());
    data.extend_from_slice(&0u64.to_le_bytes());
    data.extend(utf16_encode(var_name));
    Ok(measure_sha384(&data))
}

/// EV_SEPARATOR digest.
pub fn separator() -> Vec<u8> {
    measure_sha384(&[0x00, 0x00, 0x00, 0x00])
}
