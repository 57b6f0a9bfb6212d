// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad classification of a measurement failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed GUID table, footer, TDVF descriptor or section.
    Parse,
    /// Unknown or inconsistent configuration.
    Configuration,
    /// Inputs that parse but cannot be measured.
    Input,
    /// Failure reported by an external collaborator.
    Collaborator,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("firmware too small: {0} bytes")]
    FirmwareTooSmall(usize),
    #[error("invalid GUID table footer")]
    InvalidFooterGuid,
    #[error("invalid GUID table length: {0}")]
    InvalidTableLength(usize),
    #[error("invalid GUID table entry length {len} ending at offset {offset:#x}")]
    InvalidEntryLength { offset: usize, len: usize },
    #[error("GUID table has no entry for {0}")]
    MissingTableEntry(&'static str),
    #[error("{what} at offset {offset:#x} is outside a buffer of {len:#x} bytes")]
    Truncated {
        what: &'static str,
        offset: usize,
        len: usize,
    },
    #[error("failed to decode {what}")]
    Decode {
        what: &'static str,
        #[source]
        source: scale::Error,
    },
    #[error("TDVF metadata offset {offset:#x} exceeds firmware size {size:#x}")]
    MetadataOffsetOutOfRange { offset: usize, size: usize },
    #[error("invalid TDVF descriptor signature {0:02x?}")]
    InvalidSignature([u8; 4]),
    #[error("unsupported TDVF version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid TDVF section {index}: {reason}")]
    InvalidSection { index: usize, reason: &'static str },
    #[error("firmware has no configuration firmware volume")]
    MissingCfv,
    #[error("CFV range [{start:#x}, {end:#x}) is outside firmware of {size:#x} bytes")]
    CfvOutOfBounds { start: u64, end: u64, size: usize },
    #[error("MR.EXTEND data [{start:#x}, {end:#x}) is outside firmware of {size:#x} bytes")]
    ExtendOutOfBounds { start: u64, end: u64, size: usize },
    #[error("invalid GUID: {0:?}")]
    InvalidGuid(String),
    #[error("unknown machine configuration: {0}")]
    UnknownConfiguration(String),
    #[error("unknown MRTD variant: {0}")]
    UnknownMrtdVariant(String),
    #[error("invalid digest for {field}: expected {expected} bytes, got {actual}")]
    InvalidDigest {
        field: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid key provider {0:?}: expected a known name or 32 bytes of hex")]
    InvalidKeyProvider(String),
    #[error("configuration {0} sets only part of the ACPI table hashes")]
    IncompleteAcpi(String),
    #[error("no ACPI data for configuration {0}: no table hashes and no ACPI generator")]
    MissingAcpi(String),
    #[error("memory size {0:#x} is too small for the TD HOB memory map")]
    MemoryTooSmall(u64),
    #[error("disk of {0} bytes cannot hold a GPT")]
    DiskTooSmall(u64),
    #[error("kernel image has no {0} section")]
    MissingSection(&'static str),
    #[error("{collaborator} failed")]
    Collaborator {
        collaborator: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl Error {
    pub(crate) fn collaborator(collaborator: &'static str, err: anyhow::Error) -> Self {
        Self::Collaborator {
            collaborator,
            source: err.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FirmwareTooSmall(_)
            | Error::InvalidFooterGuid
            | Error::InvalidTableLength(_)
            | Error::InvalidEntryLength { .. }
            | Error::MissingTableEntry(_)
            | Error::Truncated { .. }
            | Error::Decode { .. }
            | Error::MetadataOffsetOutOfRange { .. }
            | Error::InvalidSignature(_)
            | Error::UnsupportedVersion(_)
            | Error::MissingCfv
            | Error::CfvOutOfBounds { .. }
            | Error::ExtendOutOfBounds { .. }
            | Error::InvalidGuid(_) => ErrorKind::Parse,
            Error::UnknownConfiguration(_)
            | Error::UnknownMrtdVariant(_)
            | Error::InvalidDigest { .. }
            | Error::InvalidKeyProvider(_)
            | Error::IncompleteAcpi(_)
            | Error::MissingAcpi(_) => ErrorKind::Configuration,
            Error::InvalidSection { .. }
            | Error::MemoryTooSmall(_)
            | Error::DiskTooSmall(_)
            | Error::MissingSection(_) => ErrorKind::Input,
            Error::Collaborator { .. } => ErrorKind::Collaborator,
        }
    }
}
