// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use log::debug;
use sha2::{Digest, Sha384};

/// Size of a SHA-384 measurement register.
pub const MR_SIZE: usize = 48;

/// Computes a SHA-384 of the given blob.
pub fn measure_sha384(data: &[u8]) -> Vec<u8> {
    Sha384::digest(data).to_vec()
}

/// Replays an event log into a register that starts out zeroed.
///
/// Each entry is folded in as `mr = SHA384(mr || entry)`, in log order.
pub fn measure_log(log: &[Vec<u8>]) -> Vec<u8> {
    let mut mr = [0u8; MR_SIZE];
    for entry in log {
        let mut h = Sha384::new();
        h.update(mr);
        h.update(entry);
        mr = h.finalize().into();
    }
    mr.to_vec()
}

/// UTF-16LE without a terminator.
pub fn utf16_encode(input: &str) -> Vec<u8> {
    input.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// UTF-16LE with a trailing NUL code unit.
pub fn utf16_encode_nul(input: &str) -> Vec<u8> {
    let mut out = utf16_encode(input);
    out.extend_from_slice(&[0, 0]);
    out
}

/// Measures the kernel command line the way the EFI stub logs it.
pub fn measure_cmdline(cmdline: &str) -> Vec<u8> {
    measure_sha384(&utf16_encode_nul(cmdline))
}

pub(crate) fn debug_print_log(name: &str, log: &[Vec<u8>]) {
    debug!("{name} log has {} events", log.len());
    for (i, entry) in log.iter().enumerate() {
        debug!("{name}[{i}]: {}", hex::encode(entry));
    }
}
