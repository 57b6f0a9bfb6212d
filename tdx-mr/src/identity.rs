// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Identifiers derived from the measurement registers.

use sha2::{Digest, Sha256};
use sha3::Keccak256;

/// RTMR3 (48) + MRCONFIGID (48) + TDATTRIBUTES (8) + XFAM (8), all zero.
pub const WORKLOAD_FOOTER: [u8; 112] = [0; 112];

/// SHA-256 over all registers and the key provider measurement.
pub fn mr_aggregated(
    mrtd: &[u8],
    rtmr0: &[u8],
    rtmr1: &[u8],
    rtmr2: &[u8],
    key_provider: &[u8],
) -> Vec<u8> {
    let mut h = Sha256::new();
    for part in [mrtd, rtmr0, rtmr1, rtmr2, key_provider] {
        h.update(part);
    }
    h.finalize().to_vec()
}

/// SHA-256 over the registers that do not depend on the machine shape.
pub fn mr_image(mrtd: &[u8], rtmr1: &[u8], rtmr2: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    for part in [mrtd, rtmr1, rtmr2] {
        h.update(part);
    }
    h.finalize().to_vec()
}

pub fn workload_id(mrtd: &[u8], rtmr0: &[u8], rtmr1: &[u8], rtmr2: &[u8]) -> Vec<u8> {
    let mut h = Keccak256::new();
    for part in [mrtd, rtmr0, rtmr1, rtmr2, &WORKLOAD_FOOTER[..]] {
        h.update(part);
    }
    h.finalize().to_vec()
}
