// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use scale::{Decode, Encode};

use crate::error::{Error, Result};

/// Decodes a little-endian value (integer or fixed-layout struct) at `offset`.
pub(crate) fn read_le<T: Decode>(data: &[u8], offset: usize, what: &'static str) -> Result<T> {
    let mut input = data.get(offset..).ok_or(Error::Truncated {
        what,
        offset,
        len: data.len(),
    })?;
    T::decode(&mut input).map_err(|source| Error::Decode { what, source })
}

/// Overwrites the bytes at `offset` with the little-endian encoding of `value`.
pub(crate) fn write_le<T: Encode>(
    data: &mut [u8],
    offset: usize,
    value: &T,
    what: &'static str,
) -> Result<()> {
    let encoded = value.encode();
    let len = data.len();
    let dest = offset
        .checked_add(encoded.len())
        .and_then(|end| data.get_mut(offset..end))
        .ok_or(Error::Truncated { what, offset, len })?;
    dest.copy_from_slice(&encoded);
    Ok(())
}
