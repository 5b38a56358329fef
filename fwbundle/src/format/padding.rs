// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xff;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a block boundary.
pub fn calc<N: PrimInt>(offset: N, block_size: N) -> N {
    let r = offset % block_size;
    if r == N::zero() {
        N::zero()
    } else {
        block_size - r
    }
}

/// Round to the next multiple of the block size.
pub fn round<N: PrimInt>(offset: N, block_size: N) -> Option<N> {
    let remain = calc(offset, block_size);
    offset.checked_add(&remain)
}

/// Return a buffer of `size` erased bytes.
pub fn erased(size: usize) -> Vec<u8> {
    vec![ERASED; size]
}
