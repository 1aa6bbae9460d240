//! In-place f32 ↔ binary16 conversion of weight buffers
//!
//! Narrowing packs the f16 values into the first half of the f32 buffer so
//! the same allocation can be handed to the device:
//!
//! ```text
//! before:  | f32 0 | f32 1 | f32 2 | f32 3 |
//! after:   |h0|h1|h2|h3|   (stale bytes)   |
//! ```
//!
//! Widening reverses this, walking back to front so no value is overwritten
//! before it is read.

use half::f16;

/// Narrow every f32 in `buf` to f16, packed into the first half of `buf`
pub fn narrow_in_place(buf: &mut [u8]) {
    let count = buf.len() / 4;
    for i in 0..count {
        let value: f32 = bytemuck::pod_read_unaligned(&buf[i * 4..i * 4 + 4]);
        let bits = f16::from_f32(value).to_bits().to_ne_bytes();
        buf[i * 2..i * 2 + 2].copy_from_slice(&bits);
    }
}

/// Widen the f16 values packed in the first half of `buf` back to f32
pub fn widen_in_place(buf: &mut [u8]) {
    let count = buf.len() / 4;
    for i in (0..count).rev() {
        let bits: u16 = bytemuck::pod_read_unaligned(&buf[i * 2..i * 2 + 2]);
        let value = f16::from_bits(bits).to_f32();
        buf[i * 4..i * 4 + 4].copy_from_slice(bytemuck::bytes_of(&value));
    }
}

/// Packed f16 bytes of an f32 buffer
pub fn narrowed_copy(buf: &[u8]) -> Vec<u8> {
    let mut out = buf.to_vec();
    narrow_in_place(&mut out);
    out.truncate(buf.len() / 2);
    out
}
