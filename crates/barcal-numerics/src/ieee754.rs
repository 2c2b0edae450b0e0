//! Factor encoding for firmware transfer.
//!
//! The firmware stores factors as `f32`; the calibrated artifact carries the
//! bit pattern as 8 uppercase hex digits next to the decimal value. The
//! pattern is the same big-endian word the factor read-back returns.

/// Narrows `factor` to `f32` precision.
pub fn to_f32(factor: f64) -> f32 {
    factor as f32
}

/// Bit pattern of `factor` as `f32`, e.g. `0.5` -> `"3F000000"`.
pub fn to_hex(factor: f32) -> String {
    format!("{:08X}", factor.to_bits())
}

/// Parses an 8-digit hex bit pattern back into the `f32` it encodes.
pub fn from_hex(hex: &str) -> Option<f32> {
    let hex = hex.trim();
    if hex.len() != 8 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().map(f32::from_bits)
}
