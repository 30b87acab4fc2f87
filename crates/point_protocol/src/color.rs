//! RGB color compression shared by the color workers and the shader side.
//!
//! One triple packs into a single f32 as `r*65536 + g*256 + b`. The largest
//! packed value is 2^24 - 1, inside f32's exactly-representable integer
//! range, so the encoding is symmetric and idempotent when both sides use
//! the same functions.

pub fn compress_color(red: u8, green: u8, blue: u8) -> f32 {
    (u32::from(red) * 65_536 + u32::from(green) * 256 + u32::from(blue)) as f32
}

pub fn decompress_color(packed: f32) -> [u8; 3] {
    let value = packed as u32;
    [
        ((value >> 16) & 0xff) as u8,
        ((value >> 8) & 0xff) as u8,
        (value & 0xff) as u8,
    ]
}
