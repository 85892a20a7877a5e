//! Helpers for explicit network byte-order conversions.
//!
//! Frame headers mix 24-, 32- and 31-bit big-endian fields. These helpers keep
//! the Clippy expectations scoped to the conversion points so codec code can
//! remain explicit about wire endianness.

/// Mask selecting the 31 value bits of a stream identifier or window increment.
pub const U31_MASK: u32 = 0x7FFF_FFFF;

/// Largest value representable in a 24-bit length field.
pub const U24_MAX: u32 = 0x00FF_FFFF;

/// Serialise a `u16` in network byte order (big-endian).
///
/// # Examples
///
/// ```
/// use muxframe::byte_order::write_network_u16;
///
/// assert_eq!(write_network_u16(0x1234), [0x12, 0x34]);
/// ```
#[must_use]
pub fn write_network_u16(value: u16) -> [u8; 2] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    value.to_be_bytes()
}

/// Parse a network-order `u16` from its on-wire representation.
#[must_use]
pub fn read_network_u16(bytes: [u8; 2]) -> u16 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    u16::from_be_bytes(bytes)
}

/// Serialise a `u32` in network byte order (big-endian).
///
/// # Examples
///
/// ```
/// use muxframe::byte_order::write_network_u32;
///
/// assert_eq!(write_network_u32(0x1234_5678), [0x12, 0x34, 0x56, 0x78]);
/// ```
#[must_use]
pub fn write_network_u32(value: u32) -> [u8; 4] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    value.to_be_bytes()
}

/// Parse a network-order `u32` from its on-wire representation.
#[must_use]
pub fn read_network_u32(bytes: [u8; 4]) -> u32 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    u32::from_be_bytes(bytes)
}

/// Serialise the low 24 bits of `value` in network byte order.
///
/// Bits above the 24th are discarded; callers validate lengths first.
///
/// # Examples
///
/// ```
/// use muxframe::byte_order::write_network_u24;
///
/// assert_eq!(write_network_u24(0x00AB_CDEF), [0xAB, 0xCD, 0xEF]);
/// ```
#[must_use]
pub fn write_network_u24(value: u32) -> [u8; 3] {
    let [_, hi, mid, lo] = write_network_u32(value & U24_MAX);
    [hi, mid, lo]
}

/// Parse a network-order 24-bit length.
///
/// # Examples
///
/// ```
/// use muxframe::byte_order::read_network_u24;
///
/// assert_eq!(read_network_u24([0xAB, 0xCD, 0xEF]), 0x00AB_CDEF);
/// ```
#[must_use]
pub fn read_network_u24(bytes: [u8; 3]) -> u32 {
    let [hi, mid, lo] = bytes;
    read_network_u32([0, hi, mid, lo])
}

/// Parse a network-order 31-bit value, ignoring the reserved high bit.
#[must_use]
pub fn read_network_u31(bytes: [u8; 4]) -> u32 { read_network_u32(bytes) & U31_MASK }

/// Serialise a 31-bit value with the reserved high bit cleared.
#[must_use]
pub fn write_network_u31(value: u32) -> [u8; 4] { write_network_u32(value & U31_MASK) }

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::u16(&write_network_u16(0x1234)[..], &[0x12, 0x34])]
    #[case::u24(&write_network_u24(0x0012_3456)[..], &[0x12, 0x34, 0x56])]
    #[case::u32(&write_network_u32(0x1234_5678)[..], &[0x12, 0x34, 0x56, 0x78])]
    fn writes_big_endian(#[case] written: &[u8], #[case] expected: &[u8]) {
        assert_eq!(written, expected);
    }

    #[test]
    fn u24_write_truncates_high_byte() {
        assert_eq!(write_network_u24(0xFF12_3456), [0x12, 0x34, 0x56]);
    }

    #[test]
    fn u31_read_clears_reserved_bit() {
        assert_eq!(read_network_u31([0x80, 0, 0, 0x05]), 5);
        assert_eq!(write_network_u31(0xFFFF_FFFF), [0x7F, 0xFF, 0xFF, 0xFF]);
    }
}
