//! Address decomposition and dotted-decimal conversion.
//!
//! An IPv4 key is treated purely as a `u32`: bits 31..24 are the host's
//! "upper /16-within-/24" byte and so on. The store never needs anything
//! more structured than the three indices below, so [`Addr`] is a thin,
//! `Copy` wrapper rather than a type hierarchy.

use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::all_consuming;
use nom::sequence::tuple;
use nom::IResult;

/// The decomposition of a 32-bit IPv4 key into the indices the directory
/// and bitmap need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    /// The full key, unchanged.
    pub key: u32,
    /// `/16` index: `key >> 16`, in `0..=65535`.
    pub idx16: u16,
    /// `/24`-within-`/16` index: the third octet, in `0..=255`.
    pub idx24: u8,
    /// Host index: the fourth octet, in `0..=255`.
    pub host: u8,
    /// `/24` prefix: `key >> 8`, in `0..=16_777_215`. Used by the bitmap.
    pub prefix24: u32,
}

impl Addr {
    /// Decomposes `key` into its /16, /24, and host indices.
    #[inline]
    pub fn decompose(key: u32) -> Self {
        Addr {
            key,
            idx16: (key >> 16) as u16,
            idx24: (key >> 8) as u8,
            host: key as u8,
            prefix24: key >> 8,
        }
    }
}

/// Parses a dotted-decimal IPv4 string into its 32-bit representation.
///
/// Returns `0` on any parse failure, matching the embedder-facing
/// `ip_to_u32` contract (spec.md §6): callers that need to distinguish
/// "0.0.0.0" from "unparseable" must validate up front.
pub fn ip_to_u32(s: &str) -> u32 {
    parse_ipv4(s).map(|(_, v)| v).unwrap_or(0)
}

/// Parses a dotted-decimal IPv4 string, distinguishing failure from the
/// literal address `0.0.0.0`.
pub fn try_ip_to_u32(s: &str) -> Option<u32> {
    parse_ipv4(s).map(|(_, v)| v).ok()
}

fn parse_ipv4(input: &str) -> IResult<&str, u32> {
    fn one_octet(input: &str) -> IResult<&str, u8> {
        let (rest, digits) = digit1(input)?;
        if digits.len() > 3 {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Digit,
            )));
        }
        match digits.parse::<u16>() {
            Ok(n) if n <= 255 => Ok((rest, n as u8)),
            _ => Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Digit,
            ))),
        }
    }

    let dot = |i| tag(".")(i);
    all_consuming(tuple((
        one_octet,
        dot,
        one_octet,
        dot,
        one_octet,
        dot,
        one_octet,
    )))(input)
    .map(|(rest, (a, _, b, _, c, _, d))| {
        (
            rest,
            ((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | (d as u32),
        )
    })
}

/// Formats `key` as `A.B.C.D` into `buf`, returning the written slice.
///
/// Requires `buf.len() >= 16` (the longest possible formatted address,
/// `"255.255.255.255"`, plus a NUL-safety margin used by C callers of an
/// eventual FFI layer). Returns `None` if the buffer is too small.
pub fn u32_to_ip_safe(key: u32, buf: &mut [u8]) -> Option<&str> {
    if buf.len() < 16 {
        return None;
    }
    Some(write_ip(key, buf))
}

/// Formats `key` as `A.B.C.D` into `buf` without checking its length.
///
/// Kept for ABI parity with the reference implementation's unchecked
/// formatter. Prefer [`u32_to_ip_safe`]; this panics if `buf` is too small.
#[deprecated(note = "use u32_to_ip_safe; kept for ABI parity with the C reference implementation")]
pub fn u32_to_ip(key: u32, buf: &mut [u8]) -> &str {
    write_ip(key, buf)
}

fn write_ip(key: u32, buf: &mut [u8]) -> &str {
    use std::io::Write;
    let a = (key >> 24) as u8;
    let b = (key >> 16) as u8;
    let c = (key >> 8) as u8;
    let d = key as u8;
    let mut cursor = &mut buf[..];
    let len_before = cursor.len();
    write!(cursor, "{a}.{b}.{c}.{d}").expect("buffer too small for formatted IPv4 address");
    let written = len_before - cursor.len();
    std::str::from_utf8(&buf[..written]).expect("formatted IPv4 address is always ASCII")
}
