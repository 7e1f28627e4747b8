//! The bulk CSV mini-grammar and the driver that replays it into a
//! [`crate::Context`].
//!
//! ```text
//! line   ::= ip ',' change
//! ip     ::= octet '.' octet '.' octet '.' octet
//! change ::= '+' digits        -- relative add
//!          | '+-' digits       -- relative subtract
//!          | '-' digits        -- absolute set to negative
//!          |     digits        -- absolute set to positive
//! ```
//!
//! Lines beginning with `#` (after leading whitespace) and empty lines are
//! skipped without counting as a parse error; a trailing `#` comment on an
//! otherwise valid line also terminates the line early. The grammar is
//! line-oriented, so the whole driver works equally well over a file or an
//! in-memory buffer — [`load_buffer`] splits on `\n` with [`memchr`] the way
//! the teacher's breakpad-symbol reader does, and [`load_reader`] drives any
//! `BufRead`.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::time::{Duration, Instant};

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::{all_consuming, opt};
use nom::sequence::tuple;
use nom::IResult;

use crate::context::Context;
use crate::error::Result;
use crate::score::MAX_SCORE;

/// Tally of a completed bulk load, and its derived throughput.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadResult {
    /// Every non-skipped-at-lexer line: parse failures and successes alike.
    pub lines_processed: u64,
    /// Lines that failed to parse (same count as `parse_errors`).
    pub lines_skipped: u64,
    /// Lines that resulted in an absolute `set`.
    pub sets: u64,
    /// Lines that resulted in a relative `increment`/`decrement`.
    pub updates: u64,
    /// Parse failures. Always equal to `lines_skipped`.
    pub parse_errors: u64,
    /// Wall time from the first input byte read to the last.
    pub elapsed: Duration,
}

impl LoadResult {
    /// Lines processed per second of `elapsed`, or `0.0` if no time passed.
    pub fn lines_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.lines_processed as f64 / secs
        }
    }
}

/// One parsed, not-yet-applied line of input.
enum Change {
    /// Absolute `set(ip, value)`.
    Set(u32, i16),
    /// Relative `increment(ip, delta)`.
    Update(u32, i16),
}

/// Loads `path` into `ctx`, line by line, per the grammar above.
pub fn load_file(ctx: &Context, path: &Path) -> Result<LoadResult> {
    let file = std::fs::File::open(path).map_err(|e| {
        log::error!("failed to open bulk-load file {}: {e}", path.display());
        e
    })?;
    let result = load_reader(ctx, BufReader::new(file))?;
    log::info!(
        "bulk-loaded {} ({} sets, {} updates, {} parse errors) from {} in {:.3}s ({:.0} lines/s)",
        result.lines_processed,
        result.sets,
        result.updates,
        result.parse_errors,
        path.display(),
        result.elapsed.as_secs_f64(),
        result.lines_per_second(),
    );
    Ok(result)
}

/// Loads an in-memory buffer into `ctx`.
///
/// Splits on `\n` using [`memchr`] rather than an allocating line iterator,
/// since bulk feeds can be tens of millions of lines.
pub fn load_buffer(ctx: &Context, buf: &[u8]) -> Result<LoadResult> {
    let start = Instant::now();
    let mut result = LoadResult::default();
    let mut rest = buf;
    while !rest.is_empty() {
        let line = match memchr::memchr(b'\n', rest) {
            Some(pos) => {
                let line = &rest[..pos];
                rest = &rest[pos + 1..];
                line
            }
            None => {
                let line = rest;
                rest = &[];
                line
            }
        };
        process_line(ctx, line, &mut result);
    }
    result.elapsed = start.elapsed();
    Ok(result)
}

/// Loads any buffered reader into `ctx`, one line at a time.
pub fn load_reader<R: Read>(ctx: &Context, mut reader: BufReader<R>) -> Result<LoadResult> {
    let start = Instant::now();
    let mut result = LoadResult::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        let slice = if line.last() == Some(&b'\n') {
            &line[..line.len() - 1]
        } else {
            &line[..]
        };
        process_line(ctx, slice, &mut result);
    }
    result.elapsed = start.elapsed();
    Ok(result)
}

fn process_line(ctx: &Context, raw: &[u8], result: &mut LoadResult) {
    let line = strip_comment_and_trim(raw);
    if line.is_empty() {
        return;
    }
    result.lines_processed += 1;

    let text = match std::str::from_utf8(line) {
        Ok(t) => t,
        Err(_) => {
            result.lines_skipped += 1;
            result.parse_errors += 1;
            return;
        }
    };

    match parse_line(text) {
        Some(Change::Set(ip, score)) => {
            ctx.set(ip, score);
            result.sets += 1;
        }
        Some(Change::Update(ip, delta)) => {
            ctx.increment(ip, delta);
            result.updates += 1;
        }
        None => {
            result.lines_skipped += 1;
            result.parse_errors += 1;
        }
    }
}

/// Trims surrounding whitespace, drops a trailing `\r`, and cuts the line
/// off at the first `#` (a full-line or trailing comment). Returns an empty
/// slice for lines that are comments or blank after trimming.
fn strip_comment_and_trim(raw: &[u8]) -> &[u8] {
    let raw = if raw.last() == Some(&b'\r') {
        &raw[..raw.len() - 1]
    } else {
        raw
    };
    let line = match memchr::memchr(b'#', raw) {
        Some(pos) => &raw[..pos],
        None => raw,
    };
    trim_ascii_whitespace(line)
}

fn trim_ascii_whitespace(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if first.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = s {
        if last.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    s
}

fn parse_line(text: &str) -> Option<Change> {
    let (_, (ip, _, change)) = all_consuming(tuple((ip_literal, comma, change_literal)))(text.trim())
        .ok()?;
    Some(change.into_change(ip))
}

fn comma(input: &str) -> IResult<&str, &str> {
    tag(",")(input)
}

fn ip_literal(input: &str) -> IResult<&str, u32> {
    let (rest, text) = nom::bytes::complete::take_till1(|c| c == ',')(input)?;
    let text = text.trim();
    match crate::addr::try_ip_to_u32(text) {
        Some(ip) => Ok((rest, ip)),
        None => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

/// The right-hand side of the grammar, not yet bound to an IP.
enum ChangeLiteral {
    RelativeAdd(i16),
    RelativeSubtract(i16),
    AbsoluteNegative(i16),
    AbsolutePositive(i16),
}

impl ChangeLiteral {
    fn into_change(self, ip: u32) -> Change {
        match self {
            ChangeLiteral::RelativeAdd(n) => Change::Update(ip, n),
            ChangeLiteral::RelativeSubtract(n) => Change::Update(ip, n.saturating_neg()),
            ChangeLiteral::AbsoluteNegative(n) => Change::Set(ip, n.saturating_neg()),
            ChangeLiteral::AbsolutePositive(n) => Change::Set(ip, n),
        }
    }
}

fn change_literal(input: &str) -> IResult<&str, ChangeLiteral> {
    let input = input.trim();
    alt((relative_subtract, relative_add, absolute_negative, absolute_positive))(input)
}

fn relative_subtract(input: &str) -> IResult<&str, ChangeLiteral> {
    let (rest, (_, digits)) = tuple((tag("+-"), digit1))(input)?;
    Ok((rest, ChangeLiteral::RelativeSubtract(parse_magnitude(digits))))
}

fn relative_add(input: &str) -> IResult<&str, ChangeLiteral> {
    let (rest, (_, digits)) = tuple((tag("+"), digit1))(input)?;
    Ok((rest, ChangeLiteral::RelativeAdd(parse_magnitude(digits))))
}

fn absolute_negative(input: &str) -> IResult<&str, ChangeLiteral> {
    let (rest, (_, digits)) = tuple((tag("-"), digit1))(input)?;
    Ok((rest, ChangeLiteral::AbsoluteNegative(parse_magnitude(digits))))
}

fn absolute_positive(input: &str) -> IResult<&str, ChangeLiteral> {
    let (rest, digits) = digit1(input)?;
    Ok((rest, ChangeLiteral::AbsolutePositive(parse_magnitude(digits))))
}

/// Parses a decimal magnitude, saturating at [`MAX_SCORE`] rather than
/// overflowing or erroring on an overlong digit run.
fn parse_magnitude(digits: &str) -> i16 {
    let mut acc: i32 = 0;
    for b in digits.bytes() {
        acc = acc.saturating_mul(10).saturating_add((b - b'0') as i32);
        if acc > MAX_SCORE as i32 {
            return MAX_SCORE;
        }
    }
    acc as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn parses_absolute_positive() {
        let ctx = Context::new();
        let r = load_buffer(&ctx, b"192.168.1.1,100\n").unwrap();
        assert_eq!(ctx.get(crate::addr::ip_to_u32("192.168.1.1")), 100);
        assert_eq!(r.sets, 1);
        assert_eq!(r.updates, 0);
        assert_eq!(r.lines_processed, 1);
    }

    #[test]
    fn scenario_d_csv_grammar() {
        let ctx = Context::new();
        let input = b"192.168.1.1,100\n192.168.1.2,+50\n10.0.0.1,-25\n10.0.0.2,+-10\n";
        let r = load_buffer(&ctx, input).unwrap();
        assert_eq!(ctx.get(crate::addr::ip_to_u32("192.168.1.1")), 100);
        assert_eq!(ctx.get(crate::addr::ip_to_u32("192.168.1.2")), 50);
        assert_eq!(ctx.get(crate::addr::ip_to_u32("10.0.0.1")), -25);
        assert_eq!(ctx.get(crate::addr::ip_to_u32("10.0.0.2")), -10);
        assert_eq!(r.sets, 2);
        assert_eq!(r.updates, 2);
        assert_eq!(r.parse_errors, 0);
        assert_eq!(r.lines_processed, 4);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let ctx = Context::new();
        let input = b"# a comment\n\n  \n192.168.1.1,100 # trailing comment\n";
        let r = load_buffer(&ctx, input).unwrap();
        assert_eq!(ctx.get(crate::addr::ip_to_u32("192.168.1.1")), 100);
        assert_eq!(r.lines_processed, 1);
        assert_eq!(r.parse_errors, 0);
    }

    #[test]
    fn counts_parse_failures_without_aborting() {
        let ctx = Context::new();
        let input = b"not-an-ip,100\n192.168.1.1,100\n";
        let r = load_buffer(&ctx, input).unwrap();
        assert_eq!(r.lines_processed, 2);
        assert_eq!(r.parse_errors, 1);
        assert_eq!(r.sets, 1);
        assert_eq!(ctx.get(crate::addr::ip_to_u32("192.168.1.1")), 100);
    }

    #[test]
    fn tolerates_crlf_and_whitespace() {
        let ctx = Context::new();
        let input = b"  192.168.1.1 , 100 \r\n";
        let r = load_buffer(&ctx, input).unwrap();
        assert_eq!(r.parse_errors, 0);
        assert_eq!(ctx.get(crate::addr::ip_to_u32("192.168.1.1")), 100);
    }

    #[test]
    fn magnitude_saturates_on_overlong_digits() {
        assert_eq!(parse_magnitude("999999999999"), MAX_SCORE);
    }

    #[test]
    fn nonexistent_file_is_io_failure() {
        let ctx = Context::new();
        let err = load_file(&ctx, Path::new("/nonexistent/path/does-not-exist.csv")).unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }
}
