//! Config file parser using winnow.
//!
//! ```text
//! # MERAM blocks 0..63 belong to the display controller
//! reserved 0 63
//! ipmmui   vpu  0x8c000000  16
//! ```
//!
//! # Syntax
//!
//! - One directive per line, tokens separated by spaces or tabs
//! - Empty lines and lines whose first token starts with `#` are skipped
//! - `reserved <start_block> <end_block>` (inclusive block range)
//! - `ipmmui <tag> <address> <size_mib>`
//! - Lines starting with any other keyword are ignored
//! - Numbers are decimal or `0x`-prefixed hexadecimal

use super::{ReservedRange, TagEntry};
use crate::error::{Error, Result};
use winnow::Parser;
use winnow::ascii::{digit1, hex_digit1, space0};
use winnow::combinator::{alt, preceded, repeat, terminated};
use winnow::error::ContextError;
use winnow::token::take_while;

type WResult<T> = std::result::Result<T, ContextError>;

/// A recognised directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Directive {
    Reserved(ReservedRange),
    Tag(TagEntry),
}

/// Parse a whole config text into directives, in file order.
pub(crate) fn parse_config(input: &str) -> Result<Vec<Directive>> {
    input
        .lines()
        .enumerate()
        .filter_map(|(n, text)| parse_line(n + 1, text).transpose())
        .collect()
}

/// Parse one line. `Ok(None)` for comments, blanks and unknown keywords.
fn parse_line(line: usize, text: &str) -> Result<Option<Directive>> {
    let tokens = tokens
        .parse(text)
        .map_err(|e| config_error(line, format!("cannot tokenize: {e}")))?;

    let Some((&keyword, fields)) = tokens.split_first() else {
        return Ok(None);
    };
    if keyword.starts_with('#') {
        return Ok(None);
    }

    let directive = match keyword {
        "reserved" => {
            let [start, end] = expect_fields(line, fields)?;
            let start_block = block_number(line, start)?;
            let end_block = block_number(line, end)?;
            if start_block > end_block {
                return Err(config_error(
                    line,
                    format!("reserved range {start_block}..={end_block} is reversed"),
                ));
            }
            Directive::Reserved(ReservedRange::new(start_block, end_block))
        }
        "ipmmui" => {
            let [tag, address, size] = expect_fields(line, fields)?;
            Directive::Tag(TagEntry {
                tag: tag.to_string(),
                address: number(line, address)?,
                size: u32::try_from(number(line, size)?)
                    .map_err(|_| config_error(line, format!("size {size} out of range")))?,
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(directive))
}

fn expect_fields<'a, const N: usize>(line: usize, fields: &[&'a str]) -> Result<[&'a str; N]> {
    <[&str; N]>::try_from(fields).map_err(|_| {
        let reason = if fields.len() < N {
            "invalid data: too few fields"
        } else {
            "too many fields"
        };
        config_error(line, format!("{reason} (expected {N}, got {})", fields.len()))
    })
}

fn block_number(line: usize, token: &str) -> Result<usize> {
    let value = number(line, token)?;
    usize::try_from(value).map_err(|_| config_error(line, format!("block {token} out of range")))
}

fn number(line: usize, token: &str) -> Result<u64> {
    unsigned
        .parse(token)
        .map_err(|_| config_error(line, format!("invalid number `{token}`")))
}

fn config_error(line: usize, reason: String) -> Error {
    Error::ConfigLoad { line, reason }
}

/// Split a line into whitespace-separated tokens.
fn tokens<'a>(input: &mut &'a str) -> WResult<Vec<&'a str>> {
    let _ = space0.parse_next(input)?;
    repeat(0.., terminated(token, space0)).parse_next(input)
}

/// A run of non-blank characters.
fn token<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| !matches!(c, ' ' | '\t')).parse_next(input)
}

/// Parse a decimal or `0x` hexadecimal number.
///
/// A leading `0` does not select octal: `010` is ten.
fn unsigned(input: &mut &str) -> WResult<u64> {
    alt((
        preceded(alt(("0x", "0X")), hex_digit1).try_map(|h| u64::from_str_radix(h, 16)),
        digit1.try_map(str::parse::<u64>),
    ))
    .parse_next(input)
}
