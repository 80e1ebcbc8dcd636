//! Property extractor
//!
//! Pure function over one [`QueryRecord`]: finds `JSONExtract*` / `JSONHas`
//! calls against a watched table's raw JSON column and yields the property
//! paths they read. A regex locates candidate call sites in the raw SQL text;
//! a nom parser then takes over for the argument list, so quoting and escape
//! rules are handled properly instead of by string surgery.
//!
//! Malformed call sites are skipped and counted, never fatal to the run.

use lazy_static::lazy_static;
use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag},
    character::complete::{alpha1, alphanumeric1, char, multispace0},
    combinator::{map, opt, recognize, value},
    multi::{many0, separated_list1},
    sequence::{delimited, pair},
    IResult, Parser,
};
use regex::Regex;
use std::collections::BTreeSet;

use crate::query_log::QueryRecord;

pub mod errors;
pub use errors::ExtractError;

lazy_static! {
    // ClickHouse function names are case-sensitive; the recognized family is
    // the JSONExtract* accessors plus JSONHas (presence checks still read the
    // raw column and benefit from materialization).
    static ref EXTRACT_CALL: Regex =
        Regex::new(r"\bJSON(?:Extract(?:String|Int|UInt|Float|Bool|Raw|ArrayRaw|Keys)?|Has)\s*\(")
            .expect("extraction call regex is valid");
}

/// Result of mining one query record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionOutcome {
    /// Distinct property paths accessed by the record. De-duplicated per
    /// record: usage counts measure queries, not call sites.
    pub properties: Vec<String>,
    /// Call sites that matched the function family but failed to parse
    pub skipped: usize,
}

/// Extract the property paths a record reads from `json_column`.
///
/// Calls against other columns (e.g. `JSONExtractString(payload, ...)` when
/// the watched column is `properties`) are ignored, not counted as skips.
pub fn extract_properties(record: &QueryRecord, json_column: &str) -> ExtractionOutcome {
    let mut properties = BTreeSet::new();
    let mut skipped = 0;

    for call in EXTRACT_CALL.find_iter(&record.query) {
        let args_start = &record.query[call.end()..];
        match parse_extraction_call(call.start(), args_start) {
            Ok((column, path)) => {
                if column == json_column {
                    properties.insert(path);
                }
            }
            Err(e) => {
                log::debug!("Skipping query log call site: {}", e);
                skipped += 1;
            }
        }
    }

    ExtractionOutcome {
        properties: properties.into_iter().collect(),
        skipped,
    }
}

/// Parse one recognized call site's argument list into (column, path).
/// `offset` is the call's byte position in the query, carried into the error
/// for log diagnostics.
pub fn parse_extraction_call(
    offset: usize,
    args: &str,
) -> Result<(String, String), ExtractError> {
    match parse_call_args(args) {
        Ok((_, (column, path))) => Ok((column.to_string(), path)),
        Err(e) => Err(ExtractError::MalformedCall {
            offset,
            reason: format!("{e:?}"),
        }),
    }
}

// one or more alphanumerics/underscores, not starting with a digit.
fn identifier_core(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))
    .parse(input)
}

// bare or backquoted identifier
fn identifier(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('`'), is_not("`"), char('`')),
        identifier_core,
    ))
    .parse(input)
}

// column reference, possibly qualified (`alias.properties`, `db.t.properties`).
// Yields the final segment, which is the column name itself.
fn column_ref(input: &str) -> IResult<&str, &str> {
    map(separated_list1(char('.'), identifier), |segments| {
        *segments
            .last()
            .expect("separated_list1 yields at least one segment")
    })
    .parse(input)
}

// single-quoted string literal with ClickHouse backslash escapes
fn quoted_path(input: &str) -> IResult<&str, String> {
    delimited(
        char('\''),
        map(
            opt(escaped_transform(
                is_not("\\'"),
                '\\',
                alt((
                    value('\'', char('\'')),
                    value('\\', char('\\')),
                    value('\n', char('n')),
                    value('\t', char('t')),
                )),
            )),
            |s| s.unwrap_or_default(),
        ),
        char('\''),
    )
    .parse(input)
}

// The argument list as it appears after the opening parenthesis:
// `<column>, '<path>' ...`. Trailing arguments (types, indices) are left
// unparsed since the path has already been captured.
fn parse_call_args(input: &str) -> IResult<&str, (&str, String)> {
    let (input, _) = multispace0.parse(input)?;
    let (input, column) = column_ref(input)?;
    let (input, _) = multispace0.parse(input)?;
    let (input, _) = char(',').parse(input)?;
    let (input, _) = multispace0.parse(input)?;
    let (input, path) = quoted_path(input)?;
    Ok((input, (column, path)))
}
