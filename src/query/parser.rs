//! Series selector parser
//!
//! Parses Prometheus-style series selectors into tag filters, plus the
//! time expressions accepted by the HTTP and CLI boundaries.
//!
//! # Supported Syntax
//!
//! ```text
//! metric_name
//! metric_name{label="value", label!="value"}
//! {__name__=~"cpu_.*", host!~"db-.*"}
//! ```
//!
//! Values are quoted with `"`, `'` or backticks; the first two accept
//! `\\`, `\"`, `\'`, `\n` and `\t` escapes, backticks are raw.
//!
//! Time expressions are RFC 3339 dates, Unix seconds (fractions allowed),
//! `now`, `now-7d` or a bare duration such as `1h30m`, meaning that long
//! ago.

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag, take_while, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map, map_res, opt, recognize, value},
    multi::{many1, separated_list0},
    sequence::{delimited, pair, terminated, tuple},
    IResult,
};

use crate::index::TagFilter;
use crate::query::error::{QueryError, QueryResult};

/// Parse a selector into the filters it stands for
pub fn parse_selector(input: &str) -> QueryResult<Vec<TagFilter>> {
    let (_, filters) = all_consuming(delimited(multispace0, selector, multispace0))(input)
        .map_err(|e| QueryError::Parse(format!("cannot parse selector {:?}: {}", input, e)))?;
    if filters.is_empty() {
        return Err(QueryError::Parse(format!(
            "selector {:?} must contain at least one label matcher",
            input
        )));
    }
    if filters.iter().all(matches_empty) {
        return Err(QueryError::InvalidFilter(format!(
            "selector {:?} would match every series; add a non-empty matcher",
            input
        )));
    }
    Ok(filters)
}

/// Parse a selector made only of `label="value"` pairs into a label set,
/// as used for rows written with a selector-like series name
pub fn parse_series(input: &str) -> QueryResult<Vec<(String, String)>> {
    let filters = parse_selector(input)?;
    filters
        .into_iter()
        .map(|f| {
            if f.is_negative || f.is_regexp {
                Err(QueryError::InvalidFilter(format!(
                    "series name {:?} may only contain label=\"value\" pairs; found {}",
                    input, f
                )))
            } else {
                Ok((f.key, f.value))
            }
        })
        .collect()
}

/// A filter that also matches series without the label
fn matches_empty(f: &TagFilter) -> bool {
    match (f.is_negative, f.is_regexp) {
        (false, false) => f.value.is_empty(),
        (true, false) => !f.value.is_empty(),
        (false, true) => matches!(f.value.as_str(), "" | ".*"),
        (true, true) => f.value == ".+",
    }
}

fn selector(input: &str) -> IResult<&str, Vec<TagFilter>> {
    let (input, name) = opt(terminated(metric_name, multispace0))(input)?;
    let (input, matchers) = match name {
        Some(_) => opt(matcher_list)(input)?,
        None => map(matcher_list, Some)(input)?,
    };
    let mut filters: Vec<TagFilter> = name.map(TagFilter::metric).into_iter().collect();
    filters.extend(matchers.unwrap_or_default());
    Ok((input, filters))
}

fn matcher_list(input: &str) -> IResult<&str, Vec<TagFilter>> {
    delimited(
        pair(char('{'), multispace0),
        terminated(
            separated_list0(delimited(multispace0, char(','), multispace0), matcher),
            pair(multispace0, opt(pair(char(','), multispace0))),
        ),
        char('}'),
    )(input)
}

fn matcher(input: &str) -> IResult<&str, TagFilter> {
    let (input, key) = label_name(input)?;
    let (input, _) = multispace0(input)?;
    let (input, op) = alt((tag("=~"), tag("!~"), tag("!="), tag("=")))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, value) = quoted_string(input)?;
    let filter = match op {
        "=~" => TagFilter::regex(key, value),
        "!~" => TagFilter::not_regex(key, value),
        "!=" => TagFilter::neq(key, value),
        _ => TagFilter::eq(key, value),
    };
    Ok((input, filter))
}

/// Metric names may also contain colons
fn metric_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_' || c == ':'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ':'),
    ))(input)
}

fn label_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    alt((
        delimited(char('"'), escaped_body("\\\""), char('"')),
        delimited(char('\''), escaped_body("\\'"), char('\'')),
        delimited(char('`'), map(take_while(|c: char| c != '`'), String::from), char('`')),
    ))(input)
}

fn escaped_body(stop: &'static str) -> impl FnMut(&str) -> IResult<&str, String> {
    move |input| {
        map(
            opt(escaped_transform(
                is_not(stop),
                '\\',
                alt((
                    value("\\", char('\\')),
                    value("\"", char('"')),
                    value("'", char('\'')),
                    value("\n", char('n')),
                    value("\t", char('t')),
                )),
            )),
            Option::unwrap_or_default,
        )(input)
    }
}

/// Parse a time expression into Unix milliseconds, relative to `now_ms`
pub fn parse_time(input: &str, now_ms: i64) -> QueryResult<i64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QueryError::InvalidTimeRange("empty time".into()));
    }
    if s.eq_ignore_ascii_case("now") {
        return Ok(now_ms);
    }
    if let Some(rest) = s.strip_prefix("now-").or_else(|| s.strip_prefix("now - ")) {
        return Ok(now_ms - parse_duration(rest)?);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(secs) = s.parse::<f64>() {
        if !secs.is_finite() {
            return Err(QueryError::InvalidTimeRange(format!("invalid time {:?}", s)));
        }
        return Ok((secs * 1000.0).round() as i64);
    }
    parse_duration(s)
        .map(|d| now_ms - d)
        .map_err(|_| QueryError::InvalidTimeRange(format!("cannot parse time {:?}", s)))
}

/// Parse a duration like `7d`, `1h30m` or `250ms` into milliseconds
pub fn parse_duration(input: &str) -> QueryResult<i64> {
    let s = input.trim();
    let (_, parts) = all_consuming(many1(duration_part))(s)
        .map_err(|_| QueryError::Parse(format!("cannot parse duration {:?}", s)))?;
    parts
        .into_iter()
        .try_fold(0i64, |acc, (n, unit)| n.checked_mul(unit).and_then(|v| acc.checked_add(v)))
        .ok_or_else(|| QueryError::Parse(format!("duration {:?} is too large", s)))
}

fn duration_part(input: &str) -> IResult<&str, (i64, i64)> {
    tuple((
        map_res(digit1, |s: &str| s.parse::<i64>()),
        alt((
            value(1i64, tag("ms")),
            value(1000i64, tag("s")),
            value(60 * 1000i64, tag("m")),
            value(60 * 60 * 1000i64, tag("h")),
            value(24 * 60 * 60 * 1000i64, tag("d")),
            value(7 * 24 * 60 * 60 * 1000i64, tag("w")),
            value(365 * 24 * 60 * 60 * 1000i64, tag("y")),
        )),
    ))(input)
}

/// Parse the `start`/`end` pair of a request; `end` defaults to now and
/// `start` to the beginning of time
pub fn parse_time_range(
    start: Option<&str>,
    end: Option<&str>,
    now_ms: i64,
) -> QueryResult<crate::storage::TimeRange> {
    let min = start.map(|s| parse_time(s, now_ms)).transpose()?.unwrap_or(0);
    let max = end.map(|s| parse_time(s, now_ms)).transpose()?.unwrap_or(now_ms);
    crate::storage::TimeRange::try_new(min, max).ok_or_else(|| {
        QueryError::InvalidTimeRange(format!("start {} is after end {}", min, max))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metric_only() {
        let filters = parse_selector("cpu_usage").unwrap();
        assert_eq!(filters, vec![TagFilter::metric("cpu_usage")]);
    }

    #[test]
    fn test_parse_all_operators() {
        let filters =
            parse_selector(r#"http_requests{job="api", code!="500", path=~"/v1/.*", host!~`db-\d+`}"#).unwrap();
        assert_eq!(
            filters,
            vec![
                TagFilter::metric("http_requests"),
                TagFilter::eq("job", "api"),
                TagFilter::neq("code", "500"),
                TagFilter::regex("path", "/v1/.*"),
                TagFilter::not_regex("host", r"db-\d+"),
            ]
        );
    }

    #[test]
    fn test_parse_braces_only_and_trailing_comma() {
        let filters = parse_selector(r#"{ __name__=~"cpu.*" , host="a", }"#).unwrap();
        assert_eq!(
            filters,
            vec![TagFilter::regex("__name__", "cpu.*"), TagFilter::eq("host", "a")]
        );
    }

    #[test]
    fn test_parse_escapes() {
        let filters = parse_selector(r#"m{path="a\"b\\c", raw=`x\y`}"#).unwrap();
        assert_eq!(filters[1].value, "a\"b\\c");
        assert_eq!(filters[2].value, "x\\y");
        let filters = parse_selector(r#"m{empty=""}"#).unwrap();
        assert_eq!(filters[1], TagFilter::eq("empty", ""));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_selector("").is_err());
        assert!(parse_selector("{}").is_err());
        assert!(parse_selector(r#"cpu{host="a""#).is_err());
        assert!(parse_selector(r#"cpu{host=a}"#).is_err());
        assert!(parse_selector(r#"cpu{host="a"} extra"#).is_err());
        assert!(matches!(
            parse_selector(r#"{host=~".*"}"#),
            Err(QueryError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_parse_series() {
        let labels = parse_series(r#"cpu{host="a",dc="eu"}"#).unwrap();
        assert_eq!(
            labels,
            vec![
                ("__name__".to_string(), "cpu".to_string()),
                ("host".to_string(), "a".to_string()),
                ("dc".to_string(), "eu".to_string()),
            ]
        );
        assert!(parse_series(r#"cpu{host=~"a"}"#).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("7d").unwrap(), 7 * 86_400_000);
        assert_eq!(parse_duration("1h30m").unwrap(), 5_400_000);
        assert_eq!(parse_duration("250ms").unwrap(), 250);
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_time() {
        let now = 1_700_000_000_000;
        assert_eq!(parse_time("now", now).unwrap(), now);
        assert_eq!(parse_time("now-1h", now).unwrap(), now - 3_600_000);
        assert_eq!(parse_time("1h", now).unwrap(), now - 3_600_000);
        assert_eq!(parse_time("1700000000", now).unwrap(), now);
        assert_eq!(parse_time("1700000000.5", now).unwrap(), now + 500);
        assert_eq!(parse_time("2023-11-14T22:13:20Z", now).unwrap(), now);
        assert!(parse_time("yesterday", now).is_err());
    }

    #[test]
    fn test_parse_time_range() {
        let now = 1_700_000_000_000;
        let tr = parse_time_range(Some("now-1d"), None, now).unwrap();
        assert_eq!(tr.min_timestamp, now - 86_400_000);
        assert_eq!(tr.max_timestamp, now);
        assert!(parse_time_range(Some("now"), Some("now-1h"), now).is_err());
    }
}
