//! Parser for `.test` scripts.
//!
//! ```text
//! load 5m
//!     http_requests{job="api"} 0+10x10
//!     latency {{schema:0 sum:5 count:4 buckets:[1 2 1]}}x3
//!
//! eval instant at 50m sum(http_requests)
//!     {} 100
//!
//! eval range from 0 to 10m step 5m http_requests
//!     http_requests{job="api"} 0 10 20
//!
//! eval_fail instant at 0 label_replace(x, "dst", "", "src", "(")
//!     expected_fail_message invalid regular expression
//! ```

use regex::Regex;

use crate::histogram::{CounterResetHint, FloatHistogram};
use crate::model::{Label, Labels};

/// One value slot of a series in a `load` block or an expectation.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValue {
    Missing,
    Stale,
    Float(f64),
    Histogram(FloatHistogram),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesDef {
    pub labels: Labels,
    pub values: Vec<SeriesValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalTime {
    Instant { at_ms: i64 },
    Range { start_ms: i64, end_ms: i64, step_ms: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// Annotations are not checked.
    Success,
    /// At least one warning.
    Warn,
    /// At least one info annotation and no warnings.
    Info,
    Fail(Option<FailMatch>),
}

#[derive(Debug, Clone)]
pub enum FailMatch {
    Message(String),
    Regexp(Regex),
}

impl PartialEq for FailMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FailMatch::Message(a), FailMatch::Message(b)) => a == b,
            (FailMatch::Regexp(a), FailMatch::Regexp(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl Eq for FailMatch {}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalCommand {
    /// 1-based line of the `eval` directive.
    pub line: usize,
    pub time: EvalTime,
    pub query: String,
    pub expectation: Expectation,
    /// Results must appear in the listed order.
    pub ordered: bool,
    pub expected: Vec<SeriesDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Load { interval_ms: i64, series: Vec<SeriesDef> },
    Clear,
    Eval(EvalCommand),
}

/// Splits a script into commands.
pub fn parse_script(input: &str) -> Result<Vec<Command>, String> {
    let lines: Vec<&str> = input.lines().collect();
    let mut commands = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            return Err(format!("line {}: indented line outside of a block: {}", i + 1, trimmed));
        }
        let directive_line = i + 1;
        let mut body = Vec::new();
        i += 1;
        while i < lines.len() && lines[i].starts_with(char::is_whitespace) && !lines[i].trim().is_empty() {
            if !lines[i].trim().starts_with('#') {
                body.push((i + 1, lines[i].trim()));
            }
            i += 1;
        }
        let command = parse_command(directive_line, trimmed, &body).map_err(|e| format!("line {directive_line}: {e}"))?;
        commands.push(command);
    }
    Ok(commands)
}

fn parse_command(line: usize, directive: &str, body: &[(usize, &str)]) -> Result<Command, String> {
    let (keyword, rest) = directive.split_once(char::is_whitespace).unwrap_or((directive, ""));
    let rest = rest.trim();
    match keyword {
        "clear" => Ok(Command::Clear),
        "load" => {
            let interval_ms = parse_duration(rest)?;
            if interval_ms <= 0 {
                return Err(format!("load interval must be positive, got {rest}"));
            }
            let series = body
                .iter()
                .map(|(n, l)| parse_series(l).map_err(|e| format!("line {n}: {e}")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Command::Load { interval_ms, series })
        }
        "eval" | "eval_ordered" | "eval_warn" | "eval_info" | "eval_fail" => {
            let (time, query) = parse_eval_time(rest)?;
            let mut expectation = match keyword {
                "eval_warn" => Expectation::Warn,
                "eval_info" => Expectation::Info,
                "eval_fail" => Expectation::Fail(None),
                _ => Expectation::Success,
            };
            let mut expected = Vec::new();
            for (n, l) in body {
                if let Some(message) = l.strip_prefix("expected_fail_message") {
                    expectation = fail_expectation(&expectation, FailMatch::Message(message.trim().to_string()))?;
                } else if let Some(pattern) = l.strip_prefix("expected_fail_regexp") {
                    let re = Regex::new(pattern.trim()).map_err(|e| format!("line {n}: {e}"))?;
                    expectation = fail_expectation(&expectation, FailMatch::Regexp(re))?;
                } else {
                    expected.push(parse_series(l).map_err(|e| format!("line {n}: {e}"))?);
                }
            }
            if matches!(expectation, Expectation::Fail(_)) && !expected.is_empty() {
                return Err("eval_fail cannot list expected results".to_string());
            }
            Ok(Command::Eval(EvalCommand {
                line,
                time,
                query: query.to_string(),
                expectation,
                ordered: keyword == "eval_ordered",
                expected,
            }))
        }
        other => Err(format!("unknown command {other:?}")),
    }
}

fn fail_expectation(current: &Expectation, matcher: FailMatch) -> Result<Expectation, String> {
    match current {
        Expectation::Fail(None) => Ok(Expectation::Fail(Some(matcher))),
        _ => Err("expected failure details are only allowed once, after eval_fail".to_string()),
    }
}

fn parse_eval_time(rest: &str) -> Result<(EvalTime, &str), String> {
    let mut words = rest.splitn(2, char::is_whitespace);
    let mode = words.next().unwrap_or("");
    let rest = words.next().unwrap_or("").trim_start();
    match mode {
        "instant" => {
            let (keyword, rest) = next_word(rest);
            if keyword != "at" {
                return Err(format!("expected 'at', got {keyword:?}"));
            }
            let (at, query) = next_word(rest);
            let at_ms = parse_duration(at)?;
            Ok((EvalTime::Instant { at_ms }, query))
        }
        "range" => {
            let mut parts = [("from", 0), ("to", 0), ("step", 0)];
            let mut rest = rest;
            for (expected, value) in &mut parts {
                let (keyword, after) = next_word(rest);
                if keyword != *expected {
                    return Err(format!("expected '{expected}', got {keyword:?}"));
                }
                let (duration, after) = next_word(after);
                *value = parse_duration(duration)?;
                rest = after;
            }
            let [(_, start_ms), (_, end_ms), (_, step_ms)] = parts;
            Ok((EvalTime::Range { start_ms, end_ms, step_ms }, rest))
        }
        other => Err(format!("expected 'instant' or 'range', got {other:?}")),
    }
}

fn next_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

/// Parses durations such as `0`, `90s`, `1h30m` into milliseconds.
pub fn parse_duration(s: &str) -> Result<i64, String> {
    if s == "0" {
        return Ok(0);
    }
    let mut total = 0i64;
    let mut rest = s;
    if rest.is_empty() {
        return Err("empty duration".to_string());
    }
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration {s:?}"));
        }
        let amount: i64 = rest[..digits].parse().map_err(|_| format!("invalid duration {s:?}"))?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit_ms = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 7 * 86_400_000,
            "y" => 365 * 86_400_000,
            other => return Err(format!("invalid unit {other:?} in duration {s:?}")),
        };
        total += amount * unit_ms;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Parses `metric{a="b"} v1 v2 ...`. Lines without a series name or
/// label set, like a bare `42`, get empty labels.
pub fn parse_series(line: &str) -> Result<SeriesDef, String> {
    let (labels, rest) = if starts_with_value(line) {
        (Labels::empty(), line)
    } else {
        parse_labels(line)?
    };
    let mut values = Vec::new();
    for token in tokenize(rest)? {
        expand_value(token, &mut values)?;
    }
    Ok(SeriesDef { labels, values })
}

fn starts_with_value(line: &str) -> bool {
    if line.starts_with("{{") {
        return true;
    }
    let first = line.split_whitespace().next().unwrap_or("");
    if first.starts_with('{') {
        return false;
    }
    let mut out = Vec::new();
    expand_value(first, &mut out).is_ok()
}

fn parse_labels(line: &str) -> Result<(Labels, &str), String> {
    let name_end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == ':'))
        .unwrap_or(line.len());
    let mut labels = Vec::new();
    if name_end > 0 {
        labels.push(Label::metric_name(&line[..name_end]));
    }
    let mut rest = &line[name_end..];
    if let Some(inner) = rest.strip_prefix('{') {
        let mut chars = inner.char_indices().peekable();
        loop {
            while chars.next_if(|(_, c)| c.is_whitespace() || *c == ',').is_some() {}
            let Some(&(start, c)) = chars.peek() else {
                return Err(format!("unterminated label set in {line:?}"));
            };
            if c == '}' {
                rest = &inner[start + 1..];
                break;
            }
            let mut name_end = start;
            while let Some((i, c)) = chars.next_if(|(_, c)| c.is_ascii_alphanumeric() || *c == '_') {
                name_end = i + c.len_utf8();
            }
            let name = &inner[start..name_end];
            while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
            if chars.next().map(|(_, c)| c) != Some('=') || name.is_empty() {
                return Err(format!("expected name=\"value\" in {line:?}"));
            }
            while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
            if chars.next().map(|(_, c)| c) != Some('"') {
                return Err(format!("expected quoted label value in {line:?}"));
            }
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some((_, '"')) => break,
                    Some((_, '\\')) => match chars.next() {
                        Some((_, 'n')) => value.push('\n'),
                        Some((_, c)) => value.push(c),
                        None => return Err(format!("unterminated label value in {line:?}")),
                    },
                    Some((_, c)) => value.push(c),
                    None => return Err(format!("unterminated label value in {line:?}")),
                }
            }
            labels.push(Label::new(name, value));
        }
    }
    if labels.is_empty() && !line.starts_with('{') {
        return Err(format!("expected a series selector in {line:?}"));
    }
    Ok((Labels::new(labels), rest))
}

/// Splits on whitespace outside of `{{...}}` and `[...]`.
fn tokenize(s: &str) -> Result<Vec<&str>, String> {
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    for (i, c) in s.char_indices() {
        match c {
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced brackets in {s:?}"))?;
            }
            _ => {}
        }
        if c.is_whitespace() && depth == 0 {
            if let Some(st) = start.take() {
                tokens.push(&s[st..i]);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if depth != 0 {
        return Err(format!("unbalanced brackets in {s:?}"));
    }
    if let Some(st) = start {
        tokens.push(&s[st..]);
    }
    Ok(tokens)
}

fn expand_value(token: &str, out: &mut Vec<SeriesValue>) -> Result<(), String> {
    match token {
        "_" => {
            out.push(SeriesValue::Missing);
            return Ok(());
        }
        "stale" => {
            out.push(SeriesValue::Stale);
            return Ok(());
        }
        _ => {}
    }
    if let Some(times) = token.strip_prefix("_x") {
        let n = parse_count(times)?;
        out.extend((0..n).map(|_| SeriesValue::Missing));
        return Ok(());
    }
    if token.starts_with("{{") {
        return expand_histograms(token, out);
    }
    let Some((head, times)) = token.rsplit_once('x') else {
        out.push(SeriesValue::Float(parse_float(token)?));
        return Ok(());
    };
    let n = parse_count(times)?;
    let (base, increment) = match split_increment(head) {
        Some(i) => (parse_float(&head[..i])?, parse_float(&head[i..])?),
        None => (parse_float(head)?, 0.0),
    };
    for k in 0..=n {
        out.push(SeriesValue::Float(base + increment * k as f64));
    }
    Ok(())
}

/// Position of the sign that starts the increment in `a+b` or `a-b`.
fn split_increment(head: &str) -> Option<usize> {
    let bytes = head.as_bytes();
    (1..bytes.len()).find(|&i| {
        (bytes[i] == b'+' || bytes[i] == b'-') && !matches!(bytes[i - 1], b'e' | b'E' | b'+' | b'-')
    })
}

fn parse_count(s: &str) -> Result<usize, String> {
    s.parse().map_err(|_| format!("invalid repetition count {s:?}"))
}

fn parse_float(s: &str) -> Result<f64, String> {
    let s = s.strip_prefix('+').unwrap_or(s);
    match s {
        "NaN" => Ok(f64::NAN),
        "Inf" | "inf" => Ok(f64::INFINITY),
        "-Inf" | "-inf" => Ok(f64::NEG_INFINITY),
        _ if s.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.') => {
            s.parse().map_err(|_| format!("invalid number {s:?}"))
        }
        _ => Err(format!("invalid number {s:?}")),
    }
}

fn expand_histograms(token: &str, out: &mut Vec<SeriesValue>) -> Result<(), String> {
    let first_end = token
        .find("}}")
        .ok_or_else(|| format!("unterminated histogram in {token:?}"))?;
    let base = parse_histogram(&token[2..first_end])?;
    let rest = &token[first_end + 2..];
    if rest.is_empty() {
        out.push(SeriesValue::Histogram(base));
        return Ok(());
    }
    let (increment, times) = if let Some(inc) = rest.strip_prefix("+{{") {
        let end = inc.find("}}").ok_or_else(|| format!("unterminated histogram in {token:?}"))?;
        (Some(parse_histogram(&inc[..end])?), &inc[end + 2..])
    } else {
        (None, rest)
    };
    let times = times
        .strip_prefix('x')
        .ok_or_else(|| format!("expected 'x' repetition in {token:?}"))?;
    let n = parse_count(times)?;
    for k in 0..=n {
        let mut h = base.clone();
        if let Some(inc) = &increment {
            let mut step = inc.clone();
            step.mul(k as f64);
            h.add(&step).map_err(|e| e.to_string())?;
            h.counter_reset_hint = base.counter_reset_hint;
        }
        out.push(SeriesValue::Histogram(h));
    }
    Ok(())
}

/// Parses the inside of `{{schema:0 sum:5 count:4 buckets:[1 2 1]}}`.
fn parse_histogram(s: &str) -> Result<FloatHistogram, String> {
    let mut h = FloatHistogram::default();
    let (mut offset, mut n_offset) = (0i32, 0i32);
    let (mut buckets, mut n_buckets) = (Vec::new(), Vec::new());
    for field in tokenize(s.trim())? {
        let (key, value) = field
            .split_once(':')
            .ok_or_else(|| format!("expected key:value in histogram, got {field:?}"))?;
        match key {
            "schema" => h.schema = value.parse().map_err(|_| format!("invalid schema {value:?}"))?,
            "sum" => h.sum = parse_float(value)?,
            "count" => h.count = parse_float(value)?,
            "z_bucket" => h.zero_count = parse_float(value)?,
            "z_bucket_w" => h.zero_threshold = parse_float(value)?,
            "offset" => offset = value.parse().map_err(|_| format!("invalid offset {value:?}"))?,
            "n_offset" => n_offset = value.parse().map_err(|_| format!("invalid offset {value:?}"))?,
            "buckets" => buckets = parse_float_list(value)?,
            "n_buckets" => n_buckets = parse_float_list(value)?,
            "custom_values" => h.custom_values = parse_float_list(value)?,
            "counter_reset_hint" => {
                h.counter_reset_hint = match value {
                    "unknown" => CounterResetHint::Unknown,
                    "reset" => CounterResetHint::CounterReset,
                    "not_reset" => CounterResetHint::NotCounterReset,
                    "gauge" => CounterResetHint::Gauge,
                    other => return Err(format!("invalid counter_reset_hint {other:?}")),
                }
            }
            other => return Err(format!("unknown histogram field {other:?}")),
        }
    }
    for (i, count) in buckets.into_iter().enumerate() {
        if count != 0.0 {
            h.positive_buckets.insert(offset + i as i32, count);
        }
    }
    for (i, count) in n_buckets.into_iter().enumerate() {
        if count != 0.0 {
            h.negative_buckets.insert(n_offset + i as i32, count);
        }
    }
    Ok(h)
}

fn parse_float_list(s: &str) -> Result<Vec<f64>, String> {
    let inner = s
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| format!("expected [...] list, got {s:?}"))?;
    inner.split_whitespace().map(parse_float).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn floats(values: &[SeriesValue]) -> Vec<Option<f64>> {
        values
            .iter()
            .map(|v| match v {
                SeriesValue::Float(f) => Some(*f),
                _ => None,
            })
            .collect()
    }

    #[rstest]
    #[case("0", 0)]
    #[case("5m", 300_000)]
    #[case("1h30m", 5_400_000)]
    #[case("250ms", 250)]
    #[case("1d", 86_400_000)]
    fn should_parse_durations(#[case] input: &str, #[case] expected: i64) {
        assert_eq!(parse_duration(input), Ok(expected));
    }

    #[rstest]
    #[case("")]
    #[case("5")]
    #[case("m")]
    #[case("5q")]
    fn should_reject_bad_durations(#[case] input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[rstest]
    #[case("1+2x3", vec![Some(1.0), Some(3.0), Some(5.0), Some(7.0)])]
    #[case("10-5x2", vec![Some(10.0), Some(5.0), Some(0.0)])]
    #[case("-1+1x1", vec![Some(-1.0), Some(0.0)])]
    #[case("7x2", vec![Some(7.0), Some(7.0), Some(7.0)])]
    #[case("1e3+1x1", vec![Some(1000.0), Some(1001.0)])]
    #[case("1 _ 3", vec![Some(1.0), None, Some(3.0)])]
    #[case("_x3 4", vec![None, None, None, Some(4.0)])]
    fn should_expand_series_notation(#[case] notation: &str, #[case] expected: Vec<Option<f64>>) {
        // when
        let series = parse_series(&format!("m {notation}")).unwrap();

        // then
        assert_eq!(floats(&series.values), expected);
    }

    #[test]
    fn should_parse_labels_and_stale_markers() {
        let series = parse_series(r#"http_requests{job="api", path="/a\"b"} 1 stale"#).unwrap();

        assert_eq!(
            series.labels,
            Labels::from_pairs(&[("__name__", "http_requests"), ("job", "api"), ("path", "/a\"b")])
        );
        assert_eq!(series.values, vec![SeriesValue::Float(1.0), SeriesValue::Stale]);
    }

    #[test]
    fn should_treat_bare_values_as_unlabelled() {
        let series = parse_series("NaN").unwrap();

        assert!(series.labels.is_empty());
        assert!(matches!(series.values[0], SeriesValue::Float(f) if f.is_nan()));
    }

    #[test]
    fn should_parse_empty_label_set() {
        let series = parse_series("{} 3").unwrap();

        assert!(series.labels.is_empty());
        assert_eq!(series.values, vec![SeriesValue::Float(3.0)]);
    }

    #[test]
    fn should_expand_histogram_increments() {
        // when
        let series =
            parse_series("h {{schema:0 sum:1 count:1 buckets:[1]}}+{{sum:2 count:2 buckets:[2]}}x2").unwrap();

        // then
        let counts: Vec<(f64, f64, Option<f64>)> = series
            .values
            .iter()
            .map(|v| match v {
                SeriesValue::Histogram(h) => (h.count, h.sum, h.positive_buckets.get(&0).copied()),
                other => panic!("expected histogram, got {other:?}"),
            })
            .collect();
        assert_eq!(counts, vec![(1.0, 1.0, Some(1.0)), (3.0, 3.0, Some(3.0)), (5.0, 5.0, Some(5.0))]);
    }

    #[test]
    fn should_parse_custom_bucket_histogram() {
        let series = parse_series("h {{schema:-53 count:3 sum:4 custom_values:[1 5] buckets:[1 0 2]}}").unwrap();

        let SeriesValue::Histogram(h) = &series.values[0] else {
            panic!("expected histogram");
        };
        assert!(h.uses_custom_buckets());
        assert_eq!(h.custom_values, vec![1.0, 5.0]);
        assert_eq!(h.positive_buckets.len(), 2);
        assert_eq!(h.positive_buckets.get(&2), Some(&2.0));
    }

    #[test]
    fn should_parse_script_commands() {
        // given
        let script = r#"
# comment
load 1m
    up{job="a"} 1 2

eval instant at 1m up
    up{job="a"} 2

eval range from 0 to 1m step 30s up
    up{job="a"} 1 1 2

eval_fail instant at 0 foo(
    expected_fail_message unexpected

clear
"#;

        // when
        let commands = parse_script(script).unwrap();

        // then
        assert_eq!(commands.len(), 5);
        assert!(matches!(&commands[0], Command::Load { interval_ms: 60_000, series } if series.len() == 1));
        let Command::Eval(instant) = &commands[1] else {
            panic!("expected eval");
        };
        assert_eq!(instant.time, EvalTime::Instant { at_ms: 60_000 });
        assert_eq!(instant.query, "up");
        assert_eq!(instant.line, 6);
        let Command::Eval(range) = &commands[2] else {
            panic!("expected eval");
        };
        assert_eq!(
            range.time,
            EvalTime::Range {
                start_ms: 0,
                end_ms: 60_000,
                step_ms: 30_000
            }
        );
        let Command::Eval(fail) = &commands[3] else {
            panic!("expected eval");
        };
        assert_eq!(
            fail.expectation,
            Expectation::Fail(Some(FailMatch::Message("unexpected".to_string())))
        );
        assert_eq!(commands[4], Command::Clear);
    }

    #[test]
    fn should_reject_unknown_command() {
        let result = parse_script("evaluate instant at 0 up\n");

        assert!(result.unwrap_err().contains("unknown command"));
    }
}
