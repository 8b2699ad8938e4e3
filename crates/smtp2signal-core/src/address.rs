//! Recipient address option decoding
//!
//! The local part of the RCPT TO address is read as a URL query string:
//!
//! ```text
//! to=%2B15551234567&from=%2B15559876543&lines=0/2-end@gateway.local
//! ```
//!
//! Before decoding, every literal `+` is escaped to `%2B` so phone numbers
//! survive, and every literal `--` becomes `=` so the key/value separator can
//! be typed in mail clients that refuse `=` in addresses.

use smtp2signal_common::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

const DEFAULT_BODY_SEPARATOR: &str = "\n\n";

/// Selects lines of the message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSelector {
    /// The whole body, verbatim
    All,
    /// A single line (0-indexed)
    Line(usize),
    /// Lines `start` through `end`, inclusive
    Range { start: usize, end: usize },
    /// Line `start` through the last line
    Tail(usize),
}

impl LineSelector {
    /// Apply the selector to `body`; selected lines keep their terminators
    pub fn select(&self, body: &str) -> String {
        let (start, stop) = match *self {
            LineSelector::All => return body.to_string(),
            LineSelector::Line(n) => (n, Some(n.saturating_add(1))),
            LineSelector::Range { start, end } => (start, Some(end.saturating_add(1))),
            LineSelector::Tail(start) => (start, None),
        };

        let lines = split_lines(body);
        let stop = stop.map_or(lines.len(), |s| s.min(lines.len()));
        if start >= stop {
            return String::new();
        }
        lines[start..stop].concat()
    }
}

impl FromStr for LineSelector {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(LineSelector::All);
        }

        let parse_index = |v: &str| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid line selector: {:?}", s))
        };

        match s.split_once('-') {
            None => Ok(LineSelector::Line(parse_index(s)?)),
            Some((start, end)) if end.trim().eq_ignore_ascii_case("end") => {
                Ok(LineSelector::Tail(parse_index(start)?))
            }
            Some((start, end)) => Ok(LineSelector::Range {
                start: parse_index(start)?,
                end: parse_index(end)?,
            }),
        }
    }
}

impl fmt::Display for LineSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineSelector::All => write!(f, "all"),
            LineSelector::Line(n) => write!(f, "{}", n),
            LineSelector::Range { start, end } => write!(f, "{}-{}", start, end),
            LineSelector::Tail(start) => write!(f, "{}-end", start),
        }
    }
}

/// Split `body` into lines, each keeping its terminator
///
/// Besides `\n` and `\r\n`, a lone `\r`, vertical tab, form feed, the
/// file/group/record separators and the Unicode line separators end a line.
fn split_lines(body: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut chars = body.char_indices().peekable();

    while let Some((pos, ch)) = chars.next() {
        let end = match ch {
            '\r' => match chars.peek() {
                Some(&(next, '\n')) => {
                    chars.next();
                    next + 1
                }
                _ => pos + 1,
            },
            '\n' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}'
            | '\u{2029}' => pos + ch.len_utf8(),
            _ => continue,
        };
        lines.push(&body[start..end]);
        start = end;
    }

    if start < body.len() {
        lines.push(&body[start..]);
    }
    lines
}

/// Options encoded in a recipient address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressOptions {
    /// Signal recipients, in order
    pub to: Vec<String>,
    /// Sender candidates; the last one is used
    pub from: Vec<String>,
    pub omit_subject: bool,
    pub omit_body: bool,
    /// Body line selectors, flattened across repeated `lines` keys
    pub lines: Vec<LineSelector>,
    pub body_separator: String,
}

impl AddressOptions {
    /// Decode the options of the first recipient
    pub fn from_recipients(recipients: &[String]) -> Result<Self> {
        let first = recipients
            .first()
            .ok_or_else(|| Error::Address("no recipient given".to_string()))?;
        Self::parse(first)
    }

    /// Decode the options carried by a single recipient address
    pub fn parse(recipient: &str) -> Result<Self> {
        let address = recipient.trim_matches(|c| matches!(c, '<' | '>' | ' '));
        let local_part = match address.split_once('@') {
            Some((local, _domain)) => local,
            None => address,
        };

        let mut values = decode_query(local_part);

        let to = values
            .remove("to")
            .ok_or_else(|| Error::Address(format!("rcpt is missing to-argument: {}", recipient)))?;
        let from = values.remove("from").ok_or_else(|| {
            Error::Address(format!("rcpt is missing from-argument: {}", recipient))
        })?;

        let lines = match values.remove("lines") {
            Some(raw) => raw
                .join("/")
                .split('/')
                .map(LineSelector::from_str)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Address(format!("{} in rcpt {}", e, recipient)))?,
            None => vec![LineSelector::All],
        };

        let options = Self {
            to,
            from,
            omit_subject: flag(values.get("omit_subject")),
            omit_body: flag(values.get("omit_body")),
            lines,
            body_separator: values
                .remove("body_separator")
                .and_then(|mut v| v.pop())
                .unwrap_or_else(|| DEFAULT_BODY_SEPARATOR.to_string()),
        };

        debug!("building signal with options {:?}", options);
        Ok(options)
    }

    /// Sender number: the last `from` given
    pub fn from_number(&self) -> &str {
        self.from.last().map_or("", String::as_str)
    }
}

/// Query-string decode with `+` kept literal and `--` read as `=`
fn decode_query(local_part: &str) -> HashMap<String, Vec<String>> {
    let escaped = local_part.replace('+', "%2B").replace("--", "=");

    let mut values: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(escaped.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        values
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    values
}

fn flag(values: Option<&Vec<String>>) -> bool {
    values
        .and_then(|v| v.last())
        .map(|v| matches!(v.to_lowercase().as_str(), "yes" | "true" | "t" | "1"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BODY: &str = "l0\nl1\nl2\nl3\nl4\nl5\nl6\nl7\nl8\n";

    #[test]
    fn test_plus_is_kept_literal() {
        let options = AddressOptions::parse("<to=+15551234567&from=+15559876543@x.org>").unwrap();
        assert_eq!(options.to, vec!["+15551234567"]);
        assert_eq!(options.from_number(), "+15559876543");
    }

    #[test]
    fn test_percent_encoded_plus() {
        let options =
            AddressOptions::parse("to=%2B15551234567&from=%2B15559876543&omit_subject=true@x")
                .unwrap();
        assert_eq!(options.to, vec!["+15551234567"]);
        assert_eq!(options.from, vec!["+15559876543"]);
        assert!(options.omit_subject);
        assert!(!options.omit_body);
    }

    #[test]
    fn test_double_dash_is_equals() {
        let dashed = AddressOptions::parse("to--+4912&from--+4934&lines--1-end@gw").unwrap();
        let equals = AddressOptions::parse("to=+4912&from=+4934&lines=1-end@gw").unwrap();
        assert_eq!(dashed, equals);
        assert_eq!(dashed.lines, vec![LineSelector::Tail(1)]);
    }

    #[test]
    fn test_escaped_dashes_are_not_separators() {
        let options = AddressOptions::parse("to=a%2D%2Db&from=c@gw").unwrap();
        assert_eq!(options.to, vec!["a--b"]);
    }

    #[test]
    fn test_routing_brackets_and_spaces_stripped() {
        let options = AddressOptions::parse("  <to=1&from=2@gw.example>  ").unwrap();
        assert_eq!(options.to, vec!["1"]);
        assert_eq!(options.from, vec!["2"]);
    }

    #[test]
    fn test_from_is_last_wins_and_to_keeps_all() {
        let options = AddressOptions::parse("to=a&from=x&to=b&from=y&to=c@gw").unwrap();
        assert_eq!(options.to, vec!["a", "b", "c"]);
        assert_eq!(options.from_number(), "y");
    }

    #[test]
    fn test_defaults() {
        let options = AddressOptions::parse("to=a&from=b@gw").unwrap();
        assert!(!options.omit_subject);
        assert!(!options.omit_body);
        assert_eq!(options.lines, vec![LineSelector::All]);
        assert_eq!(options.body_separator, "\n\n");
    }

    #[test]
    fn test_flags_use_last_value() {
        let options =
            AddressOptions::parse("to=a&from=b&omit_body=yes&omit_subject=1&omit_subject=no@gw")
                .unwrap();
        assert!(options.omit_body);
        assert!(!options.omit_subject);

        let options = AddressOptions::parse("to=a&from=b&omit_body=T@gw").unwrap();
        assert!(options.omit_body);
    }

    #[test]
    fn test_body_separator() {
        let options =
            AddressOptions::parse("to=a&from=b&body_separator=%0A%2D%2D%2D%0A@gw").unwrap();
        assert_eq!(options.body_separator, "\n---\n");
    }

    #[test]
    fn test_literal_dashes_in_separator_become_equals() {
        let options = AddressOptions::parse("to=a&from=b&body_separator=%0A---%0A@gw").unwrap();
        assert_eq!(options.body_separator, "\n=-\n");
    }

    #[test]
    fn test_lines_flattened_across_occurrences() {
        let options = AddressOptions::parse("to=a&from=b&lines=3/5-7&lines=ALL@gw").unwrap();
        assert_eq!(
            options.lines,
            vec![
                LineSelector::Line(3),
                LineSelector::Range { start: 5, end: 7 },
                LineSelector::All
            ]
        );
    }

    #[test]
    fn test_missing_to_is_error() {
        let err = AddressOptions::parse("<from=+1555@gw>").unwrap_err();
        assert!(matches!(err, Error::Address(_)));
        let message = err.to_string();
        assert!(message.contains("to-argument"));
        assert!(message.contains("<from=+1555@gw>"));
    }

    #[test]
    fn test_missing_from_is_error() {
        let err = AddressOptions::parse("to=+1555@gw").unwrap_err();
        assert!(err.to_string().contains("from-argument"));
    }

    #[test]
    fn test_blank_values_are_dropped() {
        let err = AddressOptions::parse("to=&from=x@gw").unwrap_err();
        assert!(err.to_string().contains("to-argument"));

        let options = AddressOptions::parse("to=a&from=b&lines=@gw").unwrap();
        assert_eq!(options.lines, vec![LineSelector::All]);
    }

    #[test]
    fn test_invalid_selector_is_error() {
        let err = AddressOptions::parse("to=a&from=b&lines=3-x@gw").unwrap_err();
        assert!(matches!(err, Error::Address(_)));
        assert!(AddressOptions::parse("to=a&from=b&lines=-3@gw").is_err());
        assert!(AddressOptions::parse("to=a&from=b&lines=3-@gw").is_err());
    }

    #[test]
    fn test_no_recipients() {
        let err = AddressOptions::from_recipients(&[]).unwrap_err();
        assert!(matches!(err, Error::Address(_)));
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!("all".parse::<LineSelector>().unwrap(), LineSelector::All);
        assert_eq!("All".parse::<LineSelector>().unwrap(), LineSelector::All);
        assert_eq!("4".parse::<LineSelector>().unwrap(), LineSelector::Line(4));
        assert_eq!(
            "2-6".parse::<LineSelector>().unwrap(),
            LineSelector::Range { start: 2, end: 6 }
        );
        assert_eq!("2-END".parse::<LineSelector>().unwrap(), LineSelector::Tail(2));
        assert!("x".parse::<LineSelector>().is_err());
    }

    #[test]
    fn test_select_all() {
        assert_eq!(LineSelector::All.select(BODY), BODY);
        assert_eq!(LineSelector::All.select("no newline"), "no newline");
    }

    #[test]
    fn test_select_single_line() {
        assert_eq!(LineSelector::Line(0).select(BODY), "l0\n");
        assert_eq!(LineSelector::Line(3).select(BODY), "l3\n");
    }

    #[test]
    fn test_select_range_inclusive() {
        assert_eq!(
            LineSelector::Range { start: 5, end: 7 }.select(BODY),
            "l5\nl6\nl7\n"
        );
        assert_eq!(LineSelector::Range { start: 4, end: 2 }.select(BODY), "");
    }

    #[test]
    fn test_select_tail() {
        assert_eq!(LineSelector::Tail(7).select(BODY), "l7\nl8\n");
        assert_eq!(LineSelector::Tail(0).select("a\nb"), "a\nb");
    }

    #[test]
    fn test_select_out_of_range() {
        assert_eq!(LineSelector::Line(42).select(BODY), "");
        assert_eq!(LineSelector::Tail(42).select(BODY), "");
        assert_eq!(
            LineSelector::Range { start: 7, end: 100 }.select(BODY),
            "l7\nl8\n"
        );
    }

    #[test]
    fn test_select_splits_on_all_line_boundaries() {
        assert_eq!(LineSelector::Line(1).select("l0\rl1\rl2"), "l1\r");
        assert_eq!(LineSelector::Line(1).select("l0\r\nl1\r\nl2"), "l1\r\n");
        assert_eq!(LineSelector::Tail(1).select("a\x0cb\x0bc"), "b\x0bc");
        assert_eq!(
            LineSelector::Range { start: 1, end: 2 }.select("a\u{2028}b\u{85}c\nd"),
            "b\u{85}c\n"
        );
    }

    #[test]
    fn test_split_lines_keeps_terminators() {
        assert_eq!(split_lines("a\nb\r\nc\rd"), vec!["a\n", "b\r\n", "c\r", "d"]);
        assert_eq!(split_lines("a\n"), vec!["a\n"]);
        assert!(split_lines("").is_empty());
    }

    #[test]
    fn test_selector_display() {
        assert_eq!(LineSelector::Range { start: 5, end: 7 }.to_string(), "5-7");
        assert_eq!(LineSelector::Tail(2).to_string(), "2-end");
    }
}
