//! Turns a received email into a Signal message
//!
//! Body content is negotiated in order: a `text/plain` body part, then a
//! `text/html` body part converted to plain text, then the top-level content
//! when it is a single leaf. Only the first attachment is forwarded.

use crate::address::AddressOptions;
use mail_parser::decoders::html::html_to_text;
use mail_parser::{Message, MessageParser, MessagePartId, PartType};
use smtp2signal_common::types::SignalRequest;
use smtp2signal_common::{Error, Result};

/// Content extracted from a raw email
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMail {
    /// Decoded subject, empty when the header is absent
    pub subject: String,
    /// First `text/plain` body part
    pub text_body: Option<String>,
    /// First `text/html` body part, as HTML
    pub html_body: Option<String>,
    /// Top-level content when the message is a single text leaf
    pub top_level: Option<String>,
    /// First attachment in document order
    pub attachment: Option<Vec<u8>>,
}

impl ParsedMail {
    /// Parse raw RFC 5322 bytes
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| Error::Content("failed to parse message".to_string()))?;

        Ok(Self {
            subject: message.subject().unwrap_or_default().to_string(),
            text_body: first_body(&message, &message.text_body, |body| match body {
                PartType::Text(text) => Some(text.to_string()),
                _ => None,
            }),
            html_body: first_body(&message, &message.html_body, |body| match body {
                PartType::Html(html) => Some(html.to_string()),
                _ => None,
            }),
            top_level: message.parts.first().and_then(|part| match &part.body {
                PartType::Text(text) | PartType::Html(text) => Some(text.to_string()),
                PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
                    std::str::from_utf8(bytes).ok().map(str::to_string)
                }
                _ => None,
            }),
            attachment: message
                .attachments
                .first()
                .and_then(|id| message.parts.get(*id as usize))
                .map(|part| part.contents().to_vec()),
        })
    }

    /// Plain text of the body, by content negotiation
    pub fn body_text(&self) -> Result<String> {
        let text = if let Some(text) = &self.text_body {
            text.clone()
        } else if let Some(html) = &self.html_body {
            html_body_to_text(html)
        } else if let Some(text) = &self.top_level {
            text.clone()
        } else {
            return Err(Error::Content("no usable body content found".to_string()));
        };

        Ok(text.replace("\r\n", "\n"))
    }
}

/// Closing tags that end a line of text
const BLOCK_TAGS: &[&str] = &[
    "tr", "table", "div", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote",
    "pre",
];

/// Closing tags that end a table cell
const CELL_TAGS: &[&str] = &["td", "th"];

/// Convert an HTML body to plain text, one line per block or table row
///
/// Lines are trimmed and runs of blank lines are collapsed to one.
fn html_body_to_text(html: &str) -> String {
    let text = html_to_text(&mark_block_ends(html));

    let mut out = String::with_capacity(text.len());
    let mut after_blank = false;
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if after_blank {
                continue;
            }
            after_blank = true;
        } else {
            after_blank = false;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Follow block closing tags with `<br>` and cell closing tags with a space
fn mark_block_ends(html: &str) -> String {
    let mut out = String::with_capacity(html.len() + html.len() / 8);
    let mut rest = html;

    while let Some(start) = rest.find("</") {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let end = start + len + 1;
        let name = rest[start + 2..end - 1].trim();
        out.push_str(&rest[..end]);

        if BLOCK_TAGS.iter().any(|tag| tag.eq_ignore_ascii_case(name)) {
            out.push_str("<br>");
        } else if CELL_TAGS.iter().any(|tag| tag.eq_ignore_ascii_case(name)) {
            out.push(' ');
        }
        rest = &rest[end..];
    }

    out.push_str(rest);
    out
}

fn first_body<F>(message: &Message<'_>, ids: &[MessagePartId], extract: F) -> Option<String>
where
    F: Fn(&PartType<'_>) -> Option<String>,
{
    ids.iter()
        .filter_map(|id| message.parts.get(*id as usize))
        .find_map(|part| extract(&part.body))
}

/// Builds [`SignalRequest`]s from received mail
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageBuilder;

impl MessageBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the outbound request for a raw message sent to `recipients`
    pub fn build(&self, recipients: &[String], raw: &[u8]) -> Result<SignalRequest> {
        let mail = ParsedMail::parse(raw)?;
        let options = AddressOptions::from_recipients(recipients)?;
        self.compose(&options, mail)
    }

    /// Assemble the request text from parsed mail and address options
    pub fn compose(&self, options: &AddressOptions, mail: ParsedMail) -> Result<SignalRequest> {
        let mut text = String::new();

        if !options.omit_subject {
            text.push_str(&mail.subject);
        }

        if !options.omit_body {
            if !options.omit_subject {
                text.push_str(&options.body_separator);
            }

            let body = mail.body_text()?;
            for selector in &options.lines {
                text.push_str(&selector.select(&body));
                text.push('\n');
            }
        }

        Ok(SignalRequest {
            from_number: options.from_number().to_string(),
            to: options.to.clone(),
            text: text.trim().to_string(),
            binary_attachment: mail.attachment,
        })
    }
}
