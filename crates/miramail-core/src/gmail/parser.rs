use std::collections::BTreeMap;

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Local};

use crate::gmail::attachment::AttachmentPolicy;
use crate::gmail::types::{Message, MessagePart};

/// Gmail bodies are base64url; some producers pad them, most do not.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Maximum depth for MIME tree traversal to prevent stack overflow from malicious emails
const MAX_MIME_DEPTH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Recipient {
    pub email: String,
    pub name: Option<String>,
}

/// An attachment found while walking the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    pub attachment_id: String,
    pub filename: String,
    pub filetype: String,
    /// Present when Gmail inlined the bytes in the part body.
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub date: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub snippet: String,
    pub plain: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentPart>,
}

pub fn parse_message(message: &Message, policy: AttachmentPolicy) -> ParsedMessage {
    let mut parsed = ParsedMessage {
        snippet: message
            .snippet
            .as_deref()
            .map(unescape_html)
            .unwrap_or_default(),
        ..ParsedMessage::default()
    };

    let Some(payload) = message.payload.as_ref() else {
        return parsed;
    };

    for header in &payload.headers {
        let value = header.value.clone();
        match header.name.to_ascii_lowercase().as_str() {
            "date" => parsed.date = normalize_date(&value),
            "from" => parsed.sender = value.clone(),
            "to" => parsed.recipient = value.clone(),
            "subject" => parsed.subject = value.clone(),
            "cc" => parsed.cc = split_addresses(&value),
            "bcc" => parsed.bcc = split_addresses(&value),
            _ => {}
        }
        parsed.headers.insert(header.name.clone(), value);
    }

    let mut plain_parts = Vec::new();
    let mut html_parts = Vec::new();
    walk_parts(
        payload,
        policy,
        &mut plain_parts,
        &mut html_parts,
        &mut parsed.attachments,
        0,
    );

    parsed.plain = (!plain_parts.is_empty()).then(|| plain_parts.join("\n"));
    parsed.html = (!html_parts.is_empty()).then(|| html_parts.join("<br/>"));
    parsed
}

/// RFC 2822 dates are rendered in local time; anything unparsable is kept as-is.
fn normalize_date(value: &str) -> String {
    let trimmed = strip_trailing_comment(value.trim());
    match DateTime::parse_from_rfc2822(trimmed) {
        Ok(date) => date
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S%:z")
            .to_string(),
        Err(_) => value.to_string(),
    }
}

// "Tue, 1 Jul 2003 10:52:37 +0200 (CEST)"
fn strip_trailing_comment(value: &str) -> &str {
    match (value.rfind('('), value.ends_with(')')) {
        (Some(start), true) => value[..start].trim_end(),
        _ => value,
    }
}

fn walk_parts(
    part: &MessagePart,
    policy: AttachmentPolicy,
    plain: &mut Vec<String>,
    html: &mut Vec<String>,
    attachments: &mut Vec<AttachmentPart>,
    depth: usize,
) {
    if depth > MAX_MIME_DEPTH {
        return;
    }

    let mime = part.mime_type.as_deref().unwrap_or_default();
    let body = part.body.as_ref();

    if let Some(attachment_id) = body.and_then(|b| b.attachment_id.as_deref()) {
        if policy != AttachmentPolicy::Ignore {
            attachments.push(AttachmentPart {
                attachment_id: attachment_id.to_string(),
                filename: part.filename.clone().unwrap_or_default(),
                filetype: mime.to_string(),
                data: body.and_then(|b| b.data.as_deref()).and_then(decode_base64url),
            });
        }
        return;
    }

    if mime.to_ascii_lowercase().starts_with("multipart/") {
        for child in &part.parts {
            walk_parts(child, policy, plain, html, attachments, depth + 1);
        }
        return;
    }

    if let Some(text) = body
        .and_then(|b| b.data.as_deref())
        .and_then(decode_base64url)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    {
        if mime.eq_ignore_ascii_case("text/plain") {
            plain.push(text);
        } else if mime.eq_ignore_ascii_case("text/html") {
            html.push(text);
        }
    }

    // Some producers nest parts under non-multipart containers such as message/rfc822.
    for child in &part.parts {
        walk_parts(child, policy, plain, html, attachments, depth + 1);
    }
}

pub(crate) fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    URL_SAFE_LENIENT
        .decode(data)
        .or_else(|_| STANDARD.decode(data))
        .ok()
}

pub fn parse_recipient(input: &str) -> Option<Recipient> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Some((start, end)) = angle_brackets(input) {
        let email = input[start + 1..end].trim();
        if email.is_empty() {
            return None;
        }
        let name_raw = input[..start].trim();
        let name = (!name_raw.is_empty()).then(|| strip_quotes(name_raw));
        return Some(Recipient {
            email: email.to_string(),
            name,
        });
    }

    let trimmed = input.trim_matches(['<', '>']).trim();
    (!trimmed.is_empty()).then(|| Recipient {
        email: trimmed.to_string(),
        name: None,
    })
}

/// The `<` ... `>` span of an address, if both brackets are present and ordered.
fn angle_brackets(input: &str) -> Option<(usize, usize)> {
    let start = input.rfind('<')?;
    let end = start + input[start..].find('>')?;
    Some((start, end))
}

pub fn parse_recipient_list(value: &str) -> Vec<Recipient> {
    split_addresses(value)
        .iter()
        .filter_map(|s| parse_recipient(s))
        .collect()
}

fn strip_quotes(input: &str) -> String {
    let stripped = input
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(input);
    stripped.replace("\\\"", "\"")
}

/// Splits an address header on commas that are not inside a quoted display name.
pub fn split_addresses(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut prev_char: Option<char> = None;

    for ch in input.chars() {
        match ch {
            '"' => {
                if prev_char != Some('\\') {
                    in_quotes = !in_quotes;
                }
                current.push(ch);
            }
            ',' if !in_quotes => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
        prev_char = Some(ch);
    }

    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }

    parts
}

/// Snippets come back HTML-escaped.
pub fn unescape_html(input: &str) -> String {
    html_escape::decode_html_entities(input).into_owned()
}
