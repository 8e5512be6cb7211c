//! RFC 4515 string filters and their RFC 4511 BER representation.

use std::fmt;

use anyhow::{bail, Context, Result};

use crate::ldap_protocol::{BerReader, BerWriter};

const TAG_AND: u8 = 0xA0;
const TAG_OR: u8 = 0xA1;
const TAG_NOT: u8 = 0xA2;
const TAG_EQUALITY: u8 = 0xA3;
const TAG_SUBSTRINGS: u8 = 0xA4;
const TAG_GREATER_OR_EQUAL: u8 = 0xA5;
const TAG_LESS_OR_EQUAL: u8 = 0xA6;
const TAG_PRESENT: u8 = 0x87;
const TAG_APPROX: u8 = 0xA8;
const TAG_EXTENSIBLE: u8 = 0xA9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_value: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
    Extensible {
        matching_rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    /// Parse a string filter. A bare item without parentheses (`uid=jdoe`) is accepted.
    pub fn parse(input: &str) -> Result<Filter> {
        let trimmed = input.trim();
        let wrapped;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            &wrapped
        };
        let bytes = text.as_bytes();
        let (filter, used) = parse_filter(bytes, 0, 0)?;
        if used != bytes.len() {
            bail!("Trailing characters in filter at offset {}: {}", used, input);
        }
        Ok(filter)
    }

    pub fn encode(&self, writer: &mut BerWriter) {
        match self {
            Filter::And(list) | Filter::Or(list) => {
                let tag = if matches!(self, Filter::And(_)) { TAG_AND } else { TAG_OR };
                let pos = writer.start_constructed(tag);
                for filter in list {
                    filter.encode(writer);
                }
                writer.end_constructed(pos);
            }
            Filter::Not(inner) => {
                let pos = writer.start_constructed(TAG_NOT);
                inner.encode(writer);
                writer.end_constructed(pos);
            }
            Filter::Equality(attr, value) => encode_assertion(writer, TAG_EQUALITY, attr, value),
            Filter::GreaterOrEqual(attr, value) => encode_assertion(writer, TAG_GREATER_OR_EQUAL, attr, value),
            Filter::LessOrEqual(attr, value) => encode_assertion(writer, TAG_LESS_OR_EQUAL, attr, value),
            Filter::Approx(attr, value) => encode_assertion(writer, TAG_APPROX, attr, value),
            Filter::Present(attr) => writer.write_tagged_octets(TAG_PRESENT, attr.as_bytes()),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_value,
            } => {
                let pos = writer.start_constructed(TAG_SUBSTRINGS);
                writer.write_string(attr);
                let seq = writer.start_sequence();
                if let Some(initial) = initial {
                    writer.write_tagged_octets(0x80, initial);
                }
                for part in any {
                    writer.write_tagged_octets(0x81, part);
                }
                if let Some(final_value) = final_value {
                    writer.write_tagged_octets(0x82, final_value);
                }
                writer.end_sequence(seq);
                writer.end_constructed(pos);
            }
            Filter::Extensible {
                matching_rule,
                attr,
                value,
                dn_attributes,
            } => {
                let pos = writer.start_constructed(TAG_EXTENSIBLE);
                if let Some(rule) = matching_rule {
                    writer.write_tagged_octets(0x81, rule.as_bytes());
                }
                if let Some(attr) = attr {
                    writer.write_tagged_octets(0x82, attr.as_bytes());
                }
                writer.write_tagged_octets(0x83, value);
                if *dn_attributes {
                    writer.write_tagged_octets(0x84, &[0xFF]);
                }
                writer.end_constructed(pos);
            }
        }
    }

    pub(crate) fn decode(reader: &mut BerReader) -> Result<Filter> {
        let (tag, content) = reader.read_tlv()?;
        let mut body = BerReader::new(content);
        let filter = match tag {
            TAG_AND => Filter::And(decode_list(&mut body)?),
            TAG_OR => Filter::Or(decode_list(&mut body)?),
            TAG_NOT => Filter::Not(Box::new(Filter::decode(&mut body)?)),
            TAG_EQUALITY => {
                let (attr, value) = decode_assertion(&mut body)?;
                Filter::Equality(attr, value)
            }
            TAG_GREATER_OR_EQUAL => {
                let (attr, value) = decode_assertion(&mut body)?;
                Filter::GreaterOrEqual(attr, value)
            }
            TAG_LESS_OR_EQUAL => {
                let (attr, value) = decode_assertion(&mut body)?;
                Filter::LessOrEqual(attr, value)
            }
            TAG_APPROX => {
                let (attr, value) = decode_assertion(&mut body)?;
                Filter::Approx(attr, value)
            }
            TAG_PRESENT => Filter::Present(String::from_utf8_lossy(content).into_owned()),
            TAG_SUBSTRINGS => {
                let attr = body.read_string()?;
                let mut parts = body.read_sequence()?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_value = None;
                while !parts.is_empty() {
                    let (part_tag, part) = parts.read_tlv()?;
                    match part_tag {
                        0x80 => initial = Some(part.to_vec()),
                        0x81 => any.push(part.to_vec()),
                        0x82 => final_value = Some(part.to_vec()),
                        _ => bail!("Invalid substring choice: 0x{:02X}", part_tag),
                    }
                }
                Filter::Substrings {
                    attr,
                    initial,
                    any,
                    final_value,
                }
            }
            TAG_EXTENSIBLE => {
                let mut matching_rule = None;
                let mut attr = None;
                let mut value = Vec::new();
                let mut dn_attributes = false;
                while !body.is_empty() {
                    let (field_tag, field) = body.read_tlv()?;
                    match field_tag {
                        0x81 => matching_rule = Some(String::from_utf8_lossy(field).into_owned()),
                        0x82 => attr = Some(String::from_utf8_lossy(field).into_owned()),
                        0x83 => value = field.to_vec(),
                        0x84 => dn_attributes = field.first().is_some_and(|b| *b != 0),
                        _ => bail!("Invalid extensible match field: 0x{:02X}", field_tag),
                    }
                }
                Filter::Extensible {
                    matching_rule,
                    attr,
                    value,
                    dn_attributes,
                }
            }
            _ => bail!("Unsupported filter tag: 0x{:02X}", tag),
        };
        Ok(filter)
    }
}

fn encode_assertion(writer: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    let pos = writer.start_constructed(tag);
    writer.write_string(attr);
    writer.write_octet_string(value);
    writer.end_constructed(pos);
}

fn decode_assertion(reader: &mut BerReader) -> Result<(String, Vec<u8>)> {
    let attr = reader.read_string()?;
    let value = reader.read_octet_string()?;
    Ok((attr, value))
}

fn decode_list(reader: &mut BerReader) -> Result<Vec<Filter>> {
    let mut list = Vec::new();
    while !reader.is_empty() {
        list.push(Filter::decode(reader)?);
    }
    Ok(list)
}

/// Bounds recursion on caller-supplied filters.
const MAX_NESTING: usize = 64;

fn parse_filter(s: &[u8], pos: usize, depth: usize) -> Result<(Filter, usize)> {
    if s.get(pos) != Some(&b'(') {
        bail!("Expected '(' at offset {}", pos);
    }
    if depth >= MAX_NESTING {
        bail!("Filter nested deeper than {} levels", MAX_NESTING);
    }
    let mut i = pos + 1;
    let filter = match s.get(i) {
        Some(b'&') => {
            let (list, next) = parse_list(s, i + 1, depth + 1)?;
            i = next;
            Filter::And(list)
        }
        Some(b'|') => {
            let (list, next) = parse_list(s, i + 1, depth + 1)?;
            i = next;
            Filter::Or(list)
        }
        Some(b'!') => {
            let (inner, next) = parse_filter(s, i + 1, depth + 1)?;
            i = next;
            Filter::Not(Box::new(inner))
        }
        Some(_) => {
            // Values cannot hold a bare ')' (it must be escaped as \29).
            let end = s[i..]
                .iter()
                .position(|&b| b == b')')
                .map(|off| i + off)
                .context("Unterminated filter item")?;
            let item = parse_item(&s[i..end])?;
            i = end;
            item
        }
        None => bail!("Unterminated filter"),
    };
    if s.get(i) != Some(&b')') {
        bail!("Expected ')' at offset {}", i);
    }
    Ok((filter, i + 1))
}

fn parse_list(s: &[u8], mut i: usize, depth: usize) -> Result<(Vec<Filter>, usize)> {
    let mut list = Vec::new();
    while s.get(i) == Some(&b'(') {
        let (filter, next) = parse_filter(s, i, depth)?;
        list.push(filter);
        i = next;
    }
    Ok((list, i))
}

fn parse_item(item: &[u8]) -> Result<Filter> {
    let text = std::str::from_utf8(item).context("Filter is not UTF-8")?;
    let eq = text
        .find('=')
        .with_context(|| format!("Missing '=' in filter item: {}", text))?;
    let (left, raw_value) = (&text[..eq], &text[eq + 1..]);

    if let Some(attr) = left.strip_suffix('~') {
        return Ok(Filter::Approx(attribute(attr)?, unescape(raw_value)?));
    }
    if let Some(attr) = left.strip_suffix('>') {
        return Ok(Filter::GreaterOrEqual(attribute(attr)?, unescape(raw_value)?));
    }
    if let Some(attr) = left.strip_suffix('<') {
        return Ok(Filter::LessOrEqual(attribute(attr)?, unescape(raw_value)?));
    }
    if let Some(spec) = left.strip_suffix(':') {
        return parse_extensible(spec, raw_value);
    }

    let attr = attribute(left)?;
    if raw_value == "*" {
        return Ok(Filter::Present(attr));
    }
    if raw_value.contains('*') {
        let parts: Vec<&str> = raw_value.split('*').collect();
        let last = parts.len() - 1;
        let initial = match parts[0] {
            "" => None,
            p => Some(unescape(p)?),
        };
        let final_value = match parts[last] {
            "" => None,
            p => Some(unescape(p)?),
        };
        let any = parts[1..last]
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| unescape(p))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Filter::Substrings {
            attr,
            initial,
            any,
            final_value,
        });
    }
    Ok(Filter::Equality(attr, unescape(raw_value)?))
}

/// `attr[:dn][:rule]` or `[:dn]:rule` (the trailing ':' before '=' already stripped).
fn parse_extensible(spec: &str, raw_value: &str) -> Result<Filter> {
    let mut segments = spec.split(':');
    let attr = segments.next().filter(|a| !a.is_empty()).map(str::to_string);
    let mut dn_attributes = false;
    let mut matching_rule = None;
    for segment in segments {
        if segment.eq_ignore_ascii_case("dn") {
            dn_attributes = true;
        } else if !segment.is_empty() {
            matching_rule = Some(segment.to_string());
        }
    }
    if attr.is_none() && matching_rule.is_none() {
        bail!("Extensible match needs an attribute or a matching rule: {}", spec);
    }
    Ok(Filter::Extensible {
        matching_rule,
        attr,
        value: unescape(raw_value)?,
        dn_attributes,
    })
}

fn attribute(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Empty attribute description in filter");
    }
    Ok(name.to_string())
}

/// Decode `\XX` hex escapes.
fn unescape(value: &str) -> Result<Vec<u8>> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .with_context(|| format!("Invalid escape in filter value: {}", value))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
    for &b in value {
        match b {
            b'*' | b'(' | b')' | b'\\' | 0 => write!(f, "\\{:02x}", b)?,
            0x20..=0x7E => write!(f, "{}", b as char)?,
            _ => write!(f, "\\{:02x}", b)?,
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(list) | Filter::Or(list) => {
                write!(f, "({}", if matches!(self, Filter::And(_)) { '&' } else { '|' })?;
                for filter in list {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality(attr, value) => {
                write!(f, "({}=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::GreaterOrEqual(attr, value) => {
                write!(f, "({}>=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::LessOrEqual(attr, value) => {
                write!(f, "({}<=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::Approx(attr, value) => {
                write!(f, "({}~=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Substrings {
                attr,
                initial,
                any,
                final_value,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    write_escaped(f, initial)?;
                }
                write!(f, "*")?;
                for part in any {
                    write_escaped(f, part)?;
                    write!(f, "*")?;
                }
                if let Some(final_value) = final_value {
                    write_escaped(f, final_value)?;
                }
                write!(f, ")")
            }
            Filter::Extensible {
                matching_rule,
                attr,
                value,
                dn_attributes,
            } => {
                write!(f, "({}", attr.as_deref().unwrap_or(""))?;
                if *dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(rule) = matching_rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":=")?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
        }
    }
}
