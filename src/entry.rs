//! Entry Decoder: converts search-result messages into [`Entry`] records.
//!
//! Values are surfaced as text or raw bytes depending only on the attribute name; the content
//! of a value is never inspected.

use serde::{Serialize, Serializer};

use crate::ldap_protocol::{LdapMessage, ProtocolOp, SearchResultEntry};

/// Attribute types whose values are always binary.
const BINARY_ATTRIBUTES: [&str; 16] = [
    "jpegPhoto",
    "photo",
    "personalSignature",
    "userCertificate",
    "cACertificate",
    "authorityRevocationList",
    "certificateRevocationList",
    "deltaRevocationList",
    "crossCertificatePair",
    "x500UniqueIdentifier",
    "audio",
    "javaSerializedObject",
    "thumbnailPhoto",
    "thumbnailLogo",
    "supportedAlgorithms",
    "protocolInformation",
];

const BINARY_OPTION: &str = ";binary";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    #[serde(serialize_with = "serialize_hex")]
    Binary(Vec<u8>),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            AttributeValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeValue::Text(s) => s.as_bytes(),
            AttributeValue::Binary(b) => b,
        }
    }
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    serializer.serialize_str(&hex)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<AttributeValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub dn: String,
    /// In protocol order; attributes with no values are kept.
    pub attributes: Vec<Attribute>,
}

impl Entry {
    /// Values of an attribute, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&[AttributeValue]> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.values.as_slice())
    }

    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.get(name)?.first()?.as_text()
    }
}

/// Entries of one search operation, in arrival order.
pub type SearchResult = Vec<Entry>;

pub fn is_binary(attr_name: &str) -> bool {
    attr_name.to_ascii_lowercase().contains(BINARY_OPTION)
        || BINARY_ATTRIBUTES.iter().any(|b| b.eq_ignore_ascii_case(attr_name))
}

pub fn decode_entry(entry: &SearchResultEntry) -> Entry {
    let attributes = entry
        .attributes
        .iter()
        .map(|attr| {
            let binary = is_binary(&attr.attr_type);
            let values = attr
                .attr_values
                .iter()
                .map(|v| {
                    if binary {
                        AttributeValue::Binary(v.clone())
                    } else {
                        AttributeValue::Text(String::from_utf8_lossy(v).into_owned())
                    }
                })
                .collect();
            Attribute {
                name: attr.attr_type.clone(),
                values,
            }
        })
        .collect();
    Entry {
        dn: entry.object_name.clone(),
        attributes,
    }
}

/// Decode every entry message of a result chain; references and the terminal message are skipped.
pub fn decode(chain: &[LdapMessage]) -> SearchResult {
    chain
        .iter()
        .filter_map(|msg| match &msg.protocol_op {
            ProtocolOp::SearchResultEntry(entry) => Some(decode_entry(entry)),
            _ => None,
        })
        .collect()
}
