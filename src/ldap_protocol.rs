// LDAPv3 message model with BER encoding/decoding.
// The codec is symmetric: every operation can be both encoded and parsed, so the client
// side (requests out, responses in) and the scripted test directory share one implementation.

use anyhow::{bail, Context, Result};
use std::io::{Cursor, Read};

use crate::filter::Filter;

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(ctype: &str, critical: bool, value: Option<Vec<u8>>) -> Self {
        Self {
            ctype: ctype.to_string(),
            critical,
            value,
        }
    }
}

// LDAP Message structure
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: None,
        }
    }

    /// Attach controls; an empty list leaves the message without a controls element.
    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        if !controls.is_empty() {
            self.controls = Some(controls);
        }
        self
    }

    pub fn controls(&self) -> &[Control] {
        self.controls.as_deref().unwrap_or(&[])
    }

    pub fn find_control(&self, oid: &str) -> Option<&Control> {
        self.controls().iter().find(|c| c.ctype == oid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResult),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    /// BER application tag of this operation.
    pub fn tag(&self) -> u8 {
        match self {
            ProtocolOp::BindRequest(_) => LDAP_TAG_BIND_REQUEST,
            ProtocolOp::BindResponse(_) => LDAP_TAG_BIND_RESPONSE,
            ProtocolOp::UnbindRequest => LDAP_TAG_UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => LDAP_TAG_SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => LDAP_TAG_SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => LDAP_TAG_SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) => LDAP_TAG_SEARCH_RESULT_DONE,
            ProtocolOp::ModifyRequest(_) => LDAP_TAG_MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => LDAP_TAG_MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => LDAP_TAG_ADD_REQUEST,
            ProtocolOp::AddResponse(_) => LDAP_TAG_ADD_RESPONSE,
            ProtocolOp::DelRequest(_) => LDAP_TAG_DEL_REQUEST,
            ProtocolOp::DelResponse(_) => LDAP_TAG_DEL_RESPONSE,
            ProtocolOp::ModifyDNRequest(_) => LDAP_TAG_MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDNResponse(_) => LDAP_TAG_MODIFY_DN_RESPONSE,
            ProtocolOp::CompareResponse(_) => LDAP_TAG_COMPARE_RESPONSE,
            ProtocolOp::AbandonRequest(_) => LDAP_TAG_ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => LDAP_TAG_EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => LDAP_TAG_EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResponse(_) => LDAP_TAG_INTERMEDIATE_RESPONSE,
        }
    }

    /// The LDAPResult carried by a response, if this is one.
    pub fn ldap_result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(resp) => Some(&resp.result),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DelResponse(r)
            | ProtocolOp::ModifyDNResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            ProtocolOp::ExtendedResponse(resp) => Some(&resp.result),
            _ => None,
        }
    }
}

/// LDAPResult ::= SEQUENCE { resultCode, matchedDN, diagnosticMessage, referral [3] OPTIONAL }
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referral: Vec<String>,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_code(result_code: i32, diagnostic_message: &str) -> Self {
        Self {
            result_code,
            diagnostic_message: diagnostic_message.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl { mechanism: String, credentials: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    #[serde(alias = "base")]
    BaseObject = 0,
    #[serde(alias = "one")]
    SingleLevel = 1,
    #[default]
    #[serde(alias = "sub")]
    WholeSubtree = 2,
    #[serde(alias = "children")]
    Subordinate = 3,
}

impl TryFrom<i32> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            3 => Ok(SearchScope::Subordinate),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

impl std::str::FromStr for SearchScope {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" | "baseobject" => Ok(SearchScope::BaseObject),
            "one" | "onelevel" | "singlelevel" => Ok(SearchScope::SingleLevel),
            "sub" | "subtree" | "wholesubtree" => Ok(SearchScope::WholeSubtree),
            "children" | "subordinate" => Ok(SearchScope::Subordinate),
            _ => bail!("Invalid search scope: {}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

impl TryFrom<i32> for ModifyOperation {
    type Error = anyhow::Error;
    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            _ => bail!("Invalid modify operation: {}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    pub(crate) cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub(crate) fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf).context("BER truncated: missing tag")?;
        Ok(buf[0])
    }

    pub(crate) fn peek_tag(&self) -> Option<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().get(pos).copied()
    }

    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf).context("BER truncated: missing length")?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!("BER truncated: length encoding needs {} bytes, {} remaining", length_bytes, self.remaining());
            }
            let mut length = 0u32;
            for _ in 0..length_bytes {
                self.cursor.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as u32;
            }
            Ok(length as usize)
        }
    }

    /// Borrow the next `n` content bytes without copying.
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        self.cursor.set_position((start + n) as u64);
        Ok(&data[start..start + n])
    }

    /// Read one TLV, returning its tag and content.
    pub(crate) fn read_tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        let content = self.take(length)?;
        Ok((tag, content))
    }

    /// Enter a constructed element with the given tag; the returned reader is bounded to its content.
    pub(crate) fn read_constructed(&mut self, expected: u8) -> Result<BerReader<'a>> {
        let (tag, content) = self.read_tlv()?;
        if tag != expected {
            bail!("Expected tag 0x{:02X}, got: 0x{:02X}", expected, tag);
        }
        Ok(BerReader::new(content))
    }

    pub(crate) fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        self.read_constructed(0x30)
    }

    pub(crate) fn read_integer(&mut self) -> Result<i32> {
        let (tag, content) = self.read_tlv()?;
        if tag != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        integer_from_bytes(content)
    }

    pub(crate) fn read_enumerated(&mut self) -> Result<i32> {
        let (tag, content) = self.read_tlv()?;
        if tag != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        integer_from_bytes(content)
    }

    /// Read OCTET STRING TLV. Accepts: 0x04 (universal) or any primitive context-specific tag 0x80..=0x9F.
    pub(crate) fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let (tag, content) = self.read_tlv()?;
        let ok = tag == 0x04 || (0x80..=0x9F).contains(&tag);
        if !ok {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        Ok(content.to_vec())
    }

    /// Server-provided text is taken lossily; a stray byte in a diagnostic must not drop the message.
    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub(crate) fn read_boolean(&mut self) -> Result<bool> {
        let (tag, content) = self.read_tlv()?;
        if tag != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        if content.len() != 1 {
            bail!("Boolean value must be 1 byte, got: {}", content.len());
        }
        Ok(content[0] != 0)
    }

    pub(crate) fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// Two's-complement big-endian INTEGER/ENUMERATED content to i32.
pub(crate) fn integer_from_bytes(content: &[u8]) -> Result<i32> {
    if content.is_empty() {
        bail!("Empty integer encoding");
    }
    if content.len() > 8 {
        bail!("Integer too large: {} bytes", content.len());
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in content {
        value = (value << 8) | byte as i64;
    }
    i32::try_from(value).with_context(|| format!("Integer out of range: {}", value))
}

// BER encoding utilities
#[derive(Debug, Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        let encoded = encode_length(length);
        self.buffer.extend_from_slice(&encoded);
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tagged_integer(0x02, value);
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_tagged_integer(0x0A, value);
    }

    pub fn write_tagged_integer(&mut self, tag: u8, value: i32) {
        let bytes = integer_bytes(value);
        self.write_tag(tag);
        self.write_length(bytes.len());
        self.buffer.extend_from_slice(&bytes);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tagged_octets(0x04, data);
    }

    /// Primitive element with an arbitrary (usually context-specific) tag.
    pub fn write_tagged_octets(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01); // BOOLEAN tag
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    /// Open a constructed element. Returns the placeholder position for `end_constructed`.
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let length_pos = self.buffer.len();
        self.buffer.push(0); // Placeholder for length
        length_pos
    }

    /// Back-patch the length placeholder; long form lengths are spliced in place.
    pub fn end_constructed(&mut self, length_pos: usize) {
        let content_len = self.buffer.len() - (length_pos + 1);
        let encoded = encode_length(content_len);
        self.buffer.splice(length_pos..length_pos + 1, encoded);
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(0x30)
    }

    pub fn end_sequence(&mut self, start_pos: usize) {
        self.end_constructed(start_pos);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

fn encode_length(length: usize) -> Vec<u8> {
    if length < 128 {
        return vec![length as u8];
    }
    let bytes: Vec<u8> = (length as u64)
        .to_be_bytes()
        .into_iter()
        .skip_while(|&b| b == 0)
        .collect();
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(0x80 | bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

/// Minimal two's-complement encoding.
fn integer_bytes(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
/// [APPLICATION 25] - intermediate response
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
const LDAP_TAG_REFERRAL: u8 = 0xA3;
const LDAP_TAG_SASL_CREDENTIALS: u8 = 0x87;

/// StartTLS extended operation (RFC 4511 4.14.1)
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// Notice of Disconnection unsolicited notification (RFC 4511 4.4.1)
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
/// Returns (message_id, op_tag) so an undecodable operation can still be attributed.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut outer = BerReader::new(data);
    let mut reader = outer.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.peek_tag().context("LDAP message without protocolOp")?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut reader = outer.read_sequence()?;
    let message_id = reader.read_integer()?;

    let (tag, content) = reader.read_tlv()?;
    let mut body = BerReader::new(content);
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&mut body)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(&mut body)?),
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(&mut body)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => ProtocolOp::SearchResultEntry(parse_search_result_entry(&mut body)?),
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            let mut uris = Vec::new();
            while !body.is_empty() {
                uris.push(body.read_string()?);
            }
            ProtocolOp::SearchResultReference(uris)
        }
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_ldap_result(&mut body)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(&mut body)?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(parse_ldap_result(&mut body)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(&mut body)?),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_ldap_result(&mut body)?),
        // [APPLICATION 10] LDAPDN, primitive
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(DelRequest {
            entry: String::from_utf8_lossy(content).into_owned(),
        }),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_ldap_result(&mut body)?),
        LDAP_TAG_MODIFY_DN_REQUEST => ProtocolOp::ModifyDNRequest(parse_modify_dn_request(&mut body)?),
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDNResponse(parse_ldap_result(&mut body)?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(parse_ldap_result(&mut body)?),
        // [APPLICATION 16] MessageID, primitive
        LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(integer_from_bytes(content)?),
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(&mut body)?),
        LDAP_TAG_EXTENDED_RESPONSE => ProtocolOp::ExtendedResponse(parse_extended_response(&mut body)?),
        LDAP_TAG_INTERMEDIATE_RESPONSE => {
            ProtocolOp::IntermediateResponse(parse_intermediate_response(&mut body)?)
        }
        _ => bail!("Unsupported LDAP operation tag: 0x{:02X}", tag),
    };

    let controls = if reader.peek_tag() == Some(LDAP_CONTEXT_CONTROLS) {
        let mut controls_reader = reader.read_constructed(LDAP_CONTEXT_CONTROLS)?;
        Some(parse_controls(&mut controls_reader)?)
    } else {
        None
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let mut controls = Vec::new();
    while !reader.is_empty() {
        let mut ctrl = reader.read_sequence()?;
        let ctype = ctrl.read_string()?;
        let critical = if ctrl.peek_tag() == Some(0x01) {
            ctrl.read_boolean()?
        } else {
            false
        };
        let value = if ctrl.peek_tag() == Some(0x04) {
            Some(ctrl.read_octet_string()?)
        } else {
            None
        };
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn parse_ldap_result(reader: &mut BerReader) -> Result<LdapResult> {
    let result_code = reader.read_enumerated()?;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    let mut referral = Vec::new();
    if reader.peek_tag() == Some(LDAP_TAG_REFERRAL) {
        let mut refs = reader.read_constructed(LDAP_TAG_REFERRAL)?;
        while !refs.is_empty() {
            referral.push(refs.read_string()?);
        }
    }
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referral,
    })
}

fn parse_bind_request(reader: &mut BerReader) -> Result<BindRequest> {
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    let (auth_tag, auth) = reader.read_tlv()?;
    let authentication = match auth_tag {
        // simple [0]
        0x80 => BindAuthentication::Simple(String::from_utf8(auth.to_vec()).context("Bind password is not UTF-8")?),
        // sasl [3] SaslCredentials ::= SEQUENCE { mechanism, credentials OPTIONAL }
        0xA3 => {
            let mut sasl = BerReader::new(auth);
            let mechanism = sasl.read_string()?;
            let credentials = if sasl.is_empty() {
                Vec::new()
            } else {
                sasl.read_octet_string()?
            };
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        }
        _ => bail!("Unsupported bind authentication tag: 0x{:02X}", auth_tag),
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_bind_response(reader: &mut BerReader) -> Result<BindResponse> {
    let result = parse_ldap_result(reader)?;
    let server_sasl_creds = if reader.peek_tag() == Some(LDAP_TAG_SASL_CREDENTIALS) {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

fn parse_search_request(reader: &mut BerReader) -> Result<SearchRequest> {
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = Filter::decode(reader)?;

    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(attrs.read_string()?);
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_search_result_entry(reader: &mut BerReader) -> Result<SearchResultEntry> {
    let object_name = reader.read_string()?;
    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(parse_attribute(&mut attrs)?);
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_modify_request(reader: &mut BerReader) -> Result<ModifyRequest> {
    let object = reader.read_string()?;

    let mut changes_reader = reader.read_sequence()?;
    let mut changes = Vec::new();
    while !changes_reader.is_empty() {
        let mut change = changes_reader.read_sequence()?;
        let operation = ModifyOperation::try_from(change.read_enumerated()?)?;
        let modification = parse_attribute(&mut change)?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }

    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(reader: &mut BerReader) -> Result<AddRequest> {
    let entry = reader.read_string()?;
    let mut attrs = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while !attrs.is_empty() {
        attributes.push(parse_attribute(&mut attrs)?);
    }
    Ok(AddRequest { entry, attributes })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(reader: &mut BerReader) -> Result<ModifyDNRequest> {
    let entry = reader.read_string()?;
    let newrdn = reader.read_string()?;
    let delete_old_rdn = reader.read_boolean()?;
    let new_superior = match reader.peek_tag() {
        Some(0x80) => Some(reader.read_string()?),
        Some(tag) => bail!("ModifyDNRequest: expected newSuperior [0], got tag 0x{:02X}", tag),
        None => None,
    };
    Ok(ModifyDNRequest {
        entry,
        newrdn,
        delete_old_rdn,
        new_superior,
    })
}

fn parse_extended_request(reader: &mut BerReader) -> Result<ExtendedRequest> {
    let request_name = reader.read_string()?;
    let request_value = if reader.peek_tag() == Some(0x81) {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_extended_response(reader: &mut BerReader) -> Result<ExtendedResponse> {
    let result = parse_ldap_result(reader)?;
    let response_name = if reader.peek_tag() == Some(0x8A) {
        Some(reader.read_string()?)
    } else {
        None
    };
    let response_value = if reader.peek_tag() == Some(0x8B) {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

fn parse_intermediate_response(reader: &mut BerReader) -> Result<IntermediateResponse> {
    let response_name = if reader.peek_tag() == Some(0x80) {
        Some(reader.read_string()?)
    } else {
        None
    };
    let response_value = if reader.peek_tag() == Some(0x81) {
        Some(reader.read_octet_string()?)
    } else {
        None
    };
    Ok(IntermediateResponse {
        response_name,
        response_value,
    })
}

/// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let mut attr = reader.read_sequence()?;
    let attr_type = attr.read_string()?;
    let mut vals = attr.read_constructed(0x31)?;
    let mut attr_values = Vec::new();
    while !vals.is_empty() {
        attr_values.push(vals.read_octet_string()?);
    }
    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    let tag = message.protocol_op.tag();
    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(&mut writer, req),
        ProtocolOp::BindResponse(resp) => {
            let pos = writer.start_constructed(tag);
            write_ldap_result_fields(&mut writer, &resp.result);
            if let Some(creds) = &resp.server_sasl_creds {
                writer.write_tagged_octets(LDAP_TAG_SASL_CREDENTIALS, creds);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::UnbindRequest => writer.write_tagged_octets(tag, &[]),
        ProtocolOp::SearchRequest(req) => encode_search_request(&mut writer, req),
        ProtocolOp::SearchResultEntry(entry) => {
            let pos = writer.start_constructed(tag);
            writer.write_string(&entry.object_name);
            encode_attribute_list(&mut writer, &entry.attributes);
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultReference(uris) => {
            let pos = writer.start_constructed(tag);
            for uri in uris {
                writer.write_string(uri);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::SearchResultDone(result)
        | ProtocolOp::ModifyResponse(result)
        | ProtocolOp::AddResponse(result)
        | ProtocolOp::DelResponse(result)
        | ProtocolOp::ModifyDNResponse(result)
        | ProtocolOp::CompareResponse(result) => {
            let pos = writer.start_constructed(tag);
            write_ldap_result_fields(&mut writer, result);
            writer.end_constructed(pos);
        }
        ProtocolOp::ModifyRequest(req) => encode_modify_request(&mut writer, req),
        ProtocolOp::AddRequest(req) => {
            let pos = writer.start_constructed(tag);
            writer.write_string(&req.entry);
            encode_attribute_list(&mut writer, &req.attributes);
            writer.end_constructed(pos);
        }
        ProtocolOp::DelRequest(req) => writer.write_tagged_octets(tag, req.entry.as_bytes()),
        ProtocolOp::ModifyDNRequest(req) => {
            let pos = writer.start_constructed(tag);
            writer.write_string(&req.entry);
            writer.write_string(&req.newrdn);
            writer.write_boolean(req.delete_old_rdn);
            if let Some(sup) = &req.new_superior {
                writer.write_tagged_octets(0x80, sup.as_bytes());
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::AbandonRequest(id) => writer.write_tagged_integer(tag, *id),
        ProtocolOp::ExtendedRequest(req) => {
            let pos = writer.start_constructed(tag);
            writer.write_tagged_octets(0x80, req.request_name.as_bytes());
            if let Some(value) = &req.request_value {
                writer.write_tagged_octets(0x81, value);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::ExtendedResponse(resp) => {
            let pos = writer.start_constructed(tag);
            write_ldap_result_fields(&mut writer, &resp.result);
            if let Some(name) = &resp.response_name {
                writer.write_tagged_octets(0x8A, name.as_bytes());
            }
            if let Some(value) = &resp.response_value {
                writer.write_tagged_octets(0x8B, value);
            }
            writer.end_constructed(pos);
        }
        ProtocolOp::IntermediateResponse(resp) => {
            let pos = writer.start_constructed(tag);
            if let Some(name) = &resp.response_name {
                writer.write_tagged_octets(0x80, name.as_bytes());
            }
            if let Some(value) = &resp.response_value {
                writer.write_tagged_octets(0x81, value);
            }
            writer.end_constructed(pos);
        }
    }

    if let Some(controls) = message.controls.as_ref().filter(|c| !c.is_empty()) {
        encode_controls(&mut writer, controls);
    }

    writer.end_sequence(seq_start);
    writer.into_vec()
}

fn encode_controls(writer: &mut BerWriter, controls: &[Control]) {
    let pos = writer.start_constructed(LDAP_CONTEXT_CONTROLS);
    for control in controls {
        let ctrl = writer.start_sequence();
        writer.write_string(&control.ctype);
        if control.critical {
            writer.write_boolean(true);
        }
        if let Some(value) = &control.value {
            writer.write_octet_string(value);
        }
        writer.end_sequence(ctrl);
    }
    writer.end_constructed(pos);
}

fn write_ldap_result_fields(writer: &mut BerWriter, result: &LdapResult) {
    writer.write_enumerated(result.result_code);
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
    if !result.referral.is_empty() {
        let pos = writer.start_constructed(LDAP_TAG_REFERRAL);
        for uri in &result.referral {
            writer.write_string(uri);
        }
        writer.end_constructed(pos);
    }
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) {
    let pos = writer.start_constructed(LDAP_TAG_BIND_REQUEST);
    writer.write_integer(req.version);
    writer.write_string(&req.name);
    match &req.authentication {
        BindAuthentication::Simple(password) => writer.write_tagged_octets(0x80, password.as_bytes()),
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } => {
            let sasl = writer.start_constructed(0xA3);
            writer.write_string(mechanism);
            if !credentials.is_empty() {
                writer.write_octet_string(credentials);
            }
            writer.end_constructed(sasl);
        }
    }
    writer.end_constructed(pos);
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_REQUEST);
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as i32);
    writer.write_enumerated(req.deref_aliases);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    req.filter.encode(writer);
    let attrs = writer.start_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end_sequence(attrs);
    writer.end_constructed(pos);
}

fn encode_modify_request(writer: &mut BerWriter, req: &ModifyRequest) {
    let pos = writer.start_constructed(LDAP_TAG_MODIFY_REQUEST);
    writer.write_string(&req.object);
    let changes = writer.start_sequence();
    for change in &req.changes {
        let seq = writer.start_sequence();
        writer.write_enumerated(change.operation as i32);
        encode_attribute(writer, &change.modification);
        writer.end_sequence(seq);
    }
    writer.end_sequence(changes);
    writer.end_constructed(pos);
}

fn encode_attribute_list(writer: &mut BerWriter, attributes: &[Attribute]) {
    let seq = writer.start_sequence();
    for attr in attributes {
        encode_attribute(writer, attr);
    }
    writer.end_sequence(seq);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq = writer.start_sequence();
    writer.write_string(&attr.attr_type);
    let set = writer.start_constructed(0x31);
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.end_constructed(set);
    writer.end_sequence(seq);
}
