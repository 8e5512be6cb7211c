//! Control Codec.
//!
//! Outgoing: builds the request controls of a search from one [`SearchControls`] value (sort,
//! simple paged results, virtual list view, named passthrough controls) and the content-sync
//! request control. Incoming: decodes sort/VLV/paged response controls into [`ResponseControls`]
//! plus the continuation [`Cookie`], and the content-sync state/done controls and syncInfo
//! intermediate values.
//!
//! All functions are pure; building either returns the complete control list or an error, never
//! a partial list.

use std::fmt;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::ldap_protocol::{BerReader, BerWriter, Control};

pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
pub const SORT_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";
pub const VLV_REQUEST_OID: &str = "2.16.840.1.113730.3.4.9";
pub const VLV_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.10";
pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";

/// RFC 4533 content synchronization
pub const SYNC_REQUEST_OID: &str = "1.3.6.1.4.1.4203.1.9.1.1";
pub const SYNC_STATE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.2";
pub const SYNC_DONE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.3";
pub const SYNC_INFO_OID: &str = "1.3.6.1.4.1.4203.1.9.1.4";

/// Window used for a VLV request that does not name a page size.
pub const DEFAULT_VLV_PAGE_SIZE: u32 = 10;

/// Opaque continuation token. Never empty: a zero-length cookie means "no further pages" and is
/// represented as `None` wherever a cookie is optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cookie(Vec<u8>);

impl Cookie {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Option<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            None
        } else {
            Some(Cookie(bytes))
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PagingMode {
    #[default]
    None,
    SimplePaged,
    VirtualListView,
}

impl PagingMode {
    /// A page size with a sort order means VLV, without one it means simple paging.
    pub fn infer(page_size: u32, sort: Option<&str>) -> Self {
        match (page_size, sort) {
            (0, _) => PagingMode::None,
            (_, Some(_)) => PagingMode::VirtualListView,
            (_, None) => PagingMode::SimplePaged,
        }
    }
}

/// Paging and ordering options of one search request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchControls {
    pub paging_mode: PagingMode,
    pub page_size: u32,
    /// Cookie from the previous page, passed back verbatim.
    pub cookie: Option<Cookie>,
    /// Zero-based VLV target offset.
    pub offset: u32,
    /// Sort keys: `[-]attribute[:orderingRule]`, whitespace separated.
    pub sort: Option<String>,
    /// Named controls such as `manageDSAit`; a leading `!` marks the control critical.
    pub extra_controls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub ordering_rule: Option<String>,
    pub reverse: bool,
}

impl SortKey {
    pub fn parse_list(spec: &str) -> Result<Vec<SortKey>> {
        let keys = spec
            .split_whitespace()
            .map(SortKey::parse)
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            return Err(Error::Control(format!("empty sort specification: {:?}", spec)));
        }
        Ok(keys)
    }

    fn parse(key: &str) -> Result<SortKey> {
        let (reverse, rest) = match key.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, key),
        };
        let (attribute, ordering_rule) = match rest.split_once(':') {
            Some((attr, rule)) => {
                if rule.is_empty() || rule.contains(':') {
                    return Err(Error::Control(format!("invalid ordering rule in sort key {:?}", key)));
                }
                (attr, Some(rule.to_string()))
            }
            None => (rest, None),
        };
        if attribute.is_empty() || !is_attribute_description(attribute) {
            return Err(Error::Control(format!("invalid attribute in sort key {:?}", key)));
        }
        Ok(SortKey {
            attribute: attribute.to_string(),
            ordering_rule,
            reverse,
        })
    }
}

fn is_attribute_description(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == ';' || c == '.')
}

/// Build every request control of a search. The list is built locally and only returned whole.
pub fn build_request_controls(options: &SearchControls) -> Result<Vec<Control>> {
    let mut controls = Vec::new();

    if let Some(spec) = &options.sort {
        let keys = SortKey::parse_list(spec)?;
        controls.push(sort_request_control(&keys));
    }
    let sorted = !controls.is_empty();

    match options.paging_mode {
        PagingMode::None => {}
        PagingMode::SimplePaged => {
            controls.push(paged_results_control(options.page_size, options.cookie.as_ref()));
        }
        PagingMode::VirtualListView => {
            if options.offset == 0 && !sorted {
                return Err(Error::Control(
                    "virtual list view needs a sort order or a positive offset".to_string(),
                ));
            }
            let page_size = if options.page_size > 0 {
                options.page_size
            } else {
                DEFAULT_VLV_PAGE_SIZE
            };
            controls.push(vlv_request_control(
                0,
                page_size - 1,
                vlv_target_offset(options.offset)?,
                options.cookie.as_ref(),
            ));
        }
    }

    controls.extend(named_controls(&options.extra_controls)?);
    Ok(controls)
}

/// Resolve passthrough control names.
pub fn named_controls(names: &[String]) -> Result<Vec<Control>> {
    names
        .iter()
        .map(|name| {
            let (critical, bare) = match name.strip_prefix('!') {
                Some(bare) => (true, bare),
                None => (false, name.as_str()),
            };
            if bare.eq_ignore_ascii_case("manageDSAit") {
                Ok(Control::new(MANAGE_DSA_IT_OID, critical, None))
            } else {
                Err(Error::Control(format!("unsupported control {:?}", name)))
            }
        })
        .collect()
}

/// Zero-based caller offset to the protocol's one-based target position.
pub fn vlv_target_offset(offset: u32) -> Result<i32> {
    i32::try_from(offset)
        .ok()
        .and_then(|o| o.checked_add(1))
        .ok_or_else(|| Error::Control(format!("VLV offset {} out of range", offset)))
}

/// One-based target position back to a zero-based offset.
pub fn vlv_zero_based(position: i32) -> i32 {
    position.saturating_sub(1)
}

/// SortKeyList ::= SEQUENCE OF SEQUENCE { attributeType, orderingRule [0] OPTIONAL, reverseOrder [1] BOOLEAN DEFAULT FALSE }
pub fn sort_request_control(keys: &[SortKey]) -> Control {
    let mut writer = BerWriter::new();
    let list = writer.start_sequence();
    for key in keys {
        let seq = writer.start_sequence();
        writer.write_string(&key.attribute);
        if let Some(rule) = &key.ordering_rule {
            writer.write_tagged_octets(0x80, rule.as_bytes());
        }
        if key.reverse {
            writer.write_tagged_octets(0x81, &[0xFF]);
        }
        writer.end_sequence(seq);
    }
    writer.end_sequence(list);
    Control::new(SORT_REQUEST_OID, false, Some(writer.into_vec()))
}

/// realSearchControlValue ::= SEQUENCE { size INTEGER, cookie OCTET STRING }
pub fn paged_results_control(page_size: u32, cookie: Option<&Cookie>) -> Control {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(i32::try_from(page_size).unwrap_or(i32::MAX));
    writer.write_octet_string(cookie.map(Cookie::as_bytes).unwrap_or(&[]));
    writer.end_sequence(seq);
    Control::new(PAGED_RESULTS_OID, false, Some(writer.into_vec()))
}

/// VirtualListViewRequest ::= SEQUENCE { beforeCount, afterCount,
///     target CHOICE { byOffset [0] SEQUENCE { offset, contentCount } }, contextID OPTIONAL }
pub fn vlv_request_control(before: u32, after: u32, target_offset: i32, context: Option<&Cookie>) -> Control {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(i32::try_from(before).unwrap_or(i32::MAX));
    writer.write_integer(i32::try_from(after).unwrap_or(i32::MAX));
    let by_offset = writer.start_constructed(0xA0);
    writer.write_integer(target_offset);
    writer.write_integer(0);
    writer.end_constructed(by_offset);
    if let Some(context) = context {
        writer.write_octet_string(context.as_bytes());
    }
    writer.end_sequence(seq);
    Control::new(VLV_REQUEST_OID, true, Some(writer.into_vec()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PageControl {
    pub estimated_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VlvControl {
    /// Zero-based.
    pub offset: i32,
    pub count: i32,
    pub return_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SortControl {
    pub return_code: i32,
    pub error_attribute: Option<String>,
}

/// Paging/ordering controls attached to a terminal search result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ResponseControls {
    pub page: Option<PageControl>,
    pub vlv: Option<VlvControl>,
    pub sort: Option<SortControl>,
}

impl ResponseControls {
    pub fn is_empty(&self) -> bool {
        self.page.is_none() && self.vlv.is_none() && self.sort.is_none()
    }
}

/// Decode the response controls of a terminal result. A VLV response takes precedence over a
/// paged-results response; the cookie is the VLV context id or the paged cookie.
/// Malformed control values are skipped.
pub fn decode_response_controls(controls: &[Control]) -> (ResponseControls, Option<Cookie>) {
    let mut decoded = ResponseControls::default();
    let mut cookie = None;

    if let Some(value) = control_value(controls, SORT_RESPONSE_OID) {
        match decode_sort_response(value) {
            Ok(sort) => decoded.sort = Some(sort),
            Err(e) => debug!("Ignoring malformed sort response control: {}", e),
        }
    }

    if let Some(value) = control_value(controls, VLV_RESPONSE_OID) {
        match decode_vlv_response(value) {
            Ok((vlv, context)) => {
                decoded.vlv = Some(vlv);
                cookie = context;
            }
            Err(e) => debug!("Ignoring malformed VLV response control: {}", e),
        }
    } else if let Some(value) = control_value(controls, PAGED_RESULTS_OID) {
        match decode_paged_response(value) {
            Ok((page, next)) => {
                decoded.page = Some(page);
                cookie = next;
            }
            Err(e) => debug!("Ignoring malformed paged results control: {}", e),
        }
    }

    (decoded, cookie)
}

fn control_value<'a>(controls: &'a [Control], oid: &str) -> Option<&'a [u8]> {
    controls
        .iter()
        .find(|c| c.ctype == oid)
        .and_then(|c| c.value.as_deref())
}

/// SortResult ::= SEQUENCE { sortResult ENUMERATED, attributeType [0] OPTIONAL }
fn decode_sort_response(value: &[u8]) -> anyhow::Result<SortControl> {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence()?;
    let return_code = seq.read_enumerated()?;
    let error_attribute = if seq.peek_tag() == Some(0x80) {
        Some(seq.read_string()?)
    } else {
        None
    };
    Ok(SortControl {
        return_code,
        error_attribute,
    })
}

/// VirtualListViewResponse ::= SEQUENCE { targetPosition, contentCount, virtualListViewResult ENUMERATED, contextID OPTIONAL }
fn decode_vlv_response(value: &[u8]) -> anyhow::Result<(VlvControl, Option<Cookie>)> {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence()?;
    let position = seq.read_integer()?;
    let count = seq.read_integer()?;
    let return_code = seq.read_enumerated()?;
    let context = if seq.peek_tag() == Some(0x04) {
        Cookie::new(seq.read_octet_string()?)
    } else {
        None
    };
    Ok((
        VlvControl {
            offset: vlv_zero_based(position),
            count,
            return_code,
        },
        context,
    ))
}

fn decode_paged_response(value: &[u8]) -> anyhow::Result<(PageControl, Option<Cookie>)> {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence()?;
    let estimated_count = seq.read_integer()?;
    let cookie = Cookie::new(seq.read_octet_string()?);
    Ok((PageControl { estimated_count }, cookie))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    RefreshOnly = 1,
    RefreshAndPersist = 3,
}

/// syncRequestValue ::= SEQUENCE { mode ENUMERATED, cookie OPTIONAL, reloadHint BOOLEAN DEFAULT FALSE }
pub fn sync_request_control(mode: SyncMode, cookie: Option<&Cookie>, reload_hint: bool) -> Control {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_enumerated(mode as i32);
    if let Some(cookie) = cookie {
        writer.write_octet_string(cookie.as_bytes());
    }
    if reload_hint {
        writer.write_boolean(true);
    }
    writer.end_sequence(seq);
    Control::new(SYNC_REQUEST_OID, true, Some(writer.into_vec()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Present,
    Add,
    Modify,
    Delete,
}

impl TryFrom<i32> for EntryState {
    type Error = anyhow::Error;
    fn try_from(value: i32) -> anyhow::Result<Self> {
        match value {
            0 => Ok(EntryState::Present),
            1 => Ok(EntryState::Add),
            2 => Ok(EntryState::Modify),
            3 => Ok(EntryState::Delete),
            _ => bail!("Invalid sync state: {}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateValue {
    pub state: EntryState,
    pub entry_uuid: String,
    pub cookie: Option<Cookie>,
}

/// syncStateValue ::= SEQUENCE { state ENUMERATED, entryUUID OCTET STRING, cookie OPTIONAL }
pub fn decode_sync_state(value: &[u8]) -> anyhow::Result<SyncStateValue> {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence()?;
    let state = EntryState::try_from(seq.read_enumerated()?)?;
    let entry_uuid = format_uuid(&seq.read_octet_string()?);
    let cookie = if seq.peek_tag() == Some(0x04) {
        Cookie::new(seq.read_octet_string()?)
    } else {
        None
    };
    Ok(SyncStateValue {
        state,
        entry_uuid,
        cookie,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncDoneValue {
    pub cookie: Option<Cookie>,
    pub refresh_deletes: bool,
}

/// syncDoneValue ::= SEQUENCE { cookie OPTIONAL, refreshDeletes BOOLEAN DEFAULT FALSE }
pub fn decode_sync_done(value: &[u8]) -> anyhow::Result<SyncDoneValue> {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence()?;
    let mut done = SyncDoneValue::default();
    if seq.peek_tag() == Some(0x04) {
        done.cookie = Cookie::new(seq.read_octet_string()?);
    }
    if seq.peek_tag() == Some(0x01) {
        done.refresh_deletes = seq.read_boolean()?;
    }
    Ok(done)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncInfo {
    NewCookie(Option<Cookie>),
    RefreshDelete {
        cookie: Option<Cookie>,
        refresh_done: bool,
    },
    RefreshPresent {
        cookie: Option<Cookie>,
        refresh_done: bool,
    },
    SyncIdSet {
        cookie: Option<Cookie>,
        refresh_deletes: bool,
        uuids: Vec<String>,
    },
}

impl SyncInfo {
    pub fn cookie(&self) -> Option<&Cookie> {
        match self {
            SyncInfo::NewCookie(cookie)
            | SyncInfo::RefreshDelete { cookie, .. }
            | SyncInfo::RefreshPresent { cookie, .. }
            | SyncInfo::SyncIdSet { cookie, .. } => cookie.as_ref(),
        }
    }

    /// True when this message ends the refresh stage.
    pub fn ends_refresh(&self) -> bool {
        match self {
            SyncInfo::RefreshDelete { refresh_done, .. } | SyncInfo::RefreshPresent { refresh_done, .. } => {
                *refresh_done
            }
            _ => false,
        }
    }
}

/// syncInfoValue ::= CHOICE { newcookie [0], refreshDelete [1], refreshPresent [2], syncIdSet [3] }
pub fn decode_sync_info(value: &[u8]) -> anyhow::Result<SyncInfo> {
    let mut reader = BerReader::new(value);
    let (tag, content) = reader.read_tlv()?;
    let mut body = BerReader::new(content);
    let info = match tag {
        0x80 => SyncInfo::NewCookie(Cookie::new(content.to_vec())),
        0xA1 | 0xA2 => {
            let cookie = if body.peek_tag() == Some(0x04) {
                Cookie::new(body.read_octet_string()?)
            } else {
                None
            };
            let refresh_done = if body.peek_tag() == Some(0x01) {
                body.read_boolean()?
            } else {
                true
            };
            if tag == 0xA1 {
                SyncInfo::RefreshDelete { cookie, refresh_done }
            } else {
                SyncInfo::RefreshPresent { cookie, refresh_done }
            }
        }
        0xA3 => {
            let cookie = if body.peek_tag() == Some(0x04) {
                Cookie::new(body.read_octet_string()?)
            } else {
                None
            };
            let refresh_deletes = if body.peek_tag() == Some(0x01) {
                body.read_boolean()?
            } else {
                false
            };
            let mut set = body.read_constructed(0x31).context("syncIdSet without syncUUIDs")?;
            let mut uuids = Vec::new();
            while !set.is_empty() {
                uuids.push(format_uuid(&set.read_octet_string()?));
            }
            SyncInfo::SyncIdSet {
                cookie,
                refresh_deletes,
                uuids,
            }
        }
        _ => bail!("Unknown syncInfoValue choice: 0x{:02X}", tag),
    };
    Ok(info)
}

/// 16-byte entryUUID as lowercase hyphenated text; other lengths as plain hex.
pub fn format_uuid(bytes: &[u8]) -> String {
    match uuid::Uuid::from_slice(bytes) {
        Ok(uuid) => uuid.hyphenated().to_string(),
        Err(_) => bytes.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}
