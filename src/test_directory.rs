//! Scripted directory server for I/O tests. Speaks just enough LDAP through the crate's own
//! codec: simple bind, search over `cn=userN,dc=com` entries with paged/VLV/sort controls,
//! a canned content sync session, the modify family, abandon, unbind, and a StartTLS that is
//! always refused.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::connection::Connection;
use crate::controls::{
    PAGED_RESULTS_OID, SORT_REQUEST_OID, SORT_RESPONSE_OID, SYNC_DONE_OID, SYNC_INFO_OID, SYNC_REQUEST_OID,
    SYNC_STATE_OID, VLV_REQUEST_OID, VLV_RESPONSE_OID,
};
use crate::events::Event;
use crate::ldap_protocol::{
    encode_ldap_message, Attribute, BerReader, BerWriter, BindAuthentication, BindResponse, Control,
    ExtendedResponse, IntermediateResponse, LdapMessage, LdapResult, ProtocolOp, SearchRequest, SearchResultEntry,
    START_TLS_OID,
};
use crate::transport::{try_parse_message, TryParseResult};

const WAIT: Duration = Duration::from_secs(5);
const BASE_DN: &str = "dc=com";

pub(crate) struct TestDirectory {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    entries: Vec<String>,
    connections: AtomicUsize,
    requests: AtomicUsize,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
    abandoned: Mutex<Vec<i32>>,
    last_bind_name: Mutex<Option<String>>,
    last_paged_cookie: Mutex<Option<Vec<u8>>>,
}

impl TestDirectory {
    pub const ADMIN_DN: &'static str = "cn=admin,dc=com";
    pub const ADMIN_PASSWORD: &'static str = "secret";
    /// Password of every `cn=userN` entry, accepted for its DN or its mail address.
    pub const USER_PASSWORD: &'static str = "changeit";
    /// Searching this base yields a continuation reference and an empty result.
    pub const REFERRAL_BASE: &'static str = "ou=referral,dc=com";
    /// Searching this base yields an undecodable message before the result.
    pub const GARBAGE_BASE: &'static str = "ou=garbage,dc=com";
    /// Searching this base makes the server drop the connection.
    pub const HANGUP_BASE: &'static str = "ou=hangup,dc=com";
    /// A sync cookie the server answers with e-syncRefreshRequired.
    pub const STALE_COOKIE: &'static [u8] = b"rid=001,csn=stale";

    /// Serve `cn=user0,dc=com` .. `cn=user{n-1},dc=com` on an ephemeral port.
    pub async fn start(entries: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            entries: (0..entries).map(|i| format!("cn=user{},{}", i, BASE_DN)).collect(),
            ..Shared::default()
        });
        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_shared.clone()));
            }
        });
        Self { addr, shared }
    }

    pub fn uri(&self) -> String {
        format!("ldap://{}", self.addr)
    }

    pub fn requests_seen(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub fn binds_seen(&self) -> usize {
        self.shared.binds.load(Ordering::SeqCst)
    }

    pub fn connections_seen(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn last_bind_name(&self) -> Option<String> {
        self.shared.last_bind_name.lock().unwrap().clone()
    }

    pub fn last_paged_cookie(&self) -> Option<Vec<u8>> {
        self.shared.last_paged_cookie.lock().unwrap().clone()
    }

    pub async fn wait_for_unbind(&self) {
        self.wait_until(|s| s.unbinds.load(Ordering::SeqCst) > 0).await;
    }

    pub async fn wait_for_abandon(&self, message_id: i32) {
        self.wait_until(|s| s.abandoned.lock().unwrap().contains(&message_id)).await;
    }

    async fn wait_until(&self, condition: impl Fn(&Shared) -> bool) {
        let waited = tokio::time::timeout(WAIT, async {
            while !condition(&self.shared) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for the test directory");
    }
}

/// Drive the connection until the router holds `outcomes` non-lifecycle events.
pub(crate) async fn collect(conn: &mut Connection<Vec<Event>>, outcomes: usize) -> Vec<Event> {
    let waited = tokio::time::timeout(WAIT, async {
        while outcome_count(conn.router()) < outcomes {
            if !conn.drive().await {
                break;
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {} events: {:?}", outcomes, conn.router());
    conn.router().clone()
}

fn outcome_count(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| !matches!(e, Event::Connected | Event::Disconnected | Event::Reconnected))
        .count()
}

enum Reply {
    Frames(Vec<Vec<u8>>),
    Hangup,
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        match stream.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        while let Ok(TryParseResult::Message(request)) = try_parse_message(&mut buffer) {
            shared.requests.fetch_add(1, Ordering::SeqCst);
            match handle(&shared, request) {
                Reply::Frames(frames) => {
                    if stream.write_all(&frames.concat()).await.is_err() {
                        return;
                    }
                }
                Reply::Hangup => return,
            }
        }
    }
}

fn result(code: i32, diagnostic: &str) -> LdapResult {
    LdapResult::with_code(code, diagnostic)
}

fn frame(message_id: i32, op: ProtocolOp, controls: Vec<Control>) -> Vec<u8> {
    encode_ldap_message(&LdapMessage::new(message_id, op).with_controls(controls))
}

fn handle(shared: &Shared, request: LdapMessage) -> Reply {
    let id = request.message_id;
    let exists = |dn: &str| shared.entries.iter().any(|e| e.eq_ignore_ascii_case(dn));
    let single = |op: ProtocolOp| Reply::Frames(vec![frame(id, op, Vec::new())]);

    match &request.protocol_op {
        ProtocolOp::BindRequest(bind) => {
            shared.binds.fetch_add(1, Ordering::SeqCst);
            *shared.last_bind_name.lock().unwrap() = Some(bind.name.clone());
            let is_user = |name: &str| {
                shared.entries.iter().any(|dn| {
                    dn.eq_ignore_ascii_case(name) || mail_of(dn).eq_ignore_ascii_case(name)
                })
            };
            let accepted = match &bind.authentication {
                BindAuthentication::Simple(pw) => {
                    bind.name.is_empty()
                        || (bind.name == TestDirectory::ADMIN_DN && pw == TestDirectory::ADMIN_PASSWORD)
                        || (is_user(&bind.name) && pw == TestDirectory::USER_PASSWORD)
                }
                BindAuthentication::Sasl { .. } => false,
            };
            let code = if accepted { 0 } else { 49 };
            single(ProtocolOp::BindResponse(BindResponse {
                result: result(code, ""),
                server_sasl_creds: None,
            }))
        }
        ProtocolOp::UnbindRequest => {
            shared.unbinds.fetch_add(1, Ordering::SeqCst);
            Reply::Hangup
        }
        ProtocolOp::AbandonRequest(target) => {
            shared.abandoned.lock().unwrap().push(*target);
            Reply::Frames(Vec::new())
        }
        ProtocolOp::ExtendedRequest(ext) => {
            let code = if ext.request_name == START_TLS_OID { 52 } else { 2 };
            single(ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: result(code, "StartTLS not available"),
                response_name: None,
                response_value: None,
            }))
        }
        ProtocolOp::ModifyRequest(req) => {
            let code = if exists(&req.object) { 0 } else { 32 };
            single(ProtocolOp::ModifyResponse(result(code, "")))
        }
        ProtocolOp::AddRequest(req) => {
            let code = if exists(&req.entry) { 68 } else { 0 };
            single(ProtocolOp::AddResponse(result(code, "")))
        }
        ProtocolOp::DelRequest(req) => {
            let code = if exists(&req.entry) { 0 } else { 32 };
            single(ProtocolOp::DelResponse(result(code, "")))
        }
        ProtocolOp::ModifyDNRequest(req) => {
            let code = if exists(&req.entry) { 0 } else { 32 };
            single(ProtocolOp::ModifyDNResponse(result(code, "")))
        }
        ProtocolOp::SearchRequest(search) => {
            if let Some(sync) = request.find_control(SYNC_REQUEST_OID) {
                return sync_session(shared, id, sync);
            }
            search_reply(shared, id, search, request.controls())
        }
        _ => single(ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: result(2, "unsupported operation"),
            response_name: None,
            response_value: None,
        })),
    }
}

fn common_name(dn: &str) -> &str {
    dn.split(',')
        .next()
        .and_then(|rdn| rdn.strip_prefix("cn="))
        .unwrap_or_default()
}

fn mail_of(dn: &str) -> String {
    format!("{}@example.com", common_name(dn))
}

fn user_entry(dn: &str) -> SearchResultEntry {
    let cn = common_name(dn);
    let attr = |name: &str, values: &[&[u8]]| Attribute {
        attr_type: name.to_string(),
        attr_values: values.iter().map(|v| v.to_vec()).collect(),
    };
    SearchResultEntry {
        object_name: dn.to_string(),
        attributes: vec![
            attr("objectClass", &[b"top", b"person"]),
            attr("cn", &[cn.as_bytes()]),
            attr("mail", &[mail_of(dn).as_bytes()]),
        ],
    }
}

fn search_reply(shared: &Shared, id: i32, search: &SearchRequest, controls: &[Control]) -> Reply {
    let done = |code: i32, matched: &str, controls: Vec<Control>| {
        let mut res = result(code, "");
        res.matched_dn = matched.to_string();
        frame(id, ProtocolOp::SearchResultDone(res), controls)
    };

    match search.base_object.as_str() {
        TestDirectory::HANGUP_BASE => return Reply::Hangup,
        TestDirectory::REFERRAL_BASE => {
            return Reply::Frames(vec![
                frame(
                    id,
                    ProtocolOp::SearchResultReference(vec!["ldap://other.example.com/dc=com".to_string()]),
                    Vec::new(),
                ),
                done(0, "", Vec::new()),
            ])
        }
        TestDirectory::GARBAGE_BASE => {
            let mut writer = BerWriter::new();
            let seq = writer.start_sequence();
            writer.write_integer(id);
            writer.write_tagged_octets(0x7E, &[]);
            writer.end_sequence(seq);
            return Reply::Frames(vec![writer.into_vec(), done(0, "", Vec::new())]);
        }
        _ => {}
    }

    let mut dns: Vec<&String> = if search.base_object.eq_ignore_ascii_case(BASE_DN) {
        shared.entries.iter().collect()
    } else {
        shared
            .entries
            .iter()
            .filter(|e| e.eq_ignore_ascii_case(&search.base_object))
            .collect()
    };
    if dns.is_empty() && !search.base_object.eq_ignore_ascii_case(BASE_DN) {
        return Reply::Frames(vec![done(32, BASE_DN, Vec::new())]);
    }

    let find = |oid: &str| controls.iter().find(|c| c.ctype == oid).and_then(|c| c.value.as_deref());
    let mut response_controls = Vec::new();

    if let Some(value) = find(SORT_REQUEST_OID) {
        let reverse = sort_is_reverse(value);
        dns.sort();
        if reverse {
            dns.reverse();
        }
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_enumerated(0);
        writer.end_sequence(seq);
        response_controls.push(Control::new(SORT_RESPONSE_OID, false, Some(writer.into_vec())));
    }

    let total = dns.len();
    let window: Vec<&String> = if let Some(value) = find(VLV_REQUEST_OID) {
        let (after, target) = parse_vlv_request(value);
        let start = (target.max(1) - 1) as usize;
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_integer(target);
        writer.write_integer(total as i32);
        writer.write_enumerated(0);
        writer.write_octet_string(b"vlv-ctx");
        writer.end_sequence(seq);
        response_controls.push(Control::new(VLV_RESPONSE_OID, false, Some(writer.into_vec())));
        dns.into_iter().skip(start).take(after as usize + 1).collect()
    } else if let Some(value) = find(PAGED_RESULTS_OID) {
        let (size, cookie) = parse_paged_request(value);
        *shared.last_paged_cookie.lock().unwrap() = if cookie.is_empty() { None } else { Some(cookie.clone()) };
        let offset: usize = String::from_utf8_lossy(&cookie).parse().unwrap_or(0);
        let next = offset + size as usize;
        let next_cookie = if next < total { next.to_string().into_bytes() } else { Vec::new() };
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_integer(total as i32);
        writer.write_octet_string(&next_cookie);
        writer.end_sequence(seq);
        response_controls.push(Control::new(PAGED_RESULTS_OID, false, Some(writer.into_vec())));
        dns.into_iter().skip(offset).take(size as usize).collect()
    } else {
        dns
    };

    let mut frames: Vec<Vec<u8>> = window
        .into_iter()
        .map(|dn| frame(id, ProtocolOp::SearchResultEntry(user_entry(dn)), Vec::new()))
        .collect();
    frames.push(done(0, "", response_controls));
    Reply::Frames(frames)
}

fn sort_is_reverse(value: &[u8]) -> bool {
    let mut reader = BerReader::new(value);
    let Ok(mut list) = reader.read_sequence() else {
        return false;
    };
    let Ok(mut key) = list.read_sequence() else {
        return false;
    };
    let _ = key.read_string();
    while let Ok((tag, content)) = key.read_tlv() {
        if tag == 0x81 {
            return content.first().is_some_and(|b| *b != 0);
        }
    }
    false
}

/// (afterCount, target offset)
fn parse_vlv_request(value: &[u8]) -> (i32, i32) {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence().unwrap();
    let _before = seq.read_integer().unwrap();
    let after = seq.read_integer().unwrap();
    let mut by_offset = seq.read_constructed(0xA0).unwrap();
    let target = by_offset.read_integer().unwrap();
    (after, target)
}

fn parse_paged_request(value: &[u8]) -> (i32, Vec<u8>) {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence().unwrap();
    let size = seq.read_integer().unwrap();
    let cookie = seq.read_octet_string().unwrap();
    (size, cookie)
}

fn sync_request_cookie(value: &[u8]) -> Option<Vec<u8>> {
    let mut reader = BerReader::new(value);
    let mut seq = reader.read_sequence().ok()?;
    let _mode = seq.read_enumerated().ok()?;
    if seq.peek_tag() == Some(0x04) {
        seq.read_octet_string().ok()
    } else {
        None
    }
}

fn sync_state_control(state: i32, index: usize, cookie: Option<&[u8]>) -> Control {
    let mut uuid = [0u8; 16];
    uuid[15] = index as u8;
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_enumerated(state);
    writer.write_octet_string(&uuid);
    if let Some(cookie) = cookie {
        writer.write_octet_string(cookie);
    }
    writer.end_sequence(seq);
    Control::new(SYNC_STATE_OID, false, Some(writer.into_vec()))
}

fn sync_info(id: i32, value: Vec<u8>) -> Vec<u8> {
    frame(
        id,
        ProtocolOp::IntermediateResponse(IntermediateResponse {
            response_name: Some(SYNC_INFO_OID.to_string()),
            response_value: Some(value),
        }),
        Vec::new(),
    )
}

/// refreshDelete [1] / refreshPresent [2]
fn refresh_info(tag: u8, cookie: Option<&[u8]>, refresh_done: Option<bool>) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let pos = writer.start_constructed(tag);
    if let Some(cookie) = cookie {
        writer.write_octet_string(cookie);
    }
    if let Some(done) = refresh_done {
        writer.write_boolean(done);
    }
    writer.end_constructed(pos);
    writer.into_vec()
}

fn sync_session(shared: &Shared, id: i32, request: &Control) -> Reply {
    let cookie = request.value.as_deref().and_then(sync_request_cookie);
    if cookie.as_deref() == Some(TestDirectory::STALE_COOKIE) {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_octet_string(b"rid=001,csn=0");
        writer.write_boolean(true);
        writer.end_sequence(seq);
        let done_control = Control::new(SYNC_DONE_OID, false, Some(writer.into_vec()));
        return Reply::Frames(vec![frame(
            id,
            ProtocolOp::SearchResultDone(result(4096, "cookie is stale")),
            vec![done_control],
        )]);
    }

    let mut frames: Vec<Vec<u8>> = shared
        .entries
        .iter()
        .enumerate()
        .map(|(i, dn)| {
            frame(
                id,
                ProtocolOp::SearchResultEntry(user_entry(dn)),
                vec![sync_state_control(1, i, None)],
            )
        })
        .collect();
    frames.push(sync_info(id, refresh_info(0xA1, None, Some(false))));
    frames.push(sync_info(id, refresh_info(0xA2, Some(b"rid=001,csn=1"), None)));
    if let Some(first) = shared.entries.first() {
        frames.push(frame(
            id,
            ProtocolOp::SearchResultEntry(user_entry(first)),
            vec![sync_state_control(2, 0, Some(b"rid=001,csn=2"))],
        ));
    }
    let mut writer = BerWriter::new();
    writer.write_tagged_octets(0x80, b"rid=001,csn=3");
    frames.push(sync_info(id, writer.into_vec()));
    Reply::Frames(frames)
}
