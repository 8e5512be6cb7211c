//! Result Dispatcher: runs on every readiness edge, drains all framed responses without
//! waiting, classifies each once and routes it to the connection's [`CallbackRouter`].

use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionState};
use crate::controls::decode_response_controls;
use crate::entry;
use crate::error::ServerError;
use crate::events::{CallbackRouter, Event};
use crate::ldap_protocol::{ProtocolOp, NOTICE_OF_DISCONNECTION_OID};
use crate::transport::{Incoming, Polled};

/// Response classification, decided once per message at the dispatcher boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    SearchEntry,
    SearchResultTerminal,
    /// Bind, modify, add, delete or rename completion.
    ModifyFamilyResult,
    SearchReference,
    Unknown,
}

impl MessageKind {
    pub fn classify(op: &ProtocolOp) -> Self {
        match op {
            ProtocolOp::SearchResultEntry(_) => MessageKind::SearchEntry,
            ProtocolOp::SearchResultDone(_) => MessageKind::SearchResultTerminal,
            ProtocolOp::BindResponse(_)
            | ProtocolOp::ModifyResponse(_)
            | ProtocolOp::AddResponse(_)
            | ProtocolOp::DelResponse(_)
            | ProtocolOp::ModifyDNResponse(_) => MessageKind::ModifyFamilyResult,
            ProtocolOp::SearchResultReference(_) => MessageKind::SearchReference,
            _ => MessageKind::Unknown,
        }
    }
}

impl<R: CallbackRouter> Connection<R> {
    /// Wait for the next readiness edge. Returns `false` at once when no readiness is registered.
    pub async fn readable(&mut self) -> bool {
        if !self.is_watching() {
            return false;
        }
        match self.transport.as_mut() {
            Some(transport) => {
                transport.readable().await;
                true
            }
            None => false,
        }
    }

    /// Readiness callback: pump the sync session, then drain and route every pending response.
    pub fn on_readable(&mut self) {
        self.sync_poll();
        loop {
            let polled = match self.transport.as_mut() {
                Some(transport) => transport.poll_incoming(),
                None => return,
            };
            match polled {
                Polled::Ready(incoming) => self.dispatch(incoming),
                Polled::Empty => break,
                Polled::Closed => {
                    self.sync_poll();
                    self.teardown("Directory server closed the connection");
                    return;
                }
            }
        }
        // Draining may have framed more sync messages.
        self.sync_poll();
    }

    /// One readiness wait plus dispatch. Returns `false` when there is nothing to wait on.
    pub async fn drive(&mut self) -> bool {
        if !self.readable().await {
            return false;
        }
        self.on_readable();
        true
    }

    fn dispatch(&mut self, incoming: Incoming) {
        let chain = match incoming {
            Incoming::Chain(chain) => chain,
            Incoming::Malformed(message_id) => {
                self.stats.inc_parse_error();
                self.router.route(Event::Error { message_id });
                return;
            }
        };
        let Some(last) = chain.last() else {
            return;
        };
        let message_id = last.message_id;

        match MessageKind::classify(&last.protocol_op) {
            MessageKind::SearchEntry | MessageKind::SearchResultTerminal => {
                let error = last.protocol_op.ldap_result().and_then(ServerError::from_result);
                let (controls, cookie) = decode_response_controls(last.controls());
                let entries = entry::decode(&chain);
                debug!(
                    "Search {} finished with {} entries{}",
                    message_id,
                    entries.len(),
                    if cookie.is_some() { " and a cookie" } else { "" }
                );
                self.stats.inc_result(error.is_some());
                if self.awaited == Some(message_id) {
                    self.awaited = None;
                    self.captured = Some((error, entries));
                    return;
                }
                self.router.route(Event::SearchResult {
                    message_id,
                    error,
                    entries,
                    cookie,
                    controls,
                });
            }
            MessageKind::ModifyFamilyResult => {
                let error = last.protocol_op.ldap_result().and_then(ServerError::from_result);
                if self.pending_bind == Some(message_id) {
                    self.pending_bind = None;
                    if self.state == ConnectionState::Bound {
                        self.state = ConnectionState::Active;
                    }
                    match &error {
                        Some(err) => warn!("Bind {} rejected: {}", message_id, err),
                        None => debug!("Bind {} succeeded", message_id),
                    }
                }
                self.stats.inc_result(error.is_some());
                self.router.route(Event::Result { message_id, error });
            }
            MessageKind::SearchReference => {
                debug!("Ignoring search reference for message {}", message_id);
            }
            MessageKind::Unknown => {
                match &last.protocol_op {
                    ProtocolOp::ExtendedResponse(resp)
                        if resp.response_name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) =>
                    {
                        warn!(
                            "Notice of disconnection from server: {}",
                            resp.result.diagnostic_message
                        );
                    }
                    op => debug!("Unexpected operation 0x{:02x} for message {}", op.tag(), message_id),
                }
                self.stats.inc_result(true);
                self.router.route(Event::Error { message_id });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectOptions, SearchParams};
    use crate::controls::Cookie;
    use crate::events::MessageId;
    use crate::ldap_protocol::{BindResponse, LdapResult};
    use crate::test_directory::{self, TestDirectory};

    async fn bound(dir: &TestDirectory) -> Connection<Vec<Event>> {
        let mut conn = Connection::new(Vec::new());
        conn.open(ConnectOptions::new(dir.uri())).await.unwrap();
        conn.bind(None, None).await.unwrap();
        test_directory::collect(&mut conn, 1).await;
        conn
    }

    fn search_results(events: &[Event]) -> Vec<&Event> {
        events
            .iter()
            .filter(|e| matches!(e, Event::SearchResult { .. }))
            .collect()
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            MessageKind::classify(&ProtocolOp::SearchResultDone(LdapResult::success())),
            MessageKind::SearchResultTerminal
        );
        assert_eq!(
            MessageKind::classify(&ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::success(),
                server_sasl_creds: None,
            })),
            MessageKind::ModifyFamilyResult
        );
        assert_eq!(
            MessageKind::classify(&ProtocolOp::ModifyDNResponse(LdapResult::success())),
            MessageKind::ModifyFamilyResult
        );
        assert_eq!(
            MessageKind::classify(&ProtocolOp::SearchResultReference(vec!["ldap://x/".to_string()])),
            MessageKind::SearchReference
        );
        assert_eq!(
            MessageKind::classify(&ProtocolOp::CompareResponse(LdapResult::success())),
            MessageKind::Unknown
        );
    }

    #[tokio::test]
    async fn test_simple_paging_walks_three_pages() {
        let dir = TestDirectory::start(5).await;
        let mut conn = bound(&dir).await;

        let mut cookie: Option<Cookie> = None;
        let mut pages = Vec::new();
        for page in 1..=3 {
            let id = conn
                .search(SearchParams::new("dc=com").paged(2, cookie.clone()))
                .await
                .unwrap();
            let events = test_directory::collect(&mut conn, 1 + page).await;
            match events.last() {
                Some(Event::SearchResult {
                    message_id,
                    error: None,
                    entries,
                    cookie: next,
                    controls,
                }) => {
                    assert_eq!(*message_id, id);
                    assert_eq!(controls.page.map(|p| p.estimated_count), Some(5));
                    if let (Some(sent), Some(received)) = (cookie.as_ref(), dir.last_paged_cookie()) {
                        // Passed back byte for byte
                        assert_eq!(sent.as_bytes(), received.as_slice());
                    }
                    pages.push((entries.len(), next.is_some()));
                    cookie = next.clone();
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(pages, vec![(2, true), (2, true), (1, false)]);
        assert!(cookie.is_none());
    }

    #[tokio::test]
    async fn test_coalesced_responses_are_all_delivered() {
        let dir = TestDirectory::start(4).await;
        let mut conn = bound(&dir).await;
        let mut ids: Vec<MessageId> = Vec::new();
        for _ in 0..3 {
            ids.push(conn.search(SearchParams::new("dc=com")).await.unwrap());
        }
        let events = test_directory::collect(&mut conn, 4).await;
        let seen: Vec<(MessageId, usize)> = search_results(&events)
            .into_iter()
            .map(|e| match e {
                Event::SearchResult { message_id, entries, .. } => (*message_id, entries.len()),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(seen, ids.iter().map(|id| (*id, 4)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_vlv_with_sort() {
        let dir = TestDirectory::start(5).await;
        let mut conn = bound(&dir).await;
        conn.search(SearchParams::new("dc=com").vlv(2, 1, None).sort("-cn"))
            .await
            .unwrap();
        let events = test_directory::collect(&mut conn, 2).await;
        match events.last() {
            Some(Event::SearchResult {
                entries,
                cookie,
                controls,
                ..
            }) => {
                let dns: Vec<&str> = entries.iter().map(|e| e.dn.as_str()).collect();
                assert_eq!(dns, vec!["cn=user3,dc=com", "cn=user2,dc=com"]);
                let vlv = controls.vlv.unwrap();
                assert_eq!((vlv.offset, vlv.count, vlv.return_code), (1, 5, 0));
                assert_eq!(controls.sort.as_ref().map(|s| s.return_code), Some(0));
                assert!(controls.page.is_none());
                assert_eq!(cookie.as_ref().map(Cookie::as_bytes), Some(&b"vlv-ctx"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_delivered_not_returned() {
        let dir = TestDirectory::start(1).await;
        let mut conn = bound(&dir).await;
        let id = conn.search(SearchParams::new("ou=missing,dc=com")).await.unwrap();
        let events = test_directory::collect(&mut conn, 2).await;
        match events.last() {
            Some(Event::SearchResult {
                message_id,
                error: Some(err),
                entries,
                ..
            }) => {
                assert_eq!(*message_id, id);
                assert_eq!(err.code, 32);
                assert_eq!(err.matched_dn, "dc=com");
                assert!(entries.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reference_ignored_and_undecodable_reported() {
        let dir = TestDirectory::start(1).await;
        let mut conn = bound(&dir).await;
        let ref_id = conn.search(SearchParams::new(TestDirectory::REFERRAL_BASE)).await.unwrap();
        let bad_id = conn.search(SearchParams::new(TestDirectory::GARBAGE_BASE)).await.unwrap();
        let events = test_directory::collect(&mut conn, 4).await;
        let tail: Vec<(&str, Option<MessageId>)> = events[events.len() - 3..]
            .iter()
            .map(|e| (e.name(), e.message_id()))
            .collect();
        assert_eq!(
            tail,
            vec![
                ("searchresult", Some(ref_id)),
                ("error", Some(bad_id)),
                ("searchresult", Some(bad_id)),
            ]
        );
        assert_eq!(conn.stats().snapshot().parse_errors, 1);
    }

    #[tokio::test]
    async fn test_server_close_fires_single_disconnected() {
        let dir = TestDirectory::start(1).await;
        let mut conn = bound(&dir).await;
        conn.search(SearchParams::new(TestDirectory::HANGUP_BASE)).await.unwrap();
        while conn.drive().await {}
        assert_eq!(conn.state(), ConnectionState::Closed);
        let disconnects = conn.router().iter().filter(|e| **e == Event::Disconnected).count();
        assert_eq!(disconnects, 1);
        assert!(!conn.drive().await);
        assert_eq!(
            conn.search(SearchParams::new("dc=com")).await,
            Err(crate::error::Error::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_readable_without_registration() {
        let dir = TestDirectory::start(0).await;
        let mut conn = Connection::new(Vec::new());
        assert!(!conn.readable().await);
        conn.open(ConnectOptions::new(dir.uri())).await.unwrap();
        assert!(!conn.readable().await);
        // Idle dispatch is harmless
        conn.on_readable();
        assert!(conn.router().is_empty());
    }
}
