//! Sync Engine: RFC 4533 content synchronization in refreshAndPersist mode.
//!
//! The session is a search whose message id the transport routes to a dedicated queue. The
//! phase starts at `Refresh` and moves to `Persist` once, when a syncInfo message reports
//! `refreshDone`. The cookie follows every sync state, syncInfo and sync done value that
//! carries one, and outlives the session so a later start can resume from it.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::controls::{
    decode_sync_done, decode_sync_info, decode_sync_state, sync_request_control, Cookie, SyncDoneValue, SyncInfo,
    SyncMode, SYNC_DONE_OID, SYNC_INFO_OID, SYNC_STATE_OID,
};
use crate::entry;
use crate::error::{Error, Result, ServerError};
use crate::events::{CallbackRouter, Event, MessageId};
use crate::filter::Filter;
use crate::ldap_protocol::{LdapMessage, ProtocolOp, SearchRequest, SearchScope};
use crate::stats::OpKind;
use crate::transport::{Polled, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Initial reconciliation of the content.
    Refresh,
    /// Live change notification.
    Persist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    pub message_id: MessageId,
    pub phase: SyncPhase,
    pub cookie: Option<Cookie>,
}

impl<R: CallbackRouter> Connection<R> {
    /// Start a refreshAndPersist session, resuming from `cookie` when given. Any previous
    /// session is stopped first.
    pub async fn sync_start(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        cookie: Option<Cookie>,
    ) -> Result<MessageId> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let filter = Filter::parse(filter)
            .map_err(|e| Error::Validation(format!("invalid filter {:?}: {}", filter, e)))?;
        self.sync_stop().await;

        let control = sync_request_control(SyncMode::RefreshAndPersist, cookie.as_ref(), false);
        let op = ProtocolOp::SearchRequest(SearchRequest {
            base_object: base.to_string(),
            scope,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: vec!["*".to_string()],
        });
        let message_id = self.submit(op, vec![control], OpKind::Search).await?;
        if let Some(transport) = self.transport.as_mut() {
            transport.claim_sync(message_id);
        }
        info!("Sync session started as message {} on {:?}", message_id, base);
        self.sync = Some(SyncSession {
            message_id,
            phase: SyncPhase::Refresh,
            cookie,
        });
        Ok(message_id)
    }

    /// Deliver every sync message the transport holds. No-op without a session.
    pub fn sync_poll(&mut self) {
        while self.sync.is_some() {
            let polled = match self.transport.as_mut() {
                Some(transport) => transport.poll_sync(),
                None => break,
            };
            match polled {
                Polled::Ready(msg) => self.handle_sync_message(msg),
                Polled::Empty => break,
                // Framed responses of other operations go through the dispatcher before teardown.
                Polled::Closed if self.transport.as_ref().is_some_and(Transport::has_ready) => break,
                Polled::Closed => {
                    self.teardown("Directory server closed the connection during sync");
                    break;
                }
            }
        }
    }

    /// Abandon the session on a live connection, or just release it when the connection is gone.
    pub async fn sync_stop(&mut self) {
        let Some(session) = self.sync.as_ref() else {
            return;
        };
        let message_id = session.message_id;
        if let Some(transport) = self.transport.as_mut().filter(|t| !t.is_closed()) {
            let sent = transport.send(ProtocolOp::AbandonRequest(message_id), Vec::new()).await;
            match sent {
                Ok(_) => self.stats.inc_request(OpKind::Other),
                Err(e) => debug!("Abandon of sync message {} failed: {}", message_id, e),
            }
        }
        info!("Sync session {} stopped", message_id);
        self.end_sync();
    }

    /// Release the session without talking to the server; the cookie is kept.
    pub(crate) fn end_sync(&mut self) {
        if let Some(session) = self.sync.take() {
            if session.cookie.is_some() {
                self.last_cookie = session.cookie;
            }
            if let Some(transport) = self.transport.as_mut() {
                transport.release_sync();
            }
        }
    }

    /// Most recent cookie of the current or last session.
    pub fn cookie(&self) -> Option<&Cookie> {
        self.sync
            .as_ref()
            .and_then(|s| s.cookie.as_ref())
            .or(self.last_cookie.as_ref())
    }

    pub fn sync_phase(&self) -> Option<SyncPhase> {
        self.sync.as_ref().map(|s| s.phase)
    }

    fn handle_sync_message(&mut self, msg: LdapMessage) {
        let Some(session) = self.sync.as_mut() else {
            return;
        };
        let message_id = msg.message_id;
        match &msg.protocol_op {
            ProtocolOp::SearchResultEntry(wire) => {
                let state = msg
                    .find_control(SYNC_STATE_OID)
                    .and_then(|c| c.value.as_deref())
                    .ok_or_else(|| anyhow::anyhow!("entry {:?} without sync state control", wire.object_name))
                    .and_then(decode_sync_state);
                match state {
                    Ok(state) => {
                        if state.cookie.is_some() {
                            session.cookie = state.cookie;
                        }
                        self.stats.inc_sync_entry();
                        self.router.route(Event::SyncEntry {
                            entry: entry::decode_entry(wire),
                            uuid: state.entry_uuid,
                            state: state.state,
                        });
                    }
                    Err(e) => {
                        warn!("Undecodable sync entry in message {}: {}", message_id, e);
                        self.stats.inc_parse_error();
                        self.router.route(Event::Error { message_id });
                    }
                }
            }
            ProtocolOp::IntermediateResponse(resp) if resp.response_name.as_deref() == Some(SYNC_INFO_OID) => {
                let info = resp
                    .response_value
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("syncInfo without value"))
                    .and_then(decode_sync_info);
                match info {
                    Ok(info) => {
                        if let Some(cookie) = info.cookie() {
                            session.cookie = Some(cookie.clone());
                        }
                        if info.ends_refresh() && session.phase == SyncPhase::Refresh {
                            session.phase = SyncPhase::Persist;
                            info!("Sync session {} refresh complete, persisting", message_id);
                        }
                        let uuids = match info {
                            SyncInfo::SyncIdSet { uuids, .. } => uuids,
                            _ => Vec::new(),
                        };
                        self.router.route(Event::SyncIntermediate {
                            cookie: session.cookie.clone(),
                            phase: session.phase,
                            uuids,
                        });
                    }
                    Err(e) => {
                        warn!("Undecodable syncInfo in message {}: {}", message_id, e);
                        self.stats.inc_parse_error();
                        self.router.route(Event::Error { message_id });
                    }
                }
            }
            ProtocolOp::SearchResultDone(result) => {
                let done = match msg.find_control(SYNC_DONE_OID).and_then(|c| c.value.as_deref()) {
                    Some(value) => decode_sync_done(value).unwrap_or_else(|e| {
                        warn!("Ignoring malformed sync done control: {}", e);
                        SyncDoneValue::default()
                    }),
                    None => SyncDoneValue::default(),
                };
                if done.cookie.is_some() {
                    session.cookie = done.cookie;
                }
                let error = ServerError::from_result(result);
                if let Some(err) = &error {
                    warn!("Sync session {} ended: {}", message_id, err);
                } else {
                    info!("Sync session {} ended", message_id);
                }
                self.stats.inc_result(error.is_some());
                self.router.route(Event::SyncResult {
                    entries: entry::decode(std::slice::from_ref(&msg)),
                    refresh_deletes: done.refresh_deletes,
                    error,
                });
                self.end_sync();
            }
            ProtocolOp::SearchResultReference(_) => {
                debug!("Ignoring search reference in sync session {}", message_id);
            }
            other => {
                warn!("Unexpected operation 0x{:02x} in sync session {}", other.tag(), message_id);
                self.router.route(Event::Error { message_id });
            }
        }
    }
}
