//! Connection Manager: lifecycle of the single directory connection and submission of every
//! operation. Submissions return the message id as soon as the request is written; responses
//! are delivered later by the dispatcher through the connection's [`CallbackRouter`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::ClientConfig;
use tracing::{debug, info, warn};

use crate::controls::{build_request_controls, named_controls, Cookie, PagingMode, SearchControls};
use crate::entry::{Entry, SearchResult};
use crate::error::{Error, Result, ServerError};
use crate::events::{CallbackRouter, Event, MessageId};
use crate::filter::Filter;
use crate::ldap_protocol::{
    AddRequest, Attribute, BindAuthentication, BindRequest, Control, DelRequest, ModifyChange, ModifyDNRequest,
    ModifyOperation, ModifyRequest, ProtocolOp, SearchRequest, SearchScope,
};
use crate::stats::{OpKind, Stats};
use crate::sync::SyncSession;
use crate::tls::{self, TlsOptions};
use crate::transport::{LdapUrl, Transport};

pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    /// Opened; no readiness registration yet.
    Connecting,
    /// Bind submitted and not yet answered.
    Bound,
    /// Readiness registered; responses are being dispatched.
    Active,
}

/// Initialize-time options of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub uri: String,
    pub protocol_version: i32,
    pub network_timeout: Duration,
    /// Negotiate StartTLS right after connecting, before any bind.
    pub start_tls: bool,
    pub tls: TlsOptions,
}

impl ConnectOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            protocol_version: 3,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            start_tls: false,
            tls: TlsOptions::default(),
        }
    }
}

/// One search request. Built with [`SearchParams::new`] and the chained setters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub base: String,
    pub scope: SearchScope,
    /// RFC 4515 string filter.
    pub filter: String,
    /// Empty means all user attributes.
    pub attributes: Vec<String>,
    pub controls: SearchControls,
    pub size_limit: i32,
    pub time_limit: i32,
}

impl SearchParams {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope: SearchScope::WholeSubtree,
            filter: "(objectClass=*)".to_string(),
            attributes: Vec::new(),
            controls: SearchControls::default(),
            size_limit: 0,
            time_limit: 0,
        }
    }

    pub fn scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn attributes<S: Into<String>>(mut self, attributes: impl IntoIterator<Item = S>) -> Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Simple paged results (RFC 2696).
    pub fn paged(mut self, page_size: u32, cookie: Option<Cookie>) -> Self {
        self.controls.paging_mode = PagingMode::SimplePaged;
        self.controls.page_size = page_size;
        self.controls.cookie = cookie;
        self
    }

    /// Virtual list view window starting at the zero-based `offset`.
    pub fn vlv(mut self, page_size: u32, offset: u32, cookie: Option<Cookie>) -> Self {
        self.controls.paging_mode = PagingMode::VirtualListView;
        self.controls.page_size = page_size;
        self.controls.offset = offset;
        self.controls.cookie = cookie;
        self
    }

    pub fn sort(mut self, spec: impl Into<String>) -> Self {
        self.controls.sort = Some(spec.into());
        self
    }

    pub fn control(mut self, name: impl Into<String>) -> Self {
        self.controls.extra_controls.push(name.into());
        self
    }

    pub fn with_controls(mut self, controls: SearchControls) -> Self {
        self.controls = controls;
        self
    }
}

/// Kind of a modification, as named by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModOp(pub ModifyOperation);

impl FromStr for ModOp {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(ModOp(ModifyOperation::Add)),
            "delete" => Ok(ModOp(ModifyOperation::Delete)),
            "replace" => Ok(ModOp(ModifyOperation::Replace)),
            _ => Err(Error::Validation(format!("unknown modification operation {:?}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub op: ModifyOperation,
    pub attr: String,
    pub values: Vec<Vec<u8>>,
}

impl Modification {
    pub fn new(op: ModifyOperation, attr: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            op,
            attr: attr.into(),
            values,
        }
    }

    /// `op` is one of `add`, `delete`, `replace`.
    pub fn parse(op: &str, attr: impl Into<String>, values: Vec<Vec<u8>>) -> Result<Self> {
        let ModOp(op) = op.parse()?;
        Ok(Self::new(op, attr, values))
    }
}

pub struct Connection<R: CallbackRouter> {
    pub(crate) router: R,
    pub(crate) stats: Arc<Stats>,
    pub(crate) state: ConnectionState,
    options: Option<ConnectOptions>,
    url: Option<LdapUrl>,
    tls_config: Option<Arc<ClientConfig>>,
    pub(crate) transport: Option<Transport>,
    /// Message id of the last bind that has not been answered.
    pub(crate) pending_bind: Option<MessageId>,
    pub(crate) sync: Option<SyncSession>,
    /// Cookie of the last finished or stopped sync session.
    pub(crate) last_cookie: Option<Cookie>,
    /// Binds on behalf of `find_and_bind`, opened on first use.
    auth: Option<Box<Connection<Vec<Event>>>>,
    /// Search whose result is kept for the caller instead of routed.
    pub(crate) awaited: Option<MessageId>,
    pub(crate) captured: Option<(Option<ServerError>, SearchResult)>,
}

impl<R: CallbackRouter> Connection<R> {
    pub fn new(router: R) -> Self {
        Self::with_stats(router, Arc::new(Stats::new()))
    }

    pub fn with_stats(router: R, stats: Arc<Stats>) -> Self {
        Self {
            router,
            stats,
            state: ConnectionState::Closed,
            options: None,
            url: None,
            tls_config: None,
            transport: None,
            pending_bind: None,
            sync: None,
            last_cookie: None,
            auth: None,
            awaited: None,
            captured: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    /// True while a live transport is attached.
    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    pub fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls)
    }

    /// Readiness is registered in `Bound` and `Active`.
    pub(crate) fn is_watching(&self) -> bool {
        matches!(self.state, ConnectionState::Bound | ConnectionState::Active)
    }

    /// Initialize the connection. Closes a previously opened one first. The socket is
    /// established on the first submission unless StartTLS is requested, in which case it is
    /// connected and upgraded here.
    pub async fn open(&mut self, options: ConnectOptions) -> Result<()> {
        if self.state != ConnectionState::Closed {
            self.close().await;
        }

        let url = LdapUrl::parse(&options.uri)?;
        if !(2..=3).contains(&options.protocol_version) {
            return Err(Error::Init(format!(
                "Unsupported LDAP protocol version {}",
                options.protocol_version
            )));
        }
        if options.start_tls && url.tls {
            return Err(Error::Init("StartTLS cannot be used with ldaps://".to_string()));
        }
        self.tls_config = if url.tls || options.start_tls {
            Some(tls::client_config(&options.tls).map_err(|e| Error::Init(format!("{:#}", e)))?)
        } else {
            None
        };

        info!(
            "Opening LDAP connection to {} (protocol v{}, timeout {:?}, start_tls={})",
            options.uri, options.protocol_version, options.network_timeout, options.start_tls
        );
        let start_tls = options.start_tls;
        self.url = Some(url);
        self.options = Some(options);
        self.state = ConnectionState::Connecting;

        if start_tls {
            match self.establish().await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.router.route(Event::Connected);
                }
                Err(e) => {
                    self.state = ConnectionState::Closed;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Connect the socket and negotiate StartTLS when configured.
    async fn establish(&self) -> Result<Transport> {
        let (url, options) = match (&self.url, &self.options) {
            (Some(url), Some(options)) => (url, options),
            _ => return Err(Error::NotConnected),
        };
        let transport = Transport::connect(url, options.network_timeout, self.tls_config.clone()).await?;
        if !options.start_tls {
            return Ok(transport);
        }
        let config = self
            .tls_config
            .clone()
            .ok_or_else(|| Error::Tls("No TLS configuration for StartTLS".to_string()))?;
        info!("Negotiating StartTLS with {}", url.host);
        transport.start_tls(&url.host, config, options.network_timeout).await
    }

    async fn ensure_transport(&mut self) -> Result<&mut Transport> {
        if self.transport.is_none() {
            match self.establish().await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.router.route(Event::Connected);
                }
                Err(e) => {
                    self.teardown(&e.to_string());
                    return Err(e);
                }
            }
        }
        self.transport.as_mut().ok_or(Error::NotConnected)
    }

    /// Write one request. A transport failure tears the connection down.
    pub(crate) async fn submit(&mut self, op: ProtocolOp, controls: Vec<Control>, kind: OpKind) -> Result<MessageId> {
        if self.state == ConnectionState::Closed {
            return Err(Error::NotConnected);
        }
        let transport = self.ensure_transport().await?;
        let sent = transport.send(op, controls).await;
        match sent {
            Ok(message_id) => {
                self.stats.inc_request(kind);
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Active;
                }
                Ok(message_id)
            }
            Err(e) => {
                let reason = format!("Send failed: {}", e);
                self.teardown(&reason);
                Err(Error::ServerDown(reason))
            }
        }
    }

    /// Simple bind; anonymous when `dn` and `password` are omitted. Registers readiness.
    pub async fn bind(&mut self, dn: Option<&str>, password: Option<&str>) -> Result<MessageId> {
        let version = self.options.as_ref().map_or(3, |o| o.protocol_version);
        let op = ProtocolOp::BindRequest(BindRequest {
            version,
            name: dn.unwrap_or_default().to_string(),
            authentication: BindAuthentication::Simple(password.unwrap_or_default().to_string()),
        });
        let message_id = self.submit(op, Vec::new(), OpKind::Bind).await?;
        debug!("Bind submitted as message {} for {:?}", message_id, dn.unwrap_or(""));
        self.pending_bind = Some(message_id);
        self.state = ConnectionState::Bound;
        Ok(message_id)
    }

    pub async fn search(&mut self, params: SearchParams) -> Result<MessageId> {
        let filter = Filter::parse(&params.filter)
            .map_err(|e| Error::Validation(format!("invalid filter {:?}: {}", params.filter, e)))?;
        let controls = build_request_controls(&params.controls)?;
        let op = ProtocolOp::SearchRequest(SearchRequest {
            base_object: params.base,
            scope: params.scope,
            deref_aliases: 0,
            size_limit: params.size_limit,
            time_limit: params.time_limit,
            types_only: false,
            filter,
            attributes: params.attributes,
        });
        self.submit(op, controls, OpKind::Search).await
    }

    pub async fn modify(&mut self, dn: &str, changes: Vec<Modification>, controls: &[String]) -> Result<MessageId> {
        if changes.is_empty() {
            return Err(Error::Validation("modify needs at least one change".to_string()));
        }
        if let Some(m) = changes.iter().find(|m| m.attr.is_empty()) {
            return Err(Error::Validation(format!("modification {:?} has no attribute name", m.op)));
        }
        let controls = named_controls(controls)?;
        let op = ProtocolOp::ModifyRequest(ModifyRequest {
            object: dn.to_string(),
            changes: changes
                .into_iter()
                .map(|m| ModifyChange {
                    operation: m.op,
                    modification: Attribute {
                        attr_type: m.attr,
                        attr_values: m.values,
                    },
                })
                .collect(),
        });
        self.submit(op, controls, OpKind::Modify).await
    }

    pub async fn add(
        &mut self,
        dn: &str,
        attributes: Vec<(String, Vec<Vec<u8>>)>,
        controls: &[String],
    ) -> Result<MessageId> {
        if attributes.is_empty() {
            return Err(Error::Validation("add needs at least one attribute".to_string()));
        }
        if attributes.iter().any(|(name, _)| name.is_empty()) {
            return Err(Error::Validation("attribute with an empty name".to_string()));
        }
        let controls = named_controls(controls)?;
        let op = ProtocolOp::AddRequest(AddRequest {
            entry: dn.to_string(),
            attributes: attributes
                .into_iter()
                .map(|(attr_type, attr_values)| Attribute { attr_type, attr_values })
                .collect(),
        });
        self.submit(op, controls, OpKind::Add).await
    }

    pub async fn delete(&mut self, dn: &str, controls: &[String]) -> Result<MessageId> {
        let controls = named_controls(controls)?;
        let op = ProtocolOp::DelRequest(DelRequest { entry: dn.to_string() });
        self.submit(op, controls, OpKind::Delete).await
    }

    /// Rename within the same parent; the old RDN value is removed.
    pub async fn rename(&mut self, dn: &str, new_rdn: &str, controls: &[String]) -> Result<MessageId> {
        if new_rdn.is_empty() {
            return Err(Error::Validation("rename needs a new RDN".to_string()));
        }
        let controls = named_controls(controls)?;
        let op = ProtocolOp::ModifyDNRequest(ModifyDNRequest {
            entry: dn.to_string(),
            newrdn: new_rdn.to_string(),
            delete_old_rdn: true,
            new_superior: None,
        });
        self.submit(op, controls, OpKind::Rename).await
    }

    /// Search for exactly one entry and bind as it on a second connection, so the bind state
    /// of this one is untouched. The bind DN is the first value of the last listed attribute the
    /// entry carries, or else the entry DN.
    pub async fn find_and_bind(&mut self, params: SearchParams, password: &str) -> Result<Entry> {
        if password.is_empty() {
            return Err(Error::Validation("find_and_bind needs a password".to_string()));
        }
        let attributes = params.attributes.clone();
        let message_id = self.search(params).await?;
        self.awaited = Some(message_id);
        let (error, mut entries) = loop {
            if let Some(found) = self.captured.take() {
                break found;
            }
            if !self.drive().await {
                self.awaited = None;
                return Err(Error::ServerDown(format!(
                    "Connection lost before search {} finished",
                    message_id
                )));
            }
        };
        if let Some(err) = error {
            return Err(Error::Operation(err));
        }
        if entries.len() != 1 {
            return Err(Error::Validation(format!(
                "Search returned {} results, expected 1",
                entries.len()
            )));
        }
        let entry = entries.remove(0);
        let dn = attributes
            .iter()
            .rev()
            .find_map(|attr| entry.first_text(attr))
            .unwrap_or(entry.dn.as_str())
            .to_string();

        let auth = match self.auth.take() {
            Some(auth) if auth.state() != ConnectionState::Closed => auth,
            _ => {
                let options = self.options.clone().ok_or(Error::NotConnected)?;
                let mut auth: Box<Connection<Vec<Event>>> = Box::new(Connection::new(Vec::new()));
                auth.open(options).await?;
                auth
            }
        };
        let auth = self.auth.insert(auth);
        let bind_id = auth.bind(Some(&dn), Some(password)).await?;
        let outcome = loop {
            if let Some(pos) = auth.router.iter().position(|e| e.message_id() == Some(bind_id)) {
                break auth.router.remove(pos);
            }
            if !auth.drive().await {
                auth.router.clear();
                return Err(Error::ServerDown(format!("Auth connection lost before bind {} finished", bind_id)));
            }
        };
        auth.router.clear();
        match outcome {
            Event::Result { error: Some(err), .. } => Err(Error::Bind(err)),
            _ => {
                debug!("find_and_bind authenticated {:?}", dn);
                Ok(entry)
            }
        }
    }

    /// Stop any sync session, unbind, and drop the socket along with the `find_and_bind`
    /// connection. No-op when already closed.
    pub async fn close(&mut self) {
        if let Some(mut auth) = self.auth.take() {
            Box::pin(auth.close()).await;
        }
        if self.state == ConnectionState::Closed {
            return;
        }
        self.end_sync();
        // Lazily opened and never connected: nothing was announced, nothing to retract.
        let connected = match self.transport.take() {
            Some(transport) => {
                transport.shutdown().await;
                true
            }
            None => false,
        };
        info!("LDAP connection closed");
        self.reset_closed(connected);
    }

    /// Tear down after a fatal transport failure. Fires exactly one `disconnected`.
    pub(crate) fn teardown(&mut self, reason: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        warn!("LDAP connection lost: {}", reason);
        self.end_sync();
        self.transport = None;
        self.reset_closed(true);
    }

    fn reset_closed(&mut self, notify: bool) {
        self.state = ConnectionState::Closed;
        self.pending_bind = None;
        if notify {
            self.stats.inc_disconnect();
            self.router.route(Event::Disconnected);
        }
    }

    /// Re-establish the socket with the options of the last `open`. The previous bind is not
    /// replayed; callers rebind explicitly.
    pub async fn reconnect(&mut self) -> Result<()> {
        if self.options.is_none() {
            return Err(Error::NotConnected);
        }
        self.end_sync();
        if let Some(old) = self.transport.take() {
            old.shutdown().await;
        }
        if self.state == ConnectionState::Closed {
            self.state = ConnectionState::Connecting;
        }
        match self.establish().await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.pending_bind = None;
                self.state = ConnectionState::Active;
                self.stats.inc_reconnect();
                info!("LDAP connection re-established");
                self.router.route(Event::Reconnected);
                Ok(())
            }
            Err(e) => {
                self.teardown(&e.to_string());
                Err(e)
            }
        }
    }
}
