//! Callback Router: the fixed set of sinks every lifecycle change and decoded response is
//! delivered to.
//!
//! A router only has to accept [`Event`] values; it must not block, because it is called from
//! the dispatcher on the single task that owns the connection. An unbounded channel sender is
//! the usual choice.

use tokio::sync::mpsc;
use tracing::debug;

use crate::controls::{Cookie, EntryState, ResponseControls};
use crate::entry::{Entry, SearchResult};
use crate::error::ServerError;
use crate::sync::SyncPhase;

/// Protocol message id returned by every submission and echoed by its responses.
pub type MessageId = i32;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Disconnected,
    Reconnected,
    /// Completion of bind, modify, add, delete or rename.
    Result {
        message_id: MessageId,
        error: Option<ServerError>,
    },
    /// Terminal result of a search with every entry that preceded it.
    SearchResult {
        message_id: MessageId,
        error: Option<ServerError>,
        entries: SearchResult,
        cookie: Option<Cookie>,
        controls: ResponseControls,
    },
    SyncEntry {
        entry: Entry,
        uuid: String,
        state: EntryState,
    },
    SyncIntermediate {
        cookie: Option<Cookie>,
        phase: SyncPhase,
        /// Entry UUIDs of a syncIdSet message; empty otherwise.
        uuids: Vec<String>,
    },
    SyncResult {
        entries: SearchResult,
        refresh_deletes: bool,
        error: Option<ServerError>,
    },
    /// A response that could not be decoded or has no known type.
    Error { message_id: MessageId },
}

impl Event {
    /// Sink name.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected => "connected",
            Event::Disconnected => "disconnected",
            Event::Reconnected => "reconnected",
            Event::Result { .. } => "result",
            Event::SearchResult { .. } => "searchresult",
            Event::SyncEntry { .. } => "syncentry",
            Event::SyncIntermediate { .. } => "syncintermediate",
            Event::SyncResult { .. } => "syncresult",
            Event::Error { .. } => "error",
        }
    }

    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Event::Result { message_id, .. }
            | Event::SearchResult { message_id, .. }
            | Event::Error { message_id } => Some(*message_id),
            _ => None,
        }
    }
}

pub trait CallbackRouter {
    fn route(&mut self, event: Event);
}

impl CallbackRouter for mpsc::UnboundedSender<Event> {
    fn route(&mut self, event: Event) {
        let name = event.name();
        if self.send(event).is_err() {
            debug!("Event receiver dropped, discarding {} event", name);
        }
    }
}

/// Collects events in memory.
impl CallbackRouter for Vec<Event> {
    fn route(&mut self, event: Event) {
        self.push(event);
    }
}

impl<R: CallbackRouter + ?Sized> CallbackRouter for Box<R> {
    fn route(&mut self, event: Event) {
        (**self).route(event);
    }
}

/// Adapts a closure into a router.
pub struct FnRouter<F>(pub F);

impl<F: FnMut(Event)> CallbackRouter for FnRouter<F> {
    fn route(&mut self, event: Event) {
        (self.0)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_router_delivers_in_order() {
        let (mut tx, mut rx) = mpsc::unbounded_channel();
        tx.route(Event::Connected);
        tx.route(Event::Error { message_id: 3 });
        assert_eq!(rx.try_recv().unwrap(), Event::Connected);
        assert_eq!(rx.try_recv().unwrap().message_id(), Some(3));
    }

    #[test]
    fn test_dropped_receiver_is_not_fatal() {
        let (mut tx, rx) = mpsc::unbounded_channel::<Event>();
        drop(rx);
        tx.route(Event::Disconnected);
    }

    #[test]
    fn test_fn_router() {
        let mut names = Vec::new();
        {
            let mut router = FnRouter(|e: Event| names.push(e.name()));
            router.route(Event::Reconnected);
            router.route(Event::Result {
                message_id: 1,
                error: None,
            });
        }
        assert_eq!(names, vec!["reconnected", "result"]);
    }
}
