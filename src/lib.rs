pub mod config;
pub mod connection;
pub mod controls;
pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod events;
pub mod filter;
pub mod ldap_protocol;
pub mod stats;
pub mod sync;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod test_directory;

pub use config::Config;
pub use connection::{ConnectOptions, Connection, ConnectionState, Modification, SearchParams};
pub use controls::{Cookie, PagingMode, ResponseControls, SearchControls};
pub use entry::{Entry, SearchResult};
pub use error::{Error, Result, ServerError};
pub use events::{CallbackRouter, Event, FnRouter, MessageId};
pub use ldap_protocol::SearchScope;
pub use stats::{Stats, StatsSnapshot};
pub use sync::SyncPhase;
