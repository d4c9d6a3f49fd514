//! XMPP connection establishment: incremental stream parsing and stream
//! feature negotiation (RFC 6120).
//!
//! The crate is transport-agnostic. Bytes from the server go into a
//! [`Connection`] through [`Connection::receive_data`]; outgoing bytes leave
//! through the [`StreamWriter`] the caller provides. TLS and compression
//! handshakes themselves are the transport owner's job; the connection
//! reports which data layers to splice in via
//! [`Connection::take_pending_layers`].
//!
//! ```no_run
//! use kestrel_xmpp::{Connection, ConnectionConfig, IoWriter};
//! use kestrel_xmpp::features::{ResourceBind, SaslAuth, StartTls};
//!
//! # fn main() -> Result<(), kestrel_xmpp::XmppError> {
//! let config = ConnectionConfig::new("alice@example.com".parse().unwrap(), "secret");
//! let socket = std::net::TcpStream::connect("example.com:5222")?;
//! let mut conn = Connection::new(config, Box::new(IoWriter(socket)));
//! conn.register_feature(Box::new(StartTls::new()));
//! conn.register_feature(Box::new(SaslAuth::new()));
//! conn.register_feature(Box::new(ResourceBind::new()));
//! conn.open()?;
//! // read from the socket and feed conn.receive_data(..) until connected
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod feature;
pub mod features;
pub mod parser;
pub mod registry;
pub mod roster;

pub use connection::{Connection, ConnectionConfig, ConsumerResult, StanzaConsumer};
pub use dispatch::{dispatch, Flow, StreamHandler};
pub use engine::{EngineAction, NegotiationState, Negotiator};
pub use error::XmppError;
pub use feature::{
    CompletedFlags, DataLayerKind, FeatureCategory, IoWriter, StreamContext, StreamFeature,
    StreamWriter,
};
pub use parser::{ns, ParserState, StreamEvent, StreamHeader, XmlParser};
pub use registry::FeatureRegistry;
pub use roster::{RosterItem, RosterManager, Subscription};
