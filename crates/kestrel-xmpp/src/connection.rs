//! Connection orchestration: parser, engine, and stanza delivery in one
//! place.
//!
//! [`Connection`] owns the incremental parser and the negotiation engine
//! and wires them together: incoming bytes become events, events drive the
//! engine until it reports [`NegotiationState::Connected`], and from then
//! on stanzas flow to the registered [`StanzaConsumer`]s. Stream restarts
//! requested by security and compression layers are handled here, including
//! discarding any bytes the parser buffered past the restart point.

use jid::Jid;
use minidom::Element;
use tracing::{debug, info, warn};

use crate::dispatch::{dispatch, Flow, StreamHandler};
use crate::engine::{EngineAction, NegotiationState, Negotiator};
use crate::feature::{DataLayerKind, StreamContext, StreamFeature, StreamWriter};
use crate::parser::{ns, StreamHeader, XmlParser};
use crate::registry::FeatureRegistry;
use crate::XmppError;

/// Static configuration for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// JID to authenticate and bind as.
    pub jid: Jid,
    /// Password; None disables password authentication.
    pub password: Option<String>,
    /// Domain for the stream 'to' attribute.
    pub server: String,
    /// Reject unknown top-level stream elements instead of skipping them.
    pub strict: bool,
}

impl ConnectionConfig {
    pub fn new(jid: Jid, password: impl Into<String>) -> Self {
        let server = jid.domain().to_string();
        Self {
            jid,
            password: Some(password.into()),
            server,
            strict: false,
        }
    }
}

/// Whether a consumer took ownership of a stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerResult {
    /// Not mine; offer it to the next consumer.
    Continue,
    /// Consumed; stop delivery.
    Handled,
}

/// Receives stanzas once negotiation has completed.
pub trait StanzaConsumer {
    fn on_stanza(&mut self, stanza: &Element) -> ConsumerResult;
}

/// One XMPP client connection, from stream open through negotiation to
/// stanza exchange.
pub struct Connection {
    config: ConnectionConfig,
    parser: XmlParser,
    engine: Negotiator,
    context: StreamContext,
    consumers: Vec<Box<dyn StanzaConsumer + Send>>,
    /// Layers awaiting splicing by the transport owner.
    pending_layers: Vec<DataLayerKind>,
    closed: bool,
}

impl Connection {
    pub fn new(config: ConnectionConfig, writer: Box<dyn StreamWriter + Send>) -> Self {
        let parser = if config.strict {
            XmlParser::strict()
        } else {
            XmlParser::new()
        };
        let context = StreamContext::new(
            config.jid.clone(),
            config.password.clone(),
            config.server.clone(),
            writer,
        );
        Self {
            config,
            parser,
            engine: Negotiator::new(FeatureRegistry::new()),
            context,
            consumers: Vec::new(),
            pending_layers: Vec::new(),
            closed: false,
        }
    }

    /// Register a negotiable feature. Must happen before [`Connection::open`].
    pub fn register_feature(&mut self, feature: Box<dyn StreamFeature + Send>) {
        for namespace in feature.namespaces() {
            self.parser.register_custom_namespace(namespace);
        }
        self.engine.registry_mut().register(feature);
    }

    /// Register a stanza consumer. Consumers run in registration order.
    pub fn register_consumer(&mut self, consumer: Box<dyn StanzaConsumer + Send>) {
        self.consumers.push(consumer);
    }

    /// Send the initial stream header.
    pub fn open(&mut self) -> Result<(), XmppError> {
        info!(server = %self.config.server, "opening stream");
        self.send_header()
    }

    /// Feed bytes read from the transport.
    ///
    /// Drives parsing, negotiation, and stanza delivery. After a call that
    /// triggered a stream restart, check [`Connection::take_pending_layers`]
    /// before reading further from the old byte stream.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<(), XmppError> {
        let events = self.parser.feed(data)?;
        let mut router = Router {
            engine: &mut self.engine,
            context: &mut self.context,
            consumers: &mut self.consumers,
            closed: &mut self.closed,
            restart: false,
        };
        dispatch(events, &mut router)?;
        let restart = router.restart;
        if restart {
            self.restart_stream()?;
        }
        Ok(())
    }

    /// Data layers requested since the last call, in request order.
    pub fn take_pending_layers(&mut self) -> Vec<DataLayerKind> {
        std::mem::take(&mut self.pending_layers)
    }

    /// Send a stanza. Only valid once negotiation has completed.
    pub fn send_stanza(&mut self, stanza: &Element) -> Result<(), XmppError> {
        if !self.engine.is_connected() {
            return Err(XmppError::stream(
                "cannot send stanzas before negotiation completes",
            ));
        }
        self.context.write_element(stanza)
    }

    /// Send the stream close tag.
    pub fn close(&mut self) -> Result<(), XmppError> {
        self.context.write_raw(b"</stream:stream>")
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    /// Whether the server closed its side of the stream.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn state(&self) -> NegotiationState {
        self.engine.state()
    }

    /// Current JID, reflecting any resource binding.
    pub fn jid(&self) -> &Jid {
        self.context.jid()
    }

    /// Stream ID from the most recent server header.
    pub fn stream_id(&self) -> Option<&str> {
        self.context.stream_id()
    }

    fn send_header(&mut self) -> Result<(), XmppError> {
        let header = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' \
             to='{}' version='1.0'>",
            ns::JABBER_CLIENT,
            ns::STREAM,
            self.config.server,
        );
        self.context.write_raw(header.as_bytes())
    }

    /// A security or compression layer completed; re-open the XML document.
    ///
    /// Everything the parser buffered beyond the restart point belongs to
    /// the pre-restart byte stream and is discarded with it.
    fn restart_stream(&mut self) -> Result<(), XmppError> {
        debug!("restarting stream");
        self.pending_layers
            .extend(self.context.take_pending_layers());
        self.engine.reset_features();
        self.parser.reset();
        self.send_header()
    }
}

/// Borrows the disjoint parts of a [`Connection`] so event dispatch can run
/// while the parser stays available for the restart that may follow.
struct Router<'a> {
    engine: &'a mut Negotiator,
    context: &'a mut StreamContext,
    consumers: &'a mut Vec<Box<dyn StanzaConsumer + Send>>,
    closed: &'a mut bool,
    restart: bool,
}

impl Router<'_> {
    fn apply_actions(&mut self, actions: Vec<EngineAction>) -> Flow {
        for action in actions {
            match action {
                EngineAction::RestartStream => {
                    self.restart = true;
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }

    fn deliver(&mut self, stanza: &Element) {
        for consumer in self.consumers.iter_mut() {
            if consumer.on_stanza(stanza) == ConsumerResult::Handled {
                return;
            }
        }
        debug!(stanza = stanza.name(), "stanza not handled by any consumer");
    }
}

impl StreamHandler for Router<'_> {
    fn on_stream_opened(&mut self, header: &StreamHeader) -> Result<Flow, XmppError> {
        self.context.set_stream_id(header.id.clone());
        self.engine.on_stream_opened()?;
        Ok(Flow::Continue)
    }

    fn on_features(&mut self, features: Element) -> Result<Flow, XmppError> {
        let actions = self.engine.on_features(self.context, features)?;
        Ok(self.apply_actions(actions))
    }

    fn on_stanza(&mut self, stanza: Element) -> Result<Flow, XmppError> {
        if self.engine.is_connected() {
            self.deliver(&stanza);
            Ok(Flow::Continue)
        } else {
            // Mid-negotiation the only legitimate stanzas are the iq
            // replies of the active feature.
            let actions = self.engine.on_element(self.context, &stanza)?;
            Ok(self.apply_actions(actions))
        }
    }

    fn on_custom(&mut self, element: Element) -> Result<Flow, XmppError> {
        if self.engine.is_connected() {
            self.deliver(&element);
            Ok(Flow::Continue)
        } else {
            let actions = self.engine.on_element(self.context, &element)?;
            Ok(self.apply_actions(actions))
        }
    }

    fn on_stream_closed(&mut self) -> Result<Flow, XmppError> {
        warn!("server closed the stream");
        *self.closed = true;
        Ok(Flow::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl SharedWriter {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }

        fn clear(&self) {
            self.0.lock().unwrap().clear();
        }
    }

    impl StreamWriter for SharedWriter {
        fn write(&mut self, bytes: &[u8]) -> Result<(), XmppError> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }
    }

    fn connection() -> (Connection, SharedWriter) {
        let writer = SharedWriter::default();
        let config = ConnectionConfig::new("alice@example.com".parse().unwrap(), "secret");
        let conn = Connection::new(config, Box::new(writer.clone()));
        (conn, writer)
    }

    const SERVER_HEADER: &str = "<stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' from='example.com' \
        id='srv-1' version='1.0'>";

    #[test]
    fn config_derives_the_server_from_the_jid() {
        let config = ConnectionConfig::new("alice@example.com/home".parse().unwrap(), "pw");
        assert_eq!(config.server, "example.com");
    }

    #[test]
    fn open_writes_the_stream_header() {
        let (mut conn, writer) = connection();
        conn.open().unwrap();
        let written = writer.contents();
        assert!(written.starts_with("<?xml version='1.0'?><stream:stream"));
        assert!(written.contains("to='example.com'"));
        assert!(written.contains("version='1.0'"));
    }

    #[test]
    fn stream_id_is_captured_from_the_server_header() {
        let (mut conn, _writer) = connection();
        conn.open().unwrap();
        conn.receive_data(SERVER_HEADER.as_bytes()).unwrap();
        assert_eq!(conn.stream_id(), Some("srv-1"));
        assert_eq!(conn.state(), NegotiationState::AwaitingFeatures);
    }

    #[test]
    fn empty_features_when_unauthenticated_is_an_error() {
        let (mut conn, _writer) = connection();
        conn.open().unwrap();
        conn.receive_data(SERVER_HEADER.as_bytes()).unwrap();
        let result = conn.receive_data(b"<stream:features/>");
        assert!(matches!(result, Err(XmppError::NoActivatableFeature)));
    }

    #[test]
    fn stanzas_before_connection_cannot_be_sent() {
        let (mut conn, _writer) = connection();
        let presence = Element::builder("presence", ns::JABBER_CLIENT).build();
        assert!(matches!(
            conn.send_stanza(&presence),
            Err(XmppError::Stream(_))
        ));
    }

    #[test]
    fn server_stream_close_is_recorded() {
        let (mut conn, _writer) = connection();
        conn.open().unwrap();
        conn.receive_data(SERVER_HEADER.as_bytes()).unwrap();
        conn.receive_data(b"</stream:stream>").unwrap();
        assert!(conn.is_closed());
    }

    #[test]
    fn restart_resends_the_header_and_discards_trailing_data() {
        use crate::features::StartTls;

        let (mut conn, writer) = connection();
        conn.register_feature(Box::new(StartTls::new()));
        conn.open().unwrap();
        conn.receive_data(SERVER_HEADER.as_bytes()).unwrap();
        conn.receive_data(
            b"<stream:features><starttls \
              xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>",
        )
        .unwrap();
        writer.clear();

        // The proceed triggers a restart; the trailing garbage after it
        // belongs to the dead pre-TLS stream and must be dropped unseen.
        conn.receive_data(
            b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/><bogus-trailing",
        )
        .unwrap();

        assert_eq!(conn.take_pending_layers(), vec![DataLayerKind::Tls]);
        assert!(writer.contents().starts_with("<?xml version='1.0'?><stream:stream"));
        assert_eq!(conn.state(), NegotiationState::RestartingStream);

        // The fresh stream parses cleanly from its own first byte.
        conn.receive_data(SERVER_HEADER.as_bytes()).unwrap();
        assert_eq!(conn.state(), NegotiationState::AwaitingFeatures);
    }
}
