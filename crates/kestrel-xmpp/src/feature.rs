//! Stream feature abstraction and the shared negotiation context.
//!
//! Each negotiable capability (STARTTLS, SASL, compression, binding) is a
//! [`StreamFeature`] implementation. Features never touch the transport
//! directly; they write through the [`StreamContext`], which also carries
//! the identity and security state that activation decisions depend on.

use std::fmt;
use std::io;
use std::ops::BitOr;

use jid::Jid;
use minidom::Element;
use tracing::trace;

use crate::XmppError;

/// What a feature contributes to the stream, used for ordering and
/// mutual-exclusion decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureCategory {
    /// Transport security (STARTTLS)
    SecurityLayer,
    /// Transport compression (XEP-0138)
    CompressionLayer,
    /// SASL authentication
    SaslAuth,
    /// Pre-SASL jabber:iq:auth authentication (XEP-0078)
    LegacyAuth,
    /// Anything else (resource binding, session, extensions)
    Custom,
}

/// Outcome flags a feature reports when a negotiation step completes.
///
/// Flags combine with `|`; the engine applies them in a fixed order so that
/// e.g. `AUTHORIZED | RESEND_HEADER` records authorization before the
/// restart is requested.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletedFlags(u8);

impl CompletedFlags {
    /// The stream header must be re-sent and features re-read.
    pub const RESEND_HEADER: CompletedFlags = CompletedFlags(1);
    /// The client is now authenticated.
    pub const AUTHORIZED: CompletedFlags = CompletedFlags(2);
    /// Continue with the next feature of the current features set.
    pub const ACTIVATE_NEXT: CompletedFlags = CompletedFlags(4);
    /// Negotiation is finished.
    pub const CONNECTED: CompletedFlags = CompletedFlags(8);
    /// Authentication failed with no path forward.
    pub const AUTHORIZATION_FAILED: CompletedFlags = CompletedFlags(16);

    pub fn empty() -> Self {
        CompletedFlags(0)
    }

    pub fn contains(self, other: CompletedFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CompletedFlags {
    type Output = CompletedFlags;

    fn bitor(self, rhs: CompletedFlags) -> CompletedFlags {
        CompletedFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for CompletedFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (CompletedFlags::RESEND_HEADER, "RESEND_HEADER"),
            (CompletedFlags::AUTHORIZED, "AUTHORIZED"),
            (CompletedFlags::ACTIVATE_NEXT, "ACTIVATE_NEXT"),
            (CompletedFlags::CONNECTED, "CONNECTED"),
            (CompletedFlags::AUTHORIZATION_FAILED, "AUTHORIZATION_FAILED"),
        ];
        let mut set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            set.push("(empty)");
        }
        write!(f, "{}", set.join(" | "))
    }
}

/// A data layer the transport owner must splice into the byte stream before
/// the next stream header goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayerKind {
    Tls,
    ZlibCompression,
}

/// Byte sink for outgoing stream data.
///
/// The negotiation core is transport-agnostic; whoever owns the socket
/// provides the writer.
pub trait StreamWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<(), XmppError>;
}

impl StreamWriter for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), XmppError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Adapter exposing any [`io::Write`] as a [`StreamWriter`].
pub struct IoWriter<W: io::Write>(pub W);

impl<W: io::Write> StreamWriter for IoWriter<W> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), XmppError> {
        self.0.write_all(bytes)?;
        self.0.flush()?;
        Ok(())
    }
}

/// Shared state of one connection attempt, passed to every feature call.
pub struct StreamContext {
    stream_id: Option<String>,
    server: String,
    jid: Jid,
    password: Option<String>,
    writer: Box<dyn StreamWriter + Send>,
    secured: bool,
    compressed: bool,
    authorized: bool,
    pending_layers: Vec<DataLayerKind>,
}

impl StreamContext {
    pub fn new(
        jid: Jid,
        password: Option<String>,
        server: String,
        writer: Box<dyn StreamWriter + Send>,
    ) -> Self {
        Self {
            stream_id: None,
            server,
            jid,
            password,
            writer,
            secured: false,
            compressed: false,
            authorized: false,
            pending_layers: Vec::new(),
        }
    }

    /// Stream ID assigned by the server, if the header carried one.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub(crate) fn set_stream_id(&mut self, id: Option<String>) {
        self.stream_id = id;
    }

    /// Domain the stream is addressed to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Current JID; updated by resource binding.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn set_jid(&mut self, jid: Jid) {
        self.jid = jid;
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Whether a TLS layer is active (or pending activation).
    pub fn secured(&self) -> bool {
        self.secured
    }

    /// Whether a compression layer is active (or pending activation).
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    /// Whether authentication has completed.
    pub fn authorized(&self) -> bool {
        self.authorized
    }

    pub(crate) fn set_authorized(&mut self, authorized: bool) {
        self.authorized = authorized;
    }

    /// Record that a data layer must be inserted into the transport.
    ///
    /// The corresponding state flag flips immediately so re-selection within
    /// the same features round does not offer the layer twice.
    pub fn request_layer(&mut self, kind: DataLayerKind) {
        match kind {
            DataLayerKind::Tls => self.secured = true,
            DataLayerKind::ZlibCompression => self.compressed = true,
        }
        trace!(?kind, "data layer requested");
        self.pending_layers.push(kind);
    }

    /// Take the layers requested since the last call. The transport owner
    /// must splice them in before writing anything else.
    pub fn take_pending_layers(&mut self) -> Vec<DataLayerKind> {
        std::mem::take(&mut self.pending_layers)
    }

    /// Write raw bytes to the stream.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), XmppError> {
        self.writer.write(bytes)
    }

    /// Serialize and write an element.
    pub fn write_element(&mut self, element: &Element) -> Result<(), XmppError> {
        let mut buf = Vec::new();
        element
            .write_to(&mut buf)
            .map_err(|e| XmppError::xml_parse(format!("failed to serialize element: {e}")))?;
        self.writer.write(&buf)
    }
}

/// One negotiable stream capability.
///
/// The flow per feature is: the engine matches the advertisement against a
/// features set, asks [`is_activatable`](StreamFeature::is_activatable),
/// calls [`activate`](StreamFeature::activate) with the offer, and then
/// routes stream elements in the feature's namespaces through
/// [`on_element`](StreamFeature::on_element) until the feature reports
/// completion flags.
pub trait StreamFeature {
    fn category(&self) -> FeatureCategory;

    /// Higher priority features are negotiated first.
    fn priority(&self) -> i32;

    /// (name, namespace) of the advertisement child inside
    /// `<stream:features/>`.
    fn advertisement(&self) -> (&'static str, &'static str);

    /// Namespaces whose top-level stream elements belong to this feature.
    fn namespaces(&self) -> Vec<&'static str> {
        vec![self.advertisement().1]
    }

    /// Whether the feature can run given the current context and offer.
    fn is_activatable(&self, ctx: &StreamContext, offer: &Element) -> bool;

    /// Clear per-stream state ahead of a stream restart.
    fn reset(&mut self) {}

    /// Begin negotiation against the server's offer.
    ///
    /// `Ok(None)` suspends the engine until a server element arrives;
    /// `Ok(Some(flags))` completes the step synchronously.
    fn activate(
        &mut self,
        ctx: &mut StreamContext,
        offer: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError>;

    /// Handle a server element addressed to this feature while it is active.
    fn on_element(
        &mut self,
        _ctx: &mut StreamContext,
        element: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        Err(XmppError::unexpected(format!(
            "feature received unsolicited <{}/>",
            element.name()
        )))
    }
}
