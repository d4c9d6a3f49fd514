//! Incremental XML parsing for XMPP streams.
//!
//! XMPP uses one long-lived XML document per session, so the parser must
//! tokenize partial data arriving at arbitrary chunk boundaries and keep its
//! state across reads. Completed top-level children of the stream root are
//! materialized as [`minidom::Element`] values and classified into
//! [`StreamEvent`]s; the surrounding byte-level scanning is quote- and
//! CDATA-aware so no token is ever interpreted before it is complete.

use std::collections::HashMap;

use minidom::Element;
use tracing::debug;

use crate::XmppError;

/// Namespace URIs used during connection establishment.
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stream compression advertisement namespace (XEP-0138)
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    /// Stream compression protocol namespace (XEP-0138)
    pub const COMPRESS_PROTOCOL: &str = "http://jabber.org/protocol/compress";
    /// Legacy authentication advertisement namespace (XEP-0078)
    pub const IQ_AUTH_FEATURE: &str = "http://jabber.org/features/iq-auth";
    /// Legacy authentication query namespace (XEP-0078)
    pub const IQ_AUTH: &str = "jabber:iq:auth";
    /// Roster query namespace (RFC 6121)
    pub const ROSTER: &str = "jabber:iq:roster";
}

/// Parsed stream header information.
///
/// The stream open tag is intentionally unclosed XML (its end tag arrives at
/// session end), so its attributes are captured here when the tag completes.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by the server)
    pub id: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Validate the stream header per RFC 6120.
    pub fn validate(&self) -> Result<(), XmppError> {
        if let Some(ref version) = self.version {
            if version != "1.0" {
                return Err(XmppError::stream(format!(
                    "unsupported XMPP version: {version}"
                )));
            }
        }
        Ok(())
    }
}

/// Parser state, driven by element boundaries only.
///
/// `WaitingForStreamOpen` doubles as the resting state between structural
/// elements once the stream is open; whether the stream root has been seen
/// is tracked by the element depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    /// Before the stream open tag, or between structural elements
    #[default]
    WaitingForStreamOpen,
    /// Inside a `<stream:features/>` element
    ReadingFeatures,
    /// Inside a stanza (message, presence, iq)
    ReadingStanza,
    /// Inside a registered custom top-level element
    ReadingCustomElement,
}

/// A completed structural unit of the stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The stream open tag completed; carries its attributes.
    StreamOpened(StreamHeader),
    /// A complete `<stream:features/>` set.
    Features(Element),
    /// A complete stanza (message, presence, iq).
    Stanza(Element),
    /// A complete top-level element in a registered custom namespace
    /// (SASL challenges, STARTTLS proceed, ...).
    Custom(Element),
    /// The stream root end tag; does not imply transport closure.
    StreamClosed,
}

enum Classification {
    Features,
    Stanza,
    Custom,
    Unknown,
}

const STANZA_NAMES: [&str; 3] = ["message", "presence", "iq"];

/// Incremental XML parser for one XMPP stream.
///
/// Bytes go in through [`XmlParser::feed`]; complete structural events come
/// out. [`XmlParser::reset`] discards all buffered and partial state without
/// requiring a new object, which is what a stream restart after STARTTLS or
/// SASL needs.
pub struct XmlParser {
    buffer: Vec<u8>,
    /// Scan offset into `buffer`; everything before it is tokenized.
    pos: usize,
    state: ParserState,
    /// Nesting depth; the stream root sits at depth 1.
    depth: usize,
    /// Start offset of the depth-1 element currently being captured.
    element_start: Option<usize>,
    /// Structurally skipping an unknown depth-1 element.
    skipping: bool,
    /// Qualified name of the stream root, for end-tag checking.
    root_qname: Option<String>,
    /// Default namespace of the stream (from the open tag).
    default_ns: String,
    /// Prefix declarations on the stream root.
    prefixes: HashMap<String, String>,
    /// Namespaces whose top-level elements are reported as `Custom`.
    custom_namespaces: Vec<String>,
    /// Reject unknown top-level elements instead of skipping them.
    strict: bool,
    poisoned: bool,
}

impl XmlParser {
    /// Create a new parser in lax mode.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            pos: 0,
            state: ParserState::WaitingForStreamOpen,
            depth: 0,
            element_start: None,
            skipping: false,
            root_qname: None,
            default_ns: ns::JABBER_CLIENT.to_string(),
            prefixes: HashMap::new(),
            custom_namespaces: Vec::new(),
            strict: false,
            poisoned: false,
        }
    }

    /// Create a parser that rejects unknown top-level elements.
    pub fn strict() -> Self {
        let mut parser = Self::new();
        parser.strict = true;
        parser
    }

    /// Register a namespace whose top-level elements are emitted as
    /// [`StreamEvent::Custom`] instead of being skipped.
    pub fn register_custom_namespace(&mut self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        if !self.custom_namespaces.contains(&namespace) {
            self.custom_namespaces.push(namespace);
        }
    }

    /// Current parser state.
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Current element depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Feed a chunk of arbitrary size and tokenize as much as is complete.
    ///
    /// Events are returned in document order. A structural error poisons the
    /// parser: the same error is returned for every later call and no
    /// further events are emitted.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<StreamEvent>, XmppError> {
        if self.poisoned {
            return Err(XmppError::malformed("parser is in a failed state"));
        }
        self.buffer.extend_from_slice(data);

        let mut events = Vec::new();
        loop {
            match self.step(&mut events) {
                Ok(true) => {}
                Ok(false) => break,
                Err(error) => {
                    self.poisoned = true;
                    return Err(error);
                }
            }
        }
        self.compact();
        Ok(events)
    }

    /// Discard all buffered and partial state and return to
    /// [`ParserState::WaitingForStreamOpen`].
    ///
    /// Custom-namespace registrations and strictness survive; everything
    /// else behaves as if the parser had just been constructed. Required
    /// after a negotiation layer re-opens the XML document over the same
    /// transport.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pos = 0;
        self.state = ParserState::WaitingForStreamOpen;
        self.depth = 0;
        self.element_start = None;
        self.skipping = false;
        self.root_qname = None;
        self.default_ns = ns::JABBER_CLIENT.to_string();
        self.prefixes.clear();
        self.poisoned = false;
    }

    /// Tokenize one construct. Returns Ok(false) when more bytes are needed.
    fn step(&mut self, events: &mut Vec<StreamEvent>) -> Result<bool, XmppError> {
        // Text before the next '<' is only meaningful inside a captured
        // element, where it stays part of the slice; between structural
        // elements it is insignificant whitespace.
        let Some(rel) = self.buffer[self.pos..].iter().position(|&b| b == b'<') else {
            if self.element_start.is_none() {
                self.pos = self.buffer.len();
            }
            return Ok(false);
        };
        let lt = self.pos + rel;
        if lt + 1 >= self.buffer.len() {
            self.pos = lt;
            return Ok(false);
        }

        match self.buffer[lt + 1] {
            b'?' => match find_subslice(&self.buffer, lt + 2, b"?>") {
                Some(end) => {
                    self.pos = end + 2;
                    Ok(true)
                }
                None => {
                    self.pos = lt;
                    Ok(false)
                }
            },
            b'!' => self.skip_markup_decl(lt),
            b'/' => {
                let Some(gt) = self.buffer[lt + 2..]
                    .iter()
                    .position(|&b| b == b'>')
                    .map(|i| lt + 2 + i)
                else {
                    self.pos = lt;
                    return Ok(false);
                };
                let name = String::from_utf8_lossy(&self.buffer[lt + 2..gt])
                    .trim()
                    .to_string();
                self.pos = gt + 1;
                self.on_end_element(&name, gt + 1, events)?;
                Ok(true)
            }
            _ => {
                let Some(gt) = self.find_tag_end(lt) else {
                    self.pos = lt;
                    return Ok(false);
                };
                let self_closing = self.buffer[gt - 1] == b'/';
                self.pos = gt + 1;
                self.on_start_element(lt, gt, self_closing, events)?;
                Ok(true)
            }
        }
    }

    /// Skip a comment, CDATA section, or other markup declaration.
    fn skip_markup_decl(&mut self, lt: usize) -> Result<bool, XmppError> {
        const COMMENT_OPEN: &[u8] = b"<!--";
        const CDATA_OPEN: &[u8] = b"<![CDATA[";

        let rest = &self.buffer[lt..];
        let might_be = |open: &[u8]| rest.len() < open.len() && open.starts_with(rest);
        if might_be(COMMENT_OPEN) || might_be(CDATA_OPEN) {
            self.pos = lt;
            return Ok(false);
        }

        let close: &[u8] = if rest.starts_with(COMMENT_OPEN) {
            b"-->"
        } else if rest.starts_with(CDATA_OPEN) {
            b"]]>"
        } else {
            b">"
        };
        match find_subslice(&self.buffer, lt + 2, close) {
            Some(end) => {
                self.pos = end + close.len();
                Ok(true)
            }
            None => {
                self.pos = lt;
                Ok(false)
            }
        }
    }

    /// Quote-aware scan for the '>' closing the tag opened at `lt`.
    fn find_tag_end(&self, lt: usize) -> Option<usize> {
        let mut quote: Option<u8> = None;
        for (i, &b) in self.buffer.iter().enumerate().skip(lt + 1) {
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None => match b {
                    b'"' | b'\'' => quote = Some(b),
                    b'>' => return Some(i),
                    _ => {}
                },
            }
        }
        None
    }

    fn on_start_element(
        &mut self,
        lt: usize,
        gt: usize,
        self_closing: bool,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), XmppError> {
        let inner_end = if self_closing { gt - 1 } else { gt };
        let raw = std::str::from_utf8(&self.buffer[lt + 1..inner_end])
            .map_err(|_| XmppError::malformed("tag is not valid UTF-8"))?;
        let (qname, attrs) = parse_tag(raw)?;

        match self.depth {
            0 => {
                self.open_stream(&qname, &attrs, events)?;
                if self_closing {
                    self.depth = 0;
                    events.push(StreamEvent::StreamClosed);
                }
            }
            1 => {
                self.open_child(lt, &qname, &attrs)?;
                self.depth = 2;
                if self_closing {
                    self.on_end_element(&qname, gt + 1, events)?;
                }
            }
            _ => {
                self.depth += 1;
                if self_closing {
                    self.depth -= 1;
                }
            }
        }
        Ok(())
    }

    /// Handle the depth-0 open tag, which must be the stream root.
    fn open_stream(
        &mut self,
        qname: &str,
        attrs: &[(String, String)],
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), XmppError> {
        for (key, value) in attrs {
            if key == "xmlns" {
                self.default_ns = value.clone();
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                self.prefixes.insert(prefix.to_string(), value.clone());
            }
        }

        let (prefix, local) = split_qname(qname);
        let resolved = self.resolve_namespace(prefix, attrs);
        if local != "stream" || resolved.as_deref() != Some(ns::STREAM) {
            return Err(XmppError::unexpected(format!(
                "document root is <{qname}>, expected the stream open tag"
            )));
        }

        let mut header = StreamHeader::default();
        for (key, value) in attrs {
            match key.as_str() {
                "to" => header.to = Some(value.clone()),
                "from" => header.from = Some(value.clone()),
                "id" => header.id = Some(value.clone()),
                "version" => header.version = Some(value.clone()),
                "xml:lang" => header.lang = Some(value.clone()),
                _ => {}
            }
        }
        header.validate()?;

        debug!(from = ?header.from, id = ?header.id, "stream opened");
        self.root_qname = Some(qname.to_string());
        self.depth = 1;
        events.push(StreamEvent::StreamOpened(header));
        Ok(())
    }

    /// Handle a depth-1 open tag: classify and start capturing, or skip.
    fn open_child(
        &mut self,
        lt: usize,
        qname: &str,
        attrs: &[(String, String)],
    ) -> Result<(), XmppError> {
        let (prefix, local) = split_qname(qname);
        let namespace = self.resolve_namespace(prefix, attrs).unwrap_or_default();

        match self.classify(local, &namespace) {
            Classification::Features => {
                self.state = ParserState::ReadingFeatures;
                self.element_start = Some(lt);
            }
            Classification::Stanza => {
                self.state = ParserState::ReadingStanza;
                self.element_start = Some(lt);
            }
            Classification::Custom => {
                self.state = ParserState::ReadingCustomElement;
                self.element_start = Some(lt);
            }
            Classification::Unknown => {
                if self.strict {
                    return Err(XmppError::unexpected(format!(
                        "unknown top-level element <{qname}> in namespace '{namespace}'"
                    )));
                }
                debug!(element = qname, namespace, "skipping unknown top-level element");
                self.skipping = true;
                self.element_start = None;
            }
        }
        Ok(())
    }

    fn on_end_element(
        &mut self,
        qname: &str,
        end_pos: usize,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), XmppError> {
        if self.depth == 0 {
            return Err(XmppError::malformed(format!(
                "end tag </{qname}> without a matching start tag"
            )));
        }
        self.depth -= 1;

        if self.skipping {
            if self.depth == 1 {
                self.skipping = false;
            }
            return Ok(());
        }

        match self.depth {
            0 => {
                if self.strict && self.root_qname.as_deref() != Some(qname) {
                    return Err(XmppError::malformed(format!(
                        "stream closed by mismatched end tag </{qname}>"
                    )));
                }
                self.state = ParserState::WaitingForStreamOpen;
                debug!("stream closed by peer");
                events.push(StreamEvent::StreamClosed);
            }
            1 => {
                if let Some(start) = self.element_start.take() {
                    let element = self.materialize(start, end_pos)?;
                    let event = match self.state {
                        ParserState::ReadingFeatures => StreamEvent::Features(element),
                        ParserState::ReadingStanza => StreamEvent::Stanza(element),
                        ParserState::ReadingCustomElement => StreamEvent::Custom(element),
                        ParserState::WaitingForStreamOpen => {
                            return Err(XmppError::malformed(
                                "element completed while no element was being read",
                            ));
                        }
                    };
                    self.state = ParserState::WaitingForStreamOpen;
                    events.push(event);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn classify(&self, local: &str, namespace: &str) -> Classification {
        if local == "features" && namespace == ns::STREAM {
            Classification::Features
        } else if STANZA_NAMES.contains(&local) && namespace == self.default_ns {
            Classification::Stanza
        } else if self.custom_namespaces.iter().any(|n| n == namespace) {
            Classification::Custom
        } else {
            Classification::Unknown
        }
    }

    fn resolve_namespace(&self, prefix: Option<&str>, attrs: &[(String, String)]) -> Option<String> {
        match prefix {
            Some(p) => {
                let key = format!("xmlns:{p}");
                attrs
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.clone())
                    .or_else(|| self.prefixes.get(p).cloned())
            }
            None => attrs
                .iter()
                .find(|(k, _)| k == "xmlns")
                .map(|(_, v)| v.clone())
                .or_else(|| Some(self.default_ns.clone())),
        }
    }

    /// Materialize a completed depth-1 slice as a [`minidom::Element`].
    ///
    /// Namespace declarations inherited from the stream root are re-injected
    /// so the slice parses standalone.
    fn materialize(&self, start: usize, end: usize) -> Result<Element, XmppError> {
        let slice = std::str::from_utf8(&self.buffer[start..end])
            .map_err(|_| XmppError::malformed("element is not valid UTF-8"))?;
        let qualified = self.qualify(slice)?;
        qualified
            .parse::<Element>()
            .map_err(|e| XmppError::xml_parse(format!("failed to parse element: {e}")))
    }

    fn qualify(&self, slice: &str) -> Result<String, XmppError> {
        let bytes = slice.as_bytes();
        let mut quote: Option<u8> = None;
        let mut gt = None;
        for (i, &b) in bytes.iter().enumerate() {
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None => match b {
                    b'"' | b'\'' => quote = Some(b),
                    b'>' => {
                        gt = Some(i);
                        break;
                    }
                    _ => {}
                },
            }
        }
        let gt = gt.ok_or_else(|| XmppError::malformed("element slice has no closing '>'"))?;
        let root_tag = &slice[..gt];

        let name_end = root_tag[1..]
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
            .map(|i| i + 1)
            .unwrap_or(root_tag.len());
        let (prefix, _) = split_qname(&root_tag[1..name_end]);

        let declaration = match prefix {
            Some(p) => {
                if root_tag.contains(&format!("xmlns:{p}=")) {
                    None
                } else {
                    self.prefixes
                        .get(p)
                        .map(|uri| format!(" xmlns:{p}='{uri}'"))
                }
            }
            None => {
                if root_tag.contains("xmlns=") || root_tag.contains("xmlns'") {
                    None
                } else {
                    Some(format!(" xmlns='{}'", self.default_ns))
                }
            }
        };

        Ok(match declaration {
            Some(decl) => {
                let insert_at = if gt > 0 && bytes[gt - 1] == b'/' { gt - 1 } else { gt };
                let mut out = String::with_capacity(slice.len() + decl.len());
                out.push_str(&slice[..insert_at]);
                out.push_str(&decl);
                out.push_str(&slice[insert_at..]);
                out
            }
            None => slice.to_string(),
        })
    }

    /// Drop tokenized bytes once nothing is being captured.
    fn compact(&mut self) {
        if self.element_start.is_none() && self.pos > 0 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_subslice(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

/// Parse the inside of a start tag into its qualified name and attributes.
fn parse_tag(raw: &str) -> Result<(String, Vec<(String, String)>), XmppError> {
    let raw = raw.trim();
    let name_end = raw
        .find(|c: char| c.is_whitespace())
        .unwrap_or(raw.len());
    let qname = raw[..name_end].to_string();
    if qname.is_empty() {
        return Err(XmppError::malformed("start tag has no name"));
    }

    let mut attrs = Vec::new();
    let mut rest = raw[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| XmppError::malformed(format!("bad attribute syntax in <{qname}>")))?;
        let key = rest[..eq].trim_end().to_string();
        rest = rest[eq + 1..].trim_start();
        let quote = rest
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| XmppError::malformed(format!("unquoted attribute value in <{qname}>")))?;
        let value_end = rest[1..]
            .find(quote)
            .map(|i| i + 1)
            .ok_or_else(|| XmppError::malformed(format!("unterminated attribute value in <{qname}>")))?;
        attrs.push((key, unescape(&rest[1..value_end])));
        rest = rest[value_end + 1..].trim_start();
    }
    Ok((qname, attrs))
}

/// Resolve the five predefined XML entities in an attribute value.
fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' from='example.com' \
        id='stream-1' version='1.0'>";

    fn feed_all(parser: &mut XmlParser, data: &str) -> Vec<StreamEvent> {
        parser.feed(data.as_bytes()).expect("feed should succeed")
    }

    #[test]
    fn stream_header_attributes_are_captured() {
        let mut parser = XmlParser::new();
        let events = feed_all(&mut parser, HEADER);

        assert_eq!(events.len(), 1);
        let StreamEvent::StreamOpened(header) = &events[0] else {
            panic!("expected StreamOpened");
        };
        assert_eq!(header.from.as_deref(), Some("example.com"));
        assert_eq!(header.id.as_deref(), Some("stream-1"));
        assert_eq!(header.version.as_deref(), Some("1.0"));
    }

    #[test]
    fn unsupported_stream_version_is_rejected() {
        let mut parser = XmlParser::new();
        let result = parser.feed(
            b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' version='2.0'>",
        );
        assert!(matches!(result, Err(XmppError::Stream(_))));
    }

    #[test]
    fn non_stream_document_root_is_a_protocol_error() {
        let mut parser = XmlParser::new();
        let result = parser.feed(b"<html xmlns='http://www.w3.org/1999/xhtml'>");
        assert!(matches!(result, Err(XmppError::UnexpectedElement(_))));
    }

    #[test]
    fn features_element_completes_as_one_event() {
        let mut parser = XmlParser::new();
        feed_all(&mut parser, HEADER);
        let events = feed_all(
            &mut parser,
            "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'>\
             <required/></starttls></stream:features>",
        );

        assert_eq!(events.len(), 1);
        let StreamEvent::Features(features) = &events[0] else {
            panic!("expected Features");
        };
        assert!(features.get_child("starttls", ns::TLS).is_some());
    }

    #[test]
    fn stanza_inherits_the_stream_default_namespace() {
        let mut parser = XmlParser::new();
        feed_all(&mut parser, HEADER);
        let events = feed_all(
            &mut parser,
            "<message to='bob@example.com' type='chat'><body>Hello!</body></message>",
        );

        assert_eq!(events.len(), 1);
        let StreamEvent::Stanza(stanza) = &events[0] else {
            panic!("expected Stanza");
        };
        assert!(stanza.is("message", ns::JABBER_CLIENT));
        assert_eq!(stanza.attr("to"), Some("bob@example.com"));
        assert_eq!(
            stanza
                .get_child("body", ns::JABBER_CLIENT)
                .map(|b| b.text()),
            Some("Hello!".to_string())
        );
    }

    #[test]
    fn custom_namespace_elements_are_reported_as_custom() {
        let mut parser = XmlParser::new();
        parser.register_custom_namespace(ns::SASL);
        feed_all(&mut parser, HEADER);
        let events = feed_all(
            &mut parser,
            "<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>cmVhbG0=</challenge>",
        );

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Custom(el) if el.name() == "challenge"));
    }

    #[test]
    fn self_closing_top_level_element_completes_immediately() {
        let mut parser = XmlParser::new();
        parser.register_custom_namespace(ns::TLS);
        feed_all(&mut parser, HEADER);
        let events = feed_all(
            &mut parser,
            "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>",
        );

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Custom(el) if el.name() == "proceed"));
    }

    #[test]
    fn unknown_top_level_element_is_skipped_in_lax_mode() {
        let mut parser = XmlParser::new();
        feed_all(&mut parser, HEADER);
        let events = feed_all(
            &mut parser,
            "<mystery xmlns='urn:example:future'><deep><deeper/></deep></mystery>\
             <presence/>",
        );

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Stanza(el) if el.name() == "presence"));
    }

    #[test]
    fn unknown_top_level_element_errors_in_strict_mode() {
        let mut parser = XmlParser::strict();
        feed_all(&mut parser, HEADER);
        let result = parser.feed(b"<mystery xmlns='urn:example:future'/>");
        assert!(matches!(result, Err(XmppError::UnexpectedElement(_))));
    }

    #[test]
    fn depth_underflow_is_fatal_and_poisons_the_parser() {
        let mut parser = XmlParser::new();
        feed_all(&mut parser, HEADER);
        feed_all(&mut parser, "</stream:stream>");

        let result = parser.feed(b"</stream:stream>");
        assert!(matches!(result, Err(XmppError::MalformedDocument(_))));

        // No further events after a fatal error.
        let result = parser.feed(b"<presence/>");
        assert!(matches!(result, Err(XmppError::MalformedDocument(_))));
    }

    #[test]
    fn stream_close_is_reported_without_closing_anything_else() {
        let mut parser = XmlParser::new();
        feed_all(&mut parser, HEADER);
        let events = feed_all(&mut parser, "<presence/></stream:stream>");

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Stanza(_)));
        assert!(matches!(&events[1], StreamEvent::StreamClosed));
    }

    #[test]
    fn attribute_values_may_contain_markup_characters() {
        let mut parser = XmlParser::new();
        feed_all(&mut parser, HEADER);
        let events = feed_all(
            &mut parser,
            "<message from='a@example.com' note='1 > 0'><body>ok</body></message>",
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Stanza(_)));
    }

    #[test]
    fn chunk_boundary_independence() {
        let doc = format!(
            "{HEADER}<stream:features><mechanisms \
             xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism>\
             </mechanisms></stream:features><iq type='result' id='x'/>\
             <message to='bob@example.com'><body>héllo</body></message></stream:stream>"
        );

        let mut reference = XmlParser::new();
        let expected: Vec<String> = reference
            .feed(doc.as_bytes())
            .expect("one-shot feed should succeed")
            .iter()
            .map(describe)
            .collect();
        assert_eq!(
            expected,
            vec![
                "open",
                "features",
                "stanza:iq",
                "stanza:message",
                "closed"
            ]
        );

        // Every two-way split yields the same event sequence.
        let bytes = doc.as_bytes();
        for split in 0..=bytes.len() {
            let mut parser = XmlParser::new();
            let mut got = Vec::new();
            for chunk in [&bytes[..split], &bytes[split..]] {
                got.extend(
                    parser
                        .feed(chunk)
                        .unwrap_or_else(|e| panic!("split at {split} failed: {e}"))
                        .iter()
                        .map(describe),
                );
            }
            assert_eq!(got, expected, "split at byte {split}");
        }

        // Byte-at-a-time feeding as the degenerate case.
        let mut parser = XmlParser::new();
        let mut got = Vec::new();
        for byte in bytes {
            got.extend(
                parser
                    .feed(std::slice::from_ref(byte))
                    .expect("byte-wise feed should succeed")
                    .iter()
                    .map(describe),
            );
        }
        assert_eq!(got, expected);
    }

    fn describe(event: &StreamEvent) -> String {
        match event {
            StreamEvent::StreamOpened(_) => "open".to_string(),
            StreamEvent::Features(_) => "features".to_string(),
            StreamEvent::Stanza(el) => format!("stanza:{}", el.name()),
            StreamEvent::Custom(el) => format!("custom:{}", el.name()),
            StreamEvent::StreamClosed => "closed".to_string(),
        }
    }

    #[test]
    fn reset_behaves_like_a_fresh_parser() {
        let mut parser = XmlParser::new();
        feed_all(&mut parser, HEADER);
        // Leave a partial stanza in the buffer, then restart.
        feed_all(&mut parser, "<message><body>half-");
        parser.reset();

        assert_eq!(parser.state(), ParserState::WaitingForStreamOpen);
        assert_eq!(parser.depth(), 0);

        let events = feed_all(&mut parser, HEADER);
        assert!(matches!(&events[0], StreamEvent::StreamOpened(_)));
        let events = feed_all(&mut parser, "<presence/>");
        assert!(matches!(&events[0], StreamEvent::Stanza(_)));
    }

    #[test]
    fn reset_clears_a_poisoned_parser() {
        let mut parser = XmlParser::new();
        assert!(parser.feed(b"</boom>").is_err());
        parser.reset();
        let events = feed_all(&mut parser, HEADER);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn cdata_and_comments_do_not_confuse_depth_tracking() {
        let mut parser = XmlParser::new();
        feed_all(&mut parser, HEADER);
        let events = feed_all(
            &mut parser,
            "<!-- keepalive --><message><body><![CDATA[a < b > c]]></body></message>",
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Stanza(_)));
    }

    #[test]
    fn stream_prefixed_child_is_qualified_for_materialization() {
        // <stream:features/> carries no local xmlns declaration; the parser
        // must re-inject the prefix binding from the stream root.
        let mut parser = XmlParser::new();
        feed_all(&mut parser, HEADER);
        let events = feed_all(&mut parser, "<stream:features/>");
        assert_eq!(events.len(), 1);
        let StreamEvent::Features(el) = &events[0] else {
            panic!("expected Features");
        };
        assert_eq!(el.name(), "features");
        assert_eq!(el.ns(), ns::STREAM);
    }
}
