//! Event dispatch for parsed stream events.

use minidom::Element;

use crate::parser::{StreamEvent, StreamHeader};
use crate::XmppError;

/// Whether dispatch should keep delivering the remaining events of a batch.
///
/// A handler returns [`Flow::Stop`] when the stream context has changed
/// underneath the batch, typically because a negotiation step requires a
/// stream restart and everything parsed after it belongs to the old stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receiver for the structural events of one stream.
pub trait StreamHandler {
    fn on_stream_opened(&mut self, header: &StreamHeader) -> Result<Flow, XmppError>;

    fn on_features(&mut self, features: Element) -> Result<Flow, XmppError>;

    fn on_stanza(&mut self, stanza: Element) -> Result<Flow, XmppError>;

    fn on_custom(&mut self, element: Element) -> Result<Flow, XmppError>;

    fn on_stream_closed(&mut self) -> Result<Flow, XmppError>;
}

/// Deliver a batch of events in order, stopping early if a handler asks to.
pub fn dispatch<H: StreamHandler>(
    events: Vec<StreamEvent>,
    handler: &mut H,
) -> Result<(), XmppError> {
    for event in events {
        let flow = match event {
            StreamEvent::StreamOpened(header) => handler.on_stream_opened(&header)?,
            StreamEvent::Features(features) => handler.on_features(features)?,
            StreamEvent::Stanza(stanza) => handler.on_stanza(stanza)?,
            StreamEvent::Custom(element) => handler.on_custom(element)?,
            StreamEvent::StreamClosed => handler.on_stream_closed()?,
        };
        if flow == Flow::Stop {
            break;
        }
    }
    Ok(())
}
