//! STARTTLS negotiation (RFC 6120 §5).

use minidom::Element;
use tracing::{debug, warn};

use crate::feature::{
    CompletedFlags, DataLayerKind, FeatureCategory, StreamContext, StreamFeature,
};
use crate::parser::ns;
use crate::XmppError;

/// Upgrades the stream to TLS when the server offers it.
///
/// The actual TLS handshake belongs to the transport owner; this feature
/// only runs the XML exchange and requests the [`DataLayerKind::Tls`] layer.
#[derive(Default)]
pub struct StartTls;

impl StartTls {
    pub fn new() -> Self {
        Self
    }
}

impl StreamFeature for StartTls {
    fn category(&self) -> FeatureCategory {
        FeatureCategory::SecurityLayer
    }

    fn priority(&self) -> i32 {
        100
    }

    fn advertisement(&self) -> (&'static str, &'static str) {
        ("starttls", ns::TLS)
    }

    fn is_activatable(&self, ctx: &StreamContext, _offer: &Element) -> bool {
        !ctx.secured()
    }

    fn activate(
        &mut self,
        ctx: &mut StreamContext,
        _offer: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        debug!("requesting TLS upgrade");
        let request = Element::builder("starttls", ns::TLS).build();
        ctx.write_element(&request)?;
        Ok(None)
    }

    fn on_element(
        &mut self,
        ctx: &mut StreamContext,
        element: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        if element.is("proceed", ns::TLS) {
            debug!("server accepted TLS upgrade");
            ctx.request_layer(DataLayerKind::Tls);
            Ok(Some(CompletedFlags::RESEND_HEADER))
        } else if element.is("failure", ns::TLS) {
            warn!("server refused TLS upgrade");
            Err(XmppError::feature("server refused STARTTLS"))
        } else {
            Err(XmppError::unexpected(format!(
                "unexpected <{}/> during STARTTLS",
                element.name()
            )))
        }
    }
}
