//! Stream compression negotiation (XEP-0138).
//!
//! Only the zlib method is negotiated. As with TLS, the compression codec
//! itself is spliced in by the transport owner; this feature runs the XML
//! exchange and requests the data layer.

use minidom::Element;
use tracing::{debug, warn};

use crate::feature::{
    CompletedFlags, DataLayerKind, FeatureCategory, StreamContext, StreamFeature,
};
use crate::parser::ns;
use crate::XmppError;

const METHOD: &str = "zlib";

fn offers_zlib(offer: &Element) -> bool {
    offer
        .children()
        .filter(|c| c.name() == "method")
        .any(|c| c.text() == METHOD)
}

/// Zlib stream compression feature.
#[derive(Default)]
pub struct Compression {
    /// The server refused compression on this stream; do not offer again,
    /// or re-selection would pick this feature forever.
    declined: bool,
}

impl Compression {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamFeature for Compression {
    fn category(&self) -> FeatureCategory {
        FeatureCategory::CompressionLayer
    }

    fn priority(&self) -> i32 {
        20
    }

    fn advertisement(&self) -> (&'static str, &'static str) {
        ("compression", ns::COMPRESS_FEATURE)
    }

    fn namespaces(&self) -> Vec<&'static str> {
        // The advertisement and the protocol use different namespaces.
        vec![ns::COMPRESS_PROTOCOL]
    }

    fn is_activatable(&self, ctx: &StreamContext, offer: &Element) -> bool {
        !ctx.compressed() && !self.declined && offers_zlib(offer)
    }

    fn reset(&mut self) {
        self.declined = false;
    }

    fn activate(
        &mut self,
        ctx: &mut StreamContext,
        _offer: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        debug!(method = METHOD, "requesting stream compression");
        let request = Element::builder("compress", ns::COMPRESS_PROTOCOL)
            .append(
                Element::builder("method", ns::COMPRESS_PROTOCOL)
                    .append(METHOD)
                    .build(),
            )
            .build();
        ctx.write_element(&request)?;
        Ok(None)
    }

    fn on_element(
        &mut self,
        ctx: &mut StreamContext,
        element: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        if element.is("compressed", ns::COMPRESS_PROTOCOL) {
            debug!("server accepted stream compression");
            ctx.request_layer(DataLayerKind::ZlibCompression);
            Ok(Some(CompletedFlags::RESEND_HEADER))
        } else if element.is("failure", ns::COMPRESS_PROTOCOL) {
            // Compression is an optimization; fall through to the next
            // feature rather than tearing the stream down.
            warn!("server refused stream compression, continuing without it");
            self.declined = true;
            Ok(Some(CompletedFlags::ACTIVATE_NEXT))
        } else {
            Err(XmppError::unexpected(format!(
                "unexpected <{}/> during compression negotiation",
                element.name()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> StreamContext {
        StreamContext::new(
            "alice@example.com".parse().unwrap(),
            Some("secret".to_string()),
            "example.com".to_string(),
            Box::new(Vec::new()),
        )
    }

    fn offer(methods: &[&str]) -> Element {
        let mut builder = Element::builder("compression", ns::COMPRESS_FEATURE);
        for method in methods {
            builder = builder.append(
                Element::builder("method", ns::COMPRESS_FEATURE)
                    .append(*method)
                    .build(),
            );
        }
        builder.build()
    }

    #[test]
    fn only_zlib_offers_are_activatable() {
        let feature = Compression::new();
        let ctx = context();
        assert!(feature.is_activatable(&ctx, &offer(&["zlib"])));
        assert!(feature.is_activatable(&ctx, &offer(&["lzw", "zlib"])));
        assert!(!feature.is_activatable(&ctx, &offer(&["lzw"])));
        assert!(!feature.is_activatable(&ctx, &offer(&[])));
    }

    #[test]
    fn not_activatable_once_compressed() {
        let feature = Compression::new();
        let mut ctx = context();
        ctx.request_layer(DataLayerKind::ZlibCompression);
        assert!(!feature.is_activatable(&ctx, &offer(&["zlib"])));
    }

    #[test]
    fn compressed_requests_the_layer_and_a_restart() {
        let mut feature = Compression::new();
        let mut ctx = context();
        feature.activate(&mut ctx, &offer(&["zlib"])).unwrap();

        let compressed: Element =
            "<compressed xmlns='http://jabber.org/protocol/compress'/>"
                .parse()
                .unwrap();
        let flags = feature.on_element(&mut ctx, &compressed).unwrap().unwrap();
        assert!(flags.contains(CompletedFlags::RESEND_HEADER));
        assert_eq!(
            ctx.take_pending_layers(),
            vec![DataLayerKind::ZlibCompression]
        );
    }

    #[test]
    fn failure_is_not_fatal() {
        let mut feature = Compression::new();
        let mut ctx = context();
        feature.activate(&mut ctx, &offer(&["zlib"])).unwrap();

        let failure: Element = "<failure xmlns='http://jabber.org/protocol/compress'>\
             <setup-failed/></failure>"
            .parse()
            .unwrap();
        let flags = feature.on_element(&mut ctx, &failure).unwrap().unwrap();
        assert!(flags.contains(CompletedFlags::ACTIVATE_NEXT));
        assert!(ctx.take_pending_layers().is_empty());
    }

    #[test]
    fn refusal_stops_reoffering_until_the_next_stream() {
        let mut feature = Compression::new();
        let mut ctx = context();
        feature.activate(&mut ctx, &offer(&["zlib"])).unwrap();

        let failure: Element = "<failure xmlns='http://jabber.org/protocol/compress'>\
             <unsupported-method/></failure>"
            .parse()
            .unwrap();
        feature.on_element(&mut ctx, &failure).unwrap();

        // Re-selection within the same round must skip this feature, or it
        // would be picked again ahead of lower-priority features.
        assert!(!feature.is_activatable(&ctx, &offer(&["zlib"])));

        // A stream restart clears the refusal.
        feature.reset();
        assert!(feature.is_activatable(&ctx, &offer(&["zlib"])));
    }
}
