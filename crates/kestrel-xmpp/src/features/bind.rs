//! Resource binding (RFC 6120 §7).
//!
//! Runs after authentication. Requests the resource from the configured JID
//! if one is set, otherwise lets the server generate one, and updates the
//! context JID with whatever the server confirms.

use jid::{FullJid, Jid};
use minidom::Element;
use tracing::{debug, warn};

use crate::feature::{CompletedFlags, FeatureCategory, StreamContext, StreamFeature};
use crate::parser::ns;
use crate::XmppError;

const BIND_REQUEST_ID: &str = "resource-bind";

/// Resource binding feature.
#[derive(Default)]
pub struct ResourceBind {
    bound: bool,
}

impl ResourceBind {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamFeature for ResourceBind {
    fn category(&self) -> FeatureCategory {
        FeatureCategory::Custom
    }

    fn priority(&self) -> i32 {
        10
    }

    fn advertisement(&self) -> (&'static str, &'static str) {
        ("bind", ns::BIND)
    }

    fn namespaces(&self) -> Vec<&'static str> {
        // The bind result arrives as an iq stanza, not a custom element.
        Vec::new()
    }

    fn is_activatable(&self, ctx: &StreamContext, _offer: &Element) -> bool {
        ctx.authorized() && !self.bound
    }

    fn reset(&mut self) {
        // Binding survives restarts; a bound resource stays bound.
    }

    fn activate(
        &mut self,
        ctx: &mut StreamContext,
        _offer: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        let mut bind = Element::builder("bind", ns::BIND);
        if let Some(resource) = ctx.jid().resource() {
            debug!(%resource, "requesting resource binding");
            bind = bind.append(
                Element::builder("resource", ns::BIND)
                    .append(resource.as_str())
                    .build(),
            );
        } else {
            debug!("requesting server-generated resource");
        }
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .attr("id", BIND_REQUEST_ID)
            .append(bind.build())
            .build();
        ctx.write_element(&iq)?;
        Ok(None)
    }

    fn on_element(
        &mut self,
        ctx: &mut StreamContext,
        element: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        if element.name() != "iq" || element.attr("id") != Some(BIND_REQUEST_ID) {
            return Err(XmppError::unexpected(format!(
                "unexpected <{}/> during resource binding",
                element.name()
            )));
        }
        match element.attr("type") {
            Some("result") => {
                let jid_text = element
                    .get_child("bind", ns::BIND)
                    .and_then(|bind| bind.get_child("jid", ns::BIND))
                    .map(|jid| jid.text())
                    .ok_or_else(|| {
                        XmppError::feature("bind result is missing the bound JID")
                    })?;
                let full: FullJid = jid_text
                    .trim()
                    .parse()
                    .map_err(|e| XmppError::feature(format!("bad bound JID: {e}")))?;
                debug!(jid = %full, "resource bound");
                ctx.set_jid(Jid::from(full));
                self.bound = true;
                Ok(Some(CompletedFlags::ACTIVATE_NEXT))
            }
            Some("error") => {
                let condition = element
                    .get_child("error", ns::JABBER_CLIENT)
                    .and_then(|e| e.children().next())
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| "undefined-condition".to_string());
                warn!(condition, "resource binding failed");
                Err(XmppError::feature(format!(
                    "resource binding failed: {condition}"
                )))
            }
            _ => Err(XmppError::unexpected(
                "bind iq with an unexpected type".to_string(),
            )),
        }
    }
}
