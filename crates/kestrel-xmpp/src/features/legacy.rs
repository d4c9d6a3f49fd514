//! Legacy jabber:iq:auth authentication (XEP-0078).
//!
//! Pre-SASL servers advertise `<auth/>` in the iq-auth namespace. The
//! exchange is two iq round trips: a get to learn the required fields and a
//! set carrying username, plaintext password, and resource. Unlike SASL,
//! success does not restart the stream.

use minidom::Element;
use tracing::{debug, warn};

use crate::feature::{CompletedFlags, FeatureCategory, StreamContext, StreamFeature};
use crate::parser::ns;
use crate::XmppError;

const FIELDS_REQUEST_ID: &str = "legacy-auth-fields";
const SUBMIT_REQUEST_ID: &str = "legacy-auth-submit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    AwaitingFields,
    AwaitingResult,
}

/// Legacy authentication feature.
#[derive(Default)]
pub struct LegacyAuth {
    phase: Phase,
}

impl LegacyAuth {
    pub fn new() -> Self {
        Self::default()
    }

    fn submit(&mut self, ctx: &mut StreamContext) -> Result<(), XmppError> {
        let username = ctx
            .jid()
            .node()
            .ok_or_else(|| XmppError::feature("cannot authenticate a bare domain JID"))?
            .to_string();
        let password = ctx
            .password()
            .ok_or_else(|| XmppError::feature("no password available"))?
            .to_string();
        let resource = ctx
            .jid()
            .resource()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "kestrel".to_string());

        let query = Element::builder("query", ns::IQ_AUTH)
            .append(Element::builder("username", ns::IQ_AUTH).append(username).build())
            .append(Element::builder("password", ns::IQ_AUTH).append(password).build())
            .append(Element::builder("resource", ns::IQ_AUTH).append(resource).build())
            .build();
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .attr("id", SUBMIT_REQUEST_ID)
            .append(query)
            .build();
        ctx.write_element(&iq)?;
        self.phase = Phase::AwaitingResult;
        Ok(())
    }
}

impl StreamFeature for LegacyAuth {
    fn category(&self) -> FeatureCategory {
        FeatureCategory::LegacyAuth
    }

    fn priority(&self) -> i32 {
        40
    }

    fn advertisement(&self) -> (&'static str, &'static str) {
        ("auth", ns::IQ_AUTH_FEATURE)
    }

    fn namespaces(&self) -> Vec<&'static str> {
        // Both round trips are iq stanzas.
        Vec::new()
    }

    fn is_activatable(&self, ctx: &StreamContext, _offer: &Element) -> bool {
        !ctx.authorized()
            && ctx.password().is_some()
            && ctx.jid().node().is_some()
            && self.phase == Phase::Idle
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
    }

    fn activate(
        &mut self,
        ctx: &mut StreamContext,
        _offer: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        let username = ctx
            .jid()
            .node()
            .ok_or_else(|| XmppError::feature("cannot authenticate a bare domain JID"))?
            .to_string();
        debug!(username, "starting legacy authentication");

        let query = Element::builder("query", ns::IQ_AUTH)
            .append(Element::builder("username", ns::IQ_AUTH).append(username).build())
            .build();
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "get")
            .attr("id", FIELDS_REQUEST_ID)
            .append(query)
            .build();
        ctx.write_element(&iq)?;
        self.phase = Phase::AwaitingFields;
        Ok(None)
    }

    fn on_element(
        &mut self,
        ctx: &mut StreamContext,
        element: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        if element.name() != "iq" {
            return Err(XmppError::unexpected(format!(
                "unexpected <{}/> during legacy authentication",
                element.name()
            )));
        }
        match (element.attr("id"), element.attr("type")) {
            (Some(FIELDS_REQUEST_ID), Some("result")) => {
                let query = element
                    .get_child("query", ns::IQ_AUTH)
                    .ok_or_else(|| XmppError::feature("field response without a query"))?;
                if query.get_child("password", ns::IQ_AUTH).is_none() {
                    warn!("server does not accept plaintext legacy authentication");
                    return Err(XmppError::feature(
                        "server offers no supported legacy auth field",
                    ));
                }
                self.submit(ctx)?;
                Ok(None)
            }
            (Some(SUBMIT_REQUEST_ID), Some("result")) => {
                debug!("legacy authentication succeeded");
                self.phase = Phase::Idle;
                // The legacy flow does not restart the stream.
                Ok(Some(CompletedFlags::AUTHORIZED | CompletedFlags::ACTIVATE_NEXT))
            }
            (Some(FIELDS_REQUEST_ID | SUBMIT_REQUEST_ID), Some("error")) => {
                let condition = element
                    .get_child("error", ns::JABBER_CLIENT)
                    .and_then(|e| e.children().next())
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| "not-authorized".to_string());
                warn!(condition, "legacy authentication failed");
                Err(XmppError::authorization(condition))
            }
            _ => Err(XmppError::unexpected(
                "iq unrelated to legacy authentication".to_string(),
            )),
        }
    }
}
