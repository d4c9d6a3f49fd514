//! SASL authentication (RFC 6120 §6).
//!
//! Mechanism selection prefers SCRAM-SHA-256 over SCRAM-SHA-1 over PLAIN,
//! constrained to what the server offers. The challenge/response loop runs
//! through the `sasl` crate's mechanism implementations.

use std::collections::HashSet;

use base64::prelude::*;
use minidom::Element;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tracing::{debug, warn};

use crate::feature::{CompletedFlags, FeatureCategory, StreamContext, StreamFeature};
use crate::parser::ns;
use crate::XmppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SelectedMechanism {
    fn name(self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
        }
    }
}

/// Strongest first.
const MECHANISM_PREFERENCE: [SelectedMechanism; 3] = [
    SelectedMechanism::ScramSha256,
    SelectedMechanism::ScramSha1,
    SelectedMechanism::Plain,
];

fn select_mechanism(offered: &HashSet<String>) -> Option<SelectedMechanism> {
    MECHANISM_PREFERENCE
        .into_iter()
        .find(|m| offered.contains(m.name()))
}

fn build_mechanism(
    selected: SelectedMechanism,
    credentials: Credentials,
) -> Result<Box<dyn Mechanism + Send>, XmppError> {
    let mechanism: Box<dyn Mechanism + Send> = match selected {
        SelectedMechanism::ScramSha256 => Box::new(
            Scram::<Sha256>::from_credentials(credentials)
                .map_err(|e| XmppError::feature(format!("SCRAM-SHA-256 setup failed: {e:?}")))?,
        ),
        SelectedMechanism::ScramSha1 => Box::new(
            Scram::<Sha1>::from_credentials(credentials)
                .map_err(|e| XmppError::feature(format!("SCRAM-SHA-1 setup failed: {e:?}")))?,
        ),
        SelectedMechanism::Plain => Box::new(
            Plain::from_credentials(credentials)
                .map_err(|e| XmppError::feature(format!("PLAIN setup failed: {e:?}")))?,
        ),
    };
    Ok(mechanism)
}

fn offered_mechanisms(offer: &Element) -> HashSet<String> {
    offer
        .children()
        .filter(|c| c.name() == "mechanism")
        .map(|c| c.text())
        .collect()
}

/// SASL stream feature.
#[derive(Default)]
pub struct SaslAuth {
    mechanism: Option<Box<dyn Mechanism + Send>>,
}

impl SaslAuth {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamFeature for SaslAuth {
    fn category(&self) -> FeatureCategory {
        FeatureCategory::SaslAuth
    }

    fn priority(&self) -> i32 {
        50
    }

    fn advertisement(&self) -> (&'static str, &'static str) {
        ("mechanisms", ns::SASL)
    }

    fn is_activatable(&self, ctx: &StreamContext, offer: &Element) -> bool {
        if ctx.authorized() || ctx.password().is_none() || ctx.jid().node().is_none() {
            return false;
        }
        select_mechanism(&offered_mechanisms(offer)).is_some()
    }

    fn reset(&mut self) {
        self.mechanism = None;
    }

    fn activate(
        &mut self,
        ctx: &mut StreamContext,
        offer: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        let offered = offered_mechanisms(offer);
        let selected = select_mechanism(&offered)
            .ok_or_else(|| XmppError::feature("no mutually supported SASL mechanism"))?;
        debug!(mechanism = selected.name(), "starting SASL authentication");

        let username = ctx
            .jid()
            .node()
            .ok_or_else(|| XmppError::feature("cannot authenticate a bare domain JID"))?
            .to_string();
        let password = ctx
            .password()
            .ok_or_else(|| XmppError::feature("no password available"))?
            .to_string();
        let credentials = Credentials::default()
            .with_username(username)
            .with_password(password)
            .with_channel_binding(ChannelBinding::Unsupported);

        let mut mechanism = build_mechanism(selected, credentials)?;
        let initial = mechanism
            .initial();
        let payload = if initial.is_empty() {
            "=".to_string()
        } else {
            BASE64_STANDARD.encode(&initial)
        };
        let auth = Element::builder("auth", ns::SASL)
            .attr("mechanism", selected.name())
            .append(payload)
            .build();
        ctx.write_element(&auth)?;
        self.mechanism = Some(mechanism);
        Ok(None)
    }

    fn on_element(
        &mut self,
        ctx: &mut StreamContext,
        element: &Element,
    ) -> Result<Option<CompletedFlags>, XmppError> {
        let mechanism = self
            .mechanism
            .as_mut()
            .ok_or_else(|| XmppError::feature("SASL element without an active mechanism"))?;

        if element.is("challenge", ns::SASL) {
            let data = decode_payload(&element.text())?;
            let response = mechanism
                .response(&data)
                .map_err(|e| XmppError::authorization(format!("SASL step failed: {e:?}")))?;
            let reply = Element::builder("response", ns::SASL)
                .append(BASE64_STANDARD.encode(&response))
                .build();
            ctx.write_element(&reply)?;
            Ok(None)
        } else if element.is("success", ns::SASL) {
            let data = decode_payload(&element.text())?;
            mechanism
                .success(&data)
                .map_err(|e| XmppError::authorization(format!("server proof rejected: {e:?}")))?;
            debug!("SASL authentication succeeded");
            self.mechanism = None;
            Ok(Some(CompletedFlags::AUTHORIZED | CompletedFlags::RESEND_HEADER))
        } else if element.is("failure", ns::SASL) {
            let condition = element
                .children()
                .next()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "not-authorized".to_string());
            warn!(condition, "SASL authentication failed");
            self.mechanism = None;
            Err(XmppError::authorization(condition))
        } else {
            Err(XmppError::unexpected(format!(
                "unexpected <{}/> during SASL",
                element.name()
            )))
        }
    }
}

fn decode_payload(text: &str) -> Result<Vec<u8>, XmppError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(trimmed)
        .map_err(|e| XmppError::authorization(format!("bad base64 in SASL payload: {e}")))
}
