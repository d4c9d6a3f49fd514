//! The feature negotiation engine.
//!
//! Drives registered [`StreamFeature`]s against the feature sets a server
//! advertises, one feature at a time, honoring priorities and the completion
//! flags each feature reports. The engine is sans-IO: it mutates the
//! [`StreamContext`] and returns [`EngineAction`]s for the transport owner
//! to carry out.

use minidom::Element;
use tracing::{debug, warn};

use crate::feature::{CompletedFlags, StreamContext};
use crate::registry::FeatureRegistry;
use crate::XmppError;

/// Where negotiation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    /// Waiting for the server's stream open tag.
    #[default]
    AwaitingStreamOpen,
    /// Stream is open; waiting for `<stream:features/>`.
    AwaitingFeatures,
    /// A feature is mid-negotiation and expects server elements.
    ActivatingFeature,
    /// A feature requested a stream restart; waiting for the caller to
    /// re-send the header.
    RestartingStream,
    /// Negotiation finished; the stream carries stanzas now.
    Connected,
    /// Negotiation failed terminally.
    Failed,
}

/// Side effect the transport owner must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    /// Splice in any pending data layers, reset the parser, and re-send the
    /// stream header.
    RestartStream,
}

enum StepOutcome {
    Done,
    SelectNext,
}

/// Drives feature negotiation for one connection attempt.
pub struct Negotiator {
    registry: FeatureRegistry,
    state: NegotiationState,
    /// Index of the feature currently mid-activation.
    active: Option<usize>,
    /// The features set currently being worked through.
    round: Option<Element>,
}

impl Negotiator {
    pub fn new(registry: FeatureRegistry) -> Self {
        Self {
            registry,
            state: NegotiationState::AwaitingStreamOpen,
            active: None,
            round: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == NegotiationState::Connected
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FeatureRegistry {
        &mut self.registry
    }

    /// The server opened (or re-opened) the stream.
    pub fn on_stream_opened(&mut self) -> Result<(), XmppError> {
        match self.state {
            NegotiationState::AwaitingStreamOpen | NegotiationState::RestartingStream => {
                self.state = NegotiationState::AwaitingFeatures;
                Ok(())
            }
            state => Err(XmppError::unexpected(format!(
                "stream opened while negotiation was in state {state:?}"
            ))),
        }
    }

    /// A `<stream:features/>` set arrived.
    pub fn on_features(
        &mut self,
        ctx: &mut StreamContext,
        features: Element,
    ) -> Result<Vec<EngineAction>, XmppError> {
        if self.state != NegotiationState::AwaitingFeatures {
            return Err(XmppError::unexpected(format!(
                "features received in state {:?}",
                self.state
            )));
        }
        debug!(
            offered = features.children().count(),
            "processing features round"
        );
        self.round = Some(features);
        let mut actions = Vec::new();
        self.select_loop(ctx, &mut actions)?;
        Ok(actions)
    }

    /// A stream element arrived while a feature is mid-negotiation.
    pub fn on_element(
        &mut self,
        ctx: &mut StreamContext,
        element: &Element,
    ) -> Result<Vec<EngineAction>, XmppError> {
        if self.state != NegotiationState::ActivatingFeature {
            return Err(XmppError::unexpected(format!(
                "<{}/> received in state {:?}",
                element.name(),
                self.state
            )));
        }
        let index = self
            .active
            .ok_or_else(|| XmppError::stream("activating state with no active feature"))?;
        let feature = self
            .registry
            .get_mut(index)
            .ok_or_else(|| XmppError::stream("active feature index out of range"))?;

        let outcome = feature.on_element(ctx, element);
        let mut actions = Vec::new();
        match outcome {
            Ok(Some(flags)) => {
                if let StepOutcome::SelectNext = self.apply_flags(ctx, flags, &mut actions)? {
                    self.select_loop(ctx, &mut actions)?;
                }
                Ok(actions)
            }
            Ok(None) => Ok(actions),
            Err(error) => {
                if error.is_auth_failure() {
                    self.state = NegotiationState::Failed;
                    self.active = None;
                }
                Err(error)
            }
        }
    }

    /// Clear per-stream feature state ahead of a restart.
    pub fn reset_features(&mut self) {
        self.registry.reset_all();
        self.active = None;
        self.round = None;
    }

    /// Keep selecting and activating until a feature suspends, a restart is
    /// requested, or the round is exhausted.
    fn select_loop(
        &mut self,
        ctx: &mut StreamContext,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), XmppError> {
        loop {
            let round = self
                .round
                .clone()
                .ok_or_else(|| XmppError::stream("feature selection without a features round"))?;

            let Some((index, offer)) = self.registry.select(ctx, &round) else {
                return self.finish_round(ctx, &round);
            };

            let feature = self
                .registry
                .get_mut(index)
                .ok_or_else(|| XmppError::stream("selected feature index out of range"))?;
            debug!(advertisement = ?feature.advertisement(), "activating feature");
            self.state = NegotiationState::ActivatingFeature;
            self.active = Some(index);

            match feature.activate(ctx, &offer)? {
                None => return Ok(()),
                Some(flags) => match self.apply_flags(ctx, flags, actions)? {
                    StepOutcome::Done => return Ok(()),
                    StepOutcome::SelectNext => continue,
                },
            }
        }
    }

    /// No activatable feature is left in the round.
    fn finish_round(&mut self, ctx: &StreamContext, round: &Element) -> Result<(), XmppError> {
        if !ctx.authorized() {
            self.state = NegotiationState::Failed;
            return Err(XmppError::NoActivatableFeature);
        }
        // A <required/> marker inside an advertisement we do not implement
        // makes the stream unusable.
        for offer in round.children() {
            let required = offer.children().any(|c| c.name() == "required");
            if !required {
                continue;
            }
            let known = self
                .registry
                .iter()
                .any(|f| f.advertisement() == (offer.name(), offer.ns().as_str()));
            if !known {
                self.state = NegotiationState::Failed;
                warn!(feature = offer.name(), "server requires an unsupported feature");
                return Err(XmppError::NoActivatableFeature);
            }
        }
        debug!("negotiation complete");
        self.state = NegotiationState::Connected;
        Ok(())
    }

    /// Apply completion flags in their contractual order: failure first,
    /// then authorization, then terminal states, then restart, then
    /// continuation.
    fn apply_flags(
        &mut self,
        ctx: &mut StreamContext,
        flags: CompletedFlags,
        actions: &mut Vec<EngineAction>,
    ) -> Result<StepOutcome, XmppError> {
        debug!(?flags, "feature step completed");
        self.active = None;

        if flags.contains(CompletedFlags::AUTHORIZATION_FAILED) {
            self.state = NegotiationState::Failed;
            return Err(XmppError::authorization("authentication failed"));
        }
        if flags.contains(CompletedFlags::AUTHORIZED) {
            ctx.set_authorized(true);
        }
        if flags.contains(CompletedFlags::CONNECTED) {
            self.state = NegotiationState::Connected;
            return Ok(StepOutcome::Done);
        }
        if flags.contains(CompletedFlags::RESEND_HEADER) {
            self.state = NegotiationState::RestartingStream;
            self.round = None;
            actions.push(EngineAction::RestartStream);
            return Ok(StepOutcome::Done);
        }
        if flags.contains(CompletedFlags::ACTIVATE_NEXT) {
            self.state = NegotiationState::AwaitingFeatures;
            return Ok(StepOutcome::SelectNext);
        }
        self.state = NegotiationState::AwaitingFeatures;
        Ok(StepOutcome::Done)
    }
}
