//! Ordered collection of stream features.

use minidom::Element;
use tracing::trace;

use crate::feature::{StreamContext, StreamFeature};

/// Holds the registered features and picks the next one to negotiate.
#[derive(Default)]
pub struct FeatureRegistry {
    features: Vec<Box<dyn StreamFeature + Send>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, feature: Box<dyn StreamFeature + Send>) {
        trace!(
            advertisement = ?feature.advertisement(),
            priority = feature.priority(),
            "feature registered"
        );
        self.features.push(feature);
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn StreamFeature + Send)> {
        self.features.iter().map(|f| f.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut (dyn StreamFeature + Send)> {
        match self.features.get_mut(index) {
            Some(feature) => Some(feature.as_mut()),
            None => None,
        }
    }

    /// Pick the highest-priority activatable feature offered in `round`.
    ///
    /// Ties resolve to the first-registered feature. Returns the feature's
    /// index and a clone of the matching advertisement child.
    pub fn select(&self, ctx: &StreamContext, round: &Element) -> Option<(usize, Element)> {
        let mut best: Option<(usize, &Element, i32)> = None;
        for (index, feature) in self.features.iter().enumerate() {
            let (name, namespace) = feature.advertisement();
            let Some(offer) = round.get_child(name, namespace) else {
                continue;
            };
            if !feature.is_activatable(ctx, offer) {
                continue;
            }
            let priority = feature.priority();
            if best.map_or(true, |(_, _, p)| priority > p) {
                best = Some((index, offer, priority));
            }
        }
        best.map(|(index, offer, _)| (index, offer.clone()))
    }

    /// Reset per-stream state in every feature ahead of a stream restart.
    pub fn reset_all(&mut self) {
        for feature in &mut self.features {
            feature.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{CompletedFlags, FeatureCategory};
    use crate::XmppError;

    struct Probe {
        name: &'static str,
        namespace: &'static str,
        priority: i32,
        activatable: bool,
    }

    impl StreamFeature for Probe {
        fn category(&self) -> FeatureCategory {
            FeatureCategory::Custom
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn advertisement(&self) -> (&'static str, &'static str) {
            (self.name, self.namespace)
        }

        fn is_activatable(&self, _ctx: &StreamContext, _offer: &Element) -> bool {
            self.activatable
        }

        fn activate(
            &mut self,
            _ctx: &mut StreamContext,
            _offer: &Element,
        ) -> Result<Option<CompletedFlags>, XmppError> {
            Ok(Some(CompletedFlags::CONNECTED))
        }
    }

    fn context() -> StreamContext {
        StreamContext::new(
            "alice@example.com".parse().unwrap(),
            None,
            "example.com".to_string(),
            Box::new(Vec::new()),
        )
    }

    fn round(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    const ROUND: &str = "<features xmlns='http://etherx.jabber.org/streams'>\
        <alpha xmlns='urn:test:alpha'/><beta xmlns='urn:test:beta'/></features>";

    #[test]
    fn highest_priority_offered_feature_wins() {
        let mut registry = FeatureRegistry::new();
        registry.register(Box::new(Probe {
            name: "alpha",
            namespace: "urn:test:alpha",
            priority: 10,
            activatable: true,
        }));
        registry.register(Box::new(Probe {
            name: "beta",
            namespace: "urn:test:beta",
            priority: 50,
            activatable: true,
        }));

        let (index, offer) = registry.select(&context(), &round(ROUND)).unwrap();
        assert_eq!(index, 1);
        assert_eq!(offer.name(), "beta");
    }

    #[test]
    fn unoffered_and_unactivatable_features_are_passed_over() {
        let mut registry = FeatureRegistry::new();
        registry.register(Box::new(Probe {
            name: "gamma",
            namespace: "urn:test:gamma",
            priority: 100,
            activatable: true,
        }));
        registry.register(Box::new(Probe {
            name: "beta",
            namespace: "urn:test:beta",
            priority: 50,
            activatable: false,
        }));
        registry.register(Box::new(Probe {
            name: "alpha",
            namespace: "urn:test:alpha",
            priority: 10,
            activatable: true,
        }));

        let (index, offer) = registry.select(&context(), &round(ROUND)).unwrap();
        assert_eq!(index, 2);
        assert_eq!(offer.name(), "alpha");
    }

    #[test]
    fn ties_resolve_to_registration_order() {
        let mut registry = FeatureRegistry::new();
        registry.register(Box::new(Probe {
            name: "alpha",
            namespace: "urn:test:alpha",
            priority: 10,
            activatable: true,
        }));
        registry.register(Box::new(Probe {
            name: "beta",
            namespace: "urn:test:beta",
            priority: 10,
            activatable: true,
        }));

        let (index, _) = registry.select(&context(), &round(ROUND)).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn empty_selection_when_nothing_matches() {
        let registry = FeatureRegistry::new();
        assert!(registry.select(&context(), &round(ROUND)).is_none());
    }
}
