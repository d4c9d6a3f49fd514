//! Contact list management (RFC 6121).
//!
//! A [`RosterManager`] is a [`StanzaConsumer`] that ingests roster query
//! results and reconciles roster pushes against its item map.

use std::collections::HashMap;

use minidom::Element;
use tracing::{debug, warn};

use crate::connection::{ConsumerResult, StanzaConsumer};
use crate::parser::ns;
use crate::XmppError;

const ROSTER_REQUEST_ID: &str = "roster-get";

/// Subscription state of a roster item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    fn parse(value: Option<&str>) -> Subscription {
        match value {
            Some("to") => Subscription::To,
            Some("from") => Subscription::From,
            Some("both") => Subscription::Both,
            Some("remove") => Subscription::Remove,
            _ => Subscription::None,
        }
    }
}

/// One contact in the roster.
#[derive(Debug, Clone, Default)]
pub struct RosterItem {
    pub jid: String,
    pub name: Option<String>,
    pub subscription: Subscription,
    pub groups: Vec<String>,
}

impl RosterItem {
    fn from_element(item: &Element) -> Option<RosterItem> {
        let jid = item.attr("jid")?.to_string();
        Some(RosterItem {
            jid,
            name: item.attr("name").map(str::to_string),
            subscription: Subscription::parse(item.attr("subscription")),
            groups: item
                .children()
                .filter(|c| c.name() == "group")
                .map(|c| c.text())
                .collect(),
        })
    }
}

/// Keeps the contact list in sync with roster results and pushes.
#[derive(Default)]
pub struct RosterManager {
    items: HashMap<String, RosterItem>,
    /// Roster version from the last result, if the server versions rosters.
    ver: Option<String>,
    received: bool,
}

impl RosterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the initial roster request iq.
    pub fn request(&self) -> Element {
        let mut query = Element::builder("query", ns::ROSTER);
        if let Some(ref ver) = self.ver {
            query = query.attr("ver", ver.as_str());
        }
        Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "get")
            .attr("id", ROSTER_REQUEST_ID)
            .append(query.build())
            .build()
    }

    /// Whether the initial roster result has arrived.
    pub fn is_received(&self) -> bool {
        self.received
    }

    pub fn items(&self) -> impl Iterator<Item = &RosterItem> {
        self.items.values()
    }

    pub fn get(&self, jid: &str) -> Option<&RosterItem> {
        self.items.get(jid)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn version(&self) -> Option<&str> {
        self.ver.as_deref()
    }

    fn ingest(&mut self, query: &Element, replace: bool) {
        if replace {
            self.items.clear();
        }
        if let Some(ver) = query.attr("ver") {
            self.ver = Some(ver.to_string());
        }
        for child in query.children().filter(|c| c.is("item", ns::ROSTER)) {
            let Some(item) = RosterItem::from_element(child) else {
                warn!("roster item without a jid attribute ignored");
                continue;
            };
            if item.subscription == Subscription::Remove {
                debug!(jid = %item.jid, "roster item removed");
                self.items.remove(&item.jid);
            } else {
                debug!(jid = %item.jid, "roster item updated");
                self.items.insert(item.jid.clone(), item);
            }
        }
    }

    /// Build the result iq acknowledging a roster push.
    ///
    /// Consumers cannot write to the stream, so the caller sends this.
    pub fn push_ack(iq: &Element) -> Result<Element, XmppError> {
        let id = iq
            .attr("id")
            .ok_or_else(|| XmppError::malformed("roster push without an id"))?;
        let mut ack = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "result")
            .attr("id", id);
        if let Some(from) = iq.attr("from") {
            ack = ack.attr("to", from);
        }
        Ok(ack.build())
    }
}

impl StanzaConsumer for RosterManager {
    fn on_stanza(&mut self, stanza: &Element) -> ConsumerResult {
        if stanza.name() != "iq" {
            return ConsumerResult::Continue;
        }
        let Some(query) = stanza.get_child("query", ns::ROSTER) else {
            return ConsumerResult::Continue;
        };
        match stanza.attr("type") {
            Some("result") if stanza.attr("id") == Some(ROSTER_REQUEST_ID) => {
                self.ingest(query, true);
                self.received = true;
                debug!(items = self.items.len(), "initial roster received");
                ConsumerResult::Handled
            }
            Some("set") => {
                self.ingest(query, false);
                ConsumerResult::Handled
            }
            _ => ConsumerResult::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(items: &str) -> Element {
        format!(
            "<iq xmlns='jabber:client' type='result' id='roster-get'>\
             <query xmlns='jabber:iq:roster' ver='v7'>{items}</query></iq>"
        )
        .parse()
        .unwrap()
    }

    fn push(items: &str) -> Element {
        format!(
            "<iq xmlns='jabber:client' type='set' id='push-1'>\
             <query xmlns='jabber:iq:roster'>{items}</query></iq>"
        )
        .parse()
        .unwrap()
    }

    #[test]
    fn request_carries_the_known_version() {
        let mut roster = RosterManager::new();
        let request = roster.request();
        assert_eq!(request.attr("type"), Some("get"));
        let query = request.get_child("query", ns::ROSTER).unwrap();
        assert!(query.attr("ver").is_none());

        roster.on_stanza(&result(""));
        let query = roster.request();
        let query = query.get_child("query", ns::ROSTER).unwrap();
        assert_eq!(query.attr("ver"), Some("v7"));
    }

    #[test]
    fn initial_result_replaces_the_item_map() {
        let mut roster = RosterManager::new();
        assert!(!roster.is_received());

        let outcome = roster.on_stanza(&result(
            "<item jid='bob@example.com' name='Bob' subscription='both'>\
             <group>Friends</group><group>Work</group></item>\
             <item jid='eve@example.org' subscription='to'/>",
        ));

        assert_eq!(outcome, ConsumerResult::Handled);
        assert!(roster.is_received());
        assert_eq!(roster.len(), 2);
        let bob = roster.get("bob@example.com").unwrap();
        assert_eq!(bob.name.as_deref(), Some("Bob"));
        assert_eq!(bob.subscription, Subscription::Both);
        assert_eq!(bob.groups, vec!["Friends", "Work"]);
        assert_eq!(roster.version(), Some("v7"));
    }

    #[test]
    fn pushes_update_and_remove_items() {
        let mut roster = RosterManager::new();
        roster.on_stanza(&result(
            "<item jid='bob@example.com' subscription='to'/>",
        ));

        roster.on_stanza(&push(
            "<item jid='bob@example.com' subscription='both'/>\
             <item jid='carol@example.net' subscription='from'/>",
        ));
        assert_eq!(roster.len(), 2);
        assert_eq!(
            roster.get("bob@example.com").unwrap().subscription,
            Subscription::Both
        );

        roster.on_stanza(&push("<item jid='bob@example.com' subscription='remove'/>"));
        assert_eq!(roster.len(), 1);
        assert!(roster.get("bob@example.com").is_none());
    }

    #[test]
    fn unrelated_stanzas_pass_through() {
        let mut roster = RosterManager::new();
        let message: Element = "<message xmlns='jabber:client'><body>hi</body></message>"
            .parse()
            .unwrap();
        assert_eq!(roster.on_stanza(&message), ConsumerResult::Continue);

        let other_iq: Element = "<iq xmlns='jabber:client' type='result' id='x'/>"
            .parse()
            .unwrap();
        assert_eq!(roster.on_stanza(&other_iq), ConsumerResult::Continue);
    }

    #[test]
    fn push_ack_mirrors_id_and_sender() {
        let iq = push("<item jid='bob@example.com'/>");
        let ack = RosterManager::push_ack(&iq).unwrap();
        assert_eq!(ack.attr("type"), Some("result"));
        assert_eq!(ack.attr("id"), Some("push-1"));
    }
}
