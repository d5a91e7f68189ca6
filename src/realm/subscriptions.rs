use std::net::{IpAddr, SocketAddr};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

pub const WILDCARD_INSTANCE: &str = "*";

/// Whoever gets a copy of matching notices: a client on a local host, or a foreign realm that
///  subscribed on behalf of its own clients.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Subscriber {
    Client(SocketAddr),
    Realm(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SubscriptionKey {
    pub class: String,
    pub instance: String,
    pub recipient: String,
}
impl SubscriptionKey {
    /// class and instance match case-insensitively, the recipient is taken as is
    pub fn new(class: &str, instance: &str, recipient: &str) -> SubscriptionKey {
        SubscriptionKey {
            class: class.to_ascii_lowercase(),
            instance: instance.to_ascii_lowercase(),
            recipient: recipient.to_string(),
        }
    }
}

/// The (class, instance, recipient) triples subscribers declared interest in. An instance of `*`
///  matches every instance of the class.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    subscriptions: FxHashMap<SubscriptionKey, FxHashSet<Subscriber>>,
}

impl SubscriptionTable {
    pub fn new() -> SubscriptionTable {
        Default::default()
    }

    /// returns false if the subscription existed already
    pub fn subscribe(&mut self, key: SubscriptionKey, subscriber: Subscriber) -> bool {
        debug!(?key, ?subscriber, "subscribing");
        self.subscriptions.entry(key)
            .or_default()
            .insert(subscriber)
    }

    /// returns false if there was no such subscription
    pub fn unsubscribe(&mut self, key: &SubscriptionKey, subscriber: &Subscriber) -> bool {
        let Some(subscribers) = self.subscriptions.get_mut(key) else {
            return false;
        };
        let removed = subscribers.remove(subscriber);
        if subscribers.is_empty() {
            self.subscriptions.remove(key);
        }
        if removed {
            debug!(?key, ?subscriber, "unsubscribed");
        }
        removed
    }

    fn remove_where(&mut self, pred: impl Fn(&Subscriber) -> bool) -> usize {
        let mut num_removed = 0;
        self.subscriptions.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| !pred(s));
            num_removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        num_removed
    }

    /// drops all subscriptions of a single client
    pub fn cancel_client(&mut self, client: SocketAddr) -> usize {
        self.remove_where(|s| s == &Subscriber::Client(client))
    }

    /// drops the subscriptions of all clients on a host, e.g. when its host manager boots
    pub fn cancel_host(&mut self, host: IpAddr) -> usize {
        self.remove_where(|s| matches!(s, Subscriber::Client(addr) if addr.ip() == host))
    }

    pub fn cancel_realm(&mut self, realm: &str) -> usize {
        self.remove_where(|s| matches!(s, Subscriber::Realm(r) if r.eq_ignore_ascii_case(realm)))
    }

    /// All subscribers for a notice's address triple, each once
    pub fn matches(&self, class: &str, instance: &str, recipient: &str) -> Vec<Subscriber> {
        let exact = SubscriptionKey::new(class, instance, recipient);
        let wildcard = SubscriptionKey::new(class, WILDCARD_INSTANCE, recipient);

        let mut seen = FxHashSet::default();
        let mut result = Vec::new();
        for key in [&exact, &wildcard] {
            for s in self.subscriptions.get(key).into_iter().flatten() {
                if seen.insert(s) {
                    result.push(s.clone());
                }
            }
        }
        result
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SubscriptionKey, &Subscriber)> {
        self.subscriptions.iter()
            .flat_map(|(key, subscribers)| subscribers.iter().map(move |s| (key, s)))
    }

    pub fn num_subscriptions(&self) -> usize {
        self.subscriptions.values()
            .map(|s| s.len())
            .sum()
    }
}
