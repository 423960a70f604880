use {
    crate::{
        dbus::{ExecutionContext, MatchRule, ObjectPath, Value},
        utils::hash_map_ext::HashMapExt,
    },
    ahash::AHashMap,
    indexmap::IndexSet,
    smallvec::SmallVec,
    std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering::Relaxed},
    },
};


linear_ids!(SubscriptionIds, SubscriptionId);

/// An inbound signal with its decoded body.
#[derive(Clone, Debug, PartialEq)]
pub struct Signal {
    pub sender: Option<String>,
    pub path: ObjectPath,
    pub interface: String,
    pub member: String,
    pub body: Vec<Value>,
}

pub(super) type SignalHandler = Arc<dyn Fn(&Signal) + Send + Sync>;

pub(super) struct Subscriber {
    pub id: SubscriptionId,
    pub rule: MatchRule,
    pub ctx: Arc<dyn ExecutionContext>,
    pub handler: SignalHandler,
    alive: AtomicBool,
}

impl Subscriber {
    /// Invokes the handler unless the subscription has been removed in the
    /// meantime.
    pub fn deliver(&self, signal: &Signal) {
        if self.alive.load(Relaxed) {
            (self.handler)(signal);
        }
    }
}

pub(super) type Matches = SmallVec<[Arc<Subscriber>; 4]>;

/// The subscriber registry of a connection.
///
/// Subscribers whose rule names a unique sender or the bus are indexed by
/// that sender. All others live in the wildcard bucket. Identical rules share
/// one bus-side registration.
#[derive(Default)]
pub(super) struct Subscriptions {
    ids: SubscriptionIds,
    by_id: AHashMap<SubscriptionId, Arc<Subscriber>>,
    by_sender: AHashMap<String, IndexSet<SubscriptionId>>,
    wildcard: IndexSet<SubscriptionId>,
    registrations: AHashMap<MatchRule, usize>,
}

impl Subscriptions {
    /// Adds a subscriber. Returns whether the rule must be registered with the
    /// bus.
    pub fn add(
        &mut self,
        rule: MatchRule,
        ctx: Arc<dyn ExecutionContext>,
        handler: SignalHandler,
    ) -> (SubscriptionId, bool) {
        let id = self.ids.next();
        match rule.sender_key() {
            Some(sender) => {
                self.by_sender
                    .entry(sender.to_string())
                    .or_default()
                    .insert(id);
            }
            None => {
                self.wildcard.insert(id);
            }
        }
        let mut register = false;
        if !rule.is_self_delivered() {
            let count = self.registrations.entry(rule.clone()).or_default();
            *count += 1;
            register = *count == 1;
        }
        let subscriber = Arc::new(Subscriber {
            id,
            rule,
            ctx,
            handler,
            alive: AtomicBool::new(true),
        });
        self.by_id.insert(id, subscriber);
        (id, register)
    }

    /// Removes a subscriber. Returns it together with its rule if the
    /// bus-side registration must be withdrawn.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<(Arc<Subscriber>, Option<MatchRule>)> {
        let subscriber = self.by_id.remove(&id)?;
        subscriber.alive.store(false, Relaxed);
        let rule = &subscriber.rule;
        match rule.sender_key() {
            Some(sender) => {
                if let Some(ids) = self.by_sender.get_mut(sender) {
                    ids.shift_remove(&id);
                    if ids.is_empty() {
                        self.by_sender.remove(sender);
                    }
                }
            }
            None => {
                self.wildcard.shift_remove(&id);
            }
        }
        let mut unregister = None;
        if let Some(count) = self.registrations.get_mut(rule) {
            *count -= 1;
            if *count == 0 {
                self.registrations.remove(rule);
                unregister = Some(rule.clone());
            }
        }
        Some((subscriber, unregister))
    }

    /// Returns the subscribers whose rule matches, in subscription order.
    pub fn matching(&self, signal: &Signal) -> Matches {
        let mut res = Matches::new();
        let by_sender = signal
            .sender
            .as_deref()
            .and_then(|s| self.by_sender.get(s))
            .into_iter()
            .flatten();
        for id in by_sender.chain(&self.wildcard) {
            if let Some(sub) = self.by_id.get(id) {
                if sub.rule.matches(signal) {
                    res.push(sub.clone());
                }
            }
        }
        res.sort_by_key(|s| s.id);
        res
    }

    /// Removes all subscribers. No bus-side registrations remain.
    pub fn clear(&mut self) -> Vec<Arc<Subscriber>> {
        self.by_sender.clear();
        self.wildcard.clear();
        self.registrations.clear();
        self.by_id
            .drain_values()
            .map(|s| {
                s.alive.store(false, Relaxed);
                s
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// The number of subscribers sharing the bus-side registration of `rule`.
    pub fn registrations(&self, rule: &MatchRule) -> usize {
        self.registrations.get(rule).copied().unwrap_or(0)
    }
}
