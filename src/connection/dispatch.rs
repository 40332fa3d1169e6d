use super::*;

/// Stable identity of a subscription.
///
/// Built from the owner's allocation address and the callback's address, so
/// subscribing the same (owner, callback) pair twice yields the same key.
/// Free functions use owner address `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverKey {
    owner: usize,
    function: usize,
}

impl ObserverKey {
    /// Returns true if the key was created for a callback bound to an owner.
    pub fn is_bound(&self) -> bool {
        self.owner != 0
    }
}

type Dispatch = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Subscription {
    description: String,
    owner: Option<Weak<dyn Any + Send + Sync>>,
    dispatch: Dispatch,
}

impl Subscription {
    fn is_alive(&self) -> bool {
        self.owner
            .as_ref()
            .is_none_or(|owner| owner.strong_count() > 0)
    }
}

/// Registry of observers interested in the data received by one connection.
///
/// The registry never keeps an owner alive: bound callbacks hold only a weak
/// reference, and entries whose owner was dropped are skipped on dispatch and
/// pruned afterwards. Dispatch happens on a snapshot taken under the lock, so
/// callbacks may subscribe or unsubscribe (themselves included) while being
/// notified.
pub struct SubscriptionRegistry {
    label: String,
    entries: Mutex<Vec<(ObserverKey, Arc<Subscription>)>>,
}

impl SubscriptionRegistry {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes `callback` bound to `owner`.
    ///
    /// Subscribing an already-subscribed pair is a no-op returning the same key.
    pub fn subscribe<O>(&self, owner: &Arc<O>, callback: fn(&O, &str)) -> ObserverKey
    where
        O: Send + Sync + 'static,
    {
        let key = Self::bound_key(owner, callback);
        let weak = Arc::downgrade(owner);
        let erased: Weak<dyn Any + Send + Sync> = weak.clone();
        let subscription = Subscription {
            description: format!("{}@{:#x}", std::any::type_name::<O>(), key.owner),
            owner: Some(erased),
            dispatch: Box::new(move |data| match weak.upgrade() {
                Some(owner) => {
                    callback(&owner, data);
                    true
                }
                None => false,
            }),
        };
        self.insert(key, subscription)
    }

    /// Subscribes a free function.
    pub fn subscribe_fn(&self, callback: fn(&str)) -> ObserverKey {
        let key = ObserverKey {
            owner: 0,
            function: callback as usize,
        };
        let subscription = Subscription {
            description: format!("fn@{:#x}", key.function),
            owner: None,
            dispatch: Box::new(move |data| {
                callback(data);
                true
            }),
        };
        self.insert(key, subscription)
    }

    fn insert(&self, key: ObserverKey, subscription: Subscription) -> ObserverKey {
        let mut entries = self.lock();
        match entries.iter_mut().find(|(existing, _)| *existing == key) {
            // An allocation address may be reused once its previous owner is gone.
            Some((_, current)) if !current.is_alive() => {
                trace!("{}: replacing stale subscription {}", self.label, current.description);
                *current = Arc::new(subscription);
            }
            Some(_) => {}
            None => {
                trace!("{}: subscribe({})", self.label, subscription.description);
                entries.push((key, Arc::new(subscription)));
            }
        }
        key
    }

    pub fn unsubscribe<O>(&self, owner: &Arc<O>, callback: fn(&O, &str)) -> bool
    where
        O: Send + Sync + 'static,
    {
        self.unsubscribe_key(&Self::bound_key(owner, callback))
    }

    pub fn unsubscribe_fn(&self, callback: fn(&str)) -> bool {
        self.unsubscribe_key(&ObserverKey {
            owner: 0,
            function: callback as usize,
        })
    }

    /// Removes a subscription.
    ///
    /// Returns false and logs a warning if the key was not subscribed.
    pub fn unsubscribe_key(&self, key: &ObserverKey) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|(existing, _)| existing == key) {
            Some(index) => {
                let (_, removed) = entries.remove(index);
                trace!("{}: unsubscribe({})", self.label, removed.description);
                true
            }
            None => {
                warn!("{}: {:?} was not subscribed", self.label, key);
                false
            }
        }
    }

    pub fn contains(&self, key: &ObserverKey) -> bool {
        self.lock().iter().any(|(existing, _)| existing == key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Delivers `data` to every live subscriber in subscription order.
    ///
    /// Returns the number of subscribers that received the data. A panicking
    /// subscriber is logged and does not prevent delivery to the others.
    pub fn notify(&self, data: &str) -> usize {
        let snapshot: Vec<(ObserverKey, Arc<Subscription>)> = self
            .lock()
            .iter()
            .map(|(key, subscription)| (*key, Arc::clone(subscription)))
            .collect();

        let mut delivered = 0;
        let mut stale = Vec::new();
        for (key, subscription) in snapshot {
            trace!("{}: notifying {}({:?})", self.label, subscription.description, data);
            match panic::catch_unwind(AssertUnwindSafe(|| (subscription.dispatch)(data))) {
                Ok(true) => delivered += 1,
                Ok(false) => stale.push(key),
                Err(_) => error!(
                    "{}: observer {} panicked while handling received data",
                    self.label, subscription.description
                ),
            }
        }

        if !stale.is_empty() {
            let mut entries = self.lock();
            entries.retain(|(key, subscription)| !stale.contains(key) || subscription.is_alive());
            debug!("{}: pruned {} stale subscription(s)", self.label, stale.len());
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ObserverKey, Arc<Subscription>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bound_key<O>(owner: &Arc<O>, callback: fn(&O, &str)) -> ObserverKey {
        ObserverKey {
            owner: Arc::as_ptr(owner) as *const () as usize,
            function: callback as usize,
        }
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("label", &self.label)
            .field("subscriptions", &self.len())
            .finish()
    }
}
