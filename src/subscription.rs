use tokio::task::{AbortHandle, JoinHandle};

/// A background task registered on behalf of a listener. Canceling it stops
/// delivery; it is independent of every other subscription.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    handle: AbortHandle,
}

impl Subscription {
    pub fn from_task(name: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle: task.abort_handle(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Owned set of subscriptions, canceled together on `dispose`.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        tracing::debug!(name = subscription.name(), "subscription registered");
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Cancel every subscription. Calling it again is a no-op.
    pub fn dispose(&mut self) {
        if self.is_empty() {
            return;
        }
        for subscription in self.subscriptions.drain(..) {
            tracing::debug!(name = subscription.name(), "subscription canceled");
            subscription.cancel();
        }
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.dispose();
    }
}
