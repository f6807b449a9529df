//! Creation options for publishers and subscribers.

/// Options for creating a publisher.
#[derive(Debug, Clone, Default)]
pub struct PublisherOptions {
    /// Reliable publishers never overwrite a message a reliable subscriber
    /// has not read; they see back-pressure instead of drops.
    pub reliable: bool,
    /// This publisher re-injects messages from an external bridge: the
    /// message prefix arrives already written and is not regenerated.
    pub bridge: bool,
}

impl PublisherOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reliable(mut self, v: bool) -> Self {
        self.reliable = v;
        self
    }

    pub fn bridge(mut self, v: bool) -> Self {
        self.bridge = v;
        self
    }
}

/// Options for creating a subscriber.
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Reliable subscribers pin slots with a reliable reference so reliable
    /// publishers cannot overwrite messages they have not read.
    pub reliable: bool,
    /// Deliver activation marker messages instead of filtering them.
    pub pass_activation: bool,
    /// Log a warning whenever an ordinal gap is observed.
    pub log_dropped_messages: bool,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            reliable: false,
            pass_activation: false,
            log_dropped_messages: true,
        }
    }
}

impl SubscriberOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reliable(mut self, v: bool) -> Self {
        self.reliable = v;
        self
    }

    pub fn pass_activation(mut self, v: bool) -> Self {
        self.pass_activation = v;
        self
    }

    pub fn log_dropped_messages(mut self, v: bool) -> Self {
        self.log_dropped_messages = v;
        self
    }
}
