use std::sync::Arc;

use http::Method;

use crate::session::SessionEndReason;

pub trait AuthObserver: Send + Sync {
    fn on_refresh_started(&self) {}

    fn on_refresh_settled(&self, _succeeded: bool) {}

    fn on_replay(&self, _method: &Method, _uri: &str) {}

    /// Fires once per session end, however many requests were waiting.
    fn on_session_ended(&self, _reason: &SessionEndReason) {}
}

#[derive(Clone, Default)]
pub(crate) struct Observers {
    observers: Arc<[Arc<dyn AuthObserver>]>,
}

impl Observers {
    pub(crate) fn new(observers: Vec<Arc<dyn AuthObserver>>) -> Self {
        Self {
            observers: observers.into(),
        }
    }

    pub(crate) fn refresh_started(&self) {
        for observer in self.observers.iter() {
            observer.on_refresh_started();
        }
    }

    pub(crate) fn refresh_settled(&self, succeeded: bool) {
        for observer in self.observers.iter() {
            observer.on_refresh_settled(succeeded);
        }
    }

    pub(crate) fn replay(&self, method: &Method, uri: &str) {
        for observer in self.observers.iter() {
            observer.on_replay(method, uri);
        }
    }

    pub(crate) fn session_ended(&self, reason: &SessionEndReason) {
        for observer in self.observers.iter() {
            observer.on_session_ended(reason);
        }
    }
}
