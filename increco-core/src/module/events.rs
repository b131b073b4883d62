//! The event bus: named callbacks fired on a fresh short-lived worker per
//! invocation, so a slow or misbehaving callback can never deadlock the
//! module that raised the event.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ids::ModuleId;
use crate::iu::IuRef;

/// Payload handed to an event callback. Most events carry nothing or the IU
/// that triggered them; a handful (e.g. `subscribe`) carry free-form meta.
#[derive(Clone)]
pub enum EventPayload {
    None,
    Iu(IuRef),
    Meta(crate::meta::MetaMap),
}

pub type EventCallback = Arc<dyn Fn(ModuleId, &str, EventPayload) + Send + Sync>;

/// The distinguished event name that subscribes to every event. It must
/// never itself be emitted via `event_call`.
pub const WILDCARD: &str = "*";

#[derive(Default)]
pub struct EventBus {
    callbacks: Mutex<HashMap<String, Vec<EventCallback>>>,
}

impl EventBus {
    pub fn subscribe(&self, name: impl Into<String>, callback: EventCallback) {
        self.callbacks
            .lock()
            .entry(name.into())
            .or_default()
            .push(callback);
    }

    /// Fires every callback registered for `name`, plus every wildcard
    /// subscriber, each on its own thread.
    pub fn call(&self, source: ModuleId, name: &str, data: EventPayload) {
        debug_assert_ne!(name, WILDCARD, "the wildcard event must never be emitted");

        let callbacks = self.callbacks.lock();
        let mut targets: Vec<EventCallback> = Vec::new();
        if let Some(list) = callbacks.get(name) {
            targets.extend(list.iter().cloned());
        }
        if let Some(list) = callbacks.get(WILDCARD) {
            targets.extend(list.iter().cloned());
        }
        drop(callbacks);

        let name = name.to_string();
        for cb in targets {
            let name = name.clone();
            let data = data.clone();
            std::thread::spawn(move || cb(source, &name, data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn subscribers_are_invoked_on_call() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.subscribe(
            "start",
            Arc::new(move |_src, _name, _data| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.call(ModuleId::next(), "start", EventPayload::None);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_subscriber_sees_every_event() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.subscribe(
            WILDCARD,
            Arc::new(move |_src, _name, _data| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.call(ModuleId::next(), "start", EventPayload::None);
        bus.call(ModuleId::next(), "stop", EventPayload::None);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
