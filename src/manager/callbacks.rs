use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Start,
    Stop,
    Error,
}

impl LifecycleEvent {
    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "on_start",
            Self::Stop => "on_stop",
            Self::Error => "on_error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "on_start" => Some(Self::Start),
            "on_stop" => Some(Self::Stop),
            "on_error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Arguments passed to every handler of an event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventPayload {
    pub group: String,
    pub instance: String,
    pub pid: Option<u32>,
    pub error: Option<String>,
}

impl EventPayload {
    pub fn new(group: &str, instance: &str) -> Self {
        Self {
            group: group.to_string(),
            instance: instance.to_string(),
            ..Default::default()
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

pub type EventHandler = Arc<dyn Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync>;

/// Ordered handler lists per lifecycle event.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<LifecycleEvent, Vec<EventHandler>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown event names are ignored; returns whether the handler was kept.
    pub fn register<F>(&self, event: &str, handler: F) -> bool
    where
        F: Fn(&EventPayload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let Some(kind) = LifecycleEvent::from_name(event) else {
            tracing::debug!("Ignoring callback for unknown event '{}'", event);
            return false;
        };
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.entry(kind).or_default().push(Arc::new(handler));
        tracing::info!("Registered callback for {}", event);
        true
    }

    /// Runs every handler of `event` in registration order and returns how many succeeded.
    /// A handler that errors or panics is logged and does not stop the rest.
    pub fn trigger(&self, event: &str, payload: &EventPayload) -> usize {
        let Some(kind) = LifecycleEvent::from_name(event) else {
            return 0;
        };
        // Handlers run outside the lock so they can register or trigger in turn.
        let handlers: Vec<EventHandler> = {
            let map = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            map.get(&kind).cloned().unwrap_or_default()
        };

        let mut ok = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => {
                    tracing::error!(event, group = %payload.group, instance = %payload.instance, "Callback failed: {:#}", e);
                }
                Err(_) => {
                    tracing::error!(event, group = %payload.group, instance = %payload.instance, "Callback panicked");
                }
            }
        }
        ok
    }
}
