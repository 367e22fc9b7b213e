//! Events delivered to user callbacks: impressions and recoverable errors.
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{Error, EvaluationContext, Variant};

/// Which public call produced an impression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImpressionEventType {
    /// [`Client::is_enabled`](crate::Client::is_enabled) and friends.
    #[serde(rename = "isEnabled")]
    IsEnabled,
    /// [`Client::get_variant`](crate::Client::get_variant) and friends.
    #[serde(rename = "getVariant")]
    GetVariant,
}

/// Emitted for every evaluation of a toggle that has impression data enabled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionEvent {
    /// Unique id of this event.
    pub event_id: Uuid,
    /// Public call that produced the event.
    pub event_type: ImpressionEventType,
    /// Name of the evaluated toggle.
    pub feature_name: String,
    /// Whether the toggle was enabled for the context.
    pub enabled: bool,
    /// Selected variant name. Only set for [`ImpressionEventType::GetVariant`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Context the toggle was evaluated with, including static fields.
    pub context: EvaluationContext,
    /// When the evaluation happened.
    pub timestamp: DateTime<Utc>,
}

impl ImpressionEvent {
    pub(crate) fn new(
        event_type: ImpressionEventType,
        feature_name: &str,
        enabled: bool,
        variant: Option<&Variant>,
        context: &EvaluationContext,
    ) -> ImpressionEvent {
        ImpressionEvent {
            event_id: Uuid::new_v4(),
            event_type,
            feature_name: feature_name.to_owned(),
            enabled,
            variant: variant.map(|v| v.name.clone()),
            context: context.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// A trait for receiving impression events, e.g. to forward them to an analytics pipeline.
pub trait ImpressionHandler {
    /// Handle the impression event.
    ///
    /// # Notes
    ///
    /// This method is called before the evaluation result is returned to the caller, so it should
    /// not block. Panics are caught and logged.
    ///
    /// ```no_run
    /// # use flagwise::{ImpressionEvent, ImpressionHandler};
    /// struct StdoutImpressions;
    ///
    /// impl ImpressionHandler for StdoutImpressions {
    ///     fn on_impression(&self, event: ImpressionEvent) {
    ///         println!("{} -> {}", event.feature_name, event.enabled);
    ///     }
    /// }
    /// ```
    fn on_impression(&self, event: ImpressionEvent);
}

pub(crate) struct NoopImpressionHandler;
impl ImpressionHandler for NoopImpressionHandler {
    fn on_impression(&self, _event: ImpressionEvent) {}
}

impl<T: Fn(ImpressionEvent)> ImpressionHandler for T {
    fn on_impression(&self, event: ImpressionEvent) {
        self(event);
    }
}

/// Source of a recoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Reading or writing the toggle cache files.
    FileCache,
    /// Reading the bootstrap provider.
    Bootstrap,
    /// Fetching toggles from the server.
    TogglesFetch,
}

/// A recoverable error that didn't stop the client.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Where the error happened.
    pub error_type: ErrorType,
    /// The error itself.
    pub error: Error,
}

/// A trait for observing recoverable errors (cache I/O, bootstrap, fetch).
pub trait ErrorHandler {
    /// Handle the error event. Panics are caught and logged.
    fn on_error(&self, event: ErrorEvent);
}

pub(crate) struct NoopErrorHandler;
impl ErrorHandler for NoopErrorHandler {
    fn on_error(&self, _event: ErrorEvent) {}
}

impl<T: Fn(ErrorEvent)> ErrorHandler for T {
    fn on_error(&self, event: ErrorEvent) {
        self(event);
    }
}

/// Run a user-supplied callback, logging instead of propagating a panic.
pub(crate) fn guarded(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!(target: "flagwise", callback = what; "callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::{guarded, ImpressionEvent, ImpressionEventType, ImpressionHandler};
    use crate::{EvaluationContext, Variant};

    #[test]
    fn guarded_swallows_panics() {
        let mut ran_after = false;
        guarded("test", || panic!("boom"));
        guarded("test", || ran_after = true);
        assert!(ran_after);
    }

    #[test]
    fn closures_are_impression_handlers() {
        let seen = Mutex::new(Vec::new());
        let handler = |event: ImpressionEvent| seen.lock().unwrap().push(event.feature_name);

        handler.on_impression(ImpressionEvent::new(
            ImpressionEventType::IsEnabled,
            "checkout",
            true,
            None,
            &EvaluationContext::new(),
        ));

        assert_eq!(*seen.lock().unwrap(), vec!["checkout".to_owned()]);
    }

    #[test]
    fn impression_serializes_in_camel_case() {
        let event = ImpressionEvent::new(
            ImpressionEventType::GetVariant,
            "checkout",
            true,
            Some(&Variant {
                name: "blue".to_owned(),
                payload: None,
                enabled: true,
            }),
            &EvaluationContext::new().with_user_id("u1"),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "getVariant");
        assert_eq!(json["featureName"], "checkout");
        assert_eq!(json["variant"], "blue");
        assert_eq!(json["context"]["userId"], "u1");
        assert!(json["eventId"].is_string());
    }
}
