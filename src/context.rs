//! Request-scoped evaluation context.
use std::{borrow::Cow, collections::HashMap};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Fields describing who (or what) a toggle is being evaluated for.
///
/// Well-known fields are addressable from constraints and stickiness settings by their camelCase
/// name (`userId`, `sessionId`, ...). Any other name is looked up in [`properties`](Self::properties).
///
/// ```
/// # use flagwise::EvaluationContext;
/// let context = EvaluationContext::new()
///     .with_user_id("u1")
///     .with_property("plan", "enterprise");
/// assert_eq!(context.get("plan").as_deref(), Some("enterprise"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct EvaluationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

#[allow(missing_docs)]
impl EvaluationContext {
    pub const USER_ID: &'static str = "userId";
    pub const SESSION_ID: &'static str = "sessionId";
    pub const REMOTE_ADDRESS: &'static str = "remoteAddress";
    pub const ENVIRONMENT: &'static str = "environment";
    pub const APP_NAME: &'static str = "appName";
    pub const CURRENT_TIME: &'static str = "currentTime";

    /// Create an empty context.
    pub fn new() -> EvaluationContext {
        EvaluationContext::default()
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_remote_address(mut self, remote_address: impl Into<String>) -> Self {
        self.remote_address = Some(remote_address.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn with_current_time(mut self, current_time: DateTime<Utc>) -> Self {
        self.current_time = Some(current_time);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Look up a field by its context name. Returns `None` if the field is not set.
    pub fn get(&self, field: &str) -> Option<Cow<'_, str>> {
        let value = match field {
            Self::USER_ID => self.user_id.as_deref(),
            Self::SESSION_ID => self.session_id.as_deref(),
            Self::REMOTE_ADDRESS => self.remote_address.as_deref(),
            Self::ENVIRONMENT => self.environment.as_deref(),
            Self::APP_NAME => self.app_name.as_deref(),
            Self::CURRENT_TIME => {
                return self
                    .current_time
                    .map(|t| Cow::Owned(t.to_rfc3339_opts(SecondsFormat::Millis, true)))
            }
            other => self.properties.get(other).map(String::as_str),
        };
        value.map(Cow::Borrowed)
    }

    /// Merge statically-configured fields into the context. Fields already set by the caller win.
    pub(crate) fn with_static_fields(
        &self,
        app_name: &str,
        environment: Option<&str>,
    ) -> Cow<'_, EvaluationContext> {
        let needs_app_name = self.app_name.is_none();
        let needs_environment = self.environment.is_none() && environment.is_some();
        if !needs_app_name && !needs_environment {
            return Cow::Borrowed(self);
        }

        let mut context = self.clone();
        if needs_app_name {
            context.app_name = Some(app_name.to_owned());
        }
        if needs_environment {
            context.environment = environment.map(str::to_owned);
        }
        Cow::Owned(context)
    }
}

/// Supplies the context used by evaluation calls that don't take one explicitly, e.g.
/// [`Client::is_enabled()`](crate::Client::is_enabled).
pub trait ContextProvider {
    /// Return the context for the current request.
    fn context(&self) -> EvaluationContext;
}

pub(crate) struct EmptyContextProvider;
impl ContextProvider for EmptyContextProvider {
    fn context(&self) -> EvaluationContext {
        EvaluationContext::default()
    }
}

impl<T: Fn() -> EvaluationContext> ContextProvider for T {
    fn context(&self) -> EvaluationContext {
        self()
    }
}
