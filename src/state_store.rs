//! A thread-safe in-memory storage for the currently active toggle collection. [`StateStore`]
//! provides wait-free access for readers (toggle evaluation) and atomic replacement for the single
//! writer (the loader at startup, then the poller thread).
use std::sync::Arc;

use arc_swap::ArcSwap;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::toggles::ToggleCollection;

/// Opaque change-detection token (ETag) paired with a toggle collection. It is never parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, From, Display)]
#[serde(transparent)]
pub struct ChangeToken(String);

impl ChangeToken {
    /// The token as sent by the server.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty token means "no known state"; the next fetch is unconditional.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ChangeToken {
    fn from(value: &str) -> ChangeToken {
        ChangeToken(value.to_owned())
    }
}

/// A toggle collection together with the change token it was received with.
#[derive(Debug, Default)]
pub struct ToggleState {
    /// Active toggle collection.
    pub collection: Arc<ToggleCollection>,
    /// Token of `collection`.
    pub change_token: ChangeToken,
}

/// `StateStore` provides a thread-safe (`Sync`) storage for the toggle state.
///
/// The collection and its token are published together, so a reader never observes a token that
/// belongs to a different collection. Published collections are immutable and can only be replaced
/// completely.
#[derive(Debug, Default)]
pub struct StateStore {
    state: ArcSwap<ToggleState>,
}

impl StateStore {
    /// Create a new store holding an empty collection and an empty token.
    pub fn new() -> StateStore {
        StateStore::default()
    }

    /// Get currently-active toggle collection. Never blocks.
    pub fn current(&self) -> Arc<ToggleCollection> {
        Arc::clone(&self.state.load().collection)
    }

    /// Get the currently-active collection and its change token as one consistent snapshot.
    pub fn snapshot(&self) -> Arc<ToggleState> {
        self.state.load_full()
    }

    /// Token of the currently-active collection.
    pub fn change_token(&self) -> ChangeToken {
        self.state.load().change_token.clone()
    }

    /// Atomically install a new collection and token, returning the previous state.
    pub fn replace(
        &self,
        collection: Arc<ToggleCollection>,
        change_token: ChangeToken,
    ) -> Arc<ToggleState> {
        log::debug!(target: "flagwise",
                    toggles = collection.len(),
                    change_token:display = change_token;
                    "replacing active toggle collection");
        self.state.swap(Arc::new(ToggleState {
            collection,
            change_token,
        }))
    }
}
