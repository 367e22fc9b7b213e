//! Initial client state: the on-disk toggle cache, reconciled with a bootstrap provider.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{
    bootstrap::ToggleBootstrapProvider,
    events::{guarded, ErrorEvent, ErrorHandler, ErrorType},
    state_store::ChangeToken,
    toggles::ToggleCollection,
    Error, Result,
};

/// Locations of the toggle cache and its change token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CacheFiles {
    pub toggle_file: PathBuf,
    pub etag_file: PathBuf,
}

impl CacheFiles {
    pub fn new(cache_dir: &Path, app_name: &str) -> CacheFiles {
        CacheFiles {
            toggle_file: cache_dir.join(format!("flagwise.{app_name}.json")),
            etag_file: cache_dir.join(format!("flagwise.{app_name}.etag")),
        }
    }

    /// `Ok(None)` if the token file doesn't exist.
    fn read_token(&self) -> std::io::Result<Option<ChangeToken>> {
        match std::fs::read_to_string(&self.etag_file) {
            Ok(token) => Ok(Some(ChangeToken::from(token.trim()))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// `Ok(None)` if the file doesn't exist. An empty placeholder file reads as an empty
    /// collection.
    fn read_collection(&self) -> Result<Option<ToggleCollection>> {
        let contents = match std::fs::read_to_string(&self.toggle_file) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if contents.trim().is_empty() {
            return Ok(Some(ToggleCollection::default()));
        }

        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Back up `collection` and its token. Each file is written to a temporary sibling first and
    /// renamed into place, so readers never see a torn file.
    pub fn save(&self, collection: &ToggleCollection, token: &ChangeToken) -> Result<()> {
        let json = serde_json::to_string(collection)?;
        write_atomically(&self.toggle_file, json.as_bytes())?;
        write_atomically(&self.etag_file, token.as_str().as_bytes())?;
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// State handed to the [`StateStore`](crate::StateStore) before the first fetch.
#[derive(Debug, Default)]
pub(crate) struct InitialState {
    pub change_token: ChangeToken,
    pub collection: Option<ToggleCollection>,
}

/// Loads [`InitialState`] from the cache files, falling back to (or overridden by) a bootstrap
/// provider.
pub(crate) struct CachedFilesLoader<'a> {
    pub files: &'a CacheFiles,
    pub file_writing: bool,
    pub bootstrap: Option<&'a (dyn ToggleBootstrapProvider + Send + Sync)>,
    pub bootstrap_override: bool,
    pub error_handler: &'a (dyn ErrorHandler + Send + Sync),
}

impl CachedFilesLoader<'_> {
    /// Never fails because of the cache: I/O and parse errors are logged and reported to the error
    /// handler. Bootstrap errors are reported the same way.
    ///
    /// # Errors
    ///
    /// The bootstrap provider's error, if the provider
    /// [throws on fail](ToggleBootstrapProvider::throws_on_fail).
    pub fn load(&self) -> Result<InitialState> {
        let mut state = InitialState {
            change_token: self.load_token(),
            collection: self.load_collection(),
        };

        let needs_bootstrap = self.bootstrap_override
            || state
                .collection
                .as_ref()
                .map_or(true, ToggleCollection::is_empty);

        if let (true, Some(bootstrap)) = (needs_bootstrap, self.bootstrap) {
            match bootstrap.read() {
                Ok(Some(collection)) if !collection.is_empty() => {
                    log::debug!(target: "flagwise",
                                toggles = collection.len();
                                "using bootstrapped toggles");
                    state.collection = Some(collection);
                    // The cached token belongs to the cached collection, not to this one.
                    state.change_token = ChangeToken::default();
                }
                Ok(_) => {
                    log::debug!(target: "flagwise", "bootstrap provider returned no toggles");
                }
                Err(err) => {
                    log::warn!(target: "flagwise", "failed to read bootstrap toggles: {err}");
                    self.report(ErrorType::Bootstrap, err.clone());
                    if bootstrap.throws_on_fail() {
                        return Err(err);
                    }
                }
            }
        }

        if state.collection.is_none() {
            state.change_token = ChangeToken::default();
        }

        Ok(state)
    }

    fn load_token(&self) -> ChangeToken {
        match self.files.read_token() {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.write_placeholder(&self.files.etag_file);
                ChangeToken::default()
            }
            Err(err) => {
                log::warn!(target: "flagwise",
                           path:? = self.files.etag_file;
                           "unable to read change token file: {err}");
                self.report(ErrorType::FileCache, err.into());
                ChangeToken::default()
            }
        }
    }

    fn load_collection(&self) -> Option<ToggleCollection> {
        match self.files.read_collection() {
            Ok(Some(collection)) => Some(collection),
            Ok(None) => {
                self.write_placeholder(&self.files.toggle_file);
                None
            }
            Err(err) => {
                log::warn!(target: "flagwise",
                           path:? = self.files.toggle_file;
                           "unable to load cached toggles: {err}");
                self.report(ErrorType::FileCache, err);
                None
            }
        }
    }

    fn write_placeholder(&self, path: &Path) {
        if !self.file_writing {
            return;
        }
        if let Err(err) = std::fs::write(path, "") {
            log::warn!(target: "flagwise",
                       path:? = path;
                       "unable to create cache file: {err}");
            self.report(ErrorType::FileCache, err.into());
        }
    }

    fn report(&self, error_type: ErrorType, error: Error) {
        guarded("error_handler", || {
            self.error_handler.on_error(ErrorEvent { error_type, error })
        });
    }
}
