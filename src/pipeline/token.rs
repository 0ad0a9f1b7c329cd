//! Filesystem tokens: exclusive claims on a named resource, owned by
//! whichever job publishes the token file first.
//!
//! A token file's existence means the resource is claimed; its content is
//! the owner's signature. Acquisition writes the signature to a numbered
//! `.tmp` sibling with open-exclusive-new semantics, then publishes it
//! atomically so two racing drivers produce exactly one winner. Tokens are
//! never released mid-job; they are held for the lifetime of the work they
//! gate.

use crate::{
    error::{BuildError, Result},
    utils,
};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Result of one acquisition attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum TokenState {
    /// The token did not previously exist and now carries our signature.
    Acquired,
    /// The token already carries our signature from earlier in this job.
    AlreadyOurs,
    /// Another owner holds the token.
    HeldBy(String),
}

/// Acquires and tracks tokens for one job signature.
#[derive(Debug)]
pub struct TokenStore {
    signature: String,
    acquired: Mutex<Vec<PathBuf>>,
}

impl TokenStore {
    pub fn new(signature: impl Into<String>) -> Self {
        Self { signature: signature.into(), acquired: Mutex::new(Vec::new()) }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Attempts to claim the token. Success means the token file did not
    /// previously exist; on contention the current owner's signature is
    /// returned.
    pub fn try_acquire(&self, token: &Path) -> Result<TokenState> {
        utils::create_parent_dir_all(token)?;

        // write the signature to a fresh numbered sibling first, so the
        // publish step moves fully formed content into place
        let temp = self.write_temp(token)?;

        // publishing via hard link fails atomically when the target exists
        let published = fs::hard_link(&temp, token);
        let _ = fs::remove_file(&temp);
        match published {
            Ok(()) => {
                trace!("acquired token \"{}\"", token.display());
                self.acquired.lock().unwrap().push(token.to_path_buf());
                Ok(TokenState::Acquired)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                match read_owner(token)? {
                    Some(owner) if owner == self.signature => Ok(TokenState::AlreadyOurs),
                    Some(owner) => Ok(TokenState::HeldBy(owner)),
                    // the owner vanished between the link attempt and the
                    // read; report contention with an unknown owner
                    None => Ok(TokenState::HeldBy(String::new())),
                }
            }
            Err(err) => Err(BuildError::io(err, token)),
        }
    }

    fn write_temp(&self, token: &Path) -> Result<PathBuf> {
        for attempt in 0..64 {
            let temp = PathBuf::from(format!("{}.{attempt}.tmp", token.display()));
            match fs::OpenOptions::new().write(true).create_new(true).open(&temp) {
                Ok(mut file) => {
                    file.write_all(self.signature.as_bytes())
                        .map_err(|err| BuildError::io(err, &temp))?;
                    return Ok(temp);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(BuildError::io(err, &temp)),
            }
        }
        Err(BuildError::msg(format!(
            "unable to create a temporary file for token \"{}\"",
            token.display()
        )))
    }

    /// Deletes every token this store created. Only the fail-fast
    /// contention policy calls this; the skip policy deliberately leaves
    /// earlier tokens in place.
    pub fn release_acquired(&self) -> Result<()> {
        let mut acquired = self.acquired.lock().unwrap();
        for token in acquired.drain(..) {
            match fs::remove_file(&token) {
                Ok(()) => trace!("released token \"{}\"", token.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(BuildError::io(err, &token)),
            }
        }
        Ok(())
    }
}

/// The signature currently holding the token, or `None` when unowned.
pub fn read_owner(token: &Path) -> Result<Option<String>> {
    match fs::read_to_string(token) {
        Ok(signature) => Ok(Some(signature)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(BuildError::io(err, token)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let token = dir.path().join("tokens/editor.token");
        let store = TokenStore::new("driver-1");
        assert_eq!(store.try_acquire(&token).unwrap(), TokenState::Acquired);
        assert_eq!(read_owner(&token).unwrap().as_deref(), Some("driver-1"));
        // re-acquisition by the same job is idempotent
        assert_eq!(store.try_acquire(&token).unwrap(), TokenState::AlreadyOurs);
        // no stray temp files survive
        let leftovers: Vec<_> = std::fs::read_dir(token.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn contention_reports_the_owner() {
        let dir = tempfile::tempdir().unwrap();
        let token = dir.path().join("editor.token");
        let first = TokenStore::new("driver-1");
        let second = TokenStore::new("driver-2");
        assert_eq!(first.try_acquire(&token).unwrap(), TokenState::Acquired);
        assert_eq!(
            second.try_acquire(&token).unwrap(),
            TokenState::HeldBy("driver-1".to_string())
        );
    }

    #[test]
    fn release_deletes_only_our_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let ours = dir.path().join("ours.token");
        let theirs = dir.path().join("theirs.token");
        let other = TokenStore::new("other");
        other.try_acquire(&theirs).unwrap();

        let store = TokenStore::new("us");
        store.try_acquire(&ours).unwrap();
        assert_eq!(store.try_acquire(&theirs).unwrap(), TokenState::HeldBy("other".to_string()));
        store.release_acquired().unwrap();

        assert!(!ours.exists());
        assert!(theirs.exists());
    }

    #[test]
    fn racing_drivers_produce_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let token = dir.path().join("contested.token");

        let winners: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let token = token.clone();
                    scope.spawn(move || {
                        let store = TokenStore::new(format!("driver-{i}"));
                        matches!(store.try_acquire(&token).unwrap(), TokenState::Acquired)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(winners.iter().filter(|&&w| w).count(), 1);

        // and the token carries exactly one of the signatures
        let owner = read_owner(&token).unwrap().unwrap();
        assert!(owner.starts_with("driver-"));
    }
}
