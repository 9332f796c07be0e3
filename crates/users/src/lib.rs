//! File-backed user store.
//!
//! Users are kept in memory and persisted to a JSON file after every
//! change. Passwords are stored as salted SHA-256 digests.

mod password;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use javelin_socket::{Authenticator, UserAuthenticator};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::password::HashedPassword;

/// Errors from user store operations.
#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid username {0:?}: must be non-empty and must not contain ':'")]
    InvalidUsername(String),
}

type Users = HashMap<String, HashedPassword>;

/// Persistent username / password store usable as a server authenticator.
pub struct UserStore {
    path: PathBuf,
    users: RwLock<Users>,
}

impl UserStore {
    /// Opens the store at `path`, loading existing users. A missing file is
    /// an empty store; it is created on the first change.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, UserStoreError> {
        let path = path.into();
        let users = load_users(&path)?;
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `change` and persists the result while holding the lock, so
    /// concurrent writers cannot reorder file contents.
    fn update<R>(&self, change: impl FnOnce(&mut Users) -> R) -> Result<R, UserStoreError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let result = change(&mut users);
        persist(&self.path, &users)?;
        Ok(result)
    }
}

impl Authenticator for UserStore {
    fn authenticate(&self, username: &str, password: &SecretString) -> bool {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .is_some_and(|hashed| hashed.verify(password.expose_secret()))
    }
}

impl UserAuthenticator for UserStore {
    type Error = UserStoreError;

    fn save_user(&self, username: &str, password: &SecretString) -> Result<(), UserStoreError> {
        if username.is_empty() || username.contains(':') {
            return Err(UserStoreError::InvalidUsername(username.to_string()));
        }
        let hashed = HashedPassword::new(password.expose_secret());
        self.update(|users| {
            users.insert(username.to_string(), hashed);
        })?;
        debug!(username, "saved user");
        Ok(())
    }

    fn exists_user(&self, username: &str) -> bool {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(username)
    }

    fn count_users(&self) -> usize {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns every username, sorted.
    fn find_all_users(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Removing an unknown user is not an error and leaves the file as is.
    fn delete_user(&self, username: &str) -> Result<(), UserStoreError> {
        if !self.exists_user(username) {
            return Ok(());
        }
        self.update(|users| {
            users.remove(username);
        })?;
        debug!(username, "deleted user");
        Ok(())
    }

    fn delete_all_users(&self) -> Result<(), UserStoreError> {
        let removed = self.update(|users| {
            let count = users.len();
            users.clear();
            count
        })?;
        debug!(removed, "deleted all users");
        Ok(())
    }
}

fn persist(path: &Path, users: &Users) -> Result<(), UserStoreError> {
    let json = serde_json::to_string_pretty(users)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    debug!("persisted {} user(s) to {:?}", users.len(), path);
    Ok(())
}

fn load_users(path: &Path) -> Result<Users, UserStoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let users: Users = serde_json::from_str(&data)?;
    debug!("loaded {} user(s) from {:?}", users.len(), path);
    Ok(users)
}
