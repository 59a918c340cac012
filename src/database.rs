use crate::error::StoreError;
use crate::model::*;
use log::{debug, warn};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub trait UserDb {
    type Error;
    fn get_user(&self, username: &str) -> Option<User>;
    fn add_user(&self, username: &str, user: User) -> Result<bool, Self::Error>;
    fn update_user<T, E, F>(&self, username: &str, f: F) -> Result<T, E>
    where
        E: From<Self::Error>,
        F: FnOnce(&mut User) -> Result<T, E>;
}

/// The whole user database as a single JSON document.
///
/// Reads go straight to disk. Writes run inside [`JsonStore::transaction`],
/// which serialises load-mutate-save cycles and replaces the document by
/// renaming a fully written temp file over it.
pub struct JsonStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        JsonStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Users, StoreError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Users::new()),
            Err(err) => return Err(err.into()),
        };
        if data.trim().is_empty() {
            return Ok(Users::new());
        }
        serde_json::from_str(&data).map_err(StoreError::Corrupt)
    }

    /// Loads every user, treating an unreadable document as empty.
    pub fn load(&self) -> Users {
        self.read().unwrap_or_else(|err| {
            warn!("Falling back to empty user store: {}", err);
            Users::new()
        })
    }

    pub fn save(&self, users: &Users) -> Result<(), StoreError> {
        let mut data = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut data, formatter);
        users.serialize(&mut ser).map_err(StoreError::Serialize)?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("users.json");
        let tmp_path = dir.join(format!(
            ".{}.{}.tmp",
            file_name,
            uuid::Uuid::new_v4().simple()
        ));

        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .and_then(|mut file| {
                file.write_all(&data)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp_path, &self.path));
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        debug!("Saved {} users to {:?}", users.len(), self.path);
        Ok(())
    }

    /// Runs `f` against a fresh copy of the store and persists the result if
    /// it succeeds. A corrupt document is reported, never overwritten.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Users) -> Result<T, E>,
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut users = self.read()?;
        let ret = f(&mut users)?;
        self.save(&users)?;
        Ok(ret)
    }
}

impl UserDb for JsonStore {
    type Error = StoreError;

    fn get_user(&self, username: &str) -> Option<User> {
        self.load().remove(username)
    }

    fn add_user(&self, username: &str, user: User) -> Result<bool, StoreError> {
        self.transaction::<_, Option<StoreError>, _>(|users| {
            if users.contains_key(username) {
                return Err(None);
            }
            users.insert(username.to_owned(), user);
            Ok(())
        })
        .map(|()| true)
        .or_else(|err| match err {
            Some(err) => Err(err),
            None => Ok(false),
        })
    }

    fn update_user<T, E, F>(&self, username: &str, f: F) -> Result<T, E>
    where
        E: From<Self::Error>,
        F: FnOnce(&mut User) -> Result<T, E>,
    {
        self.transaction(|users| f(users.entry(username.to_owned()).or_default()))
    }
}
