use crate::database::UserDb;
use crate::error::{Error, Result};
use crate::model::*;
use crate::qr::{self, QrOptions};
use log::{info, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// URL path (relative to the site root) under which QR files are served.
pub const QR_URL_DIR: &str = "static/qrcodes";

#[derive(Debug, Clone, PartialEq)]
pub enum QrSource {
    Text(String),
    Upload { file_name: String, path: PathBuf },
}

/// A validated request to create a gallery entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub name: String,
    pub source: QrSource,
}

impl NewEntry {
    pub fn new(
        name: Option<String>,
        text: Option<String>,
        upload: Option<(String, PathBuf)>,
    ) -> Result<Self> {
        let name = name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_QR_NAME.to_owned());
        let source = match (upload, text) {
            (Some((file_name, path)), _) if !file_name.is_empty() => {
                QrSource::Upload { file_name, path }
            }
            (_, Some(text)) if !text.is_empty() => QrSource::Text(text),
            _ => return Err(Error::NoContent),
        };
        Ok(NewEntry { name, source })
    }
}

pub struct Gallery {
    qr_dir: PathBuf,
    options: QrOptions,
}

fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("");
    let clean: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match clean.trim_start_matches('.') {
        "" => "upload".to_owned(),
        trimmed => trimmed.to_owned(),
    }
}

fn remove_best_effort(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("Could not remove {:?}: {}", path, err),
    }
}

impl Gallery {
    pub fn new<P: Into<PathBuf>>(qr_dir: P, options: QrOptions) -> Self {
        Gallery {
            qr_dir: qr_dir.into(),
            options,
        }
    }

    pub fn qr_dir(&self) -> &Path {
        &self.qr_dir
    }

    /// Maps a stored relative URL to the file inside the QR directory.
    fn local_path(&self, url_path: &str) -> Option<PathBuf> {
        let name = url_path.rsplit('/').next()?;
        if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
            return None;
        }
        Some(self.qr_dir.join(name))
    }

    pub fn add_entry<D>(
        &self,
        db: &D,
        username: &str,
        new_entry: NewEntry,
        base_url: &str,
    ) -> Result<QrEntry>
    where
        D: UserDb,
        Error: From<D::Error>,
    {
        fs::create_dir_all(&self.qr_dir)?;
        let mut written = Vec::new();
        let res = self.write_entry(db, username, new_entry, base_url, &mut written);
        if res.is_err() {
            for path in &written {
                remove_best_effort(path);
            }
        }
        res
    }

    fn write_entry<D>(
        &self,
        db: &D,
        username: &str,
        new_entry: NewEntry,
        base_url: &str,
        written: &mut Vec<PathBuf>,
    ) -> Result<QrEntry>
    where
        D: UserDb,
        Error: From<D::Error>,
    {
        let NewEntry { name, source } = new_entry;
        let (content, source) = match source {
            QrSource::Text(text) => (text, None),
            QrSource::Upload { file_name, path } => {
                let stored = format!("{}_{}", new_token(), sanitize_file_name(&file_name));
                let target = self.qr_dir.join(&stored);
                fs::copy(&path, &target)?;
                written.push(target);
                (
                    format!("{}{}/{}", base_url, QR_URL_DIR, stored),
                    Some(format!("{}/{}", QR_URL_DIR, stored)),
                )
            }
        };

        let png = qr::encode(&content, &self.options)?;
        let token = new_token();
        let file_name = format!("qr_{}.png", token);
        let target = self.qr_dir.join(&file_name);
        fs::write(&target, png)?;
        written.push(target);

        let entry = QrEntry {
            name,
            file: format!("{}/{}", QR_URL_DIR, file_name),
            id: Some(token),
            source,
        };
        db.update_user(username, |user| {
            user.qr_codes.push(entry.clone());
            Ok::<_, Error>(())
        })?;
        info!("{} saved QR {:?} as {}", username, entry.name, entry.file);
        Ok(entry)
    }

    pub fn remove_entry<D>(&self, db: &D, username: &str, key: &str) -> Result<QrEntry>
    where
        D: UserDb,
        Error: From<D::Error>,
    {
        if key.is_empty() {
            return Err(Error::NotFound);
        }
        let removed = db.update_user(username, |user| {
            let position = user
                .qr_codes
                .iter()
                .position(|entry| entry.id.as_deref() == Some(key))
                .or_else(|| {
                    user.qr_codes
                        .iter()
                        .position(|entry| entry.file.ends_with(key))
                })
                .ok_or(Error::NotFound)?;
            Ok::<_, Error>(user.qr_codes.remove(position))
        })?;

        for url_path in std::iter::once(&removed.file).chain(removed.source.as_ref()) {
            if let Some(path) = self.local_path(url_path) {
                remove_best_effort(&path);
            }
        }
        info!("{} removed QR {:?}", username, removed.name);
        Ok(removed)
    }

    pub fn list_entries<D: UserDb>(&self, db: &D, username: Option<&str>) -> Vec<QrEntry> {
        username
            .and_then(|username| db.get_user(username))
            .map(|user| user.qr_codes)
            .unwrap_or_default()
    }
}
