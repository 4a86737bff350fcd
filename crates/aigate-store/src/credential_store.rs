use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use fs2::FileExt;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;

use crate::StoreError;

/// Fields persisted back into the primary credential file after a refresh.
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: OffsetDateTime,
    pub profile_arn: Option<String>,
}

/// Owns one credential file plus its sibling JSON overlays.
///
/// Split layouts (client-id JSON next to the refresh-token JSON) are common
/// for IDC logins, so loading merges every `*.json` in the directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge order: base64 bundle, then the primary file, then sibling JSON
    /// files. Sibling keys win over earlier layers, except `expiresAt`, which
    /// must come from the primary file. Missing files are not fatal.
    pub fn load(&self, base64_bundle: Option<&str>) -> Result<Map<String, Value>, StoreError> {
        let mut merged = Map::new();

        if let Some(bundle) = base64_bundle {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(bundle.trim())
                .map_err(|err| StoreError::Base64(err.to_string()))?;
            let value: Value = serde_json::from_slice(&decoded)
                .map_err(|err| StoreError::Base64(err.to_string()))?;
            if let Value::Object(object) = value {
                merged.extend(object);
            }
        }

        let primary_expires_at = match self.read_locked(&self.path)? {
            Some(object) => {
                let expires_at = object.get("expiresAt").cloned();
                merged.extend(object);
                expires_at
            }
            None => None,
        };

        if let Some(dir) = self.path.parent() {
            for sibling in list_sibling_json(dir, &self.path) {
                match self.read_locked(&sibling)? {
                    Some(object) => {
                        for (key, value) in object {
                            if key == "expiresAt" && primary_expires_at.is_some() {
                                continue;
                            }
                            merged.insert(key, value);
                        }
                    }
                    None => continue,
                }
            }
        }
        if let Some(expires_at) = primary_expires_at {
            merged.insert("expiresAt".to_string(), expires_at);
        }

        Ok(merged)
    }

    /// Persist refreshed tokens into the primary file, read-merge-write under
    /// an exclusive lock so a crash cannot lose keys other writers own.
    pub fn persist_refresh(&self, update: &TokenUpdate) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(|err| StoreError::io(dir, err))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|err| StoreError::io(&self.path, err))?;
        file.lock_exclusive()
            .map_err(|err| StoreError::io(&self.path, err))?;

        let result = self.persist_into(&mut file, update);
        if let Err(err) = fs2::FileExt::unlock(&file) {
            warn!(path = %self.path.display(), error = %err, "credential file unlock failed");
        }
        result
    }

    fn persist_into(&self, file: &mut File, update: &TokenUpdate) -> Result<(), StoreError> {
        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .map_err(|err| StoreError::io(&self.path, err))?;
        let mut object = if raw.trim().is_empty() {
            Map::new()
        } else {
            match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(object)) => object,
                Ok(_) | Err(_) => {
                    warn!(path = %self.path.display(), "credential file held non-object json, rewriting");
                    Map::new()
                }
            }
        };

        object.insert(
            "accessToken".to_string(),
            Value::String(update.access_token.clone()),
        );
        object.insert(
            "refreshToken".to_string(),
            Value::String(update.refresh_token.clone()),
        );
        let expires_at = update
            .expires_at
            .format(&Rfc3339)
            .map_err(|err| StoreError::Timestamp(err.to_string()))?;
        object.insert("expiresAt".to_string(), Value::String(expires_at));
        if let Some(profile_arn) = &update.profile_arn {
            object.insert(
                "profileArn".to_string(),
                Value::String(profile_arn.clone()),
            );
        }

        let serialized = serde_json::to_string_pretty(&Value::Object(object))
            .map_err(|err| StoreError::json(&self.path, err))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|err| StoreError::io(&self.path, err))?;
        file.set_len(0)
            .map_err(|err| StoreError::io(&self.path, err))?;
        file.write_all(serialized.as_bytes())
            .map_err(|err| StoreError::io(&self.path, err))
    }

    fn read_locked(&self, path: &Path) -> Result<Option<Map<String, Value>>, StoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(path, err)),
        };
        file.lock_shared().map_err(|err| StoreError::io(path, err))?;
        let mut raw = String::new();
        let read = (&file).read_to_string(&mut raw);
        if let Err(err) = fs2::FileExt::unlock(&file) {
            warn!(path = %path.display(), error = %err, "credential file unlock failed");
        }
        read.map_err(|err| StoreError::io(path, err))?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(object)) => Ok(Some(object)),
            Ok(_) => Ok(None),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unparseable credential json");
                Ok(None)
            }
        }
    }
}

fn list_sibling_json(dir: &Path, primary: &Path) -> Vec<PathBuf> {
    let mut siblings = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return siblings,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path == primary {
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            siblings.push(path);
        }
    }
    siblings.sort();
    siblings
}
