use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::{Map, Value};
use tracing::warn;

use aigate_provider_core::{ProviderInstance, ProviderType};

use crate::StoreError;

/// The pool persistence file: `{ providerType: [instance, ...], ... }`.
///
/// Writers replace only the provider types they manage; entries for any other
/// type already in the file are preserved verbatim.
#[derive(Debug, Clone)]
pub struct PoolFile {
    path: PathBuf,
}

impl PoolFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the file into typed instances. Unknown provider types and
    /// unparseable entries are skipped with a warning, never an error.
    pub fn load_instances(
        &self,
    ) -> Result<HashMap<ProviderType, Vec<ProviderInstance>>, StoreError> {
        let raw = self.read_raw()?;
        let mut pools = HashMap::new();
        for (tag, entries) in raw {
            let Some(provider_type) = ProviderType::parse(&tag) else {
                warn!(provider = %tag, "unknown provider type in pool file, leaving untouched");
                continue;
            };
            let Value::Array(entries) = entries else {
                warn!(provider = %tag, "pool file entry is not an array, skipping");
                continue;
            };
            let mut instances = Vec::with_capacity(entries.len());
            for entry in entries {
                match serde_json::from_value::<ProviderInstance>(entry) {
                    Ok(mut instance) => {
                        instance.provider_type = provider_type;
                        instances.push(instance);
                    }
                    Err(err) => {
                        warn!(provider = %tag, error = %err, "skipping unparseable pool entry");
                    }
                }
            }
            pools.insert(provider_type, instances);
        }
        Ok(pools)
    }

    /// Read-modify-write: replace only the given provider types, keep the
    /// rest of the file as-is. Creates the file (and parent dirs) on ENOENT.
    pub fn replace_types(
        &self,
        updates: &HashMap<ProviderType, Vec<ProviderInstance>>,
    ) -> Result<(), StoreError> {
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

        let result = self.replace_into(&mut file, updates);
        if let Err(err) = fs2::FileExt::unlock(&file) {
            warn!(path = %self.path.display(), error = %err, "pool file unlock failed");
        }
        result
    }

    fn replace_into(
        &self,
        file: &mut File,
        updates: &HashMap<ProviderType, Vec<ProviderInstance>>,
    ) -> Result<(), StoreError> {
        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .map_err(|err| StoreError::io(&self.path, err))?;
        let mut object = if raw.trim().is_empty() {
            Map::new()
        } else {
            match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(object)) => object,
                Ok(_) | Err(_) => {
                    warn!(path = %self.path.display(), "pool file held invalid json, rewriting");
                    Map::new()
                }
            }
        };

        for (provider_type, instances) in updates {
            let serialized = serde_json::to_value(instances)
                .map_err(|err| StoreError::json(&self.path, err))?;
            object.insert(provider_type.as_str().to_string(), serialized);
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

    fn read_raw(&self) -> Result<Map<String, Value>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(StoreError::io(&self.path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&raw).map_err(|err| StoreError::json(&self.path, err))? {
            Value::Object(object) => Ok(object),
            _ => Ok(Map::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_preserves_unmanaged_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs/provider_pools.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            serde_json::json!({
                "openai-custom": [{"uuid": "u1", "providerType": "openai-custom"}],
            })
            .to_string(),
        )
        .unwrap();

        let pool_file = PoolFile::new(&path);
        let mut updates = HashMap::new();
        updates.insert(
            ProviderType::ClaudeKiroOAuth,
            vec![ProviderInstance::new(ProviderType::ClaudeKiroOAuth)],
        );
        pool_file.replace_types(&updates).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["openai-custom"].is_array());
        assert_eq!(raw["claude-kiro-oauth"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn missing_file_reads_as_empty_and_is_created_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider_pools.json");

        let pool_file = PoolFile::new(&path);
        assert!(pool_file.load_instances().unwrap().is_empty());

        let mut updates = HashMap::new();
        updates.insert(
            ProviderType::ClaudeCustom,
            vec![ProviderInstance::new(ProviderType::ClaudeCustom)],
        );
        pool_file.replace_types(&updates).unwrap();
        assert!(path.exists());

        let pools = pool_file.load_instances().unwrap();
        assert_eq!(pools[&ProviderType::ClaudeCustom].len(), 1);
    }

    #[test]
    fn unknown_types_survive_round_trips_and_are_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider_pools.json");
        fs::write(
            &path,
            serde_json::json!({ "future-provider": [{"uuid": "x"}] }).to_string(),
        )
        .unwrap();

        let pool_file = PoolFile::new(&path);
        assert!(pool_file.load_instances().unwrap().is_empty());

        pool_file.replace_types(&HashMap::new()).unwrap();
        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["future-provider"].is_array());
    }

    #[test]
    fn dates_serialize_rfc3339() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider_pools.json");
        let pool_file = PoolFile::new(&path);

        let mut instance = ProviderInstance::new(ProviderType::ClaudeKiroOAuth);
        instance.last_used = Some(time::macros::datetime!(2026-02-03 04:05:06 UTC));
        let mut updates = HashMap::new();
        updates.insert(ProviderType::ClaudeKiroOAuth, vec![instance]);
        pool_file.replace_types(&updates).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("2026-02-03T04:05:06Z"));
    }
}
