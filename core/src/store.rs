use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Filesystem-backed key/value store used for snapshots, caches and backups.
#[derive(Clone)]
pub struct FsKv {
    root: PathBuf,
}

/// Minimal key/value interface over byte keys and values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &[u8], val: &[u8]) -> Result<()>;
    /// Delete `key`; returns `true` if a value existed.
    fn delete(&self, key: &[u8]) -> bool;
    /// All keys currently stored, in no particular order.
    fn keys(&self) -> Vec<Vec<u8>>;
}

/// Serde helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key` using `bincode`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key) {
            Some(bytes) => {
                let v = bincode::deserialize::<T>(&bytes)
                    .with_context(|| "bincode deserialize")?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
    /// Serialize `val` with `bincode` and store at `key`.
    fn put_t<T: Serialize>(&self, key: &[u8], val: &T) -> Result<()> {
        let buf = bincode::serialize(val).with_context(|| "bincode serialize")?;
        self.put(key, &buf)
    }
    /// Deserialize JSON stored at `key`. Used for self-describing payloads
    /// (`serde_json::Value`) that bincode cannot round-trip.
    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key) {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).with_context(|| "json deserialize")?,
            )),
            None => Ok(None),
        }
    }
    /// Serialize `val` as JSON and store at `key`.
    fn put_json<T: Serialize>(&self, key: &[u8], val: &T) -> Result<()> {
        let buf = serde_json::to_vec(val).with_context(|| "json serialize")?;
        self.put(key, &buf)
    }
    /// Keys under namespace `ns` (see [`ns`]), returned without the prefix.
    fn keys_in(&self, namespace: &str) -> Vec<String> {
        let prefix = format!("{namespace}:");
        let mut out: Vec<String> = self
            .keys()
            .into_iter()
            .filter_map(|k| String::from_utf8(k).ok())
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        out.sort();
        out
    }
}
impl<T: Kv> KvSerde for T {}

/// Default KV type exported by this crate (FS-backed).
pub type DefaultKv = FsKv;

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_default<P: AsRef<Path>>(dir: P) -> Result<DefaultKv> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)
        .with_context(|| format!("create kv dir {}", root.display()))?;
    Ok(FsKv { root })
}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    let mut s = String::with_capacity(ns.len() + 1 + key.len());
    s.push_str(ns);
    s.push(':');
    s.push_str(key);
    s.into_bytes()
}

/* --------------------- impl FsKv --------------------- */

impl FsKv {
    fn path_for(&self, key: &[u8]) -> PathBuf {
        // Windows-safe: map arbitrary bytes to a hex file name.
        self.root.join(hex::encode(key))
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        let mut f = fs::File::open(&path).ok()?;
        let mut buf = Vec::new();
        if f.read_to_end(&mut buf).is_ok() { Some(buf) } else { None }
    }

    fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        // Write temp then rename so readers never see a torn value.
        let tmp = path.with_extension("tmp");
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(val)?;
        f.sync_all()?;
        fs::rename(&tmp, &path).with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        let path = self.path_for(key);
        fs::remove_file(path).is_ok()
    }

    fn keys(&self) -> Vec<Vec<u8>> {
        let Ok(entries) = fs::read_dir(&self.root) else { return Vec::new() };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| !name.ends_with(".tmp"))
            .filter_map(|name| hex::decode(name).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Counter {
        runs: u64,
        label: String,
    }

    #[test]
    fn typed_and_json_values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();

        let c = Counter { runs: 3, label: "ok".into() };
        kv.put_t(&ns("status", "counter"), &c).unwrap();
        assert_eq!(kv.get_t::<Counter>(&ns("status", "counter")).unwrap(), Some(c));

        let v = serde_json::json!({"riders": [{"name": "Tadej Pogacar"}]});
        kv.put_json(&ns("cache", "team"), &v).unwrap();
        assert_eq!(kv.get_json::<serde_json::Value>(&ns("cache", "team")).unwrap(), Some(v));
    }

    #[test]
    fn keys_are_listed_per_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();
        kv.put(&ns("backup", "b2"), b"2").unwrap();
        kv.put(&ns("backup", "b1"), b"1").unwrap();
        kv.put(&ns("status", "snapshot"), b"x").unwrap();

        assert_eq!(kv.keys_in("backup"), vec!["b1".to_string(), "b2".to_string()]);
        assert!(kv.delete(&ns("backup", "b1")));
        assert!(!kv.delete(&ns("backup", "b1")));
        assert_eq!(kv.keys_in("backup"), vec!["b2".to_string()]);
    }
}
