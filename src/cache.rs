//! The versioned on-disk cache of vocabularies and regex dead-prefix tries.
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::regex::derivative::DeadPrefixTrie;
use crate::vocabulary::{CreateVocabularyError, Vocabulary, VocabularyRecord};

/// The version of the cache layout. A directory with another version is wiped.
pub const CACHE_VERSION: &str = "1";

const VERSION_FILE: &str = "cache-version";

#[derive(Debug, thiserror::Error)]
/// The error type for the on-disk cache.
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    /// A cache file could not be read or written.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed cache file {path}: {source}")]
    /// A cache file is not valid JSON.
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    /// A cached vocabulary is invalid.
    Vocabulary(#[from] CreateVocabularyError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A cache directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Opens `root`, creating it or wiping it when its version differs from
    /// [`CACHE_VERSION`].
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        let version_path = root.join(VERSION_FILE);
        match fs::read_to_string(&version_path) {
            Ok(version) if version.trim() == CACHE_VERSION => {}
            Ok(version) => {
                log::info!(
                    "Cache {} has version {:?}, expected {:?}; wiping it.",
                    root.display(),
                    version.trim(),
                    CACHE_VERSION
                );
                fs::remove_dir_all(&root).map_err(io_error(&root))?;
            }
            Err(_) => {}
        }
        fs::create_dir_all(&root).map_err(io_error(&root))?;
        fs::write(&version_path, CACHE_VERSION).map_err(io_error(&version_path))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, kind: &str, model: &str) -> PathBuf {
        let key: String = model
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{}-{}.json", kind, key))
    }

    fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), CacheError> {
        let file = fs::File::create(path).map_err(io_error(path))?;
        serde_json::to_writer(BufWriter::new(file), value).map_err(|source| CacheError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, CacheError> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(path)(e)),
        };
        serde_json::from_reader(BufReader::new(file))
            .map(Some)
            .map_err(|source| CacheError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn store_vocabulary(&self, model: &str, vocabulary: &Vocabulary) -> Result<(), CacheError> {
        self.write_json(&self.path("vocab", model), &vocabulary.to_record())
    }

    pub fn load_vocabulary(&self, model: &str) -> Result<Option<Vocabulary>, CacheError> {
        match self.read_json::<VocabularyRecord>(&self.path("vocab", model))? {
            Some(record) => Ok(Some(Vocabulary::from_record(record)?)),
            None => Ok(None),
        }
    }

    pub fn store_dead_prefixes(
        &self,
        model: &str,
        tries: &[(String, DeadPrefixTrie)],
    ) -> Result<(), CacheError> {
        self.write_json(&self.path("dead-prefixes", model), &tries)
    }

    pub fn load_dead_prefixes(&self, model: &str) -> Result<Vec<(String, DeadPrefixTrie)>, CacheError> {
        Ok(self
            .read_json(&self.path("dead-prefixes", model))?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_wipes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(VERSION_FILE), "0").unwrap();
        fs::write(root.join("stale.json"), "{}").unwrap();
        let cache = DiskCache::open(&root).unwrap();
        assert!(!root.join("stale.json").exists());
        assert_eq!(
            fs::read_to_string(cache.root().join(VERSION_FILE)).unwrap(),
            CACHE_VERSION
        );
    }

    #[test]
    fn vocabulary_survives_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        let vocabulary = Vocabulary::from_strings(["a", "b", "ab"]).unwrap();
        cache.store_vocabulary("random(seed=1)", &vocabulary).unwrap();
        let loaded = cache.load_vocabulary("random(seed=1)").unwrap().unwrap();
        assert_eq!(loaded.token_id_of_text("ab"), Some(2));
        assert!(cache.load_vocabulary("other").unwrap().is_none());
    }

    #[test]
    fn dead_prefixes_survive_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        let mut trie = DeadPrefixTrie::default();
        trie.insert("xy");
        cache
            .store_dead_prefixes("m", &[("[a-z]+".to_string(), trie.clone())])
            .unwrap();
        let loaded = cache.load_dead_prefixes("m").unwrap();
        assert_eq!(loaded, vec![("[a-z]+".to_string(), trie)]);
    }
}
