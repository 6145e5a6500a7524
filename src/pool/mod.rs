//! Candidate pool
//!
//! The pool is read once at startup from the candidate directory and never
//! changes afterwards. Files added later are picked up on the next restart.

use crate::{Error, Result};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Suffix of leftover probe configs written next to candidates by older tooling
const TEST_CONFIG_SUFFIX: &str = "_test";

/// One tunnel configuration under evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    id: String,
    path: PathBuf,
    params: Mapping,
}

impl Candidate {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, params: Mapping) -> Self {
        Candidate {
            id: id.into(),
            path: path.into(),
            params,
        }
    }

    /// Stable identity derived from the file stem
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Source file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connection parameters, passed through to the tunnel binary untouched
    pub fn params(&self) -> &Mapping {
        &self.params
    }

    /// Parse a candidate file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let id = candidate_id(path)
            .ok_or_else(|| Error::parse(format!("no usable file name: {}", path.display())))?;
        let content = fs::read_to_string(path).await?;
        let value: Value = serde_yaml::from_str(&content)
            .map_err(|e| Error::parse(format!("{}: {}", path.display(), e)))?;

        match value {
            Value::Mapping(params) => Ok(Candidate::new(id, path, params)),
            _ => Err(Error::parse(format!(
                "{}: top level is not a mapping",
                path.display()
            ))),
        }
    }
}

/// Derive the candidate id from a path, `None` when the file should not be
/// considered a candidate at all
fn candidate_id(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if !matches!(ext, "yaml" | "yml") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') || stem.ends_with(TEST_CONFIG_SUFFIX) {
        return None;
    }
    Some(stem.to_string())
}

/// Read-only registry of candidates for one run
#[derive(Debug, Clone)]
pub struct CandidatePool {
    source: PathBuf,
    candidates: BTreeMap<String, Arc<Candidate>>,
}

impl CandidatePool {
    /// Load every candidate file from `dir`
    ///
    /// Unparseable files are skipped with a warning. Two files mapping to the
    /// same id fail the whole load.
    pub async fn load(dir: &Path) -> Result<Self> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| Error::config(format!("cannot read {}: {}", dir.display(), e)))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if candidate_id(&path).is_some() {
                paths.push(path);
            } else {
                debug!("Skipping non-candidate file {}", path.display());
            }
        }
        // read_dir order is platform dependent
        paths.sort();

        let mut candidates = Vec::with_capacity(paths.len());
        for path in paths {
            match Candidate::from_file(&path).await {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => warn!("Ignoring invalid candidate: {}", e),
            }
        }

        let pool = Self::build(dir.to_path_buf(), candidates)?;
        info!(
            "Loaded {} candidate(s) from {}: {:?}",
            pool.len(),
            dir.display(),
            pool.ids()
        );
        Ok(pool)
    }

    /// Build a pool from already parsed candidates
    pub fn from_candidates(candidates: Vec<Candidate>) -> Result<Self> {
        Self::build(PathBuf::from("<memory>"), candidates)
    }

    fn build(source: PathBuf, candidates: Vec<Candidate>) -> Result<Self> {
        let mut map: BTreeMap<String, Arc<Candidate>> = BTreeMap::new();
        for candidate in candidates {
            if let Some(existing) = map.get(candidate.id()) {
                return Err(Error::DuplicateCandidate {
                    id: candidate.id().to_string(),
                    first: existing.path().display().to_string(),
                    second: candidate.path().display().to_string(),
                });
            }
            map.insert(candidate.id().to_string(), Arc::new(candidate));
        }

        if map.is_empty() {
            return Err(Error::EmptyPool(source.display().to_string()));
        }

        Ok(CandidatePool {
            source,
            candidates: map,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Candidate>> {
        self.candidates.get(id).cloned()
    }

    /// Candidates in id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Candidate>> {
        self.candidates.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.candidates.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// The only candidate, if the pool has exactly one
    pub fn single(&self) -> Option<Arc<Candidate>> {
        if self.candidates.len() == 1 {
            self.candidates.values().next().cloned()
        } else {
            None
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    const SAMPLE: &str = "server: vs5.example.top:57022
auth: 57903c8f
tls:
  sni: www.bing.com
  insecure: true
";

    fn write(dir: &Path, name: &str, content: &str) {
        stdfs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_candidate_id_rules() {
        assert_eq!(candidate_id(Path::new("/etc/hysteria/v5.yaml")), Some("v5".into()));
        assert_eq!(candidate_id(Path::new("/etc/hysteria/v5.yml")), Some("v5".into()));
        assert_eq!(candidate_id(Path::new("/etc/hysteria/v5_test.yaml")), None);
        assert_eq!(candidate_id(Path::new("/etc/hysteria/.hidden.yaml")), None);
        assert_eq!(candidate_id(Path::new("/etc/hysteria/readme.txt")), None);
    }

    #[tokio::test]
    async fn test_load_skips_invalid_and_test_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.yaml", SAMPLE);
        write(dir.path(), "a.yaml", SAMPLE);
        write(dir.path(), "a_test.yaml", SAMPLE);
        write(dir.path(), "broken.yaml", "- just\n- a list\n");
        write(dir.path(), "notes.txt", "hello");

        let pool = CandidatePool::load(dir.path()).await.unwrap();
        assert_eq!(pool.ids(), vec!["a", "b"]);
        let a = pool.get("a").unwrap();
        assert_eq!(
            a.params().get("server"),
            Some(&Value::from("vs5.example.top:57022"))
        );
    }

    #[tokio::test]
    async fn test_load_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken.yaml", "just a string\n");
        let err = CandidatePool::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::EmptyPool(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_load_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "node.yaml", SAMPLE);
        write(dir.path(), "node.yml", SAMPLE);
        let err = CandidatePool::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateCandidate { ref id, .. } if id == "node"));
    }

    #[test]
    fn test_single() {
        let pool = CandidatePool::from_candidates(vec![Candidate::new(
            "only",
            "/tmp/only.yaml",
            Mapping::new(),
        )])
        .unwrap();
        assert_eq!(pool.single().unwrap().id(), "only");
    }
}
