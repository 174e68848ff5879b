//! Regression hash ledger.
//!
//! Expected hashes live in one JSON document per test module at
//! `{data_dir}/{module}/{module}.json`, mapping a canonical key
//! `module[value1_value2_...]` to `{ surface: hash }`. Documents are loaded
//! lazily, mutated in memory during a run, and written back only by
//! [`RegressionHashStore::save`], which the orchestrator calls once after a
//! run with no failures.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use lcevc_functest_error::{FunctestError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::record::TestRecord;

/// Hashes of one test, keyed by surface name.
pub type HashEntry = BTreeMap<String, String>;

type Document = BTreeMap<String, HashEntry>;

/// The parameters that identify a test's outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestIdentity {
    /// Document the entry lives in.
    pub module: String,
    /// `(param, value)` pairs in resolution order.
    pub params: Vec<(String, String)>,
}

impl TestIdentity {
    #[must_use]
    pub fn new(module: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            module: module.into(),
            params,
        }
    }

    /// Identity of a loaded test: its function name and non-metadata parameters.
    #[must_use]
    pub fn of_record(record: &TestRecord) -> Self {
        Self::new(record.function.as_str(), record.identity_params())
    }

    /// Canonical ledger key, leaving out parameters named in `excluded`.
    #[must_use]
    pub fn key(&self, excluded: &[String]) -> String {
        let values: Vec<&str> = self
            .params
            .iter()
            .filter(|(param, _)| !excluded.iter().any(|ex| ex == param))
            .map(|(_, value)| value.as_str())
            .collect();
        format!("{}[{}]", self.module, values.join("_"))
    }
}

#[derive(Debug, Default)]
struct LoadedDocument {
    entries: Document,
    dirty: bool,
}

/// JSON-backed store of expected hashes.
#[derive(Debug)]
pub struct RegressionHashStore {
    data_dir: PathBuf,
    documents: Mutex<BTreeMap<String, LoadedDocument>>,
}

impl RegressionHashStore {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            documents: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn document_path(&self, module: &str) -> PathBuf {
        self.data_dir.join(module).join(format!("{module}.json"))
    }

    /// Hashes recorded for `identity`.
    ///
    /// Under `full_regen` a missing document or entry starts out empty;
    /// otherwise a missing entry is an error.
    ///
    /// # Errors
    ///
    /// [`FunctestError::MissingHashes`] when the entry is absent and not
    /// regenerating, or an I/O or JSON error reading the document.
    pub fn get(
        &self,
        identity: &TestIdentity,
        full_regen: bool,
        excluded: &[String],
    ) -> Result<HashEntry> {
        let key = identity.key(excluded);
        let mut documents = self.documents.lock();
        let document = self.document(&mut documents, &identity.module, full_regen)?;
        if let Some(entry) = document.entries.get(&key) {
            return Ok(entry.clone());
        }
        if !full_regen {
            return Err(FunctestError::MissingHashes(key));
        }
        debug!(key = %key, "creating empty hash entry for regeneration");
        document.entries.insert(key, HashEntry::new());
        document.dirty = true;
        Ok(HashEntry::new())
    }

    /// Replace the entry for `identity` with freshly generated hashes.
    pub fn record(
        &self,
        identity: &TestIdentity,
        excluded: &[String],
        hashes: HashEntry,
    ) -> Result<()> {
        let key = identity.key(excluded);
        let mut documents = self.documents.lock();
        let document = self.document(&mut documents, &identity.module, true)?;
        document.entries.insert(key, hashes);
        document.dirty = true;
        Ok(())
    }

    fn document<'a>(
        &self,
        documents: &'a mut BTreeMap<String, LoadedDocument>,
        module: &str,
        full_regen: bool,
    ) -> Result<&'a mut LoadedDocument> {
        if !documents.contains_key(module) {
            let path = self.document_path(module);
            let entries = if full_regen && !path.exists() {
                Document::new()
            } else {
                let text = std::fs::read_to_string(&path).map_err(|err| {
                    FunctestError::assertion(format!(
                        "unable to read hash document '{}': {err}",
                        path.display()
                    ))
                })?;
                serde_json::from_str(&text)?
            };
            documents.insert(
                module.to_owned(),
                LoadedDocument {
                    entries,
                    dirty: false,
                },
            );
        }
        documents
            .get_mut(module)
            .ok_or_else(|| FunctestError::assertion(format!("hash document '{module}' vanished")))
    }

    /// Write every modified document back as 4-space indented JSON.
    /// Returns the number of documents written.
    pub fn save(&self) -> Result<usize> {
        let mut documents = self.documents.lock();
        let mut written = 0;
        for (module, document) in documents.iter_mut().filter(|(_, doc)| doc.dirty) {
            let path = self.document_path(module);
            let parent = path.parent().ok_or_else(|| {
                FunctestError::assertion(format!("no parent for '{}'", path.display()))
            })?;
            std::fs::create_dir_all(parent)?;
            let mut temp = NamedTempFile::new_in(parent)?;
            temp.write_all(&to_pretty_json(&document.entries)?)?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|err| err.error)?;
            document.dirty = false;
            written += 1;
            info!(
                path = %path.display(),
                entries = document.entries.len(),
                "saved regression hashes"
            );
        }
        Ok(written)
    }
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    Ok(out)
}
