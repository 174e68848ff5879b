//! Content-addressed asset cache backed by the asset server.
//!
//! Every asset resolves to a deterministic path under the cache root. A file
//! that exists at that path is never fetched again. Downloads are written to
//! a uniquely named temporary file in the target directory and then moved
//! into place without clobbering, so a reader never sees a partial file and
//! the slower of two concurrent writers simply discards its copy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lcevc_functest_error::{FunctestError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::ser::Formatter;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::checksum::md5_hex;
use crate::config::SuiteConfig;
use crate::context::absolute;
use crate::record::{ParamGroup, ParamMap, TestRecord};
use crate::runner::{LocalRunner, ProcessRunner};

const CONFORMANCE_VERSIONS: [&str; 3] = ["v2", "v3", "v4"];
const DEFAULT_ENCODE_TYPE: &str = "ts";
const BASE_PLACEHOLDER: &str = "{BASE}/";

// ─── Origin ────────────────────────────────────────────────────────────

/// Remote source of assets.
pub trait AssetOrigin: Send + Sync {
    fn base_url(&self) -> &str;

    /// GET `{base_url}{endpoint}` with `query`, streaming the body into `sink`.
    ///
    /// # Errors
    ///
    /// [`FunctestError::Origin`] for a non-2xx answer (carrying the body) and
    /// [`FunctestError::OriginUnreachable`] when no answer arrives at all.
    fn fetch(&self, endpoint: &str, query: &[(&str, &str)], sink: &mut dyn Write) -> Result<u64>;

    /// Whether the origin answers at all.
    fn is_accessible(&self) -> bool;
}

/// Plain HTTP origin. Failed requests are not retried.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpOrigin {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(10))
                .build(),
        }
    }
}

impl AssetOrigin for HttpOrigin {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn fetch(&self, endpoint: &str, query: &[(&str, &str)], sink: &mut dyn Write) -> Result<u64> {
        let url = format!("{}{endpoint}", self.base_url);
        let mut request = self.agent.get(&url);
        for (name, value) in query {
            request = request.query(name, value);
        }
        match request.call() {
            Ok(response) => Ok(std::io::copy(&mut response.into_reader(), sink)?),
            Err(ureq::Error::Status(status, response)) => Err(FunctestError::Origin {
                url,
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(transport)) => Err(FunctestError::OriginUnreachable {
                url,
                detail: transport.to_string(),
            }),
        }
    }

    fn is_accessible(&self) -> bool {
        match self.agent.get(&self.base_url).call() {
            Ok(_) | Err(ureq::Error::Status(..)) => true,
            Err(ureq::Error::Transport(_)) => false,
        }
    }
}

// ─── Local encoder ─────────────────────────────────────────────────────

/// Settings for producing encodes with a local ERP instead of the origin.
#[derive(Debug, Clone)]
pub struct LocalEncoder {
    pub erp_path: PathBuf,
    pub suite: SuiteConfig,
}

impl LocalEncoder {
    fn encode(&self, params: &ParamMap, output: &Path, cancel: &CancellationToken) -> Result<()> {
        let workdir = tempfile::tempdir()?;
        let mut runner = LocalRunner::new(&self.erp_path, workdir.path(), &self.suite);
        for (name, value) in params {
            runner.set_param(name, value);
        }
        runner.set_path_param("output", output)?;
        info!(command = %runner.get_command_line().join(" "), "regenerating encode locally");
        runner.run_checked(cancel)?;
        Ok(())
    }
}

// ─── Cache ─────────────────────────────────────────────────────────────

/// Fetch-once cache of encodes, conformance streams, assets and bases.
pub struct AssetCache {
    root: PathBuf,
    origin: Arc<dyn AssetOrigin>,
    encoder_version: Option<String>,
    local_encoder: Option<LocalEncoder>,
    cancel: CancellationToken,
    in_flight: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("root", &self.root)
            .field("origin", &self.origin.base_url())
            .field("encoder_version", &self.encoder_version)
            .finish_non_exhaustive()
    }
}

impl AssetCache {
    pub fn new(root: impl Into<PathBuf>, origin: Arc<dyn AssetOrigin>) -> Self {
        Self {
            root: root.into(),
            origin,
            encoder_version: None,
            local_encoder: None,
            cancel: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Cache configured from the suite settings.
    pub fn from_config(config: &SuiteConfig, origin: Arc<dyn AssetOrigin>) -> Self {
        let local_encoder = match (&config.erp_path, config.regen_encodes) {
            (Some(erp_path), true) => Some(LocalEncoder {
                erp_path: erp_path.clone(),
                suite: config.clone(),
            }),
            _ => None,
        };
        let mut cache = Self::new(&config.cache_path, origin);
        cache.encoder_version.clone_from(&config.encoder_version);
        cache.local_encoder = local_encoder;
        cache
    }

    #[must_use]
    pub fn with_encoder_version(mut self, version: impl Into<String>) -> Self {
        self.encoder_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_local_encoder(mut self, encoder: LocalEncoder) -> Self {
        self.local_encoder = Some(encoder);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn origin(&self) -> &dyn AssetOrigin {
        self.origin.as_ref()
    }

    #[must_use]
    pub fn assets_dir(&self) -> PathBuf {
        self.root.join("assets")
    }

    #[must_use]
    pub fn bases_dir(&self) -> PathBuf {
        self.root.join("bases")
    }

    /// Whether the origin can be reached.
    #[must_use]
    pub fn origin_accessible(&self) -> bool {
        self.origin.is_accessible()
    }

    /// A stored asset addressed by its path on the asset server.
    pub fn get_asset(&self, asset: &str) -> Result<PathBuf> {
        let path = self.assets_dir().join(asset);
        self.fetch_once(&path, |temp| {
            self.download("/asset", &[("path", asset)], temp)
        })
    }

    /// An encode for `params`, keyed by encoder build and parameter digest.
    ///
    /// `hash` selects the encoder build (falling back to the configured
    /// encoder version) and `type` the container (default `ts`); both are
    /// left out of the digest.
    pub fn get_encode(&self, params: &ParamMap) -> Result<PathBuf> {
        let mut params = params.clone();
        let build_hash = params
            .remove("hash")
            .or_else(|| self.encoder_version.clone());
        let stream_type = params
            .remove("type")
            .unwrap_or_else(|| DEFAULT_ENCODE_TYPE.to_owned());
        let path = self.root.join("encodes").join(format!(
            "{}-{}.{stream_type}",
            build_hash.as_deref().unwrap_or("None"),
            encode_param_digest(&params)?
        ));

        self.fetch_once(&path, |temp| {
            if let Some(encoder) = &self.local_encoder {
                return encoder.encode(&params, temp.path(), &self.cancel);
            }
            let Some(build_hash) = build_hash.as_deref() else {
                return Err(FunctestError::config(
                    "an ENCODER_VERSION must be configured to fetch encodes",
                ));
            };
            let mut query = vec![("type", stream_type.as_str()), ("hash", build_hash)];
            query.extend(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            self.download("/encode", &query, temp)
        })
    }

    /// A conformance stream and, when `with_config` is set, its config.
    pub fn get_conformance(
        &self,
        version: &str,
        conformance_id: &str,
        content: &str,
        stream_type: &str,
        with_config: bool,
    ) -> Result<(PathBuf, PathBuf)> {
        if !CONFORMANCE_VERSIONS.contains(&version) {
            return Err(FunctestError::assertion(format!(
                "conformance version must be one of v2, v3 or v4, not '{version}'"
            )));
        }
        let dir = self.root.join("conformance").join(version);
        let stream_path = dir.join(format!("{conformance_id}_{content}.{stream_type}"));
        let config_path = dir.join(format!("{conformance_id}_{content}.cfg"));
        let query = [
            ("version", version),
            ("id", conformance_id),
            ("content", content),
        ];

        let stream_path = self.fetch_once(&stream_path, |temp| {
            let mut stream_query = query.to_vec();
            stream_query.push(("type", stream_type));
            self.download("/conformance_stream", &stream_query, temp)
        })?;
        let config_path = if with_config {
            self.fetch_once(&config_path, |temp| {
                self.download("/conformance_config", &query, temp)
            })?
        } else {
            absolute(&config_path)
        };
        Ok((stream_path, config_path))
    }

    /// Compliance bitstream and its config.
    pub fn get_compliance(
        &self,
        version: &str,
        compliance_id: &str,
        content: &str,
    ) -> Result<(PathBuf, PathBuf)> {
        self.get_conformance(version, compliance_id, content, "bit", true)
    }

    /// Download the `{BASE}` YUVs referenced by enabled tests that are not in
    /// the bases directory yet. Returns how many were fetched.
    pub fn get_bases(&self, tests: &[TestRecord]) -> Result<usize> {
        let bases_dir = self.bases_dir();
        std::fs::create_dir_all(&bases_dir)?;
        let required: BTreeSet<String> = tests
            .iter()
            .filter(|test| test.enabled)
            .filter_map(|test| test.params.get(ParamGroup::Cli, "--base"))
            .filter_map(|base| base.strip_prefix(BASE_PLACEHOLDER))
            .map(str::to_owned)
            .collect();
        let present: BTreeSet<String> = std::fs::read_dir(&bases_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        let missing: Vec<&String> = required.difference(&present).collect();
        if missing.is_empty() {
            return Ok(0);
        }

        info!(count = missing.len(), "missing base YUVs, retrieving from the asset server");
        let mut listing = Vec::new();
        self.origin.fetch("/content", &[], &mut listing)?;
        let available: BTreeSet<String> = serde_json::from_slice(&listing)?;
        let unavailable: Vec<&str> = missing
            .iter()
            .filter(|base| !available.contains(base.as_str()))
            .map(|base| base.as_str())
            .collect();
        if !unavailable.is_empty() {
            return Err(FunctestError::assertion(format!(
                "bases not available on the asset server: {}",
                unavailable.join(", ")
            )));
        }

        for base in &missing {
            info!(base = %base, "downloading base");
            self.fetch_once(&bases_dir.join(base), |temp| {
                self.download("/content", &[("file", base.as_str())], temp)
            })?;
        }
        Ok(missing.len())
    }

    fn download(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        temp: &mut NamedTempFile,
    ) -> Result<()> {
        self.cancel.check()?;
        let started = Instant::now();
        let bytes = self.origin.fetch(endpoint, query, temp.as_file_mut())?;
        debug!(
            endpoint,
            bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetched from asset server"
        );
        Ok(())
    }

    /// Return `path`, filling it through `fill` first if it does not exist.
    fn fetch_once<F>(&self, path: &Path, fill: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut NamedTempFile) -> Result<()>,
    {
        if path.is_file() {
            return Ok(absolute(path));
        }
        let slot = {
            let mut in_flight = self.in_flight.lock();
            Arc::clone(in_flight.entry(path.to_path_buf()).or_default())
        };
        let _guard = slot.lock();
        if path.is_file() {
            return Ok(absolute(path));
        }

        let dir = path.parent().ok_or_else(|| {
            FunctestError::assertion(format!("no parent for '{}'", path.display()))
        })?;
        std::fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        fill(&mut temp)?;
        temp.as_file_mut().flush()?;
        match temp.persist_noclobber(path) {
            Ok(_) => info!(path = %path.display(), "cached asset"),
            Err(err) if path.is_file() => {
                debug!(path = %path.display(), "asset appeared concurrently, discarding download");
                drop(err.file);
            }
            Err(err) => return Err(err.error.into()),
        }
        Ok(absolute(path))
    }
}

/// MD5 of the parameters serialised as a key-sorted JSON object in the
/// `{"key": "value", ...}` layout the asset server keys encodes by.
pub fn encode_param_digest(params: &ParamMap) -> Result<String> {
    Ok(md5_hex(sorted_json(params)?.as_bytes()))
}

fn sorted_json(params: &BTreeMap<String, String>) -> Result<String> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedAsciiFormatter);
    params.serialize(&mut serializer)?;
    String::from_utf8(out)
        .map_err(|err| FunctestError::assertion(format!("encode parameters: {err}")))
}

/// Compact JSON with `", "` and `": "` separators and every non-ASCII
/// character written as a `\uXXXX` escape.
struct SpacedAsciiFormatter;

impl Formatter for SpacedAsciiFormatter {
    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            return Ok(());
        }
        writer.write_all(b", ")
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(&fragment.as_bytes()[start..index])?;
            let mut units = [0_u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            start = index + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOrigin {
        calls: AtomicUsize,
        status: Option<u16>,
    }

    impl CountingOrigin {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                status: None,
            })
        }
    }

    impl AssetOrigin for CountingOrigin {
        fn base_url(&self) -> &str {
            "http://mock"
        }

        fn fetch(&self, endpoint: &str, query: &[(&str, &str)], sink: &mut dyn Write) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.status {
                return Err(FunctestError::Origin {
                    url: endpoint.to_owned(),
                    status,
                    body: "encoder exploded".to_owned(),
                });
            }
            let body = format!("{endpoint}?{query:?}");
            sink.write_all(body.as_bytes())?;
            Ok(body.len() as u64)
        }

        fn is_accessible(&self) -> bool {
            true
        }
    }

    fn params(pairs: &[(&str, &str)]) -> ParamMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn digest_matches_sorted_json_layout() {
        let encode = params(&[("input", "a.yuv"), ("base_recon", "b.yuv")]);
        assert_eq!(
            sorted_json(&encode).unwrap(),
            r#"{"base_recon": "b.yuv", "input": "a.yuv"}"#
        );
        assert_eq!(
            encode_param_digest(&encode).unwrap(),
            "e5271bcf3bfc5fd918f7c82bd66f5b84"
        );
        assert_eq!(
            sorted_json(&params(&[("name", "café\n\"x\"")])).unwrap(),
            r#"{"name": "caf\u00e9\n\"x\""}"#
        );
        assert_eq!(
            sorted_json(&params(&[("clef", "𝄞"), ("bell", "\u{7}")])).unwrap(),
            r#"{"bell": "\u0007", "clef": "\ud834\udd1e"}"#
        );
        assert_eq!(sorted_json(&BTreeMap::new()).unwrap(), "{}");
    }

    #[test]
    fn identical_encode_requests_fetch_once() {
        let dir = tempfile::tempdir().unwrap();
        let origin = CountingOrigin::ok();
        let cache = AssetCache::new(dir.path(), origin.clone());
        let request = params(&[("input", "a.yuv"), ("base_recon", "b.yuv"), ("hash", "deadbeef")]);

        let first = cache.get_encode(&request).unwrap();
        let second = cache.get_encode(&request).unwrap();

        assert_eq!(first, second);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.file_name().unwrap().to_str().unwrap(),
            "deadbeef-e5271bcf3bfc5fd918f7c82bd66f5b84.ts"
        );
    }

    #[test]
    fn encoder_version_distinguishes_builds() {
        let dir = tempfile::tempdir().unwrap();
        let request = params(&[("input", "a.yuv"), ("type", "bin")]);
        let a = AssetCache::new(dir.path(), CountingOrigin::ok())
            .with_encoder_version("1111")
            .get_encode(&request)
            .unwrap();
        let b = AssetCache::new(dir.path(), CountingOrigin::ok())
            .with_encoder_version("2222")
            .get_encode(&request)
            .unwrap();
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(".bin"));
    }

    #[test]
    fn encode_without_any_build_hash_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::new(dir.path(), CountingOrigin::ok());
        let err = cache.get_encode(&params(&[("input", "a.yuv")])).unwrap_err();
        assert!(err.is_infrastructure());
    }

    #[test]
    fn origin_errors_surface_the_body_and_leave_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Arc::new(CountingOrigin {
            calls: AtomicUsize::new(0),
            status: Some(500),
        });
        let cache = AssetCache::new(dir.path(), origin);
        let err = cache.get_asset("streams/a.bin").unwrap_err();
        assert!(err.to_string().contains("encoder exploded"));
        let leftovers = std::fs::read_dir(dir.path().join("assets/streams")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn conformance_fetches_stream_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let origin = CountingOrigin::ok();
        let cache = AssetCache::new(dir.path(), origin.clone());
        let (stream, config) = cache.get_compliance("v3", "C01", "crowd").unwrap();
        assert!(stream.ends_with("conformance/v3/C01_crowd.bit"));
        assert!(config.ends_with("conformance/v3/C01_crowd.cfg"));
        assert!(std::fs::read_to_string(&stream).unwrap().starts_with("/conformance_stream"));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);

        assert!(cache.get_conformance("v9", "C01", "crowd", "bit", true).is_err());
    }
}
