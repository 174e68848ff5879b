use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use lcevc_functest::loader::{LoadOptions, finish, parse_definitions};
use lcevc_functest::{AssetCache, AssetOrigin, ParamMap, RunLevel};
use lcevc_functest_error::{FunctestError, Result};

/// Origin that answers slowly and counts every request by endpoint.
#[derive(Default)]
struct SlowOrigin {
    asset_calls: AtomicUsize,
    content_calls: AtomicUsize,
    encode_calls: AtomicUsize,
    listing: Vec<String>,
}

impl AssetOrigin for SlowOrigin {
    fn base_url(&self) -> &str {
        "http://herp.test"
    }

    fn fetch(&self, endpoint: &str, query: &[(&str, &str)], sink: &mut dyn Write) -> Result<u64> {
        thread::sleep(Duration::from_millis(25));
        let body = match (endpoint, query) {
            ("/content", []) => {
                self.content_calls.fetch_add(1, Ordering::SeqCst);
                serde_json::to_string(&self.listing)?
            }
            ("/content", [("file", name)]) => {
                self.content_calls.fetch_add(1, Ordering::SeqCst);
                format!("yuv:{name}")
            }
            ("/asset", _) => {
                self.asset_calls.fetch_add(1, Ordering::SeqCst);
                format!("asset:{query:?}")
            }
            ("/encode", _) => {
                self.encode_calls.fetch_add(1, Ordering::SeqCst);
                format!("encode:{query:?}")
            }
            _ => {
                return Err(FunctestError::Origin {
                    url: endpoint.to_owned(),
                    status: 404,
                    body: String::new(),
                });
            }
        };
        sink.write_all(body.as_bytes())?;
        Ok(body.len() as u64)
    }

    fn is_accessible(&self) -> bool {
        true
    }
}

fn encode_request() -> ParamMap {
    [
        ("input", "a.yuv"),
        ("base_recon", "b.yuv"),
        ("hash", "deadbeef"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_owned(), value.to_owned()))
    .collect()
}

#[test]
fn concurrent_requests_for_one_asset_fetch_it_once() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(SlowOrigin::default());
    let cache = AssetCache::new(dir.path(), origin.clone());

    let paths: Vec<PathBuf> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| cache.get_asset("streams/core/a.bin").unwrap()))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(origin.asset_calls.load(Ordering::SeqCst), 1);
    assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(paths[0].ends_with("assets/streams/core/a.bin"));
    let leftovers: Vec<_> = std::fs::read_dir(paths[0].parent().unwrap())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1, "temporary downloads left behind: {leftovers:?}");
}

#[test]
fn concurrent_encode_requests_share_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(SlowOrigin::default());
    let cache = AssetCache::new(dir.path(), origin.clone());
    let request = encode_request();

    let paths: Vec<PathBuf> = thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|_| scope.spawn(|| cache.get_encode(&request).unwrap()))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(origin.encode_calls.load(Ordering::SeqCst), 1);
    assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));

    // A second cache over the same directory finds the file on disk.
    let reopened = AssetCache::new(dir.path(), origin.clone());
    assert_eq!(reopened.get_encode(&request).unwrap(), paths[0]);
    assert_eq!(origin.encode_calls.load(Ordering::SeqCst), 1);
}

fn compliance_tests(bases: &[&str]) -> Vec<lcevc_functest::TestRecord> {
    let mut csv = String::from(
        "Test Function,Group,Enabled-Linux,Name,compliance:id,compliance:content,compliance:version,cli:--base\n",
    );
    for (index, base) in bases.iter().enumerate() {
        csv.push_str(&format!(
            "compliance_hash,core,MR,c{index},{index},stream,v3,{{BASE}}/{base}\n"
        ));
    }
    let options = LoadOptions {
        platform: "Linux".to_owned(),
        level: RunLevel::Mr,
        filter_group: None,
        filter_name: None,
        arch: "x86_64".to_owned(),
    };
    let mut tests = parse_definitions(csv.as_bytes(), "compliance.csv", &options, 0).unwrap();
    finish(&mut tests, &options).unwrap();
    tests
}

#[test]
fn bases_are_fetched_only_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(SlowOrigin {
        listing: vec!["a.yuv".to_owned(), "b.yuv".to_owned()],
        ..SlowOrigin::default()
    });
    let cache = AssetCache::new(dir.path(), origin.clone());
    std::fs::create_dir_all(cache.bases_dir()).unwrap();
    std::fs::write(cache.bases_dir().join("a.yuv"), b"present").unwrap();

    let tests = compliance_tests(&["a.yuv", "b.yuv"]);
    assert_eq!(cache.get_bases(&tests).unwrap(), 1);
    // Listing plus the one missing base.
    assert_eq!(origin.content_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        std::fs::read_to_string(cache.bases_dir().join("b.yuv")).unwrap(),
        "yuv:b.yuv"
    );

    assert_eq!(cache.get_bases(&tests).unwrap(), 0);
    assert_eq!(origin.content_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn bases_unknown_to_the_server_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(SlowOrigin {
        listing: vec!["a.yuv".to_owned()],
        ..SlowOrigin::default()
    });
    let cache = AssetCache::new(dir.path(), origin);
    let err = cache
        .get_bases(&compliance_tests(&["a.yuv", "ghost.yuv"]))
        .unwrap_err();
    assert!(err.to_string().contains("ghost.yuv"), "{err}");
}
