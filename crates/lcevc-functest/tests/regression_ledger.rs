use lcevc_functest::loader::{LoadOptions, finish, parse_definitions};
use lcevc_functest::{HashEntry, RegressionHashStore, RunLevel, TestIdentity, TestRecord};
use lcevc_functest_error::FunctestError;
use proptest::prelude::*;

fn hashes(pairs: &[(&str, &str)]) -> HashEntry {
    pairs
        .iter()
        .map(|(surface, hash)| ((*surface).to_owned(), (*hash).to_owned()))
        .collect()
}

fn default_exclusions() -> Vec<String> {
    vec!["base".to_owned(), "disable_simd".to_owned()]
}

fn load(csv: &str) -> Vec<TestRecord> {
    let options = LoadOptions {
        platform: "Linux".to_owned(),
        level: RunLevel::Mr,
        filter_group: None,
        filter_name: None,
        arch: "x86_64".to_owned(),
    };
    let mut tests = parse_definitions(csv.as_bytes(), "harness.csv", &options, 0).unwrap();
    finish(&mut tests, &options).unwrap();
    tests
}

#[test]
fn saved_hashes_come_back_from_a_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let identity = TestIdentity::new(
        "compliance_hash",
        vec![
            ("id".to_owned(), "12".to_owned()),
            ("base".to_owned(), "{BASE}/a.yuv".to_owned()),
        ],
    );
    let written = hashes(&[("base", "0a1b"), ("high", "2c3d")]);

    let store = RegressionHashStore::new(dir.path());
    store.get(&identity, true, &default_exclusions()).unwrap();
    store
        .record(&identity, &default_exclusions(), written.clone())
        .unwrap();
    assert_eq!(store.save().unwrap(), 1);

    let fresh = RegressionHashStore::new(dir.path());
    assert_eq!(
        fresh.get(&identity, false, &default_exclusions()).unwrap(),
        written
    );
    let document = fresh.document_path("compliance_hash");
    assert!(document.ends_with("compliance_hash/compliance_hash.json"));
    let text = std::fs::read_to_string(document).unwrap();
    assert!(text.contains("\"compliance_hash[12]\""), "{text}");
}

#[test]
fn absent_key_is_an_error_rather_than_empty_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let store = RegressionHashStore::new(dir.path());
    let known = TestIdentity::new("asset_hash", vec![("input".to_owned(), "a".to_owned())]);
    store.record(&known, &[], hashes(&[("hash", "aa")])).unwrap();
    store.save().unwrap();

    let fresh = RegressionHashStore::new(dir.path());
    let unknown = TestIdentity::new("asset_hash", vec![("input".to_owned(), "b".to_owned())]);
    let err = fresh.get(&unknown, false, &[]).unwrap_err();
    assert!(matches!(err, FunctestError::MissingHashes(ref key) if key == "asset_hash[b]"));
    assert!(err.to_string().contains("no hashes for asset_hash[b]"), "{err}");
}

#[test]
fn simd_toggle_shares_a_key_only_when_excluded() {
    let tests = load(
        "Test Function,Group,Enabled-Linux,compliance:id,compliance:content,compliance:version,cli:--base,cli:disable_simd\n\
         compliance_hash,core,MR,7,stream,v3,{BASE}/a.yuv,0\n\
         compliance_hash,core,MR,7,stream,v3,{BASE}/a.yuv,1\n",
    );
    assert_ne!(tests[0].name, tests[1].name);
    let first = TestIdentity::of_record(&tests[0]);
    let second = TestIdentity::of_record(&tests[1]);

    let excluded = default_exclusions();
    assert_eq!(first.key(&excluded), second.key(&excluded));

    let only_base = vec!["base".to_owned()];
    assert_ne!(first.key(&only_base), second.key(&only_base));
}

fn identity_strategy() -> impl Strategy<Value = TestIdentity> {
    prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,6}", 0..6).prop_map(|params| {
        TestIdentity::new("asset_hash", params.into_iter().collect())
    })
}

proptest! {
    #[test]
    fn prop_excluded_params_never_influence_the_key(
        identity in identity_strategy(),
        replacement in "[A-Z]{1,4}",
    ) {
        let Some((excluded_name, _)) = identity.params.first().cloned() else {
            return Ok(());
        };
        let excluded = vec![excluded_name.clone()];
        let mut changed = identity.clone();
        changed.params[0].1 = replacement;
        prop_assert_eq!(identity.key(&excluded), changed.key(&excluded));
    }

    #[test]
    fn prop_excluding_absent_params_keeps_the_key(identity in identity_strategy()) {
        let excluded = vec!["NOT_A_PARAM".to_owned()];
        prop_assert_eq!(identity.key(&excluded), identity.key(&[]));
        prop_assert!(identity.key(&[]).starts_with("asset_hash["));
    }
}
