//! Bulk asset download used when the asset server cannot be reached.
//!
//! The whole cache is fetched once, as a zip bundle published for the newest
//! numeric release tag of the repository, before any test runs.

use std::fs::File;
use std::path::Path;
use std::process::Command;

use lcevc_functest_error::{FunctestError, Result};
use tracing::info;

use crate::config::SuiteConfig;

/// Platform name that must be configured to run against external assets.
pub const EXTERNAL_PLATFORM: &str = "External";

const BUNDLE_NAME: &str = "test_cache.zip";

/// Numeric release tags (`1`, `3.1`, `4.0.2`) of the repository at `repo_dir`.
pub fn git_tags(repo_dir: &Path) -> Result<Vec<String>> {
    let output = Command::new("git")
        .args(["tag", "--list"])
        .current_dir(repo_dir)
        .output()
        .map_err(|err| FunctestError::External(format!("failed to run git: {err}")))?;
    if !output.status.success() {
        return Err(FunctestError::External(format!(
            "git tag failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|tag| is_numeric_tag(tag))
        .map(str::to_owned)
        .collect())
}

fn is_numeric_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Highest numeric tag, comparing dot-separated components as numbers.
#[must_use]
pub fn latest_version_tag(tags: &[String]) -> Option<&str> {
    tags.iter()
        .filter(|tag| is_numeric_tag(tag))
        .max_by_key(|tag| {
            tag.split('.')
                .map(|part| part.parse::<u64>().unwrap_or(0))
                .collect::<Vec<_>>()
        })
        .map(String::as_str)
}

/// Download and unpack the external bundle into an empty cache directory.
///
/// Returns `false` when the cache already has content and nothing was
/// downloaded.
pub fn download_assets_externally(config: &SuiteConfig, repo_dir: &Path) -> Result<bool> {
    info!("asset server unreachable, using external assets");
    let Some(template) = config.external_asset_url.as_deref() else {
        return Err(FunctestError::External(
            "EXTERNAL_ASSET_URL is not configured".to_owned(),
        ));
    };
    if config.platform != EXTERNAL_PLATFORM {
        return Err(FunctestError::External(format!(
            "platform must be {EXTERNAL_PLATFORM} to use external assets, not '{}'",
            config.platform
        )));
    }
    let tags = git_tags(repo_dir)?;
    let Some(version) = latest_version_tag(&tags) else {
        return Err(FunctestError::External("no numeric version tags found".to_owned()));
    };

    let cache = &config.cache_path;
    let cache_is_empty =
        std::fs::read_dir(cache).map_or(true, |mut entries| entries.next().is_none());
    if !cache_is_empty {
        info!(cache = %cache.display(), "cache already populated, skipping external download");
        return Ok(false);
    }

    let url = template.replace("{VERSION}", version);
    std::fs::create_dir_all(cache)?;
    let bundle = cache.join(BUNDLE_NAME);
    info!(url = %url, version, "downloading external test assets");
    let response = ureq::get(&url)
        .call()
        .map_err(|err| FunctestError::External(format!("download of '{url}' failed: {err}")))?;
    let mut file = File::create(&bundle)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    drop(file);

    unzip(&bundle, cache)?;
    std::fs::remove_file(&bundle)?;
    Ok(true)
}

/// Extract every entry of `archive` below `dest`.
pub fn unzip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|err| {
        FunctestError::External(format!("unable to open '{}': {err}", archive.display()))
    })?;
    zip.extract(dest).map_err(|err| {
        FunctestError::External(format!("unable to unzip '{}': {err}", archive.display()))
    })
}
