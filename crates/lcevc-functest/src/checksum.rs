//! MD5 digests used for cache keys and output comparison.

use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;

use lcevc_functest_error::Result;
use md5::{Digest, Md5};

/// Lowercase hex MD5 of `bytes`.
#[must_use]
pub fn md5_hex(bytes: &[u8]) -> String {
    to_hex(&Md5::digest(bytes))
}

/// Lowercase hex MD5 of a file, streamed.
pub fn md5_file_hex(path: &Path) -> Result<String> {
    let mut hasher = Md5::new();
    let mut file = File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
