//! Uploaded image isolation.
//!
//! - `UploadedImage`: opaque container for the encoded upload. Bytes are private
//!   and zeroized on drop; detector backends and the annotator borrow them.
//! - Upload validation: extension allowlist, filename sanitizing, size cap.
//!
//! Uploads are never written to disk by this crate. Results reference the
//! upload by sanitized file name and SHA-256 digest.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroize;

/// Accepted upload extensions (lowercase).
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Default cap on upload size.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Opaque uploaded image. There is no `Clone`; bytes are only lent out.
pub struct UploadedImage {
    bytes: Vec<u8>,
    file_name: String,
    sha256: [u8; 32],
}

impl UploadedImage {
    /// Validate and wrap an upload.
    ///
    /// The raw file name is sanitized first; the sanitized name must carry an
    /// allowed extension.
    pub fn new(raw_file_name: &str, bytes: Vec<u8>) -> Result<Self> {
        Self::with_limit(raw_file_name, bytes, DEFAULT_MAX_UPLOAD_BYTES)
    }

    pub fn with_limit(raw_file_name: &str, bytes: Vec<u8>, max_bytes: usize) -> Result<Self> {
        let file_name = secure_filename(raw_file_name);
        if file_name.is_empty() {
            return Err(anyhow!("file name '{}' is not usable", raw_file_name));
        }
        if !allowed_file(&file_name) {
            return Err(anyhow!(
                "file '{}' is not an allowed image type (expected one of {})",
                file_name,
                ALLOWED_EXTENSIONS.join(", ")
            ));
        }
        if bytes.is_empty() {
            return Err(anyhow!("upload '{}' is empty", file_name));
        }
        if bytes.len() > max_bytes {
            return Err(anyhow!(
                "upload '{}' is {} bytes, limit is {}",
                file_name,
                bytes.len(),
                max_bytes
            ));
        }
        let sha256 = Sha256::digest(&bytes).into();
        Ok(Self {
            bytes,
            file_name,
            sha256,
        })
    }

    /// Encoded image bytes. Borrow only; do not persist.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// File name without its extension.
    pub fn stem(&self) -> &str {
        self.file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.file_name)
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    /// Name of the annotated artifact derived from this upload.
    pub fn annotated_file_name(&self) -> String {
        format!("{}_annotated.jpg", self.stem())
    }
}

impl Drop for UploadedImage {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for UploadedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadedImage")
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// True when the name has an allowed image extension (case-insensitive).
pub fn allowed_file(file_name: &str) -> bool {
    match file_name.rsplit_once('.') {
        Some((_, ext)) => {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

/// Reduce a client-supplied file name to a safe flat name.
///
/// Path components are dropped and accented letters are folded to ASCII
/// (NFKD, combining marks discarded). Whitespace runs become `_`, characters
/// outside `[A-Za-z0-9_.-]` are removed, and dots/underscores are trimmed
/// from both ends.
pub fn secure_filename(raw: &str) -> String {
    static UNSAFE_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = UNSAFE_RE.get_or_init(|| regex::Regex::new(r"[^A-Za-z0-9_.-]").unwrap());

    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    let ascii: String = base.nfkd().filter(char::is_ascii).collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = re.replace_all(&joined, "");
    cleaned.trim_matches(['.', '_']).to_string()
}
