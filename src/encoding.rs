//! Text encoding detection and re-encoding of synchronized subtitles.
//!
//! Tools tend to write UTF-8 regardless of what they were given. Depending on
//! the configured policy the output is left alone, re-encoded to the input
//! subtitle's encoding, or forced to a fixed encoding.

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use std::path::Path;
use tracing::{debug, info};

use crate::config::EncodingPolicy;
use crate::error::{Result, SyncError};

/// Best guess for the encoding of `bytes`: BOM, then strict UTF-8, then statistics
pub fn detect(bytes: &[u8]) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return encoding;
    }
    if std::str::from_utf8(bytes).is_ok() {
        return UTF_8;
    }
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}

pub async fn detect_file(path: &Path) -> Result<&'static Encoding> {
    let bytes = tokio::fs::read(path).await?;
    Ok(detect(&bytes))
}

pub fn lookup(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| SyncError::Encoding(format!("unknown encoding '{}'", label)))
}

/// Encoding the output should end up in, or None to leave it as written.
///
/// An explicit per-job override always wins over the policy.
pub async fn target_for(
    policy: EncodingPolicy,
    configured: &str,
    override_label: Option<&str>,
    input: &Path,
) -> Result<Option<&'static Encoding>> {
    if let Some(label) = override_label {
        return lookup(label).map(Some);
    }
    match policy {
        EncodingPolicy::Keep => Ok(None),
        EncodingPolicy::MatchInput => detect_file(input).await.map(Some),
        EncodingPolicy::Force => lookup(configured).map(Some),
    }
}

fn encode(text: &str, target: &'static Encoding) -> Result<Vec<u8>> {
    // encoding_rs only decodes UTF-16; write it by hand with a BOM
    if target == UTF_16LE || target == UTF_16BE {
        let mut bytes = Vec::with_capacity(2 + text.len() * 2);
        for unit in std::iter::once(0xFEFF_u16).chain(text.encode_utf16()) {
            let pair = if target == UTF_16LE { unit.to_le_bytes() } else { unit.to_be_bytes() };
            bytes.extend_from_slice(&pair);
        }
        return Ok(bytes);
    }

    let (bytes, _, unmappable) = target.encode(text);
    if unmappable {
        return Err(SyncError::Encoding(format!(
            "text contains characters that {} cannot represent",
            target.name()
        )));
    }
    Ok(bytes.into_owned())
}

/// Rewrite `path` in `target`; returns whether the file changed
pub async fn transcode_file(path: &Path, target: &'static Encoding) -> Result<bool> {
    let bytes = tokio::fs::read(path).await?;
    let current = detect(&bytes);
    if current == target {
        debug!("{} already in {}", path.display(), target.name());
        return Ok(false);
    }

    let (text, _, malformed) = current.decode(&bytes);
    if malformed {
        return Err(SyncError::Encoding(format!(
            "{} is not valid {}",
            path.display(),
            current.name()
        )));
    }

    let encoded = encode(&text, target)?;
    tokio::fs::write(path, encoded).await?;
    info!("Re-encoded {} from {} to {}", path.display(), current.name(), target.name());
    Ok(true)
}

/// Apply the encoding policy to a finished output file
pub async fn reconcile(
    output: &Path,
    policy: EncodingPolicy,
    configured: &str,
    override_label: Option<&str>,
    input: &Path,
) -> Result<Option<&'static Encoding>> {
    match target_for(policy, configured, override_label, input).await? {
        Some(target) => Ok(transcode_file(output, target).await?.then_some(target)),
        None => Ok(None),
    }
}
