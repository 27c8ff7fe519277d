use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::info;
use vm_core::{ImagePreparer, Result, VmError};

/// Fetches a source disk image to a local path.
///
/// HTTP(S) URLs are streamed with an incremental SHA-256; `file://` URLs and
/// bare paths are copied (offline catalogs, tests). `.gz` sources are
/// decompressed transparently after the digest check. The target only ever
/// appears via an atomic rename of a fully written temp file.
pub struct HttpImagePreparer;

#[async_trait]
impl ImagePreparer for HttpImagePreparer {
    async fn prepare(&self, url: &str, dest: &Path, sha256: Option<&str>) -> Result<()> {
        let tmp = dest.with_extension(format!("tmp.{}", std::process::id()));
        let result = fetch_verify_unpack(url, &tmp, dest, sha256).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
            let _ = tokio::fs::remove_file(tmp.with_extension("unpacked")).await;
        }
        result
    }
}

async fn fetch_verify_unpack(
    url: &str,
    tmp: &Path,
    dest: &Path,
    sha256: Option<&str>,
) -> Result<()> {
    let digest = match local_source(url) {
        Some(path) => copy_local(&path, tmp).await?,
        None => download(url, tmp).await?,
    };

    // The digest covers the bytes as published, before any decompression.
    if let Some(expected) = sha256
        && digest != expected
    {
        return Err(VmError::Provision(format!(
            "{url}: SHA256 mismatch: expected {expected}, got {digest}"
        )));
    }

    let unpacked = if url.ends_with(".gz") {
        let out = tmp.with_extension("unpacked");
        gunzip(tmp, &out).await?;
        let _ = tokio::fs::remove_file(tmp).await;
        out
    } else {
        tmp.to_path_buf()
    };

    tokio::fs::rename(&unpacked, dest).await.map_err(|e| {
        VmError::Provision(format!("rename to {}: {e}", dest.display()))
    })?;
    info!(url, dest = %dest.display(), "source image ready");
    Ok(())
}

/// `Some(path)` when the URL names a local file rather than a remote one.
fn local_source(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if !url.contains("://") {
        return Some(PathBuf::from(url));
    }
    None
}

async fn copy_local(src: &Path, tmp: &Path) -> Result<String> {
    let bytes = tokio::fs::read(src)
        .await
        .map_err(|e| VmError::Provision(format!("read {}: {e}", src.display())))?;
    let digest = format!("{:x}", Sha256::digest(&bytes));
    tokio::fs::write(tmp, &bytes)
        .await
        .map_err(|e| VmError::Provision(format!("write {}: {e}", tmp.display())))?;
    Ok(digest)
}

/// Stream the response body to `tmp`, computing SHA-256 incrementally.
/// Returns the hex digest.
async fn download(url: &str, tmp: &Path) -> Result<String> {
    let mut response = reqwest::get(url)
        .await
        .map_err(|e| VmError::Provision(format!("download {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(VmError::Provision(format!(
            "download {url}: HTTP {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| VmError::Provision(format!("create {}: {e}", tmp.display())))?;
    let mut hasher = Sha256::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| VmError::Provision(format!("read response chunk: {e}")))?
    {
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| VmError::Provision(format!("write {}: {e}", tmp.display())))?;
    }
    file.flush()
        .await
        .map_err(|e| VmError::Provision(format!("flush {}: {e}", tmp.display())))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Decompress on a blocking thread; local file IO only.
async fn gunzip(src: &Path, dest: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let input = std::fs::File::open(&src)
            .map_err(|e| VmError::Provision(format!("open {}: {e}", src.display())))?;
        let mut decoder = flate2::read::GzDecoder::new(input);
        let mut output = std::fs::File::create(&dest)
            .map_err(|e| VmError::Provision(format!("create {}: {e}", dest.display())))?;
        std::io::copy(&mut decoder, &mut output)
            .map_err(|e| VmError::Provision(format!("decompress {}: {e}", src.display())))?;
        Ok(())
    })
    .await
    .map_err(|e| VmError::Provision(format!("gunzip task: {e}")))?
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn local_path_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, b"disk image bytes").unwrap();
        let dest = dir.path().join("base.img");

        HttpImagePreparer
            .prepare(&src.display().to_string(), &dest, None)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"disk image bytes");
    }

    #[tokio::test]
    async fn file_url_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, b"abc").unwrap();
        let dest = dir.path().join("base.img");

        HttpImagePreparer
            .prepare(&format!("file://{}", src.display()), &dest, None)
            .await
            .unwrap();

        assert!(dest.exists());
    }

    #[tokio::test]
    async fn sha_mismatch_leaves_no_target() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, b"abc").unwrap();
        let dest = dir.path().join("base.img");

        let err = HttpImagePreparer
            .prepare(&src.display().to_string(), &dest, Some("deadbeef"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("SHA256"), "got: {err}");
        assert!(!dest.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }

    #[tokio::test]
    async fn sha_match_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        std::fs::write(&src, b"abc").unwrap();
        let dest = dir.path().join("base.img");
        let digest = format!("{:x}", Sha256::digest(b"abc"));

        HttpImagePreparer
            .prepare(&src.display().to_string(), &dest, Some(&digest))
            .await
            .unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn gz_source_is_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"uncompressed payload").unwrap();
        std::fs::write(&src, encoder.finish().unwrap()).unwrap();
        let dest = dir.path().join("base.img");

        HttpImagePreparer
            .prepare(&src.display().to_string(), &dest, None)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"uncompressed payload");
    }

    #[tokio::test]
    async fn missing_local_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("base.img");
        let err = HttpImagePreparer
            .prepare("/nonexistent/src.img", &dest, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::Provision(_)), "got: {err}");
        assert!(!dest.exists());
    }
}
