use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::core::inspector::remote_sha256;
use crate::core::models::Target;
use crate::core::remote::RemoteCommandChannel;
use crate::error::{Result, TransferError};

const HASH_BUFFER: usize = 128 * 1024;

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub sha256: String,
    pub bytes_verified: u64,
}

/// Compare a downloaded file against the remote original by SHA-256.
///
/// The remote digest comes from `sha256sum` inside the container; the local
/// one is computed on a blocking thread since it reads the whole file.
pub async fn verify_download(
    channel: &dyn RemoteCommandChannel,
    target: &Target,
    remote_path: &str,
    local_path: &Path,
) -> Result<VerifyResult> {
    info!(target = %target, remote_path, "Verifying downloaded archive");

    let remote = remote_sha256(channel, target, remote_path).await?;
    let (local, bytes_verified) = hash_file(local_path.to_path_buf()).await?;

    if remote != local {
        return Err(TransferError::transfer(
            local_path.display().to_string(),
            format!("checksum mismatch: remote {remote}, local {local}"),
        ));
    }

    debug!(sha256 = %local, bytes_verified, "Checksums match");
    Ok(VerifyResult {
        sha256: local,
        bytes_verified,
    })
}

/// Hex SHA-256 and length of a local file.
pub async fn hash_file(path: PathBuf) -> Result<(String, u64)> {
    tokio::task::spawn_blocking(move || hash_file_sync(&path))
        .await
        .map_err(|e| TransferError::transfer("hash worker", e))?
}

fn hash_file_sync(path: &Path) -> Result<(String, u64)> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::with_capacity(HASH_BUFFER, file);
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;

    let mut buffer = vec![0u8; HASH_BUFFER];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn hashes_known_content() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abc").unwrap();

        let (digest, len) = hash_file(tmp.path().to_path_buf()).await.unwrap();
        assert_eq!(len, 3);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = hash_file(PathBuf::from("/definitely/not/here")).await.unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
