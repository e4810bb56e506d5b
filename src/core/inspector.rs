//! Remote file metadata queried over the exec channel.

use tracing::debug;

use crate::core::models::Target;
use crate::core::remote::{RemoteCommand, RemoteCommandChannel};
use crate::error::{Result, TransferError};

/// Resolve the byte size of `path` inside `target`.
pub async fn remote_file_size(
    channel: &dyn RemoteCommandChannel,
    target: &Target,
    path: &str,
) -> Result<u64> {
    let command = RemoteCommand::file_size(path)?;
    let output = channel
        .run(target, &command)
        .await
        .map_err(|e| not_found_or(e, target, path))?;

    let size = parse_size(&output.stdout_lossy())?;
    debug!(target = %target, path, size, "Resolved remote file size");
    Ok(size)
}

/// Hex SHA-256 of `path` inside `target`, as printed by `sha256sum`.
pub async fn remote_sha256(
    channel: &dyn RemoteCommandChannel,
    target: &Target,
    path: &str,
) -> Result<String> {
    let command = RemoteCommand::sha256(path)?;
    let output = channel
        .run(target, &command)
        .await
        .map_err(|e| not_found_or(e, target, path))?;

    let stdout = output.stdout_lossy();
    let digest = stdout.split_whitespace().next().unwrap_or_default();
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TransferError::Parse {
            what: "sha256sum".to_string(),
            output: stdout,
        });
    }
    Ok(digest.to_ascii_lowercase())
}

fn parse_size(stdout: &str) -> Result<u64> {
    let trimmed = stdout.trim();
    let parse_err = || TransferError::Parse {
        what: "file size".to_string(),
        output: stdout.to_string(),
    };
    let size: i64 = trimmed.parse().map_err(|_| parse_err())?;
    u64::try_from(size).map_err(|_| parse_err())
}

fn not_found_or(err: TransferError, target: &Target, path: &str) -> TransferError {
    match err {
        TransferError::Command { ref stderr, .. } if stderr.contains("No such file") => {
            TransferError::NotFound {
                target: target.to_string(),
                path: path.to_string(),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trimmed_integer() {
        assert_eq!(parse_size("1048576\n").unwrap(), 1_048_576);
        assert_eq!(parse_size("  0 \r\n").unwrap(), 0);
    }

    #[test]
    fn rejects_negative_and_garbage() {
        for bad in ["-1", "12abc", "", "1.5", "12 34"] {
            let err = parse_size(bad).unwrap_err();
            assert_eq!(err.kind(), "parse", "input {bad:?}");
        }
    }

    #[test]
    fn missing_file_maps_to_not_found() {
        let target = Target::new("ns", "pod", "c");
        let err = TransferError::Command {
            target: target.to_string(),
            command: "stat -c %s /nope".into(),
            status: 1,
            stderr: "stat: cannot stat '/nope': No such file or directory".into(),
        };
        assert!(matches!(
            not_found_or(err, &target, "/nope"),
            TransferError::NotFound { .. }
        ));
    }
}
