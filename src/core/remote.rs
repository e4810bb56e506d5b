//! The exec-only channel into a remote container.
//!
//! Every remote interaction goes through [`RemoteCommandChannel`]. Commands
//! are typed argv vectors ([`RemoteCommand`]); nothing is ever passed
//! through a shell, so paths and names are validated when the command is
//! built rather than quoted.

use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWrite;

use crate::core::models::{ByteRange, Target};
use crate::error::{Result, TransferError};

/// Block size handed to `dd` for range reads. Byte-exact offsets come from
/// `skip_bytes,count_bytes`, so this only affects syscall count.
const RANGE_READ_BLOCK: u64 = 1024 * 1024;

static SAFE_FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").expect("valid regex"));

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs commands inside a remote container.
///
/// Implementations must distinguish a target that cannot be reached
/// ([`TransferError::Connection`]) from a process that ran and exited
/// non-zero ([`TransferError::Command`], carrying captured stderr).
/// Stdin is never attached.
#[async_trait]
pub trait RemoteCommandChannel: Send + Sync {
    /// Run to completion, buffering stdout and stderr.
    async fn run(&self, target: &Target, command: &RemoteCommand) -> Result<CommandOutput>;

    /// Run to completion, streaming stdout into `sink` as it arrives.
    /// Returns the number of bytes written to the sink.
    async fn run_streaming(
        &self,
        target: &Target,
        command: &RemoteCommand,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;
}

/// A fully formed argv vector for a remote process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteCommand {
    argv: Vec<String>,
    /// Indices of arguments masked when the command is displayed.
    secrets: Vec<usize>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            secrets: Vec::new(),
        }
    }

    /// Build from an already split argv, e.g. from configuration.
    pub fn from_argv<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        if argv.first().is_none_or(|p| p.is_empty()) {
            return Err(TransferError::InvalidArgument(
                "command must name a program".to_string(),
            ));
        }
        Ok(Self {
            argv,
            secrets: Vec::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Append an argument that must never appear in logs.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secrets.push(self.argv.len());
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// `stat -c %s PATH`
    pub fn file_size(path: &str) -> Result<Self> {
        validate_remote_path(path)?;
        Ok(Self::new("stat").args(["-c", "%s", path]))
    }

    /// Byte-exact read of `range` from `path` to stdout.
    pub fn read_range(path: &str, range: ByteRange) -> Result<Self> {
        validate_remote_path(path)?;
        let block = range.len().clamp(1, RANGE_READ_BLOCK);
        Ok(Self::new("dd").args([
            format!("if={path}"),
            format!("bs={block}"),
            format!("skip={}", range.start),
            format!("count={}", range.len()),
            "iflag=skip_bytes,count_bytes".to_string(),
            "status=none".to_string(),
        ]))
    }

    /// `sha256sum PATH`
    pub fn sha256(path: &str) -> Result<Self> {
        validate_remote_path(path)?;
        Ok(Self::new("sha256sum").arg(path))
    }

    /// `tar -czf ARCHIVE -- DIR`
    pub fn archive(archive: &str, dir: &str) -> Result<Self> {
        validate_remote_path(archive)?;
        validate_remote_path(dir)?;
        Ok(Self::new("tar").args(["-czf", archive, "--", dir]))
    }

    /// `tar -xzf ARCHIVE -C DIR`
    pub fn extract(archive: &str, dir: &str) -> Result<Self> {
        validate_remote_path(archive)?;
        validate_remote_path(dir)?;
        Ok(Self::new("tar").args(["-xzf", archive, "-C", dir]))
    }

    /// `mkdir -p -- DIR`
    pub fn make_dir(dir: &str) -> Result<Self> {
        validate_remote_path(dir)?;
        Ok(Self::new("mkdir").args(["-p", "--", dir]))
    }

    /// `find DIR -type f -name PATTERN`, one path per output line.
    pub fn find_files(dir: &str, pattern: &str) -> Result<Self> {
        validate_remote_path(dir)?;
        validate_remote_path(pattern)?;
        Ok(Self::new("find").args([dir, "-type", "f", "-name", pattern]))
    }

    /// `rm -f -- PATH`
    pub fn remove(path: &str) -> Result<Self> {
        validate_remote_path(path)?;
        Ok(Self::new("rm").args(["-f", "--", path]))
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if self.secrets.contains(&i) {
                f.write_str("***")?;
            } else if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'') {
                write!(f, "'{}'", arg.replace('\'', r"'\''"))?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

/// Reject paths that could be misread as options or break argv framing.
pub fn validate_remote_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(TransferError::InvalidArgument("empty remote path".into()));
    }
    if path.starts_with('-') {
        return Err(TransferError::InvalidArgument(format!(
            "remote path {path:?} starts with '-'"
        )));
    }
    if path.chars().any(|c| c == '\0' || c == '\n' || c == '\r') {
        return Err(TransferError::InvalidArgument(format!(
            "remote path {path:?} contains control characters"
        )));
    }
    Ok(())
}

/// A single path component made of `[A-Za-z0-9._-]`, not starting with `.` or `-`.
pub fn validate_file_name(name: &str) -> Result<()> {
    if SAFE_FILE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(TransferError::InvalidArgument(format!(
            "unsafe file name {name:?}"
        )))
    }
}

/// Join a directory and a validated file name into a remote path.
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_range_is_byte_exact() {
        let cmd = RemoteCommand::read_range("/tmp/a.tar.gz", ByteRange::new(20, 30)).unwrap();
        assert_eq!(
            cmd.argv(),
            [
                "dd",
                "if=/tmp/a.tar.gz",
                "bs=10",
                "skip=20",
                "count=10",
                "iflag=skip_bytes,count_bytes",
                "status=none"
            ]
        );
    }

    #[test]
    fn large_range_uses_capped_block() {
        let cmd = RemoteCommand::read_range("f", ByteRange::new(0, 64 * 1024 * 1024)).unwrap();
        assert_eq!(cmd.argv()[2], "bs=1048576");
    }

    #[test]
    fn rejects_option_like_paths() {
        assert!(RemoteCommand::file_size("-rf").is_err());
        assert!(RemoteCommand::remove("").is_err());
        assert!(RemoteCommand::sha256("a\nb").is_err());
    }

    #[test]
    fn restore_builders() {
        let cmd = RemoteCommand::extract("/tmp/a.tar.gz", "/tmp/restore").unwrap();
        assert_eq!(cmd.argv(), ["tar", "-xzf", "/tmp/a.tar.gz", "-C", "/tmp/restore"]);

        let cmd = RemoteCommand::find_files("/tmp/restore", "*.tsfile").unwrap();
        assert_eq!(
            cmd.argv(),
            ["find", "/tmp/restore", "-type", "f", "-name", "*.tsfile"]
        );
        assert!(RemoteCommand::find_files("/tmp/restore", "-delete").is_err());
        assert!(RemoteCommand::make_dir("-p").is_err());
    }

    #[test]
    fn file_name_validation() {
        assert!(validate_file_name("backup_pod-0_20240101120000.tar.gz").is_ok());
        assert!(validate_file_name("../etc").is_err());
        assert!(validate_file_name("a/b").is_err());
        assert!(validate_file_name(".hidden").is_err());
        assert!(validate_file_name("x; rm -rf /").is_err());
    }

    #[test]
    fn empty_argv_rejected() {
        assert!(RemoteCommand::from_argv(Vec::<String>::new()).is_err());
        assert!(RemoteCommand::from_argv([""]).is_err());
        assert_eq!(
            RemoteCommand::from_argv(["true"]).unwrap().program(),
            "true"
        );
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = RemoteCommand::new("start-cli.sh").args(["-e", "flush on cluster"]);
        assert_eq!(cmd.to_string(), "start-cli.sh -e 'flush on cluster'");
    }

    #[test]
    fn display_masks_secrets() {
        let cmd = RemoteCommand::new("ossutil64")
            .args(["cp", "a", "oss://b/a", "-k"])
            .secret_arg("hunter2");
        assert_eq!(cmd.to_string(), "ossutil64 cp a oss://b/a -k ***");
        assert_eq!(cmd.argv()[5], "hunter2");
    }

    #[test]
    fn join_handles_trailing_slash_and_cwd() {
        assert_eq!(remote_join("/tmp/", "a.tgz"), "/tmp/a.tgz");
        assert_eq!(remote_join(".", "a.tgz"), "a.tgz");
    }
}
