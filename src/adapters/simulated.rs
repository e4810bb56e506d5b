//! In-memory stand-in for a cluster of containers.
//!
//! Interprets the small command vocabulary the engine emits (`stat`, `dd`,
//! `sha256sum`, `tar`, `rm`, `mkdir`, `find`, `test`, `curl`, `chmod`, the
//! upload utility) against per-container file maps and one shared bucket. Other programs answer from scripted
//! responses. Faults, latency and call instrumentation are controlled
//! through the same handle.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::core::models::Target;
use crate::core::remote::{CommandOutput, RemoteCommand, RemoteCommandChannel};
use crate::error::{Result, TransferError};

/// Size of the pieces `run_streaming` writes to its sink.
const STREAM_PIECE: usize = 64 * 1024;

/// Canned answer for a scripted program.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail(status: i32, stderr: &str) -> Self {
        Self {
            status,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }
}

/// One command as the channel received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub target: Target,
    pub argv: Vec<String>,
}

/// An upload the simulated utility performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpload {
    pub source: String,
    pub destination: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct State {
    files: HashMap<Target, BTreeMap<String, Vec<u8>>>,
    executables: HashSet<(Target, String)>,
    unreachable: HashSet<Target>,
    /// Responses per program; the last one repeats.
    scripts: HashMap<String, VecDeque<Response>>,
    /// Range reads starting at these offsets fail.
    failing_reads: HashSet<u64>,
    /// Programs that fail on a given target.
    failing_programs: HashMap<(Target, String), Response>,
    latency: Duration,
    slow_reads: HashMap<u64, Duration>,
    calls: Vec<CallRecord>,
    uploads: Vec<RemoteUpload>,
    /// Objects the upload utility can reach, keyed by `oss://bucket/key`.
    objects: BTreeMap<String, Vec<u8>>,
}

/// Cloneable handle; clones share state.
#[derive(Clone, Default)]
pub struct SimulatedChannel {
    state: Arc<Mutex<State>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl SimulatedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put_file(&self, target: &Target, path: &str, contents: impl Into<Vec<u8>>) {
        self.state()
            .files
            .entry(target.clone())
            .or_default()
            .insert(path.to_string(), contents.into());
    }

    pub fn file(&self, target: &Target, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(target)?.get(path).cloned()
    }

    pub fn set_unreachable(&self, target: &Target) {
        self.state().unreachable.insert(target.clone());
    }

    /// Answer `program` from `responses` in order, repeating the last.
    pub fn script(&self, program: &str, responses: impl IntoIterator<Item = Response>) {
        self.state()
            .scripts
            .insert(program.to_string(), responses.into_iter().collect());
    }

    pub fn fail_read_at(&self, offset: u64) {
        self.state().failing_reads.insert(offset);
    }

    pub fn fail_program(&self, target: &Target, program: &str, response: Response) {
        self.state()
            .failing_programs
            .insert((target.clone(), program.to_string()), response);
    }

    /// Delay applied to every command before it runs.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Extra delay for the range read starting at `offset`.
    pub fn slow_read_at(&self, offset: u64, delay: Duration) {
        self.state().slow_reads.insert(offset, delay);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state().calls.clone()
    }

    pub fn calls_to(&self, program: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.argv.first().is_some_and(|p| p == program))
            .count()
    }

    pub fn uploads(&self) -> Vec<RemoteUpload> {
        self.state().uploads.clone()
    }

    /// Place an object where the upload utility can fetch it.
    pub fn put_object(&self, uri: &str, contents: impl Into<Vec<u8>>) {
        self.state().objects.insert(uri.to_string(), contents.into());
    }

    /// Pack `(path, contents)` entries the way the simulated `tar` does and
    /// store them as one object.
    pub fn put_archive_object<I>(&self, uri: &str, entries: I)
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let mut archive = Vec::new();
        for (path, contents) in entries {
            append_entry(&mut archive, &path, &contents);
        }
        self.put_object(uri, archive);
    }

    pub fn object(&self, uri: &str) -> Option<Vec<u8>> {
        self.state().objects.get(uri).cloned()
    }

    /// Paths stored in `target`, in order.
    pub fn files(&self, target: &Target) -> Vec<String> {
        self.state()
            .files
            .get(target)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest number of commands observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn execute(&self, target: &Target, command: &RemoteCommand) -> Result<CommandOutput> {
        let delay = {
            let mut state = self.state();
            state.calls.push(CallRecord {
                target: target.clone(),
                argv: command.argv().to_vec(),
            });
            if state.unreachable.contains(target) {
                return Err(TransferError::Connection {
                    target: target.to_string(),
                    message: "simulated target unreachable".to_string(),
                });
            }
            state.latency + read_offset(command).and_then(|o| state.slow_reads.get(&o).copied()).unwrap_or_default()
        };

        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = self.interpret(target, command.argv());
        if response.status == 0 {
            Ok(CommandOutput {
                stdout: response.stdout,
                stderr: response.stderr,
            })
        } else {
            Err(TransferError::Command {
                target: target.to_string(),
                command: command.to_string(),
                status: response.status,
                stderr: String::from_utf8_lossy(&response.stderr).trim().to_string(),
            })
        }
    }

    fn interpret(&self, target: &Target, argv: &[String]) -> Response {
        let mut state = self.state();
        let program = argv[0].as_str();
        if let Some(failure) = state
            .failing_programs
            .get(&(target.clone(), program.to_string()))
        {
            return failure.clone();
        }

        let args: Vec<&str> = argv[1..].iter().map(String::as_str).collect();
        match program {
            "stat" => match args.as_slice() {
                ["-c", "%s", path] => match lookup(&state, target, path) {
                    Some(bytes) => stdout(format!("{}\n", bytes.len())),
                    None => missing("stat: cannot stat", path),
                },
                _ => usage(program),
            },
            "dd" => dd(&state, target, &args),
            "sha256sum" => match args.as_slice() {
                [path] => match lookup(&state, target, path) {
                    Some(bytes) => stdout(format!("{}  {path}\n", hex::encode(Sha256::digest(bytes)))),
                    None => missing("sha256sum:", path),
                },
                _ => usage(program),
            },
            "tar" => match args.as_slice() {
                ["-czf", archive, "--", dir] => {
                    let Some(bytes) = pack(&state, target, dir) else {
                        return Response::fail(
                            2,
                            &format!("tar: {dir}: Cannot stat: No such file or directory"),
                        );
                    };
                    files_mut(&mut state, target).insert(archive.to_string(), bytes);
                    Response {
                        status: 0,
                        stdout: Vec::new(),
                        stderr: b"tar: Removing leading `/' from member names\n".to_vec(),
                    }
                }
                ["-xzf", archive, "-C", dir] => {
                    let Some(bytes) = lookup(&state, target, archive).cloned() else {
                        return missing("tar: cannot open", archive);
                    };
                    let Some(entries) = unpack(&bytes) else {
                        return Response::fail(2, "gzip: stdin: not in gzip format");
                    };
                    let root = dir.trim_end_matches('/');
                    let files = files_mut(&mut state, target);
                    for (path, contents) in entries {
                        files.insert(format!("{root}/{}", path.trim_start_matches('/')), contents);
                    }
                    Response::ok()
                }
                _ => usage(program),
            },
            "mkdir" => match args.as_slice() {
                ["-p", "--", _] => Response::ok(),
                _ => usage(program),
            },
            "find" => match args.as_slice() {
                [dir, "-type", "f", "-name", pattern] => {
                    let prefix = format!("{}/", dir.trim_end_matches('/'));
                    let found: String = state
                        .files
                        .get(target)
                        .into_iter()
                        .flat_map(|files| files.keys())
                        .filter(|path| path.starts_with(&prefix))
                        .filter(|path| name_matches(path.rsplit('/').next().unwrap_or(""), pattern))
                        .map(|path| format!("{path}\n"))
                        .collect();
                    stdout(found)
                }
                _ => usage(program),
            },
            "rm" => match args.as_slice() {
                ["-f", "--", path] => {
                    files_mut(&mut state, target).remove(*path);
                    Response::ok()
                }
                _ => usage(program),
            },
            "test" => match args.as_slice() {
                ["-x", path] => {
                    if state.executables.contains(&(target.clone(), path.to_string())) {
                        Response::ok()
                    } else {
                        Response::fail(1, "")
                    }
                }
                _ => usage(program),
            },
            "curl" => match args.as_slice() {
                ["-fsSL", "-o", path, url] => {
                    files_mut(&mut state, target).insert(path.to_string(), url.as_bytes().to_vec());
                    Response::ok()
                }
                _ => usage(program),
            },
            "chmod" => match args.as_slice() {
                [_, path] if lookup(&state, target, path).is_some() => {
                    state.executables.insert((target.clone(), path.to_string()));
                    Response::ok()
                }
                [_, path] => missing("chmod: cannot access", path),
                _ => usage(program),
            },
            _ if state.executables.contains(&(target.clone(), program.to_string())) => {
                remote_copy(&mut state, target, &args)
            }
            _ => match state.scripts.get_mut(program) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
                Some(queue) => queue.front().cloned().unwrap_or_default(),
                None => Response::fail(127, &format!("{program}: command not found")),
            },
        }
    }
}

#[async_trait]
impl RemoteCommandChannel for SimulatedChannel {
    async fn run(&self, target: &Target, command: &RemoteCommand) -> Result<CommandOutput> {
        self.execute(target, command).await
    }

    async fn run_streaming(
        &self,
        target: &Target,
        command: &RemoteCommand,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let output = self.execute(target, command).await?;
        for piece in output.stdout.chunks(STREAM_PIECE) {
            sink.write_all(piece).await?;
        }
        Ok(output.stdout.len() as u64)
    }
}

/// Counts a command as running until dropped, including on cancellation.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lookup<'a>(state: &'a State, target: &Target, path: &str) -> Option<&'a Vec<u8>> {
    state.files.get(target)?.get(path)
}

fn files_mut<'a>(state: &'a mut State, target: &Target) -> &'a mut BTreeMap<String, Vec<u8>> {
    state.files.entry(target.clone()).or_default()
}

fn stdout(text: String) -> Response {
    Response {
        status: 0,
        stdout: text.into_bytes(),
        stderr: Vec::new(),
    }
}

fn missing(prefix: &str, path: &str) -> Response {
    Response::fail(1, &format!("{prefix} '{path}': No such file or directory"))
}

fn usage(program: &str) -> Response {
    Response::fail(2, &format!("{program}: unsupported arguments"))
}

fn read_offset(command: &RemoteCommand) -> Option<u64> {
    if command.program() != "dd" {
        return None;
    }
    command
        .argv()
        .iter()
        .find_map(|a| a.strip_prefix("skip="))
        .and_then(|v| v.parse().ok())
}

/// `dd if=P bs=N skip=S count=C iflag=skip_bytes,count_bytes status=none`
fn dd(state: &State, target: &Target, args: &[&str]) -> Response {
    let mut path = None;
    let mut skip = 0u64;
    let mut count = None;
    for arg in args {
        match arg.split_once('=') {
            Some(("if", v)) => path = Some(v),
            Some(("skip", v)) => skip = v.parse().unwrap_or(0),
            Some(("count", v)) => count = v.parse::<u64>().ok(),
            Some(("bs" | "iflag" | "status", _)) => {}
            _ => return usage("dd"),
        }
    }
    let Some(path) = path else {
        return usage("dd");
    };
    if state.failing_reads.contains(&skip) {
        return Response::fail(1, &format!("dd: error reading '{path}': Input/output error"));
    }
    let Some(bytes) = lookup(state, target, path) else {
        return missing("dd: failed to open", path);
    };
    let len = bytes.len() as u64;
    let start = skip.min(len);
    let end = count.map_or(len, |c| (start + c).min(len));
    Response {
        status: 0,
        stdout: bytes[start as usize..end as usize].to_vec(),
        stderr: Vec::new(),
    }
}

/// Deterministic stand-in for a gzipped tarball of everything under `dir`.
fn pack(state: &State, target: &Target, dir: &str) -> Option<Vec<u8>> {
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    let files = state.files.get(target)?;
    let mut archive = Vec::new();
    let mut found = false;
    for (path, contents) in files.range(prefix.clone()..) {
        if !path.starts_with(&prefix) {
            break;
        }
        found = true;
        append_entry(&mut archive, path, contents);
    }
    found.then_some(archive)
}

fn append_entry(archive: &mut Vec<u8>, path: &str, contents: &[u8]) {
    archive.extend_from_slice(path.as_bytes());
    archive.push(0);
    archive.extend_from_slice(&(contents.len() as u64).to_le_bytes());
    archive.extend_from_slice(contents);
}

/// Inverse of [`pack`]. `None` when the bytes are not a packed archive.
fn unpack(mut bytes: &[u8]) -> Option<Vec<(String, Vec<u8>)>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        let nul = bytes.iter().position(|b| *b == 0)?;
        let path = String::from_utf8(bytes[..nul].to_vec()).ok()?;
        let rest = &bytes[nul + 1..];
        let len = u64::from_le_bytes(rest.get(..8)?.try_into().ok()?) as usize;
        let contents = rest.get(8..8 + len)?.to_vec();
        entries.push((path, contents));
        bytes = &rest[8 + len..];
    }
    Some(entries)
}

/// `find -name` subset: `*suffix`, `prefix*` or an exact name.
fn name_matches(name: &str, pattern: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(suffix), _) => name.ends_with(suffix),
        (None, Some(prefix)) => name.starts_with(prefix),
        (None, None) => name == pattern,
    }
}

/// `<tool> cp SRC DEST ...`, in either direction.
fn remote_copy(state: &mut State, target: &Target, args: &[&str]) -> Response {
    let ["cp", source, destination, ..] = args else {
        return usage("upload utility");
    };
    if source.starts_with("oss://") {
        let Some(bytes) = state.objects.get(*source).cloned() else {
            return Response::fail(1, &format!("Error: oss: service returned error: StatusCode=404, ErrorCode=NoSuchKey, {source}"));
        };
        files_mut(state, target).insert(destination.to_string(), bytes);
        return stdout("Succeed: Total num: 1, size: 1. OK num: 1\n".to_string());
    }
    let Some(bytes) = lookup(state, target, source).cloned() else {
        return missing("cp: cannot open", source);
    };
    state.objects.insert(destination.to_string(), bytes.clone());
    state.uploads.push(RemoteUpload {
        source: source.to_string(),
        destination: destination.to_string(),
        bytes,
    });
    stdout("Succeed: Total num: 1, size: 1. OK num: 1\n".to_string())
}
