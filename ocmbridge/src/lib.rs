//! Extension Bridge (C5, spec.md §4.5): runs an external stage as a child
//! process, streaming the processor envelope over stdio or a Unix-domain
//! socket, and terminates it cleanly.
//!
//! The teacher's service transport ([`peimage_service`]) used
//! `tokio_seqpacket`'s `SOCK_SEQPACKET`, which frames datagrams and has no
//! half-close. This bridge needs byte-stream semantics with an explicit
//! half-close on the write side (spec.md §4.5), so it uses
//! [`tokio::net::UnixStream`] instead — a deliberate substitution, not an
//! oversight.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

const DIAL_MAX_ATTEMPTS: u32 = 5;
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const SERVER_ADDRESS_ENV: &str = "SERVER_ADDRESS";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to dial extension socket after {DIAL_MAX_ATTEMPTS} attempts: {0}")]
    DialFailed(std::io::Error),
    #[error("extension process exited with {0}")]
    NonZeroExit(std::process::ExitStatus),
    #[error("errno: {0}")]
    Errno(#[from] rustix::io::Errno),
}

/// `{bin, args, env}` per spec.md §4.5.
#[derive(Debug, Clone)]
pub struct ExtensionSpec {
    pub bin: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

fn command(spec: &ExtensionSpec) -> Command {
    let mut cmd = Command::new(&spec.bin);
    cmd.args(&spec.args);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    cmd.kill_on_drop(true);
    cmd
}

/// Run `spec` over stdio: envelope on stdin/stdout, stderr relayed to the
/// host log, child must exit 0.
pub async fn run_stdio(
    spec: &ExtensionSpec,
    mut input: impl AsyncRead + Unpin,
    mut output: impl AsyncWrite + Unpin,
) -> Result<(), Error> {
    let mut child = command(spec)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdin = child.stdin.take().expect("stdin piped");
    let mut stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let stderr_relay = tokio::spawn(relay_stderr(stderr, spec.bin.clone()));

    let write_task = tokio::spawn(async move {
        let res = tokio::io::copy(&mut input, &mut stdin).await;
        drop(stdin);
        res
    });
    tokio::io::copy(&mut stdout, &mut output).await?;

    write_task.await.map_err(|e| std::io::Error::other(e.to_string()))??;
    let _ = stderr_relay.await;

    let status = child.wait().await?;
    if !status.success() {
        return Err(Error::NonZeroExit(status));
    }
    Ok(())
}

async fn relay_stderr(stderr: impl AsyncRead + Unpin, bin: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!("[{bin}] {line}"),
            Ok(None) => break,
            Err(e) => {
                warn!("error reading stderr from {bin}: {e}");
                break;
            }
        }
    }
}

fn unique_socket_path(work_dir: &Path) -> PathBuf {
    let name = format!("ocm-bridge-{}.sock", uuid_like());
    work_dir.join(name)
}

// Avoids a dependency purely for a random suffix: nanosecond-resolution
// process time mixed with the pid is unique enough for a scratch directory.
fn uuid_like() -> String {
    let pid = std::process::id();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{pid}-{nanos}")
}

async fn dial_with_retry(path: &Path) -> Result<UnixStream, Error> {
    let mut last_err = None;
    for attempt in 0..DIAL_MAX_ATTEMPTS {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_err = Some(e);
                let backoff = DIAL_RETRY_INTERVAL * 2u32.saturating_pow(attempt);
                tokio::time::sleep(backoff.min(Duration::from_secs(5))).await;
            }
        }
    }
    Err(Error::DialFailed(last_err.unwrap()))
}

/// Run `spec` over a Unix-domain socket the child is expected to listen on
/// at `SERVER_ADDRESS`. The host dials (the child is the server) with
/// bounded exponential retry, streams both directions, half-closes the
/// write side once the input is exhausted, then sends a termination signal
/// and waits for the child to exit.
pub async fn run_uds(
    spec: &ExtensionSpec,
    work_dir: &Path,
    mut input: impl AsyncRead + Unpin,
    mut output: impl AsyncWrite + Unpin,
) -> Result<(), Error> {
    let socket_path = unique_socket_path(work_dir);
    let mut spec = spec.clone();
    spec.env.insert(SERVER_ADDRESS_ENV.to_string(), socket_path.to_string_lossy().into_owned());

    let mut child = command(&spec)
        .stderr(Stdio::piped())
        .spawn()?;
    let stderr = child.stderr.take().expect("stderr piped");
    let stderr_relay = tokio::spawn(relay_stderr(stderr, spec.bin.clone()));

    let stream = dial_with_retry(&socket_path).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    let write_task = tokio::spawn(async move {
        let res = tokio::io::copy(&mut input, &mut write_half).await;
        let _ = write_half.shutdown().await;
        res
    });

    tokio::io::copy(&mut read_half, &mut output).await?;
    write_task.await.map_err(|e| std::io::Error::other(e.to_string()))??;

    terminate(&mut child).await?;
    let _ = stderr_relay.await;

    let status = child.wait().await?;
    if !status.success() {
        return Err(Error::NonZeroExit(status));
    }
    Ok(())
}

async fn terminate(child: &mut Child) -> Result<(), Error> {
    let Some(pid) = child.id() else {
        // already reaped
        return Ok(());
    };
    let pid = rustix::process::Pid::from_raw(pid as i32).expect("nonzero pid");
    if let Err(e) = rustix::process::kill_process(pid, rustix::process::Signal::Term) {
        if e != rustix::io::Errno::SRCH {
            error!("failed to send termination signal to extension process: {e}");
            return Err(e.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn stdio_roundtrips_through_cat() {
        let spec = ExtensionSpec {
            bin: "cat".to_string(),
            args: vec![],
            env: BTreeMap::new(),
        };
        let input = Cursor::new(b"hello envelope".to_vec());
        let mut output = Vec::new();
        run_stdio(&spec, input, &mut output).await.unwrap();
        assert_eq!(output, b"hello envelope");
    }

    #[tokio::test]
    async fn stdio_reports_nonzero_exit() {
        let spec = ExtensionSpec {
            bin: "false".to_string(),
            args: vec![],
            env: BTreeMap::new(),
        };
        let input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        let err = run_stdio(&spec, input, &mut output).await.unwrap_err();
        assert!(matches!(err, Error::NonZeroExit(_)));
    }

    #[test]
    fn unique_socket_paths_differ() {
        let dir = tempfile::tempdir().unwrap();
        let a = unique_socket_path(dir.path());
        let b = unique_socket_path(dir.path());
        assert_ne!(a, b);
    }
}
