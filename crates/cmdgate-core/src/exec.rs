//! Spawning template executables and the single-flight guard around them.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long output is still collected after the process exits. Background
/// children that inherited the pipes are cut off after this.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("spawning {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("waiting for process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("{0}")]
    Exit(ExitStatus),
    #[error("cancelled")]
    Cancelled,
}

/// Combined stdout and stderr of a run, in arrival order, plus how it ended.
pub struct ExecOutcome {
    pub output: Vec<u8>,
    pub result: Result<(), ExecError>,
}

/// Held while a non-concurrent command runs. Dropping it clears the flag,
/// whichever way the run ends.
pub struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunningGuard<'a> {
    pub fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Run `program` with `args` until it exits or `cancel` fires.
pub async fn run_program(
    program: &Path,
    args: &[String],
    work_dir: Option<&Path>,
    cancel: &CancellationToken,
) -> ExecOutcome {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = work_dir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            return ExecOutcome {
                output: Vec::new(),
                result: Err(ExecError::Spawn {
                    path: program.display().to_string(),
                    source,
                }),
            }
        }
    };
    debug!(program = %program.display(), pid = ?child.id(), "spawned template");

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let mut pumps = [
        spawn_pump(child.stdout.take(), buffer.clone()),
        spawn_pump(child.stderr.take(), buffer.clone()),
    ];

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!("failed to kill cancelled template: {err}");
            }
            for pump in &pumps {
                pump.abort();
            }
            Err(ExecError::Cancelled)
        }
        status = child.wait() => {
            if drain_pumps(&mut pumps, cancel).await {
                match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(ExecError::Exit(status)),
                    Err(err) => Err(ExecError::Wait(err)),
                }
            } else {
                Err(ExecError::Cancelled)
            }
        }
    };

    let output = std::mem::take(&mut *buffer.lock());
    ExecOutcome { output, result }
}

/// Wait for both pipes to close, bounded by [`OUTPUT_DRAIN_GRACE`]. Returns
/// false if `cancel` fired first. The pumps are aborted either way.
async fn drain_pumps(pumps: &mut [JoinHandle<()>; 2], cancel: &CancellationToken) -> bool {
    let drained = tokio::select! {
        _ = cancel.cancelled() => false,
        waited = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
            for pump in pumps.iter_mut() {
                let _ = pump.await;
            }
        }) => {
            if waited.is_err() {
                warn!("template output still open {OUTPUT_DRAIN_GRACE:?} after exit, dropping the rest");
            }
            true
        }
    };
    for pump in pumps.iter() {
        pump.abort();
    }
    drained
}

fn spawn_pump<R>(reader: Option<R>, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.lock().extend_from_slice(&chunk[..n]),
                Err(err) => {
                    debug!("output pipe closed: {err}");
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh() -> &'static Path {
        Path::new("/bin/sh")
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let outcome = run_program(
            sh(),
            &script("echo out; echo err 1>&2"),
            None,
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.result.is_ok());
        let text = String::from_utf8(outcome.output).unwrap();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error_with_output() {
        let outcome =
            run_program(sh(), &script("echo boom; exit 3"), None, &CancellationToken::new()).await;
        match outcome.result {
            Err(ExecError::Exit(status)) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(outcome.output, b"boom\n");
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let outcome = run_program(
            Path::new("/definitely/not/a/program"),
            &[],
            None,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome.result, Err(ExecError::Spawn { .. })));
    }

    #[tokio::test]
    async fn runs_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_program(
            sh(),
            &script("pwd"),
            Some(dir.path()),
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.result.is_ok());
        let text = String::from_utf8(outcome.output).unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(text.trim()).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = run_program(sh(), &script("exec sleep 10"), None, &cancel).await;
        assert!(matches!(outcome.result, Err(ExecError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_is_observed_while_output_drains() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = run_program(sh(), &script("echo started; sleep 4 & exit 0"), None, &cancel).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(outcome.result, Err(ExecError::Cancelled)));
        assert_eq!(outcome.output, b"started\n");
    }

    #[tokio::test]
    async fn background_child_holding_stdout_is_cut_off() {
        let started = std::time::Instant::now();
        let outcome = run_program(
            sh(),
            &script("echo started; sleep 6 & exit 0"),
            None,
            &CancellationToken::new(),
        )
        .await;
        assert!(started.elapsed() < OUTPUT_DRAIN_GRACE + Duration::from_secs(2));
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.output, b"started\n");
    }

    #[test]
    fn guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let first = RunningGuard::acquire(&flag).expect("first acquire");
        assert!(RunningGuard::acquire(&flag).is_none());
        drop(first);
        assert!(RunningGuard::acquire(&flag).is_some());
    }
}
