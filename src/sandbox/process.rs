//! Child process execution with a hard deadline.
//!
//! The child runs in its own process group. Whatever is left of that group
//! is killed once the child exits, when the timeout fires, and when the
//! future is dropped mid-run, so no descendant outlives the call. stdout and
//! stderr are drained concurrently into one buffer in arrival order.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Return code reported when a command exceeded its timeout.
pub const TIMEOUT_RETURN_CODE: i32 = 124;

/// How long output readers may keep draining after the child is gone.
/// Descendants that left the process group can hold the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Captured result of one process run.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// stdout and stderr, merged.
    pub output: String,
    pub return_code: i32,
    pub timed_out: bool,
}

/// Kills the process group led by a spawned child at most once, at the
/// latest when dropped.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    /// SIGKILLs every remaining member. ESRCH (group already gone) is fine.
    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    debug!(pgid, error = %err, "Process group SIGKILL failed");
                }
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Runs `command` to completion or until `timeout` expires.
///
/// Only spawn failures are errors; a timeout yields
/// [`TIMEOUT_RETURN_CODE`] with whatever output was captured so far.
pub async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> std::io::Result<ProcessOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    // the child leads its own group, so its pid addresses all descendants
    let mut group = ProcessGroup::new(&child);
    let buffer = Arc::new(Mutex::new(Vec::new()));

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(drain(stdout, Arc::clone(&buffer))));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(drain(stderr, Arc::clone(&buffer))));
    }

    let (return_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status?;
            // background jobs the command left behind would hold the pipes open
            group.kill();
            (exit_code(status), false)
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), pid = ?child.id(), "Command timed out, killing process group");
            group.kill();
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Direct kill after group kill failed (child likely gone)");
            }
            (TIMEOUT_RETURN_CODE, true)
        }
    };

    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
            debug!("Output reader still open after process exit, abandoning it");
            abort.abort();
        }
    }

    let bytes = match buffer.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };

    Ok(ProcessOutput {
        output: String::from_utf8_lossy(&bytes).into_owned(),
        return_code,
        timed_out,
    })
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => match sink.lock() {
                Ok(mut guard) => guard.extend_from_slice(&chunk[..n]),
                Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
            },
        }
    }
}

/// Exit code, with signal deaths mapped to `128 + signal` like a shell does.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
