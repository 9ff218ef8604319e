//! Monitor process lifecycle.
//!
//! Spawns the monitor with piped output, turns its stdout/stderr into lines,
//! and reports its exit exactly once after the output has been drained.

pub mod orphans;

use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Upper bound on waiting for the output streams after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One line from the monitor's standard streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Handle to a running monitor process.
pub struct MonitorProcess {
    pid: Option<u32>,
    shutdown: CancellationToken,
    exited: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorProcess {
    /// Spawn `executable` and start supervising it.
    ///
    /// `on_output` sees every complete line in read order. `on_exit` fires once
    /// with the exit code (`None` if killed by a signal), after all output.
    pub fn spawn<O, E>(executable: &Path, on_output: O, on_exit: E) -> io::Result<Self>
    where
        O: Fn(OutputLine) + Send + Sync + 'static,
        E: FnOnce(Option<i32>) + Send + 'static,
    {
        let mut child = Command::new(executable)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        info!("Started monitor {} (pid {:?})", executable.display(), pid);

        let shutdown = CancellationToken::new();
        let exited = CancellationToken::new();

        let task = tokio::spawn(supervise(
            child.stdout.take(),
            child.stderr.take(),
            child,
            Arc::new(on_output),
            on_exit,
            shutdown.clone(),
            exited.clone(),
        ));

        Ok(Self {
            pid,
            shutdown,
            exited,
            task,
        })
    }

    /// OS process id, if the process was still alive right after spawning.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the exit has not been reported yet.
    pub fn is_running(&self) -> bool {
        !self.exited.is_cancelled()
    }

    /// Token that force-stops the process when cancelled.
    pub fn kill_switch(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token cancelled once the exit has been reported.
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Stop the process and wait until its exit has been reported.
    ///
    /// With a grace period, the process gets that long to exit on its own
    /// (e.g. after `Quit`) before it is killed.
    pub async fn terminate(self, grace: Option<Duration>) {
        if let Some(grace) = grace
            && self.is_running()
        {
            match tokio::time::timeout(grace, self.exited.cancelled()).await {
                Ok(()) => debug!("Monitor exited within {:?}", grace),
                Err(_) => debug!("Monitor still running after {:?}, killing", grace),
            }
        }

        self.shutdown.cancel();

        if let Err(e) = self.task.await {
            warn!("Monitor supervision task failed: {}", e);
        }
    }
}

async fn supervise<O, E, R1, R2>(
    stdout: Option<R1>,
    stderr: Option<R2>,
    mut child: Child,
    on_output: Arc<O>,
    on_exit: E,
    shutdown: CancellationToken,
    exited: CancellationToken,
) where
    O: Fn(OutputLine) + Send + Sync + 'static,
    E: FnOnce(Option<i32>) + Send + 'static,
    R1: AsyncRead + Unpin + Send + 'static,
    R2: AsyncRead + Unpin + Send + 'static,
{
    let out_pump = stdout.map(|s| tokio::spawn(pump(s, on_output.clone(), OutputLine::Stdout)));
    let err_pump = stderr.map(|s| tokio::spawn(pump(s, on_output, OutputLine::Stderr)));

    let status = tokio::select! {
        status = child.wait() => status,
        () = shutdown.cancelled() => {
            debug!("Killing monitor");
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill monitor: {}", e);
            }
            child.wait().await
        }
    };

    for handle in [out_pump, err_pump].into_iter().flatten() {
        if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("Monitor output still open {:?} after exit", DRAIN_TIMEOUT);
        }
    }

    let code = exit_code(status);
    info!("Monitor exited with code {:?}", code);

    on_exit(code);
    exited.cancel();
}

fn exit_code(status: io::Result<ExitStatus>) -> Option<i32> {
    match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed to wait for monitor: {}", e);
            None
        }
    }
}

async fn pump<R, O>(reader: R, on_output: Arc<O>, wrap: fn(String) -> OutputLine)
where
    R: AsyncRead + Unpin,
    O: Fn(OutputLine) + Send + Sync,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_output(wrap(line)),
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read monitor output: {}", e);
                break;
            }
        }
    }
}
