//! Supervisor: owns the monitor binary, process and channel.
//!
//! All mutating calls are serialized through one session lock, so there is
//! never more than one monitor process or channel. `kill()` cancels a start
//! that has not reached `Active` yet.

use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cache::AcquisitionError;
use crate::cache::BinaryCache;
use crate::cache::HttpFetcher;
use crate::cache::MonitorRelease;
use crate::channel::Channel;
use crate::channel::ChannelError;
use crate::channel::ChannelHandlers;
use crate::channel::ConnectPolicy;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::dispatch::EventSink;
use crate::domain::SupervisorState;
use crate::domain::WatchConfig;
use crate::process::MonitorProcess;
use crate::process::OutputLine;
use crate::process::orphans;
use crate::protocol::Command;
use crate::protocol::Event;
use crate::protocol::translate;
use crate::protocol::translate_output;

/// Errors returned by supervisor operations.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error("Failed to spawn monitor: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Start cancelled by shutdown")]
    Cancelled,

    #[error("No active monitor session")]
    NotActive,

    #[error("Status idle timeout must be at least one minute")]
    InvalidTimeout,
}

impl SupervisorError {
    /// Whether a later `start()` cannot succeed without outside changes.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Acquisition(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Timing and housekeeping knobs.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Socket readiness polling.
    pub connect: ConnectPolicy,

    /// Time granted after Quit before a forceful kill.
    pub quit_grace: Duration,

    /// Terminate leftover monitors before spawning.
    pub sweep_orphans: bool,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_policy(),
            quit_grace: config.quit_grace(),
            sweep_orphans: config.sweep_orphans,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Supervisor handle. Clones share the same monitor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    cache: BinaryCache,
    settings: SupervisorSettings,
    sink: Arc<dyn EventSink>,
    session: tokio::sync::Mutex<Option<Session>>,
    phase: Arc<PhaseCell>,
    start_cancel: Mutex<CancellationToken>,
    generation: AtomicU64,
}

/// A running monitor with its open channel.
struct Session {
    process: MonitorProcess,
    channel: Channel,
}

impl Session {
    fn is_running(&self) -> bool {
        self.process.is_running()
    }

    /// Quit politely when possible, then make sure the process is gone.
    async fn teardown(mut self, quit_grace: Option<Duration>) {
        let grace = match quit_grace {
            Some(grace) if self.process.is_running() && self.channel.is_open() => {
                self.channel.send(&Command::Quit).await;
                Some(grace)
            }
            _ => None,
        };

        self.channel.close().await;
        self.process.terminate(grace).await;
    }
}

impl Supervisor {
    /// Create a supervisor downloading the pinned release over HTTPS.
    pub fn new(config: &Config, sink: Arc<dyn EventSink>) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new()?;
        let cache = BinaryCache::new(config.cache_dir()?, MonitorRelease::pinned(), Arc::new(fetcher));
        debug!("Monitor cache directory: {}", cache.dir().display());

        Ok(Self::with_cache(
            cache,
            SupervisorSettings::from_config(config),
            sink,
        ))
    }

    /// Create a supervisor around an existing cache.
    pub fn with_cache(
        cache: BinaryCache,
        settings: SupervisorSettings,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                settings,
                sink,
                session: tokio::sync::Mutex::new(None),
                phase: Arc::new(PhaseCell::default()),
                start_cancel: Mutex::new(CancellationToken::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.inner.phase.get()
    }

    /// Whether a monitor is running with its channel open.
    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Active
    }

    /// Download and verify the monitor binary without starting it.
    pub async fn acquire(&self) -> Result<PathBuf, AcquisitionError> {
        self.inner.cache.ensure().await
    }

    /// Acquire, spawn and connect to the monitor.
    ///
    /// Does nothing if a monitor is already running. On failure nothing is
    /// left behind: a spawned process whose socket never came up is killed.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut slot = self.inner.session.lock().await;

        if slot.as_ref().is_some_and(Session::is_running) {
            debug!("Monitor already running");
            return Ok(());
        }

        if let Some(stale) = slot.take() {
            stale.teardown(None).await;
        }

        let cancel = self
            .inner
            .start_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!("Starting monitor");
        match self.launch(generation, &cancel).await {
            Ok(session) => {
                if !self.inner.phase.activate(generation) {
                    warn!("Monitor exited right after connecting");
                }
                *slot = Some(session);
                Ok(())
            }
            Err(e) => {
                let state = if e.is_fatal() {
                    SupervisorState::Error
                } else {
                    SupervisorState::Idle
                };
                self.inner.phase.set(generation, state);
                error!("Failed to start monitor: {}", e);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<Session, SupervisorError> {
        let inner = &self.inner;

        inner.phase.set(generation, SupervisorState::Acquiring);
        let executable = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SupervisorError::Cancelled),
            result = inner.cache.ensure() => result?,
        };

        inner.phase.set(generation, SupervisorState::Spawning);
        if inner.settings.sweep_orphans
            && let Some(name) = executable.file_name().and_then(OsStr::to_str)
        {
            orphans::sweep(name).await;
        }
        if cancel.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }

        let dispatcher = Dispatcher::new(inner.sink.clone());
        let process = MonitorProcess::spawn(
            &executable,
            output_handler(dispatcher.clone()),
            exit_handler(dispatcher.clone(), inner.phase.clone(), generation),
        )
        .map_err(SupervisorError::Spawn)?;

        inner.phase.set(generation, SupervisorState::Connecting);
        let socket_path = inner.cache.socket_path();
        let exited = process.exited();
        let handlers = channel_handlers(&dispatcher, process.kill_switch());

        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SupervisorError::Cancelled),
            result = Channel::connect(&socket_path, &inner.settings.connect, &exited, handlers) => {
                result.map_err(SupervisorError::from)
            }
        };

        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                process.terminate(None).await;
                return Err(e);
            }
        };

        Ok(Session { process, channel })
    }

    /// Start (or restart) the watch with new timeouts.
    ///
    /// A notification timeout of zero mirrors the status timeout.
    pub async fn reconfigure_watch(
        &self,
        status_timeout_minutes: u32,
        notifs_timeout_minutes: u32,
    ) -> Result<(), SupervisorError> {
        if status_timeout_minutes == 0 {
            return Err(SupervisorError::InvalidTimeout);
        }
        let watch = WatchConfig::new(status_timeout_minutes, notifs_timeout_minutes);

        let mut slot = self.inner.session.lock().await;
        let Some(session) = live_session(&mut slot).await else {
            return Err(SupervisorError::NotActive);
        };

        info!(
            "Configuring watch: status {} min, notifications {} min",
            watch.status_timeout_minutes(),
            watch.notifs_timeout_minutes()
        );
        session.channel.send(&Command::StartWatch(watch)).await;
        Ok(())
    }

    /// Stop the watch but keep the monitor running.
    pub async fn stop(&self) {
        let mut slot = self.inner.session.lock().await;
        match live_session(&mut slot).await {
            Some(session) => session.channel.send(&Command::StopWatch).await,
            None => debug!("No monitor running, nothing to stop"),
        }
    }

    /// Tear everything down. Safe from any state and safe to repeat.
    pub async fn kill(&self) {
        // Abort a start still in flight before waiting for its lock
        {
            let mut token = self
                .inner
                .start_cancel
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *token, CancellationToken::new()).cancel();
        }

        let mut slot = self.inner.session.lock().await;
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let Some(session) = slot.take() else {
            self.inner.phase.set(generation, SupervisorState::Idle);
            return;
        };

        info!("Stopping monitor");
        self.inner.phase.set(generation, SupervisorState::Stopping);
        session.teardown(Some(self.inner.settings.quit_grace)).await;
        self.inner.phase.set(generation, SupervisorState::Idle);
    }
}

/// The current session, after dropping one whose process has exited.
async fn live_session(slot: &mut Option<Session>) -> Option<&mut Session> {
    if slot.as_ref().is_some_and(|s| !s.is_running())
        && let Some(stale) = slot.take()
    {
        stale.teardown(None).await;
    }
    slot.as_mut()
}

fn output_handler(dispatcher: Dispatcher) -> impl Fn(OutputLine) + Send + Sync + 'static {
    move |line| {
        match &line {
            OutputLine::Stdout(text) => debug!("Monitor stdout: {}", text),
            OutputLine::Stderr(text) => warn!("Monitor stderr: {}", text),
        }
        dispatcher.dispatch(translate_output(line));
    }
}

fn exit_handler(
    dispatcher: Dispatcher,
    phase: Arc<PhaseCell>,
    generation: u64,
) -> impl FnOnce(Option<i32>) + Send + 'static {
    move |code| {
        dispatcher.close_with(Event::Exited(code));
        phase.exited(generation);
    }
}

fn channel_handlers(dispatcher: &Dispatcher, kill_switch: CancellationToken) -> ChannelHandlers {
    let connected = dispatcher.clone();
    let lines = dispatcher.clone();
    let errors = dispatcher.clone();

    ChannelHandlers {
        on_connected: Arc::new(move || {
            connected.dispatch(Event::Connected);
        }),
        on_line: Arc::new(move |line| match translate(&line) {
            Ok(Some(event)) => {
                lines.dispatch(event);
            }
            Ok(None) => debug!("Ignoring unknown monitor message: {}", line),
            Err(e) => warn!("Dropping malformed monitor message {:?}: {}", line, e),
        }),
        on_error: Arc::new(move |text| {
            errors.dispatch(Event::Error(text));
        }),
        on_closed: Arc::new(move || {
            info!("Monitor channel closed, stopping monitor");
            kill_switch.cancel();
        }),
    }
}

/// Lifecycle state tagged with the start attempt it belongs to.
#[derive(Default)]
struct PhaseCell {
    inner: Mutex<PhaseInner>,
}

#[derive(Default)]
struct PhaseInner {
    generation: u64,
    state: SupervisorState,
    last_exited: u64,
}

impl PhaseCell {
    fn lock(&self) -> std::sync::MutexGuard<'_, PhaseInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self) -> SupervisorState {
        self.lock().state
    }

    fn set(&self, generation: u64, state: SupervisorState) {
        let mut phase = self.lock();
        phase.generation = generation;
        phase.state = state;
    }

    /// Mark `generation` active unless its process already exited.
    fn activate(&self, generation: u64) -> bool {
        let mut phase = self.lock();
        phase.generation = generation;
        if phase.last_exited == generation {
            phase.state = SupervisorState::Idle;
            false
        } else {
            phase.state = SupervisorState::Active;
            true
        }
    }

    /// The process of `generation` exited.
    fn exited(&self, generation: u64) {
        let mut phase = self.lock();
        phase.last_exited = generation;
        if phase.generation == generation && phase.state == SupervisorState::Active {
            phase.state = SupervisorState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Platform;
    use crate::cache::sha256_hex;
    use crate::protocol::IdleUpdate;
    use crate::testing::Recorder;
    use crate::testing::StaticFetcher;
    use crate::testing::script;
    use serial_test::serial;
    use std::path::Path;
    use tokio::io::AsyncBufReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::io::BufReader;
    use tokio::io::Lines;
    use tokio::net::UnixListener;
    use tokio::net::unix::OwnedReadHalf;
    use tokio::net::unix::OwnedWriteHalf;

    struct Harness {
        dir: tempfile::TempDir,
        supervisor: Supervisor,
        recorder: Arc<Recorder>,
        fetcher: Arc<StaticFetcher>,
        listener: Option<UnixListener>,
    }

    impl Harness {
        /// Accept the supervisor's connection, playing the monitor's side.
        async fn accept(&self) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
            let listener = self.listener.as_ref().expect("harness has no listener");
            let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
                .await
                .expect("supervisor never connected")
                .unwrap();
            let (read, write) = stream.into_split();
            (BufReader::new(read).lines(), write)
        }

        async fn wait_for_state(&self, wanted: SupervisorState) {
            for _ in 0..500 {
                if self.supervisor.state() == wanted {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!(
                "state never became {wanted}, still {}",
                self.supervisor.state()
            );
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            connect: ConnectPolicy {
                initial_delay: Duration::ZERO,
                backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                timeout: Duration::from_secs(3),
            },
            quit_grace: Duration::from_millis(50),
            sweep_orphans: false,
        }
    }

    /// Build a harness whose monitor is a shell script.
    ///
    /// `served` overrides what the fake download returns; by default it is
    /// the script itself, which matches the pinned hash.
    fn build(
        dir: tempfile::TempDir,
        body: &str,
        served: Option<Vec<u8>>,
        listen: bool,
    ) -> Harness {
        let monitor = script(body);
        let release = MonitorRelease {
            base_url: "https://example.invalid/test".to_string(),
            asset_stem: "fake-monitor".to_string(),
            hashes: vec![("x86_64".to_string(), sha256_hex(monitor.as_bytes()))],
        };

        let fetcher = Arc::new(StaticFetcher::serving(
            served.unwrap_or_else(|| monitor.into_bytes()),
        ));
        let cache = BinaryCache::for_platform(
            dir.path().to_path_buf(),
            release,
            Platform::new("linux", "x86_64"),
            fetcher.clone(),
        );

        let listener = listen.then(|| UnixListener::bind(cache.socket_path()).unwrap());
        let recorder = Arc::new(Recorder::default());
        let supervisor = Supervisor::with_cache(cache, settings(), recorder.clone());

        Harness {
            dir,
            supervisor,
            recorder,
            fetcher,
            listener,
        }
    }

    fn harness(body: impl FnOnce(&Path) -> String) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let body = body(dir.path());
        build(dir, &body, None, true)
    }

    fn sleeper() -> Harness {
        harness(|_| "exec sleep 30".to_string())
    }

    #[tokio::test]
    #[serial]
    async fn test_end_to_end_watch_flow() {
        let h = sleeper();

        h.supervisor.start().await.unwrap();
        assert_eq!(h.supervisor.state(), SupervisorState::Active);
        assert!(h.supervisor.is_running());
        let (mut lines, mut write) = h.accept().await;

        // Zero notification timeout mirrors the status timeout
        h.supervisor.reconfigure_watch(5, 0).await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"{"StartWatch":[5,5]}"#
        );

        write
            .write_all(b"{\"WatchStarted\":[5,5]}\n{\"WatchEvent\":{\"StatusIdle\":true}}\n")
            .await
            .unwrap();
        h.recorder
            .wait_for("watch events", |events| events.len() >= 3)
            .await;

        assert_eq!(
            h.recorder.events(),
            vec![
                Event::Connected,
                Event::WatchStarted {
                    status_timeout: 5,
                    notifs_timeout: 5,
                },
                Event::WatchEvent(IdleUpdate {
                    status_idle: Some(true),
                    notifs_idle: None,
                }),
            ]
        );

        // Teardown asks politely first
        h.supervisor.kill().await;
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"{"Quit":null}"#
        );
        assert_eq!(h.recorder.count(&Event::Exited(None)), 1);
        assert_eq!(h.supervisor.state(), SupervisorState::Idle);
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_start_twice_single_instance() {
        let h = sleeper();

        let (first, second) = tokio::join!(h.supervisor.start(), h.supervisor.start());
        first.unwrap();
        second.unwrap();
        h.supervisor.start().await.unwrap();

        let _conn = h.accept().await;
        let listener = h.listener.as_ref().unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), listener.accept())
                .await
                .is_err(),
            "only one connection expected"
        );
        assert_eq!(h.recorder.count(&Event::Connected), 1);
        // Cache hit on every start after the first
        assert_eq!(h.fetcher.calls(), 1);

        h.supervisor.kill().await;
    }

    #[tokio::test]
    async fn test_kill_when_idle_is_noop() {
        let h = sleeper();

        h.supervisor.kill().await;
        h.supervisor.kill().await;

        assert!(h.recorder.events().is_empty());
        assert_eq!(h.supervisor.state(), SupervisorState::Idle);
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_kill_twice_tears_down_once() {
        let h = sleeper();
        h.supervisor.start().await.unwrap();
        let _conn = h.accept().await;

        h.supervisor.kill().await;
        h.supervisor.kill().await;

        assert_eq!(
            h.recorder.events(),
            vec![Event::Connected, Event::Exited(None)]
        );
        assert!(!h.supervisor.is_running());
    }

    #[tokio::test]
    #[serial]
    async fn test_unexpected_exit_then_restart() {
        let h = harness(|dir| {
            format!(
                "while [ ! -e '{}' ]; do sleep 0.05; done\nexit 1",
                dir.join("exit-now").display()
            )
        });
        let trigger = h.dir.path().join("exit-now");

        h.supervisor.start().await.unwrap();
        let (_lines, mut write) = h.accept().await;

        std::fs::write(&trigger, b"").unwrap();
        h.recorder
            .wait_for("exit", |events| events.contains(&Event::Exited(Some(1))))
            .await;
        h.wait_for_state(SupervisorState::Idle).await;

        // Channel traffic after the exit is not delivered
        let _ = write.write_all(b"{\"WatchStopped\":null}\n").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            h.recorder.events(),
            vec![Event::Connected, Event::Exited(Some(1))]
        );

        // Commands need a live session
        assert!(matches!(
            h.supervisor.reconfigure_watch(5, 5).await,
            Err(SupervisorError::NotActive)
        ));

        std::fs::remove_file(&trigger).unwrap();
        h.supervisor.start().await.unwrap();
        let _conn = h.accept().await;
        assert_eq!(h.recorder.count(&Event::Connected), 2);
        assert_eq!(h.supervisor.state(), SupervisorState::Active);

        h.supervisor.kill().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_monitor_exits_before_socket() {
        let dir = tempfile::tempdir().unwrap();
        let h = build(dir, "exit 3", None, false);

        let err = h.supervisor.start().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Channel(ChannelError::MonitorExited)
        ));
        assert!(!err.is_fatal());

        // Exit is reported even without a connection
        assert_eq!(h.recorder.events(), vec![Event::Exited(Some(3))]);
        assert_eq!(h.supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    #[serial]
    async fn test_remote_close_stops_monitor() {
        let h = sleeper();
        h.supervisor.start().await.unwrap();
        let conn = h.accept().await;

        drop(conn);
        h.recorder
            .wait_for("exit", |events| events.contains(&Event::Exited(None)))
            .await;
        h.wait_for_state(SupervisorState::Idle).await;

        // Nothing left to tear down
        h.supervisor.kill().await;
        assert_eq!(h.recorder.count(&Event::Exited(None)), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_bad_lines_keep_connection() {
        let h = sleeper();
        h.supervisor.start().await.unwrap();
        let (_lines, mut write) = h.accept().await;

        write
            .write_all(b"garbage\n{\"Mystery\":1}\n{\"WatchEvent\":{}}\n{\"WatchStopped\":null}\n")
            .await
            .unwrap();
        h.recorder
            .wait_for("watch stopped", |events| {
                events.contains(&Event::WatchStopped)
            })
            .await;

        assert_eq!(
            h.recorder.events(),
            vec![Event::Connected, Event::WatchStopped]
        );
        assert!(h.supervisor.is_running());

        h.supervisor.kill().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_output_streams_become_events() {
        let h = harness(|_| "echo hello\necho oops >&2\nexec sleep 30".to_string());
        h.supervisor.start().await.unwrap();
        let _conn = h.accept().await;

        h.recorder
            .wait_for("output", |events| {
                events.contains(&Event::Info("hello".to_string()))
                    && events.contains(&Event::Error("oops".to_string()))
            })
            .await;

        h.supervisor.kill().await;
    }

    #[tokio::test]
    #[serial]
    async fn test_stop_keeps_monitor_running() {
        let h = sleeper();
        h.supervisor.start().await.unwrap();
        let (mut lines, _write) = h.accept().await;

        h.supervisor.stop().await;
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"{"StopWatch":null}"#
        );
        assert!(h.supervisor.is_running());

        h.supervisor.kill().await;
    }

    #[tokio::test]
    async fn test_commands_without_session() {
        let h = sleeper();

        assert!(matches!(
            h.supervisor.reconfigure_watch(5, 5).await,
            Err(SupervisorError::NotActive)
        ));
        assert!(matches!(
            h.supervisor.reconfigure_watch(0, 5).await,
            Err(SupervisorError::InvalidTimeout)
        ));
        h.supervisor.stop().await;
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_integrity_failure_aborts_start() {
        let dir = tempfile::tempdir().unwrap();
        let h = build(dir, "exec sleep 30", Some(b"tampered".to_vec()), true);

        let err = h.supervisor.start().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Acquisition(AcquisitionError::Integrity { .. })
        ));
        assert!(err.is_fatal());
        assert_eq!(h.supervisor.state(), SupervisorState::Error);
        assert!(h.recorder.events().is_empty());
        assert!(!h.dir.path().join("fake-monitor.x86_64").exists());

        // Teardown clears the error without emitting anything
        h.supervisor.kill().await;
        assert_eq!(h.supervisor.state(), SupervisorState::Idle);
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[serial]
    async fn test_connected_precedes_first_line() {
        const CYCLES: usize = 20;

        let mut h = sleeper();
        let listener = h.listener.take().unwrap();

        // The monitor speaks the moment it accepts
        let server = tokio::spawn(async move {
            let mut streams = Vec::new();
            for _ in 0..CYCLES {
                let (mut stream, _) = listener.accept().await.unwrap();
                stream.write_all(b"{\"Info\":\"hello\"}\n").await.unwrap();
                streams.push(stream);
            }
            streams
        });

        let hello = Event::Info("hello".to_string());
        for cycle in 1..=CYCLES {
            h.supervisor.start().await.unwrap();
            h.recorder
                .wait_for("greeting", |events| {
                    events.iter().filter(|e| **e == hello).count() == cycle
                })
                .await;
            h.supervisor.kill().await;
        }

        let events = h.recorder.events();
        for run in events.chunks(3) {
            assert_eq!(run, [Event::Connected, hello.clone(), Event::Exited(None)]);
        }
        assert_eq!(events.len(), CYCLES * 3);

        drop(server.await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn test_kill_cancels_pending_start() {
        // Monitor never opens its socket
        let dir = tempfile::tempdir().unwrap();
        let h = build(dir, "exec sleep 30", None, false);

        let supervisor = h.supervisor.clone();
        let pending = tokio::spawn(async move { supervisor.start().await });
        h.wait_for_state(SupervisorState::Connecting).await;

        h.supervisor.kill().await;
        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("start did not yield to kill")
            .unwrap();

        assert!(matches!(result, Err(SupervisorError::Cancelled)));
        assert_eq!(h.supervisor.state(), SupervisorState::Idle);
        assert_eq!(h.recorder.events(), vec![Event::Exited(None)]);
    }

    #[test]
    fn test_phase_ignores_stale_exit() {
        let phase = PhaseCell::default();

        phase.set(1, SupervisorState::Connecting);
        assert!(phase.activate(1));
        phase.set(2, SupervisorState::Connecting);

        // Exit of the previous process does not touch the new attempt
        phase.exited(1);
        assert_eq!(phase.get(), SupervisorState::Connecting);

        // Exit while still connecting prevents activation
        phase.exited(2);
        assert!(!phase.activate(2));
        assert_eq!(phase.get(), SupervisorState::Idle);
    }
}
