//! Recording controller
//!
//! Starts the capture process when the instrument appears and stops it when
//! the instrument goes away, writing each finished take to the ledger.

use super::process::{CaptureExit, CaptureLauncher, CaptureProcess, RecordingError, RecordingResult};
use super::state::{output_path_for, OpenSession, RecordingState};
use crate::device::{DeviceAction, DeviceEvent};
use crate::ledger::{RecordingSession, SessionLedger};
use crate::port::{CapturePort, PortLister, PortResolver};
use crate::utils::{Clock, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// How long a fresh capture process must survive before it counts as started
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Events emitted during recording
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Capture process running
    Started {
        session_id: String,
        port: CapturePort,
        output_path: PathBuf,
    },
    /// Session closed and handed to the ledger
    Stopped(RecordingSession),
    /// Error occurred
    Error(String),
}

/// The running capture process and the session it records
struct ActiveCapture {
    port: CapturePort,
    process: Box<dyn CaptureProcess>,
    session: OpenSession,
}

#[derive(Default)]
enum ControllerState {
    #[default]
    Idle,
    Starting,
    Recording(ActiveCapture),
    Stopping(ActiveCapture),
}

impl ControllerState {
    fn kind(&self) -> RecordingState {
        match self {
            ControllerState::Idle => RecordingState::Idle,
            ControllerState::Starting => RecordingState::Starting,
            ControllerState::Recording(_) => RecordingState::Recording,
            ControllerState::Stopping(_) => RecordingState::Stopping,
        }
    }
}

/// Owns at most one capture process at a time
pub struct RecordingController<L> {
    /// Port name handed to the resolver
    target: String,

    /// Directory the MIDI files are written to
    output_dir: PathBuf,

    resolver: PortResolver<L>,
    launcher: Box<dyn CaptureLauncher>,
    ledger: SessionLedger,
    clock: Arc<dyn Clock>,
    startup_grace: Duration,

    state: ControllerState,

    /// Event broadcaster
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl<L: PortLister> RecordingController<L> {
    /// Create a new recording controller
    pub fn new(
        target: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        resolver: PortResolver<L>,
        launcher: Box<dyn CaptureLauncher>,
        ledger: SessionLedger,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            target: target.into(),
            output_dir: output_dir.into(),
            resolver,
            launcher,
            ledger,
            clock: Arc::new(SystemClock),
            startup_grace: DEFAULT_STARTUP_GRACE,
            state: ControllerState::Idle,
            event_tx,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Get the current recording state
    pub fn state(&self) -> RecordingState {
        self.state.kind()
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    fn set_state(&mut self, state: ControllerState) {
        tracing::debug!("Recorder {:?} -> {:?}", self.state.kind(), state.kind());
        self.state = state;
    }

    /// React to a matched hotplug event. Failures are logged and broadcast;
    /// the controller is always left ready for the next event.
    pub async fn handle_event(&mut self, event: &DeviceEvent) {
        tracing::debug!("Handling {} of {}", event.action, event.device.label());

        let result = match event.action {
            DeviceAction::Add => self.connect().await,
            DeviceAction::Remove => self.disconnect().await.map(|_| ()),
        };

        if let Err(e) = result {
            match &e {
                RecordingError::ExitedOnStartup(_) => tracing::warn!("{}", e),
                _ => tracing::error!("Failed to handle {} of {}: {}", event.action, event.device.label(), e),
            }
            let _ = self.event_tx.send(RecordingEvent::Error(e.to_string()));
        }
    }

    /// Start recording. Does nothing unless idle.
    pub async fn connect(&mut self) -> RecordingResult<()> {
        if !matches!(self.state, ControllerState::Idle) {
            tracing::debug!("Ignoring connect while {:?}", self.state());
            return Ok(());
        }

        tracing::info!("Instrument connected, starting recording");
        self.set_state(ControllerState::Starting);

        match self.start_capture().await {
            Ok(active) => {
                tracing::info!(
                    "Recording session {} on port {} to {:?}",
                    active.session.id,
                    active.port,
                    active.session.output_path
                );
                let _ = self.event_tx.send(RecordingEvent::Started {
                    session_id: active.session.id.clone(),
                    port: active.port.clone(),
                    output_path: active.session.output_path.clone(),
                });
                self.set_state(ControllerState::Recording(active));
                Ok(())
            }
            Err(e) => {
                self.set_state(ControllerState::Idle);
                Err(e)
            }
        }
    }

    async fn start_capture(&mut self) -> RecordingResult<ActiveCapture> {
        let port = self.resolver.resolve(&self.target).await?;

        std::fs::create_dir_all(&self.output_dir)?;
        let start_time = self.clock.now();
        let output_path = output_path_for(&self.output_dir, start_time);

        let mut process = self.launcher.launch(&port, &output_path)?;

        if !self.startup_grace.is_zero() {
            tokio::time::sleep(self.startup_grace).await;
        }
        if let Some(exit) = process.try_exit()? {
            return Err(RecordingError::ExitedOnStartup(exit.to_string()));
        }

        Ok(ActiveCapture {
            port,
            process,
            session: OpenSession::new(start_time, output_path),
        })
    }

    /// Stop recording and persist the session. Does nothing unless recording.
    pub async fn disconnect(&mut self) -> RecordingResult<Option<RecordingSession>> {
        let active = match std::mem::take(&mut self.state) {
            ControllerState::Recording(active) => active,
            other => {
                tracing::debug!("Ignoring disconnect while {:?}", other.kind());
                self.state = other;
                return Ok(None);
            }
        };

        tracing::info!("Instrument disconnected, stopping recording on port {}", active.port);
        self.set_state(ControllerState::Stopping(active));

        let failure = match &mut self.state {
            ControllerState::Stopping(active) => stop_process(active.process.as_mut()).await,
            _ => None,
        };
        let stop_time = self.clock.now();

        let ControllerState::Stopping(active) = std::mem::take(&mut self.state) else {
            self.set_state(ControllerState::Idle);
            return Ok(None);
        };
        self.set_state(ControllerState::Idle);

        let mut session = active.session.close(stop_time);
        if let Some(e) = failure {
            tracing::error!("{}; session {} is incomplete", e, session.id());
            let _ = self.event_tx.send(RecordingEvent::Error(e.to_string()));
            session = session.into_degraded();
        }

        match self.ledger.append(session) {
            Ok(stored) => {
                let stored = stored.clone();
                tracing::info!("Recording stopped. Duration: {:.1}s", stored.duration_secs());
                let _ = self.event_tx.send(RecordingEvent::Stopped(stored.clone()));
                Ok(Some(stored))
            }
            Err(e) => Err(RecordingError::Persistence(e)),
        }
    }

    /// Finish any recording in progress before the process exits
    pub async fn shutdown(&mut self) -> RecordingResult<Option<RecordingSession>> {
        if !matches!(self.state, ControllerState::Recording(_)) {
            return Ok(None);
        }
        tracing::info!("Shutting down, finishing the current recording");
        self.disconnect().await
    }
}

/// Interrupt the capture process and wait for it. Returns what went wrong, if
/// anything; a process that ended before being asked to counts as a failure.
async fn stop_process(process: &mut dyn CaptureProcess) -> Option<RecordingError> {
    match process.try_exit() {
        Ok(Some(exit)) => {
            return Some(RecordingError::ProcessExit(format!(
                "capture process ended before it was stopped ({})",
                exit
            )))
        }
        Ok(None) => {}
        Err(e) => return Some(e),
    }

    match process.interrupt().await {
        Ok(CaptureExit::Clean) => None,
        Ok(CaptureExit::Abnormal(reason)) => Some(RecordingError::ProcessExit(reason)),
        Err(e) => Some(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::monitor::tests::piano;
    use crate::port::resolver::tests::ScriptedLister;
    use crate::port::{PortError, RetryPolicy};
    use crate::utils::clock::tests::ManualClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use tempfile::tempdir;

    pub const LISTING: &str = " 14:0    Midi Through    Midi Through Port-0\n 28:0    ARIUS    ARIUS MIDI 1\n";

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Behavior {
        /// Runs until interrupted, then exits cleanly
        Normal,
        /// Dies before the startup probe
        ExitImmediately,
        /// Passes the startup probe, then ends on its own
        DiesAfterStart,
        /// Exits with an error status when interrupted
        FailsOnInterrupt,
        /// Cannot be spawned at all
        FailSpawn,
    }

    #[derive(Debug, Default)]
    pub struct LaunchStats {
        pub launched: usize,
        pub live: usize,
        pub max_live: usize,
        pub interrupts: usize,
        pub ports: Vec<String>,
    }

    #[derive(Clone)]
    pub struct FakeLauncher {
        pub behavior: Arc<Mutex<Behavior>>,
        pub stats: Arc<Mutex<LaunchStats>>,
    }

    impl FakeLauncher {
        pub fn new(behavior: Behavior) -> Self {
            Self {
                behavior: Arc::new(Mutex::new(behavior)),
                stats: Arc::new(Mutex::new(LaunchStats::default())),
            }
        }
    }

    struct FakeProcess {
        behavior: Behavior,
        probes: usize,
        alive: bool,
        stats: Arc<Mutex<LaunchStats>>,
    }

    impl FakeProcess {
        fn end(&mut self) {
            if self.alive {
                self.alive = false;
                self.stats.lock().live -= 1;
            }
        }
    }

    impl Drop for FakeProcess {
        fn drop(&mut self) {
            self.end();
        }
    }

    impl CaptureLauncher for FakeLauncher {
        fn launch(&self, port: &CapturePort, _output: &Path) -> RecordingResult<Box<dyn CaptureProcess>> {
            let behavior = *self.behavior.lock();
            if behavior == Behavior::FailSpawn {
                return Err(RecordingError::ProcessSpawn("No such file or directory".to_string()));
            }

            let mut stats = self.stats.lock();
            stats.launched += 1;
            stats.ports.push(port.to_string());
            stats.live += 1;
            stats.max_live = stats.max_live.max(stats.live);
            drop(stats);

            Ok(Box::new(FakeProcess {
                behavior,
                probes: 0,
                alive: true,
                stats: self.stats.clone(),
            }))
        }
    }

    #[async_trait]
    impl CaptureProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            self.alive.then_some(4242)
        }

        fn try_exit(&mut self) -> RecordingResult<Option<CaptureExit>> {
            self.probes += 1;
            let exit = match self.behavior {
                Behavior::ExitImmediately => Some(CaptureExit::Abnormal("exit status: 1".to_string())),
                Behavior::DiesAfterStart if self.probes > 1 => Some(CaptureExit::Clean),
                _ if !self.alive => Some(CaptureExit::Clean),
                _ => None,
            };
            if exit.is_some() {
                self.end();
            }
            Ok(exit)
        }

        async fn interrupt(&mut self) -> RecordingResult<CaptureExit> {
            self.stats.lock().interrupts += 1;
            self.end();
            Ok(match self.behavior {
                Behavior::FailsOnInterrupt => CaptureExit::Abnormal("exit status: 2".to_string()),
                _ => CaptureExit::Clean,
            })
        }
    }

    pub fn controller_with(
        dir: &Path,
        lister: ScriptedLister,
        launcher: &FakeLauncher,
        clock: &ManualClock,
    ) -> RecordingController<ScriptedLister> {
        let resolver = PortResolver::new(lister, RetryPolicy::default());
        let ledger = SessionLedger::open(dir.join("sessions.json")).unwrap();
        RecordingController::new("ARIUS", dir.join("takes"), resolver, Box::new(launcher.clone()), ledger)
            .with_clock(Arc::new(clock.clone()))
            .with_startup_grace(Duration::ZERO)
    }

    pub fn controller(
        dir: &Path,
        launcher: &FakeLauncher,
        clock: &ManualClock,
    ) -> RecordingController<ScriptedLister> {
        controller_with(dir, ScriptedLister::always(LISTING), launcher, clock)
    }

    fn add() -> DeviceEvent {
        DeviceEvent::new(DeviceAction::Add, piano())
    }

    fn remove() -> DeviceEvent {
        DeviceEvent::new(DeviceAction::Remove, piano())
    }

    #[tokio::test]
    async fn test_connect_then_disconnect_records_one_session() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(Behavior::Normal);
        let clock = ManualClock::new();
        let mut controller = controller(dir.path(), &launcher, &clock);

        controller.handle_event(&add()).await;
        assert_eq!(controller.state(), RecordingState::Recording);
        assert_eq!(launcher.stats.lock().ports, vec!["28:0".to_string()]);

        clock.advance(Duration::from_secs(5));
        controller.handle_event(&remove()).await;

        assert_eq!(controller.state(), RecordingState::Idle);
        assert_eq!(launcher.stats.lock().live, 0);
        assert_eq!(launcher.stats.lock().interrupts, 1);

        let sessions = controller.ledger().sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].duration_secs(), 5.0);
        assert!(!sessions[0].is_degraded());
        assert!(sessions[0].midi_file_path().ends_with(".mid"));
        assert!(Path::new(sessions[0].midi_file_path()).starts_with(dir.path().join("takes")));

        // The file on disk holds the same session
        let stored = crate::ledger::load_all(&dir.path().join("sessions.json")).unwrap();
        assert_eq!(stored, sessions);
    }

    #[tokio::test]
    async fn test_second_add_while_recording_is_ignored() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(Behavior::Normal);
        let clock = ManualClock::new();
        let mut controller = controller(dir.path(), &launcher, &clock);

        controller.handle_event(&add()).await;
        controller.handle_event(&add()).await;

        assert_eq!(controller.state(), RecordingState::Recording);
        assert_eq!(launcher.stats.lock().launched, 1);
        assert_eq!(launcher.stats.lock().live, 1);
    }

    #[tokio::test]
    async fn test_remove_while_idle_is_ignored() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(Behavior::Normal);
        let clock = ManualClock::new();
        let mut controller = controller(dir.path(), &launcher, &clock);

        assert!(controller.disconnect().await.unwrap().is_none());
        assert_eq!(controller.state(), RecordingState::Idle);
        assert!(controller.ledger().is_empty());
        assert!(!dir.path().join("sessions.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_port_returns_to_idle() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(Behavior::Normal);
        let clock = ManualClock::new();
        let mut controller = controller_with(
            dir.path(),
            ScriptedLister::always(" 14:0    Midi Through    Midi Through Port-0\n"),
            &launcher,
            &clock,
        );

        let result = controller.connect().await;
        assert!(matches!(
            result,
            Err(RecordingError::Port(PortError::NotFound(ref target))) if target == "ARIUS"
        ));
        assert_eq!(controller.state(), RecordingState::Idle);
        assert_eq!(launcher.stats.lock().launched, 0);

        // A later remove has nothing to stop
        controller.handle_event(&remove()).await;
        assert!(controller.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_opens_no_session() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(Behavior::FailSpawn);
        let clock = ManualClock::new();
        let mut controller = controller(dir.path(), &launcher, &clock);

        assert!(matches!(
            controller.connect().await,
            Err(RecordingError::ProcessSpawn(_))
        ));
        assert_eq!(controller.state(), RecordingState::Idle);

        // Recovers once the command becomes available
        *launcher.behavior.lock() = Behavior::Normal;
        controller.connect().await.unwrap();
        assert_eq!(controller.state(), RecordingState::Recording);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_exiting_during_startup_grace() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(Behavior::ExitImmediately);
        let clock = ManualClock::new();
        let mut controller =
            controller(dir.path(), &launcher, &clock).with_startup_grace(DEFAULT_STARTUP_GRACE);

        assert!(matches!(
            controller.connect().await,
            Err(RecordingError::ExitedOnStartup(_))
        ));
        assert_eq!(controller.state(), RecordingState::Idle);
        assert_eq!(launcher.stats.lock().live, 0);

        controller.handle_event(&remove()).await;
        assert!(controller.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_abnormal_exit_is_persisted_as_degraded() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(Behavior::FailsOnInterrupt);
        let clock = ManualClock::new();
        let mut controller = controller(dir.path(), &launcher, &clock);
        let mut events = controller.subscribe();

        controller.connect().await.unwrap();
        clock.advance(Duration::from_secs(30));
        let session = controller.disconnect().await.unwrap().unwrap();

        assert!(session.is_degraded());
        assert_eq!(session.duration_secs(), 30.0);
        assert_eq!(controller.ledger().len(), 1);

        assert!(matches!(events.try_recv(), Ok(RecordingEvent::Started { .. })));
        assert!(matches!(events.try_recv(), Ok(RecordingEvent::Error(_))));
        assert!(matches!(events.try_recv(), Ok(RecordingEvent::Stopped(s)) if s.is_degraded()));
    }

    #[tokio::test]
    async fn test_process_ended_before_remove_is_degraded() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(Behavior::DiesAfterStart);
        let clock = ManualClock::new();
        let mut controller = controller(dir.path(), &launcher, &clock);

        controller.connect().await.unwrap();
        assert_eq!(controller.state(), RecordingState::Recording);

        clock.advance(Duration::from_secs(2));
        let session = controller.disconnect().await.unwrap().unwrap();
        assert!(session.is_degraded());
        // Never asked to stop: it had already gone
        assert_eq!(launcher.stats.lock().interrupts, 0);
        assert_eq!(controller.ledger().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_write_failure_keeps_session_in_memory() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let launcher = FakeLauncher::new(Behavior::Normal);
        let clock = ManualClock::new();
        let resolver = PortResolver::new(ScriptedLister::always(LISTING), RetryPolicy::default());
        let ledger = SessionLedger::open(blocker.join("sessions.json")).unwrap();
        let mut controller = RecordingController::new(
            "ARIUS",
            dir.path().join("takes"),
            resolver,
            Box::new(launcher.clone()),
            ledger,
        )
        .with_clock(Arc::new(clock.clone()))
        .with_startup_grace(Duration::ZERO);

        controller.connect().await.unwrap();
        clock.advance(Duration::from_secs(1));
        let result = controller.disconnect().await;

        assert!(matches!(result, Err(RecordingError::Persistence(_))));
        assert_eq!(controller.state(), RecordingState::Idle);
        assert_eq!(controller.ledger().len(), 1);
        assert_eq!(launcher.stats.lock().live, 0);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_recording() {
        let dir = tempdir().unwrap();
        let launcher = FakeLauncher::new(Behavior::Normal);
        let clock = ManualClock::new();
        let mut controller = controller(dir.path(), &launcher, &clock);

        assert!(controller.shutdown().await.unwrap().is_none());

        controller.connect().await.unwrap();
        clock.advance(Duration::from_secs(12));
        let session = controller.shutdown().await.unwrap().unwrap();

        assert_eq!(session.duration_secs(), 12.0);
        assert_eq!(controller.state(), RecordingState::Idle);
        assert_eq!(launcher.stats.lock().live, 0);
        assert_eq!(crate::ledger::load_all(&dir.path().join("sessions.json")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_event_sequences_never_overlap_processes() {
        for len in 1..=6 {
            for bits in 0..(1u32 << len) {
                let dir = tempdir().unwrap();
                let launcher = FakeLauncher::new(Behavior::Normal);
                let clock = ManualClock::new();
                let mut controller = controller(dir.path(), &launcher, &clock);

                let mut recording = false;
                let mut clean_stops = 0;
                for i in 0..len {
                    clock.advance(Duration::from_secs(1));
                    if bits & (1 << i) != 0 {
                        controller.handle_event(&add()).await;
                        recording = true;
                    } else {
                        controller.handle_event(&remove()).await;
                        if recording {
                            clean_stops += 1;
                        }
                        recording = false;
                    }
                }

                let stats = launcher.stats.lock();
                assert!(stats.max_live <= 1, "sequence {:0width$b}", bits, width = len);
                assert_eq!(stats.live, usize::from(recording));
                drop(stats);

                let sessions = controller.ledger().sessions();
                assert_eq!(sessions.len(), clean_stops);
                for session in sessions {
                    assert!(session.stop_time() >= session.start_time());
                    assert!(!session.is_degraded());
                }
            }
        }
    }
}
