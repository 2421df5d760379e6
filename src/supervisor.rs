use std::path::PathBuf;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::SupervisorConfig;
use crate::error::WildError;
use crate::watchdog::{Sleeper, ThreadSleeper};

/// Exit code the worker uses to report that no pending work remains.
pub const COMPLETE_EXIT_CODE: i32 = 0;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Completed,
    Failed(Option<i32>),
}

impl ChildExit {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(COMPLETE_EXIT_CODE) => ChildExit::Completed,
            other => ChildExit::Failed(other),
        }
    }
}

pub trait WorkerProcess {
    /// `None` if the process is still running when `timeout` elapses.
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ChildExit>, WildError>;
    fn kill(&mut self) -> Result<(), WildError>;
    fn wait(&mut self) -> Result<ChildExit, WildError>;
}

pub trait Launcher {
    type Process: WorkerProcess;

    fn spawn(&self) -> Result<Self::Process, WildError>;
}

pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl Launcher for CommandLauncher {
    type Process = ChildProcess;

    fn spawn(&self) -> Result<ChildProcess, WildError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .spawn()
            .map_err(|err| {
                WildError::Process(format!("spawn {}: {err}", self.program.display()))
            })?;
        Ok(ChildProcess { child })
    }
}

pub struct ChildProcess {
    child: Child,
}

impl WorkerProcess for ChildProcess {
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ChildExit>, WildError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self
                .child
                .try_wait()
                .map_err(|err| WildError::Process(format!("failed to poll worker: {err}")))?;
            if let Some(status) = status {
                return Ok(Some(ChildExit::from_code(status.code())));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// SIGKILL on unix, so a worker that ignores SIGTERM still stops. Rows are
    /// flushed per append; only the in-flight item is lost.
    fn kill(&mut self) -> Result<(), WildError> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // already exited between the last poll and now
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(WildError::Process(format!("failed to kill worker: {err}"))),
        }
    }

    fn wait(&mut self) -> Result<ChildExit, WildError> {
        let status = self
            .child
            .wait()
            .map_err(|err| WildError::Process(format!("failed to reap worker: {err}")))?;
        Ok(ChildExit::from_code(status.code()))
    }
}

pub enum SupervisorState<P> {
    Idle,
    Running(P),
    Terminating(P),
    Done,
}

impl<P> SupervisorState<P> {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Running(_) => "running",
            SupervisorState::Terminating(_) => "terminating",
            SupervisorState::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub spawns: u64,
    pub kills: u64,
    pub crashes: u64,
}

/// Restarts the worker every time it outlives the session ceiling, until it
/// exits with `COMPLETE_EXIT_CODE`.
pub struct Supervisor<L: Launcher, S: Sleeper = ThreadSleeper> {
    launcher: L,
    sleeper: S,
    config: SupervisorConfig,
    state: SupervisorState<L::Process>,
    stats: SupervisorStats,
}

impl<L: Launcher> Supervisor<L, ThreadSleeper> {
    pub fn new(launcher: L, config: SupervisorConfig) -> Self {
        Self::with_sleeper(launcher, config, ThreadSleeper)
    }
}

impl<L: Launcher, S: Sleeper> Supervisor<L, S> {
    pub fn with_sleeper(launcher: L, config: SupervisorConfig, sleeper: S) -> Self {
        Self {
            launcher,
            sleeper,
            config,
            state: SupervisorState::Idle,
            stats: SupervisorStats::default(),
        }
    }

    pub fn state(&self) -> &SupervisorState<L::Process> {
        &self.state
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, SupervisorState::Done)
    }

    /// Loops until the worker reports completion. There is no restart limit.
    pub fn run(&mut self) -> SupervisorStats {
        while !self.is_done() {
            self.step();
        }
        self.stats
    }

    /// Performs one state transition. Process errors never stop supervision;
    /// they lead back to `Idle` like any other failed session.
    pub fn step(&mut self) {
        let state = std::mem::replace(&mut self.state, SupervisorState::Done);
        self.state = match state {
            SupervisorState::Idle => match self.launcher.spawn() {
                Ok(process) => {
                    self.stats.spawns += 1;
                    tracing::info!(
                        session = self.stats.spawns,
                        ceiling_secs = self.config.session_ceiling.as_secs(),
                        "worker started"
                    );
                    SupervisorState::Running(process)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to start worker; retrying");
                    self.sleeper.sleep(self.config.restart_pause);
                    SupervisorState::Idle
                }
            },
            SupervisorState::Running(mut process) => {
                match process.wait_timeout(self.config.session_ceiling) {
                    Ok(Some(ChildExit::Completed)) => {
                        tracing::info!("worker finished naturally; no pending work remains");
                        SupervisorState::Done
                    }
                    Ok(Some(ChildExit::Failed(code))) => {
                        self.stats.crashes += 1;
                        tracing::warn!(?code, "worker exited without completing; restarting");
                        self.sleeper.sleep(self.config.restart_pause);
                        SupervisorState::Idle
                    }
                    Ok(None) => {
                        tracing::info!(
                            ceiling_secs = self.config.session_ceiling.as_secs(),
                            "session ceiling reached; terminating worker"
                        );
                        SupervisorState::Terminating(process)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "lost track of worker; terminating it");
                        SupervisorState::Terminating(process)
                    }
                }
            }
            SupervisorState::Terminating(mut process) => {
                if let Err(err) = process.kill() {
                    tracing::warn!(error = %err, "kill failed");
                }
                match process.wait() {
                    Ok(exit) => tracing::info!(
                        ?exit,
                        restart_secs = self.config.restart_pause.as_secs(),
                        "worker terminated; restarting after pause"
                    ),
                    Err(err) => tracing::warn!(error = %err, "could not reap worker"),
                }
                self.stats.kills += 1;
                self.sleeper.sleep(self.config.restart_pause);
                SupervisorState::Idle
            }
            SupervisorState::Done => SupervisorState::Done,
        };
    }
}
