//! Launching and watching worker and manual-intervention processes.

use crate::config::CommandSpec;
use crate::database::Stage;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

/// Exit code a worker uses to report a transient upstream failure (EX_TEMPFAIL).
pub const EXIT_TRANSIENT: i32 = 75;
/// Exit code a worker uses when the store failed under it.
pub const EXIT_STORE_ERROR: i32 = 1;

/// How a watched process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Transient,
    /// Any other exit; `None` when killed by a signal.
    Failed(Option<i32>),
}

impl ExitKind {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => Self::Success,
            Some(EXIT_TRANSIENT) => Self::Transient,
            code => Self::Failed(code),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A running process the supervisor launched and keeps polling.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Non-blocking: `Ok(None)` while the process is still running.
    fn poll_exit(&mut self) -> io::Result<Option<ExitKind>>;

    /// OS-level existence check, used when `poll_exit` errors.
    fn is_alive(&self) -> bool;

    /// Kill the process and reap it.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Handle on a child spawned by this process.
pub struct ChildHandle {
    child: Child,
}

impl ChildHandle {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn poll_exit(&mut self) -> io::Result<Option<ExitKind>> {
        Ok(self.child.try_wait()?.map(ExitKind::from_status))
    }

    fn is_alive(&self) -> bool {
        pid_alive(self.child.id())
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

/// Whether any process with `pid` exists.
pub fn pid_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::new());
    sys.process(pid).is_some()
}

/// Used and percent-used system memory, for the tick summary.
pub fn memory_info() -> (f64, f64) {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();

    let used_mb = sys.used_memory() as f64 / 1024.0 / 1024.0;
    let total_mb = sys.total_memory() as f64 / 1024.0 / 1024.0;
    let percent = if total_mb > 0.0 {
        (used_mb / total_mb) * 100.0
    } else {
        0.0
    };

    (used_mb, percent)
}

/// Starts worker and manual-intervention processes.
pub trait WorkerLauncher: Send {
    fn launch_worker(&self, stage: Stage, feed: &str) -> io::Result<Box<dyn ProcessHandle>>;

    fn launch_manual(&self, feed: &str, command: &CommandSpec)
        -> io::Result<Box<dyn ProcessHandle>>;
}

/// Launches workers by re-executing this binary with the `worker` subcommand.
pub struct ProcessLauncher {
    exe: PathBuf,
    config_path: Option<PathBuf>,
    log_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, config_path: Option<PathBuf>, log_dir: PathBuf) -> Self {
        Self {
            exe,
            config_path,
            log_dir,
        }
    }

    pub fn current_exe(config_path: Option<PathBuf>, log_dir: PathBuf) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path, log_dir))
    }

    fn log_file(&self, prefix: &str, feed: &str) -> io::Result<(File, File)> {
        std::fs::create_dir_all(&self.log_dir)?;
        let path = log_path(&self.log_dir, prefix, feed);
        // Append: fanned-out workers of one stage and feed share a file
        let stdout = OpenOptions::new().create(true).append(true).open(&path)?;
        let stderr = stdout.try_clone()?;
        Ok((stdout, stderr))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch_worker(&self, stage: Stage, feed: &str) -> io::Result<Box<dyn ProcessHandle>> {
        let (stdout, stderr) = self.log_file(stage.as_str(), feed)?;

        let mut cmd = Command::new(&self.exe);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.args(["worker", "--stage", stage.as_str(), "--feed", feed])
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let child = cmd.spawn()?;
        Ok(Box::new(ChildHandle::new(child)))
    }

    fn launch_manual(
        &self,
        feed: &str,
        command: &CommandSpec,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let (stdout, stderr) = self.log_file("manual", feed)?;

        let child = Command::new(&command.program)
            .args(command.args.iter().map(|a| a.replace("{queue}", feed)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        Ok(Box::new(ChildHandle::new(child)))
    }
}

/// `<log_dir>/<prefix>_<feed>.log` with path separators in the feed name replaced.
pub fn log_path(log_dir: &Path, prefix: &str, feed: &str) -> PathBuf {
    let safe: String = feed
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    log_dir.join(format!("{}_{}.log", prefix, safe))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Process stand-in whose exit is decided by the test.
    #[derive(Clone)]
    pub struct FakeHandle {
        pid: u32,
        exit: Arc<Mutex<Option<ExitKind>>>,
    }

    impl FakeHandle {
        pub fn running(pid: u32) -> Self {
            Self {
                pid,
                exit: Arc::new(Mutex::new(None)),
            }
        }

        pub fn finish(&self, kind: ExitKind) {
            *self.exit.lock().unwrap() = Some(kind);
        }
    }

    impl ProcessHandle for FakeHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn poll_exit(&mut self) -> io::Result<Option<ExitKind>> {
            Ok(*self.exit.lock().unwrap())
        }

        fn is_alive(&self) -> bool {
            self.exit.lock().unwrap().is_none()
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.finish(ExitKind::Failed(None));
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Launch {
        Worker(Stage, String),
        Manual(String),
    }

    /// Launcher that records every launch and hands out [`FakeHandle`]s.
    #[derive(Clone, Default)]
    pub struct FakeLauncher {
        pub launches: Arc<Mutex<Vec<(Launch, FakeHandle)>>>,
        pub fail_manual: bool,
    }

    impl FakeLauncher {
        pub fn launched(&self) -> Vec<Launch> {
            self.launches
                .lock()
                .unwrap()
                .iter()
                .map(|(l, _)| l.clone())
                .collect()
        }

        pub fn workers_for(&self, stage: Stage, feed: &str) -> Vec<FakeHandle> {
            self.launches
                .lock()
                .unwrap()
                .iter()
                .filter(|(l, _)| *l == Launch::Worker(stage, feed.to_string()))
                .map(|(_, h)| h.clone())
                .collect()
        }

        fn record(&self, launch: Launch) -> FakeHandle {
            let mut launches = self.launches.lock().unwrap();
            let handle = FakeHandle::running(1000 + launches.len() as u32);
            launches.push((launch, handle.clone()));
            handle
        }
    }

    impl WorkerLauncher for FakeLauncher {
        fn launch_worker(&self, stage: Stage, feed: &str) -> io::Result<Box<dyn ProcessHandle>> {
            Ok(Box::new(self.record(Launch::Worker(stage, feed.to_string()))))
        }

        fn launch_manual(
            &self,
            feed: &str,
            _command: &CommandSpec,
        ) -> io::Result<Box<dyn ProcessHandle>> {
            if self.fail_manual {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
            }
            Ok(Box::new(self.record(Launch::Manual(feed.to_string()))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_sanitizes_feed() {
        let path = log_path(Path::new("logs"), "download", "AC/DC Live");
        assert_eq!(path, PathBuf::from("logs/download_AC_DC Live.log"));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_kind_from_status() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(ExitKind::from_status(ExitStatus::from_raw(0)), ExitKind::Success);
        assert_eq!(
            ExitKind::from_status(ExitStatus::from_raw(EXIT_TRANSIENT << 8)),
            ExitKind::Transient
        );
        assert_eq!(
            ExitKind::from_status(ExitStatus::from_raw(1 << 8)),
            ExitKind::Failed(Some(1))
        );
        // Killed by SIGKILL
        assert_eq!(ExitKind::from_status(ExitStatus::from_raw(9)), ExitKind::Failed(None));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_handle_reports_exit() {
        let child = Command::new("sh").args(["-c", "exit 75"]).spawn().unwrap();
        let mut handle = ChildHandle::new(child);
        let mut exit = None;
        for _ in 0..200 {
            exit = handle.poll_exit().unwrap();
            if exit.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(exit, Some(ExitKind::Transient));
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_launcher_runs_manual_command() {
        let temp = tempfile::TempDir::new().unwrap();
        let launcher = ProcessLauncher::new(
            PathBuf::from("/nonexistent"),
            None,
            temp.path().join("logs"),
        );
        let spec = CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo {queue}".to_string()],
            transient_exit_codes: vec![],
            timeout_secs: None,
        };
        let mut handle = launcher.launch_manual("PodX", &spec).unwrap();
        let mut exit = None;
        for _ in 0..200 {
            exit = handle.poll_exit().unwrap();
            if exit.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(exit, Some(ExitKind::Success));

        let log = std::fs::read_to_string(temp.path().join("logs").join("manual_PodX.log")).unwrap();
        assert_eq!(log.trim(), "PodX");
    }
}
