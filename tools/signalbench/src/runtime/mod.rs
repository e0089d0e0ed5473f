use crate::errors::SignalBenchError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), SignalBenchError>;

    fn sleep(&self, duration: Duration) -> Result<(), SignalBenchError> {
        self.sleep_until(self.now() + duration)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, SignalBenchError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SignalBenchError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), SignalBenchError>;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), SignalBenchError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), SignalBenchError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, SignalBenchError> {
        std::fs::read_to_string(path).map_err(|e| SignalBenchError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SignalBenchError> {
        std::fs::write(path, contents).map_err(|e| SignalBenchError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SignalBenchError> {
        std::fs::create_dir_all(path).map_err(|e| SignalBenchError::Io(e.to_string()))
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), SignalBenchError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| SignalBenchError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
    pending_jump: Arc<Mutex<Option<Duration>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
            pending_jump: Arc::new(Mutex::new(None)),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    /// Steps the clock forward by `by` right after the next sleep returns,
    /// like a stalled process or a wall-clock adjustment.
    pub fn jump_after_next_sleep(&self, by: Duration) {
        *self.pending_jump.lock().expect("jump lock") = Some(by);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), SignalBenchError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let mut now = self.now.lock().expect("clock lock");
        if deadline > *now {
            *now = deadline;
        }
        if let Some(jump) = self.pending_jump.lock().expect("jump lock").take() {
            *now += jump;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<SignalBenchError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: SignalBenchError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.dirs.lock().expect("dirs lock").clone()
    }

    fn maybe_fail(&self) -> Result<(), SignalBenchError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, SignalBenchError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| SignalBenchError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), SignalBenchError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), SignalBenchError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), SignalBenchError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, FakeClock, FakeFileSystem, FileSystem};
    use crate::errors::SignalBenchError;
    use std::path::Path;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn fake_clock_jumps_to_deadlines_and_never_moves_backwards() {
        let clock = FakeClock::default();
        clock
            .sleep_until(UNIX_EPOCH + Duration::from_millis(300))
            .expect("sleep");
        clock
            .sleep_until(UNIX_EPOCH + Duration::from_millis(100))
            .expect("late deadline");
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_millis(300));
        assert_eq!(clock.sleeps().len(), 2);

        clock.sleep(Duration::from_secs(1)).expect("relative sleep");
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_millis(1300));
    }

    #[test]
    fn fake_file_system_fails_once_then_recovers() {
        let fs = FakeFileSystem::with_file("/trace.json", "{}");
        fs.set_fail_next(SignalBenchError::Io("disk gone".to_string()));
        assert!(fs.read_to_string(Path::new("/trace.json")).is_err());
        assert_eq!(
            fs.read_to_string(Path::new("/trace.json")).expect("read"),
            "{}"
        );
    }
}
