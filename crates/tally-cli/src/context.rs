//! Stores, configuration and locks shared by the commands.
//!
//! Commands that change the stores open a [`Session`] through
//! [`Context::session`]. A session holds the data directory lock from before
//! the snapshots are loaded until it is dropped, so concurrent invocations
//! never flush over each other's writes. Read-only commands use
//! [`Context::snapshot`], which loads the last flushed state without locking.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tally_metrics::{
    AggregatedExporter, AggregationWindow, Clock, MemoryRepository, MemoryStateStore,
    MetricRegistry, MetricStore, Pipeline, RealtimeExporter, RealtimeStore, Recorder, Repository,
    StateStore, SystemClock, TallyConfig,
};
use tracing::{debug, warn};

use crate::error::CliError;

const DATA_LOCK_FILE: &str = "data.lock";
const DATA_LOCK_POLL: Duration = Duration::from_millis(25);

/// Configuration and paths a command needs, without any loaded state.
#[derive(Debug, Clone)]
pub struct Context {
    data_dir: PathBuf,
    config: TallyConfig,
    registry: Arc<MetricRegistry>,
    clock: Arc<dyn Clock>,
}

impl Context {
    /// Loads the configuration and prepares the data directory.
    ///
    /// Without a config file the defaults apply and no metrics are
    /// registered.
    ///
    /// # Errors
    ///
    /// Fails if the config is invalid or the data directory cannot be
    /// created.
    pub fn load(config_path: Option<&Path>, data_dir: &Path) -> Result<Self, CliError> {
        let config = match config_path {
            Some(path) => TallyConfig::from_file(path)?,
            None => TallyConfig::default(),
        };
        Self::open(config, data_dir, Arc::new(SystemClock))
    }

    /// Prepares `data_dir` with an explicit config and clock.
    ///
    /// # Errors
    ///
    /// Fails if the data directory cannot be created or the metric
    /// definitions are invalid.
    pub fn open(
        config: TallyConfig,
        data_dir: &Path,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CliError> {
        fs::create_dir_all(data_dir)?;
        let registry = Arc::new(config.registry()?);
        debug!(data_dir = %data_dir.display(), metrics = registry.len(), "opened context");
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            registry,
            clock,
        })
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &TallyConfig {
        &self.config
    }

    /// The data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The current time in Unix milliseconds.
    #[must_use]
    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Takes the data directory lock, then loads the stores.
    ///
    /// # Errors
    ///
    /// Returns `DataLocked` if another command keeps the directory locked
    /// past `store.data_lock_wait_ms`, or a snapshot error.
    pub fn session(&self) -> Result<Session<'_>, CliError> {
        let lock = DataLock::acquire(&self.data_dir, self.config.store.data_lock_wait())?;
        self.load_stores(Some(lock))
    }

    /// Loads the last flushed stores without locking. Nothing loaded this
    /// way may be flushed.
    ///
    /// # Errors
    ///
    /// Fails if a snapshot cannot be read.
    pub fn snapshot(&self) -> Result<Session<'_>, CliError> {
        self.load_stores(None)
    }

    fn load_stores(&self, lock: Option<DataLock>) -> Result<Session<'_>, CliError> {
        let timeout = self.config.store.lock_timeout();
        Ok(Session {
            context: self,
            store: MetricStore::open(&self.data_dir)?.with_lock_timeout(timeout),
            repository: MemoryRepository::open(&self.data_dir)?.with_lock_timeout(timeout),
            state: MemoryStateStore::open(&self.data_dir)?.with_lock_timeout(timeout),
            lock,
        })
    }

    /// Takes the run lock of `window`.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another run holds it.
    pub fn lock(&self, window: AggregationWindow) -> Result<WindowLock, CliError> {
        WindowLock::acquire(&self.data_dir, window)
    }
}

/// Stores loaded for one command.
#[derive(Debug)]
pub struct Session<'a> {
    context: &'a Context,
    store: MetricStore,
    repository: MemoryRepository,
    state: MemoryStateStore,
    lock: Option<DataLock>,
}

impl Session<'_> {
    /// Builds the pipeline over the loaded stores.
    ///
    /// # Errors
    ///
    /// Fails if the config's metric definitions are invalid.
    pub fn pipeline(&self) -> Result<Pipeline, CliError> {
        Ok(Pipeline::builder(
            Arc::new(self.store.clone()),
            Arc::new(self.repository.clone()),
            Arc::new(self.state.clone()),
        )
        .config(&self.context.config)?
        .clock(Arc::clone(&self.context.clock))
        .build())
    }

    /// Builds a recorder writing into the real-time store.
    #[must_use]
    pub fn recorder(&self) -> Recorder {
        Recorder::new(
            Arc::new(self.store.clone()),
            Arc::clone(&self.context.registry),
            Arc::clone(&self.context.clock),
        )
        .with_prefix(self.context.config.prefix())
    }

    /// Exporter over raw real-time samples.
    #[must_use]
    pub fn realtime_exporter(&self) -> RealtimeExporter {
        RealtimeExporter::new(
            Arc::new(self.store.clone()),
            Arc::clone(&self.context.registry),
            Arc::clone(&self.context.clock),
        )
        .with_prefix(self.context.config.prefix())
    }

    /// Exporter over finalized aggregates.
    #[must_use]
    pub fn aggregated_exporter(&self) -> AggregatedExporter {
        AggregatedExporter::new(
            Arc::new(self.repository.clone()),
            Arc::clone(&self.context.registry),
        )
    }

    fn ensure_locked(&self) -> Result<(), CliError> {
        match self.lock {
            Some(_) => Ok(()),
            None => Err(CliError::ReadOnly),
        }
    }

    /// Writes the real-time snapshot.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` for a snapshot session, or a persistence error.
    pub fn flush_realtime(&self) -> Result<(), CliError> {
        self.ensure_locked()?;
        self.store.flush()?;
        Ok(())
    }

    /// Writes the repository snapshot.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` for a snapshot session, or a persistence error.
    pub fn flush_repository(&self) -> Result<(), CliError> {
        self.ensure_locked()?;
        self.repository.flush()?;
        Ok(())
    }

    /// Writes the state snapshot.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` for a snapshot session, or a persistence error.
    pub fn flush_state(&self) -> Result<(), CliError> {
        self.ensure_locked()?;
        self.state.flush()?;
        Ok(())
    }

    /// Writes every snapshot.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` for a snapshot session, or a persistence error.
    pub fn flush(&self) -> Result<(), CliError> {
        self.flush_realtime()?;
        self.flush_repository()?;
        self.flush_state()
    }
}

/// Exclusive lock over the snapshots of a data directory, removed on drop.
#[derive(Debug)]
pub struct DataLock {
    path: PathBuf,
}

impl DataLock {
    /// Creates `<dir>/data.lock`, polling until `wait` elapses while another
    /// process holds it.
    ///
    /// # Errors
    ///
    /// Returns `DataLocked` if the lock is still held after `wait`, or the IO
    /// error otherwise.
    pub fn acquire(dir: &Path, wait: Duration) -> Result<Self, CliError> {
        let path = dir.join(DATA_LOCK_FILE);
        let started = Instant::now();
        loop {
            match create_lock_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "acquired data lock");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if started.elapsed() >= wait {
                        return Err(CliError::DataLocked { path });
                    }
                    thread::sleep(DATA_LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataLock {
    fn drop(&mut self) {
        release(&self.path, "data");
    }
}

/// Advisory per-window lock file, removed on drop.
#[derive(Debug)]
pub struct WindowLock {
    path: PathBuf,
}

impl WindowLock {
    /// Creates `<dir>/<window>.lock`, failing if it already exists.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if the file exists, or the IO error otherwise.
    pub fn acquire(dir: &Path, window: AggregationWindow) -> Result<Self, CliError> {
        let path = dir.join(format!("{window}.lock"));
        match create_lock_file(&path) {
            Ok(()) => {
                debug!(%window, path = %path.display(), "acquired window lock");
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(CliError::Locked { window, path })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WindowLock {
    fn drop(&mut self) {
        release(&self.path, "window");
    }
}

fn create_lock_file(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())
}

fn release(path: &Path, kind: &str) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), kind, error = %e, "failed to remove lock");
    }
}
