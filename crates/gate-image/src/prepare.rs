//! Files created in advance by a background task.
//!
//! A [`FilePool`] keeps a bounded number of fresh files ready.  Preparation
//! stops when the cancellation signal is raised; files which were prepared
//! but not taken are closed.

use std::fmt;
use std::sync::Arc;

use gate_types::{ImageError, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::file::File;
use crate::instance::Instance;
use crate::program::Program;
use crate::storage::{InstanceStorage, ProgramStorage, Storage};

type Prepared = Result<File>;

/// Bounded supply of files made by a background task.
pub struct FilePool {
    files: Mutex<mpsc::Receiver<Prepared>>,
    cancel: watch::Receiver<bool>,
}

impl FilePool {
    /// Start preparing files.  Must be called within a Tokio runtime.
    /// Preparation stops when `true` is sent via the cancellation channel or
    /// its sender is dropped.
    pub fn spawn<F>(make: F, bufsize: usize, cancel: watch::Receiver<bool>) -> Result<Self>
    where
        F: Fn() -> Result<File> + Send + 'static,
    {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ImageError::internal(format!("file preparation requires a runtime: {e}")))?;

        let (tx, rx) = mpsc::channel(bufsize.max(1));
        handle.spawn(produce(make, tx, cancel.clone()));

        Ok(Self {
            files: Mutex::new(rx),
            cancel,
        })
    }

    /// Wait for a prepared file.
    pub async fn take(&self) -> Result<File> {
        let mut cancel = self.cancel.clone();
        let mut files = self.files.lock().await;

        if is_cancelled(&cancel) {
            drain(&mut files);
            return Err(ImageError::Cancelled);
        }

        tokio::select! {
            r = files.recv() => r.unwrap_or(Err(ImageError::Cancelled)),
            _ = cancel.wait_for(|&c| c) => {
                drain(&mut files);
                Err(ImageError::Cancelled)
            }
        }
    }

    /// Wait for a prepared file without a runtime context.  Must not be
    /// called from asynchronous code.
    pub fn blocking_take(&self) -> Result<File> {
        let mut files = self.files.blocking_lock();

        if is_cancelled(&self.cancel) {
            drain(&mut files);
            return Err(ImageError::Cancelled);
        }

        files.blocking_recv().unwrap_or(Err(ImageError::Cancelled))
    }
}

impl fmt::Debug for FilePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePool")
            .field("cancelled", &is_cancelled(&self.cancel))
            .finish()
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

/// Close files which will never be taken.
fn drain(files: &mut mpsc::Receiver<Prepared>) {
    files.close();

    let mut count = 0;
    while let Ok(r) = files.try_recv() {
        if r.is_ok() {
            count += 1;
        }
    }
    if count > 0 {
        warn!(count, "closed prepared files");
    }
}

async fn produce<F>(make: F, tx: mpsc::Sender<Prepared>, mut cancel: watch::Receiver<bool>)
where
    F: Fn() -> Result<File>,
{
    loop {
        let r = make();

        tokio::select! {
            sent = tx.send(r) => {
                if sent.is_err() {
                    debug!("file pool dropped");
                    return;
                }
            }
            _ = cancel.wait_for(|&c| c) => {
                debug!("file preparation cancelled");
                return;
            }
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Storage wrappers
// ══════════════════════════════════════════════════════════════════════════════

/// Program storage which creates program files in advance.
#[derive(Debug)]
pub struct PreparedPrograms {
    inner: Arc<dyn ProgramStorage>,
    pool: FilePool,
}

impl PreparedPrograms {
    pub fn new(inner: Arc<dyn ProgramStorage>, bufsize: usize, cancel: watch::Receiver<bool>) -> Result<Self> {
        let storage = inner.clone();
        let pool = FilePool::spawn(move || storage.new_program_file(), bufsize, cancel)?;
        Ok(Self { inner, pool })
    }
}

impl ProgramStorage for PreparedPrograms {
    fn programs(&self) -> Result<Vec<String>> {
        self.inner.programs()
    }

    fn load_program(&self, combined: &Storage, name: &str) -> Result<Option<Program>> {
        self.inner.load_program(combined, name)
    }

    fn new_program_file(&self) -> Result<File> {
        self.pool.blocking_take()
    }

    fn protect_program_file(&self, file: &File) -> Result<()> {
        self.inner.protect_program_file(file)
    }

    fn store_program(&self, prog: &Program, name: &str) -> Result<()> {
        self.inner.store_program(prog, name)
    }
}

/// Instance storage which creates instance files in advance.
#[derive(Debug)]
pub struct PreparedInstances {
    inner: Arc<dyn InstanceStorage>,
    pool: FilePool,
}

impl PreparedInstances {
    pub fn new(inner: Arc<dyn InstanceStorage>, bufsize: usize, cancel: watch::Receiver<bool>) -> Result<Self> {
        let storage = inner.clone();
        let pool = FilePool::spawn(move || storage.new_instance_file(), bufsize, cancel)?;
        Ok(Self { inner, pool })
    }
}

impl InstanceStorage for PreparedInstances {
    fn instances(&self) -> Result<Vec<String>> {
        self.inner.instances()
    }

    fn load_instance(&self, name: &str) -> Result<Option<Instance>> {
        self.inner.load_instance(name)
    }

    fn new_instance_file(&self) -> Result<File> {
        self.pool.blocking_take()
    }

    fn instance_file_write_supported(&self) -> bool {
        self.inner.instance_file_write_supported()
    }

    fn store_instance_supported(&self) -> bool {
        self.inner.store_instance_supported()
    }

    fn store_instance(&self, inst: &mut Instance, name: &str) -> Result<()> {
        self.inner.store_instance(inst, name)
    }
}
