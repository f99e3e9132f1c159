//! Disk I/O for container files
//!
//! [`FileHandle`] opens the OS file lazily on first use and hands out short
//! [`FileLease`]s for positioned reads and writes. When an idle timeout is
//! configured, a single background reaper closes the OS handle once nothing
//! has touched it for that long. Long-lived views take a [`HandlePin`], which
//! keeps the handle from being reaped while they are alive.

use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lower bound on the reaper's polling period
const MIN_REAP_PERIOD: Duration = Duration::from_millis(5);

struct HandleState {
    file: Option<File>,
    last_used: Instant,
    /// Number of times the OS file has been opened
    opens: u64,
}

struct Shared {
    path: PathBuf,
    state: Mutex<HandleState>,
    pins: AtomicUsize,
    idle_timeout: Option<Duration>,
}

impl Shared {
    fn touch(&self) {
        self.state.lock().last_used = Instant::now();
    }

    fn close_if_idle(&self) -> bool {
        let Some(timeout) = self.idle_timeout else {
            return false;
        };

        let mut state = self.state.lock();
        if state.file.is_none()
            || self.pins.load(Ordering::Acquire) > 0
            || state.last_used.elapsed() < timeout
        {
            return false;
        }

        if let Some(file) = state.file.take() {
            if let Err(e) = file.sync_all() {
                warn!("sync before idle close of {:?} failed: {}", self.path, e);
            }
        }
        debug!("Closed idle handle for {:?}", self.path);
        true
    }
}

/// Lazily opened, idle-expiring handle to a container file
pub struct FileHandle {
    shared: Arc<Shared>,
    shutdown: Option<Sender<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl FileHandle {
    /// Create a handle without touching the filesystem
    pub fn new<P: AsRef<Path>>(path: P, idle_timeout: Option<Duration>) -> Self {
        let shared = Arc::new(Shared {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(HandleState {
                file: None,
                last_used: Instant::now(),
                opens: 0,
            }),
            pins: AtomicUsize::new(0),
            idle_timeout,
        });

        let mut handle = FileHandle {
            shared,
            shutdown: None,
            reaper: None,
        };
        if let Some(timeout) = idle_timeout {
            handle.spawn_reaper(timeout);
        }
        handle
    }

    fn spawn_reaper(&mut self, timeout: Duration) {
        let (tx, rx) = channel::bounded::<()>(0);
        let ticker = channel::tick((timeout / 4).max(MIN_REAP_PERIOD));
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);

        let spawned = std::thread::Builder::new()
            .name("pakstore-idle-reaper".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(rx) -> _ => break,
                    recv(ticker) -> _ => {
                        let Some(shared) = weak.upgrade() else { break };
                        shared.close_if_idle();
                    }
                }
            });

        match spawned {
            Ok(join) => {
                self.shutdown = Some(tx);
                self.reaper = Some(join);
            }
            Err(e) => warn!("idle reaper unavailable, handle stays open: {}", e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Exclusive access to the OS file, opening it if needed
    pub fn lease(&self) -> io::Result<FileLease<'_>> {
        let mut state = self.shared.state.lock();
        if state.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.shared.path)?;
            state.file = Some(file);
            state.opens += 1;
            debug!("Opened {:?}", self.shared.path);
        }
        state.last_used = Instant::now();
        Ok(FileLease { state })
    }

    /// Keep the OS handle from being reaped until the pin is dropped
    pub fn pin(&self) -> HandlePin {
        self.shared.pins.fetch_add(1, Ordering::AcqRel);
        HandlePin {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().file.is_some()
    }

    pub fn open_count(&self) -> u64 {
        self.shared.state.lock().opens
    }

    /// Close the OS handle if it has been idle past the timeout
    pub fn close_if_idle(&self) -> bool {
        self.shared.close_if_idle()
    }

    /// Sync and close the OS handle now; the next lease reopens it
    pub fn release(&self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(file) = state.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        // Disconnecting the channel stops the reaper
        self.shutdown.take();
        if let Some(join) = self.reaper.take() {
            let _ = join.join();
        }
    }
}

/// Keeps a [`FileHandle`] from being closed for idleness
pub struct HandlePin {
    shared: Arc<Shared>,
}

impl Drop for HandlePin {
    fn drop(&mut self) {
        self.shared.pins.fetch_sub(1, Ordering::AcqRel);
        self.shared.touch();
    }
}

/// Scoped access to an open container file
pub struct FileLease<'a> {
    state: MutexGuard<'a, HandleState>,
}

impl FileLease<'_> {
    fn file(&mut self) -> io::Result<&mut File> {
        self.state
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "file handle closed"))
    }

    pub fn len(&mut self) -> io::Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    pub fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(buf)
    }

    pub fn write_all_at(&mut self, pos: u64, data: &[u8]) -> io::Result<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(data)
    }

    pub fn read_i64_at(&mut self, pos: u64) -> io::Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact_at(pos, &mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    pub fn write_i64_at(&mut self, pos: u64, value: i64) -> io::Result<()> {
        self.write_all_at(pos, &value.to_le_bytes())
    }

    /// Buffered sequential reader starting at `pos`
    pub fn reader_at(&mut self, pos: u64) -> io::Result<BufReader<&mut File>> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(BufReader::new(file))
    }

    /// Buffered sequential writer starting at `pos`; flush before dropping
    pub fn writer_at(&mut self, pos: u64) -> io::Result<BufWriter<&mut File>> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(BufWriter::new(file))
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file()?.sync_all()
    }
}

impl Drop for FileLease<'_> {
    fn drop(&mut self) {
        self.state.last_used = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use tempfile::TempDir;

    #[test]
    fn test_lazy_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lazy.pak");
        let handle = FileHandle::new(&path, None);

        assert!(!handle.is_open());
        assert!(!path.exists());

        handle.lease().unwrap().write_all_at(0, b"hello").unwrap();
        assert!(handle.is_open());
        assert_eq!(handle.open_count(), 1);
    }

    #[test]
    fn test_positioned_round_trip() {
        let dir = TempDir::new().unwrap();
        let handle = FileHandle::new(dir.path().join("rw.pak"), None);

        let mut lease = handle.lease().unwrap();
        lease.write_i64_at(16, -48).unwrap();
        lease.write_all_at(0, b"abcd").unwrap();
        assert_eq!(lease.read_i64_at(16).unwrap(), -48);
        assert_eq!(lease.len().unwrap(), 24);

        let mut buf = [0u8; 4];
        lease.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_idle_handle_is_closed_and_reopened() {
        let dir = TempDir::new().unwrap();
        let handle = FileHandle::new(dir.path().join("idle.pak"), Some(Duration::from_millis(40)));

        handle.lease().unwrap().write_all_at(0, b"x").unwrap();
        assert!(handle.is_open());

        sleep(Duration::from_millis(300));
        assert!(!handle.is_open());

        let mut buf = [0u8; 1];
        handle.lease().unwrap().read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"x");
        assert_eq!(handle.open_count(), 2);
    }

    #[test]
    fn test_pin_blocks_idle_close() {
        let dir = TempDir::new().unwrap();
        let handle = FileHandle::new(dir.path().join("pin.pak"), Some(Duration::from_millis(20)));
        handle.lease().unwrap().write_all_at(0, b"x").unwrap();

        let pin = handle.pin();
        sleep(Duration::from_millis(150));
        assert!(handle.is_open());
        assert!(!handle.close_if_idle());

        drop(pin);
        sleep(Duration::from_millis(300));
        assert!(!handle.is_open());
    }

    #[test]
    fn test_no_timeout_never_closes() {
        let dir = TempDir::new().unwrap();
        let handle = FileHandle::new(dir.path().join("keep.pak"), None);
        handle.lease().unwrap().write_all_at(0, b"x").unwrap();

        sleep(Duration::from_millis(50));
        assert!(!handle.close_if_idle());
        assert!(handle.is_open());
    }
}
