use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::common::{PageId, Result, SkiffError, PAGE_SIZE};

use super::DiskManager;

/// A queued disk I/O request. For reads the worker fills the buffer; for
/// writes it drains it. Completion is signalled over the callback channel.
pub struct DiskRequest {
    is_write: bool,
    page_id: PageId,
    /// Must point at PAGE_SIZE valid bytes until completion is signalled
    data: *mut u8,
    done: Sender<bool>,
}

// The worker thread is the only other holder of the pointer, and the
// synchronous entry points below block until it signals completion.
unsafe impl Send for DiskRequest {}

/// DiskScheduler funnels page I/O through a background worker thread. The
/// buffer pool only uses the synchronous entry points, so requests complete
/// before the caller's critical section ends.
pub struct DiskScheduler {
    disk_manager: Arc<DiskManager>,
    requests: Sender<DiskRequest>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (tx, rx) = bounded::<DiskRequest>(128);
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_dm = Arc::clone(&disk_manager);
        let worker_shutdown = Arc::clone(&shutdown);
        let worker = thread::spawn(move || Self::run_worker(worker_dm, rx, worker_shutdown));

        Self {
            disk_manager,
            requests: tx,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Reads a page and blocks until the worker has filled `buf`.
    pub fn schedule_read_sync(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), PAGE_SIZE);
        let (done_tx, done_rx) = bounded(1);
        self.submit(DiskRequest {
            is_write: false,
            page_id,
            data: buf.as_mut_ptr(),
            done: done_tx,
        })?;
        Self::await_completion(&done_rx)
    }

    /// Writes a page and blocks until the worker has persisted it.
    pub fn schedule_write_sync(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), PAGE_SIZE);
        let (done_tx, done_rx) = bounded(1);
        // The worker only reads through the pointer for a write request.
        self.submit(DiskRequest {
            is_write: true,
            page_id,
            data: buf.as_ptr() as *mut u8,
            done: done_tx,
        })?;
        Self::await_completion(&done_rx)
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    fn submit(&self, request: DiskRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|e| SkiffError::DiskScheduler(format!("failed to queue request: {}", e)))
    }

    fn await_completion(done: &Receiver<bool>) -> Result<()> {
        match done.recv() {
            Ok(true) => Ok(()),
            Ok(false) => Err(SkiffError::DiskScheduler("request failed".to_string())),
            Err(e) => Err(SkiffError::DiskScheduler(format!(
                "completion channel closed: {}",
                e
            ))),
        }
    }

    fn run_worker(
        disk_manager: Arc<DiskManager>,
        requests: Receiver<DiskRequest>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                // Drain what is already queued before exiting.
                while let Ok(request) = requests.try_recv() {
                    Self::process(&disk_manager, request);
                }
                break;
            }

            match requests.recv_timeout(Duration::from_millis(100)) {
                Ok(request) => Self::process(&disk_manager, request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process(disk_manager: &DiskManager, request: DiskRequest) {
        let ok = if request.is_write {
            // Safety: the submitting thread keeps the buffer alive until it
            // receives our completion signal.
            let buf = unsafe { std::slice::from_raw_parts(request.data, PAGE_SIZE) };
            disk_manager.write_page(request.page_id, buf).is_ok()
        } else {
            let buf = unsafe { std::slice::from_raw_parts_mut(request.data, PAGE_SIZE) };
            disk_manager.read_page(request.page_id, buf).is_ok()
        };
        let _ = request.done.send(ok);
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sync_read_write() {
        let temp = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let scheduler = DiskScheduler::new(dm);

        let page_id = scheduler.disk_manager().allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 42;
        scheduler.schedule_write_sync(page_id, &data).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        scheduler.schedule_read_sync(page_id, &mut out).unwrap();
        assert_eq!(out[0], 42);
    }

    #[test]
    fn test_many_requests() {
        let temp = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let scheduler = DiskScheduler::new(dm);

        let pages: Vec<_> = (0..8)
            .map(|_| scheduler.disk_manager().allocate_page().unwrap())
            .collect();

        for (i, &page_id) in pages.iter().enumerate() {
            let buf = [i as u8; PAGE_SIZE];
            scheduler.schedule_write_sync(page_id, &buf).unwrap();
        }
        for (i, &page_id) in pages.iter().enumerate() {
            let mut out = [0u8; PAGE_SIZE];
            scheduler.schedule_read_sync(page_id, &mut out).unwrap();
            assert_eq!(out[0], i as u8);
        }
    }
}
