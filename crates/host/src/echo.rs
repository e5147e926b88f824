//! Echo bridge
//!
//! One dedicated thread per accessory-mode device reads from the bulk IN pipe
//! and writes the same bytes straight back out of the bulk OUT pipe. Reads use
//! a bounded timeout so the thread notices cancellation within one timeout.
//!
//! Each worker gets its own [`CancellationToken`]. Stopping one device never
//! touches another device's token; stopping everything cancels every issued
//! token first and then joins the threads.
//!
//! A worker that dies on a fatal error posts a [`RelayNotice`] on the
//! bridge's notice channel. Workers never touch a registry; whoever drains
//! [`EchoBridge::notices`] runs the Disconnected path for the handle.

use crate::error::RelayError;
use common::{NOTICE_CAPACITY, NoticeReceiver, NoticeSender, UsbBackend, create_notice_channel};
use protocol::{DeviceHandle, DeviceIdentity, EndpointPair, UsbError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Default bulk I/O timeout (3 seconds)
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default relay buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Relay tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Timeout applied to every bulk read and write
    pub io_timeout: Duration,
    /// Largest single read
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            io_timeout: DEFAULT_IO_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Why a worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayExit {
    /// Cancellation was requested
    Cancelled,
    /// Bulk read failed with something other than a timeout
    ReadFailed(UsbError),
    /// Bulk write failed with something other than a timeout
    WriteFailed(UsbError),
}

impl RelayExit {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayExit::Cancelled)
    }
}

/// Posted on the bridge's notice channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotice {
    /// The worker for `handle` stopped on a fatal error
    Failed { handle: DeviceHandle, exit: RelayExit },
    /// Ask the consumer to exit
    Shutdown,
}

/// Summary returned when a worker is joined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub exit: RelayExit,
    /// Bytes written back to the device
    pub bytes_relayed: u64,
    /// Successful reads (including zero-length ones)
    pub reads: u64,
}

/// Run the echo loop until cancelled or a fatal transfer error
///
/// The token is checked at the top of every iteration and between write
/// retries, so cancellation latency is bounded by one I/O timeout.
pub fn relay_loop(
    backend: &dyn UsbBackend,
    handle: DeviceHandle,
    endpoints: EndpointPair,
    config: RelayConfig,
    token: &CancellationToken,
) -> RelayReport {
    let mut buffer = vec![0u8; config.buffer_size.max(1)];
    let mut report = RelayReport {
        exit: RelayExit::Cancelled,
        bytes_relayed: 0,
        reads: 0,
    };

    while !token.is_cancelled() {
        let len = match backend.read_pipe(handle, endpoints.read, &mut buffer, config.io_timeout) {
            Ok(len) => len,
            Err(UsbError::Timeout) => {
                trace!("Read timeout on {}, polling again", handle);
                continue;
            }
            Err(e) => {
                report.exit = RelayExit::ReadFailed(e);
                return report;
            }
        };
        report.reads += 1;

        match write_all(backend, handle, endpoints.write, &buffer[..len], config, token) {
            Ok(written) => report.bytes_relayed += written as u64,
            Err(e) => {
                report.exit = RelayExit::WriteFailed(e);
                return report;
            }
        }
    }

    report
}

/// Write `data` completely, retrying after timeouts until cancelled
///
/// An empty `data` still issues one (zero-length) write.
fn write_all(
    backend: &dyn UsbBackend,
    handle: DeviceHandle,
    pipe_id: u8,
    data: &[u8],
    config: RelayConfig,
    token: &CancellationToken,
) -> Result<usize, UsbError> {
    let mut offset = 0;

    loop {
        match backend.write_pipe(handle, pipe_id, &data[offset..], config.io_timeout) {
            Ok(0) if offset < data.len() => {
                warn!("Zero-length progress writing to {}", handle);
                return Err(UsbError::Io);
            }
            Ok(written) => offset += written,
            Err(UsbError::Timeout) => {
                debug!(
                    "Write timeout on {} with {} bytes pending",
                    handle,
                    data.len() - offset
                );
                if token.is_cancelled() {
                    return Ok(offset);
                }
            }
            Err(e) => return Err(e),
        }

        if offset >= data.len() {
            return Ok(offset);
        }
    }
}

struct RelayWorker {
    identity: DeviceIdentity,
    token: CancellationToken,
    thread: JoinHandle<RelayReport>,
}

impl RelayWorker {
    fn join(self, handle: DeviceHandle) -> Option<RelayReport> {
        match self.thread.join() {
            Ok(report) => {
                debug!(
                    "Joined echo worker for {} ({}): {:?}",
                    self.identity, handle, report.exit
                );
                Some(report)
            }
            Err(e) => {
                error!(
                    "Echo worker for {} ({}) panicked: {:?}",
                    self.identity, handle, e
                );
                None
            }
        }
    }
}

/// Owner of every echo worker
pub struct EchoBridge {
    backend: Arc<dyn UsbBackend>,
    config: RelayConfig,
    workers: Mutex<HashMap<DeviceHandle, RelayWorker>>,
    notice_tx: NoticeSender<RelayNotice>,
    notice_rx: NoticeReceiver<RelayNotice>,
}

impl EchoBridge {
    pub fn new(backend: Arc<dyn UsbBackend>, config: RelayConfig) -> Self {
        let (notice_tx, notice_rx) = create_notice_channel(NOTICE_CAPACITY);
        Self {
            backend,
            config,
            workers: Mutex::new(HashMap::new()),
            notice_tx,
            notice_rx,
        }
    }

    /// Receiving side of the notice channel
    pub fn notices(&self) -> NoticeReceiver<RelayNotice> {
        self.notice_rx.clone()
    }

    /// Post a notice, blocking while the channel is full
    pub fn notify(&self, notice: RelayNotice) -> common::Result<()> {
        self.notice_tx.send_blocking(notice)
    }

    pub fn config(&self) -> RelayConfig {
        self.config
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<DeviceHandle, RelayWorker>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the echo worker for `handle`
    ///
    /// Returns the worker's cancellation token. Fails if a worker for the
    /// handle is still running; a worker that already died is reaped first.
    pub fn start(
        &self,
        handle: DeviceHandle,
        identity: DeviceIdentity,
        endpoints: EndpointPair,
    ) -> Result<CancellationToken, RelayError> {
        let mut workers = self.workers();

        if let Some(existing) = workers.get(&handle) {
            if !existing.thread.is_finished() {
                error!(
                    "Refusing to start a second echo worker for {} ({})",
                    identity, handle
                );
                return Err(RelayError::AlreadyRelaying(handle));
            }
            if let Some(stale) = workers.remove(&handle) {
                stale.join(handle);
            }
        }

        info!(
            "Attempting to start echo thread for {} ({}, {})",
            identity, handle, endpoints
        );

        let token = CancellationToken::new();
        let thread = {
            let backend = self.backend.clone();
            let config = self.config;
            let token = token.clone();
            let identity = identity.clone();
            let notices = self.notice_tx.clone();

            std::thread::Builder::new()
                .name(format!("echo-{}", handle.0))
                .spawn(move || {
                    info!("Started echo thread for {} ({})", identity, handle);
                    let report =
                        relay_loop(backend.as_ref(), handle, endpoints, config, &token);

                    match &report.exit {
                        RelayExit::Cancelled => {}
                        RelayExit::ReadFailed(e) => {
                            error!("Error reading from {} ({}): {}", identity, handle, e)
                        }
                        RelayExit::WriteFailed(e) => {
                            error!("Error writing to {} ({}): {}", identity, handle, e)
                        }
                    }
                    info!(
                        "Stopped echo thread for {} ({}): {} bytes in {} reads",
                        identity, handle, report.bytes_relayed, report.reads
                    );

                    // Never block here: stop() may be joining this thread
                    if report.exit.is_fatal() {
                        let notice = RelayNotice::Failed {
                            handle,
                            exit: report.exit.clone(),
                        };
                        if notices.try_send(notice).is_err() {
                            warn!("Could not post relay failure of {}", handle);
                        }
                    }
                    report
                })?
        };

        workers.insert(
            handle,
            RelayWorker {
                identity,
                token: token.clone(),
                thread,
            },
        );
        Ok(token)
    }

    /// Cancel the worker for `handle` and wait for it to exit
    ///
    /// When this returns, no more I/O is issued on the handle by the bridge.
    /// Returns `None` if no worker was registered for the handle.
    pub fn stop(&self, handle: DeviceHandle) -> Option<RelayReport> {
        let worker = self.workers().remove(&handle);

        match worker {
            Some(worker) => {
                debug!("Stopping echo worker for {}", handle);
                worker.token.cancel();
                worker.join(handle)
            }
            None => {
                debug!("No echo worker registered for {}", handle);
                None
            }
        }
    }

    /// Cancel every worker, then join them all
    ///
    /// Returns the number of workers stopped.
    pub fn stop_all(&self) -> usize {
        let workers: Vec<(DeviceHandle, RelayWorker)> = self.workers().drain().collect();

        for (_, worker) in &workers {
            worker.token.cancel();
        }

        let count = workers.len();
        for (handle, worker) in workers {
            worker.join(handle);
        }
        count
    }

    /// True while a worker for `handle` is running
    pub fn is_relaying(&self, handle: DeviceHandle) -> bool {
        self.workers()
            .get(&handle)
            .is_some_and(|w| !w.thread.is_finished())
    }

    /// Number of workers still running
    pub fn active_workers(&self) -> usize {
        self.workers()
            .values()
            .filter(|w| !w.thread.is_finished())
            .count()
    }
}

impl Drop for EchoBridge {
    fn drop(&mut self) {
        let stopped = self.stop_all();
        if stopped > 0 {
            debug!("Echo bridge dropped with {} workers still registered", stopped);
        }
    }
}
