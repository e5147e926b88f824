//! Blocking hand-off channels between a USB event pump and the threads it feeds
//!
//! libusb delivers hotplug callbacks on the thread that is pumping events.
//! Doing real work there (opening devices, control transfers) would stall the
//! pump, so callbacks only push a [`HotplugNotice`] into a bounded channel and
//! a dispatch thread drains it.

use async_channel::{Receiver, Sender, TryRecvError, bounded};
use tracing::debug;

/// Default channel capacity
pub const NOTICE_CAPACITY: usize = 256;

/// Raw hotplug notification, carrying the backend's own device type
#[derive(Debug, Clone)]
pub enum HotplugNotice<D> {
    /// Device attached
    Arrived(D),
    /// Device detached
    Left(D),
}

/// Commands to an event pump thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpCommand {
    /// Stop pumping and exit the thread
    Shutdown,
}

/// Sending half, held by the callback side
pub struct NoticeSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for NoticeSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> NoticeSender<T> {
    /// Send, blocking while the channel is full
    pub fn send_blocking(&self, item: T) -> crate::Result<()> {
        self.tx.send_blocking(item).map_err(|e| {
            debug!("Notice channel closed, dropping notice");
            crate::Error::Channel(e.to_string())
        })
    }

    /// Send without blocking; fails if the channel is full or closed
    pub fn try_send(&self, item: T) -> crate::Result<()> {
        self.tx.try_send(item).map_err(|e| {
            debug!(
                "Notice channel {}, dropping notice",
                if e.is_full() { "full" } else { "closed" }
            );
            crate::Error::Channel(e.to_string())
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, held by the dispatch side
pub struct NoticeReceiver<T> {
    rx: Receiver<T>,
}

impl<T> Clone for NoticeReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> NoticeReceiver<T> {
    /// Receive, blocking until an item arrives or every sender is dropped
    pub fn recv_blocking(&self) -> crate::Result<T> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive without blocking
    ///
    /// Returns `Ok(None)` when the channel is empty, `Err` once it is closed
    /// and drained.
    pub fn try_recv(&self) -> crate::Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(e @ TryRecvError::Closed) => Err(crate::Error::Channel(e.to_string())),
        }
    }

    /// Items waiting to be received
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Close the channel from the receiving side
    pub fn close(&self) -> bool {
        self.rx.close()
    }
}

/// Create a bounded hand-off channel
///
/// Returns (sender for the callback side, receiver for the dispatch side)
pub fn create_notice_channel<T>(capacity: usize) -> (NoticeSender<T>, NoticeReceiver<T>) {
    let (tx, rx) = bounded(capacity);
    (NoticeSender { tx }, NoticeReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_handoff_across_threads() {
        let (tx, rx) = create_notice_channel::<HotplugNotice<u8>>(NOTICE_CAPACITY);

        let handle = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Ok(notice) = rx.recv_blocking() {
                seen.push(notice);
            }
            seen
        });

        tx.send_blocking(HotplugNotice::Arrived(1)).unwrap();
        tx.send_blocking(HotplugNotice::Left(1)).unwrap();
        drop(tx);

        let seen = handle.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], HotplugNotice::Arrived(1)));
        assert!(matches!(seen[1], HotplugNotice::Left(1)));
    }

    #[test]
    fn test_try_recv_empty_then_closed() {
        let (tx, rx) = create_notice_channel::<PumpCommand>(1);
        assert!(matches!(rx.try_recv(), Ok(None)));

        tx.try_send(PumpCommand::Shutdown).unwrap();
        assert!(tx.try_send(PumpCommand::Shutdown).is_err());
        assert_eq!(rx.try_recv().unwrap(), Some(PumpCommand::Shutdown));

        drop(tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cloned_receivers_share_one_queue() {
        let (tx, rx) = create_notice_channel::<u8>(4);
        let other = rx.clone();

        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert_eq!(rx.len(), 2);

        assert_eq!(other.try_recv().unwrap(), Some(1));
        assert_eq!(rx.try_recv().unwrap(), Some(2));
        assert!(other.is_empty());
    }
}
