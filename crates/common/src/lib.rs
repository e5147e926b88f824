//! Common utilities for aoa-echo
//!
//! This crate provides shared functionality for the accessory host:
//! the abstract USB backend contract, error handling, logging setup,
//! the blocking hand-off channel used by backend notification pumps,
//! and (behind the `test-utils` feature) a scripted mock backend.

pub mod backend;
pub mod channel;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use backend::{HotplugSink, HotplugSubscription, UsbBackend};
pub use channel::{
    HotplugNotice, NOTICE_CAPACITY, NoticeReceiver, NoticeSender, PumpCommand,
    create_notice_channel,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
