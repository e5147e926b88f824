//! Android Open Accessory echo host
//!
//! Watches for phones on the USB bus, switches them into accessory mode and
//! echoes every byte read from the accessory's bulk IN pipe back out of its
//! bulk OUT pipe for as long as the device stays attached.
//!
//! # Example
//!
//! ```no_run
//! use host::{AccessoryHost, HostOptions, RusbBackend};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(RusbBackend::new().unwrap());
//! let host = AccessoryHost::new(backend, HostOptions::default()).unwrap();
//! host.start().unwrap();
//! // ...
//! host.stop().unwrap();
//! ```

pub mod config;
pub mod echo;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod host;
pub mod negotiator;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod usb;
pub mod watcher;

pub use config::HostConfig;
pub use echo::{EchoBridge, RelayConfig, RelayExit, RelayNotice, RelayReport};
pub use endpoints::resolve_endpoints;
pub use error::{LifecycleError, RelayError, ResolveError};
pub use events::{DeviceEvent, DeviceEventHandler};
pub use host::{AccessoryHost, HostOptions};
pub use negotiator::AccessoryNegotiator;
pub use reaper::RelayReaper;
pub use registry::{DeviceRecord, DeviceRegistry};
pub use router::EventRouter;
pub use usb::RusbBackend;
pub use watcher::DeviceWatcher;
