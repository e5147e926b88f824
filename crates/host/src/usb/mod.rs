//! USB subsystem
//!
//! rusb adapter for the backend contract: device table and hotplug dispatch,
//! the libusb event pump thread, and synchronous control/bulk transfers.

pub mod backend;
pub mod device;
pub mod pump;
pub mod transfers;

pub use backend::RusbBackend;
pub use pump::EventPump;
pub use transfers::map_rusb_error;
