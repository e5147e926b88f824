//! Endpoint resolver
//!
//! Picks the bulk pipe pair the echo relay uses: the first bulk IN pipe and
//! the first bulk OUT pipe of the claimed interface, scanning pipes in
//! ascending index order.

use crate::error::ResolveError;
use common::UsbBackend;
use protocol::{DeviceHandle, EndpointPair};
use tracing::{debug, trace};

/// Resolve the read/write bulk pipes of an opened, claimed device
pub fn resolve_endpoints(
    backend: &dyn UsbBackend,
    handle: DeviceHandle,
) -> Result<EndpointPair, ResolveError> {
    let mut read = None;
    let mut write = None;

    for index in 0..=u8::MAX {
        let Some(pipe) = backend.query_pipe(handle, index) else {
            break;
        };
        trace!("{} pipe {}: {:?}", handle, index, pipe);

        if !pipe.is_bulk() {
            continue;
        }

        if pipe.is_in() {
            read.get_or_insert(pipe.pipe_id);
        } else {
            write.get_or_insert(pipe.pipe_id);
        }

        if let (Some(read), Some(write)) = (read, write) {
            let pair = EndpointPair { read, write };
            debug!("Resolved pipes for {}: {}", handle, pair);
            return Ok(pair);
        }
    }

    Err(ResolveError::NotFound { read, write })
}
