//! Scoped read timeout override.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use log::warn;

use crate::error::Result;
use crate::port::Port;

/// Narrows the port timeout for the guard's lifetime.
///
/// The previous timeout is put back when the guard is dropped, which
/// includes early returns through `?`.
pub(crate) struct TimeoutGuard<'a, P: Port> {
    port: &'a mut P,
    previous: Duration,
}

impl<'a, P: Port> TimeoutGuard<'a, P> {
    pub(crate) fn new(port: &'a mut P, timeout: Duration) -> Result<Self> {
        let previous = port.timeout();
        port.set_timeout(timeout)?;
        Ok(Self { port, previous })
    }
}

impl<P: Port> Deref for TimeoutGuard<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.port
    }
}

impl<P: Port> DerefMut for TimeoutGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        self.port
    }
}

impl<P: Port> Drop for TimeoutGuard<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.port.set_timeout(self.previous) {
            warn!("Failed to restore read timeout of {:?}: {e}", self.previous);
        }
    }
}
