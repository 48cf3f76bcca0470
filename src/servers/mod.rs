//! The four protocol server loops. Each owns its worker thread(s), samples
//! the store at a fixed cadence through its mapping registry, and observes
//! the process-wide stop flag within one second on every path.

pub mod iec104;
pub mod modbus;
pub mod opcua;
pub mod snmp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Sleep for `duration`, waking early when the stop flag is raised. Returns
/// true when the caller should shut down.
pub(crate) fn wait_with_stop(stop: &AtomicBool, duration: Duration) -> bool {
    let slice = Duration::from_millis(100);
    let mut remaining = duration;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return true;
        }
        let nap = remaining.min(slice);
        std::thread::sleep(nap);
        remaining -= nap;
    }
    stop.load(Ordering::SeqCst)
}
