//! Crash-injection points for recovery testing.
//!
//! The write and flush paths pass through four named points —
//! `wal_append`, `wal_fsync`, `manifest_save`, `memtable_flush` — that tests
//! can arm to abort the operation mid-flight and then reopen the store as if
//! the process had died there. An armed point fires once, only on the thread
//! that armed it (tests run in parallel), and disarms itself.
//!
//! In non-test builds the check is an empty inline function and compiles
//! out.

#[cfg(test)]
use std::sync::Mutex;
#[cfg(test)]
use std::thread::{self, ThreadId};

#[cfg(test)]
static ARMED: Mutex<Vec<(ThreadId, String)>> = Mutex::new(Vec::new());

/// Arms one crash point by name, for the calling thread only.
#[cfg(test)]
pub(crate) fn arm(point: &str) {
    let mut armed = ARMED.lock().expect("crash point lock poisoned");
    armed.push((thread::current().id(), point.to_string()));
}

/// Disarms everything the calling thread armed.
#[cfg(test)]
pub(crate) fn disarm() {
    let me = thread::current().id();
    let mut armed = ARMED.lock().expect("crash point lock poisoned");
    armed.retain(|(tid, _)| *tid != me);
}

/// Fires when the calling thread armed `point`: disarms that entry and
/// returns an error that aborts the operation at exactly this point.
#[cfg(test)]
pub(crate) fn check(point: &str) -> Result<(), super::StoreError> {
    let me = thread::current().id();
    let mut armed = ARMED.lock().expect("crash point lock poisoned");
    if let Some(pos) = armed
        .iter()
        .position(|(tid, name)| *tid == me && name == point)
    {
        armed.remove(pos);
        return Err(super::StoreError::Internal(format!(
            "crash injected at {point}"
        )));
    }
    Ok(())
}

#[cfg(not(test))]
#[inline(always)]
pub(crate) fn check(_point: &str) -> Result<(), super::StoreError> {
    Ok(())
}
