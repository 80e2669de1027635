//! Named fault injection points.
//!
//! A failpoint is armed either for the current thread (`enable`) or for the
//! whole process through the `LOWKEYDB_FAILPOINTS` environment variable
//! (comma separated names). Storage code calls [`maybe_fail`] right before the
//! I/O it guards.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;

/// Fails every data page write.
pub const PAGE_WRITE: &str = "page_write";
/// Fails WAL archive rotation after a checkpoint marker is durable.
pub const WAL_ROTATE: &str = "wal_rotate";
/// Fails WAL buffer flushes.
pub const WAL_FLUSH: &str = "wal_flush";

thread_local! {
    static FAILPOINTS: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Arms `name` for the calling thread only.
pub fn enable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().insert(name.to_string());
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|set| {
        set.borrow_mut().remove(name);
    });
}

/// Disarms every failpoint of the calling thread. The environment variable
/// is not affected.
pub fn clear() {
    FAILPOINTS.with(|set| set.borrow_mut().clear());
}

pub fn is_enabled(name: &str) -> bool {
    if FAILPOINTS.with(|set| set.borrow().contains(name)) {
        return true;
    }

    std::env::var("LOWKEYDB_FAILPOINTS")
        .ok()
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

/// Returns an I/O error naming `name` if it is armed.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}
