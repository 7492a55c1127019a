//! Error model.
//!
//! No exceptions are used internally: every fallible core operation returns
//! `None`/a status. `ErrorKind` enumerates the conditions an allocation or
//! free can hit; an optional callback may observe an error
//! before the documented default behaviour applies. Logging piggybacks on
//! the existing `log` dependency (`os.rs` already calls
//! `log::warn!` on OS primitive failures).

use core::sync::atomic::{AtomicUsize, Ordering};
use log::{error, warn};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// OS could not satisfy a reservation; `alloc` returns null, no state change.
    Oom,
    /// `count * size` would overflow; `alloc` returns null, no state change.
    Overflow,
    /// free/realloc of a pointer that was not returned by this allocator.
    InvalidPointer,
    /// secure-mode free-list decode produced an out-of-page pointer.
    CorruptFreelist,
    /// secure-mode detected a block already present on a free list.
    DoubleFree,
    /// huge-page reservation exceeded its time budget.
    Timeout,
}

pub type ErrorCallback = fn(ErrorKind, usize);

static CALLBACK: AtomicUsize = AtomicUsize::new(0);

/// Register a callback invoked whenever `report` observes an error. Passing
/// `None` clears any previously registered callback. The callback may do
/// anything, including abort; if it returns, the documented default for
/// that `ErrorKind` applies.
pub fn set_error_callback(callback: Option<ErrorCallback>) {
    let value = match callback {
        Some(f) => f as usize,
        None => 0,
    };
    CALLBACK.store(value, Ordering::Relaxed);
}

fn callback() -> Option<ErrorCallback> {
    let value = CALLBACK.load(Ordering::Relaxed);
    if value == 0 {
        None
    } else {
        // SAFETY: only ever stored from a `fn(ErrorKind, usize)` value above.
        Some(unsafe { core::mem::transmute::<usize, ErrorCallback>(value) })
    }
}

/// Report an error: log it (if `show_errors` is enabled) and invoke the
/// user callback if one is registered. Returns whether a registered
/// callback ran, so callers can decide whether the documented default still
/// applies (the callback itself decides by simply returning or aborting).
pub fn report(kind: ErrorKind, arg: usize) -> bool {
    if crate::options::OPTIONS.show_errors.load(Ordering::Relaxed) {
        match kind {
            ErrorKind::Oom => warn!("allocation failed: out of memory (request {})", arg),
            ErrorKind::Overflow => warn!("allocation size overflow (count*size = {})", arg),
            ErrorKind::InvalidPointer => error!("free/realloc of invalid pointer {:#x}", arg),
            ErrorKind::CorruptFreelist => error!("corrupted free list detected near {:#x}", arg),
            ErrorKind::DoubleFree => error!("double free detected at {:#x}", arg),
            ErrorKind::Timeout => warn!("huge page reservation timed out"),
        }
    }
    if let Some(cb) = callback() {
        cb(kind, arg);
        true
    } else {
        false
    }
}
