//! Host routines called from generated code.

use std::cell::RefCell;
use std::fmt;

/// Why a generated function handed a call to the regular implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FallbackReason {
    SlotMismatch = 1,
    AttnumOutOfRange = 2,
    VirtualOrMemTuple = 3,
    NotMaterialized = 4,
    HasNulls = 5,
    ExprStateMismatch = 6,
}

impl FallbackReason {
    pub const ALL: [FallbackReason; 6] = [
        FallbackReason::SlotMismatch,
        FallbackReason::AttnumOutOfRange,
        FallbackReason::VirtualOrMemTuple,
        FallbackReason::NotMaterialized,
        FallbackReason::HasNulls,
        FallbackReason::ExprStateMismatch,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.code() == code)
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FallbackReason::SlotMismatch => "slot does not match the specialized slot",
            FallbackReason::AttnumOutOfRange => "requested attribute beyond the specialization",
            FallbackReason::VirtualOrMemTuple => "slot is virtual or holds an in-memory tuple",
            FallbackReason::NotMaterialized => "slot holds no materialized row",
            FallbackReason::HasNulls => "row has a null bitmap",
            FallbackReason::ExprStateMismatch => "expression state does not match",
        };
        f.write_str(s)
    }
}

// Index 0 is unused; the last entry counts unknown reason codes.
const COUNTER_SLOTS: usize = FallbackReason::ALL.len() + 2;

thread_local! {
    static FALLBACK_COUNTS: RefCell<[u64; COUNTER_SLOTS]> =
        const { RefCell::new([0; COUNTER_SLOTS]) };
}

/// Records that generator `generator_id` fell back for `reason`.
pub extern "C" fn report_fallback(generator_id: u32, reason: i32) {
    match FallbackReason::from_code(reason) {
        Some(reason) => tracing::debug!(generator_id, %reason, "generated function fell back"),
        None => tracing::debug!(generator_id, reason, "generated function fell back"),
    }
    FALLBACK_COUNTS.with(|counts| {
        let mut counts = counts.borrow_mut();
        let idx = match FallbackReason::from_code(reason) {
            Some(known) => known.code() as usize,
            None => COUNTER_SLOTS - 1,
        };
        counts[idx] += 1;
    });
}

/// Number of fallbacks for `reason` seen on this thread.
pub fn fallback_count(reason: FallbackReason) -> u64 {
    FALLBACK_COUNTS.with(|counts| counts.borrow()[reason.code() as usize])
}

pub fn total_fallback_count() -> u64 {
    FALLBACK_COUNTS.with(|counts| counts.borrow().iter().sum())
}

pub fn reset_fallback_counts() {
    FALLBACK_COUNTS.with(|counts| *counts.borrow_mut() = [0; COUNTER_SLOTS]);
}

/// # Safety
/// `dst` must be valid for `len` byte writes.
pub unsafe extern "C" fn fill_bytes(dst: *mut u8, byte: i32, len: u64) {
    if len > 0 {
        std::ptr::write_bytes(dst, byte as u8, len as usize);
    }
}
