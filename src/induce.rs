//! # Error Inducer
//!
//! A process-global facility that lets tests inject deterministic failures
//! at named points inside the engine. Inactive by default; activating it
//! costs one relaxed atomic load per instrumented site.
//!
//! ```ignore
//! ErrorInducer::activate(true);
//! ErrorInducer::add(InducePoint::ChangesetFlush, 2, ErrorKind::Io);
//! // the second changeset flush in this process now fails with Io
//! ```
//!
//! The countdown semantics match a "survive N-1 crossings, fail on the
//! Nth" model: `add(point, loops, kind)` arms the point, every `induce`
//! call decrements, and the call that reaches zero returns the error.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InducePoint {
    /// Fail inside `Journal::append_changeset`.
    ChangesetFlush,
    /// Fail the data-file mmap so reads fall back to pread.
    FileMmap,
}

const POINT_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, Default)]
struct Armed {
    loops: u32,
    kind: Option<ErrorKind>,
}

static ACTIVE: AtomicBool = AtomicBool::new(false);
static STATE: Mutex<[Armed; POINT_COUNT]> = Mutex::new([Armed { loops: 0, kind: None }; POINT_COUNT]);

pub struct ErrorInducer;

impl ErrorInducer {
    pub fn activate(on: bool) {
        ACTIVE.store(on, Ordering::Release);
        if !on {
            *STATE.lock() = [Armed::default(); POINT_COUNT];
        }
    }

    pub fn is_active() -> bool {
        ACTIVE.load(Ordering::Acquire)
    }

    /// Arms `point` to fail with `kind` on the `loops`-th crossing.
    pub fn add(point: InducePoint, loops: u32, kind: ErrorKind) {
        let mut state = STATE.lock();
        state[point as usize] = Armed {
            loops,
            kind: Some(kind),
        };
    }

    /// Called by the engine at instrumented sites.
    pub fn induce(point: InducePoint) -> Result<(), ErrorKind> {
        if !Self::is_active() {
            return Ok(());
        }
        let mut state = STATE.lock();
        let armed = &mut state[point as usize];
        if armed.loops > 0 {
            armed.loops -= 1;
            if armed.loops == 0 {
                return Err(armed.kind.take().unwrap_or(ErrorKind::Internal));
            }
        }
        Ok(())
    }
}
