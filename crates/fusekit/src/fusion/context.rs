//! Thread-local active fusion for implicit construction.
//!
//! Construction helpers in [`crate::arith`] take the fusion explicitly. Code
//! that prefers an ambient fusion installs one with [`FusionGuard`] and
//! reaches it through [`with_active_fusion`]:
//!
//! ```rust,ignore
//! let fusion = Fusion::new_shared();
//! let _guard = FusionGuard::new(fusion.clone());
//! let tv0 = with_active_fusion(|f| Ok(f.new_tensor(2, DataType::Float)))?;
//! ```
//!
//! Guards nest: dropping the inner guard restores the outer fusion. Each
//! thread has its own stack, so fusions built on different threads never
//! see each other.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{FusionError, FusionResult};

use super::Fusion;

/// Fusion handle that can sit on the active-fusion stack.
pub type SharedFusion = Rc<RefCell<Fusion>>;

thread_local! {
    static FUSION_STACK: RefCell<Vec<SharedFusion>> = RefCell::new(Vec::new());
}

/// RAII guard that restores the previously active fusion when dropped.
///
/// Dropping a guard truncates the stack to the depth it had before the
/// guard was created, so guards still restore the right fusion when they are
/// dropped out of order.
pub struct FusionGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl FusionGuard {
    pub fn new(fusion: SharedFusion) -> Self {
        let depth = FUSION_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let depth = stack.len();
            stack.push(fusion);
            depth
        });
        FusionGuard {
            depth,
            _not_send: PhantomData,
        }
    }
}

impl Drop for FusionGuard {
    fn drop(&mut self) {
        FUSION_STACK.with(|stack| stack.borrow_mut().truncate(self.depth));
    }
}

/// Currently active fusion on this thread, if any.
pub fn active_fusion() -> Option<SharedFusion> {
    FUSION_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Number of guards currently alive on this thread.
pub fn active_depth() -> usize {
    FUSION_STACK.with(|stack| stack.borrow().len())
}

/// Runs `f` against the active fusion.
pub fn with_active_fusion<R>(f: impl FnOnce(&mut Fusion) -> FusionResult<R>) -> FusionResult<R> {
    let fusion = active_fusion().ok_or(FusionError::NoActiveFusion)?;
    let mut fusion = fusion
        .try_borrow_mut()
        .map_err(|_| FusionError::ActiveFusionBorrowed)?;
    f(&mut fusion)
}

/// Installs `fusion` for the duration of `f`.
pub fn with_fusion<R>(fusion: SharedFusion, f: impl FnOnce() -> R) -> R {
    let guard = FusionGuard::new(fusion);
    let result = f();
    drop(guard);
    result
}
