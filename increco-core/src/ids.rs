//! Identity tokens shared across the IU and module layers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a module, handed out once at construction and never reused.
///
/// This is deliberately *just* an identity token rather than a pointer back to
/// the module: IUs carry a `creator: ModuleId` (see [`crate::iu::Iu`]) to
/// satisfy the "weak back-reference, identity only, never used to steer
/// execution" invariant without needing a `Weak<dyn Module>` and the
/// `Send + Sync` trait-object plumbing that would come with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ModuleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "module#{}", self.0)
    }
}
