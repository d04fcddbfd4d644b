//! Small shared utilities.

use std::{
    fmt,
    fmt::{Display, Formatter},
    sync::atomic::{AtomicU64, Ordering},
};

/// A process-unique identity for render objects, buckets and scheduler tags.
///
/// Identities are compared by value and never reused. They allow one object
/// to refer to another "weakly by identity": the referent may be gone, and the
/// reference simply stops matching anything.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimpleIdentity(u64);

impl SimpleIdentity {
    /// The null identity. Never returned by [`SimpleIdentity::unique`].
    pub const EMPTY: SimpleIdentity = SimpleIdentity(0);

    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SimpleIdentity(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for SimpleIdentity {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Display for SimpleIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::SimpleIdentity;

    #[test]
    fn identities_are_unique() {
        let a = SimpleIdentity::unique();
        let b = SimpleIdentity::unique();
        assert_ne!(a, b);
        assert!(!a.is_empty());
        assert!(SimpleIdentity::EMPTY.is_empty());
    }
}
