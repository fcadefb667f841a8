//! Cooperative shutdown plumbing.
//!
//! Long-running loops never just run forever: each one selects on a
//! token handed out here and exits cleanly when told to. The supervisor
//! holds the root; its background tasks (reaper, housekeeper) hold
//! children. Tailers deliberately get their own independent tokens —
//! supervisor shutdown must not tear down in-flight file drains.

use tokio_util::sync::CancellationToken;

/// Shutdown broadcaster for one subsystem.
///
/// - Each component calls [`Shutdown::child`] to get its own token.
/// - Calling [`Shutdown::trigger`] cancels every child at once.
#[derive(Debug, Clone)]
pub struct Shutdown {
    root: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
        }
    }

    /// Returns a token tied to this subsystem's lifetime.
    pub fn child(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Cancels all children. Idempotent.
    pub fn trigger(&self) {
        self.root.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
