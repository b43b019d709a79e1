//! Change notification.

use std::future::pending;

/// A change notification handle for a path in a remote tree.
///
/// The tree is a snapshot of one commit, so the token never fires. Build a
/// new [`RemoteTree`](crate::RemoteTree) to see later commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeToken;

impl ChangeToken {
    /// Always false.
    pub fn has_changed(&self) -> bool {
        false
    }

    /// Always false: callbacks would never run.
    pub fn active_change_callbacks(&self) -> bool {
        false
    }

    /// Waits for a change, which never comes.
    pub async fn changed(&self) {
        pending::<()>().await
    }
}
