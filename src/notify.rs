use std::sync::Arc;

use enumflags2::BitFlags;

use crate::{endpoint::Endpoint, name_registry::NameFlag};

/// The kind of ownership transition a notification reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NameChange {
    /// The name came into existence, owned by `new_id`.
    Add,
    /// Ownership moved from `old_id` to `new_id`.
    Change,
    /// The last contender released; the name is gone.
    Remove,
}

/// One staged name-change event, addressed to an endpoint.
#[derive(Clone, Debug)]
pub struct Notification {
    pub ep: Arc<Endpoint>,
    pub kind: NameChange,
    pub old_id: u64,
    pub new_id: u64,
    pub flags: BitFlags<NameFlag>,
    pub name: Arc<str>,
}

/// Ordered staging area for notifications emitted by one registry operation.
///
/// Registry code appends while the entries lock is held; the operation flushes
/// after dropping it. That keeps message delivery (which takes connection and
/// pool locks) out of the registry's critical section.
#[derive(Debug, Default)]
pub struct NotificationQueue(Vec<Notification>);

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stage(
        &mut self,
        ep: &Arc<Endpoint>,
        kind: NameChange,
        old_id: u64,
        new_id: u64,
        flags: BitFlags<NameFlag>,
        name: &Arc<str>,
    ) {
        self.0.push(Notification {
            ep: ep.clone(),
            kind,
            old_id,
            new_id,
            flags,
            name: name.clone(),
        });
    }

    /// Deliver every staged notification, in staging order, through its
    /// endpoint. Must not be called with the registry lock held.
    pub fn flush(self) {
        for notification in self.0 {
            let ep = notification.ep.clone();
            ep.broadcast(&notification);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
