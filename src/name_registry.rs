use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
};

use enumflags2::{bitflags, BitFlags};
use parking_lot::RwLock;
use tracing::trace;

use crate::{
    connection::{self, Connection},
    notify::{NameChange, NotificationQueue},
    Error, Result,
};

/// Longest well-known name the registry accepts, in bytes.
pub const NAME_MAX_LEN: usize = 255;

/// How many names a single connection may own at once.
pub const MAX_NAMES_PER_CONNECTION: usize = 256;

/// Ownership policy bits carried by acquisition requests and name entries.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NameFlag {
    /// The owner permits a future caller to take the name over.
    AllowReplacement = 1 << 0,
    /// The caller asks to displace the current owner.
    ReplaceExisting = 1 << 1,
    /// The caller is willing to wait in line; on an owner's own flags, it
    /// also parks the owner in the line when it gets displaced.
    Queue = 1 << 2,
    /// Output only: the caller did not become owner but was enqueued. Never
    /// stored on an entry.
    InQueue = 1 << 3,
}

/// How an acquisition ended. All four variants are successes; a refusal
/// surfaces as [`Error::NameTaken`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcquireOutcome {
    /// The name did not exist; the caller now owns a fresh entry.
    Created,
    /// The caller displaced the previous owner.
    Replaced,
    /// The caller already owned the name; its flags were updated.
    AlreadyOwner,
    /// The caller was appended to the waiter queue.
    Queued,
}

/// Result of a successful acquisition: the outcome plus the flags now in
/// force for the caller, with [`NameFlag::InQueue`] set when it was enqueued.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Acquired {
    pub outcome: AcquireOutcome,
    pub flags: BitFlags<NameFlag>,
}

/// Snapshot of who owns a name, as returned by [`NameRegistry::lookup`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NameOwnership {
    pub owner_id: u64,
    pub flags: BitFlags<NameFlag>,
}

/// One row of a registry snapshot, used by the listing command.
#[derive(Clone, Debug)]
pub(crate) struct NameSnapshot {
    pub name: Arc<str>,
    pub owner_id: u64,
    pub owner_flags: BitFlags<connection::ConnectionFlag>,
    pub flags: BitFlags<NameFlag>,
    pub has_starter: bool,
}

/// A weak handle to a connection plus its cached id.
///
/// Entries must not keep connections alive, but notifications still need the
/// old owner's id after the connection is gone.
#[derive(Clone, Debug)]
struct ConnRef {
    id: u64,
    conn: Weak<Connection>,
}

impl ConnRef {
    fn new(conn: &Arc<Connection>) -> Self {
        Self {
            id: conn.id(),
            conn: Arc::downgrade(conn),
        }
    }

    fn get(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }
}

/// A connection parked on an entry, waiting for ownership.
#[derive(Clone, Debug)]
struct Waiter {
    conn: ConnRef,
    flags: BitFlags<NameFlag>,
}

/// The per-name record: current owner, policy flags, FIFO waiter queue and
/// the optional starter that reclaims the name once everyone else is gone.
#[derive(Clone, Debug)]
struct NameEntry {
    name: Arc<str>,
    owner: ConnRef,
    flags: BitFlags<NameFlag>,
    starter: Option<ConnRef>,
    waiters: VecDeque<Waiter>,
}

type Entries = HashMap<Arc<str>, NameEntry>;

/// Arbitration of well-known names on one bus.
///
/// All mutations are serialised by the entries lock; notifications are staged
/// under it and flushed after it is dropped.
#[derive(Clone, Debug, Default)]
pub struct NameRegistry {
    entries: Arc<RwLock<Entries>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<NameOwnership> {
        self.entries.read().get(name).map(|entry| NameOwnership {
            owner_id: entry.owner.id,
            flags: entry.flags,
        })
    }

    /// Acquire `name` for `conn`.
    ///
    /// Preconditions (a valid name, a free quota slot, policy permission) are
    /// the caller's job; [`crate::cmd::name_acquire`] checks them.
    pub fn acquire(
        &self,
        conn: &Arc<Connection>,
        name: &str,
        flags: BitFlags<NameFlag>,
    ) -> Result<Acquired> {
        let mut notifications = NotificationQueue::new();
        let result = {
            let mut entries = self.entries.write();
            Self::acquire_locked(&mut entries, conn, name, flags, &mut notifications)
        };
        notifications.flush();
        result
    }

    fn acquire_locked(
        entries: &mut Entries,
        conn: &Arc<Connection>,
        name: &str,
        mut flags: BitFlags<NameFlag>,
        notifications: &mut NotificationQueue,
    ) -> Result<Acquired> {
        // Output-only bit; it must never make it onto an entry or waiter.
        flags.remove(NameFlag::InQueue);

        if let Some(entry) = entries.get_mut(name) {
            if entry.owner.id == conn.id() {
                entry.flags = flags;
                return Ok(Acquired {
                    outcome: AcquireOutcome::AlreadyOwner,
                    flags,
                });
            }
            return Self::handle_conflict(entry, conn, flags, notifications);
        }

        let name: Arc<str> = Arc::from(name);
        let mut entry = NameEntry {
            name: name.clone(),
            owner: ConnRef::new(conn),
            flags,
            starter: None,
            waiters: VecDeque::new(),
        };

        // A starter's claim is only a launch placeholder, so it is always
        // yieldable no matter what the caller asked for.
        if conn.is_starter() {
            entry.starter = Some(ConnRef::new(conn));
            entry.flags = NameFlag::AllowReplacement.into();
        }

        conn.note_owned(&name);
        notifications.stage(conn.ep(), NameChange::Add, 0, conn.id(), entry.flags, &name);
        trace!("connection {} created name {}", conn.id(), name);

        let flags = entry.flags;
        entries.insert(name, entry);
        Ok(Acquired {
            outcome: AcquireOutcome::Created,
            flags,
        })
    }

    /// Resolve an acquisition against an entry owned by someone else.
    fn handle_conflict(
        entry: &mut NameEntry,
        conn: &Arc<Connection>,
        flags: BitFlags<NameFlag>,
        notifications: &mut NotificationQueue,
    ) -> Result<Acquired> {
        if flags.contains(NameFlag::ReplaceExisting)
            && entry.flags.contains(NameFlag::AllowReplacement)
        {
            if entry.starter.is_some() {
                // Messages already queued at the placeholder belong to the
                // replacer. This can fail, and it runs before any list is
                // touched so a failure leaves ownership exactly as it was.
                if let Some(starter) = entry.starter.as_ref().and_then(ConnRef::get) {
                    connection::move_messages(conn, &starter)?;
                }
                entry.starter = None;
            }

            // An incumbent that asked to queue goes to the back of the line.
            if entry.flags.contains(NameFlag::Queue) {
                if let Some(incumbent) = entry.owner.get() {
                    incumbent.note_queued(&entry.name);
                }
                entry.waiters.push_back(Waiter {
                    conn: entry.owner.clone(),
                    flags: entry.flags,
                });
            }

            let old_id = entry.owner.id;
            if let Some(incumbent) = entry.owner.get() {
                incumbent.forget_owned(&entry.name);
            }
            conn.note_owned(&entry.name);
            entry.owner = ConnRef::new(conn);
            entry.flags = flags;

            notifications.stage(
                conn.ep(),
                NameChange::Change,
                old_id,
                conn.id(),
                flags,
                &entry.name,
            );
            trace!(
                "connection {} took over name {} from {}",
                conn.id(),
                entry.name,
                old_id
            );
            return Ok(Acquired {
                outcome: AcquireOutcome::Replaced,
                flags,
            });
        }

        if flags.contains(NameFlag::Queue) {
            entry.waiters.push_back(Waiter {
                conn: ConnRef::new(conn),
                flags,
            });
            conn.note_queued(&entry.name);
            return Ok(Acquired {
                outcome: AcquireOutcome::Queued,
                flags: flags | NameFlag::InQueue,
            });
        }

        Err(Error::NameTaken)
    }

    /// Give up `conn`'s stake in `name`: ownership if it is the owner, its
    /// waiter slot if it is queued.
    pub fn release(&self, conn: &Arc<Connection>, name: &str) -> Result<()> {
        let mut notifications = NotificationQueue::new();
        let result = {
            let mut entries = self.entries.write();
            Self::release_locked(&mut entries, conn, name, &mut notifications)
        };
        notifications.flush();
        result
    }

    fn release_locked(
        entries: &mut Entries,
        conn: &Connection,
        name: &str,
        notifications: &mut NotificationQueue,
    ) -> Result<()> {
        let Some(entry) = entries.get_mut(name) else {
            return Err(Error::NotFound);
        };

        if entry.owner.id == conn.id() {
            let key = entry.name.clone();
            Self::release_entry(entries, &key, notifications);
            return Ok(());
        }

        // Not the owner; maybe it is somewhere in the line.
        if let Some(pos) = entry.waiters.iter().position(|w| w.conn.id == conn.id()) {
            entry.waiters.remove(pos);
            conn.forget_queued(name);
            return Ok(());
        }

        Err(Error::NotPermitted)
    }

    /// Pass ownership of `name` on after its owner let go: to the first live
    /// waiter, else back to the starter, else drop the entry.
    fn release_entry(entries: &mut Entries, name: &Arc<str>, notifications: &mut NotificationQueue) {
        let Some(mut entry) = entries.remove(name) else {
            return;
        };

        let old = entry.owner.clone();
        if let Some(owner) = old.get() {
            owner.forget_owned(name);
        }

        while let Some(waiter) = entry.waiters.pop_front() {
            // A waiter whose connection died without withdrawing is skipped.
            let Some(next) = waiter.conn.get() else {
                continue;
            };
            next.forget_queued(name);
            next.note_owned(name);
            entry.flags = waiter.flags;
            entry.owner = ConnRef::new(&next);
            let ep = old.get().map(|c| c.ep().clone()).unwrap_or_else(|| next.ep().clone());
            notifications.stage(
                &ep,
                NameChange::Change,
                old.id,
                next.id(),
                entry.flags,
                name,
            );
            trace!("name {} passed from {} to waiter {}", name, old.id, next.id());
            entries.insert(name.clone(), entry);
            return;
        }

        // Nobody in line. A starter that is not the leaving owner gets the
        // name back; otherwise the entry is gone.
        if let Some(starter) = entry.starter.as_ref().and_then(ConnRef::get) {
            if starter.id() != old.id {
                starter.note_owned(name);
                entry.owner = ConnRef::new(&starter);
                let ep = old
                    .get()
                    .map(|c| c.ep().clone())
                    .unwrap_or_else(|| starter.ep().clone());
                notifications.stage(
                    &ep,
                    NameChange::Change,
                    old.id,
                    starter.id(),
                    entry.flags,
                    name,
                );
                trace!("name {} handed back to starter {}", name, starter.id());
                entries.insert(name.clone(), entry);
                return;
            }
        }

        if let Some(owner) = old.get() {
            notifications.stage(
                owner.ep(),
                NameChange::Remove,
                old.id,
                0,
                entry.flags,
                name,
            );
        }
        trace!("name {} released by {} and removed", name, old.id);
    }

    /// Drop every stake a dying or detaching connection holds.
    ///
    /// Queued items are withdrawn silently; owned entries are released one by
    /// one with the usual handover semantics. This path cannot fail: it does
    /// no allocation under the entries lock.
    pub fn remove_connection(&self, conn: &Connection) {
        let (owned, queued) = conn.take_name_indexes();
        let mut notifications = NotificationQueue::new();
        {
            let mut entries = self.entries.write();

            for name in queued {
                if let Some(entry) = entries.get_mut(&name) {
                    entry.waiters.retain(|w| w.conn.id != conn.id());
                }
            }

            for name in owned {
                // The entry may have been taken over between the index detach
                // and this traversal; only release what is still ours.
                let still_owner = entries
                    .get(&name)
                    .is_some_and(|e| e.owner.id == conn.id());
                if still_owner {
                    Self::release_entry(&mut entries, &name, &mut notifications);
                }
            }
        }
        notifications.flush();
    }

    /// Consistent copy of every entry, for the listing command.
    pub(crate) fn snapshot(&self) -> Vec<NameSnapshot> {
        self.entries
            .read()
            .values()
            .map(|entry| NameSnapshot {
                name: entry.name.clone(),
                owner_id: entry.owner.id,
                owner_flags: entry
                    .owner
                    .get()
                    .map(|c| c.flags())
                    .unwrap_or_default(),
                flags: entry.flags,
                has_starter: entry.starter.is_some(),
            })
            .collect()
    }

    /// Connections queued on `name`, head of the line first. `None` when the
    /// name has no entry.
    pub fn waiting_list(&self, name: &str) -> Option<Vec<u64>> {
        self.entries
            .read()
            .get(name)
            .map(|entry| entry.waiters.iter().map(|w| w.conn.id).collect())
    }
}

/// Check a well-known name against the bus naming grammar: dot-separated
/// non-empty elements of `[A-Za-z0-9_-]`, no element starting with a digit,
/// at least one dot, no leading or trailing dot, at most [`NAME_MAX_LEN`]
/// bytes.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > NAME_MAX_LEN {
        return false;
    }

    let mut element_start = true;
    let mut found_dot = false;
    for c in name.bytes() {
        match c {
            b'.' => {
                if element_start {
                    return false;
                }
                found_dot = true;
                element_start = true;
            }
            b'0'..=b'9' => {
                if element_start {
                    return false;
                }
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' | b'-' => element_start = false,
            _ => return false,
        }
    }

    found_dot && !element_start
}
