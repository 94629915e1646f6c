//! The command surface callers reach the name registry through.
//!
//! These functions own the precondition checks the registry core assumes:
//! name validity, the per-connection quota, policy, and resolution of the
//! acting connection when a privileged caller works on someone else's
//! behalf. Wire encoding of the argument blocks is not the core's business.

use std::sync::Arc;

use enumflags2::{bitflags, BitFlags};

use crate::{
    connection::Connection,
    name_registry::{
        is_valid_name, AcquireOutcome, NameFlag, NameRegistry, MAX_NAMES_PER_CONNECTION,
    },
    Error, Result,
};

/// Size of the header a listing buffer starts with.
pub const LIST_HEADER_SIZE: u64 = 8;

/// Fixed part of each listing record: size, id, name flags, connection flags.
const RECORD_FIXED_SIZE: usize = 32;

/// What a listing should enumerate.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListFlag {
    /// Unique peer ids on the bus.
    UniqueIds = 1 << 0,
    /// Well-known names.
    Names = 1 << 1,
    /// Include starter connections and starter-backed names.
    Starters = 1 << 2,
    /// Include names whose owner is willing to queue.
    Queued = 1 << 3,
}

/// Argument block for acquiring or releasing a name. A non-zero `id` asks to
/// act on behalf of that connection, which requires privilege.
#[derive(Clone, Debug)]
pub struct CmdName {
    pub name: String,
    pub flags: BitFlags<NameFlag>,
    pub id: u64,
}

impl CmdName {
    pub fn new(name: impl Into<String>, flags: BitFlags<NameFlag>) -> Self {
        Self {
            name: name.into(),
            flags,
            id: 0,
        }
    }
}

/// Acquire `cmd.name` for the acting connection. On success the effective
/// flags, [`NameFlag::InQueue`] included, are written back into `cmd.flags`.
pub fn name_acquire(
    registry: &NameRegistry,
    conn: &Arc<Connection>,
    cmd: &mut CmdName,
) -> Result<AcquireOutcome> {
    if !is_valid_name(&cmd.name) {
        return Err(Error::InvalidName);
    }

    let acting = resolve_acting(conn, cmd.id)?;
    if acting.owned_name_count() >= MAX_NAMES_PER_CONNECTION {
        return Err(Error::QuotaExceeded);
    }

    cmd.flags.remove(NameFlag::InQueue);

    if let Some(policy_db) = acting.ep().policy_db() {
        if !policy_db.check_own_access(&acting, &cmd.name) {
            return Err(Error::NotPermitted);
        }
    }

    let acquired = registry.acquire(&acting, &cmd.name, cmd.flags)?;
    cmd.flags = acquired.flags;
    Ok(acquired.outcome)
}

/// Release the acting connection's stake in `cmd.name`.
pub fn name_release(registry: &NameRegistry, conn: &Arc<Connection>, cmd: &CmdName) -> Result<()> {
    if !is_valid_name(&cmd.name) {
        return Err(Error::InvalidName);
    }

    let acting = resolve_acting(conn, cmd.id)?;
    registry.release(&acting, &cmd.name)
}

/// Enumerate peers and/or names into the caller's pool.
///
/// Returns the `(offset, size)` of the buffer: a `u64` total size, then one
/// 8-byte-aligned record per row — `size, id, flags, conn_flags` as
/// little-endian `u64`s, followed by the NUL-terminated name for name rows.
/// A reader advances by `size` rounded up to 8. The slice is freed again if
/// it cannot be filled.
pub fn name_list(
    registry: &NameRegistry,
    conn: &Arc<Connection>,
    flags: BitFlags<ListFlag>,
) -> Result<(u64, u64)> {
    // Two snapshots, taken in lock order (bus before registry), packed with
    // no lock held.
    let peers = if flags.contains(ListFlag::UniqueIds) {
        conn.ep().bus().connections()
    } else {
        Vec::new()
    };
    let names = if flags.contains(ListFlag::Names) {
        registry.snapshot()
    } else {
        Vec::new()
    };

    let mut buf = vec![0u8; LIST_HEADER_SIZE as usize];
    for peer in peers {
        if !flags.contains(ListFlag::Starters) && peer.is_starter() {
            continue;
        }
        push_record(
            &mut buf,
            peer.id(),
            BitFlags::empty(),
            peer.flags().bits(),
            None,
        );
    }
    for name in names {
        if !flags.contains(ListFlag::Starters) && name.has_starter {
            continue;
        }
        if !flags.contains(ListFlag::Queued) && name.flags.contains(NameFlag::Queue) {
            continue;
        }
        push_record(
            &mut buf,
            name.owner_id,
            name.flags,
            name.owner_flags.bits(),
            Some(&name.name),
        );
    }

    let size = buf.len() as u64;
    buf[..8].copy_from_slice(&size.to_le_bytes());

    let pool = conn.pool();
    let offset = pool.alloc(size)?;
    if let Err(e) = pool.write(offset, &buf) {
        let _ = pool.free(offset);
        return Err(e);
    }
    Ok((offset, size))
}

fn resolve_acting(conn: &Arc<Connection>, id: u64) -> Result<Arc<Connection>> {
    if id == 0 {
        return Ok(conn.clone());
    }
    let bus = conn.ep().bus();
    if !bus.uid_is_privileged(conn.uid()) {
        return Err(Error::NotPermitted);
    }
    bus.connection_by_id(id).ok_or(Error::NotFound)
}

fn push_record(
    buf: &mut Vec<u8>,
    id: u64,
    flags: BitFlags<NameFlag>,
    conn_flags: u64,
    name: Option<&str>,
) {
    let name_len = name.map(|n| n.len() + 1).unwrap_or(0);
    let size = (RECORD_FIXED_SIZE + name_len) as u64;
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&flags.bits().to_le_bytes());
    buf.extend_from_slice(&conn_flags.to_le_bytes());
    if let Some(name) = name {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
}
