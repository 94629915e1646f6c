use std::sync::Arc;

use enumflags2::BitFlags;
use kbus::{
    bus::{Bus, Namespace},
    cmd::{self, CmdName, ListFlag},
    connection::{Connection, ConnectionFlag, Message},
    endpoint::Endpoint,
    name_registry::{AcquireOutcome, NameFlag, MAX_NAMES_PER_CONNECTION},
    notify::NameChange,
    Error,
};
use nix::unistd::{Gid, Uid};
use ntest::timeout;
use rand::Rng;

const POOL_SIZE: u64 = 256 * 1024;

fn setup() -> (Arc<Bus>, Arc<Endpoint>) {
    kbus::tracing_subscriber::init();
    let ns = Namespace::new("kbus", 42);
    let bus = Bus::new(&ns, "0-system", Uid::current());
    let ep = Endpoint::create(&bus, "bus", 0, Uid::current(), Gid::current());
    (bus, ep)
}

fn connect(ep: &Arc<Endpoint>) -> Arc<Connection> {
    Connection::new(ep, BitFlags::empty(), Uid::current(), POOL_SIZE).unwrap()
}

fn connect_starter(ep: &Arc<Endpoint>) -> Arc<Connection> {
    Connection::new(ep, ConnectionFlag::Starter.into(), Uid::current(), POOL_SIZE).unwrap()
}

fn drain(conn: &Connection) -> Vec<Message> {
    let mut msgs = Vec::new();
    while let Some(msg) = conn.recv() {
        msgs.push(msg);
    }
    msgs
}

/// Received name-change notifications as `(kind, old, new, name)` rows.
fn changes(conn: &Connection) -> Vec<(NameChange, u64, u64, String)> {
    drain(conn)
        .into_iter()
        .filter_map(|msg| match msg {
            Message::NameChange {
                kind,
                old_id,
                new_id,
                name,
                ..
            } => Some((kind, old_id, new_id, name.to_string())),
            Message::Data(_) => None,
        })
        .collect()
}

#[test]
fn taken_name_without_queueing_is_refused() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    let acquired = registry.acquire(&c1, "com.x", BitFlags::empty()).unwrap();
    assert_eq!(acquired.outcome, AcquireOutcome::Created);

    // The owner never allowed replacement, so an explicit replacement
    // request without queueing fails outright.
    let res = registry.acquire(&c2, "com.x", NameFlag::ReplaceExisting.into());
    assert_eq!(res, Err(Error::NameTaken));

    assert_eq!(registry.lookup("com.x").unwrap().owner_id, c1.id());
    assert_eq!(registry.waiting_list("com.x").unwrap(), Vec::<u64>::new());
    // Only the creation notification went out, nothing for c2's attempt.
    let seen = changes(&c2);
    assert_eq!(seen, vec![(NameChange::Add, 0, c1.id(), "com.x".into())]);
}

#[test]
fn replacement_refusal_still_queues_a_willing_caller() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    registry.acquire(&c1, "com.x", BitFlags::empty()).unwrap();
    let acquired = registry
        .acquire(&c2, "com.x", NameFlag::ReplaceExisting | NameFlag::Queue)
        .unwrap();

    assert_eq!(acquired.outcome, AcquireOutcome::Queued);
    assert!(acquired.flags.contains(NameFlag::InQueue));
    assert_eq!(registry.lookup("com.x").unwrap().owner_id, c1.id());
    assert_eq!(registry.waiting_list("com.x").unwrap(), vec![c2.id()]);
}

#[test]
fn replacement_of_willing_owner() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    registry
        .acquire(&c1, "com.x", NameFlag::AllowReplacement.into())
        .unwrap();
    let acquired = registry
        .acquire(&c2, "com.x", NameFlag::ReplaceExisting.into())
        .unwrap();
    assert_eq!(acquired.outcome, AcquireOutcome::Replaced);

    assert_eq!(registry.lookup("com.x").unwrap().owner_id, c2.id());
    // c1 did not ask to queue, so it is simply out.
    assert!(c1.queued_names().is_empty());
    assert_eq!(registry.waiting_list("com.x").unwrap(), Vec::<u64>::new());

    let seen = changes(&c1);
    assert_eq!(
        seen,
        vec![
            (NameChange::Add, 0, c1.id(), "com.x".into()),
            (NameChange::Change, c1.id(), c2.id(), "com.x".into()),
        ]
    );
}

#[test]
fn displaced_owner_with_queue_flag_regains_name() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    registry
        .acquire(&c1, "com.x", NameFlag::AllowReplacement | NameFlag::Queue)
        .unwrap();
    registry
        .acquire(&c2, "com.x", NameFlag::ReplaceExisting.into())
        .unwrap();

    assert_eq!(registry.lookup("com.x").unwrap().owner_id, c2.id());
    assert_eq!(registry.waiting_list("com.x").unwrap(), vec![c1.id()]);
    assert_eq!(c1.queued_names(), vec!["com.x".into()]);

    registry.release(&c2, "com.x").unwrap();

    let ownership = registry.lookup("com.x").unwrap();
    assert_eq!(ownership.owner_id, c1.id());
    // The promoted waiter's original flags are back in force.
    assert_eq!(
        ownership.flags,
        NameFlag::AllowReplacement | NameFlag::Queue
    );
    assert_eq!(registry.waiting_list("com.x").unwrap(), Vec::<u64>::new());
    assert!(c1.queued_names().is_empty());

    let seen = changes(&c1);
    assert_eq!(
        seen,
        vec![
            (NameChange::Add, 0, c1.id(), "com.x".into()),
            (NameChange::Change, c1.id(), c2.id(), "com.x".into()),
            (NameChange::Change, c2.id(), c1.id(), "com.x".into()),
        ]
    );
}

#[test]
fn starter_yields_and_entry_dies_with_last_contender() {
    let (bus, ep) = setup();
    let starter = connect_starter(&ep);
    let registry = bus.registry();

    // Whatever a starter asks for, its claim stays replaceable.
    let acquired = registry
        .acquire(&starter, "com.x", NameFlag::Queue.into())
        .unwrap();
    assert_eq!(acquired.outcome, AcquireOutcome::Created);
    assert_eq!(acquired.flags, BitFlags::from(NameFlag::AllowReplacement));
    let seen = changes(&starter);
    assert_eq!(seen, vec![(NameChange::Add, 0, starter.id(), "com.x".into())]);

    // Mail sent to the placeholder before the real service shows up.
    starter.queue_message(b"early-boot".to_vec()).unwrap();

    let c1 = connect(&ep);
    let acquired = registry
        .acquire(&c1, "com.x", NameFlag::ReplaceExisting.into())
        .unwrap();
    assert_eq!(acquired.outcome, AcquireOutcome::Replaced);

    // The queued message migrated to the new owner, then the handover
    // notification arrived.
    let msgs = drain(&c1);
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0], Message::Data(b"early-boot".to_vec()));
    assert!(matches!(
        &msgs[1],
        Message::NameChange {
            kind: NameChange::Change,
            ..
        }
    ));

    // The starter was consumed by the takeover: the final release removes
    // the entry instead of handing it back.
    registry.release(&c1, "com.x").unwrap();
    assert!(registry.lookup("com.x").is_none());

    let seen = changes(&starter);
    assert_eq!(
        seen,
        vec![
            (NameChange::Change, starter.id(), c1.id(), "com.x".into()),
            (NameChange::Remove, c1.id(), 0, "com.x".into()),
        ]
    );
}

#[test]
fn starter_regains_name_on_release() {
    let (bus, ep) = setup();
    let starter = connect_starter(&ep);
    let c1 = connect(&ep);
    let registry = bus.registry();

    registry
        .acquire(&starter, "com.x", BitFlags::empty())
        .unwrap();
    // Queueing keeps the starter association alive across the takeover.
    let acquired = registry
        .acquire(&c1, "com.x", NameFlag::Queue.into())
        .unwrap();
    assert_eq!(acquired.outcome, AcquireOutcome::Queued);

    registry.release(&starter, "com.x").unwrap();
    assert_eq!(registry.lookup("com.x").unwrap().owner_id, c1.id());

    registry.release(&c1, "com.x").unwrap();
    let ownership = registry.lookup("com.x").unwrap();
    assert_eq!(ownership.owner_id, starter.id());
    assert_eq!(registry.waiting_list("com.x").unwrap(), Vec::<u64>::new());
    assert_eq!(starter.owned_names(), vec!["com.x".into()]);
}

#[test]
fn purged_waiter_leaves_silently() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    registry.acquire(&c1, "com.x", BitFlags::empty()).unwrap();
    registry
        .acquire(&c2, "com.x", NameFlag::Queue.into())
        .unwrap();

    c2.disconnect();

    assert_eq!(registry.lookup("com.x").unwrap().owner_id, c1.id());
    assert_eq!(registry.waiting_list("com.x").unwrap(), Vec::<u64>::new());
    // Withdrawing a waiter is not an ownership transition; only the
    // original creation was ever announced.
    let seen = changes(&c1);
    assert_eq!(seen, vec![(NameChange::Add, 0, c1.id(), "com.x".into())]);
}

#[test]
fn purged_owner_hands_name_to_waiter() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    registry.acquire(&c1, "com.x", BitFlags::empty()).unwrap();
    registry
        .acquire(&c2, "com.x", NameFlag::Queue.into())
        .unwrap();

    c1.disconnect();

    assert_eq!(registry.lookup("com.x").unwrap().owner_id, c2.id());
    assert_eq!(registry.waiting_list("com.x").unwrap(), Vec::<u64>::new());
    assert_eq!(c2.owned_names(), vec!["com.x".into()]);
    assert!(c2.queued_names().is_empty());

    let seen = changes(&c2);
    assert_eq!(
        seen,
        vec![
            (NameChange::Add, 0, c1.id(), "com.x".into()),
            (NameChange::Change, c1.id(), c2.id(), "com.x".into()),
        ]
    );
}

#[test]
fn invalid_name_is_rejected_up_front() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);

    let mut cmd = CmdName::new(".x", BitFlags::empty());
    let res = cmd::name_acquire(bus.registry(), &c1, &mut cmd);
    assert_eq!(res, Err(Error::InvalidName));
    assert!(bus.registry().lookup(".x").is_none());
    assert!(changes(&c1).is_empty());
}

#[test]
fn acquire_release_round_trip_restores_state() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let registry = bus.registry();

    registry
        .acquire(&c1, "com.x", NameFlag::AllowReplacement.into())
        .unwrap();
    registry.release(&c1, "com.x").unwrap();

    assert!(registry.lookup("com.x").is_none());
    assert!(c1.owned_names().is_empty());
    assert!(c1.queued_names().is_empty());
    assert_eq!(c1.owned_name_count(), 0);
}

#[test]
fn reacquire_by_owner_updates_flags() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    registry.acquire(&c1, "com.x", BitFlags::empty()).unwrap();
    let acquired = registry
        .acquire(&c1, "com.x", NameFlag::AllowReplacement.into())
        .unwrap();
    assert_eq!(acquired.outcome, AcquireOutcome::AlreadyOwner);

    // The flags update is the intended effect: the name is replaceable now.
    assert_eq!(c1.owned_name_count(), 1);
    let acquired = registry
        .acquire(&c2, "com.x", NameFlag::ReplaceExisting.into())
        .unwrap();
    assert_eq!(acquired.outcome, AcquireOutcome::Replaced);
}

#[test]
fn release_without_a_stake() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    registry.acquire(&c1, "com.x", BitFlags::empty()).unwrap();
    assert_eq!(registry.release(&c2, "com.x"), Err(Error::NotPermitted));
    assert_eq!(registry.release(&c2, "com.gone"), Err(Error::NotFound));
}

#[test]
fn queued_claim_can_be_withdrawn() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    registry.acquire(&c1, "com.x", BitFlags::empty()).unwrap();
    registry
        .acquire(&c2, "com.x", NameFlag::Queue.into())
        .unwrap();

    registry.release(&c2, "com.x").unwrap();
    assert_eq!(registry.waiting_list("com.x").unwrap(), Vec::<u64>::new());
    assert!(c2.queued_names().is_empty());

    // With the queue empty the owner's release destroys the entry.
    registry.release(&c1, "com.x").unwrap();
    assert!(registry.lookup("com.x").is_none());
}

#[test]
#[timeout(30000)]
fn per_connection_name_quota() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);

    for i in 0..MAX_NAMES_PER_CONNECTION {
        let mut cmd = CmdName::new(format!("com.quota.n{i}"), BitFlags::empty());
        cmd::name_acquire(bus.registry(), &c1, &mut cmd).unwrap();
    }

    let mut cmd = CmdName::new("com.quota.overflow", BitFlags::empty());
    assert_eq!(
        cmd::name_acquire(bus.registry(), &c1, &mut cmd),
        Err(Error::QuotaExceeded)
    );
    assert!(bus.registry().lookup("com.quota.overflow").is_none());
}

#[test]
fn queued_flag_reported_through_command_surface() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    let c2 = connect(&ep);

    let mut cmd = CmdName::new("com.x", BitFlags::empty());
    cmd::name_acquire(bus.registry(), &c1, &mut cmd).unwrap();

    // An InQueue bit smuggled into the request is ignored; the one in the
    // reply is real.
    let mut cmd = CmdName::new("com.x", NameFlag::Queue | NameFlag::InQueue);
    let outcome = cmd::name_acquire(bus.registry(), &c2, &mut cmd).unwrap();
    assert_eq!(outcome, AcquireOutcome::Queued);
    assert!(cmd.flags.contains(NameFlag::InQueue));
    assert!(!bus
        .registry()
        .lookup("com.x")
        .unwrap()
        .flags
        .contains(NameFlag::InQueue));
}

#[test]
fn privileged_caller_acts_on_behalf() {
    let (bus, ep) = setup();
    let privileged = connect(&ep);
    let other = connect(&ep);

    let mut cmd = CmdName::new("com.behalf", BitFlags::empty());
    cmd.id = other.id();
    cmd::name_acquire(bus.registry(), &privileged, &mut cmd).unwrap();

    assert_eq!(
        bus.registry().lookup("com.behalf").unwrap().owner_id,
        other.id()
    );
    assert!(privileged.owned_names().is_empty());
    assert_eq!(other.owned_names(), vec!["com.behalf".into()]);

    // And release on its behalf again.
    let mut cmd = CmdName::new("com.behalf", BitFlags::empty());
    cmd.id = other.id();
    cmd::name_release(bus.registry(), &privileged, &cmd).unwrap();
    assert!(bus.registry().lookup("com.behalf").is_none());
}

#[test]
fn unprivileged_caller_may_not_act_on_behalf() {
    let (bus, ep) = setup();
    let target = connect(&ep);
    let rogue =
        Connection::new(&ep, BitFlags::empty(), Uid::from_raw(4242), POOL_SIZE).unwrap();

    let mut cmd = CmdName::new("com.behalf", BitFlags::empty());
    cmd.id = target.id();
    assert_eq!(
        cmd::name_acquire(bus.registry(), &rogue, &mut cmd),
        Err(Error::NotPermitted)
    );

    // A privileged caller naming a connection that is gone gets NotFound.
    let privileged = connect(&ep);
    let mut cmd = CmdName::new("com.behalf", BitFlags::empty());
    cmd.id = 999;
    assert_eq!(
        cmd::name_acquire(bus.registry(), &privileged, &mut cmd),
        Err(Error::NotFound)
    );
}

#[test]
fn failed_message_migration_aborts_replacement() {
    let (bus, ep) = setup();
    let starter = connect_starter(&ep);
    let registry = bus.registry();

    registry
        .acquire(&starter, "com.x", BitFlags::empty())
        .unwrap();
    let _ = drain(&starter);
    starter.queue_message(vec![0; 128]).unwrap();

    // Connected after the acquisition so its tiny pool is still empty.
    let cramped = Connection::new(&ep, BitFlags::empty(), Uid::current(), 64).unwrap();
    let res = registry.acquire(&cramped, "com.x", NameFlag::ReplaceExisting.into());
    assert_eq!(res, Err(Error::OutOfMemory));

    // Nothing moved: the starter still owns the name and its mail.
    assert_eq!(registry.lookup("com.x").unwrap().owner_id, starter.id());
    assert_eq!(starter.queued_message_count(), 1);
    assert!(cramped.owned_names().is_empty());

    // A roomier replacer succeeds and inherits the queued message, which
    // proves the starter association survived the failed attempt.
    let roomy = connect(&ep);
    registry
        .acquire(&roomy, "com.x", NameFlag::ReplaceExisting.into())
        .unwrap();
    let msgs = drain(&roomy);
    assert_eq!(msgs[0], Message::Data(vec![0; 128]));
}

#[test]
fn listing_names_and_peers() {
    let (bus, ep) = setup();
    let starter = connect_starter(&ep);
    let c1 = connect(&ep);
    let c2 = connect(&ep);
    let registry = bus.registry();

    registry
        .acquire(&starter, "com.starter", BitFlags::empty())
        .unwrap();
    registry.acquire(&c1, "com.plain", BitFlags::empty()).unwrap();
    registry.acquire(&c2, "com.q", NameFlag::Queue.into()).unwrap();

    // Default name listing hides starter-backed and queue-willing entries.
    let rows = list(&c1, ListFlag::Names.into());
    assert_eq!(names_of(&rows), vec!["com.plain".to_string()]);

    let rows = list(&c1, ListFlag::Names | ListFlag::Starters | ListFlag::Queued);
    let mut names = names_of(&rows);
    names.sort();
    assert_eq!(names, vec!["com.plain", "com.q", "com.starter"]);
    let starter_row = rows
        .iter()
        .find(|r| r.3.as_deref() == Some("com.starter"))
        .unwrap();
    assert_eq!(starter_row.0, starter.id());
    assert_eq!(starter_row.2, ConnectionFlag::Starter as u64);

    // Unique-id listing: starters are hidden unless asked for.
    let rows = list(&c1, ListFlag::UniqueIds.into());
    let mut ids: Vec<u64> = rows.iter().map(|r| r.0).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![c1.id(), c2.id()]);

    let rows = list(&c1, ListFlag::UniqueIds | ListFlag::Starters);
    assert_eq!(rows.len(), 3);

    // Both kinds in one buffer.
    let rows = list(&c1, ListFlag::UniqueIds | ListFlag::Names);
    assert_eq!(rows.len(), 3); // two peers + com.plain
}

#[test]
fn listing_into_a_full_pool_leaks_nothing() {
    let (bus, ep) = setup();
    let c1 = connect(&ep);
    bus.registry()
        .acquire(&c1, "com.x", BitFlags::empty())
        .unwrap();

    let cramped = Connection::new(&ep, BitFlags::empty(), Uid::current(), 16).unwrap();
    let res = cmd::name_list(bus.registry(), &cramped, ListFlag::Names.into());
    assert_eq!(res, Err(Error::OutOfMemory));
    assert_eq!(cramped.pool().used(), 0);
}

#[test]
#[timeout(60000)]
fn concurrent_acquire_release_keeps_accounts_straight() {
    let (bus, ep) = setup();
    let registry = bus.registry();
    const NAMES: [&str; 4] = ["com.a", "com.b", "com.c", "com.d"];

    let conns: Vec<Arc<Connection>> = (0..4).map(|_| connect(&ep)).collect();

    std::thread::scope(|scope| {
        for conn in &conns {
            scope.spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..100 {
                    let name = NAMES[rng.random_range(0..NAMES.len())];
                    registry
                        .acquire(conn, name, NameFlag::Queue.into())
                        .unwrap();
                    // Owner or waiter, either way the stake is releasable.
                    registry.release(conn, name).unwrap();
                }
            });
        }
    });

    for name in NAMES {
        assert!(registry.lookup(name).is_none(), "{name} leaked");
    }
    for conn in &conns {
        assert!(conn.owned_names().is_empty());
        assert!(conn.queued_names().is_empty());
        assert_eq!(conn.owned_name_count(), 0);
    }
}

/// Run the listing command and parse the pool buffer into
/// `(id, flags, conn_flags, name)` rows.
fn list(conn: &Arc<Connection>, flags: BitFlags<ListFlag>) -> Vec<(u64, u64, u64, Option<String>)> {
    let registry = conn.ep().registry().clone();
    let (offset, size) = cmd::name_list(&registry, conn, flags).unwrap();
    let bytes = conn.pool().read(offset, size).unwrap();
    conn.pool().free(offset).unwrap();

    let total = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
    assert_eq!(total, bytes.len());

    let mut rows = Vec::new();
    let mut pos = 8;
    while pos < total {
        let size = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap()) as usize;
        let id = u64::from_le_bytes(bytes[pos + 8..pos + 16].try_into().unwrap());
        let flags = u64::from_le_bytes(bytes[pos + 16..pos + 24].try_into().unwrap());
        let conn_flags = u64::from_le_bytes(bytes[pos + 24..pos + 32].try_into().unwrap());
        let name = (size > 32).then(|| {
            // Strip the trailing NUL.
            String::from_utf8(bytes[pos + 32..pos + size - 1].to_vec()).unwrap()
        });
        rows.push((id, flags, conn_flags, name));
        pos += (size + 7) & !7;
    }
    rows
}

fn names_of(rows: &[(u64, u64, u64, Option<String>)]) -> Vec<String> {
    rows.iter().filter_map(|r| r.3.clone()).collect()
}
