use std::{
    collections::VecDeque,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use enumflags2::{bitflags, BitFlags};
use event_listener::{Event, Listener};
use nix::unistd::Uid;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    endpoint::Endpoint,
    name_registry::NameFlag,
    notify::{NameChange, Notification},
    pool::Pool,
    Error, Result,
};

/// Role bits a connection carries for its whole lifetime.
#[bitflags]
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionFlag {
    /// Launch placeholder: any name it claims is held only until a real
    /// peer takes it over, and comes back when that peer goes away.
    Starter = 1 << 0,
}

/// A message parked in a connection's receive queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// A name-change notification broadcast by the registry.
    NameChange {
        kind: NameChange,
        old_id: u64,
        new_id: u64,
        flags: BitFlags<NameFlag>,
        name: Arc<str>,
    },
    /// An inbound payload queued by a peer.
    Data(Vec<u8>),
}

impl Message {
    /// Pool space the message occupies while queued.
    fn size(&self) -> u64 {
        match self {
            Message::NameChange { name, .. } => 4 * 8 + name.len() as u64 + 1,
            Message::Data(bytes) => bytes.len() as u64,
        }
    }
}

#[derive(Debug)]
struct QueuedMessage {
    offset: u64,
    msg: Message,
}

#[derive(Debug, Default)]
struct NameIndexes {
    owned: Vec<Arc<str>>,
    queued: Vec<Arc<str>>,
}

/// A single peer's session on an endpoint.
///
/// The connection is the unit the name registry arbitrates between: it tracks
/// which names it owns and which it waits for, and every queued message is
/// accounted against its [`Pool`].
#[derive(Debug)]
pub struct Connection {
    id: u64,
    flags: BitFlags<ConnectionFlag>,
    uid: Uid,
    ep: Arc<Endpoint>,
    pool: Pool,
    names: Mutex<NameIndexes>,
    queue: Mutex<VecDeque<QueuedMessage>>,
    msg_ready: Event,
    disconnected: AtomicBool,
}

impl Connection {
    /// Attach a new connection to `ep`. Fails once the endpoint has been
    /// disconnected.
    pub fn new(
        ep: &Arc<Endpoint>,
        flags: BitFlags<ConnectionFlag>,
        uid: Uid,
        pool_size: u64,
    ) -> Result<Arc<Self>> {
        if ep.is_disconnected() {
            return Err(Error::NotFound);
        }

        let bus = ep.bus();
        let conn = Arc::new(Self {
            id: bus.next_connection_id(),
            flags,
            uid,
            ep: ep.clone(),
            pool: Pool::new(pool_size),
            names: Mutex::new(NameIndexes::default()),
            queue: Mutex::new(VecDeque::new()),
            msg_ready: Event::new(),
            disconnected: AtomicBool::new(false),
        });
        bus.register_connection(&conn);
        ep.attach_connection(&conn);
        debug!("connection {} attached to endpoint {}", conn.id, ep.name());

        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> BitFlags<ConnectionFlag> {
        self.flags
    }

    pub fn is_starter(&self) -> bool {
        self.flags.contains(ConnectionFlag::Starter)
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn ep(&self) -> &Arc<Endpoint> {
        &self.ep
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Tear the connection down: every owned name is handed on or removed,
    /// every queued claim withdrawn, and the bus and endpoint forget the id.
    /// Idempotent.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ep.registry().remove_connection(self);
        self.ep.bus().forget_connection(self.id);
        self.ep.detach_connection(self.id);
        debug!("connection {} disconnected", self.id);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Queue an inbound payload on this connection.
    pub fn queue_message(&self, bytes: Vec<u8>) -> Result<()> {
        self.enqueue(Message::Data(bytes))
    }

    /// Pop the oldest queued message, releasing its pool slice.
    pub fn recv(&self) -> Option<Message> {
        let queued = self.queue.lock().pop_front()?;
        let _ = self.pool.free(queued.offset);
        Some(queued.msg)
    }

    /// Like [`Connection::recv`], but parks the caller until a message
    /// arrives.
    pub fn recv_blocking(&self) -> Message {
        loop {
            if let Some(msg) = self.recv() {
                return msg;
            }
            let listener = self.msg_ready.listen();
            if let Some(msg) = self.recv() {
                return msg;
            }
            listener.wait();
        }
    }

    pub fn queued_message_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn deliver_notification(&self, notification: &Notification) -> Result<()> {
        self.enqueue(Message::NameChange {
            kind: notification.kind,
            old_id: notification.old_id,
            new_id: notification.new_id,
            flags: notification.flags,
            name: notification.name.clone(),
        })
    }

    fn enqueue(&self, msg: Message) -> Result<()> {
        let offset = self.pool.alloc(msg.size())?;
        // Only payloads are rendered into the slice; for notifications the
        // wire encoding belongs to the marshalling layer and the slice just
        // accounts for it.
        if let Message::Data(bytes) = &msg {
            if let Err(e) = self.pool.write(offset, bytes) {
                let _ = self.pool.free(offset);
                return Err(e);
            }
        }
        self.queue.lock().push_back(QueuedMessage { offset, msg });
        self.msg_ready.notify(usize::MAX);
        Ok(())
    }

    /// Names currently owned by this connection.
    pub fn owned_names(&self) -> Vec<Arc<str>> {
        self.names.lock().owned.clone()
    }

    /// Names this connection is queued on.
    pub fn queued_names(&self) -> Vec<Arc<str>> {
        self.names.lock().queued.clone()
    }

    pub fn owned_name_count(&self) -> usize {
        self.names.lock().owned.len()
    }

    pub(crate) fn note_owned(&self, name: &Arc<str>) {
        self.names.lock().owned.push(name.clone());
    }

    pub(crate) fn forget_owned(&self, name: &str) {
        let mut names = self.names.lock();
        if let Some(pos) = names.owned.iter().position(|n| &**n == name) {
            names.owned.remove(pos);
        }
    }

    pub(crate) fn note_queued(&self, name: &Arc<str>) {
        self.names.lock().queued.push(name.clone());
    }

    /// Drop one queued-name marker for `name`; a connection may be in line
    /// for the same name more than once.
    pub(crate) fn forget_queued(&self, name: &str) {
        let mut names = self.names.lock();
        if let Some(pos) = names.queued.iter().position(|n| &**n == name) {
            names.queued.remove(pos);
        }
    }

    /// Atomically detach both name indexes, leaving them empty. The registry
    /// purge path splices them out under the connection lock so a concurrent
    /// operation can never observe a half-purged connection.
    pub(crate) fn take_name_indexes(&self) -> (Vec<Arc<str>>, Vec<Arc<str>>) {
        let mut names = self.names.lock();
        (mem::take(&mut names.owned), mem::take(&mut names.queued))
    }
}

/// Migrate every message queued on `src` to `dest`, oldest first.
///
/// Each message is re-accounted in `dest`'s pool before it leaves `src`; when
/// `dest` runs out of space the remaining messages stay where they are and
/// the pool error is returned.
pub fn move_messages(dest: &Connection, src: &Connection) -> Result<()> {
    loop {
        let Some(queued) = src.queue.lock().pop_front() else {
            return Ok(());
        };
        match dest.enqueue(queued.msg.clone()) {
            Ok(()) => {
                let _ = src.pool.free(queued.offset);
            }
            Err(e) => {
                src.queue.lock().push_front(queued);
                return Err(e);
            }
        }
    }
}
