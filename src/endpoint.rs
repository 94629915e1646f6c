use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use nix::unistd::{Gid, Uid};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{bus::Bus, connection::Connection, name_registry::NameRegistry, notify::Notification};

/// The registered device node backing an endpoint.
#[derive(Clone, Debug)]
pub struct DeviceNode {
    pub devt: (u32, u32),
    pub path: String,
}

/// Per-endpoint ownership policy database.
///
/// Rule storage and evaluation live outside the core; this default database
/// admits every claim. The registry command surface consults it before an
/// acquisition.
#[derive(Debug, Default)]
pub struct PolicyDb;

impl PolicyDb {
    pub fn check_own_access(&self, _conn: &Connection, _name: &str) -> bool {
        true
    }
}

/// A named access point to a bus.
///
/// Connections attach through an endpoint, and name-change notifications are
/// dispatched via it. While connected it is reachable through the bus's
/// endpoint list and the namespace minor index; after [`Endpoint::disconnect`]
/// those registrations are gone but in-flight holders keep the object alive.
#[derive(Debug)]
pub struct Endpoint {
    bus: Arc<Bus>,
    registry: NameRegistry,
    id: u64,
    name: String,
    minor: u32,
    mode: u32,
    uid: Uid,
    gid: Gid,
    policy_db: Option<Arc<PolicyDb>>,
    device: Mutex<Option<DeviceNode>>,
    connections: Mutex<Vec<Weak<Connection>>>,
    disconnected: AtomicBool,
}

impl Endpoint {
    /// Create an endpoint on `bus` and register its device node. A zero
    /// `mode` falls back to `0o600`. The endpoint named `"bus"` gets the
    /// bus-wide policy database.
    pub fn create(bus: &Arc<Bus>, name: &str, mode: u32, uid: Uid, gid: Gid) -> Arc<Self> {
        let ns = bus.namespace();
        let minor = ns.alloc_minor();
        let device = DeviceNode {
            devt: (ns.major(), minor),
            path: format!("{}/{}/{}", ns.devpath(), bus.name(), name),
        };

        let ep = Arc::new(Self {
            bus: bus.clone(),
            registry: bus.registry().clone(),
            id: bus.next_endpoint_id(),
            name: name.to_string(),
            minor,
            mode: if mode > 0 { mode } else { 0o600 },
            uid,
            gid,
            policy_db: (name == "bus").then(|| Arc::new(PolicyDb::default())),
            device: Mutex::new(Some(device)),
            connections: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        });

        ns.index_minor(minor, &ep);
        bus.link_endpoint(&ep);
        info!(
            "created endpoint {} for bus '{}/{}/{}'",
            ep.id,
            ns.devpath(),
            bus.name(),
            name
        );

        ep
    }

    /// Find the endpoint called `name` on `bus`.
    pub fn find(bus: &Bus, name: &str) -> Option<Arc<Endpoint>> {
        bus.endpoints().into_iter().find(|ep| ep.name == name)
    }

    /// Take the endpoint out of service: the device node and the minor
    /// registration go away and the bus stops listing it. Idempotent;
    /// in-flight holders keep the object alive until their reference drops.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(device) = self.device.lock().take() {
            debug!("unregistered device node {}", device.path);
        }
        let ns = self.bus.namespace();
        ns.unregister_minor(self.minor);
        self.bus.unlink_endpoint(self.id);
        info!(
            "closing endpoint {}/{}/{}",
            ns.devpath(),
            self.bus.name(),
            self.name
        );
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// The name registry this endpoint's connections arbitrate through.
    pub fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    pub fn policy_db(&self) -> Option<&Arc<PolicyDb>> {
        self.policy_db.as_ref()
    }

    pub fn device(&self) -> Option<DeviceNode> {
        self.device.lock().clone()
    }

    pub(crate) fn attach_connection(&self, conn: &Arc<Connection>) {
        self.connections.lock().push(Arc::downgrade(conn));
    }

    pub(crate) fn detach_connection(&self, id: u64) {
        self.connections
            .lock()
            .retain(|w| w.upgrade().is_some_and(|c| c.id() != id));
    }

    /// Connections currently attached to this endpoint.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut list = self.connections.lock();
        list.retain(|w| w.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    }

    /// Queue `notification` on every attached connection. A connection whose
    /// pool cannot take the message just misses it.
    pub(crate) fn broadcast(&self, notification: &Notification) {
        for conn in self.connections() {
            if let Err(e) = conn.deliver_notification(notification) {
                warn!(
                    "dropping notification for connection {}: {}",
                    conn.id(),
                    e
                );
            }
        }
    }
}
