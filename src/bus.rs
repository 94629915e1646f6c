use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use nix::unistd::Uid;
use parking_lot::Mutex;
use tracing::debug;

use crate::{connection::Connection, endpoint::Endpoint, name_registry::NameRegistry};

/// The device namespace buses live in: owns the device major and the
/// minor-number index endpoints register under.
#[derive(Debug)]
pub struct Namespace {
    devpath: String,
    major: u32,
    inner: Mutex<NamespaceInner>,
}

#[derive(Debug, Default)]
struct NamespaceInner {
    next_minor: u32,
    minors: HashMap<u32, Weak<Endpoint>>,
}

impl Namespace {
    pub fn new(devpath: impl Into<String>, major: u32) -> Arc<Self> {
        Arc::new(Self {
            devpath: devpath.into(),
            major,
            inner: Mutex::new(NamespaceInner {
                next_minor: 1,
                minors: HashMap::new(),
            }),
        })
    }

    pub fn devpath(&self) -> &str {
        &self.devpath
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn endpoint_by_minor(&self, minor: u32) -> Option<Arc<Endpoint>> {
        self.inner.lock().minors.get(&minor).and_then(Weak::upgrade)
    }

    pub(crate) fn alloc_minor(&self) -> u32 {
        let mut inner = self.inner.lock();
        let minor = inner.next_minor;
        inner.next_minor += 1;
        minor
    }

    pub(crate) fn index_minor(&self, minor: u32, ep: &Arc<Endpoint>) {
        self.inner.lock().minors.insert(minor, Arc::downgrade(ep));
    }

    pub(crate) fn unregister_minor(&self, minor: u32) {
        self.inner.lock().minors.remove(&minor);
    }
}

/// A logically isolated communication space.
///
/// The bus owns the endpoint list, the connection-by-id index, both id
/// allocators and the one name registry everything on the bus arbitrates
/// through.
#[derive(Debug)]
pub struct Bus {
    name: String,
    owner_uid: Uid,
    ns: Arc<Namespace>,
    registry: NameRegistry,
    inner: Mutex<BusInner>,
}

#[derive(Debug)]
struct BusInner {
    endpoints: Vec<Arc<Endpoint>>,
    connections: HashMap<u64, Weak<Connection>>,
    next_ep_id: u64,
    next_conn_id: u64,
}

impl Bus {
    pub fn new(ns: &Arc<Namespace>, name: impl Into<String>, owner_uid: Uid) -> Arc<Self> {
        let name = name.into();
        debug!("created bus '{}/{}'", ns.devpath(), name);
        Arc::new(Self {
            name,
            owner_uid,
            ns: ns.clone(),
            registry: NameRegistry::new(),
            inner: Mutex::new(BusInner {
                endpoints: Vec::new(),
                connections: HashMap::new(),
                next_ep_id: 1,
                next_conn_id: 1,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_uid(&self) -> Uid {
        self.owner_uid
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    /// Root and the bus owner may act on behalf of other connections.
    pub fn uid_is_privileged(&self, uid: Uid) -> bool {
        uid.is_root() || uid == self.owner_uid
    }

    pub fn connection_by_id(&self, id: u64) -> Option<Arc<Connection>> {
        self.inner.lock().connections.get(&id).and_then(Weak::upgrade)
    }

    /// Live connections on the bus, in no particular order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        inner.connections.retain(|_, w| w.strong_count() > 0);
        inner.connections.values().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.inner.lock().endpoints.clone()
    }

    pub(crate) fn next_endpoint_id(&self) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_ep_id;
        inner.next_ep_id += 1;
        id
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_conn_id;
        inner.next_conn_id += 1;
        id
    }

    pub(crate) fn link_endpoint(&self, ep: &Arc<Endpoint>) {
        self.inner.lock().endpoints.push(ep.clone());
    }

    pub(crate) fn unlink_endpoint(&self, id: u64) {
        self.inner.lock().endpoints.retain(|ep| ep.id() != id);
    }

    pub(crate) fn register_connection(&self, conn: &Arc<Connection>) {
        self.inner
            .lock()
            .connections
            .insert(conn.id(), Arc::downgrade(conn));
    }

    pub(crate) fn forget_connection(&self, id: u64) {
        self.inner.lock().connections.remove(&id);
    }
}
