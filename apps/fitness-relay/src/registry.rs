use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::RelayError;

pub type DeviceIndex = u64;

/// Identity held by a connection that has not sent `device_register` yet.
pub const UNREGISTERED_IDENTITY: &str = "unknown";

/// Literal identifier addressing every registered device.
pub const ALL_DEVICES: &str = "all";

/// A resolved command target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Device(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListing {
    pub index: Option<DeviceIndex>,
    pub device_id: String,
    pub online: bool,
}

/// What `unregister` removed, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub device_id: String,
    pub index: Option<DeviceIndex>,
}

/// Tracks live connections and the device identities bound to them.
///
/// All state sits behind a single lock so register, unregister and resolve
/// are linearizable: no reader ever sees a connection bound without its
/// index or the other way round.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionSlot>,
    /// identity -> connection, in first-registration order.
    bindings: Vec<Binding>,
    indices: BTreeMap<DeviceIndex, String>,
    last_index: DeviceIndex,
}

struct ConnectionSlot {
    handle: ConnectionHandle,
    device_id: String,
    index: Option<DeviceIndex>,
}

struct Binding {
    device_id: String,
    connection: ConnectionId,
}

impl RegistryInner {
    fn binding(&self, device_id: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.device_id == device_id)
    }

    fn unbind_if_owned(&mut self, device_id: &str, connection: ConnectionId) {
        self.bindings
            .retain(|b| !(b.device_id == device_id && b.connection == connection));
    }

    fn bound_handle(&self, device_id: &str) -> Option<&ConnectionHandle> {
        let binding = self.binding(device_id)?;
        self.connections
            .get(&binding.connection)
            .map(|slot| &slot.handle)
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection under the placeholder identity.
    pub fn connect(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.lock();
        inner.connections.insert(
            handle.id(),
            ConnectionSlot {
                handle,
                device_id: UNREGISTERED_IDENTITY.to_string(),
                index: None,
            },
        );
    }

    /// Bind `handle` to `device_id` and hand out the next device index.
    ///
    /// A second registration of the same identity from another connection
    /// takes over the identity; the older connection stays open but is no
    /// longer reachable by identity.
    pub fn register(&self, handle: &ConnectionHandle, device_id: &str) -> DeviceIndex {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let connection = handle.id();

        let slot = inner
            .connections
            .entry(connection)
            .or_insert_with(|| ConnectionSlot {
                handle: handle.clone(),
                device_id: UNREGISTERED_IDENTITY.to_string(),
                index: None,
            });

        let previous_id = std::mem::replace(&mut slot.device_id, device_id.to_string());
        let previous_index = slot.index.take();

        inner.last_index += 1;
        let index = inner.last_index;
        slot.index = Some(index);

        if let Some(previous_index) = previous_index {
            inner.indices.remove(&previous_index);
        }
        if previous_id != device_id && previous_id != UNREGISTERED_IDENTITY {
            inner.unbind_if_owned(&previous_id, connection);
        }

        match inner.bindings.iter_mut().find(|b| b.device_id == device_id) {
            Some(binding) => {
                if binding.connection != connection {
                    warn!(
                        device_id,
                        previous = %binding.connection,
                        current = %connection,
                        "device identity re-registered from a new connection"
                    );
                }
                binding.connection = connection;
            }
            None => inner.bindings.push(Binding {
                device_id: device_id.to_string(),
                connection,
            }),
        }
        inner.indices.insert(index, device_id.to_string());

        index
    }

    /// Forget a connection. Identity and index mappings it owns go with it;
    /// a connection that never registered leaves nothing else behind.
    pub fn unregister(&self, connection: ConnectionId) -> Option<Departure> {
        let mut inner = self.inner.lock();
        let slot = inner.connections.remove(&connection)?;
        if let Some(index) = slot.index {
            inner.indices.remove(&index);
        }
        if slot.device_id == UNREGISTERED_IDENTITY {
            return None;
        }
        inner.unbind_if_owned(&slot.device_id, connection);
        Some(Departure {
            device_id: slot.device_id,
            index: slot.index,
        })
    }

    /// Resolve `"all"`, a device index, or a raw device id.
    ///
    /// An identifier that parses as an integer is only ever looked up as an
    /// index, never as a raw id.
    pub fn resolve(&self, identifier: &str) -> Result<Target, RelayError> {
        if identifier == ALL_DEVICES {
            return Ok(Target::All);
        }

        let inner = self.inner.lock();
        let found = match identifier.trim().parse::<i64>() {
            Ok(index) => DeviceIndex::try_from(index)
                .ok()
                .and_then(|index| inner.indices.get(&index))
                .filter(|device_id| inner.binding(device_id).is_some())
                .cloned(),
            Err(_) => inner
                .binding(identifier)
                .is_some()
                .then(|| identifier.to_string()),
        };
        drop(inner);
        if let Some(device_id) = found {
            return Ok(Target::Device(device_id));
        }

        warn!(identifier, "device not found; list devices to see valid targets");
        Err(RelayError::UnresolvedTarget(identifier.to_string()))
    }

    /// Connection currently bound to `device_id`.
    pub fn connection_for(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.inner.lock().bound_handle(device_id).cloned()
    }

    /// Copy of every registered device whose connection is still open. Safe
    /// to iterate while devices come and go.
    pub fn open_devices(&self) -> Vec<(String, ConnectionHandle)> {
        let inner = self.inner.lock();
        inner
            .bindings
            .iter()
            .filter_map(|binding| {
                let slot = inner.connections.get(&binding.connection)?;
                slot.handle
                    .is_open()
                    .then(|| (binding.device_id.clone(), slot.handle.clone()))
            })
            .collect()
    }

    pub fn list_devices(&self) -> Vec<DeviceListing> {
        let inner = self.inner.lock();
        let listing: Vec<DeviceListing> = inner
            .bindings
            .iter()
            .map(|binding| {
                let slot = inner.connections.get(&binding.connection);
                DeviceListing {
                    index: slot.and_then(|slot| slot.index),
                    device_id: binding.device_id.clone(),
                    online: slot.map(|slot| slot.handle.is_open()).unwrap_or(false),
                }
            })
            .collect();
        debug!(devices = listing.len(), "listed devices");
        listing
    }

    /// Number of device identities currently bound to a connection.
    pub fn registered_count(&self) -> usize {
        self.inner.lock().bindings.len()
    }

    /// Number of live connections, registered or not.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }
}
