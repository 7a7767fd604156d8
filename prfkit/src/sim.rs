//! In-memory implementations of the vendor stack services.
//!
//! [`MemoryDb`] and [`MemoryKernel`] stand in for the attribute database and the kernel when
//! running on a host, for tests and for simulating a connected peer.
//!
//! [`MemoryDb`]: struct.MemoryDb.html
//! [`MemoryKernel`]: struct.MemoryKernel.html

use {
    crate::{
        att::{
            AttHandle, AttKind, AttributeDb, AttributeDesc, Element, PermRight, Permissions,
            ServiceLayout, Status, Value,
        },
        bytes::*,
        config::{Config, MAX_CONNECTIONS},
        gatt::{Disconnect, GattReq},
        kernel::{ConHdl, ConIdx, Envelope, Kernel, Payload, State, TaskId},
        uuid::AttUuid,
        utils::HexSlice,
        Error,
    },
    heapless::{
        consts::{U128, U16, U32},
        spsc::Queue,
        Vec,
    },
};

/// Host configuration using the in-memory services.
pub struct SimConfig;

impl Config for SimConfig {
    type Db = MemoryDb;
    type Kernel = MemoryKernel;
}

struct Entry {
    handle: AttHandle,
    uuid: AttUuid,
    perm: Permissions,
    max_len: u16,
    owner: TaskId,
    value: Value,
}

struct Service {
    start: AttHandle,
    perm: PermRight,
}

/// An attribute database holding everything in RAM.
pub struct MemoryDb {
    entries: Vec<Entry, U128>,
    services: Vec<Service, U16>,
    max_services: usize,
    next: u16,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            services: Vec::new(),
            max_services: 16,
            next: 1,
        }
    }

    /// Makes `create_db` fail with `InsufficientResources` once `max` services exist.
    pub fn limit_services(&mut self, max: usize) {
        self.max_services = max.min(self.services.capacity());
    }

    fn entry(&self, handle: AttHandle) -> Option<&Entry> {
        self.entries.iter().find(|e| e.handle == handle)
    }

    /// Returns the stored value of `handle`.
    pub fn value(&self, handle: AttHandle) -> Option<&[u8]> {
        self.entry(handle).map(|e| &e.value[..])
    }

    /// Returns the access level of the service declared at `svc`.
    pub fn permission(&self, svc: AttHandle) -> Option<PermRight> {
        self.services.iter().find(|s| s.start == svc).map(|s| s.perm)
    }

    /// Returns the attribute permissions of `handle`.
    pub fn attribute_perm(&self, handle: AttHandle) -> Option<Permissions> {
        self.entry(handle).map(|e| e.perm)
    }

    /// Returns the task receiving writes to `handle`.
    pub fn owner(&self, handle: AttHandle) -> Option<TaskId> {
        self.entry(handle).map(|e| e.owner)
    }

    /// Number of stored attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the first attribute of type `uuid` at or after `from`.
    pub fn find(&self, uuid: AttUuid, from: AttHandle) -> Option<AttHandle> {
        self.entries
            .iter()
            .find(|e| e.handle >= from && e.uuid == uuid)
            .map(|e| e.handle)
    }

    fn declaration_value(desc: &AttributeDesc, handle: AttHandle) -> Result<Value, Error> {
        let mut buf = [0; 19];
        let mut writer = ByteWriter::new(&mut buf);
        match desc.kind {
            AttKind::PrimaryService(uuid) => uuid.to_bytes(&mut writer)?,
            AttKind::Characteristic { uuid, props } => {
                writer.write_u8(props.bits())?;
                // The value attribute directly follows its declaration.
                handle.offset(1).to_bytes(&mut writer)?;
                uuid.to_bytes(&mut writer)?;
            }
            _ => {}
        }
        let used = 19 - writer.space_left();
        Value::from_slice(&buf[..used]).map_err(|()| Error::InvalidLength)
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeDb for MemoryDb {
    fn create_db(
        &mut self,
        table: &[AttributeDesc],
        cfg: u64,
        owner: TaskId,
    ) -> Result<ServiceLayout, Status> {
        match table.first().map(|desc| desc.kind) {
            Some(AttKind::PrimaryService(_)) => {}
            _ => return Err(Status::InvalidParam),
        }
        let cfg = (cfg | 1) & crate::att::cfg_first(table.len());
        let count = cfg.count_ones() as usize;
        if self.entries.len() + count > self.entries.capacity()
            || self.services.len() >= self.max_services
            || usize::from(self.next) + count > usize::from(u16::max_value())
        {
            warn!("database full, can't add {} attributes", count);
            return Err(Status::InsufficientResources);
        }

        let start = AttHandle::from_raw(self.next);
        for (idx, desc) in table.iter().enumerate() {
            if cfg & (1 << idx) == 0 {
                continue;
            }
            let handle = AttHandle::from_raw(self.next);
            self.next += 1;
            let value = Self::declaration_value(desc, handle).map_err(Status::from)?;
            let entry = Entry {
                handle,
                uuid: desc.uuid(),
                perm: desc.perm,
                max_len: desc.max_len.max(value.len() as u16),
                owner,
                value,
            };
            if self.entries.push(entry).is_err() {
                return Err(Status::InsufficientResources);
            }
        }

        let svc = Service {
            start,
            perm: PermRight::Enabled,
        };
        if self.services.push(svc).is_err() {
            return Err(Status::InsufficientResources);
        }
        debug!("created service at {:?} for {:?} ({} attributes)", start, owner, count);
        Ok(ServiceLayout::new(start, cfg))
    }

    fn set_value(&mut self, handle: AttHandle, value: &[u8]) -> Result<(), Status> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.handle == handle)
            .ok_or(Status::InvalidHandle)?;
        if value.len() > usize::from(entry.max_len) {
            return Err(Status::InvalidAttributeValueLength);
        }
        entry.value = Value::from_slice(value).map_err(|()| Status::InvalidAttributeValueLength)?;
        trace!("{:?} = {:?}", handle, HexSlice(value));
        Ok(())
    }

    fn get_attribute(&self, handle: AttHandle) -> Result<Element<'_>, Status> {
        self.entry(handle)
            .map(|e| Element {
                handle: e.handle,
                uuid: e.uuid,
                value: &e.value,
            })
            .ok_or(Status::InvalidHandle)
    }

    fn set_permission(&mut self, svc: AttHandle, perm: PermRight) -> Result<(), Status> {
        let service = self
            .services
            .iter_mut()
            .find(|s| s.start == svc)
            .ok_or(Status::InvalidHandle)?;
        service.perm = perm;
        Ok(())
    }
}

/// A kernel with bounded in-memory queues.
///
/// Messages for GATT are kept apart from the rest, since on a real stack they leave the
/// application processor's view; [`next_gatt`] returns them.
///
/// [`next_gatt`]: #method.next_gatt
pub struct MemoryKernel {
    queue: Queue<Envelope, U32>,
    gatt: Queue<(TaskId, GattReq), U32>,
    states: Vec<(TaskId, State), U32>,
    connections: [Option<ConHdl>; MAX_CONNECTIONS],
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self {
            queue: Queue::new(),
            gatt: Queue::new(),
            states: Vec::new(),
            connections: [None; MAX_CONNECTIONS],
        }
    }

    /// Adds a connection to the GAP connection table.
    ///
    /// Returns its connection index, or `None` if the table is full.
    pub fn connect(&mut self, conhdl: ConHdl) -> Option<ConIdx> {
        if let Some(idx) = self.connection_index(conhdl) {
            return Some(idx);
        }
        let (idx, slot) = self
            .connections
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())?;
        *slot = Some(conhdl);
        info!("connection {:#06x} at index {}", conhdl, idx);
        Some(idx as ConIdx)
    }

    /// Removes a connection and queues the disconnection event for the application.
    pub fn disconnect(&mut self, conhdl: ConHdl, reason: u8) -> Result<(), Error> {
        for slot in self.connections.iter_mut() {
            if *slot == Some(conhdl) {
                *slot = None;
            }
        }
        info!("connection {:#06x} lost, reason {:#04x}", conhdl, reason);
        self.send(Envelope::new(
            TaskId::GAP,
            TaskId::APP,
            Payload::Disconnect(Disconnect { conhdl, reason }),
        ))
    }

    /// Takes the oldest request sent to GATT, along with its sender.
    pub fn next_gatt(&mut self) -> Option<(TaskId, GattReq)> {
        self.gatt.dequeue()
    }

    /// Number of queued non-GATT messages.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Default for MemoryKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for MemoryKernel {
    fn send(&mut self, msg: Envelope) -> Result<(), Error> {
        trace!("{:?} -> {:?}: {:?}", msg.src, msg.dest, msg.payload);
        match msg.payload {
            Payload::GattReq(req) if msg.dest == TaskId::GATT => {
                self.gatt.enqueue((msg.src, req)).map_err(|_| Error::QueueFull)
            }
            payload => self
                .queue
                .enqueue(Envelope { payload, ..msg })
                .map_err(|_| Error::QueueFull),
        }
    }

    fn state(&self, task: TaskId) -> State {
        self.states
            .iter()
            .find(|(id, _)| *id == task)
            .map(|(_, state)| *state)
            .unwrap_or(State::Disabled)
    }

    fn set_state(&mut self, task: TaskId, state: State) {
        if let Some(slot) = self.states.iter_mut().find(|(id, _)| *id == task) {
            slot.1 = state;
        } else if self.states.push((task, state)).is_err() {
            error!("state table full, {:?} stays untracked", task);
        }
    }

    fn connection_index(&self, conhdl: ConHdl) -> Option<ConIdx> {
        self.connections
            .iter()
            .position(|slot| *slot == Some(conhdl))
            .map(|idx| idx as ConIdx)
    }

    fn next(&mut self) -> Option<Envelope> {
        self.queue.dequeue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::att::{cfg_first, Properties};

    fn table() -> [AttributeDesc; 4] {
        [
            AttributeDesc::service(0x180F),
            AttributeDesc::characteristic(0x2A19, Properties::READ),
            AttributeDesc::value(0x2A19, Permissions::READ, 1),
            AttributeDesc::cccd(),
        ]
    }

    #[test]
    fn create_fills_declarations() {
        let mut db = MemoryDb::new();
        let layout = db.create_db(&table(), cfg_first(3), TaskId::APP).unwrap();
        assert_eq!(layout.len(), 3);
        assert_eq!(db.len(), 3);

        let svc = db.get_attribute(layout.start()).unwrap();
        assert_eq!(svc.value, &[0x0F, 0x18]);
        let decl = db.get_attribute(layout.handle(1).unwrap()).unwrap();
        let value_handle = layout.handle(2).unwrap().as_u16().to_le_bytes();
        assert_eq!(decl.value, &[0x02, value_handle[0], value_handle[1], 0x19, 0x2A]);
        assert_eq!(layout.handle(3), None);
        assert_eq!(db.permission(layout.start()), Some(PermRight::Enabled));
    }

    #[test]
    fn set_value_respects_max_len() {
        let mut db = MemoryDb::new();
        let layout = db.create_db(&table(), cfg_first(4), TaskId::APP).unwrap();
        let level = layout.handle(2).unwrap();
        db.set_value(level, &[50]).unwrap();
        assert_eq!(
            db.set_value(level, &[50, 0]),
            Err(Status::InvalidAttributeValueLength)
        );
        assert_eq!(db.value(level), Some(&[50][..]));
        assert_eq!(
            db.set_value(AttHandle::from_raw(0x99), &[0]),
            Err(Status::InvalidHandle)
        );
    }

    #[test]
    fn table_must_start_with_service() {
        let mut db = MemoryDb::new();
        let t = table();
        assert_eq!(db.create_db(&t[1..], 0b111, TaskId::APP), Err(Status::InvalidParam));
        assert!(db.is_empty());
    }

    #[test]
    fn connection_table() {
        let mut kernel = MemoryKernel::new();
        assert_eq!(kernel.connect(0x10), Some(0));
        assert_eq!(kernel.connect(0x11), Some(1));
        assert_eq!(kernel.connect(0x12), None);
        assert_eq!(kernel.connection_index(0x11), Some(1));

        kernel.disconnect(0x10, 0x13).unwrap();
        assert_eq!(kernel.connection_index(0x10), None);
        match kernel.next() {
            Some(Envelope {
                payload: Payload::Disconnect(disc),
                ..
            }) => assert_eq!(disc, Disconnect { conhdl: 0x10, reason: 0x13 }),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn gatt_requests_are_kept_apart() {
        let mut kernel = MemoryKernel::new();
        let req = GattReq::Notify {
            conhdl: 1,
            handle: AttHandle::from_raw(3),
        };
        kernel
            .send(Envelope::new(TaskId::APP, TaskId::GATT, Payload::GattReq(req.clone())))
            .unwrap();
        assert!(kernel.next().is_none());
        assert_eq!(kernel.next_gatt(), Some((TaskId::APP, req)));
        assert_eq!(kernel.state(TaskId::APP), State::Disabled);
    }
}
