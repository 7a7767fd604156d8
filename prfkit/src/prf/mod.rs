//! Profile tasks and the types they share.
//!
//! Every server role follows the same life cycle. `CreateDb` adds the profile's service(s) to
//! the attribute database (access disabled) and moves the task from `Disabled` to `Idle`.
//! `Enable` attaches the task to a connection, restores the peer's client configuration and
//! moves it to `Connected`. `Disable`, or the loss of that connection, reports the client
//! configuration to the application in a disable indication, hides the service again and
//! returns to `Idle`.
//!
//! Client roles keep one task instance per connection index and accept `Enable` as soon as they
//! are registered. See [`client`](client/index.html).

#[cfg(feature = "anpc")]
pub mod anpc;
#[cfg(feature = "bass")]
pub mod bass;
#[cfg(feature = "cscpc")]
pub mod cscpc;
#[cfg(feature = "cscps")]
pub mod cscps;
#[cfg(feature = "glps")]
pub mod glps;
#[cfg(feature = "hogpd")]
pub mod hogpd;
#[cfg(feature = "hrps")]
pub mod hrps;
#[cfg(feature = "otas")]
pub mod otas;
#[cfg(feature = "paspc")]
pub mod paspc;
#[cfg(feature = "scpps")]
pub mod scpps;
#[cfg(feature = "tips")]
pub mod tips;

#[cfg(any(feature = "anpc", feature = "paspc", feature = "cscpc"))]
pub mod client;
#[cfg(any(feature = "cscps", feature = "cscpc"))]
pub mod cscp;

use {
    crate::{
        att::{AttHandle, AttributeDb, PermRight, Status},
        bytes::*,
        kernel::{ConHdl, TaskId},
        Error,
    },
    byteorder::{ByteOrder, LittleEndian},
};

/// Client characteristic configuration: notifications and indications off.
pub const CCCD_STOP: u16 = 0x0000;
/// Client characteristic configuration: notifications on.
pub const CCCD_NTF: u16 = 0x0001;
/// Client characteristic configuration: indications on.
pub const CCCD_IND: u16 = 0x0002;

/// The connection a task is attached to, and who to report to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConInfo {
    pub conhdl: ConHdl,
    /// The application task that enabled the profile.
    pub app: TaskId,
}

/// How the peer on a new connection relates to us.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConType {
    /// Unknown peer. Client configuration starts out cleared (servers) or the peer's services
    /// are discovered (clients).
    Discovery,
    /// Bonded peer. Client configuration and discovered handles are restored from the values
    /// the application kept.
    Normal,
}

/// Connection bookkeeping of a server role attached to at most one connection.
#[derive(Debug, Copy, Clone)]
pub struct Attachment {
    con: Option<ConInfo>,
    app: TaskId,
}

impl Attachment {
    pub fn new() -> Self {
        Self {
            con: None,
            app: TaskId::APP,
        }
    }

    /// The application task to report to: the one that enabled the profile, or the one that
    /// created its database.
    pub fn app(&self) -> TaskId {
        self.con.map_or(self.app, |con| con.app)
    }

    pub fn set_app(&mut self, app: TaskId) {
        self.app = app;
    }

    pub fn con(&self) -> Option<ConInfo> {
        self.con
    }

    pub fn conhdl(&self) -> Option<ConHdl> {
        self.con.map(|con| con.conhdl)
    }

    /// Whether the profile is attached to `conhdl`.
    pub fn owns(&self, conhdl: ConHdl) -> bool {
        self.conhdl() == Some(conhdl)
    }

    pub fn attach(&mut self, conhdl: ConHdl, app: TaskId) {
        self.con = Some(ConInfo { conhdl, app });
        self.app = app;
    }

    /// Detaches from the connection, returning it if there was one.
    pub fn detach(&mut self) -> Option<ConInfo> {
        self.con.take()
    }
}

impl Default for Attachment {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the value written to a client characteristic configuration descriptor.
pub fn read_cccd(value: &[u8]) -> Result<u16, Status> {
    if value.len() != 2 {
        return Err(Status::InvalidAttributeValueLength);
    }
    Ok(LittleEndian::read_u16(value))
}

/// Reads a CCCD write that may only switch `allowed` on or everything off.
///
/// Any other value is rejected with `AppError`.
pub fn decode_cccd(value: &[u8], allowed: u16) -> Result<u16, Status> {
    match read_cccd(value)? {
        CCCD_STOP => Ok(CCCD_STOP),
        cfg if cfg == allowed => Ok(cfg),
        _ => Err(Status::AppError),
    }
}

/// Stores a client configuration value.
pub fn write_cccd(db: &mut dyn AttributeDb, handle: AttHandle, cfg: u16) -> Result<(), Status> {
    db.set_value(handle, &cfg.to_le_bytes())
}

/// Decodes a peer's CCCD write with [`decode_cccd`] and stores the accepted value.
pub fn store_cccd(
    db: &mut dyn AttributeDb,
    handle: AttHandle,
    value: &[u8],
    allowed: u16,
) -> Result<u16, Status> {
    let cfg = decode_cccd(value, allowed)?;
    write_cccd(db, handle, cfg)?;
    Ok(cfg)
}

/// Sets the access level of every non-null service handle in `services`.
pub fn set_services_permission(
    db: &mut dyn AttributeDb,
    services: &[AttHandle],
    perm: PermRight,
) -> Result<(), Status> {
    for svc in services.iter().filter(|svc| !svc.is_null()) {
        db.set_permission(*svc, perm)?;
    }
    Ok(())
}

/// Date and time, as in the Date Time characteristic.
///
/// Packed as `year: u16, month: u8, day: u8, hours: u8, minutes: u8, seconds: u8`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
}

impl DateTime {
    pub const SIZE: usize = 7;
}

impl ToBytes for DateTime {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.year)?;
        writer.write_slice(&[self.month, self.day, self.hour, self.min, self.sec])
    }
}

impl FromBytes<'_> for DateTime {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let year = bytes.read_u16_le()?;
        let [month, day, hour, min, sec]: [u8; 5] = bytes.read_array()?;
        Ok(Self {
            year,
            month,
            day,
            hour,
            min,
            sec,
        })
    }
}

/// Characteristic Presentation Format descriptor value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CharPresFmt {
    pub format: u8,
    pub exponent: i8,
    pub unit: u16,
    pub namespace: u8,
    pub description: u16,
}

impl CharPresFmt {
    pub const SIZE: usize = 7;
}

impl ToBytes for CharPresFmt {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.format)?;
        writer.write_i8(self.exponent)?;
        writer.write_u16_le(self.unit)?;
        writer.write_u8(self.namespace)?;
        writer.write_u16_le(self.description)
    }
}

impl FromBytes<'_> for CharPresFmt {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            format: bytes.read_u8()?,
            exponent: bytes.read_i8()?,
            unit: bytes.read_u16_le()?,
            namespace: bytes.read_u8()?,
            description: bytes.read_u16_le()?,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by the profile tests.

    use crate::{
        att::{AttHandle, Value},
        gatt::{Disconnect, GattEvent, GattReq},
        kernel::{ConHdl, Envelope, Kernel, Payload, PayloadVariant, State, TaskId},
        sim::{MemoryDb, MemoryKernel},
        task::{Profile, Task},
    };

    pub const CONHDL: ConHdl = 0x0040;

    /// A task with a database and a kernel that knows about `CONHDL`.
    pub struct Bench<P: Profile> {
        pub task: Task<P>,
        pub db: MemoryDb,
        pub kernel: MemoryKernel,
    }

    impl<P: Profile> Bench<P> {
        pub fn new(profile: P) -> Self {
            Self::with_index(0, profile)
        }

        pub fn with_index(index: u8, profile: P) -> Self {
            let mut kernel = MemoryKernel::new();
            kernel.connect(CONHDL);
            Self {
                task: Task::new(index, profile),
                db: MemoryDb::new(),
                kernel,
            }
        }

        pub fn state(&self) -> State {
            self.kernel.state(self.task.id())
        }

        pub fn deliver(&mut self, src: TaskId, payload: Payload) {
            let env = Envelope::new(src, self.task.id(), payload);
            self.task
                .process(env, &mut self.db, &mut self.kernel)
                .unwrap();
        }

        pub fn request(&mut self, msg: P::Message) {
            self.deliver(TaskId::APP, msg.wrap());
        }

        pub fn gatt(&mut self, evt: GattEvent) {
            self.deliver(TaskId::GATT, Payload::Gatt(evt));
        }

        pub fn write(&mut self, handle: AttHandle, value: &[u8]) {
            self.gatt(GattEvent::Write {
                conhdl: CONHDL,
                handle,
                value: Value::from_slice(value).unwrap(),
                response: true,
                last: true,
            });
        }

        pub fn disconnect(&mut self, conhdl: ConHdl) {
            self.deliver(
                TaskId::GAP,
                Payload::Disconnect(Disconnect {
                    conhdl,
                    reason: 0x13,
                }),
            );
        }

        /// Drains the messages sent to the application.
        pub fn app_msgs(&mut self) -> Vec<P::Message> {
            let mut out = Vec::new();
            while let Some(env) = self.kernel.next() {
                match <P::Message as PayloadVariant>::unwrap(env.payload) {
                    Ok(msg) => out.push(msg),
                    Err(other) => panic!("unexpected {:?}", other),
                }
            }
            out
        }

        /// Drains the requests sent to GATT.
        pub fn gatt_reqs(&mut self) -> Vec<GattReq> {
            let mut out = Vec::new();
            while let Some((src, req)) = self.kernel.next_gatt() {
                assert_eq!(src, self.task.id());
                out.push(req);
            }
            out
        }

        pub fn value(&self, handle: AttHandle) -> Vec<u8> {
            self.db.value(handle).unwrap().to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cccd_values() {
        assert_eq!(decode_cccd(&[0x01, 0x00], CCCD_NTF), Ok(CCCD_NTF));
        assert_eq!(decode_cccd(&[0x00, 0x00], CCCD_NTF), Ok(CCCD_STOP));
        assert_eq!(decode_cccd(&[0x02, 0x00], CCCD_NTF), Err(Status::AppError));
        assert_eq!(decode_cccd(&[0x01], CCCD_NTF), Err(Status::InvalidAttributeValueLength));
    }

    #[test]
    fn date_time_layout() {
        let time = DateTime {
            year: 2013,
            month: 6,
            day: 30,
            hour: 23,
            min: 59,
            sec: 58,
        };
        let mut buf = [0; DateTime::SIZE];
        encode_into(&time, &mut buf).unwrap();
        assert_eq!(buf, [0xDD, 0x07, 6, 30, 23, 59, 58]);
        assert_eq!(decode_exact::<DateTime>(&buf), Ok(time));
        assert_eq!(decode_exact::<DateTime>(&buf[..6]), Err(Error::Eof));
    }

    #[test]
    fn presentation_format_layout() {
        let fmt = CharPresFmt {
            format: 0x04,
            exponent: -1,
            unit: 0x27AD,
            namespace: 0x01,
            description: 0x0106,
        };
        let mut buf = [0; CharPresFmt::SIZE];
        encode_into(&fmt, &mut buf).unwrap();
        assert_eq!(buf, [0x04, 0xFF, 0xAD, 0x27, 0x01, 0x06, 0x01]);
        assert_eq!(decode_exact::<CharPresFmt>(&buf), Ok(fmt));
    }
}
