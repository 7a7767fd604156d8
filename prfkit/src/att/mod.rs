//! Attribute database types.
//!
//! Profiles describe their GATT services as static tables of [`AttributeDesc`]s. The attribute
//! database (an external service reached through [`AttributeDb`]) turns such a table into a
//! live service and hands back a [`ServiceLayout`] from which the handle of every created
//! attribute can be derived.
//!
//! [`AttributeDesc`]: struct.AttributeDesc.html
//! [`AttributeDb`]: trait.AttributeDb.html
//! [`ServiceLayout`]: struct.ServiceLayout.html

mod db;
mod handle;

pub use self::db::{AttributeDb, Element};
pub use self::handle::{AttHandle, ServiceLayout};

use {
    crate::{
        bytes::*,
        config::MAX_VALUE_LEN,
        uuid::{decl, AttUuid, Uuid16},
        Error,
    },
    bitflags::bitflags,
    heapless::{consts::U64, Vec},
};

/// Owned attribute value, as carried in messages.
pub type Value = Vec<u8, U64>;

/// Packs `value` into an owned attribute value.
pub fn to_value<T: ToBytes + ?Sized>(value: &T) -> Result<Value, Error> {
    let mut buf = [0; MAX_VALUE_LEN];
    let used = encode_into(value, &mut buf)?;
    Value::from_slice(&buf[..used]).map_err(|()| Error::InvalidLength)
}

enum_with_unknown! {
    /// Status byte carried in confirmations, indications, write responses and error
    /// indications.
    ///
    /// `0x01..=0x11` are the ATT error codes, `0x80..` are the profile-level errors.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Status(u8) {
        Ok = 0x00,

        InvalidHandle = 0x01,
        ReadNotPermitted = 0x02,
        WriteNotPermitted = 0x03,
        InvalidPdu = 0x04,
        InsufficientAuthentication = 0x05,
        RequestNotSupported = 0x06,
        InvalidOffset = 0x07,
        InsufficientAuthorization = 0x08,
        PrepareQueueFull = 0x09,
        AttributeNotFound = 0x0A,
        AttributeNotLong = 0x0B,
        InsufficientEncryptionKeySize = 0x0C,
        InvalidAttributeValueLength = 0x0D,
        UnlikelyError = 0x0E,
        InsufficientEncryption = 0x0F,
        UnsupportedGroupType = 0x10,
        InsufficientResources = 0x11,

        /// Generic application error, also sent when a peer writes an unsupported value.
        AppError = 0x80,
        InvalidParam = 0x81,
        InexistentHandle = 0x82,
        StopDiscoveryCharMissing = 0x83,
        StopDiscoveryWrongCharProp = 0x84,
        MultipleService = 0x86,
        NotWritable = 0x87,
        NotReadable = 0x88,
        /// The request is not allowed in the task's current state.
        ReqDisallowed = 0x89,
        NtfDisabled = 0x8A,
        IndDisabled = 0x8B,
        FeatureNotSupported = 0x8C,
        UnexpectedLen = 0x8D,
        Disconnected = 0x8E,
        ProcTimeout = 0x8F,

        CccdImproperlyConfigured = 0xFD,
        ProcedureInProgress = 0xFE,
        OutOfRange = 0xFF,
    }
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Converts `Ok` into `Ok(())` and every other status into `Err(self)`.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        match e {
            Error::Eof | Error::InvalidLength | Error::IncompleteParse => {
                Status::InvalidAttributeValueLength
            }
            _ => Status::AppError,
        }
    }
}

/// Access level of a whole service, as set when a profile is enabled or disabled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PermRight {
    /// The service is hidden from peers.
    Disabled = 0,
    Enabled = 1,
    /// Access requires an unauthenticated (Just Works) encrypted link.
    Unauth = 2,
    /// Access requires an authenticated encrypted link.
    Auth = 3,
}

bitflags! {
    /// Characteristic properties, as they appear in a characteristic declaration.
    pub struct Properties: u8 {
        const BROADCAST    = 0x01;
        const READ         = 0x02;
        const WRITE_NO_RSP = 0x04;
        const WRITE        = 0x08;
        const NOTIFY       = 0x10;
        const INDICATE     = 0x20;
        const AUTH_WRITES  = 0x40;
        const EXTENDED     = 0x80;
    }
}

bitflags! {
    /// Access permissions of a single attribute.
    pub struct Permissions: u8 {
        const READ         = 0x01;
        const WRITE        = 0x02;
        const WRITE_NO_RSP = 0x04;
        const NOTIFY       = 0x08;
        const INDICATE     = 0x10;
    }
}

/// What an attribute table entry declares.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttKind {
    /// Primary service declaration for the given service UUID.
    PrimaryService(AttUuid),
    /// Include declaration. The included service is set by the owner after creation.
    Include,
    /// Characteristic declaration. The database fills in the value handle.
    Characteristic { uuid: AttUuid, props: Properties },
    /// Characteristic value.
    Value(AttUuid),
    /// Characteristic descriptor.
    Descriptor(Uuid16),
}

/// Static description of one attribute of a service.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AttributeDesc {
    pub kind: AttKind,
    pub perm: Permissions,
    /// Maximum length of the attribute value in bytes.
    pub max_len: u16,
}

impl AttributeDesc {
    pub const fn service(uuid: u16) -> Self {
        Self {
            kind: AttKind::PrimaryService(AttUuid::short(uuid)),
            perm: Permissions::READ,
            max_len: 0,
        }
    }

    pub const fn include() -> Self {
        Self {
            kind: AttKind::Include,
            perm: Permissions::READ,
            max_len: 6,
        }
    }

    pub const fn characteristic(uuid: u16, props: Properties) -> Self {
        Self {
            kind: AttKind::Characteristic {
                uuid: AttUuid::short(uuid),
                props,
            },
            perm: Permissions::READ,
            max_len: 0,
        }
    }

    pub const fn value(uuid: u16, perm: Permissions, max_len: u16) -> Self {
        Self {
            kind: AttKind::Value(AttUuid::short(uuid)),
            perm,
            max_len,
        }
    }

    pub const fn descriptor(uuid: Uuid16, perm: Permissions, max_len: u16) -> Self {
        Self {
            kind: AttKind::Descriptor(uuid),
            perm,
            max_len,
        }
    }

    /// A client characteristic configuration descriptor.
    pub const fn cccd() -> Self {
        Self::descriptor(
            decl::CLIENT_CHAR_CFG,
            Permissions::from_bits_truncate(0x01 | 0x02),
            2,
        )
    }

    /// The attribute type UUID of this entry.
    pub fn uuid(&self) -> AttUuid {
        match self.kind {
            AttKind::PrimaryService(_) => decl::PRIMARY_SERVICE.into(),
            AttKind::Include => decl::INCLUDE.into(),
            AttKind::Characteristic { .. } => decl::CHARACTERISTIC.into(),
            AttKind::Value(uuid) => uuid,
            AttKind::Descriptor(uuid) => uuid.into(),
        }
    }

    /// Returns a copy of a characteristic declaration with `props` added.
    pub fn with_props(self, extra: Properties) -> Self {
        match self.kind {
            AttKind::Characteristic { uuid, props } => Self {
                kind: AttKind::Characteristic {
                    uuid,
                    props: props | extra,
                },
                ..self
            },
            _ => self,
        }
    }

    /// Returns a copy of the entry with `perm` added.
    pub fn with_perm(self, extra: Permissions) -> Self {
        Self {
            perm: self.perm | extra,
            ..self
        }
    }
}

/// Builds a configuration mask with the bits of `indices` set.
pub fn cfg_mask(indices: &[usize]) -> u64 {
    indices.iter().fold(0, |mask, &idx| mask | (1 << idx))
}

/// Builds a configuration mask with the first `n` bits set.
pub fn cfg_first(n: usize) -> u64 {
    if n >= 64 {
        !0
    } else {
        (1 << n) - 1
    }
}
