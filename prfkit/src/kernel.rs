//! Kernel messaging.
//!
//! Every interaction between profile tasks, the application and the vendor stack is a message
//! ([`Envelope`]) sent from one task to another. The kernel queues the messages, stores the state
//! of every task and owns the GAP connection table; it is reached through the [`Kernel`] trait.
//!
//! Allocating a message is constructing a [`Payload`] value, freeing it is dropping it.
//!
//! [`Envelope`]: struct.Envelope.html
//! [`Kernel`]: trait.Kernel.html
//! [`Payload`]: enum.Payload.html

use crate::{
    gatt::{Disconnect, GattEvent, GattReq},
    Error,
};
use core::fmt;

/// Connection handle assigned by the link layer.
pub type ConHdl = u16;

/// Index of a connection in the GAP connection table.
pub type ConIdx = u8;

enum_with_unknown! {
    /// The kind of a task. Combined with an instance index this forms a [`TaskId`].
    ///
    /// [`TaskId`]: struct.TaskId.html
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum TaskType(u8) {
        Gatt = 0x01,
        Gap = 0x02,
        App = 0x03,

        Bass = 0x10,
        Hrps = 0x11,
        Cscps = 0x12,
        Glps = 0x13,
        Hogpd = 0x14,
        Tips = 0x15,
        Scpps = 0x16,
        Otas = 0x17,

        Anpc = 0x20,
        Paspc = 0x21,
        Cscpc = 0x22,
    }
}

/// Identifies a task instance: the instance index in the high byte, the task type in the low
/// byte.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct TaskId(u16);

impl TaskId {
    pub const GATT: Self = TaskId(0x01);
    pub const GAP: Self = TaskId(0x02);
    pub const APP: Self = TaskId(0x03);

    pub fn new(ty: TaskType, index: u8) -> Self {
        TaskId(u16::from(index) << 8 | u16::from(u8::from(ty)))
    }

    pub fn task_type(&self) -> TaskType {
        TaskType::from(self.0 as u8)
    }

    pub fn index(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.task_type(), self.index())
    }
}

/// Task state, stored by the kernel.
///
/// The order of the variants is meaningful: a state compares greater than the states it can
/// only be reached from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// No service created yet (servers) or not initialized.
    Disabled,
    /// Ready, but no peer attached.
    Idle,
    /// A client is discovering the peer's service.
    Discovering,
    /// Attached to a connection.
    Connected,
    /// Attached and waiting for a procedure to complete.
    Busy,
}

/// Implemented by the message types carried in a [`Payload`].
///
/// [`Payload`]: enum.Payload.html
pub trait PayloadVariant: Sized {
    fn wrap(self) -> Payload;

    /// Takes the message out of `payload`, or hands `payload` back if it carries something else.
    fn unwrap(payload: Payload) -> Result<Self, Payload>;
}

macro_rules! payloads {
    (
        $(
            $( #[$attr:meta] )*
            $variant:ident($ty:path),
        )*
    ) => {
        /// The contents of a kernel message.
        #[derive(Debug)]
        pub enum Payload {
            /// An event from the GATT task to a profile.
            Gatt(GattEvent),
            /// A request from a profile to the GATT task.
            GattReq(GattReq),
            /// Connection loss reported by GAP.
            Disconnect(Disconnect),
            $(
                $( #[$attr] )*
                $variant($ty),
            )*
        }

        $(
            $( #[$attr] )*
            impl PayloadVariant for $ty {
                fn wrap(self) -> Payload {
                    Payload::$variant(self)
                }

                fn unwrap(payload: Payload) -> Result<Self, Payload> {
                    match payload {
                        Payload::$variant(msg) => Ok(msg),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

payloads! {
    #[cfg(feature = "bass")]
    Bass(crate::prf::bass::Message),
    #[cfg(feature = "hrps")]
    Hrps(crate::prf::hrps::Message),
    #[cfg(feature = "cscps")]
    Cscps(crate::prf::cscps::Message),
    #[cfg(feature = "glps")]
    Glps(crate::prf::glps::Message),
    #[cfg(feature = "hogpd")]
    Hogpd(crate::prf::hogpd::Message),
    #[cfg(feature = "tips")]
    Tips(crate::prf::tips::Message),
    #[cfg(feature = "scpps")]
    Scpps(crate::prf::scpps::Message),
    #[cfg(feature = "otas")]
    Otas(crate::prf::otas::Message),
    #[cfg(feature = "anpc")]
    Anpc(crate::prf::anpc::Message),
    #[cfg(feature = "paspc")]
    Paspc(crate::prf::paspc::Message),
    #[cfg(feature = "cscpc")]
    Cscpc(crate::prf::cscpc::Message),
    #[cfg(test)]
    Test(crate::task::tests::Msg),
}

/// A kernel message.
#[derive(Debug)]
pub struct Envelope {
    pub src: TaskId,
    pub dest: TaskId,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(src: TaskId, dest: TaskId, payload: Payload) -> Self {
        Self { src, dest, payload }
    }
}

/// The kernel of the vendor stack.
pub trait Kernel {
    /// Queues a message for delivery.
    fn send(&mut self, msg: Envelope) -> Result<(), Error>;

    /// Returns the current state of `task`.
    fn state(&self, task: TaskId) -> State;

    /// Changes the state of `task`.
    fn set_state(&mut self, task: TaskId, state: State);

    /// Looks up a connection in the GAP connection table.
    ///
    /// Returns `None` if there is no connection with that handle.
    fn connection_index(&self, conhdl: ConHdl) -> Option<ConIdx>;

    /// Takes the next queued message (the scheduler's input).
    fn next(&mut self) -> Option<Envelope>;
}
