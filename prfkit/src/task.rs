//! Profile tasks.
//!
//! A profile is written as a transition function ([`Profile::handle`]): it gets the current
//! state and one inbound [`Event`], and returns a [`Transition`] that either consumes the event
//! (naming the next state and the messages to send) or saves it for later.
//!
//! [`Task`] runs a profile against the kernel. It reads and writes the task state, sends the
//! outbound messages and keeps saved events in a bounded deferred queue. Saved events are
//! replayed, oldest first, as soon as the task leaves `Busy`, and dropped when the task falls
//! back to `Idle` or `Disabled` (the connection they belonged to is gone).
//!
//! [`Profile::handle`]: trait.Profile.html#tymethod.handle
//! [`Event`]: enum.Event.html
//! [`Transition`]: enum.Transition.html
//! [`Task`]: struct.Task.html

use {
    crate::{
        att::{AttributeDb, Status},
        config::{DeferredDepth, OutboxDepth},
        gatt::{Disconnect, GattEvent, GattReq},
        kernel::{
            ConHdl, ConIdx, Envelope, Kernel, Payload, PayloadVariant, State, TaskId, TaskType,
        },
        Error,
    },
    core::fmt,
    heapless::{spsc::Queue, Vec},
};

/// An inbound message, as seen by a profile.
#[derive(Debug)]
pub enum Event<M> {
    /// A message of the profile's own message set (usually from the application).
    Request(M),
    /// An event from GATT.
    Gatt(GattEvent),
    /// A connection was lost.
    Disconnect(Disconnect),
}

impl<M: PayloadVariant> Event<M> {
    /// Extracts an event from a kernel message payload.
    ///
    /// Returns the payload unchanged if it is addressed to a different profile.
    pub fn from_payload(payload: Payload) -> Result<Self, Payload> {
        match payload {
            Payload::Gatt(evt) => Ok(Event::Gatt(evt)),
            Payload::Disconnect(disc) => Ok(Event::Disconnect(disc)),
            other => M::unwrap(other).map(Event::Request),
        }
    }
}

/// A message emitted by a transition.
#[derive(Debug)]
pub enum Outbound<M> {
    /// A message of the profile's message set, to the application or another instance.
    Msg { dest: TaskId, msg: M },
    /// A message passed on to another instance on behalf of its sender.
    Forward { dest: TaskId, msg: M },
    /// A request to GATT.
    Gatt(GattReq),
}

/// Outcome of handling one event.
///
/// An event is either consumed or saved, never both.
#[derive(Debug)]
pub enum Transition<M> {
    Consumed {
        state: State,
        out: Vec<Outbound<M>, OutboxDepth>,
    },
    /// The event can't be handled yet and is handed back for the deferred queue.
    Saved(Event<M>),
}

impl<M: fmt::Debug> Transition<M> {
    /// Consumes the event and moves to `state`.
    pub fn to(state: State) -> Self {
        Transition::Consumed {
            state,
            out: Vec::new(),
        }
    }

    pub fn save(event: Event<M>) -> Self {
        Transition::Saved(event)
    }

    /// Adds an outbound profile message.
    pub fn send(self, dest: TaskId, msg: M) -> Self {
        self.push(Outbound::Msg { dest, msg })
    }

    /// Passes `msg` on to `dest`, which will see it as coming from the original sender.
    pub fn forward(self, dest: TaskId, msg: M) -> Self {
        self.push(Outbound::Forward { dest, msg })
    }

    /// Adds an outbound GATT request.
    pub fn gatt(self, req: GattReq) -> Self {
        self.push(Outbound::Gatt(req))
    }

    /// Adds every message of `other` and takes over its state.
    ///
    /// A saved `other` leaves `self` unchanged.
    pub fn then(self, other: Self) -> Self {
        match other {
            Transition::Consumed { state, mut out } => {
                let mut this = self.with_state(state);
                out.reverse();
                while let Some(msg) = out.pop() {
                    this = this.push(msg);
                }
                this
            }
            Transition::Saved(_) => self,
        }
    }

    /// Replaces the target state.
    pub fn with_state(self, next: State) -> Self {
        match self {
            Transition::Consumed { out, .. } => Transition::Consumed { state: next, out },
            saved => saved,
        }
    }

    /// The target state, or `None` if the event was saved.
    pub fn state(&self) -> Option<State> {
        match self {
            Transition::Consumed { state, .. } => Some(*state),
            Transition::Saved(_) => None,
        }
    }

    fn push(mut self, msg: Outbound<M>) -> Self {
        if let Transition::Consumed { out, .. } = &mut self {
            if let Err(msg) = out.push(msg) {
                error!("outbox full, dropping {:?}", msg);
            }
        }
        self
    }
}

/// What a profile can reach while handling an event.
pub struct Context<'a> {
    id: TaskId,
    src: TaskId,
    /// The attribute database.
    pub db: &'a mut dyn AttributeDb,
    kernel: &'a dyn Kernel,
}

impl<'a> Context<'a> {
    pub fn new(
        id: TaskId,
        src: TaskId,
        db: &'a mut dyn AttributeDb,
        kernel: &'a dyn Kernel,
    ) -> Self {
        Self {
            id,
            src,
            db,
            kernel,
        }
    }

    /// The task instance handling the event.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The sender of the event.
    pub fn src(&self) -> TaskId {
        self.src
    }

    /// Looks up `conhdl` in the GAP connection table.
    pub fn connection_index(&self, conhdl: ConHdl) -> Option<ConIdx> {
        self.kernel.connection_index(conhdl)
    }

    pub fn is_connected(&self, conhdl: ConHdl) -> bool {
        self.connection_index(conhdl).is_some()
    }

    /// The state of another task instance.
    pub fn state_of(&self, task: TaskId) -> State {
        self.kernel.state(task)
    }
}

/// A profile role, written as a transition function.
pub trait Profile {
    /// The profile's message set: requests from and confirmations to the application.
    type Message: PayloadVariant + fmt::Debug;

    const TYPE: TaskType;

    /// Handles `event` in `state`.
    fn handle(
        &mut self,
        state: State,
        event: Event<Self::Message>,
        ctx: &mut Context<'_>,
    ) -> Transition<Self::Message>;

    /// Answers an event that was saved while the deferred queue had no room left.
    ///
    /// Profiles that save events reply to the sender with `status` here. Returning
    /// `Transition::Saved` drops the event and makes [`Task::process`] fail with `QueueFull`.
    ///
    /// [`Task::process`]: struct.Task.html#method.process
    fn refuse(
        &mut self,
        state: State,
        event: Event<Self::Message>,
        status: Status,
        ctx: &mut Context<'_>,
    ) -> Transition<Self::Message> {
        let _ = (state, status, ctx);
        Transition::save(event)
    }
}

struct Deferred<M> {
    src: TaskId,
    event: Event<M>,
}

/// A profile task instance.
pub struct Task<P: Profile> {
    id: TaskId,
    profile: P,
    deferred: Queue<Deferred<P::Message>, DeferredDepth>,
}

impl<P: Profile> Task<P> {
    /// Creates instance `index` of the profile's task.
    pub fn new(index: u8, profile: P) -> Self {
        Self {
            id: TaskId::new(P::TYPE, index),
            profile,
            deferred: Queue::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn profile(&self) -> &P {
        &self.profile
    }

    /// Number of saved events waiting for replay.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Handles one kernel message, then replays saved events if the task is no longer busy.
    pub fn process(
        &mut self,
        env: Envelope,
        db: &mut dyn AttributeDb,
        kernel: &mut dyn Kernel,
    ) -> Result<(), Error> {
        let event = match Event::from_payload(env.payload) {
            Ok(event) => event,
            Err(payload) => {
                warn!("{:?}: dropping foreign message {:?}", self.id, payload);
                return Ok(());
            }
        };

        self.run(env.src, event, db, kernel)?;
        self.replay(db, kernel)
    }

    fn run(
        &mut self,
        src: TaskId,
        event: Event<P::Message>,
        db: &mut dyn AttributeDb,
        kernel: &mut dyn Kernel,
    ) -> Result<(), Error> {
        let state = kernel.state(self.id);
        trace!("{:?} in {:?} <- {:?}: {:?}", self.id, state, src, event);

        let transition = {
            let mut ctx = Context::new(self.id, src, &mut *db, &*kernel);
            self.profile.handle(state, event, &mut ctx)
        };

        let (next, mut out) = match transition {
            Transition::Consumed { state, out } => (state, out),
            Transition::Saved(event) => {
                debug!("{:?}: saving {:?}", self.id, event);
                let rejected = match self.deferred.enqueue(Deferred { src, event }) {
                    Ok(()) => return Ok(()),
                    Err(rejected) => rejected.event,
                };

                warn!("{:?}: deferred queue full, refusing {:?}", self.id, rejected);
                let mut ctx = Context::new(self.id, src, &mut *db, &*kernel);
                let status = Status::InsufficientResources;
                match self.profile.refuse(state, rejected, status, &mut ctx) {
                    Transition::Consumed { state, out } => (state, out),
                    Transition::Saved(event) => {
                        error!("{:?}: dropping {:?}", self.id, event);
                        return Err(Error::QueueFull);
                    }
                }
            }
        };

        if next != state {
            debug!("{:?}: {:?} -> {:?}", self.id, state, next);
            kernel.set_state(self.id, next);
        }

        if next <= State::Idle && !self.deferred.is_empty() {
            debug!("{:?}: discarding {} saved events", self.id, self.deferred.len());
            while self.deferred.dequeue().is_some() {}
        }

        // Popping from the back, so reverse first to keep the order of emission.
        out.reverse();
        while let Some(msg) = out.pop() {
            let env = match msg {
                Outbound::Msg { dest, msg } => Envelope::new(self.id, dest, msg.wrap()),
                Outbound::Forward { dest, msg } => Envelope::new(src, dest, msg.wrap()),
                Outbound::Gatt(req) => Envelope::new(self.id, TaskId::GATT, Payload::GattReq(req)),
            };
            kernel.send(env)?;
        }
        Ok(())
    }

    fn replay(&mut self, db: &mut dyn AttributeDb, kernel: &mut dyn Kernel) -> Result<(), Error> {
        // Only the events saved so far; anything saved again during replay waits for the next
        // completion.
        let pending = self.deferred.len();
        for _ in 0..pending {
            if kernel.state(self.id) == State::Busy {
                break;
            }
            match self.deferred.dequeue() {
                Some(saved) => self.run(saved.src, saved.event, db, kernel)?,
                None => break,
            }
        }
        Ok(())
    }
}

/// Object-safe view of a [`Task`], used by the dispatcher to hold tasks of different profiles.
///
/// [`Task`]: struct.Task.html
pub trait TaskObj {
    fn id(&self) -> TaskId;

    fn process(
        &mut self,
        env: Envelope,
        db: &mut dyn AttributeDb,
        kernel: &mut dyn Kernel,
    ) -> Result<(), Error>;
}

impl<P: Profile> TaskObj for Task<P> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn process(
        &mut self,
        env: Envelope,
        db: &mut dyn AttributeDb,
        kernel: &mut dyn Kernel,
    ) -> Result<(), Error> {
        Task::process(self, env, db, kernel)
    }
}
