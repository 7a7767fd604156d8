//! Routing of kernel messages between profile tasks and the application.
//!
//! The [`Dispatcher`] owns the platform services and borrows the registered task instances. It
//! does no protocol work itself:
//!
//! * Messages for a task instance are handed to that instance.
//! * Messages for the application are handed to the [`AppHandler`] registered for the sending
//!   task's type, or to the default handler.
//! * Disconnection events are handed to every task instance and to the default handler.
//!
//! [`Dispatcher`]: struct.Dispatcher.html
//! [`AppHandler`]: trait.AppHandler.html

use {
    crate::{
        config::{Config, MaxTasks},
        kernel::{Envelope, Kernel, Payload, State, TaskId, TaskType},
        task::TaskObj,
        Error,
    },
    heapless::Vec,
};

/// Application-side handler for messages coming from the profile tasks.
pub trait AppHandler {
    /// Handles one message. Replies go out through `kernel`.
    fn handle(&mut self, msg: Envelope, kernel: &mut dyn Kernel);
}

/// Application handler that logs and drops everything it receives.
pub struct Unhandled;

impl AppHandler for Unhandled {
    fn handle(&mut self, msg: Envelope, _: &mut dyn Kernel) {
        debug!("unhandled message from {:?}: {:?}", msg.src, msg.payload);
    }
}

/// Message router and main loop.
pub struct Dispatcher<'a, C: Config> {
    db: C::Db,
    kernel: C::Kernel,
    tasks: Vec<&'a mut dyn TaskObj, MaxTasks>,
    apps: Vec<(TaskType, &'a mut dyn AppHandler), MaxTasks>,
    default_app: &'a mut dyn AppHandler,
}

impl<'a, C: Config> Dispatcher<'a, C> {
    pub fn new(db: C::Db, kernel: C::Kernel, default_app: &'a mut dyn AppHandler) -> Self {
        Self {
            db,
            kernel,
            tasks: Vec::new(),
            apps: Vec::new(),
            default_app,
        }
    }

    /// Adds a task instance and puts it into the `Disabled` state.
    pub fn register(&mut self, task: &'a mut dyn TaskObj) -> Result<(), Error> {
        let id = task.id();
        if self.tasks.iter().any(|t| t.id() == id) {
            return Err(Error::InvalidValue);
        }
        self.tasks.push(task).map_err(|_| Error::QueueFull)?;
        self.kernel.set_state(id, State::Disabled);
        Ok(())
    }

    /// Routes messages from tasks of type `ty` to `handler`.
    pub fn register_app(
        &mut self,
        ty: TaskType,
        handler: &'a mut dyn AppHandler,
    ) -> Result<(), Error> {
        self.apps.push((ty, handler)).map_err(|_| Error::QueueFull)
    }

    /// Puts every registered task back into the `Disabled` state.
    pub fn init(&mut self) {
        for task in self.tasks.iter() {
            self.kernel.set_state(task.id(), State::Disabled);
        }
    }

    /// Delivers one message.
    pub fn deliver(&mut self, env: Envelope) -> Result<(), Error> {
        if let Payload::Disconnect(disc) = env.payload {
            debug!("broadcasting {:?}", disc);
            // Every task sees the disconnection even if an earlier one failed; the first error
            // is reported once all have run.
            let mut result = Ok(());
            for task in self.tasks.iter_mut() {
                let copy = Envelope::new(env.src, task.id(), Payload::Disconnect(disc));
                if let Err(e) = task.process(copy, &mut self.db, &mut self.kernel) {
                    error!("{:?}: handling {:?} failed: {:?}", task.id(), disc, e);
                    result = result.and(Err(e));
                }
            }
            self.default_app.handle(env, &mut self.kernel);
            return result;
        }

        if env.dest == TaskId::APP {
            let ty = env.src.task_type();
            match self.apps.iter_mut().find(|(t, _)| *t == ty) {
                Some((_, app)) => app.handle(env, &mut self.kernel),
                None => self.default_app.handle(env, &mut self.kernel),
            }
            return Ok(());
        }

        match self.tasks.iter_mut().find(|t| t.id() == env.dest) {
            Some(task) => task.process(env, &mut self.db, &mut self.kernel),
            None => {
                warn!("no task {:?}, dropping {:?}", env.dest, env.payload);
                Ok(())
            }
        }
    }

    /// Delivers queued messages until the kernel has none left.
    ///
    /// Returns the number of messages delivered.
    pub fn schedule(&mut self) -> Result<usize, Error> {
        let mut delivered = 0;
        while let Some(env) = self.kernel.next() {
            self.deliver(env)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Queues a message, as the application would.
    pub fn post(&mut self, env: Envelope) -> Result<(), Error> {
        self.kernel.send(env)
    }

    pub fn db(&self) -> &C::Db {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut C::Db {
        &mut self.db
    }

    pub fn kernel(&self) -> &C::Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut C::Kernel {
        &mut self.kernel
    }
}

#[cfg(all(test, feature = "bass"))]
mod tests {
    use super::*;
    use crate::{
        att::{PermRight, Status},
        gatt::GattReq,
        kernel::PayloadVariant,
        prf::{
            bass::{self, Bass, CreateDb, Enable, Features},
            CharPresFmt, ConType, CCCD_NTF,
        },
        sim::{MemoryDb, MemoryKernel, SimConfig},
        task::Task,
    };

    /// Records what the application receives.
    #[derive(Default)]
    struct Recorder {
        seen: std::vec::Vec<Payload>,
    }

    impl AppHandler for Recorder {
        fn handle(&mut self, msg: Envelope, _: &mut dyn Kernel) {
            self.seen.push(msg.payload);
        }
    }

    fn bass_task() -> TaskId {
        TaskId::new(TaskType::Bass, 0)
    }

    fn post(kernel: &mut MemoryKernel, msg: bass::Message) {
        kernel
            .send(Envelope::new(TaskId::APP, bass_task(), msg.wrap()))
            .unwrap();
    }

    #[test]
    fn battery_session() {
        let mut task = Task::new(0, Bass::new());
        let mut battery_app = Recorder::default();
        let mut fallback = Recorder::default();
        {
            let mut kernel = MemoryKernel::new();
            kernel.connect(0x0001);
            let mut dispatcher: Dispatcher<'_, SimConfig> =
                Dispatcher::new(MemoryDb::new(), kernel, &mut fallback);
            dispatcher.register(&mut task).unwrap();
            dispatcher
                .register_app(TaskType::Bass, &mut battery_app)
                .unwrap();
            dispatcher.init();

            post(
                dispatcher.kernel_mut(),
                bass::Message::CreateDb(CreateDb {
                    bas_nb: 1,
                    features: [Features::LEVEL_NTF_SUP, Features::empty()],
                }),
            );
            post(
                dispatcher.kernel_mut(),
                bass::Message::Enable(Enable {
                    conhdl: 0x0001,
                    sec_lvl: PermRight::Enabled,
                    con_type: ConType::Normal,
                    ntf_cfg: [CCCD_NTF, 0],
                    old_level: [40, 0],
                    current_level: [50, 0],
                    pres_fmt: [CharPresFmt::default(); 2],
                }),
            );
            // CreateDb, its confirmation, Enable.
            assert_eq!(dispatcher.schedule(), Ok(3));
            assert_eq!(dispatcher.kernel().state(bass_task()), State::Connected);

            match dispatcher.kernel_mut().next_gatt() {
                Some((src, GattReq::Notify { conhdl, .. })) => {
                    assert_eq!(src, bass_task());
                    assert_eq!(conhdl, 0x0001);
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(dispatcher.kernel_mut().next_gatt().is_none());

            dispatcher.kernel_mut().disconnect(0x0001, 0x13).unwrap();
            // The disconnection event and the resulting disable indication.
            assert_eq!(dispatcher.schedule(), Ok(2));
            assert_eq!(dispatcher.kernel().state(bass_task()), State::Idle);
        }

        assert!(matches!(
            battery_app.seen[0],
            Payload::Bass(bass::Message::CreateDbCfm { status: Status::Ok })
        ));
        assert!(matches!(
            battery_app.seen[1],
            Payload::Bass(bass::Message::DisableInd { conhdl: 0x0001, .. })
        ));
        assert_eq!(battery_app.seen.len(), 2);
        // The fallback handler sees the disconnection itself.
        assert_eq!(fallback.seen.len(), 1);
    }

    #[test]
    fn duplicate_registration() {
        let mut first = Task::new(0, Bass::new());
        let mut second = Task::new(0, Bass::new());
        let mut app = Unhandled;
        let mut dispatcher: Dispatcher<'_, SimConfig> =
            Dispatcher::new(MemoryDb::new(), MemoryKernel::new(), &mut app);
        dispatcher.register(&mut first).unwrap();
        assert_eq!(dispatcher.register(&mut second), Err(Error::InvalidValue));
    }

    #[test]
    fn unknown_destination_is_dropped() {
        let mut app = Unhandled;
        let mut dispatcher: Dispatcher<'_, SimConfig> =
            Dispatcher::new(MemoryDb::new(), MemoryKernel::new(), &mut app);
        post(dispatcher.kernel_mut(), bass::Message::Disable { conhdl: 1 });
        assert_eq!(dispatcher.schedule(), Ok(1));
        assert_eq!(dispatcher.kernel().pending(), 0);
    }
}
