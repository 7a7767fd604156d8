//! Battery Service server.
//!
//! Hosts up to [`MAX_INSTANCES`] Battery Services. Each instance has a Battery Level
//! characteristic, a client configuration descriptor when notifications are supported, and a
//! presentation format descriptor when there is more than one instance.
//!
//! [`MAX_INSTANCES`]: constant.MAX_INSTANCES.html

use {
    crate::{
        att::{
            to_value, AttHandle, AttributeDesc, PermRight, Permissions, Properties, ServiceLayout,
            Status,
        },
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskType},
        prf::{
            decode_cccd, set_services_permission, write_cccd, Attachment, CharPresFmt, ConType,
            CCCD_NTF, CCCD_STOP,
        },
        task::{Context, Event, Profile, Transition},
        uuid::decl,
    },
    bitflags::bitflags,
    heapless::{consts::U2, Vec},
};

/// Maximum number of Battery Service instances.
pub const MAX_INSTANCES: usize = 2;

/// Highest valid battery level, in percent.
pub const LEVEL_MAX: u8 = 100;

const IDX_SVC: usize = 0;
const IDX_LVL_CHAR: usize = 1;
const IDX_LVL_VAL: usize = 2;
const IDX_LVL_NTF_CFG: usize = 3;
const IDX_LVL_PRES_FMT: usize = 4;

fn att_table() -> [AttributeDesc; 5] {
    [
        AttributeDesc::service(0x180F),
        AttributeDesc::characteristic(0x2A19, Properties::READ),
        AttributeDesc::value(0x2A19, Permissions::READ, 1),
        AttributeDesc::cccd(),
        AttributeDesc::descriptor(decl::CHAR_PRES_FMT, Permissions::READ, 7),
    ]
}

bitflags! {
    /// Optional features of one Battery Service instance.
    pub struct Features: u8 {
        /// The Battery Level characteristic supports notifications.
        const LEVEL_NTF_SUP = 0x01;
    }
}

/// Parameters of [`Message::CreateDb`].
///
/// [`Message::CreateDb`]: enum.Message.html#variant.CreateDb
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDb {
    /// Number of instances to create, `1..=MAX_INSTANCES`.
    pub bas_nb: u8,
    pub features: [Features; MAX_INSTANCES],
}

/// Parameters of [`Message::Enable`].
///
/// [`Message::Enable`]: enum.Message.html#variant.Enable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enable {
    pub conhdl: ConHdl,
    pub sec_lvl: PermRight,
    pub con_type: ConType,
    /// Client configuration of each instance, as last written by a bonded peer.
    pub ntf_cfg: [u16; MAX_INSTANCES],
    /// Battery levels known to a bonded peer.
    pub old_level: [u8; MAX_INSTANCES],
    pub current_level: [u8; MAX_INSTANCES],
    pub pres_fmt: [CharPresFmt; MAX_INSTANCES],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Adds the services to the database.
    CreateDb(CreateDb),
    CreateDbCfm {
        status: Status,
    },
    /// Attaches the profile to a connection.
    Enable(Enable),
    /// Detaches the profile from its connection.
    Disable {
        conhdl: ConHdl,
    },
    /// The profile was detached; carries the client configuration to keep for a bonded peer.
    DisableInd {
        conhdl: ConHdl,
        ntf_cfg: [u16; MAX_INSTANCES],
    },
    /// Stores a new battery level and notifies it if the peer asked for it.
    UpdateLevel {
        conhdl: ConHdl,
        instance: u8,
        level: u8,
    },
    UpdateLevelCfm {
        conhdl: ConHdl,
        status: Status,
    },
    /// The peer changed the client configuration of an instance.
    NtfCfgInd {
        conhdl: ConHdl,
        instance: u8,
        ntf_cfg: u16,
    },
    ErrorInd {
        conhdl: ConHdl,
        status: Status,
    },
}

#[derive(Debug)]
struct Instance {
    layout: ServiceLayout,
    ntf: bool,
}

impl Instance {
    fn level(&self) -> Option<AttHandle> {
        self.layout.handle(IDX_LVL_VAL)
    }

    fn ntf_cfg(&self) -> Option<AttHandle> {
        self.layout.handle(IDX_LVL_NTF_CFG)
    }
}

/// Battery Service server role.
pub struct Bass {
    con: Attachment,
    instances: Vec<Instance, U2>,
}

impl Bass {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            instances: Vec::new(),
        }
    }

    /// Handle of the Battery Level value of `instance`.
    pub fn level_handle(&self, instance: usize) -> Option<AttHandle> {
        self.instances.get(instance).and_then(Instance::level)
    }

    /// Handle of the client configuration descriptor of `instance`.
    pub fn ntf_cfg_handle(&self, instance: usize) -> Option<AttHandle> {
        self.instances.get(instance).and_then(Instance::ntf_cfg)
    }

    /// Handle of the presentation format descriptor of `instance`.
    pub fn pres_fmt_handle(&self, instance: usize) -> Option<AttHandle> {
        self.instances
            .get(instance)
            .and_then(|inst| inst.layout.handle(IDX_LVL_PRES_FMT))
    }

    pub fn service_handle(&self, instance: usize) -> Option<AttHandle> {
        self.instances.get(instance).map(|inst| inst.layout.start())
    }

    /// Whether the peer enabled notifications for `instance`.
    pub fn ntf_enabled(&self, instance: usize) -> bool {
        self.instances.get(instance).map_or(false, |inst| inst.ntf)
    }

    fn create_db(&mut self, params: &CreateDb, ctx: &mut Context<'_>) -> Result<(), Status> {
        let bas_nb = usize::from(params.bas_nb);
        if bas_nb == 0 || bas_nb > MAX_INSTANCES {
            return Err(Status::InvalidParam);
        }

        let mut instances = Vec::new();
        for &features in &params.features[..bas_nb] {
            let mut table = att_table();
            let mut cfg = crate::att::cfg_mask(&[IDX_SVC, IDX_LVL_CHAR, IDX_LVL_VAL]);
            if features.contains(Features::LEVEL_NTF_SUP) {
                cfg |= 1 << IDX_LVL_NTF_CFG;
                table[IDX_LVL_CHAR] = table[IDX_LVL_CHAR].with_props(Properties::NOTIFY);
                table[IDX_LVL_VAL] = table[IDX_LVL_VAL].with_perm(Permissions::NOTIFY);
            }
            if bas_nb > 1 {
                cfg |= 1 << IDX_LVL_PRES_FMT;
            }

            let layout = ctx.db.create_db(&table, cfg, ctx.id())?;
            ctx.db.set_permission(layout.start(), PermRight::Disabled)?;
            let instance = Instance { layout, ntf: false };
            instances
                .push(instance)
                .map_err(|_| Status::InsufficientResources)?;
        }
        self.instances = instances;
        Ok(())
    }

    /// Applies the enable parameters to the database. Returns the level handles to notify.
    fn apply_enable(
        &mut self,
        params: &Enable,
        ctx: &mut Context<'_>,
    ) -> Result<Vec<AttHandle, U2>, Status> {
        let multiple = self.instances.len() > 1;
        let mut notify = Vec::new();
        for (i, inst) in self.instances.iter_mut().enumerate() {
            let level = inst.level().ok_or(Status::InexistentHandle)?;
            ctx.db.set_value(level, &[params.current_level[i]])?;

            if let Some(ntf_cfg) = inst.ntf_cfg() {
                let mut cfg = CCCD_STOP;
                if params.con_type == ConType::Normal {
                    cfg = params.ntf_cfg[i];
                    if cfg == CCCD_NTF {
                        inst.ntf = true;
                        // A bonded peer gets the level if it changed while it was away.
                        if params.old_level[i] != params.current_level[i] {
                            let _ = notify.push(level);
                        }
                    }
                }
                write_cccd(ctx.db, ntf_cfg, cfg)?;
            }

            if multiple {
                if let Some(pres_fmt) = inst.layout.handle(IDX_LVL_PRES_FMT) {
                    let value = to_value(&params.pres_fmt[i])?;
                    ctx.db.set_value(pres_fmt, &value)?;
                }
            }

            ctx.db.set_permission(inst.layout.start(), params.sec_lvl)?;
        }
        Ok(notify)
    }

    fn enable(&mut self, params: Enable, ctx: &mut Context<'_>) -> Transition<Message> {
        let conhdl = params.conhdl;
        if !ctx.is_connected(conhdl) {
            warn!("bass: enable for unknown connection {:#06x}", conhdl);
            return Transition::to(State::Idle).send(
                ctx.src(),
                Message::ErrorInd {
                    conhdl,
                    status: Status::ReqDisallowed,
                },
            );
        }

        match self.apply_enable(&params, ctx) {
            Ok(notify) => {
                self.con.attach(conhdl, ctx.src());
                notify
                    .iter()
                    .fold(Transition::to(State::Connected), |t, &handle| {
                        t.gatt(GattReq::Notify { conhdl, handle })
                    })
            }
            Err(status) => {
                error!("bass: enable failed: {:?}", status);
                for inst in self.instances.iter_mut() {
                    inst.ntf = false;
                }
                Transition::to(State::Idle).send(ctx.src(), Message::ErrorInd { conhdl, status })
            }
        }
    }

    fn update_level(
        &mut self,
        conhdl: ConHdl,
        instance: u8,
        level: u8,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let inst = match self.instances.get(usize::from(instance)) {
            Some(inst) if self.con.owns(conhdl) && level <= LEVEL_MAX => inst,
            _ => {
                return Transition::to(State::Connected).send(
                    self.con.app(),
                    Message::UpdateLevelCfm {
                        conhdl,
                        status: Status::InvalidParam,
                    },
                )
            }
        };

        let result = inst
            .level()
            .ok_or(Status::InexistentHandle)
            .and_then(|handle| ctx.db.set_value(handle, &[level]).map(|()| handle));
        match result {
            Ok(handle) if inst.ntf => {
                Transition::to(State::Connected).gatt(GattReq::Notify { conhdl, handle })
            }
            Ok(_) => Transition::to(State::Connected).send(
                self.con.app(),
                Message::UpdateLevelCfm {
                    conhdl,
                    status: Status::NtfDisabled,
                },
            ),
            Err(status) => Transition::to(State::Connected)
                .send(self.con.app(), Message::UpdateLevelCfm { conhdl, status }),
        }
    }

    fn write(
        &mut self,
        handle: AttHandle,
        value: &[u8],
        last: bool,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let conhdl = match self.con.conhdl() {
            Some(conhdl) => conhdl,
            None => return Transition::to(State::Connected),
        };
        let app = self.con.app();
        let found = self
            .instances
            .iter_mut()
            .enumerate()
            .find(|(_, inst)| inst.ntf_cfg() == Some(handle));
        let (instance, inst) = match found {
            Some(found) => found,
            None => {
                debug!("bass: write to unhandled attribute {:?}", handle);
                return Transition::to(State::Connected);
            }
        };

        let mut t = Transition::to(State::Connected);
        let status = match decode_cccd(value, CCCD_NTF) {
            Ok(cfg) => match write_cccd(ctx.db, handle, cfg) {
                Ok(()) => {
                    inst.ntf = cfg == CCCD_NTF;
                    if last {
                        t = t.send(
                            app,
                            Message::NtfCfgInd {
                                conhdl,
                                instance: instance as u8,
                                ntf_cfg: cfg,
                            },
                        );
                    }
                    Status::Ok
                }
                Err(status) => status,
            },
            Err(status) => status,
        };
        t.gatt(GattReq::WriteRsp {
            conhdl,
            handle,
            status,
        })
    }

    /// Reports the client configuration, hides the services and detaches from the connection.
    fn disable(&mut self, ctx: &mut Context<'_>) -> Transition<Message> {
        let con = match self.con.detach() {
            Some(con) => con,
            None => return Transition::to(State::Idle),
        };

        let mut ntf_cfg = [CCCD_STOP; MAX_INSTANCES];
        for (cfg, inst) in ntf_cfg.iter_mut().zip(self.instances.iter_mut()) {
            if inst.ntf {
                *cfg = CCCD_NTF;
            }
            inst.ntf = false;
        }

        let mut services: Vec<AttHandle, U2> = Vec::new();
        for inst in self.instances.iter() {
            let _ = services.push(inst.layout.start());
        }
        if let Err(status) = set_services_permission(ctx.db, &services, PermRight::Disabled) {
            warn!("bass: failed to hide services: {:?}", status);
        }

        info!("bass: disabled on {:#06x}", con.conhdl);
        Transition::to(State::Idle).send(
            con.app,
            Message::DisableInd {
                conhdl: con.conhdl,
                ntf_cfg,
            },
        )
    }

    fn request(
        &mut self,
        state: State,
        msg: Message,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        match (state, msg) {
            (State::Disabled, Message::CreateDb(params)) => {
                self.con.set_app(ctx.src());
                let (next, status) = match self.create_db(&params, ctx) {
                    Ok(()) => (State::Idle, Status::Ok),
                    Err(status) => {
                        warn!("bass: create_db failed: {:?}", status);
                        (State::Disabled, status)
                    }
                };
                Transition::to(next).send(ctx.src(), Message::CreateDbCfm { status })
            }
            (state, Message::CreateDb(_)) => Transition::to(state).send(
                ctx.src(),
                Message::CreateDbCfm {
                    status: Status::ReqDisallowed,
                },
            ),

            (State::Idle, Message::Enable(params)) => self.enable(params, ctx),

            (State::Connected, Message::UpdateLevel {
                conhdl,
                instance,
                level,
            }) => self.update_level(conhdl, instance, level, ctx),
            (state, Message::UpdateLevel { conhdl, .. }) => Transition::to(state).send(
                ctx.src(),
                Message::UpdateLevelCfm {
                    conhdl,
                    status: Status::ReqDisallowed,
                },
            ),

            (State::Connected, Message::Disable { conhdl }) if self.con.owns(conhdl) => {
                self.disable(ctx)
            }

            (state, Message::Enable(Enable { conhdl, .. }))
            | (state, Message::Disable { conhdl }) => {
                Transition::to(state).send(
                    ctx.src(),
                    Message::ErrorInd {
                        conhdl,
                        status: Status::ReqDisallowed,
                    },
                )
            }

            (state, msg) => {
                debug!("bass: ignoring {:?} in {:?}", msg, state);
                Transition::to(state)
            }
        }
    }
}

impl Default for Bass {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Bass {
    type Message = Message;
    const TYPE: TaskType = TaskType::Bass;

    fn handle(
        &mut self,
        state: State,
        event: Event<Message>,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        match event {
            Event::Request(msg) => self.request(state, msg, ctx),
            Event::Gatt(evt) if state == State::Connected && self.con.owns(evt.conhdl()) => {
                match evt {
                    GattEvent::Write {
                        handle,
                        value,
                        last,
                        ..
                    } => self.write(handle, &value, last, ctx),
                    GattEvent::NotifyCmp { conhdl, status, .. } => Transition::to(State::Connected)
                        .send(self.con.app(), Message::UpdateLevelCfm { conhdl, status }),
                    other => {
                        debug!("bass: ignoring {:?}", other);
                        Transition::to(state)
                    }
                }
            }
            Event::Gatt(evt) => {
                debug!("bass: dropping {:?} in {:?}", evt, state);
                Transition::to(state)
            }
            Event::Disconnect(disc) if state >= State::Connected && self.con.owns(disc.conhdl) => {
                self.disable(ctx)
            }
            Event::Disconnect(_) => Transition::to(state),
        }
    }
}
