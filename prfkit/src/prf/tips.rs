//! Time server: Current Time Service, plus the optional Next DST Change and Reference Time
//! Update services.
//!
//! There is one task instance per connection index, all serving the same attributes. The
//! instance receiving `CreateDb` creates the services and hands their layout to its siblings
//! with `DbCreated`. Every instance then serves only the connection at its own index.

use {
    crate::{
        att::{
            to_value, AttHandle, AttributeDesc, PermRight, Permissions, Properties, ServiceLayout,
            Status,
        },
        bytes::*,
        config::MAX_CONNECTIONS,
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskId, TaskType},
        prf::{
            set_services_permission, store_cccd, write_cccd, Attachment, ConType, DateTime,
            CCCD_NTF, CCCD_STOP,
        },
        task::{Context, Event, Profile, Transition},
        Error,
    },
    bitflags::bitflags,
};

const CTS_IDX_SVC: usize = 0;
const CTS_IDX_CURR_TIME_CHAR: usize = 1;
const CTS_IDX_CURR_TIME_VAL: usize = 2;
const CTS_IDX_CURR_TIME_CFG: usize = 3;
const CTS_IDX_LOC_TIME_INFO_CHAR: usize = 4;
const CTS_IDX_LOC_TIME_INFO_VAL: usize = 5;
const CTS_IDX_REF_TIME_INFO_CHAR: usize = 6;
const CTS_IDX_REF_TIME_INFO_VAL: usize = 7;

fn cts_table() -> [AttributeDesc; 8] {
    [
        AttributeDesc::service(0x1805),
        AttributeDesc::characteristic(0x2A2B, Properties::READ | Properties::NOTIFY),
        AttributeDesc::value(
            0x2A2B,
            Permissions::READ | Permissions::NOTIFY,
            CurrTime::SIZE as u16,
        ),
        AttributeDesc::cccd(),
        AttributeDesc::characteristic(0x2A0F, Properties::READ),
        AttributeDesc::value(0x2A0F, Permissions::READ, 2),
        AttributeDesc::characteristic(0x2A14, Properties::READ),
        AttributeDesc::value(0x2A14, Permissions::READ, 4),
    ]
}

const NDCS_IDX_SVC: usize = 0;
const NDCS_IDX_TIME_DST_CHAR: usize = 1;
const NDCS_IDX_TIME_DST_VAL: usize = 2;

fn ndcs_table() -> [AttributeDesc; 3] {
    [
        AttributeDesc::service(0x1807),
        AttributeDesc::characteristic(0x2A11, Properties::READ),
        AttributeDesc::value(0x2A11, Permissions::READ, 8),
    ]
}

const RTUS_IDX_SVC: usize = 0;
const RTUS_IDX_CTNL_PT_CHAR: usize = 1;
const RTUS_IDX_CTNL_PT_VAL: usize = 2;
const RTUS_IDX_STATE_CHAR: usize = 3;
const RTUS_IDX_STATE_VAL: usize = 4;

fn rtus_table() -> [AttributeDesc; 5] {
    [
        AttributeDesc::service(0x1806),
        AttributeDesc::characteristic(0x2A16, Properties::WRITE_NO_RSP),
        AttributeDesc::value(0x2A16, Permissions::WRITE_NO_RSP, 1),
        AttributeDesc::characteristic(0x2A17, Properties::READ),
        AttributeDesc::value(0x2A17, Permissions::READ, 2),
    ]
}

bitflags! {
    pub struct Features: u8 {
        const LOC_TIME_INFO = 0x01;
        const REF_TIME_INFO = 0x02;
        /// Next DST Change Service.
        const NDCS = 0x04;
        /// Reference Time Update Service.
        const RTUS = 0x08;
    }
}

/// Current Time characteristic value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CurrTime {
    pub date_time: DateTime,
    /// 1 (Monday) to 7, 0 if unknown.
    pub day_of_week: u8,
    pub fraction_256: u8,
    pub adjust_reason: u8,
}

impl CurrTime {
    pub const SIZE: usize = DateTime::SIZE + 3;
}

impl ToBytes for CurrTime {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        self.date_time.to_bytes(writer)?;
        writer.write_slice(&[self.day_of_week, self.fraction_256, self.adjust_reason])
    }
}

impl FromBytes<'_> for CurrTime {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let date_time = DateTime::from_bytes(bytes)?;
        let [day_of_week, fraction_256, adjust_reason]: [u8; 3] = bytes.read_array()?;
        Ok(Self {
            date_time,
            day_of_week,
            fraction_256,
            adjust_reason,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct LocalTimeInfo {
    /// Offset from UTC in 15 minute steps.
    pub time_zone: i8,
    pub dst_offset: u8,
}

impl ToBytes for LocalTimeInfo {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_i8(self.time_zone)?;
        writer.write_u8(self.dst_offset)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RefTimeInfo {
    pub time_source: u8,
    pub time_accuracy: u8,
    pub days_since_update: u8,
    pub hours_since_update: u8,
}

impl ToBytes for RefTimeInfo {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&[
            self.time_source,
            self.time_accuracy,
            self.days_since_update,
            self.hours_since_update,
        ])
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct TimeWithDst {
    pub date_time: DateTime,
    pub dst_offset: u8,
}

impl ToBytes for TimeWithDst {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        self.date_time.to_bytes(writer)?;
        writer.write_u8(self.dst_offset)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct TimeUpdState {
    pub current_state: u8,
    pub result: u8,
}

impl ToBytes for TimeUpdState {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.current_state)?;
        writer.write_u8(self.result)
    }
}

enum_with_unknown! {
    /// Time Update Control Point commands.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum TimeUpdCtnlPt(u8) {
        GetRefUpdate = 1,
        CancelRefUpdate = 2,
    }
}

/// A read-only characteristic value the application keeps current.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Info {
    LocalTimeInfo(LocalTimeInfo),
    RefTimeInfo(RefTimeInfo),
    TimeWithDst(TimeWithDst),
    TimeUpdState(TimeUpdState),
}

/// The created services. Shared by all instances.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Services {
    pub cts: ServiceLayout,
    pub ndcs: Option<ServiceLayout>,
    pub rtus: Option<ServiceLayout>,
}

impl Services {
    fn starts(&self) -> [AttHandle; 3] {
        let start = |svc: Option<ServiceLayout>| svc.map_or(AttHandle::NULL, |l| l.start());
        [self.cts.start(), start(self.ndcs), start(self.rtus)]
    }

    pub fn curr_time(&self) -> Option<AttHandle> {
        self.cts.handle(CTS_IDX_CURR_TIME_VAL)
    }

    pub fn curr_time_cfg(&self) -> Option<AttHandle> {
        self.cts.handle(CTS_IDX_CURR_TIME_CFG)
    }

    pub fn ctnl_pt(&self) -> Option<AttHandle> {
        self.rtus.and_then(|l| l.handle(RTUS_IDX_CTNL_PT_VAL))
    }

    /// Handle of the characteristic `info` is stored in.
    pub fn info(&self, info: &Info) -> Option<AttHandle> {
        match info {
            Info::LocalTimeInfo(_) => self.cts.handle(CTS_IDX_LOC_TIME_INFO_VAL),
            Info::RefTimeInfo(_) => self.cts.handle(CTS_IDX_REF_TIME_INFO_VAL),
            Info::TimeWithDst(_) => self.ndcs.and_then(|l| l.handle(NDCS_IDX_TIME_DST_VAL)),
            Info::TimeUpdState(_) => self.rtus.and_then(|l| l.handle(RTUS_IDX_STATE_VAL)),
        }
    }
}

impl ToBytes for Info {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match self {
            Info::LocalTimeInfo(v) => v.to_bytes(writer),
            Info::RefTimeInfo(v) => v.to_bytes(writer),
            Info::TimeWithDst(v) => v.to_bytes(writer),
            Info::TimeUpdState(v) => v.to_bytes(writer),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Enable {
    pub conhdl: ConHdl,
    pub sec_lvl: PermRight,
    pub con_type: ConType,
    pub current_time_ntf_en: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CreateDb {
        features: Features,
    },
    CreateDbCfm {
        status: Status,
    },
    /// Sent by the creating instance to its siblings.
    DbCreated(Services),
    Enable(Enable),
    EnableCfm {
        conhdl: ConHdl,
        status: Status,
    },
    Disable {
        conhdl: ConHdl,
    },
    DisableInd {
        conhdl: ConHdl,
        current_time_ntf_en: u16,
    },
    /// Stores the current time and notifies it.
    UpdCurrTime {
        conhdl: ConHdl,
        time: CurrTime,
    },
    UpdCurrTimeCfm {
        conhdl: ConHdl,
        status: Status,
    },
    /// Stores one of the read-only values.
    Update(Info),
    UpdateCfm {
        status: Status,
    },
    CurrTimeCfgInd {
        conhdl: ConHdl,
        cfg: u16,
    },
    TimeUpdCtnlPtInd {
        conhdl: ConHdl,
        value: TimeUpdCtnlPt,
    },
    ErrorInd {
        conhdl: ConHdl,
        status: Status,
    },
}

/// Time server role, one instance per connection index.
pub struct Tips {
    con: Attachment,
    services: Option<Services>,
    ntf: bool,
}

impl Tips {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            services: None,
            ntf: false,
        }
    }

    pub fn services(&self) -> Option<Services> {
        self.services
    }

    pub fn ntf_enabled(&self) -> bool {
        self.ntf
    }

    fn create_db(&mut self, features: Features, ctx: &mut Context<'_>) -> Result<Services, Status> {
        let mut cts_cfg = crate::att::cfg_mask(&[
            CTS_IDX_SVC,
            CTS_IDX_CURR_TIME_CHAR,
            CTS_IDX_CURR_TIME_VAL,
            CTS_IDX_CURR_TIME_CFG,
        ]);
        if features.contains(Features::LOC_TIME_INFO) {
            cts_cfg |= crate::att::cfg_mask(&[
                CTS_IDX_LOC_TIME_INFO_CHAR,
                CTS_IDX_LOC_TIME_INFO_VAL,
            ]);
        }
        if features.contains(Features::REF_TIME_INFO) {
            cts_cfg |= crate::att::cfg_mask(&[
                CTS_IDX_REF_TIME_INFO_CHAR,
                CTS_IDX_REF_TIME_INFO_VAL,
            ]);
        }

        let cts = ctx.db.create_db(&cts_table(), cts_cfg, ctx.id())?;
        let ndcs = if features.contains(Features::NDCS) {
            let cfg = crate::att::cfg_mask(&[
                NDCS_IDX_SVC,
                NDCS_IDX_TIME_DST_CHAR,
                NDCS_IDX_TIME_DST_VAL,
            ]);
            Some(ctx.db.create_db(&ndcs_table(), cfg, ctx.id())?)
        } else {
            None
        };
        let rtus = if features.contains(Features::RTUS) {
            let cfg = crate::att::cfg_mask(&[
                RTUS_IDX_SVC,
                RTUS_IDX_CTNL_PT_CHAR,
                RTUS_IDX_CTNL_PT_VAL,
                RTUS_IDX_STATE_CHAR,
                RTUS_IDX_STATE_VAL,
            ]);
            Some(ctx.db.create_db(&rtus_table(), cfg, ctx.id())?)
        } else {
            None
        };

        let services = Services { cts, ndcs, rtus };
        set_services_permission(ctx.db, &services.starts(), PermRight::Disabled)?;
        Ok(services)
    }

    fn enable(&mut self, params: Enable, ctx: &mut Context<'_>) -> Transition<Message> {
        let conhdl = params.conhdl;
        let own_index = ctx.connection_index(conhdl) == Some(ctx.id().index());
        let result = match self.services {
            Some(services) if own_index => {
                let cfg = match (params.con_type, params.current_time_ntf_en) {
                    (ConType::Normal, CCCD_NTF) => CCCD_NTF,
                    _ => CCCD_STOP,
                };
                services
                    .curr_time_cfg()
                    .ok_or(Status::InexistentHandle)
                    .and_then(|handle| write_cccd(ctx.db, handle, cfg))
                    .and_then(|()| {
                        set_services_permission(ctx.db, &services.starts(), params.sec_lvl)
                    })
                    .map(|()| cfg == CCCD_NTF)
            }
            _ => {
                warn!("tips: {:?} can't serve connection {:#06x}", ctx.id(), conhdl);
                Err(Status::ReqDisallowed)
            }
        };

        match result {
            Ok(ntf) => {
                self.con.attach(conhdl, ctx.src());
                self.ntf = ntf;
                Transition::to(State::Connected).send(
                    ctx.src(),
                    Message::EnableCfm {
                        conhdl,
                        status: Status::Ok,
                    },
                )
            }
            Err(status) => {
                Transition::to(State::Idle).send(ctx.src(), Message::ErrorInd { conhdl, status })
            }
        }
    }

    fn upd_curr_time(
        &mut self,
        conhdl: ConHdl,
        time: &CurrTime,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let stored = self
            .services
            .and_then(|s| s.curr_time())
            .ok_or(Status::InexistentHandle)
            .and_then(|handle| {
                let value = to_value(time)?;
                ctx.db.set_value(handle, &value).map(|()| handle)
            });
        match stored {
            Ok(handle) if self.ntf => {
                Transition::to(State::Busy).gatt(GattReq::Notify { conhdl, handle })
            }
            Ok(_) => Transition::to(State::Connected).send(
                self.con.app(),
                Message::UpdCurrTimeCfm {
                    conhdl,
                    status: Status::NtfDisabled,
                },
            ),
            Err(status) => {
                Transition::to(State::Connected)
                    .send(self.con.app(), Message::UpdCurrTimeCfm { conhdl, status })
            }
        }
    }

    fn update(&mut self, info: &Info, ctx: &mut Context<'_>) -> Status {
        let handle = match self.services.and_then(|s| s.info(info)) {
            Some(handle) => handle,
            None => return Status::FeatureNotSupported,
        };
        match to_value(info) {
            Ok(value) => match ctx.db.set_value(handle, &value) {
                Ok(()) => Status::Ok,
                Err(status) => status,
            },
            Err(e) => e.into(),
        }
    }

    fn write(
        &mut self,
        state: State,
        conhdl: ConHdl,
        handle: AttHandle,
        value: &[u8],
        response: bool,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let services = match self.services {
            Some(services) => services,
            None => return Transition::to(state),
        };
        let mut t = Transition::to(state);

        let status = if Some(handle) == services.curr_time_cfg() {
            match store_cccd(ctx.db, handle, value, CCCD_NTF) {
                Ok(cfg) => {
                    self.ntf = cfg == CCCD_NTF;
                    t = t.send(self.con.app(), Message::CurrTimeCfgInd { conhdl, cfg });
                    Status::Ok
                }
                Err(status) => status,
            }
        } else if Some(handle) == services.ctnl_pt() {
            match value {
                [byte] => match TimeUpdCtnlPt::from(*byte) {
                    TimeUpdCtnlPt::Unknown(_) => {
                        debug!("tips: ignoring control point value {:#04x}", byte);
                        Status::Ok
                    }
                    cmd => {
                        let ind = Message::TimeUpdCtnlPtInd { conhdl, value: cmd };
                        t = t.send(self.con.app(), ind);
                        Status::Ok
                    }
                },
                _ => Status::InvalidAttributeValueLength,
            }
        } else {
            debug!("tips: write to unhandled attribute {:?}", handle);
            Status::WriteNotPermitted
        };

        if response {
            t = t.gatt(GattReq::WriteRsp { conhdl, handle, status });
        }
        t
    }

    fn disable(&mut self, ctx: &mut Context<'_>) -> Transition<Message> {
        let con = match self.con.detach() {
            Some(con) => con,
            None => return Transition::to(State::Idle),
        };
        let current_time_ntf_en = if self.ntf { CCCD_NTF } else { CCCD_STOP };
        self.ntf = false;

        if let Some(services) = self.services {
            let hidden = set_services_permission(ctx.db, &services.starts(), PermRight::Disabled);
            if let Err(status) = hidden {
                warn!("tips: failed to hide services: {:?}", status);
            }
        }

        info!("tips: disabled on {:#06x}", con.conhdl);
        Transition::to(State::Idle).send(
            con.app,
            Message::DisableInd {
                conhdl: con.conhdl,
                current_time_ntf_en,
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
            (State::Disabled, Message::CreateDb { features }) => {
                self.con.set_app(ctx.src());
                match self.create_db(features, ctx) {
                    Ok(services) => {
                        self.services = Some(services);
                        let me = ctx.id().index();
                        let siblings = (0..MAX_CONNECTIONS as u8).filter(|&idx| idx != me);
                        siblings
                            .fold(Transition::to(State::Idle), |t, idx| {
                                let sibling = TaskId::new(TaskType::Tips, idx);
                                t.send(sibling, Message::DbCreated(services))
                            })
                            .send(ctx.src(), Message::CreateDbCfm { status: Status::Ok })
                    }
                    Err(status) => {
                        warn!("tips: create_db failed: {:?}", status);
                        Transition::to(State::Disabled)
                            .send(ctx.src(), Message::CreateDbCfm { status })
                    }
                }
            }
            (state, Message::CreateDb { .. }) => Transition::to(state).send(
                ctx.src(),
                Message::CreateDbCfm {
                    status: Status::ReqDisallowed,
                },
            ),
            (State::Disabled, Message::DbCreated(services)) => {
                self.services = Some(services);
                Transition::to(State::Idle)
            }

            (State::Idle, Message::Enable(params)) => self.enable(params, ctx),

            (State::Connected, Message::UpdCurrTime { conhdl, time }) if self.con.owns(conhdl) => {
                self.upd_curr_time(conhdl, &time, ctx)
            }
            (State::Busy, msg @ Message::UpdCurrTime { .. }) => {
                Transition::save(Event::Request(msg))
            }
            (state, Message::UpdCurrTime { conhdl, .. }) => {
                let status = if state == State::Connected {
                    Status::InvalidParam
                } else {
                    Status::ReqDisallowed
                };
                Transition::to(state).send(ctx.src(), Message::UpdCurrTimeCfm { conhdl, status })
            }

            (state, Message::Update(info)) if state >= State::Idle => {
                let status = self.update(&info, ctx);
                Transition::to(state).send(ctx.src(), Message::UpdateCfm { status })
            }

            (state, Message::Disable { conhdl })
                if state >= State::Connected && self.con.owns(conhdl) =>
            {
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
                debug!("tips: ignoring {:?} in {:?}", msg, state);
                Transition::to(state)
            }
        }
    }
}

impl Default for Tips {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Tips {
    type Message = Message;
    const TYPE: TaskType = TaskType::Tips;

    fn handle(
        &mut self,
        state: State,
        event: Event<Message>,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        match event {
            Event::Request(msg) => self.request(state, msg, ctx),
            Event::Gatt(evt) if state >= State::Connected && self.con.owns(evt.conhdl()) => {
                match evt {
                    GattEvent::Write {
                        conhdl,
                        handle,
                        value,
                        response,
                        ..
                    } => self.write(state, conhdl, handle, &value, response, ctx),
                    GattEvent::NotifyCmp { conhdl, status, .. } if state == State::Busy => {
                        Transition::to(State::Connected)
                            .send(self.con.app(), Message::UpdCurrTimeCfm { conhdl, status })
                    }
                    other => {
                        debug!("tips: ignoring {:?} in {:?}", other, state);
                        Transition::to(state)
                    }
                }
            }
            Event::Gatt(evt) => {
                debug!("tips: dropping {:?} in {:?}", evt, state);
                Transition::to(state)
            }
            Event::Disconnect(disc) if state >= State::Connected && self.con.owns(disc.conhdl) => {
                self.disable(ctx)
            }
            Event::Disconnect(_) => Transition::to(state),
        }
    }

    fn refuse(
        &mut self,
        state: State,
        event: Event<Message>,
        status: Status,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        match event {
            Event::Request(Message::UpdCurrTime { conhdl, .. }) => {
                Transition::to(state).send(ctx.src(), Message::UpdCurrTimeCfm { conhdl, status })
            }
            other => Transition::save(other),
        }
    }
}
