//! Cycling Speed and Cadence Service server.
//!
//! Only one procedure runs at a time: a measurement notification or an SC Control Point
//! procedure. While one is outstanding the task is `Busy`. A measurement requested in that time,
//! or a control point write racing a measurement, is saved and replayed once the outstanding
//! procedure completes. A second control point procedure is refused with
//! `ProcedureInProgress`.
//!
//! A control point procedure goes through the application: a valid request is forwarded as
//! `CtnlPtReqInd`, and the application's `CtnlPtCfm` is turned into the response indication.
//! Requests the sensor can't serve are answered directly.

use {
    crate::{
        att::{
            to_value, AttHandle, AttributeDesc, PermRight, Permissions, Properties, ServiceLayout,
            Status,
        },
        bytes::ByteReader,
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskType},
        prf::{
            cscp::{self, CtnlPtOpCode, CtnlPtReq, CtnlPtRespCode, CtnlPtRsp, Features, MeasFlags},
            store_cccd, write_cccd, Attachment, ConType, CCCD_IND, CCCD_NTF, CCCD_STOP,
        },
        task::{Context, Event, Profile, Transition},
        utils::set_bits,
    },
};

const IDX_SVC: usize = 0;
const IDX_MEAS_CHAR: usize = 1;
const IDX_MEAS_VAL: usize = 2;
const IDX_MEAS_NTF_CFG: usize = 3;
const IDX_FEAT_CHAR: usize = 4;
const IDX_FEAT_VAL: usize = 5;
const IDX_SENSOR_LOC_CHAR: usize = 6;
const IDX_SENSOR_LOC_VAL: usize = 7;
const IDX_CTNL_PT_CHAR: usize = 8;
const IDX_CTNL_PT_VAL: usize = 9;
const IDX_CTNL_PT_IND_CFG: usize = 10;

fn att_table() -> [AttributeDesc; 11] {
    [
        AttributeDesc::service(0x1816),
        AttributeDesc::characteristic(0x2A5B, Properties::NOTIFY),
        AttributeDesc::value(0x2A5B, Permissions::NOTIFY, cscp::MEAS_MAX_LEN as u16),
        AttributeDesc::cccd(),
        AttributeDesc::characteristic(0x2A5C, Properties::READ),
        AttributeDesc::value(0x2A5C, Permissions::READ, 2),
        AttributeDesc::characteristic(0x2A5D, Properties::READ),
        AttributeDesc::value(0x2A5D, Permissions::READ, 1),
        AttributeDesc::characteristic(0x2A55, Properties::WRITE | Properties::INDICATE),
        AttributeDesc::value(
            0x2A55,
            Permissions::WRITE | Permissions::INDICATE,
            cscp::CTNL_PT_RSP_MAX_LEN as u16,
        ),
        AttributeDesc::cccd(),
    ]
}

/// Procedures reported in [`Message::CmpEvt`].
///
/// [`Message::CmpEvt`]: enum.Message.html#variant.CmpEvt
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Enable,
    Disable,
    SendMeas,
    /// An SC Control Point procedure handled by the application.
    CtnlPt(CtnlPtOpCode),
    /// An SC Control Point error response sent without involving the application.
    CtnlPtErrInd,
}

/// Characteristic whose client configuration changed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CharCode {
    CscMeas,
    ScCtnlPt,
}

/// Parameters of [`Message::CreateDb`].
///
/// [`Message::CreateDb`]: enum.Message.html#variant.CreateDb
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CreateDb {
    pub features: Features,
    /// Adds the Sensor Location characteristic even without multiple locations.
    pub sensor_loc_supp: bool,
    /// Initial sensor location. Values out of range are replaced by "Other".
    pub sensor_loc: u8,
}

/// Parameters of [`Message::Enable`].
///
/// [`Message::Enable`]: enum.Message.html#variant.Enable
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Enable {
    pub conhdl: ConHdl,
    pub sec_lvl: PermRight,
    pub con_type: ConType,
    pub csc_meas_ntf_cfg: u16,
    pub sc_ctnl_pt_ntf_cfg: u16,
    /// Cumulative wheel revolutions to start from.
    pub wheel_rev: u32,
}

/// Parameters of [`Message::MeasSend`].
///
/// [`Message::MeasSend`]: enum.Message.html#variant.MeasSend
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MeasSend {
    pub flags: MeasFlags,
    /// Wheel revolutions since the last measurement. The cumulative value never drops below 0.
    pub wheel_rev: i32,
    pub last_wheel_evt_time: u16,
    pub cumul_crank_rev: u16,
    pub last_crank_evt_time: u16,
}

/// Result data of a control point procedure, in [`Message::CtnlPtCfm`].
///
/// [`Message::CtnlPtCfm`]: enum.Message.html#variant.CtnlPtCfm
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CtnlPtValue {
    None,
    CumulWheelRev(u32),
    SensorLoc(u8),
    /// Bit `n` set means location `n` is supported.
    SuppSensorLoc(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CreateDb(CreateDb),
    CreateDbCfm {
        status: Status,
    },
    Enable(Enable),
    Disable {
        conhdl: ConHdl,
    },
    DisableInd {
        conhdl: ConHdl,
        csc_meas_ntf_cfg: u16,
        sc_ctnl_pt_ntf_cfg: u16,
    },
    MeasSend {
        conhdl: ConHdl,
        meas: MeasSend,
    },
    /// The peer wrote a request to the SC Control Point.
    CtnlPtReqInd {
        conhdl: ConHdl,
        req: CtnlPtReq,
    },
    /// The application's answer to a `CtnlPtReqInd`.
    CtnlPtCfm {
        conhdl: ConHdl,
        status: Status,
        value: CtnlPtValue,
    },
    NtfIndCfgInd {
        conhdl: ConHdl,
        char_code: CharCode,
        cfg: u16,
    },
    CmpEvt {
        conhdl: ConHdl,
        operation: Operation,
        status: Status,
    },
}

/// Cycling Speed and Cadence Service server role.
pub struct Cscps {
    con: Attachment,
    layout: Option<ServiceLayout>,
    features: Features,
    meas_ntf: bool,
    ctnl_pt_ind: bool,
    wheel_rev: u32,
    operation: Option<Operation>,
    /// A control point response indication is outstanding.
    indicating: bool,
}

impl Cscps {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            layout: None,
            features: Features::empty(),
            meas_ntf: false,
            ctnl_pt_ind: false,
            wheel_rev: 0,
            operation: None,
            indicating: false,
        }
    }

    fn attr(&self, idx: usize) -> Option<AttHandle> {
        self.layout.and_then(|layout| layout.handle(idx))
    }

    pub fn meas_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_MEAS_VAL)
    }

    pub fn meas_ntf_cfg_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_MEAS_NTF_CFG)
    }

    pub fn feature_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_FEAT_VAL)
    }

    pub fn sensor_loc_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_SENSOR_LOC_VAL)
    }

    pub fn ctnl_pt_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_CTNL_PT_VAL)
    }

    pub fn ctnl_pt_ind_cfg_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_CTNL_PT_IND_CFG)
    }

    /// Current cumulative wheel revolutions.
    pub fn wheel_rev(&self) -> u32 {
        self.wheel_rev
    }

    /// The procedure in flight, if any.
    pub fn operation(&self) -> Option<Operation> {
        self.operation
    }

    fn cmp_evt(&self, operation: Operation, status: Status) -> Message {
        Message::CmpEvt {
            conhdl: self.con.conhdl().unwrap_or_default(),
            operation,
            status,
        }
    }

    fn create_db(&mut self, params: &CreateDb, ctx: &mut Context<'_>) -> Result<(), Status> {
        let features = params.features & Features::all();
        let multi_loc = features.contains(Features::MULT_SENSOR_LOC_SUPP);

        let mut cfg = crate::att::cfg_mask(&[
            IDX_SVC,
            IDX_MEAS_CHAR,
            IDX_MEAS_VAL,
            IDX_MEAS_NTF_CFG,
            IDX_FEAT_CHAR,
            IDX_FEAT_VAL,
        ]);
        if params.sensor_loc_supp || multi_loc {
            cfg |= crate::att::cfg_mask(&[IDX_SENSOR_LOC_CHAR, IDX_SENSOR_LOC_VAL]);
        }
        if features.contains(Features::WHEEL_REV_DATA_SUPP) || multi_loc {
            cfg |= crate::att::cfg_mask(&[IDX_CTNL_PT_CHAR, IDX_CTNL_PT_VAL, IDX_CTNL_PT_IND_CFG]);
        }

        let layout = ctx.db.create_db(&att_table(), cfg, ctx.id())?;
        self.layout = Some(layout);
        self.features = features;

        let feat = self.feature_handle().ok_or(Status::InexistentHandle)?;
        ctx.db.set_value(feat, &features.bits().to_le_bytes())?;
        if let Some(loc) = self.sensor_loc_handle() {
            let sensor_loc = if params.sensor_loc < cscp::LOC_MAX {
                params.sensor_loc
            } else {
                cscp::LOC_OTHER
            };
            ctx.db.set_value(loc, &[sensor_loc])?;
        }
        ctx.db.set_permission(layout.start(), PermRight::Disabled)
    }

    /// Picks the client configuration to store for a new connection.
    fn initial_cfg(con_type: ConType, requested: u16, allowed: u16) -> Result<u16, Status> {
        match (con_type, requested) {
            (ConType::Discovery, _) => Ok(CCCD_STOP),
            (ConType::Normal, CCCD_STOP) => Ok(CCCD_STOP),
            (ConType::Normal, cfg) if cfg == allowed => Ok(cfg),
            _ => Err(Status::InvalidParam),
        }
    }

    fn apply_enable(&mut self, params: &Enable, ctx: &mut Context<'_>) -> Result<(), Status> {
        let meas_cfg = Self::initial_cfg(params.con_type, params.csc_meas_ntf_cfg, CCCD_NTF)?;
        let ctnl_pt = match self.ctnl_pt_ind_cfg_handle() {
            Some(handle) => Some((
                handle,
                Self::initial_cfg(params.con_type, params.sc_ctnl_pt_ntf_cfg, CCCD_IND)?,
            )),
            None => None,
        };

        let meas_ntf_cfg = self.meas_ntf_cfg_handle().ok_or(Status::InexistentHandle)?;
        write_cccd(ctx.db, meas_ntf_cfg, meas_cfg)?;
        if let Some((handle, cfg)) = ctnl_pt {
            write_cccd(ctx.db, handle, cfg)?;
        }
        let svc = self.layout.map(|l| l.start()).ok_or(Status::InexistentHandle)?;
        ctx.db.set_permission(svc, params.sec_lvl)?;

        self.meas_ntf = meas_cfg == CCCD_NTF;
        self.ctnl_pt_ind = ctnl_pt.map_or(false, |(_, cfg)| cfg == CCCD_IND);
        self.wheel_rev = params.wheel_rev;
        self.operation = None;
        self.indicating = false;
        Ok(())
    }

    fn enable(&mut self, params: Enable, ctx: &mut Context<'_>) -> Transition<Message> {
        let conhdl = params.conhdl;
        let status = if !ctx.is_connected(conhdl) {
            warn!("cscps: enable for unknown connection {:#06x}", conhdl);
            Status::ReqDisallowed
        } else {
            match self.apply_enable(&params, ctx) {
                Ok(()) => {
                    self.con.attach(conhdl, ctx.src());
                    Status::Ok
                }
                Err(status) => status,
            }
        };

        let next = if status.is_ok() { State::Connected } else { State::Idle };
        Transition::to(next).send(
            ctx.src(),
            Message::CmpEvt {
                conhdl,
                operation: Operation::Enable,
                status,
            },
        )
    }

    fn send_meas(&mut self, meas: &MeasSend, ctx: &mut Context<'_>) -> Transition<Message> {
        let mut flags = meas.flags & MeasFlags::all();
        if !self.features.contains(Features::WHEEL_REV_DATA_SUPP) {
            flags.remove(MeasFlags::WHEEL_REV_DATA_PRESENT);
        }
        if !self.features.contains(Features::CRANK_REV_DATA_SUPP) {
            flags.remove(MeasFlags::CRANK_REV_DATA_PRESENT);
        }

        if flags.contains(MeasFlags::WHEEL_REV_DATA_PRESENT) {
            let total = i64::from(self.wheel_rev) + i64::from(meas.wheel_rev);
            self.wheel_rev = total.max(0).min(i64::from(u32::max_value())) as u32;
        }

        let packed = cscp::Measurement {
            flags,
            cumul_wheel_rev: self.wheel_rev,
            last_wheel_evt_time: meas.last_wheel_evt_time,
            cumul_crank_rev: meas.cumul_crank_rev,
            last_crank_evt_time: meas.last_crank_evt_time,
        };
        let result = self.meas_handle().ok_or(Status::InexistentHandle).and_then(|handle| {
            let value = to_value(&packed)?;
            ctx.db.set_value(handle, &value)?;
            Ok(handle)
        });

        match (result, self.con.conhdl()) {
            (Ok(handle), Some(conhdl)) => {
                self.operation = Some(Operation::SendMeas);
                Transition::to(State::Busy).gatt(GattReq::Notify { conhdl, handle })
            }
            (Err(status), _) => {
                Transition::to(State::Connected)
                    .send(self.con.app(), self.cmp_evt(Operation::SendMeas, status))
            }
            (Ok(_), None) => Transition::to(State::Connected),
        }
    }

    /// Reads a control point request. `Err` carries the response code to send back directly.
    fn parse_ctnl_pt(
        &self,
        op: CtnlPtOpCode,
        bytes: &mut ByteReader<'_>,
    ) -> Result<CtnlPtReq, CtnlPtRespCode> {
        let multi_loc = self.features.contains(Features::MULT_SENSOR_LOC_SUPP);
        match op {
            CtnlPtOpCode::SetCumulVal if self.features.contains(Features::WHEEL_REV_DATA_SUPP) => {
                bytes
                    .read_u32_le()
                    .map(CtnlPtReq::SetCumulVal)
                    .map_err(|_| CtnlPtRespCode::InvalidParam)
            }
            CtnlPtOpCode::UpdLoc if multi_loc => match bytes.read_u8() {
                Ok(loc) if loc < cscp::LOC_MAX => Ok(CtnlPtReq::UpdLoc(loc)),
                _ => Err(CtnlPtRespCode::InvalidParam),
            },
            CtnlPtOpCode::ReqSuppLoc if multi_loc => Ok(CtnlPtReq::ReqSuppLoc),
            _ => Err(CtnlPtRespCode::NotSupported),
        }
    }

    /// Stores `rsp` in the control point and indicates it.
    fn indicate(
        &mut self,
        conhdl: ConHdl,
        rsp: &CtnlPtRsp,
        ctx: &mut Context<'_>,
    ) -> Result<GattReq, Status> {
        let handle = self.ctnl_pt_handle().ok_or(Status::InexistentHandle)?;
        let value = to_value(rsp)?;
        ctx.db.set_value(handle, &value)?;
        self.indicating = true;
        Ok(GattReq::Indicate { conhdl, handle })
    }

    fn write_ctnl_pt(
        &mut self,
        state: State,
        conhdl: ConHdl,
        handle: AttHandle,
        value: &[u8],
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let rsp = |status| GattReq::WriteRsp { conhdl, handle, status };
        if !self.ctnl_pt_ind {
            return Transition::to(state).gatt(rsp(Status::CccdImproperlyConfigured));
        }
        if self.operation.is_some() {
            debug!("cscps: control point busy with {:?}", self.operation);
            return Transition::to(state).gatt(rsp(Status::ProcedureInProgress));
        }

        let mut bytes = ByteReader::new(value);
        let op = match bytes.read_u8() {
            Ok(op) => CtnlPtOpCode::from(op),
            Err(_) => return Transition::to(state).gatt(rsp(Status::InvalidAttributeValueLength)),
        };

        match self.parse_ctnl_pt(op, &mut bytes) {
            Ok(req) => {
                self.operation = Some(Operation::CtnlPt(op));
                Transition::to(State::Busy)
                    .gatt(rsp(Status::Ok))
                    .send(self.con.app(), Message::CtnlPtReqInd { conhdl, req })
            }
            Err(code) => {
                debug!("cscps: refusing control point request {:?}", crate::HexSlice(value));
                match self.indicate(conhdl, &CtnlPtRsp::new(op, code), ctx) {
                    Ok(ind) => {
                        self.operation = Some(Operation::CtnlPtErrInd);
                        Transition::to(State::Busy).gatt(rsp(Status::Ok)).gatt(ind)
                    }
                    Err(status) => Transition::to(state).gatt(rsp(status)),
                }
            }
        }
    }

    fn write_cccd(
        &mut self,
        state: State,
        conhdl: ConHdl,
        handle: AttHandle,
        value: &[u8],
        last: bool,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let (char_code, allowed) = if Some(handle) == self.meas_ntf_cfg_handle() {
            (CharCode::CscMeas, CCCD_NTF)
        } else {
            (CharCode::ScCtnlPt, CCCD_IND)
        };

        let mut t = Transition::to(state);
        let status = match store_cccd(ctx.db, handle, value, allowed) {
            Ok(cfg) => {
                match char_code {
                    CharCode::CscMeas => self.meas_ntf = cfg == CCCD_NTF,
                    CharCode::ScCtnlPt => self.ctnl_pt_ind = cfg == CCCD_IND,
                }
                if last {
                    t = t.send(self.con.app(), Message::NtfIndCfgInd { conhdl, char_code, cfg });
                }
                Status::Ok
            }
            Err(status) => status,
        };
        t.gatt(GattReq::WriteRsp { conhdl, handle, status })
    }

    /// A control point write arriving while a measurement is in flight waits for it.
    fn defers(&self, evt: &GattEvent) -> bool {
        match evt {
            GattEvent::Write { handle, .. } => {
                Some(*handle) == self.ctnl_pt_handle()
                    && self.ctnl_pt_ind
                    && self.operation == Some(Operation::SendMeas)
            }
            _ => false,
        }
    }

    fn gatt_event(
        &mut self,
        state: State,
        evt: GattEvent,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        if self.defers(&evt) {
            debug!("cscps: control point write waits for the measurement");
            return Transition::save(Event::Gatt(evt));
        }

        match evt {
            GattEvent::Write {
                conhdl,
                handle,
                value,
                last,
                ..
            } => {
                if Some(handle) == self.ctnl_pt_handle() {
                    self.write_ctnl_pt(state, conhdl, handle, &value, ctx)
                } else if Some(handle) == self.meas_ntf_cfg_handle()
                    || Some(handle) == self.ctnl_pt_ind_cfg_handle()
                {
                    self.write_cccd(state, conhdl, handle, &value, last, ctx)
                } else {
                    debug!("cscps: write to unhandled attribute {:?}", handle);
                    Transition::to(state)
                }
            }
            GattEvent::NotifyCmp { status, .. } if self.operation == Some(Operation::SendMeas) => {
                self.operation = None;
                Transition::to(State::Connected)
                    .send(self.con.app(), self.cmp_evt(Operation::SendMeas, status))
            }
            GattEvent::HandleValueCfm { status, .. } if self.indicating => {
                self.indicating = false;
                match self.operation.take() {
                    Some(op) => {
                        Transition::to(State::Connected)
                            .send(self.con.app(), self.cmp_evt(op, status))
                    }
                    None => Transition::to(State::Connected),
                }
            }
            other => {
                debug!("cscps: ignoring {:?} in {:?}", other, state);
                Transition::to(state)
            }
        }
    }

    /// Turns the application's answer into the control point response.
    fn ctnl_pt_cfm(
        &mut self,
        state: State,
        status: Status,
        value: CtnlPtValue,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let (op, conhdl) = match (self.operation, self.con.conhdl()) {
            (Some(Operation::CtnlPt(op)), Some(conhdl)) if !self.indicating => (op, conhdl),
            _ => {
                debug!("cscps: unexpected control point confirmation");
                return Transition::to(state);
            }
        };

        let code = if status.is_ok() {
            CtnlPtRespCode::Success
        } else {
            CtnlPtRespCode::Failed
        };
        let mut rsp = CtnlPtRsp::new(op, code);
        if status.is_ok() {
            match (op, value) {
                (CtnlPtOpCode::SetCumulVal, CtnlPtValue::CumulWheelRev(rev)) => {
                    self.wheel_rev = rev
                }
                (CtnlPtOpCode::UpdLoc, CtnlPtValue::SensorLoc(loc)) => {
                    if let Some(handle) = self.sensor_loc_handle() {
                        if let Err(status) = ctx.db.set_value(handle, &[loc]) {
                            warn!("cscps: failed to store sensor location: {:?}", status);
                        }
                    }
                }
                (CtnlPtOpCode::ReqSuppLoc, CtnlPtValue::SuppSensorLoc(mask)) => {
                    for loc in set_bits(u32::from(mask)).filter(|&loc| loc < cscp::LOC_MAX) {
                        let _ = rsp.locations.push(loc);
                    }
                }
                (op, value) => warn!("cscps: {:?} confirmed with {:?}", op, value),
            }
        }

        match self.indicate(conhdl, &rsp, ctx) {
            Ok(ind) => Transition::to(State::Busy).gatt(ind),
            Err(status) => {
                error!("cscps: failed to send control point response: {:?}", status);
                self.operation = None;
                Transition::to(State::Connected)
                    .send(self.con.app(), self.cmp_evt(Operation::CtnlPt(op), status))
            }
        }
    }

    fn disable(&mut self, ctx: &mut Context<'_>) -> Transition<Message> {
        let con = match self.con.detach() {
            Some(con) => con,
            None => return Transition::to(State::Idle),
        };
        let csc_meas_ntf_cfg = if self.meas_ntf { CCCD_NTF } else { CCCD_STOP };
        let sc_ctnl_pt_ntf_cfg = if self.ctnl_pt_ind { CCCD_IND } else { CCCD_STOP };
        self.meas_ntf = false;
        self.ctnl_pt_ind = false;
        if let Some(op) = self.operation.take() {
            debug!("cscps: dropping {:?}", op);
        }
        self.indicating = false;

        if let Some(layout) = self.layout {
            if let Err(status) = ctx.db.set_permission(layout.start(), PermRight::Disabled) {
                warn!("cscps: failed to hide service: {:?}", status);
            }
        }

        info!("cscps: disabled on {:#06x}", con.conhdl);
        Transition::to(State::Idle).send(
            con.app,
            Message::DisableInd {
                conhdl: con.conhdl,
                csc_meas_ntf_cfg,
                sc_ctnl_pt_ntf_cfg,
            },
        )
    }

    fn request(
        &mut self,
        state: State,
        msg: Message,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let disallowed = |conhdl, operation| Message::CmpEvt {
            conhdl,
            operation,
            status: Status::ReqDisallowed,
        };

        match (state, msg) {
            (State::Disabled, Message::CreateDb(params)) => {
                self.con.set_app(ctx.src());
                let (next, status) = match self.create_db(&params, ctx) {
                    Ok(()) => (State::Idle, Status::Ok),
                    Err(status) => {
                        warn!("cscps: create_db failed: {:?}", status);
                        self.layout = None;
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
            (state, Message::Enable(params)) => {
                Transition::to(state).send(ctx.src(), disallowed(params.conhdl, Operation::Enable))
            }

            (state, Message::MeasSend { conhdl, meas }) if state >= State::Connected => {
                if !self.con.owns(conhdl) {
                    Transition::to(state).send(
                        ctx.src(),
                        Message::CmpEvt {
                            conhdl,
                            operation: Operation::SendMeas,
                            status: Status::InvalidParam,
                        },
                    )
                } else if !self.meas_ntf {
                    Transition::to(state)
                        .send(
                            self.con.app(),
                            self.cmp_evt(Operation::SendMeas, Status::NtfDisabled),
                        )
                } else if state == State::Busy {
                    Transition::save(Event::Request(Message::MeasSend { conhdl, meas }))
                } else {
                    self.send_meas(&meas, ctx)
                }
            }
            (state, Message::MeasSend { conhdl, .. }) => {
                Transition::to(state).send(ctx.src(), disallowed(conhdl, Operation::SendMeas))
            }

            (State::Busy, Message::CtnlPtCfm { conhdl, status, value })
                if self.con.owns(conhdl) =>
            {
                self.ctnl_pt_cfm(state, status, value, ctx)
            }

            (state, Message::Disable { conhdl })
                if state >= State::Connected && self.con.owns(conhdl) =>
            {
                self.disable(ctx)
            }
            (state, Message::Disable { conhdl }) => {
                Transition::to(state).send(ctx.src(), disallowed(conhdl, Operation::Disable))
            }

            (state, msg) => {
                debug!("cscps: ignoring {:?} in {:?}", msg, state);
                Transition::to(state)
            }
        }
    }
}

impl Default for Cscps {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Cscps {
    type Message = Message;
    const TYPE: TaskType = TaskType::Cscps;

    fn handle(
        &mut self,
        state: State,
        event: Event<Message>,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        match event {
            Event::Request(msg) => self.request(state, msg, ctx),
            Event::Gatt(evt) if state >= State::Connected && self.con.owns(evt.conhdl()) => {
                self.gatt_event(state, evt, ctx)
            }
            Event::Gatt(evt) => {
                debug!("cscps: dropping {:?} in {:?}", evt, state);
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
            Event::Request(Message::MeasSend { conhdl, .. }) => Transition::to(state).send(
                ctx.src(),
                Message::CmpEvt {
                    conhdl,
                    operation: Operation::SendMeas,
                    status,
                },
            ),
            Event::Gatt(GattEvent::Write { conhdl, handle, .. }) => {
                Transition::to(state).gatt(GattReq::WriteRsp { conhdl, handle, status })
            }
            other => Transition::save(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prf::testing::{Bench, CONHDL};

    fn created(features: Features) -> Bench<Cscps> {
        let mut bench = Bench::new(Cscps::new());
        bench.request(Message::CreateDb(CreateDb {
            features,
            sensor_loc_supp: false,
            sensor_loc: 4,
        }));
        assert_eq!(bench.app_msgs(), [Message::CreateDbCfm { status: Status::Ok }]);
        bench
    }

    fn enable_params() -> Enable {
        Enable {
            conhdl: CONHDL,
            sec_lvl: PermRight::Enabled,
            con_type: ConType::Normal,
            csc_meas_ntf_cfg: CCCD_NTF,
            sc_ctnl_pt_ntf_cfg: CCCD_IND,
            wheel_rev: 10,
        }
    }

    fn connected(features: Features) -> Bench<Cscps> {
        let mut bench = created(features);
        bench.request(Message::Enable(enable_params()));
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::Enable,
                status: Status::Ok
            }]
        );
        bench
    }

    fn meas(flags: MeasFlags, wheel_rev: i32) -> Message {
        Message::MeasSend {
            conhdl: CONHDL,
            meas: MeasSend {
                flags,
                wheel_rev,
                last_wheel_evt_time: 0x0400,
                cumul_crank_rev: 3,
                last_crank_evt_time: 0x0800,
            },
        }
    }

    fn ind(bench: &Bench<Cscps>) -> GattReq {
        GattReq::Indicate {
            conhdl: CONHDL,
            handle: bench.task.profile().ctnl_pt_handle().unwrap(),
        }
    }

    fn write_rsp(handle: AttHandle, status: Status) -> GattReq {
        GattReq::WriteRsp {
            conhdl: CONHDL,
            handle,
            status,
        }
    }

    #[test]
    fn database_follows_features() {
        let bench = created(Features::CRANK_REV_DATA_SUPP);
        let cscps = bench.task.profile();
        assert!(cscps.sensor_loc_handle().is_none());
        assert!(cscps.ctnl_pt_handle().is_none());
        assert_eq!(bench.value(cscps.feature_handle().unwrap()), [0x02, 0x00]);

        let bench = created(Features::all());
        let cscps = bench.task.profile();
        assert_eq!(bench.value(cscps.sensor_loc_handle().unwrap()), [4]);
        assert!(cscps.ctnl_pt_ind_cfg_handle().is_some());
    }

    #[test]
    fn enable_checks_client_configuration() {
        let mut bench = created(Features::all());
        let mut params = enable_params();
        params.sc_ctnl_pt_ntf_cfg = CCCD_NTF;
        bench.request(Message::Enable(params));
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::Enable,
                status: Status::InvalidParam
            }]
        );
        assert_eq!(bench.state(), State::Idle);

        params.con_type = ConType::Discovery;
        bench.request(Message::Enable(params));
        assert_eq!(bench.state(), State::Connected);
        let cfg = bench.task.profile().ctnl_pt_ind_cfg_handle().unwrap();
        assert_eq!(bench.value(cfg), [0, 0]);
    }

    #[test]
    fn measurement_is_stripped_and_accumulated() {
        let mut bench = connected(Features::WHEEL_REV_DATA_SUPP);
        let handle = bench.task.profile().meas_handle().unwrap();

        bench.request(meas(MeasFlags::all(), -4));
        assert_eq!(bench.state(), State::Busy);
        assert_eq!(bench.value(handle), [0x01, 6, 0, 0, 0, 0x00, 0x04]);
        assert_eq!(bench.gatt_reqs(), [GattReq::Notify { conhdl: CONHDL, handle }]);

        bench.gatt(GattEvent::NotifyCmp {
            conhdl: CONHDL,
            handle,
            status: Status::Ok,
        });
        assert_eq!(bench.state(), State::Connected);
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::SendMeas,
                status: Status::Ok
            }]
        );

        // The cumulative value stops at zero.
        bench.request(meas(MeasFlags::WHEEL_REV_DATA_PRESENT, -100));
        assert_eq!(bench.task.profile().wheel_rev(), 0);
    }

    #[test]
    fn measurement_waits_while_busy() {
        let mut bench = connected(Features::WHEEL_REV_DATA_SUPP);
        let handle = bench.task.profile().meas_handle().unwrap();
        bench.request(meas(MeasFlags::WHEEL_REV_DATA_PRESENT, 1));
        bench.request(meas(MeasFlags::WHEEL_REV_DATA_PRESENT, 1));
        assert_eq!(bench.task.deferred_len(), 1);
        assert_eq!(bench.gatt_reqs().len(), 1);
        assert_eq!(bench.task.profile().wheel_rev(), 11);

        bench.gatt(GattEvent::NotifyCmp {
            conhdl: CONHDL,
            handle,
            status: Status::Ok,
        });
        assert_eq!(bench.task.deferred_len(), 0);
        assert_eq!(bench.task.profile().wheel_rev(), 12);
        assert_eq!(bench.state(), State::Busy);
        assert_eq!(bench.gatt_reqs(), [GattReq::Notify { conhdl: CONHDL, handle }]);
    }

    #[test]
    fn measurements_beyond_the_backlog_are_refused() {
        let mut bench = connected(Features::WHEEL_REV_DATA_SUPP);
        let ctnl_pt = bench.task.profile().ctnl_pt_handle().unwrap();
        bench.request(meas(MeasFlags::WHEEL_REV_DATA_PRESENT, 1));
        assert_eq!(bench.gatt_reqs().len(), 1);

        for _ in 0..7 {
            bench.request(meas(MeasFlags::WHEEL_REV_DATA_PRESENT, 1));
        }
        let saved = bench.task.deferred_len();
        assert!(saved > 0 && saved < 7);
        let refused = Message::CmpEvt {
            conhdl: CONHDL,
            operation: Operation::SendMeas,
            status: Status::InsufficientResources,
        };
        let msgs = bench.app_msgs();
        assert_eq!(msgs.len(), 7 - saved);
        assert!(msgs.iter().all(|msg| *msg == refused));
        assert_eq!(bench.state(), State::Busy);

        bench.write(ctnl_pt, &[0x01, 0, 0, 0, 0]);
        assert_eq!(bench.gatt_reqs(), [write_rsp(ctnl_pt, Status::InsufficientResources)]);
        assert_eq!(bench.task.profile().wheel_rev(), 11);
    }

    #[test]
    fn measurement_errors() {
        let mut bench = connected(Features::WHEEL_REV_DATA_SUPP);
        bench.request(Message::MeasSend {
            conhdl: 0x0041,
            meas: MeasSend {
                flags: MeasFlags::empty(),
                wheel_rev: 0,
                last_wheel_evt_time: 0,
                cumul_crank_rev: 0,
                last_crank_evt_time: 0,
            },
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: 0x0041,
                operation: Operation::SendMeas,
                status: Status::InvalidParam
            }]
        );

        let cfg = bench.task.profile().meas_ntf_cfg_handle().unwrap();
        bench.write(cfg, &[0, 0]);
        bench.app_msgs();
        bench.gatt_reqs();
        bench.request(meas(MeasFlags::empty(), 0));
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::SendMeas,
                status: Status::NtfDisabled
            }]
        );
        assert_eq!(bench.state(), State::Connected);
    }

    #[test]
    fn control_point_needs_indications() {
        let mut bench = created(Features::all());
        let mut params = enable_params();
        params.sc_ctnl_pt_ntf_cfg = CCCD_STOP;
        bench.request(Message::Enable(params));
        bench.app_msgs();

        let ctnl_pt = bench.task.profile().ctnl_pt_handle().unwrap();
        bench.write(ctnl_pt, &[0x04]);
        assert_eq!(bench.gatt_reqs(), [write_rsp(ctnl_pt, Status::CccdImproperlyConfigured)]);
        assert_eq!(bench.state(), State::Connected);
        assert!(bench.app_msgs().is_empty());
    }

    #[test]
    fn set_cumulative_value() {
        let mut bench = connected(Features::WHEEL_REV_DATA_SUPP);
        let ctnl_pt = bench.task.profile().ctnl_pt_handle().unwrap();

        bench.write(ctnl_pt, &[0x01, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(bench.state(), State::Busy);
        assert_eq!(bench.gatt_reqs(), [write_rsp(ctnl_pt, Status::Ok)]);
        assert_eq!(
            bench.app_msgs(),
            [Message::CtnlPtReqInd {
                conhdl: CONHDL,
                req: CtnlPtReq::SetCumulVal(0x100)
            }]
        );

        // A second procedure is refused and leaves the first one alone.
        bench.write(ctnl_pt, &[0x01, 0x00, 0x02, 0x00, 0x00]);
        assert_eq!(bench.gatt_reqs(), [write_rsp(ctnl_pt, Status::ProcedureInProgress)]);
        assert!(bench.app_msgs().is_empty());
        assert_eq!(
            bench.task.profile().operation(),
            Some(Operation::CtnlPt(CtnlPtOpCode::SetCumulVal))
        );
        assert_eq!(bench.task.profile().wheel_rev(), 10);

        bench.request(Message::CtnlPtCfm {
            conhdl: CONHDL,
            status: Status::Ok,
            value: CtnlPtValue::CumulWheelRev(0x100),
        });
        assert_eq!(bench.task.profile().wheel_rev(), 0x100);
        assert_eq!(bench.value(ctnl_pt), [0x10, 0x01, 0x01]);
        assert_eq!(bench.gatt_reqs(), [ind(&bench)]);
        assert_eq!(bench.state(), State::Busy);

        bench.gatt(GattEvent::HandleValueCfm {
            conhdl: CONHDL,
            handle: ctnl_pt,
            status: Status::Ok,
        });
        assert_eq!(bench.state(), State::Connected);
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::CtnlPt(CtnlPtOpCode::SetCumulVal),
                status: Status::Ok
            }]
        );
    }

    #[test]
    fn refused_requests_are_answered_directly() {
        let mut bench = connected(Features::all());
        let ctnl_pt = bench.task.profile().ctnl_pt_handle().unwrap();

        for (req, rsp) in [
            (&[0x02][..], [0x10, 0x02, 0x02]),
            (&[0x03, 15][..], [0x10, 0x03, 0x03]),
            (&[0x01, 0x00][..], [0x10, 0x01, 0x03]),
        ]
        .iter()
        {
            bench.write(ctnl_pt, req);
            assert_eq!(bench.value(ctnl_pt), rsp);
            assert_eq!(bench.gatt_reqs(), [write_rsp(ctnl_pt, Status::Ok), ind(&bench)]);
            assert!(bench.app_msgs().is_empty());

            bench.gatt(GattEvent::HandleValueCfm {
                conhdl: CONHDL,
                handle: ctnl_pt,
                status: Status::Ok,
            });
            assert_eq!(
                bench.app_msgs(),
                [Message::CmpEvt {
                    conhdl: CONHDL,
                    operation: Operation::CtnlPtErrInd,
                    status: Status::Ok
                }]
            );
        }
    }

    #[test]
    fn supported_locations() {
        let mut bench = connected(Features::MULT_SENSOR_LOC_SUPP);
        let ctnl_pt = bench.task.profile().ctnl_pt_handle().unwrap();
        bench.write(ctnl_pt, &[0x04]);
        bench.gatt_reqs();
        assert_eq!(
            bench.app_msgs(),
            [Message::CtnlPtReqInd {
                conhdl: CONHDL,
                req: CtnlPtReq::ReqSuppLoc
            }]
        );

        bench.request(Message::CtnlPtCfm {
            conhdl: CONHDL,
            status: Status::Ok,
            value: CtnlPtValue::SuppSensorLoc(0b1001_0010),
        });
        assert_eq!(bench.value(ctnl_pt), [0x10, 0x04, 0x01, 1, 4, 7]);
    }

    #[test]
    fn update_location_failure() {
        let mut bench = connected(Features::MULT_SENSOR_LOC_SUPP);
        let ctnl_pt = bench.task.profile().ctnl_pt_handle().unwrap();
        let loc = bench.task.profile().sensor_loc_handle().unwrap();
        bench.write(ctnl_pt, &[0x03, 0x06]);
        bench.request(Message::CtnlPtCfm {
            conhdl: CONHDL,
            status: Status::AppError,
            value: CtnlPtValue::SensorLoc(6),
        });
        assert_eq!(bench.value(ctnl_pt), [0x10, 0x03, 0x04]);
        assert_eq!(bench.value(loc), [4]);
    }

    #[test]
    fn control_point_waits_for_measurement() {
        let mut bench = connected(Features::WHEEL_REV_DATA_SUPP);
        let meas_handle = bench.task.profile().meas_handle().unwrap();
        let ctnl_pt = bench.task.profile().ctnl_pt_handle().unwrap();

        bench.request(meas(MeasFlags::WHEEL_REV_DATA_PRESENT, 1));
        bench.write(ctnl_pt, &[0x01, 0, 0, 0, 0]);
        assert_eq!(bench.task.deferred_len(), 1);
        assert_eq!(bench.gatt_reqs().len(), 1);

        bench.gatt(GattEvent::NotifyCmp {
            conhdl: CONHDL,
            handle: meas_handle,
            status: Status::Ok,
        });
        assert_eq!(bench.gatt_reqs(), [write_rsp(ctnl_pt, Status::Ok)]);
        assert_eq!(bench.app_msgs().len(), 2);
        assert_eq!(bench.state(), State::Busy);
    }

    #[test]
    fn disconnect_aborts_procedures() {
        let mut bench = connected(Features::WHEEL_REV_DATA_SUPP);
        let ctnl_pt = bench.task.profile().ctnl_pt_handle().unwrap();
        bench.request(meas(MeasFlags::WHEEL_REV_DATA_PRESENT, 1));
        bench.write(ctnl_pt, &[0x01, 0, 0, 0, 0]);
        bench.gatt_reqs();

        bench.disconnect(CONHDL);
        assert_eq!(bench.state(), State::Idle);
        assert_eq!(bench.task.deferred_len(), 0);
        assert_eq!(bench.task.profile().operation(), None);
        assert_eq!(
            bench.app_msgs(),
            [Message::DisableInd {
                conhdl: CONHDL,
                csc_meas_ntf_cfg: CCCD_NTF,
                sc_ctnl_pt_ntf_cfg: CCCD_IND
            }]
        );

        bench.disconnect(CONHDL);
        assert!(bench.app_msgs().is_empty());
    }
}
