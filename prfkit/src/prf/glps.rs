//! Glucose Service server.
//!
//! Measurements are notified one at a time, followed by their context when the context
//! characteristic exists and the peer enabled it. The Record Access Control Point (RACP) is
//! decoded here and handed to the application, which owns the record store and answers with
//! `SendRacpRsp`.

use {
    crate::{
        att::{
            to_value, AttHandle, AttributeDesc, PermRight, Permissions, Properties, ServiceLayout,
            Status,
        },
        bytes::*,
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskType},
        prf::{
            store_cccd, write_cccd, Attachment, ConType, DateTime, CCCD_IND, CCCD_NTF, CCCD_STOP,
        },
        task::{Context, Event, Profile, Transition},
        Error,
    },
    bitflags::bitflags,
};

pub const MEAS_MAX_LEN: usize = 17;
pub const MEAS_CTX_MAX_LEN: usize = 17;
/// Op code, operator, filter type and two user facing times.
pub const RACP_REQ_MAX_LEN: usize = 3 + 2 * FacingTime::SIZE;

const IDX_SVC: usize = 0;
const IDX_MEAS_CHAR: usize = 1;
const IDX_MEAS_VAL: usize = 2;
const IDX_MEAS_NTF_CFG: usize = 3;
const IDX_MEAS_CTX_CHAR: usize = 4;
const IDX_MEAS_CTX_VAL: usize = 5;
const IDX_MEAS_CTX_NTF_CFG: usize = 6;
const IDX_FEATURE_CHAR: usize = 7;
const IDX_FEATURE_VAL: usize = 8;
const IDX_RACP_CHAR: usize = 9;
const IDX_RACP_VAL: usize = 10;
const IDX_RACP_IND_CFG: usize = 11;

fn att_table() -> [AttributeDesc; 12] {
    [
        AttributeDesc::service(0x1808),
        AttributeDesc::characteristic(0x2A18, Properties::NOTIFY),
        AttributeDesc::value(0x2A18, Permissions::NOTIFY, MEAS_MAX_LEN as u16),
        AttributeDesc::cccd(),
        AttributeDesc::characteristic(0x2A34, Properties::NOTIFY),
        AttributeDesc::value(0x2A34, Permissions::NOTIFY, MEAS_CTX_MAX_LEN as u16),
        AttributeDesc::cccd(),
        AttributeDesc::characteristic(0x2A51, Properties::READ),
        AttributeDesc::value(0x2A51, Permissions::READ, 2),
        AttributeDesc::characteristic(0x2A52, Properties::WRITE | Properties::INDICATE),
        AttributeDesc::value(
            0x2A52,
            Permissions::WRITE | Permissions::INDICATE,
            RACP_REQ_MAX_LEN as u16,
        ),
        AttributeDesc::cccd(),
    ]
}

bitflags! {
    /// Which notifications and indications the peer enabled.
    pub struct EvtCfg: u8 {
        const MEAS_NTF = 0x01;
        const MEAS_CTX_NTF = 0x02;
        const RACP_IND = 0x04;
    }
}

bitflags! {
    /// Flags field of a Glucose Measurement.
    pub struct MeasFlags: u8 {
        const TIME_OFFSET_PRESENT = 0x01;
        const CONCENTRATION_TYPE_LOCATION_PRESENT = 0x02;
        /// Concentration is in mol/L rather than kg/L.
        const CONCENTRATION_MOL_L = 0x04;
        const SENSOR_STATUS_PRESENT = 0x08;
        const CONTEXT_FOLLOWS = 0x10;
    }
}

bitflags! {
    /// Flags field of a Glucose Measurement Context.
    pub struct CtxFlags: u8 {
        const CARBOHYDRATE_PRESENT = 0x01;
        const MEAL_PRESENT = 0x02;
        const TESTER_HEALTH_PRESENT = 0x04;
        const EXERCISE_PRESENT = 0x08;
        const MEDICATION_PRESENT = 0x10;
        /// Medication is in liters rather than kilograms.
        const MEDICATION_LITERS = 0x20;
        const HBA1C_PRESENT = 0x40;
        const EXTENDED_FLAGS_PRESENT = 0x80;
    }
}

/// A Glucose Measurement.
///
/// Packed as flags, sequence number and base time, then the time offset, the concentration with
/// type and sample location (one nibble each), and the sensor status annunciation, each present
/// when its flag is set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Measurement {
    pub flags: MeasFlags,
    pub seq_num: u16,
    pub base_time: DateTime,
    /// Minutes.
    pub time_offset: i16,
    /// SFLOAT.
    pub concentration: u16,
    pub sample_type: u8,
    pub sample_location: u8,
    pub sensor_status: u16,
}

impl Default for MeasFlags {
    fn default() -> Self {
        MeasFlags::empty()
    }
}

impl ToBytes for Measurement {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.flags.bits())?;
        writer.write_u16_le(self.seq_num)?;
        self.base_time.to_bytes(writer)?;
        if self.flags.contains(MeasFlags::TIME_OFFSET_PRESENT) {
            writer.write_i16_le(self.time_offset)?;
        }
        if self.flags.contains(MeasFlags::CONCENTRATION_TYPE_LOCATION_PRESENT) {
            writer.write_u16_le(self.concentration)?;
            writer.write_u8((self.sample_type << 4) | (self.sample_location & 0x0F))?;
        }
        if self.flags.contains(MeasFlags::SENSOR_STATUS_PRESENT) {
            writer.write_u16_le(self.sensor_status)?;
        }
        Ok(())
    }
}

impl FromBytes<'_> for Measurement {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let mut meas = Measurement {
            flags: MeasFlags::from_bits_truncate(bytes.read_u8()?),
            seq_num: bytes.read_u16_le()?,
            base_time: DateTime::from_bytes(bytes)?,
            ..Measurement::default()
        };
        if meas.flags.contains(MeasFlags::TIME_OFFSET_PRESENT) {
            meas.time_offset = bytes.read_i16_le()?;
        }
        if meas.flags.contains(MeasFlags::CONCENTRATION_TYPE_LOCATION_PRESENT) {
            meas.concentration = bytes.read_u16_le()?;
            let nibbles = bytes.read_u8()?;
            meas.sample_type = nibbles >> 4;
            meas.sample_location = nibbles & 0x0F;
        }
        if meas.flags.contains(MeasFlags::SENSOR_STATUS_PRESENT) {
            meas.sensor_status = bytes.read_u16_le()?;
        }
        Ok(meas)
    }
}

/// A Glucose Measurement Context.
///
/// The sequence number is taken from the measurement it is sent with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MeasContext {
    pub flags: CtxFlags,
    pub seq_num: u16,
    pub ext_flags: u8,
    pub carbo_id: u8,
    /// SFLOAT, kilograms.
    pub carbo_val: u16,
    pub meal: u8,
    pub tester: u8,
    pub health: u8,
    /// Seconds.
    pub exercise_dur: u16,
    /// Percent.
    pub exercise_intens: u8,
    pub med_id: u8,
    /// SFLOAT.
    pub med_val: u16,
    /// SFLOAT, percent.
    pub hba1c_val: u16,
}

impl Default for CtxFlags {
    fn default() -> Self {
        CtxFlags::empty()
    }
}

impl ToBytes for MeasContext {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.flags.bits())?;
        writer.write_u16_le(self.seq_num)?;
        if self.flags.contains(CtxFlags::EXTENDED_FLAGS_PRESENT) {
            writer.write_u8(self.ext_flags)?;
        }
        if self.flags.contains(CtxFlags::CARBOHYDRATE_PRESENT) {
            writer.write_u8(self.carbo_id)?;
            writer.write_u16_le(self.carbo_val)?;
        }
        if self.flags.contains(CtxFlags::MEAL_PRESENT) {
            writer.write_u8(self.meal)?;
        }
        if self.flags.contains(CtxFlags::TESTER_HEALTH_PRESENT) {
            writer.write_u8((self.tester << 4) | (self.health & 0x0F))?;
        }
        if self.flags.contains(CtxFlags::EXERCISE_PRESENT) {
            writer.write_u16_le(self.exercise_dur)?;
            writer.write_u8(self.exercise_intens)?;
        }
        if self.flags.contains(CtxFlags::MEDICATION_PRESENT) {
            writer.write_u8(self.med_id)?;
            writer.write_u16_le(self.med_val)?;
        }
        if self.flags.contains(CtxFlags::HBA1C_PRESENT) {
            writer.write_u16_le(self.hba1c_val)?;
        }
        Ok(())
    }
}

impl FromBytes<'_> for MeasContext {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let mut ctx = MeasContext {
            flags: CtxFlags::from_bits_truncate(bytes.read_u8()?),
            seq_num: bytes.read_u16_le()?,
            ..MeasContext::default()
        };
        if ctx.flags.contains(CtxFlags::EXTENDED_FLAGS_PRESENT) {
            ctx.ext_flags = bytes.read_u8()?;
        }
        if ctx.flags.contains(CtxFlags::CARBOHYDRATE_PRESENT) {
            ctx.carbo_id = bytes.read_u8()?;
            ctx.carbo_val = bytes.read_u16_le()?;
        }
        if ctx.flags.contains(CtxFlags::MEAL_PRESENT) {
            ctx.meal = bytes.read_u8()?;
        }
        if ctx.flags.contains(CtxFlags::TESTER_HEALTH_PRESENT) {
            let nibbles = bytes.read_u8()?;
            ctx.tester = nibbles >> 4;
            ctx.health = nibbles & 0x0F;
        }
        if ctx.flags.contains(CtxFlags::EXERCISE_PRESENT) {
            ctx.exercise_dur = bytes.read_u16_le()?;
            ctx.exercise_intens = bytes.read_u8()?;
        }
        if ctx.flags.contains(CtxFlags::MEDICATION_PRESENT) {
            ctx.med_id = bytes.read_u8()?;
            ctx.med_val = bytes.read_u16_le()?;
        }
        if ctx.flags.contains(CtxFlags::HBA1C_PRESENT) {
            ctx.hba1c_val = bytes.read_u16_le()?;
        }
        Ok(ctx)
    }
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum RacpOpCode(u8) {
        ReportStoredRecords = 1,
        DeleteStoredRecords = 2,
        AbortOperation = 3,
        ReportNumStoredRecords = 4,
        NumStoredRecordsRsp = 5,
        ResponseCode = 6,
    }
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum RacpOperator(u8) {
        Null = 0,
        AllRecords = 1,
        LessOrEqual = 2,
        GreaterOrEqual = 3,
        WithinRange = 4,
        FirstRecord = 5,
        LastRecord = 6,
    }
}

enum_with_unknown! {
    /// Result codes of RACP procedures.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum RacpStatus(u8) {
        Success = 1,
        OpCodeNotSupported = 2,
        InvalidOperator = 3,
        OperatorNotSupported = 4,
        InvalidOperand = 5,
        NoRecordsFound = 6,
        AbortUnsuccessful = 7,
        ProcedureNotCompleted = 8,
        OperandNotSupported = 9,
    }
}

/// A user facing time bound: base time plus offset in minutes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FacingTime {
    pub base: DateTime,
    pub offset: i16,
}

impl FacingTime {
    pub const SIZE: usize = DateTime::SIZE + 2;
}

impl FromBytes<'_> for FacingTime {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            base: DateTime::from_bytes(bytes)?,
            offset: bytes.read_i16_le()?,
        })
    }
}

/// The records an RACP request applies to. Open bounds are `None`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Filter {
    None,
    SeqNum { min: Option<u16>, max: Option<u16> },
    UserFacingTime { min: Option<FacingTime>, max: Option<FacingTime> },
}

const FILTER_SEQ_NUM: u8 = 1;
const FILTER_USER_FACING_TIME: u8 = 2;

/// A decoded RACP request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RacpReq {
    pub op_code: RacpOpCode,
    pub operator: RacpOperator,
    pub filter: Filter,
}

/// Why an RACP write was not passed on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RacpReject {
    /// The request ended early. Answered with a write error.
    Truncated,
    /// Answered with a response code indication.
    Rsp(RacpOpCode, RacpStatus),
}

impl From<Error> for RacpReject {
    fn from(_: Error) -> Self {
        RacpReject::Truncated
    }
}

impl RacpReq {
    pub fn decode(value: &[u8]) -> Result<Self, RacpReject> {
        let mut bytes = ByteReader::new(value);
        let op_code = RacpOpCode::from(bytes.read_u8()?);
        let operator = RacpOperator::from(bytes.read_u8()?);
        let req = |filter| RacpReq {
            op_code,
            operator,
            filter,
        };

        match op_code {
            RacpOpCode::AbortOperation => return Ok(req(Filter::None)),
            RacpOpCode::ReportStoredRecords
            | RacpOpCode::DeleteStoredRecords
            | RacpOpCode::ReportNumStoredRecords => {}
            _ => return Err(RacpReject::Rsp(op_code, RacpStatus::OpCodeNotSupported)),
        }

        let (min, max) = match operator {
            RacpOperator::AllRecords | RacpOperator::FirstRecord | RacpOperator::LastRecord => {
                return Ok(req(Filter::None))
            }
            RacpOperator::LessOrEqual => (false, true),
            RacpOperator::GreaterOrEqual => (true, false),
            RacpOperator::WithinRange => (true, true),
            _ => return Err(RacpReject::Rsp(op_code, RacpStatus::OperatorNotSupported)),
        };

        let filter = match bytes.read_u8()? {
            FILTER_SEQ_NUM => {
                let min = if min { Some(bytes.read_u16_le()?) } else { None };
                let max = if max { Some(bytes.read_u16_le()?) } else { None };
                Filter::SeqNum { min, max }
            }
            FILTER_USER_FACING_TIME => {
                let min = if min { Some(FacingTime::from_bytes(&mut bytes)?) } else { None };
                let max = if max { Some(FacingTime::from_bytes(&mut bytes)?) } else { None };
                Filter::UserFacingTime { min, max }
            }
            _ => return Err(RacpReject::Rsp(op_code, RacpStatus::OperandNotSupported)),
        };
        Ok(req(filter))
    }
}

/// An RACP response indication.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RacpRsp {
    /// `[5, 0, count]`
    NumStoredRecords(u16),
    /// `[6, 0, request op code, status]`
    Status { req_op: RacpOpCode, status: RacpStatus },
}

impl ToBytes for RacpRsp {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match *self {
            RacpRsp::NumStoredRecords(count) => {
                writer.write_u8(RacpOpCode::NumStoredRecordsRsp.into())?;
                writer.write_u8(RacpOperator::Null.into())?;
                writer.write_u16_le(count)
            }
            RacpRsp::Status { req_op, status } => {
                writer.write_u8(RacpOpCode::ResponseCode.into())?;
                writer.write_u8(RacpOperator::Null.into())?;
                writer.write_u8(req_op.into())?;
                writer.write_u8(status.into())
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CreateDb {
    /// Adds the Glucose Measurement Context characteristic.
    pub meas_ctx_supported: bool,
    /// Glucose Feature characteristic value.
    pub features: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Enable {
    pub conhdl: ConHdl,
    pub sec_lvl: PermRight,
    pub con_type: ConType,
    /// Configuration kept for a bonded peer.
    pub evt_cfg: EvtCfg,
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
        evt_cfg: EvtCfg,
    },
    /// Notifies a measurement, and its context if given and enabled.
    SendMeas {
        conhdl: ConHdl,
        meas: Measurement,
        ctx: Option<MeasContext>,
    },
    SendMeasCmp {
        conhdl: ConHdl,
        status: Status,
    },
    /// The peer wrote a valid RACP request.
    RacpReqInd {
        conhdl: ConHdl,
        req: RacpReq,
    },
    /// Ends the current RACP procedure.
    SendRacpRsp {
        conhdl: ConHdl,
        rsp: RacpRsp,
    },
    SendRacpRspCmp {
        conhdl: ConHdl,
        status: Status,
    },
    CfgIndNtfInd {
        conhdl: ConHdl,
        evt_cfg: EvtCfg,
    },
    ErrorInd {
        conhdl: ConHdl,
        status: Status,
    },
}

/// Configuration bits and the CCCD value that switches each on.
static CCCDS: [(EvtCfg, u16); 3] = [
    (EvtCfg::MEAS_NTF, CCCD_NTF),
    (EvtCfg::MEAS_CTX_NTF, CCCD_NTF),
    (EvtCfg::RACP_IND, CCCD_IND),
];

/// Who sent the outstanding RACP indication.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RacpInd {
    App,
    Profile,
}

/// Glucose Service server role.
pub struct Glps {
    con: Attachment,
    layout: Option<ServiceLayout>,
    evt_cfg: EvtCfg,
    racp_in_progress: bool,
    racp_ind: Option<RacpInd>,
    /// Context to notify once the measurement notification completes.
    pending_ctx: Option<MeasContext>,
}

impl Glps {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            layout: None,
            evt_cfg: EvtCfg::empty(),
            racp_in_progress: false,
            racp_ind: None,
            pending_ctx: None,
        }
    }

    fn attr(&self, idx: usize) -> Option<AttHandle> {
        self.layout.and_then(|layout| layout.handle(idx))
    }

    pub fn meas_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_MEAS_VAL)
    }

    pub fn meas_ctx_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_MEAS_CTX_VAL)
    }

    pub fn feature_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_FEATURE_VAL)
    }

    pub fn racp_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_RACP_VAL)
    }

    /// Handle of the client configuration descriptor controlling `bit`.
    pub fn cfg_handle(&self, bit: EvtCfg) -> Option<AttHandle> {
        if bit == EvtCfg::MEAS_NTF {
            self.attr(IDX_MEAS_NTF_CFG)
        } else if bit == EvtCfg::MEAS_CTX_NTF {
            self.attr(IDX_MEAS_CTX_NTF_CFG)
        } else if bit == EvtCfg::RACP_IND {
            self.attr(IDX_RACP_IND_CFG)
        } else {
            None
        }
    }

    pub fn evt_cfg(&self) -> EvtCfg {
        self.evt_cfg
    }

    pub fn racp_in_progress(&self) -> bool {
        self.racp_in_progress
    }

    fn create_db(&mut self, params: &CreateDb, ctx: &mut Context<'_>) -> Result<(), Status> {
        let mut cfg = crate::att::cfg_mask(&[
            IDX_SVC,
            IDX_MEAS_CHAR,
            IDX_MEAS_VAL,
            IDX_MEAS_NTF_CFG,
            IDX_FEATURE_CHAR,
            IDX_FEATURE_VAL,
            IDX_RACP_CHAR,
            IDX_RACP_VAL,
            IDX_RACP_IND_CFG,
        ]);
        if params.meas_ctx_supported {
            cfg |= crate::att::cfg_mask(&[
                IDX_MEAS_CTX_CHAR,
                IDX_MEAS_CTX_VAL,
                IDX_MEAS_CTX_NTF_CFG,
            ]);
        }

        let layout = ctx.db.create_db(&att_table(), cfg, ctx.id())?;
        self.layout = Some(layout);
        let feature = self.feature_handle().ok_or(Status::InexistentHandle)?;
        ctx.db.set_value(feature, &params.features.to_le_bytes())?;
        ctx.db.set_permission(layout.start(), PermRight::Disabled)
    }

    /// The (descriptor, allowed value) pairs of every configuration bit present in the database.
    fn cccds(&self) -> impl Iterator<Item = (EvtCfg, AttHandle, u16)> + '_ {
        CCCDS
            .iter()
            .filter_map(move |&(bit, allowed)| {
                self.cfg_handle(bit).map(|handle| (bit, handle, allowed))
            })
    }

    fn apply_enable(&mut self, params: &Enable, ctx: &mut Context<'_>) -> Result<(), Status> {
        let requested = match params.con_type {
            ConType::Normal => params.evt_cfg,
            ConType::Discovery => EvtCfg::empty(),
        };
        let mut evt_cfg = EvtCfg::empty();
        for (bit, handle, allowed) in self.cccds() {
            let value = if requested.contains(bit) {
                evt_cfg |= bit;
                allowed
            } else {
                CCCD_STOP
            };
            write_cccd(ctx.db, handle, value)?;
        }
        let svc = self.layout.map(|l| l.start()).ok_or(Status::InexistentHandle)?;
        ctx.db.set_permission(svc, params.sec_lvl)?;
        self.evt_cfg = evt_cfg;
        Ok(())
    }

    fn enable(&mut self, params: Enable, ctx: &mut Context<'_>) -> Transition<Message> {
        let conhdl = params.conhdl;
        let result = if ctx.is_connected(conhdl) {
            self.apply_enable(&params, ctx)
        } else {
            warn!("glps: enable for unknown connection {:#06x}", conhdl);
            Err(Status::ReqDisallowed)
        };

        match result {
            Ok(()) => {
                self.con.attach(conhdl, ctx.src());
                self.racp_in_progress = false;
                self.racp_ind = None;
                self.pending_ctx = None;
                Transition::to(State::Connected)
            }
            Err(status) => {
                self.evt_cfg = EvtCfg::empty();
                Transition::to(State::Idle).send(ctx.src(), Message::ErrorInd { conhdl, status })
            }
        }
    }

    fn notify(
        &self,
        conhdl: ConHdl,
        handle: Option<AttHandle>,
        value: &dyn ToBytes,
        ctx: &mut Context<'_>,
    ) -> Result<GattReq, Status> {
        let handle = handle.ok_or(Status::InexistentHandle)?;
        let mut buf = [0; MEAS_MAX_LEN];
        let len = encode_into(value, &mut buf)?;
        ctx.db.set_value(handle, &buf[..len])?;
        Ok(GattReq::Notify { conhdl, handle })
    }

    fn send_meas(
        &mut self,
        conhdl: ConHdl,
        meas: &Measurement,
        meas_ctx: Option<MeasContext>,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let with_ctx =
            self.meas_ctx_handle().is_some() && self.evt_cfg.contains(EvtCfg::MEAS_CTX_NTF);
        match self.notify(conhdl, self.meas_handle(), meas, ctx) {
            Ok(ntf) => {
                self.pending_ctx = meas_ctx.filter(|_| with_ctx).map(|mut c| {
                    c.seq_num = meas.seq_num;
                    c
                });
                Transition::to(State::Busy).gatt(ntf)
            }
            Err(status) => {
                Transition::to(State::Connected)
                    .send(self.con.app(), Message::SendMeasCmp { conhdl, status })
            }
        }
    }

    /// Continues a measurement once its notification went out.
    fn meas_sent(
        &mut self,
        conhdl: ConHdl,
        status: Status,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let next = match self.pending_ctx.take() {
            Some(meas_ctx) if status.is_ok() => {
                self.notify(conhdl, self.meas_ctx_handle(), &meas_ctx, ctx)
            }
            _ => {
                return Transition::to(State::Connected)
                    .send(self.con.app(), Message::SendMeasCmp { conhdl, status })
            }
        };
        match next {
            Ok(ntf) => Transition::to(State::Busy).gatt(ntf),
            Err(status) => {
                Transition::to(State::Connected)
                    .send(self.con.app(), Message::SendMeasCmp { conhdl, status })
            }
        }
    }

    fn indicate_racp(
        &mut self,
        conhdl: ConHdl,
        rsp: &RacpRsp,
        src: RacpInd,
        ctx: &mut Context<'_>,
    ) -> Result<GattReq, Status> {
        if !self.evt_cfg.contains(EvtCfg::RACP_IND) {
            return Err(Status::IndDisabled);
        }
        let handle = self.racp_handle().ok_or(Status::InexistentHandle)?;
        let value = to_value(rsp)?;
        ctx.db.set_value(handle, &value)?;
        self.racp_ind = Some(src);
        Ok(GattReq::Indicate { conhdl, handle })
    }

    fn write_racp(
        &mut self,
        state: State,
        conhdl: ConHdl,
        handle: AttHandle,
        value: &[u8],
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let t = Transition::to(state);
        let rsp = |status| GattReq::WriteRsp { conhdl, handle, status };
        if !self.evt_cfg.contains(EvtCfg::RACP_IND) {
            return t.gatt(rsp(Status::CccdImproperlyConfigured));
        }

        match RacpReq::decode(value) {
            Ok(req) if self.racp_in_progress && req.op_code != RacpOpCode::AbortOperation => {
                t.gatt(rsp(Status::ProcedureInProgress))
            }
            Ok(req) => {
                self.racp_in_progress = true;
                t.gatt(rsp(Status::Ok)).send(self.con.app(), Message::RacpReqInd { conhdl, req })
            }
            Err(RacpReject::Truncated) => t.gatt(rsp(Status::AppError)),
            Err(RacpReject::Rsp(req_op, status)) if !self.racp_in_progress => {
                debug!("glps: refusing RACP request {:?}: {:?}", crate::HexSlice(value), status);
                let t = t.gatt(rsp(Status::Ok));
                let racp_rsp = RacpRsp::Status { req_op, status };
                match self.indicate_racp(conhdl, &racp_rsp, RacpInd::Profile, ctx) {
                    Ok(ind) => {
                        self.racp_in_progress = true;
                        t.gatt(ind)
                    }
                    Err(status) => {
                        warn!("glps: RACP response not sent: {:?}", status);
                        t
                    }
                }
            }
            Err(RacpReject::Rsp(..)) => t.gatt(rsp(Status::ProcedureInProgress)),
        }
    }

    fn write_cfg(
        &mut self,
        state: State,
        conhdl: ConHdl,
        handle: AttHandle,
        value: &[u8],
        last: bool,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let (bit, allowed) = match self.cccds().find(|&(_, h, _)| h == handle) {
            Some((bit, _, allowed)) => (bit, allowed),
            None => {
                debug!("glps: write to unhandled attribute {:?}", handle);
                return Transition::to(state);
            }
        };

        let mut t = Transition::to(state);
        let status = match store_cccd(ctx.db, handle, value, allowed) {
            Ok(cfg) => {
                self.evt_cfg.set(bit, cfg != CCCD_STOP);
                if last {
                    t = t.send(
                        self.con.app(),
                        Message::CfgIndNtfInd {
                            conhdl,
                            evt_cfg: self.evt_cfg,
                        },
                    );
                }
                Status::Ok
            }
            Err(status) => status,
        };
        t.gatt(GattReq::WriteRsp { conhdl, handle, status })
    }

    fn gatt_event(
        &mut self,
        state: State,
        evt: GattEvent,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        match evt {
            GattEvent::Write {
                conhdl,
                handle,
                value,
                last,
                ..
            } => {
                if Some(handle) == self.racp_handle() {
                    self.write_racp(state, conhdl, handle, &value, ctx)
                } else {
                    self.write_cfg(state, conhdl, handle, &value, last, ctx)
                }
            }
            GattEvent::NotifyCmp { conhdl, status, .. } if state == State::Busy => {
                self.meas_sent(conhdl, status, ctx)
            }
            GattEvent::HandleValueCfm { conhdl, status, .. } => match self.racp_ind.take() {
                Some(src) => {
                    self.racp_in_progress = false;
                    let t = Transition::to(state);
                    if src == RacpInd::App {
                        t.send(self.con.app(), Message::SendRacpRspCmp { conhdl, status })
                    } else {
                        t
                    }
                }
                None => Transition::to(state),
            },
            other => {
                debug!("glps: ignoring {:?} in {:?}", other, state);
                Transition::to(state)
            }
        }
    }

    fn disable(&mut self, ctx: &mut Context<'_>) -> Transition<Message> {
        let con = match self.con.detach() {
            Some(con) => con,
            None => return Transition::to(State::Idle),
        };
        let evt_cfg = self.evt_cfg;
        self.evt_cfg = EvtCfg::empty();
        self.racp_in_progress = false;
        self.racp_ind = None;
        self.pending_ctx = None;

        if let Some(layout) = self.layout {
            if let Err(status) = ctx.db.set_permission(layout.start(), PermRight::Disabled) {
                warn!("glps: failed to hide service: {:?}", status);
            }
        }

        info!("glps: disabled on {:#06x}", con.conhdl);
        Transition::to(State::Idle).send(
            con.app,
            Message::DisableInd {
                conhdl: con.conhdl,
                evt_cfg,
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
                        warn!("glps: create_db failed: {:?}", status);
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

            (state, Message::SendMeas { conhdl, meas, ctx: meas_ctx })
                if state >= State::Connected =>
            {
                let cmp = |status| Message::SendMeasCmp { conhdl, status };
                if !self.con.owns(conhdl) {
                    Transition::to(state).send(ctx.src(), cmp(Status::InvalidParam))
                } else if !self.evt_cfg.contains(EvtCfg::MEAS_NTF) {
                    Transition::to(state).send(ctx.src(), cmp(Status::NtfDisabled))
                } else if state == State::Busy {
                    Transition::save(Event::Request(Message::SendMeas {
                        conhdl,
                        meas,
                        ctx: meas_ctx,
                    }))
                } else {
                    self.send_meas(conhdl, &meas, meas_ctx, ctx)
                }
            }
            (state, Message::SendMeas { conhdl, .. }) => Transition::to(state).send(
                ctx.src(),
                Message::SendMeasCmp {
                    conhdl,
                    status: Status::ReqDisallowed,
                },
            ),

            (state, Message::SendRacpRsp { conhdl, rsp })
                if state >= State::Connected && self.con.owns(conhdl) =>
            {
                match self.indicate_racp(conhdl, &rsp, RacpInd::App, ctx) {
                    Ok(ind) => Transition::to(state).gatt(ind),
                    Err(status) => {
                        Transition::to(state)
                            .send(ctx.src(), Message::SendRacpRspCmp { conhdl, status })
                    }
                }
            }
            (state, Message::SendRacpRsp { conhdl, .. }) => {
                let status = if state >= State::Connected {
                    Status::InvalidParam
                } else {
                    Status::ReqDisallowed
                };
                Transition::to(state).send(ctx.src(), Message::SendRacpRspCmp { conhdl, status })
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
                debug!("glps: ignoring {:?} in {:?}", msg, state);
                Transition::to(state)
            }
        }
    }
}

impl Default for Glps {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Glps {
    type Message = Message;
    const TYPE: TaskType = TaskType::Glps;

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
                debug!("glps: dropping {:?} in {:?}", evt, state);
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
            Event::Request(Message::SendMeas { conhdl, .. }) => {
                Transition::to(state).send(ctx.src(), Message::SendMeasCmp { conhdl, status })
            }
            other => Transition::save(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prf::testing::{Bench, CONHDL};

    const TIME: DateTime = DateTime {
        year: 2014,
        month: 3,
        day: 9,
        hour: 7,
        min: 30,
        sec: 0,
    };

    fn connected(evt_cfg: EvtCfg) -> Bench<Glps> {
        let mut bench = Bench::new(Glps::new());
        bench.request(Message::CreateDb(CreateDb {
            meas_ctx_supported: true,
            features: 0x0403,
        }));
        assert_eq!(bench.app_msgs(), [Message::CreateDbCfm { status: Status::Ok }]);
        bench.request(Message::Enable(Enable {
            conhdl: CONHDL,
            sec_lvl: PermRight::Enabled,
            con_type: ConType::Normal,
            evt_cfg,
        }));
        assert_eq!(bench.state(), State::Connected);
        bench
    }

    fn full_meas() -> Measurement {
        Measurement {
            flags: MeasFlags::all(),
            seq_num: 7,
            base_time: TIME,
            time_offset: -30,
            concentration: 0xB05A,
            sample_type: 1,
            sample_location: 2,
            sensor_status: 0x0102,
        }
    }

    fn full_ctx() -> MeasContext {
        MeasContext {
            flags: CtxFlags::all(),
            seq_num: 7,
            ext_flags: 0,
            carbo_id: 1,
            carbo_val: 0xD032,
            meal: 2,
            tester: 1,
            health: 3,
            exercise_dur: 3600,
            exercise_intens: 50,
            med_id: 4,
            med_val: 0xC00A,
            hba1c_val: 0xF046,
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
    fn measurement_packing() {
        let meas = full_meas();
        let value = to_value(&meas).unwrap();
        assert_eq!(value.len(), MEAS_MAX_LEN);
        assert_eq!(&value[..4], &[0x1F, 7, 0, 0xDE]);
        assert_eq!(value[14], 0x12);
        assert_eq!(decode_exact::<Measurement>(&value), Ok(meas));

        let short = Measurement {
            flags: MeasFlags::CONCENTRATION_MOL_L,
            ..full_meas()
        };
        let value = to_value(&short).unwrap();
        assert_eq!(value.len(), 10);
        let back = decode_exact::<Measurement>(&value).unwrap();
        assert_eq!(back.seq_num, 7);
        assert_eq!(back.base_time, TIME);
        assert_eq!(back.concentration, 0);

        assert_eq!(decode_exact::<Measurement>(&to_value(&meas).unwrap()[..16]), Err(Error::Eof));
    }

    #[test]
    fn context_packing() {
        let ctx = full_ctx();
        let value = to_value(&ctx).unwrap();
        assert_eq!(value.len(), MEAS_CTX_MAX_LEN);
        assert_eq!(&value[..5], &[0xFF, 7, 0, 0, 1]);
        assert_eq!(decode_exact::<MeasContext>(&value), Ok(ctx));

        let meal_only = MeasContext {
            flags: CtxFlags::MEAL_PRESENT,
            ..full_ctx()
        };
        assert_eq!(&to_value(&meal_only).unwrap()[..], &[0x02, 7, 0, 2]);
    }

    #[test]
    fn racp_decoding() {
        assert_eq!(
            RacpReq::decode(&[1, 1]),
            Ok(RacpReq {
                op_code: RacpOpCode::ReportStoredRecords,
                operator: RacpOperator::AllRecords,
                filter: Filter::None,
            })
        );
        assert_eq!(
            RacpReq::decode(&[4, 4, 1, 0x10, 0, 0x20, 0]).map(|r| r.filter),
            Ok(Filter::SeqNum {
                min: Some(0x10),
                max: Some(0x20)
            })
        );
        assert_eq!(
            RacpReq::decode(&[2, 2, 1, 0x20, 0]).map(|r| r.filter),
            Ok(Filter::SeqNum {
                min: None,
                max: Some(0x20)
            })
        );
        let since = [1, 3, 2, 0xDE, 0x07, 3, 9, 7, 30, 0, 0x10, 0];
        assert_eq!(
            RacpReq::decode(&since).map(|r| r.filter),
            Ok(Filter::UserFacingTime {
                min: Some(FacingTime {
                    base: TIME,
                    offset: 16
                }),
                max: None
            })
        );
        assert_eq!(RacpReq::decode(&[3, 0]).map(|r| r.op_code), Ok(RacpOpCode::AbortOperation));

        assert_eq!(RacpReq::decode(&[1]), Err(RacpReject::Truncated));
        assert_eq!(RacpReq::decode(&[1, 4, 1, 0x10, 0]), Err(RacpReject::Truncated));
        assert_eq!(RacpReq::decode(&[1, 2]), Err(RacpReject::Truncated));
        assert_eq!(
            RacpReq::decode(&[9, 1]),
            Err(RacpReject::Rsp(RacpOpCode::Unknown(9), RacpStatus::OpCodeNotSupported))
        );
        assert_eq!(
            RacpReq::decode(&[1, 7]),
            Err(RacpReject::Rsp(RacpOpCode::ReportStoredRecords, RacpStatus::OperatorNotSupported))
        );
        assert_eq!(
            RacpReq::decode(&[1, 3, 3, 0, 0]),
            Err(RacpReject::Rsp(RacpOpCode::ReportStoredRecords, RacpStatus::OperandNotSupported))
        );
    }

    #[test]
    fn measurement_with_context() {
        let mut bench = connected(EvtCfg::all());
        let meas_handle = bench.task.profile().meas_handle().unwrap();
        let ctx_handle = bench.task.profile().meas_ctx_handle().unwrap();
        let mut ctx = full_ctx();
        ctx.seq_num = 0;

        bench.request(Message::SendMeas {
            conhdl: CONHDL,
            meas: full_meas(),
            ctx: Some(ctx),
        });
        assert_eq!(bench.state(), State::Busy);
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::Notify {
                conhdl: CONHDL,
                handle: meas_handle
            }]
        );

        bench.gatt(GattEvent::NotifyCmp {
            conhdl: CONHDL,
            handle: meas_handle,
            status: Status::Ok,
        });
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::Notify {
                conhdl: CONHDL,
                handle: ctx_handle
            }]
        );
        assert_eq!(decode_exact::<MeasContext>(&bench.value(ctx_handle)).unwrap().seq_num, 7);
        assert!(bench.app_msgs().is_empty());

        bench.gatt(GattEvent::NotifyCmp {
            conhdl: CONHDL,
            handle: ctx_handle,
            status: Status::Ok,
        });
        assert_eq!(bench.state(), State::Connected);
        assert_eq!(
            bench.app_msgs(),
            [Message::SendMeasCmp {
                conhdl: CONHDL,
                status: Status::Ok
            }]
        );
    }

    #[test]
    fn context_skipped_when_disabled() {
        let mut bench = connected(EvtCfg::MEAS_NTF);
        let meas_handle = bench.task.profile().meas_handle().unwrap();
        bench.request(Message::SendMeas {
            conhdl: CONHDL,
            meas: full_meas(),
            ctx: Some(full_ctx()),
        });
        bench.request(Message::SendMeas {
            conhdl: CONHDL,
            meas: full_meas(),
            ctx: None,
        });
        assert_eq!(bench.task.deferred_len(), 1);

        bench.gatt(GattEvent::NotifyCmp {
            conhdl: CONHDL,
            handle: meas_handle,
            status: Status::Ok,
        });
        assert_eq!(bench.app_msgs().len(), 1);
        assert_eq!(bench.gatt_reqs().len(), 2);
        assert_eq!(bench.state(), State::Busy);
    }

    #[test]
    fn measurement_needs_notifications() {
        let mut bench = connected(EvtCfg::RACP_IND);
        bench.request(Message::SendMeas {
            conhdl: CONHDL,
            meas: full_meas(),
            ctx: None,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::SendMeasCmp {
                conhdl: CONHDL,
                status: Status::NtfDisabled
            }]
        );
    }

    #[test]
    fn racp_procedure() {
        let mut bench = connected(EvtCfg::all());
        let racp = bench.task.profile().racp_handle().unwrap();

        bench.write(racp, &[4, 1]);
        assert_eq!(bench.gatt_reqs(), [write_rsp(racp, Status::Ok)]);
        assert_eq!(
            bench.app_msgs(),
            [Message::RacpReqInd {
                conhdl: CONHDL,
                req: RacpReq {
                    op_code: RacpOpCode::ReportNumStoredRecords,
                    operator: RacpOperator::AllRecords,
                    filter: Filter::None,
                }
            }]
        );

        bench.write(racp, &[1, 1]);
        assert_eq!(bench.gatt_reqs(), [write_rsp(racp, Status::ProcedureInProgress)]);
        assert!(bench.app_msgs().is_empty());

        bench.request(Message::SendRacpRsp {
            conhdl: CONHDL,
            rsp: RacpRsp::NumStoredRecords(3),
        });
        assert_eq!(bench.value(racp), [5, 0, 3, 0]);
        assert_eq!(bench.gatt_reqs(), [GattReq::Indicate { conhdl: CONHDL, handle: racp }]);

        bench.gatt(GattEvent::HandleValueCfm {
            conhdl: CONHDL,
            handle: racp,
            status: Status::Ok,
        });
        assert!(!bench.task.profile().racp_in_progress());
        assert_eq!(
            bench.app_msgs(),
            [Message::SendRacpRspCmp {
                conhdl: CONHDL,
                status: Status::Ok
            }]
        );
    }

    #[test]
    fn abort_is_accepted_during_a_procedure() {
        let mut bench = connected(EvtCfg::RACP_IND);
        let racp = bench.task.profile().racp_handle().unwrap();
        bench.write(racp, &[1, 1]);
        bench.app_msgs();
        bench.gatt_reqs();

        bench.write(racp, &[3, 0]);
        assert_eq!(bench.gatt_reqs(), [write_rsp(racp, Status::Ok)]);
        assert_eq!(bench.app_msgs().len(), 1);
    }

    #[test]
    fn invalid_racp_requests() {
        let mut bench = connected(EvtCfg::RACP_IND);
        let racp = bench.task.profile().racp_handle().unwrap();

        bench.write(racp, &[1]);
        assert_eq!(bench.gatt_reqs(), [write_rsp(racp, Status::AppError)]);
        assert!(!bench.task.profile().racp_in_progress());

        bench.write(racp, &[1, 9]);
        assert_eq!(
            bench.gatt_reqs(),
            [
                write_rsp(racp, Status::Ok),
                GattReq::Indicate {
                    conhdl: CONHDL,
                    handle: racp
                }
            ]
        );
        assert_eq!(bench.value(racp), [6, 0, 1, 4]);
        assert!(bench.app_msgs().is_empty());

        bench.gatt(GattEvent::HandleValueCfm {
            conhdl: CONHDL,
            handle: racp,
            status: Status::Ok,
        });
        assert!(!bench.task.profile().racp_in_progress());
        assert!(bench.app_msgs().is_empty());
    }

    #[test]
    fn racp_needs_indications() {
        let mut bench = connected(EvtCfg::MEAS_NTF);
        let racp = bench.task.profile().racp_handle().unwrap();
        bench.write(racp, &[1, 1]);
        assert_eq!(bench.gatt_reqs(), [write_rsp(racp, Status::CccdImproperlyConfigured)]);

        bench.request(Message::SendRacpRsp {
            conhdl: CONHDL,
            rsp: RacpRsp::NumStoredRecords(0),
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::SendRacpRspCmp {
                conhdl: CONHDL,
                status: Status::IndDisabled
            }]
        );
    }

    #[test]
    fn cccd_writes_update_event_config() {
        let mut bench = connected(EvtCfg::empty());
        let cfg = bench.task.profile().cfg_handle(EvtCfg::RACP_IND).unwrap();

        bench.write(cfg, &[0x02, 0x00]);
        assert_eq!(bench.task.profile().evt_cfg(), EvtCfg::RACP_IND);
        assert_eq!(
            bench.app_msgs(),
            [Message::CfgIndNtfInd {
                conhdl: CONHDL,
                evt_cfg: EvtCfg::RACP_IND
            }]
        );
        bench.gatt_reqs();

        bench.write(cfg, &[0x01, 0x00]);
        assert_eq!(bench.gatt_reqs(), [write_rsp(cfg, Status::AppError)]);
        assert_eq!(bench.task.profile().evt_cfg(), EvtCfg::RACP_IND);
    }

    #[test]
    fn disconnect_reports_event_config() {
        let mut bench = connected(EvtCfg::MEAS_NTF | EvtCfg::RACP_IND);
        bench.disconnect(CONHDL);
        assert_eq!(
            bench.app_msgs(),
            [Message::DisableInd {
                conhdl: CONHDL,
                evt_cfg: EvtCfg::MEAS_NTF | EvtCfg::RACP_IND
            }]
        );
        assert_eq!(bench.task.profile().evt_cfg(), EvtCfg::empty());
        assert_eq!(bench.state(), State::Idle);

        bench.disconnect(CONHDL);
        assert!(bench.app_msgs().is_empty());
    }
}
