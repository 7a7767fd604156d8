//! Heart Rate Service server.

use {
    crate::{
        att::{
            to_value, AttHandle, AttributeDesc, PermRight, Permissions, Properties, ServiceLayout,
            Status,
        },
        bytes::*,
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskType},
        prf::{store_cccd, write_cccd, Attachment, ConType, CCCD_NTF, CCCD_STOP},
        task::{Context, Event, Profile, Transition},
        Error,
    },
    bitflags::bitflags,
    heapless::{consts::U4, Vec},
};

/// Maximum number of RR-Interval values carried by one measurement.
pub const MAX_RR_INTERVALS: usize = 4;

/// Largest packed measurement: flags, 16-bit rate, energy expended and all RR-Intervals.
pub const MEAS_MAX_LEN: usize = 1 + 2 + 2 + 2 * MAX_RR_INTERVALS;

/// Control point value that resets the energy expended.
pub const CTNL_PT_RESET_ENERGY_EXP: u8 = 0x01;

/// Write response status for unsupported control point values.
pub const CTNL_PT_NOT_SUPPORTED: Status = Status::AppError;

const IDX_SVC: usize = 0;
const IDX_MEAS_CHAR: usize = 1;
const IDX_MEAS_VAL: usize = 2;
const IDX_MEAS_NTF_CFG: usize = 3;
const IDX_BODY_SENSOR_LOC_CHAR: usize = 4;
const IDX_BODY_SENSOR_LOC_VAL: usize = 5;
const IDX_CTNL_PT_CHAR: usize = 6;
const IDX_CTNL_PT_VAL: usize = 7;

fn att_table() -> [AttributeDesc; 8] {
    [
        AttributeDesc::service(0x180D),
        AttributeDesc::characteristic(0x2A37, Properties::NOTIFY),
        AttributeDesc::value(0x2A37, Permissions::NOTIFY, MEAS_MAX_LEN as u16),
        AttributeDesc::cccd(),
        AttributeDesc::characteristic(0x2A38, Properties::READ),
        AttributeDesc::value(0x2A38, Permissions::READ, 1),
        AttributeDesc::characteristic(0x2A39, Properties::WRITE),
        AttributeDesc::value(0x2A39, Permissions::WRITE, 1),
    ]
}

bitflags! {
    /// Optional characteristics of the service.
    pub struct Features: u8 {
        const BODY_SENSOR_LOC_CHAR_SUP = 0x01;
        /// Energy expended is reported, which adds the Heart Rate Control Point.
        const ENGY_EXP_FEAT_SUP = 0x02;
    }
}

bitflags! {
    /// Flags field of a Heart Rate Measurement.
    pub struct MeasFlags: u8 {
        /// The heart rate is a 16-bit value.
        const HR_U16 = 0x01;
        const SENSOR_CONTACT_DETECTED = 0x02;
        const SENSOR_CONTACT_SUPPORTED = 0x04;
        const ENERGY_EXPENDED_PRESENT = 0x08;
        const RR_INTERVAL_PRESENT = 0x10;
    }
}

enum_with_unknown! {
    /// Value of the Body Sensor Location characteristic.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum BodySensorLocation(u8) {
        Other = 0,
        Chest = 1,
        Wrist = 2,
        Finger = 3,
        Hand = 4,
        EarLobe = 5,
        Foot = 6,
    }
}

/// A Heart Rate Measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub flags: MeasFlags,
    /// Beats per minute. Values above 255 force the 16-bit format.
    pub heart_rate: u16,
    /// Kilojoules, present with `ENERGY_EXPENDED_PRESENT`.
    pub energy_expended: u16,
    /// In units of 1/1024 second, present with `RR_INTERVAL_PRESENT`.
    pub rr_intervals: Vec<u16, U4>,
}

impl Measurement {
    fn packed_flags(&self) -> MeasFlags {
        if self.heart_rate > 0xFF {
            self.flags | MeasFlags::HR_U16
        } else {
            self.flags
        }
    }
}

impl ToBytes for Measurement {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let flags = self.packed_flags();
        writer.write_u8(flags.bits())?;
        if flags.contains(MeasFlags::HR_U16) {
            writer.write_u16_le(self.heart_rate)?;
        } else {
            writer.write_u8(self.heart_rate as u8)?;
        }
        if flags.contains(MeasFlags::ENERGY_EXPENDED_PRESENT) {
            writer.write_u16_le(self.energy_expended)?;
        }
        if flags.contains(MeasFlags::RR_INTERVAL_PRESENT) {
            for rr in self.rr_intervals.iter() {
                writer.write_u16_le(*rr)?;
            }
        }
        Ok(())
    }
}

impl FromBytes<'_> for Measurement {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let flags = MeasFlags::from_bits_truncate(bytes.read_u8()?);
        let heart_rate = if flags.contains(MeasFlags::HR_U16) {
            bytes.read_u16_le()?
        } else {
            u16::from(bytes.read_u8()?)
        };
        let energy_expended = if flags.contains(MeasFlags::ENERGY_EXPENDED_PRESENT) {
            bytes.read_u16_le()?
        } else {
            0
        };
        let mut rr_intervals = Vec::new();
        if flags.contains(MeasFlags::RR_INTERVAL_PRESENT) {
            if bytes.bytes_left() % 2 != 0 {
                return Err(Error::InvalidLength);
            }
            while !bytes.is_empty() {
                rr_intervals
                    .push(bytes.read_u16_le()?)
                    .map_err(|_| Error::InvalidLength)?;
            }
        }
        Ok(Self {
            flags,
            heart_rate,
            energy_expended,
            rr_intervals,
        })
    }
}

/// Parameters of [`Message::Enable`].
///
/// [`Message::Enable`]: enum.Message.html#variant.Enable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enable {
    pub conhdl: ConHdl,
    pub sec_lvl: PermRight,
    pub con_type: ConType,
    /// Measurement client configuration kept for a bonded peer.
    pub hr_meas_ntf_cfg: u16,
    pub body_sensor_loc: BodySensorLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CreateDb {
        features: Features,
    },
    CreateDbCfm {
        status: Status,
    },
    Enable(Enable),
    Disable {
        conhdl: ConHdl,
    },
    DisableInd {
        conhdl: ConHdl,
        hr_meas_ntf_cfg: u16,
    },
    /// Notifies a measurement.
    MeasSend {
        conhdl: ConHdl,
        meas: Measurement,
    },
    MeasSendCfm {
        conhdl: ConHdl,
        status: Status,
    },
    /// The peer changed the measurement client configuration.
    CfgIndNtfInd {
        conhdl: ConHdl,
        cfg_val: u16,
    },
    /// The peer asked to reset the energy expended.
    EnergyExpResetInd {
        conhdl: ConHdl,
    },
    ErrorInd {
        conhdl: ConHdl,
        status: Status,
    },
}

/// Heart Rate Service server role.
pub struct Hrps {
    con: Attachment,
    layout: Option<ServiceLayout>,
    features: Features,
    ntf: bool,
}

impl Hrps {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            layout: None,
            features: Features::empty(),
            ntf: false,
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

    pub fn body_sensor_loc_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_BODY_SENSOR_LOC_VAL)
    }

    pub fn ctnl_pt_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_CTNL_PT_VAL)
    }

    pub fn service_handle(&self) -> Option<AttHandle> {
        self.layout.map(|layout| layout.start())
    }

    pub fn ntf_enabled(&self) -> bool {
        self.ntf
    }

    fn create_db(&mut self, features: Features, ctx: &mut Context<'_>) -> Result<(), Status> {
        let mut cfg = crate::att::cfg_mask(&[
            IDX_SVC,
            IDX_MEAS_CHAR,
            IDX_MEAS_VAL,
            IDX_MEAS_NTF_CFG,
        ]);
        if features.contains(Features::BODY_SENSOR_LOC_CHAR_SUP) {
            cfg |= crate::att::cfg_mask(&[IDX_BODY_SENSOR_LOC_CHAR, IDX_BODY_SENSOR_LOC_VAL]);
        }
        if features.contains(Features::ENGY_EXP_FEAT_SUP) {
            cfg |= crate::att::cfg_mask(&[IDX_CTNL_PT_CHAR, IDX_CTNL_PT_VAL]);
        }

        let layout = ctx.db.create_db(&att_table(), cfg, ctx.id())?;
        ctx.db.set_permission(layout.start(), PermRight::Disabled)?;
        self.layout = Some(layout);
        self.features = features;
        Ok(())
    }

    fn apply_enable(&mut self, params: &Enable, ctx: &mut Context<'_>) -> Result<(), Status> {
        let svc = self.service_handle().ok_or(Status::InexistentHandle)?;
        let ntf_cfg = self.meas_ntf_cfg_handle().ok_or(Status::InexistentHandle)?;
        let cfg = match params.con_type {
            ConType::Normal => params.hr_meas_ntf_cfg,
            ConType::Discovery => CCCD_STOP,
        };
        write_cccd(ctx.db, ntf_cfg, cfg)?;
        self.ntf = cfg == CCCD_NTF;

        if let Some(loc) = self.body_sensor_loc_handle() {
            ctx.db.set_value(loc, &[u8::from(params.body_sensor_loc)])?;
        }
        ctx.db.set_permission(svc, params.sec_lvl)
    }

    fn enable(&mut self, params: Enable, ctx: &mut Context<'_>) -> Transition<Message> {
        let conhdl = params.conhdl;
        if !ctx.is_connected(conhdl) {
            warn!("hrps: enable for unknown connection {:#06x}", conhdl);
            return Transition::to(State::Idle).send(
                ctx.src(),
                Message::ErrorInd {
                    conhdl,
                    status: Status::ReqDisallowed,
                },
            );
        }

        match self.apply_enable(&params, ctx) {
            Ok(()) => {
                self.con.attach(conhdl, ctx.src());
                Transition::to(State::Connected)
            }
            Err(status) => {
                error!("hrps: enable failed: {:?}", status);
                self.ntf = false;
                Transition::to(State::Idle).send(ctx.src(), Message::ErrorInd { conhdl, status })
            }
        }
    }

    fn meas_send(
        &mut self,
        conhdl: ConHdl,
        meas: &Measurement,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let cfm = |status| Message::MeasSendCfm { conhdl, status };
        if !self.con.owns(conhdl) || meas.rr_intervals.len() > MAX_RR_INTERVALS {
            return Transition::to(State::Connected).send(self.con.app(), cfm(Status::InvalidParam));
        }
        if !self.ntf {
            return Transition::to(State::Connected).send(self.con.app(), cfm(Status::NtfDisabled));
        }

        let result = self
            .meas_handle()
            .ok_or(Status::InexistentHandle)
            .and_then(|handle| {
                let value = to_value(meas)?;
                ctx.db.set_value(handle, &value)?;
                Ok(handle)
            });
        match result {
            Ok(handle) => Transition::to(State::Connected).gatt(GattReq::Notify { conhdl, handle }),
            Err(status) => Transition::to(State::Connected).send(self.con.app(), cfm(status)),
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
        let mut t = Transition::to(State::Connected);

        let status = if Some(handle) == self.meas_ntf_cfg_handle() {
            match store_cccd(ctx.db, handle, value, CCCD_NTF) {
                Ok(cfg) => {
                    self.ntf = cfg == CCCD_NTF;
                    if last {
                        t = t.send(app, Message::CfgIndNtfInd { conhdl, cfg_val: cfg });
                    }
                    Status::Ok
                }
                Err(status) => status,
            }
        } else if Some(handle) == self.ctnl_pt_handle() {
            match value {
                [CTNL_PT_RESET_ENERGY_EXP]
                    if self.features.contains(Features::ENGY_EXP_FEAT_SUP) =>
                {
                    t = t.send(app, Message::EnergyExpResetInd { conhdl });
                    Status::Ok
                }
                _ => {
                    debug!("hrps: unsupported control point value {:?}", crate::HexSlice(value));
                    CTNL_PT_NOT_SUPPORTED
                }
            }
        } else {
            debug!("hrps: write to unhandled attribute {:?}", handle);
            return t;
        };

        t.gatt(GattReq::WriteRsp { conhdl, handle, status })
    }

    fn disable(&mut self, ctx: &mut Context<'_>) -> Transition<Message> {
        let con = match self.con.detach() {
            Some(con) => con,
            None => return Transition::to(State::Idle),
        };
        let hr_meas_ntf_cfg = if self.ntf { CCCD_NTF } else { CCCD_STOP };
        self.ntf = false;

        if let Some(svc) = self.service_handle() {
            if let Err(status) = ctx.db.set_permission(svc, PermRight::Disabled) {
                warn!("hrps: failed to hide service: {:?}", status);
            }
        }

        info!("hrps: disabled on {:#06x}", con.conhdl);
        Transition::to(State::Idle).send(
            con.app,
            Message::DisableInd {
                conhdl: con.conhdl,
                hr_meas_ntf_cfg,
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
                let (next, status) = match self.create_db(features, ctx) {
                    Ok(()) => (State::Idle, Status::Ok),
                    Err(status) => {
                        warn!("hrps: create_db failed: {:?}", status);
                        (State::Disabled, status)
                    }
                };
                Transition::to(next).send(ctx.src(), Message::CreateDbCfm { status })
            }
            (state, Message::CreateDb { .. }) => Transition::to(state).send(
                ctx.src(),
                Message::CreateDbCfm {
                    status: Status::ReqDisallowed,
                },
            ),

            (State::Idle, Message::Enable(params)) => self.enable(params, ctx),

            (State::Connected, Message::MeasSend { conhdl, meas }) => {
                self.meas_send(conhdl, &meas, ctx)
            }
            (state, Message::MeasSend { conhdl, .. }) => Transition::to(state).send(
                ctx.src(),
                Message::MeasSendCfm {
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
                debug!("hrps: ignoring {:?} in {:?}", msg, state);
                Transition::to(state)
            }
        }
    }
}

impl Default for Hrps {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Hrps {
    type Message = Message;
    const TYPE: TaskType = TaskType::Hrps;

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
                    GattEvent::Write { handle, value, last, .. } => {
                        self.write(handle, &value, last, ctx)
                    }
                    GattEvent::NotifyCmp { conhdl, status, .. } => {
                        Transition::to(State::Connected)
                            .send(self.con.app(), Message::MeasSendCfm { conhdl, status })
                    }
                    other => {
                        debug!("hrps: ignoring {:?}", other);
                        Transition::to(state)
                    }
                }
            }
            Event::Gatt(evt) => {
                debug!("hrps: dropping {:?} in {:?}", evt, state);
                Transition::to(state)
            }
            Event::Disconnect(disc) if state >= State::Connected && self.con.owns(disc.conhdl) => {
                self.disable(ctx)
            }
            Event::Disconnect(_) => Transition::to(state),
        }
    }
}
