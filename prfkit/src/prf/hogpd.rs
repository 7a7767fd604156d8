//! HID over GATT device role.
//!
//! Hosts up to [`MAX_INSTANCES`] HID Services, each with up to [`MAX_REPORTS`] Report
//! characteristics and optional boot keyboard and boot mouse reports. The task notifies input
//! reports for the application and forwards everything the host writes (protocol mode, control
//! point, output and feature reports) to it.
//!
//! [`MAX_INSTANCES`]: constant.MAX_INSTANCES.html
//! [`MAX_REPORTS`]: constant.MAX_REPORTS.html

use {
    crate::{
        att::{
            AttHandle, AttributeDb, AttributeDesc, PermRight, Permissions, Properties,
            ServiceLayout, Status, Value,
        },
        bytes::*,
        config::MAX_VALUE_LEN,
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskType},
        prf::{
            decode_cccd, set_services_permission, write_cccd, Attachment, ConType, CCCD_NTF,
            CCCD_STOP,
        },
        task::{Context, Event, Profile, Transition},
        uuid::decl,
        Error,
    },
    bitflags::bitflags,
    heapless::{
        consts::{U2, U5},
        Vec,
    },
};

pub const MAX_INSTANCES: usize = 2;
pub const MAX_REPORTS: usize = 5;

pub const REPORT_MAX_LEN: usize = 45;
pub const BOOT_REPORT_MAX_LEN: usize = 8;

const IDX_SVC: usize = 0;
const IDX_INCL_SVC: usize = 1;
const IDX_HID_INFO_CHAR: usize = 2;
const IDX_HID_INFO_VAL: usize = 3;
const IDX_CTNL_PT_CHAR: usize = 4;
const IDX_CTNL_PT_VAL: usize = 5;
const IDX_REPORT_MAP_CHAR: usize = 6;
const IDX_REPORT_MAP_VAL: usize = 7;
const IDX_REPORT_MAP_EXT_REF: usize = 8;
const IDX_PROTO_MODE_CHAR: usize = 9;
const IDX_PROTO_MODE_VAL: usize = 10;
const IDX_BOOT_KB_IN_CHAR: usize = 11;
const IDX_BOOT_KB_IN_VAL: usize = 12;
const IDX_BOOT_KB_IN_NTF_CFG: usize = 13;
const IDX_BOOT_KB_OUT_CHAR: usize = 14;
const IDX_BOOT_KB_OUT_VAL: usize = 15;
const IDX_BOOT_MOUSE_IN_CHAR: usize = 16;
const IDX_BOOT_MOUSE_IN_VAL: usize = 17;
const IDX_BOOT_MOUSE_IN_NTF_CFG: usize = 18;
/// First Report characteristic. Every report takes `REPORT_ATTS` entries.
const IDX_REPORT: usize = 19;
const REPORT_ATTS: usize = 4;
const IDX_NB: usize = IDX_REPORT + MAX_REPORTS * REPORT_ATTS;

// Offsets inside a report's entries.
const REPORT_CHAR: usize = 0;
const REPORT_VAL: usize = 1;
const REPORT_REF: usize = 2;
const REPORT_NTF_CFG: usize = 3;

fn report_idx(report: usize, offset: usize) -> usize {
    IDX_REPORT + report * REPORT_ATTS + offset
}

bitflags! {
    /// Optional parts of one HID Service instance.
    pub struct SvcFeatures: u8 {
        /// Boot keyboard input and output reports.
        const BOOT_KB = 0x01;
        /// Boot mouse input report.
        const BOOT_MOUSE = 0x02;
        const PROTO_MODE = 0x04;
        /// The report map references a characteristic of another service.
        const MAP_EXT_REF = 0x08;
    }
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ReportType(u8) {
        Input = 1,
        Output = 2,
        Feature = 3,
    }
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ProtocolMode(u8) {
        Boot = 0,
        Report = 1,
    }
}

enum_with_unknown! {
    /// HID Control Point commands.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum HidCtnlPt(u8) {
        Suspend = 0,
        ExitSuspend = 1,
    }
}

/// HID Information characteristic value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HidInfo {
    pub bcd_hid: u16,
    pub country_code: u8,
    pub flags: u8,
}

impl ToBytes for HidInfo {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.bcd_hid)?;
        writer.write_u8(self.country_code)?;
        writer.write_u8(self.flags)
    }
}

/// A Report characteristic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReportCfg {
    /// Report ID, as in the report map.
    pub id: u8,
    pub kind: ReportType,
}

/// The service holding the characteristic the report map refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExtRef {
    pub start: AttHandle,
    pub end: AttHandle,
    /// Type of the referenced characteristic.
    pub uuid: u16,
}

/// Configuration of one HID Service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidsCfg {
    pub features: SvcFeatures,
    pub info: HidInfo,
    pub report_map: Value,
    pub reports: Vec<ReportCfg, U5>,
    /// Required with `SvcFeatures::MAP_EXT_REF`.
    pub ext_ref: Option<ExtRef>,
}

/// A characteristic carrying a report.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReportChar {
    BootKbIn,
    BootKbOut,
    BootMouseIn,
    /// Report characteristic by position in `HidsCfg::reports`.
    Report(u8),
}

impl ReportChar {
    fn value_idx(self) -> usize {
        match self {
            ReportChar::BootKbIn => IDX_BOOT_KB_IN_VAL,
            ReportChar::BootKbOut => IDX_BOOT_KB_OUT_VAL,
            ReportChar::BootMouseIn => IDX_BOOT_MOUSE_IN_VAL,
            ReportChar::Report(n) => report_idx(usize::from(n), REPORT_VAL),
        }
    }

    fn cfg_idx(self) -> Option<usize> {
        match self {
            ReportChar::BootKbIn => Some(IDX_BOOT_KB_IN_NTF_CFG),
            ReportChar::BootMouseIn => Some(IDX_BOOT_MOUSE_IN_NTF_CFG),
            ReportChar::Report(n) => Some(report_idx(usize::from(n), REPORT_NTF_CFG)),
            ReportChar::BootKbOut => None,
        }
    }
}

/// What a peer write landed on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Target {
    CtnlPt,
    ProtoMode,
    Value(ReportChar),
    NtfCfg(ReportChar),
}

impl Target {
    fn at(idx: usize) -> Option<Self> {
        Some(match idx {
            IDX_CTNL_PT_VAL => Target::CtnlPt,
            IDX_PROTO_MODE_VAL => Target::ProtoMode,
            IDX_BOOT_KB_IN_VAL => Target::Value(ReportChar::BootKbIn),
            IDX_BOOT_KB_IN_NTF_CFG => Target::NtfCfg(ReportChar::BootKbIn),
            IDX_BOOT_KB_OUT_VAL => Target::Value(ReportChar::BootKbOut),
            IDX_BOOT_MOUSE_IN_VAL => Target::Value(ReportChar::BootMouseIn),
            IDX_BOOT_MOUSE_IN_NTF_CFG => Target::NtfCfg(ReportChar::BootMouseIn),
            idx if idx >= IDX_REPORT && idx < IDX_NB => {
                let report = ReportChar::Report(((idx - IDX_REPORT) / REPORT_ATTS) as u8);
                match (idx - IDX_REPORT) % REPORT_ATTS {
                    REPORT_VAL => Target::Value(report),
                    REPORT_NTF_CFG => Target::NtfCfg(report),
                    _ => return None,
                }
            }
            _ => return None,
        })
    }
}

/// Client configuration of the input reports of one instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct NtfCfg {
    pub boot_kb_in: u16,
    pub boot_mouse_in: u16,
    pub reports: [u16; MAX_REPORTS],
}

impl NtfCfg {
    pub fn get(&self, report: ReportChar) -> u16 {
        match report {
            ReportChar::BootKbIn => self.boot_kb_in,
            ReportChar::BootMouseIn => self.boot_mouse_in,
            ReportChar::Report(n) => self.reports.get(usize::from(n)).copied().unwrap_or(CCCD_STOP),
            ReportChar::BootKbOut => CCCD_STOP,
        }
    }

    fn set(&mut self, report: ReportChar, cfg: u16) {
        let slot = match report {
            ReportChar::BootKbIn => &mut self.boot_kb_in,
            ReportChar::BootMouseIn => &mut self.boot_mouse_in,
            ReportChar::Report(n) => match self.reports.get_mut(usize::from(n)) {
                Some(slot) => slot,
                None => return,
            },
            ReportChar::BootKbOut => return,
        };
        *slot = cfg;
    }
}

fn att_table(cfg: &HidsCfg) -> ([AttributeDesc; IDX_NB], u64) {
    let boot_report = BOOT_REPORT_MAX_LEN as u16;
    let mut table = [AttributeDesc::service(0x1812); IDX_NB];
    table[IDX_INCL_SVC] = AttributeDesc::include();
    table[IDX_HID_INFO_CHAR] = AttributeDesc::characteristic(0x2A4A, Properties::READ);
    table[IDX_HID_INFO_VAL] = AttributeDesc::value(0x2A4A, Permissions::READ, 4);
    table[IDX_CTNL_PT_CHAR] = AttributeDesc::characteristic(0x2A4C, Properties::WRITE_NO_RSP);
    table[IDX_CTNL_PT_VAL] = AttributeDesc::value(0x2A4C, Permissions::WRITE_NO_RSP, 1);
    table[IDX_REPORT_MAP_CHAR] = AttributeDesc::characteristic(0x2A4B, Properties::READ);
    table[IDX_REPORT_MAP_VAL] =
        AttributeDesc::value(0x2A4B, Permissions::READ, MAX_VALUE_LEN as u16);
    table[IDX_REPORT_MAP_EXT_REF] =
        AttributeDesc::descriptor(decl::EXT_REPORT_REF, Permissions::READ, 2);
    table[IDX_PROTO_MODE_CHAR] =
        AttributeDesc::characteristic(0x2A4E, Properties::READ | Properties::WRITE_NO_RSP);
    table[IDX_PROTO_MODE_VAL] =
        AttributeDesc::value(0x2A4E, Permissions::READ | Permissions::WRITE_NO_RSP, 1);
    table[IDX_BOOT_KB_IN_CHAR] =
        AttributeDesc::characteristic(0x2A22, Properties::READ | Properties::NOTIFY);
    table[IDX_BOOT_KB_IN_VAL] =
        AttributeDesc::value(0x2A22, Permissions::READ | Permissions::NOTIFY, boot_report);
    table[IDX_BOOT_KB_IN_NTF_CFG] = AttributeDesc::cccd();
    table[IDX_BOOT_KB_OUT_CHAR] = AttributeDesc::characteristic(
        0x2A32,
        Properties::READ | Properties::WRITE | Properties::WRITE_NO_RSP,
    );
    table[IDX_BOOT_KB_OUT_VAL] = AttributeDesc::value(
        0x2A32,
        Permissions::READ | Permissions::WRITE | Permissions::WRITE_NO_RSP,
        boot_report,
    );
    table[IDX_BOOT_MOUSE_IN_CHAR] =
        AttributeDesc::characteristic(0x2A33, Properties::READ | Properties::NOTIFY);
    table[IDX_BOOT_MOUSE_IN_VAL] =
        AttributeDesc::value(0x2A33, Permissions::READ | Permissions::NOTIFY, boot_report);
    table[IDX_BOOT_MOUSE_IN_NTF_CFG] = AttributeDesc::cccd();

    let mut mask = crate::att::cfg_mask(&[
        IDX_SVC,
        IDX_HID_INFO_CHAR,
        IDX_HID_INFO_VAL,
        IDX_CTNL_PT_CHAR,
        IDX_CTNL_PT_VAL,
        IDX_REPORT_MAP_CHAR,
        IDX_REPORT_MAP_VAL,
    ]);
    if cfg.features.contains(SvcFeatures::MAP_EXT_REF) {
        mask |= crate::att::cfg_mask(&[IDX_INCL_SVC, IDX_REPORT_MAP_EXT_REF]);
    }
    if cfg.features.contains(SvcFeatures::PROTO_MODE) {
        mask |= crate::att::cfg_mask(&[IDX_PROTO_MODE_CHAR, IDX_PROTO_MODE_VAL]);
    }
    if cfg.features.contains(SvcFeatures::BOOT_KB) {
        mask |= crate::att::cfg_mask(&[
            IDX_BOOT_KB_IN_CHAR,
            IDX_BOOT_KB_IN_VAL,
            IDX_BOOT_KB_IN_NTF_CFG,
            IDX_BOOT_KB_OUT_CHAR,
            IDX_BOOT_KB_OUT_VAL,
        ]);
    }
    if cfg.features.contains(SvcFeatures::BOOT_MOUSE) {
        mask |= crate::att::cfg_mask(&[
            IDX_BOOT_MOUSE_IN_CHAR,
            IDX_BOOT_MOUSE_IN_VAL,
            IDX_BOOT_MOUSE_IN_NTF_CFG,
        ]);
    }

    for (n, report) in cfg.reports.iter().enumerate() {
        let (props, perm) = match report.kind {
            ReportType::Input => {
                (Properties::READ | Properties::NOTIFY, Permissions::READ | Permissions::NOTIFY)
            }
            ReportType::Output => (
                Properties::READ | Properties::WRITE | Properties::WRITE_NO_RSP,
                Permissions::READ | Permissions::WRITE | Permissions::WRITE_NO_RSP,
            ),
            _ => (Properties::READ | Properties::WRITE, Permissions::READ | Permissions::WRITE),
        };
        table[report_idx(n, REPORT_CHAR)] = AttributeDesc::characteristic(0x2A4D, props);
        table[report_idx(n, REPORT_VAL)] =
            AttributeDesc::value(0x2A4D, perm, REPORT_MAX_LEN as u16);
        table[report_idx(n, REPORT_REF)] =
            AttributeDesc::descriptor(decl::REPORT_REF, Permissions::READ, 2);
        table[report_idx(n, REPORT_NTF_CFG)] = AttributeDesc::cccd();

        mask |= crate::att::cfg_mask(&[
            report_idx(n, REPORT_CHAR),
            report_idx(n, REPORT_VAL),
            report_idx(n, REPORT_REF),
        ]);
        if report.kind == ReportType::Input {
            mask |= 1 << report_idx(n, REPORT_NTF_CFG);
        }
    }

    (table, mask)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDb {
    /// One entry per instance, `1..=MAX_INSTANCES`.
    pub hids: Vec<HidsCfg, U2>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enable {
    pub conhdl: ConHdl,
    pub sec_lvl: PermRight,
    pub con_type: ConType,
    pub ntf_cfg: [NtfCfg; MAX_INSTANCES],
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
        ntf_cfg: [NtfCfg; MAX_INSTANCES],
    },
    /// Stores an input report and notifies it.
    NtfSend {
        conhdl: ConHdl,
        hids_nb: u8,
        report: ReportChar,
        value: Value,
    },
    NtfSentCfm {
        conhdl: ConHdl,
        hids_nb: u8,
        report: ReportChar,
        status: Status,
    },
    NtfCfgInd {
        conhdl: ConHdl,
        hids_nb: u8,
        report: ReportChar,
        ntf_cfg: u16,
    },
    ProtoModeInd {
        conhdl: ConHdl,
        hids_nb: u8,
        mode: ProtocolMode,
    },
    CtnlPtInd {
        conhdl: ConHdl,
        hids_nb: u8,
        value: HidCtnlPt,
    },
    /// The host wrote an output or feature report.
    ReportInd {
        conhdl: ConHdl,
        hids_nb: u8,
        report: ReportChar,
        value: Value,
    },
    ErrorInd {
        conhdl: ConHdl,
        status: Status,
    },
}

static BOOT_INPUTS: [ReportChar; 2] = [ReportChar::BootKbIn, ReportChar::BootMouseIn];

/// Stores `value` in table entry `idx` if the entry was created.
fn set_entry(
    db: &mut dyn AttributeDb,
    layout: &ServiceLayout,
    idx: usize,
    value: &[u8],
) -> Result<(), Status> {
    match layout.handle(idx) {
        Some(handle) => db.set_value(handle, value),
        None => Ok(()),
    }
}

#[derive(Debug)]
struct Instance {
    layout: ServiceLayout,
    ntf_cfg: NtfCfg,
}

impl Instance {
    fn value(&self, report: ReportChar) -> Option<AttHandle> {
        self.layout.handle(report.value_idx())
    }

    fn cfg(&self, report: ReportChar) -> Option<AttHandle> {
        report.cfg_idx().and_then(|idx| self.layout.handle(idx))
    }

    /// The input report characteristics this instance has.
    fn inputs(&self) -> impl Iterator<Item = ReportChar> + '_ {
        let reports = (0..MAX_REPORTS as u8).map(ReportChar::Report);
        BOOT_INPUTS
            .iter()
            .copied()
            .chain(reports)
            .filter(move |&report| self.cfg(report).is_some())
    }
}

/// HID device role.
pub struct Hogpd {
    con: Attachment,
    instances: Vec<Instance, U2>,
    /// The report being notified.
    sending: Option<(u8, ReportChar)>,
}

impl Hogpd {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            instances: Vec::new(),
            sending: None,
        }
    }

    pub fn service_handle(&self, hids_nb: usize) -> Option<AttHandle> {
        self.instances.get(hids_nb).map(|inst| inst.layout.start())
    }

    pub fn report_handle(&self, hids_nb: usize, report: ReportChar) -> Option<AttHandle> {
        self.instances.get(hids_nb).and_then(|inst| inst.value(report))
    }

    pub fn ntf_cfg_handle(&self, hids_nb: usize, report: ReportChar) -> Option<AttHandle> {
        self.instances.get(hids_nb).and_then(|inst| inst.cfg(report))
    }

    pub fn proto_mode_handle(&self, hids_nb: usize) -> Option<AttHandle> {
        self.attr(hids_nb, IDX_PROTO_MODE_VAL)
    }

    pub fn ctnl_pt_handle(&self, hids_nb: usize) -> Option<AttHandle> {
        self.attr(hids_nb, IDX_CTNL_PT_VAL)
    }

    pub fn report_map_handle(&self, hids_nb: usize) -> Option<AttHandle> {
        self.attr(hids_nb, IDX_REPORT_MAP_VAL)
    }

    pub fn ntf_cfg(&self, hids_nb: usize) -> Option<NtfCfg> {
        self.instances.get(hids_nb).map(|inst| inst.ntf_cfg)
    }

    fn attr(&self, hids_nb: usize, idx: usize) -> Option<AttHandle> {
        self.instances.get(hids_nb).and_then(|inst| inst.layout.handle(idx))
    }

    fn create_db(&mut self, params: &CreateDb, ctx: &mut Context<'_>) -> Result<(), Status> {
        if params.hids.is_empty() {
            return Err(Status::InvalidParam);
        }
        for cfg in params.hids.iter() {
            let bad_report = cfg
                .reports
                .iter()
                .any(|r| matches!(r.kind, ReportType::Unknown(_)));
            let ext_ref = cfg.features.contains(SvcFeatures::MAP_EXT_REF);
            if bad_report || ext_ref != cfg.ext_ref.is_some() {
                return Err(Status::InvalidParam);
            }
        }

        for cfg in params.hids.iter() {
            let (table, mask) = att_table(cfg);
            let layout = ctx.db.create_db(&table, mask, ctx.id())?;

            let mut info = [0; 4];
            encode_into(&cfg.info, &mut info)?;
            set_entry(ctx.db, &layout, IDX_HID_INFO_VAL, &info)?;
            set_entry(ctx.db, &layout, IDX_REPORT_MAP_VAL, &cfg.report_map)?;
            if let Some(ext) = cfg.ext_ref {
                let mut incl = [0; 6];
                let mut writer = ByteWriter::new(&mut incl);
                ext.start.to_bytes(&mut writer)?;
                ext.end.to_bytes(&mut writer)?;
                writer.write_u16_le(ext.uuid)?;
                set_entry(ctx.db, &layout, IDX_INCL_SVC, &incl)?;
                set_entry(ctx.db, &layout, IDX_REPORT_MAP_EXT_REF, &ext.uuid.to_le_bytes())?;
            }
            for (n, report) in cfg.reports.iter().enumerate() {
                let report_ref = [report.id, report.kind.into()];
                set_entry(ctx.db, &layout, report_idx(n, REPORT_REF), &report_ref)?;
            }
            ctx.db.set_permission(layout.start(), PermRight::Disabled)?;

            self.instances
                .push(Instance {
                    layout,
                    ntf_cfg: NtfCfg::default(),
                })
                .map_err(|_| Status::InsufficientResources)?;
        }
        Ok(())
    }

    fn apply_enable(&mut self, params: &Enable, ctx: &mut Context<'_>) -> Result<(), Status> {
        for (inst, saved) in self.instances.iter_mut().zip(params.ntf_cfg.iter()) {
            let mut ntf_cfg = NtfCfg::default();
            for report in inst.inputs() {
                let cfg = match (params.con_type, saved.get(report)) {
                    (ConType::Normal, CCCD_NTF) => CCCD_NTF,
                    _ => CCCD_STOP,
                };
                if let Some(handle) = inst.cfg(report) {
                    write_cccd(ctx.db, handle, cfg)?;
                }
                ntf_cfg.set(report, cfg);
            }
            if let Some(handle) = inst.layout.handle(IDX_PROTO_MODE_VAL) {
                ctx.db.set_value(handle, &[ProtocolMode::Report.into()])?;
            }
            ctx.db.set_permission(inst.layout.start(), params.sec_lvl)?;
            inst.ntf_cfg = ntf_cfg;
        }
        Ok(())
    }

    fn enable(&mut self, params: Enable, ctx: &mut Context<'_>) -> Transition<Message> {
        let conhdl = params.conhdl;
        let result = if ctx.is_connected(conhdl) {
            self.apply_enable(&params, ctx)
        } else {
            warn!("hogpd: enable for unknown connection {:#06x}", conhdl);
            Err(Status::ReqDisallowed)
        };
        match result {
            Ok(()) => {
                self.con.attach(conhdl, ctx.src());
                self.sending = None;
                Transition::to(State::Connected)
            }
            Err(status) => {
                for inst in self.instances.iter_mut() {
                    inst.ntf_cfg = NtfCfg::default();
                }
                Transition::to(State::Idle).send(ctx.src(), Message::ErrorInd { conhdl, status })
            }
        }
    }

    fn ntf_send(
        &mut self,
        conhdl: ConHdl,
        hids_nb: u8,
        report: ReportChar,
        value: &[u8],
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let result = match self.instances.get(usize::from(hids_nb)) {
            None => Err(Status::InvalidParam),
            Some(inst) => match inst.value(report) {
                None => Err(Status::FeatureNotSupported),
                Some(handle) => ctx.db.set_value(handle, value).and_then(|()| {
                    if inst.ntf_cfg.get(report) == CCCD_NTF {
                        Ok(handle)
                    } else {
                        Err(Status::NtfDisabled)
                    }
                }),
            },
        };

        match result {
            Ok(handle) => {
                self.sending = Some((hids_nb, report));
                Transition::to(State::Busy).gatt(GattReq::Notify { conhdl, handle })
            }
            Err(status) => Transition::to(State::Connected).send(
                self.con.app(),
                Message::NtfSentCfm {
                    conhdl,
                    hids_nb,
                    report,
                    status,
                },
            ),
        }
    }

    /// Handles a peer write to instance `hids_nb`. The returned status is only sent back when
    /// the peer asked for a write response.
    fn write_target(
        &mut self,
        conhdl: ConHdl,
        hids_nb: usize,
        target: Target,
        handle: AttHandle,
        value: &[u8],
        last: bool,
        ctx: &mut Context<'_>,
    ) -> (Option<Message>, Status) {
        let app_nb = hids_nb as u8;
        let single = |value: &[u8]| match value {
            [byte] => Ok(*byte),
            _ => Err(Status::InvalidAttributeValueLength),
        };
        let result = match target {
            Target::CtnlPt => single(value).and_then(|byte| match HidCtnlPt::from(byte) {
                HidCtnlPt::Unknown(_) => Err(Status::AppError),
                cmd => ctx.db.set_value(handle, value).map(|()| {
                    Some(Message::CtnlPtInd {
                        conhdl,
                        hids_nb: app_nb,
                        value: cmd,
                    })
                }),
            }),
            Target::ProtoMode => single(value).and_then(|byte| match ProtocolMode::from(byte) {
                ProtocolMode::Unknown(_) => Err(Status::AppError),
                mode => ctx.db.set_value(handle, value).map(|()| {
                    Some(Message::ProtoModeInd {
                        conhdl,
                        hids_nb: app_nb,
                        mode,
                    })
                }),
            }),
            Target::Value(ReportChar::BootKbIn) | Target::Value(ReportChar::BootMouseIn) => {
                Err(Status::WriteNotPermitted)
            }
            Target::Value(report) => Value::from_slice(value)
                .map_err(|()| Status::InvalidAttributeValueLength)
                .and_then(|owned| {
                    ctx.db.set_value(handle, value).map(|()| {
                        Some(Message::ReportInd {
                            conhdl,
                            hids_nb: app_nb,
                            report,
                            value: owned,
                        })
                    })
                }),
            Target::NtfCfg(report) => decode_cccd(value, CCCD_NTF).and_then(|cfg| {
                write_cccd(ctx.db, handle, cfg)?;
                if let Some(inst) = self.instances.get_mut(hids_nb) {
                    inst.ntf_cfg.set(report, cfg);
                }
                Ok(if last {
                    Some(Message::NtfCfgInd {
                        conhdl,
                        hids_nb: app_nb,
                        report,
                        ntf_cfg: cfg,
                    })
                } else {
                    None
                })
            }),
        };

        match result {
            Ok(msg) => (msg, Status::Ok),
            Err(status) => {
                debug!(
                    "hogpd: refusing write {:?} to {:?}: {:?}",
                    crate::HexSlice(value),
                    target,
                    status
                );
                (None, status)
            }
        }
    }

    fn write(
        &mut self,
        state: State,
        conhdl: ConHdl,
        handle: AttHandle,
        value: &[u8],
        response: bool,
        last: bool,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let found = self.instances.iter().enumerate().find_map(|(nb, inst)| {
            inst.layout
                .index_of(handle)
                .and_then(Target::at)
                .map(|target| (nb, target))
        });
        let mut t = Transition::to(state);
        let status = match found {
            Some((hids_nb, target)) => {
                let (msg, status) =
                    self.write_target(conhdl, hids_nb, target, handle, value, last, ctx);
                if let Some(msg) = msg {
                    t = t.send(self.con.app(), msg);
                }
                status
            }
            None => {
                debug!("hogpd: write to unhandled attribute {:?}", handle);
                Status::WriteNotPermitted
            }
        };
        if response {
            t = t.gatt(GattReq::WriteRsp {
                conhdl,
                handle,
                status,
            });
        }
        t
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
                response,
                last,
            } => self.write(state, conhdl, handle, &value, response, last, ctx),
            GattEvent::NotifyCmp { conhdl, status, .. } if state == State::Busy => {
                let t = Transition::to(State::Connected);
                match self.sending.take() {
                    Some((hids_nb, report)) => t.send(
                        self.con.app(),
                        Message::NtfSentCfm {
                            conhdl,
                            hids_nb,
                            report,
                            status,
                        },
                    ),
                    None => t,
                }
            }
            other => {
                debug!("hogpd: ignoring {:?} in {:?}", other, state);
                Transition::to(state)
            }
        }
    }

    fn disable(&mut self, ctx: &mut Context<'_>) -> Transition<Message> {
        let con = match self.con.detach() {
            Some(con) => con,
            None => return Transition::to(State::Idle),
        };
        self.sending = None;

        let mut ntf_cfg = [NtfCfg::default(); MAX_INSTANCES];
        let mut services: Vec<AttHandle, U2> = Vec::new();
        for (cfg, inst) in ntf_cfg.iter_mut().zip(self.instances.iter_mut()) {
            *cfg = inst.ntf_cfg;
            inst.ntf_cfg = NtfCfg::default();
            let _ = services.push(inst.layout.start());
        }
        if let Err(status) = set_services_permission(ctx.db, &services, PermRight::Disabled) {
            warn!("hogpd: failed to hide services: {:?}", status);
        }

        info!("hogpd: disabled on {:#06x}", con.conhdl);
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
                        warn!("hogpd: create_db failed: {:?}", status);
                        self.instances.clear();
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

            (state, Message::NtfSend {
                conhdl,
                hids_nb,
                report,
                value,
            }) if state >= State::Connected => {
                if !self.con.owns(conhdl) {
                    Transition::to(state).send(
                        ctx.src(),
                        Message::NtfSentCfm {
                            conhdl,
                            hids_nb,
                            report,
                            status: Status::InvalidParam,
                        },
                    )
                } else if state == State::Busy {
                    Transition::save(Event::Request(Message::NtfSend {
                        conhdl,
                        hids_nb,
                        report,
                        value,
                    }))
                } else {
                    self.ntf_send(conhdl, hids_nb, report, &value, ctx)
                }
            }
            (state, Message::NtfSend {
                conhdl,
                hids_nb,
                report,
                ..
            }) => Transition::to(state).send(
                ctx.src(),
                Message::NtfSentCfm {
                    conhdl,
                    hids_nb,
                    report,
                    status: Status::ReqDisallowed,
                },
            ),

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
                debug!("hogpd: ignoring {:?} in {:?}", msg, state);
                Transition::to(state)
            }
        }
    }
}

impl Default for Hogpd {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Hogpd {
    type Message = Message;
    const TYPE: TaskType = TaskType::Hogpd;

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
                debug!("hogpd: dropping {:?} in {:?}", evt, state);
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
            Event::Request(Message::NtfSend {
                conhdl,
                hids_nb,
                report,
                ..
            }) => Transition::to(state).send(
                ctx.src(),
                Message::NtfSentCfm {
                    conhdl,
                    hids_nb,
                    report,
                    status,
                },
            ),
            other => Transition::save(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prf::testing::{Bench, CONHDL};

    fn keyboard() -> HidsCfg {
        let mut reports = Vec::new();
        reports
            .extend_from_slice(&[
                ReportCfg {
                    id: 1,
                    kind: ReportType::Input,
                },
                ReportCfg {
                    id: 1,
                    kind: ReportType::Output,
                },
            ])
            .unwrap();
        HidsCfg {
            features: SvcFeatures::BOOT_KB | SvcFeatures::PROTO_MODE,
            info: HidInfo {
                bcd_hid: 0x0111,
                country_code: 0,
                flags: 0x02,
            },
            report_map: Value::from_slice(&[0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0xC0]).unwrap(),
            reports,
            ext_ref: None,
        }
    }

    fn mouse() -> HidsCfg {
        let mut reports = Vec::new();
        reports
            .push(ReportCfg {
                id: 2,
                kind: ReportType::Input,
            })
            .unwrap();
        HidsCfg {
            features: SvcFeatures::BOOT_MOUSE | SvcFeatures::MAP_EXT_REF,
            ext_ref: Some(ExtRef {
                start: AttHandle::from_raw(0x0100),
                end: AttHandle::from_raw(0x0104),
                uuid: 0x2A19,
            }),
            reports,
            ..keyboard()
        }
    }

    fn created(hids: &[HidsCfg]) -> Bench<Hogpd> {
        let mut bench = Bench::new(Hogpd::new());
        bench.request(Message::CreateDb(CreateDb {
            hids: Vec::from_slice(hids).unwrap(),
        }));
        assert_eq!(bench.app_msgs(), [Message::CreateDbCfm { status: Status::Ok }]);
        bench
    }

    fn enable(bench: &mut Bench<Hogpd>, con_type: ConType, ntf_cfg: [NtfCfg; MAX_INSTANCES]) {
        bench.request(Message::Enable(Enable {
            conhdl: CONHDL,
            sec_lvl: PermRight::Enabled,
            con_type,
            ntf_cfg,
        }));
        assert_eq!(bench.state(), State::Connected);
    }

    fn all_on() -> NtfCfg {
        NtfCfg {
            boot_kb_in: CCCD_NTF,
            boot_mouse_in: CCCD_NTF,
            reports: [CCCD_NTF; MAX_REPORTS],
        }
    }

    fn value(bytes: &[u8]) -> Value {
        Value::from_slice(bytes).unwrap()
    }

    #[test]
    fn database_layout() {
        let bench = created(&[keyboard(), mouse()]);
        let hogpd = bench.task.profile();
        // Keyboard: svc, info, ctnl pt, map, proto mode, kb in + cccd, kb out, input report
        // with cccd, output report.
        // Mouse: svc, include, info, ctnl pt, map + ext ref, mouse in + cccd, input report.
        assert_eq!(bench.db.len(), 21 + 16);

        let input = hogpd.report_handle(0, ReportChar::Report(0)).unwrap();
        assert_eq!(bench.value(input.offset(1)), [1, 1]);
        let output = hogpd.report_handle(0, ReportChar::Report(1)).unwrap();
        assert_eq!(bench.value(output.offset(1)), [1, 2]);
        assert!(hogpd.ntf_cfg_handle(0, ReportChar::Report(1)).is_none());
        assert!(hogpd.report_handle(0, ReportChar::BootMouseIn).is_none());
        assert!(hogpd.proto_mode_handle(1).is_none());

        let map = hogpd.report_map_handle(1).unwrap();
        assert_eq!(bench.value(map).len(), 7);
        assert_eq!(bench.value(map.offset(1)), [0x19, 0x2A]);
        let svc = hogpd.service_handle(1).unwrap();
        assert_eq!(bench.value(svc.offset(1)), [0x00, 0x01, 0x04, 0x01, 0x19, 0x2A]);
        assert_eq!(bench.value(svc.offset(3)), [0x11, 0x01, 0x00, 0x02]);
        assert_eq!(bench.db.permission(svc), Some(PermRight::Disabled));
    }

    #[test]
    fn inconsistent_config_is_rejected() {
        let mut bench = Bench::new(Hogpd::new());
        let broken = HidsCfg {
            ext_ref: None,
            ..mouse()
        };
        bench.request(Message::CreateDb(CreateDb {
            hids: Vec::from_slice(&[broken]).unwrap(),
        }));
        assert_eq!(
            bench.app_msgs(),
            [Message::CreateDbCfm {
                status: Status::InvalidParam
            }]
        );
        assert_eq!(bench.state(), State::Disabled);
        assert!(bench.db.is_empty());
    }

    #[test]
    fn enable_restores_configuration() {
        let mut bench = created(&[keyboard(), mouse()]);
        enable(&mut bench, ConType::Normal, [all_on(); MAX_INSTANCES]);
        let hogpd = bench.task.profile();
        assert_eq!(
            hogpd.ntf_cfg(0),
            Some(NtfCfg {
                boot_kb_in: CCCD_NTF,
                boot_mouse_in: CCCD_STOP,
                reports: [CCCD_NTF, 0, 0, 0, 0],
            })
        );
        let cfg = hogpd.ntf_cfg_handle(1, ReportChar::BootMouseIn).unwrap();
        let mode = hogpd.proto_mode_handle(0).unwrap();
        assert_eq!(bench.value(cfg), [0x01, 0x00]);
        assert_eq!(bench.value(mode), [1]);
        let svc = bench.task.profile().service_handle(0).unwrap();
        assert_eq!(bench.db.permission(svc), Some(PermRight::Enabled));
    }

    #[test]
    fn discovery_connection_clears_configuration() {
        let mut bench = created(&[keyboard()]);
        enable(&mut bench, ConType::Discovery, [all_on(); MAX_INSTANCES]);
        assert_eq!(bench.task.profile().ntf_cfg(0), Some(NtfCfg::default()));
    }

    #[test]
    fn input_report_notification() {
        let mut bench = created(&[keyboard()]);
        enable(&mut bench, ConType::Normal, [all_on(); MAX_INSTANCES]);
        let handle = bench.task.profile().report_handle(0, ReportChar::BootKbIn).unwrap();

        let keys = [0, 0, 0x04, 0, 0, 0, 0, 0];
        bench.request(Message::NtfSend {
            conhdl: CONHDL,
            hids_nb: 0,
            report: ReportChar::BootKbIn,
            value: value(&keys),
        });
        bench.request(Message::NtfSend {
            conhdl: CONHDL,
            hids_nb: 0,
            report: ReportChar::BootKbIn,
            value: value(&[0; 8]),
        });
        assert_eq!(bench.state(), State::Busy);
        assert_eq!(bench.task.deferred_len(), 1);
        assert_eq!(bench.value(handle), keys);
        assert_eq!(bench.gatt_reqs(), [GattReq::Notify { conhdl: CONHDL, handle }]);

        bench.gatt(GattEvent::NotifyCmp {
            conhdl: CONHDL,
            handle,
            status: Status::Ok,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::NtfSentCfm {
                conhdl: CONHDL,
                hids_nb: 0,
                report: ReportChar::BootKbIn,
                status: Status::Ok,
            }]
        );
        // The saved report went out right after.
        assert_eq!(bench.state(), State::Busy);
        assert_eq!(bench.value(handle), [0; 8]);
    }

    #[test]
    fn notification_errors() {
        let mut bench = created(&[keyboard()]);
        enable(&mut bench, ConType::Discovery, [NtfCfg::default(); MAX_INSTANCES]);
        let status = |bench: &mut Bench<Hogpd>, report| {
            bench.request(Message::NtfSend {
                conhdl: CONHDL,
                hids_nb: 0,
                report,
                value: value(&[1, 2, 3]),
            });
            match bench.app_msgs().as_slice() {
                [Message::NtfSentCfm { status, .. }] => *status,
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_eq!(status(&mut bench, ReportChar::BootMouseIn), Status::FeatureNotSupported);
        assert_eq!(status(&mut bench, ReportChar::Report(0)), Status::NtfDisabled);
        assert_eq!(status(&mut bench, ReportChar::Report(1)), Status::NtfDisabled);
        assert_eq!(bench.state(), State::Connected);

        // Stored even though nobody listens.
        let handle = bench.task.profile().report_handle(0, ReportChar::Report(0)).unwrap();
        assert_eq!(bench.value(handle), [1, 2, 3]);
    }

    #[test]
    fn cccd_write() {
        let mut bench = created(&[keyboard()]);
        enable(&mut bench, ConType::Discovery, [NtfCfg::default(); MAX_INSTANCES]);
        let cfg = bench.task.profile().ntf_cfg_handle(0, ReportChar::Report(0)).unwrap();

        bench.write(cfg, &[0x01, 0x00]);
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::WriteRsp {
                conhdl: CONHDL,
                handle: cfg,
                status: Status::Ok
            }]
        );
        assert_eq!(
            bench.app_msgs(),
            [Message::NtfCfgInd {
                conhdl: CONHDL,
                hids_nb: 0,
                report: ReportChar::Report(0),
                ntf_cfg: CCCD_NTF,
            }]
        );
        assert_eq!(bench.task.profile().ntf_cfg(0).unwrap().reports[0], CCCD_NTF);

        bench.write(cfg, &[0x02, 0x00]);
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::WriteRsp {
                conhdl: CONHDL,
                handle: cfg,
                status: Status::AppError
            }]
        );
    }

    #[test]
    fn host_writes_are_forwarded() {
        let mut bench = created(&[keyboard()]);
        enable(&mut bench, ConType::Discovery, [NtfCfg::default(); MAX_INSTANCES]);
        let hogpd = bench.task.profile();
        let mode = hogpd.proto_mode_handle(0).unwrap();
        let ctnl_pt = hogpd.ctnl_pt_handle(0).unwrap();
        let leds = hogpd.report_handle(0, ReportChar::BootKbOut).unwrap();
        let output = hogpd.report_handle(0, ReportChar::Report(1)).unwrap();

        let write_cmd = |bench: &mut Bench<Hogpd>, handle, bytes: &[u8]| {
            bench.gatt(GattEvent::Write {
                conhdl: CONHDL,
                handle,
                value: value(bytes),
                response: false,
                last: true,
            })
        };

        write_cmd(&mut bench, mode, &[0]);
        write_cmd(&mut bench, ctnl_pt, &[1]);
        write_cmd(&mut bench, leds, &[0x02]);
        assert!(bench.gatt_reqs().is_empty());
        assert_eq!(
            bench.app_msgs(),
            [
                Message::ProtoModeInd {
                    conhdl: CONHDL,
                    hids_nb: 0,
                    mode: ProtocolMode::Boot
                },
                Message::CtnlPtInd {
                    conhdl: CONHDL,
                    hids_nb: 0,
                    value: HidCtnlPt::ExitSuspend
                },
                Message::ReportInd {
                    conhdl: CONHDL,
                    hids_nb: 0,
                    report: ReportChar::BootKbOut,
                    value: value(&[0x02]),
                },
            ]
        );
        assert_eq!(bench.value(mode), [0]);

        bench.write(output, &[0x05]);
        assert_eq!(bench.app_msgs().len(), 1);
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::WriteRsp {
                conhdl: CONHDL,
                handle: output,
                status: Status::Ok
            }]
        );

        write_cmd(&mut bench, mode, &[7]);
        assert!(bench.app_msgs().is_empty());
        assert_eq!(bench.value(mode), [0]);
    }

    #[test]
    fn disconnect_reports_configuration() {
        let mut bench = created(&[keyboard(), mouse()]);
        enable(&mut bench, ConType::Normal, [all_on(); MAX_INSTANCES]);
        bench.disconnect(CONHDL);

        let on_kb = NtfCfg {
            boot_kb_in: CCCD_NTF,
            boot_mouse_in: CCCD_STOP,
            reports: [CCCD_NTF, 0, 0, 0, 0],
        };
        let on_mouse = NtfCfg {
            boot_kb_in: CCCD_STOP,
            boot_mouse_in: CCCD_NTF,
            reports: [CCCD_NTF, 0, 0, 0, 0],
        };
        assert_eq!(
            bench.app_msgs(),
            [Message::DisableInd {
                conhdl: CONHDL,
                ntf_cfg: [on_kb, on_mouse],
            }]
        );
        assert_eq!(bench.state(), State::Idle);
        assert_eq!(bench.task.profile().ntf_cfg(0), Some(NtfCfg::default()));
    }
}
