//! Alert Notification Service client.
//!
//! One instance serves one connection index. Enabling either discovers the peer's Alert
//! Notification Service or takes the handles the application stored, then enables the alert
//! categories the application asked for, one control point write per category. `EnableRsp` ends
//! the procedure.
//!
//! Afterwards the application reads the supported categories, configures notifications and
//! writes the control point. Every such operation keeps the task `Busy` until GATT answers and
//! ends with a `CmpEvt`. Alerts notified by the peer are decoded and passed on in `ValueInd`.

use {
    crate::{
        att::{AttHandle, Properties, Status, Value},
        bytes::*,
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskType},
        prf::{
            client::{self, CharDef, DescDef, Discovery, PeerSvc, Progress, Route, SvcDef},
            Attachment, ConType, CCCD_NTF, CCCD_STOP,
        },
        task::{Context, Event, Profile, Transition},
        uuid::decl,
        Error,
    },
    bitflags::bitflags,
    heapless::{consts::U18, Vec},
};

const SVC_UUID: u16 = 0x1811;

const CHAR_SUP_NEW_ALERT_CAT: usize = 0;
const CHAR_NEW_ALERT: usize = 1;
const CHAR_SUP_UNREAD_ALERT_CAT: usize = 2;
const CHAR_UNREAD_ALERT_STATUS: usize = 3;
const CHAR_CTNL_PT: usize = 4;

const DESC_NEW_ALERT_CFG: usize = 0;
const DESC_UNREAD_ALERT_STATUS_CFG: usize = 1;

/// Category ID meaning "all categories" in a control point command.
pub const CAT_ID_ALL: u8 = 0xFF;

/// Number of defined alert categories.
pub const CAT_ID_NB: u8 = 10;

fn chars() -> [CharDef; 5] {
    let mandatory = |uuid, props| CharDef {
        uuid,
        mandatory: true,
        props,
    };
    [
        mandatory(0x2A47, Properties::READ),
        mandatory(0x2A46, Properties::NOTIFY),
        mandatory(0x2A48, Properties::READ),
        mandatory(0x2A45, Properties::NOTIFY),
        mandatory(0x2A44, Properties::WRITE),
    ]
}

static DESCS: [DescDef; 2] = [
    DescDef {
        uuid: decl::CLIENT_CHAR_CFG,
        char_idx: CHAR_NEW_ALERT,
        mandatory: true,
    },
    DescDef {
        uuid: decl::CLIENT_CHAR_CFG,
        char_idx: CHAR_UNREAD_ALERT_STATUS,
        mandatory: true,
    },
];

fn service(chars: &[CharDef]) -> SvcDef<'_> {
    SvcDef {
        uuid: SVC_UUID,
        chars,
        descs: &DESCS,
    }
}

bitflags! {
    /// Alert categories, one bit per category ID.
    pub struct CatIdMask: u16 {
        const SIMPLE_ALERT = 1 << 0;
        const EMAIL = 1 << 1;
        const NEWS = 1 << 2;
        const CALL = 1 << 3;
        const MISSED_CALL = 1 << 4;
        const SMS_MMS = 1 << 5;
        const VOICE_MAIL = 1 << 6;
        const SCHEDULE = 1 << 7;
        const HIGH_PRTY_ALERT = 1 << 8;
        const INSTANT_MSG = 1 << 9;
    }
}

impl CatIdMask {
    /// The first category in the mask with an ID of at least `from`.
    fn next_from(self, from: u8) -> Option<u8> {
        (from..CAT_ID_NB).find(|&cat| self.bits() & (1 << cat) != 0)
    }
}

/// The peer may send one or two bytes.
impl FromBytes<'_> for CatIdMask {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let low = bytes.read_u8()?;
        let high = if bytes.is_empty() { 0 } else { bytes.read_u8()? };
        Ok(CatIdMask::from_bits_truncate(u16::from_le_bytes([low, high])))
    }
}

enum_with_unknown! {
    /// Alert Notification Control Point commands.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Command(u8) {
        EnableNewAlert = 0,
        EnableUnreadStatus = 1,
        DisableNewAlert = 2,
        DisableUnreadStatus = 3,
        NotifyNewAlertImmediately = 4,
        NotifyUnreadStatusImmediately = 5,
    }
}

/// A New Alert notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAlert {
    pub cat_id: u8,
    pub nb_new_alert: u8,
    pub text: Vec<u8, U18>,
}

impl FromBytes<'_> for NewAlert {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let cat_id = bytes.read_u8()?;
        let nb_new_alert = bytes.read_u8()?;
        let text = Vec::from_slice(bytes.read_rest()).map_err(|()| Error::InvalidLength)?;
        Ok(Self {
            cat_id,
            nb_new_alert,
            text,
        })
    }
}

/// An Unread Alert Status notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnreadAlertStatus {
    pub cat_id: u8,
    pub nb_unread_alert: u8,
}

impl FromBytes<'_> for UnreadAlertStatus {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            cat_id: bytes.read_u8()?,
            nb_unread_alert: bytes.read_u8()?,
        })
    }
}

/// Client configuration descriptors of the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescCode {
    NewAlertCfg,
    UnreadAlertStatusCfg,
}

impl DescCode {
    fn index(self) -> usize {
        match self {
            DescCode::NewAlertCfg => DESC_NEW_ALERT_CFG,
            DescCode::UnreadAlertStatusCfg => DESC_UNREAD_ALERT_STATUS_CFG,
        }
    }
}

/// What a `Read` request reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadCode {
    SupNewAlertCat,
    SupUnreadAlertCat,
    Cfg(DescCode),
}

/// A value received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertValue {
    SupNewAlertCat(CatIdMask),
    SupUnreadAlertCat(CatIdMask),
    NewAlert(NewAlert),
    UnreadAlertStatus(UnreadAlertStatus),
    Cfg { desc: DescCode, cfg: u16 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Enable,
    Read,
    WriteCfg,
    WriteCtnlPt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Enable {
        conhdl: ConHdl,
        con_type: ConType,
        /// Handles from an earlier discovery, used with `ConType::Normal`.
        ans: PeerSvc,
        new_alert: CatIdMask,
        unread_alert: CatIdMask,
    },
    /// End of the enable procedure, with the peer's handles on success.
    EnableRsp {
        conhdl: ConHdl,
        status: Status,
        ans: PeerSvc,
    },
    Read {
        conhdl: ConHdl,
        code: ReadCode,
    },
    WriteCfg {
        conhdl: ConHdl,
        desc: DescCode,
        cfg: u16,
    },
    WriteCtnlPt {
        conhdl: ConHdl,
        cmd: Command,
        cat_id: u8,
    },
    ValueInd {
        conhdl: ConHdl,
        value: AlertValue,
    },
    CmpEvt {
        conhdl: ConHdl,
        operation: Operation,
        status: Status,
    },
    DisableInd {
        conhdl: ConHdl,
    },
}

/// The procedure the task is busy with.
#[derive(Debug)]
enum Proc {
    None,
    Discovery(Discovery),
    /// Enabling categories; `cmd` for category `cat_id` is being written.
    Categories { cmd: Command, cat_id: u8 },
    Read(ReadCode),
    Write(Operation),
}

/// Alert Notification client role.
pub struct Anpc {
    con: Attachment,
    ans: PeerSvc,
    new_alert: CatIdMask,
    unread_alert: CatIdMask,
    proc: Proc,
}

impl Anpc {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            ans: PeerSvc::default(),
            new_alert: CatIdMask::empty(),
            unread_alert: CatIdMask::empty(),
            proc: Proc::None,
        }
    }

    /// The peer's service, once enabled.
    pub fn ans(&self) -> &PeerSvc {
        &self.ans
    }

    fn conhdl(&self) -> ConHdl {
        self.con.conhdl().unwrap_or_default()
    }

    fn cmp_evt(&mut self, operation: Operation, status: Status) -> Transition<Message> {
        self.proc = Proc::None;
        Transition::to(State::Connected).send(
            self.con.app(),
            Message::CmpEvt {
                conhdl: self.conhdl(),
                operation,
                status,
            },
        )
    }

    fn enable_rsp(&mut self, status: Status) -> Transition<Message> {
        self.proc = Proc::None;
        let ans = if status.is_ok() { self.ans } else { PeerSvc::default() };
        let rsp = Message::EnableRsp {
            conhdl: self.conhdl(),
            status,
            ans,
        };
        Transition::to(State::Connected).send(self.con.app(), rsp)
    }

    fn enable(
        &mut self,
        state: State,
        msg: Message,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let (conhdl, con_type, ans, new_alert, unread_alert) = match msg {
            Message::Enable {
                conhdl,
                con_type,
                ans,
                new_alert,
                unread_alert,
            } => (conhdl, con_type, ans, new_alert, unread_alert),
            _ => return Transition::to(state),
        };

        match client::route(ctx, conhdl) {
            Route::Here => {}
            Route::Forward(dest) => return Transition::to(state).forward(dest, msg),
            Route::Reject => {
                warn!("anpc: enable for unknown connection {:#06x}", conhdl);
                return Transition::to(state).send(
                    ctx.src(),
                    Message::CmpEvt {
                        conhdl,
                        operation: Operation::Enable,
                        status: Status::ReqDisallowed,
                    },
                );
            }
        }

        self.con.attach(conhdl, ctx.src());
        self.new_alert = new_alert;
        self.unread_alert = unread_alert;

        match con_type {
            ConType::Discovery => {
                let chars = chars();
                let (disc, req) = Discovery::start(conhdl, &service(&chars));
                self.proc = Proc::Discovery(disc);
                Transition::to(State::Discovering).gatt(req)
            }
            ConType::Normal => {
                self.ans = ans;
                self.next_category(Command::EnableNewAlert, 0)
            }
        }
    }

    fn discovered(&mut self, progress: Progress) -> Transition<Message> {
        match progress {
            Progress::Pending => Transition::to(State::Discovering),
            Progress::Request(req) => Transition::to(State::Discovering).gatt(req),
            Progress::Done(ans) => {
                self.ans = ans;
                self.next_category(Command::EnableNewAlert, 0)
            }
            Progress::Failed(status) => {
                warn!("anpc: discovery failed: {:?}", status);
                self.proc = Proc::None;
                let rsp = Message::EnableRsp {
                    conhdl: self.conhdl(),
                    status,
                    ans: PeerSvc::default(),
                };
                let app = self.con.app();
                self.con.detach();
                Transition::to(State::Idle).send(app, rsp)
            }
        }
    }

    /// Writes the next category to enable, starting at `from`, or ends the enable procedure.
    fn next_category(&mut self, cmd: Command, from: u8) -> Transition<Message> {
        let next = match cmd {
            Command::EnableNewAlert => self
                .new_alert
                .next_from(from)
                .map(|cat| (cmd, cat))
                .or_else(|| {
                    self.unread_alert
                        .next_from(0)
                        .map(|cat| (Command::EnableUnreadStatus, cat))
                }),
            _ => self.unread_alert.next_from(from).map(|cat| (cmd, cat)),
        };

        match next {
            Some((cmd, cat_id)) => match self.ctnl_pt_write(cmd, cat_id) {
                Ok(req) => {
                    self.proc = Proc::Categories { cmd, cat_id };
                    Transition::to(State::Busy).gatt(req)
                }
                Err(status) => self.enable_rsp(status),
            },
            None => {
                info!("anpc: enabled on {:#06x}", self.conhdl());
                self.enable_rsp(Status::Ok)
            }
        }
    }

    fn ctnl_pt_write(&self, cmd: Command, cat_id: u8) -> Result<GattReq, Status> {
        let handle = self.ans.value(CHAR_CTNL_PT).ok_or(Status::InexistentHandle)?;
        Ok(GattReq::Write {
            conhdl: self.conhdl(),
            handle,
            value: Value::from_slice(&[u8::from(cmd), cat_id])
                .map_err(|()| Status::InsufficientResources)?,
            response: true,
        })
    }

    fn read(&mut self, code: ReadCode) -> Transition<Message> {
        let handle = match code {
            ReadCode::SupNewAlertCat => self.ans.value(CHAR_SUP_NEW_ALERT_CAT),
            ReadCode::SupUnreadAlertCat => self.ans.value(CHAR_SUP_UNREAD_ALERT_CAT),
            ReadCode::Cfg(desc) => self.ans.desc(desc.index()),
        };
        match handle {
            Some(handle) => {
                self.proc = Proc::Read(code);
                Transition::to(State::Busy).gatt(GattReq::Read {
                    conhdl: self.conhdl(),
                    handle,
                })
            }
            None => self.cmp_evt(Operation::Read, Status::InexistentHandle),
        }
    }

    fn write_cfg(&mut self, desc: DescCode, cfg: u16) -> Transition<Message> {
        if cfg != CCCD_STOP && cfg != CCCD_NTF {
            return self.cmp_evt(Operation::WriteCfg, Status::InvalidParam);
        }
        let req = self
            .ans
            .desc(desc.index())
            .ok_or(Status::InexistentHandle)
            .and_then(|handle| client::write_cfg(self.conhdl(), handle, cfg));
        match req {
            Ok(req) => {
                self.proc = Proc::Write(Operation::WriteCfg);
                Transition::to(State::Busy).gatt(req)
            }
            Err(status) => self.cmp_evt(Operation::WriteCfg, status),
        }
    }

    fn write_ctnl_pt(&mut self, cmd: Command, cat_id: u8) -> Transition<Message> {
        let valid_cmd = match cmd {
            Command::Unknown(_) => false,
            _ => true,
        };
        if !valid_cmd || (cat_id >= CAT_ID_NB && cat_id != CAT_ID_ALL) {
            return self.cmp_evt(Operation::WriteCtnlPt, Status::InvalidParam);
        }
        match self.ctnl_pt_write(cmd, cat_id) {
            Ok(req) => {
                self.proc = Proc::Write(Operation::WriteCtnlPt);
                Transition::to(State::Busy).gatt(req)
            }
            Err(status) => self.cmp_evt(Operation::WriteCtnlPt, status),
        }
    }

    fn decode(&self, code: ReadCode, value: &[u8]) -> Result<AlertValue, Status> {
        Ok(match code {
            ReadCode::SupNewAlertCat => AlertValue::SupNewAlertCat(decode_exact(value)?),
            ReadCode::SupUnreadAlertCat => AlertValue::SupUnreadAlertCat(decode_exact(value)?),
            ReadCode::Cfg(desc) => AlertValue::Cfg {
                desc,
                cfg: decode_exact(value)?,
            },
        })
    }

    fn peer_value(&mut self, state: State, handle: AttHandle, value: &[u8]) -> Transition<Message> {
        let decoded = match self.ans.char_of(handle) {
            Some(CHAR_NEW_ALERT) => decode_exact(value).map(AlertValue::NewAlert),
            Some(CHAR_UNREAD_ALERT_STATUS) => {
                decode_exact(value).map(AlertValue::UnreadAlertStatus)
            }
            _ => {
                debug!("anpc: value from unexpected handle {:?}", handle);
                return Transition::to(state);
            }
        };
        match decoded {
            Ok(value) => Transition::to(state).send(
                self.con.app(),
                Message::ValueInd {
                    conhdl: self.conhdl(),
                    value,
                },
            ),
            Err(e) => {
                warn!("anpc: malformed alert {:?}: {:?}", crate::HexSlice(value), e);
                Transition::to(state)
            }
        }
    }

    fn gatt_event(&mut self, state: State, evt: GattEvent) -> Transition<Message> {
        if let Proc::Discovery(disc) = &mut self.proc {
            let chars = chars();
            let progress = disc.handle(&evt, &service(&chars));
            return self.discovered(progress);
        }

        match evt {
            GattEvent::PeerValue { handle, value, .. } => self.peer_value(state, handle, &value),
            GattEvent::ReadRsp { value, .. } => match self.proc {
                Proc::Read(code) => match self.decode(code, &value) {
                    Ok(value) => {
                        let ind = Message::ValueInd {
                            conhdl: self.conhdl(),
                            value,
                        };
                        let app = self.con.app();
                        Transition::to(state)
                            .send(app, ind)
                            .then(self.cmp_evt(Operation::Read, Status::Ok))
                    }
                    Err(status) => self.cmp_evt(Operation::Read, status),
                },
                _ => Transition::to(state),
            },
            GattEvent::Cmp { status, .. } => match self.proc {
                Proc::Categories { cmd, cat_id } if status.is_ok() => {
                    self.next_category(cmd, cat_id + 1)
                }
                Proc::Categories { cat_id, .. } => {
                    warn!("anpc: enabling category {} failed: {:?}", cat_id, status);
                    self.enable_rsp(status)
                }
                Proc::Read(_) => self.cmp_evt(Operation::Read, status),
                Proc::Write(op) => self.cmp_evt(op, status),
                _ => Transition::to(state),
            },
            other => {
                debug!("anpc: ignoring {:?} in {:?}", other, state);
                Transition::to(state)
            }
        }
    }

    fn disable(&mut self) -> Transition<Message> {
        self.proc = Proc::None;
        self.ans = PeerSvc::default();
        match self.con.detach() {
            Some(con) => {
                info!("anpc: disabled on {:#06x}", con.conhdl);
                Transition::to(State::Idle)
                    .send(con.app, Message::DisableInd { conhdl: con.conhdl })
            }
            None => Transition::to(State::Idle),
        }
    }

    fn request(
        &mut self,
        state: State,
        msg: Message,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let (conhdl, operation) = match &msg {
            Message::Enable { conhdl, .. } => (*conhdl, Operation::Enable),
            Message::Read { conhdl, .. } => (*conhdl, Operation::Read),
            Message::WriteCfg { conhdl, .. } => (*conhdl, Operation::WriteCfg),
            Message::WriteCtnlPt { conhdl, .. } => (*conhdl, Operation::WriteCtnlPt),
            other => {
                debug!("anpc: ignoring {:?}", other);
                return Transition::to(state);
            }
        };
        let src = ctx.src();
        let refuse = |status| {
            Transition::to(state).send(
                src,
                Message::CmpEvt {
                    conhdl,
                    operation,
                    status,
                },
            )
        };

        match (state, msg) {
            (state, msg @ Message::Enable { .. }) if state <= State::Idle => {
                self.enable(state, msg, ctx)
            }
            (State::Busy, _) | (State::Discovering, _) => refuse(Status::ProcedureInProgress),
            (State::Connected, _) if !self.con.owns(conhdl) => refuse(Status::InvalidParam),
            (State::Connected, Message::Read { code, .. }) => self.read(code),
            (State::Connected, Message::WriteCfg { desc, cfg, .. }) => self.write_cfg(desc, cfg),
            (State::Connected, Message::WriteCtnlPt { cmd, cat_id, .. }) => {
                self.write_ctnl_pt(cmd, cat_id)
            }
            _ => refuse(Status::ReqDisallowed),
        }
    }
}

impl Default for Anpc {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Anpc {
    type Message = Message;
    const TYPE: TaskType = TaskType::Anpc;

    fn handle(
        &mut self,
        state: State,
        event: Event<Message>,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        match event {
            Event::Request(msg) => self.request(state, msg, ctx),
            Event::Gatt(evt) if state >= State::Discovering && self.con.owns(evt.conhdl()) => {
                self.gatt_event(state, evt)
            }
            Event::Gatt(evt) => {
                debug!("anpc: dropping {:?} in {:?}", evt, state);
                Transition::to(state)
            }
            Event::Disconnect(disc) if self.con.owns(disc.conhdl) => self.disable(),
            Event::Disconnect(_) => Transition::to(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kernel::{Kernel, Payload, TaskId},
        prf::{
            client::{tests::h, CharInfo},
            testing::{Bench, CONHDL},
        },
        uuid::AttUuid,
    };

    /// The peer's service, laid out from handle 0x20.
    fn peer() -> PeerSvc {
        let mut ans = PeerSvc {
            start: h(0x20),
            end: h(0x2F),
            ..PeerSvc::default()
        };
        for (i, (def, decl)) in chars().iter().zip(&[0x21, 0x23, 0x26, 0x28, 0x2B]).enumerate() {
            ans.chars[i] = CharInfo {
                decl: h(*decl),
                value: h(decl + 1),
                props: def.props,
            };
        }
        ans.descs = [h(0x25), h(0x2A), AttHandle::NULL];
        ans
    }

    fn enable(con_type: ConType, new_alert: CatIdMask, unread_alert: CatIdMask) -> Message {
        Message::Enable {
            conhdl: CONHDL,
            con_type,
            ans: peer(),
            new_alert,
            unread_alert,
        }
    }

    fn write(handle: u16, value: &[u8]) -> GattReq {
        GattReq::Write {
            conhdl: CONHDL,
            handle: h(handle),
            value: Value::from_slice(value).unwrap(),
            response: true,
        }
    }

    fn cmp(status: Status) -> GattEvent {
        GattEvent::Cmp {
            conhdl: CONHDL,
            status,
        }
    }

    fn connected() -> Bench<Anpc> {
        let mut bench = Bench::new(Anpc::new());
        bench.request(enable(ConType::Normal, CatIdMask::empty(), CatIdMask::empty()));
        assert_eq!(
            bench.app_msgs(),
            [Message::EnableRsp {
                conhdl: CONHDL,
                status: Status::Ok,
                ans: peer()
            }]
        );
        assert_eq!(bench.state(), State::Connected);
        bench
    }

    #[test]
    fn category_masks() {
        let mask = CatIdMask::EMAIL | CatIdMask::INSTANT_MSG;
        assert_eq!(mask.next_from(0), Some(1));
        assert_eq!(mask.next_from(2), Some(9));
        assert_eq!(mask.next_from(10), None);
        assert_eq!(decode_exact::<CatIdMask>(&[0x02]), Ok(CatIdMask::EMAIL));
        assert_eq!(decode_exact::<CatIdMask>(&[0x02, 0x02]), Ok(mask));
    }

    #[test]
    fn enable_writes_one_category_at_a_time() {
        let mut bench = Bench::new(Anpc::new());
        bench.request(enable(
            ConType::Normal,
            CatIdMask::EMAIL | CatIdMask::HIGH_PRTY_ALERT,
            CatIdMask::CALL,
        ));
        assert_eq!(bench.state(), State::Busy);
        assert_eq!(bench.gatt_reqs(), [write(0x2C, &[0, 1])]);

        bench.gatt(cmp(Status::Ok));
        assert_eq!(bench.gatt_reqs(), [write(0x2C, &[0, 8])]);
        bench.gatt(cmp(Status::Ok));
        assert_eq!(bench.gatt_reqs(), [write(0x2C, &[1, 3])]);
        assert!(bench.app_msgs().is_empty());

        bench.gatt(cmp(Status::Ok));
        assert!(bench.gatt_reqs().is_empty());
        assert_eq!(
            bench.app_msgs(),
            [Message::EnableRsp {
                conhdl: CONHDL,
                status: Status::Ok,
                ans: peer()
            }]
        );
        assert_eq!(bench.state(), State::Connected);
    }

    #[test]
    fn discovery() {
        let mut bench = Bench::new(Anpc::new());
        bench.request(enable(ConType::Discovery, CatIdMask::empty(), CatIdMask::empty()));
        assert_eq!(bench.state(), State::Discovering);
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::DiscoverService {
                conhdl: CONHDL,
                uuid: crate::uuid::Uuid16(SVC_UUID)
            }]
        );

        let peer = peer();
        bench.gatt(GattEvent::ServiceFound {
            conhdl: CONHDL,
            uuid: AttUuid::short(SVC_UUID),
            start: peer.start,
            end: peer.end,
        });
        bench.gatt(GattEvent::DiscoveryCmp {
            conhdl: CONHDL,
            status: Status::Ok,
        });
        bench.gatt_reqs();
        for (def, info) in chars().iter().zip(&peer.chars) {
            bench.gatt(GattEvent::CharFound {
                conhdl: CONHDL,
                uuid: AttUuid::short(def.uuid),
                decl: info.decl,
                value: info.value,
                props: info.props,
            });
        }
        bench.gatt(GattEvent::DiscoveryCmp {
            conhdl: CONHDL,
            status: Status::AttributeNotFound,
        });

        for desc in &peer.descs[..2] {
            match bench.gatt_reqs().as_slice() {
                [GattReq::DiscoverDescs { start, end, .. }] => {
                    assert!(*start <= *desc && *desc <= *end);
                }
                other => panic!("unexpected {:?}", other),
            }
            bench.gatt(GattEvent::DescFound {
                conhdl: CONHDL,
                uuid: decl::CLIENT_CHAR_CFG,
                handle: *desc,
            });
            bench.gatt(GattEvent::DiscoveryCmp {
                conhdl: CONHDL,
                status: Status::AttributeNotFound,
            });
        }

        assert_eq!(
            bench.app_msgs(),
            [Message::EnableRsp {
                conhdl: CONHDL,
                status: Status::Ok,
                ans: peer
            }]
        );
        assert_eq!(bench.task.profile().ans(), &peer);
    }

    #[test]
    fn missing_service() {
        let mut bench = Bench::new(Anpc::new());
        bench.request(enable(ConType::Discovery, CatIdMask::empty(), CatIdMask::empty()));
        bench.gatt(GattEvent::DiscoveryCmp {
            conhdl: CONHDL,
            status: Status::AttributeNotFound,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::EnableRsp {
                conhdl: CONHDL,
                status: Status::StopDiscoveryCharMissing,
                ans: PeerSvc::default()
            }]
        );
        assert_eq!(bench.state(), State::Idle);
    }

    #[test]
    fn enable_routing() {
        let mut bench = Bench::with_index(1, Anpc::new());
        bench.request(enable(ConType::Normal, CatIdMask::empty(), CatIdMask::empty()));
        let env = bench.kernel.next().unwrap();
        assert_eq!(env.src, TaskId::APP);
        assert_eq!(env.dest, TaskId::new(TaskType::Anpc, 0));
        match env.payload {
            Payload::Anpc(Message::Enable { conhdl, .. }) => assert_eq!(conhdl, CONHDL),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(bench.state(), State::Disabled);

        let mut bench = Bench::new(Anpc::new());
        bench.request(Message::Enable {
            conhdl: 0x0077,
            con_type: ConType::Normal,
            ans: peer(),
            new_alert: CatIdMask::empty(),
            unread_alert: CatIdMask::empty(),
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: 0x0077,
                operation: Operation::Enable,
                status: Status::ReqDisallowed
            }]
        );
    }

    #[test]
    fn read_supported_categories() {
        let mut bench = connected();
        bench.request(Message::Read {
            conhdl: CONHDL,
            code: ReadCode::SupNewAlertCat,
        });
        assert_eq!(bench.state(), State::Busy);
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::Read {
                conhdl: CONHDL,
                handle: h(0x22)
            }]
        );

        bench.request(Message::WriteCfg {
            conhdl: CONHDL,
            desc: DescCode::NewAlertCfg,
            cfg: CCCD_NTF,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::WriteCfg,
                status: Status::ProcedureInProgress
            }]
        );

        bench.gatt(GattEvent::ReadRsp {
            conhdl: CONHDL,
            handle: h(0x22),
            value: Value::from_slice(&[0x0A, 0x01]).unwrap(),
        });
        assert_eq!(
            bench.app_msgs(),
            [
                Message::ValueInd {
                    conhdl: CONHDL,
                    value: AlertValue::SupNewAlertCat(
                        CatIdMask::EMAIL | CatIdMask::CALL | CatIdMask::HIGH_PRTY_ALERT
                    )
                },
                Message::CmpEvt {
                    conhdl: CONHDL,
                    operation: Operation::Read,
                    status: Status::Ok
                }
            ]
        );
        assert_eq!(bench.state(), State::Connected);
    }

    #[test]
    fn writes() {
        let mut bench = connected();
        bench.request(Message::WriteCfg {
            conhdl: CONHDL,
            desc: DescCode::UnreadAlertStatusCfg,
            cfg: 0x0002,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::WriteCfg,
                status: Status::InvalidParam
            }]
        );

        bench.request(Message::WriteCfg {
            conhdl: CONHDL,
            desc: DescCode::UnreadAlertStatusCfg,
            cfg: CCCD_NTF,
        });
        assert_eq!(bench.gatt_reqs(), [write(0x2A, &[1, 0])]);
        bench.gatt(cmp(Status::Ok));
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::WriteCfg,
                status: Status::Ok
            }]
        );

        bench.request(Message::WriteCtnlPt {
            conhdl: CONHDL,
            cmd: Command::NotifyNewAlertImmediately,
            cat_id: CAT_ID_ALL,
        });
        assert_eq!(bench.gatt_reqs(), [write(0x2C, &[4, 0xFF])]);
        bench.gatt(cmp(Status::AppError));
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::WriteCtnlPt,
                status: Status::AppError
            }]
        );

        bench.request(Message::WriteCtnlPt {
            conhdl: CONHDL,
            cmd: Command::Unknown(6),
            cat_id: 0,
        });
        assert!(bench.gatt_reqs().is_empty());
        assert_eq!(bench.state(), State::Connected);
    }

    #[test]
    fn alerts_are_decoded() {
        let mut bench = connected();
        bench.gatt(GattEvent::PeerValue {
            conhdl: CONHDL,
            handle: h(0x24),
            value: Value::from_slice(b"\x03\x02Bob").unwrap(),
            indication: false,
        });
        bench.gatt(GattEvent::PeerValue {
            conhdl: CONHDL,
            handle: h(0x29),
            value: Value::from_slice(&[0x05, 7]).unwrap(),
            indication: false,
        });
        assert_eq!(
            bench.app_msgs(),
            [
                Message::ValueInd {
                    conhdl: CONHDL,
                    value: AlertValue::NewAlert(NewAlert {
                        cat_id: 3,
                        nb_new_alert: 2,
                        text: Vec::from_slice(b"Bob").unwrap()
                    })
                },
                Message::ValueInd {
                    conhdl: CONHDL,
                    value: AlertValue::UnreadAlertStatus(UnreadAlertStatus {
                        cat_id: 5,
                        nb_unread_alert: 7
                    })
                }
            ]
        );
    }

    #[test]
    fn disconnect() {
        let mut bench = connected();
        bench.disconnect(CONHDL);
        assert_eq!(bench.state(), State::Idle);
        assert_eq!(bench.app_msgs(), [Message::DisableInd { conhdl: CONHDL }]);
        assert_eq!(bench.task.profile().ans(), &PeerSvc::default());

        bench.request(Message::Read {
            conhdl: CONHDL,
            code: ReadCode::SupUnreadAlertCat,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::Read,
                status: Status::ReqDisallowed
            }]
        );
    }
}
