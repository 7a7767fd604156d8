//! Phone Alert Status Service client.
//!
//! Same life cycle as the alert notification client, without the category setup: `EnableRsp`
//! follows directly on discovery (or on the handles the application stored).

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
    },
    bitflags::bitflags,
};

const SVC_UUID: u16 = 0x180E;

const CHAR_ALERT_STATUS: usize = 0;
const CHAR_RINGER_SETTING: usize = 1;
const CHAR_RINGER_CTNL_PT: usize = 2;

fn chars() -> [CharDef; 3] {
    let mandatory = |uuid, props| CharDef {
        uuid,
        mandatory: true,
        props,
    };
    [
        mandatory(0x2A3F, Properties::READ | Properties::NOTIFY),
        mandatory(0x2A41, Properties::READ | Properties::NOTIFY),
        mandatory(0x2A40, Properties::WRITE_NO_RSP),
    ]
}

static DESCS: [DescDef; 2] = [
    DescDef {
        uuid: decl::CLIENT_CHAR_CFG,
        char_idx: CHAR_ALERT_STATUS,
        mandatory: true,
    },
    DescDef {
        uuid: decl::CLIENT_CHAR_CFG,
        char_idx: CHAR_RINGER_SETTING,
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
    pub struct AlertStatus: u8 {
        const RINGER_ACTIVE = 0x01;
        const VIBRATE_ACTIVE = 0x02;
        const DISPLAY_ALERT_ACTIVE = 0x04;
    }
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum RingerSetting(u8) {
        Silent = 0,
        Normal = 1,
    }
}

enum_with_unknown! {
    /// Ringer Control Point commands.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum RingerCmd(u8) {
        SilentMode = 1,
        MuteOnce = 2,
        CancelSilentMode = 3,
    }
}

/// Client configuration descriptors of the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescCode {
    AlertStatusCfg,
    RingerSettingCfg,
}

impl DescCode {
    fn index(self) -> usize {
        match self {
            DescCode::AlertStatusCfg => 0,
            DescCode::RingerSettingCfg => 1,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadCode {
    AlertStatus,
    RingerSetting,
    Cfg(DescCode),
}

/// A value read from or notified by the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PasValue {
    AlertStatus(AlertStatus),
    RingerSetting(RingerSetting),
    Cfg { desc: DescCode, cfg: u16 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Enable,
    Read,
    WriteCfg,
    WriteRingerCtnlPt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Enable {
        conhdl: ConHdl,
        con_type: ConType,
        pass: PeerSvc,
    },
    EnableRsp {
        conhdl: ConHdl,
        status: Status,
        pass: PeerSvc,
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
    WriteRingerCtnlPt {
        conhdl: ConHdl,
        cmd: RingerCmd,
    },
    ValueInd {
        conhdl: ConHdl,
        value: PasValue,
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

#[derive(Debug)]
enum Proc {
    None,
    Discovery(Discovery),
    Read(ReadCode),
    Write(Operation),
}

/// Phone Alert Status client role.
pub struct Paspc {
    con: Attachment,
    pass: PeerSvc,
    proc: Proc,
}

impl Paspc {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            pass: PeerSvc::default(),
            proc: Proc::None,
        }
    }

    pub fn pass(&self) -> &PeerSvc {
        &self.pass
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

    fn enable(&mut self, state: State, msg: Message, ctx: &mut Context<'_>) -> Transition<Message> {
        let (conhdl, con_type, pass) = match msg {
            Message::Enable {
                conhdl,
                con_type,
                pass,
            } => (conhdl, con_type, pass),
            _ => return Transition::to(state),
        };

        match client::route(ctx, conhdl) {
            Route::Here => {}
            Route::Forward(dest) => return Transition::to(state).forward(dest, msg),
            Route::Reject => {
                warn!("paspc: enable for unknown connection {:#06x}", conhdl);
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
        match con_type {
            ConType::Discovery => {
                let chars = chars();
                let (disc, req) = Discovery::start(conhdl, &service(&chars));
                self.proc = Proc::Discovery(disc);
                Transition::to(State::Discovering).gatt(req)
            }
            ConType::Normal => self.discovered(Progress::Done(pass)),
        }
    }

    fn discovered(&mut self, progress: Progress) -> Transition<Message> {
        let conhdl = self.conhdl();
        match progress {
            Progress::Pending => Transition::to(State::Discovering),
            Progress::Request(req) => Transition::to(State::Discovering).gatt(req),
            Progress::Done(pass) => {
                info!("paspc: enabled on {:#06x}", conhdl);
                self.proc = Proc::None;
                self.pass = pass;
                Transition::to(State::Connected).send(
                    self.con.app(),
                    Message::EnableRsp {
                        conhdl,
                        status: Status::Ok,
                        pass,
                    },
                )
            }
            Progress::Failed(status) => {
                warn!("paspc: discovery failed: {:?}", status);
                self.proc = Proc::None;
                let app = self.con.app();
                self.con.detach();
                Transition::to(State::Idle).send(
                    app,
                    Message::EnableRsp {
                        conhdl,
                        status,
                        pass: PeerSvc::default(),
                    },
                )
            }
        }
    }

    fn read(&mut self, code: ReadCode) -> Transition<Message> {
        let handle = match code {
            ReadCode::AlertStatus => self.pass.value(CHAR_ALERT_STATUS),
            ReadCode::RingerSetting => self.pass.value(CHAR_RINGER_SETTING),
            ReadCode::Cfg(desc) => self.pass.desc(desc.index()),
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

    fn write(&mut self, operation: Operation, req: Result<GattReq, Status>) -> Transition<Message> {
        match req {
            Ok(req) => {
                self.proc = Proc::Write(operation);
                Transition::to(State::Busy).gatt(req)
            }
            Err(status) => self.cmp_evt(operation, status),
        }
    }

    fn write_cfg(&mut self, desc: DescCode, cfg: u16) -> Transition<Message> {
        let conhdl = self.conhdl();
        let req = match cfg {
            CCCD_STOP | CCCD_NTF => self
                .pass
                .desc(desc.index())
                .ok_or(Status::InexistentHandle)
                .and_then(|handle| client::write_cfg(conhdl, handle, cfg)),
            _ => Err(Status::InvalidParam),
        };
        self.write(Operation::WriteCfg, req)
    }

    fn write_ringer_ctnl_pt(&mut self, cmd: RingerCmd) -> Transition<Message> {
        let conhdl = self.conhdl();
        let req = match cmd {
            RingerCmd::Unknown(_) => Err(Status::InvalidParam),
            cmd => self
                .pass
                .value(CHAR_RINGER_CTNL_PT)
                .ok_or(Status::InexistentHandle)
                .and_then(|handle| {
                    let value = Value::from_slice(&[u8::from(cmd)])
                        .map_err(|()| Status::InsufficientResources)?;
                    Ok(GattReq::Write {
                        conhdl,
                        handle,
                        value,
                        response: false,
                    })
                }),
        };
        self.write(Operation::WriteRingerCtnlPt, req)
    }

    fn decode(code: ReadCode, value: &[u8]) -> Result<PasValue, Status> {
        Ok(match code {
            ReadCode::AlertStatus => {
                PasValue::AlertStatus(AlertStatus::from_bits_truncate(decode_exact(value)?))
            }
            ReadCode::RingerSetting => {
                PasValue::RingerSetting(RingerSetting::from(decode_exact::<u8>(value)?))
            }
            ReadCode::Cfg(desc) => PasValue::Cfg {
                desc,
                cfg: decode_exact(value)?,
            },
        })
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
                Proc::Read(code) => match Self::decode(code, &value) {
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
                Proc::Read(_) => self.cmp_evt(Operation::Read, status),
                Proc::Write(op) => self.cmp_evt(op, status),
                _ => Transition::to(state),
            },
            other => {
                debug!("paspc: ignoring {:?} in {:?}", other, state);
                Transition::to(state)
            }
        }
    }

    fn peer_value(&mut self, state: State, handle: AttHandle, value: &[u8]) -> Transition<Message> {
        let code = match self.pass.char_of(handle) {
            Some(CHAR_ALERT_STATUS) => ReadCode::AlertStatus,
            Some(CHAR_RINGER_SETTING) => ReadCode::RingerSetting,
            _ => {
                debug!("paspc: value from unexpected handle {:?}", handle);
                return Transition::to(state);
            }
        };
        match Self::decode(code, value) {
            Ok(value) => Transition::to(state).send(
                self.con.app(),
                Message::ValueInd {
                    conhdl: self.conhdl(),
                    value,
                },
            ),
            Err(status) => {
                warn!("paspc: malformed {:?}: {:?}", code, status);
                Transition::to(state)
            }
        }
    }

    fn disable(&mut self) -> Transition<Message> {
        self.proc = Proc::None;
        self.pass = PeerSvc::default();
        match self.con.detach() {
            Some(con) => {
                info!("paspc: disabled on {:#06x}", con.conhdl);
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
            Message::WriteRingerCtnlPt { conhdl, .. } => (*conhdl, Operation::WriteRingerCtnlPt),
            other => {
                debug!("paspc: ignoring {:?}", other);
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
            (State::Connected, Message::WriteRingerCtnlPt { cmd, .. }) => {
                self.write_ringer_ctnl_pt(cmd)
            }
            _ => refuse(Status::ReqDisallowed),
        }
    }
}

impl Default for Paspc {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Paspc {
    type Message = Message;
    const TYPE: TaskType = TaskType::Paspc;

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
                debug!("paspc: dropping {:?} in {:?}", evt, state);
                Transition::to(state)
            }
            Event::Disconnect(disc) if self.con.owns(disc.conhdl) => self.disable(),
            Event::Disconnect(_) => Transition::to(state),
        }
    }
}
