//! Cycling Speed and Cadence Service client (collector).
//!
//! The SC Control Point procedure spans two GATT exchanges: the write of the request, then the
//! sensor's response indication. The task stays `Busy` until the response to the written op code
//! arrives and reports it in `ValueInd` before the `CmpEvt`.

use {
    crate::{
        att::{to_value, AttHandle, Properties, Status},
        bytes::*,
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskType},
        prf::{
            client::{self, CharDef, DescDef, Discovery, PeerSvc, Progress, Route, SvcDef},
            cscp::{CtnlPtOpCode, CtnlPtReq, CtnlPtRsp, Features, Measurement},
            Attachment, ConType, CCCD_IND, CCCD_NTF, CCCD_STOP,
        },
        task::{Context, Event, Profile, Transition},
        uuid::decl,
    },
};

const SVC_UUID: u16 = 0x1816;

const CHAR_MEAS: usize = 0;
const CHAR_FEAT: usize = 1;
const CHAR_SENSOR_LOC: usize = 2;
const CHAR_CTNL_PT: usize = 3;

fn chars() -> [CharDef; 4] {
    [
        CharDef {
            uuid: 0x2A5B,
            mandatory: true,
            props: Properties::NOTIFY,
        },
        CharDef {
            uuid: 0x2A5C,
            mandatory: true,
            props: Properties::READ,
        },
        CharDef {
            uuid: 0x2A5D,
            mandatory: false,
            props: Properties::READ,
        },
        CharDef {
            uuid: 0x2A55,
            mandatory: false,
            props: Properties::WRITE | Properties::INDICATE,
        },
    ]
}

static DESCS: [DescDef; 2] = [
    DescDef {
        uuid: decl::CLIENT_CHAR_CFG,
        char_idx: CHAR_MEAS,
        mandatory: true,
    },
    DescDef {
        uuid: decl::CLIENT_CHAR_CFG,
        char_idx: CHAR_CTNL_PT,
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

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescCode {
    MeasCfg,
    CtnlPtCfg,
}

impl DescCode {
    fn index(self) -> usize {
        match self {
            DescCode::MeasCfg => 0,
            DescCode::CtnlPtCfg => 1,
        }
    }

    /// The configuration value that turns updates on.
    fn enabled(self) -> u16 {
        match self {
            DescCode::MeasCfg => CCCD_NTF,
            DescCode::CtnlPtCfg => CCCD_IND,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadCode {
    Feature,
    SensorLoc,
    Cfg(DescCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CscValue {
    Meas(Measurement),
    Feature(Features),
    SensorLoc(u8),
    Cfg { desc: DescCode, cfg: u16 },
    CtnlPtRsp(CtnlPtRsp),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Enable,
    Read,
    WriteCfg,
    CtnlPt(CtnlPtOpCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Enable {
        conhdl: ConHdl,
        con_type: ConType,
        cscs: PeerSvc,
    },
    EnableRsp {
        conhdl: ConHdl,
        status: Status,
        cscs: PeerSvc,
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
    CtnlPt {
        conhdl: ConHdl,
        req: CtnlPtReq,
    },
    ValueInd {
        conhdl: ConHdl,
        value: CscValue,
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
    WriteCfg,
    /// Waiting for the response indication to a control point request.
    CtnlPt(CtnlPtOpCode),
}

/// Cycling Speed and Cadence collector role.
pub struct Cscpc {
    con: Attachment,
    cscs: PeerSvc,
    proc: Proc,
}

impl Cscpc {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            cscs: PeerSvc::default(),
            proc: Proc::None,
        }
    }

    pub fn cscs(&self) -> &PeerSvc {
        &self.cscs
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

    fn value_ind(&self, state: State, value: CscValue) -> Transition<Message> {
        Transition::to(state).send(
            self.con.app(),
            Message::ValueInd {
                conhdl: self.conhdl(),
                value,
            },
        )
    }

    fn enable(&mut self, state: State, msg: Message, ctx: &mut Context<'_>) -> Transition<Message> {
        let (conhdl, con_type, cscs) = match msg {
            Message::Enable {
                conhdl,
                con_type,
                cscs,
            } => (conhdl, con_type, cscs),
            _ => return Transition::to(state),
        };

        match client::route(ctx, conhdl) {
            Route::Here => {}
            Route::Forward(dest) => return Transition::to(state).forward(dest, msg),
            Route::Reject => {
                warn!("cscpc: enable for unknown connection {:#06x}", conhdl);
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
            ConType::Normal => self.discovered(Progress::Done(cscs)),
        }
    }

    fn discovered(&mut self, progress: Progress) -> Transition<Message> {
        let conhdl = self.conhdl();
        let (next, status, cscs) = match progress {
            Progress::Pending => return Transition::to(State::Discovering),
            Progress::Request(req) => return Transition::to(State::Discovering).gatt(req),
            Progress::Done(cscs) => {
                info!("cscpc: enabled on {:#06x}", conhdl);
                self.cscs = cscs;
                (State::Connected, Status::Ok, cscs)
            }
            Progress::Failed(status) => {
                warn!("cscpc: discovery failed: {:?}", status);
                (State::Idle, status, PeerSvc::default())
            }
        };

        self.proc = Proc::None;
        let app = self.con.app();
        if !status.is_ok() {
            self.con.detach();
        }
        Transition::to(next).send(app, Message::EnableRsp { conhdl, status, cscs })
    }

    fn read(&mut self, code: ReadCode) -> Transition<Message> {
        let handle = match code {
            ReadCode::Feature => self.cscs.value(CHAR_FEAT).ok_or(Status::InexistentHandle),
            ReadCode::SensorLoc => self
                .cscs
                .value(CHAR_SENSOR_LOC)
                .ok_or(Status::FeatureNotSupported),
            ReadCode::Cfg(desc) => self.cscs.desc(desc.index()).ok_or(Status::FeatureNotSupported),
        };
        match handle {
            Ok(handle) => {
                self.proc = Proc::Read(code);
                Transition::to(State::Busy).gatt(GattReq::Read {
                    conhdl: self.conhdl(),
                    handle,
                })
            }
            Err(status) => self.cmp_evt(Operation::Read, status),
        }
    }

    fn write_cfg(&mut self, desc: DescCode, cfg: u16) -> Transition<Message> {
        let conhdl = self.conhdl();
        let req = if cfg == CCCD_STOP || cfg == desc.enabled() {
            self.cscs
                .desc(desc.index())
                .ok_or(Status::FeatureNotSupported)
                .and_then(|handle| client::write_cfg(conhdl, handle, cfg))
        } else {
            Err(Status::InvalidParam)
        };
        match req {
            Ok(req) => {
                self.proc = Proc::WriteCfg;
                Transition::to(State::Busy).gatt(req)
            }
            Err(status) => self.cmp_evt(Operation::WriteCfg, status),
        }
    }

    fn ctnl_pt(&mut self, req: &CtnlPtReq) -> Transition<Message> {
        let op = req.op_code();
        let write = self
            .cscs
            .value(CHAR_CTNL_PT)
            .ok_or(Status::FeatureNotSupported)
            .and_then(|handle| {
                Ok(GattReq::Write {
                    conhdl: self.conhdl(),
                    handle,
                    value: to_value(req)?,
                    response: true,
                })
            });
        match write {
            Ok(write) => {
                self.proc = Proc::CtnlPt(op);
                Transition::to(State::Busy).gatt(write)
            }
            Err(status) => self.cmp_evt(Operation::CtnlPt(op), status),
        }
    }

    fn decode(code: ReadCode, value: &[u8]) -> Result<CscValue, Status> {
        Ok(match code {
            ReadCode::Feature => {
                CscValue::Feature(Features::from_bits_truncate(decode_exact(value)?))
            }
            ReadCode::SensorLoc => CscValue::SensorLoc(decode_exact(value)?),
            ReadCode::Cfg(desc) => CscValue::Cfg {
                desc,
                cfg: decode_exact(value)?,
            },
        })
    }

    fn peer_value(&mut self, state: State, handle: AttHandle, value: &[u8]) -> Transition<Message> {
        match self.cscs.char_of(handle) {
            Some(CHAR_MEAS) => match decode_exact::<Measurement>(value) {
                Ok(meas) => self.value_ind(state, CscValue::Meas(meas)),
                Err(e) => {
                    warn!("cscpc: malformed measurement {:?}: {:?}", crate::HexSlice(value), e);
                    Transition::to(state)
                }
            },
            Some(CHAR_CTNL_PT) => {
                let rsp = match decode_exact::<CtnlPtRsp>(value) {
                    Ok(rsp) => rsp,
                    Err(e) => {
                        warn!("cscpc: malformed control point response: {:?}", e);
                        return Transition::to(state);
                    }
                };
                match self.proc {
                    Proc::CtnlPt(op) if op == rsp.req_op => self
                        .value_ind(state, CscValue::CtnlPtRsp(rsp))
                        .then(self.cmp_evt(Operation::CtnlPt(op), Status::Ok)),
                    _ => {
                        debug!("cscpc: unsolicited control point response {:?}", rsp);
                        Transition::to(state)
                    }
                }
            }
            _ => {
                debug!("cscpc: value from unexpected handle {:?}", handle);
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
                Proc::Read(code) => match Self::decode(code, &value) {
                    Ok(value) => self
                        .value_ind(state, value)
                        .then(self.cmp_evt(Operation::Read, Status::Ok)),
                    Err(status) => self.cmp_evt(Operation::Read, status),
                },
                _ => Transition::to(state),
            },
            GattEvent::Cmp { status, .. } => match self.proc {
                Proc::Read(_) => self.cmp_evt(Operation::Read, status),
                Proc::WriteCfg => self.cmp_evt(Operation::WriteCfg, status),
                Proc::CtnlPt(op) if !status.is_ok() => self.cmp_evt(Operation::CtnlPt(op), status),
                // The response indication completes the procedure.
                _ => Transition::to(state),
            },
            other => {
                debug!("cscpc: ignoring {:?} in {:?}", other, state);
                Transition::to(state)
            }
        }
    }

    fn disable(&mut self) -> Transition<Message> {
        self.proc = Proc::None;
        self.cscs = PeerSvc::default();
        match self.con.detach() {
            Some(con) => {
                info!("cscpc: disabled on {:#06x}", con.conhdl);
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
            Message::CtnlPt { conhdl, req } => (*conhdl, Operation::CtnlPt(req.op_code())),
            other => {
                debug!("cscpc: ignoring {:?}", other);
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
            (State::Connected, Message::CtnlPt { req, .. }) => self.ctnl_pt(&req),
            _ => refuse(Status::ReqDisallowed),
        }
    }
}

impl Default for Cscpc {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Cscpc {
    type Message = Message;
    const TYPE: TaskType = TaskType::Cscpc;

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
                debug!("cscpc: dropping {:?} in {:?}", evt, state);
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
        att::Value,
        prf::{
            client::{tests::h, CharInfo},
            cscp::{CtnlPtRespCode, MeasFlags},
            testing::{Bench, CONHDL},
        },
        uuid::AttUuid,
    };

    /// A sensor without the optional Sensor Location characteristic.
    fn peer() -> PeerSvc {
        let mut cscs = PeerSvc {
            start: h(0x40),
            end: h(0x49),
            ..PeerSvc::default()
        };
        let decls = [Some(0x41u16), Some(0x44), None, Some(0x46)];
        for (i, (def, decl)) in chars().iter().zip(&decls).enumerate() {
            if let Some(decl) = decl {
                cscs.chars[i] = CharInfo {
                    decl: h(*decl),
                    value: h(decl + 1),
                    props: def.props,
                };
            }
        }
        cscs.descs[0] = h(0x43);
        cscs.descs[1] = h(0x48);
        cscs
    }

    fn connected() -> Bench<Cscpc> {
        let mut bench = Bench::new(Cscpc::new());
        bench.request(Message::Enable {
            conhdl: CONHDL,
            con_type: ConType::Normal,
            cscs: peer(),
        });
        bench.app_msgs();
        assert_eq!(bench.state(), State::Connected);
        bench
    }

    fn value(bytes: &[u8]) -> Value {
        Value::from_slice(bytes).unwrap()
    }

    #[test]
    fn discovery_without_optional_characteristics() {
        let mut bench = Bench::new(Cscpc::new());
        bench.request(Message::Enable {
            conhdl: CONHDL,
            con_type: ConType::Discovery,
            cscs: PeerSvc::default(),
        });
        bench.gatt(GattEvent::ServiceFound {
            conhdl: CONHDL,
            uuid: AttUuid::short(SVC_UUID),
            start: h(0x40),
            end: h(0x45),
        });
        bench.gatt(GattEvent::DiscoveryCmp {
            conhdl: CONHDL,
            status: Status::AttributeNotFound,
        });
        bench.gatt(GattEvent::CharFound {
            conhdl: CONHDL,
            uuid: AttUuid::short(0x2A5B),
            decl: h(0x41),
            value: h(0x42),
            props: Properties::NOTIFY,
        });
        bench.gatt(GattEvent::CharFound {
            conhdl: CONHDL,
            uuid: AttUuid::short(0x2A5C),
            decl: h(0x44),
            value: h(0x45),
            props: Properties::READ,
        });
        bench.gatt(GattEvent::DiscoveryCmp {
            conhdl: CONHDL,
            status: Status::AttributeNotFound,
        });
        bench.gatt_reqs();
        bench.gatt(GattEvent::DescFound {
            conhdl: CONHDL,
            uuid: decl::CLIENT_CHAR_CFG,
            handle: h(0x43),
        });
        bench.gatt(GattEvent::DiscoveryCmp {
            conhdl: CONHDL,
            status: Status::AttributeNotFound,
        });

        match bench.app_msgs().as_slice() {
            [Message::EnableRsp {
                status: Status::Ok,
                cscs,
                ..
            }] => {
                assert_eq!(cscs.value(CHAR_FEAT), Some(h(0x45)));
                assert_eq!(cscs.value(CHAR_CTNL_PT), None);
                assert_eq!(cscs.desc(0), Some(h(0x43)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(bench.state(), State::Connected);
    }

    #[test]
    fn measurements_are_decoded() {
        let mut bench = connected();
        bench.gatt(GattEvent::PeerValue {
            conhdl: CONHDL,
            handle: h(0x42),
            value: value(&[0x02, 0x10, 0x00, 0x00, 0x04]),
            indication: false,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::ValueInd {
                conhdl: CONHDL,
                value: CscValue::Meas(Measurement {
                    flags: MeasFlags::CRANK_REV_DATA_PRESENT,
                    cumul_wheel_rev: 0,
                    last_wheel_evt_time: 0,
                    cumul_crank_rev: 0x10,
                    last_crank_evt_time: 0x0400,
                })
            }]
        );

        // Truncated measurements are dropped.
        bench.gatt(GattEvent::PeerValue {
            conhdl: CONHDL,
            handle: h(0x42),
            value: value(&[0x01, 0x10]),
            indication: false,
        });
        assert!(bench.app_msgs().is_empty());
    }

    #[test]
    fn reads() {
        let mut bench = connected();
        bench.request(Message::Read {
            conhdl: CONHDL,
            code: ReadCode::SensorLoc,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::Read,
                status: Status::FeatureNotSupported
            }]
        );

        bench.request(Message::Read {
            conhdl: CONHDL,
            code: ReadCode::Feature,
        });
        bench.gatt(GattEvent::ReadRsp {
            conhdl: CONHDL,
            handle: h(0x45),
            value: value(&[0x03, 0x00]),
        });
        assert_eq!(
            bench.app_msgs(),
            [
                Message::ValueInd {
                    conhdl: CONHDL,
                    value: CscValue::Feature(
                        Features::WHEEL_REV_DATA_SUPP | Features::CRANK_REV_DATA_SUPP
                    ),
                },
                Message::CmpEvt {
                    conhdl: CONHDL,
                    operation: Operation::Read,
                    status: Status::Ok
                }
            ]
        );
    }

    #[test]
    fn configuration_values() {
        let mut bench = connected();
        bench.request(Message::WriteCfg {
            conhdl: CONHDL,
            desc: DescCode::MeasCfg,
            cfg: CCCD_IND,
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
            desc: DescCode::CtnlPtCfg,
            cfg: CCCD_IND,
        });
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::Write {
                conhdl: CONHDL,
                handle: h(0x48),
                value: value(&[2, 0]),
                response: true
            }]
        );
    }

    #[test]
    fn control_point_procedure() {
        let mut bench = connected();
        let req = CtnlPtReq::SetCumulVal(0x0102);
        bench.request(Message::CtnlPt { conhdl: CONHDL, req });
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::Write {
                conhdl: CONHDL,
                handle: h(0x47),
                value: value(&[0x01, 0x02, 0x01, 0x00, 0x00]),
                response: true
            }]
        );

        bench.gatt(GattEvent::Cmp {
            conhdl: CONHDL,
            status: Status::Ok,
        });
        assert_eq!(bench.state(), State::Busy);
        assert!(bench.app_msgs().is_empty());

        // A response to another request doesn't finish the procedure.
        bench.gatt(GattEvent::PeerValue {
            conhdl: CONHDL,
            handle: h(0x47),
            value: value(&[0x10, 0x04, 0x01]),
            indication: true,
        });
        assert_eq!(bench.state(), State::Busy);

        bench.gatt(GattEvent::PeerValue {
            conhdl: CONHDL,
            handle: h(0x47),
            value: value(&[0x10, 0x01, 0x01]),
            indication: true,
        });
        assert_eq!(bench.state(), State::Connected);
        assert_eq!(
            bench.app_msgs(),
            [
                Message::ValueInd {
                    conhdl: CONHDL,
                    value: CscValue::CtnlPtRsp(CtnlPtRsp::new(
                        CtnlPtOpCode::SetCumulVal,
                        CtnlPtRespCode::Success
                    ))
                },
                Message::CmpEvt {
                    conhdl: CONHDL,
                    operation: Operation::CtnlPt(CtnlPtOpCode::SetCumulVal),
                    status: Status::Ok
                }
            ]
        );
    }

    #[test]
    fn control_point_write_failure() {
        let mut bench = connected();
        bench.request(Message::CtnlPt {
            conhdl: CONHDL,
            req: CtnlPtReq::ReqSuppLoc,
        });
        bench.gatt(GattEvent::Cmp {
            conhdl: CONHDL,
            status: Status::CccdImproperlyConfigured,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::CmpEvt {
                conhdl: CONHDL,
                operation: Operation::CtnlPt(CtnlPtOpCode::ReqSuppLoc),
                status: Status::CccdImproperlyConfigured
            }]
        );

        bench.disconnect(CONHDL);
        assert_eq!(bench.app_msgs(), [Message::DisableInd { conhdl: CONHDL }]);
        assert_eq!(bench.task.profile().cscs(), &PeerSvc::default());
    }
}
