//! Scan Parameters Service server.
//!
//! The peer writes the scan interval and window it uses into the Scan Interval Window
//! characteristic. With the optional Scan Refresh characteristic, the server can ask the peer to
//! write them again.

use {
    crate::{
        att::{AttHandle, AttributeDesc, PermRight, Permissions, Properties, ServiceLayout, Status},
        bytes::*,
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskType},
        prf::{store_cccd, write_cccd, Attachment, ConType, CCCD_NTF, CCCD_STOP},
        task::{Context, Event, Profile, Transition},
        Error,
    },
    bitflags::bitflags,
};

/// The only Scan Refresh value: the server requires the peer to refresh the scan parameters.
pub const SERVER_REQUIRES_REFRESH: u8 = 0x00;

const IDX_SVC: usize = 0;
const IDX_SCAN_INTV_WD_CHAR: usize = 1;
const IDX_SCAN_INTV_WD_VAL: usize = 2;
const IDX_SCAN_REFRESH_CHAR: usize = 3;
const IDX_SCAN_REFRESH_VAL: usize = 4;
const IDX_SCAN_REFRESH_NTF_CFG: usize = 5;

fn att_table() -> [AttributeDesc; 6] {
    [
        AttributeDesc::service(0x1813),
        AttributeDesc::characteristic(0x2A4F, Properties::WRITE_NO_RSP),
        AttributeDesc::value(0x2A4F, Permissions::WRITE_NO_RSP, ScanIntvWd::SIZE as u16),
        AttributeDesc::characteristic(0x2A31, Properties::NOTIFY),
        AttributeDesc::value(0x2A31, Permissions::NOTIFY, 1),
        AttributeDesc::cccd(),
    ]
}

bitflags! {
    pub struct Features: u8 {
        const SCAN_REFRESH_SUP = 0x01;
    }
}

/// Scan Interval Window characteristic value, in units of 0.625 ms.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScanIntvWd {
    pub le_scan_intv: u16,
    pub le_scan_window: u16,
}

impl ScanIntvWd {
    pub const SIZE: usize = 4;
}

impl FromBytes<'_> for ScanIntvWd {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            le_scan_intv: bytes.read_u16_le()?,
            le_scan_window: bytes.read_u16_le()?,
        })
    }
}

impl ToBytes for ScanIntvWd {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u16_le(self.le_scan_intv)?;
        writer.write_u16_le(self.le_scan_window)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Enable {
    pub conhdl: ConHdl,
    pub sec_lvl: PermRight,
    pub con_type: ConType,
    pub scan_refresh_ntf_en: u16,
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
        scan_refresh_ntf_en: u16,
    },
    /// Asks the peer to write its scan parameters again.
    ScanRefreshSend {
        conhdl: ConHdl,
        scan_refresh: u8,
    },
    ScanRefreshCfm {
        status: Status,
    },
    /// The peer wrote its scan parameters.
    ScanIntvWdInd {
        conhdl: ConHdl,
        scan_intv_wd: ScanIntvWd,
    },
    ScanRefreshNtfCfgInd {
        conhdl: ConHdl,
        scan_refresh_ntf_en: u16,
    },
    ErrorInd {
        conhdl: ConHdl,
        status: Status,
    },
}

/// Scan Parameters server role.
pub struct Scpps {
    con: Attachment,
    layout: Option<ServiceLayout>,
    ntf: bool,
}

impl Scpps {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            layout: None,
            ntf: false,
        }
    }

    fn attr(&self, idx: usize) -> Option<AttHandle> {
        self.layout.and_then(|l| l.handle(idx))
    }

    pub fn scan_intv_wd_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_SCAN_INTV_WD_VAL)
    }

    pub fn scan_refresh_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_SCAN_REFRESH_VAL)
    }

    pub fn ntf_cfg_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_SCAN_REFRESH_NTF_CFG)
    }

    pub fn ntf_enabled(&self) -> bool {
        self.ntf
    }

    fn create_db(&mut self, features: Features, ctx: &mut Context<'_>) -> Result<(), Status> {
        let mut cfg = crate::att::cfg_mask(&[IDX_SVC, IDX_SCAN_INTV_WD_CHAR, IDX_SCAN_INTV_WD_VAL]);
        if features.contains(Features::SCAN_REFRESH_SUP) {
            cfg |= crate::att::cfg_mask(&[
                IDX_SCAN_REFRESH_CHAR,
                IDX_SCAN_REFRESH_VAL,
                IDX_SCAN_REFRESH_NTF_CFG,
            ]);
        }
        let layout = ctx.db.create_db(&att_table(), cfg, ctx.id())?;
        ctx.db.set_permission(layout.start(), PermRight::Disabled)?;
        self.layout = Some(layout);
        Ok(())
    }

    fn enable(&mut self, params: Enable, ctx: &mut Context<'_>) -> Transition<Message> {
        let conhdl = params.conhdl;
        if !ctx.is_connected(conhdl) {
            warn!("scpps: enable for unknown connection {:#06x}", conhdl);
            return Transition::to(State::Idle).send(
                ctx.src(),
                Message::ErrorInd {
                    conhdl,
                    status: Status::ReqDisallowed,
                },
            );
        }

        let mut ntf = false;
        let mut result = Ok(());
        if let Some(handle) = self.ntf_cfg_handle() {
            let cfg = match params.con_type {
                ConType::Normal => params.scan_refresh_ntf_en,
                ConType::Discovery => CCCD_STOP,
            };
            ntf = cfg == CCCD_NTF;
            result = write_cccd(ctx.db, handle, cfg);
        }
        if let (Ok(()), Some(layout)) = (result, self.layout) {
            result = ctx.db.set_permission(layout.start(), params.sec_lvl);
        }

        match result {
            Ok(()) => {
                self.con.attach(conhdl, ctx.src());
                self.ntf = ntf;
                Transition::to(State::Connected)
            }
            Err(status) => {
                error!("scpps: enable failed: {:?}", status);
                Transition::to(State::Idle).send(ctx.src(), Message::ErrorInd { conhdl, status })
            }
        }
    }

    fn scan_refresh_send(
        &mut self,
        conhdl: ConHdl,
        scan_refresh: u8,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let status = if !self.con.owns(conhdl) || scan_refresh != SERVER_REQUIRES_REFRESH {
            Status::InvalidParam
        } else {
            match self.scan_refresh_handle() {
                None => Status::FeatureNotSupported,
                Some(_) if !self.ntf => Status::NtfDisabled,
                Some(handle) => match ctx.db.set_value(handle, &[scan_refresh]) {
                    Ok(()) => {
                        return Transition::to(State::Connected)
                            .gatt(GattReq::Notify { conhdl, handle })
                    }
                    Err(status) => status,
                },
            }
        };
        Transition::to(State::Connected).send(self.con.app(), Message::ScanRefreshCfm { status })
    }

    fn write(
        &mut self,
        conhdl: ConHdl,
        handle: AttHandle,
        value: &[u8],
        response: bool,
        last: bool,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let mut t = Transition::to(State::Connected);
        let status = if Some(handle) == self.scan_intv_wd_handle() {
            match decode_exact::<ScanIntvWd>(value) {
                Ok(scan_intv_wd) => {
                    t = t.send(self.con.app(), Message::ScanIntvWdInd { conhdl, scan_intv_wd });
                    Status::Ok
                }
                Err(_) => Status::InvalidAttributeValueLength,
            }
        } else if Some(handle) == self.ntf_cfg_handle() {
            match store_cccd(ctx.db, handle, value, CCCD_NTF) {
                Ok(cfg) => {
                    self.ntf = cfg == CCCD_NTF;
                    if last {
                        t = t.send(
                            self.con.app(),
                            Message::ScanRefreshNtfCfgInd {
                                conhdl,
                                scan_refresh_ntf_en: cfg,
                            },
                        );
                    }
                    Status::Ok
                }
                Err(status) => status,
            }
        } else {
            debug!("scpps: write to unhandled attribute {:?}", handle);
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
        let scan_refresh_ntf_en = if self.ntf { CCCD_NTF } else { CCCD_STOP };
        self.ntf = false;

        if let Some(layout) = self.layout {
            if let Err(status) = ctx.db.set_permission(layout.start(), PermRight::Disabled) {
                warn!("scpps: failed to hide service: {:?}", status);
            }
        }

        info!("scpps: disabled on {:#06x}", con.conhdl);
        Transition::to(State::Idle).send(
            con.app,
            Message::DisableInd {
                conhdl: con.conhdl,
                scan_refresh_ntf_en,
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
                        warn!("scpps: create_db failed: {:?}", status);
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

            (State::Connected, Message::ScanRefreshSend { conhdl, scan_refresh }) => {
                self.scan_refresh_send(conhdl, scan_refresh, ctx)
            }
            (state, Message::ScanRefreshSend { .. }) => Transition::to(state).send(
                ctx.src(),
                Message::ScanRefreshCfm {
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
                debug!("scpps: ignoring {:?} in {:?}", msg, state);
                Transition::to(state)
            }
        }
    }
}

impl Default for Scpps {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Scpps {
    type Message = Message;
    const TYPE: TaskType = TaskType::Scpps;

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
                        conhdl,
                        handle,
                        value,
                        response,
                        last,
                    } => self.write(conhdl, handle, &value, response, last, ctx),
                    GattEvent::NotifyCmp { status, .. } => {
                        Transition::to(State::Connected)
                            .send(self.con.app(), Message::ScanRefreshCfm { status })
                    }
                    other => {
                        debug!("scpps: ignoring {:?}", other);
                        Transition::to(state)
                    }
                }
            }
            Event::Gatt(evt) => {
                debug!("scpps: dropping {:?} in {:?}", evt, state);
                Transition::to(state)
            }
            Event::Disconnect(disc) if state >= State::Connected && self.con.owns(disc.conhdl) => {
                self.disable(ctx)
            }
            Event::Disconnect(_) => Transition::to(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        att::Value,
        prf::testing::{Bench, CONHDL},
    };

    fn connected(features: Features, con_type: ConType, scan_refresh_ntf_en: u16) -> Bench<Scpps> {
        let mut bench = Bench::new(Scpps::new());
        bench.request(Message::CreateDb { features });
        assert_eq!(bench.app_msgs(), [Message::CreateDbCfm { status: Status::Ok }]);
        bench.request(Message::Enable(Enable {
            conhdl: CONHDL,
            sec_lvl: PermRight::Enabled,
            con_type,
            scan_refresh_ntf_en,
        }));
        assert_eq!(bench.state(), State::Connected);
        bench
    }

    #[test]
    fn scan_refresh_is_optional() {
        let mut bench = connected(Features::empty(), ConType::Normal, CCCD_NTF);
        assert_eq!(bench.db.len(), 3);
        assert!(!bench.task.profile().ntf_enabled());
        bench.request(Message::ScanRefreshSend {
            conhdl: CONHDL,
            scan_refresh: SERVER_REQUIRES_REFRESH,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::ScanRefreshCfm {
                status: Status::FeatureNotSupported
            }]
        );
    }

    #[test]
    fn scan_interval_window_write() {
        let mut bench = connected(Features::empty(), ConType::Discovery, 0);
        let handle = bench.task.profile().scan_intv_wd_handle().unwrap();
        bench.gatt(GattEvent::Write {
            conhdl: CONHDL,
            handle,
            value: Value::from_slice(&[0x60, 0x00, 0x30, 0x00]).unwrap(),
            response: false,
            last: true,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::ScanIntvWdInd {
                conhdl: CONHDL,
                scan_intv_wd: ScanIntvWd {
                    le_scan_intv: 0x60,
                    le_scan_window: 0x30,
                }
            }]
        );
        assert!(bench.gatt_reqs().is_empty());

        bench.write(handle, &[0x60, 0x00, 0x30]);
        assert!(bench.app_msgs().is_empty());
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::WriteRsp {
                conhdl: CONHDL,
                handle,
                status: Status::InvalidAttributeValueLength
            }]
        );
    }

    #[test]
    fn refresh_notification() {
        let mut bench = connected(Features::SCAN_REFRESH_SUP, ConType::Normal, CCCD_NTF);
        let handle = bench.task.profile().scan_refresh_handle().unwrap();

        bench.request(Message::ScanRefreshSend {
            conhdl: CONHDL,
            scan_refresh: 1,
        });
        bench.request(Message::ScanRefreshSend {
            conhdl: 0x0041,
            scan_refresh: SERVER_REQUIRES_REFRESH,
        });
        assert_eq!(
            bench.app_msgs(),
            [
                Message::ScanRefreshCfm {
                    status: Status::InvalidParam
                },
                Message::ScanRefreshCfm {
                    status: Status::InvalidParam
                },
            ]
        );

        bench.request(Message::ScanRefreshSend {
            conhdl: CONHDL,
            scan_refresh: SERVER_REQUIRES_REFRESH,
        });
        assert_eq!(bench.gatt_reqs(), [GattReq::Notify { conhdl: CONHDL, handle }]);
        bench.gatt(GattEvent::NotifyCmp {
            conhdl: CONHDL,
            handle,
            status: Status::Ok,
        });
        assert_eq!(bench.app_msgs(), [Message::ScanRefreshCfm { status: Status::Ok }]);
    }

    #[test]
    fn refresh_configuration() {
        let mut bench = connected(Features::SCAN_REFRESH_SUP, ConType::Discovery, CCCD_NTF);
        let cfg = bench.task.profile().ntf_cfg_handle().unwrap();
        assert_eq!(bench.value(cfg), [0, 0]);

        bench.request(Message::ScanRefreshSend {
            conhdl: CONHDL,
            scan_refresh: SERVER_REQUIRES_REFRESH,
        });
        assert_eq!(
            bench.app_msgs(),
            [Message::ScanRefreshCfm {
                status: Status::NtfDisabled
            }]
        );

        bench.write(cfg, &[0x02, 0x00]);
        assert_eq!(
            bench.gatt_reqs(),
            [GattReq::WriteRsp {
                conhdl: CONHDL,
                handle: cfg,
                status: Status::AppError
            }]
        );
        bench.write(cfg, &[0x01, 0x00]);
        assert_eq!(
            bench.app_msgs(),
            [Message::ScanRefreshNtfCfgInd {
                conhdl: CONHDL,
                scan_refresh_ntf_en: CCCD_NTF
            }]
        );
        assert_eq!(bench.value(cfg), [1, 0]);

        bench.request(Message::Disable { conhdl: CONHDL });
        bench.disconnect(CONHDL);
        assert_eq!(
            bench.app_msgs(),
            [Message::DisableInd {
                conhdl: CONHDL,
                scan_refresh_ntf_en: CCCD_NTF
            }]
        );
        assert_eq!(bench.state(), State::Idle);
    }
}
