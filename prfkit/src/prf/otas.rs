//! Over-the-air firmware update server.
//!
//! The peer writes framed packets to the RX characteristic and gets an acknowledgement for each
//! one through notifications of the TX characteristic. Every packet is `[command, body...,
//! checksum]`, the checksum being the wrapping sum of all preceding bytes:
//!
//! * `0x01` metadata: `size: u32`, the image size. Starts a transfer.
//! * `0x02` data: the next `1..=DATA_MAX_LEN` image bytes.
//! * `0x03` verify: `sum: u32`, the wrapping sum of all image bytes. Ends the transfer.
//!
//! Acknowledgements are `[0x80 | command, code, checksum]` with a [`RspCode`].
//!
//! Storing the image is up to the application: received bytes are handed over in
//! [`Message::ImageChunk`], and progress is reported in [`Message::StatusInd`]. Whether a
//! transfer starts right after the metadata or only once the application agrees is selected by
//! [`StartCtrl`]. In the latter case the application is expected to arm a timer when it sees
//! the start request and to send [`Message::CtrlTimer`] when it expires.
//!
//! [`RspCode`]: enum.RspCode.html
//! [`Message::ImageChunk`]: enum.Message.html#variant.ImageChunk
//! [`Message::StatusInd`]: enum.Message.html#variant.StatusInd
//! [`StartCtrl`]: enum.StartCtrl.html
//! [`Message::CtrlTimer`]: enum.Message.html#variant.CtrlTimer

use {
    crate::{
        att::{
            AttHandle, AttributeDesc, PermRight, Permissions, Properties, ServiceLayout, Status,
            Value,
        },
        bytes::*,
        gatt::{GattEvent, GattReq},
        kernel::{ConHdl, State, TaskType},
        prf::{store_cccd, write_cccd, Attachment, ConType, CCCD_NTF, CCCD_STOP},
        task::{Context, Event, Profile, Transition},
        Error,
    },
    core::convert::TryInto,
};

/// Longest packet the peer may write.
pub const RX_MAX_LEN: usize = 20;

/// Most image bytes carried by one data packet.
pub const DATA_MAX_LEN: usize = RX_MAX_LEN - 2;

const TX_LEN: usize = 3;

const IDX_SVC: usize = 0;
const IDX_RX_CHAR: usize = 1;
const IDX_RX_VAL: usize = 2;
const IDX_TX_CHAR: usize = 3;
const IDX_TX_VAL: usize = 4;
const IDX_TX_NTF_CFG: usize = 5;
const IDX_NB: usize = 6;

const ALL: [usize; IDX_NB] = [
    IDX_SVC,
    IDX_RX_CHAR,
    IDX_RX_VAL,
    IDX_TX_CHAR,
    IDX_TX_VAL,
    IDX_TX_NTF_CFG,
];

fn att_table() -> [AttributeDesc; IDX_NB] {
    [
        AttributeDesc::service(0xFEE8),
        AttributeDesc::characteristic(0xFEE9, Properties::WRITE_NO_RSP),
        AttributeDesc::value(0xFEE9, Permissions::WRITE_NO_RSP, RX_MAX_LEN as u16),
        AttributeDesc::characteristic(0xFEEA, Properties::NOTIFY),
        AttributeDesc::value(0xFEEA, Permissions::NOTIFY, TX_LEN as u16),
        AttributeDesc::cccd(),
    ]
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Command(u8) {
        Meta = 0x01,
        Data = 0x02,
        Verify = 0x03,
    }
}

enum_with_unknown! {
    /// Why a transfer failed.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ErrorType(u8) {
        /// Packet checksum mismatch.
        Checksum = 0x01,
        /// Packet too long or empty, or more data than announced.
        Length = 0x02,
        /// The device has no room for an image.
        NotSupported = 0x03,
        /// Announced image size is zero or too large.
        SizeOverflow = 0x04,
        /// Image checksum mismatch.
        Verify = 0x05,
    }
}

enum_with_unknown! {
    /// Result code of an acknowledgement.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum RspCode(u8) {
        Ok = 0x00,
        Checksum = 0x01,
        Length = 0x02,
        NotSupported = 0x03,
        SizeOverflow = 0x04,
        Verify = 0x05,
        /// The application refused the transfer, or didn't answer in time.
        Rejected = 0x06,
    }
}

impl From<ErrorType> for RspCode {
    fn from(err: ErrorType) -> Self {
        RspCode::from(u8::from(err))
    }
}

/// Transfer progress, as reported to the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransmitStatus {
    /// Valid metadata was received.
    StartReq { size: u32 },
    Ongoing { received: u32 },
    FinishOk,
    FinishFail(ErrorType),
}

/// Who decides whether a transfer starts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StartCtrl {
    /// Transfers start as soon as valid metadata arrives.
    Profile,
    /// Transfers wait for [`Message::CtrlResp`].
    ///
    /// [`Message::CtrlResp`]: enum.Message.html#variant.CtrlResp
    App,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CtrlResp {
    Start,
    Reject,
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// A packet written by the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Meta { size: u32 },
    Data(&'a [u8]),
    Verify { sum: u32 },
}

impl<'a> Packet<'a> {
    pub fn command(&self) -> Command {
        match self {
            Packet::Meta { .. } => Command::Meta,
            Packet::Data(_) => Command::Data,
            Packet::Verify { .. } => Command::Verify,
        }
    }

    /// Checks the framing of `raw` and splits it into a packet.
    ///
    /// Unknown commands are reported as `Ok(None)`.
    pub fn decode(raw: &'a [u8]) -> Result<Option<Self>, ErrorType> {
        if raw.len() < 2 || raw.len() > RX_MAX_LEN {
            return Err(ErrorType::Length);
        }
        let (framed, sum) = raw.split_at(raw.len() - 1);
        if checksum(framed) != sum[0] {
            return Err(ErrorType::Checksum);
        }

        let body = &framed[1..];
        let word = || -> Result<u32, ErrorType> {
            let bytes: [u8; 4] = body.try_into().map_err(|_| ErrorType::Length)?;
            Ok(u32::from_le_bytes(bytes))
        };
        Ok(Some(match Command::from(framed[0]) {
            Command::Meta => Packet::Meta { size: word()? },
            Command::Data if body.is_empty() => return Err(ErrorType::Length),
            Command::Data => Packet::Data(body),
            Command::Verify => Packet::Verify { sum: word()? },
            Command::Unknown(_) => return Ok(None),
        }))
    }
}

impl ToBytes for Packet<'_> {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let cmd = u8::from(self.command());
        let word: [u8; 4];
        let body = match *self {
            Packet::Meta { size: v } | Packet::Verify { sum: v } => {
                word = v.to_le_bytes();
                &word[..]
            }
            Packet::Data(data) => data,
        };
        writer.write_u8(cmd)?;
        writer.write_slice(body)?;
        writer.write_u8(checksum(body).wrapping_add(cmd))
    }
}

/// An acknowledgement sent to the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Ack {
    pub cmd: Command,
    pub code: RspCode,
}

impl ToBytes for Ack {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let bytes = [0x80 | u8::from(self.cmd), u8::from(self.code)];
        writer.write_slice(&bytes)?;
        writer.write_u8(checksum(&bytes))
    }
}

impl FromBytes<'_> for Ack {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let raw: [u8; TX_LEN] = bytes.read_array()?;
        if raw[0] & 0x80 == 0 || checksum(&raw[..2]) != raw[2] {
            return Err(Error::InvalidValue);
        }
        Ok(Ack {
            cmd: Command::from(raw[0] & 0x7F),
            code: RspCode::from(raw[1]),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Enable {
    pub conhdl: ConHdl,
    pub sec_lvl: PermRight,
    pub con_type: ConType,
    pub ntf_en: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CreateDb {
        ctrl: StartCtrl,
        /// Largest image the device can take. Zero if it can't be updated.
        image_capacity: u32,
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
        ntf_en: u16,
    },
    ErrorInd {
        conhdl: ConHdl,
        status: Status,
    },
    /// Changes who decides whether transfers start.
    Control(StartCtrl),
    StatusInd {
        conhdl: ConHdl,
        status: TransmitStatus,
    },
    /// Image bytes to store at `offset`.
    ImageChunk {
        offset: u32,
        data: Value,
    },
    /// The application's answer to a start request.
    CtrlResp(CtrlResp),
    /// The application's start request timer expired.
    CtrlTimer,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Transfer {
    None,
    AwaitStart { size: u32 },
    Receiving { size: u32, received: u32, sum: u32 },
}

/// OTA server role.
pub struct Otas {
    con: Attachment,
    layout: Option<ServiceLayout>,
    ctrl: StartCtrl,
    capacity: u32,
    ntf: bool,
    transfer: Transfer,
}

impl Otas {
    pub fn new() -> Self {
        Self {
            con: Attachment::new(),
            layout: None,
            ctrl: StartCtrl::Profile,
            capacity: 0,
            ntf: false,
            transfer: Transfer::None,
        }
    }

    fn attr(&self, idx: usize) -> Option<AttHandle> {
        self.layout.and_then(|l| l.handle(idx))
    }

    pub fn rx_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_RX_VAL)
    }

    pub fn tx_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_TX_VAL)
    }

    pub fn ntf_cfg_handle(&self) -> Option<AttHandle> {
        self.attr(IDX_TX_NTF_CFG)
    }

    /// Whether a transfer is running or waiting to start.
    pub fn in_transfer(&self) -> bool {
        self.transfer != Transfer::None
    }

    fn create_db(&mut self, ctx: &mut Context<'_>) -> Result<(), Status> {
        let layout = ctx
            .db
            .create_db(&att_table(), crate::att::cfg_mask(&ALL), ctx.id())?;
        ctx.db.set_permission(layout.start(), PermRight::Disabled)?;
        self.layout = Some(layout);
        Ok(())
    }

    fn enable(&mut self, params: Enable, ctx: &mut Context<'_>) -> Transition<Message> {
        let conhdl = params.conhdl;
        if !ctx.is_connected(conhdl) {
            warn!("otas: enable for unknown connection {:#06x}", conhdl);
            return Transition::to(State::Idle).send(
                ctx.src(),
                Message::ErrorInd {
                    conhdl,
                    status: Status::ReqDisallowed,
                },
            );
        }

        let cfg = match params.con_type {
            ConType::Normal if params.ntf_en == CCCD_NTF => CCCD_NTF,
            _ => CCCD_STOP,
        };
        let result = match (self.ntf_cfg_handle(), self.layout) {
            (Some(handle), Some(layout)) => write_cccd(ctx.db, handle, cfg)
                .and_then(|()| ctx.db.set_permission(layout.start(), params.sec_lvl)),
            _ => Err(Status::InexistentHandle),
        };
        match result {
            Ok(()) => {
                self.con.attach(conhdl, ctx.src());
                self.ntf = cfg == CCCD_NTF;
                self.transfer = Transfer::None;
                Transition::to(State::Connected)
            }
            Err(status) => {
                error!("otas: enable failed: {:?}", status);
                Transition::to(State::Idle).send(ctx.src(), Message::ErrorInd { conhdl, status })
            }
        }
    }

    /// Acknowledges a packet, if the peer listens.
    fn ack(
        &self,
        t: Transition<Message>,
        conhdl: ConHdl,
        ack: Ack,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let handle = match self.tx_handle() {
            Some(handle) if self.ntf => handle,
            _ => return t,
        };
        let mut buf = [0; TX_LEN];
        let stored = encode_into(&ack, &mut buf)
            .map_err(Status::from)
            .and_then(|len| ctx.db.set_value(handle, &buf[..len]));
        match stored {
            Ok(()) => t.gatt(GattReq::Notify { conhdl, handle }),
            Err(status) => {
                warn!("otas: failed to store ack: {:?}", status);
                t
            }
        }
    }

    fn status(
        &self,
        t: Transition<Message>,
        conhdl: ConHdl,
        status: TransmitStatus,
    ) -> Transition<Message> {
        t.send(self.con.app(), Message::StatusInd { conhdl, status })
    }

    /// Aborts the transfer.
    fn fail(
        &mut self,
        conhdl: ConHdl,
        cmd: Command,
        err: ErrorType,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        warn!("otas: transfer failed: {:?}", err);
        self.transfer = Transfer::None;
        let t = Transition::to(State::Connected);
        let t = self.status(t, conhdl, TransmitStatus::FinishFail(err));
        self.ack(t, conhdl, Ack { cmd, code: err.into() }, ctx)
    }

    fn start(&mut self, conhdl: ConHdl, size: u32, ctx: &mut Context<'_>) -> Transition<Message> {
        info!("otas: receiving {} byte image", size);
        self.transfer = Transfer::Receiving {
            size,
            received: 0,
            sum: 0,
        };
        let ack = Ack {
            cmd: Command::Meta,
            code: RspCode::Ok,
        };
        self.ack(Transition::to(State::Connected), conhdl, ack, ctx)
    }

    fn reject(&mut self, ctx: &mut Context<'_>) -> Transition<Message> {
        self.transfer = Transfer::None;
        let t = Transition::to(State::Connected);
        match self.con.conhdl() {
            Some(conhdl) => {
                let ack = Ack {
                    cmd: Command::Meta,
                    code: RspCode::Rejected,
                };
                self.ack(t, conhdl, ack, ctx)
            }
            None => t,
        }
    }

    fn rx_write(
        &mut self,
        conhdl: ConHdl,
        raw: &[u8],
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        let cmd = raw.first().map_or(Command::Unknown(0), |&b| Command::from(b));
        let packet = match Packet::decode(raw) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("otas: ignoring unknown command {:?}", cmd);
                return Transition::to(State::Connected);
            }
            Err(err) => return self.fail(conhdl, cmd, err, ctx),
        };

        match (self.transfer, packet) {
            (_, Packet::Meta { size }) => {
                if self.capacity == 0 {
                    return self.fail(conhdl, cmd, ErrorType::NotSupported, ctx);
                }
                if size == 0 || size > self.capacity {
                    return self.fail(conhdl, cmd, ErrorType::SizeOverflow, ctx);
                }
                let req = TransmitStatus::StartReq { size };
                match self.ctrl {
                    StartCtrl::Profile => {
                        let t = self.status(Transition::to(State::Connected), conhdl, req);
                        t.then(self.start(conhdl, size, ctx))
                    }
                    StartCtrl::App => {
                        self.transfer = Transfer::AwaitStart { size };
                        self.status(Transition::to(State::Connected), conhdl, req)
                    }
                }
            }
            (Transfer::Receiving { size, received, sum }, Packet::Data(data)) => {
                let len = data.len() as u32;
                if received + len > size {
                    return self.fail(conhdl, cmd, ErrorType::Length, ctx);
                }
                let chunk = match Value::from_slice(data) {
                    Ok(chunk) => chunk,
                    Err(()) => return self.fail(conhdl, cmd, ErrorType::Length, ctx),
                };
                let received_now = received + len;
                self.transfer = Transfer::Receiving {
                    size,
                    received: received_now,
                    sum: data.iter().fold(sum, |s, &b| s.wrapping_add(u32::from(b))),
                };
                let t = Transition::to(State::Connected).send(
                    self.con.app(),
                    Message::ImageChunk {
                        offset: received,
                        data: chunk,
                    },
                );
                let t = self.status(t, conhdl, TransmitStatus::Ongoing { received: received_now });
                let ack = Ack {
                    cmd,
                    code: RspCode::Ok,
                };
                self.ack(t, conhdl, ack, ctx)
            }
            (Transfer::Receiving { size, received, sum }, Packet::Verify { sum: expected }) => {
                if received != size || sum != expected {
                    return self.fail(conhdl, cmd, ErrorType::Verify, ctx);
                }
                info!("otas: image complete");
                self.transfer = Transfer::None;
                let t = Transition::to(State::Connected);
                let t = self.status(t, conhdl, TransmitStatus::FinishOk);
                let ack = Ack {
                    cmd,
                    code: RspCode::Ok,
                };
                self.ack(t, conhdl, ack, ctx)
            }
            (transfer, packet) => {
                debug!("otas: {:?} not expected in {:?}", packet.command(), transfer);
                Transition::to(State::Connected)
            }
        }
    }

    fn write(
        &mut self,
        conhdl: ConHdl,
        handle: AttHandle,
        value: &[u8],
        response: bool,
        ctx: &mut Context<'_>,
    ) -> Transition<Message> {
        if Some(handle) == self.rx_handle() {
            let t = self.rx_write(conhdl, value, ctx);
            return if response {
                t.gatt(GattReq::WriteRsp {
                    conhdl,
                    handle,
                    status: Status::Ok,
                })
            } else {
                t
            };
        }

        let status = if Some(handle) == self.ntf_cfg_handle() {
            match store_cccd(ctx.db, handle, value, CCCD_NTF) {
                Ok(cfg) => {
                    self.ntf = cfg == CCCD_NTF;
                    Status::Ok
                }
                Err(status) => status,
            }
        } else {
            debug!("otas: write to unhandled attribute {:?}", handle);
            Status::WriteNotPermitted
        };
        let t = Transition::to(State::Connected);
        if response {
            t.gatt(GattReq::WriteRsp { conhdl, handle, status })
        } else {
            t
        }
    }

    fn disable(&mut self, ctx: &mut Context<'_>) -> Transition<Message> {
        let con = match self.con.detach() {
            Some(con) => con,
            None => return Transition::to(State::Idle),
        };
        if self.in_transfer() {
            warn!("otas: transfer aborted by disconnection");
        }
        self.transfer = Transfer::None;
        let ntf_en = if self.ntf { CCCD_NTF } else { CCCD_STOP };
        self.ntf = false;

        if let Some(layout) = self.layout {
            if let Err(status) = ctx.db.set_permission(layout.start(), PermRight::Disabled) {
                warn!("otas: failed to hide service: {:?}", status);
            }
        }

        info!("otas: disabled on {:#06x}", con.conhdl);
        Transition::to(State::Idle).send(
            con.app,
            Message::DisableInd {
                conhdl: con.conhdl,
                ntf_en,
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
            (State::Disabled, Message::CreateDb { ctrl, image_capacity }) => {
                self.con.set_app(ctx.src());
                self.ctrl = ctrl;
                self.capacity = image_capacity;
                let (next, status) = match self.create_db(ctx) {
                    Ok(()) => (State::Idle, Status::Ok),
                    Err(status) => {
                        warn!("otas: create_db failed: {:?}", status);
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

            (state, Message::Control(ctrl)) => {
                self.ctrl = ctrl;
                Transition::to(state)
            }

            (State::Connected, Message::CtrlResp(resp)) => {
                match (self.transfer, resp, self.con.conhdl()) {
                    (Transfer::AwaitStart { size }, CtrlResp::Start, Some(conhdl)) => {
                        self.start(conhdl, size, ctx)
                    }
                    (Transfer::AwaitStart { .. }, CtrlResp::Reject, _) => {
                        info!("otas: transfer rejected");
                        self.reject(ctx)
                    }
                    (transfer, resp, _) => {
                        debug!("otas: ignoring {:?} in {:?}", resp, transfer);
                        Transition::to(State::Connected)
                    }
                }
            }
            (State::Connected, Message::CtrlTimer) => match self.transfer {
                Transfer::AwaitStart { .. } => {
                    warn!("otas: no start decision in time");
                    self.reject(ctx)
                }
                _ => Transition::to(State::Connected),
            },

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
                debug!("otas: ignoring {:?} in {:?}", msg, state);
                Transition::to(state)
            }
        }
    }
}

impl Default for Otas {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile for Otas {
    type Message = Message;
    const TYPE: TaskType = TaskType::Otas;

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
                        ..
                    } => self.write(conhdl, handle, &value, response, ctx),
                    GattEvent::NotifyCmp { status, .. } if !status.is_ok() => {
                        warn!("otas: ack not sent: {:?}", status);
                        Transition::to(state)
                    }
                    other => {
                        trace!("otas: ignoring {:?}", other);
                        Transition::to(state)
                    }
                }
            }
            Event::Gatt(evt) => {
                debug!("otas: dropping {:?} in {:?}", evt, state);
                Transition::to(state)
            }
            Event::Disconnect(disc) if state >= State::Connected && self.con.owns(disc.conhdl) => {
                self.disable(ctx)
            }
            Event::Disconnect(_) => Transition::to(state),
        }
    }
}
