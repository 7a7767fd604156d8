//! Runs a battery and heart rate sensor against a simulated peer.
//!
//! The profile tasks, the dispatcher and the in-memory kernel are the real ones. The peer side
//! is played by `Peer`: it answers the GATT requests the tasks make and writes the heart rate
//! measurement configuration like a real collector would.

mod logger;

use prfkit::{
    att::{AttHandle, PermRight, Status, Value},
    dispatch::{AppHandler, Dispatcher},
    gatt::{GattEvent, GattReq},
    kernel::{ConHdl, Envelope, Kernel, Payload, PayloadVariant, TaskId, TaskType},
    prf::{
        bass::{self, Bass},
        hrps::{self, BodySensorLocation, Hrps, MeasFlags, Measurement},
        CharPresFmt, ConType, CCCD_NTF, CCCD_STOP,
    },
    sim::{MemoryDb, MemoryKernel, SimConfig},
    task::Task,
    uuid::{decl, AttUuid},
    Error,
};

#[cfg(feature = "log")]
use log::{info, warn};

#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($t:tt)*) => {{ format_args!($($t)*); }};
}

const CONHDL: ConHdl = 0x0001;

/// Heart rate samples fed to the sensor, one per tick.
const HEART_RATES: [u16; 5] = [72, 75, 81, 90, 88];

/// Application side of the sensor: logs what the profiles report.
struct SensorApp;

impl AppHandler for SensorApp {
    fn handle(&mut self, msg: Envelope, _: &mut dyn Kernel) {
        match msg.payload {
            Payload::Bass(bass::Message::CreateDbCfm { status })
            | Payload::Hrps(hrps::Message::CreateDbCfm { status }) => {
                info!("{:?} database created: {:?}", msg.src, status);
            }
            Payload::Hrps(hrps::Message::CfgIndNtfInd { cfg_val, .. }) => {
                info!("collector set measurement configuration to {:#06x}", cfg_val);
            }
            Payload::Hrps(hrps::Message::MeasSendCfm { status, .. }) if !status.is_ok() => {
                warn!("measurement not sent: {:?}", status);
            }
            Payload::Bass(bass::Message::DisableInd { ntf_cfg, .. }) => {
                info!("battery service disabled, keeping configuration {:?}", ntf_cfg);
            }
            Payload::Hrps(hrps::Message::DisableInd {
                hr_meas_ntf_cfg, ..
            }) => {
                info!(
                    "heart rate service disabled, keeping configuration {:#06x}",
                    hr_meas_ntf_cfg
                );
            }
            other => info!("{:?}: {:?}", msg.src, other),
        }
    }
}

/// The connected collector.
struct Peer {
    notifications: usize,
}

impl Peer {
    /// Answers every pending GATT request. Returns the number of requests handled.
    fn serve(&mut self, kernel: &mut MemoryKernel) -> Result<usize, Error> {
        let mut served = 0;
        while let Some((src, req)) = kernel.next_gatt() {
            served += 1;
            match req {
                GattReq::Notify { conhdl, handle } => {
                    self.notifications += 1;
                    info!("peer: notification from {:?} on {:?}", src, handle);
                    let cmp = GattEvent::NotifyCmp {
                        conhdl,
                        handle,
                        status: Status::Ok,
                    };
                    kernel.send(Envelope::new(TaskId::GATT, src, Payload::Gatt(cmp)))?;
                }
                GattReq::WriteRsp { handle, status, .. } => {
                    info!("peer: write to {:?} answered with {:?}", handle, status);
                }
                other => warn!("peer: unexpected request {:?}", other),
            }
        }
        Ok(served)
    }
}

/// Delivers messages and GATT answers until both sides are quiet.
fn settle(dispatcher: &mut Dispatcher<'_, SimConfig>, peer: &mut Peer) -> Result<(), Error> {
    loop {
        let delivered = dispatcher.schedule()?;
        let served = peer.serve(dispatcher.kernel_mut())?;
        if delivered == 0 && served == 0 {
            return Ok(());
        }
    }
}

fn post<M: PayloadVariant>(
    dispatcher: &mut Dispatcher<'_, SimConfig>,
    dest: TaskId,
    msg: M,
) -> Result<(), Error> {
    dispatcher.post(Envelope::new(TaskId::APP, dest, msg.wrap()))
}

fn main() -> Result<(), Error> {
    logger::init();

    let bass_id = TaskId::new(TaskType::Bass, 0);
    let hrps_id = TaskId::new(TaskType::Hrps, 0);
    let mut battery = Task::new(0, Bass::new());
    let mut heart_rate = Task::new(0, Hrps::new());
    let mut app = SensorApp;
    let mut peer = Peer { notifications: 0 };

    let mut dispatcher: Dispatcher<'_, SimConfig> =
        Dispatcher::new(MemoryDb::new(), MemoryKernel::new(), &mut app);
    dispatcher.register(&mut battery)?;
    dispatcher.register(&mut heart_rate)?;
    dispatcher.init();

    post(
        &mut dispatcher,
        bass_id,
        bass::Message::CreateDb(bass::CreateDb {
            bas_nb: 1,
            features: [bass::Features::LEVEL_NTF_SUP, bass::Features::empty()],
        }),
    )?;
    post(
        &mut dispatcher,
        hrps_id,
        hrps::Message::CreateDb {
            features: hrps::Features::BODY_SENSOR_LOC_CHAR_SUP,
        },
    )?;
    settle(&mut dispatcher, &mut peer)?;
    info!("{} attributes in the database", dispatcher.db().len());

    dispatcher
        .kernel_mut()
        .connect(CONHDL)
        .ok_or(Error::QueueFull)?;
    post(
        &mut dispatcher,
        bass_id,
        bass::Message::Enable(bass::Enable {
            conhdl: CONHDL,
            sec_lvl: PermRight::Enabled,
            con_type: ConType::Normal,
            ntf_cfg: [CCCD_NTF, CCCD_STOP],
            old_level: [100, 0],
            current_level: [97, 0],
            pres_fmt: [CharPresFmt::default(); 2],
        }),
    )?;
    post(
        &mut dispatcher,
        hrps_id,
        hrps::Message::Enable(hrps::Enable {
            conhdl: CONHDL,
            sec_lvl: PermRight::Enabled,
            con_type: ConType::Discovery,
            hr_meas_ntf_cfg: CCCD_STOP,
            body_sensor_loc: BodySensorLocation::Chest,
        }),
    )?;
    settle(&mut dispatcher, &mut peer)?;

    // The collector turns on heart rate notifications.
    let meas = dispatcher
        .db()
        .find(AttUuid::short(0x2A37), AttHandle::from_raw(1))
        .ok_or(Error::InvalidValue)?;
    let cccd = dispatcher
        .db()
        .find(AttUuid::from(decl::CLIENT_CHAR_CFG), meas)
        .ok_or(Error::InvalidValue)?;
    let write = GattEvent::Write {
        conhdl: CONHDL,
        handle: cccd,
        value: Value::from_slice(&CCCD_NTF.to_le_bytes()).map_err(|()| Error::InvalidLength)?,
        response: true,
        last: true,
    };
    dispatcher.post(Envelope::new(TaskId::GATT, hrps_id, Payload::Gatt(write)))?;
    settle(&mut dispatcher, &mut peer)?;

    for (tick, &bpm) in HEART_RATES.iter().enumerate() {
        post(
            &mut dispatcher,
            hrps_id,
            hrps::Message::MeasSend {
                conhdl: CONHDL,
                meas: Measurement {
                    flags: MeasFlags::SENSOR_CONTACT_SUPPORTED | MeasFlags::SENSOR_CONTACT_DETECTED,
                    heart_rate: bpm,
                    energy_expended: 0,
                    rr_intervals: Default::default(),
                },
            },
        )?;
        if tick % 2 == 0 {
            post(
                &mut dispatcher,
                bass_id,
                bass::Message::UpdateLevel {
                    conhdl: CONHDL,
                    instance: 0,
                    level: 97 - tick as u8,
                },
            )?;
        }
        settle(&mut dispatcher, &mut peer)?;
    }

    dispatcher.kernel_mut().disconnect(CONHDL, 0x13)?;
    settle(&mut dispatcher, &mut peer)?;

    info!("session over, {} notifications received", peer.notifications);
    Ok(())
}
