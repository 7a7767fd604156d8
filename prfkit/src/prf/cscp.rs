//! Cycling Speed and Cadence types shared by the sensor and collector roles.

use {
    crate::{bytes::*, Error},
    bitflags::bitflags,
    heapless::{consts::U16, Vec},
};

/// Number of defined sensor locations. Location values are `0..LOC_MAX`.
pub const LOC_MAX: u8 = 15;

/// Sensor location "Other".
pub const LOC_OTHER: u8 = 0;

/// Largest packed measurement: flags, wheel and crank revolution data.
pub const MEAS_MAX_LEN: usize = 11;

/// Largest SC Control Point response: header plus every supported location.
pub const CTNL_PT_RSP_MAX_LEN: usize = 3 + LOC_MAX as usize;

bitflags! {
    /// CSC Feature characteristic value.
    pub struct Features: u16 {
        const WHEEL_REV_DATA_SUPP = 0x0001;
        const CRANK_REV_DATA_SUPP = 0x0002;
        const MULT_SENSOR_LOC_SUPP = 0x0004;
    }
}

bitflags! {
    /// Flags field of a CSC Measurement.
    pub struct MeasFlags: u8 {
        const WHEEL_REV_DATA_PRESENT = 0x01;
        const CRANK_REV_DATA_PRESENT = 0x02;
    }
}

enum_with_unknown! {
    /// SC Control Point op codes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum CtnlPtOpCode(u8) {
        SetCumulVal = 0x01,
        StartCalibration = 0x02,
        UpdLoc = 0x03,
        ReqSuppLoc = 0x04,
        Response = 0x10,
    }
}

enum_with_unknown! {
    /// Result codes carried in SC Control Point responses.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum CtnlPtRespCode(u8) {
        Success = 0x01,
        NotSupported = 0x02,
        InvalidParam = 0x03,
        Failed = 0x04,
    }
}

/// A CSC Measurement as sent over the air.
///
/// Wheel data is `cumul_wheel_rev: u32, last_wheel_evt_time: u16`, crank data is
/// `cumul_crank_rev: u16, last_crank_evt_time: u16`; each is present when its flag is set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub flags: MeasFlags,
    pub cumul_wheel_rev: u32,
    /// In units of 1/1024 second.
    pub last_wheel_evt_time: u16,
    pub cumul_crank_rev: u16,
    pub last_crank_evt_time: u16,
}

impl ToBytes for Measurement {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.flags.bits())?;
        if self.flags.contains(MeasFlags::WHEEL_REV_DATA_PRESENT) {
            writer.write_u32_le(self.cumul_wheel_rev)?;
            writer.write_u16_le(self.last_wheel_evt_time)?;
        }
        if self.flags.contains(MeasFlags::CRANK_REV_DATA_PRESENT) {
            writer.write_u16_le(self.cumul_crank_rev)?;
            writer.write_u16_le(self.last_crank_evt_time)?;
        }
        Ok(())
    }
}

impl FromBytes<'_> for Measurement {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        let mut meas = Measurement {
            flags: MeasFlags::from_bits_truncate(bytes.read_u8()?),
            cumul_wheel_rev: 0,
            last_wheel_evt_time: 0,
            cumul_crank_rev: 0,
            last_crank_evt_time: 0,
        };
        if meas.flags.contains(MeasFlags::WHEEL_REV_DATA_PRESENT) {
            meas.cumul_wheel_rev = bytes.read_u32_le()?;
            meas.last_wheel_evt_time = bytes.read_u16_le()?;
        }
        if meas.flags.contains(MeasFlags::CRANK_REV_DATA_PRESENT) {
            meas.cumul_crank_rev = bytes.read_u16_le()?;
            meas.last_crank_evt_time = bytes.read_u16_le()?;
        }
        Ok(meas)
    }
}

/// A request written to the SC Control Point.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CtnlPtReq {
    SetCumulVal(u32),
    UpdLoc(u8),
    ReqSuppLoc,
}

impl CtnlPtReq {
    pub fn op_code(&self) -> CtnlPtOpCode {
        match self {
            CtnlPtReq::SetCumulVal(_) => CtnlPtOpCode::SetCumulVal,
            CtnlPtReq::UpdLoc(_) => CtnlPtOpCode::UpdLoc,
            CtnlPtReq::ReqSuppLoc => CtnlPtOpCode::ReqSuppLoc,
        }
    }
}

impl ToBytes for CtnlPtReq {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.op_code().into())?;
        match *self {
            CtnlPtReq::SetCumulVal(value) => writer.write_u32_le(value),
            CtnlPtReq::UpdLoc(loc) => writer.write_u8(loc),
            CtnlPtReq::ReqSuppLoc => Ok(()),
        }
    }
}

/// An SC Control Point response indication: `[0x10, request op code, result, locations...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtnlPtRsp {
    pub req_op: CtnlPtOpCode,
    pub code: CtnlPtRespCode,
    /// Supported sensor locations, only in a successful `ReqSuppLoc` response.
    pub locations: Vec<u8, U16>,
}

impl CtnlPtRsp {
    pub fn new(req_op: CtnlPtOpCode, code: CtnlPtRespCode) -> Self {
        Self {
            req_op,
            code,
            locations: Vec::new(),
        }
    }
}

impl ToBytes for CtnlPtRsp {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(CtnlPtOpCode::Response.into())?;
        writer.write_u8(self.req_op.into())?;
        writer.write_u8(self.code.into())?;
        writer.write_slice(&self.locations)
    }
}

impl FromBytes<'_> for CtnlPtRsp {
    fn from_bytes(bytes: &mut ByteReader<'_>) -> Result<Self, Error> {
        if CtnlPtOpCode::from(bytes.read_u8()?) != CtnlPtOpCode::Response {
            return Err(Error::InvalidValue);
        }
        let req_op = CtnlPtOpCode::from(bytes.read_u8()?);
        let code = CtnlPtRespCode::from(bytes.read_u8()?);
        let locations = Vec::from_slice(bytes.read_rest()).map_err(|()| Error::InvalidLength)?;
        Ok(Self {
            req_op,
            code,
            locations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_layout() {
        let meas = Measurement {
            flags: MeasFlags::all(),
            cumul_wheel_rev: 0x0001_0203,
            last_wheel_evt_time: 0x0405,
            cumul_crank_rev: 0x0607,
            last_crank_evt_time: 0x0809,
        };
        let mut buf = [0; MEAS_MAX_LEN];
        assert_eq!(encode_into(&meas, &mut buf), Ok(MEAS_MAX_LEN));
        assert_eq!(buf, [0x03, 0x03, 0x02, 0x01, 0x00, 0x05, 0x04, 0x07, 0x06, 0x09, 0x08]);
        assert_eq!(decode_exact::<Measurement>(&buf), Ok(meas));

        let crank_only = [0x02, 0x07, 0x06, 0x09];
        assert_eq!(decode_exact::<Measurement>(&crank_only), Err(Error::Eof));
    }

    #[test]
    fn control_point_response() {
        let mut rsp = CtnlPtRsp::new(CtnlPtOpCode::ReqSuppLoc, CtnlPtRespCode::Success);
        rsp.locations.extend_from_slice(&[1, 4]).unwrap();
        let mut buf = [0; CTNL_PT_RSP_MAX_LEN];
        let len = encode_into(&rsp, &mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x10, 0x04, 0x01, 1, 4]);
        assert_eq!(decode_exact::<CtnlPtRsp>(&buf[..len]), Ok(rsp));

        assert_eq!(decode_exact::<CtnlPtRsp>(&[0x01, 0x04, 0x01]), Err(Error::InvalidValue));
    }

    #[test]
    fn control_point_requests() {
        let mut buf = [0; 5];
        let len = encode_into(&CtnlPtReq::SetCumulVal(0x0A0B_0C0D), &mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x01, 0x0D, 0x0C, 0x0B, 0x0A]);
        let len = encode_into(&CtnlPtReq::ReqSuppLoc, &mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x04]);
    }
}
