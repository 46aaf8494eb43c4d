use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};

use crate::util::buf_ext::BufExt;


pub const MAD_SIZE: usize = 256;
pub const MAD_HEADER_SIZE: usize = 24;
pub const MAD_PAYLOAD_SIZE: usize = MAD_SIZE - MAD_HEADER_SIZE;

pub const IB_BASE_VERSION: u8 = 1;
pub const MCLASS_COMM_MGT: u8 = 0x07;
pub const IB_COMM_MGT_CLASS_VERSION: u8 = 2;

pub const MAD_METHOD_GET: u8 = 0x01;
pub const MAD_METHOD_SET: u8 = 0x02;
pub const MAD_METHOD_SEND: u8 = 0x03;
pub const MAD_METHOD_GET_RESP: u8 = 0x81;

pub const ATTR_CLASS_PORT_INFO: u16 = 0x0001;
pub const ATTR_REQ: u16 = 0x0010;
pub const ATTR_MRA: u16 = 0x0011;
pub const ATTR_REJ: u16 = 0x0012;
pub const ATTR_REP: u16 = 0x0013;
pub const ATTR_RTU: u16 = 0x0014;
pub const ATTR_DREQ: u16 = 0x0015;
pub const ATTR_DREP: u16 = 0x0016;
pub const ATTR_SIDR_REQ: u16 = 0x0017;
pub const ATTR_SIDR_RESP: u16 = 0x0018;
pub const ATTR_LAP: u16 = 0x0019;
pub const ATTR_APR: u16 = 0x001A;


/// The common header of every management datagram. The attribute id is not stored here: it is
///  written from, and validated against, the message it wraps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MadHeader {
    pub base_version: u8,
    pub mgmt_class: u8,
    pub class_version: u8,
    pub method: u8,
    pub status: u16,
    pub class_specific: u16,
    pub transaction_id: u64,
    pub attribute_modifier: u32,
}

impl MadHeader {
    pub fn cm(method: u8, transaction_id: u64) -> MadHeader {
        MadHeader {
            base_version: IB_BASE_VERSION,
            mgmt_class: MCLASS_COMM_MGT,
            class_version: IB_COMM_MGT_CLASS_VERSION,
            method,
            status: 0,
            class_specific: 0,
            transaction_id,
            attribute_modifier: 0,
        }
    }

    pub fn ser(&self, attribute_id: u16, buf: &mut BytesMut) {
        buf.put_u8(self.base_version);
        buf.put_u8(self.mgmt_class);
        buf.put_u8(self.class_version);
        buf.put_u8(self.method);
        buf.put_u16(self.status);
        buf.put_u16(self.class_specific);
        buf.put_u64(self.transaction_id);
        buf.put_u16(attribute_id);
        buf.put_u16(0);
        buf.put_u32(self.attribute_modifier);
    }

    /// returns the header and the raw attribute id
    pub fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<(MadHeader, u16)> {
        let base_version = buf.try_get_byte()?;
        let mgmt_class = buf.try_get_byte()?;
        let class_version = buf.try_get_byte()?;
        let method = buf.try_get_byte()?;
        let status = buf.try_get_u16_be()?;
        let class_specific = buf.try_get_u16_be()?;
        let transaction_id = buf.try_get_u64_be()?;
        let attribute_id = buf.try_get_u16_be()?;
        let _reserved = buf.try_get_u16_be()?;
        let attribute_modifier = buf.try_get_u32_be()?;

        Ok((MadHeader {
            base_version,
            mgmt_class,
            class_version,
            method,
            status,
            class_specific,
            transaction_id,
            attribute_modifier,
        }, attribute_id))
    }

    pub fn validate_cm_class(&self) -> anyhow::Result<()> {
        if self.base_version != IB_BASE_VERSION || self.mgmt_class != MCLASS_COMM_MGT || self.class_version != IB_COMM_MGT_CLASS_VERSION {
            bail!("invalid base version, management class or class version: bv {}, mc {}, cv {}", self.base_version, self.mgmt_class, self.class_version);
        }
        Ok(())
    }
}


/// 128 bit global identifier of a port. The all-zero GID is used as "unset".
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Gid(pub [u8; 16]);
impl Gid {
    pub const ZERO: Gid = Gid([0; 16]);

    pub fn new(subnet_prefix: u64, interface_id: u64) -> Gid {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&subnet_prefix.to_be_bytes());
        raw[8..].copy_from_slice(&interface_id.to_be_bytes());
        Gid(raw)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn interface_id(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(raw)
    }
}
impl Debug for Gid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, chunk) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", chunk[0], chunk[1])?;
        }
        Ok(())
    }
}


/// Fixed-size opaque byte region of a message (private data, additional info). Shorter input is
///  zero-padded; the full region is always transmitted.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct FixedData<const N: usize>(pub [u8; N]);

impl <const N: usize> FixedData<N> {
    pub const LEN: usize = N;

    pub fn from_slice(data: &[u8]) -> anyhow::Result<FixedData<N>> {
        if data.len() > N {
            return Err(anyhow!("{} bytes exceed the available {} bytes", data.len(), N));
        }
        let mut raw = [0u8; N];
        raw[..data.len()].copy_from_slice(data);
        Ok(FixedData(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.0);
    }

    pub fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<FixedData<N>> {
        Ok(FixedData(buf.try_get_array::<N>()?))
    }
}
impl <const N: usize> Default for FixedData<N> {
    fn default() -> Self {
        FixedData([0; N])
    }
}
impl <const N: usize> Debug for FixedData<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let used = self.0.iter().rposition(|b| *b != 0).map(|p| p + 1).unwrap_or(0);
        write!(f, "[{} bytes, {} used]", N, used)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_header_layout() {
        let header = MadHeader::cm(MAD_METHOD_SEND, 0x0102030405060708);
        let mut buf = BytesMut::new();
        header.ser(ATTR_REP, &mut buf);

        assert_eq!(buf.len(), MAD_HEADER_SIZE);
        assert_eq!(&buf[..4], &[1, 7, 2, 3]);
        assert_eq!(&buf[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[16..18], &[0, 0x13]);

        let mut b: &[u8] = &buf;
        let (deser, attribute_id) = MadHeader::deser(&mut b).unwrap();
        assert_eq!(deser, header);
        assert_eq!(attribute_id, ATTR_REP);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::valid(1, 7, 2, true)]
    #[case::base_version(2, 7, 2, false)]
    #[case::mgmt_class(1, 3, 2, false)]
    #[case::class_version(1, 7, 1, false)]
    fn test_validate_cm_class(#[case] bv: u8, #[case] mc: u8, #[case] cv: u8, #[case] valid: bool) {
        let mut header = MadHeader::cm(MAD_METHOD_SEND, 1);
        header.base_version = bv;
        header.mgmt_class = mc;
        header.class_version = cv;
        assert_eq!(header.validate_cm_class().is_ok(), valid);
    }

    #[test]
    fn test_gid() {
        let gid = Gid::new(0xfe80_0000_0000_0000, 0x0002_c903_0000_1234);
        assert!(!gid.is_zero());
        assert!(Gid::ZERO.is_zero());
        assert_eq!(gid.interface_id(), 0x0002_c903_0000_1234);
        assert_eq!(format!("{:?}", gid), "fe80:0000:0000:0000:0002:c903:0000:1234");
    }

    #[test]
    fn test_fixed_data() {
        let data = FixedData::<8>::from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(data.as_bytes(), &[1, 2, 3, 0, 0, 0, 0, 0]);
        assert!(FixedData::<2>::from_slice(&[1, 2, 3]).is_err());
        assert_eq!(format!("{:?}", data), "[8 bytes, 3 used]");
    }
}
