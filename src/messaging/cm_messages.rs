use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::messaging::codes::{AprStatus, CepType, FailoverReply, MraedMessage, RejectReason, RejectedMessage, SidrStatus};
use crate::messaging::mad::*;
use crate::util::buf_ext::BufExt;


pub const REQ_PRIVATE_DATA_LEN: usize = 92;
pub const REP_PRIVATE_DATA_LEN: usize = 196;
pub const REJ_PRIVATE_DATA_LEN: usize = 148;
pub const RTU_PRIVATE_DATA_LEN: usize = 224;
pub const MRA_PRIVATE_DATA_LEN: usize = 222;
pub const DREQ_PRIVATE_DATA_LEN: usize = 220;
pub const DREP_PRIVATE_DATA_LEN: usize = 224;
pub const SIDR_REQ_PRIVATE_DATA_LEN: usize = 216;
pub const SIDR_RESP_PRIVATE_DATA_LEN: usize = 136;
pub const LAP_PRIVATE_DATA_LEN: usize = 168;
pub const APR_PRIVATE_DATA_LEN: usize = 148;
pub const ADD_INFO_LEN: usize = 72;

/// response time value advertised in ClassPortInfo: 4.096us * 2^8
pub const PORT_RESP_TIME_VALUE: u8 = 8;

const U24: u32 = 0x00ff_ffff;


/// path description as carried in REQ (primary / alternate) and LAP (alternate). 'local' and
///  'remote' are from the perspective of the message's sender.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WirePath {
    pub local_lid: u16,
    pub remote_lid: u16,
    pub local_gid: Gid,
    pub remote_gid: Gid,
    pub flow_label: u32,
    pub packet_rate: u8,
    pub traffic_class: u8,
    pub hop_limit: u8,
    pub sl: u8,
    pub subnet_local: bool,
    pub local_ack_timeout: u8,
}

impl WirePath {
    fn ser_req(&self, buf: &mut BytesMut) {
        self.ser_addresses(buf);
        buf.put_u32(((self.flow_label & 0xf_ffff) << 12) | (self.packet_rate & 0x3f) as u32);
        buf.put_u8(self.traffic_class);
        buf.put_u8(self.hop_limit);
        self.ser_sl_and_ack_timeout(buf);
    }

    fn deser_req(buf: &mut impl bytes::Buf) -> anyhow::Result<WirePath> {
        let (local_lid, remote_lid, local_gid, remote_gid) = Self::deser_addresses(buf)?;
        let u = buf.try_get_u32_be()?;
        let traffic_class = buf.try_get_byte()?;
        let hop_limit = buf.try_get_byte()?;
        let (sl, subnet_local, local_ack_timeout) = Self::deser_sl_and_ack_timeout(buf)?;
        Ok(WirePath {
            local_lid,
            remote_lid,
            local_gid,
            remote_gid,
            flow_label: u >> 12,
            packet_rate: (u & 0x3f) as u8,
            traffic_class,
            hop_limit,
            sl,
            subnet_local,
            local_ack_timeout,
        })
    }

    fn ser_lap(&self, buf: &mut BytesMut) {
        self.ser_addresses(buf);
        buf.put_u32(((self.flow_label & 0xf_ffff) << 12) | self.traffic_class as u32);
        buf.put_u8(self.hop_limit);
        buf.put_u8(self.packet_rate & 0x3f);
        self.ser_sl_and_ack_timeout(buf);
    }

    fn deser_lap(buf: &mut impl bytes::Buf) -> anyhow::Result<WirePath> {
        let (local_lid, remote_lid, local_gid, remote_gid) = Self::deser_addresses(buf)?;
        let u = buf.try_get_u32_be()?;
        let hop_limit = buf.try_get_byte()?;
        let packet_rate = buf.try_get_byte()? & 0x3f;
        let (sl, subnet_local, local_ack_timeout) = Self::deser_sl_and_ack_timeout(buf)?;
        Ok(WirePath {
            local_lid,
            remote_lid,
            local_gid,
            remote_gid,
            flow_label: u >> 12,
            packet_rate,
            traffic_class: (u & 0xff) as u8,
            hop_limit,
            sl,
            subnet_local,
            local_ack_timeout,
        })
    }

    fn ser_addresses(&self, buf: &mut BytesMut) {
        buf.put_u16(self.local_lid);
        buf.put_u16(self.remote_lid);
        buf.put_slice(&self.local_gid.0);
        buf.put_slice(&self.remote_gid.0);
    }

    fn deser_addresses(buf: &mut impl bytes::Buf) -> anyhow::Result<(u16, u16, Gid, Gid)> {
        let local_lid = buf.try_get_u16_be()?;
        let remote_lid = buf.try_get_u16_be()?;
        let local_gid = Gid(buf.try_get_array::<16>()?);
        let remote_gid = Gid(buf.try_get_array::<16>()?);
        Ok((local_lid, remote_lid, local_gid, remote_gid))
    }

    fn ser_sl_and_ack_timeout(&self, buf: &mut BytesMut) {
        buf.put_u8(((self.sl & 0xf) << 4) | (if self.subnet_local { 0x08 } else { 0 }));
        buf.put_u8((self.local_ack_timeout & 0x1f) << 3);
    }

    fn deser_sl_and_ack_timeout(buf: &mut impl bytes::Buf) -> anyhow::Result<(u8, bool, u8)> {
        let b = buf.try_get_byte()?;
        let ack = buf.try_get_byte()?;
        Ok((b >> 4, b & 0x08 != 0, ack >> 3))
    }
}


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClassPortInfo {
    pub base_version: u8,
    pub class_version: u8,
    pub cap_mask: u16,
    pub resp_time_value: u8,
}
impl ClassPortInfo {
    /// we do not implement GSI redirection nor traps for the CM class
    pub fn cm_default() -> ClassPortInfo {
        ClassPortInfo {
            base_version: IB_BASE_VERSION,
            class_version: IB_COMM_MGT_CLASS_VERSION,
            cap_mask: 0,
            resp_time_value: PORT_RESP_TIME_VALUE,
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.base_version);
        buf.put_u8(self.class_version);
        buf.put_u16(self.cap_mask);
        buf.put_u32((self.resp_time_value & 0x1f) as u32);
        buf.put_bytes(0, MAD_PAYLOAD_SIZE - 8);
    }

    fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<ClassPortInfo> {
        let base_version = buf.try_get_byte()?;
        let class_version = buf.try_get_byte()?;
        let cap_mask = buf.try_get_u16_be()?;
        let resp_time_value = (buf.try_get_u32_be()? & 0x1f) as u8;
        buf.try_skip(MAD_PAYLOAD_SIZE - 8)?;
        Ok(ClassPortInfo {
            base_version,
            class_version,
            cap_mask,
            resp_time_value,
        })
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReqMessage {
    pub local_comm_id: u32,
    pub service_id: u64,
    pub local_ca_guid: u64,
    pub local_qkey: u32,
    pub local_qpn: u32,
    pub offered_responder_resources: u8,
    pub local_eecn: u32,
    pub offered_initiator_depth: u8,
    pub remote_eecn: u32,
    pub remote_cm_timeout: u8,
    pub transport_service_type: CepType,
    pub end_to_end_flow_control: bool,
    pub starting_psn: u32,
    pub local_cm_timeout: u8,
    pub retry_count: u8,
    pub partition_key: u16,
    pub path_mtu: u8,
    pub rdc_exists: bool,
    pub rnr_retry_count: u8,
    pub max_cm_retries: u8,
    pub primary: WirePath,
    /// absent when the alternate local LID is zero on the wire
    pub alternate: Option<WirePath>,
    pub private_data: FixedData<REQ_PRIVATE_DATA_LEN>,
}
impl ReqMessage {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.local_comm_id);
        buf.put_u32(0);
        buf.put_u64(self.service_id);
        buf.put_u64(self.local_ca_guid);
        buf.put_u32(0);
        buf.put_u32(self.local_qkey);
        buf.put_u32(((self.local_qpn & U24) << 8) | self.offered_responder_resources as u32);
        buf.put_u32(((self.local_eecn & U24) << 8) | self.offered_initiator_depth as u32);
        buf.put_u32(((self.remote_eecn & U24) << 8)
            | (((self.remote_cm_timeout & 0x1f) as u32) << 3)
            | ((u8::from(self.transport_service_type) as u32) << 1)
            | self.end_to_end_flow_control as u32);
        buf.put_u32(((self.starting_psn & U24) << 8)
            | (((self.local_cm_timeout & 0x1f) as u32) << 3)
            | (self.retry_count & 0x7) as u32);
        buf.put_u16(self.partition_key);
        buf.put_u8(((self.path_mtu & 0xf) << 4) | (if self.rdc_exists { 0x08 } else { 0 }) | (self.rnr_retry_count & 0x7));
        buf.put_u8((self.max_cm_retries & 0xf) << 4);
        self.primary.ser_req(buf);
        self.alternate.unwrap_or_default().ser_req(buf);
        self.private_data.ser(buf);
    }

    fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<ReqMessage> {
        let local_comm_id = buf.try_get_u32_be()?;
        buf.try_skip(4)?;
        let service_id = buf.try_get_u64_be()?;
        let local_ca_guid = buf.try_get_u64_be()?;
        buf.try_skip(4)?;
        let local_qkey = buf.try_get_u32_be()?;
        let u1 = buf.try_get_u32_be()?;
        let u2 = buf.try_get_u32_be()?;
        let u3 = buf.try_get_u32_be()?;
        let u4 = buf.try_get_u32_be()?;
        let partition_key = buf.try_get_u16_be()?;
        let b1 = buf.try_get_byte()?;
        let b2 = buf.try_get_byte()?;
        let primary = WirePath::deser_req(buf)?;
        let alternate = WirePath::deser_req(buf)?;
        let private_data = FixedData::deser(buf)?;

        let transport_service_type = CepType::try_from(((u3 >> 1) & 0x3) as u8)
            .map_err(|e| anyhow!("invalid transport service type: {}", e))?;

        Ok(ReqMessage {
            local_comm_id,
            service_id,
            local_ca_guid,
            local_qkey,
            local_qpn: u1 >> 8,
            offered_responder_resources: (u1 & 0xff) as u8,
            local_eecn: u2 >> 8,
            offered_initiator_depth: (u2 & 0xff) as u8,
            remote_eecn: u3 >> 8,
            remote_cm_timeout: ((u3 >> 3) & 0x1f) as u8,
            transport_service_type,
            end_to_end_flow_control: u3 & 1 != 0,
            starting_psn: u4 >> 8,
            local_cm_timeout: ((u4 >> 3) & 0x1f) as u8,
            retry_count: (u4 & 0x7) as u8,
            partition_key,
            path_mtu: b1 >> 4,
            rdc_exists: b1 & 0x08 != 0,
            rnr_retry_count: b1 & 0x7,
            max_cm_retries: b2 >> 4,
            primary,
            alternate: if alternate.local_lid != 0 { Some(alternate) } else { None },
            private_data,
        })
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RepMessage {
    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub local_qkey: u32,
    pub local_qpn: u32,
    pub local_eecn: u32,
    pub starting_psn: u32,
    pub arb_responder_resources: u8,
    pub arb_initiator_depth: u8,
    pub target_ack_delay: u8,
    pub failover_accepted: FailoverReply,
    pub end_to_end_flow_control: bool,
    pub rnr_retry_count: u8,
    pub local_ca_guid: u64,
    pub private_data: FixedData<REP_PRIVATE_DATA_LEN>,
}
impl RepMessage {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.local_comm_id);
        buf.put_u32(self.remote_comm_id);
        buf.put_u32(self.local_qkey);
        buf.put_u32((self.local_qpn & U24) << 8);
        buf.put_u32((self.local_eecn & U24) << 8);
        buf.put_u32((self.starting_psn & U24) << 8);
        buf.put_u8(self.arb_responder_resources);
        buf.put_u8(self.arb_initiator_depth);
        buf.put_u8(((self.target_ack_delay & 0x1f) << 3)
            | ((u8::from(self.failover_accepted) & 0x3) << 1)
            | self.end_to_end_flow_control as u8);
        buf.put_u8((self.rnr_retry_count & 0x7) << 5);
        buf.put_u64(self.local_ca_guid);
        self.private_data.ser(buf);
    }

    fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<RepMessage> {
        let local_comm_id = buf.try_get_u32_be()?;
        let remote_comm_id = buf.try_get_u32_be()?;
        let local_qkey = buf.try_get_u32_be()?;
        let local_qpn = buf.try_get_u32_be()? >> 8;
        let local_eecn = buf.try_get_u32_be()? >> 8;
        let starting_psn = buf.try_get_u32_be()? >> 8;
        let arb_responder_resources = buf.try_get_byte()?;
        let arb_initiator_depth = buf.try_get_byte()?;
        let b = buf.try_get_byte()?;
        let rnr = buf.try_get_byte()?;
        let local_ca_guid = buf.try_get_u64_be()?;
        let private_data = FixedData::deser(buf)?;
        Ok(RepMessage {
            local_comm_id,
            remote_comm_id,
            local_qkey,
            local_qpn,
            local_eecn,
            starting_psn,
            arb_responder_resources,
            arb_initiator_depth,
            target_ack_delay: b >> 3,
            failover_accepted: FailoverReply::from((b >> 1) & 0x3),
            end_to_end_flow_control: b & 1 != 0,
            rnr_retry_count: rnr >> 5,
            local_ca_guid,
            private_data,
        })
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejMessage {
    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub msg_rejected: RejectedMessage,
    pub reject_info_len: u8,
    pub reason: RejectReason,
    pub reject_info: FixedData<ADD_INFO_LEN>,
    pub private_data: FixedData<REJ_PRIVATE_DATA_LEN>,
}
impl RejMessage {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.local_comm_id);
        buf.put_u32(self.remote_comm_id);
        buf.put_u8(u8::from(self.msg_rejected) << 6);
        buf.put_u8((self.reject_info_len & 0x7f) << 1);
        buf.put_u16(self.reason.into());
        self.reject_info.ser(buf);
        self.private_data.ser(buf);
    }

    fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<RejMessage> {
        let local_comm_id = buf.try_get_u32_be()?;
        let remote_comm_id = buf.try_get_u32_be()?;
        let msg_rejected = RejectedMessage::try_from(buf.try_get_byte()? >> 6)
            .map_err(|e| anyhow!("invalid rejected message type: {}", e))?;
        let reject_info_len = buf.try_get_byte()? >> 1;
        let reason = RejectReason::from(buf.try_get_u16_be()?);
        let reject_info = FixedData::deser(buf)?;
        let private_data = FixedData::deser(buf)?;
        Ok(RejMessage {
            local_comm_id,
            remote_comm_id,
            msg_rejected,
            reject_info_len,
            reason,
            reject_info,
            private_data,
        })
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RtuMessage {
    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub private_data: FixedData<RTU_PRIVATE_DATA_LEN>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MraMessage {
    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub msg_mraed: MraedMessage,
    pub service_timeout: u8,
    pub private_data: FixedData<MRA_PRIVATE_DATA_LEN>,
}
impl MraMessage {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.local_comm_id);
        buf.put_u32(self.remote_comm_id);
        buf.put_u8(u8::from(self.msg_mraed) << 6);
        buf.put_u8((self.service_timeout & 0x1f) << 3);
        self.private_data.ser(buf);
    }

    fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<MraMessage> {
        let local_comm_id = buf.try_get_u32_be()?;
        let remote_comm_id = buf.try_get_u32_be()?;
        let msg_mraed = MraedMessage::try_from(buf.try_get_byte()? >> 6)
            .map_err(|e| anyhow!("invalid MRA message type: {}", e))?;
        let service_timeout = buf.try_get_byte()? >> 3;
        let private_data = FixedData::deser(buf)?;
        Ok(MraMessage {
            local_comm_id,
            remote_comm_id,
            msg_mraed,
            service_timeout,
            private_data,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DreqMessage {
    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub remote_qpn_or_eecn: u32,
    pub private_data: FixedData<DREQ_PRIVATE_DATA_LEN>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DrepMessage {
    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub private_data: FixedData<DREP_PRIVATE_DATA_LEN>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SidrReqMessage {
    pub request_id: u32,
    pub partition_key: u16,
    pub service_id: u64,
    pub private_data: FixedData<SIDR_REQ_PRIVATE_DATA_LEN>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SidrRespMessage {
    pub request_id: u32,
    pub status: SidrStatus,
    pub add_info_len: u8,
    pub qpn: u32,
    pub service_id: u64,
    pub qkey: u32,
    pub add_info: FixedData<ADD_INFO_LEN>,
    pub private_data: FixedData<SIDR_RESP_PRIVATE_DATA_LEN>,
}
impl SidrRespMessage {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.request_id);
        buf.put_u8(self.status.into());
        buf.put_u8(self.add_info_len);
        buf.put_u16(0);
        buf.put_u32((self.qpn & U24) << 8);
        buf.put_u64(self.service_id);
        buf.put_u32(self.qkey);
        self.add_info.ser(buf);
        self.private_data.ser(buf);
    }

    fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<SidrRespMessage> {
        let request_id = buf.try_get_u32_be()?;
        let status = SidrStatus::from(buf.try_get_byte()?);
        let add_info_len = buf.try_get_byte()?;
        buf.try_skip(2)?;
        let qpn = buf.try_get_u32_be()? >> 8;
        let service_id = buf.try_get_u64_be()?;
        let qkey = buf.try_get_u32_be()?;
        let add_info = FixedData::deser(buf)?;
        let private_data = FixedData::deser(buf)?;
        Ok(SidrRespMessage {
            request_id,
            status,
            add_info_len,
            qpn,
            service_id,
            qkey,
            add_info,
            private_data,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LapMessage {
    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub remote_qpn_or_eecn: u32,
    pub remote_cm_timeout: u8,
    pub alternate: WirePath,
    pub private_data: FixedData<LAP_PRIVATE_DATA_LEN>,
}
impl LapMessage {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.local_comm_id);
        buf.put_u32(self.remote_comm_id);
        buf.put_u32(0);
        buf.put_u32(((self.remote_qpn_or_eecn & U24) << 8) | (((self.remote_cm_timeout & 0x1f) as u32) << 3));
        buf.put_u32(0);
        self.alternate.ser_lap(buf);
        self.private_data.ser(buf);
    }

    fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<LapMessage> {
        let local_comm_id = buf.try_get_u32_be()?;
        let remote_comm_id = buf.try_get_u32_be()?;
        buf.try_skip(4)?;
        let u = buf.try_get_u32_be()?;
        buf.try_skip(4)?;
        let alternate = WirePath::deser_lap(buf)?;
        let private_data = FixedData::deser(buf)?;
        Ok(LapMessage {
            local_comm_id,
            remote_comm_id,
            remote_qpn_or_eecn: u >> 8,
            remote_cm_timeout: ((u >> 3) & 0x1f) as u8,
            alternate,
            private_data,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AprMessage {
    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub add_info_len: u8,
    pub status: AprStatus,
    pub add_info: FixedData<ADD_INFO_LEN>,
    pub private_data: FixedData<APR_PRIVATE_DATA_LEN>,
}
impl AprMessage {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.local_comm_id);
        buf.put_u32(self.remote_comm_id);
        buf.put_u8(self.add_info_len);
        buf.put_u8(self.status.into());
        buf.put_u16(0);
        self.add_info.ser(buf);
        self.private_data.ser(buf);
    }

    fn deser(buf: &mut impl bytes::Buf) -> anyhow::Result<AprMessage> {
        let local_comm_id = buf.try_get_u32_be()?;
        let remote_comm_id = buf.try_get_u32_be()?;
        let add_info_len = buf.try_get_byte()?;
        let status = AprStatus::from(buf.try_get_byte()?);
        buf.try_skip(2)?;
        let add_info = FixedData::deser(buf)?;
        let private_data = FixedData::deser(buf)?;
        Ok(AprMessage {
            local_comm_id,
            remote_comm_id,
            add_info_len,
            status,
            add_info,
            private_data,
        })
    }
}


/// The payload of a CM management datagram, one variant per attribute
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CmMessage {
    ClassPortInfo(ClassPortInfo),
    Req(ReqMessage),
    Mra(MraMessage),
    Rej(RejMessage),
    Rep(RepMessage),
    Rtu(RtuMessage),
    Dreq(DreqMessage),
    Drep(DrepMessage),
    SidrReq(SidrReqMessage),
    SidrResp(SidrRespMessage),
    Lap(LapMessage),
    Apr(AprMessage),
}
impl CmMessage {
    pub fn attribute_id(&self) -> u16 {
        match self {
            CmMessage::ClassPortInfo(_) => ATTR_CLASS_PORT_INFO,
            CmMessage::Req(_) => ATTR_REQ,
            CmMessage::Mra(_) => ATTR_MRA,
            CmMessage::Rej(_) => ATTR_REJ,
            CmMessage::Rep(_) => ATTR_REP,
            CmMessage::Rtu(_) => ATTR_RTU,
            CmMessage::Dreq(_) => ATTR_DREQ,
            CmMessage::Drep(_) => ATTR_DREP,
            CmMessage::SidrReq(_) => ATTR_SIDR_REQ,
            CmMessage::SidrResp(_) => ATTR_SIDR_RESP,
            CmMessage::Lap(_) => ATTR_LAP,
            CmMessage::Apr(_) => ATTR_APR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CmMessage::ClassPortInfo(_) => "ClassPortInfo",
            CmMessage::Req(_) => "REQ",
            CmMessage::Mra(_) => "MRA",
            CmMessage::Rej(_) => "REJ",
            CmMessage::Rep(_) => "REP",
            CmMessage::Rtu(_) => "RTU",
            CmMessage::Dreq(_) => "DREQ",
            CmMessage::Drep(_) => "DREP",
            CmMessage::SidrReq(_) => "SIDR_REQ",
            CmMessage::SidrResp(_) => "SIDR_RESP",
            CmMessage::Lap(_) => "LAP",
            CmMessage::Apr(_) => "APR",
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        match self {
            CmMessage::ClassPortInfo(m) => m.ser(buf),
            CmMessage::Req(m) => m.ser(buf),
            CmMessage::Mra(m) => m.ser(buf),
            CmMessage::Rej(m) => m.ser(buf),
            CmMessage::Rep(m) => m.ser(buf),
            CmMessage::Rtu(m) => {
                buf.put_u32(m.local_comm_id);
                buf.put_u32(m.remote_comm_id);
                m.private_data.ser(buf);
            }
            CmMessage::Dreq(m) => {
                buf.put_u32(m.local_comm_id);
                buf.put_u32(m.remote_comm_id);
                buf.put_u32((m.remote_qpn_or_eecn & U24) << 8);
                m.private_data.ser(buf);
            }
            CmMessage::Drep(m) => {
                buf.put_u32(m.local_comm_id);
                buf.put_u32(m.remote_comm_id);
                m.private_data.ser(buf);
            }
            CmMessage::SidrReq(m) => {
                buf.put_u32(m.request_id);
                buf.put_u16(m.partition_key);
                buf.put_u16(0);
                buf.put_u64(m.service_id);
                m.private_data.ser(buf);
            }
            CmMessage::SidrResp(m) => m.ser(buf),
            CmMessage::Lap(m) => m.ser(buf),
            CmMessage::Apr(m) => m.ser(buf),
        }
    }

    fn deser(attribute_id: u16, buf: &mut impl bytes::Buf) -> anyhow::Result<CmMessage> {
        let msg = match attribute_id {
            ATTR_CLASS_PORT_INFO => CmMessage::ClassPortInfo(ClassPortInfo::deser(buf)?),
            ATTR_REQ => CmMessage::Req(ReqMessage::deser(buf)?),
            ATTR_MRA => CmMessage::Mra(MraMessage::deser(buf)?),
            ATTR_REJ => CmMessage::Rej(RejMessage::deser(buf)?),
            ATTR_REP => CmMessage::Rep(RepMessage::deser(buf)?),
            ATTR_RTU => CmMessage::Rtu(RtuMessage {
                local_comm_id: buf.try_get_u32_be()?,
                remote_comm_id: buf.try_get_u32_be()?,
                private_data: FixedData::deser(buf)?,
            }),
            ATTR_DREQ => CmMessage::Dreq(DreqMessage {
                local_comm_id: buf.try_get_u32_be()?,
                remote_comm_id: buf.try_get_u32_be()?,
                remote_qpn_or_eecn: buf.try_get_u32_be()? >> 8,
                private_data: FixedData::deser(buf)?,
            }),
            ATTR_DREP => CmMessage::Drep(DrepMessage {
                local_comm_id: buf.try_get_u32_be()?,
                remote_comm_id: buf.try_get_u32_be()?,
                private_data: FixedData::deser(buf)?,
            }),
            ATTR_SIDR_REQ => {
                let request_id = buf.try_get_u32_be()?;
                let partition_key = buf.try_get_u16_be()?;
                buf.try_skip(2)?;
                CmMessage::SidrReq(SidrReqMessage {
                    request_id,
                    partition_key,
                    service_id: buf.try_get_u64_be()?,
                    private_data: FixedData::deser(buf)?,
                })
            }
            ATTR_SIDR_RESP => CmMessage::SidrResp(SidrRespMessage::deser(buf)?),
            ATTR_LAP => CmMessage::Lap(LapMessage::deser(buf)?),
            ATTR_APR => CmMessage::Apr(AprMessage::deser(buf)?),
            id => return Err(anyhow!("invalid attribute id 0x{:x}", id)),
        };
        Ok(msg)
    }
}


/// A complete CM management datagram
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CmMad {
    pub header: MadHeader,
    pub message: CmMessage,
}
impl CmMad {
    /// a CM protocol message, sent with the 'Send' method
    pub fn send(transaction_id: u64, message: CmMessage) -> CmMad {
        CmMad {
            header: MadHeader::cm(MAD_METHOD_SEND, transaction_id),
            message,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        self.header.ser(self.message.attribute_id(), buf);
        self.message.ser(buf);
        debug_assert_eq!(buf.len() - start, MAD_SIZE);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MAD_SIZE);
        self.ser(&mut buf);
        buf
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<CmMad> {
        if buf.len() != MAD_SIZE {
            bail!("MAD must be {} bytes, was {}", MAD_SIZE, buf.len());
        }
        let (header, attribute_id) = MadHeader::deser(&mut buf)?;
        header.validate_cm_class()?;
        let message = CmMessage::deser(attribute_id, &mut buf)?;
        trace!("decoded {} with transaction id 0x{:x}", message.name(), header.transaction_id);
        Ok(CmMad {
            header,
            message,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn path(seed: u16) -> WirePath {
        WirePath {
            local_lid: seed,
            remote_lid: seed + 1,
            local_gid: Gid::new(0xfe80_0000_0000_0000, seed as u64),
            remote_gid: Gid::new(0xfe80_0000_0000_0000, seed as u64 + 1),
            flow_label: 0xabcde,
            packet_rate: 0x23,
            traffic_class: 0x5a,
            hop_limit: 0x40,
            sl: 0xb,
            subnet_local: true,
            local_ack_timeout: 19,
        }
    }

    fn req() -> ReqMessage {
        ReqMessage {
            local_comm_id: 0x11223344,
            service_id: 0x1000_0000_0000_0042,
            local_ca_guid: 0x0002_c903_0000_0001,
            local_qkey: 0x8001_0000,
            local_qpn: 0x123456,
            offered_responder_resources: 4,
            local_eecn: 0,
            offered_initiator_depth: 8,
            remote_eecn: 0,
            remote_cm_timeout: 17,
            transport_service_type: CepType::ReliableConnection,
            end_to_end_flow_control: true,
            starting_psn: 0xabcdef,
            local_cm_timeout: 18,
            retry_count: 7,
            partition_key: 0xffff,
            path_mtu: 4,
            rdc_exists: false,
            rnr_retry_count: 6,
            max_cm_retries: 8,
            primary: path(1),
            alternate: Some(path(10)),
            private_data: FixedData::from_slice(&[9; REQ_PRIVATE_DATA_LEN]).unwrap(),
        }
    }

    fn all_messages() -> Vec<CmMessage> {
        vec![
            CmMessage::ClassPortInfo(ClassPortInfo::cm_default()),
            CmMessage::Req(req()),
            CmMessage::Req(ReqMessage { alternate: None, ..req() }),
            CmMessage::Mra(MraMessage { local_comm_id: 1, remote_comm_id: 2, msg_mraed: MraedMessage::Lap, service_timeout: 21, private_data: FixedData::from_slice(b"mra").unwrap() }),
            CmMessage::Rej(RejMessage { local_comm_id: 1, remote_comm_id: 2, msg_rejected: RejectedMessage::Reply, reject_info_len: 72, reason: RejectReason::StaleConn, reject_info: FixedData::from_slice(&[3; 72]).unwrap(), private_data: FixedData::default() }),
            CmMessage::Rej(RejMessage { local_comm_id: 1, remote_comm_id: 2, msg_rejected: RejectedMessage::Other, reject_info_len: 0, reason: RejectReason::Other(300), reject_info: FixedData::default(), private_data: FixedData::default() }),
            CmMessage::Rep(RepMessage { local_comm_id: 3, remote_comm_id: 4, local_qkey: 5, local_qpn: 0xfffffe, local_eecn: 7, starting_psn: 0x10, arb_responder_resources: 2, arb_initiator_depth: 3, target_ack_delay: 15, failover_accepted: FailoverReply::RejectedAlt, end_to_end_flow_control: true, rnr_retry_count: 7, local_ca_guid: 0x99, private_data: FixedData::from_slice(b"rep").unwrap() }),
            CmMessage::Rtu(RtuMessage { local_comm_id: 1, remote_comm_id: 2, private_data: FixedData::from_slice(b"rtu").unwrap() }),
            CmMessage::Dreq(DreqMessage { local_comm_id: 1, remote_comm_id: 2, remote_qpn_or_eecn: 0x654321, private_data: FixedData::default() }),
            CmMessage::Drep(DrepMessage { local_comm_id: 1, remote_comm_id: 2, private_data: FixedData::default() }),
            CmMessage::SidrReq(SidrReqMessage { request_id: 8, partition_key: 0x8001, service_id: 0x77, private_data: FixedData::from_slice(b"sidr").unwrap() }),
            CmMessage::SidrResp(SidrRespMessage { request_id: 8, status: SidrStatus::Redirect, add_info_len: 72, qpn: 0x42, service_id: 0x77, qkey: 0x11111111, add_info: FixedData::from_slice(&[1; 72]).unwrap(), private_data: FixedData::default() }),
            CmMessage::Lap(LapMessage { local_comm_id: 1, remote_comm_id: 2, remote_qpn_or_eecn: 0x42, remote_cm_timeout: 20, alternate: path(30), private_data: FixedData::default() }),
            CmMessage::Apr(AprMessage { local_comm_id: 1, remote_comm_id: 2, add_info_len: 0, status: AprStatus::DuplicatePath, add_info: FixedData::default(), private_data: FixedData::from_slice(b"apr").unwrap() }),
        ]
    }

    #[test]
    fn test_ser_deser_all_messages() {
        for message in all_messages() {
            let mad = CmMad::send(0x1234_5678_0000_0001, message);
            let buf = mad.to_bytes();
            assert_eq!(buf.len(), MAD_SIZE, "{}", mad.message.name());
            let deser = CmMad::deser(&buf).unwrap();
            assert_eq!(deser, mad);
        }
    }

    #[test]
    fn test_req_field_packing() {
        let buf = CmMad::send(1, CmMessage::Req(req())).to_bytes();
        let payload = &buf[MAD_HEADER_SIZE..];
        // LocalQPN:24 | OfferedResponderResources:8
        assert_eq!(&payload[32..36], &[0x12, 0x34, 0x56, 4]);
        // RemoteEECN:24 | RemoteCMTimeout:5 | TransportServiceType:2 | EndToEndFlowControl:1
        assert_eq!(payload[43], (17 << 3) | 1);
        // PathMTU:4 | RdcExists:1 | RnRRetryCount:3
        assert_eq!(payload[50], (4 << 4) | 6);
        assert_eq!(payload[51], 8 << 4);
        // primary local LID
        assert_eq!(&payload[52..54], &[0, 1]);
        assert_eq!(&payload[232 - REQ_PRIVATE_DATA_LEN..], &[9; REQ_PRIVATE_DATA_LEN]);
    }

    #[rstest]
    #[case::rtu(ATTR_RTU, 0)]
    #[case::unknown_attribute(0x0042, 1)]
    fn test_deser_rejects_unknown_attribute(#[case] attr: u16, #[case] expect_error: u8) {
        let mut buf = CmMad::send(1, CmMessage::Rtu(RtuMessage { local_comm_id: 1, remote_comm_id: 2, private_data: FixedData::default() })).to_bytes();
        buf[16..18].copy_from_slice(&attr.to_be_bytes());
        assert_eq!(CmMad::deser(&buf).is_err(), expect_error == 1);
    }

    #[test]
    fn test_deser_rejects_wrong_length() {
        let buf = CmMad::send(1, CmMessage::Drep(DrepMessage { local_comm_id: 1, remote_comm_id: 2, private_data: FixedData::default() })).to_bytes();
        assert!(CmMad::deser(&buf[..MAD_SIZE - 1]).is_err());
    }

    #[test]
    fn test_deser_rejects_wrong_class() {
        let mut buf = CmMad::send(1, CmMessage::Drep(DrepMessage { local_comm_id: 1, remote_comm_id: 2, private_data: FixedData::default() })).to_bytes();
        buf[1] = 0x03;
        assert!(CmMad::deser(&buf).is_err());
    }

    #[test]
    fn test_deser_rejects_invalid_mra_type() {
        let mut buf = CmMad::send(1, CmMessage::Mra(MraMessage { local_comm_id: 1, remote_comm_id: 2, msg_mraed: MraedMessage::Request, service_timeout: 3, private_data: FixedData::default() })).to_bytes();
        buf[MAD_HEADER_SIZE + 8] = 3 << 6;
        assert!(CmMad::deser(&buf).is_err());
    }
}
