//! Construction of the outbound CM messages

use crate::cm::params::RejectInfo;
use crate::messaging::cm_messages::*;
use crate::messaging::codes::{AprStatus, MraedMessage, RejectReason, RejectedMessage, SidrStatus};
use crate::messaging::mad::FixedData;


pub fn rej(msg_rejected: RejectedMessage, reason: RejectReason, local_comm_id: u32, remote_comm_id: u32) -> CmMessage {
    CmMessage::Rej(RejMessage {
        local_comm_id,
        remote_comm_id,
        msg_rejected,
        reject_info_len: 0,
        reason,
        reject_info: FixedData::default(),
        private_data: FixedData::default(),
    })
}

pub fn rej_with_info(msg_rejected: RejectedMessage, info: &RejectInfo, local_comm_id: u32, remote_comm_id: u32) -> anyhow::Result<CmMessage> {
    Ok(CmMessage::Rej(RejMessage {
        local_comm_id,
        remote_comm_id,
        msg_rejected,
        reject_info_len: info.reject_info.len() as u8,
        reason: info.reason,
        reject_info: FixedData::from_slice(&info.reject_info)?,
        private_data: FixedData::from_slice(&info.private_data)?,
    }))
}

pub fn mra(msg_mraed: MraedMessage, service_timeout: u8, local_comm_id: u32, remote_comm_id: u32) -> CmMessage {
    CmMessage::Mra(MraMessage {
        local_comm_id,
        remote_comm_id,
        msg_mraed,
        service_timeout,
        private_data: FixedData::default(),
    })
}

pub fn rtu(local_comm_id: u32, remote_comm_id: u32, private_data: &[u8]) -> anyhow::Result<CmMessage> {
    Ok(CmMessage::Rtu(RtuMessage {
        local_comm_id,
        remote_comm_id,
        private_data: FixedData::from_slice(private_data)?,
    }))
}

pub fn dreq(local_comm_id: u32, remote_comm_id: u32, remote_qpn_or_eecn: u32, private_data: &[u8]) -> anyhow::Result<CmMessage> {
    Ok(CmMessage::Dreq(DreqMessage {
        local_comm_id,
        remote_comm_id,
        remote_qpn_or_eecn,
        private_data: FixedData::from_slice(private_data)?,
    }))
}

pub fn drep(local_comm_id: u32, remote_comm_id: u32, private_data: &[u8]) -> anyhow::Result<CmMessage> {
    Ok(CmMessage::Drep(DrepMessage {
        local_comm_id,
        remote_comm_id,
        private_data: FixedData::from_slice(private_data)?,
    }))
}

pub fn apr(status: AprStatus, local_comm_id: u32, remote_comm_id: u32, add_info: &[u8], private_data: &[u8]) -> anyhow::Result<CmMessage> {
    Ok(CmMessage::Apr(AprMessage {
        local_comm_id,
        remote_comm_id,
        add_info_len: add_info.len() as u8,
        status,
        add_info: FixedData::from_slice(add_info)?,
        private_data: FixedData::from_slice(private_data)?,
    }))
}

pub fn apr_status(status: AprStatus, local_comm_id: u32, remote_comm_id: u32) -> CmMessage {
    CmMessage::Apr(AprMessage {
        local_comm_id,
        remote_comm_id,
        add_info_len: 0,
        status,
        add_info: FixedData::default(),
        private_data: FixedData::default(),
    })
}

pub fn sidr_resp(request_id: u32, status: SidrStatus, service_id: u64, qpn: u32, qkey: u32, private_data: &[u8]) -> anyhow::Result<CmMessage> {
    Ok(CmMessage::SidrResp(SidrRespMessage {
        request_id,
        status,
        add_info_len: 0,
        qpn,
        service_id,
        qkey,
        add_info: FixedData::default(),
        private_data: FixedData::from_slice(private_data)?,
    }))
}
