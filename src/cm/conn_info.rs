//! What the application learns about a CEP: the status ending or advancing a protocol phase,
//!  plus the data of the message that caused it

use tracing::trace;

use crate::cm::cep::{Cep, CepEvents, CepState, CepPath};
use crate::cm::cep_arena::CepId;
use crate::cm::context::{idle_mode_reset, CmContext};
use crate::cm::params::PathInfo;
use crate::messaging::cm_messages::CmMessage;
use crate::messaging::codes::{AprStatus, CepType, FailoverReply, RejectReason, RejectedMessage, SidrStatus};
use crate::messaging::transport::MadAddress;


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CmStatus {
    ConnectRequest,
    ConnectReply,
    ConnectEstablished,
    ConnectReject,
    ConnectTimeout,
    ConnectCancel,
    DisconnectRequest,
    DisconnectReply,
    /// a disconnect completed, or timed out waiting for the remote side's reply
    Disconnected,
    CaRemoved,
    AltpathRequest,
    AltpathReply,
    AltpathReject,
    AltpathTimeout,
    SidrRequest,
    SidrResponse,
    SidrResponseErr,
    SidrRequestTimeout,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnInfo {
    pub status: CmStatus,
    pub detail: ConnDetail,
}
impl ConnInfo {
    pub fn new(status: CmStatus) -> ConnInfo {
        ConnInfo { status, detail: ConnDetail::None }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnDetail {
    None,
    ConnectRequest(ConnectRequestInfo),
    ConnectReply(ConnectReplyInfo),
    Established { private_data: Vec<u8> },
    Reject(RejectDetail),
    DisconnectRequest { private_data: Vec<u8> },
    DisconnectReply { private_data: Vec<u8> },
    AltPathRequest { alternate: PathInfo, ack_timeout: u8, private_data: Vec<u8> },
    AltPathReply(AltPathReplyInfo),
    SidrRequest(SidrRequestInfo),
    SidrResponse(SidrResponseInfo),
}

/// An inbound connect request, waiting in a listener's (or a peer CEP's) pending list. The
///  offered RDMA read resources are already limited to what the local CA supports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectRequestInfo {
    /// the CEP to accept or reject
    pub child: CepId,
    pub service_id: u64,
    pub cep_type: CepType,
    pub remote_ca_guid: u64,
    pub remote_qpn: u32,
    pub remote_eecn: u32,
    pub remote_qkey: u32,
    pub remote_starting_psn: u32,
    pub offered_initiator_depth: u8,
    pub offered_responder_resources: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub end_to_end_flow_control: bool,
    pub primary: PathInfo,
    pub primary_ack_timeout: u8,
    pub alternate: Option<PathInfo>,
    /// local port the request arrived on
    pub port_guid: u64,
    pub private_data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectReplyInfo {
    pub remote_ca_guid: u64,
    pub remote_qpn: u32,
    pub remote_eecn: u32,
    pub remote_qkey: u32,
    pub remote_starting_psn: u32,
    pub arb_initiator_depth: u8,
    pub arb_responder_resources: u8,
    pub target_ack_delay: u8,
    pub failover_accepted: FailoverReply,
    pub rnr_retry_count: u8,
    pub end_to_end_flow_control: bool,
    pub private_data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectDetail {
    pub reason: RejectReason,
    pub msg_rejected: RejectedMessage,
    pub reject_info: Vec<u8>,
    pub private_data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AltPathReplyInfo {
    pub status: AprStatus,
    /// the now loaded alternate path, for PathLoaded
    pub alternate: Option<PathInfo>,
    pub alternate_ack_timeout: u8,
    pub add_info: Vec<u8>,
    pub private_data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SidrRequestInfo {
    /// the CEP to pass to `sidr_response`
    pub child: CepId,
    pub service_id: u64,
    pub partition_key: u16,
    /// where the request came from
    pub from: MadAddress,
    pub private_data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SidrResponseInfo {
    pub status: SidrStatus,
    pub service_id: u64,
    pub qpn: u32,
    pub qkey: u32,
    pub add_info: Vec<u8>,
    pub private_data: Vec<u8>,
}


/// test-and-clear of one event flag
fn take(cep: &mut Cep, event: CepEvents) -> bool {
    let present = cep.events.contains(event);
    cep.events.remove(event);
    present
}

fn reject_detail(cep: &Cep) -> ConnDetail {
    match &cep.received {
        Some(CmMessage::Rej(rej)) => ConnDetail::Reject(RejectDetail {
            reason: rej.reason,
            msg_rejected: rej.msg_rejected,
            reject_info: rej.reject_info.as_bytes()[..(rej.reject_info_len as usize).min(rej.reject_info.as_bytes().len())].to_vec(),
            private_data: rej.private_data.as_bytes().to_vec(),
        }),
        _ => ConnDetail::None,
    }
}

fn reply_detail(cep: &Cep) -> ConnDetail {
    match &cep.received {
        Some(CmMessage::Rep(rep)) => ConnDetail::ConnectReply(ConnectReplyInfo {
            remote_ca_guid: rep.local_ca_guid,
            remote_qpn: rep.local_qpn,
            remote_eecn: rep.local_eecn,
            remote_qkey: rep.local_qkey,
            remote_starting_psn: rep.starting_psn,
            arb_initiator_depth: rep.arb_initiator_depth,
            arb_responder_resources: rep.arb_responder_resources,
            target_ack_delay: rep.target_ack_delay,
            failover_accepted: rep.failover_accepted,
            rnr_retry_count: rep.rnr_retry_count,
            end_to_end_flow_control: rep.end_to_end_flow_control,
            private_data: rep.private_data.as_bytes().to_vec(),
        }),
        _ => ConnDetail::None,
    }
}

fn rtu_detail(cep: &Cep) -> ConnDetail {
    match &cep.received {
        Some(CmMessage::Rtu(rtu)) => ConnDetail::Established { private_data: rtu.private_data.as_bytes().to_vec() },
        _ => ConnDetail::Established { private_data: Vec::new() },
    }
}

fn dreq_detail(cep: &Cep) -> ConnDetail {
    match &cep.received {
        Some(CmMessage::Dreq(dreq)) => ConnDetail::DisconnectRequest { private_data: dreq.private_data.as_bytes().to_vec() },
        _ => ConnDetail::DisconnectRequest { private_data: Vec::new() },
    }
}

fn drep_detail(cep: &Cep) -> ConnDetail {
    match &cep.received {
        Some(CmMessage::Drep(drep)) => ConnDetail::DisconnectReply { private_data: drep.private_data.as_bytes().to_vec() },
        _ => ConnDetail::DisconnectReply { private_data: Vec::new() },
    }
}

fn info(status: CmStatus, detail: ConnDetail) -> Option<ConnInfo> {
    Some(ConnInfo { status, detail })
}

/// Map the flags of a CEP that reports about itself. Returns the info, and whether the flags
///  not consumed here stay queued.
fn own_events(cep: &mut Cep) -> (Option<ConnInfo>, bool) {
    use CepState::*;

    match cep.state {
        Idle => {
            if take(cep, CepEvents::SYSTEM_DISCONNECT) {
                let status = if cep.timewait_callback { CmStatus::CaRemoved } else { CmStatus::Disconnected };
                (info(status, ConnDetail::None), false)
            }
            else if take(cep, CepEvents::USER_CANCEL) {
                (info(CmStatus::ConnectCancel, ConnDetail::None), false)
            }
            else if take(cep, CepEvents::TIMEOUT_REQ) || take(cep, CepEvents::TIMEOUT_REP) {
                (info(CmStatus::ConnectTimeout, ConnDetail::None), false)
            }
            else if take(cep, CepEvents::RCVD_REJ) {
                // a stale connection's timewait expiry stays queued
                (info(CmStatus::ConnectReject, reject_detail(cep)), true)
            }
            else if take(cep, CepEvents::TIMEOUT_DREQ) {
                (info(CmStatus::Disconnected, ConnDetail::None), false)
            }
            else if take(cep, CepEvents::RCVD_DREP) {
                (info(CmStatus::DisconnectReply, drep_detail(cep)), true)
            }
            else if take(cep, CepEvents::RCVD_DREQ) || take(cep, CepEvents::SIM_RCVD_DREQ) {
                // the application replied to a disconnect that raced with this one
                (info(CmStatus::Disconnected, ConnDetail::None), false)
            }
            else if take(cep, CepEvents::TIMEOUT_TIMEWAIT) {
                if cep.timewait_callback {
                    (info(CmStatus::Disconnected, ConnDetail::None), false)
                }
                else {
                    (None, false)
                }
            }
            else if take(cep, CepEvents::RCVD_SIDR_RESP) {
                match &cep.received {
                    Some(CmMessage::SidrResp(resp)) => {
                        let status = if resp.status == SidrStatus::ValidQpn { CmStatus::SidrResponse } else { CmStatus::SidrResponseErr };
                        (info(status, ConnDetail::SidrResponse(SidrResponseInfo {
                            status: resp.status,
                            service_id: resp.service_id,
                            qpn: resp.qpn,
                            qkey: resp.qkey,
                            add_info: resp.add_info.as_bytes()[..(resp.add_info_len as usize).min(resp.add_info.as_bytes().len())].to_vec(),
                            private_data: resp.private_data.as_bytes().to_vec(),
                        })), false)
                    }
                    _ => (None, false),
                }
            }
            else if take(cep, CepEvents::TIMEOUT_SIDR_REQ) {
                (info(CmStatus::SidrRequestTimeout, ConnDetail::None), false)
            }
            else {
                (None, false)
            }
        }
        RepRcvd | MraRepSent => {
            if take(cep, CepEvents::RCVD_REP) {
                (info(CmStatus::ConnectReply, reply_detail(cep)), false)
            }
            else {
                (None, false)
            }
        }
        Established => {
            if take(cep, CepEvents::RCVD_RTU) {
                (info(CmStatus::ConnectEstablished, rtu_detail(cep)), false)
            }
            else if take(cep, CepEvents::RCVD_APR) {
                match &cep.received {
                    Some(CmMessage::Apr(apr)) => {
                        let loaded = apr.status == AprStatus::PathLoaded;
                        let alternate = cep.alternate_path.filter(|_| loaded);
                        let detail = ConnDetail::AltPathReply(AltPathReplyInfo {
                            status: apr.status,
                            alternate: alternate.map(|p| p.to_path_info(cep.pkey, cep.mtu)),
                            alternate_ack_timeout: alternate.map(|p| p.local_ack_timeout).unwrap_or_default(),
                            add_info: apr.add_info.as_bytes()[..(apr.add_info_len as usize).min(apr.add_info.as_bytes().len())].to_vec(),
                            private_data: apr.private_data.as_bytes().to_vec(),
                        });
                        let status = if loaded { CmStatus::AltpathReply } else { CmStatus::AltpathReject };
                        (info(status, detail), false)
                    }
                    _ => (None, false),
                }
            }
            else if take(cep, CepEvents::TIMEOUT_LAP) {
                (info(CmStatus::AltpathTimeout, ConnDetail::None), false)
            }
            else {
                (None, false)
            }
        }
        LapRcvd | MraLapSent => {
            if take(cep, CepEvents::RCVD_RTU) {
                // the stored message is the LAP by now, the RTU is reported without its data
                (info(CmStatus::ConnectEstablished, ConnDetail::Established { private_data: Vec::new() }), true)
            }
            else if take(cep, CepEvents::RCVD_LAP) {
                match &cep.received {
                    Some(CmMessage::Lap(lap)) => {
                        let alternate = CepPath::from_remote_wire_path(&lap.alternate);
                        (info(CmStatus::AltpathRequest, ConnDetail::AltPathRequest {
                            alternate: alternate.to_path_info(cep.pkey, cep.mtu),
                            ack_timeout: alternate.ack_timeout,
                            private_data: lap.private_data.as_bytes().to_vec(),
                        }), false)
                    }
                    _ => (None, false),
                }
            }
            else {
                (None, false)
            }
        }
        DreqRcvd => {
            if take(cep, CepEvents::RCVD_RTU) {
                (info(CmStatus::ConnectEstablished, ConnDetail::Established { private_data: Vec::new() }), true)
            }
            else if take(cep, CepEvents::RCVD_DREQ) {
                (info(CmStatus::DisconnectRequest, dreq_detail(cep)), false)
            }
            else {
                (None, false)
            }
        }
        SimDreqRcvd => {
            if take(cep, CepEvents::RCVD_RTU) {
                (info(CmStatus::ConnectEstablished, ConnDetail::Established { private_data: Vec::new() }), true)
            }
            else if take(cep, CepEvents::SIM_RCVD_DREQ) {
                (info(CmStatus::DisconnectRequest, ConnDetail::DisconnectRequest { private_data: Vec::new() }), false)
            }
            else {
                (None, false)
            }
        }
        Timewait => {
            if take(cep, CepEvents::RCVD_REJ) {
                (info(CmStatus::ConnectReject, reject_detail(cep)), false)
            }
            else if cep.events.contains(CepEvents::TIMEOUT_REP) {
                if cep.timewait_callback {
                    // reported once Timewait is over
                    (None, true)
                }
                else {
                    cep.events.remove(CepEvents::TIMEOUT_REP);
                    (info(CmStatus::ConnectTimeout, ConnDetail::None), false)
                }
            }
            else if take(cep, CepEvents::RCVD_DREP) {
                (info(CmStatus::DisconnectReply, drep_detail(cep)), false)
            }
            else if take(cep, CepEvents::RCVD_DREQ) || take(cep, CepEvents::SIM_RCVD_DREQ) || take(cep, CepEvents::TIMEOUT_DREQ) {
                if cep.timewait_callback {
                    (None, false)
                }
                else {
                    (info(CmStatus::Disconnected, ConnDetail::None), false)
                }
            }
            else {
                (None, false)
            }
        }
        _ => (None, false),
    }
}

impl CmContext {
    /// Map a CEP's pending events to what is reported next, consuming the events. `None` means
    ///  there is nothing to report (yet).
    pub fn get_conn_info(&mut self, id: CepId) -> Option<ConnInfo> {
        let cep = self.ceps.get_mut(id).ok()?;

        let (result, keep_queued) = match cep.state {
            CepState::Listen | CepState::ReqRcvd | CepState::MraReqSent => {
                cep.events.remove(CepEvents::RCVD_REQ);
                let first = cep.pending.front().copied();
                let result = first
                    .and_then(|child| self.request_info(child))
                    .map(|r| ConnInfo { status: CmStatus::ConnectRequest, detail: ConnDetail::ConnectRequest(r) });
                (result, false)
            }
            CepState::Registered => {
                let result = if take(cep, CepEvents::RCVD_SIDR_REQ) {
                    let first = cep.pending.front().copied();
                    first
                        .and_then(|child| self.sidr_request_info(child))
                        .map(|r| ConnInfo { status: CmStatus::SidrRequest, detail: ConnDetail::SidrRequest(r) })
                }
                else {
                    None
                };
                (result, false)
            }
            _ => own_events(cep),
        };

        if let Ok(cep) = self.ceps.get_mut(id) {
            if !keep_queued {
                cep.events = CepEvents::empty();
            }
            idle_mode_reset(cep);
            trace!(cep = %id, state = ?cep.state, status = ?result.as_ref().map(|i| i.status), "conn info");
        }
        result
    }

    fn request_info(&self, child_id: CepId) -> Option<ConnectRequestInfo> {
        let child = self.ceps.get(child_id).ok()?;
        let Some(CmMessage::Req(req)) = &child.received else {
            return None;
        };
        Some(ConnectRequestInfo {
            child: child_id,
            service_id: req.service_id,
            cep_type: req.transport_service_type,
            remote_ca_guid: req.local_ca_guid,
            remote_qpn: req.local_qpn,
            remote_eecn: req.local_eecn,
            remote_qkey: req.local_qkey,
            remote_starting_psn: req.starting_psn,
            offered_initiator_depth: child.local_responder_resources,
            offered_responder_resources: child.local_initiator_depth,
            retry_count: req.retry_count,
            rnr_retry_count: req.rnr_retry_count,
            end_to_end_flow_control: req.end_to_end_flow_control,
            primary: child.primary_path.to_path_info(child.pkey, child.mtu),
            primary_ack_timeout: child.primary_path.ack_timeout,
            alternate: child.alternate_path.map(|p| p.to_path_info(child.pkey, child.mtu)),
            port_guid: child.address.map(|a| a.port_guid).unwrap_or_default(),
            private_data: req.private_data.as_bytes().to_vec(),
        })
    }

    fn sidr_request_info(&self, child_id: CepId) -> Option<SidrRequestInfo> {
        let child = self.ceps.get(child_id).ok()?;
        let Some(CmMessage::SidrReq(req)) = &child.received else {
            return None;
        };
        Some(SidrRequestInfo {
            child: child_id,
            service_id: child.service_id,
            partition_key: req.partition_key,
            from: child.address?,
            private_data: req.private_data.as_bytes().to_vec(),
        })
    }
}
