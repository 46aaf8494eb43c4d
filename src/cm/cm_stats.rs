use crate::messaging::cm_messages::CmMessage;
use crate::messaging::codes::{AprStatus, MraedMessage, RejectedMessage};


/// per message type counters, one set for each direction
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MessageCounts {
    pub class_port_info: u64,
    pub class_port_info_resp: u64,
    pub req: u64,
    pub rep: u64,
    pub rtu: u64,
    pub rej_req: u64,
    pub rej_rep: u64,
    pub mra_req: u64,
    pub mra_rep: u64,
    pub mra_lap: u64,
    pub dreq: u64,
    pub drep: u64,
    pub lap: u64,
    pub apr_acc: u64,
    pub apr_rej: u64,
    pub sidr_req: u64,
    pub sidr_resp: u64,
}

impl MessageCounts {
    pub fn count(&mut self, msg: &CmMessage, is_response: bool) {
        match msg {
            CmMessage::ClassPortInfo(_) if is_response => self.class_port_info_resp += 1,
            CmMessage::ClassPortInfo(_) => self.class_port_info += 1,
            CmMessage::Req(_) => self.req += 1,
            CmMessage::Rep(_) => self.rep += 1,
            CmMessage::Rtu(_) => self.rtu += 1,
            CmMessage::Rej(m) => match m.msg_rejected {
                RejectedMessage::Reply => self.rej_rep += 1,
                _ => self.rej_req += 1,
            },
            CmMessage::Mra(m) => match m.msg_mraed {
                MraedMessage::Request => self.mra_req += 1,
                MraedMessage::Reply => self.mra_rep += 1,
                MraedMessage::Lap => self.mra_lap += 1,
            },
            CmMessage::Dreq(_) => self.dreq += 1,
            CmMessage::Drep(_) => self.drep += 1,
            CmMessage::Lap(_) => self.lap += 1,
            CmMessage::Apr(m) if m.status == AprStatus::PathLoaded => self.apr_acc += 1,
            CmMessage::Apr(_) => self.apr_rej += 1,
            CmMessage::SidrReq(_) => self.sidr_req += 1,
            CmMessage::SidrResp(_) => self.sidr_resp += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CmStats {
    pub sent: MessageCounts,
    pub received: MessageCounts,
    /// inbound datagrams that could not be decoded
    pub failed: u64,
    /// inbound messages that were decoded but dropped by the state machine
    pub discarded: u64,
}
