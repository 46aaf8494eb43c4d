//! Entry point for inbound datagrams: decoding, and routing to the handler of the message type

use tracing::{debug, warn};

use crate::cm::context::CmContext;
use crate::messaging::cm_messages::{ClassPortInfo, CmMad, CmMessage};
use crate::messaging::codes::RejectedMessage;
use crate::messaging::mad::{MadHeader, MAD_METHOD_GET, MAD_METHOD_GET_RESP, MAD_METHOD_SEND, MAD_METHOD_SET};
use crate::messaging::transport::MadAddress;


/// What became of an inbound message
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// changed the state of a CEP, or was answered
    Processed,
    /// a retransmission of something already processed
    Duplicate,
    /// no CEP it could belong to
    NoMatch,
    /// belongs to a CEP, but not in its current state
    Discarded,
    /// answered with a rejection
    Rejected,
}

impl CmContext {
    pub fn receive(&mut self, bytes: &[u8], from: MadAddress) -> DispatchOutcome {
        let mad = match CmMad::deser(bytes) {
            Ok(mad) => mad,
            Err(e) => {
                debug!(port = from.port_guid, lid = from.remote_lid, "dropping undecodable MAD: {}", e);
                self.stats.failed += 1;
                return DispatchOutcome::Discarded;
            }
        };
        self.stats.received.count(&mad.message, mad.header.method == MAD_METHOD_GET_RESP);

        let outcome = self.dispatch(mad, from).unwrap_or_else(|e| {
            warn!(lid = from.remote_lid, "error handling inbound MAD: {:#}", e);
            DispatchOutcome::Discarded
        });
        if matches!(outcome, DispatchOutcome::Discarded | DispatchOutcome::NoMatch) {
            self.stats.discarded += 1;
        }
        outcome
    }

    fn dispatch(&mut self, mad: CmMad, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let tid = mad.header.transaction_id;
        let method = mad.header.method;

        if let CmMessage::ClassPortInfo(_) = mad.message {
            if method != MAD_METHOD_GET && method != MAD_METHOD_SET {
                debug!(method, "ClassPortInfo with method 0x{:x}", method);
                return Ok(DispatchOutcome::Discarded);
            }
            // there is nothing to configure, a Set is answered like a Get
            let resp = CmMad {
                header: MadHeader::cm(MAD_METHOD_GET_RESP, tid),
                message: CmMessage::ClassPortInfo(ClassPortInfo::cm_default()),
            };
            self.out.send(from, resp);
            return Ok(DispatchOutcome::Processed);
        }
        if method != MAD_METHOD_SEND {
            debug!(method, "{} with method 0x{:x}", mad.message.name(), method);
            return Ok(DispatchOutcome::Discarded);
        }

        match mad.message {
            CmMessage::Req(req) => self.on_req(req, tid, from),
            CmMessage::Rep(rep) => self.on_rep(rep, tid, from),
            CmMessage::Rtu(rtu) => self.on_rtu(rtu),
            CmMessage::Mra(mra) => self.on_mra(mra),
            CmMessage::Rej(rej) => match rej.msg_rejected {
                RejectedMessage::Reply => self.on_rej_rep(rej, from),
                _ => self.on_rej_req(rej, from),
            },
            CmMessage::Dreq(dreq) => self.on_dreq(dreq, tid, from),
            CmMessage::Drep(drep) => self.on_drep(drep, from),
            CmMessage::Lap(lap) => self.on_lap(lap, tid, from),
            CmMessage::Apr(apr) => self.on_apr(apr),
            CmMessage::SidrReq(req) => self.on_sidr_req(req, tid, from),
            CmMessage::SidrResp(resp) => self.on_sidr_resp(resp, from),
            CmMessage::ClassPortInfo(_) => Ok(DispatchOutcome::Discarded),
        }
    }
}
