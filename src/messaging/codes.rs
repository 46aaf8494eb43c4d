use std::fmt::{Display, Formatter};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};


/// Reason code carried in a REJ message
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum RejectReason {
    NoQp = 1,
    NoEec = 2,
    NoResources = 3,
    Timeout = 4,
    UnsupportedReq = 5,
    InvalidCommId = 6,
    InvalidCommInst = 7,
    InvalidSid = 8,
    InvalidTsType = 9,
    StaleConn = 10,
    InvalidRdc = 11,
    PrimaryDgidRej = 12,
    PrimaryDlidRej = 13,
    InvalidPrimarySl = 14,
    InvalidPrimaryTc = 15,
    InvalidPrimaryHl = 16,
    InvalidPrimaryPr = 17,
    AlternateDgid = 18,
    AlternateDlid = 19,
    InvalidAlternateSl = 20,
    InvalidAlternateTc = 21,
    InvalidAlternateHl = 22,
    InvalidAlternatePr = 23,
    CmPortRedir = 24,
    InvalidPathMtu = 25,
    InsufficientRespRes = 26,
    UserRej = 27,
    RnrCountRej = 28,
    #[num_enum(catch_all)]
    Other(u16),
}
impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Other(code) => write!(f, "unknown rejection code {}", code),
            known => write!(f, "{:?}", known),
        }
    }
}

/// Which message a REJ refers to
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RejectedMessage {
    Request = 0,
    Reply = 1,
    Other = 2,
}

/// Which message an MRA extends the timeout for
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MraedMessage {
    Request = 0,
    Reply = 1,
    Lap = 2,
}

/// Answer of the passive side to a requested alternate path
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AprStatus {
    PathLoaded = 0,
    InvalidCommId = 1,
    UnsupportedReq = 2,
    Rejected = 3,
    CmPortRedir = 4,
    DuplicatePath = 5,
    EndpointMismatch = 6,
    RejectDlid = 7,
    RejectDgid = 8,
    RejectFl = 9,
    RejectTc = 10,
    RejectHl = 11,
    RejectPr = 12,
    RejectSl = 13,
    #[num_enum(catch_all)]
    Other(u8),
}
impl Display for AprStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AprStatus::Other(code) => write!(f, "unknown APR status {}", code),
            known => write!(f, "{:?}", known),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SidrStatus {
    ValidQpn = 0,
    SidNotSupported = 1,
    ProviderRejected = 2,
    QpUnavailable = 3,
    Redirect = 4,
    VersionNotSupported = 5,
    #[num_enum(catch_all)]
    Other(u8),
}
impl Display for SidrStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SidrStatus::Other(code) => write!(f, "unknown SIDR status {}", code),
            known => write!(f, "{:?}", known),
        }
    }
}

/// The REP's answer to an alternate path offered in the REQ
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FailoverReply {
    Accepted = 0,
    NotSupported = 1,
    RejectedAlt = 2,
    #[num_enum(catch_all)]
    Other(u8),
}
impl Default for FailoverReply {
    fn default() -> Self {
        FailoverReply::Accepted
    }
}
impl FailoverReply {
    /// an alternate path rejection still means the remote side is able to do APM
    pub fn is_failover_supported(&self) -> bool {
        matches!(self, FailoverReply::Accepted | FailoverReply::RejectedAlt)
    }
}

/// Transport service type, both in the API and on the wire in a REQ
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CepType {
    ReliableConnection = 0,
    UnreliableConnection = 1,
    ReliableDatagram = 2,
    UnreliableDatagram = 3,
}
impl CepType {
    pub fn is_connected(&self) -> bool {
        !matches!(self, CepType::UnreliableDatagram)
    }

    /// RDMA read resources are negotiated for RC and RD only
    pub fn has_rdma_read(&self) -> bool {
        matches!(self, CepType::ReliableConnection | CepType::ReliableDatagram)
    }
}
