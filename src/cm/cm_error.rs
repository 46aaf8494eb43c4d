use thiserror::Error;

use crate::cm::cep::CepState;


/// Errors returned synchronously by the connection manager's API. A call that fails with one of
///  these did not change any CEP state.
#[derive(Debug, Error)]
pub enum CmError {
    #[error("operation not valid in state {0:?}")]
    InvalidState(CepState),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("address already in use")]
    AddrInUse,
    #[error("no such CEP or pending request")]
    NotFound,
    #[error("connection is already disconnecting")]
    AlreadyDisconnecting,
    #[error("timed out")]
    Timeout,
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("request was cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl CmError {
    pub(crate) fn invalid_parameter(msg: impl Into<String>) -> CmError {
        CmError::InvalidParameter(msg.into())
    }
}
