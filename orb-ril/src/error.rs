use crate::{
    at::{ChannelError, Cme, ParseError},
    request::Response,
};
use derive_more::Display;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::Serialize;
use thiserror::Error;

/// Outcome code reported to the telephony stack with every completion.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, FromPrimitive, ToPrimitive,
)]
#[repr(i32)]
pub enum Outcome {
    Success = 0,
    RadioNotAvailable = 1,
    GenericFailure = 2,
    PasswordIncorrect = 3,
    RequestNotSupported = 6,
    SmsSendFailRetry = 10,
    SimAbsent = 11,
    ModeNotSupported = 13,
}

/// `+CME ERROR` codes the classifier knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum CmeCode {
    OperationNotSupported = 4,
    SimNotInserted = 10,
    SimPinRequired = 11,
    SimPukRequired = 12,
    IncorrectPassword = 16,
    NoNetworkService = 30,
}

impl CmeCode {
    pub fn matches(self, cme: Cme) -> bool {
        cme == Cme::Code(self as i32)
    }
}

/// Maps the error carried by a final response onto an outcome.
pub fn classify(cme: Cme) -> Outcome {
    use num_traits::FromPrimitive as _;

    match cme {
        Cme::Success => Outcome::Success,
        Cme::NonCme => Outcome::GenericFailure,
        Cme::Code(code) => match CmeCode::from_i32(code) {
            Some(CmeCode::OperationNotSupported) => Outcome::RequestNotSupported,
            Some(CmeCode::SimNotInserted) => Outcome::SimAbsent,
            Some(CmeCode::IncorrectPassword) => Outcome::PasswordIncorrect,
            _ => Outcome::GenericFailure,
        },
    }
}

#[derive(Debug, Error)]
pub enum RilError {
    #[error("radio not available")]
    RadioNotAvailable,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("modem rejected command: {0:?}")]
    Rejected(Cme),
    #[error("malformed response: {0}")]
    Parse(#[from] ParseError),
    #[error("network mode {0} is not supported by the modem")]
    ModeNotSupported(i32),
    #[error("request not supported")]
    NotSupported,
    #[error("call list looks stale, repoll #{0}")]
    RepollRequested(u8),
    #[error("incorrect password, {retries} retries left")]
    PasswordIncorrect { retries: i32 },
    #[error("facility lock rejected ({cme:?}), {retries} retries left")]
    FacilityLock { cme: Cme, retries: i32 },
    #[error("sim is not in the required state")]
    SimState,
    #[error("sms send failed, retry later")]
    SmsSendFailRetry,
    #[error("interface configuration failed: {0}")]
    Interface(color_eyre::Report),
    #[error("{0}")]
    Failed(String),
}

impl RilError {
    pub fn outcome(&self) -> Outcome {
        match self {
            RilError::RadioNotAvailable => Outcome::RadioNotAvailable,
            RilError::Rejected(cme) | RilError::FacilityLock { cme, .. } => classify(*cme),
            RilError::ModeNotSupported(_) => Outcome::ModeNotSupported,
            RilError::NotSupported => Outcome::RequestNotSupported,
            RilError::PasswordIncorrect { .. } => Outcome::PasswordIncorrect,
            RilError::SmsSendFailRetry => Outcome::SmsSendFailRetry,
            RilError::Channel(_)
            | RilError::Parse(_)
            | RilError::RepollRequested(_)
            | RilError::SimState
            | RilError::Interface(_)
            | RilError::Failed(_) => Outcome::GenericFailure,
        }
    }

    /// Some failures still carry a payload, the remaining PIN retries.
    pub fn payload(&self) -> Option<Response> {
        match self {
            RilError::PasswordIncorrect { retries }
            | RilError::FacilityLock { retries, .. } => Some(Response::Int(*retries)),
            RilError::SimState => Some(Response::Int(-1)),
            _ => None,
        }
    }
}

/// Turns an unsuccessful final response into [`RilError::Rejected`].
pub(crate) trait Accepted: Sized {
    fn accepted(self) -> Result<Self, RilError>;
}

impl Accepted for crate::at::AtResponse {
    fn accepted(self) -> Result<Self, RilError> {
        if self.success {
            Ok(self)
        } else {
            Err(RilError::Rejected(self.cme()))
        }
    }
}
