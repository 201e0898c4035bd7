// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Local and protocol-level error taxonomy shared by the session manager,
//! the discovery engine, and the daemon request router.

use std::fmt;

use thiserror::Error;

use crate::models::{login::status::StatusDetail, logout::common::LogoutResponseCode};

/// Local/system error, independent of what the target said on the wire.
#[derive(Debug, Error)]
pub enum LocalError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("host interface does not support the target's address family")]
    AddressFamilyNotSupported,

    #[error("session/connection table exhausted, retry later")]
    Busy,

    #[error("negotiation key {key} could not be reconciled: {reason}")]
    UnsupportedParameter { key: String, reason: String },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("permission denied")]
    PermissionDenied,

    #[error("out of memory")]
    OutOfMemory,

    #[error("no such device")]
    NoDevice,
}

impl LocalError {
    /// POSIX-style errno used in the daemon response header's `error_code`
    /// field (§4.G). `Ok` is represented by the absence of a `LocalError`,
    /// not a variant here.
    pub fn errno(&self) -> u32 {
        use LocalError::*;
        match self {
            InvalidArgument(_) => libc_errno::EINVAL,
            Io(_) => libc_errno::EIO,
            AddressFamilyNotSupported => libc_errno::EAFNOSUPPORT,
            Busy => libc_errno::EBUSY,
            UnsupportedParameter { .. } => libc_errno::ENOPROTOOPT,
            AuthenticationFailed(_) => libc_errno::EACCES,
            Timeout => libc_errno::ETIMEDOUT,
            PermissionDenied => libc_errno::EPERM,
            OutOfMemory => libc_errno::ENOMEM,
            NoDevice => libc_errno::ENODEV,
        }
    }
}

/// A tiny local stand-in for libc's errno constants, kept inline rather than
/// pulling in the `libc` crate for eight numbers the daemon protocol never
/// exposes beyond its own header.
mod libc_errno {
    pub const EPERM: u32 = 1;
    pub const EIO: u32 = 5;
    pub const ENODEV: u32 = 19;
    pub const EINVAL: u32 = 22;
    pub const EBUSY: u32 = 16;
    pub const ENOMEM: u32 = 12;
    pub const ETIMEDOUT: u32 = 110;
    pub const EAFNOSUPPORT: u32 = 97;
    pub const ENOPROTOOPT: u32 = 92;
}

/// Protocol-level status, meaningful only when the local operation otherwise
/// succeeded (§7). Login and logout each have their own status space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    Login(LoginStatus),
    Logout(LogoutStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    Success,
    TargetMovedTemp,
    TargetMovedPerm,
    InitiatorError,
    AuthFail,
    AccessDenied,
    NotFound,
    TargetRemoved,
    UnsupportedVersion,
    TooManyConnections,
    MissingParam,
    CantIncludeInSession,
    SessionTypeUnsupported,
    SessionDoesntExist,
    InvalidReqDuringLogin,
    TargetHWorSWError,
    ServiceUnavailable,
    OutOfResources,
    InvalidStatus,
}

impl From<&StatusDetail> for LoginStatus {
    fn from(detail: &StatusDetail) -> Self {
        use crate::models::login::status::{
            InitiatorErrorDetail as IE, RedirectionDetail as RD, SuccessDetail as SD,
            TargetErrorDetail as TE,
        };
        match detail {
            StatusDetail::Success(SD::CmdCompletedNormally) => LoginStatus::Success,
            StatusDetail::Redirection(RD::TargetRedirected) => {
                LoginStatus::TargetMovedTemp
            },
            StatusDetail::InitiatorErr(ie) => match ie {
                IE::InitiatorError => LoginStatus::InitiatorError,
                IE::AuthFailed => LoginStatus::AuthFail,
                IE::AuthzFailed => LoginStatus::AccessDenied,
                IE::NotFound => LoginStatus::NotFound,
                IE::TargetRemoved => LoginStatus::TargetRemoved,
                IE::UnsupportedVersion => LoginStatus::UnsupportedVersion,
                IE::TooManyConnections => LoginStatus::TooManyConnections,
                IE::MissingParameter => LoginStatus::MissingParam,
                IE::CantIncludeInSession => LoginStatus::CantIncludeInSession,
                IE::SessionTypeNotSupported => LoginStatus::SessionTypeUnsupported,
                IE::SessionDoesNotExist => LoginStatus::SessionDoesntExist,
                IE::InvalidDuringLogin => LoginStatus::InvalidReqDuringLogin,
                IE::Reserved(_) => LoginStatus::InvalidStatus,
            },
            StatusDetail::TargetErr(te) => match te {
                TE::TargetBusy => LoginStatus::ServiceUnavailable,
                TE::TargetProtectedAreaBusy => LoginStatus::ServiceUnavailable,
                TE::TargetResourceUnavailable => LoginStatus::OutOfResources,
                TE::TargetInternalError => LoginStatus::TargetHWorSWError,
                TE::VendorSpecific(_) | TE::Reserved(_) => LoginStatus::TargetHWorSWError,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutStatus {
    Success,
    CidNotFound,
    RecoveryUnsupported,
    CleanupFailed,
    InvalidStatus,
}

impl From<LogoutResponseCode> for LogoutStatus {
    fn from(code: LogoutResponseCode) -> Self {
        match code {
            LogoutResponseCode::Success => LogoutStatus::Success,
            LogoutResponseCode::CidNotFound => LogoutStatus::CidNotFound,
            LogoutResponseCode::RecoveryNotSupported => LogoutStatus::RecoveryUnsupported,
            LogoutResponseCode::CleanupFailed => LogoutStatus::CleanupFailed,
        }
    }
}

impl fmt::Display for ProtocolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolStatus::Login(s) => write!(f, "{s:?}"),
            ProtocolStatus::Logout(s) => write!(f, "{s:?}"),
        }
    }
}

/// The combined result type every public engine-level operation returns
/// (§7): a local error short-circuits; otherwise `status` carries the
/// protocol-level outcome for the caller to present.
pub type EngineResult<T> = Result<(T, Option<ProtocolStatus>), LocalError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::login::status::{StatusDetail, SuccessDetail};

    #[test]
    fn success_detail_maps_to_login_success() {
        let detail = StatusDetail::Success(SuccessDetail::CmdCompletedNormally);
        assert_eq!(LoginStatus::from(&detail), LoginStatus::Success);
    }

    #[test]
    fn logout_cid_not_found_maps() {
        assert_eq!(
            LogoutStatus::from(LogoutResponseCode::CidNotFound),
            LogoutStatus::CidNotFound
        );
    }
}
