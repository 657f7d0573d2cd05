// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Internal error taxonomy and the small boundary code set a host embedding
//! this crate is expected to match against.

use std::fmt;

/// Internal failure taxonomy. Only [`Kind::NameResolutionFailed`] and
/// [`Kind::BindFailed`] ever reach [`crate::TcpForwarder::add_entry`] /
/// [`crate::UdpForwarder::add_entry`] callers directly; the rest are
/// collapsed to [`BoundaryError::Unknown`] at the boundary, matching the
/// original `forwarding_error` C ABI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Kind {
    #[error("socket handle was invalid")]
    InvalidSocket,
    #[error("bind failed")]
    BindFailed,
    #[error("listen failed")]
    ListenFailed,
    #[error("connect failed")]
    ConnectFailed,
    #[error("send or receive failed")]
    SendReceiveFailed,
    #[error("name resolution failed")]
    NameResolutionFailed,
}

/// An internal error, carrying the [`Kind`] plus the underlying OS error
/// when there was one.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {source}")]
pub struct Error {
    kind: Kind,
    #[source]
    source: std::io::Error,
}

impl Error {
    pub fn new(kind: Kind, source: std::io::Error) -> Self {
        Self { kind, source }
    }

    pub fn other(kind: Kind) -> Self {
        Self {
            kind,
            source: std::io::Error::from(std::io::ErrorKind::Other),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }
}

/// The small, stable error set exposed at the control-plane boundary,
/// mirroring the original implementation's `forwarding_error` enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundaryError {
    NameResolutionFailed,
    BindFailed,
    Unknown,
}

impl fmt::Display for BoundaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameResolutionFailed => write!(f, "name resolution failed"),
            Self::BindFailed => write!(f, "bind failed"),
            Self::Unknown => write!(f, "unknown forwarding error"),
        }
    }
}

impl std::error::Error for BoundaryError {}

impl From<Error> for BoundaryError {
    fn from(error: Error) -> Self {
        match error.kind {
            Kind::NameResolutionFailed => Self::NameResolutionFailed,
            Kind::BindFailed => Self::BindFailed,
            _ => Self::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
