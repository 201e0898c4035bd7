// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The 24-byte command/response header pair exchanged between `iscsictl`
//! and `iscsid` over the local stream socket (§4.G, §6). Byte-exact; this
//! is an external wire format the same way the iSCSI BHS is, so it gets
//! the same zero-copy treatment as `models/opcode.rs`.

use anyhow::{Result, bail};
use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U16, U32};

pub const COMMAND_HEADER_LEN: usize = 24;
pub const RESPONSE_HEADER_LEN: usize = 24;

/// `func_code` values (§4.G).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncCode {
    Login = 1,
    Logout = 2,
    ArrayOfActiveTargets = 3,
    ArrayOfActivePortalsForTarget = 4,
    IsTargetActive = 5,
    IsPortalActive = 6,
    QueryTargetForAuthMethod = 7,
    QueryPortalForTargets = 8,
    PropertiesForSession = 9,
    PropertiesForConnection = 10,
    UpdateDiscovery = 11,
    Shutdown = 12,
}

impl TryFrom<u16> for FuncCode {
    type Error = anyhow::Error;

    fn try_from(v: u16) -> Result<Self> {
        Ok(match v {
            1 => FuncCode::Login,
            2 => FuncCode::Logout,
            3 => FuncCode::ArrayOfActiveTargets,
            4 => FuncCode::ArrayOfActivePortalsForTarget,
            5 => FuncCode::IsTargetActive,
            6 => FuncCode::IsPortalActive,
            7 => FuncCode::QueryTargetForAuthMethod,
            8 => FuncCode::QueryPortalForTargets,
            9 => FuncCode::PropertiesForSession,
            10 => FuncCode::PropertiesForConnection,
            11 => FuncCode::UpdateDiscovery,
            12 => FuncCode::Shutdown,
            other => bail!("unknown func_code {other}"),
        })
    }
}

/// Command header, client -> daemon (§4.G).
///
/// ```text
/// offset  size  field
/// 0       2     func_code
/// 2       2     reserved
/// 4       4     field1     (e.g. session_id)
/// 8       4     field2     (e.g. connection_id)
/// 12      4     length1    (1st attached payload length)
/// 16      4     length2
/// 20      4     length3
/// ```
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CommandHeader {
    pub func_code: U16<BigEndian>,
    reserved: [u8; 2],
    pub field1: U32<BigEndian>,
    pub field2: U32<BigEndian>,
    pub length1: U32<BigEndian>,
    pub length2: U32<BigEndian>,
    pub length3: U32<BigEndian>,
}

const _: () = assert!(std::mem::size_of::<CommandHeader>() == COMMAND_HEADER_LEN);

impl CommandHeader {
    pub fn new(func_code: FuncCode) -> Self {
        let mut h = Self::default();
        h.func_code.set(func_code as u16);
        h
    }

    pub fn func_code(&self) -> Result<FuncCode> {
        FuncCode::try_from(self.func_code.get())
    }

    pub fn to_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != COMMAND_HEADER_LEN {
            bail!(
                "buffer length must be {COMMAND_HEADER_LEN}, got {}",
                buf.len()
            );
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != COMMAND_HEADER_LEN {
            bail!(
                "buffer length must be {COMMAND_HEADER_LEN}, got {}",
                buf.len()
            );
        }
        Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to parse CommandHeader: {e}"))
    }
}

/// Response header, daemon -> client (§4.G).
///
/// ```text
/// 0    1    func_code
/// 1    1    reserved
/// 2    4    error_code
/// 6    2    status_code
/// 8    4    field1
/// 12   4    field2
/// 16   4    data_length
/// 20   4    reserved
/// ```
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResponseHeader {
    pub func_code: u8,
    reserved1: u8,
    pub error_code: U32<BigEndian>,
    pub status_code: U16<BigEndian>,
    pub field1: U32<BigEndian>,
    pub field2: U32<BigEndian>,
    pub data_length: U32<BigEndian>,
    reserved2: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<ResponseHeader>() == RESPONSE_HEADER_LEN);

impl ResponseHeader {
    pub fn success(func_code: FuncCode) -> Self {
        let mut h = Self::default();
        h.func_code = func_code as u8;
        h
    }

    pub fn with_error(mut self, errno: u32) -> Self {
        self.error_code.set(errno);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code.set(status);
        self
    }

    pub fn to_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != RESPONSE_HEADER_LEN {
            bail!(
                "buffer length must be {RESPONSE_HEADER_LEN}, got {}",
                buf.len()
            );
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != RESPONSE_HEADER_LEN {
            bail!(
                "buffer length must be {RESPONSE_HEADER_LEN}, got {}",
                buf.len()
            );
        }
        Self::read_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed to parse ResponseHeader: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_header_round_trips_through_bytes() {
        let mut h = CommandHeader::new(FuncCode::Login);
        h.field1.set(7);
        h.length1.set(128);

        let mut buf = [0u8; COMMAND_HEADER_LEN];
        h.to_bytes(&mut buf).unwrap();

        let parsed = CommandHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed.func_code().unwrap(), FuncCode::Login);
        assert_eq!(parsed.field1.get(), 7);
        assert_eq!(parsed.length1.get(), 128);
    }

    #[test]
    fn response_header_round_trips_through_bytes() {
        let h = ResponseHeader::success(FuncCode::Logout)
            .with_error(0)
            .with_status(0);
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        h.to_bytes(&mut buf).unwrap();

        let parsed = ResponseHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed.func_code, FuncCode::Logout as u8);
        assert_eq!(parsed.error_code.get(), 0);
    }

    #[test]
    fn unknown_func_code_is_rejected() {
        assert!(FuncCode::try_from(0xFFFFu16).is_err());
    }
}
