// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Request router (§4.G): decodes a [`CommandHeader`] + up to three
//! length-prefixed payloads off the control socket, dispatches on
//! `func_code`, and encodes a [`ResponseHeader`] + trailing payload back.
//!
//! Wire sub-format for each `func_code`'s `length1`/`length2`/`length3`
//! payloads is this router's own design decision (not pinned by §4.G, which
//! only fixes the 24-byte headers); see DESIGN.md for the per-command table.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::Notify,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::enums::Digest,
    daemon::protocol::{COMMAND_HEADER_LEN, CommandHeader, FuncCode, RESPONSE_HEADER_LEN, ResponseHeader},
    engine::session::{Auth, Connection, ConnectionId, Session, SessionId, SessionManager},
    errors::{LocalError, LoginStatus, ProtocolStatus},
    store::{ConfigStore, SecretStore},
    values::{ConnectionConfig, Portal, SessionConfig, Target},
};

/// Everything a connection handler needs to answer a command. Cheap to
/// clone: every field is an `Arc` (or a clone of one).
#[derive(Clone)]
pub struct Router {
    pub session_manager: Arc<SessionManager>,
    pub config_store: Arc<dyn ConfigStore>,
    pub secret_store: Arc<dyn SecretStore>,
    /// Woken by `UpdateDiscovery` to make the scheduler run a tick now
    /// instead of waiting out its interval.
    pub discovery_trigger: Arc<Notify>,
    /// Cancelled by `Shutdown`, after the response for it has been flushed.
    pub shutdown: CancellationToken,
}

impl Router {
    /// Services one client connection until EOF or a framing error. Commands
    /// on a single connection are handled one at a time, in order: the
    /// protocol does not multiplex requests over one socket.
    pub async fn serve(&self, mut stream: UnixStream) -> Result<()> {
        loop {
            let mut hdr_buf = [0u8; COMMAND_HEADER_LEN];
            match stream.read_exact(&mut hdr_buf).await {
                Ok(_) => {},
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e).context("reading command header"),
            }
            let cmd = CommandHeader::from_bytes(&hdr_buf)?;
            let func_code = cmd.func_code()?;

            let p1 = read_payload(&mut stream, cmd.length1.get()).await?;
            let p2 = read_payload(&mut stream, cmd.length2.get()).await?;
            let p3 = read_payload(&mut stream, cmd.length3.get()).await?;

            let (resp, data) = self.dispatch(func_code, &cmd, p1, p2, p3).await;

            let mut out = Vec::with_capacity(RESPONSE_HEADER_LEN + data.len());
            out.resize(RESPONSE_HEADER_LEN, 0);
            resp.to_bytes(&mut out[..RESPONSE_HEADER_LEN])?;
            out.extend_from_slice(&data);
            stream.write_all(&out).await.context("writing response")?;

            if func_code == FuncCode::Shutdown {
                self.shutdown.cancel();
                return Ok(());
            }
        }
    }

    async fn dispatch(
        &self,
        func_code: FuncCode,
        cmd: &CommandHeader,
        p1: Vec<u8>,
        p2: Vec<u8>,
        p3: Vec<u8>,
    ) -> (ResponseHeader, Vec<u8>) {
        let result = self.dispatch_inner(func_code, cmd, p1, p2, p3).await;
        match result {
            Ok((status_code, field1, field2, data)) => {
                let mut resp = ResponseHeader::success(func_code).with_status(status_code);
                resp.field1.set(field1);
                resp.field2.set(field2);
                resp.data_length.set(data.len() as u32);
                (resp, data)
            },
            Err(e) => {
                warn!(?func_code, error = %e, "daemon command failed");
                let errno = e
                    .downcast_ref::<LocalError>()
                    .map(LocalError::errno)
                    .unwrap_or(5 /* EIO, see errors::libc_errno */);
                (ResponseHeader::success(func_code).with_error(errno), Vec::new())
            },
        }
    }

    async fn dispatch_inner(
        &self,
        func_code: FuncCode,
        cmd: &CommandHeader,
        p1: Vec<u8>,
        p2: Vec<u8>,
        p3: Vec<u8>,
    ) -> Result<(u16, u32, u32, Vec<u8>)> {
        match func_code {
            FuncCode::Login => self.do_login(p1, p2, p3).await,
            FuncCode::Logout => self.do_logout(cmd, p1).await,
            FuncCode::ArrayOfActiveTargets => self.do_array_of_active_targets(),
            FuncCode::ArrayOfActivePortalsForTarget => self.do_array_of_active_portals(p1),
            FuncCode::IsTargetActive => self.do_is_target_active(p1),
            FuncCode::IsPortalActive => self.do_is_portal_active(p1, p2),
            FuncCode::QueryTargetForAuthMethod => self.do_query_auth_method(p1, p2).await,
            FuncCode::QueryPortalForTargets => self.do_query_portal_for_targets(p1, p2).await,
            FuncCode::PropertiesForSession => self.do_properties_for_session(cmd),
            FuncCode::PropertiesForConnection => self.do_properties_for_connection(cmd),
            FuncCode::UpdateDiscovery => {
                self.discovery_trigger.notify_one();
                Ok((0, 0, 0, Vec::new()))
            },
            FuncCode::Shutdown => {
                info!("shutdown requested over control socket");
                Ok((0, 0, 0, Vec::new()))
            },
        }
    }

    async fn do_login(&self, p1: Vec<u8>, p2: Vec<u8>, p3: Vec<u8>) -> Result<(u16, u32, u32, Vec<u8>)> {
        let target = Target::decode(&p1).context("decoding Target payload")?;
        // An empty length3 payload means "use the saved configuration", the
        // re-login path an auto_login target takes without the CLI having
        // to round-trip a secret it never holds.
        let auth = if p3.is_empty() {
            self.auth_from_store(&target.iqn)?
        } else {
            Auth::decode(&p3).context("decoding Auth payload")?
        };

        // An empty length2 payload means "Target only": no portal was given,
        // so every portal the config store knows about for this target is
        // tried in order until one succeeds (§4.G func_code 1).
        if p2.is_empty() {
            let (portals, sess_cfg, conn_cfg) = self.portals_from_store(&target.iqn)?;
            let mut last_status = None;
            let mut last_err = None;
            for portal in portals {
                match self
                    .session_manager
                    .login_session(target.clone(), portal.clone(), auth.clone(), sess_cfg, conn_cfg)
                    .await
                {
                    Ok((Some(session_id), status)) => {
                        return Ok((
                            login_status_code(status),
                            session_id.raw() as u32,
                            0,
                            Vec::new(),
                        ));
                    },
                    Ok((None, status)) => {
                        warn!(target = %target.iqn, %portal, ?status, "login rejected, trying next known portal");
                        last_status = status;
                    },
                    Err(e) => {
                        warn!(target = %target.iqn, %portal, error = %e, "login attempt failed, trying next known portal");
                        last_err = Some(e);
                    },
                }
            }
            if let Some(status) = last_status {
                return Ok((login_status_code(Some(status)), 0, 0, Vec::new()));
            }
            if let Some(e) = last_err {
                return Err(e.into());
            }
            bail!("no known portals for target {} produced a usable response", target.iqn);
        }

        let (portal, sess_cfg, conn_cfg) = decode_portal_and_configs(&p2)?;
        let (session_id, status) = self
            .session_manager
            .login_session(target, portal, auth, sess_cfg, conn_cfg)
            .await?;

        let status_code = login_status_code(status);
        let field1 = session_id.map(|s| s.raw() as u32).unwrap_or(0);
        Ok((status_code, field1, 0, Vec::new()))
    }

    /// Resolves the Target-only Login form: every known portal for `iqn`
    /// plus the session/connection parameters saved for it in the config
    /// store (the same values a manual `-p` login would otherwise have to
    /// spell out on the command line).
    fn portals_from_store(
        &self,
        iqn: &str,
    ) -> Result<(Vec<Portal>, SessionConfig, ConnectionConfig)> {
        let record = self
            .config_store
            .target(iqn)
            .context("reading stored target configuration")?
            .ok_or_else(|| anyhow!("no stored configuration for target {iqn}"))?;

        if record.portals.is_empty() {
            bail!("no known portals for target {iqn}, pass -p/--portal explicitly");
        }

        let portals = record
            .portals
            .iter()
            .map(|p| {
                Portal::new(p.address.clone())
                    .port(p.port.clone())
                    .host_interface(p.host_interface.clone())
                    .build()
            })
            .collect::<Result<Vec<_>>>()
            .context("stored portal record is invalid")?;

        let sess_cfg = SessionConfig {
            error_recovery_level: record.error_recovery_level,
            max_connections: record.max_connections,
            target_portal_group_tag: 1,
        };
        let conn_cfg = ConnectionConfig {
            header_digest: record.header_digest,
            data_digest: record.data_digest,
        };

        Ok((portals, sess_cfg, conn_cfg))
    }

    /// `field1` carries the session id directly when the caller already
    /// knows it (e.g. a prior `PropertiesForSession` round trip); a thin
    /// caller that only knows the target name (`iscsictl logout -t`) may
    /// instead leave `field1` zero and attach the IQN as `length1`, which
    /// this resolves via `session_for_target` before looking anything up.
    async fn do_logout(&self, cmd: &CommandHeader, p1: Vec<u8>) -> Result<(u16, u32, u32, Vec<u8>)> {
        let session_id = if cmd.field1.get() != 0 {
            SessionId::from_raw(cmd.field1.get() as u16)
        } else {
            let iqn = decode_raw_string(&p1).context("Logout payload is neither a session id nor a target IQN")?;
            self.session_manager
                .session_for_target(&iqn)
                .ok_or_else(|| anyhow!("no active session for target {iqn}"))?
        };
        let connection_id = cmd.field2.get();

        let (_, status) = if connection_id == 0 {
            self.session_manager.logout_session(session_id).await?
        } else {
            self.session_manager
                .logout_connection(session_id, ConnectionId::from_raw(connection_id))
                .await?
        };
        Ok((logout_status_code(status), 0, 0, Vec::new()))
    }

    fn do_array_of_active_targets(&self) -> Result<(u16, u32, u32, Vec<u8>)> {
        let mut iqns = Vec::new();
        for id in self.session_manager.session_ids() {
            if let Some(sess) = self.session_manager.session_snapshot(id) {
                if !sess.target.is_discovery_sentinel() {
                    iqns.push(sess.target.iqn);
                }
            }
        }
        Ok((0, 0, 0, encode_string_list(&iqns)))
    }

    fn do_array_of_active_portals(&self, p1: Vec<u8>) -> Result<(u16, u32, u32, Vec<u8>)> {
        let iqn = decode_raw_string(&p1)?;
        let Some(sess) = self.find_session_by_target(&iqn) else {
            return Ok((0, 0, 0, encode_portal_list(&[])));
        };
        let portals: Vec<Portal> = sess.connections.values().map(|c| c.portal.clone()).collect();
        Ok((0, 0, 0, encode_portal_list(&portals)))
    }

    fn do_is_target_active(&self, p1: Vec<u8>) -> Result<(u16, u32, u32, Vec<u8>)> {
        let iqn = decode_raw_string(&p1)?;
        let active = self.find_session_by_target(&iqn).is_some();
        Ok((0, active as u32, 0, Vec::new()))
    }

    fn do_is_portal_active(&self, p1: Vec<u8>, p2: Vec<u8>) -> Result<(u16, u32, u32, Vec<u8>)> {
        let iqn = decode_raw_string(&p1)?;
        let portal = Portal::decode(&p2)?;
        let active = self
            .find_session_by_target(&iqn)
            .map(|sess| sess.connections.values().any(|c| c.portal == portal))
            .unwrap_or(false);
        Ok((0, active as u32, 0, Vec::new()))
    }

    /// Probes whether `target` requires CHAP by attempting a login with
    /// `Auth::None` and reading back the target's verdict: a success or any
    /// status other than `AuthFail` means no authentication is required,
    /// an `AuthFail` response means the target demands CHAP credentials the
    /// caller doesn't have yet (§6's rationale for this call existing at
    /// all: letting a UI ask before it has prompted the user for a secret).
    async fn do_query_auth_method(&self, p1: Vec<u8>, p2: Vec<u8>) -> Result<(u16, u32, u32, Vec<u8>)> {
        let iqn = decode_raw_string(&p1)?;
        let portal = Portal::decode(&p2)?;
        let probe_cfg = SessionConfig {
            error_recovery_level: 0,
            max_connections: 1,
            target_portal_group_tag: 1,
        };
        let conn_cfg = ConnectionConfig {
            header_digest: Digest::None,
            data_digest: Digest::None,
        };

        let (session_id, status) = self
            .session_manager
            .login_session(Target::new(iqn), portal, Auth::None, probe_cfg, conn_cfg)
            .await?;

        if let Some(session_id) = session_id {
            let _ = self.session_manager.logout_session(session_id).await;
        }

        let requires_chap = matches!(status, Some(ProtocolStatus::Login(LoginStatus::AuthFail)));
        Ok((0, requires_chap as u32, 0, Vec::new()))
    }

    async fn do_query_portal_for_targets(&self, p1: Vec<u8>, p2: Vec<u8>) -> Result<(u16, u32, u32, Vec<u8>)> {
        let portal = Portal::decode(&p1)?;
        let auth = Auth::decode(&p2)?;
        let (record, status) =
            crate::discovery::query_portal_for_targets(&self.session_manager, portal, auth).await?;
        Ok((login_status_code(status), 0, 0, record.encode()))
    }

    fn do_properties_for_session(&self, cmd: &CommandHeader) -> Result<(u16, u32, u32, Vec<u8>)> {
        let session_id = SessionId::from_raw(cmd.field1.get() as u16);
        let sess = self
            .session_manager
            .session_snapshot(session_id)
            .ok_or_else(|| anyhow!("unknown session {session_id}"))?;
        Ok((0, 0, 0, encode_session_properties(&sess)))
    }

    fn do_properties_for_connection(&self, cmd: &CommandHeader) -> Result<(u16, u32, u32, Vec<u8>)> {
        let session_id = SessionId::from_raw(cmd.field1.get() as u16);
        let connection_id = ConnectionId::from_raw(cmd.field2.get());
        let sess = self
            .session_manager
            .session_snapshot(session_id)
            .ok_or_else(|| anyhow!("unknown session {session_id}"))?;
        let conn = sess
            .connections
            .get(&connection_id)
            .ok_or_else(|| anyhow!("unknown connection {connection_id} in session {session_id}"))?;
        Ok((0, 0, 0, encode_connection_properties(conn)))
    }

    fn find_session_by_target(&self, iqn: &str) -> Option<Session> {
        let session_id = self.session_manager.session_for_target(iqn)?;
        self.session_manager.session_snapshot(session_id)
    }

    /// Builds `Auth` from the on-disk `TargetRecord` and (if CHAP) the
    /// keychain-like `SecretStore`, for a `Login` command that didn't attach
    /// its own credentials (§6).
    fn auth_from_store(&self, iqn: &str) -> Result<Auth> {
        let record = self
            .config_store
            .target(iqn)
            .context("reading stored target configuration")?
            .ok_or_else(|| anyhow!("no stored configuration for target {iqn}"))?;

        if record.auth_method.eq_ignore_ascii_case("chap") {
            let secret = self
                .secret_store
                .get_chap_secret(iqn)
                .context("reading stored CHAP secret")?
                .ok_or_else(|| anyhow!("no CHAP secret stored for target {iqn}"))?;
            Ok(Auth::Chap {
                target_name: iqn.to_string(),
                target_secret: secret,
                initiator_name: None,
                initiator_secret: None,
            })
        } else {
            Ok(Auth::None)
        }
    }
}

async fn read_payload(stream: &mut UnixStream, len: u32) -> Result<Vec<u8>> {
    let len = len as usize;
    let mut buf = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut buf).await.context("reading attached payload")?;
    }
    Ok(buf)
}

fn login_status_code(status: Option<ProtocolStatus>) -> u16 {
    match status {
        Some(ProtocolStatus::Login(s)) => login_status_ordinal(s),
        _ => 0,
    }
}

fn logout_status_code(status: Option<ProtocolStatus>) -> u16 {
    use crate::errors::LogoutStatus as L;
    match status {
        Some(ProtocolStatus::Logout(s)) => match s {
            L::Success => 0,
            L::CidNotFound => 1,
            L::RecoveryUnsupported => 2,
            L::CleanupFailed => 3,
            L::InvalidStatus => 4,
        },
        _ => 0,
    }
}

/// Stable ordinal for [`LoginStatus`] on the wire; not the RFC3720 status
/// class/detail byte pair (the daemon protocol only needs a single `u16`
/// the CLI can match against, not the raw iSCSI encoding).
fn login_status_ordinal(s: LoginStatus) -> u16 {
    use LoginStatus::*;
    match s {
        Success => 0,
        TargetMovedTemp => 1,
        TargetMovedPerm => 2,
        InitiatorError => 3,
        AuthFail => 4,
        AccessDenied => 5,
        NotFound => 6,
        TargetRemoved => 7,
        UnsupportedVersion => 8,
        TooManyConnections => 9,
        MissingParam => 10,
        CantIncludeInSession => 11,
        SessionTypeUnsupported => 12,
        SessionDoesntExist => 13,
        InvalidReqDuringLogin => 14,
        TargetHWorSWError => 15,
        ServiceUnavailable => 16,
        OutOfResources => 17,
        InvalidStatus => 18,
    }
}

fn decode_raw_string(buf: &[u8]) -> Result<String> {
    std::str::from_utf8(buf)
        .map(str::to_string)
        .context("payload is not valid UTF-8")
}

fn encode_string_list(items: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for s in items {
        let bytes = s.as_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

fn encode_portal_list(portals: &[Portal]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(portals.len() as u32).to_be_bytes());
    for p in portals {
        let enc = p.encode();
        out.extend_from_slice(&(enc.len() as u32).to_be_bytes());
        out.extend_from_slice(&enc);
    }
    out
}

/// Login's `length2` payload: a `Portal` encoding (itself length-prefixed,
/// since `Portal::decode` rejects trailing bytes) followed by the two
/// fixed-size configs. See DESIGN.md for why this differs from `length1`'s
/// bare `Target` encoding.
fn encode_portal_and_configs(portal: &Portal, sess_cfg: SessionConfig, conn_cfg: ConnectionConfig) -> Vec<u8> {
    let mut out = Vec::new();
    let portal_enc = portal.encode();
    out.extend_from_slice(&(portal_enc.len() as u32).to_be_bytes());
    out.extend_from_slice(&portal_enc);
    out.extend_from_slice(&sess_cfg.encode());
    out.extend_from_slice(&conn_cfg.encode());
    out
}

fn decode_portal_and_configs(buf: &[u8]) -> Result<(Portal, SessionConfig, ConnectionConfig)> {
    if buf.len() < 4 {
        bail!("Login length2 payload too short for portal length prefix");
    }
    let portal_len = u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")) as usize;
    let rest = &buf[4..];
    if rest.len() < portal_len + 5 + 2 {
        bail!("Login length2 payload truncated");
    }
    let portal = Portal::decode(&rest[..portal_len])?;
    let sess_cfg = SessionConfig::decode(&rest[portal_len..portal_len + 5])?;
    let conn_cfg = ConnectionConfig::decode(&rest[portal_len + 5..portal_len + 7])?;
    if rest.len() != portal_len + 7 {
        bail!("trailing bytes after Login length2 payload");
    }
    Ok((portal, sess_cfg, conn_cfg))
}

fn encode_session_properties(sess: &Session) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&sess.tsih.to_be_bytes());
    let iqn = sess.target.iqn.as_bytes();
    out.extend_from_slice(&(iqn.len() as u32).to_be_bytes());
    out.extend_from_slice(iqn);
    out.extend_from_slice(&sess.negotiated.encode());
    out.extend_from_slice(&sess.target_portal_group_tag.to_be_bytes());
    out.extend_from_slice(&(sess.connections.len() as u32).to_be_bytes());
    for conn in sess.connections.values() {
        out.extend_from_slice(&conn.connection_id.raw().to_be_bytes());
        out.extend_from_slice(&encode_connection_properties(conn));
    }
    out
}

fn encode_connection_properties(conn: &Connection) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&conn.cid_wire.to_be_bytes());
    let enc = conn.portal.encode();
    out.extend_from_slice(&(enc.len() as u32).to_be_bytes());
    out.extend_from_slice(&enc);
    out.extend_from_slice(&conn.negotiated.encode());
    out.push(connection_state_tag(conn.state));
    out
}

fn connection_state_tag(state: crate::engine::session::ConnectionState) -> u8 {
    use crate::engine::session::ConnectionState::*;
    match state {
        Created => 0,
        SecurityNegotiating => 1,
        OpNegotiating => 2,
        Active => 3,
        LoggingOut => 4,
        Released => 5,
    }
}

/// `iscsictl` builds the `Login` command's `length2` payload with this same
/// packing; exposed so the CLI binary doesn't have to reimplement it.
pub fn encode_login_portal_payload(portal: &Portal, sess_cfg: SessionConfig, conn_cfg: ConnectionConfig) -> Vec<u8> {
    encode_portal_and_configs(portal, sess_cfg, conn_cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_and_configs_round_trip() {
        let portal = Portal::new("10.0.0.5").port("3260").build().unwrap();
        let sess_cfg = SessionConfig {
            error_recovery_level: 0,
            max_connections: 2,
            target_portal_group_tag: 1,
        };
        let conn_cfg = ConnectionConfig {
            header_digest: Digest::None,
            data_digest: Digest::CRC32C,
        };

        let encoded = encode_portal_and_configs(&portal, sess_cfg, conn_cfg);
        let (p, s, c) = decode_portal_and_configs(&encoded).unwrap();
        assert_eq!(p, portal);
        assert_eq!(s, sess_cfg);
        assert_eq!(c, conn_cfg);
    }

    #[test]
    fn string_list_round_trips_via_manual_decode() {
        let items = vec!["iqn.a".to_string(), "iqn.b".to_string()];
        let encoded = encode_string_list(&items);
        assert_eq!(&encoded[0..4], &2u32.to_be_bytes());
    }

    #[test]
    fn login_status_ordinal_is_stable_for_success() {
        assert_eq!(login_status_ordinal(LoginStatus::Success), 0);
    }
}
