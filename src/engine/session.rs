// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session/connection manager (§4.E): the "E" component. Owns the
//! session/connection lifecycle state machine, ID allocation, and portal
//! resolution, on top of [`Pool`]/[`ClientConnection`] for the actual PDU
//! exchange.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::atomic::{AtomicU16, AtomicU32, Ordering},
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::{AuthConfig, ChapConfig, Config, MutualChapConfig},
    client::{client::ClientConnection, pool_sessions::Pool},
    errors::{EngineResult, LocalError, LoginStatus, LogoutStatus, ProtocolStatus},
    state_machine::login::common::{LoginFailure, reconcile_operational_negotiation},
    utils::generate_isid,
    values::{ConnectionConfig, DEFAULT_HOST_INTERFACE, Portal, SessionConfig, Target},
};

/// Authentication credentials for a login attempt (§3, §4.C). Re-exported
/// from [`crate::values`] under the name every §4.E signature in the spec
/// uses; kept as a type alias rather than a copy so the two stay in sync.
pub use crate::values::Auth;

/// 16-bit process-wide handle for a session. `SessionId::INVALID` is the
/// reserved "no session" sentinel (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u16);

impl SessionId {
    pub const INVALID: SessionId = SessionId(0);

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn from_raw(v: u16) -> Self {
        Self(v)
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-bit handle for a connection within a session. `ConnectionId::INVALID`
/// is the reserved sentinel (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub const INVALID: ConnectionId = ConnectionId(0);

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn from_raw(v: u32) -> Self {
        Self(v)
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection states of the §4.E state diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    SecurityNegotiating,
    OpNegotiating,
    Active,
    LoggingOut,
    Released,
}

/// A single TCP connection within a [`Session`] (§3).
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: ConnectionId,
    /// The CID carried on the wire (distinct from the process-wide
    /// [`ConnectionId`] handle, which must survive CID reuse across
    /// relogins).
    pub cid_wire: u16,
    pub portal: Portal,
    pub negotiated: ConnectionConfig,
    pub state: ConnectionState,
    pub initial_exp_stat_sn: u32,
}

/// A logical association between initiator and target (§3), owned by
/// [`SessionManager`].
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub tsih: u16,
    pub target: Target,
    pub negotiated: SessionConfig,
    pub target_portal_group_tag: u16,
    pub connections: BTreeMap<ConnectionId, Connection>,
}

impl Session {
    /// The connection a session-scope Logout PDU is sent over: the lowest
    /// `ConnectionId` (§4.E tie-break rule).
    pub fn leading_connection(&self) -> Option<&Connection> {
        self.connections.values().next()
    }
}

/// Monotonic ID allocator that only reuses a value after it has been
/// explicitly released (§4.E: "ID allocation is monotonic within a session
/// lifetime and may reuse IDs only after release").
struct IdAllocator<T> {
    next: std::sync::Mutex<u64>,
    free: std::sync::Mutex<Vec<u64>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> IdAllocator<T> {
    fn new() -> Self {
        Self {
            next: std::sync::Mutex::new(1),
            free: std::sync::Mutex::new(Vec::new()),
            _marker: std::marker::PhantomData,
        }
    }

    fn alloc(&self, max: u64) -> Option<u64> {
        if let Some(id) = self.free.lock().expect("id allocator free-list poisoned").pop() {
            return Some(id);
        }
        let mut next = self.next.lock().expect("id allocator counter poisoned");
        if *next > max {
            return None;
        }
        let id = *next;
        *next += 1;
        Some(id)
    }

    fn release(&self, id: u64) {
        self.free.lock().expect("id allocator free-list poisoned").push(id);
    }
}

/// The session/connection manager: component E of §2. Owns the engine-level
/// session table and drives login/logout through [`Pool`].
pub struct SessionManager {
    base_cfg: Config,
    pool: std::sync::Arc<Pool>,
    sessions: DashMap<SessionId, Session>,
    tsih_index: DashMap<u16, SessionId>,
    target_index: DashMap<String, SessionId>,
    session_ids: IdAllocator<SessionId>,
    connection_ids: IdAllocator<ConnectionId>,
    next_cid_wire: AtomicU16,
    /// Upper bound on the overall login round trip (DESIGN.md's login
    /// timeout decision, §9 open question).
    login_timeout: std::time::Duration,
}

impl SessionManager {
    /// Builds a manager using `base_cfg` as the template for fields §4.I's
    /// typed value model doesn't carry per-login (initiator identity,
    /// timers, flow-control defaults, runtime limits).
    pub fn new(base_cfg: Config) -> std::sync::Arc<Self> {
        let pool = std::sync::Arc::new(Pool::new(&base_cfg));
        pool.attach_self();
        let login_timeout = base_cfg.runtime.timeout_connection * 6;
        std::sync::Arc::new(Self {
            base_cfg,
            pool,
            sessions: DashMap::new(),
            tsih_index: DashMap::new(),
            target_index: DashMap::new(),
            session_ids: IdAllocator::new(),
            connection_ids: IdAllocator::new(),
            next_cid_wire: AtomicU16::new(1),
            login_timeout,
        })
    }

    pub fn pool(&self) -> &std::sync::Arc<Pool> {
        &self.pool
    }

    fn alloc_cid_wire(&self) -> u16 {
        self.next_cid_wire.fetch_add(1, Ordering::SeqCst)
    }

    /// §4.E portal resolution, address-family half: DNS/numeric resolution
    /// of the peer followed by a family compatibility check against
    /// `host_interface` (a literal local address, or `"default"` to accept
    /// any family). Binding to a specific local interface's socket is left
    /// to the transport facade; this manager only enforces the invariant
    /// the spec calls out as testable (scenario 6).
    async fn resolve_portal(portal: &Portal) -> Result<(), LocalError> {
        let target = format!("{}:{}", portal.address, portal.port);
        let mut addrs = tokio::net::lookup_host(&target)
            .await
            .map_err(LocalError::Io)?;
        let peer = addrs.next().ok_or_else(|| {
            LocalError::InvalidArgument(format!("no address found for portal {target}"))
        })?;

        if portal.host_interface != DEFAULT_HOST_INTERFACE {
            if let Ok(host_ip) = portal.host_interface.parse::<IpAddr>() {
                let same_family = matches!(
                    (peer.ip(), host_ip),
                    (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
                );
                if !same_family {
                    return Err(LocalError::AddressFamilyNotSupported);
                }
            }
        }
        Ok(())
    }

    /// Translates the typed value model (§4.I) into a concrete wire
    /// [`Config`], layered over `base_cfg`.
    fn build_config(
        &self,
        target: &Target,
        portal: &Portal,
        auth: &Auth,
        sess_cfg: SessionConfig,
        conn_cfg: ConnectionConfig,
    ) -> Result<Config, LocalError> {
        sess_cfg
            .validate()
            .map_err(|e| LocalError::InvalidArgument(e.to_string()))?;

        let mut cfg = self.base_cfg.clone();
        cfg.login.identity.session_type = if target.is_discovery_sentinel() {
            crate::cfg::enums::SessionType::Discovery
        } else {
            crate::cfg::enums::SessionType::Normal
        };
        cfg.login.identity.target_name = target.iqn.clone();
        cfg.login.transport.target_address = format!("{}:{}", portal.address, portal.port);
        cfg.login.transport.portal_group_tag = sess_cfg.target_portal_group_tag;
        cfg.login.recovery.error_recovery_level = sess_cfg.error_recovery_level;
        cfg.login.limits.max_connections = sess_cfg.max_connections;
        cfg.login.integrity.header_digest = conn_cfg.header_digest;
        cfg.login.integrity.data_digest = conn_cfg.data_digest;

        cfg.login.auth = match auth {
            Auth::None => AuthConfig::None,
            Auth::Chap {
                target_name,
                target_secret,
                initiator_name,
                initiator_secret,
            } => {
                let mutual = match (initiator_name, initiator_secret) {
                    (Some(n), Some(s)) => Some(MutualChapConfig {
                        username: n.clone(),
                        secret: s.clone(),
                    }),
                    _ => None,
                };
                AuthConfig::Chap(ChapConfig {
                    username: target_name.clone(),
                    secret: target_secret.clone(),
                    mutual,
                })
            },
        };

        cfg.validate_and_normalize()
            .map_err(|e| LocalError::InvalidArgument(e.to_string()))?;
        Ok(cfg)
    }

    /// Maps a login-stage `anyhow::Error` onto the §7 taxonomy, recovering
    /// a [`LoginFailure`] if the state machine raised one (the CHAP/mutual
    /// CHAP path), falling back to `LocalError::Io` for everything else
    /// (truncated PDU, connection reset, codec error).
    fn classify_login_error(err: anyhow::Error) -> LocalError {
        match err.downcast_ref::<LoginFailure>() {
            Some(LoginFailure::Auth(msg)) => LocalError::AuthenticationFailed(msg.clone()),
            Some(LoginFailure::UnsupportedParameter { key, reason }) => {
                LocalError::UnsupportedParameter {
                    key: key.clone(),
                    reason: reason.clone(),
                }
            },
            None => LocalError::Io(std::io::Error::other(err.to_string())),
        }
    }

    /// Finds the `SessionId` already assigned to `target`, if any
    /// (non-discovery uniqueness invariant, §3).
    pub fn session_for_target(&self, target: &str) -> Option<SessionId> {
        self.target_index.get(target).map(|e| *e.value())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    pub fn session_snapshot(&self, session_id: SessionId) -> Option<Session> {
        self.sessions.get(&session_id).map(|e| e.clone())
    }

    /// `login_session(target, portal, auth, sess_cfg, conn_cfg)` (§4.E).
    pub async fn login_session(
        &self,
        target: Target,
        portal: Portal,
        auth: Auth,
        sess_cfg: SessionConfig,
        conn_cfg: ConnectionConfig,
    ) -> EngineResult<Option<SessionId>> {
        if !target.is_discovery_sentinel() && self.target_index.contains_key(&target.iqn) {
            return Err(LocalError::InvalidArgument(format!(
                "session already exists for target {}",
                target.iqn
            )));
        }

        Self::resolve_portal(&portal).await?;

        let cfg = self.build_config(&target, &portal, &auth, sess_cfg, conn_cfg)?;

        let session_id = self
            .session_ids
            .alloc(u16::MAX as u64)
            .map(|v| SessionId::from_raw(v as u16))
            .ok_or(LocalError::Busy)?;
        let connection_id = self
            .connection_ids
            .alloc(u32::MAX as u64)
            .map(|v| ConnectionId::from_raw(v as u32))
            .ok_or_else(|| {
                self.session_ids.release(session_id.raw() as u64);
                LocalError::Busy
            })?;

        let cid_wire = self.alloc_cid_wire();

        let result: EngineResult<Option<SessionId>> = async {
            let conn = tokio::time::timeout(
                self.login_timeout,
                ClientConnection::connect(cfg.clone(), CancellationToken::new()),
            )
            .await
            .map_err(|_| LocalError::Timeout)?
            .map_err(|e| LocalError::Io(std::io::Error::other(e.to_string())))?;

            let (isid, _) = generate_isid();
            let target_arc: std::sync::Arc<str> = std::sync::Arc::from(target.iqn.as_str());

            let (tsih_opt, status, login_pdu) = tokio::time::timeout(
                self.login_timeout,
                self.pool
                    .login_and_insert_checked(target_arc, isid, cid_wire, conn.clone()),
            )
            .await
            .map_err(|_| LocalError::Timeout)?
            .map_err(Self::classify_login_error)?;

            let Some(tsih) = tsih_opt else {
                debug!(target = %target.iqn, portal = %portal, ?status, "login rejected");
                return Ok((None, Some(ProtocolStatus::Login(status))));
            };

            let reconciled = match reconcile_operational_negotiation(&cfg, &login_pdu) {
                Ok(n) => n,
                Err(e) => {
                    warn!(target = %target.iqn, portal = %portal, error = %e, "operational negotiation failed");
                    let _ = self.pool.logout_session_checked(tsih).await;
                    return Err(Self::classify_login_error(e));
                },
            };

            let session = Session {
                session_id,
                tsih,
                target: target.clone(),
                negotiated: SessionConfig {
                    error_recovery_level: reconciled.error_recovery_level,
                    max_connections: reconciled.max_connections,
                    target_portal_group_tag: sess_cfg.target_portal_group_tag,
                },
                target_portal_group_tag: sess_cfg.target_portal_group_tag,
                connections: BTreeMap::from([(
                    connection_id,
                    Connection {
                        connection_id,
                        cid_wire,
                        portal: portal.clone(),
                        negotiated: ConnectionConfig {
                            header_digest: reconciled.header_digest,
                            data_digest: reconciled.data_digest,
                        },
                        state: ConnectionState::Active,
                        initial_exp_stat_sn: 0,
                    },
                )]),
            };

            self.sessions.insert(session_id, session);
            self.tsih_index.insert(tsih, session_id);
            if !target.is_discovery_sentinel() {
                self.target_index.insert(target.iqn.clone(), session_id);
            }

            Ok((Some(session_id), Some(ProtocolStatus::Login(status))))
        }
        .await;

        if result.is_err() || matches!(&result, Ok((None, _))) {
            self.connection_ids.release(connection_id.raw() as u64);
            self.session_ids.release(session_id.raw() as u64);
        }

        result
    }

    /// `login_connection`: adds a non-leading connection to an existing
    /// session. Each new connection independently runs Security + then
    /// Operational negotiation (§4.E).
    pub async fn login_connection(
        &self,
        session_id: SessionId,
        portal: Portal,
    ) -> EngineResult<Option<ConnectionId>> {
        let (tsih, target, negotiated, max_connections, auth_hint) = {
            let sess = self
                .sessions
                .get(&session_id)
                .ok_or_else(|| LocalError::InvalidArgument(format!("unknown session {session_id}")))?;
            if sess.connections.len() as u16 >= sess.negotiated.max_connections {
                return Err(LocalError::Busy);
            }
            if let Some(leading) = sess.leading_connection() {
                if leading.portal != portal {
                    return Err(LocalError::InvalidArgument(
                        "login_connection only supports adding connections against the \
                         session's existing portal"
                            .to_string(),
                    ));
                }
            }
            (
                sess.tsih,
                sess.target.clone(),
                sess.negotiated,
                sess.negotiated.max_connections,
                sess.leading_connection().map(|c| c.negotiated),
            )
        };
        let _ = max_connections;

        Self::resolve_portal(&portal).await?;

        let conn_cfg = auth_hint.unwrap_or(ConnectionConfig {
            header_digest: crate::cfg::enums::Digest::None,
            data_digest: crate::cfg::enums::Digest::None,
        });
        let cfg = self.build_config(&target, &portal, &Auth::None, negotiated, conn_cfg)?;

        let connection_id = self
            .connection_ids
            .alloc(u32::MAX as u64)
            .map(|v| ConnectionId::from_raw(v as u32))
            .ok_or(LocalError::Busy)?;
        let cid_wire = self.alloc_cid_wire();

        let result: EngineResult<Option<ConnectionId>> = async {
            let conn = tokio::time::timeout(
                self.login_timeout,
                ClientConnection::connect(cfg.clone(), CancellationToken::new()),
            )
            .await
            .map_err(|_| LocalError::Timeout)?
            .map_err(|e| LocalError::Io(std::io::Error::other(e.to_string())))?;

            let (status, login_pdu) = tokio::time::timeout(
                self.login_timeout,
                self.pool
                    .add_connection_to_session_checked(tsih, cid_wire, conn.clone()),
            )
            .await
            .map_err(|_| LocalError::Timeout)?
            .map_err(Self::classify_login_error)?;

            if status != LoginStatus::Success {
                return Ok((None, Some(ProtocolStatus::Login(status))));
            }

            let reconciled = match reconcile_operational_negotiation(&cfg, &login_pdu) {
                Ok(n) => n,
                Err(e) => {
                    warn!(target = %target.iqn, portal = %portal, error = %e, "operational negotiation failed");
                    let _ = self.pool.logout_connection_checked(tsih, cid_wire).await;
                    return Err(Self::classify_login_error(e));
                },
            };

            if let Some(mut sess) = self.sessions.get_mut(&session_id) {
                sess.connections.insert(
                    connection_id,
                    Connection {
                        connection_id,
                        cid_wire,
                        portal: portal.clone(),
                        negotiated: ConnectionConfig {
                            header_digest: reconciled.header_digest,
                            data_digest: reconciled.data_digest,
                        },
                        state: ConnectionState::Active,
                        initial_exp_stat_sn: 0,
                    },
                );
            }

            Ok((Some(connection_id), Some(ProtocolStatus::Login(status))))
        }
        .await;

        if result.is_err() || matches!(&result, Ok((None, _))) {
            self.connection_ids.release(connection_id.raw() as u64);
        }

        result
    }

    /// Session logout: tears down every connection of the session.
    pub async fn logout_session(&self, session_id: SessionId) -> EngineResult<()> {
        let tsih = {
            let sess = self
                .sessions
                .get(&session_id)
                .ok_or_else(|| LocalError::InvalidArgument(format!("unknown session {session_id}")))?;
            sess.tsih
        };

        let status = self
            .pool
            .logout_session_checked(tsih)
            .await
            .map_err(|e| LocalError::Io(std::io::Error::other(e.to_string())))?;

        if let Some((_, sess)) = self.sessions.remove(&session_id) {
            self.tsih_index.remove(&tsih);
            if !sess.target.is_discovery_sentinel() {
                self.target_index.remove(&sess.target.iqn);
            }
            for cid in sess.connections.keys() {
                self.connection_ids.release(cid.raw() as u64);
            }
            self.session_ids.release(session_id.raw() as u64);
        }

        Ok(((), Some(ProtocolStatus::Logout(status))))
    }

    /// Connection logout; promoted to a session logout when it is the
    /// session's last connection (§4.E, §8 scenario 5).
    pub async fn logout_connection(
        &self,
        session_id: SessionId,
        connection_id: ConnectionId,
    ) -> EngineResult<()> {
        let (tsih, cid_wire, is_last) = {
            let sess = self
                .sessions
                .get(&session_id)
                .ok_or_else(|| LocalError::InvalidArgument(format!("unknown session {session_id}")))?;
            let conn = sess.connections.get(&connection_id).ok_or_else(|| {
                LocalError::InvalidArgument(format!(
                    "unknown connection {connection_id} in session {session_id}"
                ))
            })?;
            (sess.tsih, conn.cid_wire, sess.connections.len() == 1)
        };

        if is_last {
            return self.logout_session(session_id).await;
        }

        let status = self
            .pool
            .logout_connection_checked(tsih, cid_wire)
            .await
            .map_err(|e| LocalError::Io(std::io::Error::other(e.to_string())))?;

        if let Some(mut sess) = self.sessions.get_mut(&session_id) {
            sess.connections.remove(&connection_id);
        }
        self.connection_ids.release(connection_id.raw() as u64);

        Ok(((), Some(ProtocolStatus::Logout(status))))
    }
}

/// Not part of the spec's normative data model; tracked separately so a
/// pending AsyncEvent handler has an obvious place to plug in once full
/// (async message) support is built (§9 open question, left unimplemented).
#[allow(dead_code)]
const _ASYNC_EVENT_HOOK: Option<fn(&Connection)> = None;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session_config() -> SessionConfig {
        SessionConfig {
            error_recovery_level: 0,
            max_connections: 1,
            target_portal_group_tag: 1,
        }
    }

    #[test]
    fn session_id_sentinel_is_invalid() {
        assert!(!SessionId::INVALID.is_valid());
        assert!(SessionId::from_raw(7).is_valid());
    }

    #[test]
    fn connection_id_sentinel_is_invalid() {
        assert!(!ConnectionId::INVALID.is_valid());
        assert!(ConnectionId::from_raw(1).is_valid());
    }

    #[test]
    fn id_allocator_reuses_after_release() {
        let alloc: IdAllocator<SessionId> = IdAllocator::new();
        let a = alloc.alloc(10).unwrap();
        let b = alloc.alloc(10).unwrap();
        assert_ne!(a, b);
        alloc.release(a);
        let c = alloc.alloc(10).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn id_allocator_exhausts_at_max() {
        let alloc: IdAllocator<SessionId> = IdAllocator::new();
        assert_eq!(alloc.alloc(1), Some(1));
        assert_eq!(alloc.alloc(1), None);
    }

    #[test]
    fn leading_connection_is_lowest_id() {
        let sess = Session {
            session_id: SessionId::from_raw(1),
            tsih: 5,
            target: Target::new("iqn.2015-01.com.example:tgt0"),
            negotiated: sample_session_config(),
            target_portal_group_tag: 1,
            connections: BTreeMap::from([
                (
                    ConnectionId::from_raw(3),
                    Connection {
                        connection_id: ConnectionId::from_raw(3),
                        cid_wire: 3,
                        portal: Portal::new("10.0.0.1").build().unwrap(),
                        negotiated: ConnectionConfig {
                            header_digest: crate::cfg::enums::Digest::None,
                            data_digest: crate::cfg::enums::Digest::None,
                        },
                        state: ConnectionState::Active,
                        initial_exp_stat_sn: 0,
                    },
                ),
                (
                    ConnectionId::from_raw(1),
                    Connection {
                        connection_id: ConnectionId::from_raw(1),
                        cid_wire: 1,
                        portal: Portal::new("10.0.0.1").build().unwrap(),
                        negotiated: ConnectionConfig {
                            header_digest: crate::cfg::enums::Digest::None,
                            data_digest: crate::cfg::enums::Digest::None,
                        },
                        state: ConnectionState::Active,
                        initial_exp_stat_sn: 0,
                    },
                ),
            ]),
        };
        assert_eq!(sess.leading_connection().unwrap().connection_id.raw(), 1);
    }
}
