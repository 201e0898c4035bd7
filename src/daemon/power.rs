// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! System power-event handling (§4.H): on a sleep notification, every
//! active session's target media is handed to the external disk-arbitration
//! collaborator for unmount, then its connections are quiesced so in-flight
//! I/O drains before the OS suspends. Volume mounting/unmounting and disk
//! arbitration are themselves out of scope as *products* (§1) —
//! `DiskArbitration` is just the trait boundary the core calls across, the
//! same pattern `store.rs` uses for the config/secret stores.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tracing::{info, warn};

use crate::engine::session::SessionManager;

/// External collaborator that unmounts a target's block device ahead of
/// quiescing or tearing down its iSCSI session. No real disk-arbitration
/// integration exists in this environment, so the default is a no-op; a
/// host wiring this crate into an OS supplies its own.
pub trait DiskArbitration: Send + Sync {
    fn request_unmount(&self, target_iqn: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopDiskArbitration;

impl DiskArbitration for NoopDiskArbitration {
    fn request_unmount(&self, _target_iqn: &str) -> Result<()> {
        Ok(())
    }
}

/// Upper bound on how long one connection's drain is waited out before
/// sleep preparation moves on regardless — §4.H requires quiescing be
/// *attempted*, not that sleep block indefinitely on a wedged target.
const QUIESCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the sleep-notification half of §4.H: request unmount then quiesce
/// every connection of every active, non-discovery session. Wake-side
/// recovery is an open question (§9); see DESIGN.md for why it stays
/// unimplemented.
pub async fn prepare_for_sleep(
    session_manager: &Arc<SessionManager>,
    arbitration: &dyn DiskArbitration,
) {
    let pool = session_manager.pool().clone();

    for session_id in session_manager.session_ids() {
        let Some(sess) = session_manager.session_snapshot(session_id) else {
            continue;
        };
        if sess.target.is_discovery_sentinel() {
            continue;
        }

        if let Err(e) = arbitration.request_unmount(&sess.target.iqn) {
            warn!(
                target = %sess.target.iqn,
                error = %e,
                "disk arbitration unmount request failed, quiescing anyway"
            );
        }

        let Some(pool_session) = pool.sessions.get(&sess.tsih) else {
            continue;
        };
        for conn in pool_session.conns.iter() {
            match conn.conn.graceful_quiesce(QUIESCE_TIMEOUT).await {
                Ok(()) => info!(
                    target = %sess.target.iqn,
                    cid = *conn.key(),
                    "connection quiesced for sleep"
                ),
                Err(e) => warn!(
                    target = %sess.target.iqn,
                    cid = *conn.key(),
                    error = %e,
                    "connection failed to quiesce before sleep"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_arbitration_always_succeeds() {
        let arb = NoopDiskArbitration;
        assert!(arb.request_unmount("iqn.2015-01.com.example:tgt0").is_ok());
    }
}
