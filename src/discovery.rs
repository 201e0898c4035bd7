// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Discovery engine (§4.F): the "F" component. Opens a transient discovery
//! session against a portal, drives a `SendTargets=All` Text Request/Response
//! exchange, and folds the key/value results into a [`DiscoveryRecord`].

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, warn};

use crate::{
    cfg::enums::Digest,
    engine::session::{Auth, SessionId, SessionManager},
    errors::{EngineResult, LocalError},
    state_machine::text_states::TextCtx,
    values::{
        ConnectionConfig, DiscoveryRecord, Portal, SessionConfig, Target,
        UNSPECIFIED_TARGET_IQN,
    },
};

const SEND_TARGETS_ALL: &[u8] = b"SendTargets=All\0";

/// `query_portal_for_targets(portal, initiator_auth) -> DiscoveryRecord`
/// (§4.F). Creates a discovery session against `portal` using the
/// unspecified-target sentinel IQN, issues `SendTargets=All`, parses the
/// response into a [`DiscoveryRecord`], and logs out best-effort.
pub async fn query_portal_for_targets(
    session_manager: &SessionManager,
    portal: Portal,
    initiator_auth: Auth,
) -> EngineResult<DiscoveryRecord> {
    let sess_cfg = SessionConfig {
        error_recovery_level: 0,
        max_connections: 1,
        target_portal_group_tag: 1,
    };
    let conn_cfg = ConnectionConfig {
        header_digest: Digest::None,
        data_digest: Digest::None,
    };

    let (session_id, status) = session_manager
        .login_session(
            Target::new(UNSPECIFIED_TARGET_IQN),
            portal.clone(),
            initiator_auth,
            sess_cfg,
            conn_cfg,
        )
        .await?;

    let Some(session_id) = session_id else {
        return Ok((DiscoveryRecord::default(), status));
    };

    let send_targets_result = run_send_targets(session_manager, session_id).await;

    // §4.F step 6: logout the discovery session best-effort, ignoring errors.
    if let Err(e) = session_manager.logout_session(session_id).await {
        warn!(portal = %portal, error = %e, "discovery session logout failed (ignored)");
    }

    let mut record = send_targets_result
        .map_err(|e| LocalError::Io(std::io::Error::other(e.to_string())))?;
    record.fill_missing_tpgt_with_discovery_portal(&portal);

    Ok((record, status))
}

async fn run_send_targets(
    session_manager: &SessionManager,
    session_id: SessionId,
) -> Result<DiscoveryRecord> {
    let session = session_manager
        .session_snapshot(session_id)
        .ok_or_else(|| anyhow!("discovery session vanished before SendTargets exchange"))?;
    let tsih = session.tsih;
    let cid_wire = session
        .leading_connection()
        .ok_or_else(|| anyhow!("discovery session has no leading connection"))?
        .cid_wire;

    let exchange = session_manager
        .pool()
        .execute_with(tsih, cid_wire, move |conn, itt, cmd_sn, exp_stat_sn| {
            TextCtx::new(conn, itt, cmd_sn, exp_stat_sn, SEND_TARGETS_ALL.to_vec())
        })
        .await
        .context("SendTargets text exchange failed")?;

    parse_send_targets_response(&exchange.data)
}

/// Parses a `SendTargets=All` response body into a [`DiscoveryRecord`] (§4.F
/// step 4): each `TargetName=X` key opens a new target record; subsequent
/// `TargetAddress=<host>:<port>,<tpgt>` keys, up to the next `TargetName`,
/// attach a portal to that TPGT under target `X`.
fn parse_send_targets_response(data: &[u8]) -> Result<DiscoveryRecord> {
    let mut record = DiscoveryRecord::default();
    let mut current_target: Option<String> = None;

    for entry in data.split(|b| *b == 0) {
        if entry.is_empty() {
            continue;
        }
        let entry_str =
            std::str::from_utf8(entry).context("SendTargets response contains invalid UTF-8")?;
        let (key, value) = entry_str
            .split_once('=')
            .ok_or_else(|| anyhow!("SendTargets entry '{entry_str}' is missing '='"))?;

        match key {
            "TargetName" => {
                record.targets.entry(value.to_string()).or_default();
                current_target = Some(value.to_string());
            },
            "TargetAddress" => {
                let target = current_target
                    .as_ref()
                    .ok_or_else(|| anyhow!("TargetAddress before any TargetName"))?;
                let (addr_port, tpgt) = value
                    .rsplit_once(',')
                    .ok_or_else(|| anyhow!("TargetAddress '{value}' missing TPGT suffix"))?;
                let (address, port) = split_host_port(addr_port)?;
                let portal = Portal::new(address).port(port).build()?;
                record.insert_portal(target, tpgt, portal);
            },
            _ => debug!(key, value, "ignoring unrecognized SendTargets key"),
        }
    }

    Ok(record)
}

/// Splits `host:port` by searching for the colon backwards, since an IPv6
/// literal host itself contains colons (§4.F step 4).
fn split_host_port(s: &str) -> Result<(String, String)> {
    let idx = s
        .rfind(':')
        .ok_or_else(|| anyhow!("TargetAddress '{s}' has no port separator"))?;
    let (host, port) = s.split_at(idx);
    let port = &port[1..];
    if host.is_empty() || port.is_empty() {
        bail!("TargetAddress '{s}' has an empty host or port");
    }
    Ok((host.to_string(), port.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_target_single_portal() {
        let data =
            b"TargetName=iqn.2015-01.com.example:tgt0\0TargetAddress=192.168.1.115:3260,1\0";
        let record = parse_send_targets_response(data).unwrap();

        let groups = &record.targets["iqn.2015-01.com.example:tgt0"];
        assert_eq!(groups.len(), 1);
        let portals = &groups["1"];
        assert_eq!(portals.len(), 1);
        assert_eq!(portals[0].address, "192.168.1.115");
        assert_eq!(portals[0].port, "3260");
    }

    #[test]
    fn parses_multiple_portals_for_one_target() {
        let data = b"TargetName=iqn.example:multi\0\
                      TargetAddress=10.0.0.1:3260,1\0\
                      TargetAddress=10.0.0.2:3260,2\0";
        let record = parse_send_targets_response(data).unwrap();
        let groups = &record.targets["iqn.example:multi"];
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["1"][0].address, "10.0.0.1");
        assert_eq!(groups["2"][0].address, "10.0.0.2");
    }

    #[test]
    fn parses_ipv6_literal_target_address() {
        let data = b"TargetName=iqn.2015-01.com.example:tgt1\0TargetAddress=[fe80::1]:3260,2\0";
        let record = parse_send_targets_response(data).unwrap();

        let portals = &record.targets["iqn.2015-01.com.example:tgt1"]["2"];
        assert_eq!(portals[0].address, "[fe80::1]");
        assert_eq!(portals[0].port, "3260");
    }

    #[test]
    fn bare_target_with_no_portals_gets_default_tpgt_after_fill() {
        let data = b"TargetName=iqn.example:bare\0";
        let mut record = parse_send_targets_response(data).unwrap();
        assert!(record.targets["iqn.example:bare"].is_empty());

        let portal = Portal::new("10.0.0.1").build().unwrap();
        record.fill_missing_tpgt_with_discovery_portal(&portal);
        assert_eq!(record.targets["iqn.example:bare"]["0"][0], portal);
    }

    #[test]
    fn target_address_without_tpgt_is_rejected() {
        let data = b"TargetName=iqn.example:bad\0TargetAddress=10.0.0.1:3260\0";
        assert!(parse_send_targets_response(data).is_err());
    }
}
