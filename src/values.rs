// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed value model (§4.I): `Portal`, `Target`, `Auth`, `SessionConfig`,
//! `ConnectionConfig`, `DiscoveryRecord`. Each type has an immutable form, a
//! mutable builder, and a length-prefixed byte encoding used as the payload
//! format between `iscsictl` and `iscsid` (§4.G, §6).
//!
//! The byte form is a small self-describing TLV, not `serde_json`/`bincode`:
//! the client socket protocol is an external wire format with an exact byte
//! layout (§6), the same reasoning that keeps the BHS codec in
//! `models/data_fromat.rs` hand-rolled rather than serde-derived.

use std::{collections::BTreeMap, fmt};

use anyhow::{Context, Result, bail, ensure};

/// Default iSCSI TCP port (§6).
pub const DEFAULT_PORT: &str = "3260";
/// Sentinel meaning "any local interface" (§6).
pub const DEFAULT_HOST_INTERFACE: &str = "default";
/// Sentinel IQN marking a discovery target (§3).
pub const UNSPECIFIED_TARGET_IQN: &str = "";

fn put_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn take_str<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a str> {
    ensure!(buf.len() >= *pos + 4, "truncated length prefix");
    let len =
        u32::from_be_bytes(buf[*pos..*pos + 4].try_into().expect("4 bytes")) as usize;
    *pos += 4;
    ensure!(buf.len() >= *pos + len, "truncated string payload");
    let s = std::str::from_utf8(&buf[*pos..*pos + len]).context("non-UTF8 string")?;
    *pos += len;
    Ok(s)
}

/// `(network address, TCP port)` reachable endpoint of a target, plus the
/// local interface to originate from (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portal {
    pub address: String,
    pub port: String,
    pub host_interface: String,
}

impl Portal {
    pub fn new(address: impl Into<String>) -> PortalBuilder {
        PortalBuilder {
            address: address.into(),
            port: DEFAULT_PORT.to_string(),
            host_interface: DEFAULT_HOST_INTERFACE.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_str(&mut out, &self.address);
        put_str(&mut out, &self.port);
        put_str(&mut out, &self.host_interface);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let address = take_str(buf, &mut pos)?.to_string();
        let port = take_str(buf, &mut pos)?.to_string();
        let host_interface = take_str(buf, &mut pos)?.to_string();
        ensure!(pos == buf.len(), "trailing bytes after Portal payload");
        ensure!(!address.is_empty(), "Portal address must not be empty");
        Ok(Self {
            address,
            port,
            host_interface,
        })
    }
}

impl fmt::Display for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct PortalBuilder {
    address: String,
    port: String,
    host_interface: String,
}

impl PortalBuilder {
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    pub fn host_interface(mut self, iface: impl Into<String>) -> Self {
        self.host_interface = iface.into();
        self
    }

    pub fn build(self) -> Result<Portal> {
        ensure!(!self.address.is_empty(), "Portal address must not be empty");
        ensure!(!self.port.is_empty(), "Portal port must not be empty");
        Ok(Portal {
            address: self.address,
            port: self.port,
            host_interface: self.host_interface,
        })
    }
}

/// A named collection of logical units, identified by IQN (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub iqn: String,
}

impl Target {
    pub fn new(iqn: impl Into<String>) -> Self {
        Self { iqn: iqn.into() }
    }

    pub fn is_discovery_sentinel(&self) -> bool {
        self.iqn == UNSPECIFIED_TARGET_IQN
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_str(&mut out, &self.iqn);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let iqn = take_str(buf, &mut pos)?.to_string();
        ensure!(pos == buf.len(), "trailing bytes after Target payload");
        Ok(Self { iqn })
    }
}

/// Authentication configuration for a login attempt (§3, §4.C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Chap {
        target_name: String,
        target_secret: String,
        initiator_name: Option<String>,
        initiator_secret: Option<String>,
    },
}

impl Auth {
    /// Mutual CHAP is requested iff both initiator-side credentials are
    /// present (§4.C).
    pub fn wants_mutual(&self) -> bool {
        matches!(
            self,
            Auth::Chap {
                initiator_name: Some(_),
                initiator_secret: Some(_),
                ..
            }
        )
    }

    const TAG_NONE: u8 = 0;
    const TAG_CHAP: u8 = 1;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Auth::None => out.push(Self::TAG_NONE),
            Auth::Chap {
                target_name,
                target_secret,
                initiator_name,
                initiator_secret,
            } => {
                out.push(Self::TAG_CHAP);
                put_str(&mut out, target_name);
                put_str(&mut out, target_secret);
                put_str(&mut out, initiator_name.as_deref().unwrap_or(""));
                put_str(&mut out, initiator_secret.as_deref().unwrap_or(""));
            },
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure!(!buf.is_empty(), "empty Auth payload");
        match buf[0] {
            Self::TAG_NONE => Ok(Auth::None),
            Self::TAG_CHAP => {
                let mut pos = 1usize;
                let target_name = take_str(buf, &mut pos)?.to_string();
                let target_secret = take_str(buf, &mut pos)?.to_string();
                let initiator_name = take_str(buf, &mut pos)?.to_string();
                let initiator_secret = take_str(buf, &mut pos)?.to_string();
                ensure!(pos == buf.len(), "trailing bytes after Auth payload");
                Ok(Auth::Chap {
                    target_name,
                    target_secret,
                    initiator_name: (!initiator_name.is_empty()).then_some(initiator_name),
                    initiator_secret: (!initiator_secret.is_empty())
                        .then_some(initiator_secret),
                })
            },
            other => bail!("unknown Auth tag {other}"),
        }
    }
}

/// Session-wide negotiated/requested parameters (§3, §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub error_recovery_level: u8,
    pub max_connections: u16,
    pub target_portal_group_tag: u16,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.error_recovery_level <= 2,
            "ErrorRecoveryLevel out of range [0,2]"
        );
        ensure!(
            (1..=65535).contains(&self.max_connections),
            "MaxConnections out of range [1,65535]"
        );
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.push(self.error_recovery_level);
        out.extend_from_slice(&self.max_connections.to_be_bytes());
        out.extend_from_slice(&self.target_portal_group_tag.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() == 5, "SessionConfig payload must be 5 bytes");
        let cfg = Self {
            error_recovery_level: buf[0],
            max_connections: u16::from_be_bytes([buf[1], buf[2]]),
            target_portal_group_tag: u16::from_be_bytes([buf[3], buf[4]]),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Connection-wide negotiated/requested parameters (§3, §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub header_digest: crate::cfg::enums::Digest,
    pub data_digest: crate::cfg::enums::Digest,
}

impl ConnectionConfig {
    pub fn encode(&self) -> Vec<u8> {
        let tag = |d: crate::cfg::enums::Digest| match d {
            crate::cfg::enums::Digest::None => 0u8,
            crate::cfg::enums::Digest::CRC32C => 1u8,
        };
        vec![tag(self.header_digest), tag(self.data_digest)]
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() == 2, "ConnectionConfig payload must be 2 bytes");
        let from_tag = |b: u8| -> Result<crate::cfg::enums::Digest> {
            match b {
                0 => Ok(crate::cfg::enums::Digest::None),
                1 => Ok(crate::cfg::enums::Digest::CRC32C),
                other => bail!("unknown digest tag {other}"),
            }
        };
        Ok(Self {
            header_digest: from_tag(buf[0])?,
            data_digest: from_tag(buf[1])?,
        })
    }
}

/// Mapping from target IQN to mapping from TPGT to an ordered list of
/// portals (§3, §4.F).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub targets: BTreeMap<String, BTreeMap<String, Vec<Portal>>>,
}

impl DiscoveryRecord {
    pub fn insert_portal(&mut self, target_iqn: &str, tpgt: &str, portal: Portal) {
        self.targets
            .entry(target_iqn.to_string())
            .or_default()
            .entry(tpgt.to_string())
            .or_default()
            .push(portal);
    }

    /// §4.E's discovery TPGT default: a target with no recorded portal
    /// groups gets TPGT "0" pointing back at the discovery portal itself.
    pub fn fill_missing_tpgt_with_discovery_portal(&mut self, discovery_portal: &Portal) {
        for groups in self.targets.values_mut() {
            if groups.is_empty() {
                groups
                    .entry("0".to_string())
                    .or_default()
                    .push(discovery_portal.clone());
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.targets.len() as u32).to_be_bytes());
        for (iqn, groups) in &self.targets {
            put_str(&mut out, iqn);
            out.extend_from_slice(&(groups.len() as u32).to_be_bytes());
            for (tpgt, portals) in groups {
                put_str(&mut out, tpgt);
                out.extend_from_slice(&(portals.len() as u32).to_be_bytes());
                for p in portals {
                    let enc = p.encode();
                    out.extend_from_slice(&(enc.len() as u32).to_be_bytes());
                    out.extend_from_slice(&enc);
                }
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let read_u32 = |buf: &[u8], pos: &mut usize| -> Result<u32> {
            ensure!(buf.len() >= *pos + 4, "truncated u32");
            let v = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().expect("4 bytes"));
            *pos += 4;
            Ok(v)
        };

        let mut record = DiscoveryRecord::default();
        let n_targets = read_u32(buf, &mut pos)?;
        for _ in 0..n_targets {
            let iqn = take_str(buf, &mut pos)?.to_string();
            let n_groups = read_u32(buf, &mut pos)?;
            let mut groups = BTreeMap::new();
            for _ in 0..n_groups {
                let tpgt = take_str(buf, &mut pos)?.to_string();
                let n_portals = read_u32(buf, &mut pos)?;
                let mut portals = Vec::with_capacity(n_portals as usize);
                for _ in 0..n_portals {
                    let len = read_u32(buf, &mut pos)? as usize;
                    ensure!(buf.len() >= pos + len, "truncated Portal payload");
                    portals.push(Portal::decode(&buf[pos..pos + len])?);
                    pos += len;
                }
                groups.insert(tpgt, portals);
            }
            record.targets.insert(iqn, groups);
        }
        ensure!(pos == buf.len(), "trailing bytes after DiscoveryRecord");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_round_trips() {
        let p = Portal::new("192.168.1.115")
            .port("3260")
            .host_interface("en0")
            .build()
            .unwrap();
        assert_eq!(Portal::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn target_round_trips() {
        let t = Target::new("iqn.2015-01.com.example:tgt0");
        assert_eq!(Target::decode(&t.encode()).unwrap(), t);
    }

    #[test]
    fn auth_chap_round_trips_with_and_without_mutual() {
        let a = Auth::Chap {
            target_name: "alice".into(),
            target_secret: "pw12345678".into(),
            initiator_name: None,
            initiator_secret: None,
        };
        assert_eq!(Auth::decode(&a.encode()).unwrap(), a);
        assert!(!a.wants_mutual());

        let mutual = Auth::Chap {
            target_name: "tgt".into(),
            target_secret: "s1".into(),
            initiator_name: Some("ini".into()),
            initiator_secret: Some("s2".into()),
        };
        assert_eq!(Auth::decode(&mutual.encode()).unwrap(), mutual);
        assert!(mutual.wants_mutual());
    }

    #[test]
    fn session_config_rejects_out_of_range_max_connections() {
        let bad = SessionConfig {
            error_recovery_level: 0,
            max_connections: 0,
            target_portal_group_tag: 1,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn discovery_record_round_trips_and_fills_default_tpgt() {
        let mut rec = DiscoveryRecord::default();
        rec.insert_portal(
            "iqn.2015-01.com.example:tgt0",
            "1",
            Portal::new("192.168.1.115").build().unwrap(),
        );
        rec.targets.insert("iqn.example:bare".to_string(), BTreeMap::new());
        let discovery_portal = Portal::new("10.0.0.1").build().unwrap();
        rec.fill_missing_tpgt_with_discovery_portal(&discovery_portal);

        assert_eq!(rec.targets["iqn.example:bare"]["0"][0], discovery_portal);

        let decoded = DiscoveryRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded, rec);
    }
}
