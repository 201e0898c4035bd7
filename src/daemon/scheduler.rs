// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Background rediscovery (§4.H): periodically re-runs `SendTargets=All`
//! against every enabled discovery portal in the config store and
//! reconciles the result into the target table, so `auto_login` targets
//! stay in sync without the CLI polling for them.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::enums::Digest,
    discovery::query_portal_for_targets,
    engine::session::{Auth, SessionManager},
    store::{ConfigStore, PortalRecord, TargetConfigType, TargetRecord},
    values::{DiscoveryRecord, Portal},
};

/// How often the scheduler wakes up to check whether any portal's own
/// `interval_seconds` has elapsed. Portals are not polled faster than this,
/// regardless of a shorter configured interval.
const TICK: Duration = Duration::from_secs(5);

/// Drives periodic `SendTargets` rediscovery across the configured portals.
pub struct Scheduler {
    session_manager: Arc<SessionManager>,
    config_store: Arc<dyn ConfigStore>,
    trigger: Arc<Notify>,
    /// Guards against a manual `UpdateDiscovery` trigger overlapping a tick
    /// already in flight; a held lock means "a tick is running right now".
    busy: Arc<Mutex<()>>,
    last_run: DashMap<String, Instant>,
}

impl Scheduler {
    pub fn new(
        session_manager: Arc<SessionManager>,
        config_store: Arc<dyn ConfigStore>,
        trigger: Arc<Notify>,
    ) -> Self {
        Self {
            session_manager,
            config_store,
            trigger,
            busy: Arc::new(Mutex::new(())),
            last_run: DashMap::new(),
        }
    }

    /// Runs until `shutdown` is cancelled. Intended to be spawned as its own
    /// task alongside the request router's accept loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("discovery scheduler stopping");
                    return;
                },
                _ = self.trigger.notified() => {
                    debug!("discovery scheduler woken by UpdateDiscovery");
                },
                _ = tokio::time::sleep(TICK) => {},
            }

            let Ok(_guard) = self.busy.clone().try_lock_owned() else {
                warn!("discovery tick skipped: previous tick still running");
                continue;
            };
            self.tick_once().await;
        }
    }

    async fn tick_once(&self) {
        let portals = match self.config_store.discovery_portals() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to read discovery portals from config store");
                return;
            },
        };

        for record in portals.into_iter().filter(|p| p.enabled) {
            let key = format!("{}:{}", record.address, record.port);
            let due = self
                .last_run
                .get(&key)
                .map(|t| t.elapsed() >= Duration::from_secs(record.interval_seconds))
                .unwrap_or(true);
            if !due {
                continue;
            }
            self.last_run.insert(key.clone(), Instant::now());

            let portal = match Portal::new(record.address.clone())
                .port(record.port.clone())
                .host_interface(record.host_interface.clone())
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    warn!(portal = %key, error = %e, "invalid discovery portal configuration");
                    continue;
                },
            };

            match query_portal_for_targets(&self.session_manager, portal, Auth::None).await {
                Ok((discovered, status)) => {
                    info!(portal = %key, targets = discovered.targets.len(), ?status, "discovery tick complete");
                    self.reconcile(&discovered);
                },
                Err(e) => warn!(portal = %key, error = %e, "discovery tick failed"),
            }
        }
    }

    /// Folds a freshly discovered target set into the config store (§4.H):
    /// new targets are added as `DynamicSendTargets`, previously-dynamic
    /// targets no longer reported are removed, and a target already present
    /// as `Static` is left untouched (with a warning, since the two
    /// provenances disagree about whether it should survive a logout).
    fn reconcile(&self, discovered: &DiscoveryRecord) {
        let seen: std::collections::HashSet<&str> =
            discovered.targets.keys().map(String::as_str).collect();

        let existing = match self.config_store.all_targets() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to read existing targets from config store");
                return;
            },
        };

        for (iqn, existing_record) in &existing {
            if existing_record.config_type == TargetConfigType::DynamicSendTargets
                && !seen.contains(iqn.as_str())
            {
                if let Err(e) = self.config_store.remove_target(iqn) {
                    warn!(target = %iqn, error = %e, "failed to remove stale dynamic target");
                } else {
                    debug!(target = %iqn, "removed dynamic target no longer reported by discovery");
                }
            }
        }

        for iqn in &seen {
            match self.config_store.target(iqn) {
                Ok(Some(existing_record)) if existing_record.config_type == TargetConfigType::Static => {
                    warn!(target = %iqn, "discovered target collides with a statically configured one, skipping");
                },
                Ok(_) => {
                    let portals = discovered
                        .targets
                        .get(iqn.as_str())
                        .map(|groups| {
                            groups
                                .values()
                                .flatten()
                                .map(|p| PortalRecord {
                                    address: p.address.clone(),
                                    port: p.port.clone(),
                                    host_interface: p.host_interface.clone(),
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    let record = TargetRecord {
                        max_connections: 1,
                        error_recovery_level: 0,
                        header_digest: Digest::None,
                        data_digest: Digest::None,
                        auth_method: "None".to_string(),
                        auto_login: true,
                        config_type: TargetConfigType::DynamicSendTargets,
                        portals,
                    };
                    if let Err(e) = self.config_store.upsert_target(iqn, record) {
                        warn!(target = %iqn, error = %e, "failed to upsert discovered target");
                    }
                },
                Err(e) => warn!(target = %iqn, error = %e, "failed to read target from config store"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct FakeStore {
        portals: Vec<crate::store::DiscoveryPortalRecord>,
        targets: std::sync::Mutex<HashMap<String, TargetRecord>>,
    }

    impl ConfigStore for FakeStore {
        fn initiator_iqn(&self) -> anyhow::Result<String> {
            Ok("iqn.initiator".to_string())
        }

        fn initiator_alias(&self) -> anyhow::Result<String> {
            Ok(String::new())
        }

        fn target(&self, iqn: &str) -> anyhow::Result<Option<TargetRecord>> {
            Ok(self.targets.lock().unwrap().get(iqn).cloned())
        }

        fn upsert_target(&self, iqn: &str, record: TargetRecord) -> anyhow::Result<()> {
            self.targets.lock().unwrap().insert(iqn.to_string(), record);
            Ok(())
        }

        fn remove_target(&self, iqn: &str) -> anyhow::Result<()> {
            self.targets.lock().unwrap().remove(iqn);
            Ok(())
        }

        fn all_targets(&self) -> anyhow::Result<Vec<(String, TargetRecord)>> {
            Ok(self
                .targets
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }

        fn discovery_portals(&self) -> anyhow::Result<Vec<crate::store::DiscoveryPortalRecord>> {
            Ok(self.portals.clone())
        }

        fn synchronize(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn dynamic_record() -> TargetRecord {
        TargetRecord {
            max_connections: 1,
            error_recovery_level: 0,
            header_digest: Digest::None,
            data_digest: Digest::None,
            auth_method: "None".to_string(),
            auto_login: true,
            config_type: TargetConfigType::DynamicSendTargets,
            portals: Vec::new(),
        }
    }

    fn static_record() -> TargetRecord {
        TargetRecord {
            config_type: TargetConfigType::Static,
            ..dynamic_record()
        }
    }

    fn sample_config() -> crate::cfg::config::Config {
        use std::time::Duration;

        use crate::cfg::{
            config::{
                Config, Extensions, Flow, Identity, Integrity, Limits, LoginConfig, Ordering,
                Recovery, RuntimeConfig, Timers, TransportHints, WriteFlow,
            },
            config::AuthConfig,
            enums::{Digest, SessionType, YesNo},
        };

        Config {
            login: LoginConfig {
                identity: Identity {
                    session_type: SessionType::Discovery,
                    initiator_name: "iqn.test.initiator".to_string(),
                    initiator_alias: String::new(),
                    target_name: String::new(),
                    is_x86: YesNo::Yes,
                },
                auth: AuthConfig::None,
                integrity: Integrity {
                    header_digest: Digest::None,
                    data_digest: Digest::None,
                },
                flow: Flow {
                    max_recv_data_segment_length: 8192,
                    max_burst_length: 262144,
                    first_burst_length: 65536,
                },
                write_flow: WriteFlow {
                    initial_r2t: YesNo::Yes,
                    immediate_data: YesNo::Yes,
                    max_outstanding_r2t: 1,
                },
                ordering: Ordering {
                    data_pdu_in_order: YesNo::Yes,
                    data_sequence_in_order: YesNo::Yes,
                },
                recovery: Recovery { error_recovery_level: 0 },
                timers: Timers {
                    default_time2wait: Duration::from_secs(2),
                    default_time2retain: Duration::from_secs(20),
                },
                limits: Limits { max_connections: 1 },
                extensions: Extensions {
                    task_reporting: None,
                    iscsi_protocol_level: None,
                    custom: Default::default(),
                },
                transport: TransportHints::default(),
            },
            runtime: RuntimeConfig {
                max_sessions: 1,
                timeout_connection: Duration::from_secs(5),
            },
        }
    }

    fn scheduler_with_store(store: FakeStore) -> (Scheduler, Arc<SessionManager>) {
        let session_manager = SessionManager::new(sample_config());
        let scheduler = Scheduler::new(
            session_manager.clone(),
            Arc::new(store),
            Arc::new(Notify::new()),
        );
        (scheduler, session_manager)
    }

    #[test]
    fn reconcile_removes_stale_dynamic_target_not_in_discovery() {
        let mut targets = HashMap::new();
        targets.insert("iqn.stale".to_string(), dynamic_record());
        let (scheduler, _sm) = scheduler_with_store(FakeStore {
            portals: Vec::new(),
            targets: std::sync::Mutex::new(targets),
        });

        scheduler.reconcile(&DiscoveryRecord::default());

        assert!(scheduler.config_store.target("iqn.stale").unwrap().is_none());
    }

    #[test]
    fn reconcile_skips_discovered_target_that_collides_with_static() {
        let mut targets = HashMap::new();
        targets.insert("iqn.fixed".to_string(), static_record());
        let (scheduler, _sm) = scheduler_with_store(FakeStore {
            portals: Vec::new(),
            targets: std::sync::Mutex::new(targets),
        });

        let mut discovered = DiscoveryRecord::default();
        discovered.insert_portal(
            "iqn.fixed",
            "1",
            Portal::new("10.0.0.1").build().unwrap(),
        );
        scheduler.reconcile(&discovered);

        let rec = scheduler.config_store.target("iqn.fixed").unwrap().unwrap();
        assert_eq!(rec.config_type, TargetConfigType::Static);
    }

    #[test]
    fn reconcile_adds_newly_discovered_target_as_dynamic() {
        let (scheduler, _sm) = scheduler_with_store(FakeStore {
            portals: Vec::new(),
            targets: std::sync::Mutex::new(HashMap::new()),
        });

        let mut discovered = DiscoveryRecord::default();
        discovered.insert_portal(
            "iqn.new",
            "1",
            Portal::new("10.0.0.2").build().unwrap(),
        );
        scheduler.reconcile(&discovered);

        let rec = scheduler.config_store.target("iqn.new").unwrap().unwrap();
        assert_eq!(rec.config_type, TargetConfigType::DynamicSendTargets);
    }
}
