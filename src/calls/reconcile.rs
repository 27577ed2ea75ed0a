//! Periodic repair of drift between intended and actual room/bridge state.
//!
//! Transitions proceed optimistically; membership confirmation from the
//! fabric is eventually consistent. This sweep walks the registry on a
//! seconds-scale interval and repairs what drifted: missing room
//! attachments get credentials reissued and bridges reattached, orphaned
//! bridges are torn down, stale screener guards are pruned. Repairs are
//! logged; only N consecutive failures on the same room escalate to an
//! operator alert.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::machine::CallDirector;
use crate::fabric::ConferencingFabric;
use crate::rooms::RoomManager;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Consecutive failed repairs on one room before the operator alert.
    pub alert_after_failures: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            alert_after_failures: 3,
        }
    }
}

pub struct Reconciler {
    director: Arc<CallDirector>,
    rooms: Arc<RoomManager>,
    fabric: Arc<dyn ConferencingFabric>,
    config: ReconcilerConfig,
    /// Consecutive failed repairs per room.
    failures: HashMap<String, u32>,
}

impl Reconciler {
    pub fn new(
        director: Arc<CallDirector>,
        rooms: Arc<RoomManager>,
        fabric: Arc<dyn ConferencingFabric>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            director,
            rooms,
            fabric,
            config,
            failures: HashMap::new(),
        }
    }

    /// Run the sweep forever at the configured interval.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Reconciliation sweep started ({:?} interval)", self.config.interval);

        loop {
            interval.tick().await;
            self.reconcile_once().await;
        }
    }

    /// One full pass. Exposed so tests can drive repairs deterministically.
    pub async fn reconcile_once(&mut self) {
        self.director.prune_screening_guards().await;

        let participants = self.director.participants_snapshot().await;

        // Orphaned bridges: a bridge whose participant is terminal or gone
        // is partial-teardown debris and self-heals here.
        let live_ids: Vec<uuid::Uuid> = participants
            .iter()
            .filter(|p| !p.is_terminal())
            .map(|p| p.id)
            .collect();

        for bridge_id in self.director.bridge_ids().await {
            if !live_ids.contains(&bridge_id) {
                warn!("Tearing down orphaned bridge for {}", bridge_id);
                if let Some(bridge) = self.director.remove_bridge(bridge_id).await {
                    bridge.shutdown().await;
                }
            }
        }

        // Drift between intended and actual room attachment.
        for p in participants.iter().filter(|p| !p.is_terminal()) {
            let Some(room) = p.room.clone() else { continue };
            let identity = p.identity();

            let attached = match self.fabric.members(&room).await {
                Ok(members) => members.contains(&identity),
                Err(e) => {
                    debug!("Room {} unreachable during sweep: {}", room, e);
                    false
                }
            };

            if attached {
                self.failures.remove(&room);
                continue;
            }

            match self.repair(&room, &identity, p.id).await {
                Ok(()) => {
                    info!("Repaired room attachment: {} -> {}", identity, room);
                    self.failures.remove(&room);
                }
                Err(e) => {
                    let count = self.failures.entry(room.clone()).or_insert(0);
                    *count += 1;
                    warn!(
                        "Repair of {} in {} failed ({} consecutive): {}",
                        identity, room, count, e
                    );
                    if *count >= self.config.alert_after_failures {
                        error!(
                            "operator alert: room {} has failed {} consecutive repairs",
                            room, count
                        );
                    }
                }
            }
        }
    }

    async fn repair(&self, room: &str, identity: &str, id: uuid::Uuid) -> anyhow::Result<()> {
        // Existence first, then a fresh credential, then the bridge attach.
        self.fabric.ensure_room(room).await?;

        if self.rooms.room(room).await.is_some() {
            self.rooms
                .issue_token(room, identity, &["publish".to_string(), "subscribe".to_string()])
                .await?;
        }

        if let Some(bridge) = self.director.bridge(id).await {
            bridge.ensure_attached().await?;
        }
        Ok(())
    }

    pub fn failure_count(&self, room: &str) -> u32 {
        self.failures.get(room).copied().unwrap_or(0)
    }
}
