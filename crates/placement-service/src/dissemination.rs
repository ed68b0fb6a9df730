//! Table dissemination and faulty-host detection
//!
//! A rebalance is three broadcasts over the same set of streams:
//! `lock`, then `update` with freshly built tables after the drain grace,
//! then `unlock`. Per-stream channels are FIFO so the order holds on every
//! stream. The whole cycle shares one deadline just short of the next tick;
//! a stream that cannot take an order before it passes is dropped from the
//! pool and skipped for the remaining phases.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use placement_commons::proto::PlacementOrder;
use placement_raft::Command;
use tokio::time::MissedTickBehavior;

use crate::service::{MembershipChange, OrderSender, PlacementService};

impl PlacementService {
    pub(crate) async fn dissemination_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.dissemination_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.has_leadership() {
                self.disseminate_once().await;
            }
        }
        log::debug!("Dissemination loop stopped");
    }

    /// Run one dissemination tick. Returns the number of streams that
    /// completed the lock/update/unlock cycle.
    pub async fn disseminate_once(&self) -> usize {
        let fsm = self.fsm();
        let generation = fsm.table_generation();
        let pending = self.pending_changes.swap(false, Ordering::AcqRel);
        let changed = pending || generation != self.disseminated_generation.load(Ordering::Acquire);

        let targets: Vec<(u64, OrderSender)> = self
            .streams
            .read()
            .iter()
            .filter(|(_, conn)| changed || conn.needs_table)
            .map(|(id, conn)| (*id, conn.tx.clone()))
            .collect();

        if targets.is_empty() {
            if changed {
                self.disseminated_generation.store(generation, Ordering::Release);
            }
            return 0;
        }

        let deadline = Instant::now() + self.config.drain_grace + self.config.send_deadline();
        let mut failed = HashSet::new();
        self.broadcast(&targets, PlacementOrder::lock(), deadline, &mut failed).await;

        tokio::select! {
            _ = self.shutdown.cancelled() => return 0,
            _ = tokio::time::sleep(self.config.drain_grace) => {}
        }

        let tables = fsm.placement_tables();
        let built_generation = tables.version.parse::<u64>().unwrap_or(generation);
        self.broadcast(&targets, PlacementOrder::update(tables), deadline, &mut failed)
            .await;
        self.broadcast(&targets, PlacementOrder::unlock(), deadline, &mut failed).await;

        let delivered = {
            let mut streams = self.streams.write();
            for id in &failed {
                streams.remove(id);
            }
            let mut delivered = 0;
            for (id, _) in &targets {
                if let Some(conn) = streams.get_mut(id) {
                    conn.needs_table = false;
                    delivered += 1;
                }
            }
            delivered
        };
        self.disseminated_generation.store(built_generation, Ordering::Release);

        log::info!(
            "Disseminated placement table version {} to {} streams ({} dropped)",
            built_generation,
            delivered,
            failed.len()
        );

        if changed {
            if let Err(e) = self.executor.execute(Command::Disseminate).await {
                log::warn!("Failed to propose table dissemination marker: {}", e);
            }
        }
        delivered
    }

    async fn broadcast(
        &self,
        targets: &[(u64, OrderSender)],
        order: PlacementOrder,
        deadline: Instant,
        failed: &mut HashSet<u64>,
    ) {
        for (id, tx) in targets {
            if failed.contains(id) {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = tx.send_timeout(Ok(order.clone()), remaining).await {
                log::warn!("Stream {} did not accept {} order: {}", id, order.operation, e);
                failed.insert(*id);
            }
        }
    }

    pub(crate) async fn faulty_host_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.has_leadership() {
                self.sweep_faulty_hosts(Instant::now()).await;
            }
        }
        log::debug!("Faulty host loop stopped");
    }

    /// Remove members whose last heartbeat is older than the timeout.
    /// Members that never heartbeat to this leader are measured from the
    /// moment leadership was gained. Returns the removed host names.
    pub(crate) async fn sweep_faulty_hosts(&self, now: Instant) -> Vec<String> {
        let Some(since) = *self.leadership_since.lock() else {
            return Vec::new();
        };
        let timeout = self.config.faulty_host_timeout;

        let mut faulty = Vec::new();
        for member in self.fsm().members() {
            let last_seen = self
                .last_heartbeat
                .get(&member.name)
                .map(|entry| *entry.value())
                .unwrap_or(since);
            if now.saturating_duration_since(last_seen) > timeout {
                faulty.push(member.name);
            }
        }

        // Hosts without actor types never become members
        self.last_heartbeat
            .retain(|_, last| now.saturating_duration_since(*last) <= timeout);

        for name in &faulty {
            let closed = self.close_host_streams(name);
            log::warn!(
                "Host {} missed heartbeats for over {:?}; removing ({} streams closed)",
                name,
                timeout,
                closed
            );
            self.last_heartbeat.remove(name);
            self.queue_change(MembershipChange::Remove(name.clone())).await;
        }
        faulty
    }
}
