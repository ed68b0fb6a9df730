//! Membership proposal loop

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use placement_raft::Command;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::service::{MembershipChange, PlacementService};

impl PlacementService {
    /// Single consumer of the membership channel. Changes arriving within
    /// the batch window are coalesced per host, then proposed in order.
    pub(crate) async fn membership_loop(self: Arc<Self>, mut rx: mpsc::Receiver<MembershipChange>) {
        let max_batch = self.config.membership_channel_capacity;

        loop {
            let first = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                change = rx.recv() => match change {
                    Some(change) => change,
                    None => break,
                },
            };

            let mut batch = vec![first];
            let deadline = Instant::now() + self.config.membership_batch_window;
            while batch.len() < max_batch {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(Some(change)) => batch.push(change),
                    _ => break,
                }
            }

            for change in coalesce(batch) {
                self.propose(change).await;
            }
        }
        log::debug!("Membership loop stopped");
    }

    async fn propose(&self, change: MembershipChange) {
        if !self.has_leadership() {
            log::debug!("Dropping membership change for {}: not leader", change.host_name());
            return;
        }

        let seq = self.membership_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let command = match change {
            MembershipChange::Upsert(member) => Command::Upsert(member),
            MembershipChange::Remove(name) => Command::Remove(name),
        };
        let tag = command.tag();

        match self.executor.execute(command).await {
            Ok(resp) => {
                if resp.updated {
                    self.pending_changes.store(true, Ordering::Release);
                }
                log::debug!("Membership proposal #{} {:?} applied (updated={})", seq, tag, resp.updated);
            }
            Err(e) if e.is_retryable() => {
                log::warn!("Membership proposal #{} {:?} not applied, host will retry: {}", seq, tag, e);
            }
            Err(e) => {
                log::error!("Membership proposal #{} {:?} failed: {}", seq, tag, e);
            }
        }
    }
}

/// Keep only the latest change per host, in order of that change
pub(crate) fn coalesce(batch: Vec<MembershipChange>) -> Vec<MembershipChange> {
    if batch.len() < 2 {
        return batch;
    }
    let mut last_pos: HashMap<&str, usize> = HashMap::with_capacity(batch.len());
    for (i, change) in batch.iter().enumerate() {
        last_pos.insert(change.host_name(), i);
    }
    let keep: Vec<bool> = batch
        .iter()
        .enumerate()
        .map(|(i, c)| last_pos.get(c.host_name()) == Some(&i))
        .collect();

    batch
        .into_iter()
        .zip(keep)
        .filter_map(|(change, keep)| keep.then_some(change))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use placement_raft::Member;

    fn upsert(name: &str, entity: &str) -> MembershipChange {
        MembershipChange::Upsert(Member::new(name, "app", vec![entity.to_string()]))
    }

    #[test]
    fn test_coalesce_keeps_latest_per_host() {
        let batch = vec![
            upsert("a:1", "X"),
            upsert("b:1", "X"),
            upsert("a:1", "Y"),
            MembershipChange::Remove("b:1".to_string()),
        ];
        let out = coalesce(batch);
        assert_eq!(out, vec![upsert("a:1", "Y"), MembershipChange::Remove("b:1".to_string())]);
    }

    #[test]
    fn test_coalesce_remove_then_upsert() {
        let batch = vec![MembershipChange::Remove("a:1".to_string()), upsert("a:1", "X")];
        assert_eq!(coalesce(batch), vec![upsert("a:1", "X")]);
    }
}
