//! Actors activated on this host, drained when the table moves them away

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;

use placement_client::{ActorPlacement, PlacementClientConfig};

use crate::actor::Actor;
use crate::lock::DEFAULT_MAX_STACK_DEPTH;

/// `(actor type, actor id)`
pub type ActorKey = (String, String);

/// Where an actor lives according to the installed placement table
pub trait PlacementLookup: Send + Sync {
    /// `(host name, app id)`, or `None` if the type has no hosts
    fn resolve(&self, actor_type: &str, actor_id: &str) -> Option<(String, String)>;
}

impl PlacementLookup for ActorPlacement {
    fn resolve(&self, actor_type: &str, actor_id: &str) -> Option<(String, String)> {
        ActorPlacement::resolve(self, actor_type, actor_id)
    }
}

#[derive(Debug)]
pub struct ActiveActors {
    host_name: String,
    max_stack_depth: u32,
    drain_timeout: Duration,
    actors: DashMap<ActorKey, Arc<Actor>>,
}

impl ActiveActors {
    pub fn new(host_name: impl Into<String>, drain_timeout: Duration) -> Self {
        Self {
            host_name: host_name.into(),
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            drain_timeout,
            actors: DashMap::new(),
        }
    }

    pub fn with_max_stack_depth(mut self, depth: u32) -> Self {
        self.max_stack_depth = depth;
        self
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn get(&self, actor_type: &str, actor_id: &str) -> Option<Arc<Actor>> {
        self.actors
            .get(&(actor_type.to_string(), actor_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Activate on first use. A disposed actor is replaced by a fresh one.
    pub fn get_or_create(&self, actor_type: &str, actor_id: &str) -> Arc<Actor> {
        let key = (actor_type.to_string(), actor_id.to_string());
        let mut entry = self.actors.entry(key).or_insert_with(|| {
            Arc::new(Actor::new(actor_type, actor_id, self.max_stack_depth))
        });
        if entry.is_disposed() {
            *entry = Arc::new(Actor::new(actor_type, actor_id, self.max_stack_depth));
        }
        entry.value().clone()
    }

    /// Drain and deactivate every actor the table no longer places here.
    /// Returns the deactivated keys.
    pub async fn drain_rebalanced(&self, lookup: &dyn PlacementLookup) -> Vec<ActorKey> {
        let moved: Vec<ActorKey> = self
            .actors
            .iter()
            .filter(|entry| {
                let (actor_type, actor_id) = entry.key();
                match lookup.resolve(actor_type, actor_id) {
                    Some((host, _)) => host != self.host_name,
                    None => true,
                }
            })
            .map(|entry| entry.key().clone())
            .collect();

        let drained: Vec<(ActorKey, Arc<Actor>)> = moved
            .into_iter()
            .filter_map(|key| self.actors.remove(&key))
            .collect();
        if drained.is_empty() {
            return Vec::new();
        }

        log::info!("Draining {} actors moved off {}", drained.len(), self.host_name);
        let timeout = self.drain_timeout;
        join_all(drained.iter().map(|(_, actor)| actor.drain(timeout))).await;
        drained.into_iter().map(|(key, _)| key).collect()
    }
}

/// Build a placement client whose table updates drain rebalanced actors
pub fn placement_with_rebalancing(
    config: PlacementClientConfig,
    actors: Arc<ActiveActors>,
) -> Arc<ActorPlacement> {
    Arc::new_cyclic(|weak: &Weak<ActorPlacement>| {
        let weak = weak.clone();
        ActorPlacement::new(config).with_table_update(move || {
            let Some(placement) = weak.upgrade() else {
                return;
            };
            let actors = actors.clone();
            tokio::spawn(async move {
                actors.drain_rebalanced(placement.as_ref()).await;
            });
        })
    })
}
