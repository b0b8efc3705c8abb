//! CRDT-like presence store (§4.E): syncs initial state, applies
//! join/leave diffs, invokes user callbacks.

use crate::message::{presence_ref, PresenceDiffMsg, PresenceMeta, PresenceStateMap};

type JoinHook = Box<dyn FnMut(&str, &[PresenceMeta], &[PresenceMeta]) + Send>;
type LeaveHook = Box<dyn FnMut(&str, &[PresenceMeta], &[PresenceMeta]) + Send>;
type SyncHook = Box<dyn FnMut() + Send>;

/// Tracks who is online for one channel.
///
/// Pending-diff protocol: diffs received before the first
/// `presence_state` snapshot of the current join generation are queued
/// and replayed, in arrival order, once that snapshot lands; `on_sync`
/// then fires exactly once. This is required because a diff names metas
/// only a snapshot can resolve.
pub struct Presence {
    state: PresenceStateMap,
    pending_diffs: Vec<PresenceDiffMsg>,
    has_synced: bool,
    on_join: Vec<JoinHook>,
    on_leave: Vec<LeaveHook>,
    on_sync: Vec<SyncHook>,
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}

impl Presence {
    pub fn new() -> Self {
        Self {
            state: PresenceStateMap::new(),
            pending_diffs: Vec::new(),
            has_synced: false,
            on_join: Vec::new(),
            on_leave: Vec::new(),
            on_sync: Vec::new(),
        }
    }

    pub fn on_join<F>(&mut self, cb: F)
    where
        F: FnMut(&str, &[PresenceMeta], &[PresenceMeta]) + Send + 'static,
    {
        self.on_join.push(Box::new(cb));
    }

    pub fn on_leave<F>(&mut self, cb: F)
    where
        F: FnMut(&str, &[PresenceMeta], &[PresenceMeta]) + Send + 'static,
    {
        self.on_leave.push(Box::new(cb));
    }

    pub fn on_sync<F>(&mut self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_sync.push(Box::new(cb));
    }

    pub fn state(&self) -> &PresenceStateMap {
        &self.state
    }

    /// Clears the pending-diff queue and the synced flag. Called on
    /// every new join attempt. Deliberately leaves `state` untouched
    /// until a fresh snapshot actually arrives, so presence observed
    /// before a rejoin doesn't flicker empty while the rejoin is
    /// in flight.
    pub fn reset_for_rejoin(&mut self) {
        self.pending_diffs.clear();
        self.has_synced = false;
    }

    /// Handles an inbound `presence_state` event: diffs against the
    /// current state, fires `on_join`/`on_leave`, assigns the new
    /// state, then (on the first snapshot since the last (re)join)
    /// replays any queued diffs before firing `on_sync` once.
    pub fn handle_state(&mut self, new_state: PresenceStateMap) {
        let is_first_sync = !self.has_synced;
        self.sync_state(new_state);

        if is_first_sync {
            self.has_synced = true;
            let queued = std::mem::take(&mut self.pending_diffs);
            for diff in queued {
                self.apply_diff(diff);
            }
        }

        for hook in self.on_sync.iter_mut() {
            hook();
        }
    }

    /// Handles an inbound `presence_diff` event: queues it if no
    /// snapshot has arrived yet for this join generation, otherwise
    /// applies it immediately and fires `on_sync`.
    pub fn handle_diff(&mut self, diff: PresenceDiffMsg) {
        if !self.has_synced {
            self.pending_diffs.push(diff);
            return;
        }
        self.apply_diff(diff);
        for hook in self.on_sync.iter_mut() {
            hook();
        }
    }

    fn sync_state(&mut self, new_state: PresenceStateMap) {
        for (key, new_metas) in &new_state {
            match self.state.get(key) {
                Some(existing_metas) => {
                    let existing_metas = existing_metas.clone();
                    let joined: Vec<PresenceMeta> = new_metas
                        .iter()
                        .filter(|m| !contains_ref(&existing_metas, m))
                        .cloned()
                        .collect();
                    if !joined.is_empty() {
                        self.fire_join(key, &existing_metas, &joined);
                    }
                }
                None => {
                    self.fire_join(key, &[], new_metas);
                }
            }
        }

        let existing_entries: Vec<(String, Vec<PresenceMeta>)> = self
            .state
            .iter()
            .map(|(key, metas)| (key.clone(), metas.clone()))
            .collect();
        for (key, existing_metas) in &existing_entries {
            let remaining_metas: Vec<PresenceMeta> = match new_state.get(key) {
                Some(new_metas) => new_metas.clone(),
                None => Vec::new(),
            };
            let left: Vec<PresenceMeta> = existing_metas
                .iter()
                .filter(|m| !contains_ref(&remaining_metas, m))
                .cloned()
                .collect();
            if !left.is_empty() {
                self.fire_leave(key, &remaining_metas, &left);
            }
        }

        self.state = new_state;
    }

    /// Applies one diff: appends joined metas, removes left metas by
    /// `presence_ref`, drops keys whose list becomes empty.
    fn apply_diff(&mut self, diff: PresenceDiffMsg) {
        for (key, left_metas) in &diff.leaves {
            let remaining_metas = match self.state.get_mut(key) {
                Some(metas) => {
                    metas.retain(|m| !contains_ref(left_metas, m));
                    metas.clone()
                }
                None => Vec::new(),
            };
            self.fire_leave(key, &remaining_metas, left_metas);
            if remaining_metas.is_empty() {
                self.state.remove(key);
            } else {
                self.state.insert(key.clone(), remaining_metas);
            }
        }

        for (key, joined_metas) in &diff.joins {
            let existing_metas = self.state.entry(key.clone()).or_default();
            let before = existing_metas.clone();
            existing_metas.extend(joined_metas.iter().cloned());
            self.fire_join(key, &before, joined_metas);
        }
    }

    fn fire_join(&mut self, key: &str, existing: &[PresenceMeta], joined: &[PresenceMeta]) {
        for hook in self.on_join.iter_mut() {
            hook(key, existing, joined);
        }
    }

    fn fire_leave(&mut self, key: &str, remaining: &[PresenceMeta], left: &[PresenceMeta]) {
        for hook in self.on_leave.iter_mut() {
            hook(key, remaining, left);
        }
    }
}

fn contains_ref(metas: &[PresenceMeta], target: &PresenceMeta) -> bool {
    let target_ref = presence_ref(target);
    metas.iter().any(|m| presence_ref(m) == target_ref)
}
