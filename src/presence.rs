//! Presence state synchronization (spec section 4.5): merges
//! `presence_state` snapshots and `presence_diff` deltas into a local
//! `Map<key, PresencePayload>`, queuing diffs that arrive before the first
//! snapshot of a join generation.
//!
//! [`Presence`] wires itself onto a [`Channel`] the same way the protocol
//! describes — two subscriptions, `presence_state` and `presence_diff` — and
//! reads the channel's live joinRef through the
//! [`Channel::join_ref_cell`](crate::channel::Channel::join_ref_cell) it
//! shares rather than holding a literal reference to the channel, the same
//! context-bundle substitute used throughout this crate in place of
//! back-references.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use serde_json::Value;

use crate::channel::Channel;
use crate::json::BoxedJson;

const PRESENCE_STATE_EVENT: &str = "presence_state";
const PRESENCE_DIFF_EVENT: &str = "presence_diff";

/// A single metadata entry for one presence key, e.g. one connected tab.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMeta {
    /// Uniquely identifies this metadata entry; assigned by the server.
    pub phx_ref: String,
    /// The full entry as received, opaque beyond `phx_ref`.
    pub payload: BoxedJson,
}

/// Everything the server knows about one presence key.
#[derive(Debug, Clone, PartialEq)]
pub struct PresencePayload {
    /// One entry per concurrently-joined instance under this key.
    pub metas: Vec<PresenceMeta>,
    /// The full entry as received, opaque beyond `metas`.
    pub payload: BoxedJson,
}

/// The full presence map: key to combined metadata.
pub type PresenceState = HashMap<String, PresencePayload>;

/// A `presence_diff` frame: keys that joined and keys that left since the
/// last diff or snapshot.
#[derive(Debug, Clone, Default)]
pub struct PresenceDiff {
    /// Newly-joined (or newly-joined-metas) entries.
    pub joins: PresenceState,
    /// Left (or partially-left) entries.
    pub leaves: PresenceState,
}

fn parse_meta(value: &Value) -> Option<PresenceMeta> {
    let phx_ref = value.get("phx_ref")?.as_str()?.to_string();
    Some(PresenceMeta {
        phx_ref,
        payload: BoxedJson::from_value(value.clone()),
    })
}

fn parse_presence(value: &Value) -> Option<PresencePayload> {
    let metas = value
        .get("metas")?
        .as_array()?
        .iter()
        .filter_map(parse_meta)
        .collect();
    Some(PresencePayload {
        metas,
        payload: BoxedJson::from_value(value.clone()),
    })
}

fn parse_state(boxed: &BoxedJson) -> PresenceState {
    let Value::Object(map) = boxed.as_value() else {
        return PresenceState::new();
    };
    map.iter()
        .filter_map(|(key, value)| parse_presence(value).map(|p| (key.clone(), p)))
        .collect()
}

fn parse_diff(boxed: &BoxedJson) -> PresenceDiff {
    let object = boxed.as_value();
    let joins = object
        .get("joins")
        .map(|v| parse_state(&BoxedJson::from_value(v.clone())))
        .unwrap_or_default();
    let leaves = object
        .get("leaves")
        .map(|v| parse_state(&BoxedJson::from_value(v.clone())))
        .unwrap_or_default();
    PresenceDiff { joins, leaves }
}

fn refs_of(metas: &[PresenceMeta]) -> HashSet<&str> {
    metas.iter().map(|m| m.phx_ref.as_str()).collect()
}

/// Applies `diff` on top of `state` in place, firing `on_join`/`on_leave`
/// per affected key (spec section 4.5's `syncDiff`).
///
/// On a join for a key already present, metas from the existing presence
/// that aren't among the newly-joining refs are kept, prepended ahead of
/// the new metas. On a leave, metas whose `phx_ref` is in the leaving set
/// are dropped; an empty result deletes the key.
pub fn sync_diff(
    state: &mut PresenceState,
    diff: &PresenceDiff,
    mut on_join: impl FnMut(&str, Option<&PresencePayload>, &PresencePayload),
    mut on_leave: impl FnMut(&str, &PresencePayload, &PresencePayload),
) {
    // HashMap iteration order is unspecified; sort so onJoin/onLeave fire in
    // a stable order across runs instead of whatever the hasher happens to
    // produce.
    for (key, joined) in diff.joins.iter().sorted_by_key(|(key, _)| key.as_str()) {
        let previous = state.get(key).cloned();
        let mut merged = joined.clone();
        if let Some(prev) = &previous {
            let joining_refs = refs_of(&joined.metas);
            let mut combined: Vec<PresenceMeta> = prev
                .metas
                .iter()
                .filter(|m| !joining_refs.contains(m.phx_ref.as_str()))
                .cloned()
                .collect();
            combined.extend(merged.metas.drain(..));
            merged.metas = combined;
        }
        state.insert(key.clone(), merged.clone());
        on_join(key, previous.as_ref(), &merged);
    }

    for (key, left) in diff.leaves.iter().sorted_by_key(|(key, _)| key.as_str()) {
        let Some(current) = state.get(key).cloned() else {
            continue;
        };
        let leaving_refs = refs_of(&left.metas);
        let remaining_metas: Vec<PresenceMeta> = current
            .metas
            .iter()
            .filter(|m| !leaving_refs.contains(m.phx_ref.as_str()))
            .cloned()
            .collect();
        let remaining = PresencePayload {
            metas: remaining_metas,
            payload: current.payload.clone(),
        };
        on_leave(key, &remaining, left);
        if remaining.metas.is_empty() {
            state.remove(key);
        } else {
            state.insert(key.clone(), remaining);
        }
    }
}

/// Computes the diff between `current` and a freshly-received `new`
/// snapshot and applies it, returning the merged state (spec section 4.5's
/// `syncState`).
pub fn sync_state(
    current: &PresenceState,
    new: &PresenceState,
    on_join: impl FnMut(&str, Option<&PresencePayload>, &PresencePayload),
    on_leave: impl FnMut(&str, &PresencePayload, &PresencePayload),
) -> PresenceState {
    let mut joins = PresenceState::new();
    let mut leaves = PresenceState::new();

    for (key, new_presence) in new.iter().sorted_by_key(|(key, _)| key.as_str()) {
        match current.get(key) {
            None => {
                joins.insert(key.clone(), new_presence.clone());
            }
            Some(current_presence) => {
                let current_refs = refs_of(&current_presence.metas);
                let new_refs = refs_of(&new_presence.metas);

                let joined_metas: Vec<PresenceMeta> = new_presence
                    .metas
                    .iter()
                    .filter(|m| !current_refs.contains(m.phx_ref.as_str()))
                    .cloned()
                    .collect();
                if !joined_metas.is_empty() {
                    joins.insert(
                        key.clone(),
                        PresencePayload {
                            metas: joined_metas,
                            payload: new_presence.payload.clone(),
                        },
                    );
                }

                let left_metas: Vec<PresenceMeta> = current_presence
                    .metas
                    .iter()
                    .filter(|m| !new_refs.contains(m.phx_ref.as_str()))
                    .cloned()
                    .collect();
                if !left_metas.is_empty() {
                    leaves.insert(
                        key.clone(),
                        PresencePayload {
                            metas: left_metas,
                            payload: current_presence.payload.clone(),
                        },
                    );
                }
            }
        }
    }

    for (key, current_presence) in current {
        if !new.contains_key(key) {
            leaves.insert(key.clone(), current_presence.clone());
        }
    }

    let mut result = current.clone();
    sync_diff(&mut result, &PresenceDiff { joins, leaves }, on_join, on_leave);
    result
}

type JoinHook = Box<dyn FnMut(&str, Option<&PresencePayload>, &PresencePayload) + Send>;
type LeaveHook = Box<dyn FnMut(&str, &PresencePayload, &PresencePayload) + Send>;
type SyncHook = Box<dyn FnMut(&PresenceState) + Send>;

#[derive(Default)]
struct Inner {
    state: PresenceState,
    pending_diffs: Vec<PresenceDiff>,
    synced_join_ref: Option<String>,
    on_join: Vec<JoinHook>,
    on_leave: Vec<LeaveHook>,
    on_sync: Vec<SyncHook>,
}

impl Inner {
    fn is_pending_sync(&self, current_join_ref: &Option<String>) -> bool {
        match &self.synced_join_ref {
            None => true,
            Some(synced) => Some(synced) != current_join_ref.as_ref(),
        }
    }

    fn apply_state(&mut self, new_state: PresenceState) {
        let mut joins = Vec::new();
        let mut leaves = Vec::new();

        let merged = sync_state(
            &self.state,
            &new_state,
            |key, prev, new| joins.push((key.to_string(), prev.cloned(), new.clone())),
            |key, remaining, left| leaves.push((key.to_string(), remaining.clone(), left.clone())),
        );
        self.state = merged;

        for diff in std::mem::take(&mut self.pending_diffs) {
            sync_diff(
                &mut self.state,
                &diff,
                |key, prev, new| joins.push((key.to_string(), prev.cloned(), new.clone())),
                |key, remaining, left| leaves.push((key.to_string(), remaining.clone(), left.clone())),
            );
        }

        self.fire(joins, leaves);
    }

    fn apply_diff(&mut self, diff: PresenceDiff) {
        let mut joins = Vec::new();
        let mut leaves = Vec::new();
        sync_diff(
            &mut self.state,
            &diff,
            |key, prev, new| joins.push((key.to_string(), prev.cloned(), new.clone())),
            |key, remaining, left| leaves.push((key.to_string(), remaining.clone(), left.clone())),
        );
        self.fire(joins, leaves);
    }

    fn fire(
        &mut self,
        joins: Vec<(String, Option<PresencePayload>, PresencePayload)>,
        leaves: Vec<(String, PresencePayload, PresencePayload)>,
    ) {
        for (key, prev, new) in &joins {
            for hook in self.on_join.iter_mut() {
                hook(key, prev.as_ref(), new);
            }
        }
        for (key, remaining, left) in &leaves {
            for hook in self.on_leave.iter_mut() {
                hook(key, remaining, left);
            }
        }
        let state = self.state.clone();
        for hook in self.on_sync.iter_mut() {
            hook(&state);
        }
    }
}

/// A channel-bound presence tracker.
///
/// Cloning is cheap and shares the same underlying state — every clone
/// observes the same `presence_state`/`presence_diff` traffic, since the
/// subscriptions registered in [`Presence::new`] close over the same
/// `Arc<Mutex<Inner>>`.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<Mutex<Inner>>,
    join_ref_cell: Arc<Mutex<Option<String>>>,
}

impl Presence {
    /// Subscribes `channel` to `presence_state`/`presence_diff` and starts
    /// tracking it.
    pub fn new(channel: &mut Channel) -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let join_ref_cell = channel.join_ref_cell();

        let state_inner = inner.clone();
        let state_join_ref_cell = join_ref_cell.clone();
        channel.on(PRESENCE_STATE_EVENT, move |payload| {
            let current_join_ref = state_join_ref_cell.lock().expect("lock poisoned").clone();
            let new_state = parse_state(payload);
            let mut guard = state_inner.lock().expect("lock poisoned");
            guard.synced_join_ref = current_join_ref;
            guard.apply_state(new_state);
        });

        let diff_inner = inner.clone();
        let diff_join_ref_cell = join_ref_cell.clone();
        channel.on(PRESENCE_DIFF_EVENT, move |payload| {
            let diff = parse_diff(payload);
            let current_join_ref = diff_join_ref_cell.lock().expect("lock poisoned").clone();
            let mut guard = diff_inner.lock().expect("lock poisoned");
            if guard.is_pending_sync(&current_join_ref) {
                guard.pending_diffs.push(diff);
            } else {
                guard.apply_diff(diff);
            }
        });

        Self { inner, join_ref_cell }
    }

    /// A snapshot of the current presence map.
    pub fn list(&self) -> PresenceState {
        self.inner.lock().expect("lock poisoned").state.clone()
    }

    /// True between a rejoin and the next `presence_state` for the new
    /// join generation — incoming diffs are queued, not applied, while
    /// this holds (spec section 4.5's `inPendingSyncState`).
    pub fn is_pending_sync_state(&self) -> bool {
        let current_join_ref = self.join_ref_cell.lock().expect("lock poisoned").clone();
        self.inner
            .lock()
            .expect("lock poisoned")
            .is_pending_sync(&current_join_ref)
    }

    /// Registers a hook fired once per joined key with `(key, previous, new)`.
    pub fn on_join(
        &self,
        hook: impl FnMut(&str, Option<&PresencePayload>, &PresencePayload) + Send + 'static,
    ) {
        self.inner.lock().expect("lock poisoned").on_join.push(Box::new(hook));
    }

    /// Registers a hook fired once per left key with `(key, remaining, left)`.
    pub fn on_leave(
        &self,
        hook: impl FnMut(&str, &PresencePayload, &PresencePayload) + Send + 'static,
    ) {
        self.inner.lock().expect("lock poisoned").on_leave.push(Box::new(hook));
    }

    /// Registers a hook fired once per `presence_state`/`presence_diff`
    /// processed, after any joins/leaves it produced.
    pub fn on_sync(&self, hook: impl FnMut(&PresenceState) + Send + 'static) {
        self.inner.lock().expect("lock poisoned").on_sync.push(Box::new(hook));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OutboundCtx;
    use crate::clock::{Clock, TokioClock};
    use crate::json::V2Serializer;
    use crate::message::Message;
    use crate::refs::RefCounter;
    use crate::scheduler::default_rejoin_after;
    use std::collections::VecDeque;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};
    use std::time::Duration;

    struct Harness {
        refs: RefCounter,
        clock: Arc<dyn Clock>,
        serializer: V2Serializer,
        send_buffer: VecDeque<String>,
        connected: bool,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                refs: RefCounter::default(),
                clock: Arc::new(TokioClock),
                serializer: V2Serializer,
                send_buffer: VecDeque::new(),
                connected: true,
            }
        }

        fn ctx(&mut self) -> OutboundCtx<'_> {
            OutboundCtx {
                ref_counter: &mut self.refs,
                clock: &self.clock,
                serializer: &self.serializer,
                send_buffer: &mut self.send_buffer,
                connected: self.connected,
            }
        }
    }

    fn meta_value(r#ref: &str) -> Value {
        serde_json::json!({"phx_ref": r#ref})
    }

    fn payload(metas: &[&str]) -> PresencePayload {
        let metas: Vec<PresenceMeta> = metas
            .iter()
            .map(|r| PresenceMeta {
                phx_ref: r.to_string(),
                payload: BoxedJson::new(meta_value(r)),
            })
            .collect();
        PresencePayload {
            payload: BoxedJson::new(serde_json::json!({"metas": metas.iter().map(|m| meta_value(&m.phx_ref)).collect::<Vec<_>>()})),
            metas,
        }
    }

    #[test]
    fn sync_state_reports_all_new_keys_as_joins() {
        let current = PresenceState::new();
        let mut new = PresenceState::new();
        new.insert("u1".to_string(), payload(&["1"]));

        let mut joined_keys = Vec::new();
        let result = sync_state(&current, &new, |k, _, _| joined_keys.push(k.to_string()), |_, _, _| {});

        assert_eq!(joined_keys, vec!["u1".to_string()]);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn sync_diff_rejoin_prepends_existing_unrelated_metas() {
        let mut state = PresenceState::new();
        state.insert("u1".to_string(), payload(&["1", "2"]));

        let mut diff = PresenceDiff::default();
        diff.joins.insert("u1".to_string(), payload(&["3"]));

        sync_diff(&mut state, &diff, |_, _, _| {}, |_, _, _| {});

        let metas: Vec<&str> = state["u1"].metas.iter().map(|m| m.phx_ref.as_str()).collect();
        assert_eq!(metas, vec!["1", "2", "3"]);
    }

    #[test]
    fn sync_diff_leave_removes_key_when_no_metas_remain() {
        let mut state = PresenceState::new();
        state.insert("u1".to_string(), payload(&["1"]));

        let mut diff = PresenceDiff::default();
        diff.leaves.insert("u1".to_string(), payload(&["1"]));

        let mut left = Vec::new();
        sync_diff(&mut state, &diff, |_, _, _| {}, |k, _, _| left.push(k.to_string()));

        assert_eq!(left, vec!["u1".to_string()]);
        assert!(!state.contains_key("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn presence_diff_before_state_is_queued_then_applied_on_sync() {
        let mut harness = Harness::new();
        let mut channel = Channel::new(
            "room:lobby",
            BoxedJson::null(),
            Duration::from_secs(10),
            harness.clock.clone(),
            Arc::new(default_rejoin_after),
        );
        channel.join(&mut harness.ctx()).unwrap();

        let presence = Presence::new(&mut channel);

        let joins_log = StdArc::new(StdMutex::new(Vec::new()));
        let leaves_log = StdArc::new(StdMutex::new(Vec::new()));
        {
            let log = joins_log.clone();
            presence.on_join(move |key, _prev, _new| log.lock().unwrap().push(key.to_string()));
        }
        {
            let log = leaves_log.clone();
            presence.on_leave(move |key, _remaining, _left| log.lock().unwrap().push(key.to_string()));
        }

        let diff_payload = BoxedJson::new(serde_json::json!({
            "joins": {},
            "leaves": {"u2": {"metas": [meta_value("2")]}},
        }));
        let diff_message = Message::new(
            channel.join_ref(),
            None,
            "room:lobby",
            PRESENCE_DIFF_EVENT,
            diff_payload,
        );
        channel.trigger(diff_message, &mut harness.ctx()).unwrap();

        assert!(presence.list().is_empty(), "no presence_state observed yet");
        assert!(leaves_log.lock().unwrap().is_empty(), "diff stays queued");

        let state_payload = BoxedJson::new(serde_json::json!({
            "u1": {"metas": [meta_value("1")]},
            "u2": {"metas": [meta_value("2")]},
        }));
        let state_message = Message::new(
            channel.join_ref(),
            None,
            "room:lobby",
            PRESENCE_STATE_EVENT,
            state_payload,
        );
        channel.trigger(state_message, &mut harness.ctx()).unwrap();

        let mut joins = joins_log.lock().unwrap().clone();
        joins.sort();
        assert_eq!(joins, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(leaves_log.lock().unwrap().as_slice(), ["u2".to_string()]);

        let final_state = presence.list();
        assert_eq!(final_state.len(), 1);
        assert!(final_state.contains_key("u1"));
    }
}
