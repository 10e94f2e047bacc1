//! The in-process resource store.
//!
//! A single lock guards the resource maps, the watcher registry and the
//! bounded per-scope event logs. Events are fanned out under that lock right
//! after a mutation commits, which is what makes watch streams observe
//! version order with no split reads.
use crate::event::Event;
use crate::{Error, Result};
use chrono::Utc;
use futures::channel::mpsc;
use mantle_core::metadata::DEFAULT_NAMESPACE;
use mantle_core::{DynamicResource, Metadata, Phase, ResourceRef, Selector, Spec, TypedResource};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// How many committed events are retained per (namespace, kind) for
/// `from_version` watch replays.
const EVENT_LOG_CAPACITY: usize = 1024;

type ScopeKey = (String, String);
type LabelMap = BTreeMap<String, String>;

/// A live watch subscription; the receiver half implements `Stream`.
pub type WatchStream = mpsc::UnboundedReceiver<Event>;

struct Watcher {
    selector: Selector,
    tx: mpsc::UnboundedSender<Event>,
}

struct LogEntry {
    version: u64,
    event: Event,
    /// Labels before the mutation, used to translate updates into
    /// enter/leave events for selector-scoped watchers.
    prev_labels: Option<LabelMap>,
}

#[derive(Default)]
struct State {
    version: u64,
    resources: HashMap<ScopeKey, BTreeMap<String, DynamicResource>>,
    watchers: HashMap<ScopeKey, Vec<Watcher>>,
    logs: HashMap<ScopeKey, VecDeque<LogEntry>>,
}

/// Process-wide, namespaced, versioned, watchable resource store.
///
/// Cloning is cheap and shares the backing state.
#[derive(Clone, Default)]
pub struct Store {
    state: Arc<Mutex<State>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches a resource by pointer.
    pub async fn get(&self, reference: &ResourceRef) -> Result<DynamicResource> {
        let state = self.state.lock();
        state
            .resources
            .get(&scope_of(reference))
            .and_then(|by_id| by_id.get(&reference.id))
            .cloned()
            .ok_or_else(|| Error::NotFound(reference.clone()))
    }

    /// Typed [`Store::get`] in the default namespace.
    pub async fn get_as<S: Spec>(&self, id: &str) -> Result<TypedResource<S>> {
        let resource = self.get(&ResourceRef::new(S::KIND, id)).await?;
        Ok(resource.to_typed::<S>()?)
    }

    /// Lists resources matching `selector`, returning the snapshot and the
    /// list version it was taken at.
    pub async fn list(
        &self,
        namespace: &str,
        kind: &str,
        selector: &Selector,
    ) -> Result<(Vec<DynamicResource>, u64)> {
        let state = self.state.lock();
        let items = state
            .resources
            .get(&(namespace.to_string(), kind.to_string()))
            .map(|by_id| {
                by_id
                    .values()
                    .filter(|r| selector.matches(&r.metadata.labels))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok((items, state.version))
    }

    /// Typed [`Store::list`] in the default namespace, natural id order.
    pub async fn list_as<S: Spec>(&self, selector: &Selector) -> Result<Vec<TypedResource<S>>> {
        let (items, _) = self.list(DEFAULT_NAMESPACE, S::KIND, selector).await?;
        items
            .iter()
            .map(|r| r.to_typed::<S>().map_err(Error::from))
            .collect()
    }

    /// Creates a resource, assigning the first version of a new lineage.
    pub async fn create(&self, mut resource: DynamicResource) -> Result<DynamicResource> {
        let mut state = self.state.lock();
        let reference = resource.metadata.reference();
        let scope = scope_of(&reference);
        let by_id = state.resources.entry(scope.clone()).or_default();
        if by_id.contains_key(&reference.id) {
            return Err(Error::AlreadyExists(reference));
        }
        let now = Utc::now();
        state.version += 1;
        resource.metadata.version = state.version;
        resource.metadata.phase = Phase::Running;
        resource.metadata.created = now;
        resource.metadata.updated = now;
        state
            .resources
            .get_mut(&scope)
            .unwrap_or_else(|| unreachable!("scope inserted above"))
            .insert(reference.id.clone(), resource.clone());
        commit(&mut state, &scope, Event::Created(resource.clone()), None);
        Ok(resource)
    }

    /// Typed [`Store::create`].
    pub async fn create_as<S: Spec>(&self, resource: TypedResource<S>) -> Result<DynamicResource> {
        self.create(resource.into_dynamic()?).await
    }

    /// Replaces spec, labels and annotations under optimistic concurrency.
    ///
    /// `owner` must match the stored owner. Phase, created-at, finalizers and
    /// ownership are never taken from `resource`; finalizers move only
    /// through [`Store::add_finalizer`] / [`Store::remove_finalizer`].
    pub async fn update(
        &self,
        owner: &str,
        resource: DynamicResource,
        expected_version: u64,
    ) -> Result<DynamicResource> {
        let mut state = self.state.lock();
        let reference = resource.metadata.reference();
        let scope = scope_of(&reference);
        let stored = state
            .resources
            .get_mut(&scope)
            .and_then(|by_id| by_id.get_mut(&reference.id))
            .ok_or_else(|| Error::NotFound(reference.clone()))?;
        if stored.metadata.version != expected_version {
            return Err(Error::VersionConflict {
                reference,
                expected: expected_version,
                found: stored.metadata.version,
            });
        }
        check_owner(stored, owner, &reference)?;
        if stored.metadata.phase == Phase::TearingDown {
            return Err(Error::PreconditionFailed {
                reference,
                reason: "resource is tearing down, only finalizer removal is accepted".into(),
            });
        }
        let prev_labels = stored.metadata.labels.clone();
        let mut next = stored.clone();
        next.metadata.labels = resource.metadata.labels;
        next.metadata.annotations = resource.metadata.annotations;
        next.spec = resource.spec;
        bump(&mut state.version, &mut next);
        let updated = next.clone();
        state
            .resources
            .get_mut(&scope)
            .and_then(|by_id| by_id.get_mut(&reference.id))
            .map(|slot| *slot = next);
        commit(
            &mut state,
            &scope,
            Event::Updated(updated.clone()),
            Some(prev_labels),
        );
        Ok(updated)
    }

    /// Applies an atomic label diff. Watchers observe the post-diff snapshot
    /// only. System-prefixed keys are allowed; see
    /// [`Store::update_user_labels`] for the user-facing variant.
    pub async fn update_labels<F>(
        &self,
        reference: &ResourceRef,
        owner: &str,
        diff: F,
    ) -> Result<DynamicResource>
    where
        F: FnOnce(&mut LabelMap),
    {
        self.mutate_labels(reference, owner, diff, false).await
    }

    /// Applies an atomic label diff on behalf of a user; refuses to touch
    /// keys under the system prefix.
    pub async fn update_user_labels<F>(
        &self,
        reference: &ResourceRef,
        owner: &str,
        diff: F,
    ) -> Result<DynamicResource>
    where
        F: FnOnce(&mut LabelMap),
    {
        self.mutate_labels(reference, owner, diff, true).await
    }

    async fn mutate_labels<F>(
        &self,
        reference: &ResourceRef,
        owner: &str,
        diff: F,
        user_scoped: bool,
    ) -> Result<DynamicResource>
    where
        F: FnOnce(&mut LabelMap),
    {
        let mut state = self.state.lock();
        let scope = scope_of(reference);
        let stored = state
            .resources
            .get_mut(&scope)
            .and_then(|by_id| by_id.get_mut(&reference.id))
            .ok_or_else(|| Error::NotFound(reference.clone()))?;
        check_owner(stored, owner, reference)?;
        let prev_labels = stored.metadata.labels.clone();
        let mut next_labels = prev_labels.clone();
        diff(&mut next_labels);
        if user_scoped {
            let touched_system = prev_labels
                .iter()
                .any(|(k, v)| Metadata::is_system_key(k) && next_labels.get(k) != Some(v))
                || next_labels
                    .iter()
                    .any(|(k, v)| Metadata::is_system_key(k) && prev_labels.get(k) != Some(v));
            if touched_system {
                return Err(Error::Invalid {
                    reference: reference.clone(),
                    reason: "system-prefixed label keys are reserved".into(),
                });
            }
        }
        let mut next = stored.clone();
        next.metadata.labels = next_labels;
        bump(&mut state.version, &mut next);
        let updated = next.clone();
        state
            .resources
            .get_mut(&scope)
            .and_then(|by_id| by_id.get_mut(&reference.id))
            .map(|slot| *slot = next);
        commit(
            &mut state,
            &scope,
            Event::Updated(updated.clone()),
            Some(prev_labels),
        );
        Ok(updated)
    }

    /// Places a named finalizer claim on a resource.
    pub async fn add_finalizer(&self, reference: &ResourceRef, finalizer: &str) -> Result<()> {
        self.mutate_finalizers(reference, |meta| meta.add_finalizer(finalizer))
            .await
    }

    /// Clears a named finalizer claim. Permitted in any phase.
    pub async fn remove_finalizer(&self, reference: &ResourceRef, finalizer: &str) -> Result<()> {
        self.mutate_finalizers(reference, |meta| {
            meta.remove_finalizer(finalizer);
        })
        .await
    }

    async fn mutate_finalizers<F>(&self, reference: &ResourceRef, f: F) -> Result<()>
    where
        F: FnOnce(&mut Metadata),
    {
        let mut state = self.state.lock();
        let scope = scope_of(reference);
        let stored = state
            .resources
            .get_mut(&scope)
            .and_then(|by_id| by_id.get_mut(&reference.id))
            .ok_or_else(|| Error::NotFound(reference.clone()))?;
        let prev_labels = stored.metadata.labels.clone();
        let before = stored.metadata.finalizers.clone();
        let mut next = stored.clone();
        f(&mut next.metadata);
        if next.metadata.finalizers == before {
            return Ok(());
        }
        bump(&mut state.version, &mut next);
        let updated = next.clone();
        state
            .resources
            .get_mut(&scope)
            .and_then(|by_id| by_id.get_mut(&reference.id))
            .map(|slot| *slot = next);
        commit(&mut state, &scope, Event::Updated(updated), Some(prev_labels));
        Ok(())
    }

    /// Transitions a resource into `TearingDown`; idempotent. Returns whether
    /// the resource is destroy-ready (its finalizer set is empty).
    pub async fn teardown(&self, reference: &ResourceRef, owner: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let scope = scope_of(reference);
        let stored = state
            .resources
            .get_mut(&scope)
            .and_then(|by_id| by_id.get_mut(&reference.id))
            .ok_or_else(|| Error::NotFound(reference.clone()))?;
        check_owner(stored, owner, reference)?;
        if stored.metadata.phase == Phase::TearingDown {
            return Ok(stored.metadata.finalizers.is_empty());
        }
        let prev_labels = stored.metadata.labels.clone();
        let mut next = stored.clone();
        next.metadata.phase = Phase::TearingDown;
        bump(&mut state.version, &mut next);
        let ready = next.metadata.finalizers.is_empty();
        let updated = next.clone();
        state
            .resources
            .get_mut(&scope)
            .and_then(|by_id| by_id.get_mut(&reference.id))
            .map(|slot| *slot = next);
        commit(&mut state, &scope, Event::Updated(updated), Some(prev_labels));
        Ok(ready)
    }

    /// Destroys a torn-down resource with no remaining finalizers. Terminal:
    /// a subsequent create with the same pointer starts a new lineage.
    pub async fn destroy(&self, reference: &ResourceRef, owner: &str) -> Result<()> {
        let mut state = self.state.lock();
        let scope = scope_of(reference);
        let stored = state
            .resources
            .get(&scope)
            .and_then(|by_id| by_id.get(&reference.id))
            .ok_or_else(|| Error::NotFound(reference.clone()))?;
        check_owner(stored, owner, reference)?;
        if stored.metadata.phase != Phase::TearingDown {
            return Err(Error::PreconditionFailed {
                reference: reference.clone(),
                reason: "destroy requires the resource to be tearing down".into(),
            });
        }
        if !stored.metadata.finalizers.is_empty() {
            return Err(Error::PreconditionFailed {
                reference: reference.clone(),
                reason: format!(
                    "finalizers still present: {}",
                    stored.metadata.finalizers.join(", ")
                ),
            });
        }
        let mut removed = state
            .resources
            .get_mut(&scope)
            .and_then(|by_id| by_id.remove(&reference.id))
            .unwrap_or_else(|| unreachable!("existence checked above"));
        let prev_labels = removed.metadata.labels.clone();
        bump(&mut state.version, &mut removed);
        commit(
            &mut state,
            &scope,
            Event::Destroyed(removed),
            Some(prev_labels),
        );
        Ok(())
    }

    /// Opens an ordered change stream over one (namespace, kind) selection.
    ///
    /// Without `from_version` the stream starts with a catch-up: `Created`
    /// for every currently-matching resource, then `Bookmark` at the list
    /// version, then live events. With `from_version` the retained event log
    /// is replayed from right after that version; if it has been trimmed the
    /// call fails with [`Error::VersionGone`].
    pub fn watch(
        &self,
        namespace: &str,
        kind: &str,
        selector: Selector,
        from_version: Option<u64>,
    ) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        let scope = (namespace.to_string(), kind.to_string());
        match from_version {
            None => {
                let snapshot: Vec<_> = state
                    .resources
                    .get(&scope)
                    .map(|by_id| {
                        by_id
                            .values()
                            .filter(|r| selector.matches(&r.metadata.labels))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                for resource in snapshot {
                    let _ = tx.unbounded_send(Event::Created(resource));
                }
                let _ = tx.unbounded_send(Event::Bookmark(state.version));
            }
            Some(from) => {
                let log = state.logs.entry(scope.clone()).or_default();
                if let Some(first) = log.front() {
                    if first.version > from + 1 {
                        return Err(Error::VersionGone {
                            from,
                            oldest: first.version,
                        });
                    }
                }
                for entry in log.iter().filter(|e| e.version > from) {
                    if let Some(event) = translate(&selector, &entry.event, entry.prev_labels.as_ref())
                    {
                        let _ = tx.unbounded_send(event);
                    }
                }
            }
        }
        state
            .watchers
            .entry(scope)
            .or_default()
            .push(Watcher { selector, tx });
        Ok(rx)
    }

    /// Kind-level bulk subscription: every resource of the kind, no selector.
    pub fn watch_kind(&self, namespace: &str, kind: &str) -> Result<WatchStream> {
        self.watch(namespace, kind, Selector::all(), None)
    }
}

fn scope_of(reference: &ResourceRef) -> ScopeKey {
    (reference.namespace.clone(), reference.kind.clone())
}

fn check_owner(stored: &DynamicResource, owner: &str, reference: &ResourceRef) -> Result<()> {
    if stored.metadata.owner != owner {
        return Err(Error::PreconditionFailed {
            reference: reference.clone(),
            reason: format!(
                "owner mismatch: resource is owned by {:?}, caller is {:?}",
                stored.metadata.owner, owner
            ),
        });
    }
    Ok(())
}

/// Assigns the next store version and a monotonic updated-at.
fn bump(version: &mut u64, resource: &mut DynamicResource) {
    *version += 1;
    resource.metadata.version = *version;
    resource.metadata.updated = Utc::now().max(resource.metadata.updated);
}

/// Records the event in the bounded replay log and fans it out to live
/// watchers, translating label transitions per watcher selector. Runs under
/// the state lock so delivery order equals version order.
fn commit(state: &mut State, scope: &ScopeKey, event: Event, prev_labels: Option<LabelMap>) {
    let log = state.logs.entry(scope.clone()).or_default();
    if log.len() == EVENT_LOG_CAPACITY {
        log.pop_front();
    }
    log.push_back(LogEntry {
        version: event.version(),
        event: event.clone(),
        prev_labels: prev_labels.clone(),
    });
    if let Some(watchers) = state.watchers.get_mut(scope) {
        watchers.retain(|watcher| {
            match translate(&watcher.selector, &event, prev_labels.as_ref()) {
                Some(scoped) => watcher.tx.unbounded_send(scoped).is_ok(),
                None => !watcher.tx.is_closed(),
            }
        });
    }
}

/// Maps a committed event onto one watcher's selection, turning label-driven
/// entry/exit into Created/Destroyed.
fn translate(selector: &Selector, event: &Event, prev_labels: Option<&LabelMap>) -> Option<Event> {
    match event {
        Event::Bookmark(v) => Some(Event::Bookmark(*v)),
        Event::Created(resource) => selector
            .matches(&resource.metadata.labels)
            .then(|| Event::Created(resource.clone())),
        Event::Destroyed(resource) => {
            let was = prev_labels
                .map(|labels| selector.matches(labels))
                .unwrap_or_else(|| selector.matches(&resource.metadata.labels));
            was.then(|| Event::Destroyed(resource.clone()))
        }
        Event::Updated(resource) => {
            let now = selector.matches(&resource.metadata.labels);
            let was = prev_labels
                .map(|labels| selector.matches(labels))
                .unwrap_or(now);
            match (was, now) {
                (true, true) => Some(Event::Updated(resource.clone())),
                (false, true) => Some(Event::Created(resource.clone())),
                (true, false) => Some(Event::Destroyed(resource.clone())),
                (false, false) => None,
            }
        }
    }
}
