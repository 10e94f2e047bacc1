//! Drives registered controllers: merges their input watch streams, debounces
//! bursts, serializes per-output transforms, and enforces ownership and
//! finalizer discipline around their outputs.
use crate::controller::{Controller, ControllerError, Input, InputKind};
use crate::fingerprint::fingerprint;
use crate::scheduler::DebounceQueue;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::stream::{BoxStream, SelectAll, StreamExt};
use mantle_core::metadata::{DEFAULT_NAMESPACE, INPUT_VERSION_ANNOTATION};
use mantle_core::{Phase, ResourceRef};
use mantle_store::{Event, Store};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

/// Coalescing window for bursts of input changes.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(20);
/// Re-check interval while a Strong input waits for its finalizer removal.
const FINALIZE_RETRY: Duration = Duration::from_secs(2);
const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Runs controllers against a store until cancelled.
pub struct Engine {
    store: Store,
    controllers: Vec<Arc<dyn Controller>>,
}

impl Engine {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            controllers: Vec::new(),
        }
    }

    pub fn register<C: Controller>(&mut self, controller: C) {
        self.controllers.push(Arc::new(controller));
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Runs every registered controller as an independent task; returns once
    /// `ct` is cancelled and all controller tasks have wound down.
    pub async fn run(self, ct: CancellationToken) {
        let Engine { store, controllers } = self;
        let mut tasks = JoinSet::new();
        for controller in controllers {
            let store = store.clone();
            let ct = ct.clone();
            let name = controller.name();
            tasks.spawn(
                run_controller(store, controller, ct)
                    .instrument(info_span!("controller", name)),
            );
        }
        while tasks.join_next().await.is_some() {}
    }
}

#[derive(Clone, Copy)]
enum Tag {
    Input(usize),
    Output,
}

enum Step {
    Quit,
    Idle,
    Event(Tag, Event),
    Due(String),
    Finalize(ResourceRef),
    Done(String, Result<(), ControllerError>),
}

async fn run_controller(store: Store, ctrl: Arc<dyn Controller>, ct: CancellationToken) {
    let name = ctrl.name();
    let inputs: Arc<Vec<Input>> = Arc::new(ctrl.inputs());
    let output_kind = ctrl.outputs().first().map(|output| output.kind);

    let mut streams: SelectAll<BoxStream<'static, (Tag, Event)>> = SelectAll::new();
    for (i, input) in inputs.iter().enumerate() {
        match store.watch(&input.namespace, input.kind, input.selector.clone(), None) {
            Ok(watch) => streams.push(watch.map(move |event| (Tag::Input(i), event)).boxed()),
            Err(err) => {
                error!(input = input.kind, error = %err, "failed to open input watch");
                return;
            }
        }
    }
    if let Some(kind) = output_kind {
        match store.watch_kind(DEFAULT_NAMESPACE, kind) {
            Ok(watch) => streams.push(watch.map(|event| (Tag::Output, event)).boxed()),
            Err(err) => {
                error!(output = kind, error = %err, "failed to open output watch");
                return;
            }
        }
    }

    let mut queue: DebounceQueue<String> = DebounceQueue::new(DEBOUNCE_WINDOW);
    let mut finalize_queue: DebounceQueue<ResourceRef> = DebounceQueue::new(FINALIZE_RETRY);
    let mut running: JoinSet<(String, Result<(), ControllerError>)> = JoinSet::new();
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut dirty: HashSet<String> = HashSet::new();
    let mut backoffs: HashMap<String, backon::ExponentialBackoff> = HashMap::new();
    let mut halted: HashSet<String> = HashSet::new();

    loop {
        let step = tokio::select! {
            () = ct.cancelled() => Step::Quit,
            next = streams.next() => match next {
                Some((tag, event)) => Step::Event(tag, event),
                None => Step::Quit,
            },
            id = queue.next() => Step::Due(id),
            reference = finalize_queue.next() => Step::Finalize(reference),
            Some(joined) = running.join_next() => match joined {
                Ok((id, result)) => Step::Done(id, result),
                Err(join_err) => {
                    error!(error = %join_err, "transform task aborted");
                    Step::Idle
                }
            },
        };

        match step {
            Step::Quit => break,
            Step::Idle => {}
            Step::Event(tag, event) => {
                let due = match tag {
                    Tag::Input(i) => {
                        let decl = &inputs[i];
                        let Some(resource) = event.resource() else {
                            continue;
                        };
                        if decl.input_kind == InputKind::Strong
                            && !matches!(event, Event::Destroyed(_))
                        {
                            match resource.metadata.phase {
                                Phase::Running if !resource.metadata.has_finalizer(name) => {
                                    if let Err(err) = store
                                        .add_finalizer(&resource.metadata.reference(), name)
                                        .await
                                    {
                                        if !err.is_not_found() {
                                            warn!(error = %err, "failed to add finalizer");
                                        }
                                    }
                                }
                                Phase::TearingDown if resource.metadata.has_finalizer(name) => {
                                    finalize_queue.insert_after(
                                        resource.metadata.reference(),
                                        Duration::ZERO,
                                    );
                                }
                                _ => {}
                            }
                        }
                        let wanted = match decl.input_kind {
                            InputKind::DestroyReady => {
                                matches!(event, Event::Destroyed(_))
                                    || (resource.metadata.phase == Phase::TearingDown
                                        && resource.metadata.finalizers.is_empty())
                            }
                            _ => true,
                        };
                        if wanted {
                            match ctrl.map(&store, resource).await {
                                Ok(ids) => ids,
                                Err(err) => {
                                    warn!(error = %err, "input mapping failed");
                                    Vec::new()
                                }
                            }
                        } else {
                            Vec::new()
                        }
                    }
                    Tag::Output => match event.resource() {
                        Some(resource) if resource.metadata.owner == name => {
                            vec![resource.metadata.id.clone()]
                        }
                        _ => Vec::new(),
                    },
                };
                for id in due {
                    if !halted.contains(&id) {
                        queue.insert(id);
                    }
                }
            }
            Step::Due(id) => {
                if in_flight.contains(&id) {
                    // Serialized per output id: remember and re-run after the
                    // in-flight transform completes.
                    dirty.insert(id);
                    continue;
                }
                in_flight.insert(id.clone());
                let store = store.clone();
                let ctrl = Arc::clone(&ctrl);
                let inputs = Arc::clone(&inputs);
                let span = info_span!("reconcile", controller = name, output = %id);
                running.spawn(
                    async move {
                        let result =
                            reconcile_output(&store, ctrl.as_ref(), &inputs, output_kind, &id)
                                .await;
                        (id, result)
                    }
                    .instrument(span),
                );
            }
            Step::Finalize(reference) => {
                match run_finalizer(&store, ctrl.as_ref(), &inputs, output_kind, &reference).await
                {
                    Ok(true) => {}
                    Ok(false) => finalize_queue.insert_after(reference, FINALIZE_RETRY),
                    Err(err) if err.is_canceled() => {}
                    Err(err) => {
                        warn!(input = %reference, error = %err, "finalization failed, retrying");
                        finalize_queue.insert_after(reference, FINALIZE_RETRY);
                    }
                }
            }
            Step::Done(id, result) => {
                in_flight.remove(&id);
                match result {
                    Ok(()) => {
                        backoffs.remove(&id);
                    }
                    Err(err) if err.is_canceled() => {}
                    Err(err) if err.is_transient() => {
                        let delay = backoffs
                            .entry(id.clone())
                            .or_insert_with(new_backoff)
                            .next()
                            .unwrap_or(MAX_BACKOFF);
                        debug!(output = %id, error = %err, ?delay, "transient failure, backing off");
                        queue.insert_after(id.clone(), delay);
                    }
                    Err(err @ ControllerError::Fatal(_)) => {
                        error!(output = %id, error = %err, "fatal error, halting output");
                        halted.insert(id.clone());
                    }
                    Err(err) => {
                        // Invalid: the transform surfaced it on the output
                        // where the schema defines a field; nothing to retry.
                        warn!(output = %id, error = %err, "transform rejected inputs");
                    }
                }
                if dirty.remove(&id) && !halted.contains(&id) {
                    queue.insert(id);
                }
            }
        }
    }
}

fn new_backoff() -> backon::ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(MIN_BACKOFF)
        .with_max_delay(MAX_BACKOFF)
        .with_jitter()
        .build()
}

/// The current input cut for one output id: its fingerprint and how many of
/// the mapped inputs are still live.
async fn current_cut(
    store: &Store,
    ctrl: &dyn Controller,
    inputs: &[Input],
    id: &str,
) -> Result<(String, usize), ControllerError> {
    let mut cut: Vec<(String, String, u64)> = Vec::new();
    let mut live = 0usize;
    for input in inputs {
        let (items, _) = store
            .list(&input.namespace, input.kind, &input.selector)
            .await?;
        for item in &items {
            if !ctrl.map(store, item).await?.iter().any(|mapped| mapped == id) {
                continue;
            }
            if item.metadata.phase == Phase::Running {
                live += 1;
            }
            cut.push((
                item.metadata.kind.clone(),
                item.metadata.id.clone(),
                item.metadata.version,
            ));
        }
    }
    Ok((fingerprint(cut), live))
}

async fn reconcile_output(
    store: &Store,
    ctrl: &dyn Controller,
    inputs: &[Input],
    output_kind: Option<&'static str>,
    id: &str,
) -> Result<(), ControllerError> {
    let name = ctrl.name();
    let Some(kind) = output_kind else {
        // Side-effect controller: the transform observes store state itself.
        return ctrl.transform(store, id).await.map(|_| ());
    };
    let (print, live) = current_cut(store, ctrl, inputs, id).await?;
    let out_ref = ResourceRef::new(kind, id);

    if live == 0 {
        return retire_output(store, name, &out_ref).await;
    }

    match store.get(&out_ref).await {
        Ok(existing) => {
            if existing.metadata.owner != name {
                return Err(ControllerError::Fatal(format!(
                    "output {out_ref} is owned by {:?}",
                    existing.metadata.owner
                )));
            }
            if existing.metadata.phase == Phase::TearingDown {
                // A previous retirement is still draining; finish it before
                // building the new lineage.
                if existing.metadata.finalizers.is_empty() {
                    store.destroy(&out_ref, name).await?;
                } else {
                    return Ok(());
                }
            } else if existing.metadata.annotations.get(INPUT_VERSION_ANNOTATION)
                == Some(&print)
            {
                // Unchanged input cut: no recompute, no version bump.
                return Ok(());
            }
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
    }

    let Some(mut desired) = ctrl.transform(store, id).await? else {
        return retire_output(store, name, &out_ref).await;
    };
    desired.metadata.namespace = out_ref.namespace.clone();
    desired.metadata.kind = kind.to_string();
    desired.metadata.id = id.to_string();
    desired.metadata.owner = name.to_string();
    desired
        .metadata
        .annotations
        .insert(INPUT_VERSION_ANNOTATION.to_string(), print);
    write_output(store, name, desired).await
}

/// Creates or updates an owned output, recovering version conflicts locally.
async fn write_output(
    store: &Store,
    owner: &str,
    desired: mantle_core::DynamicResource,
) -> Result<(), ControllerError> {
    let reference = desired.metadata.reference();
    loop {
        match store.get(&reference).await {
            Err(err) if err.is_not_found() => match store.create(desired.clone()).await {
                Ok(_) => return Ok(()),
                Err(mantle_store::Error::AlreadyExists(_)) => continue,
                Err(err) => return Err(err.into()),
            },
            Err(err) => return Err(err.into()),
            Ok(current) => {
                if current.spec == desired.spec
                    && current.metadata.labels == desired.metadata.labels
                    && current.metadata.annotations == desired.metadata.annotations
                {
                    return Ok(());
                }
                match store
                    .update(owner, desired.clone(), current.metadata.version)
                    .await
                {
                    Ok(_) => return Ok(()),
                    Err(err) if err.is_conflict() => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}

/// Tears down and, once its finalizers drain, destroys an owned output.
async fn retire_output(
    store: &Store,
    owner: &str,
    out_ref: &ResourceRef,
) -> Result<(), ControllerError> {
    match store.get(out_ref).await {
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err.into()),
        Ok(existing) => {
            if existing.metadata.owner != owner {
                return Err(ControllerError::Fatal(format!(
                    "output {out_ref} is owned by {:?}",
                    existing.metadata.owner
                )));
            }
            if store.teardown(out_ref, owner).await? {
                store.destroy(out_ref, owner).await?;
            }
            Ok(())
        }
    }
}

/// Handles a Strong input in teardown: waits for the controller's outputs to
/// settle without the input, invokes the cleanup hook, then clears the
/// finalizer. Returns `false` when it must be retried later.
async fn run_finalizer(
    store: &Store,
    ctrl: &dyn Controller,
    inputs: &[Input],
    output_kind: Option<&'static str>,
    reference: &ResourceRef,
) -> Result<bool, ControllerError> {
    let name = ctrl.name();
    let resource = match store.get(reference).await {
        Ok(resource) => resource,
        Err(err) if err.is_not_found() => return Ok(true),
        Err(err) => return Err(err.into()),
    };
    if resource.metadata.phase != Phase::TearingDown || !resource.metadata.has_finalizer(name) {
        return Ok(true);
    }

    if let Some(kind) = output_kind {
        // The finalizer may only drop once every mapped output has been
        // recomputed without this input (or retired with it).
        for id in ctrl.map(store, &resource).await? {
            let (print, live) = current_cut(store, ctrl, inputs, &id).await?;
            match store.get(&ResourceRef::new(kind, &id)).await {
                // Absent output: either already retired or never produced.
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
                Ok(output) if output.metadata.owner != name => {}
                Ok(output) => {
                    let settled = live > 0
                        && output.metadata.phase == Phase::Running
                        && output.metadata.annotations.get(INPUT_VERSION_ANNOTATION)
                            == Some(&print);
                    if !settled {
                        return Ok(false);
                    }
                }
            }
        }
    }

    ctrl.finalize(store, &resource).await?;
    store.remove_finalizer(reference, name).await?;
    Ok(true)
}
