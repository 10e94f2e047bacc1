//! Engine behavior: output ownership, fingerprint stability, teardown flow
//! and Strong-input finalizers.
use async_trait::async_trait;
use mantle_core::metadata::INPUT_VERSION_ANNOTATION;
use mantle_core::{DynamicResource, Phase, ResourceRef, Spec, TypedResource};
use mantle_runtime::{Controller, ControllerError, Engine, Input, InputKind, Output, Sharing};
use mantle_store::Store;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
struct WidgetSpec {
    value: i64,
}

impl Spec for WidgetSpec {
    const KIND: &'static str = "Widget";
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
struct GadgetSpec {
    value: i64,
}

impl Spec for GadgetSpec {
    const KIND: &'static str = "Gadget";
}

/// Derives one Gadget per Widget with the doubled value.
struct DoubleController {
    input_kind: InputKind,
}

#[async_trait]
impl Controller for DoubleController {
    fn name(&self) -> &'static str {
        "DoubleController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::kind(WidgetSpec::KIND, self.input_kind)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output {
            kind: GadgetSpec::KIND,
            sharing: Sharing::Exclusive,
        }]
    }

    async fn transform(
        &self,
        store: &Store,
        output_id: &str,
    ) -> Result<Option<DynamicResource>, ControllerError> {
        let widget = match store.get_as::<WidgetSpec>(output_id).await {
            Ok(widget) => widget,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if widget.metadata.phase == Phase::TearingDown {
            return Ok(None);
        }
        let gadget = TypedResource::new(output_id, GadgetSpec {
            value: widget.spec.value * 2,
        });
        Ok(Some(gadget.into_dynamic()?))
    }
}

async fn eventually<F, Fut, T>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(found) = probe().await {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

fn start(store: &Store, input_kind: InputKind) -> CancellationToken {
    let mut engine = Engine::new(store.clone());
    engine.register(DoubleController { input_kind });
    let ct = CancellationToken::new();
    tokio::spawn(engine.run(ct.clone()));
    ct
}

#[tokio::test(start_paused = true)]
async fn transform_produces_owned_annotated_output() {
    let store = Store::new();
    let ct = start(&store, InputKind::Weak);

    store
        .create_as(TypedResource::new("w1", WidgetSpec { value: 21 }))
        .await
        .unwrap();

    let gadget = eventually(|| {
        let store = store.clone();
        async move { store.get_as::<GadgetSpec>("w1").await.ok() }
    })
    .await;
    assert_eq!(gadget.spec.value, 42);
    assert_eq!(gadget.metadata.owner, "DoubleController");
    assert!(gadget
        .metadata
        .annotations
        .contains_key(INPUT_VERSION_ANNOTATION));
    ct.cancel();
}

#[tokio::test(start_paused = true)]
async fn unchanged_inputs_do_not_bump_output_version() {
    let store = Store::new();
    let ct = start(&store, InputKind::Weak);

    store
        .create_as(TypedResource::new("w1", WidgetSpec { value: 1 }))
        .await
        .unwrap();
    let first = eventually(|| {
        let store = store.clone();
        async move { store.get_as::<GadgetSpec>("w1").await.ok() }
    })
    .await;

    // The output write itself is observed on the output watch; the resulting
    // reconcile must see the unchanged cut and leave the version alone.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let second = store.get_as::<GadgetSpec>("w1").await.unwrap();
    assert_eq!(first.metadata.version, second.metadata.version);
    assert_eq!(
        first.metadata.annotations.get(INPUT_VERSION_ANNOTATION),
        second.metadata.annotations.get(INPUT_VERSION_ANNOTATION)
    );
    ct.cancel();
}

#[tokio::test(start_paused = true)]
async fn input_update_recomputes_output() {
    let store = Store::new();
    let ct = start(&store, InputKind::Weak);

    let created = store
        .create_as(TypedResource::new("w1", WidgetSpec { value: 1 }))
        .await
        .unwrap();
    eventually(|| {
        let store = store.clone();
        async move {
            store
                .get_as::<GadgetSpec>("w1")
                .await
                .ok()
                .filter(|g| g.spec.value == 2)
        }
    })
    .await;

    let mut next = created.clone();
    next.spec["value"] = 5.into();
    store.update("", next, created.metadata.version).await.unwrap();
    eventually(|| {
        let store = store.clone();
        async move {
            store
                .get_as::<GadgetSpec>("w1")
                .await
                .ok()
                .filter(|g| g.spec.value == 10)
        }
    })
    .await;
    ct.cancel();
}

#[tokio::test(start_paused = true)]
async fn vanished_inputs_retire_the_output() {
    let store = Store::new();
    let ct = start(&store, InputKind::Weak);

    store
        .create_as(TypedResource::new("w1", WidgetSpec { value: 1 }))
        .await
        .unwrap();
    eventually(|| {
        let store = store.clone();
        async move { store.get_as::<GadgetSpec>("w1").await.ok() }
    })
    .await;

    let reference = ResourceRef::new(WidgetSpec::KIND, "w1");
    assert!(store.teardown(&reference, "").await.unwrap());
    store.destroy(&reference, "").await.unwrap();

    eventually(|| {
        let store = store.clone();
        async move {
            match store.get_as::<GadgetSpec>("w1").await {
                Err(err) if err.is_not_found() => Some(()),
                _ => None,
            }
        }
    })
    .await;
    ct.cancel();
}

#[tokio::test(start_paused = true)]
async fn strong_inputs_carry_the_controller_finalizer() {
    let store = Store::new();
    let ct = start(&store, InputKind::Strong);

    store
        .create_as(TypedResource::new("w1", WidgetSpec { value: 1 }))
        .await
        .unwrap();
    let reference = ResourceRef::new(WidgetSpec::KIND, "w1");

    // The engine stamps its finalizer on sight.
    eventually(|| {
        let store = store.clone();
        let reference = reference.clone();
        async move {
            store
                .get(&reference)
                .await
                .ok()
                .filter(|w| w.metadata.has_finalizer("DoubleController"))
        }
    })
    .await;

    // Teardown: the engine must finish its cleanup and let go.
    store.teardown(&reference, "").await.unwrap();
    eventually(|| {
        let store = store.clone();
        let reference = reference.clone();
        async move {
            store
                .get(&reference)
                .await
                .ok()
                .filter(|w| w.metadata.finalizers.is_empty())
        }
    })
    .await;
    store.destroy(&reference, "").await.unwrap();
    ct.cancel();
}
