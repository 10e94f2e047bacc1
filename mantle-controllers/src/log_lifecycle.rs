//! Keeps per-machine log stores in step with the machines that exist.
use async_trait::async_trait;
use mantle_core::specs::machine::LinkSpec;
use mantle_core::{DynamicResource, Phase, Selector, Spec};
use mantle_logstore::{LiveMachines, StoreManager};
use mantle_runtime::{Controller, ControllerError, Input, InputKind, Output};
use mantle_store::Store;
use tracing::debug;

/// Creates a machine's log store handle when its link appears and drops it
/// (ending followers) once the machine is gone; its rows become orphans for
/// the next cleanup sweep.
pub struct LogStoreLifecycleController {
    manager: StoreManager,
}

impl LogStoreLifecycleController {
    #[must_use]
    pub fn new(manager: StoreManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Controller for LogStoreLifecycleController {
    fn name(&self) -> &'static str {
        "LogStoreLifecycleController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::kind(LinkSpec::KIND, InputKind::Weak)]
    }

    fn outputs(&self) -> Vec<Output> {
        Vec::new()
    }

    async fn transform(
        &self,
        store: &Store,
        output_id: &str,
    ) -> Result<Option<DynamicResource>, ControllerError> {
        match store.get_as::<LinkSpec>(output_id).await {
            Ok(link) if link.metadata.phase == Phase::Running => {
                let _ = self.manager.machine_store(output_id);
                debug!(machine = output_id, "log store ready");
            }
            Ok(_) => {
                self.manager.remove_machine(output_id);
                debug!(machine = output_id, "log store retiring with machine");
            }
            Err(err) if err.is_not_found() => {
                self.manager.remove_machine(output_id);
            }
            Err(err) => return Err(err.into()),
        }
        Ok(None)
    }
}

/// Live-machine source for the log store's orphan cleanup: every machine
/// with a link resource, whatever its phase.
pub struct LinkedMachines {
    store: Store,
}

impl LinkedMachines {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LiveMachines for LinkedMachines {
    async fn live_machine_ids(&self) -> Vec<String> {
        self.store
            .list_as::<LinkSpec>(&Selector::all())
            .await
            .map(|links| links.into_iter().map(|l| l.metadata.id).collect())
            .unwrap_or_default()
    }
}
