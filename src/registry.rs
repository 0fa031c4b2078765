//! Schedule registry.
//!
//! Owns schedule identity and registration semantics on top of the
//! active backend. The registry holds nothing but the backend handle —
//! the backend's store is the single source of truth, so two registry
//! instances (say, two CLI invocations) racing on the same derived id
//! resolve through the backend's conflict detection rather than any
//! in-process locking.

use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{BackendError, QueueBackend, ScheduleFilter};
use crate::core::job::{JobTemplate, ScheduleRecord};
use crate::core::trigger::{RawTrigger, TriggerError, TriggerSpec};
use crate::core::types::{PipelineRef, ScheduleId};
use crate::events::{Event, EventBus};

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Trigger validation failed.
    #[error(transparent)]
    Trigger(#[from] TriggerError),

    /// The backend rejected the operation.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One schedule declaration for bulk registration, typically loaded from
/// a pipeline configuration file.
#[derive(Debug, Clone)]
pub struct ScheduleDeclaration {
    /// Declaration name, used in per-item results.
    pub name: String,
    /// Raw trigger; absent means the pipeline is manual-only.
    pub trigger: Option<RawTrigger>,
    /// Invocation template.
    pub template: JobTemplate,
    /// Disabled declarations are skipped.
    pub enabled: bool,
    /// Explicit schedule id, overriding derivation.
    pub explicit_id: Option<ScheduleId>,
}

/// Per-item result of [`ScheduleRegistry::schedule_all`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ScheduleOutcome {
    /// The declaration was registered under `id`.
    Registered { name: String, id: ScheduleId },
    /// The declaration was skipped (disabled, or no trigger present).
    Skipped { name: String, reason: String },
    /// Registration failed; the bulk call continued.
    Failed { name: String, error: String },
}

impl ScheduleOutcome {
    /// Whether this outcome is a successful registration.
    pub fn is_registered(&self) -> bool {
        matches!(self, ScheduleOutcome::Registered { .. })
    }
}

/// Derive a deterministic schedule id from the pipeline and the trigger's
/// canonical form.
///
/// UUIDv5 makes the derivation stable across processes and restarts:
/// re-registering an unchanged schedule maps to the same id, and the
/// backend's conflict check turns the re-registration into the intended
/// no-op or overwrite.
pub fn derive_schedule_id(pipeline: &PipelineRef, trigger: &TriggerSpec) -> ScheduleId {
    let material = format!("{}\n{}", pipeline, trigger.canonical());
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes());
    let digest = uuid.simple().to_string();
    ScheduleId::new(format!("{}-{}", pipeline, &digest[..8]))
}

/// Registry for named schedules, backed by the active backend.
pub struct ScheduleRegistry {
    backend: Arc<dyn QueueBackend>,
    event_bus: Option<Arc<EventBus>>,
}

impl ScheduleRegistry {
    /// Create a registry over a backend.
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            event_bus: None,
        }
    }

    /// Attach an event bus for schedule lifecycle events.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// The backend this registry persists through.
    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event).await;
        }
    }

    /// Register a schedule binding `trigger` to `template`.
    ///
    /// Without `explicit_id` the id is derived from the pipeline and the
    /// trigger's canonical form. An existing id fails with a conflict
    /// unless `overwrite` is set, in which case the prior schedule is
    /// replaced.
    pub async fn register(
        &self,
        trigger: TriggerSpec,
        template: JobTemplate,
        explicit_id: Option<ScheduleId>,
        overwrite: bool,
    ) -> Result<ScheduleId, RegistryError> {
        let id = explicit_id
            .unwrap_or_else(|| derive_schedule_id(&template.pipeline, &trigger));

        let record = ScheduleRecord::new(id.clone(), trigger, template)?;
        self.backend.register_schedule(record, overwrite).await?;

        tracing::info!(schedule_id = %id, "Registered schedule");
        self.emit(Event::schedule_registered(id.clone())).await;
        Ok(id)
    }

    /// Normalize and register a raw trigger in one step.
    pub async fn register_raw(
        &self,
        raw: &RawTrigger,
        template: JobTemplate,
        explicit_id: Option<ScheduleId>,
        overwrite: bool,
    ) -> Result<ScheduleId, RegistryError> {
        let trigger = raw.normalize()?;
        self.register(trigger, template, explicit_id, overwrite).await
    }

    /// Register every enabled declaration with a present trigger,
    /// collecting per-item outcomes.
    ///
    /// One bad declaration never blocks the rest; failures are returned
    /// in the outcome list instead of raised.
    pub async fn schedule_all(
        &self,
        declarations: impl IntoIterator<Item = ScheduleDeclaration>,
        overwrite: bool,
    ) -> Vec<ScheduleOutcome> {
        let mut outcomes = Vec::new();

        for declaration in declarations {
            let name = declaration.name.clone();

            if !declaration.enabled {
                outcomes.push(ScheduleOutcome::Skipped {
                    name,
                    reason: "disabled".into(),
                });
                continue;
            }

            let Some(raw) = &declaration.trigger else {
                outcomes.push(ScheduleOutcome::Skipped {
                    name,
                    reason: "no schedule declared".into(),
                });
                continue;
            };

            match self
                .register_raw(
                    raw,
                    declaration.template,
                    declaration.explicit_id,
                    overwrite,
                )
                .await
            {
                Ok(id) => outcomes.push(ScheduleOutcome::Registered { name, id }),
                Err(e) => {
                    tracing::warn!(declaration = %name, error = %e, "Failed to register schedule");
                    outcomes.push(ScheduleOutcome::Failed {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }

        outcomes
    }

    /// Delete a schedule. Idempotent.
    pub async fn cancel(&self, id: &ScheduleId) -> Result<(), RegistryError> {
        self.backend.cancel_schedule(id).await?;
        self.emit(Event::schedule_cancelled(id.clone())).await;
        Ok(())
    }

    /// Pause a schedule.
    pub async fn pause(&self, id: &ScheduleId) -> Result<(), RegistryError> {
        self.backend.pause_schedule(id).await?;
        self.emit(Event::schedule_paused(id.clone())).await;
        Ok(())
    }

    /// Resume a schedule.
    pub async fn resume(&self, id: &ScheduleId) -> Result<(), RegistryError> {
        self.backend.resume_schedule(id).await?;
        self.emit(Event::schedule_resumed(id.clone())).await;
        Ok(())
    }

    /// List schedules matching a filter.
    pub async fn list(
        &self,
        filter: &ScheduleFilter,
    ) -> Result<Vec<ScheduleRecord>, RegistryError> {
        Ok(self.backend.list_schedules(filter).await?)
    }
}
