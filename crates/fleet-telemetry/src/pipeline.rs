// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Orchestration of a single run: enumerate, derive, publish.
//!
//! Failures are asymmetric. Losing the entity listing aborts the run since the
//! identifiers of the remaining entities are unknown. Anything that goes wrong for a single
//! entity is recorded against that entity and the run carries on; the next scheduled run
//! processes it again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::enumerator::{EntityEnumerator, PageSource};
use crate::error::FleetError;

const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Lifecycle of a run and, for failed entities, the step they failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Enumerating,
    Deriving,
    Publishing,
    Done,
    Failed,
}

/// Result of processing one entity.
#[derive(Debug)]
pub struct EntityOutcome {
    pub entity_id: String,
    pub result: Result<(), FleetError>,
}

impl EntityOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Step in which the entity failed, `Done` when it succeeded.
    pub fn stage(&self) -> Stage {
        match &self.result {
            Ok(()) => Stage::Done,
            Err(FleetError::MetadataDeclaration { .. } | FleetError::Ingestion { .. }) => {
                Stage::Publishing
            }
            Err(FleetError::Enumeration(_)) => Stage::Enumerating,
            Err(FleetError::Cancelled { .. } | FleetError::Aborted { .. }) => Stage::Failed,
            Err(_) => Stage::Deriving,
        }
    }
}

/// One execution of a pipeline.
#[derive(Debug)]
pub struct PipelineRun {
    pub name: &'static str,
    pub state: Stage,
    pub outcomes: Vec<EntityOutcome>,
    /// Set only when the run failed, which can only happen while enumerating.
    pub error: Option<FleetError>,
    pub elapsed: Duration,
}

impl PipelineRun {
    pub fn failed(name: &'static str, error: FleetError, started: Instant) -> Self {
        Self {
            name,
            state: Stage::Failed,
            outcomes: Vec::new(),
            error: Some(error),
            elapsed: started.elapsed(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == Stage::Done
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn outcome(&self, entity_id: &str) -> Option<&EntityOutcome> {
        self.outcomes.iter().find(|o| o.entity_id == entity_id)
    }

    fn log_summary(&self) {
        let failed = self.outcomes.len() - self.succeeded();
        match &self.error {
            Some(e) => error!(
                "{} run failed after {} ms and {} entities: {e}",
                self.name,
                self.elapsed.as_millis(),
                self.outcomes.len()
            ),
            None if failed > 0 => {
                warn!(
                    "{} run done in {} ms: {} succeeded, {failed} failed",
                    self.name,
                    self.elapsed.as_millis(),
                    self.succeeded()
                );
                for outcome in self.failures() {
                    if let Err(e) = &outcome.result {
                        warn!(
                            "{}: {} failed while {:?}: {e}",
                            self.name,
                            outcome.entity_id,
                            outcome.stage()
                        );
                    }
                }
            }
            None => info!(
                "{} run done in {} ms: {} entities processed",
                self.name,
                self.elapsed.as_millis(),
                self.outcomes.len()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Upper bound on entities processed concurrently.
    pub max_in_flight: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Per-entity work of a pipeline. The chain inside `process` runs sequentially.
#[async_trait]
pub trait EntityProcessor: Send + Sync + 'static {
    type Item: Send + 'static;

    fn entity_id(&self, item: &Self::Item) -> String;

    async fn process(&self, item: Self::Item) -> Result<(), FleetError>;
}

/// Entry point shared by every trigger.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, cancel: CancellationToken) -> PipelineRun;
}

/// Runs `processor` over every item of `source` with at most `options.max_in_flight`
/// entities in progress.
///
/// On cancellation no new entity is started: the rest of the listing is still walked and
/// every remaining entity is recorded as [`FleetError::Cancelled`]. Entities already in
/// progress finish and keep whatever they committed. A task that panics is recorded as
/// [`FleetError::Aborted`] against its entity.
pub async fn run_pipeline<S, P>(
    name: &'static str,
    source: S,
    processor: Arc<P>,
    options: RunOptions,
    cancel: CancellationToken,
) -> PipelineRun
where
    S: PageSource,
    P: EntityProcessor<Item = S::Item>,
{
    let started = Instant::now();
    debug!("{name}: enumerating");

    let semaphore = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
    let mut tasks: JoinSet<EntityOutcome> = JoinSet::new();
    let mut enumerator = EntityEnumerator::new(source);
    let mut outcomes = Vec::new();
    let mut failure = None;

    let mut pending: HashMap<Id, String> = HashMap::new();
    let mut cancelled = false;

    loop {
        let next = if cancelled {
            enumerator.next().await
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("{name}: cancelled, no further entities will be started");
                    cancelled = true;
                    continue;
                }
                next = enumerator.next() => next,
            }
        };

        let item = match next {
            None => break,
            Some(Err(e)) => {
                failure = Some(e);
                break;
            }
            Some(Ok(item)) => item,
        };
        let entity_id = processor.entity_id(&item);

        let permit = if cancelled {
            None
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            }
        };
        let Some(permit) = permit else {
            if !cancelled {
                warn!("{name}: cancelled, no further entities will be started");
                cancelled = true;
            }
            outcomes.push(EntityOutcome {
                result: Err(FleetError::Cancelled {
                    entity_id: entity_id.clone(),
                }),
                entity_id,
            });
            continue;
        };

        let processor = Arc::clone(&processor);
        let task_entity_id = entity_id.clone();
        let handle = tasks.spawn(async move {
            let result = processor.process(item).await;
            drop(permit);
            EntityOutcome {
                entity_id: task_entity_id,
                result,
            }
        });
        pending.insert(handle.id(), entity_id);
    }

    debug!(
        "{name}: enumeration finished after {} pages, waiting for {} entities",
        enumerator.pages_fetched(),
        tasks.len()
    );

    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, outcome)) => {
                pending.remove(&id);
                outcomes.push(outcome);
            }
            Err(e) => {
                let entity_id = pending.remove(&e.id()).unwrap_or_default();
                error!("{name}: entity task for {entity_id} did not complete: {e}");
                outcomes.push(EntityOutcome {
                    result: Err(FleetError::Aborted {
                        entity_id: entity_id.clone(),
                        reason: e.to_string(),
                    }),
                    entity_id,
                });
            }
        }
    }

    let run = PipelineRun {
        name,
        state: if failure.is_some() {
            Stage::Failed
        } else {
            Stage::Done
        },
        outcomes,
        error: failure,
        elapsed: started.elapsed(),
    };
    run.log_summary();
    run
}
