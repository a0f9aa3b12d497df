//! HubSpot fan-out: one continuation chain per (customer, object), gated so
//! an object only starts once its predecessor's chain has fully drained.
//! Chains are coordinated through KV wait-groups, so independently scheduled
//! workers need no in-process handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_humanize::HumanTime;
use devourer_bus::{Envelope, Meta, PublishError, Publisher};
use devourer_kv::{Kv, KvError, WaitGroup};
use hubspot::{HubSpot, HubSpotError, Page, PageRequest};
use itertools::Itertools;
use log::{error, info};
use miette::{Diagnostic, IntoDiagnostic};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::config::HubSpotSettings;
use crate::customer::{CustomerConfig, HubSpotObject};
use crate::queue::{self, TaskQueue};

pub const DATA_SOURCE: &str = "hubspot";

#[derive(Debug, Error, Diagnostic)]
pub enum TaskError {
    #[error("predecessor chain was stopped")]
    WaitGroupStopped,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Fetch(#[from] HubSpotError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Publish(#[from] PublishError),

    #[error("no hubspot config for customer `{customer}`, object `{object}`")]
    MissingObjectConfig { customer: String, object: String },

    #[error("item of `{object}` lacks its last-update property")]
    MissingLastUpdate { object: String },
}

/// One page-worth of work in a chain. Continuations carry the `after`
/// cursor and the initial-import flag derived on the first page.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub customer: String,
    pub object: String,
    pub limit: usize,
    pub after: Option<String>,
    pub is_initial_import: Option<bool>,
    pub blocking_key: Option<String>,
    pub current_key: String,
}

/// Where pages come from; the API client in production, scripted sources in
/// tests.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, req: PageRequest<'_>) -> Result<Page, HubSpotError>;
}

#[async_trait]
impl PageSource for HubSpot {
    async fn fetch_page(&self, req: PageRequest<'_>) -> Result<Page, HubSpotError> {
        HubSpot::fetch_page(self, req).await
    }
}

pub type Transform = fn(&mut JsonValue);

/// Per-object hooks, replacing attribute-probe dispatch with explicit
/// registration.
#[derive(Clone, Default)]
pub struct Registry {
    transforms: hashbrown::HashMap<String, Transform>,
}

impl Registry {
    #[allow(dead_code)]
    pub fn with_transform(mut self, object: &str, transform: Transform) -> Registry {
        self.transforms.insert(object.to_owned(), transform);
        self
    }

    fn transform_for(&self, object: &str) -> Option<Transform> {
        self.transforms.get(object).copied()
    }
}

enum Gate {
    Clear,
    Blocked,
}

struct HubSpotIngest {
    kv: Arc<dyn Kv>,
    source: Arc<dyn PageSource>,
    publisher: Arc<Publisher>,
    customers: Arc<CustomerConfig>,
    registry: Registry,
    queue: TaskQueue<FetchTask>,
    gate_retry: Duration,
}

pub async fn run(
    kv: Arc<dyn Kv>,
    source: Arc<dyn PageSource>,
    publisher: Arc<Publisher>,
    customers: Arc<CustomerConfig>,
    registry: Registry,
    settings: &HubSpotSettings,
) -> miette::Result<()> {
    run_inner(
        kv,
        source,
        publisher,
        customers,
        registry,
        settings.page_limit,
        Duration::from_secs(settings.gate_retry_seconds),
        settings.worker_count,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    kv: Arc<dyn Kv>,
    source: Arc<dyn PageSource>,
    publisher: Arc<Publisher>,
    customers: Arc<CustomerConfig>,
    registry: Registry,
    page_limit: usize,
    gate_retry: Duration,
    worker_count: usize,
) -> miette::Result<()> {
    let (queue, rx) = TaskQueue::new();
    let mut chains = 0;

    for (customer, integration) in customers.with_hubspot() {
        let object_names = integration
            .objects
            .keys()
            .sorted_by_key(|name| (integration.objects[*name].priority, (*name).clone()));

        let run_id = Uuid::new_v4().simple().to_string();
        let mut blocking_key: Option<String> = None;
        for object in object_names {
            let current_key = format!("wg_{customer}_{object}_{run_id}");
            WaitGroup::new(&current_key, kv.as_ref())
                .add(1)
                .await
                .into_diagnostic()?;
            queue.enqueue(FetchTask {
                customer: customer.to_owned(),
                object: object.clone(),
                limit: page_limit,
                after: None,
                is_initial_import: None,
                blocking_key: blocking_key.replace(current_key.clone()),
                current_key,
            });
            chains += 1;
        }
    }
    info!("launched {chains} hubspot object chains");

    let ctx = Arc::new(HubSpotIngest {
        kv,
        source,
        publisher,
        customers,
        registry,
        queue: queue.clone(),
        gate_retry,
    });
    let handler = move |task: FetchTask| {
        let ctx = ctx.clone();
        async move { ctx.handle(task).await }
    };
    queue::process(queue, rx, worker_count, handler).await;
    Ok(())
}

impl HubSpotIngest {
    async fn handle(&self, task: FetchTask) {
        match self.gate(&task).await {
            Ok(Gate::Blocked) => {
                self.queue.enqueue_after(self.gate_retry, task);
                return;
            }
            Ok(Gate::Clear) => {}
            Err(err) => {
                self.fail(&task, err).await;
                return;
            }
        }

        if let Err(err) = self.process(&task).await {
            self.fail(&task, err).await;
        }
    }

    /// Start-after-predecessor gate. Zero (or no predecessor) clears; a
    /// poisoned predecessor aborts this chain too; anything else retries
    /// after a countdown.
    async fn gate(&self, task: &FetchTask) -> Result<Gate, TaskError> {
        let Some(blocking_key) = &task.blocking_key else {
            return Ok(Gate::Clear);
        };
        match WaitGroup::new(blocking_key, self.kv.as_ref()).count().await? {
            0 => Ok(Gate::Clear),
            devourer_kv::STOPPED => Err(TaskError::WaitGroupStopped),
            _ => Ok(Gate::Blocked),
        }
    }

    async fn process(&self, task: &FetchTask) -> Result<(), TaskError> {
        let object_config = self.object_config(task)?;
        let last_update_key = format!("last-update__{}_{}", task.customer, task.object);
        let last_update = match self.kv.get(&last_update_key).await? {
            None => None,
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| KvError::MalformedInteger {
                key: last_update_key.clone(),
                value: raw,
            })?),
        };
        let is_initial = task.is_initial_import.unwrap_or(last_update.is_none());

        let apikey = self
            .customers
            .hubspot_for(&task.customer)
            .map(|integration| integration.apikey.clone())
            .unwrap_or_default();
        let page = self
            .source
            .fetch_page(PageRequest {
                object: &task.object,
                api_key: &apikey,
                limit: task.limit,
                properties: &object_config.properties,
                last_update_field: &object_config.last_update_field,
                after: task.after.as_deref(),
                last_update,
            })
            .await?;

        let last_page = match page.next_after() {
            Some(after) => {
                WaitGroup::new(&task.current_key, self.kv.as_ref())
                    .add(1)
                    .await?;
                self.queue.enqueue(FetchTask {
                    after: Some(after.to_owned()),
                    is_initial_import: Some(is_initial),
                    ..task.clone()
                });
                false
            }
            None => true,
        };

        let mut new_last_update = last_update
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
            .map(|dt| dt.naive_utc());
        for mut item in page.results {
            if let Some(transform) = self.registry.transform_for(&task.object) {
                transform(&mut item);
            }
            let item_time = self.last_update_of(&item, object_config, task)?;
            new_last_update = Some(match new_last_update {
                Some(current) => current.max(item_time),
                None => item_time,
            });
            self.publisher
                .publish(&Envelope::new(
                    Meta::new(&task.customer, DATA_SOURCE, &task.object)
                        .initial_import(is_initial),
                    item,
                ))
                .await?;
        }

        if let Some(latest) = new_last_update {
            let behind = HumanTime::from(latest.and_utc().signed_duration_since(Utc::now()));
            info!(
                "[HubSpot: {}] {} current through versions from {behind}",
                task.customer, task.object,
            );
            if last_page {
                self.kv
                    .set(&last_update_key, &latest.and_utc().timestamp().to_string())
                    .await?;
            }
        }

        // All of this page's submissions must land before the chain moves on.
        self.publisher.wait().await;

        WaitGroup::new(&task.current_key, self.kv.as_ref())
            .done()
            .await?;
        Ok(())
    }

    fn object_config(&self, task: &FetchTask) -> Result<&HubSpotObject, TaskError> {
        self.customers
            .hubspot_for(&task.customer)
            .and_then(|integration| integration.objects.get(&task.object))
            .ok_or_else(|| TaskError::MissingObjectConfig {
                customer: task.customer.clone(),
                object: task.object.clone(),
            })
    }

    fn last_update_of(
        &self,
        item: &JsonValue,
        object_config: &HubSpotObject,
        task: &FetchTask,
    ) -> Result<NaiveDateTime, TaskError> {
        let raw = item
            .get("properties")
            .and_then(|properties| properties.get(&object_config.last_update_field))
            .and_then(JsonValue::as_str)
            .ok_or_else(|| TaskError::MissingLastUpdate {
                object: task.object.clone(),
            })?;
        Ok(hubspot::parse_datetime(raw)?)
    }

    /// Any failure poisons the task's own wait-group, aborting every
    /// successor gated behind it.
    async fn fail(&self, task: &FetchTask, err: TaskError) {
        error!(
            "[HubSpot: {}] task for {} after[{:?}] failed: {err}",
            task.customer, task.object, task.after,
        );
        if let Err(stop_err) = WaitGroup::new(&task.current_key, self.kv.as_ref())
            .stop()
            .await
        {
            error!(
                "[HubSpot: {}] could not poison {}: {stop_err}",
                task.customer, task.current_key,
            );
        }
    }
}
