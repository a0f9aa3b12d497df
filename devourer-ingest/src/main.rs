mod config;
mod customer;
mod ingest_bitwerx;
mod ingest_hubspot;
mod ingest_vetsuccess;
mod queue;
mod validators;

use std::sync::Arc;

use devourer_bus::{LogTransport, Publisher};
use devourer_db::{Driver, PgUpstream};
use devourer_kv::{Kv, RedisKv};
use log::{info, warn};
use miette::{miette, IntoDiagnostic};
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::customer::{Customer, CustomerConfig, JsonFileBackend};
use crate::ingest_bitwerx::BitwerxImport;
use crate::ingest_hubspot::Registry;

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();

    let config = IngestConfig::config().into_diagnostic()?;
    let kv: Arc<dyn Kv> = Arc::new(
        RedisKv::connect(&config.redis_url)
            .await
            .into_diagnostic()?,
    );
    let backend = JsonFileBackend::new(&config.secrets_path);
    let customers = Arc::new(
        CustomerConfig::load(&backend, &config.config_name).into_diagnostic()?,
    );
    // The real bus client is injected by deployment; local runs log.
    let publisher = Arc::new(Publisher::new(&config.bus_topic, Arc::new(LogTransport)));

    let abort = CancellationToken::new();
    tokio::spawn({
        let abort = abort.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing the current table then stopping");
                abort.cancel();
            }
        }
    });

    let result = run_ingest(&config, kv, customers, publisher.clone(), abort).await;
    publisher.close().await;
    result
}

async fn run_ingest(
    config: &IngestConfig,
    kv: Arc<dyn Kv>,
    customers: Arc<CustomerConfig>,
    publisher: Arc<Publisher>,
    abort: CancellationToken,
) -> miette::Result<()> {
    for (name, customer) in customers.all() {
        if abort.is_cancelled() {
            warn!("ingest aborted before customer {name}");
            return Ok(());
        }
        run_customer_datasources(config, &kv, name, customer, &publisher).await?;
    }

    if abort.is_cancelled() {
        return Ok(());
    }

    // HubSpot fans out across all configured customers in one pass.
    ingest_hubspot::run(
        kv,
        Arc::new(hubspot::HubSpot::new()),
        publisher,
        customers,
        Registry::default(),
        &config.hubspot,
    )
    .await
}

async fn run_customer_datasources(
    config: &IngestConfig,
    kv: &Arc<dyn Kv>,
    name: &str,
    customer: &Customer,
    publisher: &Publisher,
) -> miette::Result<()> {
    for source in &customer.datasources {
        match source.as_str() {
            ingest_vetsuccess::DATA_SOURCE => {
                let url = config
                    .upstream_db_url
                    .as_deref()
                    .ok_or_else(|| miette!("vetsuccess configured but upstream_db_url is not"))?;
                let db = PgUpstream::from_url(url, config.db_pool_size).into_diagnostic()?;
                let driver = Driver::with_default_tables(Arc::new(db), kv.clone());
                let stats = ingest_vetsuccess::run_import(name, driver, publisher)
                    .await
                    .into_diagnostic()?;
                info!("{name}: vetsuccess emitted {} records", stats.records);
            }
            ingest_bitwerx::DATA_SOURCE => {
                let creds = customer.integrations.bitwerx.as_ref().ok_or_else(|| {
                    miette!("bitwerx configured for {name} but credentials are missing")
                })?;
                BitwerxImport::new(&config.bitwerx, kv.as_ref(), publisher)
                    .run(name, creds)
                    .await
                    .into_diagnostic()?;
            }
            other => warn!("{name}: no such data source plugin `{other}`"),
        }
    }
    Ok(())
}
