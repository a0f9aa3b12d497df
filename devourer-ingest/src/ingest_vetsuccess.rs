//! VetSuccess import: the driver streams `(table, record)` pairs over a
//! channel and every record leaves as an envelope on the bus.

use devourer_bus::{Envelope, Meta, PublishError, Publisher};
use devourer_db::{Driver, FetchError, RunStats};
use log::info;
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::mpsc;

pub const DATA_SOURCE: &str = "vetsuccess";

const STREAM_BUFFER: usize = 1024;

#[derive(Debug, Error, Diagnostic)]
pub enum VetSuccessError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Publish(#[from] PublishError),

    #[error("driver task exited abnormally")]
    Join(#[source] tokio::task::JoinError),
}

pub async fn run_import(
    customer: &str,
    driver: Driver,
    publisher: &Publisher,
) -> Result<RunStats, VetSuccessError> {
    let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
    let fetch = tokio::spawn(async move { driver.stream_updates(tx).await });

    while let Some((table, record)) = rx.recv().await {
        publisher
            .publish(&Envelope::new(
                Meta::new(customer, DATA_SOURCE, &table),
                record.to_json(),
            ))
            .await?;
    }

    let stats = fetch.await.map_err(VetSuccessError::Join)??;
    publisher.wait().await;
    info!(
        "{customer}: VetSuccess import finished, {} new records across {} tables",
        stats.records, stats.tables,
    );
    Ok(stats)
}
