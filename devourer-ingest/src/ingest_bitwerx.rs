//! Bitwerx line-item import over the partner download-request protocol:
//! request a download, poll its status until complete, fetch and gunzip the
//! payload, validate, publish, then advance the per-practice watermark.

use std::io::Read;
use std::time::Duration;

use devourer_bus::{Envelope, Meta, PublishError, Publisher};
use devourer_kv::{Kv, KvError};
use flate2::read::GzDecoder;
use log::info;
use miette::Diagnostic;
use reqwest::header::LOCATION;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::config::BitwerxSettings;
use crate::customer::BitwerxCredentials;
use crate::validators::{validate_line_item, LineItemInvalid};

pub const DATA_SOURCE: &str = "bitwerx";
pub const TABLE_NAME: &str = "lineitem";

/// Watermark text forms: what we store, and the never-ingested default sent
/// verbatim as `lastUpdatedDateUtc`.
const STORE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const NEVER_INGESTED: &str = "0001-01-01T00:00:00.0000000Z";

pub fn practice_key(practice_id: &str) -> String {
    format!("devourer.datasource.bitwerx.practice-{practice_id}")
}

#[derive(Debug, Error, Diagnostic)]
pub enum BitwerxError {
    #[error("error executing Bitwerx request")]
    Request(#[source] reqwest::Error),

    #[error("download request was not accepted: status {0}")]
    UnexpectedStatus(u16),

    #[error("202 response carried no Location header")]
    MissingLocation,

    #[error("download did not complete within {0}s")]
    PollTimeout(u64),

    #[error("payload fetch failed: status {0}")]
    DownloadFailed(u16),

    #[error("status document carried no downloadUrl")]
    MalformedStatus,

    #[error("could not decompress the payload")]
    Gunzip(#[source] std::io::Error),

    #[error("payload is not a JSON array of line items")]
    Payload(#[source] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] LineItemInvalid),

    #[error("line item carries an unparseable `updated` value: {0:?}")]
    BadTimestamp(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Publish(#[from] PublishError),
}

pub struct BitwerxImport<'a> {
    client: reqwest::Client,
    settings: &'a BitwerxSettings,
    kv: &'a dyn Kv,
    publisher: &'a Publisher,
}

impl<'a> BitwerxImport<'a> {
    pub fn new(
        settings: &'a BitwerxSettings,
        kv: &'a dyn Kv,
        publisher: &'a Publisher,
    ) -> BitwerxImport<'a> {
        BitwerxImport {
            client: reqwest::Client::new(),
            settings,
            kv,
            publisher,
        }
    }

    pub async fn run(
        &self,
        customer: &str,
        creds: &BitwerxCredentials,
    ) -> Result<u64, BitwerxError> {
        let practice_id = &self.settings.practice_id;
        let last_updated = self
            .kv
            .get(&practice_key(practice_id))
            .await?
            .unwrap_or_else(|| NEVER_INGESTED.to_owned());

        let response = self
            .client
            .post(format!("{}/api/downloadRequest", self.settings.base_url))
            .basic_auth(&creds.username, Some(&creds.password))
            .json(&serde_json::json!({
                "practiceId": practice_id,
                "lastUpdatedDateUtc": last_updated,
                "recordType": "lineItem",
            }))
            .send()
            .await
            .map_err(BitwerxError::Request)?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(BitwerxError::UnexpectedStatus(response.status().as_u16()));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or(BitwerxError::MissingLocation)?;

        let timeout = Duration::from_secs(self.settings.download_timeout_seconds);
        let status = tokio::time::timeout(timeout, self.poll_status(&location, creds))
            .await
            .map_err(|_| BitwerxError::PollTimeout(self.settings.download_timeout_seconds))??;

        let items = self.download(&status).await?;
        let count = self.publish_items(customer, practice_id, items).await?;

        info!(
            "{customer}: Bitwerx data source, practiceId - {practice_id}, {count} records published",
        );
        Ok(count)
    }

    /// Polls the status resource until the download reports `Complete`. The
    /// caller bounds this with the download deadline.
    async fn poll_status(
        &self,
        location: &str,
        creds: &BitwerxCredentials,
    ) -> Result<JsonValue, BitwerxError> {
        let delay = Duration::from_secs(self.settings.poll_delay_seconds);
        loop {
            tokio::time::sleep(delay).await;
            let response = self
                .client
                .get(location)
                .basic_auth(&creds.username, Some(&creds.password))
                .send()
                .await
                .map_err(BitwerxError::Request)?;
            if response.status() != StatusCode::OK {
                continue;
            }
            let status: JsonValue = response.json().await.map_err(BitwerxError::Request)?;
            if status["status"] == "Complete" {
                return Ok(status);
            }
        }
    }

    async fn download(&self, status: &JsonValue) -> Result<Vec<JsonValue>, BitwerxError> {
        let url = status["downloadUrl"]
            .as_str()
            .ok_or(BitwerxError::MalformedStatus)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(BitwerxError::Request)?;
        if response.status() != StatusCode::OK {
            return Err(BitwerxError::DownloadFailed(response.status().as_u16()));
        }
        let compressed = response.bytes().await.map_err(BitwerxError::Request)?;

        let mut payload = Vec::new();
        GzDecoder::new(compressed.as_ref())
            .read_to_end(&mut payload)
            .map_err(BitwerxError::Gunzip)?;
        serde_json::from_slice(&payload).map_err(BitwerxError::Payload)
    }

    /// Validates and publishes every item; the watermark only moves once the
    /// whole batch went through.
    async fn publish_items(
        &self,
        customer: &str,
        practice_id: &str,
        items: Vec<JsonValue>,
    ) -> Result<u64, BitwerxError> {
        let mut max_updated = chrono::NaiveDateTime::MIN;
        let mut count = 0u64;

        for mut item in items {
            validate_line_item(&item)?;

            let raw_updated = item["updated"].as_str().unwrap_or_default();
            let updated = chrono::NaiveDateTime::parse_from_str(
                raw_updated.trim_end_matches('Z'),
                PARSE_FORMAT,
            )
            .map_err(|_| BitwerxError::BadTimestamp(raw_updated.to_owned()))?;
            max_updated = max_updated.max(updated);

            if let Some(object) = item.as_object_mut() {
                object
                    .entry("_practice_id")
                    .or_insert_with(|| JsonValue::String(practice_id.to_owned()));
            }
            self.publisher
                .publish(&Envelope::new(
                    Meta::new(customer, DATA_SOURCE, TABLE_NAME),
                    item,
                ))
                .await?;
            count += 1;
        }

        if max_updated > chrono::NaiveDateTime::MIN {
            self.kv
                .set(
                    &practice_key(practice_id),
                    &max_updated.format(STORE_FORMAT).to_string(),
                )
                .await?;
        }
        self.publisher.wait().await;
        Ok(count)
    }
}
