//! Minimal HubSpot CRM v3 client for incremental object sync.
//!
//! A first sync lists objects with `GET /crm/v3/objects/<type>`; once a
//! watermark exists, changes come from `POST /crm/v3/objects/<type>/search`
//! filtered on the object's last-update property. Both shapes return the
//! same page structure with an opaque `after` continuation token.

use chrono::NaiveDateTime;
use log::debug;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.hubapi.com";

/// Accepted renderings of HubSpot's last-update properties, tried in order.
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%SZ"];

#[derive(Debug, Error, Diagnostic)]
pub enum HubSpotError {
    #[error("error building HubSpot request")]
    RequestBuild(#[source] reqwest::Error),

    #[error("error executing HubSpot request")]
    RequestExecute(#[source] reqwest::Error),

    #[error("unable to fetch {object} after[{after:?}]: status {status}")]
    Status {
        object: String,
        after: Option<String>,
        status: u16,
    },

    #[error("error deserializing HubSpot response")]
    Deserialize(#[source] reqwest::Error),

    #[error("unparseable HubSpot datetime: {0:?}")]
    DatetimeFormat(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub results: Vec<serde_json::Value>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub next: Option<PagingNext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagingNext {
    pub after: String,
}

impl Page {
    pub fn next_after(&self) -> Option<&str> {
        self.paging
            .as_ref()
            .and_then(|paging| paging.next.as_ref())
            .map(|next| next.after.as_str())
    }
}

/// One page request: which object, how it is keyed, and where to resume.
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub object: &'a str,
    pub api_key: &'a str,
    pub limit: usize,
    pub properties: &'a [String],
    pub last_update_field: &'a str,
    pub after: Option<&'a str>,
    /// Unix seconds of the stored watermark; presence switches the client
    /// from first-sync listing to incremental search.
    pub last_update: Option<i64>,
}

pub struct HubSpot {
    client: reqwest::Client,
    base_url: String,
}

impl HubSpot {
    pub fn new() -> HubSpot {
        HubSpot::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> HubSpot {
        HubSpot {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    pub async fn fetch_page(&self, req: PageRequest<'_>) -> Result<Page, HubSpotError> {
        debug!(
            "fetching {} page after {:?}, incremental: {}",
            req.object,
            req.after,
            req.last_update.is_some(),
        );

        let request = if let Some(last_update) = req.last_update {
            let url = format!("{}/crm/v3/objects/{}/search", self.base_url, req.object);
            self.client
                .post(url)
                .query(&[("hapikey", req.api_key)])
                .json(&search_body(&req, last_update))
        } else {
            let url = format!("{}/crm/v3/objects/{}", self.base_url, req.object);
            let mut query: Vec<(&str, String)> = vec![
                ("hapikey", req.api_key.to_owned()),
                ("limit", req.limit.to_string()),
                ("sorts", req.last_update_field.to_owned()),
            ];
            for property in req.properties {
                query.push(("properties", property.clone()));
            }
            if let Some(after) = req.after {
                query.push(("after", after.to_owned()));
            }
            self.client.get(url).query(&query)
        };

        let request = request.build().map_err(HubSpotError::RequestBuild)?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(HubSpotError::RequestExecute)?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(HubSpotError::Status {
                object: req.object.to_owned(),
                after: req.after.map(str::to_owned),
                status: response.status().as_u16(),
            });
        }

        response.json().await.map_err(HubSpotError::Deserialize)
    }
}

impl Default for HubSpot {
    fn default() -> Self {
        HubSpot::new()
    }
}

fn search_body(req: &PageRequest<'_>, last_update: i64) -> serde_json::Value {
    let mut body = json!({
        "limit": req.limit,
        "properties": req.properties,
        "sorts": [req.last_update_field],
        "filterGroups": [
            {
                "filters": [
                    {
                        "value": last_update * 1000,
                        "propertyName": req.last_update_field,
                        "operator": "GT",
                    },
                ],
            },
        ],
    });
    if let Some(after) = req.after {
        body["after"] = json!(after);
    }
    body
}

/// Parses a last-update property value, trying each accepted format.
pub fn parse_datetime(raw: &str) -> Result<NaiveDateTime, HubSpotError> {
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(parsed);
        }
    }
    Err(HubSpotError::DatetimeFormat(raw.to_owned()))
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        s.parse().unwrap()
    }

    #[test]
    fn datetime_parse_accepts_both_formats() {
        assert_eq!(
            parse_datetime("2018-03-28T17:54:35.463Z").unwrap(),
            dt("2018-03-28T17:54:35.463"),
        );
        assert_eq!(
            parse_datetime("2018-03-28T17:54:00Z").unwrap(),
            dt("2018-03-28T17:54:00"),
        );
    }

    #[test]
    fn datetime_parse_rejects_other_shapes() {
        assert!(matches!(
            parse_datetime("2018-03-28T17:54Z"),
            Err(HubSpotError::DatetimeFormat(_))
        ));
    }

    fn request<'a>(after: Option<&'a str>, last_update: Option<i64>, properties: &'a [String]) -> PageRequest<'a> {
        PageRequest {
            object: "companies",
            api_key: "key-123",
            limit: 100,
            properties,
            last_update_field: "hs_lastmodifieddate",
            after,
            last_update,
        }
    }

    #[tokio::test]
    async fn first_sync_lists_with_get() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/crm/v3/objects/companies")
                    .query_param("hapikey", "key-123")
                    .query_param("limit", "100")
                    .query_param("properties", "name");
                then.status(200).json_body(json!({
                    "results": [{"id": "1", "properties": {"name": "a"}}],
                    "paging": {"next": {"after": "50"}},
                }));
            })
            .await;

        let properties = vec!["name".to_owned()];
        let client = HubSpot::with_base_url(&server.base_url());
        let page = client
            .fetch_page(request(None, None, &properties))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.next_after(), Some("50"));
    }

    #[tokio::test]
    async fn incremental_sync_searches_with_post() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/crm/v3/objects/companies/search")
                    .query_param("hapikey", "key-123")
                    .json_body_includes(
                        r#"{"filterGroups":[{"filters":[{"value":1522259675000,"propertyName":"hs_lastmodifieddate","operator":"GT"}]}]}"#,
                    );
                then.status(200).json_body(json!({"results": []}));
            })
            .await;

        let properties = vec!["name".to_owned()];
        let client = HubSpot::with_base_url(&server.base_url());
        let page = client
            .fetch_page(request(Some("25"), Some(1_522_259_675), &properties))
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(page.results.is_empty());
        assert_eq!(page.next_after(), None);
    }

    #[tokio::test]
    async fn non_ok_status_surfaces_context() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/crm/v3/objects/companies");
                then.status(502);
            })
            .await;

        let properties = vec![];
        let client = HubSpot::with_base_url(&server.base_url());
        let err = client
            .fetch_page(request(Some("75"), None, &properties))
            .await
            .unwrap_err();

        match err {
            HubSpotError::Status { object, after, status } => {
                assert_eq!(object, "companies");
                assert_eq!(after.as_deref(), Some("75"));
                assert_eq!(status, 502);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
