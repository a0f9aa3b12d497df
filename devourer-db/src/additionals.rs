//! Per-record side lookups attached under `_additionals`. Failures here are
//! record-level errors and abort the owning table's run.

use std::collections::BTreeSet;

use itertools::Itertools;
use serde_json::Value as JsonValue;

use crate::record::{Cell, Record};
use crate::tables::AdditionalKind;
use crate::upstream::{FetchError, Upstream};

pub async fn fetch(
    kind: AdditionalKind,
    db: &dyn Upstream,
    record: &Record,
) -> Result<JsonValue, FetchError> {
    match kind {
        AdditionalKind::Codes => codes(db, record).await,
    }
}

async fn codes(db: &dyn Upstream, record: &Record) -> Result<JsonValue, FetchError> {
    let mut data = serde_json::Map::new();
    if let Some(code_id) = record
        .get("pms_code_vetsuccess_id")
        .filter(|cell| cell.is_present())
    {
        data.insert(
            "code_tags".to_owned(),
            code_tags(db, &code_id.digest_text()).await?,
        );
    }
    if let Some(category_id) = record
        .get("revenue_category_id")
        .filter(|cell| cell.is_present())
    {
        data.insert(
            "revenue_category".to_owned(),
            revenue_category(db, &category_id.digest_text()).await?,
        );
    }
    Ok(JsonValue::Object(data))
}

/// Tags mapped to the code, extended with every ancestor tag named in their
/// `ancestry` paths, sorted by id ascending.
async fn code_tags(db: &dyn Upstream, code_id: &str) -> Result<JsonValue, FetchError> {
    let mut tags = db.query(&code_tags_sql(code_id)).await?;

    if !tags.is_empty() {
        let ancestry_ids: BTreeSet<String> = tags
            .iter()
            .filter_map(|tag| match tag.get("ancestry") {
                Some(Cell::Text(path)) => Some(path.clone()),
                _ => None,
            })
            .flat_map(|path| {
                path.split('/')
                    .filter(|id| !id.is_empty())
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .collect();
        if !ancestry_ids.is_empty() {
            tags.extend(db.query(&related_code_tags_sql(&ancestry_ids)).await?);
        }
    }

    let mut keyed = Vec::with_capacity(tags.len());
    for tag in tags {
        let id = match tag.get("id") {
            Some(Cell::Int(id)) => *id,
            _ => {
                return Err(FetchError::MissingColumn {
                    table: "code_tags".to_owned(),
                    column: "id".to_owned(),
                })
            }
        };
        keyed.push((id, tag));
    }
    keyed.sort_by_key(|(id, _)| *id);
    Ok(JsonValue::Array(
        keyed.iter().map(|(_, tag)| tag.to_json()).collect(),
    ))
}

/// Probes the hierarchy by exact category, then parent, then grandparent.
async fn revenue_category(db: &dyn Upstream, category_id: &str) -> Result<JsonValue, FetchError> {
    for field in [
        "revenue_category_id",
        "subset_of_level_2_id",
        "subset_of_level_1_id",
    ] {
        let rows = db.query(&revenue_category_sql(field, category_id)).await?;
        if let Some(row) = rows.first() {
            return Ok(row.to_json());
        }
    }
    Ok(JsonValue::Null)
}

pub fn code_tags_sql(code_id: &str) -> String {
    format!(
        "SELECT \
           code_tags.*, \
           code_tag_mappings.pms_code_vetsuccess_id, \
           code_tag_mappings.practice_id \
         FROM external.code_tags \
         LEFT OUTER JOIN external.code_tag_mappings ON code_tag_mappings.code_tag_id = code_tags.id \
         WHERE code_tag_mappings.pms_code_vetsuccess_id = '{code_id}'"
    )
}

pub fn related_code_tags_sql(ids: &BTreeSet<String>) -> String {
    let ids = ids.iter().join(", ");
    format!(
        "SELECT \
           code_tags.*, \
           code_tag_mappings.pms_code_vetsuccess_id, \
           code_tag_mappings.practice_id \
         FROM external.code_tags \
         LEFT OUTER JOIN external.code_tag_mappings ON code_tag_mappings.code_tag_id = code_tags.id \
         WHERE code_tags.id = ANY(ARRAY[{ids}])"
    )
}

pub fn revenue_category_sql(field: &str, category_id: &str) -> String {
    format!("SELECT * FROM external.revenue_categories_hierarchy WHERE {field}={category_id} ")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    /// Answers exact SQL strings with scripted rows.
    struct ScriptedUpstream {
        responses: HashMap<String, Vec<Record>>,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        fn new(responses: Vec<(String, Vec<Record>)>) -> Arc<ScriptedUpstream> {
            Arc::new(ScriptedUpstream {
                responses: responses.into_iter().collect(),
                log: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn query_page(
            &self,
            sql: &str,
            _limit: i64,
            _offset: i64,
            _deadline: Duration,
        ) -> Result<Vec<Record>, FetchError> {
            self.query(sql).await
        }

        async fn query(&self, sql: &str) -> Result<Vec<Record>, FetchError> {
            self.log.lock().unwrap().push(sql.to_owned());
            Ok(self.responses.get(sql).cloned().unwrap_or_default())
        }
    }

    fn tag(id: i64, name: &str, ancestry: Option<&str>) -> Record {
        Record::new(vec![
            ("id".into(), Cell::Int(id)),
            ("name".into(), Cell::Text(name.into())),
            (
                "ancestry".into(),
                ancestry.map_or(Cell::Null, |a| Cell::Text(a.into())),
            ),
        ])
    }

    fn code_record(code_id: i64, category_id: i64) -> Record {
        Record::new(vec![
            ("vetsuccess_id".into(), Cell::Int(9)),
            ("pms_code_vetsuccess_id".into(), Cell::Int(code_id)),
            ("revenue_category_id".into(), Cell::Int(category_id)),
        ])
    }

    #[tokio::test]
    async fn code_tags_merge_ancestors_and_sort_by_id() {
        let mapped = vec![tag(12, "child", Some("3/7"))];
        let ancestors = vec![tag(7, "parent", Some("3")), tag(3, "root", None)];
        let ids: BTreeSet<String> = ["3".to_owned(), "7".to_owned()].into();
        let db = ScriptedUpstream::new(vec![
            (code_tags_sql("41"), mapped),
            (related_code_tags_sql(&ids), ancestors),
        ]);

        let tags = code_tags(db.as_ref(), "41").await.unwrap();
        let ids: Vec<i64> = tags
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![3, 7, 12]);
    }

    #[tokio::test]
    async fn a_tag_without_an_id_is_a_shape_error() {
        let orphan = Record::new(vec![
            ("name".into(), Cell::Text("orphan".into())),
            ("ancestry".into(), Cell::Null),
        ]);
        let db = ScriptedUpstream::new(vec![(code_tags_sql("41"), vec![orphan])]);

        assert!(matches!(
            code_tags(db.as_ref(), "41").await,
            Err(FetchError::MissingColumn { .. })
        ));
    }

    #[tokio::test]
    async fn revenue_probe_escalates_through_the_hierarchy() {
        let category = Record::new(vec![
            ("id".into(), Cell::Int(2)),
            ("name".into(), Cell::Text("surgery".into())),
        ]);
        let db = ScriptedUpstream::new(vec![(
            revenue_category_sql("subset_of_level_2_id", "8"),
            vec![category],
        )]);

        let found = revenue_category(db.as_ref(), "8").await.unwrap();
        assert_eq!(found["name"], json!("surgery"));

        let probes = db.log.lock().unwrap().clone();
        assert_eq!(
            probes,
            vec![
                revenue_category_sql("revenue_category_id", "8"),
                revenue_category_sql("subset_of_level_2_id", "8"),
            ]
        );
    }

    #[tokio::test]
    async fn revenue_probe_exhausts_to_null() {
        let db = ScriptedUpstream::new(vec![]);
        let found = revenue_category(db.as_ref(), "8").await.unwrap();
        assert_eq!(found, JsonValue::Null);
        assert_eq!(db.log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn absent_foreign_keys_skip_their_lookup() {
        let db = ScriptedUpstream::new(vec![]);
        let record = Record::new(vec![
            ("vetsuccess_id".into(), Cell::Int(9)),
            ("pms_code_vetsuccess_id".into(), Cell::Null),
            ("revenue_category_id".into(), Cell::Int(0)),
        ]);

        let data = fetch(AdditionalKind::Codes, db.as_ref(), &record)
            .await
            .unwrap();
        assert_eq!(data, json!({}));
        assert!(db.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn present_keys_populate_both_sections() {
        let db = ScriptedUpstream::new(vec![(
            code_tags_sql("41"),
            vec![tag(12, "child", None)],
        )]);
        let data = fetch(AdditionalKind::Codes, db.as_ref(), &code_record(41, 8))
            .await
            .unwrap();
        assert_eq!(data["code_tags"][0]["id"], json!(12));
        assert_eq!(data["revenue_category"], JsonValue::Null);
    }
}
