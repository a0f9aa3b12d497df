use chrono::NaiveDateTime;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TableConfigError {
    #[error("table `{0}` must set exactly one of timestamp_column and checksum_column")]
    ImproperColumns(String),
}

/// How the base SELECT is shaped. The plain form covers most tables; the
/// patient variants carry the co-ownership join and filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTemplate {
    Plain,
    PatientPrimary,
    PatientCoOwner,
}

/// Side lookups a table's records are enriched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdditionalKind {
    Codes,
}

/// Descriptor of one upstream table: which cursor strategy drives it, how
/// its rows are ordered, and how the query is built.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub name: String,
    pub timestamp_column: Option<String>,
    pub checksum_column: Option<String>,
    pub order_by: String,
    pub query: QueryTemplate,
    pub additionals: Option<AdditionalKind>,
}

impl TableConfig {
    pub fn new(
        name: &str,
        timestamp_column: Option<&str>,
        checksum_column: Option<&str>,
    ) -> Result<TableConfig, TableConfigError> {
        if timestamp_column.is_some() == checksum_column.is_some() {
            return Err(TableConfigError::ImproperColumns(name.to_owned()));
        }
        Ok(TableConfig {
            name: name.to_owned(),
            timestamp_column: timestamp_column.map(str::to_owned),
            checksum_column: checksum_column.map(str::to_owned),
            order_by: "id".to_owned(),
            query: QueryTemplate::Plain,
            additionals: None,
        })
    }

    pub fn timestamped(name: &str, column: &str) -> TableConfig {
        Self::new(name, Some(column), None).expect("one cursor column given")
    }

    pub fn checksummed(name: &str, column: &str) -> TableConfig {
        Self::new(name, None, Some(column)).expect("one cursor column given")
    }

    pub fn order_by(mut self, column: &str) -> TableConfig {
        self.order_by = column.to_owned();
        self
    }

    pub fn query(mut self, query: QueryTemplate) -> TableConfig {
        self.query = query;
        self
    }

    pub fn additionals(mut self, kind: AdditionalKind) -> TableConfig {
        self.additionals = Some(kind);
        self
    }

    /// Base SELECT without pagination; the fetchers append LIMIT/OFFSET.
    /// The inclusive `>=` compare re-delivers the boundary row on purpose so
    /// equal-timestamp rows are never lost.
    pub fn sql(&self, watermark: Option<NaiveDateTime>) -> String {
        let name = &self.name;
        let order_by = &self.order_by;
        match self.query {
            QueryTemplate::Plain => match (&self.timestamp_column, watermark) {
                (Some(ts_col), Some(watermark)) => format!(
                    "SELECT * FROM external.{name} \
                     WHERE {ts_col} >= '{}'::timestamp \
                     ORDER BY {order_by} ",
                    watermark.format("%Y-%m-%dT%H:%M:%S"),
                ),
                _ => format!("SELECT * FROM external.{name} ORDER BY {order_by} "),
            },
            QueryTemplate::PatientPrimary => format!(
                "SELECT DISTINCT {name}.vetsuccess_id, rel.client_vetsuccess_id, {name}.* \
                 FROM external.{name} \
                 INNER JOIN external.client_patient_relationships as rel ON \
                 rel.patient_vetsuccess_id = {name}.vetsuccess_id AND rel.is_primary = 'true' \
                 ORDER BY {order_by} "
            ),
            QueryTemplate::PatientCoOwner => format!(
                "SELECT {name}.* FROM external.{name} \
                 WHERE is_primary = 'false' ORDER BY {order_by} "
            ),
        }
    }
}

/// The configured VetSuccess table list, in processing order.
pub fn vetsuccess_tables() -> Vec<TableConfig> {
    vec![
        TableConfig::checksummed("aaha_accounts", "id"),
        TableConfig::checksummed("clients", "vetsuccess_id").order_by("vetsuccess_id"),
        TableConfig::checksummed("client_attributes", "vetsuccess_id"),
        TableConfig::checksummed("codes", "vetsuccess_id").additionals(AdditionalKind::Codes),
        TableConfig::checksummed("dates", "record_date"),
        TableConfig::checksummed("emails", "vetsuccess_id").order_by("client_vetsuccess_id"),
        TableConfig::timestamped("invoices", "source_updated_at"),
        TableConfig::checksummed("patients", "vetsuccess_id")
            .order_by("client_vetsuccess_id")
            .query(QueryTemplate::PatientPrimary),
        TableConfig::checksummed("client_patient_relationships", "patient_vetsuccess_id")
            .query(QueryTemplate::PatientCoOwner),
        TableConfig::timestamped("payment_transactions", "source_updated_at"),
        TableConfig::checksummed("phones", "vetsuccess_id"),
        TableConfig::checksummed("practices", "id"),
        TableConfig::timestamped("reminders", "source_updated_at"),
        TableConfig::checksummed("resources", "vetsuccess_id"),
        TableConfig::timestamped("normalized_transactions", "updated_at"),
        TableConfig::timestamped("schedules", "source_updated_at"),
        TableConfig::checksummed("sites", "vetsuccess_id"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_descriptors_without_exactly_one_cursor() {
        assert!(TableConfig::new("t", None, None).is_err());
        assert!(TableConfig::new("t", Some("updated_at"), Some("id")).is_err());
        assert!(TableConfig::new("t", Some("updated_at"), None).is_ok());
        assert!(TableConfig::new("t", None, Some("id")).is_ok());
    }

    #[test]
    fn timestamped_sql_binds_the_watermark_inclusively() {
        let table = TableConfig::timestamped("test", "update_at");
        let sql = table.sql(Some("2019-11-21T13:12:00".parse().unwrap()));
        assert_eq!(
            sql,
            "SELECT * FROM external.test \
             WHERE update_at >= '2019-11-21T13:12:00'::timestamp \
             ORDER BY id "
        );
    }

    #[test]
    fn checksummed_sql_orders_the_full_table() {
        let table = TableConfig::checksummed("testing", "date").order_by("date");
        assert_eq!(
            table.sql(None),
            "SELECT * FROM external.testing ORDER BY date "
        );
    }

    #[test]
    fn patient_templates_keep_their_joins_and_filters() {
        let primary = TableConfig::checksummed("patients", "vetsuccess_id")
            .order_by("client_vetsuccess_id")
            .query(QueryTemplate::PatientPrimary)
            .sql(None);
        assert!(primary.contains("INNER JOIN external.client_patient_relationships"));
        assert!(primary.contains("rel.is_primary = 'true'"));

        let co_owner = TableConfig::checksummed("client_patient_relationships", "patient_vetsuccess_id")
            .query(QueryTemplate::PatientCoOwner)
            .sql(None);
        assert!(co_owner.contains("WHERE is_primary = 'false'"));
    }

    #[test]
    fn configured_tables_all_validate() {
        let tables = vetsuccess_tables();
        assert!(!tables.is_empty());
        for table in &tables {
            assert!(table.timestamp_column.is_some() != table.checksum_column.is_some());
        }
        let codes = tables.iter().find(|t| t.name == "codes").unwrap();
        assert_eq!(codes.additionals, Some(AdditionalKind::Codes));
    }
}
