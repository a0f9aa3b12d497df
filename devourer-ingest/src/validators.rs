//! Shape validation for Bitwerx line items. One invalid item aborts the
//! whole import before the watermark moves (the caller maps this to a 422).

use miette::Diagnostic;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("invalid line item: `{path}` {problem}")]
pub struct LineItemInvalid {
    pub path: String,
    pub problem: &'static str,
}

fn invalid(path: impl Into<String>, problem: &'static str) -> LineItemInvalid {
    LineItemInvalid {
        path: path.into(),
        problem,
    }
}

const REQUIRED_STRINGS: [&str; 10] = [
    "lineItemId",
    "updated",
    "created",
    "clientId",
    "patientId",
    "transactionDate",
    "description",
    "quantity",
    "lineAmount",
    "invoiceId",
];

const REQUIRED_BOOLS: [&str; 2] = ["isDeleted", "isVoided"];

/// Fields of `taxonomyValues` that must be present, string or null.
const TAXONOMY_VALUE_FIELDS: [&str; 3] = ["marketerSku", "weightInOunces", "weightInPounds"];

pub fn validate_line_item(item: &JsonValue) -> Result<(), LineItemInvalid> {
    let object = item
        .as_object()
        .ok_or_else(|| invalid("$", "is not an object"))?;

    for field in REQUIRED_STRINGS {
        match object.get(field) {
            None => return Err(invalid(field, "is required")),
            Some(JsonValue::String(_)) => {}
            Some(_) => return Err(invalid(field, "must be a string")),
        }
    }
    for field in REQUIRED_BOOLS {
        match object.get(field) {
            None => return Err(invalid(field, "is required")),
            Some(JsonValue::Bool(_)) => {}
            Some(_) => return Err(invalid(field, "must be a boolean")),
        }
    }

    if let Some(mappings) = object.get("mappings") {
        let mappings = mappings
            .as_array()
            .ok_or_else(|| invalid("mappings", "must be an array"))?;
        for (index, mapping) in mappings.iter().enumerate() {
            validate_mapping(mapping, &format!("mappings[{index}]"))?;
        }
    }

    Ok(())
}

fn validate_mapping(mapping: &JsonValue, path: &str) -> Result<(), LineItemInvalid> {
    let object = mapping
        .as_object()
        .ok_or_else(|| invalid(path, "is not an object"))?;

    let taxonomy = object
        .get("taxonomyMapping")
        .ok_or_else(|| invalid(format!("{path}.taxonomyMapping"), "is required"))?
        .as_array()
        .ok_or_else(|| invalid(format!("{path}.taxonomyMapping"), "must be an array"))?;
    for (index, entry) in taxonomy.iter().enumerate() {
        validate_taxonomy_entry(entry, &format!("{path}.taxonomyMapping[{index}]"))?;
    }

    if let Some(crosswalk) = object.get("crossWalkMapping") {
        let crosswalk = crosswalk
            .as_array()
            .ok_or_else(|| invalid(format!("{path}.crossWalkMapping"), "must be an array"))?;
        for (index, entry) in crosswalk.iter().enumerate() {
            let entry_path = format!("{path}.crossWalkMapping[{index}]");
            let entry = entry
                .as_object()
                .ok_or_else(|| invalid(entry_path.as_str(), "is not an object"))?;
            match entry.get("CrosswalkType") {
                Some(JsonValue::String(_)) => {}
                Some(_) => {
                    return Err(invalid(
                        format!("{entry_path}.CrosswalkType"),
                        "must be a string",
                    ))
                }
                None => {
                    return Err(invalid(
                        format!("{entry_path}.CrosswalkType"),
                        "is required",
                    ))
                }
            }
        }
    }

    Ok(())
}

fn validate_taxonomy_entry(entry: &JsonValue, path: &str) -> Result<(), LineItemInvalid> {
    let object = entry
        .as_object()
        .ok_or_else(|| invalid(path, "is not an object"))?;

    match object.get("taxonomyNodeLabel") {
        Some(JsonValue::String(_)) => {}
        Some(_) => {
            return Err(invalid(
                format!("{path}.taxonomyNodeLabel"),
                "must be a string",
            ))
        }
        None => return Err(invalid(format!("{path}.taxonomyNodeLabel"), "is required")),
    }

    let values = object
        .get("taxonomyValues")
        .ok_or_else(|| invalid(format!("{path}.taxonomyValues"), "is required"))?
        .as_object()
        .ok_or_else(|| invalid(format!("{path}.taxonomyValues"), "must be an object"))?;
    for field in TAXONOMY_VALUE_FIELDS {
        match values.get(field) {
            Some(JsonValue::String(_) | JsonValue::Null) => {}
            Some(_) => {
                return Err(invalid(
                    format!("{path}.taxonomyValues.{field}"),
                    "must be a string or null",
                ))
            }
            None => {
                return Err(invalid(
                    format!("{path}.taxonomyValues.{field}"),
                    "is required",
                ))
            }
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;

    pub(crate) fn valid_item() -> JsonValue {
        json!({
            "lineItemId": "li-1",
            "isDeleted": false,
            "updated": "2021-03-02T10:11:12.000000Z",
            "created": "2021-03-01T10:11:12.000000Z",
            "clientId": "c-1",
            "patientId": "p-1",
            "transactionDate": "2021-03-02",
            "description": "Rabies vaccine",
            "quantity": "1",
            "lineAmount": "42.00",
            "isVoided": false,
            "invoiceId": "i-1",
            "mappings": [
                {
                    "taxonomyMapping": [
                        {
                            "taxonomyNodeLabel": "Vaccines",
                            "taxonomyValues": {
                                "marketerSku": null,
                                "weightInOunces": "4",
                                "weightInPounds": null,
                            },
                        },
                    ],
                    "crossWalkMapping": [
                        {"CrosswalkType": "revenue"},
                    ],
                },
            ],
        })
    }

    #[test]
    fn a_complete_item_passes() {
        assert!(validate_line_item(&valid_item()).is_ok());
    }

    #[test]
    fn mappings_are_optional() {
        let mut item = valid_item();
        item.as_object_mut().unwrap().remove("mappings");
        assert!(validate_line_item(&item).is_ok());
    }

    #[test]
    fn missing_required_fields_are_named() {
        let mut item = valid_item();
        item.as_object_mut().unwrap().remove("invoiceId");
        let err = validate_line_item(&item).unwrap_err();
        assert_eq!(err.path, "invoiceId");
    }

    #[test]
    fn wrong_scalar_types_fail() {
        let mut item = valid_item();
        item["isVoided"] = json!("false");
        assert!(validate_line_item(&item).is_err());

        let mut item = valid_item();
        item["quantity"] = json!(1);
        assert!(validate_line_item(&item).is_err());
    }

    #[test]
    fn nested_taxonomy_shape_is_enforced() {
        let mut item = valid_item();
        item["mappings"][0]["taxonomyMapping"][0]["taxonomyValues"]["weightInPounds"] =
            json!(3.5);
        let err = validate_line_item(&item).unwrap_err();
        assert!(err.path.ends_with("weightInPounds"));

        let mut item = valid_item();
        item["mappings"][0]["taxonomyMapping"][0]
            .as_object_mut()
            .unwrap()
            .remove("taxonomyNodeLabel");
        assert!(validate_line_item(&item).is_err());

        let mut item = valid_item();
        item["mappings"][0]["crossWalkMapping"][0]
            .as_object_mut()
            .unwrap()
            .remove("CrosswalkType");
        assert!(validate_line_item(&item).is_err());
    }
}
