use std::collections::BTreeMap;

use serde_json::Value;

use crate::{normalize_payload, record_field_names, RatingField, Record, StoragePayload, TrackerError};

pub const CSV_EXPORT_FILE_NAME: &str = "daily_state_tracker_export.csv";
pub const JSON_BACKUP_FILE_NAME: &str = "daily_state_tracker_backup.json";

/// Renders records as CSV: a `date,<fields..>` header, then one row per
/// date in ascending key order. Rows are joined with `\n`.
#[must_use]
pub fn build_csv(records: &BTreeMap<String, Record>) -> String {
    let mut lines = Vec::with_capacity(records.len() + 1);

    let header = std::iter::once("date")
        .chain(record_field_names())
        .map(escape_csv_cell)
        .collect::<Vec<_>>();
    lines.push(header.join(","));

    for (date, record) in records {
        let mut row = Vec::with_capacity(RatingField::COUNT + 2);
        row.push(escape_csv_cell(date));
        for field in RatingField::ALL {
            row.push(
                record
                    .rating(field)
                    .map(|rating| rating.to_string())
                    .unwrap_or_default(),
            );
        }
        row.push(escape_csv_cell(record.memo()));
        lines.push(row.join(","));
    }

    lines.join("\n")
}

fn escape_csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Serializes the full payload as two-space indented JSON.
///
/// # Errors
/// Returns [`TrackerError::Serialization`] when encoding fails.
pub fn export_backup_json(payload: &StoragePayload) -> Result<String, TrackerError> {
    serde_json::to_string_pretty(&payload.to_value())
        .map_err(|err| TrackerError::Serialization(format!("failed to encode backup: {err}")))
}

/// Parses backup text into a normalized payload.
///
/// # Errors
/// Returns [`TrackerError::Import`] when the text is not JSON, the top-level
/// value is not an object, or `records` is missing or not an object.
pub fn parse_backup_json(text: &str) -> Result<StoragePayload, TrackerError> {
    let parsed: Value = serde_json::from_str(text)
        .map_err(|err| TrackerError::Import(format!("invalid JSON: {err}")))?;

    let Some(object) = parsed.as_object() else {
        return Err(TrackerError::Import(
            "invalid backup structure: top-level value MUST be an object".to_string(),
        ));
    };

    match object.get("records") {
        Some(Value::Object(_)) => {}
        Some(_) => {
            return Err(TrackerError::Import(
                "invalid backup structure: records MUST be an object".to_string(),
            ))
        }
        None => {
            return Err(TrackerError::Import(
                "invalid backup structure: records is missing".to_string(),
            ))
        }
    }

    Ok(normalize_payload(&parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalize_record, Rating};
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn csv_header_lists_date_then_fields_in_order() {
        let csv = build_csv(&BTreeMap::new());
        assert_eq!(
            csv,
            "date,pre_sleep_calmness,sleep_recovery,wake_up_state,exercise_quality,deep_work,\
             task_closure,stress_manageability,social_interaction,presence,deep_experience,memo"
        );
    }

    #[test]
    fn csv_rows_sort_by_date_and_quote_special_characters() {
        let mut records = BTreeMap::new();
        records.insert(
            "2024-01-02".to_string(),
            normalize_record(&json!({ "memo": "a,b" })),
        );
        records.insert(
            "2024-01-01".to_string(),
            normalize_record(&json!({ "memo": "c", "deep_work": 4 })),
        );

        let csv = build_csv(&records);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "2024-01-01,,,,,4,,,,,,c");
        assert_eq!(lines[2], "2024-01-02,,,,,,,,,,,\"a,b\"");
    }

    #[test]
    fn csv_doubles_embedded_quotes_and_wraps_newlines() {
        assert_eq!(escape_csv_cell("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_csv_cell("line1\nline2"), "\"line1\nline2\"");
        assert_eq!(escape_csv_cell("plain"), "plain");
        assert_eq!(escape_csv_cell(""), "");
    }

    #[test]
    fn backup_json_is_pretty_and_ordered() {
        let mut payload = StoragePayload::empty();
        payload.records.insert(
            "2024-05-01".to_string(),
            normalize_record(&json!({ "presence": 5 })),
        );

        let text = must_ok(export_backup_json(&payload));
        assert!(text.starts_with("{\n  \"schema_version\": 1,\n  \"records\": {\n    \"2024-05-01\": {"));
        assert!(text.contains("\"presence\": 5"));
        assert!(text.contains("\"deep_work\": \"\""));
    }

    #[test]
    fn import_rejects_text_that_is_not_json() {
        let err = parse_backup_json("{ not json");
        assert!(matches!(err, Err(TrackerError::Import(ref message)) if message.starts_with("invalid JSON")));
    }

    #[test]
    fn import_rejects_wrong_structure() {
        for text in ["[]", "42", "{}", "{\"records\": []}", "{\"records\": \"x\"}"] {
            let result = parse_backup_json(text);
            assert!(
                matches!(result, Err(TrackerError::Import(ref message)) if message.starts_with("invalid backup structure")),
                "text={text} result={result:?}"
            );
        }
    }

    #[test]
    fn import_normalizes_accepted_payload() {
        let payload = must_ok(parse_backup_json(
            r#"{"schema_version": 0, "records": {"2024-02-02": {"deep_work": "5", "memo": 1}}}"#,
        ));
        assert_eq!(payload.schema_version, 1);
        let record = &payload.records["2024-02-02"];
        assert_eq!(record.rating(RatingField::DeepWork).map(Rating::get), Some(5));
        assert_eq!(record.memo(), "");
    }

    fn arb_payload() -> impl Strategy<Value = StoragePayload> {
        let rating = prop::option::of(1_i64..=5);
        let record = (prop::collection::vec(rating, RatingField::COUNT), ".{0,12}").prop_map(
            |(ratings, memo)| {
                let mut record = Record::default();
                for (field, value) in RatingField::ALL.into_iter().zip(ratings) {
                    record.set_rating(field, value.and_then(Rating::new));
                }
                record.set_memo(memo);
                record
            },
        );
        let date = (2020_i32..2030, 1_u8..=12, 1_u8..=28)
            .prop_map(|(y, m, d)| format!("{y:04}-{m:02}-{d:02}"));
        prop::collection::btree_map(date, record, 0..8).prop_map(|records| StoragePayload {
            schema_version: crate::SCHEMA_VERSION,
            records,
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_backup_export_then_import_is_identity(payload in arb_payload()) {
            let text = must_ok(export_backup_json(&payload));
            let restored = must_ok(parse_backup_json(&text));
            prop_assert_eq!(restored, payload);
        }
    }
}
