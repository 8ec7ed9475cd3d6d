//! # Upload Payload
//!
//! Request body is `{"data":[{"rfid":"<tag_id>","timestamp":"YYYY-MM-DD HH:MM:SS"}, ...]}`.
//! The field is named `rfid` on the wire because that is what the cloud
//! endpoint accepts. The source id travels as the request credential.

use serde::Serialize;

use crate::error::Result;
use crate::record::LogRecord;

/// Credential sent when a batch has no source id
pub const UNKNOWN_CREDENTIAL: &str = "SCANNER_UNKNOWN";

#[derive(Debug, Serialize)]
struct UploadItem<'a> {
    #[serde(rename = "rfid")]
    tag_id: &'a str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct UploadBody<'a> {
    data: Vec<UploadItem<'a>>,
}

/// Serializes a batch into the request body.
pub fn build_body(records: &[LogRecord]) -> Result<String> {
    let body = UploadBody {
        data: records
            .iter()
            .map(|r| UploadItem {
                tag_id: &r.tag_id,
                timestamp: r.timestamp_iso(),
            })
            .collect(),
    };
    Ok(serde_json::to_string(&body)?)
}

/// Credential for a batch from `source_id`
pub fn credential_for(source_id: &str) -> &str {
    if source_id.is_empty() {
        UNKNOWN_CREDENTIAL
    } else {
        source_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_body_shape() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 3)
            .unwrap();
        let records = vec![
            LogRecord::new("S1", "0A1B2C3D", ts),
            LogRecord::new("S1", "DEADBEEF", ts),
        ];

        let body = build_body(&records).unwrap();
        assert_eq!(
            body,
            r#"{"data":[{"rfid":"0A1B2C3D","timestamp":"2024-03-09 07:05:03"},{"rfid":"DEADBEEF","timestamp":"2024-03-09 07:05:03"}]}"#
        );
        assert!(!body.contains("S1"));
    }

    #[test]
    fn test_empty_batch() {
        assert_eq!(build_body(&[]).unwrap(), r#"{"data":[]}"#);
    }

    #[test]
    fn test_credential_fallback() {
        assert_eq!(credential_for("S1"), "S1");
        assert_eq!(credential_for(""), UNKNOWN_CREDENTIAL);
    }
}
