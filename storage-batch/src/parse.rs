//! Step 1 of the pipeline (spec.md §4.4): recognize the request's content
//! type and split its body into individual, not-yet-validated BSO records.

use storage_types::bso::BsoBody;

use crate::error::BatchError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyFormat {
    /// A single JSON array of BSO objects.
    Json,
    /// One JSON object per line (`application/newlines`).
    Newlines,
}

impl BodyFormat {
    /// Returns `None` for any content type other than the two this
    /// service accepts for batch writes; the caller fails the request
    /// with 415, matching spec.md §4.4 step 1.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.split(';').next().unwrap_or("").trim() {
            "application/json" => Some(BodyFormat::Json),
            "application/newlines" => Some(BodyFormat::Newlines),
            _ => None,
        }
    }
}

pub fn parse_items<E>(format: BodyFormat, body: &str) -> Result<Vec<BsoBody>, BatchError<E>> {
    match format {
        BodyFormat::Json => {
            serde_json::from_str(body).map_err(|e| BatchError::MalformedBody(e.to_string()))
        }
        BodyFormat::Newlines => body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| BatchError::MalformedBody(e.to_string()))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_accepted_content_types() {
        assert_eq!(
            BodyFormat::from_content_type("application/json; charset=utf-8"),
            Some(BodyFormat::Json)
        );
        assert_eq!(
            BodyFormat::from_content_type("application/newlines"),
            Some(BodyFormat::Newlines)
        );
        assert_eq!(BodyFormat::from_content_type("application/whoisi"), None);
    }

    #[test]
    fn parses_json_array() {
        let body = r#"[{"id":"a","payload":"1"},{"id":"b","payload":"2"}]"#;
        let items = parse_items::<()>(BodyFormat::Json, body).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn parses_newline_delimited() {
        let body = "{\"id\":\"a\"}\n{\"id\":\"b\"}\n\n";
        let items = parse_items::<()>(BodyFormat::Newlines, body).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_items::<()>(BodyFormat::Json, "not json").unwrap_err();
        assert!(matches!(err, BatchError::MalformedBody(_)));
    }

    #[test]
    fn wrong_typed_field_does_not_fail_the_whole_batch() {
        // A string `sortindex` is a per-item validation failure (spec.md
        // §9 scenario S3), not a parse-level one: the envelope must still
        // come through so `bso::validate` can reject just that item.
        let body = r#"[{"id":"x1","payload":"P"},{"id":"x2","sortindex":"notanint"}]"#;
        let items = parse_items::<()>(BodyFormat::Json, body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].id.as_deref(), Some("x2"));
    }
}
