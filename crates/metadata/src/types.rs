//! Record types exchanged with the metadata service.

use serde::{Deserialize, Serialize};

/// A file record as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub filename: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha256sum: Option<String>,
}

/// Metadata for registering an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFileRecord {
    #[serde(rename = "dataset")]
    pub container: String,
    pub filename: String,
    #[serde(default)]
    pub directory: String,
    pub size: u64,
    pub sha256sum: String,
}

/// Paged list envelope (internal).
#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse<T> {
    pub meta: ListMeta,
    #[serde(default = "Vec::new")]
    pub objects: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListMeta {
    #[serde(default)]
    pub total_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_envelope_parses() {
        let json = r#"{"meta":{"limit":20,"total_count":1},"objects":[
            {"id":7,"filename":"scan.tif","directory":"raw","size":1024}
        ]}"#;
        let resp: ListResponse<FileRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(resp.meta.total_count, 1);
        assert_eq!(resp.objects[0].id, 7);
        assert_eq!(resp.objects[0].size, Some(1024));
        assert!(resp.objects[0].sha256sum.is_none());
    }

    #[test]
    fn new_record_uses_dataset_key() {
        let record = NewFileRecord {
            container: "42".into(),
            filename: "a.txt".into(),
            directory: String::new(),
            size: 3,
            sha256sum: "abc".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["dataset"], "42");
        assert!(json.get("container").is_none());
    }
}
