use serde::Serialize;

/// Query parameters understood by list and watch calls.
///
/// Options left as `None` are not sent at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch: Option<bool>,
}

impl ListOptions {
    /// name/value pairs ready for the query string
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![];
        let mut push = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                pairs.push((name.to_owned(), value));
            }
        };
        push("labelSelector", self.label_selector.clone());
        push("fieldSelector", self.field_selector.clone());
        push("limit", self.limit.map(|l| l.to_string()));
        push("continue", self.continu.clone());
        push("resourceVersion", self.resource_version.clone());
        push("timeoutSeconds", self.timeout_seconds.map(|t| t.to_string()));
        push(
            "watch",
            self.watch.and_then(|w| if w { Some("1".to_owned()) } else { None }),
        );
        pairs
    }
}

/// Content type of a PATCH request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMergeType {
    Json,
    Merge,
    StrategicMerge,
    Apply,
}

impl PatchMergeType {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json-patch+json",
            Self::Merge => "application/merge-patch+json",
            Self::StrategicMerge => "application/strategic-merge-patch+json",
            Self::Apply => "application/apply-patch+yaml",
        }
    }
}

/// Server-side apply parameters; the field manager is mandatory
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOptions {
    pub field_manager: String,
    pub force: bool,
}

impl ApplyOptions {
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            force: false,
        }
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("fieldManager".to_owned(), self.field_manager.clone())];
        if self.force {
            pairs.push(("force".to_owned(), "true".to_owned()));
        }
        pairs
    }
}
