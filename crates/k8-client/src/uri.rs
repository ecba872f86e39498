use std::fmt;

/// Location of a resource kind on the API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResource {
    pub group: Option<String>,
    pub version: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ApiResource {
    /// resource in a named api group, `/apis/{group}/{version}`
    pub fn new(group: impl Into<String>, version: impl Into<String>, plural: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            version: version.into(),
            plural: plural.into(),
            namespaced: true,
        }
    }

    /// resource in the legacy core group, `/api/{version}`
    pub fn core(version: impl Into<String>, plural: impl Into<String>) -> Self {
        Self {
            group: None,
            version: version.into(),
            plural: plural.into(),
            namespaced: true,
        }
    }

    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }

    fn prefix(&self) -> String {
        match &self.group {
            Some(group) => format!("/apis/{group}/{}", self.version),
            None => format!("/api/{}", self.version),
        }
    }

    /// collection path; an empty namespace lists across all namespaces
    pub fn items_path(&self, namespace: &str) -> String {
        if self.namespaced && !namespace.is_empty() {
            format!("{}/namespaces/{namespace}/{}", self.prefix(), self.plural)
        } else {
            format!("{}/{}", self.prefix(), self.plural)
        }
    }

    pub fn item_path(&self, namespace: &str, name: &str) -> String {
        format!("{}/{name}", self.items_path(namespace))
    }
}

impl fmt::Display for ApiResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}.{}/{}", self.plural, group, self.version),
            None => write!(f, "{}/{}", self.plural, self.version),
        }
    }
}
