//! The image manifest: the JSON document parsed from the archive
//! during ingestion and stored as a distinct byte blob keyed by the
//! *image's* key, not its own hash (§3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub name: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub annotations: Vec<Label>,
}

impl ImageManifest {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Does this manifest satisfy every requested label (by name and
    /// exact value)? An empty `query` is trivially satisfied.
    pub fn matches_labels(&self, query: &[Label]) -> bool {
        query.iter().all(|want| self.label(&want.name) == Some(want.value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_lookup() {
        let m = ImageManifest {
            name: "example.com/app".into(),
            labels: vec![Label::new("version", "1.1"), Label::new("os", "linux")],
            annotations: vec![],
        };
        assert_eq!(m.label("version"), Some("1.1"));
        assert_eq!(m.label("arch"), None);
    }

    #[test]
    fn matches_labels_requires_every_entry() {
        let m = ImageManifest {
            name: "example.com/app".into(),
            labels: vec![Label::new("version", "1.1"), Label::new("os", "linux")],
            annotations: vec![],
        };
        assert!(m.matches_labels(&[Label::new("version", "1.1")]));
        assert!(!m.matches_labels(&[Label::new("version", "1.0")]));
        assert!(m.matches_labels(&[]));
    }
}
