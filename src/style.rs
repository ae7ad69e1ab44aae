use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub const DEFAULT_STYLE: &str = "tien_hiep";

/// Translation style applied to every chunk of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StyleTemplate {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub guidelines: Vec<String>,
    #[serde(default)]
    pub vocabulary: BTreeMap<String, String>,
    #[serde(default = "default_tone")]
    pub tone: String,
}

fn default_tone() -> String {
    "formal".to_owned()
}

impl StyleTemplate {
    /// Loads `<styles_dir>/<name>.yaml`, falling back to the built-in style.
    pub fn load(styles_dir: &Path, name: &str) -> anyhow::Result<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            anyhow::bail!("invalid style name: {name:?}");
        }
        let path = styles_dir.join(format!("{name}.yaml"));
        match std::fs::read_to_string(&path) {
            Ok(yaml) => {
                let style: StyleTemplate = serde_yaml::from_str(&yaml)
                    .with_context(|| format!("parse style: {}", path.display()))?;
                Ok(style)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(style = name, "style file not found; using built-in");
                Ok(Self::builtin(name))
            }
            Err(err) => Err(err).with_context(|| format!("read style: {}", path.display())),
        }
    }

    pub fn builtin(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            description: "Faithful literary translation of serialized web fiction".to_owned(),
            guidelines: vec![
                "Keep paragraph structure and line breaks".to_owned(),
                "Use glossary terms exactly as given".to_owned(),
                "Do not add commentary".to_owned(),
            ],
            vocabulary: BTreeMap::new(),
            tone: default_tone(),
        }
    }

    pub fn to_prompt(&self) -> String {
        let mut out = format!("Style: {} (tone: {})\n", self.description, self.tone);
        if !self.guidelines.is_empty() {
            out.push_str("\nGuidelines:\n");
            for g in &self.guidelines {
                out.push_str(&format!("- {g}\n"));
            }
        }
        if !self.vocabulary.is_empty() {
            out.push_str("\nVocabulary:\n");
            for (source, target) in &self.vocabulary {
                out.push_str(&format!("- {source} → {target}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_yaml_or_falls_back() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("casual.yaml"),
            "name: casual\ndescription: Relaxed\nvocabulary:\n  师兄: sư huynh\n",
        )
        .unwrap();

        let casual = StyleTemplate::load(temp.path(), "casual").unwrap();
        assert_eq!(casual.description, "Relaxed");
        assert!(casual.to_prompt().contains("师兄 → sư huynh"));

        let builtin = StyleTemplate::load(temp.path(), DEFAULT_STYLE).unwrap();
        assert_eq!(builtin.name, DEFAULT_STYLE);
        assert!(StyleTemplate::load(temp.path(), "../etc").is_err());
    }
}
