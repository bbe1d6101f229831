//! Ready-made filter fragments.

use serde_json::{json, Value};
use tracing::debug;

use super::filters::{DisplayMeta, FilterError, FilterTree, GroupOp};
use crate::resources::ResourceSelector;

pub const HAS_IMAGE: &str = "hasImage";
pub const BIRDWING_BUTTERFLIES: &str = "specimensHasImage";

const NO_IMAGE_FIELDS: &str = "The selected datasets do not have image fields.";

#[derive(Debug, Clone, PartialEq)]
pub enum PresetEntry {
    /// Later entries are added inside this group.
    Group { op: GroupOp },
    Term {
        key: String,
        content: Value,
        name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub key: &'static str,
    pub name: &'static str,
    pub entries: Vec<PresetEntry>,
}

impl Preset {
    /// Add the entries under `parent`, skipping any that already exist.
    /// Returns whether anything was added.
    pub fn apply(
        &self,
        tree: &mut FilterTree,
        parent: &str,
        hidden: bool,
        temp: bool,
    ) -> Result<bool, FilterError> {
        let mut parent = parent.to_string();
        let mut added = false;
        for entry in &self.entries {
            let mut display = DisplayMeta {
                name: String::new(),
                hidden,
                temp,
            };
            match entry {
                PresetEntry::Group { op } => {
                    let existing = tree
                        .children(&parent)
                        .into_iter()
                        .find(|(_, node)| node.key() == op.key())
                        .map(|(id, _)| id.to_string());
                    parent = match existing {
                        Some(id) => id,
                        None => {
                            added = true;
                            tree.add_group(&parent, *op, display)?
                        }
                    };
                }
                PresetEntry::Term { key, content, name } => {
                    if tree.has_filter(&parent, key, content) {
                        continue;
                    }
                    display.name = name.clone().unwrap_or_default();
                    tree.add_term(&parent, key.clone(), content.clone(), display)?;
                    added = true;
                }
            }
        }
        debug!("preset {} applied, added: {added}", self.key);
        Ok(added)
    }
}

pub fn static_presets() -> Vec<Preset> {
    vec![Preset {
        key: BIRDWING_BUTTERFLIES,
        name: "Birdwing Butterfly Digitisation",
        entries: vec![PresetEntry::Term {
            key: "string_equals".to_string(),
            content: json!({
                "fields": ["project"],
                "value": "Birdwing Butterfly Digitisation"
            }),
            name: Some("Birdwing Butterfly Digitisation".to_string()),
        }],
    }]
}

/// An `exists` term over the image fields of the resources in scope. When
/// none of them has an image field the term carries an `error` message.
pub fn has_image(resources: &ResourceSelector) -> Preset {
    let fields = resources.image_fields();
    let mut content = json!({ "fields": fields });
    if fields.is_empty() {
        content["error"] = Value::String(NO_IMAGE_FIELDS.to_string());
    }
    Preset {
        key: HAS_IMAGE,
        name: "Has Image",
        entries: vec![PresetEntry::Term {
            key: "exists".to_string(),
            content,
            name: Some("Has Image".to_string()),
        }],
    }
}

/// Look up a preset by key, building dynamic presets against `resources`.
pub fn find(key: &str, resources: &ResourceSelector) -> Option<Preset> {
    if key == HAS_IMAGE {
        return Some(has_image(resources));
    }
    static_presets().into_iter().find(|p| p.key == key)
}
