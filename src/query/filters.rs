//! The editable filter tree and its conversion to and from the nested JSON
//! filter structure accepted by the multisearch action.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::camel_case;

pub const ROOT: &str = "group_root";

/// Term keys whose `fields` are not worth showing as a result column.
const EQUALITY_TERMS: [&str; 2] = ["string_equals", "number_equals"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOp {
    And,
    Or,
    Not,
}

impl GroupOp {
    pub fn key(self) -> &'static str {
        match self {
            GroupOp::And => "and",
            GroupOp::Or => "or",
            GroupOp::Not => "not",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "and" => Some(GroupOp::And),
            "or" => Some(GroupOp::Or),
            "not" => Some(GroupOp::Not),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GroupOp::And => "ALL OF",
            GroupOp::Or => "ANY OF",
            GroupOp::Not => "NONE OF",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMeta {
    pub name: String,
    pub hidden: bool,
    /// Applied to the live search but left out of the shareable query.
    pub temp: bool,
}

impl DisplayMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn temporary(mut self) -> Self {
        self.temp = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Group(GroupOp),
    Term { key: String, content: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterNode {
    pub parent: Option<String>,
    pub kind: NodeKind,
    pub display: DisplayMeta,
}

impl FilterNode {
    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group(_))
    }

    /// The operator key as it appears on the wire.
    pub fn key(&self) -> &str {
        match &self.kind {
            NodeKind::Group(op) => op.key(),
            NodeKind::Term { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("no filter with id `{0}`")]
    UnknownNode(String),
    #[error("`{0}` is not a group")]
    NotAGroup(String),
    #[error("`{0}` is not a term")]
    NotATerm(String),
    /// Terms cannot use `and`, `or` or `not` as their key.
    #[error("`{0}` is a group operator, not a term key")]
    GroupKeyOnTerm(String),
    #[error("term `{0}` must hold an object")]
    ContentNotObject(String),
    #[error("`{0}` is not a group operator")]
    UnknownOperator(String),
    #[error("the root group cannot be changed into a term")]
    RootIsGroup,
}

/// Why a persisted filter structure could not be turned into a tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterParseError {
    #[error("expected an object with exactly one operator at {path}")]
    NotSingleOperator { path: String },
    #[error("group `{key}` at {path} must hold a list")]
    GroupNotList { key: String, path: String },
    #[error("term `{key}` at {path} must hold an object")]
    TermNotObject { key: String, path: String },
}

impl fmt::Display for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Group(op) => write!(f, "{}", op.label()),
            NodeKind::Term { key, content } => write!(f, "{key} {content}"),
        }
    }
}

/// Nodes keyed by `group_<id>` / `term_<id>`, in insertion order. The root
/// group always exists and has no parent; every other node has exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterTree {
    nodes: IndexMap<String, FilterNode>,
    next_id: u64,
}

impl Default for FilterTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterTree {
    pub fn new() -> Self {
        let mut nodes = IndexMap::new();
        nodes.insert(
            ROOT.to_string(),
            FilterNode {
                parent: None,
                kind: NodeKind::Group(GroupOp::And),
                display: DisplayMeta::default(),
            },
        );
        Self { nodes, next_id: 0 }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn get(&self, id: &str) -> Option<&FilterNode> {
        self.nodes.get(id)
    }

    pub fn root(&self) -> &FilterNode {
        &self.nodes[ROOT]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    /// Number of nodes, root included.
    pub fn count(&self, ignore_temp: bool) -> usize {
        self.nodes
            .values()
            .filter(|node| !(ignore_temp && node.display.temp))
            .count()
    }

    pub fn children(&self, id: &str) -> Vec<(&str, &FilterNode)> {
        self.iter()
            .filter(|(_, node)| node.parent.as_deref() == Some(id))
            .collect()
    }

    /// Distance from the root; `None` for unknown ids.
    pub fn nest_level(&self, id: &str) -> Option<usize> {
        let mut node = self.nodes.get(id)?;
        let mut level = 0;
        while let Some(parent) = &node.parent {
            node = self.nodes.get(parent)?;
            level += 1;
        }
        Some(level)
    }

    pub fn add_group(
        &mut self,
        parent: &str,
        op: GroupOp,
        display: DisplayMeta,
    ) -> Result<String, FilterError> {
        self.insert(parent, "group", NodeKind::Group(op), display)
    }

    pub fn add_term(
        &mut self,
        parent: &str,
        key: impl Into<String>,
        content: Value,
        display: DisplayMeta,
    ) -> Result<String, FilterError> {
        let key = key.into();
        check_term_key(&key)?;
        check_term_content(&key, &content)?;
        self.insert(parent, "term", NodeKind::Term { key, content }, display)
    }

    fn insert(
        &mut self,
        parent: &str,
        prefix: &str,
        kind: NodeKind,
        display: DisplayMeta,
    ) -> Result<String, FilterError> {
        match self.nodes.get(parent) {
            None => return Err(FilterError::UnknownNode(parent.to_string())),
            Some(node) if !node.is_group() => {
                return Err(FilterError::NotAGroup(parent.to_string()))
            }
            Some(_) => {}
        }
        let id = self.new_id(prefix, &display.name);
        self.nodes.insert(
            id.clone(),
            FilterNode {
                parent: Some(parent.to_string()),
                kind,
                display,
            },
        );
        Ok(id)
    }

    fn new_id(&mut self, prefix: &str, name: &str) -> String {
        let named = camel_case(name);
        if !named.is_empty() {
            let id = format!("{prefix}_{named}");
            if !self.nodes.contains_key(&id) {
                return id;
            }
        }
        loop {
            self.next_id += 1;
            let id = format!("{prefix}_{:x}", self.next_id);
            if !self.nodes.contains_key(&id) {
                return id;
            }
        }
    }

    /// Change a group's operator or a term's key.
    pub fn change_key(&mut self, id: &str, key: &str) -> Result<(), FilterError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| FilterError::UnknownNode(id.to_string()))?;
        match &mut node.kind {
            NodeKind::Group(op) => {
                *op = GroupOp::from_key(key)
                    .ok_or_else(|| FilterError::UnknownOperator(key.to_string()))?;
            }
            NodeKind::Term { key: term_key, .. } => {
                check_term_key(key)?;
                *term_key = key.to_string();
            }
        }
        Ok(())
    }

    pub fn change_content(&mut self, id: &str, new_content: Value) -> Result<(), FilterError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| FilterError::UnknownNode(id.to_string()))?;
        match &mut node.kind {
            NodeKind::Term { key, content } => {
                check_term_content(key, &new_content)?;
                *content = new_content;
                Ok(())
            }
            NodeKind::Group(_) if id == ROOT => Err(FilterError::RootIsGroup),
            NodeKind::Group(_) => Err(FilterError::NotATerm(id.to_string())),
        }
    }

    pub fn rename(&mut self, id: &str, name: impl Into<String>) -> Result<(), FilterError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| FilterError::UnknownNode(id.to_string()))?;
        node.display.name = name.into();
        Ok(())
    }

    /// Remove a node and everything beneath it. The root is never removed.
    pub fn delete(&mut self, id: &str) -> bool {
        if id == ROOT || !self.nodes.contains_key(id) {
            return false;
        }
        let mut doomed = vec![id.to_string()];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i].clone();
            doomed.extend(
                self.children(&parent)
                    .into_iter()
                    .map(|(child, _)| child.to_string()),
            );
            i += 1;
        }
        for id in doomed {
            self.nodes.shift_remove(&id);
        }
        true
    }

    /// Whether a node with the same parent, key and content already exists.
    pub fn has_filter(&self, parent: &str, key: &str, content: &Value) -> bool {
        self.nodes.values().any(|node| {
            node.parent.as_deref() == Some(parent)
                && node.key() == key
                && match &node.kind {
                    NodeKind::Term { content: c, .. } => c == content,
                    NodeKind::Group(_) => content.is_null(),
                }
        })
    }

    pub fn temporary_filters(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, node)| node.display.temp)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn delete_temporary(&mut self) -> usize {
        let temp: Vec<String> = self
            .temporary_filters()
            .into_iter()
            .map(ToString::to_string)
            .collect();
        temp.iter().filter(|id| self.delete(id)).count()
    }

    /// The `fields` named by non-equality terms, for use as result columns.
    pub fn field_headers(&self) -> Vec<Vec<String>> {
        self.nodes
            .values()
            .filter_map(|node| match &node.kind {
                NodeKind::Term { key, content } if !EQUALITY_TERMS.contains(&key.as_str()) => {
                    content.get("fields").and_then(Value::as_array).map(|fields| {
                        fields
                            .iter()
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// The wire form of the subtree at `id`. Empty groups produce nothing.
    pub fn queryfy(&self, id: &str, ignore_temp: bool) -> Option<Value> {
        let node = self.nodes.get(id)?;
        let mut out = Map::new();
        match &node.kind {
            NodeKind::Term { key, content } => {
                out.insert(key.clone(), content.clone());
            }
            NodeKind::Group(op) => {
                let children: Vec<Value> = self
                    .children(id)
                    .into_iter()
                    .filter(|(_, child)| !(ignore_temp && child.display.temp))
                    .filter_map(|(child_id, _)| self.queryfy(child_id, ignore_temp))
                    .collect();
                if children.is_empty() {
                    return None;
                }
                out.insert(op.key().to_string(), Value::Array(children));
            }
        }
        Some(Value::Object(out))
    }

    /// The `filters` member of a request body, if the tree holds anything
    /// beyond the root.
    pub fn to_filters(&self, ignore_temp: bool) -> Option<Value> {
        if self.count(ignore_temp) <= 1 {
            return None;
        }
        self.queryfy(ROOT, ignore_temp)
    }

    /// Build a tree from the `filters` member of a request body. A lone term
    /// at the top becomes the only child of an AND root.
    pub fn parse(filters: Option<&Value>) -> Result<Self, FilterParseError> {
        let mut tree = Self::new();
        let Some(filters) = filters else {
            return Ok(tree);
        };
        let (key, value) = single_operator(filters, "filters")?;
        match GroupOp::from_key(key) {
            Some(op) => {
                let items = value.as_array().ok_or_else(|| FilterParseError::GroupNotList {
                    key: key.to_string(),
                    path: "filters".to_string(),
                })?;
                if let Some(root) = tree.nodes.get_mut(ROOT) {
                    root.kind = NodeKind::Group(op);
                }
                tree.parse_items(items, ROOT, &format!("filters.{key}"))?;
            }
            None => {
                tree.parse_items(std::slice::from_ref(filters), ROOT, "filters")?;
            }
        }
        Ok(tree)
    }

    fn parse_items(
        &mut self,
        items: &[Value],
        parent: &str,
        path: &str,
    ) -> Result<(), FilterParseError> {
        for (i, item) in items.iter().enumerate() {
            let item_path = format!("{path}[{i}]");
            let (key, value) = single_operator(item, &item_path)?;
            if let Some(op) = GroupOp::from_key(key) {
                let children = value.as_array().ok_or_else(|| FilterParseError::GroupNotList {
                    key: key.to_string(),
                    path: item_path.clone(),
                })?;
                let id = self.new_id("group", "");
                self.nodes.insert(
                    id.clone(),
                    FilterNode {
                        parent: Some(parent.to_string()),
                        kind: NodeKind::Group(op),
                        display: DisplayMeta::default(),
                    },
                );
                self.parse_items(children, &id, &format!("{item_path}.{key}"))?;
            } else {
                if !value.is_object() {
                    return Err(FilterParseError::TermNotObject {
                        key: key.to_string(),
                        path: item_path,
                    });
                }
                let id = self.new_id("term", "");
                self.nodes.insert(
                    id,
                    FilterNode {
                        parent: Some(parent.to_string()),
                        kind: NodeKind::Term {
                            key: key.to_string(),
                            content: value.clone(),
                        },
                        display: DisplayMeta::default(),
                    },
                );
            }
        }
        Ok(())
    }
}

fn check_term_key(key: &str) -> Result<(), FilterError> {
    if GroupOp::from_key(key).is_some() {
        return Err(FilterError::GroupKeyOnTerm(key.to_string()));
    }
    Ok(())
}

fn check_term_content(key: &str, content: &Value) -> Result<(), FilterError> {
    if !content.is_object() {
        return Err(FilterError::ContentNotObject(key.to_string()));
    }
    Ok(())
}

fn single_operator<'a>(value: &'a Value, path: &str) -> Result<(&'a str, &'a Value), FilterParseError> {
    match value.as_object() {
        Some(map) if map.len() == 1 => map
            .iter()
            .next()
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| FilterParseError::NotSingleOperator {
                path: path.to_string(),
            }),
        _ => Err(FilterParseError::NotSingleOperator {
            path: path.to_string(),
        }),
    }
}
