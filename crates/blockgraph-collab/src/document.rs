//! Canvas Document Types
//!
//! This module defines the in-memory working copy of a model-design canvas.
//! A document is a directed graph of blocks and edges stored in a single
//! `elements` list. Fields the hub does not interpret (category and type tags,
//! edge styling, top-level document metadata) are carried through untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Position of a block on the canvas
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Position {
    /// Create a position
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A block node of the canvas graph.
///
/// Interpreted fields are optional so a block serializes back to the shape it
/// arrived in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Unique element ID
    pub id: String,

    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Canvas position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    /// Parameter values keyed by parameter name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, Value>>,

    /// Opaque fields (category, type tags, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Block {
    /// Create a block with an ID and position
    #[must_use]
    pub fn new(id: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            position: Some(position),
            ..Self::default()
        }
    }

    /// Set the label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Value of one parameter
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|params| params.get(name))
    }
}

/// An edge connecting two blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Unique element ID
    pub id: String,
    /// Source block ID
    pub source: String,
    /// Target block ID
    pub target: String,
    /// Opaque fields (style tags, handles, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Edge {
    /// Create an edge between two blocks
    #[must_use]
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            extra: Map::new(),
        }
    }
}

/// One element of the `elements` list.
///
/// Anything carrying both `source` and `target` is an edge; everything else
/// with an `id` is a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Element {
    /// Edge between two blocks
    Edge(Edge),
    /// Block node
    Block(Block),
}

impl Element {
    /// Element ID
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Edge(edge) => &edge.id,
            Self::Block(block) => &block.id,
        }
    }

    /// Borrow as a block, if this element is one
    #[must_use]
    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Self::Block(block) => Some(block),
            Self::Edge(_) => None,
        }
    }
}

impl From<Block> for Element {
    fn from(block: Block) -> Self {
        Self::Block(block)
    }
}

impl From<Edge> for Element {
    fn from(edge: Edge) -> Self {
        Self::Edge(edge)
    }
}

/// The shared document of one room
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Blocks and edges, in insertion order
    #[serde(default)]
    pub elements: Vec<Element>,

    /// Opaque top-level fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single document mutation, the typed form of a mutating message.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Append a block (replaces an element with the same ID in place)
    CreateBlock(Block),
    /// Delete the element with this ID
    RemoveBlock(String),
    /// Move a block
    MoveBlock {
        /// Block ID
        id: String,
        /// New position
        position: Position,
    },
    /// Set one parameter of a block
    SetParam {
        /// Block ID
        id: String,
        /// Parameter name
        name: String,
        /// Parameter value
        value: Value,
    },
    /// Overwrite a block label
    SetLabel {
        /// Block ID
        id: String,
        /// New label
        label: String,
    },
    /// Replace the whole `elements` list
    ReplaceElements(Vec<Element>),
}

impl Document {
    /// Create an empty document
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document from a list of elements
    #[must_use]
    pub fn with_elements(elements: Vec<Element>) -> Self {
        let mut doc = Self::default();
        doc.replace_elements(elements);
        doc
    }

    /// Get an element by ID
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id() == id)
    }

    /// Get a block by ID
    #[must_use]
    pub fn get_block(&self, id: &str) -> Option<&Block> {
        self.get(id).and_then(Element::as_block)
    }

    fn get_block_mut(&mut self, id: &str) -> Option<&mut Block> {
        self.elements.iter_mut().find_map(|e| match e {
            Element::Block(block) if block.id == id => Some(block),
            _ => None,
        })
    }

    /// Get the number of elements
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Add a block, replacing any element that already uses its ID
    pub fn create_block(&mut self, block: Block) {
        match self.elements.iter().position(|e| e.id() == block.id) {
            Some(pos) => self.elements[pos] = Element::Block(block),
            None => self.elements.push(Element::Block(block)),
        }
    }

    /// Remove an element by ID. Absent IDs are a no-op.
    pub fn remove_element(&mut self, id: &str) -> Option<Element> {
        let pos = self.elements.iter().position(|e| e.id() == id)?;
        Some(self.elements.remove(pos))
    }

    /// Move a block
    pub fn move_block(&mut self, id: &str, position: Position) -> bool {
        match self.get_block_mut(id) {
            Some(block) => {
                block.position = Some(position);
                true
            }
            None => false,
        }
    }

    /// Set one entry of a block's parameter mapping
    pub fn set_param(&mut self, id: &str, name: impl Into<String>, value: Value) -> bool {
        match self.get_block_mut(id) {
            Some(block) => {
                block
                    .params
                    .get_or_insert_with(BTreeMap::new)
                    .insert(name.into(), value);
                true
            }
            None => false,
        }
    }

    /// Overwrite a block's label
    pub fn set_label(&mut self, id: &str, label: impl Into<String>) -> bool {
        match self.get_block_mut(id) {
            Some(block) => {
                block.label = Some(label.into());
                true
            }
            None => false,
        }
    }

    /// Replace the whole element list.
    ///
    /// Duplicate IDs collapse to the last occurrence, kept at the position of
    /// the first.
    pub fn replace_elements(&mut self, elements: Vec<Element>) {
        let mut deduped: Vec<Element> = Vec::with_capacity(elements.len());
        for element in elements {
            match deduped.iter().position(|e| e.id() == element.id()) {
                Some(pos) => deduped[pos] = element,
                None => deduped.push(element),
            }
        }
        self.elements = deduped;
    }

    /// Collapse duplicate IDs the same way [`Document::replace_elements`]
    /// does. Used on documents that did not come through the edit path.
    pub fn dedup_ids(&mut self) {
        let elements = std::mem::take(&mut self.elements);
        self.replace_elements(elements);
    }

    /// Apply an edit. Returns whether the document changed.
    pub fn apply(&mut self, edit: Edit) -> bool {
        match edit {
            Edit::CreateBlock(block) => {
                self.create_block(block);
                true
            }
            Edit::RemoveBlock(id) => self.remove_element(&id).is_some(),
            Edit::MoveBlock { id, position } => self.move_block(&id, position),
            Edit::SetParam { id, name, value } => self.set_param(&id, name, value),
            Edit::SetLabel { id, label } => self.set_label(&id, label),
            Edit::ReplaceElements(elements) => {
                self.replace_elements(elements);
                true
            }
        }
    }
}
