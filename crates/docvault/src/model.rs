use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Block names seeded at first boot. Blocks are only ever updated, never
/// deleted, so this list is also the set a restore must end up with.
pub const SEED_BLOCK_NAMES: &[&str] = &[
    "hero",
    "about",
    "advantages",
    "courses",
    "contact",
    "footer",
    LEGAL_BLOCK_NAME,
];

pub const LEGAL_BLOCK_NAME: &str = "documents-legal";

const LEGAL_TEXT_KEY: &str = "legal_info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Image,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "pdf" => Ok(FileType::Pdf),
            "image" => Ok(FileType::Image),
            other => Err(Error::parse(format!("unknown file type '{other}'"))),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Generated name under which the bytes live locally and on the mirror.
    pub filename: String,
    pub original_name: String,
    pub file_size: i64,
    pub file_type: FileType,
    pub is_visible: bool,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub section_id: Option<i64>,
    #[serde(default)]
    pub subsection_id: Option<i64>,
    pub created_at: String,
}

/// Structured payload of a content block.
///
/// The variant is chosen from the block name when the block is built: the
/// legal block carries a single text, every other block carries a list (or,
/// for hand-edited rows, any other JSON value kept verbatim).
#[derive(Debug, Clone, PartialEq)]
pub enum BlockBody {
    Empty,
    Items(Vec<Value>),
    LegalText(String),
    Structured(Value),
}

impl BlockBody {
    /// Decode the stored JSON for a block called `name`.
    pub fn decode(name: &str, raw: Option<Value>) -> Result<Self> {
        let Some(raw) = raw else {
            return Ok(BlockBody::Empty);
        };
        if raw.is_null() {
            return Ok(BlockBody::Empty);
        }
        if name == LEGAL_BLOCK_NAME {
            return match raw.get(LEGAL_TEXT_KEY) {
                Some(Value::String(s)) => Ok(BlockBody::LegalText(s.clone())),
                _ => Err(Error::parse(format!(
                    "block '{name}': expected an object with a '{LEGAL_TEXT_KEY}' string"
                ))),
            };
        }
        Ok(match raw {
            Value::Array(items) => BlockBody::Items(items),
            other => BlockBody::Structured(other),
        })
    }

    /// Like [`BlockBody::decode`], but a malformed value is logged and
    /// treated as absent.
    pub fn decode_lenient(name: &str, raw: Option<Value>) -> Self {
        BlockBody::decode(name, raw).unwrap_or_else(|e| {
            tracing::warn!(block = name, error = %e, "discarding malformed block items");
            BlockBody::Empty
        })
    }

    pub fn decode_text(name: &str, raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return BlockBody::Empty;
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(v) => BlockBody::decode_lenient(name, Some(v)),
            Err(e) => {
                tracing::warn!(block = name, error = %e, "discarding unparseable block items");
                BlockBody::Empty
            }
        }
    }

    pub fn encode(&self) -> Option<Value> {
        match self {
            BlockBody::Empty => None,
            BlockBody::Items(items) => Some(Value::Array(items.clone())),
            BlockBody::LegalText(text) => {
                let mut obj = serde_json::Map::new();
                obj.insert(LEGAL_TEXT_KEY.to_string(), Value::String(text.clone()));
                Some(Value::Object(obj))
            }
            BlockBody::Structured(v) => Some(v.clone()),
        }
    }

    pub fn encode_text(&self) -> Option<String> {
        self.encode().map(|v| v.to_string())
    }
}

/// Persisted shape of a block: the body travels as plain JSON under `items`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockRecord {
    id: i64,
    name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    button_text: Option<String>,
    #[serde(default)]
    button_link: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    items: Option<Value>,
    #[serde(default = "default_visible")]
    is_visible: bool,
    #[serde(default)]
    updated_at: Option<String>,
}

fn default_visible() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BlockRecord", into = "BlockRecord")]
pub struct ContentBlock {
    pub id: i64,
    pub name: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub content: Option<String>,
    pub button_text: Option<String>,
    pub button_link: Option<String>,
    pub image: Option<String>,
    pub body: BlockBody,
    pub is_visible: bool,
    pub updated_at: Option<String>,
}

impl From<BlockRecord> for ContentBlock {
    fn from(r: BlockRecord) -> Self {
        let body = BlockBody::decode_lenient(&r.name, r.items);
        Self {
            id: r.id,
            name: r.name,
            title: r.title,
            subtitle: r.subtitle,
            content: r.content,
            button_text: r.button_text,
            button_link: r.button_link,
            image: r.image,
            body,
            is_visible: r.is_visible,
            updated_at: r.updated_at,
        }
    }
}

impl From<ContentBlock> for BlockRecord {
    fn from(b: ContentBlock) -> Self {
        let items = b.body.encode();
        Self {
            id: b.id,
            name: b.name,
            title: b.title,
            subtitle: b.subtitle,
            content: b.content,
            button_text: b.button_text,
            button_link: b.button_link,
            image: b.image,
            items,
            is_visible: b.is_visible,
            updated_at: b.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub sort_order: i64,
    pub is_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsection {
    pub id: i64,
    pub section_id: i64,
    pub name: String,
    #[serde(default)]
    pub sort_order: i64,
    pub is_visible: bool,
}

/// Admin credential metadata. The password hash never leaves the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUser {
    pub id: i64,
    pub username: String,
    pub created_at: String,
}

/// Metadata accompanying an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub original_name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_visible: bool,
    pub section_id: Option<i64>,
    pub subsection_id: Option<i64>,
}

impl UploadMeta {
    pub fn named(original_name: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            is_visible: true,
            ..Self::default()
        }
    }
}

/// Partial document update. `None` leaves a column as it is; for the
/// nullable columns `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub is_visible: Option<bool>,
    pub section_id: Option<Option<i64>>,
    pub subsection_id: Option<Option<i64>>,
}

impl DocumentPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.is_visible.is_none()
            && self.section_id.is_none()
            && self.subsection_id.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockPatch {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub content: Option<String>,
    pub button_text: Option<String>,
    pub button_link: Option<String>,
    pub image: Option<Option<String>>,
    /// Raw JSON, decoded against the block's name before the update.
    pub items: Option<Value>,
    pub is_visible: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct SectionInput {
    pub name: String,
    pub sort_order: i64,
    pub is_visible: bool,
}
