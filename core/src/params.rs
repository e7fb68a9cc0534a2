//! Request parameter payloads.
//!
//! # Design
//! `Parameters` is a closed tagged union: a flat url-encoded map, an ordered
//! list of multipart items, or a JSON object. Url-encoded values are
//! `Option<String>` so an explicit null can override a default entry for the
//! same key. JSON payloads are kept as a `serde_json` object, which makes
//! equality and hashing structural (key order never matters).

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ApiError;

/// A JSON object payload.
pub type JsonObject = Map<String, Value>;

/// Parameters attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameters {
    /// Flat key/value map. `None` is an explicit null.
    UrlEncoded(BTreeMap<String, Option<String>>),
    /// Ordered multipart form items.
    Multipart(Vec<MultipartItem>),
    /// A JSON object body.
    Json(JsonObject),
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters::UrlEncoded(BTreeMap::new())
    }
}

impl Parameters {
    /// Url-encoded parameters from `(key, value)` pairs. Values are stringified.
    pub fn url_encoded<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        Parameters::UrlEncoded(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.to_string())))
                .collect(),
        )
    }

    /// JSON parameters from any value that serializes to a JSON object.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, ApiError> {
        match serde_json::to_value(value) {
            Ok(Value::Object(map)) => Ok(Parameters::Json(map)),
            Ok(other) => Err(ApiError::Encoding(format!(
                "JSON parameters must be an object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(ApiError::Encoding(e.to_string())),
        }
    }

    pub fn multipart(items: impl IntoIterator<Item = MultipartItem>) -> Self {
        Parameters::Multipart(items.into_iter().collect())
    }

    /// Whether the payload carries nothing at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Parameters::UrlEncoded(map) => map.is_empty(),
            Parameters::Multipart(items) => items.is_empty(),
            Parameters::Json(map) => map.is_empty(),
        }
    }
}

impl Hash for Parameters {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Parameters::UrlEncoded(map) => {
                0u8.hash(state);
                map.hash(state);
            }
            Parameters::Multipart(items) => {
                1u8.hash(state);
                items.hash(state);
            }
            Parameters::Json(map) => {
                2u8.hash(state);
                hash_json_object(map, state);
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn hash_json_object<H: Hasher>(map: &JsonObject, state: &mut H) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys.len().hash(state);
    for key in keys {
        key.hash(state);
        hash_json(&map[key.as_str()], state);
    }
}

fn hash_json<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            n.to_string().hash(state);
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_json(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            hash_json_object(map, state);
        }
    }
}

/// One named part of a multipart form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MultipartItem {
    /// Raw bytes with no file name.
    Data { name: String, value: Vec<u8> },
    /// An in-memory file.
    FileData {
        name: String,
        data: Vec<u8>,
        file_name: String,
        mime_type: String,
    },
    /// A whole file on disk, read when the body is encoded.
    File {
        name: String,
        path: PathBuf,
        file_name: String,
        mime_type: String,
    },
    /// `length` bytes of a file on disk starting at `offset`.
    PartialFile {
        name: String,
        path: PathBuf,
        offset: u64,
        length: u64,
        file_name: String,
        mime_type: String,
    },
}

impl MultipartItem {
    pub fn name(&self) -> &str {
        match self {
            MultipartItem::Data { name, .. }
            | MultipartItem::FileData { name, .. }
            | MultipartItem::File { name, .. }
            | MultipartItem::PartialFile { name, .. } => name,
        }
    }

    pub fn data(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        MultipartItem::Data {
            name: name.into(),
            value: value.into(),
        }
    }

    /// UTF-8 text as a data item.
    pub fn text(name: impl Into<String>, value: &str) -> Self {
        Self::data(name, value.as_bytes().to_vec())
    }

    /// A file item whose file name and MIME type come from `path`.
    pub fn file(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        let path = path.into();
        MultipartItem::File {
            name: name.into(),
            file_name: file_name_of(&path),
            mime_type: mime_type_for_path(&path).to_string(),
            path,
        }
    }

    /// A partial file item whose file name and MIME type come from `path`.
    pub fn partial_file(
        path: impl Into<PathBuf>,
        offset: u64,
        length: u64,
        name: impl Into<String>,
    ) -> Self {
        let path = path.into();
        MultipartItem::PartialFile {
            name: name.into(),
            offset,
            length,
            file_name: file_name_of(&path),
            mime_type: mime_type_for_path(&path).to_string(),
            path,
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// MIME type guessed from a path's extension.
pub fn mime_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}
