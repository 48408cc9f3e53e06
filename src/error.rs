use thiserror::Error;
use wasm_bindgen::JsValue;

pub type Result<T> = std::result::Result<T, GpxError>;

#[derive(Debug, Error)]
pub enum GpxError {
    #[error("GPX does not validate: {0}")]
    SchemaInvalid(#[from] SchemaError),

    #[error("version {0:?} is not supported, must use GPX v1.1")]
    UnsupportedVersion(String),

    #[error("not a GPX document: root element is <{0}>")]
    NotGpx(String),

    #[error("unrecognized element <{element}> inside <{parent}>")]
    UnrecognizedElement {
        parent: &'static str,
        element: String,
    },

    #[error("missing attribute '{attribute}' on <{element}>")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("invalid value '{value}' for attribute '{attribute}' on <{element}>")]
    InvalidAttribute {
        element: &'static str,
        attribute: &'static str,
        value: String,
    },

    #[error("invalid number '{value}' in <{element}>")]
    InvalidNumber { element: &'static str, value: String },

    #[error("coordinate ({lat}, {lon}) is out of range")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("malformed timestamp '{0}'")]
    MalformedTimestamp(String),

    #[error("track point has no timestamp")]
    MissingTimestamp,

    #[error("no track data")]
    NoData,

    #[error("entity '&{0};' declared in a DTD is not supported")]
    UnsupportedEntity(String),

    #[error("malformed XML: {0}")]
    MalformedXml(#[from] roxmltree::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("document is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("failed to read GPX input: {0}")]
    Io(#[from] std::io::Error),
}

/// A schema validation diagnostic, with the position of the offending node
/// when one is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl SchemaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
            column: Some(column),
        }
    }
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{line}:{column}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for SchemaError {}

impl From<GpxError> for JsValue {
    fn from(e: GpxError) -> Self {
        JsValue::from_str(&e.to_string())
    }
}
