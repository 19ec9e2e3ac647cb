pub mod manifest;
pub mod minify;
pub mod model;
pub mod pagelist;
pub mod repo;
pub mod script_file;
pub mod wire;

pub use model::{Action, EventConfig, ModuleConfig, PageConfig};
pub use pagelist::{parse_page_list, PageFilter};
pub use repo::ConfigRepo;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("{file}: malformed front-matter line: {line:?}")]
    MalformedFrontMatter { file: String, line: String },

    #[error("{file}: malformed event header: {line:?}")]
    MalformedEventHeader { file: String, line: String },

    #[error("{file}: {detail}")]
    ManifestMismatch { file: String, detail: String },

    #[error("{file}: unknown event name: {name:?}")]
    UnknownEvent { file: String, name: String },

    #[error("{file}: event {event} is not supported by element {element}")]
    UnsupportedEvent {
        file: String,
        element: u8,
        event: String,
    },

    #[error("{file}: duplicate configuration for element {element} event {event}")]
    DuplicateEvent {
        file: String,
        element: u8,
        event: String,
    },

    #[error("{dir}: page {page} is listed in module.json but page-{page}.lua is missing")]
    MissingPage { dir: String, page: u8 },

    #[error("Unsafe path component: {0:?}")]
    UnsafePath(String),

    #[error("Invalid page list: {0}")]
    InvalidPageList(String),

    #[error("Script too large: {0} characters")]
    ScriptTooLarge(usize),

    #[error("Malformed action string: {0}")]
    MalformedActionString(String),

    #[error("Configuration is invalid:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
