//! Reply templates: model, locale date table, and the two-level lookup index.

pub mod date;
pub mod index;
pub mod model;

pub use date::{DateFormatTable, DateNames, format_long_date};
pub use index::TemplateIndex;
pub use model::{ContentKind, DEFAULT_LANGUAGE, ReplyTemplate};
