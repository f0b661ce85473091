//! Parsing of the branching conversation export.

pub mod model;
pub mod parser;
pub mod tree;

pub use model::{ExportConversation, ExportMessage, ExportNode, Role};
pub use parser::{load_export, ExportParser, FileSummary, ImportOutcome};
pub use tree::{walk, TreeWarning, Walk};
