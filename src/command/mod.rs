pub mod parser;
pub mod types;

pub use parser::{contains_tag_fragments, parse_commands};
pub use types::{Command, ExternalKind, COMMAND_TAGS};
