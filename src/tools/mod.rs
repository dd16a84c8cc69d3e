pub mod edit_tool;
pub mod filesystem_tool;
pub mod process_tool;
pub mod ripgrep_tool;
pub mod task_tool;
pub mod terminal_tool;
