pub mod audit_logger;
pub mod line_ending_handler;
pub mod output_clip;
pub mod path_utils;
pub mod rollback_log;
