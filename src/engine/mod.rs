//! Engine module: command-line front end and path utilities

pub mod arg_parser;
pub mod cli;
pub mod tools;

// Re-export commonly used functions
pub use arg_parser::Cli;
pub use cli::{build_config, handle_run};
pub use tools::{
    canonicalize_output, canonicalize_root, display_path, glob_match, is_os_hidden_file,
    path_relative_to, path_to_slash_string, should_include_in_walk,
};
