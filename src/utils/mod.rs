pub mod bundle_toml;
pub mod config;
pub mod fd_limit;
pub mod logger;

pub use bundle_toml::{BundleToml, apply_file_to_config, load_bundle_toml, parse_bundle_toml};
pub use config::*;
pub use fd_limit::{FDS_PER_WORKER, cap_workers, max_open_fds, max_workers_by_fd_limit};
pub use logger::setup_logging;
