use colored::{ColoredString, Colorize};
use env_logger::Builder;
use log::{Level, LevelFilter};
use std::io::Write;

fn level_tag(level: Level) -> Option<ColoredString> {
    match level {
        Level::Error => Some("ERROR".red()),
        Level::Warn => Some("WARN".yellow()),
        _ => None,
    }
}

/// Crate at Debug (verbose) or Info, dependencies at Warn; `RUST_LOG` still overrides.
/// Warnings and errors carry a coloured tag and their target module, debug lines are dimmed.
/// Returns false if a logger was already installed (e.g. a second run in the same process).
pub fn setup_logging(verbose: bool) -> bool {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(LevelFilter::Warn)
        .filter_module(env!("CARGO_CRATE_NAME"), level)
        .parse_default_env()
        .format(|buf, record| {
            let name = env!("CARGO_PKG_NAME").cyan();
            match (level_tag(record.level()), record.level()) {
                (Some(tag), _) => writeln!(
                    buf,
                    "[{} {} {}] {}",
                    name,
                    tag,
                    record.target().white(),
                    record.args()
                ),
                (None, Level::Debug | Level::Trace) => {
                    writeln!(buf, "[{}] {}", name, record.args().to_string().dimmed())
                }
                (None, _) => writeln!(buf, "[{}] {}", name, record.args()),
            }
        })
        .try_init()
        .is_ok()
}
