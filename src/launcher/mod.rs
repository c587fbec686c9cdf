pub mod bootdefault;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod control;
pub mod daemonize;
pub mod perf;
pub mod portlist;
pub mod supervisor;

use chrono::Local;

/// Timestamped operational log line on stderr, kept apart from the
/// application output the supervisor forwards.
pub(crate) fn launcher_event(component: &str, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    eprintln!("{ts} [{component}] {}", msg.as_ref());
}

pub fn main() -> anyhow::Result<std::process::ExitCode> {
    cli::run()
}
