use std::fs;
use std::path::{Path, PathBuf};

use crate::launcher::launcher_event;

/// Base configuration file, parsed once per invocation.
pub const CONFIG_FILE: &str = "/etc/applauncher.conf";

/// Overlay fragment directories, re-scanned on every application (re)start
/// because their contents are expected to change between launches.
pub const CONFIG_OVERLAY_DIRS: [&str; 2] =
    ["/var/lib/applauncher/conf.d", "/tmp/applauncher/conf.d"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugInterface {
    Local,
    Public,
}

/// Launch configuration composed from the base file plus overlay fragments.
///
/// `env` keeps insertion order; a key set by the ambient environment or by an
/// earlier fragment is never overwritten by a later one.
#[derive(Debug, Clone)]
pub struct Config {
    pub base: String,
    pub platform: String,
    pub env: Vec<(String, String)>,
    pub args: Vec<String>,
    pub debug_interface: DebugInterface,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base: "unknown".to_string(),
            platform: "unknown".to_string(),
            env: vec![],
            args: vec![],
            debug_interface: DebugInterface::Local,
        }
    }
}

impl Config {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set_env_if_absent(&mut self, key: String, value: String) {
        if self.env_value(&key).is_none() {
            self.env.push((key, value));
        }
    }
}

/// Collapses internal whitespace runs and trims, like the values in the
/// config file are normalized before use.
fn simplified(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn apply_line(config: &mut Config, line: &str) {
    if let Some(rest) = line.strip_prefix("env=") {
        let rest = simplified(rest);
        match rest.find('=') {
            // Keys shorter than two characters are ignored.
            Some(idx) if idx >= 2 => {
                let key = rest[..idx].to_string();
                let value = rest[idx + 1..].to_string();
                config.set_env_if_absent(key, value);
            }
            _ => {}
        }
    } else if let Some(rest) = line.strip_prefix("append=") {
        config.args.push(simplified(rest));
    } else if let Some(rest) = line.strip_prefix("base=") {
        config.base = simplified(rest);
    } else if let Some(rest) = line.strip_prefix("platform=") {
        config.platform = simplified(rest);
    } else if let Some(rest) = line.strip_prefix("debugInterface=") {
        match simplified(rest).as_str() {
            "local" => config.debug_interface = DebugInterface::Local,
            "public" => config.debug_interface = DebugInterface::Public,
            other => launcher_event(
                "config",
                format!("outcome=unknown_debug_interface value={other:?}"),
            ),
        }
    }
}

fn apply_file(config: &mut Config, path: &Path) -> bool {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return false,
    };
    for line in contents.lines() {
        apply_line(config, line);
    }
    true
}

/// Parses the base configuration file. A missing or unreadable file is
/// reported and yields the defaults.
pub fn parse_config_file(path: &Path) -> Config {
    let mut config = Config::default();
    if !apply_file(&mut config, path) {
        eprintln!("Could not read config file {}.", path.display());
    }
    config
}

/// Applies every fragment in `dir`, in sorted name order. Missing
/// directories are fine; fragments never override what is already set.
pub fn apply_config_directory(config: &mut Config, dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    for file in files {
        apply_file(config, &file);
    }
}

/// Where configuration comes from: one base file plus overlay directories.
///
/// The supervisor keeps this around so that every restart can rebuild the
/// effective configuration from a fresh scan.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub file: PathBuf,
    pub overlay_dirs: Vec<PathBuf>,
}

impl ConfigSource {
    pub fn system() -> Self {
        Self {
            file: PathBuf::from(CONFIG_FILE),
            overlay_dirs: CONFIG_OVERLAY_DIRS.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn load_base(&self) -> Config {
        parse_config_file(&self.file)
    }

    /// Overlays a fresh scan of the fragment directories onto `base`.
    pub fn effective(&self, base: &Config) -> Config {
        let mut config = base.clone();
        for dir in &self.overlay_dirs {
            apply_config_directory(&mut config, dir);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn parses_all_directives() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("launcher.conf");
        fs::write(
            &path,
            "env=QT_QPA_PLATFORM=eglfs\n\
             append=-plugin\n\
             append=evdevtouch\n\
             base=2.1\n\
             platform=imx6\n\
             debugInterface=public\n",
        )
        .unwrap();

        let config = parse_config_file(&path);
        assert_eq!(config.env_value("QT_QPA_PLATFORM"), Some("eglfs"));
        assert_eq!(config.args, vec!["-plugin", "evdevtouch"]);
        assert_eq!(config.base, "2.1");
        assert_eq!(config.platform, "imx6");
        assert_eq!(config.debug_interface, DebugInterface::Public);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = parse_config_file(Path::new("/nonexistent/launcher.conf"));
        assert_eq!(config.base, "unknown");
        assert_eq!(config.platform, "unknown");
        assert_eq!(config.debug_interface, DebugInterface::Local);
        assert!(config.env.is_empty());
    }

    #[test]
    fn env_values_are_normalized_and_short_keys_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("launcher.conf");
        fs::write(&path, "env=KEY=a   b\nenv=K=dropped\nunknown=line\n").unwrap();

        let config = parse_config_file(&path);
        assert_eq!(config.env_value("KEY"), Some("a b"));
        assert_eq!(config.env.len(), 1);
    }

    #[test]
    fn earlier_fragment_wins() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("10-first.conf"), "env=MODE=first\n").unwrap();
        fs::write(dir.path().join("20-second.conf"), "env=MODE=second\nenv=EXTRA=yes\n")
            .unwrap();

        let mut config = Config::default();
        apply_config_directory(&mut config, dir.path());
        assert_eq!(config.env_value("MODE"), Some("first"));
        assert_eq!(config.env_value("EXTRA"), Some("yes"));
    }

    #[test]
    fn base_file_entry_beats_overlay_fragment() {
        let base_dir = tempdir().unwrap();
        let base_file = base_dir.path().join("launcher.conf");
        fs::write(&base_file, "env=MODE=base\n").unwrap();
        let overlay = tempdir().unwrap();
        fs::write(overlay.path().join("frag.conf"), "env=MODE=overlay\n").unwrap();

        let source = ConfigSource {
            file: base_file,
            overlay_dirs: vec![overlay.path().to_path_buf()],
        };
        let base = source.load_base();
        let effective = source.effective(&base);
        assert_eq!(effective.env_value("MODE"), Some("base"));
    }

    #[test]
    fn effective_rescans_fragments() {
        let overlay = tempdir().unwrap();
        let source = ConfigSource {
            file: PathBuf::from("/nonexistent/launcher.conf"),
            overlay_dirs: vec![overlay.path().to_path_buf()],
        };
        let base = Config::default();

        let first = source.effective(&base);
        assert_eq!(first.env_value("ROTATION"), None);

        fs::write(overlay.path().join("frag.conf"), "env=ROTATION=90\nappend=--fullscreen\n")
            .unwrap();
        let second = source.effective(&base);
        assert_eq!(second.env_value("ROTATION"), Some("90"));
        assert_eq!(second.args, vec!["--fullscreen"]);
        // The base object itself stays untouched.
        assert!(base.args.is_empty());
    }

    #[test]
    fn missing_overlay_directory_is_fine() {
        let mut config = Config::default();
        apply_config_directory(&mut config, Path::new("/nonexistent/conf.d"));
        assert!(config.env.is_empty());
    }
}
