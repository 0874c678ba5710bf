use std::path::PathBuf;

/// Returns the config/data directory path for nbhost.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("nbhost")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("nbhost")
    } else {
        PathBuf::from("/tmp/nbhost")
    }
}

/// Returns the config file path for nbhost.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Base URL of an engine listening on the loopback interface.
pub fn local_server_url(port: u16) -> String {
    format!("http://localhost:{port}")
}
