use std::path::PathBuf;
use std::process;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Configuration file used when neither the flag nor the environment names one.
pub const DEFAULT_CONFIG_PATH: &str = "config/routes.yaml";

/// Exits the program with an error message
pub fn exit_with_error(message: &str) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

/// Exits the program with an error message and usage information
pub fn exit_with_usage_error(message: &str, usage: &str) -> ! {
    eprintln!("Error: {}", message);
    eprintln!("{}", usage);
    process::exit(1);
}

/// Picks the configuration file: the flag, else `CONFIG_PATH`, else the default.
pub fn config_path(flag: Option<String>) -> PathBuf {
    resolve_config_path(flag, std::env::var(CONFIG_PATH_ENV).ok())
}

fn resolve_config_path(flag: Option<String>, env: Option<String>) -> PathBuf {
    flag.filter(|p| !p.is_empty())
        .or_else(|| env.filter(|p| !p.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
