//! Config path resolution for toolgate
//!
//! Follows the XDG Base Directory Specification with an env var override.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TOOLGATE_CONFIG` | Config file | `~/.config/toolgate/toolgate.toml` |

use std::path::PathBuf;

/// Get the XDG config directory for toolgate
///
/// Priority: `XDG_CONFIG_HOME` > `~/.config`
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("toolgate");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/toolgate");
    }

    // Last resort: current directory
    PathBuf::from(".")
}

/// Get the config file path
///
/// Priority: `TOOLGATE_CONFIG` env var > `config_dir()/toolgate.toml`
pub fn config_path() -> PathBuf {
    std::env::var("TOOLGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("toolgate.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify env vars
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_path_env_vars() {
        env::remove_var("TOOLGATE_CONFIG");
        env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    fn test_env_var_override_config() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var("TOOLGATE_CONFIG", "/custom/toolgate.toml");
        assert_eq!(config_path(), PathBuf::from("/custom/toolgate.toml"));
        clear_path_env_vars();
    }

    #[test]
    fn test_xdg_config_home_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var("XDG_CONFIG_HOME", "/xdg/config");
        assert_eq!(config_dir(), PathBuf::from("/xdg/config/toolgate"));
        assert_eq!(
            config_path(),
            PathBuf::from("/xdg/config/toolgate/toolgate.toml")
        );
        clear_path_env_vars();
    }

    #[test]
    fn test_home_fallback() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        if let Ok(home) = env::var("HOME") {
            assert_eq!(
                config_path(),
                PathBuf::from(home).join(".config/toolgate/toolgate.toml")
            );
        }
    }
}
