//! Process configuration.
//!
//! Two layers: [`EnvConfig`] is read from the environment before anything
//! else starts and is immutable for the process lifetime. [`Config`] adds the
//! values the channel script provides through the `neopult.config` table,
//! read exactly once after the script has loaded.

use anyhow::{bail, Context, Result};
use log::debug;
use std::{env, path::PathBuf};

/// Directory searched for shared plugin scripts after the channel home.
pub const GLOBAL_DATA_DIR: &str = "/usr/local/share/neopult";

const CHANNEL_ENV_KEY: &str = "NEOPULT_CHANNEL";
const HOME_ENV_KEY: &str = "NEOPULT_HOME";
const CHANNEL_DEFAULT: u8 = 0;
const CHANNEL_MAX: u8 = 99;

/// Environment-derived configuration, fixed at process start.
#[derive(Debug)]
pub struct EnvConfig {
    /// Channel number (0..=99). Determines the admin port and pid directory.
    pub channel: u8,
    /// Root directory containing all channel homes.
    pub neopult_home: PathBuf,
    /// `<neopult_home>/channel-<N>`, where `init.lua` and `plugins/` live.
    pub channel_home: PathBuf,
}

/// Full configuration once the channel script has been loaded.
#[derive(Debug)]
pub struct Config {
    pub channel: u8,
    pub neopult_home: PathBuf,
    pub channel_home: PathBuf,
    /// Password for the admin WebSocket. `None` rejects every client.
    pub websocket_password: Option<String>,
}

/// Read and validate the environment configuration.
///
/// # Errors
///
/// Fails when `NEOPULT_HOME` is unset, when it points to a missing
/// directory, when the channel home does not exist, or when
/// `NEOPULT_CHANNEL` is present but not an integer in 0..=99.
pub fn from_env() -> Result<EnvConfig> {
    let channel = match env::var(CHANNEL_ENV_KEY) {
        Ok(raw) => {
            let channel: u8 = raw
                .parse()
                .with_context(|| format!("{CHANNEL_ENV_KEY} is not an integer: {raw:?}"))?;
            if channel > CHANNEL_MAX {
                bail!("{CHANNEL_ENV_KEY} must be at most {CHANNEL_MAX}, got {channel}");
            }
            channel
        }
        Err(_) => CHANNEL_DEFAULT,
    };
    debug!("using channel {}", channel);

    let neopult_home = match env::var(HOME_ENV_KEY) {
        Ok(home) => PathBuf::from(home),
        Err(_) => bail!("the {HOME_ENV_KEY} environment variable must point to the neopult home"),
    };
    if !neopult_home.is_dir() {
        bail!(
            "neopult home {} does not exist or is not a directory",
            neopult_home.display()
        );
    }

    let channel_home = neopult_home.join(format!("channel-{channel}"));
    debug!("using channel home {}", channel_home.display());
    if !channel_home.is_dir() {
        bail!("channel home {} does not exist", channel_home.display());
    }

    Ok(EnvConfig {
        channel,
        neopult_home,
        channel_home,
    })
}

impl EnvConfig {
    /// Directory for pid files of spawned child processes.
    #[must_use]
    pub fn pid_dir(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/neopult-channel-{}", self.channel))
    }
}

impl Config {
    /// Combine the environment config with script-provided values.
    #[must_use]
    pub fn new(env_config: &EnvConfig, websocket_password: Option<String>) -> Self {
        Self {
            channel: env_config.channel,
            neopult_home: env_config.neopult_home.clone(),
            channel_home: env_config.channel_home.clone(),
            websocket_password,
        }
    }

    /// TCP port of the admin WebSocket server.
    #[must_use]
    pub fn admin_port(&self) -> u16 {
        4200 + u16::from(self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // Environment variables are process-global, so these tests set up the
    // full environment each time and run under `--test-threads=1` semantics
    // via a shared lock.
    use std::sync::Mutex;
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn setup_home(channel: u8) -> TempDir {
        let home = TempDir::new().expect("tempdir");
        fs::create_dir(home.path().join(format!("channel-{channel}"))).expect("channel home");
        home
    }

    #[test]
    fn test_from_env_defaults_channel_to_zero() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        let home = setup_home(0);
        env::remove_var(CHANNEL_ENV_KEY);
        env::set_var(HOME_ENV_KEY, home.path());

        let config = from_env().expect("config should load");
        assert_eq!(config.channel, 0);
        assert_eq!(config.channel_home, home.path().join("channel-0"));
    }

    #[test]
    fn test_from_env_reads_channel() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        let home = setup_home(17);
        env::set_var(CHANNEL_ENV_KEY, "17");
        env::set_var(HOME_ENV_KEY, home.path());

        let config = from_env().expect("config should load");
        assert_eq!(config.channel, 17);
        assert_eq!(config.pid_dir(), PathBuf::from("/tmp/neopult-channel-17"));

        env::remove_var(CHANNEL_ENV_KEY);
    }

    #[test]
    fn test_from_env_rejects_out_of_range_channel() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        let home = setup_home(0);
        env::set_var(CHANNEL_ENV_KEY, "100");
        env::set_var(HOME_ENV_KEY, home.path());

        assert!(from_env().is_err());

        env::remove_var(CHANNEL_ENV_KEY);
    }

    #[test]
    fn test_from_env_rejects_missing_channel_home() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        let home = TempDir::new().expect("tempdir");
        env::remove_var(CHANNEL_ENV_KEY);
        env::set_var(HOME_ENV_KEY, home.path());

        // No channel-0 directory inside the home.
        assert!(from_env().is_err());
    }

    #[test]
    fn test_admin_port_is_channel_offset() {
        let env_config = EnvConfig {
            channel: 5,
            neopult_home: PathBuf::from("/"),
            channel_home: PathBuf::from("/"),
        };
        let config = Config::new(&env_config, Some("secret".to_string()));
        assert_eq!(config.admin_port(), 4205);
    }
}
