use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::models::Identity;
use crate::p2p::SessionSnapshot;

pub const ENV_PHONE: &str = "HEYCHAT_PHONE";
pub const ENV_NAME: &str = "HEYCHAT_NAME";
pub const ENV_RELAY: &str = "HEYCHAT_RELAY";

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9000";

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `dir` instead of the platform config directory. Only the first call wins.
pub fn set_config_dir_override(dir: PathBuf) -> bool {
    CONFIG_DIR_OVERRIDE.set(dir).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE.get() {
        return Ok(dir.clone());
    }
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("heychat");
    Ok(config_dir)
}

/// Who we are on this machine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub phone: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
}

impl Profile {
    pub fn new(phone: &str, display_name: &str) -> Self {
        Profile {
            phone: phone.to_string(),
            display_name: display_name.to_string(),
            relay_url: None,
        }
    }

    /// Fill in anything set through the environment, overriding stored values.
    pub fn apply_env(mut self) -> Self {
        if let Ok(phone) = env::var(ENV_PHONE) {
            self.phone = phone;
        }
        if let Ok(name) = env::var(ENV_NAME) {
            self.display_name = name;
        }
        if let Ok(relay) = env::var(ENV_RELAY) {
            self.relay_url = Some(relay);
        }
        self
    }

    pub fn relay_url(&self) -> &str {
        self.relay_url.as_deref().unwrap_or(DEFAULT_RELAY_URL)
    }

    /// The identity for this profile at a transport address.
    pub fn identity(&self, address: &str) -> Result<Identity> {
        Identity::from_phone(&self.phone, self.display_name.clone(), address)
            .ok_or_else(|| anyhow!("'{}' is not a valid phone number", self.phone))
    }
}

/// Profile and session snapshots on disk.
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(ConfigStore { dir })
    }

    pub fn open_default() -> Result<Self> {
        Self::new(get_config_dir()?)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("heychat.log")
    }

    fn profile_path(&self) -> PathBuf {
        self.dir.join("profile.json")
    }

    fn snapshot_path(&self, local_id: &str) -> PathBuf {
        let safe: String = local_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '+' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("state-{}.json", safe))
    }

    pub fn save_profile(&self, profile: &Profile) -> Result<()> {
        let file = File::create(self.profile_path())?;
        serde_json::to_writer_pretty(file, profile)?;
        info!("Profile saved for {}", profile.phone);
        Ok(())
    }

    pub fn load_profile(&self) -> Result<Option<Profile>> {
        let path = self.profile_path();
        if !path.exists() {
            return Ok(None);
        }
        let profile: Profile = serde_json::from_str(&read_to_string(&path)?)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!("Loaded profile for {} from {}", profile.phone, path.display());
        Ok(Some(profile))
    }

    pub fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.local_id);
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, snapshot)?;
        info!(
            "Saved {} contact(s) and {} conversation(s) to {}",
            snapshot.contacts.len(),
            snapshot.conversations.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load_snapshot(&self, local_id: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.snapshot_path(local_id);
        if !path.exists() {
            return Ok(None);
        }
        match serde_json::from_str::<SessionSnapshot>(&read_to_string(&path)?) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Ignoring unreadable snapshot {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}

fn read_to_string(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(contents)
}
