use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::MoxError;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/mockmox/config.yaml";
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default = "qemu:///system")]
    pub libvirtd: String,
    #[facet(default)]
    pub directories: DirectoriesConfig,
    #[facet(default)]
    pub defaults: DefaultsConfig,
    #[facet(default)]
    pub hypervisor: HypervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            libvirtd: DEFAULT_LIBVIRT_URI.into(),
            directories: DirectoriesConfig::default(),
            defaults: DefaultsConfig::default(),
            hypervisor: HypervisorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DirectoriesConfig {
    #[facet(default = "/opt/mockmox")]
    pub base_dir: String,
    /// Where `install` links the control script. Packaging only.
    #[facet(default = "/usr/local/bin/mockmox")]
    pub script_location: String,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            base_dir: "/opt/mockmox".into(),
            script_location: "/usr/local/bin/mockmox".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DefaultsConfig {
    /// GB
    #[facet(default = 64)]
    pub vm_disk_size: u64,
    #[facet(default = 4)]
    pub vm_cpus: u32,
    /// MB
    #[facet(default = 8192)]
    pub vm_memory: u64,
    #[facet(default = 60)]
    pub shutdown_timeout_secs: u64,
    #[facet(default)]
    pub provisioning: Provisioning,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            vm_disk_size: 64,
            vm_cpus: 4,
            vm_memory: 8192,
            shutdown_timeout_secs: 60,
            provisioning: Provisioning::Copy,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HypervisorConfig {
    #[facet(default = "kvm")]
    pub domain_type: String,
    #[facet(default = "q35")]
    pub machine: String,
    #[facet(default = "default")]
    pub network: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            domain_type: "kvm".into(),
            machine: "q35".into(),
            network: "default".into(),
        }
    }
}

/// How instance disks are derived from a template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Facet)]
#[facet(default)]
#[repr(u8)]
pub enum Provisioning {
    /// Independent full copy of the template disk.
    #[default]
    #[facet(rename = "copy")]
    Copy,
    /// qcow2 overlay backed by the template disk.
    #[facet(rename = "overlay")]
    Overlay,
}

impl Config {
    pub fn base_dir(&self) -> PathBuf {
        PathBuf::from(&self.directories.base_dir)
    }

    pub fn provisioning(&self) -> Provisioning {
        self.defaults.provisioning
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.defaults.shutdown_timeout_secs)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), MoxError> {
    if config.libvirtd.trim().is_empty() {
        return Err(MoxError::Validation {
            message: "libvirtd connection URI must not be empty".into(),
        });
    }
    if !Path::new(&config.directories.base_dir).is_absolute() {
        return Err(MoxError::Validation {
            message: format!(
                "directories.base_dir must be absolute (got '{}')",
                config.directories.base_dir
            ),
        });
    }
    if config.defaults.vm_cpus < 1 {
        return Err(MoxError::Validation {
            message: "defaults.vm_cpus must be at least 1".into(),
        });
    }
    if config.defaults.vm_memory < 256 {
        return Err(MoxError::Validation {
            message: "defaults.vm_memory must be at least 256 MB".into(),
        });
    }
    if config.defaults.vm_disk_size < 1 {
        return Err(MoxError::Validation {
            message: "defaults.vm_disk_size must be at least 1 GB".into(),
        });
    }
    Ok(())
}

/// Validate a template or instance name: `[a-zA-Z0-9][a-zA-Z0-9._-]*`.
pub fn validate_name(name: &str) -> Result<(), MoxError> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(MoxError::Validation {
            message: format!("name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, MoxError> {
    // An empty document is a valid "all defaults" config.
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = facet_yaml::from_str(contents).map_err(|e| MoxError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Load the config file. A missing file at the default location means defaults;
/// a missing file anywhere else is an error.
pub fn load_config(path: &Path) -> Result<Config, MoxError> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_FILE) {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|source| MoxError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents, path)
}
