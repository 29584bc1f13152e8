use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Configuration file name
const CONFIG_FILE: &str = "izromwbw.toml";

/// ROM application entry: a host .sys image bootable from the loader
/// prompt by a single key.
#[derive(Debug, Clone, Deserialize)]
pub struct RomAppConfig {
    pub key: String,
    pub name: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ROM image file
    pub rom: Option<String>,

    /// Hard disk images; the list index is the disk unit
    pub disks: Vec<String>,

    /// ROM applications for the boot menu
    pub rom_apps: Vec<RomAppConfig>,

    /// Boot command typed into the loader automatically
    pub boot: Option<String>,

    /// Argument line exposed to the guest's host-file utilities
    pub cmdline: Option<String>,

    /// Halt on unknown I/O ports instead of ignoring them
    pub strict_io: bool,

    /// Allow console reads to block (true for a terminal host)
    pub blocking: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rom: None,
            disks: Vec::new(),
            rom_apps: Vec::new(),
            boot: None,
            cmdline: None,
            strict_io: false,
            blocking: true,
        }
    }
}

impl Config {
    /// Load configuration from the working directory, or defaults if
    /// the file doesn't exist.
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Config::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
                    eprintln!("Using default configuration.");
                    Config::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read {}: {}", path.display(), e);
                eprintln!("Using default configuration.");
                Config::default()
            }
        }
    }

    /// Well-known display names for the common boot keys, used when a
    /// ROM app is registered without one.
    pub fn auto_app_name(key: char) -> String {
        match key.to_ascii_uppercase() {
            'C' => "CP/M 2.2".to_string(),
            'Z' => "ZSDOS".to_string(),
            'Q' => "QPM".to_string(),
            'P' => "CP/M 3".to_string(),
            k => format!("{} Application", k),
        }
    }
}
