use std::{fs, io};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

#[inline]
fn defthreshold() -> u32 {
    10
}

#[inline]
fn defcompression() -> i32 {
    1
}

/// Defaults from `~/.config/burrow.toml`; flags still win.
#[derive(Debug, Deserialize)]
pub struct Configuration {
    #[serde(default = "defthreshold")]
    pub gc_threshold: u32,
    #[serde(default = "defcompression")]
    pub compression: i32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            gc_threshold: defthreshold(),
            compression: defcompression(),
        }
    }
}

pub fn load() -> Result<Configuration> {
    let Some(home) = home::home_dir() else {
        return Ok(Configuration::default());
    };
    let mut confpath: Utf8PathBuf = home.try_into().context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "burrow.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}
