use std::fs;
use std::path::Path;

use super::types::Config;
use super::validator::validate;
use crate::error::{LbError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(&p).map_err(|e| {
        LbError::OperationFailed(format!("failed to read config file {}: {e}", p.as_ref().display()))
    })?;
    load_from_str(&txt)
}

pub fn load_from_str(txt: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(txt)
        .map_err(|e| LbError::OperationFailed(format!("failed to parse config: {e}")))?;

    validate(&cfg)?;

    Ok(cfg)
}
