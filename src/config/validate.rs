//! Config validation.

use anyhow::{Result, bail};
use std::path::{Component, Path};
use tracing::debug;

use super::types::Config;

impl Config {
    /// Reject settings the relocation pipeline cannot honor.
    pub fn validate(&self) -> Result<()> {
        let name = self.metadata_file.trim();
        let mut comps = Path::new(name).components();
        let single_normal = matches!((comps.next(), comps.next()), (Some(Component::Normal(_)), None));
        if name.is_empty() || !single_normal {
            bail!(
                "metadata_file must be a plain file name at the environment root, got '{}'",
                self.metadata_file
            );
        }
        if self.max_shim_bytes == 0 {
            bail!("max_shim_bytes must be greater than zero");
        }
        if let Some(log) = &self.log_file
            && log.as_os_str().is_empty()
        {
            bail!("log_file must not be empty");
        }
        for lib in &self.verify_libraries {
            if lib.trim().is_empty() {
                bail!("verify_libraries contains an empty entry");
            }
        }
        debug!(
            metadata_file = %self.metadata_file,
            max_shim_bytes = self.max_shim_bytes,
            "config validated"
        );
        Ok(())
    }
}
