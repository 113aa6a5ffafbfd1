//! Platform-specific helpers.
//! Hides Unix/Windows differences (file modes, symlink creation) behind one API.

pub mod temp;

#[cfg(unix)]
mod unix;
#[cfg(not(unix))]
mod windows;

#[cfg(unix)]
pub use unix::{create_symlink, open_log_file_secure_append, write_config_secure_new_0600};

#[cfg(not(unix))]
pub use windows::{create_symlink, open_log_file_secure_append, write_config_secure_new_0600};
