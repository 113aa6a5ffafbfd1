//! Configuration: types, default paths, XML loading and validation.
//!
//! Precedence is CLI flags > XML file > built-in defaults. The XML file is
//! optional; `VENV_MOVE_CONFIG` points at an explicit file.

pub mod paths;
pub mod types;
mod validate;
pub mod xml;

pub use paths::{CONFIG_ENV_VAR, default_config_path, default_log_path, path_has_symlink_ancestor};
pub use types::{Config, LogLevel};
pub use xml::{create_template_config, load_config, load_config_from_xml_path, render_template};
