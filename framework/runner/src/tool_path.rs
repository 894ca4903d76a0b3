use anyhow::bail;
use anyhow::Context;
use std::env;
use std::path::PathBuf;

/// Environment variable that overrides where `tool` is found, e.g. `GT_KWOKCTL_PATH`.
pub(crate) fn tool_path_env(tool: &str) -> String {
    format!("GT_{}_PATH", tool.to_uppercase().replace('-', "_"))
}

/// Get the path to an external tool the sweep shells out to.
///
/// If the tool's override variable (see [tool_path_env]) is set, its value is used as the path.
/// Otherwise the tool is looked up in the user's `PATH`.
pub(crate) fn tool_path(tool: &str) -> anyhow::Result<PathBuf> {
    let env_name = tool_path_env(tool);
    match env::var(&env_name).ok().as_deref() {
        Some("") => {
            bail!("'{env_name}' set to empty string");
        }
        Some(name) if name == tool => which::which(tool).with_context(|| {
            format!("{tool} not found in PATH. Please install it or set '{env_name}' to the correct path.")
        }),
        None => {
            log::debug!("'{env_name}' is not set so looking in user's 'PATH'");
            which::which(tool).with_context(|| {
                format!("{tool} not found in PATH. Please install it or set '{env_name}' to the correct path.")
            })
        }
        Some(path) => {
            let tool_path = PathBuf::from(path);
            if !tool_path.exists() {
                bail!(
                    "Path to {tool} overwritten with '{env_name}={path}' but that path doesn't exist",
                    path = tool_path.display()
                );
            }
            Ok(tool_path)
        }
    }
}
