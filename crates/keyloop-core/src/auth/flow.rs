use std::env;

/// Set to any value to never launch a browser during login.
pub const NO_BROWSER_ENV: &str = "KEYLOOP_NO_BROWSER";

/// Caller preferences for a device login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoginOptions {
    /// Open the verification URI in the system browser after presenting it.
    pub open_browser: bool,
}

impl LoginOptions {
    /// Detect whether a browser can be launched from this terminal session.
    pub fn detect() -> Self {
        Self {
            open_browser: browser_available(|key| env::var_os(key).is_some()),
        }
    }

    pub fn headless() -> Self {
        Self {
            open_browser: false,
        }
    }
}

fn browser_available<F>(is_set: F) -> bool
where
    F: Fn(&str) -> bool,
{
    if is_set(NO_BROWSER_ENV) {
        return false;
    }

    if is_set("SSH_CONNECTION") && !is_set("DISPLAY") {
        return false;
    }

    if is_set("DISPLAY") || is_set("WAYLAND_DISPLAY") {
        return true;
    }

    cfg!(target_os = "windows") || cfg!(target_os = "macos")
}
