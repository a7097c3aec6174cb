// Centralized version information

// Shown on the update page and in the boot banner
pub const DISPLAY_VERSION: &str = "v0.2-esproom";

pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn full_version() -> String {
    format!("{} ({})", DISPLAY_VERSION, CARGO_VERSION)
}
