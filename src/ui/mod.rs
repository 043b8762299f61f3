//! Terminal output helpers for the CLI
//!
//! Interactive terminals get colors and spinners; CI and pipes get plain
//! `[OK]` / `[WARN]` prefixed lines.

mod context;
mod output;
mod progress;
mod prompts;

pub use context::UiContext;
pub use output::{key_value, key_value_status, section, step_error_detail, step_ok, step_warn_hint};
pub use progress::TaskSpinner;
pub use prompts::confirm;
