//! Terminal output with CI fallback
//!
//! Uses `cliclack` for styled output in interactive terminals and falls back
//! to plain bracketed lines (`[OK]`, `[WARN]`) in CI or when stdout is not a
//! TTY.
//!
//! ```rust,ignore
//! use keel::ui::{self, RunEnd, RunSpinner, UiContext};
//!
//! let ctx = UiContext::detect();
//! ui::intro(&ctx, "keel cleanup: shop");
//!
//! let spinner = RunSpinner::start(&ctx, "Cleaning up shop...");
//! spinner.finish(RunEnd::Clean, "Cleanup finished");
//!
//! ui::warning(&ctx, "namespace kube-system could not be scanned");
//! ui::outro(&ctx, "2 tag(s) and 3 stage(s) deleted", 0);
//! ```

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{detail, failure, intro, key_value, outro, section, warning};
pub use progress::{RunEnd, RunSpinner};
