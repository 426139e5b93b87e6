//! Spinner shown while a cleanup run is in flight

use super::context::UiContext;
use console::style;

/// How the run ended, as far as the spinner is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Clean,
    WithFailures,
    Aborted,
}

/// One spinner for the whole run; plain lines outside a TTY
pub struct RunSpinner {
    bar: Option<cliclack::ProgressBar>,
}

impl RunSpinner {
    pub fn start(ctx: &UiContext, message: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = cliclack::spinner();
            bar.start(message);
            Some(bar)
        } else {
            println!("{} {}", style("...").dim(), message);
            None
        };
        Self { bar }
    }

    pub fn finish(self, end: RunEnd, message: &str) {
        match (self.bar, end) {
            (Some(bar), RunEnd::Aborted) => bar.error(message),
            (Some(bar), _) => bar.stop(message),
            (None, RunEnd::Clean) => println!("{} {}", style("[OK]").green(), message),
            (None, RunEnd::WithFailures) => println!("{} {}", style("[WARN]").yellow(), message),
            (None, RunEnd::Aborted) => println!("{} {}", style("[FAIL]").red(), message),
        }
    }
}
