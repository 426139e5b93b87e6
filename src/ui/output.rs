//! Line-level output for cleanup reports

use super::context::UiContext;
use console::style;

/// Run banner
pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        cliclack::intro(style(title).cyan().bold()).ok();
    } else {
        println!("{}\n", style(title).cyan().bold());
    }
}

/// Closing line; turns into a warning when anything failed
pub fn outro(ctx: &UiContext, summary: &str, failures: usize) {
    let message = match failures {
        0 => summary.to_string(),
        n => format!("{}, {} failure(s)", summary, n),
    };

    match (ctx.use_fancy_output(), failures) {
        (true, 0) => {
            cliclack::outro(style(message).green().bold()).ok();
        }
        (true, _) => {
            cliclack::outro(style(message).yellow().bold()).ok();
        }
        (false, 0) => println!("\n{} {}", style("[OK]").green(), message),
        (false, _) => println!("\n{} {}", style("[WARN]").yellow(), message),
    }
}

/// Phase heading ("Images", "Stages")
pub fn section(ctx: &UiContext, title: &str) {
    println!();
    if ctx.use_fancy_output() {
        cliclack::log::info(style(title).bold()).ok();
    } else {
        println!("{}", style(title).bold());
    }
}

/// Degraded-protection and similar non-fatal conditions
pub fn warning(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::warning(message).ok();
    } else {
        println!("  {} {}", style("[WARN]").yellow(), message);
    }
}

/// A tag or stage that could not be deleted
pub fn failure(ctx: &UiContext, item: &str, reason: &str) {
    let message = format!("{}: {}", item, reason);
    if ctx.use_fancy_output() {
        cliclack::log::error(message).ok();
    } else {
        println!("  {} {}", style("[FAIL]").red(), message);
    }
}

pub fn detail(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::remark(message).ok();
    } else {
        println!("  {}", style(message).dim());
    }
}

pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}
