//! Filepath: src/infra/utils.rs
//! Utility helpers organized by small, focused structs.
//! All functions are associated fns to keep call sites
//! ergonomic, testable, and discoverable.

use std::time::Duration;

use owo_colors::OwoColorize;

use crate::cli::AppContext;

/// Console styling that honours `--no-color`
pub struct Paint;

impl Paint
{
    /// Success marker/text (green)
    pub fn ok(
        ctx: &AppContext,
        text: &str,
    ) -> String
    {
        if ctx.no_color
        {
            return text.to_string();
        }
        text.green()
            .to_string()
    }

    /// Attention text (yellow)
    pub fn warn(
        ctx: &AppContext,
        text: &str,
    ) -> String
    {
        if ctx.no_color
        {
            return text.to_string();
        }
        text.yellow()
            .to_string()
    }

    /// Failure text (red)
    pub fn err(
        ctx: &AppContext,
        text: &str,
    ) -> String
    {
        if ctx.no_color
        {
            return text.to_string();
        }
        text.red()
            .to_string()
    }

    /// Section heading (bold)
    pub fn heading(
        ctx: &AppContext,
        text: &str,
    ) -> String
    {
        if ctx.no_color
        {
            return text.to_string();
        }
        text.bold()
            .to_string()
    }
}

/// Phase/console output gated on `--quiet`
pub struct Console;

impl Console
{
    /// Print a `[Step N] title` phase header
    pub fn phase(
        ctx: &AppContext,
        step: usize,
        title: &str,
    )
    {
        if !ctx.quiet
        {
            println!("\n{}", Paint::heading(ctx, &format!("[Step {step}] {title}")));
        }
    }

    /// Print an indented detail line
    pub fn line(
        ctx: &AppContext,
        text: &str,
    )
    {
        if !ctx.quiet
        {
            println!("  {text}");
        }
    }

    /// Print a full-width rule
    pub fn rule(ctx: &AppContext)
    {
        if !ctx.quiet
        {
            println!("{}", "=".repeat(60));
        }
    }
}

/// Sleep helpers
pub struct Pause;

impl Pause
{
    /// Sleep unless the duration is zero
    pub fn for_duration(d: Duration)
    {
        if !d.is_zero()
        {
            std::thread::sleep(d);
        }
    }
}
