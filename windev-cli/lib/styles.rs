//! Terminal styling for help output and messages.

use clap::builder::styling::{AnsiColor, Effects, Styles};
use console::{style, StyledObject};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Clap help styling shared by every subcommand.
pub fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
        .usage(AnsiColor::Yellow.on_default().effects(Effects::BOLD))
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Cyan.on_default())
        .error(AnsiColor::Red.on_default().effects(Effects::BOLD))
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Ansi styling helpers matching the clap help styles.
pub trait AnsiStyles: std::fmt::Display + Sized {
    /// Styles text the way clap renders literals.
    fn literal(&self) -> StyledObject<&Self> {
        style(self).green()
    }

    /// Styles text the way clap renders placeholders.
    fn placeholder(&self) -> StyledObject<&Self> {
        style(self).cyan()
    }

    /// Styles text the way clap renders errors.
    fn error(&self) -> StyledObject<&Self> {
        style(self).red().bold()
    }
}

impl<T: std::fmt::Display> AnsiStyles for T {}
