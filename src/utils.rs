//! Console helpers: colored status lines, hex dumps of raw device data, the
//! recovery spinner and the interactive firmware image picker.

use std::{fs, path::PathBuf};

use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Select};
use hexplay::HexViewBuilder;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, log_enabled, Level::Debug};

/// Color of a status line.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Tone {
    Plain,
    Good,
    Warn,
    Bad,
}

/// Print a user-visible status line and mirror it to the log.
pub(crate) fn status(tone: Tone, line: String) {
    info!("{}", line);
    match tone {
        Tone::Plain => println!("{}", line),
        Tone::Good => println!("{}", style(line).green()),
        Tone::Warn => println!("{}", style(line).yellow()),
        Tone::Bad => println!("{}", style(line).red()),
    }
}

/// Dump `data` in a hex table when debug logging is on.
pub(crate) fn hex_dump(what: &str, data: &[u8]) {
    if log_enabled!(Debug) && !data.is_empty() {
        let view = HexViewBuilder::new(data)
            .address_offset(0)
            .row_width(16)
            .finish();
        debug!("{} ({} bytes):\n{}", what, data.len(), view);
    }
}

/// Spinner for the bounded waits (device reboot).
pub(crate) fn spinner(tag: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            // For more spinners check out the cli-spinners project:
            // https://github.com/sindresorhus/cli-spinners/blob/master/spinners.json
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template(&format!("{} {{spinner:.blue}} {{msg}}", tag)),
    );
    pb
}

/// List the `.bin` files of the current working directory and ask the user to
/// pick one. `None` when there is nothing to pick or the user cancelled.
pub(crate) fn select_image_file_interactive() -> Option<PathBuf> {
    let files = match fs::read_dir(".") {
        Ok(files) => files,
        Err(ref e) => {
            info!("error: {}", e);
            return None;
        }
    };

    let mut items: Vec<String> = files
        .filter_map(Result::ok)
        .filter(|f| f.path().extension().map_or(false, |ext| ext == "bin"))
        .filter_map(|f| f.file_name().to_str().map(String::from))
        .collect();
    if items.is_empty() {
        debug!("There are no firmware images in the current directory");
        return None;
    }
    items.sort();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .items(&items)
        .with_prompt(format!(
            "Select a firmware image to push (`{}` to cancel):",
            style("Esc").cyan()
        ))
        .default(0)
        .interact_on_opt(&Term::stdout());

    match selection {
        Ok(Some(index)) => items.get(index).map(PathBuf::from),
        Ok(None) => {
            debug!("user did not select any firmware image");
            None
        }
        Err(ref e) => {
            info!("error: {}", e);
            None
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn hex_dump_without_debug_logging_is_silent() {
    hex_dump("nothing", &[]);
    hex_dump("bytes", b"AUTH OK");
}
