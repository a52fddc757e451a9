//! The console command language.
//!
//! A handful of words are interpreted locally; everything else is passed to
//! the device verbatim.

use std::path::PathBuf;

/// One parsed console line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    /// `/q`, `/quit`, `exit`, `quit`
    Quit,
    /// `ota [path]`, `/ota [path]`
    Upload(Option<PathBuf>),
    /// `setwifi <ssid> <password>`, `/setwifi ...`
    SetWifi { ssid: String, password: String },
    /// A recognised command with the wrong arguments; carries the usage line.
    Usage(&'static str),
    /// `dht`, `dht?`, `/dht`
    SensorRead,
    /// Anything else, trimmed.
    Raw(String),
}

impl Command {
    /// Parse a console line. Blank lines give `None`.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let command = match word.to_lowercase().as_str() {
            "/q" | "/quit" | "exit" | "quit" if rest.is_empty() => Command::Quit,
            "ota" | "/ota" => Command::Upload(if rest.is_empty() {
                None
            } else {
                Some(PathBuf::from(rest))
            }),
            "setwifi" | "/setwifi" => {
                // The password is everything after the SSID, spaces included.
                match rest.split_once(char::is_whitespace) {
                    Some((ssid, password)) if !password.trim().is_empty() => Command::SetWifi {
                        ssid: ssid.to_string(),
                        password: password.trim().to_string(),
                    },
                    _ => Command::Usage("usage: SETWIFI <ssid> <pwd>"),
                }
            }
            "dht" | "dht?" | "/dht" if rest.is_empty() => Command::SensorRead,
            _ => Command::Raw(line.to_string()),
        };
        Some(command)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn quit_words() {
    for word in ["/q", "/quit", "exit", "QUIT", "  exit  "] {
        assert_eq!(Command::parse(word), Some(Command::Quit), "{}", word);
    }
}

#[test]
fn blank_lines_are_ignored() {
    assert_eq!(Command::parse(""), None);
    assert_eq!(Command::parse("   \t"), None);
}

#[test]
fn upload_with_and_without_path() {
    assert_eq!(Command::parse("ota"), Some(Command::Upload(None)));
    assert_eq!(
        Command::parse("/ota build/app.bin"),
        Some(Command::Upload(Some(PathBuf::from("build/app.bin"))))
    );
}

#[test]
fn setwifi_arguments() {
    assert_eq!(
        Command::parse("SETWIFI home my secret"),
        Some(Command::SetWifi {
            ssid: "home".into(),
            password: "my secret".into()
        })
    );
    assert_eq!(
        Command::parse("/setwifi home"),
        Some(Command::Usage("usage: SETWIFI <ssid> <pwd>"))
    );
    assert_eq!(
        Command::parse("setwifi"),
        Some(Command::Usage("usage: SETWIFI <ssid> <pwd>"))
    );
}

#[test]
fn sensor_read_words() {
    for word in ["dht", "DHT?", "/dht"] {
        assert_eq!(Command::parse(word), Some(Command::SensorRead));
    }
}

#[test]
fn everything_else_passes_through() {
    assert_eq!(Command::parse(" version "), Some(Command::Raw("version".into())));
    assert_eq!(Command::parse("exit now"), Some(Command::Raw("exit now".into())));
    assert_eq!(Command::parse("led on"), Some(Command::Raw("led on".into())));
}
