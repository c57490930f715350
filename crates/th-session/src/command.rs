use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Clear screen and move the cursor home.
pub const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Commands handled by the session itself, without launching anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Help,
    List,
    Clear,
}

impl Builtin {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "help" => Some(Self::Help),
            "list" => Some(Self::List),
            "clear" => Some(Self::Clear),
            _ => None,
        }
    }
}

/// What a submitted line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Builtin(Builtin),
    /// Run `name` with `args`. Whether `name` may run is decided at spawn time.
    Invocation { name: String, args: Vec<String> },
}

/// Classify one line of typed text.
pub fn classify(line: &str) -> Command {
    let mut parts = line.split_whitespace();
    let Some(first) = parts.next() else {
        return Command::Empty;
    };
    if let Some(builtin) = Builtin::from_token(first) {
        return Command::Builtin(builtin);
    }
    Command::Invocation {
        name: first.to_string(),
        args: parts.map(str::to_string).collect(),
    }
}

/// The banner sent on connect and in response to `help`.
pub fn welcome_banner(apps: &BTreeMap<String, String>) -> String {
    let mut out = String::from("Welcome to the Terminal Showcase!\r\n\r\n");
    out.push_str(&apps_listing(apps));
    out.push_str(
        "\r\nCommands:\r\n\
         \x20 <app-name> [args]  - Run an app\r\n\
         \x20 list               - List available apps\r\n\
         \x20 clear              - Clear the screen\r\n\
         \x20 help               - Show this message\r\n\r\n",
    );
    out
}

/// Response to `list`.
pub fn apps_listing(apps: &BTreeMap<String, String>) -> String {
    let mut out = String::from("Available apps:\r\n");
    if apps.is_empty() {
        out.push_str("  (none)\r\n");
    }
    for (name, description) in apps {
        let _ = write!(out, "  {name} - {description}\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apps() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("testapp".to_string(), "Echo tester".to_string()),
            ("kanban".to_string(), "A board".to_string()),
        ])
    }

    #[test]
    fn blank_lines_are_empty() {
        assert_eq!(classify(""), Command::Empty);
        assert_eq!(classify("   \t  "), Command::Empty);
    }

    #[test]
    fn builtins() {
        assert_eq!(classify("help"), Command::Builtin(Builtin::Help));
        assert_eq!(classify("  list  "), Command::Builtin(Builtin::List));
        assert_eq!(classify("clear now"), Command::Builtin(Builtin::Clear));
    }

    #[test]
    fn builtins_are_case_sensitive() {
        assert_eq!(
            classify("HELP"),
            Command::Invocation {
                name: "HELP".into(),
                args: vec![]
            }
        );
    }

    #[test]
    fn invocation_with_args() {
        assert_eq!(
            classify("tradingcardsearch  black   lotus"),
            Command::Invocation {
                name: "tradingcardsearch".into(),
                args: vec!["black".into(), "lotus".into()],
            }
        );
    }

    #[test]
    fn unknown_names_still_classify_as_invocations() {
        assert_eq!(
            classify("rm -rf /"),
            Command::Invocation {
                name: "rm".into(),
                args: vec!["-rf".into(), "/".into()],
            }
        );
    }

    #[test]
    fn listing_is_sorted_by_name() {
        let listing = apps_listing(&apps());
        let kanban = listing.find("kanban").unwrap();
        let testapp = listing.find("testapp").unwrap();
        assert!(kanban < testapp);
        assert!(listing.contains("  testapp - Echo tester\r\n"));
    }

    #[test]
    fn banner_contains_listing_and_help() {
        let banner = welcome_banner(&apps());
        assert!(banner.starts_with("Welcome to the Terminal Showcase!"));
        assert!(banner.contains(&apps_listing(&apps())));
        assert!(banner.contains("  <app-name> [args]  - Run an app"));
        assert!(banner.contains("  help               - Show this message"));
    }

    #[test]
    fn empty_listing() {
        assert_eq!(
            apps_listing(&BTreeMap::new()),
            "Available apps:\r\n  (none)\r\n"
        );
    }
}
