use std::path::PathBuf;
use thiserror::Error;

/// One operator console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Load(PathBuf),
    Start,
    Stop,
    Open(String),
    Close(String),
    Cadence { high: bool },
    Name(String),
    Connect,
    Status,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command `{0}`")]
    Unknown(String),

    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),

    #[error("cadence must be `high` or `low`, got `{0}`")]
    BadCadence(String),
}

impl Command {
    /// Parse a console line; blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Result<Self, ParseError>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let arg = |name: &'static str| {
            if rest.is_empty() {
                Err(ParseError::MissingArgument(name))
            } else {
                Ok(rest.to_string())
            }
        };

        Some(match word.to_ascii_lowercase().as_str() {
            "load" => arg("load").map(|path| Command::Load(PathBuf::from(path))),
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "open" => arg("open").map(Command::Open),
            "close" => arg("close").map(Command::Close),
            "cadence" => match rest.to_ascii_lowercase().as_str() {
                "high" => Ok(Command::Cadence { high: true }),
                "low" => Ok(Command::Cadence { high: false }),
                "" => Err(ParseError::MissingArgument("cadence")),
                other => Err(ParseError::BadCadence(other.to_string())),
            },
            // An empty name resets to the default base name.
            "name" => Ok(Command::Name(rest.to_string())),
            "connect" => Ok(Command::Connect),
            "status" => Ok(Command::Status),
            "quit" | "exit" => Ok(Command::Quit),
            _ => Err(ParseError::Unknown(word.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Command, ParseError> {
        Command::parse(line).unwrap()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse("start"), Ok(Command::Start));
        assert_eq!(parse("  STOP "), Ok(Command::Stop));
        assert_eq!(
            parse("load scripts/cold flow.csv"),
            Ok(Command::Load(PathBuf::from("scripts/cold flow.csv")))
        );
        assert_eq!(parse("open SV-OX-01"), Ok(Command::Open("SV-OX-01".into())));
        assert_eq!(parse("close SV-OX-01"), Ok(Command::Close("SV-OX-01".into())));
        assert_eq!(parse("cadence High"), Ok(Command::Cadence { high: true }));
        assert_eq!(parse("name hotfire_2"), Ok(Command::Name("hotfire_2".into())));
        assert_eq!(parse("name"), Ok(Command::Name(String::new())));
        assert_eq!(parse("quit"), Ok(Command::Quit));
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert!(Command::parse("   ").is_none());
    }

    #[test]
    fn reports_bad_lines() {
        assert_eq!(parse("open"), Err(ParseError::MissingArgument("open")));
        assert_eq!(
            parse("cadence turbo"),
            Err(ParseError::BadCadence("turbo".into()))
        );
        assert_eq!(parse("fire"), Err(ParseError::Unknown("fire".into())));
    }
}
