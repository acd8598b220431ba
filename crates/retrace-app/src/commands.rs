//! Host commands read from stdin.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `attempt <label> [seq]`
    Attempt { label: String, sequence: Option<u64> },
    /// `export [path]`
    Export(Option<PathBuf>),
    Status,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let rest: Vec<&str> = words.collect();

        let command = match verb {
            "attempt" | "a" => {
                // A trailing number is the attempt sequence; everything
                // before it is the label.
                let (label, sequence) = match rest.split_last() {
                    Some((last, head)) if !head.is_empty() => match last.parse::<u64>() {
                        Ok(seq) => (head.join(" "), Some(seq)),
                        Err(_) => (rest.join(" "), None),
                    },
                    _ => (rest.join(" "), None),
                };
                if label.is_empty() {
                    return Err("usage: attempt <label> [seq]".to_string());
                }
                Self::Attempt { label, sequence }
            }
            "export" | "e" => Self::Export(rest.first().map(|_| PathBuf::from(rest.join(" ")))),
            "status" | "s" => Self::Status,
            "quit" | "q" | "exit" => Self::Quit,
            other => return Err(format!("unknown command '{}'", other)),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attempt() {
        assert_eq!(
            Command::parse("attempt Stereo Madness 12").unwrap(),
            Some(Command::Attempt {
                label: "Stereo Madness".to_string(),
                sequence: Some(12)
            })
        );
        assert_eq!(
            Command::parse("a 42").unwrap(),
            Some(Command::Attempt {
                label: "42".to_string(),
                sequence: None
            })
        );
        assert!(Command::parse("attempt").is_err());
    }

    #[test]
    fn test_parse_other_commands() {
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(Command::parse("export").unwrap(), Some(Command::Export(None)));
        assert_eq!(
            Command::parse("export clips/my clip.mp4").unwrap(),
            Some(Command::Export(Some(PathBuf::from("clips/my clip.mp4"))))
        );
        assert_eq!(Command::parse("status").unwrap(), Some(Command::Status));
        assert_eq!(Command::parse("q").unwrap(), Some(Command::Quit));
        assert!(Command::parse("rewind").is_err());
    }
}
