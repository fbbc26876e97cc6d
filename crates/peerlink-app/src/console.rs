use std::str::FromStr;

use peerlink_core::PeerId;

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    SignOut,
    Peers,
    Send { to: PeerId, text: String },
    Bye { to: PeerId },
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  /connect             sign in to the configured server
  /signout             sign out, keep the program running
  /peers               list peers currently online
  /send <id> <text>    relay <text> to peer <id>
  /bye <id>            tell peer <id> we are hanging up
  /quit                sign out and exit";

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim_start();

        let peer = |arg: &str| {
            arg.parse::<PeerId>().map_err(|_| format!("not a peer id: {:?}", arg))
        };

        match word {
            "/connect" => Ok(Self::Connect),
            "/signout" => Ok(Self::SignOut),
            "/peers" => Ok(Self::Peers),
            "/help" | "/?" => Ok(Self::Help),
            "/quit" | "/exit" => Ok(Self::Quit),
            "/bye" => Ok(Self::Bye { to: peer(rest)? }),
            "/send" => {
                let (id, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                if text.is_empty() {
                    return Err("usage: /send <id> <text>".to_owned());
                }
                Ok(Self::Send { to: peer(id)?, text: text.to_owned() })
            }
            other => Err(format!("unknown command {:?} (try /help)", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_spaces_in_text() {
        let cmd: ConsoleCommand = "/send 8 hello there bob".parse().unwrap();
        assert_eq!(cmd, ConsoleCommand::Send { to: PeerId(8), text: "hello there bob".into() });
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!("/peers".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Peers));
        assert_eq!("  /quit ".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Quit));
        assert_eq!("/bye 12".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Bye { to: PeerId(12) }));
    }

    #[test]
    fn rejects_bad_input() {
        assert!("/send 8".parse::<ConsoleCommand>().is_err());
        assert!("/bye bob".parse::<ConsoleCommand>().is_err());
        assert!("hello".parse::<ConsoleCommand>().is_err());
    }
}
