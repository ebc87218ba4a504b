//! Parsing of prompt lines. Lines starting with `/` are commands; anything
//! else is sent to the open conversation.

use chatsync_shared::{ConversationId, UserId};

use crate::error::CommandError;

pub const HELP: &str = "\
Commands:
  /list                      show conversations
  /open <id>                 open a conversation
  /close                     close the open conversation
  /older                     load older messages
  /search <text>             search the open conversation
  /new <name> <user,user..>  create a conversation
  /read                      mark loaded messages as read
  /status                    show connection and session
  /reconnect                 reopen the push connection
  /login <token> <user-id>   start a session
  /logout                    end the session
  /quit                      exit
Any other line is sent to the open conversation.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Empty,
    List,
    Open(ConversationId),
    Close,
    Older,
    Search(String),
    New { name: String, members: Vec<UserId> },
    Read,
    Status,
    Reconnect,
    Login { token: String, user_id: UserId },
    Logout,
    Help,
    Quit,
    Send(String),
}

pub fn parse(line: &str) -> Result<ReplCommand, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ReplCommand::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(ReplCommand::Send(line.to_string()));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let mut args = rest.split_whitespace();

    let parsed = match name {
        "list" | "ls" => ReplCommand::List,
        "open" => match args.next() {
            Some(id) => ReplCommand::Open(ConversationId::new(id)),
            None => return Err(CommandError::Usage("/open <id>")),
        },
        "close" => ReplCommand::Close,
        "older" => ReplCommand::Older,
        "search" => {
            if rest.is_empty() {
                return Err(CommandError::Usage("/search <text>"));
            }
            ReplCommand::Search(rest.to_string())
        }
        "new" => {
            let (Some(name), Some(members)) = (args.next(), args.next()) else {
                return Err(CommandError::Usage("/new <name> <user,user..>"));
            };
            let members: Vec<UserId> = members
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(UserId::new)
                .collect();
            if members.is_empty() {
                return Err(CommandError::Usage("/new <name> <user,user..>"));
            }
            ReplCommand::New {
                name: name.to_string(),
                members,
            }
        }
        "read" => ReplCommand::Read,
        "status" => ReplCommand::Status,
        "reconnect" => ReplCommand::Reconnect,
        "login" => match (args.next(), args.next()) {
            (Some(token), Some(user)) => ReplCommand::Login {
                token: token.to_string(),
                user_id: UserId::new(user),
            },
            _ => return Err(CommandError::Usage("/login <token> <user-id>")),
        },
        "logout" => ReplCommand::Logout,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" | "q" => ReplCommand::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(parsed)
}
