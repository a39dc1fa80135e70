use anyhow::{anyhow, bail, Result};
use shared::domain::{ConversationId, CorrelationId, UserId};

pub const HELP: &str = "\
/list                         conversations, most recent first
/open <conversation>          show messages and mark them read
/send <conversation> <text>   send a message
/retry <correlation>          re-send a failed message
/start <user> <text>          start a conversation
/typing <conversation>        tell the counterpart you are typing
/stop <conversation>          stop the typing indicator
/read-all                     mark everything read
/resync                       re-fetch conversations
/quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Open(ConversationId),
    Send {
        conversation_id: ConversationId,
        text: String,
    },
    Retry(CorrelationId),
    Start {
        user_id: UserId,
        text: String,
    },
    Typing(ConversationId),
    StopTyping(ConversationId),
    ReadAll,
    Resync,
    Help,
    Quit,
}

/// Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match verb {
        "/list" => ConsoleCommand::List,
        "/open" => ConsoleCommand::Open(ConversationId::new(single(verb, rest)?)),
        "/send" => {
            let (conversation_id, text) = target_and_text(verb, rest)?;
            ConsoleCommand::Send {
                conversation_id: ConversationId::new(conversation_id),
                text,
            }
        }
        "/retry" => ConsoleCommand::Retry(CorrelationId::new(single(verb, rest)?)),
        "/start" => {
            let (user_id, text) = target_and_text(verb, rest)?;
            ConsoleCommand::Start {
                user_id: UserId::new(user_id),
                text,
            }
        }
        "/typing" => ConsoleCommand::Typing(ConversationId::new(single(verb, rest)?)),
        "/stop" => ConsoleCommand::StopTyping(ConversationId::new(single(verb, rest)?)),
        "/read-all" => ConsoleCommand::ReadAll,
        "/resync" => ConsoleCommand::Resync,
        "/help" => ConsoleCommand::Help,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        other => bail!("unknown command '{other}', try /help"),
    };
    Ok(Some(command))
}

fn single<'a>(verb: &str, rest: &'a str) -> Result<&'a str> {
    match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
        [value] => Ok(*value),
        _ => Err(anyhow!("usage: {verb} <id>")),
    }
}

fn target_and_text<'a>(verb: &str, rest: &'a str) -> Result<(&'a str, String)> {
    let (target, text) = rest
        .split_once(' ')
        .ok_or_else(|| anyhow!("usage: {verb} <id> <text>"))?;
    let text = text.trim();
    if text.is_empty() {
        bail!("usage: {verb} <id> <text>");
    }
    Ok((target, text.to_string()))
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
