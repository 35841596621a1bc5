//! Topic construction and matching for the RPC command and response topics.
//!
//! ```text
//! {namespace}/{model}/commands/{executor}/{command}
//! {namespace}/{model}/responses/{invoker}/{executor}/{command}
//! ```

use core::fmt::Write;

use heapless::String;

use crate::error::Error;

/// Maximum length of a topic or topic filter.
pub const MAX_TOPIC_LEN: usize = 128;

/// An owned topic string.
pub type Topic = String<MAX_TOPIC_LEN>;

const COMMANDS: &str = "commands";
const RESPONSES: &str = "responses";

/// Topic a command is published to. With `command` set to `None` this is the filter
/// matching every command of the executor.
pub fn command_topic(
    namespace: &str,
    model_id: &str,
    executor_id: &str,
    command: Option<&str>,
) -> Result<Topic, Error> {
    let mut topic = Topic::new();
    write!(
        topic,
        "{}/{}/{}/{}/{}",
        namespace,
        model_id,
        COMMANDS,
        executor_id,
        command.unwrap_or("+")
    )
    .map_err(|_| Error::BufferTooSmall)?;
    Ok(topic)
}

/// Topic the executor publishes the response for `command` to.
pub fn response_topic(
    namespace: &str,
    model_id: &str,
    invoker_id: &str,
    executor_id: &str,
    command: &str,
) -> Result<Topic, Error> {
    let mut topic = Topic::new();
    write!(
        topic,
        "{}/{}/{}/{}/{}/{}",
        namespace, model_id, RESPONSES, invoker_id, executor_id, command
    )
    .map_err(|_| Error::BufferTooSmall)?;
    Ok(topic)
}

/// The parts of a command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTopic<'a> {
    pub namespace: &'a str,
    pub model_id: &'a str,
    pub executor_id: &'a str,
    pub command_name: &'a str,
}

/// Splits a concrete command topic. Returns `None` if `topic` does not have the
/// command topic shape or contains wildcards.
pub fn parse_command_topic(topic: &str) -> Option<CommandTopic<'_>> {
    let mut levels = topic.split('/');
    let namespace = levels.next()?;
    let model_id = levels.next()?;
    if levels.next()? != COMMANDS {
        return None;
    }
    let executor_id = levels.next()?;
    let command_name = levels.next()?;
    if levels.next().is_some() {
        return None;
    }
    let parsed = CommandTopic {
        namespace,
        model_id,
        executor_id,
        command_name,
    };
    let concrete = [namespace, model_id, executor_id, command_name]
        .iter()
        .all(|level| !level.is_empty() && *level != "+" && *level != "#");
    concrete.then_some(parsed)
}

/// MQTT topic filter matching with the `+` (one level) and `#` (remaining levels)
/// wildcards.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
