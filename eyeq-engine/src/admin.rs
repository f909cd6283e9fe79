//! Textual administration commands.
//!
//! ```text
//! create_txc <key>
//! create_vq <key>
//! associate txc <key> vq <key>
//! set_vq_weight <key> weight <n>
//! enable_vq <key>
//! disable_vq <key>
//! set <param> <value>
//! delete_txc <key>
//! delete_vq <key>
//! ```

use std::{fmt, str::FromStr};

use crate::{ClassKey, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<K> {
    CreateClass(K),
    CreateQueue(K),
    Associate { class: K, queue: K },
    SetQueueWeight { queue: K, weight: u64 },
    /// Turns a virtual queue's accounting and feedback on or off.
    SetQueueEnabled { queue: K, enabled: bool },
    SetParam { name: String, value: String },
    DeleteClass(K),
    DeleteQueue(K),
}

impl<K: ClassKey> FromStr for Command<K> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidCommand(s.trim().to_owned());
        let words: Vec<&str> = s.split_whitespace().collect();

        let command = match words.as_slice() {
            ["create_txc", key] => Self::CreateClass(key.parse()?),
            ["create_vq", key] => Self::CreateQueue(key.parse()?),
            ["associate", "txc", class, "vq", queue] => {
                Self::Associate { class: class.parse()?, queue: queue.parse()? }
            }
            ["set_vq_weight", queue, "weight", weight] => Self::SetQueueWeight {
                queue: queue.parse()?,
                weight: weight.parse().map_err(|_| invalid())?,
            },
            ["enable_vq", queue] => Self::SetQueueEnabled { queue: queue.parse()?, enabled: true },
            ["disable_vq", queue] => Self::SetQueueEnabled { queue: queue.parse()?, enabled: false },
            ["set", name, value] => {
                Self::SetParam { name: (*name).to_owned(), value: (*value).to_owned() }
            }
            ["delete_txc", key] => Self::DeleteClass(key.parse()?),
            ["delete_vq", key] => Self::DeleteQueue(key.parse()?),
            _ => return Err(invalid()),
        };

        Ok(command)
    }
}

impl<K: fmt::Display> fmt::Display for Command<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateClass(key) => write!(f, "create_txc {key}"),
            Self::CreateQueue(key) => write!(f, "create_vq {key}"),
            Self::Associate { class, queue } => write!(f, "associate txc {class} vq {queue}"),
            Self::SetQueueWeight { queue, weight } => write!(f, "set_vq_weight {queue} weight {weight}"),
            Self::SetQueueEnabled { queue, enabled: true } => write!(f, "enable_vq {queue}"),
            Self::SetQueueEnabled { queue, enabled: false } => write!(f, "disable_vq {queue}"),
            Self::SetParam { name, value } => write!(f, "set {name} {value}"),
            Self::DeleteClass(key) => write!(f, "delete_txc {key}"),
            Self::DeleteQueue(key) => write!(f, "delete_vq {key}"),
        }
    }
}
