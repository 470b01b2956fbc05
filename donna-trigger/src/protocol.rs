//! donna 触发协议
//! 每条消息都是一帧 ASCII 文本，以固定的指令开头，后跟空格和参数

use std::fmt;

pub type TaskId = u32;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed UTF-8 string")]
    MalformedString,
    #[error("Unknown reply: {0}")]
    UnknownReply(String),
    #[error("Malformed reply: {0}")]
    MalformedReply(String),
}

/// 发送给 donna 的请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    /// 触发一个 full location
    Trigger(&'a str),
    /// 取消一个正在执行的任务
    Cancel(TaskId),
}

impl fmt::Display for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Trigger(location) => write!(f, "TRIGGER {}", location),
            Request::Cancel(task) => write!(f, "CANCEL {}", task),
        }
    }
}

/// donna 的回复
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// 请求的同步部分执行成功
    /// 带有 task 时，表示触发了一个后台任务，之后还会收到该任务的结果
    Ok { task: Option<TaskId> },
    /// 请求执行失败
    Err { code: i32, message: String },
    Done { task: TaskId, message: Option<String> },
    Failed { task: TaskId, message: Option<String> },
    Cancelled { task: TaskId },
}

impl Reply {
    pub fn parse(message: &[u8]) -> Result<Self, Error> {
        let message = std::str::from_utf8(message).map_err(|_| Error::MalformedString)?;
        let (command, rest) = message.split_once(' ').unwrap_or((message, ""));

        let reply = match command {
            "OK" => {
                let task = match rest.strip_prefix("TRIGGER ") {
                    Some(task) => Some(parse_task(task, message)?),
                    None => None,
                };
                Reply::Ok { task }
            }
            "ERR" => {
                let (code, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let code = code
                    .parse()
                    .map_err(|_| Error::MalformedReply(message.into()))?;
                Reply::Err {
                    code,
                    message: text.into(),
                }
            }
            "DONE" => {
                let (task, text) = split_task(rest, message)?;
                Reply::Done {
                    task,
                    message: text,
                }
            }
            "FAILED" => {
                let (task, text) = split_task(rest, message)?;
                Reply::Failed {
                    task,
                    message: text,
                }
            }
            "CANCELLED" => Reply::Cancelled {
                task: parse_task(rest, message)?,
            },
            _ => return Err(Error::UnknownReply(message.into())),
        };

        Ok(reply)
    }
}

fn parse_task(task: &str, message: &str) -> Result<TaskId, Error> {
    task.trim()
        .parse()
        .map_err(|_| Error::MalformedReply(message.into()))
}

/// `<task-id> [message]`
fn split_task(rest: &str, message: &str) -> Result<(TaskId, Option<String>), Error> {
    match rest.split_once(' ') {
        Some((task, text)) => {
            let text = (!text.is_empty()).then(|| text.to_string());
            Ok((parse_task(task, message)?, text))
        }
        None => Ok((parse_task(rest, message)?, None)),
    }
}
