//! 触发请求的状态机
//! 只负责根据收到的回复计算下一步动作，不涉及任何 socket 读写

use log::{debug, info, warn};

use crate::protocol::{Reply, Request, TaskId};

/// 进程退出码
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok = 0,
    /// 命令行解析失败
    ParseCmdline = 1,
    /// 没有指定 socket 路径
    NoSocket = 2,
    /// socket 创建或连接失败
    SocketFailed = 3,
    /// 没有指定 full location
    NoFullLocation = 4,
    /// 至少一个触发请求返回了错误
    TriggerError = 5,
    /// 至少一个后台任务失败
    TaskFailed = 6,
    /// 至少一个后台任务被取消
    TaskCancelled = 7,
}

impl ReturnCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<ReturnCode> for std::process::ExitCode {
    fn from(rc: ReturnCode) -> Self {
        std::process::ExitCode::from(rc.code() as u8)
    }
}

/// 状态机给出的动作，由调用方按顺序执行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(String),
    Stdout(String),
    Stderr(String),
    /// 所有请求都已结束，关闭连接
    Close,
}

#[derive(Debug)]
pub struct Trigger {
    /// 已发送但还没有结果的请求数
    pending: usize,
    /// 最近一个后台任务，用于中断时发送取消请求
    task: Option<TaskId>,
    rc: ReturnCode,
    /// 不等待后台任务结束
    no_wait: bool,
    /// 任务失败的消息输出到 stderr
    failed_on_err: bool,
}

impl Trigger {
    pub fn new(no_wait: bool, failed_on_err: bool) -> Self {
        Self {
            pending: 0,
            task: None,
            rc: ReturnCode::Ok,
            no_wait,
            failed_on_err,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn return_code(&self) -> ReturnCode {
        self.rc
    }

    /// 每个 full location 发送一个触发请求
    pub fn start<S: AsRef<str>>(&mut self, locations: &[S]) -> Vec<Action> {
        let mut actions: Vec<Action> = locations
            .iter()
            .map(|location| Action::Send(Request::Trigger(location.as_ref()).to_string()))
            .collect();
        self.pending += locations.len();

        if self.pending == 0 {
            actions.push(Action::Close);
        }
        actions
    }

    /// 处理一条 donna 的回复
    pub fn on_message(&mut self, message: &[u8]) -> Vec<Action> {
        let reply = match Reply::parse(message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("ignoring reply: {}", e);
                return Vec::new();
            }
        };
        debug!("reply: {:?}", reply);

        let mut actions = Vec::new();
        match reply {
            Reply::Ok { task } => {
                if let Some(task) = task {
                    if self.no_wait {
                        info!("task {} started", task);
                    } else {
                        // 只记录最近一个任务，等待其结果
                        self.task = Some(task);
                        self.pending += 1;
                    }
                }
            }
            Reply::Err { code, message } => {
                debug!("trigger error {}", code);
                if !message.is_empty() {
                    actions.push(Action::Stderr(message));
                }
                self.fail(ReturnCode::TriggerError);
            }
            Reply::Done { task, message } => {
                self.finish(task);
                if let Some(message) = message {
                    actions.push(Action::Stdout(message));
                }
            }
            Reply::Failed { task, message } => {
                self.finish(task);
                if let Some(message) = message {
                    actions.push(match self.failed_on_err {
                        true => Action::Stderr(message),
                        false => Action::Stdout(message),
                    });
                }
                self.fail(ReturnCode::TaskFailed);
            }
            Reply::Cancelled { task } => {
                info!("task {} cancelled", task);
                self.finish(task);
                self.fail(ReturnCode::TaskCancelled);
            }
        }

        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            actions.push(Action::Close);
        }
        actions
    }

    /// 用户中断（SIGINT）
    /// 有正在等待的后台任务时，请求 donna 取消该任务，否则直接关闭连接
    pub fn on_interrupt(&mut self) -> Vec<Action> {
        match self.task.take() {
            Some(task) if !self.no_wait => {
                info!("cancelling task {}", task);
                // 等待取消请求本身的回复
                self.pending += 1;
                vec![Action::Send(Request::Cancel(task).to_string())]
            }
            _ => vec![Action::Close],
        }
    }

    fn finish(&mut self, task: TaskId) {
        if self.task == Some(task) {
            self.task = None;
        }
    }

    /// 只记录第一个失败
    fn fail(&mut self, rc: ReturnCode) {
        if self.rc == ReturnCode::Ok {
            self.rc = rc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(request: &str) -> Action {
        Action::Send(request.into())
    }

    #[test]
    fn start_sends_one_trigger_per_location() {
        let mut trigger = Trigger::new(false, false);
        let actions = trigger.start(&["loc1", "loc2"]);
        assert_eq!(actions, vec![send("TRIGGER loc1"), send("TRIGGER loc2")]);
        assert_eq!(trigger.pending(), 2);

        let mut trigger = Trigger::new(false, false);
        assert_eq!(trigger.start::<&str>(&[]), vec![Action::Close]);
    }

    #[test]
    fn long_running_tasks_converge() {
        let mut trigger = Trigger::new(false, false);
        trigger.start(&["loc1", "loc2"]);

        assert!(trigger.on_message(b"OK TRIGGER 5").is_empty());
        assert_eq!(trigger.pending(), 2);
        assert!(trigger.on_message(b"OK TRIGGER 6").is_empty());
        assert_eq!(trigger.pending(), 2);
        // 只保留最近的任务
        assert_eq!(trigger.task(), Some(6));

        assert_eq!(
            trigger.on_message(b"DONE 5 done-msg"),
            vec![Action::Stdout("done-msg".into())]
        );
        assert_eq!(trigger.pending(), 1);
        assert_eq!(
            trigger.on_message(b"DONE 6 done-msg2"),
            vec![Action::Stdout("done-msg2".into()), Action::Close]
        );
        assert_eq!(trigger.pending(), 0);
        assert_eq!(trigger.task(), None);
        assert_eq!(trigger.return_code(), ReturnCode::Ok);
    }

    #[test]
    fn err_reply_sets_trigger_error() {
        let mut trigger = Trigger::new(false, false);
        trigger.start(&["bad-loc"]);

        assert_eq!(
            trigger.on_message(b"ERR 1 something failed"),
            vec![Action::Stderr("something failed".into()), Action::Close]
        );
        assert_eq!(trigger.return_code(), ReturnCode::TriggerError);
    }

    #[test]
    fn err_reply_without_text_prints_nothing() {
        let mut trigger = Trigger::new(false, false);
        trigger.start(&["bad-loc"]);

        assert_eq!(trigger.on_message(b"ERR 2"), vec![Action::Close]);
        assert_eq!(trigger.return_code(), ReturnCode::TriggerError);
    }

    #[test]
    fn no_wait_does_not_await_tasks() {
        let mut trigger = Trigger::new(true, false);
        trigger.start(&["loc1", "loc2"]);

        assert!(trigger.on_message(b"OK TRIGGER 5").is_empty());
        assert_eq!(trigger.pending(), 1);
        assert_eq!(trigger.on_message(b"OK TRIGGER 6"), vec![Action::Close]);
        assert_eq!(trigger.return_code(), ReturnCode::Ok);
    }

    #[test]
    fn failed_message_destination() {
        let mut trigger = Trigger::new(false, false);
        trigger.start(&["loc"]);
        trigger.on_message(b"OK TRIGGER 3");
        assert_eq!(
            trigger.on_message(b"FAILED 3 oops"),
            vec![Action::Stdout("oops".into()), Action::Close]
        );
        assert_eq!(trigger.return_code(), ReturnCode::TaskFailed);

        let mut trigger = Trigger::new(false, true);
        trigger.start(&["loc"]);
        trigger.on_message(b"OK TRIGGER 3");
        assert_eq!(
            trigger.on_message(b"FAILED 3 oops"),
            vec![Action::Stderr("oops".into()), Action::Close]
        );
    }

    #[test]
    fn first_failure_wins() {
        let mut trigger = Trigger::new(true, false);
        trigger.start(&["a", "b", "c"]);
        trigger.on_message(b"ERR 1 first");
        trigger.on_message(b"OK");
        assert_eq!(trigger.pending(), 1);
        trigger.on_message(b"CANCELLED 4");
        assert_eq!(trigger.pending(), 0);
        assert_eq!(trigger.return_code(), ReturnCode::TriggerError);
    }

    #[test]
    fn interrupt_cancels_tracked_task() {
        let mut trigger = Trigger::new(false, false);
        trigger.start(&["loc"]);
        trigger.on_message(b"OK TRIGGER 42");
        assert_eq!(trigger.pending(), 1);

        assert_eq!(trigger.on_interrupt(), vec![send("CANCEL 42")]);
        assert_eq!(trigger.pending(), 2);
        assert_eq!(trigger.task(), None);

        // 取消请求还没有结果时再次中断，直接关闭
        assert_eq!(trigger.on_interrupt(), vec![Action::Close]);

        assert!(trigger.on_message(b"OK").is_empty());
        assert_eq!(trigger.on_message(b"CANCELLED 42"), vec![Action::Close]);
        assert_eq!(trigger.return_code(), ReturnCode::TaskCancelled);
    }

    #[test]
    fn interrupt_without_task_closes() {
        let mut trigger = Trigger::new(false, false);
        trigger.start(&["loc"]);
        assert_eq!(trigger.on_interrupt(), vec![Action::Close]);

        let mut trigger = Trigger::new(true, false);
        trigger.start(&["loc"]);
        trigger.on_message(b"OK TRIGGER 1");
        assert_eq!(trigger.on_interrupt(), vec![Action::Close]);
    }

    #[test]
    fn unknown_reply_ignored() {
        let mut trigger = Trigger::new(false, false);
        trigger.start(&["loc"]);
        assert!(trigger.on_message(b"HELLO").is_empty());
        assert!(trigger.on_message(b"DONE x").is_empty());
        assert_eq!(trigger.pending(), 1);
    }

    #[test]
    fn return_code_values() {
        assert_eq!(ReturnCode::Ok.code(), 0);
        assert_eq!(ReturnCode::NoSocket.code(), 2);
        assert_eq!(ReturnCode::TaskCancelled.code(), 7);
    }
}
