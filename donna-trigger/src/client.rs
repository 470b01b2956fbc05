//! 在 socket 上驱动触发状态机，直到连接关闭

use std::{cell::RefCell, rc::Rc};

use donna_socket::Socket;
use log::{debug, warn};
use tokio::{
    net::UnixStream,
    select,
    signal::unix::{signal, Signal, SignalKind},
    sync::Notify,
};

use crate::{
    config::Config,
    trigger::{Action, ReturnCode, Trigger},
};

/// 连接 donna 并发送所有触发请求，返回进程退出码
///
/// 必须在 `LocalSet` 中调用
pub async fn run(config: &Config) -> ReturnCode {
    let stream = match UnixStream::connect(&config.socket).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!(
                "Failed to connect to socket {}: {}",
                config.socket.display(),
                e
            );
            return ReturnCode::SocketFailed;
        }
    };
    debug!("connected to {}", config.socket.display());

    run_with_stream(stream, config).await
}

pub async fn run_with_stream(stream: UnixStream, config: &Config) -> ReturnCode {
    let trigger = Rc::new(RefCell::new(Trigger::new(
        config.no_wait,
        config.failed_on_err,
    )));
    let closed = Rc::new(Notify::new());

    let socket = {
        let trigger = trigger.clone();
        let closed = closed.clone();
        Socket::new(stream, move |socket, message| match message {
            Some(message) => {
                let actions = trigger.borrow_mut().on_message(&message);
                apply(socket, actions);
            }
            // 连接关闭即结束
            None => closed.notify_one(),
        })
    };

    let actions = trigger.borrow_mut().start(&config.locations);
    apply(&socket, actions);

    let mut interrupt = listen(SignalKind::interrupt());
    let mut terminate = listen(SignalKind::terminate());
    loop {
        select! {
            _ = closed.notified() => break,
            _ = recv(&mut interrupt) => {
                let actions = trigger.borrow_mut().on_interrupt();
                apply(&socket, actions);
            }
            _ = recv(&mut terminate) => {
                let actions = trigger.borrow_mut().on_interrupt();
                apply(&socket, actions);
            }
        }
    }

    let trigger = trigger.borrow();
    if trigger.pending() > 0 {
        warn!(
            "connection closed with {} request(s) still pending",
            trigger.pending()
        );
        if let Some(task) = trigger.task() {
            warn!("task {} has no result", task);
        }
    }
    trigger.return_code()
}

fn apply(socket: &Socket, actions: Vec<Action>) {
    for action in actions {
        match action {
            Action::Send(request) => {
                debug!("send: {}", request);
                if let Err(e) = socket.send(&request) {
                    warn!("failed to send '{}': {}", request, e);
                }
            }
            Action::Stdout(text) => println!("{}", text),
            Action::Stderr(text) => eprintln!("{}", text),
            Action::Close => socket.close(),
        }
    }
}

fn listen(kind: SignalKind) -> Option<Signal> {
    match signal(kind) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!("failed to listen for signal {:?}: {}", kind, e);
            None
        }
    }
}

/// 没有成功监听的信号永远不会触发
async fn recv(signal: &mut Option<Signal>) {
    if let Some(signal) = signal {
        if signal.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}
