use std::{
    cell::{Cell, RefCell},
    fmt, io,
    os::unix::net::UnixStream as StdUnixStream,
    path::Path,
    rc::Rc,
};

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace, warn};
use tokio::{
    io::Interest,
    net::UnixStream,
    task::{self, JoinHandle},
};

use crate::error::Error;

use super::frame::{self, FrameBuffer};

/// 消息回调
/// * `Some(message)`: 收到一条完整的消息
/// * `None`: 连接已关闭，每个连接只会收到一次
pub type Handler = dyn Fn(&Socket, Option<Bytes>);

/// 注册在事件循环上的各个监听任务
/// 每个任务持有一份 Socket 引用，任务结束或被取消时释放
#[derive(Default)]
struct Watches {
    read: Option<JoinHandle<()>>,
    write: Option<JoinHandle<()>>,
    error: Option<JoinHandle<()>>,
    process: Option<JoinHandle<()>>,
}

impl Watches {
    fn abort_all(&mut self) {
        let watches = [
            self.read.take(),
            self.write.take(),
            self.error.take(),
            self.process.take(),
        ];
        for watch in watches.into_iter().flatten() {
            watch.abort();
        }
    }
}

struct Inner {
    /// None 代表连接已关闭
    stream: RefCell<Option<Rc<UnixStream>>>,
    /// 读缓冲区，从中取出完整的帧
    read: RefCell<FrameBuffer>,
    /// 写缓冲区，socket 暂时不可写时，未发出的数据在此排队
    write: RefCell<BytesMut>,
    watches: RefCell<Watches>,
    /// 帧处理中，防止重入
    processing: Cell<bool>,
    handler: Box<Handler>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // 所有监听任务都持有引用，走到这里说明事件循环已经不在了，没有人能收到关闭通知
        if self.stream.get_mut().take().is_some() {
            debug!("socket released while still open");
        }
        self.watches.get_mut().abort_all();
    }
}

/// 与 donna 之间的一条 socket 连接
///
/// 以帧为单位收发消息，读写都是非阻塞的，由单线程事件循环
/// （tokio `current_thread` + `LocalSet`）驱动，所有方法都只能在该线程上调用。
///
/// `Socket` 是引用计数句柄，clone 即增加引用，drop 即释放引用。
/// 回调捕获的数据在最后一个引用释放时随之销毁。
#[derive(Clone)]
pub struct Socket {
    inner: Rc<Inner>,
}

impl Socket {
    /// 绑定一个已连接的 stream，开始监听可读和错误事件
    /// 只有存在待发送数据时才会监听可写事件
    ///
    /// 必须在 `LocalSet` 中调用
    pub fn new<F>(stream: UnixStream, handler: F) -> Self
    where
        F: Fn(&Socket, Option<Bytes>) + 'static,
    {
        let stream = Rc::new(stream);
        let socket = Self {
            inner: Rc::new(Inner {
                stream: RefCell::new(Some(stream.clone())),
                read: RefCell::new(FrameBuffer::new()),
                write: RefCell::new(BytesMut::new()),
                watches: RefCell::new(Watches::default()),
                processing: Cell::new(false),
                handler: Box::new(handler),
            }),
        };

        let read = task::spawn_local(socket.clone().read_loop(stream.clone()));
        let error = task::spawn_local(socket.clone().error_loop(stream));
        {
            let mut watches = socket.inner.watches.borrow_mut();
            watches.read = Some(read);
            watches.error = Some(error);
        }

        socket
    }

    /// 使用标准库的 stream，先将其切换为非阻塞模式
    pub fn from_std<F>(stream: StdUnixStream, handler: F) -> Result<Self, Error>
    where
        F: Fn(&Socket, Option<Bytes>) + 'static,
    {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?, handler))
    }

    pub async fn connect<P, F>(path: P, handler: F) -> Result<Self, Error>
    where
        P: AsRef<Path>,
        F: Fn(&Socket, Option<Bytes>) + 'static,
    {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::new(stream, handler))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stream.borrow().is_none()
    }

    /// 写缓冲区中还未被 socket 接收的字节数
    pub fn pending_output(&self) -> usize {
        self.inner.write.borrow().len()
    }

    /// 当前引用计数，包括各个监听任务持有的引用
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    fn stream(&self) -> Option<Rc<UnixStream>> {
        self.inner.stream.borrow().clone()
    }

    /// 发送一条消息
    /// * 写缓冲区非空时，直接追加到缓冲区尾部，保证发送顺序
    /// * 否则立即尝试写入，socket 没有接收的部分放入写缓冲区，等待可写事件
    ///
    /// 写入出错时连接会被关闭
    pub fn send(&self, message: impl AsRef<[u8]>) -> Result<(), Error> {
        let stream = self.stream().ok_or(Error::Closed)?;
        let message = message.as_ref();

        let mut write = self.inner.write.borrow_mut();
        let queued = !write.is_empty();
        frame::write_frame(&mut write, message)?;
        trace!("send {} bytes, queued: {}", message.len(), queued);
        if queued {
            return Ok(());
        }

        let flushed = flush(&stream, &mut write);
        let pending = !write.is_empty();
        drop(write);

        if let Err(e) = flushed {
            warn!("socket write error: {}", e);
            self.close();
            return Err(Error::IO(e));
        }
        if pending {
            self.watch_write(stream);
        }
        Ok(())
    }

    /// 关闭连接，可以重复调用，也可以在回调中调用
    /// 未发送的数据直接丢弃，回调收到一次 `None`，然后取消所有监听
    pub fn close(&self) {
        let stream = match self.inner.stream.borrow_mut().take() {
            Some(stream) => stream,
            None => return,
        };
        debug!("closing socket");

        self.inner.read.borrow_mut().clear();
        self.inner.write.borrow_mut().clear();
        drop(stream);

        (self.inner.handler)(self, None);

        self.inner.watches.borrow_mut().abort_all();
    }

    /// 处理读缓冲区中的一个帧
    /// 返回 true 表示处理了一个帧，缓冲区中可能还有完整的帧
    /// 正在处理时重入调用直接返回 false
    pub(crate) fn process(&self) -> bool {
        if self.is_closed() || self.inner.processing.replace(true) {
            return false;
        }

        let frame = self.inner.read.borrow_mut().try_extract_frame();
        let processed = match frame {
            Ok(message) => {
                trace!("received message of {} bytes", message.len());
                (self.inner.handler)(self, Some(message));
                true
            }
            Err(e) if e.is_violation() => {
                warn!("invalid framing, closing socket: {}", e);
                self.close();
                false
            }
            Err(_) => false,
        };

        self.inner.processing.set(false);
        processed
    }

    /// 帧处理放到单独的任务中，每处理一个帧让出一次执行权
    fn schedule_process(&self) {
        let mut watches = self.inner.watches.borrow_mut();
        if watches.process.is_none() {
            watches.process = Some(task::spawn_local(self.clone().process_loop()));
        }
    }

    async fn process_loop(self) {
        while self.process() {
            task::yield_now().await;
        }
        self.inner.watches.borrow_mut().process = None;
    }

    async fn read_loop(self, stream: Rc<UnixStream>) {
        loop {
            if let Err(e) = stream.readable().await {
                warn!("socket read error: {}", e);
                self.close();
                return;
            }
            if !self.read_available(&stream) {
                return;
            }
        }
    }

    /// 读出 socket 中所有当前可读的数据
    /// 返回 false 表示连接已关闭
    fn read_available(&self, stream: &UnixStream) -> bool {
        let mut total = 0;
        let closed = loop {
            let read = {
                let mut buf = self.inner.read.borrow_mut();
                stream.try_read_buf(buf.spare())
            };
            match read {
                Ok(0) => {
                    debug!("socket closed by peer");
                    break true;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("socket read error: {}", e);
                    break true;
                }
            }
        };

        if closed {
            // 与 EOF 同一次读到的数据不再交给 handler，随 close 一起丢弃
            self.close();
            return false;
        }
        if total > 0 {
            trace!("read {} bytes", total);
            self.schedule_process();
        }
        true
    }

    fn watch_write(&self, stream: Rc<UnixStream>) {
        let mut watches = self.inner.watches.borrow_mut();
        if watches.write.is_none() {
            watches.write = Some(task::spawn_local(self.clone().write_loop(stream)));
        }
    }

    async fn write_loop(self, stream: Rc<UnixStream>) {
        loop {
            if self.is_closed() {
                return;
            }
            if let Err(e) = stream.writable().await {
                warn!("socket write error: {}", e);
                self.close();
                return;
            }

            let flushed = {
                let mut write = self.inner.write.borrow_mut();
                flush(&stream, &mut write).map(|_| write.is_empty())
            };
            match flushed {
                // 全部写完，不再监听可写事件
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    warn!("socket write error: {}", e);
                    self.close();
                    return;
                }
            }
        }
        self.inner.watches.borrow_mut().write = None;
    }

    async fn error_loop(self, stream: Rc<UnixStream>) {
        match stream.ready(Interest::ERROR).await {
            Ok(ready) => warn!("socket error condition: {:?}", ready),
            Err(e) => warn!("socket error: {}", e),
        }
        self.close();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("closed", &self.is_closed())
            .field("pending_input", &self.inner.read.borrow().len())
            .field("pending_output", &self.pending_output())
            .finish()
    }
}

/// 尽可能多地把写缓冲区的数据写入 socket，已写入的部分从缓冲区头部移除
/// socket 暂时不可写不算错误
fn flush(stream: &UnixStream, write: &mut BytesMut) -> io::Result<usize> {
    let mut written = 0;
    while !write.is_empty() {
        match stream.try_write(&write[..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                write.advance(n);
                written += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
