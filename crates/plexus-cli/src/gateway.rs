//! Console gateway component.
//!
//! Stands in for a network transport: each stdin line is decoded as a wire
//! message and sent on the bus, and every message on the gateway's route is
//! written back as one JSON line.
//!
//! Process stdin is read on a dedicated thread, so a pending read never holds
//! up runtime shutdown.

use std::io::{self, BufRead};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use plexus_kernel::{Component, KernelError, Lifecycle, Message, SignalBus};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const NAME: &str = "Console";

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;
type OpenBlocking = Box<dyn FnOnce() -> Box<dyn BufRead> + Send>;

enum Input {
    Reader(Reader),
    /// A blocking reader, opened and drained on its own thread.
    Blocking(OpenBlocking),
}

enum LineSource {
    Reader(Lines<Reader>),
    Thread(mpsc::Receiver<io::Result<String>>),
}

impl LineSource {
    fn open(input: Input) -> io::Result<Self> {
        match input {
            Input::Reader(reader) => Ok(Self::Reader(reader.lines())),
            Input::Blocking(open) => spawn_line_thread(open).map(Self::Thread),
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        match self {
            Self::Reader(lines) => lines.next_line().await,
            Self::Thread(rx) => rx.recv().await.transpose(),
        }
    }
}

/// Read lines on a named OS thread and hand them over a channel.
///
/// The thread ends at end of input or once the receiver is dropped.
fn spawn_line_thread(open: OpenBlocking) -> io::Result<mpsc::Receiver<io::Result<String>>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::Builder::new()
        .name("plexus-console-input".into())
        .spawn(move || {
            for line in open().lines() {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

pub struct Console {
    bus: SignalBus,
    route: String,
    input: Mutex<Option<Input>>,
    output: Mutex<Output>,
    pid: OnceLock<String>,
    cancel: CancellationToken,
}

impl Console {
    /// Gateway over the process's stdin and stdout.
    pub fn stdio(bus: SignalBus, route: impl Into<String>) -> Self {
        Self::new(
            bus,
            route,
            Input::Blocking(Box::new(|| -> Box<dyn BufRead> { Box::new(io::stdin().lock()) })),
            Box::new(tokio::io::stdout()),
        )
    }

    pub fn with_io(
        bus: SignalBus,
        route: impl Into<String>,
        input: impl AsyncBufRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::new(bus, route, Input::Reader(Box::new(input)), Box::new(output))
    }

    fn new(bus: SignalBus, route: impl Into<String>, input: Input, output: Output) -> Self {
        Self {
            bus,
            route: route.into(),
            input: Mutex::new(Some(input)),
            output: Mutex::new(output),
            pid: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn forward(&self, line: &str) {
        match Message::from_json(line) {
            Ok(message) => {
                debug!(message_id = %message.id(), route = %message.route(), "console input");
                self.bus.send(message);
            }
            Err(err) => self.bus.error(KernelError::component(NAME, err)),
        }
    }
}

#[async_trait]
impl Lifecycle for Console {
    async fn stop(&self) -> plexus_kernel::Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    async fn kill(&self) -> plexus_kernel::Result<()> {
        self.stop().await?;
        self.output
            .lock()
            .await
            .flush()
            .await
            .map_err(|e| KernelError::component(NAME, e))
    }
}

#[async_trait]
impl Component for Console {
    fn name(&self) -> &str {
        NAME
    }

    fn route(&self) -> &str {
        &self.route
    }

    fn pid(&self) -> Option<String> {
        self.pid.get().cloned()
    }

    async fn configure(&self) -> plexus_kernel::Result<()> {
        Ok(())
    }

    /// Read lines until end of input or `stop`.
    async fn run(&self) -> plexus_kernel::Result<()> {
        let input = self
            .input
            .lock()
            .await
            .take()
            .ok_or_else(|| KernelError::component(NAME, "input already consumed"))?;
        let mut lines = LineSource::open(input).map_err(|e| KernelError::component(NAME, e))?;
        self.pid.get_or_init(|| Uuid::now_v7().to_string());

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => line.map_err(|e| KernelError::component(NAME, e))?,
            };
            let Some(line) = line else {
                info!("console input closed");
                break;
            };
            let line = line.trim();
            if !line.is_empty() {
                self.forward(line);
            }
        }
        Ok(())
    }

    async fn write(&self, message: Arc<Message>) -> plexus_kernel::Result<()> {
        if message.route() != self.route {
            return Ok(());
        }
        let mut line = message.to_json()?;
        line.push('\n');

        let mut output = self.output.lock().await;
        output
            .write_all(line.as_bytes())
            .await
            .map_err(|e| KernelError::component(NAME, e))?;
        output
            .flush()
            .await
            .map_err(|e| KernelError::component(NAME, e))
    }
}
