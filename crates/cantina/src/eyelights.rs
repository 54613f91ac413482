//! Eye-light controller: framed single-byte commands over a serial link.
//!
//! Wire protocol: pattern bytes (`I`,`S`,`T`,`L`,`E`,`H`,`D`,`A`), ASCII
//! digits for brightness, `R` for reset; the microcontroller answers `+` or
//! `-` terminated by `\n`. Commands arriving within the coalesce window
//! collapse to the most recent. Three consecutive reply timeouts mark the
//! service DEGRADED and trigger reconnection with exponential backoff; the
//! last pattern is replayed once the link is back.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cantinabus::{Service, ServiceContext, ServiceError};
use cantinaproto::{topics, LedCommand, LedPattern, Mode, Payload};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const TIMEOUT_STRIKES: u32 = 3;
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// A byte link to the microcontroller.
pub trait LedLink: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LedLink for T {}

/// Opens (and re-opens) the link.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn connect(&self) -> io::Result<Box<dyn LedLink>>;
}

/// Real serial port, 8N1.
pub struct SerialFactory {
    pub device: String,
    pub baud: u32,
}

#[async_trait]
impl LinkFactory for SerialFactory {
    async fn connect(&self) -> io::Result<Box<dyn LedLink>> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(&self.device, self.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone)]
pub struct EyeLightConfig {
    pub response_timeout: Duration,
    pub coalesce_window: Duration,
}

pub struct EyeLightController {
    factory: Arc<dyn LinkFactory>,
    config: EyeLightConfig,
}

impl EyeLightController {
    pub fn new(factory: Arc<dyn LinkFactory>, config: EyeLightConfig) -> Self {
        Self { factory, config }
    }
}

#[async_trait]
impl Service for EyeLightController {
    fn name(&self) -> &'static str {
        "eye_lights"
    }

    async fn start(&self, ctx: &Arc<ServiceContext>) -> Result<(), ServiceError> {
        let mut led_rx = ctx.subscribe(topics::LEDS_COMMAND);
        let mut mode_rx = ctx.subscribe(topics::MODE_CHANGE);
        let mut listening_started_rx = ctx.subscribe(topics::LISTENING_STARTED);
        let mut listening_stopped_rx = ctx.subscribe(topics::LISTENING_STOPPED);
        let mut speech_started_rx = ctx.subscribe(topics::SPEECH_STARTED);
        let mut speech_ended_rx = ctx.subscribe(topics::SPEECH_ENDED);
        let mut status_rx = ctx.subscribe(topics::STATUS_REQUEST);

        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let ctx = Arc::clone(ctx);
        let cancel = ctx.cancel_token();

        ctx.clone().spawn(async move {
            let mut driver = Driver {
                factory,
                config,
                link: None,
                mode: Mode::Idle,
                pending: None,
                coalesce_deadline: None,
                reconnect_deadline: None,
                backoff: BACKOFF_INITIAL,
                consecutive_timeouts: 0,
                timeout_logged: false,
                last_pattern: None,
            };

            // Best-effort initial connect; failure just schedules a retry.
            driver.try_connect(&ctx).await;

            loop {
                let coalesce_timer = maybe_sleep(driver.coalesce_deadline);
                let reconnect_timer = maybe_sleep(driver.reconnect_deadline);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = coalesce_timer => driver.flush_pending(&ctx).await,
                    _ = reconnect_timer => {
                        driver.reconnect_deadline = None;
                        driver.try_connect(&ctx).await;
                    }
                    Some(event) = led_rx.recv() => {
                        if let Payload::LedCommand(command) = event.payload {
                            driver.enqueue(command_byte(&command));
                        }
                    }
                    Some(event) = mode_rx.recv() => {
                        if let Payload::ModeChange { new, .. } = event.payload {
                            driver.mode = new;
                            driver.enqueue(mode_pattern(new).wire_byte());
                        }
                    }
                    Some(_) = listening_started_rx.recv() => {
                        driver.enqueue(LedPattern::Listening.wire_byte());
                    }
                    Some(_) = listening_stopped_rx.recv() => {
                        driver.enqueue(LedPattern::Thinking.wire_byte());
                    }
                    Some(_) = speech_started_rx.recv() => {
                        driver.enqueue(LedPattern::Speaking.wire_byte());
                    }
                    Some(_) = speech_ended_rx.recv() => {
                        let pattern = mode_pattern(driver.mode);
                        driver.enqueue(pattern.wire_byte());
                    }
                    Some(_) = status_rx.recv() => {
                        ctx.emit_status(None).await;
                    }
                    else => break,
                }
            }
        });
        Ok(())
    }
}

fn maybe_sleep(
    deadline: Option<Instant>,
) -> futures::future::Either<tokio::time::Sleep, futures::future::Pending<()>> {
    match deadline {
        Some(deadline) => futures::future::Either::Left(tokio::time::sleep_until(deadline)),
        None => futures::future::Either::Right(futures::future::pending()),
    }
}

/// The resting pattern for a mode.
fn mode_pattern(mode: Mode) -> LedPattern {
    match mode {
        Mode::Idle | Mode::Ambient => LedPattern::Idle,
        Mode::Interactive => LedPattern::Engaged,
    }
}

fn command_byte(command: &LedCommand) -> u8 {
    match command {
        LedCommand::Pattern { pattern } => pattern.wire_byte(),
        LedCommand::Brightness { level } => b'0' + (*level).min(9),
        LedCommand::Reset => b'R',
    }
}

struct Driver {
    factory: Arc<dyn LinkFactory>,
    config: EyeLightConfig,
    link: Option<Box<dyn LedLink>>,
    mode: Mode,
    pending: Option<u8>,
    coalesce_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    backoff: Duration,
    consecutive_timeouts: u32,
    timeout_logged: bool,
    last_pattern: Option<u8>,
}

impl Driver {
    /// Queue a byte; within the coalesce window only the most recent wins.
    fn enqueue(&mut self, byte: u8) {
        if self.pending.is_none() {
            self.coalesce_deadline = Some(Instant::now() + self.config.coalesce_window);
        }
        self.pending = Some(byte);
    }

    async fn flush_pending(&mut self, ctx: &Arc<ServiceContext>) {
        self.coalesce_deadline = None;
        let Some(byte) = self.pending.take() else { return };
        self.transmit(ctx, byte).await;
    }

    async fn transmit(&mut self, ctx: &Arc<ServiceContext>, byte: u8) {
        if byte.is_ascii_uppercase() && byte != b'R' {
            self.last_pattern = Some(byte);
        }

        let Some(link) = self.link.as_mut() else {
            debug!("link down, command dropped");
            return;
        };

        if link.write_all(&[byte]).await.is_err() || link.flush().await.is_err() {
            warn!("serial write failed");
            self.link_lost(ctx).await;
            return;
        }

        match tokio::time::timeout(self.config.response_timeout, read_reply(link.as_mut())).await
        {
            Ok(Ok(true)) => {
                self.consecutive_timeouts = 0;
                self.timeout_logged = false;
                ctx.recovered(None).await;
            }
            Ok(Ok(false)) => {
                warn!(byte = %(byte as char), "controller rejected command");
                self.consecutive_timeouts = 0;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "serial read failed");
                self.link_lost(ctx).await;
            }
            Err(_) => {
                self.consecutive_timeouts += 1;
                if !self.timeout_logged {
                    warn!("no reply from led controller");
                    self.timeout_logged = true;
                }
                if self.consecutive_timeouts >= TIMEOUT_STRIKES {
                    self.link_lost(ctx).await;
                }
            }
        }
    }

    async fn link_lost(&mut self, ctx: &Arc<ServiceContext>) {
        self.link = None;
        self.consecutive_timeouts = 0;
        ctx.set_state(
            cantinaproto::ServiceState::Degraded,
            Some("serial link lost".to_string()),
        )
        .await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_deadline = Some(Instant::now() + self.backoff);
        self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
    }

    async fn try_connect(&mut self, ctx: &Arc<ServiceContext>) {
        match self.factory.connect().await {
            Ok(link) => {
                info!("led controller connected");
                self.link = Some(link);
                self.backoff = BACKOFF_INITIAL;
                self.consecutive_timeouts = 0;
                ctx.recovered(None).await;
                // Restore whatever face the droid last wore.
                if let Some(pattern) = self.last_pattern {
                    self.transmit(ctx, pattern).await;
                }
            }
            Err(e) => {
                debug!(error = %e, "led controller connect failed");
                self.schedule_reconnect();
            }
        }
    }
}

/// Read bytes until `\n`; the first byte decides success.
async fn read_reply(link: &mut (dyn LedLink + '_)) -> io::Result<bool> {
    let mut first: Option<u8> = None;
    loop {
        let byte = link.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if first.is_none() {
            first = Some(byte);
        }
    }
    Ok(first == Some(b'+'))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use cantinabus::{EventBus, ServiceHandle};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Hands out pre-built duplex links; `None` entries simulate connect
    /// failures.
    pub struct FakeFactory {
        links: Mutex<Vec<Option<DuplexStream>>>,
    }

    impl FakeFactory {
        pub fn new(links: Vec<Option<DuplexStream>>) -> Self {
            Self {
                links: Mutex::new(links),
            }
        }
    }

    #[async_trait]
    impl LinkFactory for FakeFactory {
        async fn connect(&self) -> io::Result<Box<dyn LedLink>> {
            let mut links = self.links.lock().unwrap();
            match links.pop() {
                Some(Some(link)) => Ok(Box::new(link)),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "no device")),
            }
        }
    }

    /// Device side that always acks, recording what it saw.
    async fn ack_device(mut side: DuplexStream, seen: Arc<Mutex<Vec<u8>>>) {
        loop {
            let mut buf = [0u8; 1];
            match side.read_exact(&mut buf).await {
                Ok(_) => {
                    seen.lock().unwrap().push(buf[0]);
                    if side.write_all(b"+\n").await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    fn test_config() -> EyeLightConfig {
        EyeLightConfig {
            response_timeout: Duration::from_millis(500),
            coalesce_window: Duration::from_millis(30),
        }
    }

    #[tokio::test]
    async fn mode_changes_drive_patterns() {
        let (ours, theirs) = tokio::io::duplex(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(ack_device(theirs, Arc::clone(&seen)));

        let bus = Arc::new(EventBus::new());
        let controller = EyeLightController::new(
            Arc::new(FakeFactory::new(vec![Some(ours)])),
            test_config(),
        );
        let handle = ServiceHandle::new(Arc::new(controller), Arc::clone(&bus));
        handle.start().await.unwrap();

        bus.emit(
            topics::MODE_CHANGE,
            "test",
            Payload::ModeChange { old: Mode::Idle, new: Mode::Interactive },
        )
        .await;

        // Coalesce window plus transmission round-trip.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), b"E");

        handle.stop().await;
    }

    #[tokio::test]
    async fn burst_coalesces_to_most_recent() {
        let (ours, theirs) = tokio::io::duplex(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(ack_device(theirs, Arc::clone(&seen)));

        let bus = Arc::new(EventBus::new());
        let controller = EyeLightController::new(
            Arc::new(FakeFactory::new(vec![Some(ours)])),
            test_config(),
        );
        let handle = ServiceHandle::new(Arc::new(controller), Arc::clone(&bus));
        handle.start().await.unwrap();

        // Three commands inside one coalesce window.
        for pattern in [LedPattern::Listening, LedPattern::Thinking, LedPattern::Speaking] {
            bus.emit(
                topics::LEDS_COMMAND,
                "test",
                Payload::LedCommand(LedCommand::Pattern { pattern }),
            )
            .await;
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), b"S");

        handle.stop().await;
    }

    #[tokio::test]
    async fn brightness_maps_to_ascii_digit() {
        assert_eq!(command_byte(&LedCommand::Brightness { level: 0 }), b'0');
        assert_eq!(command_byte(&LedCommand::Brightness { level: 9 }), b'9');
        assert_eq!(command_byte(&LedCommand::Brightness { level: 14 }), b'9');
        assert_eq!(command_byte(&LedCommand::Reset), b'R');
    }

    #[tokio::test]
    async fn reconnect_replays_last_pattern() {
        // First link: device that never replies, driving timeouts.
        let (silent_ours, mut silent_theirs) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            // Swallow writes, never ack.
            while silent_theirs.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        // Second link: healthy device.
        let (good_ours, good_theirs) = tokio::io::duplex(64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(ack_device(good_theirs, Arc::clone(&seen)));

        let bus = Arc::new(EventBus::new());
        // Factory pops from the back: silent first, then the good link.
        let factory = FakeFactory::new(vec![Some(good_ours), Some(silent_ours)]);
        let controller = EyeLightController::new(
            Arc::new(factory),
            EyeLightConfig {
                response_timeout: Duration::from_millis(50),
                coalesce_window: Duration::from_millis(10),
            },
        );
        let handle = ServiceHandle::new(Arc::new(controller), Arc::clone(&bus));
        handle.start().await.unwrap();

        // Three timed-out transmissions, then reconnect + replay.
        for _ in 0..3 {
            bus.emit(
                topics::LEDS_COMMAND,
                "test",
                Payload::LedCommand(LedCommand::Pattern { pattern: LedPattern::Happy }),
            )
            .await;
            tokio::time::sleep(Duration::from_millis(80)).await;
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), b"H");

        handle.stop().await;
    }
}
