use clap::{App, Arg};
use flashhub::agent::{HubAgent, HubContext};
use flashhub::config::BoardConfig;
use flashhub::config_store::MemoryConfigStore;
use flashhub::hal::Platform;
use flashhub::pins::BoardPins;
use flashhub::sim::{SimBulkMemory, SimBus, SimPin};
use flashhub::transport::Transport;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, warn};

const DEFAULT_COMMAND_PORT: &str = "8080";
const DEFAULT_BROADCAST_PORT: &str = "8081";
const DEFAULT_TICK_MS: &str = "10";
const DEFAULT_BULK_KB: &str = "2048";
const COMMAND_QUEUE_DEPTH: usize = 32;
const BROADCAST_BUFFER_SIZE: usize = 256;

type Pending = (String, oneshot::Sender<String>);

/// Host clock. The watchdog is only tracked, the process is never reset.
struct HostPlatform {
    started: Instant,
    last_feed: Instant,
    watchdog_timeout: Duration,
}

impl HostPlatform {
    fn new(watchdog_timeout_ms: u32) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_feed: now,
            watchdog_timeout: Duration::from_millis(u64::from(watchdog_timeout_ms)),
        }
    }

    /// Time since the last feed, if it exceeds the board's watchdog timeout.
    fn overdue(&self) -> Option<Duration> {
        let stalled = self.last_feed.elapsed();
        (stalled > self.watchdog_timeout).then_some(stalled)
    }
}

impl Platform for HostPlatform {
    fn millis(&self) -> u32 {
        // truncation is the wrap
        self.started.elapsed().as_millis() as u32
    }

    fn wall_clock_secs(&self) -> Option<u64> {
        SystemTime::now().duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn feed_watchdog(&mut self) {
        if let Some(stalled) = self.overdue() {
            warn!("watchdog fed after {:?}, timeout is {:?}", stalled, self.watchdog_timeout);
        }
        self.last_feed = Instant::now();
    }
}

/// Bridges the socket tasks to the synchronous tick loop.
struct ChannelTransport {
    commands: mpsc::Receiver<Pending>,
    reply: Option<oneshot::Sender<String>>,
    subscribers: broadcast::Sender<String>,
    known_subscribers: usize,
}

impl Transport for ChannelTransport {
    fn poll_command(&mut self) -> Option<String> {
        let (text, reply) = self.commands.try_recv().ok()?;
        self.reply = Some(reply);
        Some(text)
    }

    fn respond(&mut self, response: &str) {
        if let Some(reply) = self.reply.take() {
            if reply.send(response.to_string()).is_err() {
                debug!("client left before its response was ready");
            }
        }
    }

    fn broadcast(&mut self, message: &str) {
        // no subscribers is not an error
        let _ = self.subscribers.send(message.to_string());
    }

    fn maintain(&mut self, _now: u32) {
        let count = self.subscribers.receiver_count();
        if count != self.known_subscribers {
            info!("{} broadcast subscriber(s)", count);
            self.known_subscribers = count;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("flashhub")
        .version("0.1.0")
        .about("USB flash-hub controller running against simulated hardware")
        .arg(
            Arg::with_name("board")
                .short("b")
                .long("board")
                .value_name("PRESET")
                .help("Board preset")
                .takes_value(true)
                .possible_values(&["s3-devkit", "c3-mini"])
                .default_value("s3-devkit"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON board file, overrides --board")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Command (request/response) port")
                .takes_value(true)
                .default_value(DEFAULT_COMMAND_PORT),
        )
        .arg(
            Arg::with_name("broadcast-port")
                .long("broadcast-port")
                .value_name("PORT")
                .help("Status broadcast port")
                .takes_value(true)
                .default_value(DEFAULT_BROADCAST_PORT),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Main loop period")
                .takes_value(true)
                .default_value(DEFAULT_TICK_MS),
        )
        .arg(
            Arg::with_name("hubs")
                .long("hubs")
                .value_name("COUNT")
                .help("Number of simulated hubs that answer the probe (default: all)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bulk-kb")
                .long("bulk-kb")
                .value_name("KB")
                .help("Simulated bulk memory, 0 for none")
                .takes_value(true)
                .default_value(DEFAULT_BULK_KB),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => BoardConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => BoardConfig::preset(matches.value_of("board").unwrap_or("s3-devkit"))?,
    };
    let command_port: u16 = matches.value_of("port").unwrap_or(DEFAULT_COMMAND_PORT).parse()?;
    let broadcast_port: u16 = matches
        .value_of("broadcast-port")
        .unwrap_or(DEFAULT_BROADCAST_PORT)
        .parse()?;
    let tick_ms: u64 = matches.value_of("tick-ms").unwrap_or(DEFAULT_TICK_MS).parse()?;
    let bulk_kb: usize = matches.value_of("bulk-kb").unwrap_or(DEFAULT_BULK_KB).parse()?;
    let attached = match matches.value_of("hubs") {
        Some(count) => count.parse::<usize>()?,
        None => config.max_hubs(),
    };

    let bus = SimBus::with_devices(&config.hub_addresses[..attached.min(config.max_hubs())]);
    let pins = BoardPins::new(
        SimPin::new(),
        SimPin::new(),
        SimPin::new(),
        SimPin::new(),
        SimPin::new(),
    );
    let platform = HostPlatform::new(config.timing.watchdog_timeout_ms);
    let ctx = HubContext::new(
        config,
        bus,
        platform,
        pins,
        Box::new(MemoryConfigStore::new()),
    )?;
    let mut agent = HubAgent::new(ctx);
    agent.start(&mut SimBulkMemory::new(bulk_kb * 1024));

    let (command_tx, command_rx) = mpsc::channel::<Pending>(COMMAND_QUEUE_DEPTH);
    let (broadcast_tx, _) = broadcast::channel::<String>(BROADCAST_BUFFER_SIZE);

    let command_server = tokio::spawn(serve_commands(command_port, command_tx));
    let broadcast_server = tokio::spawn(serve_broadcasts(broadcast_port, broadcast_tx.clone()));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let trigger = agent.trigger();
        let mut usr1 = signal(SignalKind::user_defined1())?;
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                warn!("SIGUSR1: emergency stop");
                trigger.fire();
            }
        });
        info!("send SIGUSR1 to trip the emergency stop");
    }

    let mut transport = ChannelTransport {
        commands: command_rx,
        reply: None,
        subscribers: broadcast_tx,
        known_subscribers: 0,
    };
    let mut transports: [&mut dyn Transport; 1] = [&mut transport];
    let mut interval = time::interval(Duration::from_millis(tick_ms.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = agent.tick(&mut transports) {
                    error!("tick failed: {}", e);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received");
                break;
            }
        }
    }

    agent.stop();
    command_server.abort();
    broadcast_server.abort();
    Ok(())
}

async fn serve_commands(port: u16, commands: mpsc::Sender<Pending>) {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("command port {}: {}", port, e);
            return;
        }
    };
    info!("commands on tcp port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("command client {} connected", addr);
                let commands = commands.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_command_client(stream, commands).await {
                        warn!("command client {}: {}", addr, e);
                    }
                    info!("command client {} disconnected", addr);
                });
            }
            Err(e) => error!("accept failed: {}", e),
        }
    }
}

async fn handle_command_client(
    stream: TcpStream,
    commands: mpsc::Sender<Pending>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send((line.to_string(), reply_tx))
            .await
            .map_err(|_| "controller stopped")?;
        let response = reply_rx.await?;

        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

async fn serve_broadcasts(port: u16, subscribers: broadcast::Sender<String>) {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("broadcast port {}: {}", port, e);
            return;
        }
    };
    info!("status broadcasts on tcp port {}", port);

    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                let mut rx = subscribers.subscribe();
                tokio::spawn(async move {
                    loop {
                        let message = match rx.recv().await {
                            Ok(message) => message,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("subscriber {} skipped {} messages", addr, skipped);
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        if stream.write_all(message.as_bytes()).await.is_err()
                            || stream.write_all(b"\n").await.is_err()
                        {
                            break;
                        }
                    }
                    info!("subscriber {} disconnected", addr);
                });
            }
            Err(e) => error!("accept failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_uses_board_timeout() {
        let strict = HostPlatform::new(1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(strict.overdue().is_some());

        let relaxed = HostPlatform::new(BoardConfig::default().timing.watchdog_timeout_ms);
        std::thread::sleep(Duration::from_millis(5));
        assert!(relaxed.overdue().is_none());
    }
}
