use crate::activity::{ActivityLogger, BulkStorageProvider};
use crate::config::{BoardConfig, ConfigError};
use crate::config_store::ConfigStore;
use crate::estop::{EmergencyStop, EmergencyTrigger, EstopEvent};
use crate::hal::{elapsed_ms, interval_elapsed, timestamp, I2cBus, OutputPin, Platform};
use crate::hub::HubController;
use crate::pins::{BoardPins, Indicators};
use crate::processor::CommandProcessor;
use crate::protocol::{log_broadcast, status_broadcast, PinLevels, ResponseWriter, StatusSnapshot};
use crate::transport::Transport;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid board configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("agent not started")]
    NotStarted,
}

/// Everything the core mutates, owned in one place and passed by reference.
pub struct HubContext<B: I2cBus, P: Platform> {
    pub config: BoardConfig,
    pub hubs: HubController<B>,
    pub logger: ActivityLogger,
    pub pins: BoardPins,
    pub indicators: Indicators,
    pub estop: EmergencyStop,
    pub store: Box<dyn ConfigStore + Send>,
    pub platform: P,
    /// Commands processed since boot, including rejected ones.
    pub commands: u32,
    pub boot_ms: u32,
}

impl<B: I2cBus, P: Platform> HubContext<B, P> {
    pub fn new(
        config: BoardConfig,
        bus: B,
        platform: P,
        pins: BoardPins,
        store: Box<dyn ConfigStore + Send>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let boot_ms = platform.millis();

        Ok(Self {
            hubs: HubController::new(bus, &config),
            logger: ActivityLogger::new(),
            pins,
            indicators: Indicators::new(),
            estop: EmergencyStop::new(config.timing.estop_hold_ms),
            store,
            platform,
            commands: 0,
            boot_ms,
            config,
        })
    }

    /// Append to the activity log, stamped with the best clock available.
    pub fn log(&mut self, action: &str, target: u16, detail: &str) {
        let ts = timestamp(&self.platform);
        self.logger.append(ts, action, target, detail);
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            board: self.config.name.clone(),
            uptime_ms: elapsed_ms(self.platform.millis(), self.boot_ms),
            commands: self.commands,
            total_ports: self.config.total_ports(),
            hubs_connected: self.hubs.connected_count(),
            hubs: self.hubs.snapshot(),
            i2c: self.hubs.health().report(),
            estop: self.estop.status(),
            pins: PinLevels {
                boot: self.pins.boot.level(),
                reset: self.pins.reset.level(),
            },
            log: self.logger.stats(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub now: u32,
    pub estop: EstopEvent,
    pub command_processed: bool,
    pub status_broadcast: bool,
    pub heartbeat: bool,
}

/// Cooperative scheduler around a [`HubContext`].
pub struct HubAgent<B: I2cBus, P: Platform> {
    ctx: HubContext<B, P>,
    processor: CommandProcessor,
    writer: ResponseWriter,
    running: bool,
    next_transport: usize,
    last_broadcast: u32,
    last_heartbeat: u32,
}

impl<B: I2cBus, P: Platform> HubAgent<B, P> {
    pub fn new(ctx: HubContext<B, P>) -> Self {
        Self {
            ctx,
            processor: CommandProcessor::new(),
            writer: ResponseWriter::new(),
            running: false,
            next_transport: 0,
            last_broadcast: 0,
            last_heartbeat: 0,
        }
    }

    /// Probe the hubs and size the activity log. Returns the zero-based
    /// indices of the hubs that came up.
    pub fn start(&mut self, bulk: &mut dyn BulkStorageProvider) -> Vec<usize> {
        let ctx = &mut self.ctx;
        ctx.pins.boot.set_low();
        ctx.pins.reset.set_low();

        let connected = ctx.hubs.probe_and_init(&mut ctx.platform);
        let stats = ctx.logger.init(bulk);

        let now = ctx.platform.millis();
        ctx.boot_ms = now;
        self.last_broadcast = now;
        self.last_heartbeat = now;
        self.running = true;

        let hubs = u16::try_from(connected.len()).unwrap_or(u16::MAX);
        let detail = format!("{} of {} hubs", connected.len(), ctx.config.max_hubs());
        ctx.log("boot", hubs, &detail);

        info!(
            "{} started: {} of {} hubs, log capacity {}",
            ctx.config.name,
            connected.len(),
            ctx.config.max_hubs(),
            stats.capacity
        );
        connected
    }

    pub fn stop(&mut self) {
        self.running = false;
        info!("agent stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn trigger(&self) -> EmergencyTrigger {
        self.ctx.estop.trigger()
    }

    pub fn context(&self) -> &HubContext<B, P> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut HubContext<B, P> {
        &mut self.ctx
    }

    /// One pass of the main loop.
    ///
    /// Order is fixed: watchdog, transport housekeeping, emergency stop,
    /// indicator LEDs, at most one command, periodic status, heartbeat.
    pub fn tick(&mut self, transports: &mut [&mut dyn Transport]) -> Result<TickReport, AgentError> {
        if !self.running {
            return Err(AgentError::NotStarted);
        }

        self.ctx.platform.feed_watchdog();
        let now = self.ctx.platform.millis();

        for transport in transports.iter_mut() {
            transport.maintain(now);
        }

        let estop = self.advance_estop(now, transports);

        self.ctx.indicators.service(&mut self.ctx.pins, now);

        let command_processed = self.drain_one(transports);

        let now = self.ctx.platform.millis();
        let status_broadcast =
            interval_elapsed(now, self.last_broadcast, self.ctx.config.timing.broadcast_interval_ms);
        if status_broadcast {
            self.last_broadcast = now;
            self.broadcast_status(transports);
        }

        let heartbeat =
            interval_elapsed(now, self.last_heartbeat, self.ctx.config.timing.heartbeat_interval_ms);
        if heartbeat {
            self.last_heartbeat = now;
            self.ctx.pins.status_led.toggle();
        }

        Ok(TickReport {
            now,
            estop,
            command_processed,
            status_broadcast,
            heartbeat,
        })
    }

    fn advance_estop(&mut self, now: u32, transports: &mut [&mut dyn Transport]) -> EstopEvent {
        let event = self.ctx.estop.advance(now);

        match event {
            EstopEvent::None => return event,
            EstopEvent::Tripped => {
                if !self.ctx.hubs.all_off(&mut self.ctx.platform) {
                    error!("emergency stop: not every hub acknowledged the cut");
                }
                self.ctx.pins.reset.set_high();
                self.ctx.estop.begin_hold();
                self.ctx.log("estop", 0, "tripped");
            }
            EstopEvent::Released => {
                self.ctx.pins.reset.set_low();
                self.ctx.log("estop", 0, "released");
            }
        }

        if let Some(entry) = self.ctx.logger.latest() {
            let message = self.writer.encode(&log_broadcast(entry));
            for transport in transports.iter_mut() {
                transport.broadcast(message);
            }
        }
        self.broadcast_status(transports);
        event
    }

    fn drain_one(&mut self, transports: &mut [&mut dyn Transport]) -> bool {
        let count = transports.len();

        for offset in 0..count {
            let i = (self.next_transport + offset) % count;
            let Some(text) = transports[i].poll_command() else {
                continue;
            };

            debug!("transport {} -> {}", i, text.trim_end());
            let outcome = self.processor.process(&mut self.ctx, text.trim_end());
            transports[i].respond(&outcome.response);

            if let Some(message) = outcome.broadcast {
                for transport in transports.iter_mut() {
                    transport.broadcast(&message);
                }
            }

            self.next_transport = (i + 1) % count;
            return true;
        }

        false
    }

    fn broadcast_status(&mut self, transports: &mut [&mut dyn Transport]) {
        if transports.is_empty() {
            return;
        }
        let snapshot = self.ctx.status_snapshot();
        let message = self.writer.encode(&status_broadcast(&snapshot));
        for transport in transports.iter_mut() {
            transport.broadcast(message);
        }
    }
}
