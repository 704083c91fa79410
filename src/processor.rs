//! Command processor.
//!
//! Takes one command line at a time and always produces exactly one response.
//! Checks run in a fixed order: parse and field types, index ranges, the
//! emergency-stop gate, then the connected check, and only then the action.

use crate::agent::HubContext;
use crate::config_store::{validate_hostname, ConfigStore, StoreError};
use crate::hal::{wait_serviced, I2cBus, OutputPin, Platform};
use crate::hub::{port_to_hub, port_to_index, PowerLevel};
use crate::protocol::{
    error_response, ok_response, status_broadcast, CommandError, HubChange, IndicatorAction,
    IndicatorId, PortAction, Request, ResetAction, ResponseWriter, COMMAND_KINDS,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Upper bound on entries returned by one `log` command.
pub const MAX_LOG_EXPORT: u16 = 100;

const ESTOP_ACTIVE: &str = "emergency stop active";
const NOT_CONNECTED: &str = "not connected";

/// Result of one processed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub response: String,
    /// Pushed to every broadcast subscriber when set.
    pub broadcast: Option<String>,
}

struct Executed {
    context: Value,
    target: u16,
    detail: String,
    broadcast: bool,
}

impl Executed {
    fn new(context: Value, target: u16, detail: impl Into<String>) -> Self {
        Self {
            context,
            target,
            detail: detail.into(),
            broadcast: false,
        }
    }

    fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }
}

#[derive(Debug, Default)]
pub struct CommandProcessor {
    writer: ResponseWriter,
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process<B, P>(&mut self, ctx: &mut HubContext<B, P>, text: &str) -> Outcome
    where
        B: I2cBus,
        P: Platform,
    {
        ctx.commands = ctx.commands.wrapping_add(1);
        let now = ctx.platform.millis();
        let pulse_ms = ctx.config.timing.activity_pulse_ms;
        ctx.indicators.pulse(&mut ctx.pins, IndicatorId::Activity, now, pulse_ms);

        let (kind, target, result) = match Request::parse(text) {
            Ok(request) => (request.kind(), target_of(&request), execute(ctx, &request)),
            Err(e) => ("invalid", 0, Err(e)),
        };

        match result {
            Ok(done) => {
                debug!("{} ok: {}", kind, done.detail);
                ctx.log(kind, done.target, &done.detail);
                let response = self.writer.encode(&ok_response(kind, done.context)).to_string();
                let broadcast = done
                    .broadcast
                    .then(|| self.writer.encode(&status_broadcast(&ctx.status_snapshot())).to_string());
                Outcome { response, broadcast }
            }
            Err(error) => {
                warn!("{} rejected: {} ({})", kind, error, error.code());
                let now = ctx.platform.millis();
                ctx.indicators.pulse(&mut ctx.pins, IndicatorId::Error, now, pulse_ms);
                ctx.log(kind, target, error.code());
                Outcome {
                    response: self.writer.encode(&error_response(&error)).to_string(),
                    broadcast: None,
                }
            }
        }
    }
}

fn target_of(request: &Request) -> u16 {
    match request {
        Request::Port { port, .. } => *port,
        Request::Hub { hub, .. } => *hub,
        _ => 0,
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), CommandError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CommandError::OutOfRange { field, value, min, max })
    }
}

/// Index and pulse bounds that depend on the board.
fn check_ranges<B: I2cBus, P: Platform>(
    ctx: &HubContext<B, P>,
    request: &Request,
) -> Result<(), CommandError> {
    match *request {
        Request::Port { port, .. } => {
            check_range("port", u64::from(port), 1, ctx.config.total_ports() as u64)
        }
        Request::Hub { hub, .. } => check_range("hub", u64::from(hub), 1, ctx.config.max_hubs() as u64),
        Request::Reset(ResetAction::Pulse(ms)) => {
            check_range("pulse", u64::from(ms), 1, u64::from(ctx.config.max_pulse_ms))
        }
        _ => Ok(()),
    }
}

fn gate<B: I2cBus, P: Platform>(ctx: &HubContext<B, P>, request: &Request) -> Result<(), CommandError> {
    if !request.is_mutating() || !ctx.estop.is_active() {
        return Ok(());
    }
    let target = match *request {
        Request::Port { port, .. } => format!("port {port}"),
        Request::Hub { hub, .. } => format!("hub {hub}"),
        _ => request.kind().to_string(),
    };
    Err(CommandError::unavailable(target, ESTOP_ACTIVE))
}

fn require_connected<B: I2cBus, P: Platform>(
    ctx: &HubContext<B, P>,
    hub: usize,
) -> Result<(), CommandError> {
    if ctx.hubs.is_connected(hub) {
        Ok(())
    } else {
        Err(CommandError::unavailable(format!("hub {}", hub + 1), NOT_CONNECTED))
    }
}

fn hardware<B: I2cBus, P: Platform>(ctx: &HubContext<B, P>, hub: usize) -> CommandError {
    let address = ctx.hubs.hub(hub).map_or(0, |h| h.address());
    CommandError::Hardware(format!("hub {} at 0x{:02x}", hub + 1, address))
}

fn execute<B: I2cBus, P: Platform>(
    ctx: &mut HubContext<B, P>,
    request: &Request,
) -> Result<Executed, CommandError> {
    check_ranges(ctx, request)?;
    gate(ctx, request)?;

    match *request {
        Request::Port { port, action } => set_port(ctx, port, action),
        Request::Hub { hub, change } => hub_command(ctx, hub, change),
        Request::AllOff => all_off(ctx),
        Request::Boot { state } => {
            ctx.pins.boot.set_level(state);
            Ok(Executed::new(json!({ "state": state }), 0, on_off(state)))
        }
        Request::Reset(action) => reset(ctx, action),
        Request::Led { led, action } => Ok(led_command(ctx, led, action)),
        Request::Config { ref wifi, ref mdns } => config(ctx, wifi.as_ref(), mdns.as_deref()),
        Request::Log { count } => {
            let count = count.unwrap_or(ctx.config.timing.log_export_max).min(MAX_LOG_EXPORT);
            let budget = ctx.config.timing.log_export_budget_ms;
            let export = ctx.logger.export(&mut ctx.platform, usize::from(count), budget);
            let detail = format!("{} entries", export.returned);
            Ok(Executed::new(json!(export), 0, detail))
        }
        Request::Status => Ok(Executed::new(json!(ctx.status_snapshot()), 0, "")),
        Request::Ping => Ok(Executed::new(json!({ "reply": "pong" }), 0, "")),
        Request::Help => Ok(Executed::new(json!({ "commands": COMMAND_KINDS }), 0, "")),
    }
}

fn set_port<B: I2cBus, P: Platform>(
    ctx: &mut HubContext<B, P>,
    port: u16,
    action: PortAction,
) -> Result<Executed, CommandError> {
    let port_num = usize::from(port);
    let (hub, index) = (port_to_hub(port_num), port_to_index(port_num));
    require_connected(ctx, hub)?;

    let written = match action {
        PortAction::Power(level) => ctx.hubs.set_port_power(hub, index, level, &mut ctx.platform),
        PortAction::Enable(enable) => ctx.hubs.set_port(hub, index, enable, &mut ctx.platform),
    };
    if !written {
        return Err(hardware(ctx, hub));
    }

    let level = ctx.hubs.port_power(port_num).unwrap_or(PowerLevel::Off);
    let enabled = ctx.hubs.hub(hub).is_some_and(|h| h.port_enabled(index));
    Ok(Executed::new(
        json!({ "port": port, "power": level, "enabled": enabled }),
        port,
        level.as_str(),
    )
    .broadcast())
}

fn hub_command<B: I2cBus, P: Platform>(
    ctx: &mut HubContext<B, P>,
    hub_num: u16,
    change: Option<HubChange>,
) -> Result<Executed, CommandError> {
    let hub = usize::from(hub_num) - 1;
    require_connected(ctx, hub)?;

    let detail = match change {
        None => "query".to_string(),
        Some(change) => {
            let platform = &mut ctx.platform;
            let (written, detail) = match change {
                HubChange::Led(on) => (ctx.hubs.set_hub_led(hub, on, platform), format!("led {}", on_off(on))),
                HubChange::Power(high) => (
                    ctx.hubs.set_hub_power(hub, high, platform),
                    format!("power {}", if high { "high" } else { "low" }),
                ),
                HubChange::Usbc(on) => (ctx.hubs.set_hub_vbus(hub, on, platform), format!("usbc {}", on_off(on))),
                HubChange::State(on) => (ctx.hubs.set_hub_ports(hub, on, platform), format!("ports {}", on_off(on))),
            };
            if !written {
                return Err(hardware(ctx, hub));
            }
            detail
        }
    };

    let snapshot = ctx.hubs.hub(hub).map(|h| h.snapshot());
    let done = Executed::new(json!(snapshot), hub_num, detail);
    Ok(if change.is_some() { done.broadcast() } else { done })
}

fn all_off<B: I2cBus, P: Platform>(ctx: &mut HubContext<B, P>) -> Result<Executed, CommandError> {
    let all_written = ctx.hubs.all_off(&mut ctx.platform);

    ctx.pins.reset.set_high();
    wait_serviced(&mut ctx.platform, ctx.config.timing.alloff_reset_pulse_ms);
    ctx.pins.reset.set_low();

    if !all_written {
        return Err(CommandError::Hardware("one or more hubs".into()));
    }
    let hubs = ctx.hubs.connected_count();
    Ok(Executed::new(json!({ "hubs": hubs }), 0, format!("{hubs} hubs")).broadcast())
}

fn reset<B: I2cBus, P: Platform>(
    ctx: &mut HubContext<B, P>,
    action: ResetAction,
) -> Result<Executed, CommandError> {
    match action {
        ResetAction::Level(state) => {
            ctx.pins.reset.set_level(state);
            Ok(Executed::new(json!({ "state": state }), 0, on_off(state)))
        }
        ResetAction::Pulse(ms) => {
            ctx.pins.reset.set_high();
            wait_serviced(&mut ctx.platform, ms);
            ctx.pins.reset.set_low();
            Ok(Executed::new(json!({ "pulse": ms }), 0, format!("pulse {ms}ms")))
        }
    }
}

fn led_command<B: I2cBus, P: Platform>(
    ctx: &mut HubContext<B, P>,
    led: IndicatorId,
    action: IndicatorAction,
) -> Executed {
    match action {
        IndicatorAction::Blink => {
            let now = ctx.platform.millis();
            let length = ctx.config.timing.activity_pulse_ms;
            ctx.indicators.pulse(&mut ctx.pins, led, now, length);
        }
        IndicatorAction::On | IndicatorAction::Off | IndicatorAction::Toggle => {
            ctx.indicators.cancel(led);
            let pin = ctx.pins.led_mut(led);
            match action {
                IndicatorAction::On => pin.set_high(),
                IndicatorAction::Off => pin.set_low(),
                _ => pin.toggle(),
            }
        }
    }

    let level = ctx.pins.led_mut(led).level();
    Executed::new(
        json!({ "led": led, "action": action, "level": level }),
        0,
        format!("{} {}", led.as_str(), action.as_str()),
    )
}

fn config<B: I2cBus, P: Platform>(
    ctx: &mut HubContext<B, P>,
    wifi: Option<&crate::config_store::WifiCredentials>,
    mdns: Option<&str>,
) -> Result<Executed, CommandError> {
    // validate both before touching the store
    if let Some(credentials) = wifi {
        credentials.validate().map_err(store_error)?;
    }
    if let Some(name) = mdns {
        validate_hostname(name).map_err(store_error)?;
    }

    let mut updated = Vec::new();
    if let Some(credentials) = wifi {
        ctx.store.set_wifi(credentials.clone()).map_err(store_error)?;
        updated.push("wifi");
    }
    if let Some(name) = mdns {
        ctx.store.set_hostname(name).map_err(store_error)?;
        updated.push("mdns");
    }

    let wifi = ctx.store.wifi().map(|w| {
        json!({ "ssid": w.ssid, "has_password": !w.password.is_empty() })
    });
    let detail = if updated.is_empty() {
        "query".to_string()
    } else {
        updated.join(",")
    };
    Ok(Executed::new(
        json!({ "wifi": wifi, "hostname": ctx.store.hostname(), "updated": updated }),
        0,
        detail,
    ))
}

fn store_error(error: StoreError) -> CommandError {
    match error {
        StoreError::InvalidSsid => CommandError::invalid("wifi", "ssid of 1..=32 bytes"),
        StoreError::InvalidPassword => {
            CommandError::invalid("wifi", "password empty or 8..=63 bytes")
        }
        StoreError::InvalidHostname => CommandError::invalid("mdns", "1..=32 chars of a-z, 0-9, -"),
        StoreError::Backend(reason) => CommandError::Hardware(reason),
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
