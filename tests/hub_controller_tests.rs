use flashhub::config::BoardConfig;
use flashhub::hub::*;
use flashhub::sim::{SimBus, SimPlatform};

fn controller(config: &BoardConfig, bus: &SimBus) -> (HubController<SimBus>, SimPlatform) {
    (HubController::new(bus.clone(), config), SimPlatform::new())
}

#[test]
fn test_probe_marks_absent_hubs() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18, 0x1A]);
    let (mut hubs, mut platform) = controller(&config, &bus);

    let connected = hubs.probe_and_init(&mut platform);

    assert_eq!(connected, vec![0, 2]);
    assert_eq!(hubs.connected_count(), 2);
    assert!(hubs.is_connected(0));
    assert!(!hubs.is_connected(1));
    assert!(!hubs.is_connected(8));

    // init sequence: direction, polarity, output
    assert_eq!(bus.register(0x18, REG_CONFIG), Some(0x00));
    assert_eq!(bus.register(0x18, REG_POLARITY), Some(0x00));
    assert_eq!(bus.register(0x18, REG_OUTPUT), Some(hubs.safe_default()));

    // absent hubs are never written
    let before = bus.transactions();
    assert!(!hubs.set_port(1, 0, true, &mut platform));
    assert_eq!(bus.transactions(), before);
}

#[test]
fn test_no_reprobe_after_late_attach() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18]);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);

    bus.attach(0x19);
    assert!(!hubs.set_hub_led(1, true, &mut platform));
    assert!(!hubs.is_connected(1));

    // a hub that vanishes stays marked connected; writes fail instead
    bus.detach(0x18);
    let failed_before = hubs.health().failed();
    assert!(hubs.is_connected(0));
    assert!(!hubs.set_hub_led(0, true, &mut platform));
    assert_eq!(hubs.health().failed(), failed_before + 1);
}

#[test]
fn test_led_policy_on_connect() {
    let config = BoardConfig::preset("c3-mini").unwrap();
    let bus = SimBus::with_devices(&config.hub_addresses);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);

    for hub in hubs.hubs() {
        assert!(hub.led());
        assert!(hub.current_high());
        assert_eq!(bus.register(hub.address(), REG_OUTPUT), Some(0b0000_1001));
    }
}

#[test]
fn test_always_failing_bus_counts_one_failure() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18]);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);

    let failed_before = hubs.health().failed();
    let total_before = hubs.health().total();
    let transactions_before = bus.transactions();
    let clock_before = platform.now();
    bus.set_fail_always(true);

    let ok = hubs.write_register(&mut platform, 0x18, REG_OUTPUT, 0x10, DEFAULT_MAX_RETRIES);

    assert!(!ok);
    assert_eq!(bus.transactions() - transactions_before, u32::from(DEFAULT_MAX_RETRIES));
    assert_eq!(hubs.health().failed(), failed_before + 1);
    assert_eq!(hubs.health().total(), total_before + 1);
    // 10 ms then 20 ms of backoff, none after the last attempt
    assert_eq!(platform.now() - clock_before, 30);
}

#[test]
fn test_zero_retries_never_touches_bus() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18]);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);

    let failed_before = hubs.health().failed();
    let transactions_before = bus.transactions();

    assert!(!hubs.write_register(&mut platform, 0x18, REG_OUTPUT, 0x10, 0));
    assert_eq!(bus.transactions(), transactions_before);
    assert_eq!(hubs.health().failed(), failed_before + 1);

    assert!(hubs.write_register(&mut platform, 0x18, REG_OUTPUT, 0x10, 1));
    assert_eq!(bus.transactions() - transactions_before, 1);
}

#[test]
fn test_transient_failure_recovers_without_counting() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18]);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);
    let failed_before = hubs.health().failed();

    bus.fail_next(2);
    assert!(hubs.set_port(0, 1, true, &mut platform));

    assert_eq!(hubs.health().failed(), failed_before);
    assert_eq!(bus.register(0x18, REG_OUTPUT), Some(hubs.hub(0).unwrap().register()));
}

#[test]
fn test_port_power_shares_current_limit() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18]);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);

    assert!(hubs.set_port_power(0, 1, PowerLevel::Low, &mut platform));
    assert_eq!(hubs.hub(0).unwrap().register(), 0b0010_0000);

    assert!(hubs.set_port_power(0, 0, PowerLevel::High, &mut platform));
    assert_eq!(hubs.hub(0).unwrap().register(), 0b0011_0001);
    assert_eq!(hubs.port_power(1), Some(PowerLevel::High));
    // port 2 runs on the same limit bit
    assert_eq!(hubs.port_power(2), Some(PowerLevel::High));

    assert!(hubs.set_port_power(0, 1, PowerLevel::Low, &mut platform));
    assert_eq!(hubs.hub(0).unwrap().register(), 0b0011_0000);
    assert_eq!(hubs.port_power(1), Some(PowerLevel::Low));
    assert_eq!(hubs.port_power(2), Some(PowerLevel::Low));
    assert_eq!(hubs.port_power(3), Some(PowerLevel::Off));

    assert!(hubs.set_port_power(0, 0, PowerLevel::High, &mut platform));

    assert!(hubs.set_port_power(0, 1, PowerLevel::Off, &mut platform));
    assert_eq!(hubs.hub(0).unwrap().register(), 0b0001_0001);
    assert_eq!(hubs.port_power(2), Some(PowerLevel::Off));

    // out of range is a no-op, not a panic
    assert!(!hubs.set_port_power(0, 4, PowerLevel::High, &mut platform));
    assert_eq!(hubs.port_power(0), None);
    assert_eq!(hubs.port_power(33), None);
}

#[test]
fn test_hub_power_relevels_enabled_ports() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18]);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);

    hubs.set_port(0, 0, true, &mut platform);
    hubs.set_port(0, 2, true, &mut platform);
    assert_eq!(hubs.port_power(1), Some(PowerLevel::High));

    assert!(hubs.set_hub_power(0, false, &mut platform));

    let snapshot = hubs.hub(0).unwrap().snapshot();
    assert_eq!(snapshot.power, PowerLevel::Low);
    let levels: Vec<PowerLevel> = snapshot.ports.iter().map(|p| p.power).collect();
    assert_eq!(
        levels,
        vec![PowerLevel::Low, PowerLevel::Off, PowerLevel::Low, PowerLevel::Off]
    );
}

#[test]
fn test_all_off_restores_safe_default() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18, 0x19, 0x1B]);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);

    hubs.set_hub_ports(0, true, &mut platform);
    hubs.set_hub_led(1, true, &mut platform);
    hubs.set_hub_vbus(1, true, &mut platform);
    hubs.set_port_power(3, 2, PowerLevel::Low, &mut platform);
    hubs.set_hub_power(3, false, &mut platform);

    assert!(hubs.all_off(&mut platform));

    let safe = hubs.safe_default();
    for hub in hubs.hubs().iter().filter(|h| h.is_connected()) {
        assert_eq!(hub.register(), safe);
        assert_eq!(bus.register(hub.address(), REG_OUTPUT), Some(safe));
        for index in 0..4 {
            assert_eq!(hub.desired(index), PowerLevel::Off);
            assert!(!hub.port_enabled(index));
        }
    }
    assert_eq!(hubs.health().failed(), 0);
}

#[test]
fn test_hub_ports_follow_current_limit() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18]);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);

    hubs.set_hub_power(0, false, &mut platform);
    hubs.set_hub_ports(0, true, &mut platform);

    let snapshot = hubs.hub(0).unwrap().snapshot();
    assert_eq!(snapshot.hub, 1);
    assert_eq!(snapshot.power, PowerLevel::Low);
    assert!(snapshot.ports.iter().all(|p| p.enabled && p.power == PowerLevel::Low));
    assert_eq!(snapshot.ports.last().map(|p| p.port), Some(4));
}

#[test]
fn test_glitch_is_not_reconciled() {
    let config = BoardConfig::default();
    let bus = SimBus::with_devices(&[0x18]);
    let (mut hubs, mut platform) = controller(&config, &bus);
    hubs.probe_and_init(&mut platform);
    hubs.set_port(0, 0, true, &mut platform);
    let shadow = hubs.hub(0).unwrap().register();

    bus.corrupt(0x18, REG_OUTPUT, 0x00);
    assert_eq!(hubs.hub(0).unwrap().register(), shadow);

    // the next write of the shadow repairs the device
    hubs.set_hub_led(0, false, &mut platform);
    assert_eq!(bus.register(0x18, REG_OUTPUT), Some(shadow));
}
