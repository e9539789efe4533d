use std::{
    thread,
    time::{Duration, Instant},
};

use sonicsim::{
    protocol::{
        ascii::AsciiClient,
        modbus::ModbusClient,
        transport::{memory_pair, MemoryPort},
    },
    utils::wait_until,
    SimConfig, SimError, Simulator,
};

struct Bench {
    sim: Simulator,
    modbus: ModbusClient<MemoryPort>,
    ascii: AsciiClient<MemoryPort>,
}

fn bench() -> Bench {
    let mut config = SimConfig::default();
    config.modbus.provision = false;
    config.ascii.provision = false;

    let (modbus_client, modbus_server) = memory_pair(Duration::from_millis(20));
    let (ascii_client, ascii_server) = memory_pair(Duration::from_millis(20));
    let sim = Simulator::builder(config)
        .modbus_transport(modbus_server)
        .ascii_transport(ascii_server)
        .start()
        .expect("simulator should start on memory links");

    Bench {
        sim,
        modbus: ModbusClient::new(modbus_client, 2, Duration::from_millis(500)),
        ascii: AsciiClient::open(ascii_client, Duration::from_millis(100)).unwrap(),
    }
}

#[test]
fn single_channel_start_updates_status_and_aggregates() {
    let mut bench = bench();

    bench.modbus.write_holding(5, 1).unwrap();
    assert_eq!(bench.modbus.read_holdings(21, 1).unwrap()[0] & 1, 1);
    assert_eq!(bench.modbus.read_holdings(35, 1).unwrap(), vec![1]);
    assert_eq!(bench.modbus.read_holdings(36, 1).unwrap(), vec![0b0001]);

    bench.sim.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn mixed_channel_pattern_sets_count_and_mask() {
    let mut bench = bench();

    bench.modbus.write_holdings(5, &[1, 1, 0, 1]).unwrap();
    assert_eq!(bench.modbus.read_holdings(35, 2).unwrap(), vec![3, 0b1011]);

    bench.sim.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn window_edges_over_the_wire() {
    let mut bench = bench();

    bench.modbus.write_holding(0, 11).unwrap();
    bench.modbus.write_holding(80, 22).unwrap();
    assert_eq!(bench.modbus.read_holdings(0, 1).unwrap(), vec![11]);
    assert_eq!(bench.modbus.read_holdings(80, 1).unwrap(), vec![22]);
    assert!(matches!(
        bench.modbus.read_holdings(81, 1),
        Err(SimError::Address { address: 81, .. })
    ));
    assert!(matches!(
        bench.modbus.write_holding(u16::MAX, 1),
        Err(SimError::Address { .. })
    ));
    assert!(matches!(
        bench.modbus.read_holdings(70, 20),
        Err(SimError::Address { .. })
    ));
    // The server keeps answering after rejected requests.
    assert_eq!(bench.modbus.read_holdings(35, 1).unwrap(), vec![0]);

    bench.sim.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn ascii_stimulus_and_readback() {
    let mut bench = bench();

    bench.ascii.ping().unwrap();
    assert!(bench.ascii.info().unwrap().ends_with("CHANNELS=4"));

    bench.ascii.set_overload(1, true).unwrap();
    let reply = bench
        .ascii
        .command(&["READ", "START", "1"], "RESP START 1")
        .unwrap()
        .expect("READ START should be answered");
    let suffix = reply.split_whitespace().last().unwrap();
    assert!(suffix.parse::<u8>().is_ok(), "non-numeric suffix in {reply:?}");

    match bench.ascii.command(&["SET", "OVERLOAD", "9", "1"], "OK") {
        Err(SimError::Protocol(reason)) => assert_eq!(reason, "BAD_UNIT"),
        other => panic!("expected protocol error, got {other:?}"),
    }

    bench.sim.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn writes_on_one_transport_are_visible_on_the_other() {
    let mut bench = bench();

    bench.modbus.write_holding(7, 1).unwrap();
    assert!(bench.ascii.read_start(3).unwrap());
    assert!(!bench.ascii.read_start(2).unwrap());

    bench.ascii.set_overload(2, true).unwrap();
    bench.ascii.set_freq_lock(2, true).unwrap();
    assert_eq!(bench.modbus.read_holdings(22, 1).unwrap(), vec![0b110]);

    bench.ascii.set_frequency(4, 19_850).unwrap();
    bench.ascii.set_power(4, 40.5).unwrap();
    let channel = bench.sim.model().channel(4).unwrap();
    assert_eq!(channel.frequency_hz, 19_850);
    assert_eq!(channel.power_w, 40.5);

    bench.sim.model().set_amplitude(4, 20).unwrap();
    assert_eq!(bench.ascii.read_amplitude_adc(4).unwrap(), 205);

    bench.sim.model().pulse_reset(1).unwrap();
    assert!(bench.ascii.read_reset_pulse(1).unwrap());
    assert!(!bench.ascii.read_reset_pulse(1).unwrap());

    bench.sim.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn concurrent_clients_see_consistent_aggregates() {
    let Bench {
        sim,
        mut modbus,
        mut ascii,
    } = bench();
    let model = sim.model().clone();

    let writer = thread::spawn(move || {
        for i in 0..40u16 {
            let unit_offset = i % 4;
            modbus.write_holding(5 + unit_offset, (i / 4) % 2).unwrap();
            let aggregates = modbus.read_holdings(35, 2).unwrap();
            assert_eq!(aggregates[0] as u32, aggregates[1].count_ones());
        }
        modbus
    });
    for _ in 0..40 {
        ascii.read_start(1).unwrap();
        let state = model.snapshot();
        assert_eq!(state.active_count as u32, state.active_mask.count_ones());
    }
    writer.join().unwrap();

    sim.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn wait_until_observes_state_changed_by_another_client() {
    let mut bench = bench();
    let model = bench.sim.model().clone();

    let started = Instant::now();
    let toggler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        model.set_running(2, true).unwrap();
    });
    assert!(wait_until(
        || bench.ascii.read_start(2),
        Duration::from_secs(2),
        Duration::from_millis(10)
    ));
    assert!(started.elapsed() >= Duration::from_millis(30));
    toggler.join().unwrap();

    bench.sim.shutdown(Duration::from_secs(2)).unwrap();
}

#[test]
fn shutdown_is_bounded_even_mid_traffic() {
    let Bench {
        sim, mut modbus, ..
    } = bench();
    let token = sim.cancellation_token();

    let client = thread::spawn(move || {
        // Keep the server busy until it goes away; failures after cancel are expected.
        while !token.is_cancelled() {
            let _ = modbus.read_holdings(0, 10);
        }
    });
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    sim.shutdown(Duration::from_secs(1)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    client.join().unwrap();
}
