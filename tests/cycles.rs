use core::time::Duration;
use etherplc::{
    MasterContext, MasterConfig, EthercatError, AlState, SlaveState,
    SimulatedSegment, SimulatedSlave,
    };

async fn master(segment: &SimulatedSegment, state: AlState) -> MasterContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut master = MasterContext::new(Box::new(segment.clone()), MasterConfig::default());
    master.enumerate().await.unwrap();
    master.negotiate_from_sync_managers().await.unwrap();
    master.configure(0, 1024).await.unwrap();
    master.supervisor().walk(state, master.config().state_timeout).await.unwrap();
    master
}

fn timeout() -> Duration {
    MasterConfig::default().cycle_timeout
}

#[tokio::test(start_paused = true)]
async fn loopback() {
    let segment = SimulatedSegment::new([
        SimulatedSlave::new(2, 0x0af9_3052, "EL2809").with_outputs(16),
        SimulatedSlave::new(2, 0x0c1e_3052, "EL1809").with_inputs(16),
        ]);
    // the outputs of the first slave are connected to the inputs of the second one
    segment.wire(0, 0, 1, 0, 2);
    let master = master(&segment, AlState::Operational).await;

    let image = master.image().unwrap();
    assert_eq!(image.outputs_len(), 2);
    assert_eq!(image.inputs_len(), 2);

    master.view(0).unwrap().write(&[0xab, 0xcd]).unwrap();
    let result = master.exchange(0, timeout()).await.unwrap();
    assert_eq!(result.working_counter, 2);
    assert_eq!(result.expected, 2);
    // one write and one read on the datagram
    assert_eq!(result.raw_counter, 3);
    assert_eq!(result.raw_expected, 3);
    assert!(result.is_complete());

    assert_eq!(segment.outputs(0, 2), [0xab, 0xcd]);
    assert_eq!(master.view(1).unwrap().read(), [0xab, 0xcd]);
    assert_eq!(master.image().unwrap().inputs(), [0xab, 0xcd]);
    // outputs are kept between cycles
    assert_eq!(master.view(0).unwrap().written(), [0xab, 0xcd]);
}

#[tokio::test(start_paused = true)]
async fn inputs() {
    let segment = SimulatedSegment::generic(3);
    let master = master(&segment, AlState::Operational).await;
    for slave in 0 .. 3 {
        segment.set_inputs(slave, 0, &[0x10 + slave as u8]);
    }
    let result = master.exchange(0, timeout()).await.unwrap().check().unwrap();
    assert_eq!(result.working_counter, 3);
    assert_eq!(result.raw_counter, 9);
    assert!(usize::from(result.working_counter) <= master.registry().len());

    let mut buffer = [0];
    for slave in 0 .. 3 {
        master.view(slave).unwrap().read_into(&mut buffer).unwrap();
        assert_eq!(buffer, [0x10 + slave as u8]);
    }
    assert!(matches!(
        master.view(0).unwrap().read_into(&mut [0; 2]),
        Err(EthercatError::LengthMismatch {expected: 1, actual: 2}),
        ));
    assert!(matches!(
        master.view(3),
        Err(EthercatError::IndexOutOfRange {index: 3, count: 3}),
        ));
}

#[tokio::test(start_paused = true)]
async fn outputs_length() {
    let segment = SimulatedSegment::generic(2);
    let master = master(&segment, AlState::Operational).await;
    let view = master.view(1).unwrap();
    assert!(matches!(
        view.write(&[1, 2]),
        Err(EthercatError::LengthMismatch {expected: 1, actual: 2}),
        ));
    // nothing was written
    assert_eq!(view.written(), [0]);
}

#[tokio::test(start_paused = true)]
async fn safe_operational() {
    let segment = SimulatedSegment::generic(2);
    let master = master(&segment, AlState::SafeOperational).await;
    segment.set_inputs(1, 0, &[0x5a]);
    master.view(0).unwrap().write(&[0xff]).unwrap();

    let result = master.exchange(0, timeout()).await.unwrap();
    // inputs are exchanged but outputs are not applied, so no slave did its whole part
    assert_eq!(result.raw_counter, 2);
    assert_eq!(result.raw_expected, 6);
    assert_eq!(result.working_counter, 0);
    assert_eq!(result.expected, 2);
    assert!(matches!(
        result.check(),
        Err(EthercatError::ExchangeTimeout {working_counter: 0, expected: 2}),
        ));
    assert_eq!(master.view(1).unwrap().read(), [0x5a]);
    assert_eq!(segment.outputs(0, 1), [0]);
}

#[tokio::test(start_paused = true)]
async fn degraded_cycle() {
    let segment = SimulatedSegment::generic(2);
    let master = master(&segment, AlState::Operational).await;
    segment.set_inputs(0, 0, &[1]);
    assert!(master.exchange(0, timeout()).await.unwrap().is_complete());
    assert_eq!(master.view(0).unwrap().read(), [1]);

    segment.set_drop_replies(true);
    segment.set_inputs(0, 0, &[2]);
    let result = master.exchange(0, timeout()).await.unwrap();
    assert!(result.timed_out);
    assert_eq!(result.working_counter, 0);
    assert!(result.check().unwrap_err().is_retryable());
    // inputs of a lost cycle are not taken
    assert_eq!(master.view(0).unwrap().read(), [1]);

    // the next cycle is not disturbed
    segment.set_drop_replies(false);
    assert!(master.exchange(0, timeout()).await.unwrap().is_complete());
    assert_eq!(master.view(0).unwrap().read(), [2]);
}

#[tokio::test(start_paused = true)]
async fn single_flight() {
    let segment = SimulatedSegment::generic(2);
    let master = master(&segment, AlState::Operational).await;

    assert!(matches!(master.receive_cycle(0, timeout()).await, Err(EthercatError::Master(_))));
    master.send_cycle(0).await.unwrap();
    assert!(matches!(master.send_cycle(0).await, Err(EthercatError::Master(_))));
    assert!(master.receive_cycle(0, timeout()).await.unwrap().is_complete());
    assert!(matches!(master.receive_cycle(0, timeout()).await, Err(EthercatError::Master(_))));

    // a reception given up by the caller still leaves the cycle to receive
    segment.set_drop_replies(true);
    master.send_cycle(0).await.unwrap();
    let given_up = tokio::time::timeout(
        Duration::from_micros(100),
        master.receive_cycle(0, Duration::from_secs(1)),
        ).await;
    assert!(given_up.is_err());
    assert!(matches!(master.send_cycle(0).await, Err(EthercatError::Master(_))));
    assert!(master.receive_cycle(0, timeout()).await.unwrap().timed_out);
    segment.set_drop_replies(false);
    master.send_cycle(0).await.unwrap();
    assert!(master.receive_cycle(0, timeout()).await.unwrap().is_complete());
}

#[tokio::test(start_paused = true)]
async fn counter_bounded_by_slaves() {
    let segment = SimulatedSegment::new([
        SimulatedSlave::new(2, 0x0af9_3052, "EL2809").with_outputs(16),
        SimulatedSlave::new(2, 0x0c1e_3052, "EL1809").with_inputs(16),
        SimulatedSlave::new(2, 0x0000_0001, "EK1100"),
        SimulatedSlave::new(2, 0x0001_0000, "generic io").with_inputs(8).with_outputs(8),
        ]);
    let master = master(&segment, AlState::Operational).await;
    let slaves = master.registry().len();
    for _ in 0 .. 3 {
        let result = master.exchange(0, timeout()).await.unwrap();
        assert!(result.is_complete());
        assert!(usize::from(result.working_counter) <= slaves);
        assert!(usize::from(result.expected) <= slaves);
        // the coupler has no process data and takes no part in the cycle
        assert_eq!(result.expected, 3);
        assert_eq!(result.raw_counter, 2 + 1 + 3);
    }
    segment.set_drop_replies(true);
    let result = master.exchange(0, timeout()).await.unwrap();
    assert_eq!((result.working_counter, result.raw_counter), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn supervision_during_cycles() {
    let segment = SimulatedSegment::generic(3);
    let master = master(&segment, AlState::Operational).await;
    let supervisor = master.supervisor();
    for round in 0 .. 20u8 {
        segment.set_inputs(2, 0, &[round]);
        master.send_cycle(0).await.unwrap();
        let (cycle, states, check) = tokio::join!(
            master.receive_cycle(0, timeout()),
            supervisor.read_states(),
            supervisor.check_state(AlState::Operational, master.config().state_timeout),
            );
        assert!(cycle.unwrap().is_complete());
        assert!(states.unwrap().iter().all(|&state| state == SlaveState::new(AlState::Operational)));
        check.unwrap();
        assert_eq!(master.view(2).unwrap().read(), [round]);
    }
    assert_eq!(master.bus_state(), SlaveState::new(AlState::Operational));
}

#[tokio::test(start_paused = true)]
async fn groups() {
    let _ = env_logger::builder().is_test(true).try_init();
    let segment = SimulatedSegment::generic(2);
    let mut master = MasterContext::new(Box::new(segment.clone()), MasterConfig::default());
    master.enumerate().await.unwrap();
    master.negotiate_from_sync_managers().await.unwrap();

    assert!(matches!(master.image(), Err(EthercatError::Master(_))));
    assert!(matches!(master.send_cycle(0).await, Err(EthercatError::Master(_))));

    let image = master.configure(1, 1024).await.unwrap();
    assert_eq!(image.generation(), 1);
    assert_eq!(image.logical_address(), 0x0001_0000);
    assert!(matches!(master.exchange(0, timeout()).await, Err(EthercatError::Master(_))));

    master.supervisor().walk(AlState::Operational, master.config().state_timeout).await.unwrap();
    segment.set_inputs(1, 0, &[0x33]);
    assert!(master.exchange(1, timeout()).await.unwrap().is_complete());
    assert_eq!(master.view(1).unwrap().read(), [0x33]);

    // a new configuration starts from a blank image
    let image = master.configure(1, 1024).await.unwrap();
    assert_eq!(image.generation(), 2);
    assert_eq!(image.inputs(), [0, 0]);
    assert!(master.exchange(1, timeout()).await.unwrap().is_complete());
    assert_eq!(master.view(1).unwrap().read(), [0x33]);
}

#[tokio::test(start_paused = true)]
async fn ceiling() {
    let _ = env_logger::builder().is_test(true).try_init();
    let segment = SimulatedSegment::generic(4);
    let mut master = MasterContext::new(Box::new(segment.clone()), MasterConfig::default());
    master.enumerate().await.unwrap();
    master.negotiate_from_sync_managers().await.unwrap();
    assert!(matches!(master.configure(0, 7).await, Err(EthercatError::Configuration(_))));
    assert!(master.image().is_err());
    assert_eq!(master.configure(0, 8).await.unwrap().len(), 8);
}
