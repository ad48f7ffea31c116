use core::time::Duration;
use etherplc::{
    MasterContext, MasterConfig, EthercatError, AlState, SlaveState,
    SimulatedSegment,
    registers::{self, AlControlRequest},
    };

async fn master(segment: &SimulatedSegment) -> MasterContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut master = MasterContext::new(Box::new(segment.clone()), MasterConfig::default());
    master.enumerate().await.unwrap();
    master
}

const TIMEOUT: Duration = Duration::from_millis(10);

#[tokio::test(start_paused = true)]
async fn idempotent_check() {
    let segment = SimulatedSegment::generic(3);
    let master = master(&segment).await;
    let before = segment.frames();
    master.supervisor().check_state(AlState::Init, TIMEOUT).await.unwrap();
    assert_eq!(segment.frames() - before, 1);
}

#[tokio::test(start_paused = true)]
async fn operational() {
    let segment = SimulatedSegment::generic(3);
    let master = master(&segment).await;
    let supervisor = master.supervisor();
    supervisor.walk(AlState::SafeOperational, TIMEOUT).await.unwrap();
    assert_eq!(master.bus_state(), SlaveState::new(AlState::SafeOperational));

    supervisor.transition(AlState::Operational, TIMEOUT).await.unwrap();
    assert_eq!(master.bus_state(), SlaveState::new(AlState::Operational));
    for slave in 0 .. 3 {
        assert_eq!(segment.status(slave), Some(AlState::Operational.code()));
        assert_eq!(master.slave(slave).unwrap().state(), SlaveState::new(AlState::Operational));
    }
    let states = supervisor.read_states().await.unwrap();
    assert!(states.iter().all(|&state| state == SlaveState::new(AlState::Operational)));

    // going down is done in one step
    supervisor.walk(AlState::PreOperational, TIMEOUT).await.unwrap();
    assert_eq!(master.bus_state(), SlaveState::new(AlState::PreOperational));
}

#[tokio::test(start_paused = true)]
async fn stalled_slave() {
    let segment = SimulatedSegment::generic(3);
    segment.stall(2, AlState::SafeOperational);
    let master = master(&segment).await;
    let supervisor = master.supervisor();
    supervisor.walk(AlState::SafeOperational, TIMEOUT).await.unwrap();

    let err = supervisor.transition(AlState::Operational, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, EthercatError::StateTransitionTimeout {
        slave: 2,
        observed: SlaveState {state: AlState::SafeOperational, fault: false},
        expected: AlState::Operational,
        }));
    assert_eq!(err.slave(), Some(2));
    assert_eq!(master.slave(0).unwrap().state().state, AlState::Operational);
    assert_eq!(master.bus_state(), SlaveState::new(AlState::SafeOperational));
}

#[tokio::test(start_paused = true)]
async fn mixed_bootstrap() {
    let segment = SimulatedSegment::generic(2);
    let master = master(&segment).await;
    // only the first slave enters bootstrap, its status ored with init reads as bootstrap
    let address = master.slave(0).unwrap().configured_address();
    master.raw().fpwr(address, registers::al::control, {
        let mut request = AlControlRequest::default();
        request.set_state(AlState::Bootstrap.into());
        request
        }).await.unwrap().one().unwrap();
    assert_eq!(segment.status(0), Some(AlState::Bootstrap.code()));
    assert_eq!(segment.status(1), Some(AlState::Init.code()));

    let err = master.supervisor().check_state(AlState::Bootstrap, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, EthercatError::StateTransitionTimeout {
        slave: 1,
        observed: SlaveState {state: AlState::Init, fault: false},
        expected: AlState::Bootstrap,
        }));
    assert_eq!(master.slave(0).unwrap().state(), SlaveState::new(AlState::Bootstrap));
    assert_eq!(master.slave(1).unwrap().state(), SlaveState::new(AlState::Init));

    // once every slave is there, the check succeeds
    master.supervisor().transition(AlState::Bootstrap, TIMEOUT).await.unwrap();
    for slave in 0 .. 2 {
        assert_eq!(master.slave(slave).unwrap().state(), SlaveState::new(AlState::Bootstrap));
    }
}

#[tokio::test(start_paused = true)]
async fn fault_and_recovery() {
    let segment = SimulatedSegment::generic(3);
    let master = master(&segment).await;
    let supervisor = master.supervisor();
    supervisor.walk(AlState::SafeOperational, TIMEOUT).await.unwrap();

    segment.raise_fault(1, 0x001b);
    let err = supervisor.check_state(AlState::SafeOperational, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, EthercatError::FaultOverlayDetected {
        slave: 1,
        observed: SlaveState {state: AlState::SafeOperational, fault: true},
        code: 0x001b,
        }));
    assert!(master.bus_state().fault);

    // requests other than init are ignored by a faulted slave
    let err = supervisor.transition(AlState::Operational, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, EthercatError::FaultOverlayDetected {slave: 1, ..}));

    supervisor.recover(TIMEOUT).await.unwrap();
    assert_eq!(master.bus_state(), SlaveState::new(AlState::Init));
    assert_eq!(segment.status(1), Some(AlState::Init.code()));
}

#[tokio::test(start_paused = true)]
async fn invalid_transition() {
    let segment = SimulatedSegment::generic(2);
    let master = master(&segment).await;
    let before = segment.frames();
    let err = master.supervisor().request_state(AlState::Operational).await.unwrap_err();
    assert!(matches!(err, EthercatError::InvalidTransition {
        slave: 0,
        from: AlState::Init,
        to: AlState::Operational,
        }));
    assert_eq!(segment.frames(), before);
    assert_eq!(segment.status(0), Some(AlState::Init.code()));
}

#[tokio::test(start_paused = true)]
async fn unresponsive_segment() {
    let segment = SimulatedSegment::generic(2);
    let master = master(&segment).await;
    segment.set_drop_replies(true);
    let err = master.supervisor().transition(AlState::PreOperational, TIMEOUT).await.unwrap_err();
    assert!(err.is_retryable(), "{}", err);
}
