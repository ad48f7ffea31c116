use etherplc::{
    MasterContext, MasterConfig, EthercatError, AlState, SlaveState, ProcessDataSize,
    SimulatedSegment, SimulatedSlave,
    };

fn master(segment: &SimulatedSegment, config: MasterConfig) -> MasterContext {
    let _ = env_logger::builder().is_test(true).try_init();
    MasterContext::new(Box::new(segment.clone()), config)
}

fn coupler_and_terminals() -> SimulatedSegment {
    SimulatedSegment::new([
        SimulatedSlave::new(0x0000_0002, 0x044c_2c52, "EK1100").with_alias(7),
        SimulatedSlave::new(0x0000_0002, 0x0c1e_3052, "EL3102").with_revision(0x0014_0000).with_serial(1234).with_inputs(3),
        SimulatedSlave::new(0x0000_0002, 0x0af9_3052, "EL2809").with_outputs(16).with_inputs(16),
        ])
}

#[tokio::test(start_paused = true)]
async fn identities() {
    let segment = coupler_and_terminals();
    let mut master = master(&segment, MasterConfig::default());
    let registry = master.enumerate().await.unwrap();

    assert_eq!(registry.len(), 3);
    let addresses = registry.iter().map(|slave| slave.configured_address()).collect::<Vec<_>>();
    assert_eq!(addresses, [0x1001, 0x1002, 0x1003]);
    let names = registry.iter().map(|slave| slave.name().to_owned()).collect::<Vec<_>>();
    assert_eq!(names, ["EK1100", "EL3102", "EL2809"]);

    let coupler = registry.get(0).unwrap();
    assert_eq!(coupler.alias_address(), 7);
    assert_eq!(coupler.identity().product, 0x044c_2c52);
    let analog = registry.get(1).unwrap();
    assert_eq!(analog.identity().revision, 0x0014_0000);
    assert_eq!(analog.identity().serial, 1234);
    assert_eq!(analog.alias_address(), 0);
    assert!(registry.iter().all(|slave| slave.state() == SlaveState::new(AlState::Init)));
    assert!(registry.iter().all(|slave| slave.size().is_none()));

    assert_eq!(registry.find_by_address(0x1003).map(|slave| slave.position()), Some(2));
}

#[tokio::test(start_paused = true)]
async fn sizes_from_sync_managers() {
    let segment = coupler_and_terminals();
    let mut master = master(&segment, MasterConfig::default());
    master.enumerate().await.unwrap();
    // a slave configured beforehand keeps its sizes
    master.registry().negotiate(2, ProcessDataSize::new(8, 8)).unwrap();
    master.negotiate_from_sync_managers().await.unwrap();

    let sizes = master.registry().iter().map(|slave| slave.size().unwrap()).collect::<Vec<_>>();
    assert_eq!(sizes, [
        ProcessDataSize::new(0, 0),
        // sync managers are byte sized
        ProcessDataSize::new(8, 0),
        ProcessDataSize::new(8, 8),
        ]);
    assert!(matches!(
        master.registry().negotiate(0, ProcessDataSize::new(8, 0)),
        Err(EthercatError::Configuration(_)),
        ));
}

#[tokio::test(start_paused = true)]
async fn empty_segment() {
    let segment = SimulatedSegment::generic(0);
    let mut master = master(&segment, MasterConfig::default());
    let err = master.enumerate().await.unwrap_err();
    assert!(matches!(err, EthercatError::NoSlavesFound));
    assert!(err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn too_many_slaves() {
    let segment = SimulatedSegment::generic(5);
    let mut master = master(&segment, MasterConfig::default().with_max_slaves(4));
    assert!(matches!(master.enumerate().await, Err(EthercatError::Enumeration(_))));
}

#[tokio::test(start_paused = true)]
async fn silent_segment() {
    let segment = SimulatedSegment::generic(2);
    segment.set_drop_replies(true);
    let mut master = master(&segment, MasterConfig::default());
    assert!(matches!(master.enumerate().await, Err(EthercatError::Enumeration(_))));
}

#[tokio::test(start_paused = true)]
async fn out_of_range() {
    let segment = SimulatedSegment::generic(3);
    let mut master = master(&segment, MasterConfig::default());
    master.enumerate().await.unwrap();
    assert!(matches!(
        master.slave(3),
        Err(EthercatError::IndexOutOfRange {index: 3, count: 3}),
        ));
    assert!(master.slave(2).is_ok());
}

#[tokio::test]
async fn connection() {
    for link in ["udp:not-an-address", "sim:many"] {
        assert!(matches!(
            MasterContext::open(link, MasterConfig::default()),
            Err(EthercatError::Connection {..}),
            ));
    }
    let mut master = MasterContext::open("sim:2", MasterConfig::default()).unwrap();
    assert_eq!(master.enumerate().await.unwrap().len(), 2);
    master.close();
}
