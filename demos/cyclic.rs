//! bring a segment to operational and run cycles at a fixed period, with realtime priority
//!
//! usage: `cargo run --example cyclic -- [link] [cycles]`, the link defaults to a simulated segment
//!
//! outputs of every slave are incremented at each cycle, the inputs are printed when they change

#[cfg(target_os = "linux")]
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::time::{Duration, Instant};
    use futures::stream::StreamExt;
    use log::warn;
    use etherplc::{
        MasterContext, MasterConfig, AlState,
        controller::{Controller, RunState},
        };

    env_logger::init();
    let mut args = std::env::args().skip(1);
    let link = args.next().unwrap_or_else(|| "sim:3".to_owned());
    let cycles: usize = args.next().map(|text| text.parse()).transpose()?.unwrap_or(1000);
    let period = Duration::from_millis(1);

    // the cycle runs in this thread, realtime scheduling needs privileges so it is only attempted
    if let Err(err) = thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max) {
        warn!("cannot raise thread priority: {:?}", err);
    }
    if let Err(err) = ioprio::set_priority(
            ioprio::Target::Process(ioprio::Pid::this()),
            ioprio::Priority::new(ioprio::Class::Realtime(ioprio::RtPriorityLevel::highest())),
            ) {
        warn!("cannot raise io priority: {:?}", err);
    }

    let mut master = MasterContext::open(&link, MasterConfig::default())?;
    master.enumerate().await?;
    master.negotiate_from_sync_managers().await?;
    let image = master.configure(0, 1024).await?;
    println!("process image: {} bytes", image.len());

    let timeout = master.config().state_timeout;
    master.supervisor().walk(AlState::SafeOperational, timeout).await?;
    master.supervisor().transition(AlState::Operational, timeout).await?;
    println!("segment in {}", master.bus_state());

    let start = Instant::now();
    let mut controller = Controller::new(start, Duration::from_millis(10), Duration::from_millis(10));
    controller.fire(etherplc::controller::Trigger::Initialise, start)?;
    controller.bump(start);

    let mut interval = tokio_timerfd::Interval::new_interval(period)?;
    let mut previous = Vec::new();
    let mut degraded = 0;
    for cycle in 0 .. cycles {
        match interval.next().await {
            Some(tick) => tick?,
            None => break,
        }
        let now = Instant::now();
        if controller.tick(now) == RunState::Running {
            for slave in 0 .. master.registry().len() {
                let view = master.view(slave)?;
                view.write(&vec![cycle as u8; view.output_len()])?;
            }
        }
        if cycle == cycles - cycles / 10 {
            controller.bump(now);
        }

        let result = master.exchange(0, master.config().cycle_timeout).await?;
        if let Err(err) = result.check() {
            degraded += 1;
            warn!("cycle {}: {}", cycle, err);
            continue
        }
        let inputs = master.image()?.inputs();
        if inputs != previous {
            println!("cycle {}: inputs {:?}", cycle, inputs);
            previous = inputs;
        }
    }
    println!("{} cycles, {} degraded, controller {}", cycles, degraded, controller.state());

    master.supervisor().recover(timeout).await?;
    master.close();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("this demo relies on timerfd and is only available on linux");
}
