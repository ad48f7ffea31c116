/*!
    supervision of the communication states of all the slaves of a segment

    Slaves move in the lattice Init < PreOperational < SafeOperational < Operational. A transition request goes one step up or any number of steps down, Init can always be requested. Independently, a slave may raise its fault indicator, which only a request for Init with acknowledge clears.
*/

use core::time::Duration;
use futures_concurrency::future::Join;
use log::{debug, info, warn};
use tokio::time::Instant;
use crate::{
    rawmaster::RawMaster,
    registers::{self, AlState, AlControlRequest},
    registry::SlaveRegistry,
    slave::{SlaveDescriptor, SlaveState},
    config::MasterConfig,
    error::{EthercatError, EthercatResult},
    };


/**
    drives and verifies the states of every slave in a registry

    This is the only place updating the states cached in the [SlaveDescriptor]s.
*/
pub struct StateSupervisor<'a> {
    raw: &'a RawMaster,
    registry: &'a SlaveRegistry,
    config: &'a MasterConfig,
}
impl<'a> StateSupervisor<'a> {
    pub fn new(raw: &'a RawMaster, registry: &'a SlaveRegistry, config: &'a MasterConfig) -> Self {
        Self {raw, registry, config}
    }

    /**
        ask every slave to switch to `target` with one broadcast write, without waiting for the slaves to switch

        The transition is checked against the last observed state of each slave first, and refused with [EthercatError::InvalidTransition] before anything is sent. Requesting [AlState::Init] also acknowledges the slaves faults.
    */
    pub async fn request_state(&self, target: AlState) -> EthercatResult {
        for slave in self.registry {
            let from = slave.state().state;
            if ! from.can_switch(target)
                {return Err(EthercatError::InvalidTransition {slave: slave.position(), from, to: target})}
        }
        let answer = self.raw.bwr(registers::al::control, {
            let mut request = AlControlRequest::default();
            request.set_state(target.into());
            request.set_ack(target == AlState::Init);
            request
            }).await?;
        debug!("requested {:?}, {} slaves received it", target, answer.answers);
        Ok(())
    }

    /// read the state of every slave and update the registry with it
    pub async fn read_states(&self) -> EthercatResult<Vec<SlaveState>> {
        Ok(self.read_reports().await?
            .into_iter()
            .map(|(state, _)| state)
            .collect())
    }

    /**
        wait until every slave reports `target`, or `timeout` elapses

        The slaves are polled with broadcast reads, so a segment already in the target state costs exactly one datagram. A broadcast read merges the status of all slaves, so a target whose code can also result from a mix of states ([AlState::Bootstrap]) is confirmed by reading each slave. A fault reported by any slave ends the wait with [EthercatError::FaultOverlayDetected]. At the deadline the slaves are read one by one and the first one not in `target` is reported with [EthercatError::StateTransitionTimeout].
    */
    pub async fn check_state(&self, target: AlState, timeout: Duration) -> EthercatResult {
        let deadline = Instant::now() + timeout;
        loop {
            match self.raw.brd(registers::al::status).await {
                Ok(answer) => {
                    let status = answer.value;
                    if status.error() {
                        if let Some(fault) = self.find_fault().await?
                            {return Err(fault)}
                    }
                    else if usize::from(answer.answers) == self.registry.len()
                    && AlState::try_from(status.state()) == Ok(target) {
                        if target.code().is_power_of_two() {
                            for slave in self.registry {
                                slave.set_state(SlaveState::new(target));
                            }
                            info!("all {} slaves in {:?}", self.registry.len(), target);
                            return Ok(())
                        }
                        // the merged code may be several states ored together
                        let reports = self.read_reports().await?;
                        if let Some((slave, &(observed, code))) = reports.iter().enumerate()
                            .find(|(_, (state, _))| state.fault)
                            {return Err(self.fault(slave, observed, code))}
                        if reports.iter().all(|(state, _)| state.state == target) {
                            info!("all {} slaves in {:?}", self.registry.len(), target);
                            return Ok(())
                        }
                        debug!("waiting {:?}, merged status {} is a mix of states", target, status.state());
                    }
                    else {
                        debug!("waiting {:?}, slaves are in {} ({} answered)", target, status.state(), answer.answers);
                    }
                },
                Err(err) if err.is_retryable() => debug!("state poll failed: {}", err),
                Err(err) => return Err(err),
            }
            if Instant::now() + self.config.poll_interval > deadline {break}
            tokio::time::sleep(self.config.poll_interval).await;
        }

        // diagnosis
        let reports = self.read_reports().await?;
        for (slave, &(observed, code)) in reports.iter().enumerate() {
            if observed.fault {
                return Err(self.fault(slave, observed, code))
            }
            if observed.state != target {
                warn!("slave {} did not reach {:?}, it is in {}", slave, target, observed);
                return Err(EthercatError::StateTransitionTimeout {slave, observed, expected: target})
            }
        }
        Ok(())
    }

    /// request `target` and wait for all the slaves to reach it
    pub async fn transition(&self, target: AlState, timeout: Duration) -> EthercatResult {
        self.request_state(target).await?;
        self.check_state(target, timeout).await
    }

    /**
        bring the segment to `target` through every intermediate state, from the current lowest state of the segment

        Each step has its own `timeout`. Going down or to [AlState::Init] is done in one transition.
    */
    pub async fn walk(&self, target: AlState, timeout: Duration) -> EthercatResult {
        let mut current = self.registry.bus_state().state;
        if current == AlState::Bootstrap && target != AlState::Bootstrap {
            self.transition(AlState::Init, timeout).await?;
            current = AlState::Init;
        }
        if target == AlState::Bootstrap && current != AlState::Init {
            self.transition(AlState::Init, timeout).await?;
            current = AlState::Init;
        }
        if target == AlState::Bootstrap || target.rank() <= current.rank() {
            return self.transition(target, timeout).await
        }
        while current != target {
            let next = current.above()
                .ok_or(EthercatError::Master("target state is not above the segment state"))?;
            self.transition(next, timeout).await?;
            current = next;
        }
        Ok(())
    }

    /// reset all slaves to [AlState::Init], clearing their faults
    pub async fn recover(&self, timeout: Duration) -> EthercatResult {
        warn!("resetting the segment to {:?}", AlState::Init);
        self.transition(AlState::Init, timeout).await
    }

    /// state and AL status code of every slave, read concurrently
    async fn read_reports(&self) -> EthercatResult<Vec<(SlaveState, u16)>> {
        self.registry.iter()
            .map(|slave| self.read_slave(slave))
            .collect::<Vec<_>>()
            .join().await
            .into_iter()
            .collect()
    }

    async fn read_slave(&self, slave: &SlaveDescriptor) -> EthercatResult<(SlaveState, u16)> {
        let address = slave.configured_address();
        let status = self.raw.fprd(address, registers::al::status).await?.one()?;
        let state = SlaveState::new(AlState::try_from(status.state()).map_err(EthercatError::Protocol)?)
            .with_fault(status.error());
        let code = if status.error() {
            self.raw.fprd(address, registers::al::error).await?.one()?
        } else {0};
        slave.set_state(state);
        Ok((state, code))
    }

    /// first slave reporting a fault, in registry order
    async fn find_fault(&self) -> EthercatResult<Option<EthercatError>> {
        Ok(self.read_reports().await?
            .into_iter()
            .enumerate()
            .find(|(_, (state, _))| state.fault)
            .map(|(slave, (observed, code))| self.fault(slave, observed, code)))
    }

    fn fault(&self, slave: usize, observed: SlaveState, code: u16) -> EthercatError {
        let error = EthercatError::FaultOverlayDetected {slave, observed, code};
        warn!("{}", error);
        error
    }
}
