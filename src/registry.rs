/*!
    discovery of the slaves present on the segment, and their descriptors in bus order
*/

use log::{debug, info, warn};
use crate::{
    rawmaster::RawMaster,
    registers::{self, AlState, AlControlRequest},
    slave::{SlaveDescriptor, SlaveState, ProcessDataSize},
    sii::Sii,
    config::MasterConfig,
    error::{EthercatError, EthercatResult},
    };


/**
    ordered list of the slaves of a segment

    The order is the topological order on the segment at enumeration and stays fixed for the whole session, every offset in the process image relies on it.
*/
#[derive(Debug, Default)]
pub struct SlaveRegistry {
    slaves: Vec<SlaveDescriptor>,
}

impl SlaveRegistry {
    /**
        scan the segment and identify every slave

        - all slaves are reset to [AlState::Init] with their errors acknowledged
        - a broadcast read counts the slaves
        - each slave receives the station address `config.station_offset + position + 1`, then its alias, identity and state are read

        Fails with [EthercatError::NoSlavesFound] if the segment is empty, and with [EthercatError::Enumeration] if the scan cannot complete.
    */
    pub async fn enumerate(raw: &RawMaster, config: &MasterConfig) -> EthercatResult<Self> {
        raw.bwr(registers::al::control, {
            let mut request = AlControlRequest::default();
            request.set_state(AlState::Init.into());
            request.set_ack(true);
            request
            }).await
            .map_err(|err| lost("segment does not answer", err))?;

        let count = raw.brd(registers::dl::ty).await
            .map_err(|err| lost("segment does not answer", err))?
            .answers;
        debug!("{} slaves answered the scan", count);
        if count == 0
            {return Err(EthercatError::NoSlavesFound)}
        if usize::from(count) > config.max_slaves
            {return Err(EthercatError::Enumeration("more slaves than allowed by the configuration"))}

        let mut slaves = Vec::with_capacity(usize::from(count));
        for position in 0 .. count {
            slaves.push(Self::identify(raw, config, position).await?);
        }
        for slave in &slaves {
            info!("slave {} at {:#06x}: {:?} vendor {:#x} product {:#x} rev {:#x}, {}",
                slave.position(),
                slave.configured_address(),
                slave.name(),
                slave.identity().vendor,
                slave.identity().product,
                slave.identity().revision,
                slave.state(),
                );
        }
        Ok(Self {slaves})
    }

    /// give a station address to the slave at the given position and read its descriptor
    async fn identify(raw: &RawMaster, config: &MasterConfig, position: u16) -> EthercatResult<SlaveDescriptor> {
        let address = config.station_offset
            .checked_add(position + 1)
            .ok_or(EthercatError::Enumeration("station addresses overflow"))?;
        let fail = |err| lost("slave stopped answering during identification", err);

        raw.apwr(position, registers::address::fixed, address).await
            .and_then(|answer| answer.one())
            .map_err(fail)?;
        let alias = raw.fprd(address, registers::address::alias).await
            .and_then(|answer| answer.one())
            .map_err(fail)?;
        let identity = Sii::new(raw, address, config.sii_retries).identity().await
            .map_err(|err| lost("slave EEPROM cannot be read", err))?;
        let status = raw.fprd(address, registers::al::status).await
            .and_then(|answer| answer.one())
            .map_err(fail)?;
        let state = AlState::try_from(status.state())
            .map_err(|_| EthercatError::Enumeration("slave reports an undefined state"))?;

        Ok(SlaveDescriptor::new(
            usize::from(position),
            address,
            alias,
            identity,
            SlaveState::new(state).with_fault(status.error()),
            ))
    }

    /// registry made of already known slaves, each descriptor position must match its index
    pub fn from_descriptors(slaves: Vec<SlaveDescriptor>) -> EthercatResult<Self> {
        if slaves.iter().enumerate().any(|(index, slave)| slave.position() != index)
            {return Err(EthercatError::Configuration("slave positions must follow the registry order"))}
        Ok(Self {slaves})
    }

    /// number of slaves on the segment
    pub fn len(&self) -> usize   {self.slaves.len()}
    pub fn is_empty(&self) -> bool   {self.slaves.is_empty()}
    /// slaves in bus order
    pub fn iter(&self) -> core::slice::Iter<'_, SlaveDescriptor>   {self.slaves.iter()}

    /// slave at the given position
    pub fn get(&self, index: usize) -> EthercatResult<&SlaveDescriptor> {
        self.slaves.get(index)
            .ok_or(EthercatError::IndexOutOfRange {index, count: self.slaves.len()})
    }
    /// slave with the given station address
    pub fn find_by_address(&self, configured_address: u16) -> Option<&SlaveDescriptor> {
        self.slaves.iter().find(|slave| slave.configured_address() == configured_address)
    }

    /// set the process data sizes of a slave, see [SlaveDescriptor::negotiate]
    pub fn negotiate(&self, index: usize, size: ProcessDataSize) -> EthercatResult {
        self.get(index)?.negotiate(size)
    }

    /**
        negotiate the sizes of every slave not negotiated yet, from the lengths of its process data sync managers

        Sync manager 2 buffers the outputs and sync manager 3 the inputs, as they are left by the configuration of the slave. A disabled channel counts for no data.
    */
    pub async fn negotiate_from_sync_managers(&self, raw: &RawMaster) -> EthercatResult {
        for slave in self.slaves.iter().filter(|slave| slave.size().is_none()) {
            let address = slave.configured_address();
            let outputs = raw.fprd(address, registers::sync_manager::interface.outputs()).await?.one()?;
            let inputs = raw.fprd(address, registers::sync_manager::interface.inputs()).await?.one()?;
            let bits = |channel: registers::SyncManagerChannel|
                if channel.activate() & 1 != 0 {u32::from(channel.length()) * 8}
                else {0};
            let size = ProcessDataSize::new(bits(inputs), bits(outputs));
            debug!("slave {} exchanges {:?}", slave.position(), size);
            slave.negotiate(size)?;
        }
        Ok(())
    }

    /**
        observed state of the whole segment: the lowest state reached by the slaves, with a fault if any slave reports one

        This is computed from the states cached in the descriptors, refreshed by the [crate::StateSupervisor].
    */
    pub fn bus_state(&self) -> SlaveState {
        let state = self.slaves.iter()
            .map(|slave| slave.state().state)
            .min_by_key(|state| state.rank())
            .unwrap_or(AlState::Init);
        let fault = self.slaves.iter().any(|slave| slave.state().fault);
        SlaveState::new(state).with_fault(fault)
    }
}

impl<'a> IntoIterator for &'a SlaveRegistry {
    type Item = &'a SlaveDescriptor;
    type IntoIter = core::slice::Iter<'a, SlaveDescriptor>;
    fn into_iter(self) -> Self::IntoIter   {self.slaves.iter()}
}

fn lost(context: &'static str, err: EthercatError) -> EthercatError {
    warn!("enumeration failed: {}: {}", context, err);
    EthercatError::Enumeration(context)
}
