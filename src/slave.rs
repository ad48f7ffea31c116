/*!
    description of one slave of the segment, as discovered by [crate::SlaveRegistry]
*/

use core::fmt;
use std::sync::{
    OnceLock,
    atomic::{AtomicU8, Ordering},
    };
use crate::{
    registers::{AlState, AL_ERROR_FLAG},
    error::{EthercatError, EthercatResult},
    };


/**
    observed state of a slave: its position in the state lattice and the fault indicator

    The fault indicator is orthogonal to the lattice: a slave may raise it in any state. Its bit-code is the one of the AL status register, `0x18` is for instance an operational slave reporting a fault.
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SlaveState {
    pub state: AlState,
    pub fault: bool,
}
impl SlaveState {
    pub fn new(state: AlState) -> Self {
        Self {state, fault: false}
    }
    pub fn with_fault(self, fault: bool) -> Self {
        Self {fault, .. self}
    }
    /// bit-code of the state as found in the AL status register
    pub fn code(&self) -> u8 {
        self.state.code() | if self.fault {AL_ERROR_FLAG} else {0}
    }
    /// decode a state from the AL status register content
    pub fn from_code(code: u8) -> EthercatResult<Self> {
        Ok(Self {
            state: AlState::try_from(code & !AL_ERROR_FLAG)
                    .map_err(EthercatError::Protocol)?,
            fault: code & AL_ERROR_FLAG != 0,
        })
    }
}
impl From<AlState> for SlaveState {
    fn from(state: AlState) -> Self {Self::new(state)}
}
impl fmt::Display for SlaveState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:02x} {:?}", self.code(), self.state)?;
        if self.fault {
            write!(f, "+fault")?;
        }
        Ok(())
	}
}

/// identity words and name read from the slave's EEPROM
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SlaveIdentity {
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub serial: u32,
    pub name: String,
}

/// negotiated size of the process data of one slave, in bits
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessDataSize {
    /// bits produced by the slave (read by the master)
    pub input_bits: u32,
    /// bits consumed by the slave (written by the master)
    pub output_bits: u32,
}
impl ProcessDataSize {
    pub fn new(input_bits: u32, output_bits: u32) -> Self {
        Self {input_bits, output_bits}
    }
    /// bytes reserved for the inputs in the process image, a partial byte counts as a full byte
    pub fn input_bytes(&self) -> usize   {bits_to_bytes(self.input_bits)}
    /// bytes reserved for the outputs in the process image, a partial byte counts as a full byte
    pub fn output_bytes(&self) -> usize   {bits_to_bytes(self.output_bits)}
}

fn bits_to_bytes(bits: u32) -> usize {
    (bits as usize + 7) / 8
}


/**
    one slave of the segment, at a fixed position in the registry

    The identity and addresses are fixed at enumeration. The process data sizes are negotiated at most once. The state is a cache of the last observed AL status, refreshed only by the [crate::StateSupervisor].
*/
#[derive(Debug)]
pub struct SlaveDescriptor {
    position: usize,
    configured_address: u16,
    alias_address: u16,
    identity: SlaveIdentity,
    size: OnceLock<ProcessDataSize>,
    state: AtomicU8,
}
impl SlaveDescriptor {
    pub fn new(position: usize, configured_address: u16, alias_address: u16, identity: SlaveIdentity, state: SlaveState) -> Self {
        Self {
            position,
            configured_address,
            alias_address,
            identity,
            size: OnceLock::new(),
            state: AtomicU8::new(state.code()),
        }
    }
    /// index of the slave in the registry, which is its position on the segment
    pub fn position(&self) -> usize   {self.position}
    /// station address the master assigned at enumeration
    pub fn configured_address(&self) -> u16   {self.configured_address}
    /// address alias stored in the slave's EEPROM, 0 when unset
    pub fn alias_address(&self) -> u16   {self.alias_address}
    pub fn identity(&self) -> &SlaveIdentity   {&self.identity}
    pub fn name(&self) -> &str   {&self.identity.name}

    /// process data sizes, `None` until negotiated
    pub fn size(&self) -> Option<ProcessDataSize>   {self.size.get().copied()}
    /// same as [Self::size] but counting nothing for a slave not negotiated
    pub fn size_or_empty(&self) -> ProcessDataSize   {self.size().unwrap_or_default()}

    /// set the process data sizes, this can only be done once per slave
    pub fn negotiate(&self, size: ProcessDataSize) -> EthercatResult {
        self.size.set(size)
            .map_err(|_| EthercatError::Configuration("process data size already negotiated"))
    }

    /// last observed state of this slave
    pub fn state(&self) -> SlaveState {
        // only valid codes are ever stored
        SlaveState::from_code(self.state.load(Ordering::Acquire))
            .unwrap_or(SlaveState::new(AlState::Init))
    }
    pub(crate) fn set_state(&self, state: SlaveState) {
        self.state.store(state.code(), Ordering::Release);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes() {
        let state = SlaveState::from_code(0x18).unwrap();
        assert_eq!(state, SlaveState::new(AlState::Operational).with_fault(true));
        assert_eq!(state.code(), 0x18);
        assert_eq!(state.to_string(), "0x18 Operational+fault");
        assert_eq!(SlaveState::from_code(0x02).unwrap().to_string(), "0x02 PreOperational");
        assert_eq!(SlaveState::from_code(0x03).unwrap().state, AlState::Bootstrap);
        assert!(SlaveState::from_code(0x06).is_err());
    }

    #[test]
    fn sizes() {
        let size = ProcessDataSize::new(3, 0);
        assert_eq!(size.input_bytes(), 1);
        assert_eq!(size.output_bytes(), 0);
        assert_eq!(ProcessDataSize::new(16, 9).output_bytes(), 2);
    }

    #[test]
    fn negotiate_once() {
        let slave = SlaveDescriptor::new(0, 0x1001, 0, SlaveIdentity::default(), AlState::Init.into());
        assert_eq!(slave.size(), None);
        slave.negotiate(ProcessDataSize::new(8, 16)).unwrap();
        assert!(slave.negotiate(ProcessDataSize::new(1, 1)).is_err());
        assert_eq!(slave.size(), Some(ProcessDataSize::new(8, 16)));

        slave.set_state(SlaveState::new(AlState::SafeOperational).with_fault(true));
        assert_eq!(slave.state().code(), 0x14);
    }
}
