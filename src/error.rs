//! definition of the general ethercat error type

use std::sync::Arc;
use thiserror::Error;
use crate::{
    registers::{AlState, AlError},
    slave::SlaveState,
    };

/**
    general object reporting an unexpected result regarding the communication with the ethercat segment

    Its variants are meant to help finding the cause responsible for the problem and how to deal with it. Variants carrying a `slave` field report the position of the slave in the [crate::SlaveRegistry].
*/
#[derive(Error, Clone, Debug)]
pub enum EthercatError {
    /// error caused by communication support, these errors are exterior to this library
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// the link could not be opened
    #[error("error opening interface {link}: {reason}")]
    Connection {
        link: String,
        reason: Arc<std::io::Error>,
    },

    /// slaves could not be counted or identified on the segment
    #[error("enumeration failed: {0}")]
    Enumeration(&'static str),

    /// the segment answered but no slave is present
    #[error("no slaves found on the segment")]
    NoSlavesFound,

    /// the process image could not be built or mapped on the slaves
    #[error("configuration error: {0}")]
    Configuration(&'static str),

    /// a cycle did not come back complete in time, inputs of that cycle are unreliable
    ///
    /// this is not fatal, the caller decides whether to retry on the next cycle
    #[error("exchange degraded: working counter {working_counter} out of {expected}")]
    ExchangeTimeout {
        working_counter: u16,
        expected: u16,
    },

    /// a slave did not reach the expected state before the deadline
    #[error("slave {slave} is in state {observed} but {expected:?} was expected")]
    StateTransitionTimeout {
        slave: usize,
        observed: SlaveState,
        expected: AlState,
    },

    /// a slave raised its fault indicator, `code` is the content of its AL status code register
    #[error("slave {slave} reports a fault in state {observed}: {}", describe(.code))]
    FaultOverlayDetected {
        slave: usize,
        observed: SlaveState,
        code: u16,
    },

    /// the requested state cannot be reached from the current state of a slave in one transition
    #[error("slave {slave} cannot switch from {from:?} to {to:?}")]
    InvalidTransition {
        slave: usize,
        from: AlState,
        to: AlState,
    },

    /// a buffer written to the process image has not the size of the destination range
    #[error("expected {expected} bytes, got {actual}")]
    LengthMismatch {
        expected: usize,
        actual: usize,
    },

    /// a slave index outside of the registry was requested
    #[error("slave index {index} out of range (segment has {count} slaves)")]
    IndexOutOfRange {
        index: usize,
        count: usize,
    },

    /// error reported by the master
    ///
    /// these errors can generally be handled and fixed by using the master differently
    #[error("master error: {0}")]
    Master(&'static str),

    /// error detected by the master in the ethercat communication
    ///
    /// these errors can generally not be fixed and the whole communication has to be restarted
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// a datagram got no answer in time, this does not compromise the communication and the operation can be retried
    #[error("timeout: {0}")]
    Timeout(&'static str),
}

/// convenient alias to simplify return annotations
pub type EthercatResult<T=()> = core::result::Result<T, EthercatError>;

impl EthercatError {
    /// true if the same operation may succeed when simply tried again
    pub fn is_retryable(&self) -> bool {
        matches!(self,
            Self::ExchangeTimeout{..}
            | Self::Timeout(_)
            | Self::Enumeration(_)
            | Self::NoSlavesFound
            )
    }
    /// position of the slave concerned by this error, if the error concerns only one slave
    pub fn slave(&self) -> Option<usize> {
        match self {
            Self::StateTransitionTimeout{slave, ..}
            | Self::FaultOverlayDetected{slave, ..}
            | Self::InvalidTransition{slave, ..}
                => Some(*slave),
            Self::IndexOutOfRange{index, ..} => Some(*index),
            _ => None,
        }
    }
}

fn describe(code: &u16) -> String {
    let code = *code;
    match AlError::try_from(code) {
        Ok(known) => format!("{:?} (0x{:04x})", known, code),
        Err(_) => format!("vendor specific (0x{:04x})", code),
    }
}

impl From<std::io::Error> for EthercatError {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl From<crate::data::PackingError> for EthercatError {
    fn from(src: crate::data::PackingError) -> Self {
        EthercatError::Protocol(match src {
            crate::data::PackingError::BadSize(_, text) => text,
            crate::data::PackingError::InvalidValue(text) => text,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::AlState;

    #[test]
    fn display() {
        let err = EthercatError::StateTransitionTimeout {
            slave: 2,
            observed: SlaveState::new(AlState::SafeOperational),
            expected: AlState::Operational,
            };
        assert_eq!(err.to_string(), "slave 2 is in state 0x04 SafeOperational but Operational was expected");

        let err = EthercatError::FaultOverlayDetected {
            slave: 0,
            observed: SlaveState::new(AlState::SafeOperational).with_fault(true),
            code: 0x001b,
            };
        assert_eq!(err.to_string(), "slave 0 reports a fault in state 0x14 SafeOperational+fault: SyncWatchdog (0x001b)");

        let err = EthercatError::FaultOverlayDetected {
            slave: 1,
            observed: SlaveState::new(AlState::Init).with_fault(true),
            code: 0x8001,
            };
        assert!(err.to_string().ends_with("vendor specific (0x8001)"));
    }

    #[test]
    fn classification() {
        assert!(EthercatError::ExchangeTimeout{working_counter: 0, expected: 3}.is_retryable());
        assert!(EthercatError::NoSlavesFound.is_retryable());
        assert!(! EthercatError::Configuration("too big").is_retryable());
        assert_eq!(EthercatError::IndexOutOfRange{index: 4, count: 3}.slave(), Some(4));
        assert_eq!(EthercatError::Master("busy").slave(), None);

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        assert!(matches!(EthercatError::from(io), EthercatError::Io(_)));
    }
}
