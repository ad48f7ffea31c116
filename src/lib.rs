/*!
    Cyclic EtherCAT master: enumeration of the slaves, process image, cyclic exchange and supervision of the slaves states.

    The entry point is [MasterContext], owning a socket to one segment. The layers it is built upon are exposed too:

    - [socket] encapsulates ethercat frames into a medium (raw ethernet, UDP, or a simulated segment)
    - [rawmaster] sends datagrams (PDUs) and matches their answers
    - [registry] discovers the slaves and describes them
    - [image] lays out the process image and gives views on each slave's data
    - [exchange] sends and receives the cycles
    - [supervisor] drives the slaves states
    - [plc] and [controller] help writing the application driven by the cycles
*/

#![allow(non_upper_case_globals)]

pub mod socket;
pub mod data;
pub mod rawmaster;
pub mod registers;
pub mod error;
pub mod config;
pub mod slave;
pub mod sii;
pub mod registry;
pub mod image;
pub mod exchange;
pub mod supervisor;
pub mod master;
pub mod plc;
pub mod controller;

pub use crate::data::{PduData, Field};
pub use crate::socket::{EthercatSocket, UdpSocket, SimulatedSegment, SimulatedSlave};
#[cfg(target_os = "linux")]
pub use crate::socket::EthernetSocket;
pub use crate::rawmaster::{RawMaster, SlaveAddress, PduAnswer};
pub use crate::registers::AlState;
pub use crate::error::{EthercatError, EthercatResult};
pub use crate::config::MasterConfig;
pub use crate::slave::{SlaveDescriptor, SlaveIdentity, SlaveState, ProcessDataSize};
pub use crate::registry::SlaveRegistry;
pub use crate::image::{ProcessImage, ProcessImageBuilder, SlaveIOView};
pub use crate::exchange::{CyclicExchangeEngine, ExchangeResult};
pub use crate::supervisor::StateSupervisor;
pub use crate::master::MasterContext;
