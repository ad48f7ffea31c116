/*!
    structs and consts for the registers of a standard slave's RAM used by this master. This should be used instead of any hardcoded register value.

    The goal of this file is to gather all physical memory registers at one place, so what you see here is exactly what you can expect in a slave.
*/

use core::fmt;
use bilge::prelude::*;
use crate::data::{self, Field};

pub mod address {
    use super::*;

    /// register of the station address, aka the fixed slave address
    /// ETG.1000.4 table 32
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// slave address alias
    /// ETG.1000.4 table 32
    pub const alias: Field<u16> = Field::simple(0x0012);
}

pub mod dl {
    use super::*;

    /// type of the slave controller, first byte of the DL information block (ETG.1000.4 table 31)
    ///
    /// every slave answers a read of it, so a broadcast read counts the slaves
    pub const ty: Field<u8> = Field::simple(0x0000);
}

/// AL (Application Layer) registers are controling the communication state of a slave
pub mod al {
    use super::*;

    pub const control: Field<AlControlRequest> = Field::simple(0x0120);
    pub const status: Field<AlStatus> = Field::simple(0x0130);
    /// the AL status code, reason of the last error indicated in [status]
    pub const error: Field<u16> = Field::simple(0x0134);
}

/// SII (Slave Information Interface) allows to retreive declarative informations about a slave (like a manifest) like product code, vendor, etc
pub mod sii {
    use super::*;

	pub const control: Field<SiiControl> = Field::simple(0x0502);
	/// register contains the word address in the slave information interface which is accessed by the next read operation
	pub const address: Field<u32> = Field::simple(0x0504);
	/// register contains the data read by the last read operation
	pub const data: Field<[u8; 4]> = Field::simple(0x0508);
}

/// FMMU (Fieldbus Memory Management Unit) is controling the mapping (copy) for a slave's physical memory from/to logical memory
pub const fmmu: FMMU = FMMU {address: 0x0600, num: 16};

/**
    SM (Sync Managers) are used for configuring and controling two distinct things:
    - mailbox exchanges (CoE, FoE, ...)
    - pdo exchanges (copying PDO data to slave's physical memory)
*/
pub mod sync_manager {
    use super::*;

	pub const interface: SyncManager = SyncManager {address: 0x0800, num: 16};
}



/// ETG.1000.6 table 9
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlControlRequest {
    /// requested state of communication
    pub state: AlMixedState,
    /// if true, the error indication of [AlStatus::error] will be reset
    pub ack: bool,
    /// request of id instead of error code in [al::error]
    pub request_id: bool,
    reserved_0: u2,
}
data::bilge_pdudata!(AlControlRequest, u8);

/// ETG.1000.6 table 12
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlStatus {
    /// current state of communication
    pub state: AlMixedState,
    /// error indication, the slave refused or left a state and reports the reason in [al::error]
    pub error: bool,
    reserved_0: u3,
}
data::bilge_pdudata!(AlStatus, u8);

/// bit set in the AL status register when a slave reports an error, and in the AL control register when the master acknowledges it
pub const AL_ERROR_FLAG: u8 = 0x10;

/**
    the current operation state on one device.

    This is the enum version, useful when communicating with one slave only

    Except [Self::Bootstrap], changing to any mode can be requested from any upper mode or from the preceding one.

    ETG.1000.6 table 9
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum AlState {
    /**
        Firmware update state, only reachable from and leaving to [Self::Init]
    */
    Bootstrap = 0x03,
    /**
        The init mode allows to set many communication registers, like the salve address, the mailbox setup, etc.

        This mode should be used at the beginning of a communication. Only registers can be used.
    */
    Init = 0x01,
    /**
        the pre operational mode allows mailbox communication, which is mendatory to configure some slaves before realtime operations. Most functions are enabled but not realtime.
    */
    PreOperational = 0x02,
    /**
        Mode allowing realtime operations, except that commands sent to the slaves via its mapping will not be executed.

        This is a kind of read-only temporary mode before [Self::Operational], that can be useful for initializing control loops on the master side while their outputs are ignored.
    */
    SafeOperational = 0x04,
    /**
        Realtime operations running

        The master has full access to the slave's effector functions. slaves might expect the master to regularly refresh its commands.
    */
    Operational = 0x08,
}

impl AlState {
    /// states of the lattice in ascending order, [Self::Bootstrap] is apart
    pub const LATTICE: [AlState; 4] = [
        AlState::Init,
        AlState::PreOperational,
        AlState::SafeOperational,
        AlState::Operational,
        ];

    /// bit code of the state as found in the AL registers
    pub fn code(self) -> u8 {self as u8}

    /// position of the state in the lattice, [Self::Bootstrap] sits below [Self::Init]
    pub fn rank(self) -> u8 {
        match self {
            AlState::Bootstrap => 0,
            AlState::Init => 1,
            AlState::PreOperational => 2,
            AlState::SafeOperational => 3,
            AlState::Operational => 4,
        }
    }

    /// the next state up in the lattice
    pub fn above(self) -> Option<AlState> {
        match self {
            AlState::Init => Some(AlState::PreOperational),
            AlState::PreOperational => Some(AlState::SafeOperational),
            AlState::SafeOperational => Some(AlState::Operational),
            AlState::Operational | AlState::Bootstrap => None,
        }
    }

    /**
        true if a slave in this state can be requested to switch to `target` in one transition

        Allowed are: staying, one step up, any number of steps down, any state to [Self::Init], and [Self::Bootstrap] only from and to [Self::Init]
    */
    pub fn can_switch(self, target: AlState) -> bool {
        match (self, target) {
            (current, target) if current == target => true,
            (_, AlState::Init) => true,
            (AlState::Init, AlState::Bootstrap) => true,
            (AlState::Bootstrap, _) | (_, AlState::Bootstrap) => false,
            (current, target) => target.rank() < current.rank() || current.above() == Some(target),
        }
    }
}

impl TryFrom<u8> for AlState {
    type Error = &'static str;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(AlState::Init),
            0x02 => Ok(AlState::PreOperational),
            0x03 => Ok(AlState::Bootstrap),
            0x04 => Ok(AlState::SafeOperational),
            0x08 => Ok(AlState::Operational),
            _ => Err("undefined slave state"),
        }
    }
}

/**
	gather the current operation states on several devices
	this struct does not provide any way to know which slave is in which state

	This is the bitfield version, useful when communicating with multiple slaves (broadcast PDUs)

    ETG.1000.6 table 9
*/
#[bitsize(4)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlMixedState {
    /// one slave at least is in [AlState::Init]
	pub init: bool,
	/// one slave at least is in [AlState::PreOperational]
	pub pre_operational: bool,
	/// one slave at least is in [AlState::SafeOperational]
	pub safe_operational: bool,
	/// one slave at least is in [AlState::Operational]
	pub operational: bool,
}

impl fmt::Display for AlMixedState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{{")?;
		for (active, mark) in [ (self.init(), "init"),
								(self.pre_operational(), "pre"),
								(self.safe_operational(), "safe"),
								(self.operational(), "op"),
								] {
			write!(f, " ")?;
			if active {
				write!(f, "{}", mark)?;
			} else {
				for _ in 0 .. mark.len() {write!(f, " ")?;}
			}
		}
		write!(f, "}}")?;
		Ok(())
	}
}

impl TryFrom<AlMixedState> for AlState {
    type Error = &'static str;
    fn try_from(state: AlMixedState) -> Result<Self, Self::Error> {
        Self::try_from(u4::from(state).value())
            .map_err(|_|  "cannot unwrap when not only 1 state in mix")
    }
}
impl From<AlState> for AlMixedState {
    fn from(state: AlState) -> Self {
        Self::from(u4::new(state.code()))
    }
}

/// ETG.1000.6 table 11
#[bitsize(16)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlError {
   ///  No error Any Current state
    NoError = 0x0000,
    ///  Unspecified error
    Unspecified = 0x0001,
    ///  No Memory
    NoMemory = 0x0002,
    ///  Invalid Device Setup
    InvalidDeviceSetup = 0x0003,
    ///  Invalid requested state change
    InvalidStateRequest = 0x0011,
    ///  Unknown requested state
    UnknownStateRequest = 0x0012,
    ///  Bootstrap not supported
    BootstrapNotSupported = 0x0013,
    ///  No valid firmware
    NoValidFirmware = 0x0014,
    ///  Invalid mailbox configuration for switching to [AlState::Bootstrap]
    InvalidMailboxConfigBoot = 0x0015,
    ///  Invalid mailbox configuration for switching to [AlState::PreOperational]
    InvalidMailboxConfigPreop = 0x0016,
    ///  Invalid sync manager configuration
    InvalidSyncConfig = 0x0017,
    ///  No valid inputs available
    NoInputsAvailable = 0x0018,
    ///  No valid outputs
    NoValidOutputs = 0x0019,
    ///  Synchronization error
    Synchronization = 0x001A,
    ///  Sync manager watchdog
    SyncWatchdog = 0x001B,
    ///  Invalid Sync Manager Types
    InvalidSyncTypes = 0x001C,
    ///  Invalid Output Configuration
    InvalidOutputConfig = 0x001D,
    ///  Invalid Input Configuration
    InvalidInputConfig = 0x001E,
    ///  Invalid Watchdog Configuration
    InvalidWatchdogConfig = 0x001F,
    ///  Slave needs cold start
    NeedColdStart = 0x0020,
    ///  Slave needs INIT
    NeedInit = 0x0021,
    ///  Slave needs PREOP
    NeedPreop = 0x0022,
    ///  Slave needs SAFEOP
    NeedSafeOp = 0x0023,
    ///  Invalid Input Mapping
    InvalidInputMapping = 0x0024,
    ///  Invalid Output Mapping
    InvalidOutputMapping = 0x0025,
    ///  Inconsistent Settings
    InconsistentSettings = 0x0026,
    ///  FreeRun not supported
    FreeRunNotSupported = 0x0027,
    ///  SyncMode not supported
    SyncModeNotSupported = 0x0028,
    ///  FreeRun needs 3Buffer Mode
    FreeRunNeedsBuffer = 0x0029,
    ///  Background Watchdog
    BackgroundWatchdog = 0x002A,
    ///  No Valid Inputs and Outputs
    NoValidIO = 0x002B,
    ///  Fatal Sync Error
    FatalSync = 0x002C,
    ///  No Sync Error
    NoSync = 0x002D,
    ///  Invalid DC SYNC Configuration
    InvalidDcConfig = 0x0030,
    ///  Invalid DC Latch Configuration
    InvalidLatchConfig = 0x0031,
    ///  Phase Link Lock Error
    PLL = 0x0032,
    ///  Distributed Clock Sync IO Error
    DCSyncIO = 0x0033,
    ///  Distributed Clock Sync Timeout Error
    DCSyncTimeout = 0x0034,
    ///  Distributed Clock Invalid Sync Cycle Time
    DCInvalidPeriod = 0x0035,
    ///  MBX_AOE
    MailboxAOE = 0x0041,
    ///  MBX_EOE
    MailboxEOE = 0x0042,
    ///  MBX_COE
    MailboxCOE = 0x0043,
    ///  MBX_FOE
    MailboxFOE = 0x0044,
    ///  MBX_SOE
    MailboxSOE = 0x0045,
    ///  MBX_VOE
    MailboxVOE = 0x004F,
    ///  raised when switching to PreOperational but SII access owner has not been switched to PDI
    EepromNoAccess = 0x0050,
    ///  EEPROM Error
    Eeprom = 0x0051,
    ///  Slave restarted locally
    SlaveRestarted = 0x0060,
    ///  Device Identification value updated
    DeviceIdentificationUpdated = 0x0061,
    ///  Application controller available
    ApplicationAvailable = 0x00F0,
}


/**
    register controling the read operations to Slave Information Interface (SII)

	ETG.1000.4 table 49
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct SiiControl {
	/// true if SII is writable
	pub write_access: bool,
	reserved_0: u4,
	/// DL-user emulates SII, cannot be set by the master
	pub eeprom_emulation: bool,
	/// false for 4 bytes per read transaction, true for 8 bytes, cannot be set by master
	pub read_size: bool,
	/// false for byte addresses, true for word addresses, cannot be set by master
	pub address_unit: bool,

	/**
		read operation requested (parameter write) or read operation busy (parameter read)
		To start a new read operation there must be a positive edge on this parameter
	*/
	pub read_operation: bool,
	/// write operation requested (parameter write) or write operation busy (parameter read)
	pub write_operation: bool,
	/// reload operation requested (parameter write) or reload operation busy (parameter read)
	pub reload_operation: bool,

	/// checksum error while reading at startup
	pub checksum_error: bool,
	/// error on reading Device Information
	pub device_info_error: bool,
	/// error on last SII request
	pub command_error: bool,
	/// error on last write operation
	pub write_error: bool,

	/// operation is ongoing
	pub busy: bool,
}
data::bilge_pdudata!(SiiControl, u16);


/// this is not a PduData but a struct transporting the address and number of FMMU registers
/// ETG.1000.4 table 57
pub struct FMMU {
    /// address of the first entry
	pub address: u16,
	/// number of entries
	pub num: u8,
}

impl FMMU {
    /// return an entry of the FMMU, `None` if the index exceeds the number of entries
    pub fn entry(&self, index: u8) -> Option<Field<FmmuEntry>>  {
        (index < self.num).then(||
            Field::simple(usize::from(self.address + u16::from(index)*0x10)))
    }
}

/**
	The fieldbus memory management unit (FMMU) converts logical addresses into physical addresses by the means of internal address. Thus, FMMUs allow one to use logical addressing for data segments that span several slave devices: one DLPDU addresses data within several arbitrarily distributed devices.

	ETG.1000.4 table 56
*/
#[bitsize(128)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct FmmuEntry {
	/// start byte in the logical memory
	pub logical_start_byte: u32,
	/// byte size of the data
	pub logical_len_byte: u16,
	/// offset of the start bit in the logical start byte
	pub logical_start_bit: u3,
	reserved_0: u5,
	/// offset of the end bit in the logical end byte
	pub logical_end_bit: u3,
	reserved_1: u5,

	/// start byte in the physical memory (set by the sync manager)
	pub physical_start_byte: u16,
	/// start bit in the physical start byte
	pub physical_start_bit: u3,
	reserved_2: u5,

	/// entity will be used for read service (slave inputs)
	pub read: bool,
	/// entity will be used for write service (slave outputs)
	pub write: bool,
	reserved_3: u6,

	/// enable this FMMU entry, so physical memory will be copied from/to logical memory on read/write
	pub enable: bool,
	reserved_4: u7,
	reserved_5: u24,
}
data::bilge_pdudata!(FmmuEntry, u128);

/// this is not a PduData but a convenience struct transporting the addresses of a sync manager
/// ETG.1000.4 table 59
pub struct SyncManager {
    /// start address of the sync manager (address of the first channel)
    pub address: u16,
    /// number of channels
    pub num: u8,
}

impl SyncManager {
    pub fn channel(&self, index: u8) -> Option<Field<SyncManagerChannel>> {
        (index < self.num).then(||
            Field::simple(usize::from(self.address + u16::from(index) * 8)))
    }
    /// the sync manager channel buffering the process outputs (master to slave)
    pub fn outputs(&self) -> Field<SyncManagerChannel>   {Field::simple(usize::from(self.address + 2*8))}
    /// the sync manager channel buffering the process inputs (slave to master)
    pub fn inputs(&self) -> Field<SyncManagerChannel>   {Field::simple(usize::from(self.address + 3*8))}
}

/**
    The Sync manager controls the access to the DL-user memory. Each channel defines a consistent area of the DL-user memory.

    Only the area location is interpreted by this master, the control bytes are left as configured by the slave configuration tool.

    ETG.1000.4 table 58
*/
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct SyncManagerChannel {
    /// start address in octets in the physical memory of the consistent DL-user memory area.
    pub address: u16,
    /// size in octets of the consistent DL-user memory area.
    pub length: u16,
    /// buffer mode and direction
    pub control: u8,
    pub status: u8,
    /// bit 0 enables the channel
    pub activate: u8,
    pub pdi_control: u8,
}
data::bilge_pdudata!(SyncManagerChannel, u64);


#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PduData;

    #[test]
    fn lattice() {
        use AlState::*;
        assert!(Init.can_switch(PreOperational));
        assert!(! Init.can_switch(SafeOperational));
        assert!(SafeOperational.can_switch(Operational));
        assert!(Operational.can_switch(PreOperational));
        assert!(Operational.can_switch(Init));
        assert!(Init.can_switch(Bootstrap));
        assert!(! PreOperational.can_switch(Bootstrap));
        assert!(! Bootstrap.can_switch(PreOperational));
        assert!(Bootstrap.can_switch(Init));
        assert!(Operational.can_switch(Operational));
    }

    #[test]
    fn codes() {
        for state in [AlState::Init, AlState::PreOperational, AlState::Bootstrap, AlState::SafeOperational, AlState::Operational] {
            assert_eq!(AlState::try_from(state.code()), Ok(state));
        }
        assert!(AlState::try_from(0x05).is_err());
        assert_eq!(AlState::try_from(AlMixedState::from(AlState::SafeOperational)), Ok(AlState::SafeOperational));
    }

    #[test]
    fn registers_packing() {
        let mut buffer = [0u8; 1];
        let mut status = AlStatus::default();
        status.set_state(AlState::Operational.into());
        status.set_error(true);
        status.pack(&mut buffer).unwrap();
        assert_eq!(buffer, [0x18]);
        let status = AlStatus::unpack(&[0x14]).unwrap();
        assert!(status.error());
        assert_eq!(AlState::try_from(status.state()), Ok(AlState::SafeOperational));

        let mut request = AlControlRequest::default();
        request.set_state(AlState::Init.into());
        request.set_ack(true);
        request.pack(&mut buffer).unwrap();
        assert_eq!(buffer, [0x11]);

        let mut entry = [0u8; 16];
        let mut fmmu_entry = FmmuEntry::default();
        fmmu_entry.set_logical_start_byte(0x0001_0004);
        fmmu_entry.set_logical_len_byte(2);
        fmmu_entry.set_physical_start_byte(0x1000);
        fmmu_entry.set_write(true);
        fmmu_entry.set_enable(true);
        fmmu_entry.pack(&mut entry).unwrap();
        assert_eq!(&entry[.. 6], &[0x04, 0x00, 0x01, 0x00, 0x02, 0x00]);
        assert_eq!(&entry[8 .. 10], &[0x00, 0x10]);
        assert_eq!(entry[11], 0b10);
        assert_eq!(entry[12], 1);

        assert_eq!(AlError::try_from(0x001bu16).ok(), Some(AlError::SyncWatchdog));
        assert_eq!(SyncManagerChannel::packed_size(), 8);
    }
}
