/*!
	low level ethercat communication functions.

	It wraps an ethercat socket to send and receive ethercat frames containing data or commands.
*/

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    };
use core::{
    future::poll_fn,
    pin::pin,
    time::Duration,
    };
use tokio::sync::Notify;
use bilge::prelude::*;
use log::{debug, warn};

use crate::{
    socket::EthercatSocket,
    data::{self, Field, PduData, Storage, Cursor},
    error::{EthercatError, EthercatResult},
    };


/// maximum frame size, currently limited to the size tolerated by its header (content size coded with 11 bits)
pub const MAX_ETHERCAT_FRAME: usize = 2050;
/// ethercat type of frames containing PDUs
const PDU_FRAME: u8 = 0x1;

/**
    low level ethercat communication functions, with no notion of slave.

    genericity allows to use a UDP socket or raw ethernet socket, see [crate::socket] for more details.

    The ethercat low level is all about PDUs: an ethercat frame intended for slaves is a PDU frame and PDU frames contain any number of PDU (Process Data Unit), each PDU is a command, acting on one of the 2 memories types:

    - **Physical Memory** (aka. registers)

      each slave has its own physical memory, commands for physical memory (`*P*`, `B*`) are addressing a specific slave, or combining the memory reads from all slaves

      The physical memory is divided into registers declared in [crate::registers]

    - **Logical Memory** (aka. fieldbus memory)

      this memory doesn't physically exist anywhere, but can be read/write using `L*`  commands with each slave contributing to the record according to the configuration set before.

      The logical memory is organized by the mapping set in the FMMU (Fieldbust Memory Management Unit)

    Every PDU sent is identified by a token. Any task waiting for an answer may take the reception of frames in charge, it then files the answers of the other tasks by token and wakes them. An answer that arrives for a token nobody waits for anymore is dropped.
*/
pub struct RawMaster {
	/// default delay before giving up an answer
	timeout: Duration,

	// socket implementation
	socket: Box<dyn EthercatSocket + Send + Sync>,
	// synchronization signal for multitask reception
	received: Notify,

	// states are locked using [std::sync::Mutex] and never held during an await
	pdu_state: Mutex<PduState>,
	// only one task at a time reads the socket
	reception: tokio::sync::Mutex<Vec<u8>>,
}
struct PduState {
	token: u8,
	pending: HashMap<u8, PduStorage>,
}
/// struct for internal use in RawMaster
struct PduStorage {
    data: Vec<u8>,
    ready: bool,
    answers: u16,
}

/// identifier of a PDU sent and not yet collected
#[derive(Debug, Eq, PartialEq)]
pub struct PduToken(u8);

impl RawMaster {
	pub fn new<S: EthercatSocket + 'static + Send + Sync>(socket: S) -> Self {
        Self::from_box(Box::new(socket))
	}
	pub fn from_box(socket: Box<dyn EthercatSocket + Send + Sync>) -> Self {
        Self {
            timeout: crate::config::TIMEOUT_SAFE,
            reception: tokio::sync::Mutex::new(vec![0; socket.max_frame().max(MAX_ETHERCAT_FRAME)]),
            socket,
            received: Notify::new(),
            pdu_state: Mutex::new(PduState {
                token: 0,
                pending: HashMap::new(),
                }),
        }
	}
	/// change the delay after which a PDU without answer is considered lost
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
	}
	pub fn timeout(&self) -> Duration   {self.timeout}

	// shorthands to PDU commands
	pub async fn brd<T: PduData>(&self, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Broadcast, address).await
	}
	pub async fn bwr<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Broadcast, address, data).await
	}
	pub async fn aprd<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::AutoIncremented(slave), address).await
	}
	pub async fn apwr<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::AutoIncremented(slave), address, data).await
	}
	pub async fn fprd<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Fixed(slave), address).await
	}
	pub async fn fpwr<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Fixed(slave), address, data).await
	}
	pub async fn lrd<T: PduData>(&self, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Logical, address).await
	}
	pub async fn lwr<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Logical, address, data).await
	}
	pub async fn lrw<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        self.exchange(SlaveAddress::Logical, address, data).await
	}

	/// maps to a *RD command
	pub async fn read<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>) -> EthercatResult<PduAnswer<T>> {
        let (command, slave_address, memory_address) = slave.command(Access::Read, memory.byte);
        let mut buffer = T::Packed::zeroed();
        let answers = self.pdu(command, slave_address, memory_address, &mut buffer.as_mut()[.. memory.len]).await?;
        Ok(PduAnswer {
			answers,
			value: T::unpack(buffer.as_ref())?,
			})
    }
	/// maps to a *WR command
	pub async fn write<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        let (command, slave_address, memory_address) = slave.command(Access::Write, memory.byte);
        let mut buffer = T::Packed::zeroed();
        data.pack(buffer.as_mut())?;
		Ok(PduAnswer {
			answers: self.pdu(command, slave_address, memory_address, &mut buffer.as_mut()[.. memory.len]).await?,
			value: (),
			})
	}
	/// maps to a *RW command
	pub async fn exchange<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>, data: T) -> EthercatResult<PduAnswer<T>> {
        let (command, slave_address, memory_address) = slave.command(Access::Exchange, memory.byte);
        let mut buffer = T::Packed::zeroed();
        data.pack(buffer.as_mut())?;
        let answers = self.pdu(command, slave_address, memory_address, &mut buffer.as_mut()[.. memory.len]).await?;
        Ok(PduAnswer {
			answers,
			value: T::unpack(buffer.as_ref())?,
			})
	}

	/**
        send a PDU on the ethercat bus and wait for its answer

        `data` is sent and replaced by the content of the answer. Returns the working counter of the PDU, or a [EthercatError::Timeout] if no answer came within [Self::timeout]
	*/
	pub async fn pdu(&self, command: PduCommand, slave_address: u16, memory_address: u16, data: &mut [u8]) -> EthercatResult<u16> {
        let token = self.post(command, slave_address, memory_address, data).await?;
        let id = token.0;
        // clean up the pending table in case the async runtime cancels this task
        let _finisher = Finisher::new(|| {self.lock().pending.remove(&id);});

        match self.collect(&token, data, self.timeout).await? {
            Some(answers) => Ok(answers),
            None => Err(EthercatError::Timeout("no answer to PDU")),
        }
	}

	/**
        send a PDU on the ethercat bus without waiting for its answer

        The returned token must be passed to [Self::collect] to retreive the answer, or to [Self::forget] to discard it.
	*/
	pub async fn post(&self, command: PduCommand, slave_address: u16, memory_address: u16, data: &[u8]) -> EthercatResult<PduToken> {
        let size = EthercatHeader::packed_size() + PduHeader::packed_size() + data.len() + u16::packed_size();
        if size > self.socket.max_frame().min(MAX_ETHERCAT_FRAME)
            {return Err(EthercatError::Master("data too big for one frame"))}

        let token = {
            let mut state = self.lock();
            // reserving a token number to ensure no other task will exchange a PDU with the same token and receive our data
            let token = (0 ..= u8::MAX)
                .map(|offset| state.token.wrapping_add(offset))
                .find(|token| ! state.pending.contains_key(token))
                .ok_or(EthercatError::Master("too many PDUs pending"))?;
            state.token = token.wrapping_add(1);
            state.pending.insert(token, PduStorage {
                data: vec![0; data.len()],
                ready: false,
                answers: 0,
                });
            token
        };

        let mut frame = vec![0; size];
        {
            let mut cursor = Cursor::new(frame.as_mut_slice());
            let mut header = EthercatHeader::default();
            header.set_len(u11::new((size - EthercatHeader::packed_size()) as u16));
            header.set_ty(u4::new(PDU_FRAME));
            cursor.pack(&header)?;

            let mut pdu = PduHeader::default();
            pdu.set_command(command.code());
            pdu.set_token(token);
            pdu.set_slave_address(slave_address);
            pdu.set_memory_address(memory_address);
            pdu.set_len(u11::new(data.len() as u16));
            cursor.pack(&pdu)?;
            cursor.write(data)?;
            cursor.pack(&0u16)?;
        }
        debug!("send {:?} token {} at {:#06x}:{:#06x} ({} bytes)", command, token, slave_address, memory_address, data.len());

        if let Err(err) = poll_fn(|cx| self.socket.poll_send(cx, &frame)).await {
            self.lock().pending.remove(&token);
            return Err(err.into());
        }
        Ok(PduToken(token))
	}

	/**
        wait at most `timeout` for the answer to a PDU sent with [Self::post]

        on success the answer is copied to `data` and its working counter is returned. `None` is returned on timeout, the token then remains valid and can be collected again or forgotten.
	*/
	pub async fn collect(&self, token: &PduToken, data: &mut [u8], timeout: Duration) -> EthercatResult<Option<u16>> {
        match tokio::time::timeout(timeout, self.wait(token.0, data)).await {
            Ok(answers) => answers.map(Some),
            Err(_) => Ok(None),
        }
	}

	/// discard a PDU, an eventual answer arriving later will be ignored
	pub fn forget(&self, token: PduToken) {
        self.lock().pending.remove(&token.0);
	}

	async fn wait(&self, token: u8, data: &mut [u8]) -> EthercatResult<u16> {
        loop {
            // register for notification before checking, so no reception can be missed
            let mut notified = pin!(self.received.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                match state.pending.get(&token).map(|storage| storage.ready) {
                    None => return Err(EthercatError::Master("PDU is not pending")),
                    Some(false) => {},
                    Some(true) => if let Some(storage) = state.pending.remove(&token) {
                        if storage.data.len() != data.len()
                            {return Err(EthercatError::Master("wrong buffer size to collect PDU"))}
                        data.copy_from_slice(&storage.data);
                        return Ok(storage.answers);
                    },
                }
            }
            match self.reception.try_lock() {
                Ok(buffer) => self.receive(buffer).await?,
                Err(_) => notified.await,
            }
        }
	}

	/// receive one frame from the socket and file its PDUs
	async fn receive(&self, buffer: tokio::sync::MutexGuard<'_, Vec<u8>>) -> EthercatResult {
        // tasks waiting for the reception must be woken up even if this one is cancelled
        let _finisher = Finisher::new(|| self.received.notify_waiters());
        let mut buffer = buffer;

        let size = poll_fn(|cx| self.socket.poll_receive(cx, buffer.as_mut_slice())).await?;
        if let Err(err) = self.dispatch(&buffer[.. size]) {
            warn!("dropping malformed frame: {}", err);
        }
        Ok(())
	}

	/// extract a received frame of PDUs and buffer each for reception by an eventual [Self::wait] future waiting for it.
	fn dispatch(&self, frame: &[u8]) -> EthercatResult {
        let mut frame = Cursor::new(frame);
        let header = frame.unpack::<EthercatHeader>()?;
        if header.ty().value() != PDU_FRAME {
            debug!("ignoring ethercat frame of type {}", header.ty());
            return Ok(())
        }
        let mut content = Cursor::new(frame.read(usize::from(header.len().value()))?);

        let mut state = self.lock();
        loop {
            let pdu = content.unpack::<PduHeader>()?;
            let data = content.read(usize::from(pdu.len().value()))?;
            let answers = content.unpack::<u16>()?;

            match state.pending.get_mut(&pdu.token()) {
                Some(storage) if ! storage.ready && storage.data.len() == data.len() => {
                    storage.data.copy_from_slice(data);
                    storage.answers = answers;
                    storage.ready = true;
                },
                _ => warn!("unexpected answer for PDU token {}, dropped", pdu.token()),
            }
            if ! pdu.next() {break}
        }
        Ok(())
	}

	fn lock(&self) -> MutexGuard<'_, PduState> {
        self.pdu_state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}


/// dynamically specifies a destination address on the ethercat loop
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SlaveAddress {
	/// every slave will receive and execute
	Broadcast,
	/// address will be determined by the topology (index of the slave in the ethernet loop)
	AutoIncremented(u16),
	/// address has been set by the master previously
	Fixed(u16),
	/// the logical memory is the destination, all slaves are concerned
	Logical,
}
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Access {Read, Write, Exchange}

impl SlaveAddress {
    /// command and address fields of a PDU accessing `memory` at this address
    pub(crate) fn command(self, access: Access, memory: usize) -> (PduCommand, u16, u16) {
        use PduCommand::*;
        let pick = |read, write, exchange| match access {
            Access::Read => read,
            Access::Write => write,
            Access::Exchange => exchange,
        };
        match self {
            SlaveAddress::Broadcast => (pick(BRD, BWR, BRW), 0, memory as u16),
            SlaveAddress::AutoIncremented(position) => (pick(APRD, APWR, APRW), 0u16.wrapping_sub(position), memory as u16),
            SlaveAddress::Fixed(address) => (pick(FPRD, FPWR, FPRW), address, memory as u16),
            // logical address is 32 bits spread over both fields
            SlaveAddress::Logical => (pick(LRD, LWR, LRW), memory as u16, (memory >> 16) as u16),
        }
    }
}

/// answer to a PDU: the data read, and the number of slaves who processed the command
#[derive(Clone, Debug)]
pub struct PduAnswer<T> {
	pub answers: u16,
	pub value: T,
}
impl<T> PduAnswer<T> {
    /// the answer value, if exactly one slave processed the command
    pub fn one(self) -> EthercatResult<T> {
        self.exact(1)
    }
    /// the answer value, if exactly `n` slaves processed the command
    pub fn exact(self, n: u16) -> EthercatResult<T> {
        if self.answers != n
            {return Err(EthercatError::Protocol("wrong number of slaves answered"))}
        Ok(self.value)
    }
}


/// ethercat frame header (common to ethernet or UDP mediums) as described in ETG 1000.4 table 11
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub(crate) struct EthercatHeader {
    /// length of the ethercat frame (minus 2 bytes, which is the header)
    pub len: u11,
    reserved_0: u1,
    /// frame type, `1` for PDUs
    pub ty: u4,
}
data::bilge_pdudata!(EthercatHeader, u16);

/// header of a PDU frame, this one of the possible ethercat frames
#[bitsize(80)]
#[derive(FromBits, DebugBits, Clone, Default)]
pub(crate) struct PduHeader {
    /// PDU command, specifying whether logical or physical memory is accesses, addressing type, and what read/write operation
    pub command: u8,
    /// PDU task request identifier
    pub token: u8,
    /// slave address, its meaning depend on the command
    pub slave_address: u16,
    /// memory address of the data to access, which memory is accessed depend on the command
    pub memory_address: u16,
    /// data length following the header, excluding the footer. starting from `memory_address` in the addressed memory
    pub len: u11,
    reserved_0: u3,
    pub circulating: bool,
    /// true if there is an other PDU in the same PDU frame
    pub next: bool,
    pub interrupt: u16,
}
data::bilge_pdudata!(PduHeader, u80);

/// the possible PDU commands
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(u8)]
pub enum PduCommand {
    /// no operation
    #[default]
    NOP = 0x0,

    /// broadcast read
    BRD = 0x07,
    /// broadcast write
    BWR = 0x08,
    /// broadcast read & write
    BRW = 0x09,

    /// auto-incremented slave read
    APRD = 0x01,
    /// auto-incremented slave write
    APWR = 0x02,
    /// auto-incremented slave read & write
    APRW = 0x03,

    /// fixed slave read
    FPRD = 0x04,
    /// fixed slave write
    FPWR = 0x05,
    /// fixed slave read & write
    FPRW = 0x06,

    /// logical memory read
    LRD = 0x0A,
    /// logical memory write
    LWR = 0x0B,
    /// logical memory read & write
    LRW = 0x0C,
}
impl PduCommand {
    pub fn code(self) -> u8 {self as u8}
    /// decode a command byte, unknown commands are treated as [Self::NOP]
    pub fn from_code(code: u8) -> Self {
        use PduCommand::*;
        [BRD, BWR, BRW, APRD, APWR, APRW, FPRD, FPWR, FPRW, LRD, LWR, LRW].into_iter()
            .find(|command| command.code() == code)
            .unwrap_or(NOP)
    }
}


/// run a callback when dropped, whether the owning future completed or was cancelled
struct Finisher<F: FnOnce()> {
    callback: Option<F>,
}
impl<F: FnOnce()> Finisher<F> {
    fn new(callback: F) -> Self {Self{callback: Some(callback)}}
}
impl<F: FnOnce()>
Drop for Finisher<F>  {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressing() {
        assert_eq!(SlaveAddress::AutoIncremented(2).command(Access::Read, 0x130), (PduCommand::APRD, 0xfffe, 0x130));
        assert_eq!(SlaveAddress::Fixed(0x1001).command(Access::Write, 0x120), (PduCommand::FPWR, 0x1001, 0x120));
        assert_eq!(SlaveAddress::Logical.command(Access::Exchange, 0x0003_0010), (PduCommand::LRW, 0x0010, 0x0003));
        assert_eq!(PduCommand::from_code(0x0c), PduCommand::LRW);
        assert_eq!(PduCommand::from_code(0x0e), PduCommand::NOP);
    }

    #[test]
    fn headers() {
        let mut pdu = PduHeader::default();
        pdu.set_command(PduCommand::FPRD.code());
        pdu.set_token(7);
        pdu.set_slave_address(0x1001);
        pdu.set_memory_address(0x0130);
        pdu.set_len(u11::new(2));
        pdu.set_next(true);
        let mut buffer = [0u8; 10];
        pdu.pack(&mut buffer).unwrap();
        assert_eq!(buffer, [0x04, 7, 0x01, 0x10, 0x30, 0x01, 0x02, 0x80, 0, 0]);

        let header = EthercatHeader::unpack(&[0x0e, 0x10]).unwrap();
        assert_eq!(header.len().value(), 14);
        assert_eq!(header.ty().value(), PDU_FRAME);
    }

    #[test]
    fn answers() {
        assert_eq!(PduAnswer{answers: 1, value: 5u8}.one().unwrap(), 5);
        assert!(PduAnswer{answers: 2, value: 5u8}.one().is_err());
        assert!(PduAnswer{answers: 3, value: ()}.exact(3).is_ok());
    }
}
