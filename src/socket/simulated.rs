/*!
    in-memory ethercat segment, answering frames like a chain of real slaves would do

    Each simulated slave has a physical memory with the registers used by this crate (station address, alias, AL control and status, SII interface backed by an EEPROM image, FMMU and sync managers) and a process data area. Commands are executed with the addressing and working counter rules of ETG.1000.4.
*/

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    };
use core::task::{Poll, Context};
use futures::task::AtomicWaker;
use log::debug;

use super::EthercatSocket;
use crate::{
    data::{PduData, PackingError, PackingResult},
    rawmaster::{EthercatHeader, PduHeader, PduCommand, MAX_ETHERCAT_FRAME},
    registers::{self, AlState, AL_ERROR_FLAG},
    };


/// size of the physical memory of a simulated slave
const MEMORY: usize = 0x2000;
/// physical start of the process outputs, buffered by sync manager 2
const OUTPUTS_AREA: usize = 0x1000;
/// physical start of the process inputs, buffered by sync manager 3
const INPUTS_AREA: usize = 0x1400;
/// maximum process data size per direction
const AREA_SIZE: usize = INPUTS_AREA - OUTPUTS_AREA;
/// word address of the first category in the EEPROM
const EEPROM_CATEGORIES: usize = 0x40;

/// description of one simulated slave, given to [SimulatedSegment::new]
#[derive(Clone, Debug)]
pub struct SimulatedSlave {
    vendor: u32,
    product: u32,
    revision: u32,
    serial: u32,
    name: String,
    alias: u16,
    input_bits: u32,
    output_bits: u32,
}
impl SimulatedSlave {
    pub fn new(vendor: u32, product: u32, name: &str) -> Self {
        Self {
            vendor,
            product,
            revision: 1,
            serial: 0,
            name: name.to_owned(),
            alias: 0,
            input_bits: 0,
            output_bits: 0,
        }
    }
    pub fn with_revision(self, revision: u32) -> Self   {Self {revision, .. self}}
    pub fn with_serial(self, serial: u32) -> Self   {Self {serial, .. self}}
    pub fn with_alias(self, alias: u16) -> Self   {Self {alias, .. self}}
    /// size of the process data read by the master
    pub fn with_inputs(self, input_bits: u32) -> Self   {Self {input_bits, .. self}}
    /// size of the process data written by the master
    pub fn with_outputs(self, output_bits: u32) -> Self   {Self {output_bits, .. self}}
}

/**
    a chain of simulated slaves, usable as an [EthercatSocket]

    Clones share the same segment, so a test can keep a handle to inspect or perturbate the slaves while a master owns the socket.
*/
#[derive(Clone)]
pub struct SimulatedSegment {
    shared: Arc<Shared>,
}
struct Shared {
    segment: Mutex<Segment>,
    waker: AtomicWaker,
}
struct Segment {
    devices: Vec<Device>,
    replies: VecDeque<Vec<u8>>,
    frames: usize,
    drop_replies: bool,
    wires: Vec<Wire>,
}
/// copy of output bytes of a slave to input bytes of an other, performed each time the first slave processed a logical command
struct Wire {
    from: usize,
    output: usize,
    to: usize,
    input: usize,
    len: usize,
}
struct Device {
    memory: Vec<u8>,
    eeprom: Vec<u8>,
    /// highest state the slave agrees to reach
    ceiling: AlState,
}

impl SimulatedSegment {
    pub fn new(slaves: impl IntoIterator<Item=SimulatedSlave>) -> Self {
        Self {shared: Arc::new(Shared {
            segment: Mutex::new(Segment {
                devices: slaves.into_iter().map(|slave| Device::new(&slave)).collect(),
                replies: VecDeque::new(),
                frames: 0,
                drop_replies: false,
                wires: Vec::new(),
                }),
            waker: AtomicWaker::new(),
            })}
    }
    /// segment of `count` slaves with 8 bits of inputs and outputs each
    pub fn generic(count: usize) -> Self {
        Self::new((0 .. count).map(|index|
            SimulatedSlave::new(0x0000_0002, 0x0001_0000 + index as u32, &format!("generic io {}", index))
                .with_inputs(8)
                .with_outputs(8)
            ))
    }

    /// number of slaves on the segment
    pub fn len(&self) -> usize   {self.lock().devices.len()}
    pub fn is_empty(&self) -> bool   {self.len() == 0}
    /// number of frames received from the master so far
    pub fn frames(&self) -> usize   {self.lock().frames}
    /// when enabled, frames are executed by the slaves but never come back to the master
    pub fn set_drop_replies(&self, enable: bool) {
        self.lock().drop_replies = enable;
    }
    /// the given slave will not go above `state`, requests to higher states are silently ignored
    pub fn stall(&self, slave: usize, state: AlState) {
        if let Some(device) = self.lock().devices.get_mut(slave) {
            device.ceiling = state;
        }
    }
    /// set the error indication of a slave, with the given AL status code
    pub fn raise_fault(&self, slave: usize, code: u16) {
        if let Some(device) = self.lock().devices.get_mut(slave) {
            let status = device.memory[registers::al::status.byte];
            device.memory[registers::al::status.byte] = status | AL_ERROR_FLAG;
            device.memory[registers::al::error.range()].copy_from_slice(&code.to_le_bytes());
        }
    }
    /// content of the AL status register of a slave
    pub fn status(&self, slave: usize) -> Option<u8> {
        self.lock().devices.get(slave)
            .map(|device| device.memory[registers::al::status.byte])
    }
    /// wire `len` output bytes of slave `from` starting at `output` to the inputs of slave `to` starting at `input`
    pub fn wire(&self, from: usize, output: usize, to: usize, input: usize, len: usize) {
        self.lock().wires.push(Wire {from, output, to, input, len});
    }
    /// set input bytes of a slave, as its application would do
    pub fn set_inputs(&self, slave: usize, offset: usize, data: &[u8]) {
        if let Some(device) = self.lock().devices.get_mut(slave) {
            let start = INPUTS_AREA + offset.min(AREA_SIZE);
            let end = (start + data.len()).min(INPUTS_AREA + AREA_SIZE);
            device.memory[start .. end].copy_from_slice(&data[.. end - start]);
        }
    }
    /// output bytes of a slave, as its application would read them
    pub fn outputs(&self, slave: usize, len: usize) -> Vec<u8> {
        self.lock().devices.get(slave)
            .map(|device| device.memory[OUTPUTS_AREA ..][.. len.min(AREA_SIZE)].to_vec())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Segment> {
        self.shared.segment.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EthercatSocket for SimulatedSegment {
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut segment = self.lock();
        match segment.replies.pop_front() {
            Some(reply) => {
                let size = reply.len().min(data.len());
                data[.. size].copy_from_slice(&reply[.. size]);
                Poll::Ready(Ok(size))
            },
            None => {
                // registered while holding the lock, so a reply pushed later will wake
                self.shared.waker.register(cx.waker());
                Poll::Pending
            },
        }
    }
    fn poll_send(&self, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        let mut reply = data.to_vec();
        {
            let mut segment = self.lock();
            segment.frames += 1;
            segment.execute(&mut reply)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed ethercat frame"))?;
            if segment.drop_replies {
                debug!("simulated segment drops frame {}", segment.frames);
                return Poll::Ready(Ok(()))
            }
            segment.replies.push_back(reply);
        }
        self.shared.waker.wake();
        Poll::Ready(Ok(()))
    }
    fn max_frame(&self) -> usize {
        MAX_ETHERCAT_FRAME
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Access {Read, Write, Exchange}

impl Segment {
    /// execute all PDUs of a frame in place, as the frame passes through every slave
    fn execute(&mut self, frame: &mut [u8]) -> PackingResult<()> {
        let header = EthercatHeader::unpack(frame)?;
        if header.ty().value() != 1 {
            return Ok(())
        }
        let end = EthercatHeader::packed_size() + usize::from(header.len().value());
        if end > frame.len() {
            return Err(PackingError::BadSize(frame.len(), "frame shorter than its header"))
        }
        let mut position = EthercatHeader::packed_size();
        loop {
            let pdu = PduHeader::unpack(&frame[position .. end])?;
            let start = position + PduHeader::packed_size();
            let stop = start + usize::from(pdu.len().value());
            if stop + u16::packed_size() > end {
                return Err(PackingError::BadSize(end, "PDU exceeds frame"))
            }
            let counter = u16::unpack(&frame[stop ..])?;
            let executed = self.command(
                PduCommand::from_code(pdu.command()),
                pdu.slave_address(),
                pdu.memory_address(),
                &mut frame[start .. stop],
                );
            counter.wrapping_add(executed).pack(&mut frame[stop ..])?;
            position = stop + u16::packed_size();
            if ! pdu.next() {break}
        }
        Ok(())
    }

    /// execute one command, returning the increment of working counter
    fn command(&mut self, command: PduCommand, slave: u16, memory: u16, data: &mut [u8]) -> u16 {
        use PduCommand::*;
        let memory = usize::from(memory);
        match command {
            NOP => 0,
            BRD | BWR | BRW => {
                let access = access(command == BRD, command == BWR);
                self.devices.iter_mut()
                    .map(|device| device.physical(access, memory, data, true))
                    .sum()
            },
            APRD | APWR | APRW => {
                let access = access(command == APRD, command == APWR);
                // each slave increments the address, the one seeing zero is addressed
                match self.devices.get_mut(usize::from(0u16.wrapping_sub(slave))) {
                    Some(device) => device.physical(access, memory, data, false),
                    None => 0,
                }
            },
            FPRD | FPWR | FPRW => {
                let access = access(command == FPRD, command == FPWR);
                match self.devices.iter_mut().find(|device| device.station() == slave) {
                    Some(device) => device.physical(access, memory, data, false),
                    None => 0,
                }
            },
            LRD | LWR | LRW => {
                let access = access(command == LRD, command == LWR);
                let logical = u64::from(slave) | (memory as u64) << 16;
                let mut executed = 0;
                for index in 0 .. self.devices.len() {
                    executed += self.devices[index].logical(access, logical, data);
                    self.propagate(index);
                }
                executed
            },
        }
    }

    /// application of slave `from` copying its outputs to wired inputs, slaves further on the segment see them in the same frame
    fn propagate(&mut self, from: usize) {
        for wire in self.wires.iter().filter(|wire| wire.from == from) {
            let len = wire.len.min(AREA_SIZE.saturating_sub(wire.output.max(wire.input)));
            let copied = match self.devices.get(wire.from) {
                Some(device) => device.memory[OUTPUTS_AREA + wire.output ..][.. len].to_vec(),
                None => continue,
            };
            if let Some(device) = self.devices.get_mut(wire.to) {
                device.memory[INPUTS_AREA + wire.input ..][.. len].copy_from_slice(&copied);
            }
        }
    }
}

fn access(read: bool, write: bool) -> Access {
    match (read, write) {
        (true, _) => Access::Read,
        (_, true) => Access::Write,
        _ => Access::Exchange,
    }
}

impl Device {
    fn new(slave: &SimulatedSlave) -> Self {
        let mut memory = vec![0; MEMORY];
        let input_bytes = (slave.input_bits as usize + 7) / 8;
        let output_bytes = (slave.output_bits as usize + 7) / 8;

        // EtherCAT slave controller type
        memory[registers::dl::ty.byte] = 0x11;
        // the controller loads the alias from the EEPROM at power up
        memory[registers::address::alias.range()].copy_from_slice(&slave.alias.to_le_bytes());
        memory[registers::al::status.byte] = AlState::Init.code();
        // SII addresses are in words, 4 bytes are read at once
        memory[registers::sii::control.range()].copy_from_slice(&0x0080u16.to_le_bytes());

        // sync managers as a configuration tool would have set them
        for (channel, address, length, control) in [
                (registers::sync_manager::interface.outputs(), OUTPUTS_AREA, output_bytes.min(AREA_SIZE), 0x64),
                (registers::sync_manager::interface.inputs(), INPUTS_AREA, input_bytes.min(AREA_SIZE), 0x20),
                ] {
            let place = &mut memory[channel.range()];
            place[0 .. 2].copy_from_slice(&(address as u16).to_le_bytes());
            place[2 .. 4].copy_from_slice(&(length as u16).to_le_bytes());
            place[4] = control;
            place[6] = u8::from(length != 0);
        }

        Self {
            memory,
            eeprom: eeprom(slave),
            ceiling: AlState::Operational,
        }
    }

    fn station(&self) -> u16 {
        u16::from_le_bytes([
            self.memory[registers::address::fixed.byte],
            self.memory[registers::address::fixed.byte + 1],
            ])
    }
    fn state(&self) -> Option<AlState> {
        AlState::try_from(self.memory[registers::al::status.byte] & !AL_ERROR_FLAG).ok()
    }

    /// access to registers, returns the increment of working counter
    fn physical(&mut self, access: Access, memory: usize, data: &mut [u8], broadcast: bool) -> u16 {
        let range = memory .. memory + data.len();
        if range.end > MEMORY {
            return 0
        }
        match access {
            Access::Read => {
                if broadcast {
                    // broadcast reads are merging the content of all slaves
                    for (dst, src) in data.iter_mut().zip(&self.memory[range]) {
                        *dst |= *src;
                    }
                }
                else {
                    data.copy_from_slice(&self.memory[range]);
                }
                1
            },
            Access::Write => {
                self.memory[range.clone()].copy_from_slice(data);
                self.written(range);
                1
            },
            Access::Exchange => {
                let previous = self.memory[range.clone()].to_vec();
                self.memory[range.clone()].copy_from_slice(data);
                data.copy_from_slice(&previous);
                self.written(range);
                3
            },
        }
    }

    /// access to the logical memory through the FMMUs, returns the increment of working counter
    fn logical(&mut self, access: Access, logical: u64, data: &mut [u8]) -> u16 {
        let state = self.state().map(AlState::rank).unwrap_or(0);
        let (mut read, mut written) = (false, false);

        // the master uses the first two entries
        for index in 0 .. 2 {
            let Some(field) = registers::fmmu.entry(index) else {continue};
            let Ok(entry) = field.get(&self.memory) else {continue};
            if ! entry.enable() {continue}

            let start = u64::from(entry.logical_start_byte());
            let low = start.max(logical);
            let high = (start + u64::from(entry.logical_len_byte()))
                        .min(logical + data.len() as u64);
            if low >= high {continue}

            let frame = (low - logical) as usize .. (high - logical) as usize;
            let physical = usize::from(entry.physical_start_byte()) + (low - start) as usize;
            let physical = physical .. physical + frame.len();
            if physical.end > MEMORY {continue}

            // outputs are applied only in operational, inputs are valid from safe operational
            if entry.write() && access != Access::Read && state >= AlState::Operational.rank() {
                self.memory[physical.clone()].copy_from_slice(&data[frame.clone()]);
                written = true;
            }
            if entry.read() && access != Access::Write && state >= AlState::SafeOperational.rank() {
                data[frame].copy_from_slice(&self.memory[physical]);
                read = true;
            }
        }
        u16::from(read) + match (written, access) {
            (false, _) => 0,
            (true, Access::Exchange) => 2,
            (true, _) => 1,
        }
    }

    /// react to a write in the given physical range
    fn written(&mut self, range: core::ops::Range<usize>) {
        let touches = |byte: usize| range.contains(&byte);
        if touches(registers::al::control.byte) {
            self.al_control(self.memory[registers::al::control.byte]);
        }
        if touches(registers::sii::control.byte) || touches(registers::sii::control.byte + 1) {
            self.sii_control();
        }
    }

    fn al_control(&mut self, request: u8) {
        let status = self.memory[registers::al::status.byte];
        let ack = request & AL_ERROR_FLAG != 0;
        let mut error = status & AL_ERROR_FLAG != 0;
        if error && ! ack {
            // requests are ignored until the error is acknowledged
            return
        }
        if ack {
            error = false;
            self.memory[registers::al::error.range()].fill(0);
        }
        let mut current = status & !AL_ERROR_FLAG;
        match (AlState::try_from(current), AlState::try_from(request & !AL_ERROR_FLAG)) {
            (Ok(from), Ok(to)) if from.can_switch(to) => {
                if to.rank() <= self.ceiling.rank() {
                    current = to.code();
                }
            },
            _ => {
                error = true;
                self.memory[registers::al::error.range()].copy_from_slice(&0x0011u16.to_le_bytes());
            },
        }
        self.memory[registers::al::status.byte] = current | if error {AL_ERROR_FLAG} else {0};
    }

    fn sii_control(&mut self) {
        let control = registers::sii::control.range();
        let mut value = u16::from_le_bytes([self.memory[control.start], self.memory[control.start + 1]]);
        // bit 8 requests a read operation
        if value & 0x0100 != 0 {
            let address = registers::sii::address.range();
            let word = u32::from_le_bytes([
                self.memory[address.start],
                self.memory[address.start + 1],
                self.memory[address.start + 2],
                self.memory[address.start + 3],
                ]) as usize;
            let mut content = [0u8; 4];
            for (index, byte) in content.iter_mut().enumerate() {
                *byte = self.eeprom.get(word * 2 + index).copied().unwrap_or(0);
            }
            self.memory[registers::sii::data.range()].copy_from_slice(&content);
            // operation done instantly, read and busy flags cleared
            value &= !0x8100;
        }
        self.memory[control].copy_from_slice(&value.to_le_bytes());
    }
}

/// EEPROM image with the identity words, a strings category holding the name, and a general category pointing to it
fn eeprom(slave: &SimulatedSlave) -> Vec<u8> {
    let mut words = vec![0u16; EEPROM_CATEGORIES];
    words[0x04] = slave.alias;
    for (index, value) in [slave.vendor, slave.product, slave.revision, slave.serial].into_iter().enumerate() {
        words[0x08 + 2*index] = value as u16;
        words[0x08 + 2*index + 1] = (value >> 16) as u16;
    }
    let mut eeprom: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();

    let name = &slave.name.as_bytes()[.. slave.name.len().min(255)];
    let mut strings = vec![1, name.len() as u8];
    strings.extend_from_slice(name);
    if strings.len() % 2 != 0 {
        strings.push(0);
    }
    let mut general = [0u8; 32];
    // index of the device name in the strings
    general[3] = 1;

    for (category, content) in [(10u16, strings.as_slice()), (30, general.as_slice())] {
        eeprom.extend_from_slice(&category.to_le_bytes());
        eeprom.extend_from_slice(&((content.len() / 2) as u16).to_le_bytes());
        eeprom.extend_from_slice(content);
    }
    eeprom.extend_from_slice(&0xffffu16.to_le_bytes());
    eeprom.extend_from_slice(&0u16.to_le_bytes());
    eeprom
}
