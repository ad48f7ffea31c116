/*!
    process image: the contiguous buffer exchanged with the slaves at each cycle, and the views on each slave's part of it

    The buffer is laid out as all the slaves outputs followed by all the slaves inputs, each in registry order and packed without padding:

    ```text
    | outputs 0 | outputs 1 | ... | outputs n | inputs 0 | inputs 1 | ... | inputs n |
    ```

    The same layout is used in the logical memory, starting at the logical address of the image's group, so one logical datagram exchanges the whole image.
*/

use core::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};
use log::info;
use crate::{
    registry::SlaveRegistry,
    rawmaster::{EthercatHeader, PduHeader, MAX_ETHERCAT_FRAME},
    data::PduData,
    error::{EthercatError, EthercatResult},
    };


/// size of the biggest process image fitting in one datagram
pub fn max_process_data() -> usize {
    MAX_ETHERCAT_FRAME - EthercatHeader::packed_size() - PduHeader::packed_size() - u16::packed_size()
}

/// byte ranges of a slave's process data in the image
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SlaveRanges {
    /// data read from the slave
    pub inputs: Range<usize>,
    /// data written to the slave
    pub outputs: Range<usize>,
}

/// computes the layout of a process image from the negotiated sizes of the slaves
#[derive(Copy, Clone, Debug)]
pub struct ProcessImageBuilder {
    group: u16,
    ceiling: usize,
}
impl ProcessImageBuilder {
    /// `group` selects the logical memory area of the image, `ceiling` is the maximum size of the image in bytes
    pub fn new(group: u16, ceiling: usize) -> Self {
        Self {group, ceiling}
    }

    /**
        assign each slave its ranges and allocate the buffer, initialized to zero

        Slaves not negotiated count for no data. Fails with [EthercatError::Configuration] if the image exceeds the ceiling or a datagram, or cannot be allocated.
    */
    pub fn layout(&self, registry: &SlaveRegistry) -> EthercatResult<ProcessImage> {
        let sizes = registry.iter()
            .map(|slave| slave.size_or_empty())
            .collect::<Vec<_>>();
        let outputs_len: usize = sizes.iter().map(|size| size.output_bytes()).sum();
        let inputs_len: usize = sizes.iter().map(|size| size.input_bytes()).sum();
        let total = outputs_len + inputs_len;

        if total > self.ceiling
            {return Err(EthercatError::Configuration("process image exceeds the ceiling"))}
        if total > max_process_data()
            {return Err(EthercatError::Configuration("process image does not fit in one datagram"))}

        let mut ranges = Vec::with_capacity(sizes.len());
        let (mut output, mut input) = (0, outputs_len);
        for size in sizes {
            ranges.push(SlaveRanges {
                outputs: output .. output + size.output_bytes(),
                inputs: input .. input + size.input_bytes(),
            });
            output += size.output_bytes();
            input += size.input_bytes();
        }

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(total)
            .map_err(|_| EthercatError::Configuration("cannot allocate the process image"))?;
        buffer.resize(total, 0);

        info!("process image of group {}: {} bytes of outputs, {} bytes of inputs", self.group, outputs_len, inputs_len);
        Ok(ProcessImage {
            group: self.group,
            generation: 0,
            ranges,
            outputs_len,
            buffer: Mutex::new(buffer),
        })
    }
}

/**
    buffer of process data of one group of slaves

    The buffer is behind a short lock, only held to copy data in or out, so views and the cyclic exchange can be used from different tasks.
*/
#[derive(Debug)]
pub struct ProcessImage {
    group: u16,
    generation: u64,
    ranges: Vec<SlaveRanges>,
    outputs_len: usize,
    buffer: Mutex<Vec<u8>>,
}
impl ProcessImage {
    pub fn group(&self) -> u16   {self.group}
    /// configuration generation this image belongs to
    pub fn generation(&self) -> u64   {self.generation}
    pub(crate) fn with_generation(self, generation: u64) -> Self   {Self {generation, .. self}}

    /// total size of the image
    pub fn len(&self) -> usize   {self.lock().len()}
    pub fn is_empty(&self) -> bool   {self.len() == 0}
    /// size of the output region, at the start of the image
    pub fn outputs_len(&self) -> usize   {self.outputs_len}
    /// size of the input region, following the outputs
    pub fn inputs_len(&self) -> usize   {self.len() - self.outputs_len}
    /// number of slaves covered by the image
    pub fn slaves(&self) -> usize   {self.ranges.len()}

    /// start of this image in the logical memory
    pub fn logical_address(&self) -> u32   {u32::from(self.group) << 16}

    /// ranges of a slave
    pub fn ranges(&self, slave: usize) -> EthercatResult<&SlaveRanges> {
        self.ranges.get(slave)
            .ok_or(EthercatError::IndexOutOfRange {index: slave, count: self.ranges.len()})
    }
    pub(crate) fn all_ranges(&self) -> &[SlaveRanges]   {&self.ranges}

    /// accessor to a slave's process data
    pub fn view(&self, slave: usize) -> EthercatResult<SlaveIOView<'_>> {
        Ok(SlaveIOView {
            image: self,
            slave,
            ranges: self.ranges(slave)?.clone(),
        })
    }

    /// copy of the output region
    pub fn outputs(&self) -> Vec<u8>   {self.lock()[.. self.outputs_len].to_vec()}
    /// copy of the input region
    pub fn inputs(&self) -> Vec<u8>   {self.lock()[self.outputs_len ..].to_vec()}

    /// copy of the whole image, as sent to the segment
    pub(crate) fn snapshot(&self) -> Vec<u8>   {self.lock().clone()}
    /// copy the input region of a received image, the output region is left untouched
    pub(crate) fn store_inputs(&self, received: &[u8]) -> EthercatResult {
        let mut buffer = self.lock();
        if received.len() != buffer.len()
            {return Err(EthercatError::LengthMismatch {expected: buffer.len(), actual: received.len()})}
        let inputs = self.outputs_len ..;
        buffer[inputs.clone()].copy_from_slice(&received[inputs]);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/**
    bounded accessor to the process data of one slave

    A view borrows the image it was issued from, so it cannot outlive a reconfiguration.

    Reads reflect the last completed cycle. Writes are sent at the next cycle, a write from an other task to the same slave before that cycle overrides it.
*/
#[derive(Clone, Debug)]
pub struct SlaveIOView<'a> {
    image: &'a ProcessImage,
    slave: usize,
    ranges: SlaveRanges,
}
impl SlaveIOView<'_> {
    /// position of the slave in the registry
    pub fn slave(&self) -> usize   {self.slave}
    pub fn input_len(&self) -> usize   {self.ranges.inputs.len()}
    pub fn output_len(&self) -> usize   {self.ranges.outputs.len()}
    pub fn ranges(&self) -> &SlaveRanges   {&self.ranges}

    /// copy of the slave's inputs
    pub fn read(&self) -> Vec<u8> {
        self.image.lock()[self.ranges.inputs.clone()].to_vec()
    }
    /// copy the slave's inputs to `data`, which must have the exact input size
    pub fn read_into(&self, data: &mut [u8]) -> EthercatResult {
        self.check(self.input_len(), data.len())?;
        data.copy_from_slice(&self.image.lock()[self.ranges.inputs.clone()]);
        Ok(())
    }
    /// copy `data` to the slave's outputs, it must have the exact output size
    pub fn write(&self, data: &[u8]) -> EthercatResult {
        self.check(self.output_len(), data.len())?;
        self.image.lock()[self.ranges.outputs.clone()].copy_from_slice(data);
        Ok(())
    }
    /// current content of the slave's outputs, as they will be sent
    pub fn written(&self) -> Vec<u8> {
        self.image.lock()[self.ranges.outputs.clone()].to_vec()
    }

    fn check(&self, expected: usize, actual: usize) -> EthercatResult {
        if expected != actual
            {return Err(EthercatError::LengthMismatch {expected, actual})}
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registers::AlState,
        slave::{SlaveDescriptor, SlaveIdentity, ProcessDataSize},
        };

    /// registry of slaves with the given (input bits, output bits)
    fn registry(sizes: &[(u32, u32)]) -> SlaveRegistry {
        let registry = SlaveRegistry::from_descriptors(
            (0 .. sizes.len())
                .map(|position| SlaveDescriptor::new(position, 0x1001 + position as u16, 0, SlaveIdentity::default(), AlState::Init.into()))
                .collect()
            ).unwrap();
        for (index, &(inputs, outputs)) in sizes.iter().enumerate() {
            registry.negotiate(index, ProcessDataSize::new(inputs, outputs)).unwrap();
        }
        registry
    }

    #[test]
    fn input_offsets() {
        let registry = registry(&[(8, 0), (8, 0), (16, 0), (8, 0), (3, 0)]);
        let image = ProcessImageBuilder::new(0, 1024).layout(&registry).unwrap();
        let offsets = (0 .. 5)
            .map(|slave| image.ranges(slave).unwrap().inputs.start - image.outputs_len())
            .collect::<Vec<_>>();
        assert_eq!(offsets, [0, 1, 2, 4, 5]);
        assert_eq!(image.inputs_len(), 6);
        assert_eq!(image.ranges(4).unwrap().inputs.len(), 1);
    }

    #[test]
    fn tiling() {
        let registry = registry(&[(3, 12), (0, 0), (64, 1), (0, 17), (9, 0), (1, 1)]);
        let image = ProcessImageBuilder::new(2, 1024).layout(&registry).unwrap();

        let mut covered = vec![0u8; image.len()];
        for ranges in image.all_ranges() {
            for byte in ranges.inputs.clone().chain(ranges.outputs.clone()) {
                covered[byte] += 1;
            }
        }
        // each byte belongs to exactly one range
        assert!(covered.iter().all(|&count| count == 1));
        let sum: usize = image.all_ranges().iter()
            .map(|ranges| ranges.inputs.len() + ranges.outputs.len())
            .sum();
        assert_eq!(sum, image.len());
        assert_eq!(image.outputs_len(), 2 + 0 + 1 + 3 + 0 + 1);
        assert_eq!(image.logical_address(), 0x0002_0000);
    }

    #[test]
    fn limits() {
        let registry = registry(&[(64, 64), (64, 64)]);
        assert!(matches!(
            ProcessImageBuilder::new(0, 31).layout(&registry),
            Err(EthercatError::Configuration(_)),
            ));
        assert!(ProcessImageBuilder::new(0, 32).layout(&registry).is_ok());

        let registry = self::registry(&[(8 * 4096, 0)]);
        assert!(matches!(
            ProcessImageBuilder::new(0, usize::MAX).layout(&registry),
            Err(EthercatError::Configuration(_)),
            ));
        assert!(ProcessImageBuilder::new(0, 0).layout(&SlaveRegistry::default()).unwrap().is_empty());
    }

    #[test]
    fn views() {
        let registry = registry(&[(16, 8), (8, 16)]);
        let image = ProcessImageBuilder::new(0, 64).layout(&registry).unwrap();
        let first = image.view(0).unwrap();
        let second = image.view(1).unwrap();

        first.write(&[0xaa]).unwrap();
        second.write(&[0x11, 0x22]).unwrap();
        assert_eq!(image.outputs(), [0xaa, 0x11, 0x22]);
        assert!(matches!(
            second.write(&[1, 2, 3]),
            Err(EthercatError::LengthMismatch {expected: 2, actual: 3}),
            ));
        assert!(matches!(image.view(2), Err(EthercatError::IndexOutOfRange {index: 2, count: 2})));

        let mut received = image.snapshot();
        received.copy_from_slice(&[0, 0, 0, 1, 2, 3]);
        image.store_inputs(&received).unwrap();
        // outputs are never overwritten by received data
        assert_eq!(image.outputs(), [0xaa, 0x11, 0x22]);
        assert_eq!(first.read(), [1, 2]);
        let mut input = [0u8; 1];
        second.read_into(&mut input).unwrap();
        assert_eq!(input, [3]);
        assert!(first.read_into(&mut input).is_err());
    }
}
