/*!
    cyclic exchange of a process image with the segment

    A cycle is one logical read-write datagram carrying the whole image: slaves in [AlState::Operational](crate::registers::AlState) take their outputs from it, slaves in safe-operational or operational put their inputs in it. The sending and the reception of a cycle are separate calls, so the caller decides what happens in between.
*/

use core::time::Duration;
use log::{debug, warn};
use crate::{
    rawmaster::{RawMaster, PduToken, SlaveAddress, Access},
    image::ProcessImage,
    error::{EthercatError, EthercatResult},
    };


/**
    outcome of one cycle, valid until the next one

    `working_counter` and `expected` count slaves: `expected` is the number of slaves mapped in the image, and `working_counter` never exceeds it. The counter returned by the datagram itself, where each slave adds 1 for its inputs and 2 for its outputs, is kept in `raw_counter` and `raw_expected`.
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExchangeResult {
    /// number of slaves that may have processed their whole part of the cycle
    pub working_counter: u16,
    /// number of slaves mapped in the image
    pub expected: u16,
    /// working counter of the datagram, as incremented by the slaves
    pub raw_counter: u16,
    /// datagram working counter of a cycle where every slave did its part
    pub raw_expected: u16,
    /// no answer came back in time, the inputs were not updated
    pub timed_out: bool,
}
impl ExchangeResult {
    /// true if every slave processed the cycle
    pub fn is_complete(&self) -> bool {
        ! self.timed_out && self.working_counter == self.expected
    }
    /// error for a degraded cycle, the next cycle can simply be attempted
    pub fn check(&self) -> EthercatResult<Self> {
        if self.is_complete()
            {Ok(*self)}
        else
            {Err(EthercatError::ExchangeTimeout {
                working_counter: self.working_counter,
                expected: self.expected,
            })}
    }
}

/**
    sends and receives the cycles of one process image

    Only one cycle can be in flight at a time: [Self::send] fails until the pending cycle has been received with [Self::receive].
*/
#[derive(Debug)]
pub struct CyclicExchangeEngine {
    /// datagram working counter each mapped slave adds, in increasing order
    weights: Vec<u16>,
    raw_expected: u16,
    /// token of the cycle in flight
    cycle: tokio::sync::Mutex<Option<PduToken>>,
}
impl CyclicExchangeEngine {
    /// engine for the given image
    pub fn new(image: &ProcessImage) -> Self {
        let weights = slave_weights(image);
        let raw_expected = weights.iter().copied()
            .fold(0u16, |total, weight| total.saturating_add(weight));
        Self {
            weights,
            raw_expected,
            cycle: tokio::sync::Mutex::new(None),
        }
    }
    /// number of slaves taking part in a complete cycle
    pub fn expected(&self) -> u16   {u16::try_from(self.weights.len()).unwrap_or(u16::MAX)}
    /// datagram working counter of a complete cycle
    pub fn raw_expected(&self) -> u16   {self.raw_expected}

    /**
        number of slaves that can account for the given datagram working counter

        This is the largest number of slaves whose contributions fit in `raw`, so it only reaches [Self::expected] when the datagram counter is complete.
    */
    pub fn slaves_counted(&self, raw: u16) -> u16 {
        let mut remaining = raw.min(self.raw_expected);
        let mut counted = 0;
        for &weight in &self.weights {
            if weight > remaining  {break}
            remaining -= weight;
            counted += 1;
        }
        counted
    }

    /**
        send the current content of the image to the segment, without waiting for the answer

        Outputs written before this call are part of the cycle, later writes will be part of the next one.
    */
    pub async fn send(&self, raw: &RawMaster, image: &ProcessImage) -> EthercatResult {
        let mut cycle = self.cycle.try_lock()
            .map_err(|_| EthercatError::Master("a cycle is already in flight"))?;
        if cycle.is_some()
            {return Err(EthercatError::Master("a cycle is already in flight"))}

        let data = image.snapshot();
        let (command, slave_address, memory_address) = SlaveAddress::Logical
            .command(Access::Exchange, image.logical_address() as usize);
        *cycle = Some(raw.post(command, slave_address, memory_address, &data).await?);
        Ok(())
    }

    /**
        wait at most `timeout` for the answer of the cycle in flight, and update the image inputs with it

        On timeout the inputs are left untouched, the result has a null working counter, and the answer is discarded if it comes later.
    */
    pub async fn receive(&self, raw: &RawMaster, image: &ProcessImage, timeout: Duration) -> EthercatResult<ExchangeResult> {
        let mut cycle = self.cycle.try_lock()
            .map_err(|_| EthercatError::Master("a cycle is already being received"))?;
        let mut data = vec![0; image.len()];
        let answer = match cycle.as_ref() {
            Some(token) => raw.collect(token, &mut data, timeout).await,
            None => return Err(EthercatError::Master("no cycle in flight")),
        };
        let token = cycle.take();

        match answer {
            Ok(Some(answers)) => {
                image.store_inputs(&data)?;
                let raw_counter = if answers > self.raw_expected {
                    warn!("working counter {} above the {} expected, clamped", answers, self.raw_expected);
                    self.raw_expected
                } else {answers};
                let result = ExchangeResult {
                    working_counter: self.slaves_counted(raw_counter),
                    expected: self.expected(),
                    raw_counter,
                    raw_expected: self.raw_expected,
                    timed_out: false,
                    };
                if raw_counter < self.raw_expected {
                    warn!("degraded cycle: working counter {} out of {} ({} slaves out of {})",
                        raw_counter, self.raw_expected, result.working_counter, result.expected);
                }
                else {
                    debug!("cycle complete");
                }
                Ok(result)
            },
            Ok(None) => {
                if let Some(token) = token {raw.forget(token)}
                warn!("cycle timed out after {:?}", timeout);
                Ok(ExchangeResult {
                    working_counter: 0,
                    expected: self.expected(),
                    raw_counter: 0,
                    raw_expected: self.raw_expected,
                    timed_out: true,
                    })
            },
            Err(err) => {
                if let Some(token) = token {raw.forget(token)}
                Err(err)
            },
        }
    }

    /// send a cycle and wait for its answer
    pub async fn exchange(&self, raw: &RawMaster, image: &ProcessImage, timeout: Duration) -> EthercatResult<ExchangeResult> {
        self.send(raw, image).await?;
        self.receive(raw, image, timeout).await
    }
}

/// each slave counts 1 for reading its inputs and 2 for writing its outputs (ETG.1000.4 LRW), slaves without process data are not mapped
fn slave_weights(image: &ProcessImage) -> Vec<u16> {
    let mut weights: Vec<u16> = image.all_ranges().iter()
        .map(|ranges|
            u16::from(! ranges.inputs.is_empty())
            + 2 * u16::from(! ranges.outputs.is_empty()))
        .filter(|&weight| weight != 0)
        .collect();
    weights.sort_unstable();
    weights
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::SlaveRegistry,
        image::ProcessImageBuilder,
        registers::AlState,
        slave::{SlaveDescriptor, SlaveIdentity, ProcessDataSize},
        };

    #[test]
    fn expectation() {
        let registry = SlaveRegistry::from_descriptors(
            (0 .. 4).map(|position| SlaveDescriptor::new(position, 0x1001 + position as u16, 0, SlaveIdentity::default(), AlState::Init.into()))
                .collect()
            ).unwrap();
        for (index, (inputs, outputs)) in [(8, 8), (3, 0), (0, 16), (0, 0)].into_iter().enumerate() {
            registry.negotiate(index, ProcessDataSize::new(inputs, outputs)).unwrap();
        }
        let image = ProcessImageBuilder::new(0, 64).layout(&registry).unwrap();
        let engine = CyclicExchangeEngine::new(&image);
        assert_eq!(engine.raw_expected(), 3 + 1 + 2);
        // the slave without process data takes no part in the cycle
        assert_eq!(engine.expected(), 3);
        assert!(usize::from(engine.expected()) <= registry.len());

        assert_eq!(engine.slaves_counted(6), 3);
        assert_eq!(engine.slaves_counted(60), 3);
        assert_eq!(engine.slaves_counted(5), 2);
        assert_eq!(engine.slaves_counted(3), 2);
        assert_eq!(engine.slaves_counted(1), 1);
        assert_eq!(engine.slaves_counted(0), 0);
    }

    #[test]
    fn degraded() {
        let complete = ExchangeResult {working_counter: 3, expected: 3, raw_counter: 6, raw_expected: 6, timed_out: false};
        assert_eq!(complete.check().unwrap(), complete);
        let partial = ExchangeResult {working_counter: 2, raw_counter: 4, ..complete};
        assert!(matches!(partial.check(), Err(EthercatError::ExchangeTimeout {working_counter: 2, expected: 3})));
        let lost = ExchangeResult {working_counter: 0, timed_out: true, ..complete};
        assert!(! lost.is_complete());
        assert!(lost.check().unwrap_err().is_retryable());
    }
}
