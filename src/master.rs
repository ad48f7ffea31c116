/*!
    the master context, owning everything needed to run one ethercat segment
*/

use core::time::Duration;
use bilge::prelude::*;
use log::{info, warn};
use crate::{
    socket::{self, EthercatSocket},
    rawmaster::RawMaster,
    registers::{self, FmmuEntry},
    registry::SlaveRegistry,
    image::{ProcessImage, ProcessImageBuilder, SlaveIOView, SlaveRanges},
    exchange::{CyclicExchangeEngine, ExchangeResult},
    supervisor::StateSupervisor,
    slave::{SlaveDescriptor, SlaveState},
    config::MasterConfig,
    error::{EthercatError, EthercatResult},
    };


/**
    master of one ethercat segment

    It owns the socket, the registry of slaves, and the process image with its cyclic exchange. Each context opens its own socket, so nothing prevents two contexts on the same link: running a single context per segment is up to the caller.

    Operations not changing the configuration take `&self`, so the cycle loop, the state supervision and the views can run in different tasks sharing the context. Operations changing the configuration take `&mut self`, which statically ensures no view or cycle of the previous configuration is still in use.

    ## Example

    The typical sequence to bring a segment to operation is

    ```ignore
    let mut master = MasterContext::open("eno1", MasterConfig::default())?;
    master.enumerate().await?;
    master.negotiate_from_sync_managers().await?;
    master.configure(0, 1024).await?;
    master.supervisor().walk(AlState::Operational, master.config().state_timeout).await?;
    loop {
        master.view(0)?.write(&[0x01])?;
        master.exchange(0, master.config().cycle_timeout).await?.check()?;
        let inputs = master.view(1)?.read();
    }
    ```
*/
pub struct MasterContext {
    raw: RawMaster,
    config: MasterConfig,
    registry: SlaveRegistry,
    configured: Option<Configured>,
    generation: u64,
}
/// a process image and the engine exchanging it
struct Configured {
    image: ProcessImage,
    engine: CyclicExchangeEngine,
}

impl MasterContext {
    /**
        open the given link, see [socket::open] for the link names

        This must be called from a tokio runtime. Fails with [EthercatError::Connection] if the link cannot be opened.
    */
    pub fn open(link: &str, config: MasterConfig) -> EthercatResult<Self> {
        let master = Self::new(socket::open(link)?, config);
        info!("link {} opened", link);
        Ok(master)
    }
    /// master on an already opened socket
    pub fn new(socket: Box<dyn EthercatSocket + Send + Sync>, config: MasterConfig) -> Self {
        Self {
            raw: RawMaster::from_box(socket).with_timeout(config.read_timeout),
            config,
            registry: SlaveRegistry::default(),
            configured: None,
            generation: 0,
        }
    }
    /// release the process image and the link
    pub fn close(self) {
        info!("closing master with {} slaves", self.registry.len());
    }

    pub fn config(&self) -> &MasterConfig   {&self.config}
    /// low level access to the segment
    pub fn raw(&self) -> &RawMaster   {&self.raw}
    /// slaves found by the last enumeration, empty before
    pub fn registry(&self) -> &SlaveRegistry   {&self.registry}
    /// shorthand to [SlaveRegistry::get]
    pub fn slave(&self, index: usize) -> EthercatResult<&SlaveDescriptor>   {self.registry.get(index)}
    /// lowest state of the slaves, as last observed
    pub fn bus_state(&self) -> SlaveState   {self.registry.bus_state()}
    /// supervisor of the slaves states
    pub fn supervisor(&self) -> StateSupervisor<'_> {
        StateSupervisor::new(&self.raw, &self.registry, &self.config)
    }

    /**
        scan the segment and replace the registry with the slaves found, see [SlaveRegistry::enumerate]

        The current process image is discarded.
    */
    pub async fn enumerate(&mut self) -> EthercatResult<&SlaveRegistry> {
        self.configured = None;
        self.registry = SlaveRegistry::enumerate(&self.raw, &self.config).await?;
        Ok(&self.registry)
    }

    /// shorthand to [SlaveRegistry::negotiate_from_sync_managers]
    pub async fn negotiate_from_sync_managers(&self) -> EthercatResult {
        self.registry.negotiate_from_sync_managers(&self.raw).await
    }

    /**
        build a new process image for the current registry and map it on the slaves

        The logical memory of the image starts at `group << 16`. For each slave with process data, FMMU 0 maps its outputs onto the buffer of sync manager 2, and FMMU 1 maps its inputs from the buffer of sync manager 3.

        The previous image is discarded, so the views issued from it cannot be used anymore. Fails with [EthercatError::Configuration] if the image exceeds `ceiling` bytes or cannot be mapped.
    */
    pub async fn configure(&mut self, group: u16, ceiling: usize) -> EthercatResult<&ProcessImage> {
        self.configured = None;
        let image = ProcessImageBuilder::new(group, ceiling)
            .layout(&self.registry)?
            .with_generation(self.generation + 1);

        for (slave, ranges) in self.registry.iter().zip(image.all_ranges()) {
            self.map(slave, &image, ranges).await
                .map_err(|err| {
                    warn!("mapping of slave {} failed: {}", slave.position(), err);
                    EthercatError::Configuration("process image cannot be mapped on the slaves")
                })?;
        }
        self.generation += 1;
        info!("process image generation {} mapped at logical {:#010x}", self.generation, image.logical_address());

        let engine = CyclicExchangeEngine::new(&image);
        let configured = self.configured.insert(Configured {image, engine});
        Ok(&configured.image)
    }

    /// program the FMMUs of one slave for its ranges in the image
    async fn map(&self, slave: &SlaveDescriptor, image: &ProcessImage, ranges: &SlaveRanges) -> EthercatResult {
        let address = slave.configured_address();
        let interface = registers::sync_manager::interface;
        for (index, range, channel, write) in [
                (0, &ranges.outputs, interface.outputs(), true),
                (1, &ranges.inputs, interface.inputs(), false),
                ] {
            let entry = registers::fmmu.entry(index)
                .ok_or(EthercatError::Master("no such FMMU entry"))?;
            if range.is_empty() {
                self.raw.fpwr(address, entry, FmmuEntry::default()).await?.one()?;
                continue
            }
            let buffer = self.raw.fprd(address, channel).await?.one()?;
            self.raw.fpwr(address, entry, {
                let mut config = FmmuEntry::default();
                config.set_logical_start_byte(image.logical_address() + range.start as u32);
                config.set_logical_len_byte(range.len() as u16);
                config.set_logical_start_bit(u3::new(0));
                config.set_logical_end_bit(u3::new(7));
                config.set_physical_start_byte(buffer.address());
                config.set_physical_start_bit(u3::new(0));
                config.set_read(! write);
                config.set_write(write);
                config.set_enable(true);
                config
                }).await?.one()?;
        }
        Ok(())
    }

    /// the current process image, if any
    pub fn image(&self) -> EthercatResult<&ProcessImage> {
        self.configured.as_ref()
            .map(|configured| &configured.image)
            .ok_or(EthercatError::Master("no process image configured"))
    }
    /// accessor to a slave's process data in the current image
    pub fn view(&self, slave: usize) -> EthercatResult<SlaveIOView<'_>> {
        self.image()?.view(slave)
    }

    /// send a cycle of the given group, see [CyclicExchangeEngine::send]
    pub async fn send_cycle(&self, group: u16) -> EthercatResult {
        let configured = self.group(group)?;
        configured.engine.send(&self.raw, &configured.image).await
    }
    /// receive the cycle in flight of the given group, see [CyclicExchangeEngine::receive]
    pub async fn receive_cycle(&self, group: u16, timeout: Duration) -> EthercatResult<ExchangeResult> {
        let configured = self.group(group)?;
        configured.engine.receive(&self.raw, &configured.image, timeout).await
    }
    /// send a cycle and wait for its answer
    pub async fn exchange(&self, group: u16, timeout: Duration) -> EthercatResult<ExchangeResult> {
        let configured = self.group(group)?;
        configured.engine.exchange(&self.raw, &configured.image, timeout).await
    }

    fn group(&self, group: u16) -> EthercatResult<&Configured> {
        self.configured.as_ref()
            .filter(|configured| configured.image.group() == group)
            .ok_or(EthercatError::Master("group is not configured"))
    }
}
