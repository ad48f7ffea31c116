/*!
    access to the slave's EEPROM through the Slave Information Interface (SII)

    Only what the master needs to identify a slave is read: the fixed identity words and the device name found in the categories. ETG.1000.6 5.4
*/

use core::time::Duration;
use bilge::prelude::*;
use log::debug;
use crate::{
    rawmaster::RawMaster,
    data::{self, Field, PduData, Storage, Cursor},
    registers::{self, SiiControl},
    slave::SlaveIdentity,
    error::{EthercatError, EthercatResult},
    };

/// EEPROM addresses are counted in words of this size
pub const WORD: usize = core::mem::size_of::<u16>();

/// layout of the EEPROM content, fields are at byte addresses in the EEPROM
pub mod eeprom {
    use super::*;

    /// configured station alias, copied by the slave to [registers::address::alias] at power up
    pub const alias: Field<u16> = Field::simple(WORD*0x0004);

    /// identity words, ETG.1000.6 table 16
    pub mod device {
        use super::*;

        pub const vendor: Field<u32> = Field::simple(WORD*0x0008);
        pub const product: Field<u32> = Field::simple(WORD*0x000a);
        pub const revision: Field<u32> = Field::simple(WORD*0x000c);
        pub const serial: Field<u32> = Field::simple(WORD*0x000e);
    }

    /// byte address of the first category header
    pub const categories: usize = WORD*0x0040;
}

/// header of a SII category, ETG.1000.6 table 17
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
struct CategoryHeader {
    /// category type as defined in ETG.1000.6 table 19
    ty: u16,
    /// size of the following category content in words
    size: u16,
}
data::bilge_pdudata!(CategoryHeader, u32);

/// strings repository, ETG.1000.6 table 20
const CATEGORY_STRINGS: u16 = 10;
/// general information, ETG.1000.6 table 21
const CATEGORY_GENERAL: u16 = 30;
const CATEGORY_END: u16 = 0xffff;
/// offset of the device name index in the general category
const GENERAL_NAME: usize = 3;
/// guard against EEPROMs with no end marker
const MAX_CATEGORIES: usize = 64;
/// delay between two polls of the SII busy flag
const SII_POLL: Duration = Duration::from_micros(100);

/// reader of a slave's EEPROM, the slave must already have a fixed address
pub struct Sii<'a> {
    master: &'a RawMaster,
    slave: u16,
    retries: usize,
}
impl<'a> Sii<'a> {
    /// `retries` is the number of polls of the interface before a read is considered failed
    pub fn new(master: &'a RawMaster, slave: u16, retries: usize) -> Self {
        Self {master, slave, retries: retries.max(1)}
    }

    /// read a value at a byte address in the EEPROM, which must be word-aligned
    pub async fn read<T: PduData>(&self, field: Field<T>) -> EthercatResult<T> {
        let mut buffer = T::Packed::zeroed();
        self.read_slice(field.byte, &mut buffer.as_mut()[.. field.len]).await?;
        Ok(T::unpack(buffer.as_ref())?)
    }

    /// fill `data` with the EEPROM content starting at the given byte address, which must be word-aligned
    pub async fn read_slice(&self, start: usize, data: &mut [u8]) -> EthercatResult {
        if start % WORD != 0
            {return Err(EthercatError::Master("EEPROM reads must be word aligned"))}
        let mut cursor = Cursor::new(data);
        while ! cursor.remain().is_empty() {
            let chunk = self.read_chunk((start + cursor.position()) / WORD).await?;
            let size = cursor.remain().len().min(chunk.len());
            cursor.write(&chunk[.. size])?;
        }
        Ok(())
    }

    /// vendor, product, revision, serial and name
    pub async fn identity(&self) -> EthercatResult<SlaveIdentity> {
        Ok(SlaveIdentity {
            vendor: self.read(eeprom::device::vendor).await?,
            product: self.read(eeprom::device::product).await?,
            revision: self.read(eeprom::device::revision).await?,
            serial: self.read(eeprom::device::serial).await?,
            name: self.name().await?,
        })
    }

    /// device name pointed by the general category, empty if the EEPROM has none
    pub async fn name(&self) -> EthercatResult<String> {
        let mut address = eeprom::categories;
        let mut strings = None;
        let mut index = None;
        for _ in 0 .. MAX_CATEGORIES {
            let header = self.read(Field::<CategoryHeader>::simple(address)).await?;
            let content = address + CategoryHeader::packed_size();
            let size = usize::from(header.size()) * WORD;
            match header.ty() {
                CATEGORY_END => break,
                CATEGORY_STRINGS => {
                    let mut data = vec![0; size];
                    self.read_slice(content, &mut data).await?;
                    strings = Some(data);
                },
                CATEGORY_GENERAL => {
                    let general = self.read(Field::<[u8; 4]>::simple(content)).await?;
                    index = Some(general[GENERAL_NAME]);
                },
                _ => {},
            }
            if strings.is_some() && index.is_some() {break}
            address = content + size;
        }
        Ok(match (strings, index) {
            (Some(strings), Some(index)) => string_at(&strings, index).unwrap_or_default(),
            _ => String::new(),
        })
    }

    async fn read_chunk(&self, word: usize) -> EthercatResult<[u8; 4]> {
        let word = u32::try_from(word)
            .map_err(|_| EthercatError::Master("EEPROM address out of range"))?;
        self.wait_idle().await?;
        self.master.fpwr(self.slave, registers::sii::address, word).await?.one()?;
        self.master.fpwr(self.slave, registers::sii::control, {
            let mut control = SiiControl::default();
            control.set_read_operation(true);
            control
            }).await?.one()?;
        self.wait_idle().await?;
        self.master.fprd(self.slave, registers::sii::data).await?.one()
    }

    async fn wait_idle(&self) -> EthercatResult {
        for _ in 0 .. self.retries {
            let control = self.master.fprd(self.slave, registers::sii::control).await?.one()?;
            if control.command_error()
                {return Err(EthercatError::Protocol("SII command error"))}
            if ! control.busy() && ! control.read_operation()
                {return Ok(())}
            debug!("SII of slave {:#06x} busy", self.slave);
            tokio::time::sleep(SII_POLL).await;
        }
        Err(EthercatError::Timeout("SII interface stays busy"))
    }
}

/// string number `index` (starting at 1) of a strings category content
fn string_at(strings: &[u8], index: u8) -> Option<String> {
    let mut cursor = Cursor::new(strings);
    let count = cursor.unpack::<u8>().ok()?;
    if index == 0 || index > count
        {return None}
    for _ in 1 .. index {
        let len = cursor.unpack::<u8>().ok()?;
        cursor.read(usize::from(len)).ok()?;
    }
    let len = cursor.unpack::<u8>().ok()?;
    let text = cursor.read(usize::from(len)).ok()?;
    Some(String::from_utf8_lossy(text).into_owned())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings() {
        let strings = [2, 3, b'a', b'b', b'c', 2, b'E', b'K'];
        assert_eq!(string_at(&strings, 1).as_deref(), Some("abc"));
        assert_eq!(string_at(&strings, 2).as_deref(), Some("EK"));
        assert_eq!(string_at(&strings, 0), None);
        assert_eq!(string_at(&strings, 3), None);
        assert_eq!(string_at(&[3, 4, b'a'], 1), None);
    }

    #[test]
    fn layout() {
        assert_eq!(eeprom::alias.byte, 0x08);
        assert_eq!(eeprom::device::vendor.range(), 0x10 .. 0x14);
        assert_eq!(eeprom::device::serial.range(), 0x1c .. 0x20);
        let header = CategoryHeader::unpack(&[10, 0, 4, 0]).unwrap();
        assert_eq!(header.ty(), CATEGORY_STRINGS);
        assert_eq!(header.size(), 4);
    }
}
