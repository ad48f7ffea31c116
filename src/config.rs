/*!
    timing constants of the fieldbus and settings of a [crate::MasterContext]

    The constants keep the native microsecond values of the ethercat timing conventions.
*/

use core::time::Duration;

/// default delay for a cyclic exchange to come back
pub const TIMEOUT_RETURN: Duration = Duration::from_micros(2_000);
/// default delay for all slaves to reach a requested state
pub const TIMEOUT_STATE: Duration = Duration::from_micros(2_000_000);
/// default delay for register reads during enumeration and state polling
pub const TIMEOUT_SAFE: Duration = Duration::from_micros(20_000);
/// delay between two polls of the slaves states
pub const POLL_INTERVAL: Duration = Duration::from_micros(1_000);
/// first station address assigned at enumeration is this offset + 1
pub const STATION_OFFSET: u16 = 0x1000;
/// maximum number of slaves accepted on one segment
pub const MAX_SLAVES: usize = 200;
/// number of polls of the SII interface before giving up an EEPROM read
pub const SII_RETRIES: usize = 100;

/**
    settings of a master, all fields have defaults matching the constants of this module

    ```
    use etherplc::MasterConfig;
    use core::time::Duration;

    let config = MasterConfig::default()
        .with_state_timeout(Duration::from_secs(5))
        .with_max_slaves(16);
    assert_eq!(config.max_slaves, 16);
    ```
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MasterConfig {
    /// delay for the answer of a cyclic exchange
    pub cycle_timeout: Duration,
    /// delay for a state transition on all slaves
    pub state_timeout: Duration,
    /// delay for any single register read or write
    pub read_timeout: Duration,
    /// delay between two state polls
    pub poll_interval: Duration,
    /// station addresses are assigned from `station_offset + 1` in bus order
    pub station_offset: u16,
    pub max_slaves: usize,
    /// polls of the SII busy flag per EEPROM read
    pub sii_retries: usize,
}
impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cycle_timeout: TIMEOUT_RETURN,
            state_timeout: TIMEOUT_STATE,
            read_timeout: TIMEOUT_SAFE,
            poll_interval: POLL_INTERVAL,
            station_offset: STATION_OFFSET,
            max_slaves: MAX_SLAVES,
            sii_retries: SII_RETRIES,
        }
    }
}
impl MasterConfig {
    pub fn with_cycle_timeout(self, cycle_timeout: Duration) -> Self   {Self {cycle_timeout, .. self}}
    pub fn with_state_timeout(self, state_timeout: Duration) -> Self   {Self {state_timeout, .. self}}
    pub fn with_read_timeout(self, read_timeout: Duration) -> Self   {Self {read_timeout, .. self}}
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self   {Self {poll_interval, .. self}}
    pub fn with_station_offset(self, station_offset: u16) -> Self   {Self {station_offset, .. self}}
    pub fn with_max_slaves(self, max_slaves: usize) -> Self   {Self {max_slaves, .. self}}
    pub fn with_sii_retries(self, sii_retries: usize) -> Self   {Self {sii_retries, .. self}}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_timings() {
        let config = MasterConfig::default();
        assert_eq!(config.cycle_timeout.as_micros(), 2_000);
        assert_eq!(config.state_timeout.as_micros(), 2_000_000);
        // state changes are orders of magnitude slower than cycles
        assert!(config.state_timeout > config.cycle_timeout * 100);
        assert_eq!(config.station_offset, 0x1000);
    }
}
