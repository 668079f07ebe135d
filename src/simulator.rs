use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::address_set::AddressSet;
use crate::connection::{Error, Exception, Reply, Transport};
use crate::registers::{Catalog, RegisterDescriptor, Region, Unit, encode_word};

/// What an injected failure looks like to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The device answers with this Modbus exception code.
    Exception(u8),
    /// The connection breaks down mid-request.
    Disconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    pub region: Region,
    pub address: u16,
    /// Register count for reads, the written value for writes.
    pub value: u16,
}

struct Image {
    values: Vec<u16>,
    readable: AddressSet,
}

impl Image {
    fn new() -> Self {
        Self { values: vec![0; usize::from(u16::MAX) + 1], readable: AddressSet::new() }
    }
}

struct State {
    reachable: bool,
    connected: bool,
    connects: usize,
    images: BTreeMap<Region, Image>,
    faults: BTreeMap<Region, Fault>,
    reads: Vec<Access>,
    writes: Vec<Access>,
}

impl State {
    fn image(&mut self, region: Region) -> &mut Image {
        self.images.entry(region).or_insert_with(Image::new)
    }

    /// Common checks for every request. `Ok(Err(_))` is a device exception.
    fn admit(&mut self, region: Region, address: u16, count: u16) -> Result<Reply<()>, Error> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        match self.faults.get(&region) {
            Some(Fault::Exception(code)) => return Ok(Err(Exception(*code))),
            Some(Fault::Disconnect) => {
                self.connected = false;
                return Err(Error::Receive(std::io::ErrorKind::ConnectionReset.into()));
            }
            None => {}
        }
        let mut requested = AddressSet::new();
        requested.insert_range(address, count);
        let end_in_range = u32::from(address) + u32::from(count) <= u32::from(u16::MAX) + 1;
        if count == 0 || !end_in_range || !requested.is_subset_of(&self.image(region).readable) {
            return Ok(Err(Exception(2)));
        }
        Ok(Ok(()))
    }
}

/// An in-memory heat pump.
///
/// Clones share the same device, so a test can keep a handle to adjust registers or inject
/// faults while a coordinator owns another.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// A reachable device with no readable registers.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                reachable: true,
                connected: false,
                connects: 0,
                images: BTreeMap::new(),
                faults: BTreeMap::new(),
                reads: Vec::new(),
                writes: Vec::new(),
            })),
        }
    }

    /// A device answering reads for every address from 0 up to the end of the highest register
    /// of each region in `catalog`. All values start out as zero.
    pub fn for_catalog(catalog: &Catalog) -> Self {
        let device = Self::new();
        let mut state = device.lock();
        for descriptor in catalog.iter() {
            let end = descriptor.address.saturating_add(descriptor.width - 1);
            let image = state.image(descriptor.region);
            image.readable.insert_range(0, end.saturating_add(1));
            if end == u16::MAX {
                image.readable.insert(u16::MAX);
            }
        }
        drop(state);
        device
    }

    /// A device with plausible readings for every register of `catalog`.
    pub fn demo(catalog: &Catalog) -> Self {
        let device = Self::for_catalog(catalog);
        let synthetic = catalog.synthetic();
        let bound = |binding: &Option<String>, descriptor: &RegisterDescriptor| {
            binding.as_deref() == Some(descriptor.id.as_str())
        };
        for descriptor in catalog.iter() {
            let value = if descriptor.region.is_bits() {
                0.0
            } else if let Some(polarity) = descriptor.edge {
                // Status registers report "inactive".
                if polarity.is_on(0) { 1.0 } else { 0.0 }
            } else if let Some(map) = &descriptor.enum_map {
                map.keys().next().map_or(0.0, |&k| f64::from(k))
            } else if bound(&synthetic.leaving, descriptor) {
                35.0
            } else if bound(&synthetic.return_, descriptor) {
                30.0
            } else if bound(&synthetic.flow, descriptor) {
                12.0
            } else if bound(&synthetic.electric_power, descriptor) {
                descriptor.unit.and_then(|u| u.to_watts(1.0)).map_or(0.6, |w| 600.0 / w)
            } else if let Some(limits) = descriptor.limits {
                limits.min
            } else if descriptor.unit == Some(Unit::Celsius) {
                20.0
            } else {
                0.0
            };
            let raw = encode_word((value / descriptor.scale).round() as i64, descriptor.signed);
            device.set(descriptor.region, descriptor.address, raw.unwrap_or(0));
        }
        device
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a raw register value (or a bit, as 0/1) and make the address readable.
    pub fn set(&self, region: Region, address: u16, value: u16) {
        let mut state = self.lock();
        let image = state.image(region);
        image.values[usize::from(address)] = if region.is_bits() { u16::from(value != 0) } else { value };
        image.readable.insert(address);
    }

    pub fn get(&self, region: Region, address: u16) -> Option<u16> {
        let mut state = self.lock();
        let image = state.image(region);
        image.readable.contains(address).then(|| image.values[usize::from(address)])
    }

    pub fn inject(&self, region: Region, fault: Fault) {
        self.lock().faults.insert(region, fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Make connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        state.reachable = reachable;
        if !reachable {
            state.connected = false;
        }
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn reads(&self) -> Vec<Access> {
        self.lock().reads.clone()
    }

    pub fn writes(&self) -> Vec<Access> {
        self.lock().writes.clone()
    }
}

impl Transport for SimulatedDevice {
    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn connect(&mut self) -> Result<(), Error> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(Error::Connect(std::io::ErrorKind::ConnectionRefused.into(), "demo".into()));
        }
        debug!(message = "simulated device connected");
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn read_words(&mut self, region: Region, address: u16, count: u16) -> Result<Reply<Vec<u16>>, Error> {
        let mut state = self.lock();
        state.reads.push(Access { region, address, value: count });
        if let Err(exception) = state.admit(region, address, count)? {
            return Ok(Err(exception));
        }
        let start = usize::from(address);
        let values = state.image(region).values[start..start + usize::from(count)].to_vec();
        trace!(message = "simulated read", %region, address, ?values);
        Ok(Ok(values))
    }

    async fn read_bits(&mut self, region: Region, address: u16, count: u16) -> Result<Reply<Vec<bool>>, Error> {
        let words = self.read_words(region, address, count).await?;
        Ok(words.map(|ws| ws.into_iter().map(|w| w != 0).collect()))
    }

    async fn write_single(&mut self, region: Region, address: u16, value: u16) -> Result<Reply<()>, Error> {
        let mut state = self.lock();
        state.writes.push(Access { region, address, value });
        if let Err(exception) = state.admit(region, address, 1)? {
            return Ok(Err(exception));
        }
        let image = state.image(region);
        image.values[usize::from(address)] = if region.is_bits() { u16::from(value != 0) } else { value };
        Ok(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_like_a_device() {
        let mut device = SimulatedDevice::new();
        device.set(Region::Holding, 5, 42);
        assert!(matches!(device.read_words(Region::Holding, 5, 1).await, Err(Error::NotConnected)));
        device.connect().await.unwrap();
        assert_eq!(device.read_words(Region::Holding, 5, 1).await.unwrap(), Ok(vec![42]));
        assert_eq!(device.read_words(Region::Holding, 5, 2).await.unwrap(), Err(Exception(2)));
        device.write_single(Region::Coil, 0, 0xFF00).await.unwrap().unwrap_err();
        device.set(Region::Coil, 0, 0);
        device.write_single(Region::Coil, 0, 0xFF00).await.unwrap().unwrap();
        assert_eq!(device.read_bits(Region::Coil, 0, 1).await.unwrap(), Ok(vec![true]));
        // Every request is recorded, including those refused for lack of a connection.
        assert_eq!(device.reads().len(), 4);
        assert_eq!(device.writes().len(), 2);
    }

    #[tokio::test]
    async fn injected_faults() {
        let mut device = SimulatedDevice::new();
        device.set(Region::Input, 0, 1);
        device.connect().await.unwrap();
        device.inject(Region::Input, Fault::Exception(4));
        assert_eq!(device.read_words(Region::Input, 0, 1).await.unwrap(), Err(Exception(4)));
        device.inject(Region::Input, Fault::Disconnect);
        assert!(device.read_words(Region::Input, 0, 1).await.is_err());
        assert!(!device.is_connected());
        device.set_reachable(false);
        assert!(device.connect().await.is_err());
        device.set_reachable(true);
        device.clear_faults();
        device.connect().await.unwrap();
        assert_eq!(device.read_words(Region::Input, 0, 1).await.unwrap(), Ok(vec![1]));
        assert_eq!(device.connects(), 2);
    }

    #[test]
    fn demo_values() {
        let catalog = Catalog::altherma4().unwrap();
        let device = SimulatedDevice::demo(&catalog);
        // Wire address of manual register 39.
        assert_eq!(device.get(Region::Input, 38), Some(3500));
        assert_eq!(device.get(Region::Input, 49), Some(60));
        assert_eq!(device.get(Region::Input, 0), Some(0));
        assert_eq!(device.get(Region::Coil, 2), Some(0));
        assert_eq!(device.get(Region::Coil, 3), None);
    }
}
