//! One poll cycle: plan the block reads, issue them, and decode the result into a snapshot.
use std::collections::BTreeMap;

use jiff::Timestamp;
use strum::VariantArray as _;
use tracing::{debug, info, trace, warn};

use crate::address_set::AddressSet;
use crate::connection::{self, Exception, Transport};
use crate::registers::{Catalog, Region};
use crate::snapshot::{Reading, Snapshot};

#[derive(thiserror::Error, Debug)]
pub enum PollError {
    #[error("could not connect to the heat pump")]
    Connection(#[source] connection::Error),
    #[error("the heat pump rejected reading {count} {region} registers at {address}: {exception}")]
    Protocol { region: Region, address: u16, count: u16, exception: Exception },
    #[error("reading {region} registers at {address} failed")]
    Transport {
        region: Region,
        address: u16,
        #[source]
        source: connection::Error,
    },
}

/// Where the read of the input region starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputStart {
    /// Read from address 0, even though the lowest catalogued register is much higher. This is
    /// known to work with the Altherma 4.
    #[default]
    Zero,
    /// Read from the lowest catalogued register.
    Minimum,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRead {
    pub region: Region,
    pub address: u16,
    pub count: u16,
}

/// The block reads of one poll cycle, primary region first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadPlan {
    reads: Vec<BlockRead>,
}

impl ReadPlan {
    pub fn new(catalog: &Catalog, input_start: InputStart) -> Self {
        let mut reads = Vec::new();
        for &region in Region::VARIANTS {
            let mut addresses = AddressSet::new();
            for descriptor in catalog.region(region) {
                addresses.insert_range(descriptor.address, descriptor.width);
            }
            let (Some(first), Some(last)) = (addresses.first(), addresses.last()) else {
                continue;
            };
            let start = match input_start {
                InputStart::Zero if region.is_primary() => 0,
                _ => first,
            };
            addresses.insert(start);
            let limit = region.max_read_count();
            let span = u32::from(last) - u32::from(start) + 1;
            if span <= u32::from(limit) {
                reads.push(BlockRead { region, address: start, count: span as u16 });
                continue;
            }
            for range in addresses.find_optimal_ranges(limit) {
                let count = range.end() - range.start() + 1;
                reads.push(BlockRead { region, address: *range.start(), count });
            }
        }
        Self { reads }
    }

    pub fn reads(&self) -> &[BlockRead] {
        &self.reads
    }
}

/// Data returned by one block read. Bits are stored as 0 or 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub region: Region,
    pub address: u16,
    pub values: Vec<u16>,
}

impl Block {
    fn get(&self, address: u16) -> Option<u16> {
        let offset = address.checked_sub(self.address)?;
        self.values.get(usize::from(offset)).copied()
    }
}

/// Everything read during a cycle.
#[derive(Clone, Debug, Default)]
pub struct Fetched {
    blocks: Vec<Block>,
    skipped: Vec<Region>,
}

impl Fetched {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks, skipped: Vec::new() }
    }

    pub fn word(&self, region: Region, address: u16) -> Option<u16> {
        self.blocks.iter().filter(|b| b.region == region).find_map(|b| b.get(address))
    }

    pub fn words(&self, region: Region, address: u16, width: u16) -> Option<Vec<u16>> {
        (0..width).map(|offset| self.word(region, address.checked_add(offset)?)).collect()
    }

    /// Whether the region could not be read this cycle.
    pub fn is_skipped(&self, region: Region) -> bool {
        self.skipped.contains(&region)
    }

    fn skip(&mut self, region: Region) {
        self.blocks.retain(|b| b.region != region);
        self.skipped.push(region);
    }
}

/// Issue the planned reads one after another.
///
/// A failed read of the primary region fails the cycle. Other regions are left out of this cycle
/// when any of their reads fails. If such a failure drops the connection, one reconnect is
/// attempted so that the remaining regions can still be read.
pub async fn fetch<T: Transport>(transport: &mut T, plan: &ReadPlan) -> Result<Fetched, PollError> {
    let mut fetched = Fetched::default();
    let mut reconnected = false;
    for read in plan.reads() {
        if fetched.is_skipped(read.region) {
            continue;
        }
        match read_block(transport, read).await {
            Ok(block) => fetched.blocks.push(block),
            Err(error) if read.region.is_primary() => return Err(error),
            Err(error) => {
                warn!(
                    message = "could not read region, leaving it out of this cycle",
                    region = %read.region,
                    address = read.address,
                    error = &error as &dyn std::error::Error,
                );
                fetched.skip(read.region);
                if transport.is_connected() || reconnected {
                    continue;
                }
                reconnected = true;
                match transport.connect().await {
                    Ok(()) => info!(message = "reconnected after a failed read", region = %read.region),
                    Err(e) => warn!(
                        message = "could not reconnect, remaining regions will be missing",
                        error = &e as &dyn std::error::Error,
                    ),
                }
            }
        }
    }
    Ok(fetched)
}

async fn read_block<T: Transport>(transport: &mut T, read: &BlockRead) -> Result<Block, PollError> {
    let BlockRead { region, address, count } = *read;
    debug!(message = "reading block", %region, address, count);
    let transport_error = |source: connection::Error| PollError::Transport { region, address, source };
    let reply = if region.is_bits() {
        let bits = transport.read_bits(region, address, count).await.map_err(transport_error)?;
        bits.map(|bits| bits.into_iter().map(u16::from).collect())
    } else {
        transport.read_words(region, address, count).await.map_err(transport_error)?
    };
    let values = reply.map_err(|exception| PollError::Protocol { region, address, count, exception })?;
    Ok(Block { region, address, values })
}

/// Decode every catalogued register from the fetched blocks.
pub fn decode(catalog: &Catalog, fetched: &Fetched, taken_at: Timestamp) -> Snapshot {
    let mut readings = BTreeMap::new();
    for descriptor in catalog.iter() {
        let region = descriptor.region;
        let address = descriptor.address;
        if fetched.is_skipped(region) {
            continue;
        }
        let Some(words) = fetched.words(region, address, descriptor.width) else {
            warn!(
                message = "register was not covered by the fetched data",
                id = descriptor.id.as_str(),
                %region,
                address,
            );
            continue;
        };
        let decoded = if region.is_bits() {
            Some(descriptor.decode_bit(words[0] != 0))
        } else {
            descriptor.decode_words(&words)
        };
        let Some((raw, value)) = decoded else {
            trace!(message = "no data", id = descriptor.id.as_str());
            continue;
        };
        readings.insert(descriptor.id.clone(), Reading { region, address, raw, value });
    }
    Snapshot::new(taken_at, readings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{AddressBase, NO_DATA, Raw, RegisterSpec, Value};
    use crate::simulator::{Fault, SimulatedDevice};

    fn read(region: Region, address: u16, count: u16) -> BlockRead {
        BlockRead { region, address, count }
    }

    #[test]
    fn plans_built_in_catalog() {
        let catalog = Catalog::altherma4().unwrap();
        let plan = ReadPlan::new(&catalog, InputStart::Zero);
        assert_eq!(plan.reads(), [
            read(Region::Input, 0, 82),
            read(Region::Holding, 1, 66),
            read(Region::Discrete, 0, 26),
            read(Region::Coil, 0, 3),
        ]);
        let plan = ReadPlan::new(&catalog, InputStart::Minimum);
        assert_eq!(plan.reads()[0], read(Region::Input, 19, 63));
    }

    #[test]
    fn splits_long_ranges() {
        let specs = vec![
            RegisterSpec::new(Region::Input, 300, "far", "far"),
            RegisterSpec::new(Region::Input, 301, "farther", "farther"),
        ]
        .into_iter()
        .chain((0..200).map(|a| RegisterSpec::new(Region::Holding, a, &format!("h{a}"), "h")))
        .collect();
        let catalog = Catalog::new(AddressBase::Zero, specs, Default::default()).unwrap();
        let plan = ReadPlan::new(&catalog, InputStart::Zero);
        assert_eq!(plan.reads(), [
            read(Region::Input, 0, 1),
            read(Region::Input, 300, 2),
            read(Region::Holding, 0, 123),
            read(Region::Holding, 123, 77),
        ]);
        let plan = ReadPlan::new(&catalog, InputStart::Minimum);
        assert_eq!(plan.reads()[0], read(Region::Input, 300, 2));
    }

    fn small_catalog() -> Catalog {
        Catalog::new(
            AddressBase::Zero,
            vec![
                RegisterSpec::new(Region::Input, 2, "temp", "t").signed().scale(0.01).sentinel(NO_DATA),
                RegisterSpec::new(Region::Input, 3, "mode", "m").labels(&[(0, "Off"), (1, "On")]),
                RegisterSpec::new(Region::Holding, 1, "offset", "o").signed(),
                RegisterSpec::new(Region::Discrete, 4, "defrost", "d"),
                RegisterSpec::new(Region::Coil, 0, "dhw", "dhw"),
            ],
            Default::default(),
        )
        .unwrap()
    }

    #[test]
    fn decodes_blocks() {
        let catalog = small_catalog();
        let fetched = Fetched::new(vec![
            Block { region: Region::Input, address: 0, values: vec![0, 0, 65036, 9] },
            Block { region: Region::Holding, address: 1, values: vec![65533] },
            Block { region: Region::Discrete, address: 0, values: vec![0, 0, 0, 0, 1] },
        ]);
        let snapshot = decode(&catalog, &fetched, Timestamp::UNIX_EPOCH);
        assert!((snapshot.number("temp").unwrap() + 5.0).abs() < 1e-9);
        // Unknown enum keys are kept as-is.
        assert_eq!(snapshot.value("mode"), Some(&Value::Enum(9)));
        assert_eq!(snapshot.number("offset"), Some(-3.0));
        assert_eq!(snapshot.get("defrost").unwrap().raw, Raw::Bit(true));
        // The coil block is missing entirely.
        assert_eq!(snapshot.get("dhw"), None);
        assert_eq!(snapshot.taken_at(), Timestamp::UNIX_EPOCH);
    }

    #[test]
    fn omits_sentinels() {
        let catalog = small_catalog();
        let fetched = Fetched::new(vec![Block { region: Region::Input, address: 2, values: vec![NO_DATA, 1] }]);
        let snapshot = decode(&catalog, &fetched, Timestamp::UNIX_EPOCH);
        assert_eq!(snapshot.get("temp"), None);
        assert_eq!(snapshot.value("mode"), Some(&Value::Enum(1)));
    }

    #[tokio::test]
    async fn secondary_failures_degrade() {
        let catalog = small_catalog();
        let mut device = SimulatedDevice::for_catalog(&catalog);
        device.set(Region::Input, 2, 3000);
        device.set(Region::Coil, 0, 1);
        device.connect().await.unwrap();
        device.inject(Region::Discrete, Fault::Exception(2));
        let plan = ReadPlan::new(&catalog, InputStart::Zero);
        let fetched = fetch(&mut device, &plan).await.unwrap();
        assert!(fetched.is_skipped(Region::Discrete));
        let snapshot = decode(&catalog, &fetched, Timestamp::UNIX_EPOCH);
        assert_eq!(snapshot.get("defrost"), None);
        assert_eq!(snapshot.number("temp"), Some(30.0));
        assert_eq!(snapshot.value("dhw"), Some(&Value::Flag(true)));
    }

    #[tokio::test]
    async fn reconnects_after_secondary_transport_failure() {
        let catalog = small_catalog();
        let mut device = SimulatedDevice::for_catalog(&catalog);
        device.set(Region::Input, 2, 3000);
        device.set(Region::Coil, 0, 1);
        device.connect().await.unwrap();
        device.inject(Region::Discrete, Fault::Disconnect);
        let plan = ReadPlan::new(&catalog, InputStart::Zero);
        let fetched = fetch(&mut device, &plan).await.unwrap();
        assert!(fetched.is_skipped(Region::Discrete));
        assert!(!fetched.is_skipped(Region::Coil));
        assert_eq!(device.connects(), 2);
        let snapshot = decode(&catalog, &fetched, Timestamp::UNIX_EPOCH);
        assert_eq!(snapshot.get("defrost"), None);
        assert_eq!(snapshot.number("temp"), Some(30.0));
        assert_eq!(snapshot.number("offset"), Some(0.0));
        assert_eq!(snapshot.value("dhw"), Some(&Value::Flag(true)));
    }

    #[tokio::test]
    async fn reconnects_once_per_cycle() {
        let catalog = small_catalog();
        let mut device = SimulatedDevice::for_catalog(&catalog);
        device.connect().await.unwrap();
        device.inject(Region::Holding, Fault::Disconnect);
        device.inject(Region::Discrete, Fault::Disconnect);
        let plan = ReadPlan::new(&catalog, InputStart::Zero);
        let fetched = fetch(&mut device, &plan).await.unwrap();
        assert!(fetched.is_skipped(Region::Holding));
        assert!(fetched.is_skipped(Region::Discrete));
        // The second drop is not followed by another reconnect, so the coils can't be read.
        assert!(fetched.is_skipped(Region::Coil));
        assert_eq!(device.connects(), 2);
    }

    #[tokio::test]
    async fn primary_failures_abort() {
        let catalog = small_catalog();
        let mut device = SimulatedDevice::for_catalog(&catalog);
        device.connect().await.unwrap();
        device.inject(Region::Input, Fault::Exception(4));
        let plan = ReadPlan::new(&catalog, InputStart::Zero);
        let error = fetch(&mut device, &plan).await.unwrap_err();
        assert!(matches!(
            error,
            PollError::Protocol { region: Region::Input, address: 0, count: 4, exception: Exception(4) }
        ));
        // Nothing else is attempted once the primary region failed.
        assert_eq!(device.reads().len(), 1);

        device.inject(Region::Input, Fault::Disconnect);
        let error = fetch(&mut device, &plan).await.unwrap_err();
        assert!(matches!(error, PollError::Transport { region: Region::Input, .. }));
    }
}
