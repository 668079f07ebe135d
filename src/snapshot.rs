use std::collections::BTreeMap;

use jiff::Timestamp;

use crate::registers::{Raw, Region, Value};

/// One decoded register.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Reading {
    pub region: Region,
    pub address: u16,
    pub raw: Raw,
    pub value: Value,
}

/// The readings of one completed poll cycle.
///
/// Registers that were reported as "no data", or belong to a region that could not be read, are
/// absent.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Snapshot {
    taken_at: Timestamp,
    readings: BTreeMap<String, Reading>,
}

impl Snapshot {
    pub fn new(taken_at: Timestamp, readings: BTreeMap<String, Reading>) -> Self {
        Self { taken_at, readings }
    }

    /// When the poll cycle that produced this snapshot was processed.
    pub fn taken_at(&self) -> Timestamp {
        self.taken_at
    }

    pub fn get(&self, id: &str) -> Option<&Reading> {
        self.readings.get(id)
    }

    pub fn value(&self, id: &str) -> Option<&Value> {
        self.get(id).map(|r| &r.value)
    }

    /// The value of `id` as a number, for numeric, enumerated and flag registers.
    pub fn number(&self, id: &str) -> Option<f64> {
        self.value(id)?.as_number()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Reading)> {
        self.readings.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Whether both snapshots hold the same readings, regardless of when they were taken.
    pub fn same_readings(&self, other: &Snapshot) -> bool {
        self.readings == other.readings
    }
}
