//! State derived from consecutive snapshots: rising-edge timestamps and synthetic values.
use std::collections::BTreeMap;

use jiff::Timestamp;
use tracing::debug;

use crate::registers::{Catalog, Unit};
use crate::snapshot::Snapshot;

/// Heat carried by water, in W per (L/min · K). 4186 J/(kg·K) at 1 kg/L over 60 s, rounded.
pub const HEAT_CONSTANT: f64 = 70.0;

/// Remembers when each tracked register last turned on.
#[derive(Clone, Debug, Default)]
pub struct TransitionTracker {
    last_rising: BTreeMap<String, Timestamp>,
}

impl TransitionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `now` for every tracked register that is on in `current` but was not on in
    /// `previous`. Returns the ids that turned on.
    ///
    /// A register missing from either snapshot counts as off there, so the first cycle records
    /// every register that is already on.
    pub fn update(
        &mut self,
        catalog: &Catalog,
        previous: Option<&Snapshot>,
        current: &Snapshot,
        now: Timestamp,
    ) -> Vec<String> {
        let mut risen = Vec::new();
        for (descriptor, polarity) in catalog.tracked() {
            let is_on = |snapshot: Option<&Snapshot>| {
                snapshot
                    .and_then(|s| s.get(&descriptor.id))
                    .and_then(|r| r.raw.first_word())
                    .is_some_and(|raw| polarity.is_on(raw))
            };
            if is_on(Some(current)) && !is_on(previous) {
                debug!(message = "rising edge", id = descriptor.id.as_str(), %now);
                self.last_rising.insert(descriptor.id.clone(), now);
                risen.push(descriptor.id.clone());
            }
        }
        risen
    }

    pub fn last(&self, id: &str) -> Option<Timestamp> {
        self.last_rising.get(id).copied()
    }

    pub fn all(&self) -> &BTreeMap<String, Timestamp> {
        &self.last_rising
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    strum::Display,
    strum::EnumString,
    strum::VariantArray,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyntheticKind {
    /// Heat delivered to the water circuit, in W.
    HeatPower,
    /// Coefficient of performance: heat delivered per unit of electrical power.
    Cop,
    /// Leaving minus return water temperature, in °C.
    DeltaT,
}

impl SyntheticKind {
    pub fn name(self) -> &'static str {
        match self {
            SyntheticKind::HeatPower => "Heat output",
            SyntheticKind::Cop => "Coefficient of performance",
            SyntheticKind::DeltaT => "Leaving minus return water temperature",
        }
    }

    pub fn unit(self) -> Option<Unit> {
        match self {
            SyntheticKind::HeatPower => Some(Unit::Watts),
            SyntheticKind::Cop => None,
            SyntheticKind::DeltaT => Some(Unit::Celsius),
        }
    }
}

pub fn delta_t(leaving: f64, return_: f64) -> f64 {
    leaving - return_
}

pub fn heat_power(flow_l_min: f64, delta_t: f64) -> f64 {
    flow_l_min * delta_t * HEAT_CONSTANT
}

/// `None` unless both the heat output and the electrical power are positive.
pub fn cop(heat_power: f64, electric_power: f64) -> Option<f64> {
    (heat_power > 0.0 && electric_power > 0.0).then(|| heat_power / electric_power)
}

fn bound_number(snapshot: &Snapshot, binding: &Option<String>) -> Option<f64> {
    snapshot.number(binding.as_deref()?)
}

/// Electrical power draw in W.
///
/// An externally measured value takes precedence over the heat pump's own power register.
pub fn electric_power(catalog: &Catalog, snapshot: &Snapshot, external: Option<f64>) -> Option<f64> {
    if external.is_some() {
        return external;
    }
    let id = catalog.synthetic().electric_power.as_deref()?;
    let value = snapshot.number(id)?;
    match catalog.get(id)?.unit {
        None => Some(value),
        Some(unit) => unit.to_watts(value),
    }
}

/// Compute a synthetic value from the snapshot. `None` when any input is unavailable.
pub fn compute(
    kind: SyntheticKind,
    catalog: &Catalog,
    snapshot: &Snapshot,
    external_power: Option<f64>,
) -> Option<f64> {
    let bindings = catalog.synthetic();
    let delta = || {
        Some(delta_t(
            bound_number(snapshot, &bindings.leaving)?,
            bound_number(snapshot, &bindings.return_)?,
        ))
    };
    let heat = || Some(heat_power(bound_number(snapshot, &bindings.flow)?, delta()?));
    match kind {
        SyntheticKind::DeltaT => delta(),
        SyntheticKind::HeatPower => heat(),
        SyntheticKind::Cop => cop(heat()?, electric_power(catalog, snapshot, external_power)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{AddressBase, EdgePolarity, Raw, Region, RegisterSpec, SyntheticBindings, Value};
    use crate::snapshot::Reading;

    fn catalog() -> Catalog {
        Catalog::new(
            AddressBase::Zero,
            vec![
                RegisterSpec::new(Region::Input, 0, "compressor", "c").edge(EdgePolarity::RisingOnZero),
                RegisterSpec::new(Region::Input, 1, "error", "e").edge(EdgePolarity::RisingOnOne),
                RegisterSpec::new(Region::Discrete, 0, "defrost", "d").edge(EdgePolarity::RisingOnOne),
                RegisterSpec::new(Region::Input, 2, "flow", "f").scale(0.01).unit(Unit::LitresPerMinute),
                RegisterSpec::new(Region::Input, 3, "lwt", "l").signed().scale(0.01).unit(Unit::Celsius),
                RegisterSpec::new(Region::Input, 4, "rwt", "r").signed().scale(0.01).unit(Unit::Celsius),
                RegisterSpec::new(Region::Input, 5, "power", "p").scale(0.01).unit(Unit::Kilowatts),
            ],
            SyntheticBindings {
                flow: Some("flow".into()),
                leaving: Some("lwt".into()),
                return_: Some("rwt".into()),
                electric_power: Some("power".into()),
            },
        )
        .unwrap()
    }

    fn snapshot(catalog: &Catalog, at: i64, raw: &[(&str, u16)]) -> Snapshot {
        let readings = raw
            .iter()
            .map(|&(id, word)| {
                let descriptor = catalog.get(id).unwrap();
                let (raw, value) = if descriptor.region.is_bits() {
                    descriptor.decode_bit(word != 0)
                } else {
                    descriptor.decode_words(&[word]).unwrap()
                };
                let reading = Reading { region: descriptor.region, address: descriptor.address, raw, value };
                (id.to_string(), reading)
            })
            .collect();
        Snapshot::new(Timestamp::from_second(at).unwrap(), readings)
    }

    #[test]
    fn rising_edges() {
        let catalog = catalog();
        let mut tracker = TransitionTracker::new();
        let t = |s| Timestamp::from_second(s).unwrap();

        // Compressor reads 0 while running; the first cycle counts as a rising edge.
        let first = snapshot(&catalog, 10, &[("compressor", 0), ("error", 0), ("defrost", 0)]);
        assert_eq!(tracker.update(&catalog, None, &first, t(10)), ["compressor"]);
        assert_eq!(tracker.last("compressor"), Some(t(10)));
        assert_eq!(tracker.last("error"), None);

        // Staying on is not a new edge.
        let second = snapshot(&catalog, 20, &[("compressor", 0), ("error", 1), ("defrost", 1)]);
        assert_eq!(tracker.update(&catalog, Some(&first), &second, t(20)), ["error", "defrost"]);
        assert_eq!(tracker.last("compressor"), Some(t(10)));

        // Falling edges keep the old timestamp.
        let third = snapshot(&catalog, 30, &[("compressor", 1), ("error", 0)]);
        assert!(tracker.update(&catalog, Some(&second), &third, t(30)).is_empty());
        assert_eq!(tracker.last("error"), Some(t(20)));
        assert_eq!(tracker.last("defrost"), Some(t(20)));

        let fourth = snapshot(&catalog, 40, &[("compressor", 0)]);
        assert_eq!(tracker.update(&catalog, Some(&third), &fourth, t(40)), ["compressor"]);
        assert_eq!(tracker.last("compressor"), Some(t(40)));
        assert_eq!(tracker.all().len(), 3);
    }

    #[test]
    fn heat_power_and_cop() {
        let catalog = catalog();
        let snapshot = snapshot(&catalog, 0, &[("flow", 1200), ("lwt", 3500), ("rwt", 3000), ("power", 60)]);
        let delta = compute(SyntheticKind::DeltaT, &catalog, &snapshot, None).unwrap();
        assert!((delta - 5.0).abs() < 1e-9);
        let heat = compute(SyntheticKind::HeatPower, &catalog, &snapshot, None).unwrap();
        assert!((heat - 4200.0).abs() < 1e-6);
        let cop_value = compute(SyntheticKind::Cop, &catalog, &snapshot, None).unwrap();
        assert!((cop_value - 7.0).abs() < 1e-9);
        // An external meter takes precedence.
        let cop_value = compute(SyntheticKind::Cop, &catalog, &snapshot, Some(1400.0)).unwrap();
        assert!((cop_value - 3.0).abs() < 1e-9);
    }

    #[test]
    fn cop_needs_positive_inputs() {
        let catalog = catalog();
        let idle = snapshot(&catalog, 0, &[("flow", 1200), ("lwt", 3500), ("rwt", 3000), ("power", 0)]);
        assert_eq!(compute(SyntheticKind::Cop, &catalog, &idle, None), None);
        let cooling = snapshot(&catalog, 0, &[("flow", 1200), ("lwt", 1800), ("rwt", 2300), ("power", 60)]);
        assert!(compute(SyntheticKind::HeatPower, &catalog, &cooling, None).unwrap() < 0.0);
        assert_eq!(compute(SyntheticKind::Cop, &catalog, &cooling, None), None);
        let no_flow = snapshot(&catalog, 0, &[("lwt", 3500), ("rwt", 3000), ("power", 60)]);
        assert_eq!(compute(SyntheticKind::HeatPower, &catalog, &no_flow, None), None);
        assert_eq!(cop(4200.0, 600.0), Some(7.0));
        assert_eq!(cop(4200.0, -1.0), None);
        assert_eq!(snapshot(&catalog, 0, &[("power", 1)]).value("power"), Some(&Value::Number(0.01)));
        assert_eq!(snapshot(&catalog, 0, &[("defrost", 1)]).get("defrost").unwrap().raw, Raw::Bit(true));
    }
}
