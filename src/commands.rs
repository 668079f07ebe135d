use std::sync::Arc;

use jiff::Timestamp;
use strum::VariantArray as _;
use tracing::warn;

use crate::connection::{self, Link};
use crate::coordinator::{self, Coordinator};
use crate::derived::SyntheticKind;
use crate::output::{self, Output};
use crate::power::{self, HomeAssistantPower};
use crate::registers::{self, CatalogError, Raw, RegisterDescriptor, Region, Unit, Value};
use crate::snapshot::Snapshot;

/// Everything needed to talk to the heat pump.
#[derive(clap::Parser, Clone)]
#[group(id = "commands::DeviceArgs")]
pub struct DeviceArgs {
    #[clap(flatten)]
    connection: connection::Args,
    #[clap(flatten)]
    catalog: registers::Args,
    #[clap(flatten)]
    options: coordinator::Options,
    #[clap(flatten)]
    power: power::Args,
}

#[derive(thiserror::Error, Debug)]
pub enum OpenError {
    #[error("could not load the register catalog")]
    Catalog(#[source] CatalogError),
    #[error("could not set up the external power source")]
    Power(#[source] power::Error),
}

struct Device {
    coordinator: Coordinator<Link>,
    power: Option<Arc<HomeAssistantPower>>,
}

impl DeviceArgs {
    async fn open(&self) -> Result<Device, OpenError> {
        let catalog = Arc::new(self.catalog.load().map_err(OpenError::Catalog)?);
        let link = self.connection.open(&catalog);
        let mut coordinator = Coordinator::new(catalog, link, self.options.clone());
        let power = HomeAssistantPower::from_args(&self.power).await.map_err(OpenError::Power)?.map(Arc::new);
        if let Some(power) = &power {
            coordinator = coordinator.with_power_source(Arc::clone(power) as _);
        }
        Ok(Device { coordinator, power })
    }
}

impl Device {
    async fn refresh_power(&self) {
        let Some(power) = &self.power else { return };
        if let Err(e) = power.refresh().await {
            warn!(message = "could not refresh the external power reading", error = &e as &dyn std::error::Error);
        }
    }
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

fn is_match(descriptor: &RegisterDescriptor, pattern: &str) -> bool {
    let pattern = pattern.to_lowercase();
    descriptor.id.contains(&pattern)
        || descriptor.name.to_lowercase().contains(&pattern)
        || descriptor.address.to_string() == pattern
}

fn value_text(value: &Value, label: Option<&str>) -> String {
    match (value, label) {
        (Value::Enum(key), Some(label)) => format!("{label} ({key})"),
        _ => value.to_string(),
    }
}

const READING_HEADERS: &[&str] = &["Time", "Id", "Name", "Value", "Unit", "Raw", "Last on"];

#[derive(serde::Serialize)]
struct ReadingRecord<'a> {
    taken_at: Timestamp,
    id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<Region>,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<&'a Raw>,
    value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<&'a str>,
    unit: Option<Unit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_on: Option<Timestamp>,
}

/// Output every reading of `snapshot` followed by the synthetic values.
fn emit(
    coordinator: &Coordinator<Link>,
    snapshot: &Snapshot,
    filter: Option<&str>,
    out: &mut Output,
) -> Result<(), output::Error> {
    let transitions = coordinator.transitions();
    let taken_at = snapshot.taken_at();
    for descriptor in coordinator.catalog().iter() {
        if !filter.is_none_or(|f| is_match(descriptor, f)) {
            continue;
        }
        let Some(reading) = snapshot.get(&descriptor.id) else { continue };
        let last_on = transitions.get(&descriptor.id).copied();
        let label = match reading.value {
            Value::Enum(key) => descriptor.label(key),
            _ => None,
        };
        out.record(
            || {
                vec![
                    taken_at.to_string(),
                    descriptor.id.clone(),
                    descriptor.name.clone(),
                    value_text(&reading.value, label),
                    descriptor.unit.map(|u| u.to_string()).unwrap_or_default(),
                    reading.raw.to_string(),
                    last_on.map(|t| t.to_string()).unwrap_or_default(),
                ]
            },
            || ReadingRecord {
                taken_at,
                id: &descriptor.id,
                name: &descriptor.name,
                region: Some(reading.region),
                address: Some(reading.address),
                raw: Some(&reading.raw),
                value: reading.value.clone(),
                label,
                unit: descriptor.unit,
                last_on,
            },
        )?;
    }
    for &kind in SyntheticKind::VARIANTS {
        let id = kind.to_string();
        if !filter.is_none_or(|f| id.contains(&f.to_lowercase())) {
            continue;
        }
        let Some(value) = coordinator.get_synthetic(kind) else { continue };
        let value = Value::Number(value);
        out.record(
            || {
                vec![
                    taken_at.to_string(),
                    id.clone(),
                    kind.name().to_string(),
                    value.to_string(),
                    kind.unit().map(|u| u.to_string()).unwrap_or_default(),
                    String::new(),
                    String::new(),
                ]
            },
            || ReadingRecord {
                taken_at,
                id: &id,
                name: kind.name(),
                region: None,
                address: None,
                raw: None,
                value: value.clone(),
                label: None,
                unit: kind.unit(),
                last_on: None,
            },
        )?;
    }
    Ok(())
}

pub mod registers_list {
    use super::*;

    /// Search and output the registers of the catalog.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only list registers whose id or name contains this text, or whose address is this
        /// number.
        filter: Option<String>,
        #[clap(flatten)]
        catalog: registers::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the register catalog")]
        Catalog(#[source] CatalogError),
        #[error("could not output the register list")]
        Output(#[source] output::Error),
    }

    const HEADERS: &[&str] =
        &["Region", "Address", "Id", "Name", "Type", "Scale", "Unit", "Writable", "Options", "Tracked"];

    fn type_name(descriptor: &RegisterDescriptor) -> String {
        match descriptor {
            d if d.region.is_bits() => "bit".to_string(),
            d if d.text => format!("text[{}]", d.width),
            d if d.width > 1 => format!("u16[{}]", d.width),
            d if d.signed => "i16".to_string(),
            _ => "u16".to_string(),
        }
    }

    fn options(descriptor: &RegisterDescriptor) -> String {
        if let Some(map) = &descriptor.enum_map {
            return map.iter().map(|(k, v)| format!("{k}: {v}")).collect::<Vec<_>>().join(", ");
        }
        match descriptor.limits {
            Some(limits) => match limits.step {
                Some(step) => format!("{}..={} step {step}", limits.min, limits.max),
                None => format!("{}..={}", limits.min, limits.max),
            },
            None => String::new(),
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let catalog = args.catalog.load().map_err(Error::Catalog)?;
        let mut out = args.output.to_output(HEADERS).map_err(Error::Output)?;
        for descriptor in catalog.iter() {
            if !args.filter.as_deref().is_none_or(|f| is_match(descriptor, f)) {
                continue;
            }
            out.record(
                || {
                    vec![
                        descriptor.region.to_string(),
                        descriptor.address.to_string(),
                        descriptor.id.clone(),
                        descriptor.name.clone(),
                        type_name(descriptor),
                        descriptor.scale.to_string(),
                        descriptor.unit.map(|u| u.to_string()).unwrap_or_default(),
                        if descriptor.region.is_writable() { "yes".into() } else { String::new() },
                        options(descriptor),
                        descriptor.edge.map(|e| e.to_string()).unwrap_or_default(),
                    ]
                },
                || descriptor,
            )
            .map_err(Error::Output)?;
        }
        out.commit().map_err(Error::Output)
    }
}

pub mod read {
    use super::*;

    /// Poll the heat pump once and output every reading.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only output readings whose id or name contains this text.
        filter: Option<String>,
        #[clap(flatten)]
        device: DeviceArgs,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the heat pump connection")]
        Open(#[source] OpenError),
        #[error("could not read the heat pump")]
        Poll(#[source] crate::poll::PollError),
        #[error("could not output the readings")]
        Output(#[source] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime().map_err(Error::Runtime)?.block_on(async move {
            let device = args.device.open().await.map_err(Error::Open)?;
            let mut out = args.output.to_output(READING_HEADERS).map_err(Error::Output)?;
            device.refresh_power().await;
            let snapshot = device.coordinator.poll().await.map_err(Error::Poll)?;
            emit(&device.coordinator, &snapshot, args.filter.as_deref(), &mut out).map_err(Error::Output)?;
            out.commit().map_err(Error::Output)
        })
    }
}

pub mod watch {
    use super::*;
    use futures::{Stream, StreamExt as _};
    use tokio::time::MissedTickBehavior;
    use tokio_stream::wrappers::IntervalStream;

    use crate::poll::PollError;

    /// Poll the heat pump periodically and output the readings after every cycle.
    ///
    /// Failed cycles are logged and skipped; the next cycle tries to reconnect.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only output readings whose id or name contains this text.
        filter: Option<String>,
        /// Time between poll cycles.
        #[arg(long, default_value = "15s")]
        interval: humantime::Duration,
        /// Stop after this many cycles, successful or not.
        #[arg(long)]
        count: Option<usize>,
        #[clap(flatten)]
        device: DeviceArgs,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the heat pump connection")]
        Open(#[source] OpenError),
        #[error("could not output the readings")]
        Output(#[source] output::Error),
    }

    fn cycles(device: &Device, mut ticks: IntervalStream) -> impl Stream<Item = Result<Arc<Snapshot>, PollError>> + '_ {
        async_stream::stream! {
            while ticks.next().await.is_some() {
                device.refresh_power().await;
                yield device.coordinator.poll().await;
            }
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime().map_err(Error::Runtime)?.block_on(async move {
            let device = args.device.open().await.map_err(Error::Open)?;
            let mut out = args.output.to_output(READING_HEADERS).map_err(Error::Output)?;
            let mut interval = tokio::time::interval(*args.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let cycles = cycles(&device, IntervalStream::new(interval)).take(args.count.unwrap_or(usize::MAX));
            let mut cycles = std::pin::pin!(cycles);
            while let Some(outcome) = cycles.next().await {
                // The coordinator has already logged the failure.
                let Ok(snapshot) = outcome else { continue };
                emit(&device.coordinator, &snapshot, args.filter.as_deref(), &mut out).map_err(Error::Output)?;
                out.flush().map_err(Error::Output)?;
            }
            out.commit().map_err(Error::Output)
        })
    }
}

pub mod write {
    use super::*;
    use crate::coordinator::WriteError;

    /// Write a holding register or coil.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Id of the register, as listed by the `registers` command.
        id: String,
        /// The value in engineering units, or the label of an option.
        #[arg(allow_negative_numbers = true)]
        value: String,
        #[clap(flatten)]
        device: DeviceArgs,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the heat pump connection")]
        Open(#[source] OpenError),
        #[error("could not write the register")]
        Write(#[source] WriteError),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime().map_err(Error::Runtime)?.block_on(async move {
            let device = args.device.open().await.map_err(Error::Open)?;
            let coordinator = &device.coordinator;
            let written = match args.value.trim().parse::<f64>() {
                Ok(value) => coordinator.write(&args.id, value).await,
                Err(_) => coordinator.write_option(&args.id, &args.value).await,
            };
            written.map_err(Error::Write)?;
            let descriptor = coordinator.catalog().get(&args.id);
            match (descriptor, coordinator.get(&args.id)) {
                (Some(descriptor), Some(reading)) => {
                    let label = match reading.value {
                        Value::Enum(key) => descriptor.label(key),
                        _ => None,
                    };
                    let unit = descriptor.unit.map(|u| format!(" {u}")).unwrap_or_default();
                    tracing::info!(
                        message = "register now reads",
                        id = args.id.as_str(),
                        value = %value_text(&reading.value, label),
                        unit = unit.trim(),
                    );
                }
                _ => tracing::info!(message = "written", id = args.id.as_str()),
            }
            Ok::<(), Error>(())
        })
    }
}
