use std::collections::BTreeMap;
use std::sync::Arc;

use jiff::Timestamp;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::connection::{self, Exception, Transport};
use crate::derived::{self, SyntheticKind, TransitionTracker};
use crate::poll::{self, InputStart, PollError, ReadPlan};
use crate::power::PowerSource;
use crate::registers::{Catalog, EncodeError};
use crate::snapshot::{Reading, Snapshot};

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("no register is called `{0}`")]
    UnknownRegister(String),
    #[error("`{0}` has no option called `{1}`")]
    UnknownLabel(String, String),
    #[error("cannot write to `{id}`")]
    Encode {
        id: String,
        #[source]
        source: EncodeError,
    },
    #[error("could not connect to the heat pump")]
    Connection(#[source] connection::Error),
    #[error("the heat pump rejected the write to `{id}`: {exception}")]
    Protocol { id: String, exception: Exception },
    #[error("writing `{id}` failed")]
    Transport {
        id: String,
        #[source]
        source: connection::Error,
    },
}

#[derive(clap::Parser, Clone, Debug, Default)]
#[group(id = "coordinator::Options")]
pub struct Options {
    /// Where to start reading the input registers.
    #[arg(long, value_enum, default_value_t = InputStart::Zero)]
    pub input_start: InputStart,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Availability {
    /// No poll cycle has finished yet.
    Pending,
    Available,
    /// The most recent cycle failed. The last good snapshot stays published.
    Unavailable { reason: String, since: Timestamp },
}

/// What readers observe. Replaced as a whole after every cycle.
#[derive(Clone, Debug)]
pub struct Published {
    pub snapshot: Option<Arc<Snapshot>>,
    pub transitions: Arc<BTreeMap<String, Timestamp>>,
    pub availability: Availability,
}

struct Engine<T> {
    transport: T,
    current: Option<Arc<Snapshot>>,
    tracker: TransitionTracker,
    has_connected: bool,
}

impl<T: Transport> Engine<T> {
    /// Connect if the transport isn't connected. Makes a single attempt.
    async fn ensure_connected(&mut self) -> Result<(), connection::Error> {
        if self.transport.is_connected() {
            return Ok(());
        }
        if self.has_connected {
            info!(message = "connection lost, reconnecting");
        }
        self.transport.connect().await?;
        self.has_connected = true;
        Ok(())
    }

    async fn cycle(&mut self, catalog: &Catalog, plan: &ReadPlan) -> Result<Arc<Snapshot>, PollError> {
        self.ensure_connected().await.map_err(PollError::Connection)?;
        let fetched = poll::fetch(&mut self.transport, plan).await?;
        let snapshot = Arc::new(poll::decode(catalog, &fetched, Timestamp::now()));
        let risen = self.tracker.update(catalog, self.current.as_deref(), &snapshot, snapshot.taken_at());
        debug!(message = "poll cycle complete", readings = snapshot.len(), ?risen);
        self.current = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}

/// Owns the connection to the heat pump and the state derived from polling it.
///
/// Polls and writes are serialized: at most one of them talks to the device at a time.
pub struct Coordinator<T> {
    catalog: Arc<Catalog>,
    plan: ReadPlan,
    engine: Mutex<Engine<T>>,
    published: watch::Sender<Published>,
    power: Option<Arc<dyn PowerSource>>,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(catalog: Arc<Catalog>, transport: T, options: Options) -> Self {
        let plan = ReadPlan::new(&catalog, options.input_start);
        let (published, _) = watch::channel(Published {
            snapshot: None,
            transitions: Arc::default(),
            availability: Availability::Pending,
        });
        let engine = Engine { transport, current: None, tracker: TransitionTracker::new(), has_connected: false };
        Self { catalog, plan, engine: Mutex::new(engine), published, power: None }
    }

    /// Prefer `source` over the heat pump's own power register for the coefficient of performance.
    pub fn with_power_source(mut self, source: Arc<dyn PowerSource>) -> Self {
        self.power = Some(source);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn plan(&self) -> &ReadPlan {
        &self.plan
    }

    /// Run one poll cycle and publish its result.
    ///
    /// On failure the previously published snapshot stays in place and availability turns
    /// [`Availability::Unavailable`].
    pub async fn poll(&self) -> Result<Arc<Snapshot>, PollError> {
        let mut engine = self.engine.lock().await;
        match engine.cycle(&self.catalog, &self.plan).await {
            Ok(snapshot) => {
                let transitions = Arc::new(engine.tracker.all().clone());
                self.published.send_modify(|published| {
                    published.snapshot = Some(Arc::clone(&snapshot));
                    published.transitions = transitions;
                    published.availability = Availability::Available;
                });
                Ok(snapshot)
            }
            Err(error) => {
                warn!(message = "poll cycle failed", error = &error as &dyn std::error::Error);
                let reason = error.to_string();
                self.published.send_modify(|published| {
                    let since = match &published.availability {
                        Availability::Unavailable { since, .. } => *since,
                        _ => Timestamp::now(),
                    };
                    published.availability = Availability::Unavailable { reason, since };
                });
                Err(error)
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Published> {
        self.published.subscribe()
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.published.borrow().snapshot.clone()
    }

    pub fn availability(&self) -> Availability {
        self.published.borrow().availability.clone()
    }

    pub fn get(&self, id: &str) -> Option<Reading> {
        self.published.borrow().snapshot.as_ref()?.get(id).cloned()
    }

    /// When the tracked register `id` last turned on.
    pub fn get_timestamp(&self, id: &str) -> Option<Timestamp> {
        self.published.borrow().transitions.get(id).copied()
    }

    pub fn transitions(&self) -> Arc<BTreeMap<String, Timestamp>> {
        Arc::clone(&self.published.borrow().transitions)
    }

    pub fn get_synthetic(&self, kind: SyntheticKind) -> Option<f64> {
        let snapshot = self.snapshot()?;
        let external = self.power.as_ref().and_then(|p| p.last_known());
        derived::compute(kind, &self.catalog, &snapshot, external)
    }

    /// Write an engineering value to a holding register or coil, then refresh.
    ///
    /// The refresh runs after the write has been acknowledged; its failure is logged and does not
    /// fail the write.
    pub async fn write(&self, id: &str, value: f64) -> Result<(), WriteError> {
        let descriptor =
            self.catalog.get(id).ok_or_else(|| WriteError::UnknownRegister(id.to_string()))?;
        let raw = descriptor
            .encode(value)
            .map_err(|source| WriteError::Encode { id: id.to_string(), source })?;
        let (region, address) = (descriptor.region, descriptor.address);
        {
            let mut engine = self.engine.lock().await;
            engine.ensure_connected().await.map_err(WriteError::Connection)?;
            info!(message = "writing", id, %region, address, value, raw);
            engine
                .transport
                .write_single(region, address, raw)
                .await
                .map_err(|source| WriteError::Transport { id: id.to_string(), source })?
                .map_err(|exception| WriteError::Protocol { id: id.to_string(), exception })?;
        }
        if let Err(error) = self.poll().await {
            warn!(message = "could not refresh after the write", id, error = &error as &dyn std::error::Error);
        }
        Ok(())
    }

    /// Select an option of an enumerated register by its label.
    pub async fn write_option(&self, id: &str, label: &str) -> Result<(), WriteError> {
        let descriptor =
            self.catalog.get(id).ok_or_else(|| WriteError::UnknownRegister(id.to_string()))?;
        let key = descriptor
            .key_for_label(label)
            .ok_or_else(|| WriteError::UnknownLabel(id.to_string(), label.to_string()))?;
        self.write(id, f64::from(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{AddressBase, EdgePolarity, Region, RegisterSpec, SyntheticBindings, Unit, Value};
    use crate::simulator::{Fault, SimulatedDevice};

    fn catalog() -> Arc<Catalog> {
        let specs = vec![
            RegisterSpec::new(Region::Input, 0, "compressor", "c").edge(EdgePolarity::RisingOnZero),
            RegisterSpec::new(Region::Input, 1, "flow", "f").scale(0.01).unit(Unit::LitresPerMinute),
            RegisterSpec::new(Region::Input, 2, "lwt", "l").signed().scale(0.01).unit(Unit::Celsius),
            RegisterSpec::new(Region::Input, 3, "rwt", "r").signed().scale(0.01).unit(Unit::Celsius),
            RegisterSpec::new(Region::Input, 4, "power", "p").scale(0.01).unit(Unit::Kilowatts),
            RegisterSpec::new(Region::Holding, 0, "setpoint", "s").signed().scale(0.01).limits(-30.0, 60.0, 0.5),
            RegisterSpec::new(Region::Holding, 1, "offset", "o").signed(),
            RegisterSpec::new(Region::Holding, 2, "quiet", "q").labels(&[(0, "Off"), (1, "On (Automatic)")]),
            RegisterSpec::new(Region::Discrete, 0, "defrost", "d").edge(EdgePolarity::RisingOnOne),
            RegisterSpec::new(Region::Coil, 0, "dhw", "dhw"),
        ];
        let bindings = SyntheticBindings {
            flow: Some("flow".into()),
            leaving: Some("lwt".into()),
            return_: Some("rwt".into()),
            electric_power: Some("power".into()),
        };
        Arc::new(Catalog::new(AddressBase::Zero, specs, bindings).unwrap())
    }

    fn running_device(catalog: &Catalog) -> SimulatedDevice {
        let device = SimulatedDevice::for_catalog(catalog);
        device.set(Region::Input, 0, 1);
        device.set(Region::Input, 1, 1200);
        device.set(Region::Input, 2, 3500);
        device.set(Region::Input, 3, 3000);
        device.set(Region::Input, 4, 60);
        device
    }

    #[tokio::test]
    async fn polling_is_idempotent() {
        let catalog = catalog();
        let device = running_device(&catalog);
        let coordinator = Coordinator::new(Arc::clone(&catalog), device.clone(), Options::default());
        assert_eq!(coordinator.availability(), Availability::Pending);
        assert!(coordinator.snapshot().is_none());
        let first = coordinator.poll().await.unwrap();
        let transitions = coordinator.transitions();
        let second = coordinator.poll().await.unwrap();
        assert!(first.same_readings(&second));
        assert_eq!(coordinator.transitions(), transitions);
        assert_eq!(device.reads().len(), 2 * coordinator.plan().reads().len());
        assert_eq!(device.connects(), 1);
        assert_eq!(coordinator.availability(), Availability::Available);
    }

    #[tokio::test]
    async fn timestamps_rising_edges() {
        let catalog = catalog();
        let device = running_device(&catalog);
        let coordinator = Coordinator::new(Arc::clone(&catalog), device.clone(), Options::default());
        coordinator.poll().await.unwrap();
        assert_eq!(coordinator.get_timestamp("compressor"), None);
        device.set(Region::Input, 0, 0);
        let snapshot = coordinator.poll().await.unwrap();
        assert_eq!(coordinator.get_timestamp("compressor"), Some(snapshot.taken_at()));
        device.set(Region::Discrete, 0, 1);
        let later = coordinator.poll().await.unwrap();
        assert_eq!(coordinator.get_timestamp("compressor"), Some(snapshot.taken_at()));
        assert_eq!(coordinator.get_timestamp("defrost"), Some(later.taken_at()));
    }

    #[tokio::test]
    async fn failures_keep_the_last_snapshot() {
        let catalog = catalog();
        let device = running_device(&catalog);
        let coordinator = Coordinator::new(Arc::clone(&catalog), device.clone(), Options::default());
        let good = coordinator.poll().await.unwrap();

        device.inject(Region::Input, Fault::Exception(4));
        assert!(matches!(coordinator.poll().await, Err(PollError::Protocol { .. })));
        assert!(Arc::ptr_eq(&coordinator.snapshot().unwrap(), &good));
        let Availability::Unavailable { since, .. } = coordinator.availability() else {
            panic!("expected the coordinator to be unavailable");
        };
        // A second failure doesn't move the time the outage started.
        assert!(coordinator.poll().await.is_err());
        assert!(matches!(coordinator.availability(), Availability::Unavailable { since: s, .. } if s == since));

        device.clear_faults();
        device.inject(Region::Input, Fault::Disconnect);
        assert!(matches!(coordinator.poll().await, Err(PollError::Transport { .. })));
        device.clear_faults();
        device.set_reachable(false);
        assert!(matches!(coordinator.poll().await, Err(PollError::Connection(_))));
        assert!(Arc::ptr_eq(&coordinator.snapshot().unwrap(), &good));

        device.set_reachable(true);
        coordinator.poll().await.unwrap();
        assert_eq!(coordinator.availability(), Availability::Available);
        assert_eq!(device.connects(), 2);
    }

    #[tokio::test]
    async fn secondary_failures_degrade() {
        let catalog = catalog();
        let device = running_device(&catalog);
        device.set(Region::Discrete, 0, 1);
        device.inject(Region::Discrete, Fault::Exception(2));
        let coordinator = Coordinator::new(Arc::clone(&catalog), device.clone(), Options::default());
        coordinator.poll().await.unwrap();
        assert!(coordinator.get("defrost").is_none());
        assert_eq!(coordinator.get("dhw").map(|r| r.value), Some(Value::Flag(false)));
        assert_eq!(coordinator.get_timestamp("defrost"), None);
        assert_eq!(coordinator.availability(), Availability::Available);
    }

    #[tokio::test]
    async fn dropped_secondary_region_keeps_the_rest() {
        let catalog = catalog();
        let device = running_device(&catalog);
        device.set(Region::Coil, 0, 1);
        device.inject(Region::Discrete, Fault::Disconnect);
        let coordinator = Coordinator::new(Arc::clone(&catalog), device.clone(), Options::default());
        coordinator.poll().await.unwrap();
        assert!(coordinator.get("defrost").is_none());
        assert_eq!(coordinator.get("dhw").map(|r| r.value), Some(Value::Flag(true)));
        assert!(coordinator.get("flow").is_some());
        assert_eq!(coordinator.availability(), Availability::Available);
        assert_eq!(device.connects(), 2);
    }

    #[tokio::test]
    async fn synthetic_values() {
        struct Meter;
        impl PowerSource for Meter {
            fn last_known(&self) -> Option<f64> {
                Some(1050.0)
            }
        }
        let catalog = catalog();
        let device = running_device(&catalog);
        let coordinator = Coordinator::new(Arc::clone(&catalog), device, Options::default());
        assert_eq!(coordinator.get_synthetic(SyntheticKind::Cop), None);
        coordinator.poll().await.unwrap();
        let heat = coordinator.get_synthetic(SyntheticKind::HeatPower).unwrap();
        assert!((heat - 4200.0).abs() < 1e-6);
        let cop = coordinator.get_synthetic(SyntheticKind::Cop).unwrap();
        assert!((cop - 7.0).abs() < 1e-9);
        let coordinator = coordinator.with_power_source(Arc::new(Meter));
        let cop = coordinator.get_synthetic(SyntheticKind::Cop).unwrap();
        assert!((cop - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn writes_encode_and_refresh() {
        let catalog = catalog();
        let device = running_device(&catalog);
        let coordinator = Coordinator::new(Arc::clone(&catalog), device.clone(), Options::default());

        coordinator.write("setpoint", 21.5).await.unwrap();
        assert_eq!(device.get(Region::Holding, 0), Some(2150));
        // The write refreshed the published snapshot.
        let reading = coordinator.get("setpoint").unwrap();
        assert!((reading.value.as_number().unwrap() - 21.5).abs() < 1e-9);

        coordinator.write("offset", -3.0).await.unwrap();
        assert_eq!(device.get(Region::Holding, 1), Some(65533));
        assert_eq!(coordinator.get("offset").map(|r| r.value), Some(Value::Number(-3.0)));

        coordinator.write_option("quiet", "on (automatic)").await.unwrap();
        assert_eq!(device.get(Region::Holding, 2), Some(1));
        coordinator.write("dhw", 1.0).await.unwrap();
        assert_eq!(device.get(Region::Coil, 0), Some(1));
        assert_eq!(device.writes().len(), 4);
    }

    #[tokio::test]
    async fn rejects_invalid_writes() {
        let catalog = catalog();
        let device = running_device(&catalog);
        let coordinator = Coordinator::new(Arc::clone(&catalog), device.clone(), Options::default());
        assert!(matches!(
            coordinator.write("setpoint", 61.0).await,
            Err(WriteError::Encode { source: EncodeError::OutOfRange { .. }, .. })
        ));
        assert!(matches!(
            coordinator.write("flow", 1.0).await,
            Err(WriteError::Encode { source: EncodeError::NotWritable { region: Region::Input }, .. })
        ));
        assert!(matches!(coordinator.write("nope", 1.0).await, Err(WriteError::UnknownRegister(_))));
        assert!(matches!(
            coordinator.write_option("quiet", "Loud").await,
            Err(WriteError::UnknownLabel(..))
        ));
        assert!(device.writes().is_empty());

        device.inject(Region::Holding, Fault::Exception(3));
        assert!(matches!(
            coordinator.write("offset", 1.0).await,
            Err(WriteError::Protocol { exception: Exception(3), .. })
        ));
    }

    #[tokio::test]
    async fn write_succeeds_when_refresh_fails() {
        let catalog = catalog();
        let device = running_device(&catalog);
        let coordinator = Coordinator::new(Arc::clone(&catalog), device.clone(), Options::default());
        device.inject(Region::Input, Fault::Exception(4));
        coordinator.write("offset", 2.0).await.unwrap();
        assert_eq!(device.get(Region::Holding, 1), Some(2));
        assert!(matches!(coordinator.availability(), Availability::Unavailable { .. }));
    }

    #[tokio::test]
    async fn publishes_to_subscribers() {
        let catalog = catalog();
        let coordinator = Coordinator::new(Arc::clone(&catalog), running_device(&catalog), Options::default());
        let mut receiver = coordinator.subscribe();
        coordinator.poll().await.unwrap();
        assert!(receiver.has_changed().unwrap());
        let published = receiver.borrow_and_update().clone();
        assert_eq!(published.availability, Availability::Available);
        let flow = published.snapshot.unwrap().number("flow").unwrap();
        assert!((flow - 12.0).abs() < 1e-9);
    }
}
