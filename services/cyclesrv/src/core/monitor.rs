//! Poll scheduler
//!
//! One independent polling task per monitored station. Each iteration samples
//! the completion bit, feeds the edge detector, and on a rising edge runs
//! extraction and record creation synchronously within that station's loop.
//! Failures are station-local: a dead link flips the station to `error` and
//! reconnects on a capped exponential backoff while every other station keeps
//! polling. Stopping is cooperative via a watch channel checked at each loop
//! boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StationConfig;
use crate::core::edge::{BitEdge, EdgeState};
use crate::core::extractor::CycleExtractor;
use crate::core::ledger::CycleLedger;
use crate::core::printer::LabelDispatcher;
use crate::core::types::{ConnectionState, StationStatus};
use crate::error::{CycleSrvError, Result};
use crate::protocols::modbus::{BusEndpoint, ModbusTcpClient, RegisterBus};
use crate::store::CycleStore;

/// Initial reconnect backoff
const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Reconnect backoff cap
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Grace period granted to a stopping task before stop gives up waiting
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Factory producing a bus session for a station; tests substitute scripted
/// buses here.
pub type BusFactory = Arc<dyn Fn(&StationConfig) -> Box<dyn RegisterBus> + Send + Sync>;

struct StationTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the polling tasks and status snapshots for all configured stations
pub struct MonitorRegistry {
    stations: Vec<StationConfig>,
    store: Arc<dyn CycleStore>,
    bus_factory: BusFactory,
    status: Arc<DashMap<u32, StationStatus>>,
    tasks: DashMap<u32, StationTask>,
}

impl MonitorRegistry {
    /// Registry backed by live Modbus TCP sessions
    pub fn new(stations: Vec<StationConfig>, store: Arc<dyn CycleStore>) -> Self {
        let factory: BusFactory = Arc::new(|station: &StationConfig| {
            Box::new(ModbusTcpClient::new(BusEndpoint::from(station))) as Box<dyn RegisterBus>
        });
        Self::with_bus_factory(stations, store, factory)
    }

    /// Registry with an injected bus factory
    pub fn with_bus_factory(
        stations: Vec<StationConfig>,
        store: Arc<dyn CycleStore>,
        bus_factory: BusFactory,
    ) -> Self {
        let status = Arc::new(DashMap::new());
        for station in &stations {
            status.insert(station.id, StationStatus::offline(station.id, &station.code));
        }
        Self {
            stations,
            store,
            bus_factory,
            status,
            tasks: DashMap::new(),
        }
    }

    fn station_config(&self, station_id: u32) -> Result<&StationConfig> {
        self.stations
            .iter()
            .find(|s| s.id == station_id)
            .ok_or_else(|| CycleSrvError::station_not_found(station_id))
    }

    /// Start monitoring every station configured with `monitoring: true`,
    /// returning how many were started.
    pub async fn start_configured(&self) -> usize {
        let ids: Vec<u32> = self
            .stations
            .iter()
            .filter(|s| s.monitoring)
            .map(|s| s.id)
            .collect();
        let mut started = 0;
        for id in ids {
            match self.start_monitoring(id).await {
                Ok(()) => started += 1,
                Err(e) => error!("Station {id}: failed to start monitoring: {e}"),
            }
        }
        started
    }

    /// Start one station's polling task; a no-op when already running
    pub async fn start_monitoring(&self, station_id: u32) -> Result<()> {
        let station = self.station_config(station_id)?.clone();

        if let Some(task) = self.tasks.get(&station_id) {
            if !task.handle.is_finished() {
                warn!("Station {}: monitoring already running", station.code);
                return Ok(());
            }
        }
        self.tasks.remove(&station_id);

        let bus = (self.bus_factory)(&station);
        let store = Arc::clone(&self.store);
        let status = Arc::clone(&self.status);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        update_status(&status, station_id, |s| {
            s.monitoring_enabled = true;
            s.connection_state = ConnectionState::Disconnected;
        });

        info!("Station {}: monitoring started", station.code);
        let handle = tokio::spawn(async move {
            station_loop(station, bus, store, status, shutdown_rx).await;
        });

        self.tasks.insert(station_id, StationTask { shutdown_tx, handle });
        Ok(())
    }

    /// Stop one station's polling task without interrupting others.
    ///
    /// Idempotent: stopping a station that is not monitored only clears its
    /// flag.
    pub async fn stop_monitoring(&self, station_id: u32) -> Result<()> {
        let station = self.station_config(station_id)?;

        if let Some((_, task)) = self.tasks.remove(&station_id) {
            let _ = task.shutdown_tx.send(true);
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task.handle).await {
                Ok(Ok(())) => debug!("Station {}: monitoring stopped", station.code),
                Ok(Err(e)) => warn!("Station {}: monitor task error: {}", station.code, e),
                Err(_) => warn!("Station {}: monitor stop timed out", station.code),
            }
        }

        update_status(&self.status, station_id, |s| {
            s.monitoring_enabled = false;
            s.connection_state = ConnectionState::Disconnected;
        });
        Ok(())
    }

    /// Stop every running task (service shutdown)
    pub async fn stop_all(&self) {
        let ids: Vec<u32> = self.tasks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Err(e) = self.stop_monitoring(id).await {
                warn!("Station {id}: stop failed during shutdown: {e}");
            }
        }
    }

    /// Status snapshot for one station
    pub fn status(&self, station_id: u32) -> Result<StationStatus> {
        self.status
            .get(&station_id)
            .map(|s| s.clone())
            .ok_or_else(|| CycleSrvError::station_not_found(station_id))
    }

    /// Status snapshots for all stations, in configuration order
    pub fn statuses(&self) -> Vec<StationStatus> {
        self.stations
            .iter()
            .filter_map(|s| self.status.get(&s.id).map(|st| st.clone()))
            .collect()
    }

    pub fn stations(&self) -> &[StationConfig] {
        &self.stations
    }

    pub fn store(&self) -> Arc<dyn CycleStore> {
        Arc::clone(&self.store)
    }
}

fn update_status(
    status: &DashMap<u32, StationStatus>,
    station_id: u32,
    update: impl FnOnce(&mut StationStatus),
) {
    if let Some(mut entry) = status.get_mut(&station_id) {
        update(&mut entry);
    }
}

/// Sleep for `delay` unless shutdown is signalled first; returns true on
/// shutdown.
async fn wait_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

fn jittered(delay: Duration) -> Duration {
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

/// Main polling loop for one station
async fn station_loop(
    station: StationConfig,
    mut bus: Box<dyn RegisterBus>,
    store: Arc<dyn CycleStore>,
    status: Arc<DashMap<u32, StationStatus>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ledger = CycleLedger::new(Arc::clone(&store));
    let mut edge = EdgeState::new();
    let mut reconnect_delay = MIN_RECONNECT_DELAY;
    let poll_interval = station.poll_interval();
    let completion_address = station.completion_address();

    debug!(
        "Station {}: poll loop running (interval {:?}, completion bit at {})",
        station.code, poll_interval, completion_address
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Reconnect when the session is down; backoff is station-local
        if !bus.is_connected() {
            update_status(&status, station.id, |s| {
                s.connection_state = ConnectionState::Connecting;
            });
            match bus.connect().await {
                Ok(()) => {
                    update_status(&status, station.id, |s| {
                        s.connection_state = ConnectionState::Connected;
                        s.last_seen = Some(Utc::now());
                    });
                    reconnect_delay = MIN_RECONNECT_DELAY;
                },
                Err(e) => {
                    warn!("Station {}: connect failed: {}", station.code, e);
                    update_status(&status, station.id, |s| {
                        s.connection_state = ConnectionState::Error;
                    });
                    if wait_or_shutdown(&mut shutdown_rx, jittered(reconnect_delay)).await {
                        break;
                    }
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                    continue;
                },
            }
        }

        match bus.read_bit(completion_address).await {
            Ok(bit) => {
                update_status(&status, station.id, |s| {
                    s.connection_state = ConnectionState::Connected;
                    s.last_seen = Some(Utc::now());
                    s.polls += 1;
                });

                if edge.observe(bit) == BitEdge::RoseToOn {
                    info!(
                        "Station {}: completion bit rising edge detected",
                        station.code
                    );
                    handle_rising_edge(&station, bus.as_mut(), &store, &ledger, &status).await;
                }
            },
            Err(e) => {
                // The poll failed; the loop keeps running and the dead
                // session reconnects on the next iteration.
                warn!("Station {}: poll failed: {}", station.code, e);
                update_status(&status, station.id, |s| {
                    s.connection_state = ConnectionState::Error;
                });
            },
        }

        if wait_or_shutdown(&mut shutdown_rx, poll_interval).await {
            break;
        }
    }

    let _ = bus.close().await;
    update_status(&status, station.id, |s| {
        s.connection_state = ConnectionState::Disconnected;
        s.monitoring_enabled = false;
    });
    info!("Station {}: poll loop stopped", station.code);
}

/// Extraction and record creation for one detected edge.
///
/// Extraction is retried once immediately; a second failure drops the edge
/// with an error log and creates nothing. The edge is consumed either way:
/// only a genuine new off-to-on transition can trigger again.
async fn handle_rising_edge(
    station: &StationConfig,
    bus: &mut dyn RegisterBus,
    store: &Arc<dyn CycleStore>,
    ledger: &CycleLedger,
    status: &Arc<DashMap<u32, StationStatus>>,
) {
    let variant = CycleExtractor::read_variant(bus, station).await;

    let extraction = match CycleExtractor::extract(bus, station).await {
        Ok(extraction) => extraction,
        Err(first) => {
            warn!(
                "Station {}: extraction failed ({}), retrying once",
                station.code, first
            );
            if !bus.is_connected() && bus.connect().await.is_err() {
                error!(
                    "Station {}: extraction retry impossible, edge dropped",
                    station.code
                );
                return;
            }
            match CycleExtractor::extract(bus, station).await {
                Ok(extraction) => extraction,
                Err(second) => {
                    error!(
                        "Station {}: extraction failed again ({}), edge dropped",
                        station.code, second
                    );
                    return;
                },
            }
        },
    };

    let identity = station.label_for_variant(variant);
    match ledger
        .create_from_extraction(station, &extraction, &identity)
        .await
    {
        Ok(record) => {
            update_status(status, station.id, |s| {
                s.cycles_created += 1;
            });
            LabelDispatcher::dispatch(station.printer.as_ref(), store.as_ref(), &record, &identity)
                .await;
        },
        Err(e) => {
            error!(
                "Station {}: cycle record creation failed: {}",
                station.code, e
            );
        },
    }
}
