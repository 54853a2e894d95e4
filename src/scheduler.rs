//! The polling loop.
//!
//! [`Scheduler`] owns every adapter, the energy state and the outbound socket.
//! One cycle polls all sources concurrently, waits for all of them, aggregates,
//! persists and emits. Nothing inside a cycle ends the loop.

use crate::aggregator::{aggregate, AggregateResult};
use crate::config::Config;
use crate::emitter::VirtualMeterEmitter;
use crate::energy_state::EnergyStateStore;
use crate::error::Result;
use crate::inverter::InverterSourceAdapter;
use crate::meter_feed::MeterFeedListener;
use crate::remote::RemoteSourceAdapter;
use crate::speedwire::{MeterCodec, SpeedwireCodec};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub struct Scheduler {
    config: Config,
    inverters: Vec<InverterSourceAdapter>,
    remotes: Vec<RemoteSourceAdapter>,
    meter_feed: Option<MeterFeedListener>,
    state: EnergyStateStore,
    emitter: VirtualMeterEmitter,
}

impl Scheduler {
    pub fn new(
        config: Config,
        inverters: Vec<InverterSourceAdapter>,
        remotes: Vec<RemoteSourceAdapter>,
        meter_feed: Option<MeterFeedListener>,
        state: EnergyStateStore,
        emitter: VirtualMeterEmitter,
    ) -> Self {
        Self {
            config,
            inverters,
            remotes,
            meter_feed,
            state,
            emitter,
        }
    }

    /// Build every component from the configuration and load the energy state.
    /// Must be called inside the tokio runtime.
    pub fn from_config(config: Config) -> Result<Self> {
        let codec: Arc<dyn MeterCodec> = Arc::new(SpeedwireCodec);

        let inverters = config
            .inverters
            .iter()
            .map(InverterSourceAdapter::from_config)
            .collect();
        let remotes = config
            .remote_sources
            .iter()
            .map(|r| RemoteSourceAdapter::new(r.clone(), config.on_energy_regression))
            .collect::<Result<Vec<_>>>()?;
        let meter_feed = if config.meters.is_enabled() {
            Some(MeterFeedListener::bind_multicast(
                &config.virtual_meter,
                config.meters.clone(),
                codec.clone(),
            )?)
        } else {
            None
        };
        let state = EnergyStateStore::load(&config.state_file);
        let emitter = VirtualMeterEmitter::bind(&config.virtual_meter, codec)?;

        info!(
            "Configured {} inverter(s), {} remote source(s), {} meter(s); virtual meter {}",
            config.inverters.len(),
            config.remote_sources.len(),
            config.meters.allowed_serials().count(),
            config.virtual_meter.serial
        );
        Ok(Self::new(
            config, inverters, remotes, meter_feed, state, emitter,
        ))
    }

    pub fn remotes(&self) -> &[RemoteSourceAdapter] {
        &self.remotes
    }

    /// Open inverter sessions up front; failures are retried by the first poll
    pub async fn init(&mut self) {
        join_all(self.inverters.iter_mut().map(|inverter| inverter.init())).await;
    }

    /// One full cycle: poll, aggregate, persist, emit, log.
    pub async fn run_cycle(&mut self) -> AggregateResult {
        let state = &self.state;
        let inverters = &mut self.inverters;
        let remotes = &mut self.remotes;
        let meter_feed = &self.meter_feed;

        let (inverter_readings, remote_readings, meter_frames) = tokio::join!(
            join_all(inverters.iter_mut().map(|inverter| inverter.poll())),
            join_all(remotes.iter_mut().map(|remote| {
                let previous = state.previous(remote.source_id());
                remote.poll(previous)
            })),
            async {
                match meter_feed {
                    Some(feed) => feed.drain().await,
                    None => BTreeMap::new(),
                }
            }
        );

        let mut readings = inverter_readings;
        readings.extend(remote_readings);
        let result = aggregate(&readings, &meter_frames, &mut self.state);

        if let Err(e) = self.state.save() {
            error!("[State] Failed to save energy state: {e}");
        }
        if let Err(e) = self.emitter.emit(&result).await {
            error!("[Emulation] Error while sending emulated data: {e}");
        }

        info!("{}", result.summary());
        result
    }

    /// Short interval while there is generation, long otherwise
    pub fn next_interval(&self, result: &AggregateResult) -> Duration {
        if result.display_power() > 0.0 {
            self.config.active_interval()
        } else {
            self.config.idle_interval()
        }
    }

    /// One guarded cycle, returning the pause before the next one. A panicking
    /// cycle is logged and answered with the recovery pause.
    pub async fn run_iteration(&mut self) -> Duration {
        match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            Ok(result) => self.next_interval(&result),
            Err(panic) => {
                error!(
                    "[MAIN LOOP] Critical: cycle aborted: {}",
                    panic_message(panic.as_ref())
                );
                self.config.recovery_interval()
            }
        }
    }

    /// Run cycles forever
    pub async fn run(mut self) {
        self.init().await;
        loop {
            let pause = self.run_iteration().await;
            tokio::time::sleep(pause).await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inverter::{DeviceSample, DeviceSession};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;
    use tokio::net::UdpSocket;

    struct FixedSession(DeviceSample);

    #[async_trait]
    impl DeviceSession for FixedSession {
        async fn init(&mut self) -> Result<()> {
            Ok(())
        }

        async fn update(&mut self) -> Result<DeviceSample> {
            Ok(self.0)
        }
    }

    /// Panics on its first update, then behaves like a healthy inverter
    struct PanicOnceSession {
        calls: Arc<AtomicU32>,
        sample: DeviceSample,
    }

    #[async_trait]
    impl DeviceSession for PanicOnceSession {
        async fn init(&mut self) -> Result<()> {
            Ok(())
        }

        async fn update(&mut self) -> Result<DeviceSample> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("register decode blew up");
            }
            Ok(self.sample)
        }
    }

    fn config_for(state_file: &std::path::Path) -> Config {
        let yaml = format!(
            "inverters:\n  - host: inverter1\n    max_watts: 15000\nstate_file: {}\n",
            state_file.display()
        );
        Config::from_yaml_str(&yaml).unwrap()
    }

    fn sample(power: f64, energy: f64) -> DeviceSample {
        DeviceSample {
            power_ac_total: Some(power),
            energy_total: Some(energy),
        }
    }

    fn scheduler_for(
        session: Box<dyn DeviceSession>,
        state: EnergyStateStore,
        target: SocketAddr,
    ) -> Scheduler {
        let config = config_for(state.file_path());
        let emitter =
            VirtualMeterEmitter::with_target(&config.virtual_meter, target, Arc::new(SpeedwireCodec))
                .unwrap();
        let inverter = InverterSourceAdapter::new("inverter1", 15000.0, session);
        Scheduler::new(config, vec![inverter], Vec::new(), None, state, emitter)
    }

    async fn scheduler_with(power: f64, energy: f64, state: EnergyStateStore) -> Scheduler {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        scheduler_for(
            Box::new(FixedSession(sample(power, energy))),
            state,
            sink.local_addr().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_cycle_persists_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = EnergyStateStore::new(&path);
        state.ratchet("inverter1", 9.0);

        let mut scheduler = scheduler_with(5000.0, 10.0, state).await;
        let result = scheduler.run_cycle().await;

        assert_eq!(result.total_power_watts, 5000.0);
        assert_eq!(result.total_energy_kwh, 10.0);
        assert_eq!(EnergyStateStore::load(&path).get("inverter1"), Some(10.0));
    }

    #[tokio::test]
    async fn test_adaptive_interval() {
        let dir = tempdir().unwrap();
        let state = EnergyStateStore::new(dir.path().join("state.json"));
        let mut scheduler = scheduler_with(0.0, 1.0, state).await;

        let idle = scheduler.run_cycle().await;
        assert_eq!(scheduler.next_interval(&idle), Duration::from_secs(60));

        let active = AggregateResult {
            total_power_watts: 0.5,
            ..idle
        };
        assert_eq!(scheduler.next_interval(&active), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_save_failure_does_not_fail_cycle() {
        let dir = tempdir().unwrap();
        // A directory where the state file should be makes the rename fail
        let path = dir.path().join("state.json");
        std::fs::create_dir_all(path.join("blocker")).unwrap();

        let mut scheduler = scheduler_with(100.0, 1.0, EnergyStateStore::new(&path)).await;
        let result = scheduler.run_cycle().await;
        assert_eq!(result.total_power_watts, 100.0);
    }

    #[tokio::test]
    async fn test_panicking_cycle_pauses_then_recovers() {
        let dir = tempdir().unwrap();
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let session = PanicOnceSession {
            calls: calls.clone(),
            sample: sample(2000.0, 3.0),
        };
        let mut scheduler = scheduler_for(
            Box::new(session),
            EnergyStateStore::new(dir.path().join("state.json")),
            sink.local_addr().unwrap(),
        );

        assert_eq!(scheduler.run_iteration().await, Duration::from_secs(10));
        assert_eq!(scheduler.run_iteration().await, Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_send_failure_does_not_fail_cycle() {
        let dir = tempdir().unwrap();
        // IPv6 destination on the IPv4 sender socket, so every send fails
        let unroutable: SocketAddr = "[::1]:9522".parse().unwrap();
        let mut scheduler = scheduler_for(
            Box::new(FixedSession(sample(1500.0, 4.0))),
            EnergyStateStore::new(dir.path().join("state.json")),
            unroutable,
        );

        let result = scheduler.run_cycle().await;
        assert_eq!(result.total_power_watts, 1500.0);
        assert_eq!(result.total_energy_kwh, 4.0);
        assert_eq!(scheduler.run_iteration().await, Duration::from_secs(5));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
