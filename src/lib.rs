//! Trace-driven, discrete-event simulator for an SSD built from NAND flash.
//!
//! The core owns the event engine, the flash translation layer, and the
//! cleaner. It treats the upstream bus/controller and the trace reader as
//! external collaborators reachable only through the [`Bus`] and
//! [`TraceSource`] traits — their internals, along with trace-file parsing,
//! parameter-file parsing, and stats formatting, live outside this crate.

pub mod bitmap;
pub mod bus;
pub mod checkpoint;
pub mod cleaner;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod ftl;
pub mod gang;
pub mod params;
pub mod stats;
pub mod trace;
pub mod write_path;

use std::rc::Rc;

pub use bus::Bus;
pub use checkpoint::CoreState;
pub use device::{CompletedRequest, Device, DeviceOps};
pub use error::{Result, SimError};
pub use event::{DeviceId, Engine, EventKind, Payload, SimTime};
pub use params::Params;
pub use trace::{Direction, Request, TraceSource};

use bus::InterruptReason;

/// Owns every piece of simulated state for one run: the event engine, one
/// or more devices, the external bus, and the external trace reader.
/// Replaces a process-wide singleton with an explicit value the caller can
/// hold, clone parameters into, and run side by side with another
/// simulation in the same process.
pub struct Simulator {
    pub engine: Engine,
    pub params: Rc<Params>,
    pub devices: Vec<Device>,
    pub bus: Box<dyn Bus>,
    pub trace: Box<dyn TraceSource>,
    prefetched: Option<Request>,
    seed: u64,
}

impl Simulator {
    pub fn new(params: Params, bus: Box<dyn Bus>, trace: Box<dyn TraceSource>, seed: u64) -> Result<Self> {
        params.validate()?;
        let params = Rc::new(params);
        let device_count = 1usize;
        let devices = (0..device_count)
            .map(|i| Device::new(DeviceId(i as u32), params.clone(), seed + i as u64))
            .collect();
        Ok(Simulator {
            engine: Engine::new(),
            params,
            devices,
            bus,
            trace,
            prefetched: None,
            seed,
        })
    }

    /// Prime the engine with a `NullEvent` so the first `step` prefetches
    /// the trace's first record (§6 "the core reads records lazily").
    pub fn prime(&mut self) {
        self.engine.schedule(SimTime::ZERO, DeviceId(0), EventKind::NullEvent, Payload::None);
    }

    /// Drain the event queue until it is empty or a `StopSim`/`Exit` fires.
    /// Returns every request completed across all devices, in completion
    /// order.
    pub fn run(&mut self) -> Result<Vec<CompletedRequest>> {
        loop {
            let Some(event) = self.engine.next() else {
                break;
            };
            if self.step(event)? {
                break;
            }
        }
        Ok(self
            .devices
            .iter_mut()
            .flat_map(|d| std::mem::take(&mut d.completed))
            .collect())
    }

    /// Process one event. Returns `true` if the run should stop.
    fn step(&mut self, event: event::Event) -> Result<bool> {
        let device_idx = event.device.0 as usize;
        match event.kind {
            EventKind::NullEvent => {
                self.lazy_prefetch_and_arrive(event.time)?;
            }
            EventKind::IoAccessArrive => {
                if let Payload::Request(req) = event.payload {
                    self.devices[device_idx].arrive(req, &mut self.engine)?;
                }
            }
            EventKind::DeviceOverheadComplete => {
                self.devices[device_idx].overhead_complete(&mut self.engine, self.bus.as_mut(), event.time)?;
            }
            EventKind::IoInterruptComplete(InterruptReason::Reconnect) => {
                self.devices[device_idx].bus_grant(&mut self.engine, event.time)?;
            }
            EventKind::IoInterruptComplete(_) => {}
            EventKind::DeviceDataTransferComplete => {
                self.engine.schedule(
                    event.time,
                    event.device,
                    EventKind::DeviceAccessComplete,
                    Payload::None,
                );
            }
            EventKind::DeviceAccessComplete => {
                self.devices[device_idx].transfer_complete(self.bus.as_mut(), event.time)?;
            }
            EventKind::CleanElement => {
                if let Payload::Element(element_id) = event.payload {
                    device::handle_clean_element(&mut self.devices[device_idx], element_id, event.time)?;
                }
            }
            EventKind::CleanGang => {
                if let Payload::Gang(gang_id) = event.payload {
                    device::handle_clean_gang(&mut self.devices[device_idx], gang_id, event.time)?;
                }
            }
            EventKind::Checkpoint => {}
            EventKind::StopSim | EventKind::Exit => return Ok(true),
        }
        Ok(false)
    }

    /// Pull the next trace record (using whatever was pre-fetched by the
    /// previous `NullEvent`, falling back to a fresh read) and schedule its
    /// arrival. Immediately queues another `NullEvent` so the following
    /// record gets pre-fetched one step ahead, unless the trace is
    /// exhausted, in which case the run is stopped gracefully (§7: trace
    /// EOF is recovered here, never propagated as an error).
    fn lazy_prefetch_and_arrive(&mut self, now: SimTime) -> Result<()> {
        let next = self.prefetched.take().or_else(|| self.trace.next());
        let Some(req) = next else {
            self.engine.schedule(now, DeviceId(0), EventKind::StopSim, Payload::None);
            return Ok(());
        };
        self.prefetched = self.trace.next();
        let arrival = std::cmp::max(req.arrival, now);
        self.engine
            .schedule(arrival, DeviceId(req.devno), EventKind::IoAccessArrive, Payload::Request(req));
        if self.prefetched.is_some() {
            self.engine.schedule(now, DeviceId(0), EventKind::NullEvent, Payload::None);
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<Vec<u8>> {
        let state = CoreState::capture(&self.engine, &self.params, &self.devices);
        state.to_bytes()
    }

    /// Rebuild a `Simulator` from a checkpoint. The caller re-attaches the
    /// bus and trace reader (the trace reader in particular must seek back
    /// to wherever it left off, which the core has no way to know).
    pub fn restore(bytes: &[u8], bus: Box<dyn Bus>, trace: Box<dyn TraceSource>, seed: u64) -> Result<Self> {
        let state = CoreState::from_bytes(bytes)?;
        let params_rc = Rc::new(state.params.clone());
        let devices = state.restore_devices(seed);
        Ok(Simulator {
            engine: state.engine,
            params: params_rc,
            devices,
            bus,
            trace,
            prefetched: None,
            seed,
        })
    }
}
