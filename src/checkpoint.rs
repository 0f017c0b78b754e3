//! Checkpoint/restore (§6): a serializable snapshot of engine + device state,
//! kept separate from [`crate::Simulator`] itself because the simulator also
//! owns non-serializable trait objects (the external bus and trace reader).

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{Result, SimError};
use crate::event::{DeviceId, Engine};
use crate::params::Params;

/// Everything needed to resume a simulation except the external bus and
/// trace reader, which the restoring driver re-attaches itself (the trace
/// reader in particular needs to seek back to wherever it left off, which
/// is outside the core's knowledge per §1).
#[derive(Serialize, Deserialize)]
pub struct CoreState {
    pub engine: Engine,
    pub params: Params,
    pub devices: Vec<DeviceSnapshot>,
}

/// A device minus its RNG stream and trait objects: on restore, a device is
/// rebuilt with a fresh RNG and the engine/elements restored verbatim.
#[derive(Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub elements: Vec<crate::ftl::Element>,
    pub busowned: bool,
    pub buswait: bool,
    pub channel_activity: bool,
    pub outstanding: Vec<(u64, crate::device::OutstandingRequestSnapshot)>,
    pub stats: crate::stats::DeviceStats,
    /// Elements drained behind an in-flight bus grant, and the parent ids
    /// awaiting their `DeviceDataTransferComplete`. Both are transient
    /// between `bus_grant` and `transfer_complete`, but a `Checkpoint` event
    /// can legally land in that window, so they must round-trip too (§8
    /// property 10).
    pub pending_drain: Vec<(usize, u64)>,
    pub pending_completions: Vec<u64>,
}

impl CoreState {
    pub fn capture(engine: &Engine, params: &Params, devices: &[Device]) -> Self {
        CoreState {
            engine: engine.clone(),
            params: params.clone(),
            devices: devices.iter().map(DeviceSnapshot::capture).collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SimError::domain(format!("checkpoint serialize failed: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut state: CoreState =
            bincode::deserialize(bytes).map_err(|e| SimError::domain(format!("checkpoint deserialize failed: {e}")))?;
        state.engine.rebuild_heap();
        Ok(state)
    }

    /// Rebuild live [`Device`]s from the snapshot, re-seeding each device's
    /// cleaner RNG with `base_seed + device index` so restored runs are
    /// reproducible but distinct across devices.
    pub fn restore_devices(&self, base_seed: u64) -> Vec<Device> {
        let params = Rc::new(self.params.clone());
        self.devices
            .iter()
            .enumerate()
            .map(|(i, snap)| snap.restore(params.clone(), base_seed + i as u64))
            .collect()
    }
}

impl DeviceSnapshot {
    fn capture(device: &Device) -> Self {
        DeviceSnapshot {
            id: device.id,
            elements: device.elements.clone(),
            busowned: device.busowned,
            buswait: device.buswait,
            channel_activity: device.channel_activity,
            outstanding: device
                .outstanding
                .iter()
                .map(|(id, o)| {
                    (
                        *id,
                        crate::device::OutstandingRequestSnapshot {
                            arrival: o.arrival,
                            dir: o.dir,
                            remaining: o.remaining,
                            total_cost: o.total_cost,
                        },
                    )
                })
                .collect(),
            stats: device.stats.clone(),
            pending_drain: device.pending_drain.clone(),
            pending_completions: device.pending_completions.clone(),
        }
    }

    fn restore(&self, params: Rc<Params>, seed: u64) -> Device {
        let mut device = Device::new(self.id, params, seed);
        device.elements = self.elements.clone();
        device.busowned = self.busowned;
        device.buswait = self.buswait;
        device.channel_activity = self.channel_activity;
        device.stats = self.stats.clone();
        device.outstanding = self
            .outstanding
            .iter()
            .map(|(id, o)| {
                (
                    *id,
                    crate::device::OutstandingRequest {
                        arrival: o.arrival,
                        dir: o.dir,
                        remaining: o.remaining,
                        total_cost: o.total_cost,
                    },
                )
            })
            .collect();
        device.pending_drain = self.pending_drain.clone();
        device.pending_completions = self.pending_completions.clone();
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::test_params;

    #[test]
    fn round_trips_engine_and_device_state_through_bytes() {
        let cfg = test_params();
        let engine = Engine::new();
        let devices = vec![Device::new(DeviceId(0), Rc::new(cfg.clone()), 1)];

        let state = CoreState::capture(&engine, &cfg, &devices);
        let bytes = state.to_bytes().unwrap();
        let restored = CoreState::from_bytes(&bytes).unwrap();

        assert_eq!(restored.devices.len(), 1);
        assert_eq!(restored.devices[0].elements.len(), cfg.flash_chip_elements as usize);
    }

    /// A checkpoint taken between `bus_grant` (which populates
    /// `pending_drain`/`pending_completions`) and the matching
    /// `DeviceDataTransferComplete` must not lose that in-flight state.
    #[test]
    fn round_trips_in_flight_bus_grant_state() {
        use crate::bus::NullBus;
        use crate::device::DeviceOps;
        use crate::event::Engine;

        let cfg = test_params();
        let mut device = Device::new(DeviceId(0), Rc::new(cfg.clone()), 1);
        let mut engine = Engine::new();
        let mut bus = NullBus;

        let req = crate::trace::Request {
            id: 1,
            arrival: crate::event::SimTime::ZERO,
            devno: 0,
            blkno: 0,
            bcount: 8,
            dir: crate::trace::Direction::Write,
        };
        device.arrive(req, &mut engine).unwrap();
        let ev = engine.next().unwrap();
        device.overhead_complete(&mut engine, &mut bus, ev.time).unwrap();

        assert!(!device.pending_completions.is_empty());

        let devices = vec![device];
        let state = CoreState::capture(&engine, &cfg, &devices);
        let bytes = state.to_bytes().unwrap();
        let restored = CoreState::from_bytes(&bytes).unwrap();
        let mut restored_devices = restored.restore_devices(1);
        let mut restored_engine = restored.engine;

        let ev = restored_engine.next().unwrap();
        restored_devices[0].transfer_complete(&mut bus, ev.time).unwrap();
        assert_eq!(restored_devices[0].completed.len(), 1);
        assert_eq!(restored_devices[0].completed[0].id, 1);
    }
}
