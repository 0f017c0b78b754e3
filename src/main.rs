//! Demo binary: wires a synthetic in-memory trace and a zero-cost bus
//! stand-in into a [`Simulator`] and runs it to completion. Real trace-file
//! parsing and parameter-file loading are an external driver's job; this is
//! only enough to exercise the engine end to end.

use clap::Parser;
use log::info;

use ssdsim::bus::NullBus;
use ssdsim::params::{
    AllocPoolLogic, CleaningPolicy, CopyBack, GangShare, PlaneBlockMapping, RateLimitModel,
    Scheduler, TimingModel, WritePolicy,
};
use ssdsim::trace::{Direction, Request, VecTraceSource};
use ssdsim::{Params, SimTime, Simulator};

#[derive(Parser, Debug)]
#[command(name = "ssdsim", about = "Discrete-event NAND flash SSD simulator demo")]
struct Cli {
    /// Number of synthetic requests to generate.
    #[arg(long, default_value_t = 200)]
    requests: u64,

    /// Sectors touched per request.
    #[arg(long, default_value_t = 8)]
    sectors: u32,

    /// Random seed for both request generation and the cleaner's RNG.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn demo_params() -> Params {
    Params {
        scheduler: Scheduler::Fifo,
        max_queue_length: 64,
        block_count: 1,
        bus_transaction_latency: 0.0,
        bulk_sector_transfer_time: 0.0,
        never_disconnect: false,
        print_stats: false,
        command_overhead: 0.01,
        timing_model: TimingModel::Simple,
        flash_chip_elements: 1,
        page_size_sectors: 8,
        pages_per_block: 64,
        blocks_per_element: 32,
        element_stride_pages: 8,
        chip_xfer_latency: 2.5e-5,
        page_read_latency: 0.025,
        page_write_latency: 0.2,
        block_erase_latency: 1.5,
        write_policy: WritePolicy::Osr,
        reserve_pages_percent: 25,
        min_free_blocks_percent: 12,
        cleaning_policy: CleaningPolicy::GreedyWearAgnostic,
        rate_limit_model: RateLimitModel::Simple,
        planes_per_package: 1,
        blocks_per_plane: 32,
        plane_block_mapping: PlaneBlockMapping::Concat,
        copy_back: CopyBack::Disable,
        num_parallel_units: 1,
        elements_per_gang: 1,
        cleaning_in_background: false,
        gang_share: GangShare::SharedControl,
        alloc_pool_logic: AllocPoolLogic::Chip,
        cold_data_migration: false,
    }
}

fn synthetic_trace(count: u64, sectors: u32, seed: u64, device_size_sectors: u64) -> VecTraceSource {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    let mut rng = SmallRng::seed_from_u64(seed);
    let max_aligned_blkno = (device_size_sectors / sectors as u64).saturating_sub(1);
    let requests = (0..count).map(|i| {
        let dir = if rng.random_bool(0.7) { Direction::Write } else { Direction::Read };
        let blkno = rng.random_range(0..=max_aligned_blkno) * sectors as u64;
        Request {
            id: i,
            arrival: SimTime(i as f64 * 0.5),
            devno: 0,
            blkno,
            bcount: sectors,
            dir,
        }
    });
    VecTraceSource::new(requests)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let params = demo_params();
    let device_size_sectors = params.device_size_sectors();
    let trace = Box::new(synthetic_trace(cli.requests, cli.sectors, cli.seed, device_size_sectors));
    let bus = Box::new(NullBus);

    let mut sim = Simulator::new(params, bus, trace, cli.seed).expect("invalid parameters");
    sim.prime();
    let completed = sim.run().expect("simulation error");

    info!("completed {} requests", completed.len());
    let total_cost: f64 = completed.iter().map(|r| r.total_cost).sum();
    println!("requests completed: {}", completed.len());
    println!("total simulated service time: {total_cost:.4}");
}
