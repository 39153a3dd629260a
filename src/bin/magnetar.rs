//! Driver executable: builds the mesh from a TOML configuration (or a
//! restart file), advances the advection test problem to the time limit, and
//! optionally writes a restart checkpoint at the end.

use clap::Parser;
use console::style;
use eyre::{eyre, Context as _};
use indicatif::{ProgressBar, ProgressStyle};
use magnetar::mesh::checkpoint::{load_restart, save_restart};
use magnetar::mesh::BuildMode;
use magnetar::physics::AdvectionFactory;
use magnetar::prelude::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "magnetar", about = "block-structured adaptive-mesh fluid solver")]
struct Args {
    /// Input configuration file (TOML).
    config: PathBuf,

    /// Resume from this restart file instead of cold-starting.
    #[arg(long)]
    restart: Option<PathBuf>,

    /// Write a restart file here when the run completes.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print the mesh layout as if running on this many ranks, then exit.
    #[arg(long)]
    layout_test: Option<usize>,

    /// Steps between refinement cycles in adaptive runs.
    #[arg(long, default_value_t = 5)]
    amr_interval: i64,

    /// Increase logging verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold.dim} {spinner} {wide_msg}")
        .unwrap()
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .init()
        .wrap_err("installing the logger")?;

    let cfg = Config::from_path(&args.config)
        .wrap_err_with(|| format!("reading configuration from {}", args.config.display()))?;

    let factory = AdvectionFactory::default();

    #[cfg(feature = "parallel")]
    rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.mesh.num_threads)
        .build_global()
        .wrap_err("building the worker pool")?;

    if let Some(nranks) = args.layout_test {
        Mesh::from_config(
            &cfg,
            Box::new(LocalComm),
            &factory,
            BuildMode::LayoutOnly { nranks },
        )
        .map_err(|err| eyre!(err))
        .wrap_err("layout test failed")?;
        return Ok(());
    }

    let mut mesh = match &args.restart {
        Some(path) => {
            let mut mesh = load_restart(&cfg, path, Box::new(LocalComm), &factory)
                .map_err(|err| eyre!(err))
                .wrap_err_with(|| format!("restarting from {}", path.display()))?;
            mesh.initialize(ResFlag::Restart, &factory);
            mesh
        }
        None => {
            let mut mesh = Mesh::from_config(&cfg, Box::new(LocalComm), &factory, BuildMode::Full)
                .map_err(|err| eyre!(err))
                .wrap_err("constructing the mesh")?;
            mesh.initialize(ResFlag::Cold, &factory);
            mesh
        }
    };

    println!(
        "{} {} blocks over {} cells, dim {}, dt = {:.3e}",
        style("mesh ready:").bold(),
        mesh.nbtotal,
        mesh.total_cells(),
        mesh.dim(),
        mesh.dt
    );

    let bar = ProgressBar::new_spinner().with_style(progress_style());
    bar.set_prefix("evolving");

    let tlist = TaskList::fluid_step();
    while mesh.time < mesh.tlim && (mesh.nlim < 0 || mesh.ncycle < mesh.nlim) {
        mesh.update_one_step(&tlist);
        mesh.advance_cycle();
        mesh.new_time_step();

        if mesh.adaptive && args.amr_interval > 0 && mesh.ncycle % args.amr_interval == 0 {
            for block in &mut mesh.blocks {
                block.refine_flag = block.physics.propose_refinement();
            }
            mesh.refine_mesh(&factory);
        }

        bar.set_message(format!(
            "cycle {}, t = {:.5}, dt = {:.3e}, {} blocks",
            mesh.ncycle, mesh.time, mesh.dt, mesh.nbtotal
        ));
        bar.tick();
    }
    bar.finish_and_clear();

    mesh.test_conservation();
    println!(
        "{} {} cycles, t = {:.5}",
        style("run complete:").bold().green(),
        mesh.ncycle,
        mesh.time
    );

    if let Some(path) = &args.output {
        save_restart(&mesh, path)
            .map_err(|err| eyre!(err))
            .wrap_err_with(|| format!("writing restart to {}", path.display()))?;
        println!("restart written to {}", path.display());
    }

    Ok(())
}
