use clap::Parser;
use glob::glob;
use log::{error, info};
use simple_registration::{
    config::RegistrationConfig,
    io::{self, PcdStore},
    visualizer::RerunVisualizer,
    PointSource, RegistrationPipeline,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Registers a model point cloud onto one or more scans; only PCD files (x y z, optional packed rgb) are read and written.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct SimpleRegistrationCli {
    /// model point cloud, PCD only
    #[arg(long)]
    source: Option<PathBuf>,

    /// glob of PCD scans to register against the model, other formats are rejected
    #[arg(long)]
    target: Option<String>,

    /// json config, defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// write each registered pair to this .pcd (suffixed per target when there are several)
    #[arg(long)]
    output: Option<PathBuf>,

    /// stream the result to a rerun viewer
    #[arg(long, default_value_t = false)]
    show: bool,

    /// write the default config to this path and exit
    #[arg(long)]
    write_default_config: Option<PathBuf>,
}

fn output_path(output: &Path, target: &Path, several: bool) -> PathBuf {
    if !several {
        return output.to_path_buf();
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target_stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("{}_{}.pcd", stem, target_stem))
}

fn run(cli: SimpleRegistrationCli) -> simple_registration::Result<()> {
    if let Some(path) = &cli.write_default_config {
        io::write_config(path, &RegistrationConfig::default_values())?;
        info!("wrote default config to {}", path.display());
        return Ok(());
    }
    let (Some(source), Some(target_pattern)) = (cli.source, cli.target) else {
        return Err(simple_registration::RegistrationError::invalid_input(
            simple_registration::Stage::Load,
            "--source and --target are required",
        ));
    };

    let config = match &cli.config {
        Some(path) => io::read_config(path)?,
        None => RegistrationConfig::default_values(),
    };

    let targets: Vec<PathBuf> = glob(&target_pattern)
        .map_err(|e| {
            simple_registration::RegistrationError::invalid_input(
                simple_registration::Stage::Load,
                format!("bad target pattern {}: {}", target_pattern, e),
            )
        })?
        .filter_map(|entry| entry.ok())
        .collect();
    if targets.is_empty() {
        return Err(simple_registration::RegistrationError::invalid_input(
            simple_registration::Stage::Load,
            format!("no file matches {}", target_pattern),
        ));
    }

    let visualizer = if cli.show {
        Some(
            RerunVisualizer::spawn("simple registration")?
                .with_point_radius((config.voxel_size * 0.5) as f32),
        )
    } else {
        None
    };

    for target in &targets {
        info!("registering {} onto {}", source.display(), target.display());
        let mut pipeline = RegistrationPipeline::new(config.clone());
        if let Some(v) = &visualizer {
            pipeline = pipeline.with_visualizer(Box::new(v.clone()));
        }
        if let Some(output) = &cli.output {
            pipeline = pipeline.with_store(
                Box::new(PcdStore),
                output_path(output, target, targets.len() > 1),
            );
        }
        let registration = pipeline.register(
            PointSource::from(source.as_path()),
            PointSource::from(target.as_path()),
        )?;

        let degrees = registration.pose.euler_angles_degrees();
        println!("{}", target.display());
        println!("{}", registration.transform.to_matrix());
        println!(
            "translation [{:.6}, {:.6}, {:.6}] roll/pitch/yaw [{:.3}, {:.3}, {:.3}] deg",
            registration.pose.translation.x,
            registration.pose.translation.y,
            registration.pose.translation.z,
            degrees.x,
            degrees.y,
            degrees.z
        );
        println!(
            "fitness {:.4} rmse {:.6}",
            registration.fine.fitness, registration.fine.inlier_rmse
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = SimpleRegistrationCli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
