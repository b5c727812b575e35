use log::debug;
use std::{
    fmt, fs,
    io::{BufReader, Write},
    path::Path,
};

use crate::{
    config,
    error::{RegistrationError, Result, Stage},
    point3d::{ColoredPoint3d, Point3d},
    point_cloud::PointCloud,
};

pub fn read_config(path: &Path) -> Result<config::RegistrationConfig> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let config: config::RegistrationConfig = serde_json::from_reader(reader)?;
    config.validate()?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &config::RegistrationConfig) -> Result<()> {
    let j = serde_json::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(j.as_bytes())?;
    Ok(())
}

fn file_error(path: &Path, e: impl fmt::Display) -> RegistrationError {
    RegistrationError::PointCloudFile {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn check_extension(path: &Path, stage: Stage) -> Result<()> {
    let is_pcd = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pcd"));
    if is_pcd {
        Ok(())
    } else {
        Err(RegistrationError::invalid_input(
            stage,
            format!("unsupported point cloud format: {}", path.display()),
        ))
    }
}

/// Reads a PCD file with `x y z` fields and an optional packed `rgb` field.
pub fn load_point_cloud(path: &Path) -> Result<PointCloud> {
    check_extension(path, Stage::Load)?;
    if !path.is_file() {
        return Err(file_error(path, "no such file"));
    }

    let colored: std::result::Result<pcd_rs::Reader<ColoredPoint3d, _>, _> =
        pcd_rs::Reader::open(path);
    let cloud = match colored {
        Ok(reader) => {
            let records: Vec<ColoredPoint3d> = reader
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| file_error(path, e))?;
            let mut cloud =
                PointCloud::from_points(records.iter().map(|p| p.to_na_point3_f64()).collect());
            cloud.set_colors(records.iter().map(|p| p.color()).collect())?;
            cloud
        }
        Err(_) => {
            // no rgb field
            let reader: pcd_rs::Reader<Point3d, _> =
                pcd_rs::Reader::open(path).map_err(|e| file_error(path, e))?;
            let records: Vec<Point3d> = reader
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| file_error(path, e))?;
            PointCloud::from_points(records.iter().map(|p| p.to_na_point3_f64()).collect())
        }
    };
    debug!("loaded {} points from {}", cloud.len(), path.display());
    Ok(cloud)
}

/// Writes a binary PCD file; colors are stored only when the cloud has them.
pub fn save_point_cloud(cloud: &PointCloud, path: &Path) -> Result<()> {
    check_extension(path, Stage::Store)?;
    let init = || pcd_rs::WriterInit {
        width: cloud.len() as u64,
        height: 1,
        viewpoint: Default::default(),
        data_kind: pcd_rs::DataKind::Binary,
        schema: None,
    };

    match cloud.colors() {
        Some(colors) => {
            let mut writer: pcd_rs::Writer<ColoredPoint3d, _> =
                init().create(path).map_err(|e| file_error(path, e))?;
            for (pt, color) in cloud.points().iter().zip(colors) {
                writer
                    .push(&ColoredPoint3d::from_na_point3(pt, color))
                    .map_err(|e| file_error(path, e))?;
            }
            writer.finish().map_err(|e| file_error(path, e))?;
        }
        None => {
            let mut writer: pcd_rs::Writer<Point3d, _> =
                init().create(path).map_err(|e| file_error(path, e))?;
            for pt in cloud.points() {
                writer
                    .push(&Point3d::from_na_point3(pt))
                    .map_err(|e| file_error(path, e))?;
            }
            writer.finish().map_err(|e| file_error(path, e))?;
        }
    }
    debug!("wrote {} points to {}", cloud.len(), path.display());
    Ok(())
}

/// Sink for registered clouds.
pub trait Store {
    fn save(&self, clouds: &[&PointCloud], path: &Path) -> Result<()>;
}

/// Merges the clouds and writes them to one PCD file.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcdStore;

impl Store for PcdStore {
    fn save(&self, clouds: &[&PointCloud], path: &Path) -> Result<()> {
        save_point_cloud(&PointCloud::merge(clouds), path)
    }
}
