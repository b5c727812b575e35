use nalgebra as na;
use std::collections::HashMap;

use crate::point_cloud::PointCloud;

pub type Voxel = na::Vector3<i64>;

pub fn point_to_voxel(point: &na::Point3<f64>, voxel_size: f64) -> Voxel {
    Voxel::new(
        (point.x / voxel_size).floor() as i64,
        (point.y / voxel_size).floor() as i64,
        (point.z / voxel_size).floor() as i64,
    )
}

struct VoxelAccumulator {
    point_sum: na::Vector3<f64>,
    normal_sum: na::Vector3<f64>,
    color_sum: na::Vector3<f64>,
    count: usize,
}
impl VoxelAccumulator {
    fn new() -> VoxelAccumulator {
        VoxelAccumulator {
            point_sum: na::Vector3::zeros(),
            normal_sum: na::Vector3::zeros(),
            color_sum: na::Vector3::zeros(),
            count: 0,
        }
    }
}

/// Replaces the points of every occupied voxel with their centroid.
///
/// Output order follows the first point that fell into each voxel, so the
/// result only depends on the input order and the voxel size.
pub fn voxel_downsample(cloud: &PointCloud, voxel_size: f64) -> PointCloud {
    let normals = cloud.normals();
    let colors = cloud.colors();

    let mut slot_of_voxel: HashMap<Voxel, usize> = HashMap::new();
    let mut slots: Vec<VoxelAccumulator> = Vec::new();

    for (i, pt) in cloud.points().iter().enumerate() {
        let voxel = point_to_voxel(pt, voxel_size);
        let slot = *slot_of_voxel.entry(voxel).or_insert_with(|| {
            slots.push(VoxelAccumulator::new());
            slots.len() - 1
        });
        let acc = &mut slots[slot];
        acc.point_sum += pt.coords;
        acc.count += 1;
        if let Some(normals) = normals {
            acc.normal_sum += normals[i];
        }
        if let Some(colors) = colors {
            let c = colors[i];
            acc.color_sum += na::Vector3::new(c[0] as f64, c[1] as f64, c[2] as f64);
        }
    }

    let points = slots
        .iter()
        .map(|acc| na::Point3::from(acc.point_sum / acc.count as f64))
        .collect();
    let out_normals = if normals.is_some() {
        slots
            .iter()
            .map(|acc| acc.normal_sum.try_normalize(1e-12).unwrap_or_else(na::Vector3::zeros))
            .collect()
    } else {
        Vec::new()
    };
    let out_colors = if colors.is_some() {
        slots
            .iter()
            .map(|acc| {
                let c = acc.color_sum / acc.count as f64;
                [c.x as f32, c.y as f32, c.z as f32]
            })
            .collect()
    } else {
        Vec::new()
    };

    PointCloud::from_parts(points, out_normals, out_colors)
}
