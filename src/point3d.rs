use nalgebra as na;
use pcd_rs::{PcdDeserialize, PcdSerialize};

/// Plain `x y z` PCD record.
#[derive(PcdDeserialize, PcdSerialize, Debug, Clone, Copy, PartialEq)]
pub struct Point3d {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// `x y z rgb` PCD record, color packed as `0x00RRGGBB` in the float's bits.
#[derive(PcdDeserialize, PcdSerialize, Debug, Clone, Copy, PartialEq)]
pub struct ColoredPoint3d {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub rgb: f32,
}

impl Point3d {
    pub fn from_na_point3(pt: &na::Point3<f64>) -> Point3d {
        Point3d {
            x: pt.x as f32,
            y: pt.y as f32,
            z: pt.z as f32,
        }
    }
    pub fn to_na_point3_f64(&self) -> na::Point3<f64> {
        na::Point3::<f64>::new(self.x as f64, self.y as f64, self.z as f64)
    }
}

impl ColoredPoint3d {
    pub fn from_na_point3(pt: &na::Point3<f64>, color: &[f32; 3]) -> ColoredPoint3d {
        ColoredPoint3d {
            x: pt.x as f32,
            y: pt.y as f32,
            z: pt.z as f32,
            rgb: pack_rgb(color),
        }
    }
    pub fn to_na_point3_f64(&self) -> na::Point3<f64> {
        na::Point3::<f64>::new(self.x as f64, self.y as f64, self.z as f64)
    }
    pub fn color(&self) -> [f32; 3] {
        unpack_rgb(self.rgb)
    }
}

fn to_byte(c: f32) -> u32 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u32
}

pub fn pack_rgb(color: &[f32; 3]) -> f32 {
    let bits = (to_byte(color[0]) << 16) | (to_byte(color[1]) << 8) | to_byte(color[2]);
    f32::from_bits(bits)
}

pub fn unpack_rgb(rgb: f32) -> [f32; 3] {
    let bits = rgb.to_bits();
    [
        ((bits >> 16) & 0xff) as f32 / 255.0,
        ((bits >> 8) & 0xff) as f32 / 255.0,
        (bits & 0xff) as f32 / 255.0,
    ]
}
