// Simulation world: axis-aligned bounds plus sphere obstacles

use super::layout::{BoundsUniform, Sphere};
use glam::Vec3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationBounds {
    center: Vec3,
    size: Vec3,
}

impl Default for SimulationBounds {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::ONE)
    }
}

impl SimulationBounds {
    /// A zero-length size falls back to the unit cube.
    pub fn new(center: Vec3, size: Vec3) -> Self {
        Self {
            center,
            size: Self::sanitize(size),
        }
    }

    fn sanitize(size: Vec3) -> Vec3 {
        if size.length_squared() <= 0.0 || !size.is_finite() {
            log::warn!("Degenerate bounds size {:?}, using unit size", size);
            Vec3::ONE
        } else {
            size.abs()
        }
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn size(&self) -> Vec3 {
        self.size
    }

    pub fn min_extents(&self) -> Vec3 {
        self.center - self.size * 0.5
    }

    pub fn max_extents(&self) -> Vec3 {
        self.center + self.size * 0.5
    }

    pub fn move_to(&mut self, center: Vec3) {
        self.center = center;
    }

    pub fn resize(&mut self, size: Vec3) {
        self.size = Self::sanitize(size);
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min_extents()).all() && point.cmple(self.max_extents()).all()
    }

    /// Radius of the largest sphere centered in the box.
    pub fn inscribed_radius(&self) -> f32 {
        self.size.min_element() * 0.5
    }

    pub fn to_uniform(&self) -> BoundsUniform {
        BoundsUniform {
            center: self.center.extend(1.0).to_array(),
            min: self.min_extents().extend(1.0).to_array(),
            max: self.max_extents().extend(1.0).to_array(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulationWorld {
    bounds: SimulationBounds,
    spheres: Vec<Sphere>,
}

impl SimulationWorld {
    pub fn new(bounds: SimulationBounds) -> Self {
        Self {
            bounds,
            spheres: Vec::new(),
        }
    }

    /// One large sphere at the center ringed by eight small ones.
    pub fn default_scene(bounds: SimulationBounds) -> Self {
        let mut world = Self::new(bounds);
        let c = bounds.center();
        world.add_sphere(c, 0.5);

        let (r, d) = (0.30, 0.22);
        for offset in [
            Vec3::new(r, 0.0, 0.0),
            Vec3::new(-r, 0.0, 0.0),
            Vec3::new(0.0, 0.0, r),
            Vec3::new(0.0, 0.0, -r),
            Vec3::new(d, 0.0, d),
            Vec3::new(-d, 0.0, d),
            Vec3::new(d, 0.0, -d),
            Vec3::new(-d, 0.0, -d),
        ] {
            world.add_sphere(c + offset, 0.1);
        }
        world
    }

    /// `radius` is the display diameter; collisions use half of it.
    pub fn add_sphere(&mut self, center: Vec3, radius: f32) {
        self.spheres.push(center.extend(radius * 0.5).to_array());
    }

    pub fn bounds(&self) -> &SimulationBounds {
        &self.bounds
    }

    pub fn bounds_mut(&mut self) -> &mut SimulationBounds {
        &mut self.bounds
    }

    pub fn spheres(&self) -> &[Sphere] {
        &self.spheres
    }

    /// Sphere data as uploaded. An empty world uploads one zero-radius
    /// sphere since device buffers cannot be empty.
    pub fn sphere_data(&self) -> Vec<Sphere> {
        if self.spheres.is_empty() {
            vec![[0.0; 4]]
        } else {
            self.spheres.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_falls_back_to_unit_cube() {
        let bounds = SimulationBounds::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO);
        assert_eq!(bounds.size(), Vec3::ONE);
        assert_eq!(bounds.min_extents(), Vec3::new(0.5, 1.5, 2.5));
    }

    #[test]
    fn move_and_resize_keep_extents_consistent() {
        let mut bounds = SimulationBounds::default();
        bounds.move_to(Vec3::new(2.0, 0.0, 0.0));
        bounds.resize(Vec3::new(4.0, 2.0, 2.0));
        assert_eq!(bounds.min_extents(), Vec3::new(0.0, -1.0, -1.0));
        assert_eq!(bounds.max_extents(), Vec3::new(4.0, 1.0, 1.0));
        assert_eq!(bounds.inscribed_radius(), 1.0);
        assert!(bounds.contains(Vec3::new(3.9, 0.9, -0.9)));
        assert!(!bounds.contains(Vec3::new(4.1, 0.0, 0.0)));
    }

    #[test]
    fn default_scene_halves_radii() {
        let world = SimulationWorld::default_scene(SimulationBounds::default());
        assert_eq!(world.spheres().len(), 9);
        assert_eq!(world.spheres()[0], [0.0, 0.0, 0.0, 0.25]);
        assert!(world.spheres()[1..].iter().all(|s| s[3] == 0.05));
    }

    #[test]
    fn empty_world_uploads_placeholder() {
        let world = SimulationWorld::default();
        assert_eq!(world.sphere_data(), vec![[0.0; 4]]);
    }
}
