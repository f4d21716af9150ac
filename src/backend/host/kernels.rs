// Native implementations of the entry points in kernels/particles.cl
//
// Each kernel receives its argument slots in declaration order. Work items
// past the end of the particle buffers are ignored, so the global size may
// be rounded up to a multiple of the work-group size.

use crate::compute::error::Status;
use crate::simulation::layout::{BoundsUniform, FrameUniform};
use glam::{Vec3, Vec4};
use rayon::prelude::*;

pub const GRAVITY: f32 = 0.98;
pub const RESTITUTION: f32 = 0.6;
pub const PULSE_STRENGTH: f32 = 2.0;
pub const MAX_TIME_STEP: f32 = 1.0 / 30.0;

/// N-dimensional dispatch shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: [usize; 3],
    pub local: [usize; 3],
}

impl NdRange {
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }
}

/// One bound argument slot as seen by a native kernel.
pub enum HostArg<'a> {
    Global(&'a mut [u8]),
    Local(&'a mut [u8]),
}

impl HostArg<'_> {
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            HostArg::Global(bytes) | HostArg::Local(bytes) => bytes,
        }
    }

    pub fn as_pod_mut<T: bytemuck::Pod>(&mut self) -> Result<&mut [T], Status> {
        bytemuck::try_cast_slice_mut(self.bytes_mut()).map_err(|_| Status::InvalidArgSize)
    }

    pub fn first_pod<T: bytemuck::Pod>(&mut self) -> Result<T, Status> {
        self.as_pod_mut::<T>()?
            .first()
            .copied()
            .ok_or(Status::InvalidArgSize)
    }
}

pub type NativeKernel = fn(&NdRange, &mut [HostArg<'_>]) -> Result<(), Status>;

/// Kernels every host backend starts with.
pub fn builtin() -> Vec<(&'static str, NativeKernel)> {
    vec![
        ("ParticleSimulation", particle_simulation as NativeKernel),
        ("ApplyPulse", apply_pulse),
        ("ArrayMultiply", array_multiply),
    ]
}

fn particle_simulation(range: &NdRange, args: &mut [HostArg<'_>]) -> Result<(), Status> {
    let [positions, velocities, colors, bounds, spheres, time] = args else {
        return Err(Status::InvalidKernelArgs);
    };

    let bounds: BoundsUniform = bounds.first_pod()?;
    let frame: FrameUniform = time.first_pod()?;
    let spheres: Vec<[f32; 4]> = spheres.as_pod_mut::<[f32; 4]>()?.to_vec();

    let positions = positions.as_pod_mut::<[f32; 4]>()?;
    let velocities = velocities.as_pod_mut::<[f32; 4]>()?;
    let colors = colors.as_pod_mut::<[f32; 4]>()?;

    let count = range
        .work_items()
        .min(frame.particle_count as usize)
        .min(positions.len())
        .min(velocities.len())
        .min(colors.len());

    let dt = frame.delta.clamp(0.0, MAX_TIME_STEP);
    let min = Vec4::from_array(bounds.min).truncate();
    let max = Vec4::from_array(bounds.max).truncate();
    let pong = Vec4::from_array(frame.pong_color);

    positions[..count]
        .par_iter_mut()
        .zip(velocities[..count].par_iter_mut())
        .zip(colors[..count].par_iter_mut())
        .for_each(|((p, v), c)| {
            let mut pos = Vec4::from_array(*p).truncate();
            let mut vel = Vec4::from_array(*v).truncate();

            vel.y -= GRAVITY * dt;
            pos += vel * dt;

            for sphere in spheres.iter().take(frame.sphere_count as usize) {
                let center = Vec3::new(sphere[0], sphere[1], sphere[2]);
                let radius = sphere[3];
                let offset = pos - center;
                let distance = offset.length();
                if distance < radius {
                    let normal = if distance > f32::EPSILON {
                        offset / distance
                    } else {
                        Vec3::Y
                    };
                    pos = center + normal * radius;
                    let along = vel.dot(normal);
                    if along < 0.0 {
                        vel -= (1.0 + RESTITUTION) * along * normal;
                    }
                }
            }

            for axis in 0..3 {
                if pos[axis] < min[axis] {
                    pos[axis] = min[axis];
                    if vel[axis] < 0.0 {
                        vel[axis] = -vel[axis] * RESTITUTION;
                    }
                } else if pos[axis] > max[axis] {
                    pos[axis] = max[axis];
                    if vel[axis] > 0.0 {
                        vel[axis] = -vel[axis] * RESTITUTION;
                    }
                }
            }

            let blend = (vel.length() * frame.delta).clamp(0.0, 1.0);
            let color = Vec4::from_array(*c).lerp(pong, blend);

            *p = pos.extend(1.0).to_array();
            *v = vel.extend(0.0).to_array();
            *c = color.to_array();
        });

    Ok(())
}

fn apply_pulse(range: &NdRange, args: &mut [HostArg<'_>]) -> Result<(), Status> {
    let [positions, velocities, bounds, time] = args else {
        return Err(Status::InvalidKernelArgs);
    };

    let bounds: BoundsUniform = bounds.first_pod()?;
    let frame: FrameUniform = time.first_pod()?;
    let center = Vec4::from_array(bounds.center).truncate();

    let positions = positions.as_pod_mut::<[f32; 4]>()?;
    let velocities = velocities.as_pod_mut::<[f32; 4]>()?;
    let count = range
        .work_items()
        .min(frame.particle_count as usize)
        .min(positions.len())
        .min(velocities.len());

    positions[..count]
        .par_iter()
        .zip(velocities[..count].par_iter_mut())
        .for_each(|(p, v)| {
            let away = (Vec4::from_array(*p).truncate() - center).normalize_or_zero();
            let vel = Vec4::from_array(*v).truncate() + away * PULSE_STRENGTH;
            *v = vel.extend(0.0).to_array();
        });

    Ok(())
}

fn array_multiply(range: &NdRange, args: &mut [HostArg<'_>]) -> Result<(), Status> {
    let [a, b, c] = args else {
        return Err(Status::InvalidKernelArgs);
    };

    let a = a.as_pod_mut::<f32>()?;
    let b = b.as_pod_mut::<f32>()?;
    let c = c.as_pod_mut::<f32>()?;
    let count = range.work_items().min(a.len()).min(b.len()).min(c.len());

    for i in 0..count {
        c[i] = a[i] * b[i];
    }
    Ok(())
}
