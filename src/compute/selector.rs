// Device selection
//
// Walks every device on every platform in enumeration order and keeps one
// running best candidate. Whether a new device replaces the held one is
// decided by a `SelectionStrategy`; no capabilities are probed.

use super::backend::{vendor, DeviceClass, DeviceEnumerator, DeviceId, DeviceInfo, PlatformId};
use super::error::{reported, ComputeError, ComputeResult};

/// The device/platform pair a context is built on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub platform: PlatformId,
    pub platform_index: usize,
    pub device: DeviceId,
    pub device_index: usize,
    pub class: DeviceClass,
    pub vendor_id: u32,
    pub name: String,
}

impl DeviceDescriptor {
    fn from_info(platform: PlatformId, platform_index: usize, device_index: usize, info: &DeviceInfo) -> Self {
        Self {
            platform,
            platform_index,
            device: info.id,
            device_index,
            class: info.class,
            vendor_id: info.vendor_id,
            name: info.name.clone(),
        }
    }
}

/// Decides whether `candidate` should replace the device currently held.
pub trait SelectionStrategy: Send + Sync {
    fn prefer(&self, held: &DeviceDescriptor, candidate: &DeviceInfo) -> bool;
}

/// Type/vendor heuristic: a GPU beats a CPU, and any GPU beats a GPU from
/// the integrated-graphics vendor.
///
/// Two GPUs from other vendors are never compared; the first one seen stays.
#[derive(Debug, Clone, Copy)]
pub struct VendorHeuristic {
    pub integrated_vendor: u32,
}

impl Default for VendorHeuristic {
    fn default() -> Self {
        Self {
            integrated_vendor: vendor::INTEL,
        }
    }
}

impl SelectionStrategy for VendorHeuristic {
    fn prefer(&self, held: &DeviceDescriptor, candidate: &DeviceInfo) -> bool {
        match (held.class, candidate.class) {
            (DeviceClass::Cpu, DeviceClass::Gpu) => true,
            (DeviceClass::Gpu, DeviceClass::Gpu) => held.vendor_id == self.integrated_vendor,
            _ => false,
        }
    }
}

pub struct DeviceSelector {
    strategy: Box<dyn SelectionStrategy>,
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSelector {
    pub fn new() -> Self {
        Self::with_strategy(VendorHeuristic::default())
    }

    pub fn with_strategy(strategy: impl SelectionStrategy + 'static) -> Self {
        Self {
            strategy: Box::new(strategy),
        }
    }

    /// Pick one device across all platforms.
    ///
    /// A platform whose devices cannot be listed is skipped. Finding nothing
    /// at all is fatal.
    pub fn select<E>(&self, enumerator: &E) -> ComputeResult<DeviceDescriptor>
    where
        E: DeviceEnumerator + ?Sized,
    {
        let platforms = match enumerator.platforms() {
            Ok(platforms) => platforms,
            Err(status) => {
                log::error!("Platform enumeration failed: {}", status);
                Vec::new()
            }
        };

        let mut best: Option<DeviceDescriptor> = None;

        for (platform_index, platform) in platforms.iter().enumerate() {
            let devices = match enumerator.devices(platform.id) {
                Ok(devices) => devices,
                Err(status) => {
                    log::error!(
                        "Device enumeration failed on platform #{} ({}): {}",
                        platform_index,
                        platform.name,
                        status
                    );
                    continue;
                }
            };

            for (device_index, info) in devices.iter().enumerate() {
                log::trace!(
                    "Platform #{} device #{}: {} [{} / {}]",
                    platform_index,
                    device_index,
                    info.name,
                    vendor::name(info.vendor_id),
                    info.class.label()
                );

                let take = match &best {
                    None => true,
                    Some(held) => self.strategy.prefer(held, info),
                };

                if take {
                    best = Some(DeviceDescriptor::from_info(
                        platform.id,
                        platform_index,
                        device_index,
                        info,
                    ));
                }
            }
        }

        match best {
            Some(selected) => {
                log::info!(
                    "Best compute platform: #{}, device: #{} ({})",
                    selected.platform_index,
                    selected.device_index,
                    selected.name
                );
                log::info!(
                    "Vendor: {}, Type: {}",
                    vendor::name(selected.vendor_id),
                    selected.class.label()
                );
                Ok(selected)
            }
            None => Err(reported(ComputeError::DeviceNotFound)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::backend::PlatformInfo;
    use crate::compute::error::Status;

    struct Listing(Vec<Vec<(DeviceClass, u32)>>);

    impl DeviceEnumerator for Listing {
        fn platforms(&self) -> Result<Vec<PlatformInfo>, Status> {
            Ok((0..self.0.len())
                .map(|i| PlatformInfo {
                    id: PlatformId(i as u64 + 1),
                    name: format!("platform {}", i),
                })
                .collect())
        }

        fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceInfo>, Status> {
            let p = platform.0 as usize - 1;
            Ok(self.0[p]
                .iter()
                .enumerate()
                .map(|(d, &(class, vendor_id))| DeviceInfo {
                    id: DeviceId((p * 100 + d) as u64),
                    name: format!("{} {}", vendor::name(vendor_id), class.label()),
                    class,
                    vendor_id,
                })
                .collect())
        }
    }

    #[test]
    fn first_device_is_taken_when_nothing_better() {
        let listing = Listing(vec![vec![(DeviceClass::Accelerator, 0x1234)]]);
        let selected = DeviceSelector::new().select(&listing).unwrap();
        assert_eq!(selected.class, DeviceClass::Accelerator);
        assert_eq!((selected.platform_index, selected.device_index), (0, 0));
    }

    #[test]
    fn integrated_gpu_is_replaced_by_any_later_gpu() {
        let listing = Listing(vec![vec![
            (DeviceClass::Gpu, vendor::INTEL),
            (DeviceClass::Gpu, vendor::INTEL),
        ]]);
        let selected = DeviceSelector::new().select(&listing).unwrap();
        assert_eq!(selected.device_index, 1);
    }

    #[test]
    fn discrete_gpus_are_not_ranked_against_each_other() {
        let listing = Listing(vec![
            vec![(DeviceClass::Gpu, vendor::AMD)],
            vec![(DeviceClass::Gpu, vendor::NVIDIA)],
        ]);
        let selected = DeviceSelector::new().select(&listing).unwrap();
        assert_eq!(selected.vendor_id, vendor::AMD);
    }

    #[test]
    fn held_integrated_gpu_ignores_cpu() {
        let listing = Listing(vec![vec![
            (DeviceClass::Gpu, vendor::INTEL),
            (DeviceClass::Cpu, vendor::AMD),
        ]]);
        let selected = DeviceSelector::new().select(&listing).unwrap();
        assert_eq!(selected.class, DeviceClass::Gpu);
        assert_eq!(selected.vendor_id, vendor::INTEL);
    }

    #[test]
    fn empty_platforms_are_fatal() {
        let listing = Listing(vec![vec![], vec![]]);
        let err = DeviceSelector::new().select(&listing).unwrap_err();
        assert!(matches!(err, ComputeError::DeviceNotFound));
        assert!(err.is_fatal());
    }
}
