//! Geometry template resolution
//!
//! The scheduler may hand out a slot of a geometry instead of a concrete MIG
//! instance, written as `GPU-<uuid>[<group>-<position>]`. Resolving it means
//! making sure the device is partitioned the way `<group>` describes, then
//! looking up the instance at `<position>`.

use std::sync::Arc;

use error_stack::Report;
use tokio::sync::Mutex;

use crate::config::AllowedMigGeometries;
use crate::config::Geometry;
use crate::core::ErrorKind;
use crate::platform::mig_parted::DeviceSelector;
use crate::platform::mig_parted::MigConfigEntry;
use crate::platform::mig_parted::MigPartedSpec;
use crate::platform::mig_parted::MigPartitioner;
use crate::platform::mig_parted::CURRENT_CONFIG;
use crate::platform::nvml::GpuInventory;
use crate::platform::nvml::InventoryError;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum MigError {
    #[display("invalid geometry reference `{uuid}`: {reason}")]
    InvalidReference { uuid: String, reason: &'static str },
    #[display("device {uuid} not found")]
    UnknownDevice { uuid: String },
    #[display("no geometries configured for model `{model}`")]
    UnknownModel { model: String },
    #[display("geometry group `{group}` not configured for model `{model}`")]
    UnknownGroup { group: String, model: String },
    #[display("position {position} out of range, geometry `{group}` has {available} instances")]
    PositionOutOfRange {
        group: String,
        position: u32,
        available: u32,
    },
    #[display("no partition entry for device index {index}")]
    NoPartition { index: u32 },
    #[display("no MIG instance at position {position} on device {uuid}")]
    InstanceMissing { uuid: String, position: u32 },
    #[display("failed to query the GPU inventory")]
    Inventory,
    #[display("failed to apply MIG partition")]
    Apply,
}

impl core::error::Error for MigError {}

impl MigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidReference { .. }
            | Self::UnknownModel { .. }
            | Self::UnknownGroup { .. }
            | Self::PositionOutOfRange { .. } => ErrorKind::Mismatch,
            Self::UnknownDevice { .. }
            | Self::NoPartition { .. }
            | Self::InstanceMissing { .. } => ErrorKind::NotFound,
            Self::Apply => ErrorKind::Transient,
            Self::Inventory => ErrorKind::Fatal,
        }
    }
}

/// Parsed `GPU-<uuid>[<group>-<position>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryRef {
    pub device_uuid: String,
    pub group: String,
    pub position: u32,
}

impl GeometryRef {
    pub fn is_encoded(uuid: &str) -> bool {
        uuid.contains('[')
    }

    /// The group is everything before the last `-` inside the brackets.
    pub fn parse(uuid: &str) -> Result<Self, Report<MigError>> {
        let invalid = |reason| {
            Report::new(MigError::InvalidReference {
                uuid: uuid.to_string(),
                reason,
            })
        };
        let (device_uuid, rest) = uuid.split_once('[').ok_or_else(|| invalid("missing '['"))?;
        let inner = rest
            .strip_suffix(']')
            .ok_or_else(|| invalid("missing trailing ']'"))?;
        let (group, position) = inner
            .rsplit_once('-')
            .ok_or_else(|| invalid("missing '-' between group and position"))?;
        let group = group.trim();
        if device_uuid.is_empty() {
            return Err(invalid("missing device uuid"));
        }
        if group.is_empty() {
            return Err(invalid("missing template group name"));
        }
        let position = position
            .trim()
            .parse()
            .map_err(|_| invalid("position is not a number"))?;
        Ok(Self {
            device_uuid: device_uuid.to_string(),
            group: group.to_string(),
            position,
        })
    }
}

fn find_geometry<'a>(
    geometries: &'a [AllowedMigGeometries],
    model: &str,
    group: &str,
) -> Result<&'a Geometry, Report<MigError>> {
    let allowed = geometries
        .iter()
        .find(|allowed| allowed.models.iter().any(|m| model.contains(m.as_str())))
        .ok_or_else(|| {
            Report::new(MigError::UnknownModel {
                model: model.to_string(),
            })
        })?;
    allowed
        .geometries
        .iter()
        .find(|geometry| geometry.group == group)
        .ok_or_else(|| {
            Report::new(MigError::UnknownGroup {
                group: group.to_string(),
                model: model.to_string(),
            })
        })
}

fn matches_geometry(entry: &MigConfigEntry, geometry: &Geometry) -> bool {
    geometry
        .instances
        .iter()
        .all(|template| entry.mig_devices.get(&template.name) == Some(&template.count))
}

/// Rewrites the entry covering `index` so it carries `geometry`. An entry
/// shared with other devices is split first so their partition is kept.
fn rewrite_partition(
    entries: &mut Vec<MigConfigEntry>,
    position: usize,
    index: u32,
    geometry: &Geometry,
) {
    let mig_devices = geometry
        .instances
        .iter()
        .map(|template| (template.name.clone(), template.count))
        .collect();
    let target = MigConfigEntry {
        devices: DeviceSelector::Indices(vec![index]),
        mig_enabled: true,
        mig_devices,
    };

    match &mut entries[position].devices {
        DeviceSelector::Indices(indices) if indices.len() > 1 => {
            indices.retain(|&i| i != index);
            entries.push(target);
        }
        _ => entries[position] = target,
    }
}

/// Resolves geometry references against the node's partition.
pub struct MigResolver {
    geometries: Vec<AllowedMigGeometries>,
    inventory: Arc<dyn GpuInventory>,
    partitioner: Arc<dyn MigPartitioner>,
    current: Mutex<Option<MigPartedSpec>>,
}

impl MigResolver {
    pub fn new(
        geometries: Vec<AllowedMigGeometries>,
        inventory: Arc<dyn GpuInventory>,
        partitioner: Arc<dyn MigPartitioner>,
    ) -> Self {
        Self {
            geometries,
            inventory,
            partitioner,
            current: Mutex::new(None),
        }
    }

    fn inventory_error(err: Report<InventoryError>) -> Report<MigError> {
        match err.current_context().clone() {
            InventoryError::DeviceNotFound { uuid } => {
                err.change_context(MigError::UnknownDevice { uuid })
            }
            _ => err.change_context(MigError::Inventory),
        }
    }

    /// Turns a device ID from an allocation entry into the ID handed to the
    /// container. Plain IDs are returned as they are.
    pub async fn resolve(&self, uuid: &str) -> Result<String, Report<MigError>> {
        if !GeometryRef::is_encoded(uuid) {
            return Ok(uuid.to_string());
        }
        let reference = GeometryRef::parse(uuid)?;
        let device = self
            .inventory
            .device_by_uuid(&reference.device_uuid)
            .await
            .map_err(Self::inventory_error)?;

        let geometry = find_geometry(&self.geometries, &device.model, &reference.group)?;
        let available: i64 = geometry
            .instances
            .iter()
            .map(|t| i64::from(t.count.max(0)))
            .sum();
        if i64::from(reference.position) >= available {
            return Err(Report::new(MigError::PositionOutOfRange {
                group: reference.group.clone(),
                position: reference.position,
                available: u32::try_from(available).unwrap_or(u32::MAX),
            }));
        }

        self.ensure_partition(device.index, geometry).await?;

        self.inventory
            .mig_uuid_at(device.index, reference.position)
            .await
            .map_err(Self::inventory_error)?
            .ok_or_else(|| {
                Report::new(MigError::InstanceMissing {
                    uuid: reference.device_uuid.clone(),
                    position: reference.position,
                })
            })
    }

    async fn ensure_partition(
        &self,
        index: u32,
        geometry: &Geometry,
    ) -> Result<(), Report<MigError>> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            let mut spec = self
                .partitioner
                .export()
                .await
                .map_err(|err| err.change_context(MigError::NoPartition { index }))?;
            let device_count = self
                .inventory
                .devices()
                .await
                .map_err(Self::inventory_error)?
                .len() as u32;
            spec.expand_all(device_count);
            *current = Some(spec);
        }
        let Some(spec) = current.as_mut() else {
            return Err(Report::new(MigError::NoPartition { index }));
        };

        let entries = spec
            .mig_configs
            .get_mut(CURRENT_CONFIG)
            .ok_or_else(|| Report::new(MigError::NoPartition { index }))?;
        let position = entries
            .iter()
            .position(|entry| entry.devices.contains(index))
            .ok_or_else(|| Report::new(MigError::NoPartition { index }))?;

        if matches_geometry(&entries[position], geometry) {
            return Ok(());
        }

        tracing::info!(index, group = %geometry.group, "Repartitioning device for geometry");
        let previous = spec.clone();
        if let Some(entries) = spec.mig_configs.get_mut(CURRENT_CONFIG) {
            rewrite_partition(entries, position, index, geometry);
        }
        if let Err(err) = self.partitioner.apply(spec).await {
            *spec = previous;
            return Err(err.change_context(MigError::Apply));
        }
        Ok(())
    }
}
