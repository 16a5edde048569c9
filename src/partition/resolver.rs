//! Partition id lookup against the active scheme.

use crate::error::{Error, Result};
use crate::partition::{PartitionExtent, PartitionScheme};

/// Look up the extent of `partition_id` in `scheme`.
///
/// Valid ids are `0..128` under GPT and `0..4` under MBR. A device with
/// no scheme has no valid ids; callers fall back to whole-device
/// addressing on [`Error::PartitionOutOfRange`]. Empty slots resolve to
/// their zero extent.
pub fn resolve(partition_id: u32, scheme: &PartitionScheme) -> Result<PartitionExtent> {
    let out_of_range = || Error::PartitionOutOfRange {
        id: partition_id,
        capacity: scheme.capacity(),
    };
    let table = scheme.table().ok_or_else(out_of_range)?;
    let id = usize::try_from(partition_id).map_err(|_| out_of_range())?;
    if id >= scheme.capacity() {
        return Err(out_of_range());
    }
    table.get(id).map(|e| e.extent()).ok_or_else(out_of_range)
}
