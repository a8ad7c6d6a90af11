//! Containers: isolated processes over a union rootfs built from an
//! image's layers plus a writable upper layer.

mod container;
pub mod init;
mod state;

pub use container::{create, run};
pub use state::{Container, RunOptions, Status};

use anyhow::{bail, Context, Result};

use crate::store::{self, ResourceKind};

/// Looks a container up by 12-hex ID or by name. Name lookups re-derive
/// the ID from the name and verify the stored name matches, so a hash
/// collision with an unrelated resource can't produce a false hit.
pub fn find(name_or_id: &str) -> Result<Container> {
    let by_name = !store::is_valid_id(name_or_id);
    let container_id = if by_name {
        store::generate_id(name_or_id)
    } else {
        name_or_id.to_string()
    };

    let container: Container = store::load(ResourceKind::Container, &container_id)
        .with_context(|| format!("container not found: {name_or_id}"))?;
    if by_name && container.name != name_or_id {
        bail!("container not found: {name_or_id}");
    }
    Ok(container)
}

pub fn all() -> Result<Vec<Container>> {
    store::load_all(ResourceKind::Container)
}
