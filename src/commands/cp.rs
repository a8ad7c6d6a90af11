use anyhow::{bail, Result};
use clap::Parser;

use crate::container;

/// Copy files/folders between a container and the local filesystem
#[derive(Parser, Debug)]
#[clap(
    override_usage = "ducker cp CONTAINER:SRC_PATH DEST_PATH | ducker cp SRC_PATH CONTAINER:DEST_PATH"
)]
pub struct Cp {
    src: String,
    dst: String,
}

impl Cp {
    pub fn exec(&self) -> Result<()> {
        match (self.src.split_once(':'), self.dst.split_once(':')) {
            (Some((name, path)), None) => {
                container::find(name)?.copy(path, &self.dst, true)
            }
            (None, Some((name, path))) => {
                container::find(name)?.copy(&self.src, path, false)
            }
            _ => bail!(
                "invalid format: one side must be container:path, the other must be a host path"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_container_rejected() {
        let cp = Cp {
            src: "a:/x".to_string(),
            dst: "b:/y".to_string(),
        };
        assert!(cp.exec().is_err());
    }

    #[test]
    fn test_no_container_side_rejected() {
        let cp = Cp {
            src: "/x".to_string(),
            dst: "/y".to_string(),
        };
        assert!(cp.exec().is_err());
    }
}
