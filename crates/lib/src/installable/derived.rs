use super::{DerivedPathWithInfo, ExtraPathInfo, InstallableError};
use crate::derived::{DerivedPath, ExtendedOutputsSpec, SingleDerivedPath};
use crate::store::StoreDir;

/// A store path or derived path given literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallableDerivedPath {
  pub store_dir: StoreDir,
  pub path: DerivedPath,
  pub extended_outputs: ExtendedOutputsSpec,
}

impl InstallableDerivedPath {
  /// Without `^outputs` the text may be any path that leads into the store
  /// through symlinks. With `^outputs` it must be a derived path exactly.
  pub fn parse(
    store_dir: &StoreDir,
    prefix: &str,
    extended_outputs: ExtendedOutputsSpec,
  ) -> Result<Self, InstallableError> {
    let path = match &extended_outputs {
      ExtendedOutputsSpec::Default => DerivedPath::Opaque(store_dir.follow_links_to_store_path(prefix)?),
      ExtendedOutputsSpec::Explicit(outputs) => DerivedPath::Built {
        drv_path: SingleDerivedPath::parse(store_dir, prefix)?,
        outputs: outputs.clone(),
      },
    };
    Ok(Self {
      store_dir: store_dir.clone(),
      path,
      extended_outputs,
    })
  }

  pub fn what(&self) -> String {
    self.path.render(&self.store_dir)
  }

  pub(super) fn to_derived_path(&self) -> DerivedPathWithInfo {
    DerivedPathWithInfo {
      path: self.path.clone(),
      info: ExtraPathInfo {
        extended_outputs: self.extended_outputs.clone(),
        ..ExtraPathInfo::default()
      },
    }
  }
}
