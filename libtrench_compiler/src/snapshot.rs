use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use super::error::SnapshotError;

/// Write an intermediate result as yaml so a later run can skip recomputing it
pub fn save_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let yaml_str = serde_yaml::to_string(value)?;
    let mut file = File::create(path)?;
    file.write_all(yaml_str.as_bytes())?;
    spdlog::info!(
        "Saved snapshot {} ({})",
        path.display(),
        human_bytes::human_bytes(yaml_str.len() as f64)
    );
    Ok(())
}

pub fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<T, SnapshotError> {
    if !path.exists() {
        return Err(SnapshotError::BadFilePath(path.to_path_buf()));
    }
    let yaml_str = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str::<T>(&yaml_str)?)
}
