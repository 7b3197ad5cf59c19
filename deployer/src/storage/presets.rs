//! Preset files

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::models::preset::{validate_name, Preset};

const PRESET_EXTENSION: &str = "json";

/// Load and validate one preset by name
pub async fn load_preset(presets_dir: &Dir, name: &str) -> Result<Preset, DeployError> {
    validate_name(name)?;

    let file = presets_dir.file(&format!("{}.{}", name, PRESET_EXTENSION));
    let mut preset: Preset = file.read_json_opt().await?.ok_or_else(|| {
        DeployError::NotFound(format!(
            "Preset '{}' not found in {:?}",
            name,
            presets_dir.path()
        ))
    })?;

    if preset.name.is_empty() {
        preset.name = name.to_string();
    } else if preset.name != name {
        return Err(DeployError::ValidationError(format!(
            "Preset file '{}.{}' declares name '{}'",
            name, PRESET_EXTENSION, preset.name
        )));
    }

    preset.validate()?;
    Ok(preset)
}

/// Names of the available presets, sorted
pub async fn list_presets(presets_dir: &Dir) -> Result<Vec<String>, DeployError> {
    presets_dir.list_stems(PRESET_EXTENSION).await
}
