// Manifest Rendering
// Copies a deployment template with its placeholder patched

use super::DeployError;

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// A patched copy of the template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedManifest {
    pub path: PathBuf,
    pub replacements: usize,
}

/// Replace every occurrence of `placeholder` with `value`
pub fn render(template: &str, placeholder: &str, value: &str) -> (String, usize) {
    let count = template.matches(placeholder).count();
    (template.replace(placeholder, value), count)
}

/// Render `template` into a new file under `out_dir`. The template itself is
/// never written.
pub async fn render_manifest(
    template: &Path,
    placeholder: &str,
    value: &str,
    out_dir: &Path,
) -> Result<RenderedManifest, DeployError> {
    let source = fs::read_to_string(template)
        .await
        .map_err(|e| DeployError::Template {
            path: template.to_path_buf(),
            source: e,
        })?;

    let (rendered, replacements) = render(&source, placeholder, value);
    if replacements == 0 {
        warn!(
            template = %template.display(),
            placeholder,
            "placeholder not found in manifest template"
        );
    }

    fs::create_dir_all(out_dir).await?;
    let path = out_dir.join(output_name(template, value));
    fs::write(&path, rendered).await?;

    Ok(RenderedManifest { path, replacements })
}

fn output_name(template: &Path, value: &str) -> String {
    let stem = template
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "manifest".to_string());
    let ext = template
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "yaml".to_string());
    let tag: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}.{}.{}", stem, tag, ext)
}
