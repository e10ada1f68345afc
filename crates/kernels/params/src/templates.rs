//! Built-in parameter templates.

use serde::Deserialize;
use std::path::Path;

use crate::{AstroParams, CosmoParams, FlagOptions, ParamError, Result, UserParams};

const MANIFEST: &str = include_str!("../templates/manifest.toml");

#[derive(Debug, Deserialize)]
struct Manifest {
    templates: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    file: String,
    aliases: Vec<String>,
}

/// Parameter tables of one template document. Missing tables take defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateDoc {
    pub cosmo_params: CosmoParams,
    pub user_params: UserParams,
    pub astro_params: AstroParams,
    pub flag_options: FlagOptions,
}

fn embedded(file: &str) -> Option<&'static str> {
    match file {
        "default.toml" => Some(include_str!("../templates/default.toml")),
        "ts.toml" => Some(include_str!("../templates/ts.toml")),
        "halos.toml" => Some(include_str!("../templates/halos.toml")),
        _ => None,
    }
}

/// Every alias of every built-in template.
pub fn builtin_aliases() -> Result<Vec<String>> {
    let manifest: Manifest = toml::from_str(MANIFEST)?;
    Ok(manifest
        .templates
        .into_iter()
        .flat_map(|t| t.aliases)
        .collect())
}

/// Resolve `name` as a built-in alias or, failing that, a TOML file path.
pub fn load_template(name: &str) -> Result<TemplateDoc> {
    let manifest: Manifest = toml::from_str(MANIFEST)?;
    let builtin = manifest
        .templates
        .iter()
        .find(|t| t.aliases.iter().any(|a| a.eq_ignore_ascii_case(name)));

    let text = match builtin {
        Some(entry) => embedded(&entry.file)
            .ok_or_else(|| ParamError::Template {
                name: name.to_string(),
                message: format!("manifest names missing file {}", entry.file),
            })?
            .to_string(),
        None => {
            let path = Path::new(name);
            if !path.exists() {
                return Err(ParamError::Template {
                    name: name.to_string(),
                    message: "not a built-in alias or an existing file".to_string(),
                });
            }
            std::fs::read_to_string(path)?
        }
    };
    Ok(toml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_aliases_load() {
        let aliases = builtin_aliases().unwrap();
        assert_eq!(aliases.len(), 6);
        for alias in aliases {
            load_template(&alias).unwrap();
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[cosmo_params]\nbad_param = 1\n").unwrap();
        assert!(load_template(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_file_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.toml");
        std::fs::write(&path, "[user_params]\nHII_DIM = 16\nBOX_LEN = 32.0\n").unwrap();
        let doc = load_template(path.to_str().unwrap()).unwrap();
        assert_eq!(doc.user_params.hii_dim, 16);
        assert_eq!(doc.cosmo_params, CosmoParams::default());
    }
}
